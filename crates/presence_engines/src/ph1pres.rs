#![forbid(unsafe_code)]

use presence_kernel_contracts::ph1occ::{ContextKind, ContextRecord};
use presence_kernel_contracts::ph1pres::{PresenceSessionId, PresenceSessionRecord};

/// Which branch of the toggle state machine a scan takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleDecision {
    CheckIn,
    CheckOut(PresenceSessionId),
}

/// `NoSession -> Active` on check-in, `Active -> Closed` on check-out.
pub fn decide_toggle(active: Option<&PresenceSessionRecord>) -> ToggleDecision {
    match active {
        Some(s) if s.is_active() => ToggleDecision::CheckOut(s.session_id),
        _ => ToggleDecision::CheckIn,
    }
}

/// Per-kind behaviour of a timed presence session. Both kinds share the toggle and
/// accumulate path; only the accumulation target differs.
pub trait TimedPresencePolicy: Send + Sync {
    fn usage_label(&self) -> &'static str;
    fn threshold_minutes(&self, context: &ContextRecord) -> Option<u32>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FacilityUsagePolicy;

impl TimedPresencePolicy for FacilityUsagePolicy {
    fn usage_label(&self) -> &'static str {
        "facility_usage"
    }

    fn threshold_minutes(&self, _context: &ContextRecord) -> Option<u32> {
        None
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EventAttendancePolicy;

impl TimedPresencePolicy for EventAttendancePolicy {
    fn usage_label(&self) -> &'static str {
        "event_attendance"
    }

    fn threshold_minutes(&self, context: &ContextRecord) -> Option<u32> {
        context.eligibility_threshold_minutes
    }
}

static FACILITY_POLICY: FacilityUsagePolicy = FacilityUsagePolicy;
static EVENT_POLICY: EventAttendancePolicy = EventAttendancePolicy;

pub fn policy_for(kind: ContextKind) -> &'static dyn TimedPresencePolicy {
    match kind {
        ContextKind::Facility => &FACILITY_POLICY,
        ContextKind::Event => &EVENT_POLICY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_kernel_contracts::ph1id::SubjectId;
    use presence_kernel_contracts::ph1occ::ContextId;
    use presence_kernel_contracts::ph1pres::SessionCloseReason;
    use presence_kernel_contracts::MonotonicTimeNs;

    fn session() -> PresenceSessionRecord {
        PresenceSessionRecord::open_v1(
            PresenceSessionId(5),
            SubjectId::new("m1").unwrap(),
            ContextId::new("c1").unwrap(),
            ContextKind::Event,
            MonotonicTimeNs(1),
        )
        .unwrap()
    }

    #[test]
    fn at_pres_engine_01_toggle_branches() {
        assert_eq!(decide_toggle(None), ToggleDecision::CheckIn);
        let s = session();
        assert_eq!(
            decide_toggle(Some(&s)),
            ToggleDecision::CheckOut(PresenceSessionId(5))
        );
        let closed = s
            .closed(MonotonicTimeNs(2), SessionCloseReason::CheckOut)
            .unwrap();
        assert_eq!(decide_toggle(Some(&closed)), ToggleDecision::CheckIn);
    }

    #[test]
    fn at_pres_engine_02_facility_ignores_threshold() {
        let ctx = ContextRecord::v1(
            ContextId::new("c1").unwrap(),
            ContextKind::Event,
            "Talk",
            50,
            true,
            Some(60),
        )
        .unwrap();
        assert_eq!(policy_for(ContextKind::Facility).threshold_minutes(&ctx), None);
        assert_eq!(policy_for(ContextKind::Event).threshold_minutes(&ctx), Some(60));
        assert_eq!(policy_for(ContextKind::Event).usage_label(), "event_attendance");
    }
}
