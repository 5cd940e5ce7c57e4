#![forbid(unsafe_code)]

use presence_kernel_contracts::ph1occ::{
    AdmissionDecision, AdmissionDenyReason, ContextRecord, OccupancyAggregateRecord,
};

/// PH1.OCC capacity admission gate.
///
/// Pure: the caller must pass the same committed snapshot it is about to mutate.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdmissionGate;

impl AdmissionGate {
    pub fn admit(
        &self,
        context: &ContextRecord,
        aggregate: &OccupancyAggregateRecord,
    ) -> AdmissionDecision {
        if !context.active {
            return AdmissionDecision::Denied(AdmissionDenyReason::ContextInactive);
        }
        if aggregate.current_count >= context.capacity {
            return AdmissionDecision::Denied(AdmissionDenyReason::CapacityExceeded);
        }
        AdmissionDecision::Approved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_kernel_contracts::ph1occ::{ContextId, ContextKind};
    use presence_kernel_contracts::ph1pres::PresenceSessionId;
    use presence_kernel_contracts::MonotonicTimeNs;

    fn ctx_id() -> ContextId {
        ContextId::new("lab_1").unwrap()
    }

    fn context(capacity: u32, active: bool) -> ContextRecord {
        ContextRecord::v1(ctx_id(), ContextKind::Facility, "Lab", capacity, active, None).unwrap()
    }

    fn aggregate_with(count: u32) -> OccupancyAggregateRecord {
        let mut row = OccupancyAggregateRecord::empty_v1(ctx_id(), 2, MonotonicTimeNs(1));
        for i in 0..count {
            row.active_session_refs
                .insert(PresenceSessionId(u64::from(i) + 1));
        }
        row.current_count = count;
        row
    }

    #[test]
    fn at_occ_01_gate_approves_below_capacity() {
        let gate = AdmissionGate;
        assert_eq!(
            gate.admit(&context(2, true), &aggregate_with(1)),
            AdmissionDecision::Approved
        );
    }

    #[test]
    fn at_occ_02_gate_denies_at_capacity() {
        let gate = AdmissionGate;
        assert_eq!(
            gate.admit(&context(2, true), &aggregate_with(2)),
            AdmissionDecision::Denied(AdmissionDenyReason::CapacityExceeded)
        );
    }

    #[test]
    fn at_occ_03_inactive_takes_precedence_over_capacity() {
        let gate = AdmissionGate;
        assert_eq!(
            gate.admit(&context(2, false), &aggregate_with(2)),
            AdmissionDecision::Denied(AdmissionDenyReason::ContextInactive)
        );
    }

    #[test]
    fn at_occ_04_zero_capacity_never_admits() {
        let gate = AdmissionGate;
        assert_eq!(
            gate.admit(&context(0, true), &aggregate_with(0)),
            AdmissionDecision::Denied(AdmissionDenyReason::CapacityExceeded)
        );
    }
}
