#![forbid(unsafe_code)]

use presence_kernel_contracts::ph1att::AttendanceAccumulatorRecord;
use presence_kernel_contracts::MonotonicTimeNs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccumulateOutcome {
    pub record: AttendanceAccumulatorRecord,
    pub became_eligible: bool,
}

/// PH1.ATT eligibility evaluator. Read-only: it never writes the latch itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct EligibilityEvaluator;

impl EligibilityEvaluator {
    pub fn evaluate(&self, accumulator: &AttendanceAccumulatorRecord) -> bool {
        if accumulator.is_eligible {
            return true;
        }
        match accumulator.threshold_minutes {
            Some(threshold) => accumulator.total_duration_minutes >= u64::from(threshold),
            None => false,
        }
    }
}

/// PH1.ATT duration accumulator.
#[derive(Debug, Default, Clone, Copy)]
pub struct DurationAccumulator {
    evaluator: EligibilityEvaluator,
}

impl DurationAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one closed session's stored duration and re-evaluates eligibility.
    ///
    /// `threshold_minutes` is the context's current threshold; the latch is never cleared
    /// even if that threshold has since been raised.
    pub fn accumulate(
        &self,
        current: &AttendanceAccumulatorRecord,
        duration_minutes: u32,
        threshold_minutes: Option<u32>,
        now: MonotonicTimeNs,
    ) -> AccumulateOutcome {
        let mut record = current.clone();
        record.total_duration_minutes = record
            .total_duration_minutes
            .saturating_add(u64::from(duration_minutes));
        record.closed_session_count = record.closed_session_count.saturating_add(1);
        record.threshold_minutes = threshold_minutes;
        record.last_updated = now;

        let was_eligible = record.is_eligible;
        record.is_eligible = self.evaluator.evaluate(&record);
        let became_eligible = record.is_eligible && !was_eligible;
        if became_eligible {
            record.eligible_since = Some(now);
        }
        AccumulateOutcome {
            record,
            became_eligible,
        }
    }
}
