#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::ph1id::SubjectId;
use crate::ph1occ::ContextId;
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const PH1ATT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Running attendance total for one (subject, context) pair.
///
/// `total_duration_minutes` only grows. `is_eligible` is a latch: once set it stays set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceAccumulatorRecord {
    pub schema_version: SchemaVersion,
    pub subject_id: SubjectId,
    pub context_id: ContextId,
    pub total_duration_minutes: u64,
    pub threshold_minutes: Option<u32>,
    pub is_eligible: bool,
    pub closed_session_count: u32,
    pub eligible_since: Option<MonotonicTimeNs>,
    pub last_updated: MonotonicTimeNs,
}

impl AttendanceAccumulatorRecord {
    pub fn empty_v1(
        subject_id: SubjectId,
        context_id: ContextId,
        threshold_minutes: Option<u32>,
        now: MonotonicTimeNs,
    ) -> Self {
        Self {
            schema_version: PH1ATT_CONTRACT_VERSION,
            subject_id,
            context_id,
            total_duration_minutes: 0,
            threshold_minutes,
            is_eligible: false,
            closed_session_count: 0,
            eligible_since: None,
            last_updated: now,
        }
    }
}

impl Validate for AttendanceAccumulatorRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.subject_id.validate()?;
        self.context_id.validate()?;
        if self.is_eligible != self.eligible_since.is_some() {
            return Err(ContractViolation::InvalidValue {
                field: "attendance_accumulator.eligible_since",
                reason: "must be set iff is_eligible",
            });
        }
        if self.threshold_minutes == Some(0) {
            return Err(ContractViolation::InvalidValue {
                field: "attendance_accumulator.threshold_minutes",
                reason: "must be > 0 when provided",
            });
        }
        Ok(())
    }
}
