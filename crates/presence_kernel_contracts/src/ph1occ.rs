#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::common::{validate_id, validate_text};
use crate::ph1pres::PresenceSessionId;
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const PH1OCC_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const MAX_CONTEXT_CAPACITY: u32 = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContextId(String);

impl ContextId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(id.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for ContextId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("context_id", &self.0, 64)
    }
}

impl TryFrom<String> for ContextId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContextId> for String {
    fn from(v: ContextId) -> Self {
        v.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextKind {
    Facility,
    Event,
}

impl ContextKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextKind::Facility => "FACILITY",
            ContextKind::Event => "EVENT",
        }
    }
}

/// Admin-managed context definition. Read-only input to the admission gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub schema_version: SchemaVersion,
    pub context_id: ContextId,
    pub kind: ContextKind,
    pub display_name: String,
    pub capacity: u32,
    pub active: bool,
    pub eligibility_threshold_minutes: Option<u32>,
}

impl ContextRecord {
    pub fn v1(
        context_id: ContextId,
        kind: ContextKind,
        display_name: impl Into<String>,
        capacity: u32,
        active: bool,
        eligibility_threshold_minutes: Option<u32>,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: PH1OCC_CONTRACT_VERSION,
            context_id,
            kind,
            display_name: display_name.into(),
            capacity,
            active,
            eligibility_threshold_minutes,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for ContextRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.context_id.validate()?;
        validate_text("context_record.display_name", &self.display_name, 128)?;
        if self.capacity > MAX_CONTEXT_CAPACITY {
            return Err(ContractViolation::InvalidRange {
                field: "context_record.capacity",
                min: 0.0,
                max: MAX_CONTEXT_CAPACITY as f64,
                got: self.capacity as f64,
            });
        }
        if self.eligibility_threshold_minutes == Some(0) {
            return Err(ContractViolation::InvalidValue {
                field: "context_record.eligibility_threshold_minutes",
                reason: "must be > 0 when provided",
            });
        }
        Ok(())
    }
}

/// Live occupancy row, one per context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyAggregateRecord {
    pub schema_version: SchemaVersion,
    pub context_id: ContextId,
    pub capacity: u32,
    pub current_count: u32,
    pub active_session_refs: BTreeSet<PresenceSessionId>,
    pub last_updated: MonotonicTimeNs,
}

impl OccupancyAggregateRecord {
    pub fn empty_v1(context_id: ContextId, capacity: u32, now: MonotonicTimeNs) -> Self {
        Self {
            schema_version: PH1OCC_CONTRACT_VERSION,
            context_id,
            capacity,
            current_count: 0,
            active_session_refs: BTreeSet::new(),
            last_updated: now,
        }
    }

    pub fn is_self_consistent(&self) -> bool {
        self.current_count as usize == self.active_session_refs.len()
    }
}

impl Validate for OccupancyAggregateRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.context_id.validate()?;
        if !self.is_self_consistent() {
            return Err(ContractViolation::InvalidValue {
                field: "occupancy_aggregate.current_count",
                reason: "must equal |active_session_refs|",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionDenyReason {
    ContextInactive,
    CapacityExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Approved,
    Denied(AdmissionDenyReason),
}

/// Receipt-facing summary of a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub context_id: ContextId,
    pub kind: ContextKind,
    pub display_name: String,
    pub capacity: u32,
    pub current_count: u32,
}

/// Dashboard read, served straight from the aggregate row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancySnapshot {
    pub context_id: ContextId,
    pub capacity: u32,
    pub current_count: u32,
    pub active_session_ids: Vec<PresenceSessionId>,
    pub last_updated: MonotonicTimeNs,
}

impl From<&OccupancyAggregateRecord> for OccupancySnapshot {
    fn from(r: &OccupancyAggregateRecord) -> Self {
        Self {
            context_id: r.context_id.clone(),
            capacity: r.capacity,
            current_count: r.current_count,
            active_session_ids: r.active_session_refs.iter().copied().collect(),
            last_updated: r.last_updated,
        }
    }
}

/// Difference between the aggregate row and the sessions table for one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyDrift {
    pub context_id: ContextId,
    pub recorded_count: u32,
    pub actual_count: u32,
    /// ACTIVE sessions missing from `active_session_refs`.
    pub missing_refs: Vec<PresenceSessionId>,
    /// Refs that do not point at an ACTIVE session of this context.
    pub stale_refs: Vec<PresenceSessionId>,
}

impl OccupancyDrift {
    pub fn has_drift(&self) -> bool {
        self.recorded_count != self.actual_count
            || !self.missing_refs.is_empty()
            || !self.stale_refs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ContextId {
        ContextId::new("gym_main").unwrap()
    }

    #[test]
    fn at_occ_contract_01_zero_threshold_rejected() {
        let out = ContextRecord::v1(ctx(), ContextKind::Event, "Workshop", 10, true, Some(0));
        assert!(out.is_err());
    }

    #[test]
    fn at_occ_contract_02_capacity_bound_enforced() {
        let out = ContextRecord::v1(
            ctx(),
            ContextKind::Facility,
            "Gym",
            MAX_CONTEXT_CAPACITY + 1,
            true,
            None,
        );
        assert!(matches!(out, Err(ContractViolation::InvalidRange { .. })));
    }

    #[test]
    fn at_occ_contract_03_aggregate_consistency_check() {
        let mut row = OccupancyAggregateRecord::empty_v1(ctx(), 3, MonotonicTimeNs(1));
        assert!(row.validate().is_ok());
        row.current_count = 1;
        assert!(row.validate().is_err());
        row.active_session_refs.insert(PresenceSessionId(4));
        assert!(row.validate().is_ok());
    }
}
