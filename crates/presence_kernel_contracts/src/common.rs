#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaVersion(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonotonicTimeNs(pub u64);

pub const NS_PER_MINUTE: u64 = 60_000_000_000;

impl MonotonicTimeNs {
    /// Whole minutes elapsed from `self` to `later`, rounded half-up.
    ///
    /// This is the only rounding rule used for session durations. It is applied once,
    /// when a session closes, and the stored value is what accumulators sum.
    pub fn rounded_minutes_until(self, later: MonotonicTimeNs) -> Result<u32, ContractViolation> {
        if later.0 < self.0 {
            return Err(ContractViolation::InvalidValue {
                field: "ended_at",
                reason: "must be >= started_at",
            });
        }
        let delta = later.0 - self.0;
        let minutes = delta.saturating_add(NS_PER_MINUTE / 2) / NS_PER_MINUTE;
        u32::try_from(minutes).map_err(|_| ContractViolation::InvalidRange {
            field: "duration_minutes",
            min: 0.0,
            max: u32::MAX as f64,
            got: minutes as f64,
        })
    }

    pub fn plus_minutes(self, minutes: u64) -> Self {
        Self(self.0.saturating_add(minutes.saturating_mul(NS_PER_MINUTE)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReasonCodeId(pub u32);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContractViolation {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    #[error("{field} out of range [{min}, {max}]: got {got}")]
    InvalidRange {
        field: &'static str,
        min: f64,
        max: f64,
        got: f64,
    },
}

pub trait Validate {
    fn validate(&self) -> Result<(), ContractViolation>;
}

pub(crate) fn validate_id(
    field: &'static str,
    value: &str,
    max_len: usize,
) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if value.len() > max_len {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "exceeds max length",
        });
    }
    if value.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not contain whitespace or control characters",
        });
    }
    Ok(())
}

pub(crate) fn validate_text(
    field: &'static str,
    value: &str,
    max_len: usize,
) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if value.len() > max_len {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "exceeds max length",
        });
    }
    Ok(())
}
