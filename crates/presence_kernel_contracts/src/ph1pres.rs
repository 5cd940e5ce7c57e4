#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::ph1id::{SubjectId, SubjectSummary};
use crate::ph1j::AccessReason;
use crate::ph1occ::{ContextId, ContextKind, ContextSummary};
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const PH1PRES_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresenceSessionId(pub u64);

impl Validate for PresenceSessionId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "presence_session_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceSessionStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionCloseReason {
    CheckOut,
    AdminOverride,
}

/// One timed presence interval. Facility visits and event attendance share this shape;
/// `context_kind` is the only difference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSessionRecord {
    pub schema_version: SchemaVersion,
    pub session_id: PresenceSessionId,
    pub subject_id: SubjectId,
    pub context_id: ContextId,
    pub context_kind: ContextKind,
    pub started_at: MonotonicTimeNs,
    pub ended_at: Option<MonotonicTimeNs>,
    pub duration_minutes: Option<u32>,
    pub status: PresenceSessionStatus,
    pub close_reason: Option<SessionCloseReason>,
}

impl PresenceSessionRecord {
    pub fn open_v1(
        session_id: PresenceSessionId,
        subject_id: SubjectId,
        context_id: ContextId,
        context_kind: ContextKind,
        started_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: PH1PRES_CONTRACT_VERSION,
            session_id,
            subject_id,
            context_id,
            context_kind,
            started_at,
            ended_at: None,
            duration_minutes: None,
            status: PresenceSessionStatus::Active,
            close_reason: None,
        };
        r.validate()?;
        Ok(r)
    }

    /// Closed copy of an ACTIVE session. The duration is fixed here and never recomputed.
    pub fn closed(
        &self,
        ended_at: MonotonicTimeNs,
        close_reason: SessionCloseReason,
    ) -> Result<Self, ContractViolation> {
        if self.status != PresenceSessionStatus::Active {
            return Err(ContractViolation::InvalidValue {
                field: "presence_session.status",
                reason: "only ACTIVE sessions can be closed",
            });
        }
        let duration_minutes = self.started_at.rounded_minutes_until(ended_at)?;
        let mut out = self.clone();
        out.ended_at = Some(ended_at);
        out.duration_minutes = Some(duration_minutes);
        out.status = PresenceSessionStatus::Closed;
        out.close_reason = Some(close_reason);
        Ok(out)
    }

    pub fn is_active(&self) -> bool {
        self.status == PresenceSessionStatus::Active
    }

    pub fn timing(&self) -> SessionTiming {
        SessionTiming {
            session_id: self.session_id,
            started_at_ns: self.started_at.0,
            ended_at_ns: self.ended_at.map(|t| t.0),
            duration_minutes: self.duration_minutes,
        }
    }
}

impl Validate for PresenceSessionRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.session_id.validate()?;
        self.subject_id.validate()?;
        self.context_id.validate()?;
        match self.status {
            PresenceSessionStatus::Active => {
                if self.ended_at.is_some()
                    || self.duration_minutes.is_some()
                    || self.close_reason.is_some()
                {
                    return Err(ContractViolation::InvalidValue {
                        field: "presence_session.ended_at",
                        reason: "must be None while ACTIVE",
                    });
                }
            }
            PresenceSessionStatus::Closed => {
                let (Some(ended_at), Some(duration), Some(_)) =
                    (self.ended_at, self.duration_minutes, self.close_reason)
                else {
                    return Err(ContractViolation::InvalidValue {
                        field: "presence_session.ended_at",
                        reason: "must be set when CLOSED",
                    });
                };
                if self.started_at.rounded_minutes_until(ended_at)? != duration {
                    return Err(ContractViolation::InvalidValue {
                        field: "presence_session.duration_minutes",
                        reason: "must equal rounded(ended_at - started_at)",
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToggleAction {
    CheckIn,
    CheckOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTiming {
    pub session_id: PresenceSessionId,
    pub started_at_ns: u64,
    pub ended_at_ns: Option<u64>,
    pub duration_minutes: Option<u32>,
}

/// What a scan did. Denials are outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanOutcome {
    Applied {
        action: ToggleAction,
        session: SessionTiming,
    },
    Denied {
        reason: AccessReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReceipt {
    pub outcome: ScanOutcome,
    pub subject: Option<SubjectSummary>,
    pub context: Option<ContextSummary>,
    pub eligible: Option<bool>,
}

impl ScanReceipt {
    pub fn action(&self) -> Option<ToggleAction> {
        match &self.outcome {
            ScanOutcome::Applied { action, .. } => Some(*action),
            ScanOutcome::Denied { .. } => None,
        }
    }

    pub fn denial_reason(&self) -> Option<AccessReason> {
        match &self.outcome {
            ScanOutcome::Applied { .. } => None,
            ScanOutcome::Denied { reason } => Some(*reason),
        }
    }

    pub fn session(&self) -> Option<&SessionTiming> {
        match &self.outcome {
            ScanOutcome::Applied { session, .. } => Some(session),
            ScanOutcome::Denied { .. } => None,
        }
    }
}
