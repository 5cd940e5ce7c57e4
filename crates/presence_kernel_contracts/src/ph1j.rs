#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ph1id::SubjectId;
use crate::ph1occ::{AdmissionDenyReason, ContextId};
use crate::ph1pres::PresenceSessionId;
use crate::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};

pub const PH1J_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub mod reason_codes {
    use crate::ReasonCodeId;

    // PH1.J access-log reason-code namespace.
    pub const ACCESS_UNKNOWN_IDENTIFIER: ReasonCodeId = ReasonCodeId(0x4A50_0001);
    pub const ACCESS_UNKNOWN_CONTEXT: ReasonCodeId = ReasonCodeId(0x4A50_0002);
    pub const ACCESS_CAPACITY_EXCEEDED: ReasonCodeId = ReasonCodeId(0x4A50_0003);
    pub const ACCESS_CONTEXT_INACTIVE: ReasonCodeId = ReasonCodeId(0x4A50_0004);
    pub const ACCESS_ADMIN_OVERRIDE: ReasonCodeId = ReasonCodeId(0x4A50_0005);
    pub const ACCESS_ALREADY_CLOSED: ReasonCodeId = ReasonCodeId(0x4A50_0006);
    pub const ACCESS_UNKNOWN_SESSION: ReasonCodeId = ReasonCodeId(0x4A50_0007);
    pub const ACCESS_COMMIT_FAILED: ReasonCodeId = ReasonCodeId(0x4A50_00E1);
    pub const ACCESS_AGGREGATE_RECONCILED: ReasonCodeId = ReasonCodeId(0x4A50_00F1);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessLogEventId(pub u64);

impl Validate for AccessLogEventId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "access_log_event_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessLogAction {
    CheckIn,
    CheckOut,
    Denied,
    Anomaly,
}

impl AccessLogAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessLogAction::CheckIn => "CHECK_IN",
            AccessLogAction::CheckOut => "CHECK_OUT",
            AccessLogAction::Denied => "DENIED",
            AccessLogAction::Anomaly => "ANOMALY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessReason {
    UnknownIdentifier,
    UnknownContext,
    CapacityExceeded,
    ContextInactive,
    AdminOverride,
    AlreadyClosed,
    UnknownSession,
    /// The state change could not be committed; nothing was written.
    CommitFailed,
    AggregateReconciled,
}

impl AccessReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessReason::UnknownIdentifier => "unknown_identifier",
            AccessReason::UnknownContext => "unknown_context",
            AccessReason::CapacityExceeded => "capacity_exceeded",
            AccessReason::ContextInactive => "context_inactive",
            AccessReason::AdminOverride => "admin_override",
            AccessReason::AlreadyClosed => "already_closed",
            AccessReason::UnknownSession => "unknown_session",
            AccessReason::CommitFailed => "commit_failed",
            AccessReason::AggregateReconciled => "aggregate_reconciled",
        }
    }

    pub fn reason_code(self) -> ReasonCodeId {
        match self {
            AccessReason::UnknownIdentifier => reason_codes::ACCESS_UNKNOWN_IDENTIFIER,
            AccessReason::UnknownContext => reason_codes::ACCESS_UNKNOWN_CONTEXT,
            AccessReason::CapacityExceeded => reason_codes::ACCESS_CAPACITY_EXCEEDED,
            AccessReason::ContextInactive => reason_codes::ACCESS_CONTEXT_INACTIVE,
            AccessReason::AdminOverride => reason_codes::ACCESS_ADMIN_OVERRIDE,
            AccessReason::AlreadyClosed => reason_codes::ACCESS_ALREADY_CLOSED,
            AccessReason::UnknownSession => reason_codes::ACCESS_UNKNOWN_SESSION,
            AccessReason::CommitFailed => reason_codes::ACCESS_COMMIT_FAILED,
            AccessReason::AggregateReconciled => reason_codes::ACCESS_AGGREGATE_RECONCILED,
        }
    }
}

impl From<AdmissionDenyReason> for AccessReason {
    fn from(r: AdmissionDenyReason) -> Self {
        match r {
            AdmissionDenyReason::ContextInactive => AccessReason::ContextInactive,
            AdmissionDenyReason::CapacityExceeded => AccessReason::CapacityExceeded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PayloadKey(String);

fn is_ascii_lower_snake_key(s: &str) -> bool {
    let b = s.as_bytes();
    if b.is_empty() || !b[0].is_ascii_lowercase() {
        return false;
    }
    b.iter()
        .skip(1)
        .all(|&c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'_')
}

impl PayloadKey {
    pub fn new(key: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(key.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for PayloadKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.len() > 64 {
            return Err(ContractViolation::InvalidValue {
                field: "payload_key",
                reason: "must be <= 64 chars",
            });
        }
        if !is_ascii_lower_snake_key(&self.0) {
            return Err(ContractViolation::InvalidValue {
                field: "payload_key",
                reason: "must be lower_snake_case (a-z0-9_)",
            });
        }
        Ok(())
    }
}

impl TryFrom<String> for PayloadKey {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PayloadKey> for String {
    fn from(v: PayloadKey) -> Self {
        v.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PayloadValue(String);

impl PayloadValue {
    pub fn new(value: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(value.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for PayloadValue {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "payload_value",
                reason: "must not be empty",
            });
        }
        if self.0.len() > 256 {
            return Err(ContractViolation::InvalidValue {
                field: "payload_value",
                reason: "must be <= 256 chars",
            });
        }
        Ok(())
    }
}

impl TryFrom<String> for PayloadValue {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PayloadValue> for String {
    fn from(v: PayloadValue) -> Self {
        v.0
    }
}

/// Bounded key/value metadata attached to an access-log entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessLogMetadata {
    pub entries: BTreeMap<PayloadKey, PayloadValue>,
}

impl AccessLogMetadata {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Adds one entry. Keys and values are fixed by callers, so a malformed pair is dropped
    /// rather than failing the audit write.
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        if let (Ok(k), Ok(v)) = (PayloadKey::new(key), PayloadValue::new(value)) {
            self.entries.insert(k, v);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, v)| v.as_str())
    }
}

impl Validate for AccessLogMetadata {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.entries.len() > 16 {
            return Err(ContractViolation::InvalidValue {
                field: "access_log_metadata.entries",
                reason: "must be <= 16 entries",
            });
        }
        let mut total_bytes: usize = 0;
        for (k, v) in &self.entries {
            k.validate()?;
            v.validate()?;
            total_bytes = total_bytes
                .saturating_add(k.as_str().len())
                .saturating_add(v.as_str().len());
            if total_bytes > 2048 {
                return Err(ContractViolation::InvalidValue {
                    field: "access_log_metadata",
                    reason: "total payload size must be <= 2048 bytes",
                });
            }
        }
        Ok(())
    }
}

/// One attempt as handed to the audit logger, before it is assigned an id and chained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLogEntryInput {
    pub subject_id: Option<SubjectId>,
    pub context_id: ContextId,
    pub session_id: Option<PresenceSessionId>,
    pub action: AccessLogAction,
    pub reason: Option<AccessReason>,
    pub success: bool,
    pub timestamp: MonotonicTimeNs,
    pub metadata: AccessLogMetadata,
}

impl AccessLogEntryInput {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        subject_id: Option<SubjectId>,
        context_id: ContextId,
        session_id: Option<PresenceSessionId>,
        action: AccessLogAction,
        reason: Option<AccessReason>,
        success: bool,
        timestamp: MonotonicTimeNs,
        metadata: AccessLogMetadata,
    ) -> Result<Self, ContractViolation> {
        let v = Self {
            subject_id,
            context_id,
            session_id,
            action,
            reason,
            success,
            timestamp,
            metadata,
        };
        v.validate()?;
        Ok(v)
    }
}

impl Validate for AccessLogEntryInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if let Some(s) = &self.subject_id {
            s.validate()?;
        }
        self.context_id.validate()?;
        if let Some(id) = self.session_id {
            id.validate()?;
        }
        self.metadata.validate()?;
        match (self.action, self.success) {
            (AccessLogAction::CheckIn | AccessLogAction::CheckOut, true) => {}
            (AccessLogAction::Denied, false) => {
                if self.reason.is_none() {
                    return Err(ContractViolation::InvalidValue {
                        field: "access_log_entry.reason",
                        reason: "DENIED entries must carry a reason",
                    });
                }
            }
            (AccessLogAction::Anomaly, _) => {
                if self.reason.is_none() {
                    return Err(ContractViolation::InvalidValue {
                        field: "access_log_entry.reason",
                        reason: "ANOMALY entries must carry a reason",
                    });
                }
            }
            _ => {
                return Err(ContractViolation::InvalidValue {
                    field: "access_log_entry.success",
                    reason: "success must be true for CHECK_IN/CHECK_OUT and false for DENIED",
                });
            }
        }
        Ok(())
    }
}

/// A committed access-log row. Never mutated or deleted once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub schema_version: SchemaVersion,
    pub event_id: AccessLogEventId,
    pub subject_id: Option<SubjectId>,
    pub context_id: ContextId,
    pub session_id: Option<PresenceSessionId>,
    pub action: AccessLogAction,
    pub reason: Option<AccessReason>,
    pub success: bool,
    pub timestamp: MonotonicTimeNs,
    pub metadata: AccessLogMetadata,
    pub prev_hash: String,
    pub entry_hash: String,
}

impl AccessLogEntry {
    pub fn from_input_v1(
        event_id: AccessLogEventId,
        input: AccessLogEntryInput,
        prev_hash: String,
        entry_hash: String,
    ) -> Result<Self, ContractViolation> {
        event_id.validate()?;
        input.validate()?;
        Ok(Self {
            schema_version: PH1J_CONTRACT_VERSION,
            event_id,
            subject_id: input.subject_id,
            context_id: input.context_id,
            session_id: input.session_id,
            action: input.action,
            reason: input.reason,
            success: input.success,
            timestamp: input.timestamp,
            metadata: input.metadata,
            prev_hash,
            entry_hash,
        })
    }

    /// Canonical bytes covered by `entry_hash`, excluding the hashes themselves.
    ///
    /// Every field is written as `<len>:<name>=<len>:<value>;`, so no value can forge a
    /// field boundary. Absent optional fields are omitted. Metadata keys carry a `meta.`
    /// prefix, which no fixed field name uses.
    pub fn canonical_content(&self) -> String {
        let mut out = String::new();
        push_canonical_field(&mut out, "v", &self.schema_version.0.to_string());
        push_canonical_field(&mut out, "id", &self.event_id.0.to_string());
        if let Some(subject_id) = &self.subject_id {
            push_canonical_field(&mut out, "subject", subject_id.as_str());
        }
        push_canonical_field(&mut out, "context", self.context_id.as_str());
        if let Some(session_id) = self.session_id {
            push_canonical_field(&mut out, "session", &session_id.0.to_string());
        }
        push_canonical_field(&mut out, "action", self.action.as_str());
        if let Some(reason) = self.reason {
            push_canonical_field(&mut out, "reason", reason.as_str());
        }
        push_canonical_field(&mut out, "success", if self.success { "1" } else { "0" });
        push_canonical_field(&mut out, "ts", &self.timestamp.0.to_string());
        for (k, v) in &self.metadata.entries {
            push_canonical_field(&mut out, &format!("meta.{}", k.as_str()), v.as_str());
        }
        out
    }
}

fn push_canonical_field(out: &mut String, name: &str, value: &str) {
    out.push_str(&format!("{}:{}={}:{};", name.len(), name, value.len(), value));
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl Validate for AccessLogEntry {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.event_id.validate()?;
        AccessLogEntryInput {
            subject_id: self.subject_id.clone(),
            context_id: self.context_id.clone(),
            session_id: self.session_id,
            action: self.action,
            reason: self.reason,
            success: self.success,
            timestamp: self.timestamp,
            metadata: self.metadata.clone(),
        }
        .validate()?;
        if !is_sha256_hex(&self.prev_hash) {
            return Err(ContractViolation::InvalidValue {
                field: "access_log_entry.prev_hash",
                reason: "must be 64 hex chars",
            });
        }
        if !is_sha256_hex(&self.entry_hash) {
            return Err(ContractViolation::InvalidValue {
                field: "access_log_entry.entry_hash",
                reason: "must be 64 hex chars",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ContextId {
        ContextId::new("hall_a").unwrap()
    }

    #[test]
    fn at_j_contract_01_denied_requires_reason() {
        let out = AccessLogEntryInput::v1(
            None,
            ctx(),
            None,
            AccessLogAction::Denied,
            None,
            false,
            MonotonicTimeNs(1),
            AccessLogMetadata::empty(),
        );
        assert!(out.is_err());
    }

    #[test]
    fn at_j_contract_02_success_flag_must_match_action() {
        let out = AccessLogEntryInput::v1(
            None,
            ctx(),
            None,
            AccessLogAction::CheckIn,
            None,
            false,
            MonotonicTimeNs(1),
            AccessLogMetadata::empty(),
        );
        assert!(matches!(
            out,
            Err(ContractViolation::InvalidValue {
                field: "access_log_entry.success",
                ..
            })
        ));
    }

    #[test]
    fn at_j_contract_03_metadata_drops_malformed_keys() {
        let m = AccessLogMetadata::empty()
            .with("tag_id", "abc")
            .with("Bad Key", "x")
            .with("blank", " ");
        assert_eq!(m.entries.len(), 1);
        assert_eq!(m.get("tag_id"), Some("abc"));
    }

    #[test]
    fn at_j_contract_04_reason_strings_are_stable() {
        assert_eq!(AccessReason::UnknownIdentifier.as_str(), "unknown_identifier");
        assert_eq!(AccessReason::CapacityExceeded.as_str(), "capacity_exceeded");
        assert_eq!(AccessReason::ContextInactive.as_str(), "context_inactive");
        assert_eq!(AccessReason::AdminOverride.as_str(), "admin_override");
        assert_eq!(
            serde_json::to_string(&AccessReason::CapacityExceeded).unwrap(),
            "\"capacity_exceeded\""
        );
    }

    #[test]
    fn at_j_contract_05_canonical_content_keeps_field_boundaries() {
        let entry = |metadata: AccessLogMetadata| {
            let input = AccessLogEntryInput::v1(
                None,
                ctx(),
                None,
                AccessLogAction::Denied,
                Some(AccessReason::UnknownIdentifier),
                false,
                MonotonicTimeNs(1),
                metadata,
            )
            .unwrap();
            AccessLogEntry::from_input_v1(AccessLogEventId(1), input, String::new(), String::new())
                .unwrap()
        };
        let joined = entry(AccessLogMetadata::empty().with("identifier", "x|zz=forged"));
        let split = entry(
            AccessLogMetadata::empty()
                .with("identifier", "x")
                .with("zz", "forged"),
        );
        assert_ne!(joined.canonical_content(), split.canonical_content());
    }
}
