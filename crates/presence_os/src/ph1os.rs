#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::error;

use presence_engines::ph1att::DurationAccumulator;
use presence_engines::ph1occ::AdmissionGate;
use presence_kernel_contracts::ph1id::SubjectId;
use presence_kernel_contracts::ph1j::{
    AccessLogAction, AccessLogEntryInput, AccessLogMetadata, AccessReason,
};
use presence_kernel_contracts::ph1occ::{ContextId, ContextSummary};
use presence_kernel_contracts::ph1pres::PresenceSessionId;
use presence_kernel_contracts::{ContractViolation, MonotonicTimeNs};
use presence_storage::ph1f::{ContextPartition, PresenceStore, StorageError};
use presence_storage::repo::{Ph1PresenceReadRepo, Ph1jAccessLogRepo};

use crate::ph1id::IdentityResolver;
use crate::ph1j::{AuditFlushReport, AuditLogger, AuditRecordOutcome, Ph1jAuditConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceConfig {
    pub audit: Ph1jAuditConfig,
    /// How many times a toggle or force-close reconciles and retries after an aggregate
    /// conflict before surfacing it.
    pub conflict_retry_limit: u8,
}

impl PresenceConfig {
    pub fn mvp_v1() -> Self {
        Self {
            audit: Ph1jAuditConfig::mvp_v1(),
            conflict_retry_limit: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PresenceError {
    #[error("{what} not found: {key}")]
    NotFound { what: &'static str, key: String },
    #[error("session {session_id} is already closed")]
    AlreadyClosed { session_id: u64 },
    #[error("aggregate conflict: {0}")]
    Conflict(StorageError),
    #[error("storage failure: {0}")]
    Internal(StorageError),
}

impl From<StorageError> for PresenceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { table, key } => PresenceError::NotFound { what: table, key },
            err @ StorageError::Conflict { .. } => PresenceError::Conflict(err),
            err => PresenceError::Internal(err),
        }
    }
}

impl From<ContractViolation> for PresenceError {
    fn from(v: ContractViolation) -> Self {
        PresenceError::Internal(StorageError::ContractViolation(v))
    }
}

impl PresenceError {
    pub(crate) fn unknown_context(context_id: &ContextId) -> Self {
        PresenceError::NotFound {
            what: "context",
            key: context_id.as_str().to_string(),
        }
    }

    pub(crate) fn unknown_session(session_id: PresenceSessionId) -> Self {
        PresenceError::NotFound {
            what: "presence_session",
            key: session_id.0.to_string(),
        }
    }
}

/// Presence core runtime: owns the toggle controller, admin overrides, reconcile, and the
/// audit logger over one store.
pub struct PresenceRuntime {
    pub(crate) config: PresenceConfig,
    pub(crate) store: Arc<PresenceStore>,
    pub(crate) identity: Arc<dyn IdentityResolver>,
    /// Dashboard and admin reads.
    pub(crate) reads: Arc<dyn Ph1PresenceReadRepo>,
    pub(crate) audit: AuditLogger,
    pub(crate) gate: AdmissionGate,
    pub(crate) accumulator: DurationAccumulator,
}

impl PresenceRuntime {
    pub fn new(
        config: PresenceConfig,
        store: Arc<PresenceStore>,
        identity: Arc<dyn IdentityResolver>,
        audit_repo: Arc<dyn Ph1jAccessLogRepo>,
    ) -> Self {
        Self {
            audit: AuditLogger::new(config.audit, audit_repo),
            config,
            reads: store.clone(),
            store,
            identity,
            gate: AdmissionGate,
            accumulator: DurationAccumulator::new(),
        }
    }

    /// Runtime whose identity directory and access log both live in `store`.
    pub fn in_memory(config: PresenceConfig, store: Arc<PresenceStore>) -> Self {
        Self::new(config, store.clone(), store.clone(), store)
    }

    pub fn store(&self) -> &Arc<PresenceStore> {
        &self.store
    }

    pub fn audit_pending(&self) -> usize {
        self.audit.pending_len()
    }

    pub fn audit_dropped_total(&self) -> u64 {
        self.audit.dropped_total()
    }

    pub fn flush_audit(&self) -> AuditFlushReport {
        self.audit.flush_pending()
    }

    pub(crate) fn context_summary(&self, context_id: &ContextId) -> Option<ContextSummary> {
        self.store.with_context(context_id, |p| context_summary(p))
    }

    /// Runs `f` under the context lock. An aggregate conflict triggers a logged reconcile
    /// and a retry against the repaired state, up to `conflict_retry_limit` times.
    /// `Ok(None)` means the context does not exist.
    pub(crate) fn with_conflict_retry<T>(
        &self,
        context_id: &ContextId,
        now: MonotonicTimeNs,
        mut f: impl FnMut(&mut ContextPartition) -> Result<T, StorageError>,
    ) -> Result<Option<T>, PresenceError> {
        let mut attempts: u8 = 0;
        loop {
            match self.store.with_context(context_id, &mut f) {
                None => return Ok(None),
                Some(Ok(out)) => return Ok(Some(out)),
                Some(Err(err @ StorageError::Conflict { .. }))
                    if attempts < self.config.conflict_retry_limit =>
                {
                    attempts += 1;
                    error!(
                        context_id = %context_id.as_str(),
                        error = %err,
                        attempt = attempts,
                        "aggregate conflict; reconciling before retry"
                    );
                    self.reconcile_logged(context_id, now, "conflict")?;
                }
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }

    /// Appends one access-log row. Never fails the caller.
    ///
    /// Commit paths call this with the context lock held so that event ids follow commit
    /// order. Lock order is partition, then audit backlog, then ledger.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn record_access(
        &self,
        subject_id: Option<SubjectId>,
        context_id: &ContextId,
        session_id: Option<PresenceSessionId>,
        action: AccessLogAction,
        reason: Option<AccessReason>,
        success: bool,
        now: MonotonicTimeNs,
        metadata: AccessLogMetadata,
    ) -> Option<AuditRecordOutcome> {
        match AccessLogEntryInput::v1(
            subject_id,
            context_id.clone(),
            session_id,
            action,
            reason,
            success,
            now,
            metadata,
        ) {
            Ok(input) => Some(self.audit.record(input)),
            Err(violation) => {
                error!(
                    context_id = %context_id.as_str(),
                    action = action.as_str(),
                    error = %violation,
                    "access log entry failed validation"
                );
                None
            }
        }
    }
}

pub(crate) fn context_summary(p: &ContextPartition) -> ContextSummary {
    let context = p.context();
    ContextSummary {
        context_id: context.context_id.clone(),
        kind: context.kind,
        display_name: context.display_name.clone(),
        capacity: context.capacity,
        current_count: p.aggregate().current_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_os_01_storage_errors_map_to_presence_taxonomy() {
        let nf: PresenceError = StorageError::NotFound {
            table: "presence_sessions",
            key: "9".to_string(),
        }
        .into();
        assert!(matches!(nf, PresenceError::NotFound { what: "presence_sessions", .. }));

        let conflict: PresenceError = StorageError::Conflict {
            table: "occupancy_aggregates.current_count",
            key: "gym".to_string(),
            reason: "increment would exceed capacity",
        }
        .into();
        assert!(matches!(conflict, PresenceError::Conflict(_)));

        let internal: PresenceError = StorageError::AppendOnlyViolation {
            table: "access_log",
        }
        .into();
        assert!(matches!(internal, PresenceError::Internal(_)));
    }

    #[test]
    fn at_os_02_default_config_retries_once() {
        let c = PresenceConfig::mvp_v1();
        assert_eq!(c.conflict_retry_limit, 1);
        assert!(c.audit.max_pending_backlog >= c.audit.retry_batch);
    }
}
