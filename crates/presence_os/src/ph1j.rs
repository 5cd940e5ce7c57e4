#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, warn};

use presence_kernel_contracts::ph1j::{AccessLogEntryInput, AccessLogEventId};
use presence_storage::ph1f::StorageError;
use presence_storage::repo::Ph1jAccessLogRepo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ph1jAuditConfig {
    /// Entries held for retry before new failures are dropped.
    pub max_pending_backlog: usize,
    /// Entries retried per `flush_pending` pass.
    pub retry_batch: usize,
}

impl Ph1jAuditConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_pending_backlog: 4096,
            retry_batch: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditRecordOutcome {
    Appended(AccessLogEventId),
    Queued { pending: usize },
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuditFlushReport {
    pub flushed: usize,
    pub remaining: usize,
}

/// PH1.J audit logger with a write-behind retry queue.
///
/// `record` never fails its caller: the state change it describes is already committed.
/// Entries are appended in submission order; once something is queued, later entries
/// queue behind it until `flush_pending` drains the backlog.
pub struct AuditLogger {
    config: Ph1jAuditConfig,
    repo: Arc<dyn Ph1jAccessLogRepo>,
    pending: Mutex<VecDeque<AccessLogEntryInput>>,
    dropped_total: AtomicU64,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("config", &self.config)
            .field("pending", &self.pending.lock().len())
            .field("dropped_total", &self.dropped_total.load(Ordering::Relaxed))
            .finish()
    }
}

impl AuditLogger {
    pub fn new(config: Ph1jAuditConfig, repo: Arc<dyn Ph1jAccessLogRepo>) -> Self {
        Self {
            config,
            repo,
            pending: Mutex::new(VecDeque::new()),
            dropped_total: AtomicU64::new(0),
        }
    }

    pub fn record(&self, input: AccessLogEntryInput) -> AuditRecordOutcome {
        let mut pending = self.pending.lock();
        if !pending.is_empty() {
            return self.enqueue(&mut pending, input);
        }
        match self.repo.append_access_log_row(input.clone()) {
            Ok(entry) => AuditRecordOutcome::Appended(entry.event_id),
            Err(StorageError::ContractViolation(violation)) => {
                error!(
                    context_id = %input.context_id.as_str(),
                    action = input.action.as_str(),
                    error = %violation,
                    "access log entry rejected; dropping"
                );
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
                AuditRecordOutcome::Dropped
            }
            Err(err) => {
                warn!(
                    context_id = %input.context_id.as_str(),
                    action = input.action.as_str(),
                    error = %err,
                    "access log write failed; queued for retry"
                );
                self.enqueue(&mut pending, input)
            }
        }
    }

    fn enqueue(
        &self,
        pending: &mut VecDeque<AccessLogEntryInput>,
        input: AccessLogEntryInput,
    ) -> AuditRecordOutcome {
        if pending.len() >= self.config.max_pending_backlog {
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
            error!(
                context_id = %input.context_id.as_str(),
                action = input.action.as_str(),
                backlog = pending.len(),
                "access log backlog full; entry dropped"
            );
            return AuditRecordOutcome::Dropped;
        }
        pending.push_back(input);
        AuditRecordOutcome::Queued {
            pending: pending.len(),
        }
    }

    /// Retries up to `retry_batch` queued entries in order. Stops at the first failure so
    /// ordering is preserved.
    pub fn flush_pending(&self) -> AuditFlushReport {
        let mut pending = self.pending.lock();
        let mut flushed = 0;
        while flushed < self.config.retry_batch {
            let Some(front) = pending.front().cloned() else {
                break;
            };
            match self.repo.append_access_log_row(front) {
                Ok(_) => {
                    pending.pop_front();
                    flushed += 1;
                }
                Err(StorageError::ContractViolation(violation)) => {
                    pending.pop_front();
                    self.dropped_total.fetch_add(1, Ordering::Relaxed);
                    error!(error = %violation, "queued access log entry rejected; dropping");
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        backlog = pending.len(),
                        "access log retry failed"
                    );
                    break;
                }
            }
        }
        AuditFlushReport {
            flushed,
            remaining: pending.len(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use presence_kernel_contracts::ph1j::{
        AccessLogAction, AccessLogEntry, AccessLogMetadata, AccessReason,
    };
    use presence_kernel_contracts::ph1occ::ContextId;
    use presence_kernel_contracts::MonotonicTimeNs;
    use presence_storage::ph1f::PresenceStore;

    /// Delegates to a real store but can be switched into an outage.
    struct FlakyRepo {
        inner: PresenceStore,
        down: AtomicBool,
    }

    impl FlakyRepo {
        fn new() -> Self {
            Self {
                inner: PresenceStore::new_in_memory(),
                down: AtomicBool::new(false),
            }
        }
    }

    impl Ph1jAccessLogRepo for FlakyRepo {
        fn append_access_log_row(
            &self,
            input: AccessLogEntryInput,
        ) -> Result<AccessLogEntry, StorageError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StorageError::Conflict {
                    table: "access_log",
                    key: "sink".to_string(),
                    reason: "sink unavailable",
                });
            }
            self.inner.append_access_log_row(input)
        }

        fn access_log_rows(&self) -> Vec<AccessLogEntry> {
            self.inner.access_log_rows()
        }
    }

    fn denied(ts: u64) -> AccessLogEntryInput {
        AccessLogEntryInput::v1(
            None,
            ContextId::new("lobby").unwrap(),
            None,
            AccessLogAction::Denied,
            Some(AccessReason::UnknownIdentifier),
            false,
            MonotonicTimeNs(ts),
            AccessLogMetadata::empty(),
        )
        .unwrap()
    }

    #[test]
    fn at_j_wiring_01_failed_writes_queue_and_flush_in_order() {
        let repo = Arc::new(FlakyRepo::new());
        let logger = AuditLogger::new(Ph1jAuditConfig::mvp_v1(), repo.clone());

        assert!(matches!(logger.record(denied(1)), AuditRecordOutcome::Appended(_)));
        repo.down.store(true, Ordering::SeqCst);
        assert_eq!(
            logger.record(denied(2)),
            AuditRecordOutcome::Queued { pending: 1 }
        );
        repo.down.store(false, Ordering::SeqCst);
        // Still queues behind the backlog until a flush runs.
        assert_eq!(
            logger.record(denied(3)),
            AuditRecordOutcome::Queued { pending: 2 }
        );

        let report = logger.flush_pending();
        assert_eq!(report, AuditFlushReport { flushed: 2, remaining: 0 });
        let ts: Vec<u64> = repo
            .access_log_rows()
            .iter()
            .map(|e| e.timestamp.0)
            .collect();
        assert_eq!(ts, vec![1, 2, 3]);
    }

    #[test]
    fn at_j_wiring_02_flush_stops_at_first_failure() {
        let repo = Arc::new(FlakyRepo::new());
        let logger = AuditLogger::new(Ph1jAuditConfig::mvp_v1(), repo.clone());
        repo.down.store(true, Ordering::SeqCst);
        logger.record(denied(1));
        logger.record(denied(2));
        assert_eq!(
            logger.flush_pending(),
            AuditFlushReport { flushed: 0, remaining: 2 }
        );
        assert!(repo.access_log_rows().is_empty());
    }

    #[test]
    fn at_j_wiring_03_backlog_is_bounded() {
        let repo = Arc::new(FlakyRepo::new());
        let logger = AuditLogger::new(
            Ph1jAuditConfig {
                max_pending_backlog: 2,
                retry_batch: 8,
            },
            repo.clone(),
        );
        repo.down.store(true, Ordering::SeqCst);
        logger.record(denied(1));
        logger.record(denied(2));
        assert_eq!(logger.record(denied(3)), AuditRecordOutcome::Dropped);
        assert_eq!(logger.pending_len(), 2);
        assert_eq!(logger.dropped_total(), 1);
    }
}
