#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use presence_kernel_contracts::ph1att::AttendanceAccumulatorRecord;
use presence_kernel_contracts::ph1id::{SubjectId, SubjectRecord, SubjectSummary, TagId};
use presence_kernel_contracts::ph1j::{AccessLogEntry, AccessLogEntryInput};
use presence_kernel_contracts::ph1occ::{
    ContextId, ContextKind, ContextRecord, ContextSummary, OccupancyDrift, OccupancySnapshot,
};
use presence_kernel_contracts::ph1pres::{
    PresenceSessionId, PresenceSessionRecord, ScanOutcome, ScanReceipt, SessionTiming,
    ToggleAction,
};
use presence_kernel_contracts::{ContractViolation, MonotonicTimeNs};
use presence_os::ph1j::AuditFlushReport;
use presence_os::ph1occ::DriftSweepReport;
use presence_os::{PresenceConfig, PresenceError, PresenceRuntime};
use presence_storage::ph1f::{PresenceStore, StorageError};
use presence_storage::repo::Ph1jAccessLogRepo;

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Presence(#[from] PresenceError),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl From<ContractViolation> for AdapterError {
    fn from(v: ContractViolation) -> Self {
        AdapterError::BadRequest(v.to_string())
    }
}

impl AdapterError {
    pub fn http_status_code(&self) -> u16 {
        match self {
            AdapterError::BadRequest(_) => 400,
            AdapterError::Presence(PresenceError::NotFound { .. }) => 404,
            AdapterError::Presence(PresenceError::AlreadyClosed { .. }) => 409,
            AdapterError::Presence(PresenceError::Conflict(_)) => 409,
            AdapterError::Presence(PresenceError::Internal(StorageError::ContractViolation(_))) => {
                400
            }
            AdapterError::Presence(PresenceError::Internal(_)) => 500,
            AdapterError::Persistence(_) => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterErrorResponse {
    pub status: String,
    pub error: String,
}

impl From<&AdapterError> for AdapterErrorResponse {
    fn from(err: &AdapterError) -> Self {
        let error = match err {
            AdapterError::Presence(PresenceError::AlreadyClosed { .. }) => {
                "already_closed".to_string()
            }
            other => other.to_string(),
        };
        Self {
            status: "error".to_string(),
            error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanAdapterRequest {
    pub subject_tag_or_id: String,
    pub context_id: String,
    pub now_ns: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanAdapterResponse {
    pub status: String,
    pub action: Option<ToggleAction>,
    pub session: Option<SessionTiming>,
    pub subject: Option<SubjectSummary>,
    pub context: Option<ContextSummary>,
    pub eligible: Option<bool>,
    pub error: Option<String>,
}

impl From<ScanReceipt> for ScanAdapterResponse {
    fn from(receipt: ScanReceipt) -> Self {
        let (status, action, session, error) = match receipt.outcome {
            ScanOutcome::Applied { action, session } => {
                ("ok", Some(action), Some(session), None)
            }
            ScanOutcome::Denied { reason } => ("error", None, None, Some(reason.as_str())),
        };
        Self {
            status: status.to_string(),
            action,
            session,
            subject: receipt.subject,
            context: receipt.context,
            eligible: receipt.eligible,
            error: error.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminClockRequest {
    pub now_ns: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextUpsertAdapterRequest {
    pub display_name: String,
    pub kind: ContextKind,
    pub capacity: u32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub eligibility_threshold_minutes: Option<u32>,
    pub now_ns: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSessionsResponse {
    pub status: String,
    pub context_id: ContextId,
    pub sessions: Vec<PresenceSessionRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AdapterAuditHealth {
    pub pending_backlog: usize,
    pub dropped_total: u64,
    pub journal_backlog: usize,
    pub access_log_len: usize,
    pub chain_intact: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub contexts: usize,
    pub audit: AdapterAuditHealth,
}

fn default_true() -> bool {
    true
}

// ------------------------
// Directory seed: subjects and contexts loaded at startup.
// ------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectorySeed {
    #[serde(default)]
    pub subjects: Vec<SubjectSeed>,
    #[serde(default)]
    pub contexts: Vec<ContextSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectSeed {
    pub subject_id: String,
    pub display_name: String,
    #[serde(default)]
    pub tag_ids: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSeed {
    pub context_id: String,
    pub kind: ContextKind,
    pub display_name: String,
    pub capacity: u32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub eligibility_threshold_minutes: Option<u32>,
}

impl DirectorySeed {
    pub fn from_path(path: &Path) -> Result<Self, AdapterError> {
        let raw = fs::read_to_string(path).map_err(|err| {
            AdapterError::Persistence(format!(
                "failed to read directory seed '{}': {}",
                path.display(),
                err
            ))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            AdapterError::BadRequest(format!(
                "failed parsing directory seed '{}': {}",
                path.display(),
                err
            ))
        })
    }

    pub fn apply(&self, store: &PresenceStore, now: MonotonicTimeNs) -> Result<(), AdapterError> {
        for s in &self.subjects {
            let tags = s
                .tag_ids
                .iter()
                .map(|t| TagId::new(t.as_str()))
                .collect::<Result<Vec<_>, _>>()?;
            let record = SubjectRecord::v1(
                SubjectId::new(s.subject_id.as_str())?,
                s.display_name.as_str(),
                tags,
                s.active,
            )?;
            store
                .insert_subject(record)
                .map_err(|err| AdapterError::Presence(err.into()))?;
        }
        for c in &self.contexts {
            let record = ContextRecord::v1(
                ContextId::new(c.context_id.as_str())?,
                c.kind,
                c.display_name.as_str(),
                c.capacity,
                c.active,
                c.eligibility_threshold_minutes,
            )?;
            store
                .upsert_context(record, now)
                .map_err(|err| AdapterError::Presence(err.into()))?;
        }
        Ok(())
    }
}

// ------------------------
// JSONL access-log journal.
// ------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessLogJournalLine {
    schema_version: u8,
    entry: AccessLogEntry,
}

/// Access-log repo that commits to the store's ledger and mirrors every committed row to
/// a JSONL file. Rows that could not be written yet stay queued, in ledger order, until
/// the next append or `flush_journal`.
pub struct JournaledAccessLog {
    store: Arc<PresenceStore>,
    path: PathBuf,
    unjournaled: Mutex<VecDeque<AccessLogEntry>>,
}

impl JournaledAccessLog {
    /// Opens (creating if needed) the journal and restores its rows into the store's ledger.
    pub fn open(store: Arc<PresenceStore>, path: PathBuf) -> Result<Self, AdapterError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                AdapterError::Persistence(format!(
                    "failed to create access log directory '{}': {}",
                    parent.display(),
                    err
                ))
            })?;
        }
        if !path.exists() {
            File::create(&path).map_err(|err| {
                AdapterError::Persistence(format!(
                    "failed to create access log journal '{}': {}",
                    path.display(),
                    err
                ))
            })?;
        }
        let journal = Self {
            store,
            path,
            unjournaled: Mutex::new(VecDeque::new()),
        };
        journal.replay_into_store()?;
        Ok(journal)
    }

    fn replay_into_store(&self) -> Result<usize, AdapterError> {
        let file = File::open(&self.path).map_err(|err| {
            AdapterError::Persistence(format!(
                "failed to open access log journal '{}': {}",
                self.path.display(),
                err
            ))
        })?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        let mut line_no = 0usize;
        let mut good_len: u64 = 0;
        let mut restored = 0;
        loop {
            line.clear();
            let read = reader.read_line(&mut line).map_err(|err| {
                AdapterError::Persistence(format!(
                    "failed reading access log journal '{}' at line {}: {}",
                    self.path.display(),
                    line_no + 1,
                    err
                ))
            })?;
            if read == 0 {
                break;
            }
            line_no += 1;
            if !line.ends_with('\n') {
                // Torn tail from an interrupted write; never acknowledged, so drop it.
                self.truncate_torn_tail(good_len, line_no)?;
                break;
            }
            good_len += read as u64;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: AccessLogJournalLine = serde_json::from_str(&line).map_err(|err| {
                AdapterError::Persistence(format!(
                    "failed parsing access log journal '{}' at line {}: {}",
                    self.path.display(),
                    line_no,
                    err
                ))
            })?;
            if parsed.schema_version != 1 {
                return Err(AdapterError::Persistence(format!(
                    "unsupported access log journal schema_version={} at line {}",
                    parsed.schema_version, line_no
                )));
            }
            self.store
                .restore_access_log_entry(parsed.entry)
                .map_err(|err| {
                    AdapterError::Persistence(format!(
                        "access log journal replay failed at line {}: {}",
                        line_no, err
                    ))
                })?;
            restored += 1;
        }
        if restored > 0 {
            info!(
                path = %self.path.display(),
                restored,
                "access log restored from journal"
            );
        }
        Ok(restored)
    }

    fn truncate_torn_tail(&self, good_len: u64, line_no: usize) -> Result<(), AdapterError> {
        warn!(
            path = %self.path.display(),
            line = line_no,
            keep_bytes = good_len,
            "access log journal ends with a partial line; truncating"
        );
        OpenOptions::new()
            .write(true)
            .open(&self.path)
            .and_then(|f| f.set_len(good_len))
            .map_err(|err| {
                AdapterError::Persistence(format!(
                    "failed to truncate partial tail of '{}': {}",
                    self.path.display(),
                    err
                ))
            })
    }

    /// Writes every queued row as one batch. A failed write is rolled back to the previous
    /// file length so a retry never lands after a fragment.
    fn drain(&self, queue: &mut VecDeque<AccessLogEntry>) -> io::Result<()> {
        if queue.is_empty() {
            return Ok(());
        }
        let mut batch = Vec::new();
        for entry in queue.iter() {
            let line = AccessLogJournalLine {
                schema_version: 1,
                entry: entry.clone(),
            };
            serde_json::to_writer(&mut batch, &line).map_err(io::Error::other)?;
            batch.push(b'\n');
        }
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)?;
        let len_before = file.metadata()?.len();
        if let Err(err) = file.write_all(&batch).and_then(|()| file.sync_data()) {
            if let Err(rollback) = file.set_len(len_before) {
                warn!(
                    path = %self.path.display(),
                    error = %rollback,
                    "access log journal rollback failed; replay will drop the partial tail"
                );
            }
            return Err(err);
        }
        queue.clear();
        Ok(())
    }

    /// Retries rows not yet written. Returns how many are still pending.
    pub fn flush_journal(&self) -> usize {
        let mut queue = self.unjournaled.lock();
        if let Err(err) = self.drain(&mut queue) {
            warn!(
                path = %self.path.display(),
                error = %err,
                backlog = queue.len(),
                "access log journal flush failed"
            );
        }
        queue.len()
    }

    pub fn journal_backlog(&self) -> usize {
        self.unjournaled.lock().len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Ph1jAccessLogRepo for JournaledAccessLog {
    fn append_access_log_row(
        &self,
        input: AccessLogEntryInput,
    ) -> Result<AccessLogEntry, StorageError> {
        let mut queue = self.unjournaled.lock();
        let entry = self.store.append_access_log_row(input)?;
        queue.push_back(entry.clone());
        if let Err(err) = self.drain(&mut queue) {
            warn!(
                path = %self.path.display(),
                error = %err,
                backlog = queue.len(),
                "access log journal write failed; will retry"
            );
        }
        Ok(entry)
    }

    fn access_log_rows(&self) -> Vec<AccessLogEntry> {
        self.store.access_log_rows()
    }
}

// ------------------------
// Environment.
// ------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterEnvConfig {
    pub bind: String,
    pub access_log_path: Option<PathBuf>,
    pub directory_path: Option<PathBuf>,
    pub reconcile_worker_enabled: bool,
    pub reconcile_interval_ms: u64,
    pub audit_retry_interval_ms: u64,
}

impl AdapterEnvConfig {
    pub fn from_env() -> Self {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    pub fn from_env_var_map<F>(mut env_getter: F) -> Self
    where
        F: FnMut(&str) -> Option<String>,
    {
        Self {
            bind: env_getter("PRESENCE_HTTP_BIND")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string()),
            access_log_path: parse_path(env_getter("PRESENCE_ACCESS_LOG_PATH")),
            directory_path: parse_path(env_getter("PRESENCE_DIRECTORY_PATH")),
            reconcile_worker_enabled: parse_enabled_flag(
                env_getter("PRESENCE_RECONCILE_WORKER_ENABLED"),
                true,
            ),
            reconcile_interval_ms: parse_interval_ms(
                env_getter("PRESENCE_RECONCILE_INTERVAL_MS"),
                100,
                600_000,
                60_000,
            ),
            audit_retry_interval_ms: parse_interval_ms(
                env_getter("PRESENCE_AUDIT_RETRY_INTERVAL_MS"),
                100,
                60_000,
                1_000,
            ),
        }
    }
}

fn parse_path(raw: Option<String>) -> Option<PathBuf> {
    raw.map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn parse_enabled_flag(raw: Option<String>, default: bool) -> bool {
    match raw {
        Some(v) => !matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "off" | "no"
        ),
        None => default,
    }
}

fn parse_interval_ms(raw: Option<String>, min: u64, max: u64, default: u64) -> u64 {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| (min..=max).contains(v))
        .unwrap_or(default)
}

fn system_time_now_ns() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(1);
    u64::try_from(nanos).unwrap_or(u64::MAX)
}

fn resolve_now(now_ns: Option<u64>) -> MonotonicTimeNs {
    MonotonicTimeNs(now_ns.unwrap_or_else(system_time_now_ns).max(1))
}

fn parse_context_id(raw: &str) -> Result<ContextId, AdapterError> {
    ContextId::new(raw.trim())
        .map_err(|err| AdapterError::BadRequest(format!("context_id: {err}")))
}

// ------------------------
// Runtime.
// ------------------------

/// HTTP-facing wrapper over the presence runtime. Safe to share across request tasks.
pub struct AdapterRuntime {
    presence: PresenceRuntime,
    store: Arc<PresenceStore>,
    journal: Option<Arc<JournaledAccessLog>>,
}

impl AdapterRuntime {
    pub fn new_in_memory(store: Arc<PresenceStore>) -> Self {
        Self {
            presence: PresenceRuntime::in_memory(PresenceConfig::mvp_v1(), store.clone()),
            store,
            journal: None,
        }
    }

    pub fn new_with_persistence(
        store: Arc<PresenceStore>,
        access_log_path: PathBuf,
    ) -> Result<Self, AdapterError> {
        let journal = Arc::new(JournaledAccessLog::open(store.clone(), access_log_path)?);
        let presence = PresenceRuntime::new(
            PresenceConfig::mvp_v1(),
            store.clone(),
            store.clone(),
            journal.clone(),
        );
        Ok(Self {
            presence,
            store,
            journal: Some(journal),
        })
    }

    pub fn from_env_config(config: &AdapterEnvConfig) -> Result<Self, AdapterError> {
        let store = Arc::new(PresenceStore::new_in_memory());
        if let Some(path) = &config.directory_path {
            DirectorySeed::from_path(path)?.apply(&store, resolve_now(None))?;
        }
        match &config.access_log_path {
            Some(path) => Self::new_with_persistence(store, path.clone()),
            None => Ok(Self::new_in_memory(store)),
        }
    }

    pub fn presence(&self) -> &PresenceRuntime {
        &self.presence
    }

    pub fn run_scan(&self, request: ScanAdapterRequest) -> Result<ScanAdapterResponse, AdapterError> {
        let context_id = parse_context_id(&request.context_id)?;
        let tag_or_id = request.subject_tag_or_id.trim();
        if tag_or_id.is_empty() {
            return Err(AdapterError::BadRequest(
                "subject_tag_or_id must not be empty".to_string(),
            ));
        }
        let receipt = self
            .presence
            .scan(tag_or_id, &context_id, resolve_now(request.now_ns))?;
        Ok(receipt.into())
    }

    pub fn active_sessions(&self, context_id: &str) -> Result<ActiveSessionsResponse, AdapterError> {
        let context_id = parse_context_id(context_id)?;
        let sessions = self.presence.list_active_sessions(&context_id)?;
        Ok(ActiveSessionsResponse {
            status: "ok".to_string(),
            context_id,
            sessions,
        })
    }

    pub fn force_close(
        &self,
        context_id: &str,
        session_id: u64,
        request: AdminClockRequest,
    ) -> Result<ScanAdapterResponse, AdapterError> {
        let context_id = parse_context_id(context_id)?;
        let receipt = self.presence.force_close(
            &context_id,
            PresenceSessionId(session_id),
            resolve_now(request.now_ns),
        )?;
        Ok(receipt.into())
    }

    pub fn upsert_context(
        &self,
        context_id: &str,
        request: ContextUpsertAdapterRequest,
    ) -> Result<ContextSummary, AdapterError> {
        let record = ContextRecord::v1(
            parse_context_id(context_id)?,
            request.kind,
            request.display_name,
            request.capacity,
            request.active,
            request.eligibility_threshold_minutes,
        )?;
        Ok(self
            .presence
            .upsert_context(record, resolve_now(request.now_ns))?)
    }

    pub fn reconcile(
        &self,
        context_id: &str,
        request: AdminClockRequest,
    ) -> Result<OccupancyDrift, AdapterError> {
        let context_id = parse_context_id(context_id)?;
        Ok(self
            .presence
            .reconcile(&context_id, resolve_now(request.now_ns))?)
    }

    pub fn occupancy(&self, context_id: &str) -> Result<OccupancySnapshot, AdapterError> {
        Ok(self.presence.occupancy(&parse_context_id(context_id)?)?)
    }

    pub fn attendance(
        &self,
        context_id: &str,
        subject_id: &str,
    ) -> Result<AttendanceAccumulatorRecord, AdapterError> {
        let context_id = parse_context_id(context_id)?;
        let subject_id = SubjectId::new(subject_id.trim())
            .map_err(|err| AdapterError::BadRequest(format!("subject_id: {err}")))?;
        Ok(self.presence.attendance(&context_id, &subject_id)?)
    }

    pub fn run_reconcile_worker_pass(&self, now_ns: Option<u64>) -> DriftSweepReport {
        self.presence.drift_sweep(resolve_now(now_ns))
    }

    pub fn run_audit_retry_worker_pass(&self) -> AuditFlushReport {
        let report = self.presence.flush_audit();
        if let Some(journal) = &self.journal {
            journal.flush_journal();
        }
        report
    }

    pub fn health_report(&self) -> AdapterHealthResponse {
        let audit = AdapterAuditHealth {
            pending_backlog: self.presence.audit_pending(),
            dropped_total: self.presence.audit_dropped_total(),
            journal_backlog: self
                .journal
                .as_ref()
                .map(|j| j.journal_backlog())
                .unwrap_or(0),
            access_log_len: self.store.access_log_len(),
            chain_intact: self.store.verify_access_log_chain().is_ok(),
        };
        let reason = if !audit.chain_intact {
            Some("access log hash chain broken".to_string())
        } else if audit.pending_backlog > 0 || audit.journal_backlog > 0 {
            Some("access log writes pending retry".to_string())
        } else {
            None
        };
        let outcome = if reason.is_none() { "HEALTHY" } else { "DEGRADED" };
        AdapterHealthResponse {
            status: "ok".to_string(),
            outcome: outcome.to_string(),
            reason,
            contexts: self.store.context_ids().len(),
            audit,
        }
    }
}
