#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use presence_kernel_contracts::ph1att::AttendanceAccumulatorRecord;
use presence_kernel_contracts::ph1id::{IdentityResolution, SubjectId, SubjectRecord, TagId};
use presence_kernel_contracts::ph1j::{AccessLogEntry, AccessLogEntryInput};
use presence_kernel_contracts::ph1occ::{
    ContextId, ContextRecord, OccupancyAggregateRecord, OccupancyDrift, OccupancySnapshot,
    PH1OCC_CONTRACT_VERSION,
};
use presence_kernel_contracts::ph1pres::{PresenceSessionId, PresenceSessionRecord};
use presence_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};

use crate::ph1j::AccessLogLedger;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("foreign key violation on {table}: {key}")]
    ForeignKeyViolation { table: &'static str, key: String },
    #[error("duplicate key on {table}: {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("{table} is append-only")]
    AppendOnlyViolation { table: &'static str },
    #[error("no row in {table} for {key}")]
    NotFound { table: &'static str, key: String },
    #[error("conflict on {table} ({key}): {reason}")]
    Conflict {
        table: &'static str,
        key: String,
        reason: &'static str,
    },
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
}

/// All rows owned by one context: its definition, its occupancy aggregate, its sessions and
/// the attendance accumulators of subjects who visited it.
///
/// A `ContextPartition` is only reachable through its mutex, so holding `&mut` to it is the
/// transaction boundary for everything touching this context's counter.
#[derive(Debug, Clone)]
pub struct ContextPartition {
    context: ContextRecord,
    aggregate: OccupancyAggregateRecord,
    sessions: BTreeMap<PresenceSessionId, PresenceSessionRecord>,
    // Unique index: at most one ACTIVE session per subject in this context.
    active_session_by_subject: BTreeMap<SubjectId, PresenceSessionId>,
    attendance: BTreeMap<SubjectId, AttendanceAccumulatorRecord>,
}

impl ContextPartition {
    fn new(context: ContextRecord, now: MonotonicTimeNs) -> Self {
        let aggregate =
            OccupancyAggregateRecord::empty_v1(context.context_id.clone(), context.capacity, now);
        Self {
            context,
            aggregate,
            sessions: BTreeMap::new(),
            active_session_by_subject: BTreeMap::new(),
            attendance: BTreeMap::new(),
        }
    }

    pub fn context(&self) -> &ContextRecord {
        &self.context
    }

    pub fn aggregate(&self) -> &OccupancyAggregateRecord {
        &self.aggregate
    }

    pub fn session(&self, session_id: PresenceSessionId) -> Option<&PresenceSessionRecord> {
        self.sessions.get(&session_id)
    }

    pub fn session_rows(&self) -> &BTreeMap<PresenceSessionId, PresenceSessionRecord> {
        &self.sessions
    }

    /// ACTIVE session for `subject_id`, read from the sessions table.
    pub fn active_session_for(&self, subject_id: &SubjectId) -> Option<&PresenceSessionRecord> {
        self.active_session_by_subject
            .get(subject_id)
            .and_then(|id| self.sessions.get(id))
            .filter(|s| s.is_active())
    }

    pub fn active_sessions(&self) -> Vec<&PresenceSessionRecord> {
        self.sessions.values().filter(|s| s.is_active()).collect()
    }

    pub fn attendance_row(&self, subject_id: &SubjectId) -> Option<&AttendanceAccumulatorRecord> {
        self.attendance.get(subject_id)
    }

    pub fn attendance_row_or_empty(
        &self,
        subject_id: &SubjectId,
        threshold_minutes: Option<u32>,
        now: MonotonicTimeNs,
    ) -> AttendanceAccumulatorRecord {
        self.attendance.get(subject_id).cloned().unwrap_or_else(|| {
            AttendanceAccumulatorRecord::empty_v1(
                subject_id.clone(),
                self.context.context_id.clone(),
                threshold_minutes,
                now,
            )
        })
    }

    fn update_context(&mut self, record: ContextRecord, now: MonotonicTimeNs) {
        self.aggregate.capacity = record.capacity;
        self.aggregate.last_updated = now;
        self.context = record;
    }

    // ------------------------
    // PH1.OCC aggregate mutations. Each is called exactly once per session transition,
    // from inside the commit that performs that transition.
    // ------------------------

    fn occ_increment_for_check_in(
        &mut self,
        session_id: PresenceSessionId,
        now: MonotonicTimeNs,
    ) -> Result<(), StorageError> {
        if self.aggregate.active_session_refs.contains(&session_id) {
            return Err(StorageError::Conflict {
                table: "occupancy_aggregates.active_session_refs",
                key: session_id.0.to_string(),
                reason: "session already referenced",
            });
        }
        if self.aggregate.current_count >= self.context.capacity {
            return Err(StorageError::Conflict {
                table: "occupancy_aggregates.current_count",
                key: self.context.context_id.as_str().to_string(),
                reason: "increment would exceed capacity",
            });
        }
        if !self.aggregate.is_self_consistent() {
            return Err(StorageError::Conflict {
                table: "occupancy_aggregates.current_count",
                key: self.context.context_id.as_str().to_string(),
                reason: "current_count does not match active_session_refs",
            });
        }
        self.aggregate.active_session_refs.insert(session_id);
        self.aggregate.current_count += 1;
        self.aggregate.last_updated = now;
        Ok(())
    }

    fn occ_decrement_for_check_out(
        &mut self,
        session_id: PresenceSessionId,
        now: MonotonicTimeNs,
    ) -> Result<(), StorageError> {
        if !self.aggregate.active_session_refs.contains(&session_id)
            || self.aggregate.current_count == 0
            || !self.aggregate.is_self_consistent()
        {
            return Err(StorageError::Conflict {
                table: "occupancy_aggregates.active_session_refs",
                key: session_id.0.to_string(),
                reason: "closing session is not referenced by the aggregate",
            });
        }
        self.aggregate.active_session_refs.remove(&session_id);
        self.aggregate.current_count -= 1;
        self.aggregate.last_updated = now;
        Ok(())
    }

    // ------------------------
    // PH1.PRES session commits.
    // ------------------------

    /// Opens a session and increments the aggregate as one unit. Nothing is written unless
    /// every check passes.
    pub fn pres_check_in_commit(
        &mut self,
        session_id: PresenceSessionId,
        subject_id: SubjectId,
        now: MonotonicTimeNs,
    ) -> Result<PresenceSessionRecord, StorageError> {
        if self.active_session_for(&subject_id).is_some() {
            return Err(StorageError::DuplicateKey {
                table: "presence_sessions.active_subject",
                key: subject_id.as_str().to_string(),
            });
        }
        if self.sessions.contains_key(&session_id) {
            return Err(StorageError::DuplicateKey {
                table: "presence_sessions",
                key: session_id.0.to_string(),
            });
        }
        let record = PresenceSessionRecord::open_v1(
            session_id,
            subject_id.clone(),
            self.context.context_id.clone(),
            self.context.kind,
            now,
        )?;

        self.occ_increment_for_check_in(session_id, now)?;
        self.active_session_by_subject.insert(subject_id, session_id);
        self.sessions.insert(session_id, record.clone());
        Ok(record)
    }

    /// Closes an ACTIVE session, decrements the aggregate, and stores the accumulator row
    /// computed for this close. Nothing is written unless every check passes.
    pub fn pres_close_commit(
        &mut self,
        closed: PresenceSessionRecord,
        accumulator: AttendanceAccumulatorRecord,
    ) -> Result<(), StorageError> {
        closed.validate()?;
        accumulator.validate()?;
        let Some(existing) = self.sessions.get(&closed.session_id) else {
            return Err(StorageError::NotFound {
                table: "presence_sessions",
                key: closed.session_id.0.to_string(),
            });
        };
        if !existing.is_active() {
            return Err(StorageError::Conflict {
                table: "presence_sessions.status",
                key: closed.session_id.0.to_string(),
                reason: "session already closed",
            });
        }
        if closed.is_active()
            || existing.subject_id != closed.subject_id
            || existing.context_id != closed.context_id
            || existing.started_at != closed.started_at
        {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "presence_sessions.closed",
                    reason: "must be the CLOSED form of the stored ACTIVE session",
                },
            ));
        }
        let Some(ended_at) = closed.ended_at else {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "presence_sessions.ended_at",
                    reason: "must be set when CLOSED",
                },
            ));
        };
        if accumulator.subject_id != closed.subject_id
            || accumulator.context_id != self.context.context_id
        {
            return Err(StorageError::ForeignKeyViolation {
                table: "attendance_accumulators.subject_id",
                key: accumulator.subject_id.as_str().to_string(),
            });
        }
        let previous_total = self
            .attendance
            .get(&closed.subject_id)
            .map(|r| r.total_duration_minutes)
            .unwrap_or(0);
        let previous_eligible = self
            .attendance
            .get(&closed.subject_id)
            .map(|r| r.is_eligible)
            .unwrap_or(false);
        let duration = u64::from(closed.duration_minutes.unwrap_or(0));
        if accumulator.total_duration_minutes != previous_total.saturating_add(duration) {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "attendance_accumulators.total_duration_minutes",
                    reason: "must equal previous total + closed session duration",
                },
            ));
        }
        if previous_eligible && !accumulator.is_eligible {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "attendance_accumulators.is_eligible",
                    reason: "eligibility latch cannot be cleared",
                },
            ));
        }

        self.occ_decrement_for_check_out(closed.session_id, ended_at)?;
        self.active_session_by_subject.remove(&closed.subject_id);
        self.attendance
            .insert(accumulator.subject_id.clone(), accumulator);
        self.sessions.insert(closed.session_id, closed);
        Ok(())
    }

    // ------------------------
    // PH1.OCC reconcile. The sessions table is the source of truth.
    // ------------------------

    fn actual_active_refs(&self) -> BTreeSet<PresenceSessionId> {
        self.sessions
            .values()
            .filter(|s| s.is_active())
            .map(|s| s.session_id)
            .collect()
    }

    /// Read-only comparison of the aggregate row against the sessions table.
    pub fn occ_detect_drift(&self) -> OccupancyDrift {
        let actual = self.actual_active_refs();
        OccupancyDrift {
            context_id: self.context.context_id.clone(),
            recorded_count: self.aggregate.current_count,
            actual_count: actual.len() as u32,
            missing_refs: actual
                .difference(&self.aggregate.active_session_refs)
                .copied()
                .collect(),
            stale_refs: self
                .aggregate
                .active_session_refs
                .difference(&actual)
                .copied()
                .collect(),
        }
    }

    /// Rebuilds the aggregate row and the active-subject index from the sessions table.
    /// Returns the drift that existed before the rebuild.
    pub fn occ_reconcile_commit(&mut self, now: MonotonicTimeNs) -> OccupancyDrift {
        let drift = self.occ_detect_drift();
        let refs = self.actual_active_refs();
        self.active_session_by_subject = self
            .sessions
            .values()
            .filter(|s| s.is_active())
            .map(|s| (s.subject_id.clone(), s.session_id))
            .collect();
        self.aggregate = OccupancyAggregateRecord {
            schema_version: PH1OCC_CONTRACT_VERSION,
            context_id: self.context.context_id.clone(),
            capacity: self.context.capacity,
            current_count: refs.len() as u32,
            active_session_refs: refs,
            last_updated: now,
        };
        drift
    }
}

#[derive(Debug, Default)]
struct SubjectDirectory {
    subjects: BTreeMap<SubjectId, SubjectRecord>,
    by_tag: BTreeMap<TagId, SubjectId>,
}

/// In-memory presence store.
///
/// Rows are partitioned by context. Each partition has its own lock, so scans against
/// different contexts never contend; the partition map itself is only write-locked to add
/// a context.
#[derive(Debug)]
pub struct PresenceStore {
    partitions: RwLock<BTreeMap<ContextId, Arc<Mutex<ContextPartition>>>>,
    directory: RwLock<SubjectDirectory>,
    next_session_id: AtomicU64,
    access_log: Mutex<AccessLogLedger>,
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

impl PresenceStore {
    pub fn new_in_memory() -> Self {
        Self {
            partitions: RwLock::new(BTreeMap::new()),
            directory: RwLock::new(SubjectDirectory::default()),
            next_session_id: AtomicU64::new(1),
            access_log: Mutex::new(AccessLogLedger::new()),
        }
    }

    // ------------------------
    // Subjects (identity directory snapshot).
    // ------------------------

    pub fn insert_subject(&self, record: SubjectRecord) -> Result<(), StorageError> {
        record.validate()?;
        let mut dir = self.directory.write();
        if dir.subjects.contains_key(&record.subject_id) {
            return Err(StorageError::DuplicateKey {
                table: "subjects",
                key: record.subject_id.as_str().to_string(),
            });
        }
        for tag in &record.tag_ids {
            if dir.by_tag.contains_key(tag) {
                return Err(StorageError::DuplicateKey {
                    table: "subjects.tag_ids",
                    key: tag.as_str().to_string(),
                });
            }
        }
        for tag in &record.tag_ids {
            dir.by_tag.insert(tag.clone(), record.subject_id.clone());
        }
        dir.subjects.insert(record.subject_id.clone(), record);
        Ok(())
    }

    pub fn set_subject_active(&self, subject_id: &SubjectId, active: bool) -> Result<(), StorageError> {
        let mut dir = self.directory.write();
        let Some(rec) = dir.subjects.get_mut(subject_id) else {
            return Err(StorageError::NotFound {
                table: "subjects",
                key: subject_id.as_str().to_string(),
            });
        };
        rec.active = active;
        Ok(())
    }

    pub fn get_subject(&self, subject_id: &SubjectId) -> Option<SubjectRecord> {
        self.directory.read().subjects.get(subject_id).cloned()
    }

    /// Looks up a tag first, then a subject id. Disabled subjects resolve to `NotFound`.
    pub fn resolve_identifier(&self, tag_or_id: &str) -> IdentityResolution {
        let dir = self.directory.read();
        let by_tag = TagId::new(tag_or_id)
            .ok()
            .and_then(|tag| dir.by_tag.get(&tag).cloned());
        let subject_id = match by_tag {
            Some(id) => Some(id),
            None => SubjectId::new(tag_or_id).ok(),
        };
        match subject_id.and_then(|id| dir.subjects.get(&id)) {
            Some(rec) if rec.active => IdentityResolution::Resolved(rec.clone()),
            _ => IdentityResolution::NotFound,
        }
    }

    // ------------------------
    // Contexts.
    // ------------------------

    /// Inserts or updates a context definition. Lowering capacity below the live count is
    /// allowed; the gate then denies until occupancy drops below it.
    pub fn upsert_context(
        &self,
        record: ContextRecord,
        now: MonotonicTimeNs,
    ) -> Result<(), StorageError> {
        record.validate()?;
        if let Some(partition) = self.context_partition(&record.context_id) {
            let mut p = partition.lock();
            if p.context.kind != record.kind && !p.sessions.is_empty() {
                return Err(StorageError::Conflict {
                    table: "contexts.kind",
                    key: record.context_id.as_str().to_string(),
                    reason: "kind is immutable once sessions exist",
                });
            }
            p.update_context(record, now);
            return Ok(());
        }
        let mut partitions = self.partitions.write();
        match partitions.get(&record.context_id) {
            // Lost a race with another insert; apply as an update.
            Some(existing) => existing.lock().update_context(record, now),
            None => {
                partitions.insert(
                    record.context_id.clone(),
                    Arc::new(Mutex::new(ContextPartition::new(record, now))),
                );
            }
        }
        Ok(())
    }

    pub fn get_context(&self, context_id: &ContextId) -> Option<ContextRecord> {
        self.context_partition(context_id)
            .map(|p| p.lock().context.clone())
    }

    pub fn context_ids(&self) -> Vec<ContextId> {
        self.partitions.read().keys().cloned().collect()
    }

    pub fn context_partition(&self, context_id: &ContextId) -> Option<Arc<Mutex<ContextPartition>>> {
        self.partitions.read().get(context_id).cloned()
    }

    /// Runs `f` with exclusive access to one context's rows. The partition map lock is
    /// released before `f` runs.
    pub fn with_context<R>(
        &self,
        context_id: &ContextId,
        f: impl FnOnce(&mut ContextPartition) -> R,
    ) -> Option<R> {
        let partition = self.context_partition(context_id)?;
        let mut guard = partition.lock();
        Some(f(&mut guard))
    }

    pub fn allocate_session_id(&self) -> PresenceSessionId {
        PresenceSessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed))
    }

    // ------------------------
    // Reads for dashboards and admin views; served from the aggregate, never recomputed.
    // ------------------------

    pub fn occupancy_snapshot(&self, context_id: &ContextId) -> Option<OccupancySnapshot> {
        self.with_context(context_id, |p| OccupancySnapshot::from(&p.aggregate))
    }

    pub fn active_session_rows(&self, context_id: &ContextId) -> Option<Vec<PresenceSessionRecord>> {
        self.with_context(context_id, |p| {
            p.aggregate
                .active_session_refs
                .iter()
                .filter_map(|id| p.sessions.get(id).cloned())
                .collect()
        })
    }

    pub fn attendance_row(
        &self,
        context_id: &ContextId,
        subject_id: &SubjectId,
    ) -> Option<AttendanceAccumulatorRecord> {
        self.with_context(context_id, |p| p.attendance.get(subject_id).cloned())
            .flatten()
    }

    /// Loads an aggregate row from a persisted snapshot as-is. The row is not checked
    /// against the sessions table; run reconcile afterwards.
    pub fn restore_occupancy_row(&self, row: OccupancyAggregateRecord) -> Result<(), StorageError> {
        let Some(partition) = self.context_partition(&row.context_id) else {
            return Err(StorageError::ForeignKeyViolation {
                table: "occupancy_aggregates.context_id",
                key: row.context_id.as_str().to_string(),
            });
        };
        partition.lock().aggregate = row;
        Ok(())
    }

    // ------------------------
    // PH1.J access log (append-only). Takes no partition lock; callers may hold one.
    // ------------------------

    pub(crate) fn append_access_log_entry(
        &self,
        input: AccessLogEntryInput,
    ) -> Result<AccessLogEntry, StorageError> {
        self.access_log.lock().append(input)
    }

    pub fn restore_access_log_entry(&self, entry: AccessLogEntry) -> Result<(), StorageError> {
        self.access_log.lock().restore(entry)
    }

    pub fn access_log_entries(&self) -> Vec<AccessLogEntry> {
        self.access_log.lock().entries().to_vec()
    }

    pub fn access_log_len(&self) -> usize {
        self.access_log.lock().entries().len()
    }

    pub fn verify_access_log_chain(&self) -> Result<(), StorageError> {
        self.access_log.lock().verify_chain()
    }

    pub fn attempt_overwrite_access_log_entry(
        &self,
        _event_id: presence_kernel_contracts::ph1j::AccessLogEventId,
    ) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "access_log",
        })
    }
}
