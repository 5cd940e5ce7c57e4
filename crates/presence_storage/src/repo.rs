#![forbid(unsafe_code)]

use presence_kernel_contracts::ph1att::AttendanceAccumulatorRecord;
use presence_kernel_contracts::ph1id::SubjectId;
use presence_kernel_contracts::ph1j::{AccessLogEntry, AccessLogEntryInput};
use presence_kernel_contracts::ph1occ::{ContextId, ContextRecord, OccupancySnapshot};
use presence_kernel_contracts::ph1pres::PresenceSessionRecord;

use crate::ph1f::{PresenceStore, StorageError};
use crate::ph1j::Ph1jRuntime;

/// Typed repository interface for PH1.J append-only access-log persistence.
pub trait Ph1jAccessLogRepo: Send + Sync {
    fn append_access_log_row(
        &self,
        input: AccessLogEntryInput,
    ) -> Result<AccessLogEntry, StorageError>;
    fn access_log_rows(&self) -> Vec<AccessLogEntry>;

    fn access_log_rows_by_context(&self, context_id: &ContextId) -> Vec<AccessLogEntry> {
        self.access_log_rows()
            .into_iter()
            .filter(|e| &e.context_id == context_id)
            .collect()
    }
}

/// Typed read interface for PH1.OCC / PH1.PRES / PH1.ATT tables, as consumed by
/// dashboards and admin views.
pub trait Ph1PresenceReadRepo: Send + Sync {
    fn context_row(&self, context_id: &ContextId) -> Option<ContextRecord>;
    fn occupancy_row(&self, context_id: &ContextId) -> Option<OccupancySnapshot>;
    fn active_session_rows_for_context(
        &self,
        context_id: &ContextId,
    ) -> Option<Vec<PresenceSessionRecord>>;
    fn attendance_row_for(
        &self,
        context_id: &ContextId,
        subject_id: &SubjectId,
    ) -> Option<AttendanceAccumulatorRecord>;
}

impl Ph1jAccessLogRepo for PresenceStore {
    fn append_access_log_row(
        &self,
        input: AccessLogEntryInput,
    ) -> Result<AccessLogEntry, StorageError> {
        Ph1jRuntime::emit(self, input)
    }

    fn access_log_rows(&self) -> Vec<AccessLogEntry> {
        self.access_log_entries()
    }
}

impl Ph1PresenceReadRepo for PresenceStore {
    fn context_row(&self, context_id: &ContextId) -> Option<ContextRecord> {
        self.get_context(context_id)
    }

    fn occupancy_row(&self, context_id: &ContextId) -> Option<OccupancySnapshot> {
        self.occupancy_snapshot(context_id)
    }

    fn active_session_rows_for_context(
        &self,
        context_id: &ContextId,
    ) -> Option<Vec<PresenceSessionRecord>> {
        self.active_session_rows(context_id)
    }

    fn attendance_row_for(
        &self,
        context_id: &ContextId,
        subject_id: &SubjectId,
    ) -> Option<AttendanceAccumulatorRecord> {
        self.attendance_row(context_id, subject_id)
    }
}
