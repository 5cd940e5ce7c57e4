#![forbid(unsafe_code)]

use presence_kernel_contracts::ph1att::AttendanceAccumulatorRecord;
use presence_kernel_contracts::ph1id::SubjectId;
use presence_kernel_contracts::ph1occ::ContextId;

use crate::ph1os::{PresenceError, PresenceRuntime};

impl PresenceRuntime {
    /// Attendance total and eligibility latch for one (subject, context) pair. Only
    /// subjects with at least one closed session have a row.
    pub fn attendance(
        &self,
        context_id: &ContextId,
        subject_id: &SubjectId,
    ) -> Result<AttendanceAccumulatorRecord, PresenceError> {
        if self.reads.context_row(context_id).is_none() {
            return Err(PresenceError::unknown_context(context_id));
        }
        self.reads
            .attendance_row_for(context_id, subject_id)
            .ok_or_else(|| PresenceError::NotFound {
                what: "attendance_accumulator",
                key: format!("{}/{}", context_id.as_str(), subject_id.as_str()),
            })
    }
}
