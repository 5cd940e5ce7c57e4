#![forbid(unsafe_code)]

use tracing::{debug, error, info};

use presence_kernel_contracts::ph1j::{AccessLogAction, AccessLogMetadata, AccessReason};
use presence_kernel_contracts::ph1occ::{
    ContextId, ContextRecord, ContextSummary, OccupancyDrift, OccupancySnapshot,
};
use presence_kernel_contracts::MonotonicTimeNs;

use crate::ph1os::{PresenceError, PresenceRuntime};

/// Outcome of one out-of-band drift pass over every context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftSweepReport {
    pub contexts_checked: usize,
    pub reconciled: Vec<OccupancyDrift>,
}

fn drift_metadata(drift: &OccupancyDrift, trigger: &'static str) -> AccessLogMetadata {
    AccessLogMetadata::empty()
        .with("trigger", trigger)
        .with("recorded_count", drift.recorded_count.to_string())
        .with("actual_count", drift.actual_count.to_string())
        .with("missing_refs", drift.missing_refs.len().to_string())
        .with("stale_refs", drift.stale_refs.len().to_string())
}

impl PresenceRuntime {
    /// Admin upsert. Lowering capacity below the live count keeps current occupants; the
    /// gate denies new check-ins until the count drops below the new capacity.
    pub fn upsert_context(
        &self,
        record: ContextRecord,
        now: MonotonicTimeNs,
    ) -> Result<ContextSummary, PresenceError> {
        let context_id = record.context_id.clone();
        self.store.upsert_context(record, now)?;
        let summary = self
            .context_summary(&context_id)
            .ok_or_else(|| PresenceError::unknown_context(&context_id))?;
        if summary.current_count > summary.capacity {
            info!(
                context_id = %context_id.as_str(),
                capacity = summary.capacity,
                current_count = summary.current_count,
                "context capacity lowered below live occupancy"
            );
        }
        Ok(summary)
    }

    pub fn context(&self, context_id: &ContextId) -> Result<ContextRecord, PresenceError> {
        self.reads
            .context_row(context_id)
            .ok_or_else(|| PresenceError::unknown_context(context_id))
    }

    /// Dashboard read, served from the aggregate row.
    pub fn occupancy(&self, context_id: &ContextId) -> Result<OccupancySnapshot, PresenceError> {
        self.reads
            .occupancy_row(context_id)
            .ok_or_else(|| PresenceError::unknown_context(context_id))
    }

    pub fn detect_drift(&self, context_id: &ContextId) -> Result<OccupancyDrift, PresenceError> {
        self.store
            .with_context(context_id, |p| p.occ_detect_drift())
            .ok_or_else(|| PresenceError::unknown_context(context_id))
    }

    /// Rebuilds the aggregate from the sessions table. Always audited as an ANOMALY, even
    /// when nothing had drifted.
    pub fn reconcile(
        &self,
        context_id: &ContextId,
        now: MonotonicTimeNs,
    ) -> Result<OccupancyDrift, PresenceError> {
        self.reconcile_logged(context_id, now, "admin")
    }

    pub(crate) fn reconcile_logged(
        &self,
        context_id: &ContextId,
        now: MonotonicTimeNs,
        trigger: &'static str,
    ) -> Result<OccupancyDrift, PresenceError> {
        self.store
            .with_context(context_id, |p| {
                let drift = p.occ_reconcile_commit(now);
                self.log_reconcile(&drift, now, trigger);
                drift
            })
            .ok_or_else(|| PresenceError::unknown_context(context_id))
    }

    /// Detect, repair and audit under one lock; acts only when drift is found.
    pub fn reconcile_if_drifted(
        &self,
        context_id: &ContextId,
        now: MonotonicTimeNs,
    ) -> Result<Option<OccupancyDrift>, PresenceError> {
        self.store
            .with_context(context_id, |p| {
                if !p.occ_detect_drift().has_drift() {
                    return None;
                }
                let drift = p.occ_reconcile_commit(now);
                self.log_reconcile(&drift, now, "drift_sweep");
                Some(drift)
            })
            .ok_or_else(|| PresenceError::unknown_context(context_id))
    }

    /// One pass of the periodic drift worker.
    pub fn drift_sweep(&self, now: MonotonicTimeNs) -> DriftSweepReport {
        let mut report = DriftSweepReport::default();
        for context_id in self.store.context_ids() {
            report.contexts_checked += 1;
            match self.reconcile_if_drifted(&context_id, now) {
                Ok(Some(drift)) => report.reconciled.push(drift),
                Ok(None) => {}
                Err(err) => {
                    error!(context_id = %context_id.as_str(), error = %err, "drift check failed");
                }
            }
        }
        debug!(
            contexts_checked = report.contexts_checked,
            reconciled = report.reconciled.len(),
            "drift sweep finished"
        );
        report
    }

    /// Called with the partition lock held.
    fn log_reconcile(&self, drift: &OccupancyDrift, now: MonotonicTimeNs, trigger: &'static str) {
        if drift.has_drift() {
            error!(
                context_id = %drift.context_id.as_str(),
                recorded_count = drift.recorded_count,
                actual_count = drift.actual_count,
                missing_refs = drift.missing_refs.len(),
                stale_refs = drift.stale_refs.len(),
                trigger,
                "occupancy aggregate drift repaired"
            );
        } else {
            info!(
                context_id = %drift.context_id.as_str(),
                trigger,
                "occupancy reconcile found no drift"
            );
        }
        self.record_access(
            None,
            &drift.context_id,
            None,
            AccessLogAction::Anomaly,
            Some(AccessReason::AggregateReconciled),
            true,
            now,
            drift_metadata(drift, trigger),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use presence_kernel_contracts::ph1id::{SubjectId, SubjectRecord};
    use presence_kernel_contracts::ph1occ::ContextKind;
    use presence_kernel_contracts::ph1pres::PresenceSessionId;
    use presence_storage::ph1f::PresenceStore;

    use crate::ph1os::PresenceConfig;

    fn ctx(id: &str) -> ContextId {
        ContextId::new(id).unwrap()
    }

    fn runtime_with_contexts(ids: &[&str]) -> PresenceRuntime {
        let store = Arc::new(PresenceStore::new_in_memory());
        store
            .insert_subject(
                SubjectRecord::v1(SubjectId::new("member_1").unwrap(), "Kai", vec![], true)
                    .unwrap(),
            )
            .unwrap();
        for id in ids {
            store
                .upsert_context(
                    ContextRecord::v1(ctx(id), ContextKind::Facility, *id, 4, true, None).unwrap(),
                    MonotonicTimeNs(0),
                )
                .unwrap();
        }
        PresenceRuntime::in_memory(PresenceConfig::mvp_v1(), store)
    }

    fn corrupt(rt: &PresenceRuntime, id: &str) {
        let mut row = rt
            .store()
            .with_context(&ctx(id), |p| p.aggregate().clone())
            .unwrap();
        row.active_session_refs.insert(PresenceSessionId(77));
        row.current_count += 1;
        rt.store().restore_occupancy_row(row).unwrap();
    }

    fn anomalies(rt: &PresenceRuntime) -> usize {
        rt.store()
            .access_log_entries()
            .iter()
            .filter(|e| e.action == AccessLogAction::Anomaly)
            .count()
    }

    #[test]
    fn at_occ_wiring_01_manual_reconcile_is_always_audited() {
        let rt = runtime_with_contexts(&["pool"]);
        let drift = rt.reconcile(&ctx("pool"), MonotonicTimeNs(5)).unwrap();
        assert!(!drift.has_drift());
        let entries = rt.store().access_log_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AccessLogAction::Anomaly);
        assert_eq!(entries[0].reason, Some(AccessReason::AggregateReconciled));
        assert_eq!(entries[0].metadata.get("trigger"), Some("admin"));
    }

    #[test]
    fn at_occ_wiring_02_stale_ref_blocks_admission_until_reconciled() {
        let rt = runtime_with_contexts(&["pool"]);
        corrupt(&rt, "pool");
        let drift = rt.detect_drift(&ctx("pool")).unwrap();
        assert_eq!(drift.stale_refs, vec![PresenceSessionId(77)]);

        let repaired = rt.reconcile(&ctx("pool"), MonotonicTimeNs(6)).unwrap();
        assert_eq!(repaired, drift);
        let snap = rt.occupancy(&ctx("pool")).unwrap();
        assert_eq!(snap.current_count, 0);
        assert!(snap.active_session_ids.is_empty());
    }

    #[test]
    fn at_occ_wiring_03_drift_sweep_touches_only_drifted_contexts() {
        let rt = runtime_with_contexts(&["pool", "sauna", "court"]);
        rt.scan("member_1", &ctx("court"), MonotonicTimeNs(1)).unwrap();
        corrupt(&rt, "sauna");

        let first = rt.drift_sweep(MonotonicTimeNs(10));
        assert_eq!(first.contexts_checked, 3);
        assert_eq!(first.reconciled.len(), 1);
        assert_eq!(first.reconciled[0].context_id, ctx("sauna"));
        assert_eq!(anomalies(&rt), 1);
        assert_eq!(rt.occupancy(&ctx("court")).unwrap().current_count, 1);

        let second = rt.drift_sweep(MonotonicTimeNs(20));
        assert!(second.reconciled.is_empty());
        assert_eq!(anomalies(&rt), 1);
    }

    #[test]
    fn at_occ_wiring_04_unknown_context_reads_are_not_found() {
        let rt = runtime_with_contexts(&["pool"]);
        assert!(matches!(
            rt.occupancy(&ctx("attic")),
            Err(PresenceError::NotFound { what: "context", .. })
        ));
        assert!(rt.reconcile(&ctx("attic"), MonotonicTimeNs(1)).is_err());
        assert!(rt.store().access_log_entries().is_empty());
    }
}
