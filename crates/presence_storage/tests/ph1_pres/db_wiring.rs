#![forbid(unsafe_code)]

use presence_kernel_contracts::ph1att::AttendanceAccumulatorRecord;
use presence_kernel_contracts::ph1id::{IdentityResolution, SubjectId, SubjectRecord, TagId};
use presence_kernel_contracts::ph1occ::{ContextId, ContextKind, ContextRecord};
use presence_kernel_contracts::ph1pres::{PresenceSessionId, SessionCloseReason};
use presence_kernel_contracts::MonotonicTimeNs;
use presence_storage::ph1f::{PresenceStore, StorageError};
use presence_storage::repo::Ph1PresenceReadRepo;

fn ctx() -> ContextId {
    ContextId::new("dbw_pres_lab").unwrap()
}

fn subject(id: &str) -> SubjectId {
    SubjectId::new(id).unwrap()
}

fn store_with_context(capacity: u32) -> PresenceStore {
    let s = PresenceStore::new_in_memory();
    s.upsert_context(
        ContextRecord::v1(ctx(), ContextKind::Facility, "Lab", capacity, true, None).unwrap(),
        MonotonicTimeNs(1),
    )
    .unwrap();
    s
}

fn check_in(s: &PresenceStore, who: &str, now: u64) -> PresenceSessionId {
    let id = s.allocate_session_id();
    s.with_context(&ctx(), |p| {
        p.pres_check_in_commit(id, subject(who), MonotonicTimeNs(now))
    })
    .unwrap()
    .unwrap();
    id
}

fn close(s: &PresenceStore, who: &str, now: u64) -> Result<(), StorageError> {
    s.with_context(&ctx(), |p| {
        let active = p.active_session_for(&subject(who)).cloned().unwrap();
        let closed = active
            .closed(MonotonicTimeNs(now), SessionCloseReason::CheckOut)
            .unwrap();
        let mut acc: AttendanceAccumulatorRecord =
            p.attendance_row_or_empty(&subject(who), None, MonotonicTimeNs(now));
        acc.total_duration_minutes += u64::from(closed.duration_minutes.unwrap());
        acc.closed_session_count += 1;
        p.pres_close_commit(closed, acc)
    })
    .unwrap()
}

#[test]
fn at_pres_db_01_check_in_updates_session_and_aggregate_together() {
    let s = store_with_context(3);
    let id = check_in(&s, "m1", 10);

    let snap = s.occupancy_row(&ctx()).unwrap();
    assert_eq!(snap.current_count, 1);
    assert_eq!(snap.active_session_ids, vec![id]);
    let rows = s.active_session_rows_for_context(&ctx()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].subject_id, subject("m1"));
}

#[test]
fn at_pres_db_02_second_active_session_for_subject_rejected() {
    let s = store_with_context(3);
    check_in(&s, "m1", 10);
    let id = s.allocate_session_id();
    let out = s
        .with_context(&ctx(), |p| {
            p.pres_check_in_commit(id, subject("m1"), MonotonicTimeNs(11))
        })
        .unwrap();
    assert!(matches!(out, Err(StorageError::DuplicateKey { .. })));
    assert_eq!(s.occupancy_row(&ctx()).unwrap().current_count, 1);
}

#[test]
fn at_pres_db_03_increment_past_capacity_is_a_conflict_and_writes_nothing() {
    let s = store_with_context(1);
    check_in(&s, "m1", 10);
    let id = s.allocate_session_id();
    let out = s
        .with_context(&ctx(), |p| {
            p.pres_check_in_commit(id, subject("m2"), MonotonicTimeNs(11))
        })
        .unwrap();
    assert!(matches!(out, Err(StorageError::Conflict { .. })));
    s.with_context(&ctx(), |p| {
        assert!(p.session(id).is_none());
        assert!(p.active_session_for(&subject("m2")).is_none());
        assert_eq!(p.aggregate().current_count, 1);
    });
}

#[test]
fn at_pres_db_04_close_decrements_and_stores_accumulator() {
    let s = store_with_context(2);
    check_in(&s, "m1", 0);
    close(&s, "m1", MonotonicTimeNs(0).plus_minutes(45).0).unwrap();

    assert_eq!(s.occupancy_row(&ctx()).unwrap().current_count, 0);
    let acc = s.attendance_row_for(&ctx(), &subject("m1")).unwrap();
    assert_eq!(acc.total_duration_minutes, 45);
}

#[test]
fn at_pres_db_05_accumulator_total_mismatch_rejected_without_side_effects() {
    let s = store_with_context(2);
    check_in(&s, "m1", 0);
    let out = s
        .with_context(&ctx(), |p| {
            let active = p.active_session_for(&subject("m1")).cloned().unwrap();
            let closed = active
                .closed(MonotonicTimeNs(0).plus_minutes(10), SessionCloseReason::CheckOut)
                .unwrap();
            let mut acc = p.attendance_row_or_empty(&subject("m1"), None, MonotonicTimeNs(1));
            acc.total_duration_minutes = 11;
            p.pres_close_commit(closed, acc)
        })
        .unwrap();
    assert!(matches!(out, Err(StorageError::ContractViolation(_))));
    assert_eq!(s.occupancy_row(&ctx()).unwrap().current_count, 1);
    s.with_context(&ctx(), |p| {
        assert!(p.active_session_for(&subject("m1")).is_some());
    });
}

#[test]
fn at_pres_db_06_reconcile_repairs_restored_drift() {
    let s = store_with_context(5);
    let a = check_in(&s, "m1", 10);
    let b = check_in(&s, "m2", 11);

    let mut corrupted = s.with_context(&ctx(), |p| p.aggregate().clone()).unwrap();
    corrupted.active_session_refs.remove(&b);
    corrupted.active_session_refs.insert(PresenceSessionId(999));
    corrupted.current_count = 4;
    s.restore_occupancy_row(corrupted).unwrap();

    let drift = s.with_context(&ctx(), |p| p.occ_detect_drift()).unwrap();
    assert!(drift.has_drift());
    assert_eq!(drift.recorded_count, 4);
    assert_eq!(drift.actual_count, 2);
    assert_eq!(drift.missing_refs, vec![b]);
    assert_eq!(drift.stale_refs, vec![PresenceSessionId(999)]);

    let repaired = s
        .with_context(&ctx(), |p| p.occ_reconcile_commit(MonotonicTimeNs(20)))
        .unwrap();
    assert_eq!(repaired, drift);
    let snap = s.occupancy_row(&ctx()).unwrap();
    assert_eq!(snap.current_count, 2);
    assert_eq!(snap.active_session_ids, vec![a, b]);
    assert!(!s.with_context(&ctx(), |p| p.occ_detect_drift()).unwrap().has_drift());
}

#[test]
fn at_pres_db_07_capacity_change_is_reflected_in_aggregate() {
    let s = store_with_context(5);
    check_in(&s, "m1", 10);
    check_in(&s, "m2", 11);
    s.upsert_context(
        ContextRecord::v1(ctx(), ContextKind::Facility, "Lab", 1, true, None).unwrap(),
        MonotonicTimeNs(12),
    )
    .unwrap();
    let snap = s.occupancy_row(&ctx()).unwrap();
    assert_eq!(snap.capacity, 1);
    assert_eq!(snap.current_count, 2);
}

#[test]
fn at_pres_db_08_context_kind_is_immutable_once_used() {
    let s = store_with_context(5);
    check_in(&s, "m1", 10);
    let out = s.upsert_context(
        ContextRecord::v1(ctx(), ContextKind::Event, "Lab", 5, true, Some(30)).unwrap(),
        MonotonicTimeNs(12),
    );
    assert!(matches!(out, Err(StorageError::Conflict { .. })));
}

#[test]
fn at_pres_db_09_identifier_resolution_prefers_tags_and_skips_disabled() {
    let s = PresenceStore::new_in_memory();
    s.insert_subject(
        SubjectRecord::v1(
            subject("m1"),
            "Ada",
            vec![TagId::new("rfid_0xA1").unwrap()],
            true,
        )
        .unwrap(),
    )
    .unwrap();

    assert!(matches!(
        s.resolve_identifier("rfid_0xA1"),
        IdentityResolution::Resolved(r) if r.subject_id == subject("m1")
    ));
    assert!(matches!(
        s.resolve_identifier("m1"),
        IdentityResolution::Resolved(_)
    ));
    assert_eq!(s.resolve_identifier("rfid_0xFF"), IdentityResolution::NotFound);

    s.set_subject_active(&subject("m1"), false).unwrap();
    assert_eq!(s.resolve_identifier("rfid_0xA1"), IdentityResolution::NotFound);
}

#[test]
fn at_pres_db_10_duplicate_tag_rejected() {
    let s = PresenceStore::new_in_memory();
    let tag = TagId::new("rfid_shared").unwrap();
    s.insert_subject(SubjectRecord::v1(subject("m1"), "Ada", vec![tag.clone()], true).unwrap())
        .unwrap();
    let out =
        s.insert_subject(SubjectRecord::v1(subject("m2"), "Grace", vec![tag], true).unwrap());
    assert!(matches!(out, Err(StorageError::DuplicateKey { .. })));
    assert!(s.get_subject(&subject("m2")).is_none());
}
