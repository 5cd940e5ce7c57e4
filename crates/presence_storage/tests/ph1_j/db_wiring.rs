#![forbid(unsafe_code)]

use presence_kernel_contracts::ph1id::SubjectId;
use presence_kernel_contracts::ph1j::{
    AccessLogAction, AccessLogEntryInput, AccessLogEventId, AccessLogMetadata, AccessReason,
};
use presence_kernel_contracts::ph1occ::ContextId;
use presence_kernel_contracts::ph1pres::PresenceSessionId;
use presence_kernel_contracts::MonotonicTimeNs;
use presence_storage::ph1f::{PresenceStore, StorageError};
use presence_storage::ph1j::ACCESS_LOG_GENESIS_HASH;
use presence_storage::repo::Ph1jAccessLogRepo;

fn ctx(id: &str) -> ContextId {
    ContextId::new(id).unwrap()
}

fn check_in_row(context: &str, session: u64, ts: u64) -> AccessLogEntryInput {
    AccessLogEntryInput::v1(
        Some(SubjectId::new("dbw_j_member").unwrap()),
        ctx(context),
        Some(PresenceSessionId(session)),
        AccessLogAction::CheckIn,
        None,
        true,
        MonotonicTimeNs(ts),
        AccessLogMetadata::empty(),
    )
    .unwrap()
}

fn denied_row(context: &str, ts: u64) -> AccessLogEntryInput {
    AccessLogEntryInput::v1(
        None,
        ctx(context),
        None,
        AccessLogAction::Denied,
        Some(AccessReason::UnknownIdentifier),
        false,
        MonotonicTimeNs(ts),
        AccessLogMetadata::empty().with("identifier", "rfid_zz"),
    )
    .unwrap()
}

#[test]
fn at_j_db_01_rows_append_in_order_with_chained_hashes() {
    let s = PresenceStore::new_in_memory();
    let a = s.append_access_log_row(check_in_row("gym", 1, 10)).unwrap();
    let b = s.append_access_log_row(denied_row("gym", 11)).unwrap();

    assert_eq!(a.event_id, AccessLogEventId(1));
    assert_eq!(b.event_id, AccessLogEventId(2));
    assert_eq!(a.prev_hash, ACCESS_LOG_GENESIS_HASH);
    assert_eq!(b.prev_hash, a.entry_hash);
    assert_eq!(s.access_log_len(), 2);
    assert!(s.verify_access_log_chain().is_ok());
}

#[test]
fn at_j_db_02_overwrite_is_refused() {
    let s = PresenceStore::new_in_memory();
    let a = s.append_access_log_row(check_in_row("gym", 1, 10)).unwrap();
    assert!(matches!(
        s.attempt_overwrite_access_log_entry(a.event_id),
        Err(StorageError::AppendOnlyViolation {
            table: "access_log"
        })
    ));
    assert_eq!(s.access_log_rows(), vec![a]);
}

#[test]
fn at_j_db_03_rows_filter_by_context() {
    let s = PresenceStore::new_in_memory();
    s.append_access_log_row(check_in_row("gym", 1, 10)).unwrap();
    s.append_access_log_row(denied_row("hall", 11)).unwrap();
    s.append_access_log_row(check_in_row("gym", 2, 12)).unwrap();

    let gym = s.access_log_rows_by_context(&ctx("gym"));
    assert_eq!(gym.len(), 2);
    assert!(gym.iter().all(|e| e.context_id == ctx("gym")));
    let hall = s.access_log_rows_by_context(&ctx("hall"));
    assert_eq!(hall.len(), 1);
    assert_eq!(hall[0].reason, Some(AccessReason::UnknownIdentifier));
    assert_eq!(hall[0].metadata.get("identifier"), Some("rfid_zz"));
}

#[test]
fn at_j_db_04_denied_row_without_reason_never_reaches_the_ledger() {
    let out = AccessLogEntryInput::v1(
        None,
        ctx("gym"),
        None,
        AccessLogAction::Denied,
        None,
        false,
        MonotonicTimeNs(1),
        AccessLogMetadata::empty(),
    );
    assert!(out.is_err());
}
