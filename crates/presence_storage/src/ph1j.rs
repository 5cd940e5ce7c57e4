#![forbid(unsafe_code)]

use presence_kernel_contracts::ph1j::{AccessLogEntry, AccessLogEntryInput, AccessLogEventId};
use presence_kernel_contracts::Validate;
use sha2::{Digest, Sha256};

use crate::ph1f::{PresenceStore, StorageError};

pub const ACCESS_LOG_GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

fn chain_hash(prev_hash: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(b"\n");
    hasher.update(content.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Append-only access-log ledger. Every row carries the hash of its predecessor.
#[derive(Debug, Clone)]
pub struct AccessLogLedger {
    entries: Vec<AccessLogEntry>,
    next_event_id: u64,
}

impl Default for AccessLogLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessLogLedger {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_event_id: 1,
        }
    }

    pub fn append(&mut self, input: AccessLogEntryInput) -> Result<AccessLogEntry, StorageError> {
        let event_id = AccessLogEventId(self.next_event_id);
        let prev_hash = self
            .entries
            .last()
            .map(|e| e.entry_hash.clone())
            .unwrap_or_else(|| ACCESS_LOG_GENESIS_HASH.to_string());
        let mut entry = AccessLogEntry::from_input_v1(event_id, input, prev_hash, String::new())?;
        entry.entry_hash = chain_hash(&entry.prev_hash, &entry.canonical_content());

        self.next_event_id = self.next_event_id.saturating_add(1);
        self.entries.push(entry.clone());
        Ok(entry)
    }

    /// Re-loads a previously committed entry, e.g. from a journal on startup. The entry must
    /// extend the current chain exactly.
    pub fn restore(&mut self, entry: AccessLogEntry) -> Result<(), StorageError> {
        entry.validate()?;
        let expected_prev = self
            .entries
            .last()
            .map(|e| e.entry_hash.as_str())
            .unwrap_or(ACCESS_LOG_GENESIS_HASH);
        if entry.event_id.0 != self.next_event_id
            || entry.prev_hash != expected_prev
            || entry.entry_hash != chain_hash(&entry.prev_hash, &entry.canonical_content())
        {
            return Err(StorageError::Conflict {
                table: "access_log",
                key: entry.event_id.0.to_string(),
                reason: "restored entry does not extend the chain",
            });
        }
        self.next_event_id = self.next_event_id.saturating_add(1);
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[AccessLogEntry] {
        &self.entries
    }

    pub fn verify_chain(&self) -> Result<(), StorageError> {
        let mut prev = ACCESS_LOG_GENESIS_HASH.to_string();
        for e in &self.entries {
            if e.prev_hash != prev || e.entry_hash != chain_hash(&e.prev_hash, &e.canonical_content())
            {
                return Err(StorageError::Conflict {
                    table: "access_log",
                    key: e.event_id.0.to_string(),
                    reason: "hash chain broken",
                });
            }
            prev = e.entry_hash.clone();
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn entries_mut_for_test(&mut self) -> &mut Vec<AccessLogEntry> {
        &mut self.entries
    }
}

/// PH1.J (Audit Engine) runtime wrapper.
///
/// A disciplined append-only writer into the store's access-log ledger.
#[derive(Debug, Default)]
pub struct Ph1jRuntime;

impl Ph1jRuntime {
    pub fn emit(
        store: &PresenceStore,
        input: AccessLogEntryInput,
    ) -> Result<AccessLogEntry, StorageError> {
        store.append_access_log_entry(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_kernel_contracts::ph1j::{AccessLogAction, AccessLogMetadata, AccessReason};
    use presence_kernel_contracts::ph1occ::ContextId;
    use presence_kernel_contracts::MonotonicTimeNs;

    fn denied(ts: u64) -> AccessLogEntryInput {
        AccessLogEntryInput::v1(
            None,
            ContextId::new("hall").unwrap(),
            None,
            AccessLogAction::Denied,
            Some(AccessReason::UnknownIdentifier),
            false,
            MonotonicTimeNs(ts),
            AccessLogMetadata::empty().with("tag_id", "zz_unknown"),
        )
        .unwrap()
    }

    #[test]
    fn at_j_ledger_01_ids_are_sequential_and_chained() {
        let mut ledger = AccessLogLedger::new();
        let a = ledger.append(denied(1)).unwrap();
        let b = ledger.append(denied(2)).unwrap();
        assert_eq!(a.event_id, AccessLogEventId(1));
        assert_eq!(b.event_id, AccessLogEventId(2));
        assert_eq!(a.prev_hash, ACCESS_LOG_GENESIS_HASH);
        assert_eq!(b.prev_hash, a.entry_hash);
        assert_eq!(a.entry_hash.len(), 64);
        assert!(ledger.verify_chain().is_ok());
    }

    #[test]
    fn at_j_ledger_03_restore_continues_chain_and_rejects_gaps() {
        let mut source = AccessLogLedger::new();
        let a = source.append(denied(1)).unwrap();
        let b = source.append(denied(2)).unwrap();

        let mut restored = AccessLogLedger::new();
        assert!(matches!(
            restored.restore(b.clone()),
            Err(StorageError::Conflict { .. })
        ));
        restored.restore(a).unwrap();
        restored.restore(b.clone()).unwrap();
        let c = restored.append(denied(3)).unwrap();
        assert_eq!(c.event_id, AccessLogEventId(3));
        assert_eq!(c.prev_hash, b.entry_hash);
        assert!(restored.verify_chain().is_ok());
    }

    #[test]
    fn at_j_ledger_02_tampering_breaks_chain() {
        let mut ledger = AccessLogLedger::new();
        ledger.append(denied(1)).unwrap();
        ledger.append(denied(2)).unwrap();
        ledger.entries_mut_for_test()[0].reason = Some(AccessReason::AdminOverride);
        assert!(matches!(
            ledger.verify_chain(),
            Err(StorageError::Conflict {
                table: "access_log",
                ..
            })
        ));
    }

    #[test]
    fn at_j_ledger_04_metadata_split_is_detected() {
        let mut ledger = AccessLogLedger::new();
        let mut input = denied(1);
        input.metadata = AccessLogMetadata::empty().with("identifier", "x|zz=forged");
        ledger.append(input).unwrap();
        ledger.append(denied(2)).unwrap();
        assert!(ledger.verify_chain().is_ok());

        ledger.entries_mut_for_test()[0].metadata = AccessLogMetadata::empty()
            .with("identifier", "x")
            .with("zz", "forged");
        assert!(matches!(
            ledger.verify_chain(),
            Err(StorageError::Conflict {
                table: "access_log",
                ..
            })
        ));
    }
}
