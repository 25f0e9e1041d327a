//! Hash-chained audit log of progress events
//!
//! Every entry commits to the previous entry's hash, so editing, dropping or
//! reordering any recorded event breaks [`verify_chain`].

use crate::progress::{ProgressEvent, ProgressObserver};
use crate::session::UpgradeState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tuo_snapshot::{SessionId, UserId};

/// Audit log errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    /// Chain broken at the given sequence number
    #[error("audit chain integrity violation at entry {seq}")]
    IntegrityViolation {
        /// First entry that fails verification
        seq: u64,
    },
}

/// One recorded progress event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the log, from 0
    pub seq: u64,
    /// Emission time in milliseconds since the epoch
    pub timestamp_ms: i64,
    /// Session
    pub session_id: SessionId,
    /// User
    pub user_id: UserId,
    /// State entered
    pub state: UpgradeState,
    /// Progress at this point
    pub progress_percent: u8,
    /// Message
    pub message: String,
    /// Hash of the previous entry (zero for the first)
    #[serde(with = "hex::serde")]
    pub prev_hash: [u8; 32],
    /// Hash of this entry
    #[serde(with = "hex::serde")]
    pub hash: [u8; 32],
}

/// Append-only audit log
#[derive(Debug, Default)]
pub struct AuditLog {
    inner: Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    /// Create an empty log
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, returning its sequence number
    pub fn append(&self, event: &ProgressEvent) -> u64 {
        let mut guard = self.inner.lock();
        let prev_hash = guard.last().map_or([0u8; 32], |e| e.hash);
        let seq = guard.len() as u64;
        let mut entry = AuditEntry {
            seq,
            timestamp_ms: event.at.timestamp_millis(),
            session_id: event.session_id,
            user_id: event.user_id.clone(),
            state: event.state,
            progress_percent: event.progress_percent,
            message: event.message.clone(),
            prev_hash,
            hash: [0u8; 32],
        };
        entry.hash = compute_hash(&entry);
        guard.push(entry);
        seq
    }

    /// Copy of every entry
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().clone()
    }

    /// Entries for one session
    #[must_use]
    pub fn for_session(&self, session_id: SessionId) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Log has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Verify the whole chain
    ///
    /// # Errors
    /// Returns [`AuditError::IntegrityViolation`] at the first bad entry
    pub fn verify_integrity(&self) -> Result<(), AuditError> {
        verify_chain(&self.inner.lock())
    }
}

impl ProgressObserver for AuditLog {
    fn on_event(&self, event: &ProgressEvent) {
        self.append(event);
    }
}

/// Verify a sequence of entries as a chain starting from the zero hash
///
/// # Errors
/// Returns [`AuditError::IntegrityViolation`] at the first bad entry
pub fn verify_chain(entries: &[AuditEntry]) -> Result<(), AuditError> {
    let mut prev = [0u8; 32];
    for (i, e) in entries.iter().enumerate() {
        if e.seq != i as u64 || e.prev_hash != prev || e.hash != compute_hash(e) {
            return Err(AuditError::IntegrityViolation { seq: i as u64 });
        }
        prev = e.hash;
    }
    Ok(())
}

fn compute_hash(entry: &AuditEntry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(entry.seq.to_le_bytes());
    hasher.update(entry.timestamp_ms.to_le_bytes());
    hasher.update(entry.session_id.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(entry.user_id.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(entry.state.as_str().as_bytes());
    hasher.update([entry.progress_percent]);
    hasher.update(entry.message.as_bytes());
    hasher.update([0]);
    hasher.update(entry.prev_hash);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(session_id: SessionId, state: UpgradeState) -> ProgressEvent {
        ProgressEvent {
            session_id,
            user_id: UserId::new("u1"),
            state,
            message: state.message().to_string(),
            progress_percent: state.progress().unwrap_or(35),
            at: Utc::now(),
        }
    }

    #[test]
    fn chain_links_entries() {
        let log = AuditLog::new();
        let id = SessionId::new();
        log.append(&event(id, UpgradeState::Starting));
        log.append(&event(id, UpgradeState::BackingUp));

        let entries = log.entries();
        assert_eq!(entries[0].prev_hash, [0u8; 32]);
        assert_eq!(entries[1].prev_hash, entries[0].hash);
        assert!(log.verify_integrity().is_ok());
    }

    #[test]
    fn tampered_message_detected() {
        let log = AuditLog::new();
        let id = SessionId::new();
        log.append(&event(id, UpgradeState::Starting));
        log.append(&event(id, UpgradeState::Failed));
        log.append(&event(id, UpgradeState::RolledBack));

        let mut entries = log.entries();
        entries[1].message = "Upgrade complete".into();
        assert_eq!(verify_chain(&entries), Err(AuditError::IntegrityViolation { seq: 1 }));
    }

    #[test]
    fn dropped_entry_detected() {
        let log = AuditLog::new();
        let id = SessionId::new();
        for state in [UpgradeState::Starting, UpgradeState::BackingUp, UpgradeState::Upgrading] {
            log.append(&event(id, state));
        }
        let mut entries = log.entries();
        entries.remove(1);
        assert!(verify_chain(&entries).is_err());
    }

    #[test]
    fn entry_serializes_hashes_as_hex() {
        let log = AuditLog::new();
        log.append(&event(SessionId::new(), UpgradeState::Starting));
        let json = serde_json::to_value(&log.entries()[0]).unwrap();
        assert_eq!(json["prev_hash"].as_str().unwrap().len(), 64);
    }
}
