//! Session-state types for the IMAP engine (spec §4.8): connection stage and
//! the per-mailbox message vector built from a `SELECT`/`EXAMINE` snapshot.

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    NotAuthenticated,
    Authenticated,
    Selected,
}

/// Derives the stable 32-bit UID this repository exposes for an `emailId`:
/// the first 4 bytes of the UUID, high bit cleared to keep it a positive
/// IMAP UID across restarts without needing a counter table.
pub fn derive_uid(email_id: Uuid) -> u32 {
    let bytes = email_id.as_bytes();
    let raw = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    raw & 0x7fff_ffff
}

/// A constant per user, so a client's cached UIDs stay valid across
/// reconnects as long as the user doesn't change.
pub fn derive_uidvalidity(user_id: Uuid) -> u32 {
    derive_uid(user_id).max(1)
}

#[derive(Debug, Clone)]
pub struct MailboxEntry {
    pub uid: u32,
    pub email_id: Uuid,
    pub message_id: String,
    pub internal_date: DateTime<Utc>,
    pub size_bytes: i64,
    pub seen: bool,
    pub deleted: bool,
}

/// The ordered, 1-indexed message vector for the currently selected mailbox
/// (spec §4.8). Sequence numbers are the entry's position plus one and shift
/// on `EXPUNGE`; UIDs never change for the lifetime of the message.
#[derive(Debug, Default)]
pub struct MailboxState {
    entries: Vec<MailboxEntry>,
    pub read_only: bool,
}

impl MailboxState {
    pub fn new(entries: Vec<MailboxEntry>, read_only: bool) -> Self {
        MailboxState { entries, read_only }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn recent_count(&self) -> usize {
        // No cross-session "new mail" tracking exists in this core; every
        // message in a freshly loaded snapshot counts as recent once.
        self.entries.len()
    }

    pub fn max_uid(&self) -> u32 {
        self.entries.iter().map(|e| e.uid).max().unwrap_or(0)
    }

    pub fn by_seq(&self, seq: u32) -> Option<(u32, &MailboxEntry)> {
        if seq == 0 {
            return None;
        }
        self.entries
            .get(seq as usize - 1)
            .map(|e| (seq, e))
    }

    pub fn by_seq_mut(&mut self, seq: u32) -> Option<&mut MailboxEntry> {
        if seq == 0 {
            return None;
        }
        self.entries.get_mut(seq as usize - 1)
    }

    pub fn by_uid(&self, uid: u32) -> Option<(u32, &MailboxEntry)> {
        self.entries
            .iter()
            .position(|e| e.uid == uid)
            .map(|idx| (idx as u32 + 1, &self.entries[idx]))
    }

    pub fn by_uid_mut(&mut self, uid: u32) -> Option<&mut MailboxEntry> {
        self.entries.iter_mut().find(|e| e.uid == uid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &MailboxEntry)> {
        self.entries.iter().enumerate().map(|(i, e)| (i as u32 + 1, e))
    }

    /// Removes every `\Deleted` entry, returning their sequence numbers in
    /// descending order (the order `EXPUNGE` responses must be sent in).
    pub fn expunge(&mut self) -> Vec<u32> {
        let mut removed_seqs = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for (i, entry) in self.entries.drain(..).enumerate() {
            if entry.deleted {
                removed_seqs.push(i as u32 + 1);
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
        removed_seqs.reverse();
        removed_seqs
    }
}
