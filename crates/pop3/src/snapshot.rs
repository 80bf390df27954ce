//! The mailbox snapshot taken at authentication time (spec §4.7). `Transaction`
//! state commands only ever read this vector - a message delivered after
//! login simply isn't visible until the next session.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

const MAX_DELETED: usize = 10_000;

#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    /// 1-indexed position, stable for the lifetime of the session.
    pub message_number: usize,
    pub email_id: Uuid,
    pub size_bytes: i64,
    pub unique_id: String,
}

#[derive(Debug, Default)]
pub struct Snapshot {
    entries: Vec<SnapshotEntry>,
    deleted: HashSet<usize>,
}

impl Snapshot {
    pub fn new(summaries: Vec<(Uuid, i64, String, DateTime<Utc>)>) -> Self {
        let mut summaries = summaries;
        summaries.sort_by_key(|(_, _, _, received_at)| *received_at);
        let entries = summaries
            .into_iter()
            .enumerate()
            .map(|(i, (email_id, size_bytes, unique_id, _))| SnapshotEntry {
                message_number: i + 1,
                email_id,
                size_bytes,
                unique_id,
            })
            .collect();
        Snapshot {
            entries,
            deleted: HashSet::new(),
        }
    }

    pub fn get(&self, message_number: usize) -> Option<&SnapshotEntry> {
        self.entries
            .iter()
            .find(|e| e.message_number == message_number)
    }

    pub fn is_deleted(&self, message_number: usize) -> bool {
        self.deleted.contains(&message_number)
    }

    pub fn mark_deleted(&mut self, message_number: usize) -> Result<(), &'static str> {
        if self.get(message_number).is_none() {
            return Err("no such message");
        }
        if self.deleted.len() >= MAX_DELETED && !self.deleted.contains(&message_number) {
            return Err("too many deleted messages");
        }
        self.deleted.insert(message_number);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.deleted.clear();
    }

    pub fn live_entries(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries
            .iter()
            .filter(move |e| !self.deleted.contains(&e.message_number))
    }

    pub fn stat(&self) -> (usize, i64) {
        let live: Vec<&SnapshotEntry> = self.live_entries().collect();
        (live.len(), live.iter().map(|e| e.size_bytes).sum())
    }

    pub fn deleted_email_ids(&self) -> Vec<Uuid> {
        self.entries
            .iter()
            .filter(|e| self.deleted.contains(&e.message_number))
            .map(|e| e.email_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        Snapshot::new(vec![
            (Uuid::new_v4(), 100, "a".into(), Utc::now()),
            (Uuid::new_v4(), 200, "b".into(), Utc::now()),
        ])
    }

    #[test]
    fn stat_counts_only_live_messages() {
        let mut snap = sample();
        assert_eq!(snap.stat(), (2, 300));
        snap.mark_deleted(1).unwrap();
        assert_eq!(snap.stat(), (1, 200));
    }

    #[test]
    fn reset_clears_deletions() {
        let mut snap = sample();
        snap.mark_deleted(1).unwrap();
        snap.reset();
        assert_eq!(snap.stat(), (2, 300));
    }

    #[test]
    fn mark_deleted_rejects_unknown_message_number() {
        let mut snap = sample();
        assert!(snap.mark_deleted(99).is_err());
    }

    #[test]
    fn deleted_email_ids_reflects_marks() {
        let mut snap = sample();
        let first_id = snap.get(1).unwrap().email_id;
        snap.mark_deleted(1).unwrap();
        assert_eq!(snap.deleted_email_ids(), vec![first_id]);
    }
}
