use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

/// A job whose next run time has been reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueEntry {
    pub job_id: String,
    /// The `nextRunAt` the entry was queued with.
    pub due_at: DateTime<Utc>,
}

/// Pending `(due time, job id)` entries, at most one per job.
///
/// Ordered by due time, ties broken by id so iteration is deterministic.
/// Owned by the scheduler loop; not shared between tasks.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    ordered: BTreeSet<(DateTime<Utc>, String)>,
    index: HashMap<String, DateTime<Utc>>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// The earliest pending entry, if any.
    pub fn peek_earliest(&self) -> Option<(&str, DateTime<Utc>)> {
        self.ordered
            .iter()
            .next()
            .map(|(at, id)| (id.as_str(), *at))
    }

    /// Remove and return every entry due at or before `now`, earliest first.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<DueEntry> {
        let mut due = Vec::new();
        while let Some((at, _)) = self.ordered.first() {
            if *at > now {
                break;
            }
            let Some((due_at, job_id)) = self.ordered.pop_first() else {
                break;
            };
            self.index.remove(&job_id);
            due.push(DueEntry { job_id, due_at });
        }
        due
    }

    /// Insert or move the entry for `job_id`.
    pub fn upsert(&mut self, job_id: &str, at: DateTime<Utc>) {
        if let Some(previous) = self.index.insert(job_id.to_string(), at) {
            self.ordered.remove(&(previous, job_id.to_string()));
        }
        self.ordered.insert((at, job_id.to_string()));
    }

    /// Drop the entry for `job_id`. Returns whether one existed.
    pub fn remove(&mut self, job_id: &str) -> bool {
        match self.index.remove(job_id) {
            Some(at) => self.ordered.remove(&(at, job_id.to_string())),
            None => false,
        }
    }

    /// The due time currently queued for `job_id`.
    pub fn due_at(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.index.get(job_id).copied()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
