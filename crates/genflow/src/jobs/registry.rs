use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::error::InvariantError;
use crate::jobs::model::{JobRecord, JobStatus};
use crate::jobs::process::LogRing;

struct JobEntry {
    record: JobRecord,
    tail: Arc<Mutex<LogRing>>,
    /// Final record has reached the store; safe to drop from memory.
    durable: bool,
}

/// Outcome of [`Registry::insert_if_absent`].
pub enum Insert {
    Inserted,
    Existing(JobRecord),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// In-memory map of resident jobs.
///
/// Records are replaced whole under the write lock and handed out as clones,
/// so readers only ever see complete snapshots.
#[derive(Clone)]
pub struct Registry {
    jobs: Arc<RwLock<HashMap<String, JobEntry>>>,
    ring_capacity: usize,
    max_resident: usize,
}

impl Registry {
    pub fn new(ring_capacity: usize, max_resident: usize) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            ring_capacity,
            max_resident,
        }
    }

    pub fn insert_if_absent(&self, record: JobRecord) -> Insert {
        let mut jobs = self.jobs.write();
        if let Some(existing) = jobs.get(&record.job_id) {
            return Insert::Existing(existing.record.clone());
        }
        jobs.insert(
            record.job_id.clone(),
            JobEntry {
                record,
                tail: Arc::new(Mutex::new(LogRing::new(self.ring_capacity))),
                durable: false,
            },
        );
        Insert::Inserted
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.read().get(job_id).map(|e| e.record.clone())
    }

    pub fn get_with_tail(&self, job_id: &str) -> Option<(JobRecord, Arc<Mutex<LogRing>>)> {
        self.jobs
            .read()
            .get(job_id)
            .map(|e| (e.record.clone(), e.tail.clone()))
    }

    pub fn tail(&self, job_id: &str) -> Result<Arc<Mutex<LogRing>>, InvariantError> {
        self.jobs
            .read()
            .get(job_id)
            .map(|e| e.tail.clone())
            .ok_or_else(|| InvariantError::Missing(job_id.to_string()))
    }

    /// Mutate a record in place without changing its status.
    pub fn update<F>(&self, job_id: &str, f: F) -> Result<JobRecord, InvariantError>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut jobs = self.jobs.write();
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| InvariantError::Missing(job_id.to_string()))?;
        let mut next = entry.record.clone();
        f(&mut next);
        next.status = entry.record.status;
        entry.record = next.clone();
        Ok(next)
    }

    /// Move a record along the lifecycle. Illegal edges leave it untouched.
    pub fn transition<F>(
        &self,
        job_id: &str,
        to: JobStatus,
        f: F,
    ) -> Result<JobRecord, InvariantError>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut jobs = self.jobs.write();
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| InvariantError::Missing(job_id.to_string()))?;
        let from = entry.record.status;
        if !from.can_transition_to(to) {
            return Err(InvariantError::IllegalTransition {
                id: job_id.to_string(),
                from,
                to,
            });
        }
        let mut next = entry.record.clone();
        f(&mut next);
        next.status = to;
        entry.record = next.clone();
        Ok(next)
    }

    pub fn mark_durable(&self, job_id: &str) {
        if let Some(entry) = self.jobs.write().get_mut(job_id) {
            entry.durable = entry.record.is_terminal();
        }
    }

    /// Drop the oldest finished-and-persisted jobs once more than
    /// `max_resident` jobs are held. Returns how many were evicted.
    pub fn evict_excess(&self) -> usize {
        let mut jobs = self.jobs.write();
        if jobs.len() <= self.max_resident {
            return 0;
        }

        let mut candidates: Vec<(chrono::DateTime<chrono::Utc>, String)> = jobs
            .values()
            .filter(|e| e.durable)
            .filter_map(|e| e.record.finished_at.map(|t| (t, e.record.job_id.clone())))
            .collect();
        candidates.sort();

        let excess = jobs.len() - self.max_resident;
        let mut evicted = 0;
        for (_, id) in candidates.into_iter().take(excess) {
            jobs.remove(&id);
            evicted += 1;
        }
        evicted
    }

    pub fn list(&self, status: Option<JobStatus>) -> Vec<JobRecord> {
        let mut out: Vec<JobRecord> = self
            .jobs
            .read()
            .values()
            .filter(|e| status.map_or(true, |s| e.record.status == s))
            .map(|e| e.record.clone())
            .collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        out
    }

    pub fn counts(&self) -> StatusCounts {
        let jobs = self.jobs.read();
        let mut counts = StatusCounts::default();
        for e in jobs.values() {
            match e.record.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Succeeded => counts.succeeded += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}
