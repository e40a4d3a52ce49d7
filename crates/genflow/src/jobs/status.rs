use serde::Serialize;

use crate::error::{StatusError, StoreError};
use crate::jobs::model::{JobRecord, JobStatus};
use crate::jobs::registry::{Registry, StatusCounts};
use crate::jobs::store::{read_log_tail, StatusStore};

pub const DEFAULT_TAIL_LINES: usize = 120;
pub const MAX_TAIL_LINES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogTail {
    pub job_id: String,
    pub status: JobStatus,
    pub lines: Vec<String>,
}

impl LogTail {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

pub fn clamp_tail(n: Option<usize>) -> usize {
    n.unwrap_or(DEFAULT_TAIL_LINES).clamp(1, MAX_TAIL_LINES)
}

/// Read-only view over resident and persisted jobs. Never blocks on a
/// running process.
#[derive(Clone)]
pub struct StatusReader {
    registry: Registry,
    store: StatusStore,
}

impl StatusReader {
    pub fn new(registry: Registry, store: StatusStore) -> Self {
        Self { registry, store }
    }

    pub async fn get_status(&self, job_id: &str) -> Result<JobRecord, StatusError> {
        if let Some(rec) = self.registry.get(job_id) {
            return Ok(rec);
        }
        self.load_persisted(job_id).await
    }

    /// Last `n` output lines (see [`clamp_tail`]). Active jobs are served from
    /// the in-memory ring when it can hold `n` lines, everything else from
    /// the log file. A resident job whose log cannot be read falls back to
    /// its ring.
    pub async fn get_log_tail(
        &self,
        job_id: &str,
        n: Option<usize>,
    ) -> Result<LogTail, StatusError> {
        let n = clamp_tail(n);

        let (record, ring) = match self.registry.get_with_tail(job_id) {
            Some((rec, ring)) => {
                if !rec.is_terminal() {
                    let ring = ring.lock();
                    if n <= ring.capacity() {
                        return Ok(LogTail {
                            job_id: rec.job_id,
                            status: rec.status,
                            lines: ring.tail(n),
                        });
                    }
                }
                (rec, Some(ring))
            }
            None => (self.load_persisted(job_id).await?, None),
        };

        let lines = match read_log_tail(&record.log_location, n).await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "failed to read job log");
                match ring {
                    Some(ring) => {
                        let ring = ring.lock();
                        ring.tail(n)
                    }
                    None => Vec::new(),
                }
            }
        };
        Ok(LogTail {
            job_id: record.job_id,
            status: record.status,
            lines,
        })
    }

    pub fn list(&self, status: Option<JobStatus>) -> Vec<JobRecord> {
        self.registry.list(status)
    }

    pub fn counts(&self) -> StatusCounts {
        self.registry.counts()
    }

    async fn load_persisted(&self, job_id: &str) -> Result<JobRecord, StatusError> {
        match self.store.load(job_id).await {
            Ok(rec) => Ok(rec),
            Err(StoreError::NotFound(_)) => Err(StatusError::NotFound(job_id.to_string())),
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "stored job record unusable");
                Err(StatusError::NotFound(job_id.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_size_is_clamped() {
        assert_eq!(clamp_tail(None), DEFAULT_TAIL_LINES);
        assert_eq!(clamp_tail(Some(0)), 1);
        assert_eq!(clamp_tail(Some(50)), 50);
        assert_eq!(clamp_tail(Some(1_000_000)), MAX_TAIL_LINES);
    }
}
