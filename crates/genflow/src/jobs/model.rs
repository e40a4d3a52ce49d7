use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Legal edges of the lifecycle. `Queued -> Failed` covers spawn failures.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job should do. `kind` selects a planner, `params` is opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkDescriptor {
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

impl WorkDescriptor {
    pub fn new(kind: impl Into<String>, params: Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub done: u64,
    /// Zero means unknown.
    pub total: u64,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        Self { done: 0, total }
    }

    /// Raise `done` to `value`, never lowering it and never past a known total.
    pub fn advance_to(&mut self, value: u64) {
        let capped = if self.total > 0 {
            value.min(self.total)
        } else {
            value
        };
        self.done = self.done.max(capped);
    }
}

/// Canonical job record, both in memory and on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub status: JobStatus,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub exit_code: Option<i32>,
    /// Set when the process was killed by a signal; `exit_code` is then null.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub error: Option<String>,

    pub input: WorkDescriptor,
    pub output_location: Option<String>,
    /// Client-facing address of the artifact when it lives under the jobs root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    pub log_location: PathBuf,
    pub progress: Progress,

    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl JobRecord {
    pub fn new_queued(job_id: String, input: WorkDescriptor, log_location: PathBuf) -> Self {
        Self {
            job_id,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            signal: None,
            error: None,
            input,
            output_location: None,
            output_url: None,
            log_location,
            progress: Progress::default(),
            command: None,
            warnings: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_running(&mut self, command: Vec<String>, total: u64) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        self.command = Some(command);
        self.progress = Progress::new(total);
    }

    pub fn mark_succeeded(&mut self, exit_code: i32, output_location: Option<String>) {
        self.status = JobStatus::Succeeded;
        self.finished_at = Some(Utc::now());
        self.exit_code = Some(exit_code);
        self.output_location = output_location;
        self.error = None;
        if self.progress.total > 0 {
            self.progress.done = self.progress.total;
        }
    }

    /// Also used for spawn failures straight out of `Queued`, in which case
    /// `started_at` is stamped with the finish time.
    pub fn mark_failed(&mut self, exit_code: Option<i32>, error: String) {
        let now = Utc::now();
        self.status = JobStatus::Failed;
        self.started_at.get_or_insert(now);
        self.finished_at = Some(now);
        self.exit_code = exit_code;
        self.error = Some(error);
        self.output_location = None;
        self.output_url = None;
    }
}
