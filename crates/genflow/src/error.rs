//! Error taxonomy for the job core.
//!
//! Job-local failures (`ExecError`) end up inside the job record; they never
//! escape the scheduler. `StoreError` is logged and swallowed by callers that
//! write. Only `SubmitError` and `StatusError` reach API callers.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("invalid job id {0:?}: use 1-64 chars of [A-Za-z0-9_-]")]
    InvalidId(String),

    #[error("job {0} already exists and is finished")]
    DuplicateId(String),

    #[error("no planner registered for kind {0:?}")]
    UnknownKind(String),

    #[error("bad descriptor: {0}")]
    BadDescriptor(String),

    #[error("{0} is not ready yet")]
    NotReady(String),

    #[error("scheduler is shut down")]
    ShuttingDown,
}

impl SubmitError {
    pub fn bad_descriptor(msg: impl Into<String>) -> Self {
        Self::BadDescriptor(msg.into())
    }
}

/// Why a job ended up `failed`.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process exited with code {0}")]
    ExitCode(i32),

    #[error("process terminated by signal {0}")]
    Signal(i32),

    #[error("process ended without an exit status")]
    NoStatus,

    #[error("expected artifact missing: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("failed to wait for process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("preparing job failed: {0}")]
    Prepare(String),
}

impl ExecError {
    /// Exit code to record alongside the error, when the process produced one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecError::ExitCode(code) => Some(*code),
            ExecError::MissingArtifact(_) => Some(0),
            _ => None,
        }
    }

    /// Signal that terminated the process, if that is how it ended.
    pub fn signal(&self) -> Option<i32> {
        match self {
            ExecError::Signal(sig) => Some(*sig),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no stored record for job {0}")]
    NotFound(String),

    #[error("stored record for job {id} is corrupt: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("job not found: {0}")]
    NotFound(String),
}

/// Broken internal bookkeeping. Aborts the affected job task, nothing else.
#[derive(Error, Debug)]
pub enum InvariantError {
    #[error("job {0} is not resident in the registry")]
    Missing(String),

    #[error("job {id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: crate::jobs::model::JobStatus,
        to: crate::jobs::model::JobStatus,
    },
}
