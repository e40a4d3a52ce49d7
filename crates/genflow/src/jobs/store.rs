// crates/genflow/src/jobs/store.rs

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tokio::io::BufReader;

use crate::error::StoreError;
use crate::jobs::model::JobRecord;
use crate::jobs::process::read_capped_line;

const STATUS_FILE: &str = "job_status.json";
const STATUS_TMP_FILE: &str = "job_status.json.tmp";
const LOG_FILE: &str = "job.log";
const MAX_JOB_ID_LEN: usize = 64;

/// Ids double as directory names under the jobs root, so only
/// `[A-Za-z0-9_-]{1,64}` is accepted.
pub fn is_safe_job_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_JOB_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// On-disk locations owned by one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub job_id: String,
    pub dir: PathBuf,
    pub status_file: PathBuf,
    pub log_file: PathBuf,
}

/// Durable copy of every job record, one directory per job.
///
/// Writes go to a temp file and are renamed into place, so readers see either
/// the previous record or the new one. One writer per job is assumed.
#[derive(Clone, Debug)]
pub struct StatusStore {
    root: PathBuf,
}

impl StatusStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self, job_id: &str) -> JobPaths {
        let dir = self.root.join(job_id);
        JobPaths {
            job_id: job_id.to_string(),
            status_file: dir.join(STATUS_FILE),
            log_file: dir.join(LOG_FILE),
            dir,
        }
    }

    pub async fn save(&self, record: &JobRecord) -> Result<(), StoreError> {
        let paths = self.paths(&record.job_id);
        tokio::fs::create_dir_all(&paths.dir).await?;

        let body = serde_json::to_vec_pretty(record).map_err(StoreError::Encode)?;
        let tmp = paths.dir.join(STATUS_TMP_FILE);
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &paths.status_file).await?;
        Ok(())
    }

    /// Unsafe ids read as missing; they never touch the filesystem.
    pub async fn load(&self, job_id: &str) -> Result<JobRecord, StoreError> {
        if !is_safe_job_id(job_id) {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        let paths = self.paths(job_id);
        let body = match tokio::fs::read(&paths.status_file).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(job_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&body).map_err(|source| StoreError::Corrupt {
            id: job_id.to_string(),
            source,
        })
    }

    /// Every readable record under the root, oldest first.
    pub async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut out = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(job_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !is_safe_job_id(&job_id) {
                continue;
            }
            match self.load(&job_id).await {
                Ok(record) => out.push(record),
                Err(StoreError::NotFound(_)) => {}
                Err(e) => tracing::warn!(job_id = %job_id, error = %e, "skipping unreadable job record"),
            }
        }

        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        Ok(out)
    }

    /// `/jobs/<id>/files/<rest>` for a file inside a job directory, `None`
    /// for anything outside the root.
    pub fn public_path(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for c in rel.components() {
            match c {
                Component::Normal(p) => parts.push(p.to_str()?.to_string()),
                _ => return None,
            }
        }
        if parts.len() < 2 || !is_safe_job_id(&parts[0]) {
            return None;
        }
        let job_id = parts.remove(0);
        Some(format!("/jobs/{job_id}/files/{}", parts.join("/")))
    }

    /// Resolve a relative file path inside a job directory, rejecting
    /// anything that would leave it.
    pub fn job_file(&self, job_id: &str, rel: &str) -> Option<PathBuf> {
        if !is_safe_job_id(job_id) || rel.is_empty() {
            return None;
        }
        let rel = Path::new(rel);
        if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }
        Some(self.root.join(job_id).join(rel))
    }
}

/// Last `n` lines of a log file. A missing file reads as empty.
pub async fn read_log_tail(path: &Path, n: usize) -> std::io::Result<Vec<String>> {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut tail = VecDeque::with_capacity(n);
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    loop {
        if read_capped_line(&mut reader, &mut buf).await? == 0 {
            break;
        }
        if n == 0 {
            continue;
        }
        if tail.len() == n {
            tail.pop_front();
        }
        let line = String::from_utf8_lossy(&buf);
        tail.push_back(line.trim_end_matches(['\n', '\r']).to_string());
    }
    Ok(tail.into())
}
