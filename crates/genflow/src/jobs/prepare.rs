//! Work a job needs done before its command can start: writing request
//! files, fetching remote inputs and counting frames.
//!
//! Steps run in the job's slot, in order, after the job leaves the backlog.
//! The first failure fails the job without spawning anything.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::error::ExecError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareStep {
    /// Write `contents` to `path`, creating parent directories.
    WriteFile { path: PathBuf, contents: Vec<u8> },
    /// Stream an http(s) resource to `dest`.
    Download { url: String, dest: PathBuf },
    /// Ask ffprobe for the frame count of the first video stream. The count
    /// becomes the job's progress total.
    CountFrames { ffprobe: String, input: PathBuf },
}

impl PrepareStep {
    fn name(&self) -> &'static str {
        match self {
            PrepareStep::WriteFile { .. } => "write_file",
            PrepareStep::Download { .. } => "download",
            PrepareStep::CountFrames { .. } => "count_frames",
        }
    }
}

/// Run every step. Returns the frame total reported by the last
/// `CountFrames` step that produced one.
pub async fn run_steps(
    job_id: &str,
    steps: &[PrepareStep],
    http: &reqwest::Client,
) -> Result<Option<u64>, ExecError> {
    let mut total = None;
    for step in steps {
        tracing::debug!(job_id = %job_id, step = step.name(), "preparing job");
        match step {
            PrepareStep::WriteFile { path, contents } => write_file(path, contents).await?,
            PrepareStep::Download { url, dest } => {
                let bytes = download(http, url, dest).await?;
                tracing::info!(job_id = %job_id, %url, bytes, "input downloaded");
            }
            PrepareStep::CountFrames { ffprobe, input } => {
                if let Some(n) = count_frames(ffprobe, input).await {
                    total = Some(n);
                }
            }
        }
    }
    Ok(total)
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<(), ExecError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ExecError::Prepare(format!("create {}: {e}", parent.display())))?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| ExecError::Prepare(format!("write {}: {e}", path.display())))
}

async fn download(http: &reqwest::Client, url: &str, dest: &Path) -> Result<u64, ExecError> {
    let fail = |what: String| ExecError::Prepare(format!("download {url}: {what}"));

    let mut response = http
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| fail(e.to_string()))?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| fail(e.to_string()))?;
    }
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| fail(format!("create {}: {e}", dest.display())))?;

    let mut written: u64 = 0;
    while let Some(chunk) = response.chunk().await.map_err(|e| fail(e.to_string()))? {
        file.write_all(&chunk).await.map_err(|e| fail(e.to_string()))?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| fail(e.to_string()))?;

    if written == 0 {
        return Err(fail("empty response body".into()));
    }
    Ok(written)
}

/// `None` when ffprobe is missing, fails, or reports no usable count; the
/// job then runs without a known total.
async fn count_frames(ffprobe: &str, input: &Path) -> Option<u64> {
    let output = tokio::process::Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=nb_frames",
            "-of",
            "default=nw=1:nk=1",
        ])
        .arg(input)
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => parse_frame_count(&String::from_utf8_lossy(&out.stdout)),
        Ok(out) => {
            tracing::warn!(
                input = %input.display(),
                exit_code = ?out.status.code(),
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "ffprobe failed; frame total unknown"
            );
            None
        }
        Err(e) => {
            tracing::warn!(ffprobe, error = %e, "ffprobe not runnable; frame total unknown");
            None
        }
    }
}

fn parse_frame_count(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .map(str::trim)
        .find_map(|l| l.parse::<u64>().ok())
        .filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_count_parsing() {
        assert_eq!(parse_frame_count("1800\n"), Some(1800));
        assert_eq!(parse_frame_count("N/A\n"), None);
        assert_eq!(parse_frame_count("0\n"), None);
        assert_eq!(parse_frame_count(""), None);
    }

    #[tokio::test]
    async fn writes_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/request.json");
        let steps = vec![
            PrepareStep::WriteFile {
                path: path.clone(),
                contents: b"first".to_vec(),
            },
            PrepareStep::WriteFile {
                path: path.clone(),
                contents: b"{\"prompt\":\"a cat\"}".to_vec(),
            },
        ];
        let total = run_steps("j", &steps, &reqwest::Client::new()).await.unwrap();
        assert_eq!(total, None);
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"prompt\":\"a cat\"}");
    }

    #[tokio::test]
    async fn unreachable_download_is_a_prepare_error() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec![PrepareStep::Download {
            url: "http://127.0.0.1:9/input.mp4".into(),
            dest: dir.path().join("input.mp4"),
        }];
        let err = run_steps("j", &steps, &reqwest::Client::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Prepare(ref msg) if msg.contains("127.0.0.1:9")));
        assert_eq!(err.exit_code(), None);
    }

    #[tokio::test]
    async fn missing_ffprobe_leaves_total_unknown() {
        let steps = vec![PrepareStep::CountFrames {
            ffprobe: "/definitely/not/here/ffprobe".into(),
            input: PathBuf::from("/nowhere.mp4"),
        }];
        let total = run_steps("j", &steps, &reqwest::Client::new()).await.unwrap();
        assert_eq!(total, None);
    }

    #[tokio::test]
    async fn frame_count_comes_from_tool_output() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake-ffprobe");
        std::fs::write(&fake, "#!/bin/sh\necho 240\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let steps = vec![PrepareStep::CountFrames {
            ffprobe: fake.display().to_string(),
            input: dir.path().join("input.mp4"),
        }];
        let total = run_steps("j", &steps, &reqwest::Client::new()).await.unwrap();
        assert_eq!(total, Some(240));
    }
}
