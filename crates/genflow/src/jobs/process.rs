//! Subprocess plumbing for a single job.
//!
//! [`RunningProcess::spawn`] starts the child with both output streams piped
//! and merges them into one line channel. The job runner drains that channel,
//! feeding a [`LogSink`], a [`LogRing`] and an optional [`ProgressRule`].

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use regex::Regex;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::error::ExecError;
use crate::jobs::prepare::PrepareStep;

const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Longest line kept from child output or a log file. Bytes past it are
/// dropped up to the next newline.
pub const MAX_LINE_BYTES: usize = 8 * 1024;

/// A fully resolved command for one job, produced by a planner.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Must exist after a zero exit for the job to count as succeeded.
    pub expected_artifact: Option<PathBuf>,
    pub progress: Option<ProgressRule>,
    pub total_hint: u64,
    /// Run in order before the program is spawned.
    pub prepare: Vec<PrepareStep>,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
            expected_artifact: None,
            progress: None,
            total_hint: 0,
            prepare: Vec::new(),
        }
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn expect_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.expected_artifact = Some(path.into());
        self
    }

    pub fn progress(mut self, rule: ProgressRule, total_hint: u64) -> Self {
        self.progress = Some(rule);
        self.total_hint = total_hint;
        self
    }

    pub fn prepare(mut self, step: PrepareStep) -> Self {
        self.prepare.push(step);
        self
    }

    /// Program followed by its arguments, as recorded on the job.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Extracts a "done" count from an output line.
///
/// The first capture group is parsed as an integer and `offset` is added, so
/// zero-based frame indices can be reported as counts.
#[derive(Debug, Clone)]
pub struct ProgressRule {
    pattern: Regex,
    offset: u64,
}

impl ProgressRule {
    pub fn new(pattern: &str, offset: u64) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            offset,
        })
    }

    pub fn parse(&self, line: &str) -> Option<u64> {
        let caps = self.pattern.captures(line)?;
        let n: u64 = caps.get(1)?.as_str().parse().ok()?;
        Some(n.saturating_add(self.offset))
    }
}

/// Bounded tail of recent output lines; the oldest line goes first.
#[derive(Debug, Clone)]
pub struct LogRing {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

/// Append-only job log. Write failures disable the sink and leave a warning
/// behind instead of failing the job.
pub struct LogSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    warning: Option<String>,
}

impl LogSink {
    pub async fn create(path: &Path) -> Self {
        let mut sink = Self {
            path: path.to_path_buf(),
            writer: None,
            warning: None,
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                sink.disable("create log dir", e);
                return sink;
            }
        }
        match File::create(path).await {
            Ok(f) => sink.writer = Some(BufWriter::new(f)),
            Err(e) => sink.disable("open", e),
        }
        sink
    }

    pub async fn write_line(&mut self, line: &str) {
        let Some(w) = self.writer.as_mut() else {
            return;
        };
        let res = match w.write_all(line.as_bytes()).await {
            Ok(()) => w.write_all(b"\n").await,
            Err(e) => Err(e),
        };
        if let Err(e) = res {
            self.disable("write", e);
        }
    }

    pub async fn flush(&mut self) {
        let Some(w) = self.writer.as_mut() else {
            return;
        };
        if let Err(e) = w.flush().await {
            self.disable("flush", e);
        }
    }

    pub fn take_warning(&mut self) -> Option<String> {
        self.warning.take()
    }

    fn disable(&mut self, op: &str, e: std::io::Error) {
        tracing::warn!(path = %self.path.display(), error = %e, "job log {op} failed; output will not be captured");
        self.writer = None;
        self.warning = Some(format!(
            "log sink {op} failed for {}: {e}",
            self.path.display()
        ));
    }
}

/// A spawned child whose stdout and stderr arrive as one stream of lines.
pub struct RunningProcess {
    child: Child,
    lines: mpsc::Receiver<String>,
}

impl RunningProcess {
    pub fn spawn(inv: &Invocation) -> Result<Self, ExecError> {
        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &inv.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &inv.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: inv.program.clone(),
            source,
        })?;

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, tx));
        }

        Ok(Self { child, lines: rx })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Next combined output line; `None` once both streams hit EOF.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    pub async fn wait(mut self) -> Result<ExitStatus, ExecError> {
        self.child.wait().await.map_err(ExecError::Wait)
    }
}

async fn pump_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        match read_capped_line(&mut reader, &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "output stream closed with error");
                break;
            }
        }
    }
}

/// Read one line into `buf`, keeping at most [`MAX_LINE_BYTES`] of it.
///
/// Returns the number of bytes consumed from `reader`, which is 0 only at
/// EOF. Memory stays bounded however long the line is.
pub async fn read_capped_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut consumed = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(consumed);
        }
        let (used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        let room = MAX_LINE_BYTES.saturating_sub(buf.len());
        buf.extend_from_slice(&available[..used.min(room)]);
        reader.consume(used);
        consumed += used;
        if done {
            return Ok(consumed);
        }
    }
}

/// Turn an exit status into the job outcome. On success returns the artifact
/// path, if one was expected.
pub async fn classify_exit(
    status: ExitStatus,
    expected_artifact: Option<&Path>,
) -> Result<Option<PathBuf>, ExecError> {
    match status.code() {
        Some(0) => match expected_artifact {
            Some(path) => {
                if tokio::fs::try_exists(path).await.unwrap_or(false) {
                    Ok(Some(path.to_path_buf()))
                } else {
                    Err(ExecError::MissingArtifact(path.to_path_buf()))
                }
            }
            None => Ok(None),
        },
        Some(code) => Err(ExecError::ExitCode(code)),
        None => Err(signal_of(status)),
    }
}

#[cfg(unix)]
fn signal_of(status: ExitStatus) -> ExecError {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(sig) => ExecError::Signal(sig),
        None => ExecError::NoStatus,
    }
}

#[cfg(not(unix))]
fn signal_of(_status: ExitStatus) -> ExecError {
    ExecError::NoStatus
}
