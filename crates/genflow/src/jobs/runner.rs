use std::path::PathBuf;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error::{ExecError, InvariantError};
use crate::jobs::model::{JobRecord, JobStatus};
use crate::jobs::prepare::run_steps;
use crate::jobs::process::{classify_exit, Invocation, LogSink, RunningProcess};
use crate::jobs::registry::Registry;
use crate::jobs::store::StatusStore;

const FINAL_SAVE_ATTEMPTS: u32 = 3;

/// A job handed from the backlog to an execution slot.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: String,
    pub invocation: Invocation,
}

/// Drives one job from `queued` to a terminal state.
///
/// The runner is the only writer of a job's record while it executes; the
/// scheduler guarantees one runner per job.
#[derive(Clone)]
pub struct JobRunner {
    registry: Registry,
    store: StatusStore,
    flush_interval: Duration,
    http: reqwest::Client,
    /// Prefix for `output_url`, e.g. `https://host:8000`. May be empty.
    public_base: String,
}

impl JobRunner {
    pub fn new(
        registry: Registry,
        store: StatusStore,
        flush_interval: Duration,
        public_base: String,
    ) -> Self {
        Self {
            registry,
            store,
            flush_interval,
            http: reqwest::Client::new(),
            public_base,
        }
    }

    pub async fn run(&self, job: QueuedJob) {
        if let Err(e) = self.execute(&job.job_id, &job.invocation).await {
            tracing::error!(job_id = %job.job_id, error = %e, "job bookkeeping broken; abandoning job");
        }
    }

    async fn execute(&self, job_id: &str, inv: &Invocation) -> Result<(), InvariantError> {
        let ring = self.registry.tail(job_id)?;

        let total = match run_steps(job_id, &inv.prepare, &self.http).await {
            Ok(counted) if inv.total_hint == 0 => counted.unwrap_or(0),
            Ok(_) => inv.total_hint,
            Err(e) => return self.on_failure(job_id, e).await,
        };

        let mut proc = match RunningProcess::spawn(inv) {
            Ok(proc) => proc,
            Err(e) => return self.on_failure(job_id, e).await,
        };

        let running = self.registry.transition(job_id, JobStatus::Running, |r| {
            r.mark_running(inv.argv(), total)
        })?;
        tracing::info!(
            job_id = %job_id,
            pid = ?proc.pid(),
            program = %inv.program,
            "job running"
        );
        self.persist(&running).await;

        let mut sink = LogSink::create(&running.log_location).await;
        let mut ticker = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                line = proc.next_line() => {
                    let Some(line) = line else { break };
                    tracing::debug!(job_id = %job_id, "{line}");
                    sink.write_line(&line).await;
                    if let Some(done) = inv.progress.as_ref().and_then(|rule| rule.parse(&line)) {
                        self.registry.update(job_id, |r| r.progress.advance_to(done))?;
                    }
                    ring.lock().push(line);
                }
                _ = ticker.tick() => {
                    sink.flush().await;
                    self.checkpoint(job_id, &mut sink).await?;
                }
            }
        }

        sink.flush().await;
        self.record_sink_warning(job_id, &mut sink)?;

        let outcome = match proc.wait().await {
            Ok(status) => classify_exit(status, inv.expected_artifact.as_deref()).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(artifact) => self.on_success(job_id, artifact).await,
            Err(e) => self.on_failure(job_id, e).await,
        }
    }

    /// Periodic persist so readers of the store see recent progress.
    async fn checkpoint(&self, job_id: &str, sink: &mut LogSink) -> Result<(), InvariantError> {
        let snapshot = match self.record_sink_warning(job_id, sink)? {
            Some(rec) => rec,
            None => self
                .registry
                .get(job_id)
                .ok_or_else(|| InvariantError::Missing(job_id.to_string()))?,
        };
        self.persist(&snapshot).await;
        Ok(())
    }

    fn record_sink_warning(
        &self,
        job_id: &str,
        sink: &mut LogSink,
    ) -> Result<Option<JobRecord>, InvariantError> {
        match sink.take_warning() {
            Some(warning) => self
                .registry
                .update(job_id, |r| r.warnings.push(warning))
                .map(Some),
            None => Ok(None),
        }
    }

    pub async fn on_success(
        &self,
        job_id: &str,
        artifact: Option<PathBuf>,
    ) -> Result<(), InvariantError> {
        let url = artifact
            .as_deref()
            .and_then(|p| self.store.public_path(p))
            .map(|rel| format!("{}{rel}", self.public_base));
        let output = artifact.map(|p| p.display().to_string());
        let rec = self.registry.transition(job_id, JobStatus::Succeeded, |r| {
            r.mark_succeeded(0, output);
            r.output_url = url;
        })?;
        tracing::info!(
            job_id = %job_id,
            output = ?rec.output_location,
            url = ?rec.output_url,
            "job succeeded"
        );
        self.persist_final(&rec).await;
        Ok(())
    }

    pub async fn on_failure(&self, job_id: &str, err: ExecError) -> Result<(), InvariantError> {
        let rec = self.registry.transition(job_id, JobStatus::Failed, |r| {
            r.mark_failed(err.exit_code(), err.to_string());
            r.signal = err.signal();
        })?;
        tracing::warn!(
            job_id = %job_id,
            exit_code = ?rec.exit_code,
            signal = ?rec.signal,
            error = %err,
            "job failed"
        );
        self.persist_final(&rec).await;
        Ok(())
    }

    async fn persist(&self, rec: &JobRecord) -> bool {
        match self.store.save(rec).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(job_id = %rec.job_id, status = %rec.status, error = %e, "failed to persist job record");
                false
            }
        }
    }

    /// Terminal records get a few attempts; the in-memory copy stays
    /// authoritative (and resident) until one of them lands.
    async fn persist_final(&self, rec: &JobRecord) {
        for attempt in 1..=FINAL_SAVE_ATTEMPTS {
            if self.persist(rec).await {
                self.registry.mark_durable(&rec.job_id);
                let evicted = self.registry.evict_excess();
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted finished jobs from memory");
                }
                return;
            }
            if attempt < FINAL_SAVE_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
            }
        }
        tracing::error!(job_id = %rec.job_id, "final job record not persisted; state lives only in memory");
    }
}
