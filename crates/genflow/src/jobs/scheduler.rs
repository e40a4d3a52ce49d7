use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{StoreError, SubmitError};
use crate::jobs::model::{JobRecord, JobStatus, WorkDescriptor};
use crate::jobs::planner::PlannerRegistry;
use crate::jobs::registry::{Insert, Registry};
use crate::jobs::runner::{JobRunner, QueuedJob};
use crate::jobs::status::StatusReader;
use crate::jobs::store::{is_safe_job_id, StatusStore};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Execution slots; 1 means strictly serial.
    pub worker_slots: usize,
    pub log_ring_lines: usize,
    pub flush_interval: Duration,
    pub max_resident_jobs: usize,
    /// Prepended to `/jobs/<id>/files/...` when filling `output_url`.
    pub public_base: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_slots: 1,
            log_ring_lines: 220,
            flush_interval: Duration::from_millis(1500),
            max_resident_jobs: 1000,
            public_base: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submitted {
    pub job_id: String,
    pub status: JobStatus,
    /// The id named a job that was already queued or running.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub existing: bool,
}

/// Accepts work and runs it on a bounded pool of slots, FIFO.
///
/// Cloning is cheap; all clones share one backlog and one registry.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Shared>,
}

struct Shared {
    registry: Registry,
    store: StatusStore,
    planners: Arc<PlannerRegistry>,
    backlog: mpsc::UnboundedSender<QueuedJob>,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Start the dispatcher task. Must be called inside a tokio runtime.
    pub fn start(config: SchedulerConfig, store: StatusStore, planners: PlannerRegistry) -> Self {
        let registry = Registry::new(config.log_ring_lines, config.max_resident_jobs);
        let runner = JobRunner::new(
            registry.clone(),
            store.clone(),
            config.flush_interval,
            config.public_base.trim_end_matches('/').to_string(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let slots = config.worker_slots.max(1);

        tracing::info!(
            worker_slots = slots,
            jobs_root = %store.root().display(),
            "scheduler starting"
        );

        let dispatcher = tokio::spawn(dispatch_loop(rx, runner, slots, shutdown.clone()));

        Self {
            inner: Arc::new(Shared {
                registry,
                store,
                planners: Arc::new(planners),
                backlog: tx,
                shutdown,
                dispatcher: Mutex::new(Some(dispatcher)),
            }),
        }
    }

    /// Validate, record and enqueue a job. Returns as soon as the queued
    /// record is written; execution happens on the dispatcher.
    ///
    /// A caller-supplied id acts as an idempotency key: naming a job that is
    /// still queued or running returns that job, naming a finished one is
    /// rejected. Kinds with ready flags are refused with
    /// [`SubmitError::NotReady`] until those files exist.
    pub async fn submit(
        &self,
        input: WorkDescriptor,
        job_id: Option<String>,
    ) -> Result<Submitted, SubmitError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }

        let options = self.inner.planners.options(&input.kind)?;
        if !options.is_ready().await {
            return Err(SubmitError::NotReady(input.kind.clone()));
        }

        let job_id = match job_id {
            Some(id) => {
                validate_job_id(&id)?;
                if let Some(existing) = self.find_existing(&id).await {
                    return existing_outcome(existing);
                }
                id
            }
            None => format!("{}{}", options.prefix(), Uuid::new_v4().simple()),
        };

        let paths = self.inner.store.paths(&job_id);
        let invocation = self.inner.planners.plan(&input, &paths)?;
        let record = JobRecord::new_queued(job_id.clone(), input, paths.log_file.clone());

        if let Insert::Existing(existing) = self.inner.registry.insert_if_absent(record.clone()) {
            return existing_outcome(existing);
        }

        if let Err(e) = self.inner.store.save(&record).await {
            tracing::warn!(job_id = %job_id, error = %e, "failed to persist queued job; continuing in memory");
        }

        self.inner
            .backlog
            .send(QueuedJob {
                job_id: job_id.clone(),
                invocation,
            })
            .map_err(|_| SubmitError::ShuttingDown)?;

        tracing::info!(job_id = %job_id, kind = %record.input.kind, "job queued");
        Ok(Submitted {
            job_id,
            status: JobStatus::Queued,
            existing: false,
        })
    }

    async fn find_existing(&self, job_id: &str) -> Option<JobRecord> {
        if let Some(rec) = self.inner.registry.get(job_id) {
            return Some(rec);
        }
        match self.inner.store.load(job_id).await {
            Ok(rec) => Some(rec),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "unreadable stored record; id will be reused");
                None
            }
        }
    }

    pub fn status(&self) -> StatusReader {
        StatusReader::new(self.inner.registry.clone(), self.inner.store.clone())
    }

    pub fn store(&self) -> &StatusStore {
        &self.inner.store
    }

    pub fn planner_kinds(&self) -> Vec<String> {
        self.inner.planners.kinds()
    }

    /// Whether each registered kind currently accepts submits.
    pub async fn readiness(&self) -> BTreeMap<String, bool> {
        let mut out = BTreeMap::new();
        for kind in self.inner.planners.kinds() {
            let ready = match self.inner.planners.options(&kind) {
                Ok(opts) => opts.is_ready().await,
                Err(_) => false,
            };
            out.insert(kind, ready);
        }
        out
    }

    /// Stop dispatching and wait for running jobs to finish. Jobs still in
    /// the backlog stay `queued` on disk.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "dispatcher task ended abnormally");
            }
        }
    }
}

fn existing_outcome(existing: JobRecord) -> Result<Submitted, SubmitError> {
    if existing.is_terminal() {
        return Err(SubmitError::DuplicateId(existing.job_id));
    }
    Ok(Submitted {
        job_id: existing.job_id,
        status: existing.status,
        existing: true,
    })
}

/// Ids double as directory names under the jobs root.
pub fn validate_job_id(id: &str) -> Result<(), SubmitError> {
    if is_safe_job_id(id) {
        Ok(())
    } else {
        Err(SubmitError::InvalidId(id.to_string()))
    }
}

async fn dispatch_loop(
    mut backlog: mpsc::UnboundedReceiver<QueuedJob>,
    runner: JobRunner,
    slots: usize,
    shutdown: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(slots));
    let mut in_flight = JoinSet::new();

    loop {
        // Take a slot first, then the next job, so the backlog head is only
        // removed when it can actually run.
        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job = backlog.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        tracing::debug!(job_id = %job.job_id, "dispatching job");
        let runner = runner.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            runner.run(job).await;
        });

        while let Some(res) = in_flight.try_join_next() {
            log_join(res);
        }
    }

    let pending = in_flight.len();
    if pending > 0 {
        tracing::info!(pending, "waiting for running jobs before shutdown");
    }
    while let Some(res) = in_flight.join_next().await {
        log_join(res);
    }
    tracing::info!("dispatcher stopped");
}

fn log_join(res: Result<(), tokio::task::JoinError>) {
    if let Err(e) = res {
        tracing::error!(error = %e, "job task panicked");
    }
}
