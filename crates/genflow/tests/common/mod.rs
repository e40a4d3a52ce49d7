use std::path::Path;
use std::time::Duration;

use genflow::jobs::{
    parse_params, Invocation, JobRecord, JobStatus, PlannerRegistry, PrepareStep, ProgressRule,
    Scheduler, SchedulerConfig, StatusStore, WorkDescriptor,
};
use serde::Deserialize;
use serde_json::json;
use tempfile::TempDir;

pub const MISSING_PROGRAM: &str = "/nonexistent/genflow-test-no-such-binary";

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ShParams {
    script: String,
    /// File name inside the job directory that must exist afterwards.
    artifact: Option<String>,
    /// Enables the `step N` progress rule with this total.
    total: Option<u64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FetchParams {
    url: String,
}

/// Planners used by the integration tests: `sh` runs a shell snippet,
/// `missing` names a program that cannot be spawned, `fetch` downloads a URL
/// before running `true`.
pub fn test_planners() -> PlannerRegistry {
    let mut planners = PlannerRegistry::new();
    planners.register("sh", |desc, paths| {
        let p: ShParams = parse_params(desc)?;
        let mut inv = Invocation::new("sh", ["-c".to_string(), p.script]).cwd(paths.dir.clone());
        if let Some(name) = p.artifact {
            inv = inv.expect_artifact(paths.dir.join(name));
        }
        if let Some(total) = p.total {
            let rule = ProgressRule::new(r"^step (\d+)$", 0).expect("progress regex");
            inv = inv.progress(rule, total);
        }
        Ok(inv)
    });
    planners.register("missing", |_desc, _paths| {
        Ok(Invocation::new(MISSING_PROGRAM, Vec::<String>::new()))
    });
    planners.register("fetch", |desc, paths| {
        let p: FetchParams = parse_params(desc)?;
        Ok(Invocation::new("true", Vec::<String>::new()).prepare(PrepareStep::Download {
            url: p.url,
            dest: paths.dir.join("input.bin"),
        }))
    });
    planners
}

pub struct Harness {
    // Keeps the jobs root alive for the duration of the test.
    pub dir: TempDir,
    pub scheduler: Scheduler,
}

impl Harness {
    pub fn store(&self) -> StatusStore {
        StatusStore::new(self.dir.path())
    }
}

#[allow(dead_code)]
pub fn start(worker_slots: usize) -> Harness {
    start_with(SchedulerConfig {
        worker_slots,
        flush_interval: Duration::from_millis(200),
        ..SchedulerConfig::default()
    })
}

pub fn start_with(config: SchedulerConfig) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let scheduler = start_in(dir.path(), config);
    Harness { dir, scheduler }
}

pub fn start_in(root: &Path, config: SchedulerConfig) -> Scheduler {
    Scheduler::start(config, StatusStore::new(root), test_planners())
}

#[allow(dead_code)]
pub fn sh(script: &str) -> WorkDescriptor {
    WorkDescriptor::new("sh", json!({ "script": script }))
}

/// Poll until the job reaches `want` (or any terminal state when `want` is
/// terminal and the job ended differently). Panics after `timeout`.
#[allow(dead_code)]
pub async fn wait_for_status(
    scheduler: &Scheduler,
    job_id: &str,
    want: JobStatus,
    timeout: Duration,
) -> JobRecord {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let rec = scheduler
            .status()
            .get_status(job_id)
            .await
            .expect("job should be known");
        if rec.status == want || (want.is_terminal() && rec.is_terminal()) {
            return rec;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("job {job_id} still {} after {timeout:?}, wanted {want}", rec.status);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[allow(dead_code)]
pub async fn wait_terminal(scheduler: &Scheduler, job_id: &str) -> JobRecord {
    wait_for_status(scheduler, job_id, JobStatus::Succeeded, Duration::from_secs(20)).await
}
