mod common;

use std::path::PathBuf;

use common::{sh, start_in, start_with, wait_terminal};
use genflow::error::{StatusError, StoreError};
use genflow::jobs::{JobRecord, JobStatus, SchedulerConfig, StatusStore, WorkDescriptor};
use serde_json::json;

fn record(id: &str) -> JobRecord {
    JobRecord::new_queued(
        id.to_string(),
        WorkDescriptor::new("sh", json!({"script": "true"})),
        PathBuf::from(format!("/jobs/{id}/job.log")),
    )
}

#[tokio::test]
async fn saving_twice_equals_saving_once() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = StatusStore::new(dir.path());

    let mut rec = record("twice");
    rec.mark_running(vec!["sh".into(), "-c".into(), "true".into()], 10);
    rec.progress.advance_to(4);

    store.save(&rec).await?;
    let once = store.load("twice").await?;
    store.save(&rec).await?;
    let twice = store.load("twice").await?;

    assert_eq!(once, rec);
    assert_eq!(twice, once);
    assert!(!dir.path().join("twice").join("job_status.json.tmp").exists());
    Ok(())
}

#[tokio::test]
async fn running_record_survives_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let store = StatusStore::new(dir.path());
        let mut rec = record("crashed");
        rec.mark_running(vec!["sleep".into(), "600".into()], 0);
        store.save(&rec).await?;
        // process "dies" here with the job still running
    }

    let store = StatusStore::new(dir.path());
    let loaded = store.load("crashed").await?;
    assert_eq!(loaded.status, JobStatus::Running);
    assert!(loaded.finished_at.is_none());

    // a fresh scheduler reports the orphan as-is
    let scheduler = start_in(dir.path(), SchedulerConfig::default());
    let rec = scheduler.status().get_status("crashed").await?;
    assert_eq!(rec.status, JobStatus::Running);
    scheduler.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn corrupt_record_is_reported_not_found() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let job_dir = dir.path().join("broken");
    tokio::fs::create_dir_all(&job_dir).await?;
    tokio::fs::write(job_dir.join("job_status.json"), b"{ not json").await?;

    let store = StatusStore::new(dir.path());
    assert!(matches!(store.load("broken").await, Err(StoreError::Corrupt { .. })));
    assert!(matches!(store.load("absent").await, Err(StoreError::NotFound(_))));

    let scheduler = start_in(dir.path(), SchedulerConfig::default());
    let err = scheduler.status().get_status("broken").await.unwrap_err();
    assert!(matches!(err, StatusError::NotFound(id) if id == "broken"));
    scheduler.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn list_skips_unreadable_records() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = StatusStore::new(dir.path());
    store.save(&record("one")).await?;
    store.save(&record("two")).await?;
    tokio::fs::create_dir_all(dir.path().join("junk")).await?;
    tokio::fs::write(dir.path().join("junk").join("job_status.json"), b"[]").await?;
    tokio::fs::write(dir.path().join("stray.txt"), b"x").await?;

    let ids: Vec<String> = store.list().await?.into_iter().map(|r| r.job_id).collect();
    assert_eq!(ids, vec!["one", "two"]);
    Ok(())
}

#[tokio::test]
async fn evicted_jobs_are_served_from_the_store() -> anyhow::Result<()> {
    let h = start_with(SchedulerConfig {
        max_resident_jobs: 1,
        ..SchedulerConfig::default()
    });

    let first = h.scheduler.submit(sh("echo first"), None).await?;
    wait_terminal(&h.scheduler, &first.job_id).await;
    let second = h.scheduler.submit(sh("echo second"), None).await?;
    wait_terminal(&h.scheduler, &second.job_id).await;

    // eviction runs right after the final save, which may trail the status flip
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    let resident = loop {
        let resident: Vec<String> = h
            .scheduler
            .status()
            .list(None)
            .into_iter()
            .map(|r| r.job_id)
            .collect();
        if resident.len() == 1 || tokio::time::Instant::now() >= deadline {
            break resident;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    };
    assert_eq!(resident, vec![second.job_id.clone()]);

    let rec = h.scheduler.status().get_status(&first.job_id).await?;
    assert_eq!(rec.status, JobStatus::Succeeded);
    let tail = h.scheduler.status().get_log_tail(&first.job_id, Some(5)).await?;
    assert_eq!(tail.lines, vec!["first"]);

    h.scheduler.shutdown().await;
    Ok(())
}
