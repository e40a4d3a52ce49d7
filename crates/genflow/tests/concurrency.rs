mod common;

use std::time::Duration;

use common::{sh, start, wait_terminal};
use genflow::jobs::JobStatus;

async fn max_running_observed(slots: usize, jobs: usize) -> anyhow::Result<u64> {
    let h = start(slots);

    let mut ids = Vec::new();
    for _ in 0..jobs {
        ids.push(h.scheduler.submit(sh("sleep 0.4"), None).await?.job_id);
    }

    let mut max_running = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let counts = h.scheduler.status().counts();
        max_running = max_running.max(counts.running);
        if counts.succeeded + counts.failed == jobs as u64 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "jobs did not finish: {counts:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for id in &ids {
        let rec = h.scheduler.status().get_status(id).await?;
        assert_eq!(rec.status, JobStatus::Succeeded);
    }

    h.scheduler.shutdown().await;
    Ok(max_running)
}

#[tokio::test]
async fn single_slot_runs_one_job_at_a_time() -> anyhow::Result<()> {
    let max = max_running_observed(1, 4).await?;
    assert_eq!(max, 1);
    Ok(())
}

#[tokio::test]
async fn three_slots_never_exceed_three() -> anyhow::Result<()> {
    let max = max_running_observed(3, 7).await?;
    assert!(max <= 3, "saw {max} running");
    assert!(max >= 2, "slots were not used in parallel (max {max})");
    Ok(())
}

#[tokio::test]
async fn single_slot_dispatch_is_fifo() -> anyhow::Result<()> {
    let h = start(1);

    let a = h.scheduler.submit(sh("sleep 0.1"), Some("job-a".into())).await?;
    let b = h.scheduler.submit(sh("sleep 0.1"), Some("job-b".into())).await?;
    let c = h.scheduler.submit(sh("sleep 0.1"), Some("job-c".into())).await?;

    let ra = wait_terminal(&h.scheduler, &a.job_id).await;
    let rb = wait_terminal(&h.scheduler, &b.job_id).await;
    let rc = wait_terminal(&h.scheduler, &c.job_id).await;

    let (sa, sb, sc) = (
        ra.started_at.expect("a started"),
        rb.started_at.expect("b started"),
        rc.started_at.expect("c started"),
    );
    assert!(sa < sb && sb < sc, "start order {sa} {sb} {sc}");
    // strictly serial: each job starts after the previous one finished
    assert!(ra.finished_at.expect("a finished") <= sb);
    assert!(rb.finished_at.expect("b finished") <= sc);

    h.scheduler.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn status_reads_do_not_wait_for_running_jobs() -> anyhow::Result<()> {
    let h = start(1);
    let sub = h.scheduler.submit(sh("sleep 2"), None).await?;
    common::wait_for_status(&h.scheduler, &sub.job_id, JobStatus::Running, Duration::from_secs(5)).await;

    let started = std::time::Instant::now();
    for _ in 0..50 {
        h.scheduler.status().get_status(&sub.job_id).await?;
        h.scheduler.status().get_log_tail(&sub.job_id, Some(10)).await?;
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    wait_terminal(&h.scheduler, &sub.job_id).await;
    h.scheduler.shutdown().await;
    Ok(())
}
