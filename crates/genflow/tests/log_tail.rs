mod common;

use std::time::Duration;

use common::{sh, start, wait_terminal};
use genflow::jobs::JobStatus;

fn expected(from: u32, to: u32) -> Vec<String> {
    (from..=to).map(|i| i.to_string()).collect()
}

#[tokio::test]
async fn tail_matches_while_running_and_after() -> anyhow::Result<()> {
    let h = start(1);
    let sub = h.scheduler.submit(sh("seq 1 500; sleep 2"), None).await?;

    // wait until the last line has been seen while the job still sleeps
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let live = loop {
        let tail = h.scheduler.status().get_log_tail(&sub.job_id, Some(50)).await?;
        if tail.lines.last().map(String::as_str) == Some("500") {
            break tail;
        }
        assert!(tokio::time::Instant::now() < deadline, "output never arrived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(live.status, JobStatus::Running);
    assert_eq!(live.lines, expected(451, 500));

    let rec = wait_terminal(&h.scheduler, &sub.job_id).await;
    assert_eq!(rec.status, JobStatus::Succeeded);

    let done = h.scheduler.status().get_log_tail(&sub.job_id, Some(50)).await?;
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.lines, expected(451, 500));

    h.scheduler.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn large_tail_while_running_reads_the_log_file() -> anyhow::Result<()> {
    let h = start(1);
    let sub = h.scheduler.submit(sh("seq 1 500; sleep 2"), None).await?;

    // more lines than the in-memory ring holds; needs a flush to reach disk
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let tail = loop {
        let tail = h.scheduler.status().get_log_tail(&sub.job_id, Some(400)).await?;
        if tail.lines.len() == 400 && tail.lines.last().map(String::as_str) == Some("500") {
            break tail;
        }
        assert!(tokio::time::Instant::now() < deadline, "log file never caught up");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(tail.lines, expected(101, 500));

    wait_terminal(&h.scheduler, &sub.job_id).await;
    h.scheduler.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn tail_size_is_clamped_and_defaults() -> anyhow::Result<()> {
    let h = start(1);
    let sub = h.scheduler.submit(sh("seq 1 300"), None).await?;
    wait_terminal(&h.scheduler, &sub.job_id).await;

    let status = h.scheduler.status();
    assert_eq!(status.get_log_tail(&sub.job_id, None).await?.lines, expected(181, 300));
    assert_eq!(status.get_log_tail(&sub.job_id, Some(0)).await?.lines, expected(300, 300));
    assert_eq!(status.get_log_tail(&sub.job_id, Some(5000)).await?.lines.len(), 300);

    h.scheduler.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn log_file_is_written_next_to_the_record() -> anyhow::Result<()> {
    let h = start(1);
    let sub = h.scheduler.submit(sh("echo out; echo err >&2"), None).await?;
    let rec = wait_terminal(&h.scheduler, &sub.job_id).await;

    assert_eq!(rec.log_location, h.dir.path().join(&sub.job_id).join("job.log"));
    let body = tokio::fs::read_to_string(&rec.log_location).await?;
    let mut lines: Vec<&str> = body.lines().collect();
    lines.sort();
    assert_eq!(lines, vec!["err", "out"]);

    h.scheduler.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn carriage_return_progress_is_capped_per_line() -> anyhow::Result<()> {
    let h = start(1);
    // 200k bytes of `\r`-separated progress with no newline, then a real line
    let sub = h
        .scheduler
        .submit(
            sh("i=0; while [ $i -lt 20000 ]; do printf '%08d\\r' $i; i=$((i+1)); done; echo; echo finished"),
            None,
        )
        .await?;
    let rec = wait_terminal(&h.scheduler, &sub.job_id).await;
    assert_eq!(rec.status, JobStatus::Succeeded);

    let tail = h.scheduler.status().get_log_tail(&sub.job_id, Some(5)).await?;
    assert_eq!(tail.lines.len(), 2);
    assert_eq!(tail.lines[0].len(), genflow::jobs::process::MAX_LINE_BYTES);
    assert_eq!(tail.lines[1], "finished");

    let on_disk = tokio::fs::read(&rec.log_location).await?;
    assert!(on_disk.len() <= genflow::jobs::process::MAX_LINE_BYTES + "finished\n".len() + 1);

    h.scheduler.shutdown().await;
    Ok(())
}
