use std::env;

use genflow::config::Config;
use genflow::jobs::store::read_log_tail;
use genflow::jobs::{JobRecord, StatusStore};

const USAGE: &str = "genflowctl <command>\n\
     Commands:\n\
     - list\n\
     - status <job_id>\n\
     - log <job_id> [lines]\n\
     - reconcile        (mark orphaned queued/running jobs failed; service must be stopped)\n\
     \n\
     Uses GENFLOW_JOBS_ROOT (default /workspace/jobs).\n";

const ORPHAN_ERROR: &str = "orphaned: service stopped before the job finished";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let cfg = Config::from_env()?;
    let store = StatusStore::new(cfg.jobs_root.clone());

    match args[1].as_str() {
        "list" => list(&store).await?,
        "status" => {
            let id = required_id(&args, "status")?;
            let rec = store.load(id).await?;
            println!("{}", serde_json::to_string_pretty(&rec)?);
        }
        "log" => {
            let id = required_id(&args, "log")?;
            let n: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(120);
            let rec = store.load(id).await?;
            for line in read_log_tail(&rec.log_location, n.clamp(1, 1000)).await? {
                println!("{line}");
            }
        }
        "reconcile" => reconcile(&store).await?,
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn required_id<'a>(args: &'a [String], cmd: &str) -> anyhow::Result<&'a str> {
    args.get(2)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("usage: genflowctl {cmd} <job_id>"))
}

async fn list(store: &StatusStore) -> anyhow::Result<()> {
    let records = store.list().await?;
    for rec in &records {
        println!("{}", summary_line(rec));
    }
    println!("{} job(s) under {}", records.len(), store.root().display());
    Ok(())
}

fn summary_line(rec: &JobRecord) -> String {
    let progress = if rec.progress.total > 0 {
        format!("{}/{}", rec.progress.done, rec.progress.total)
    } else {
        "-".to_string()
    };
    format!(
        "{:<34} {:<10} {:<8} {:>11} {}",
        rec.job_id,
        rec.status,
        rec.input.kind,
        progress,
        rec.error
            .as_deref()
            .or(rec.output_location.as_deref())
            .unwrap_or("")
    )
}

async fn reconcile(store: &StatusStore) -> anyhow::Result<()> {
    let mut fixed = 0;
    for mut rec in store.list().await? {
        if rec.is_terminal() {
            continue;
        }
        let was = rec.status;
        rec.mark_failed(None, ORPHAN_ERROR.to_string());
        store.save(&rec).await?;
        println!("~ {} {} -> failed", rec.job_id, was);
        fixed += 1;
    }
    println!("reconciled {fixed} job(s)");
    Ok(())
}
