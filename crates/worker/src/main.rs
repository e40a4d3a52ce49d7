use genflow::api;
use genflow::config;
use genflow::jobs::{Scheduler, StatusStore};
use genflow::logging;

mod handlers;
use handlers::build_registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    logging::init(cfg.log_format);

    let api_addr = cfg.api_addr.clone();

    tracing::info!(
        jobs_root = %cfg.jobs_root.display(),
        worker_slots = cfg.worker_slots,
        log_ring_lines = cfg.log_ring_lines,
        flush_interval_ms = cfg.flush_interval_ms,
        max_resident_jobs = cfg.max_resident_jobs,
        exec_enabled = cfg.enable_exec,
        status_dir = %cfg.status_dir.display(),
        public_base = %cfg.public_base,
        api = %api_addr.as_deref().unwrap_or("disabled"),
        "genflow worker starting"
    );

    tokio::fs::create_dir_all(&cfg.jobs_root).await?;

    let planners = build_registry(&cfg.tools, cfg.enable_exec)?;
    tracing::info!(kinds = ?planners.kinds(), "planners registered");

    let store = StatusStore::new(cfg.jobs_root.clone());
    let scheduler = Scheduler::start(cfg.scheduler(), store, planners);

    // ---- API task ----
    let app = api::router(api::ApiState::new(scheduler.clone()).with_init_flag(cfg.init_flag()));

    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(%addr, "status api listening");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    let result: anyhow::Result<()> = tokio::select! {
        res = api_handle => match res {
            Ok(inner) => inner,
            Err(e) => Err(e.into()),
        },
        res = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            res.map_err(Into::into)
        }
    };

    scheduler.shutdown().await;
    tracing::info!("genflow worker stopped");
    result
}
