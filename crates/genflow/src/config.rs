use std::path::PathBuf;
use std::time::Duration;

use crate::jobs::SchedulerConfig;
use crate::logging::LogFormat;

// Runtime configuration, loaded once from the environment (and `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    pub jobs_root: PathBuf,
    pub worker_slots: usize,
    pub api_addr: Option<String>,
    pub log_ring_lines: usize,
    pub flush_interval_ms: u64,
    pub max_resident_jobs: usize,
    pub log_format: LogFormat,
    /// Allow the free-form `exec` planner. Off unless explicitly enabled.
    pub enable_exec: bool,
    /// Base URL clients reach the API on; prefixes `output_url`.
    pub public_base: String,
    /// Directory holding the `init_done` and model ready flags.
    pub status_dir: PathBuf,
    pub tools: ToolPaths,
}

/// Where the built-in planners find their external programs and models.
#[derive(Clone, Debug)]
pub struct ToolPaths {
    pub python: String,
    pub ltx_root: PathBuf,
    /// `None` means search the usual install locations at submit time.
    pub upscale_script: Option<PathBuf>,
    pub ffprobe: String,
    pub hf_home: PathBuf,
    pub zimage_ready_flag: PathBuf,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let jobs_root = env_or_fallback("GENFLOW_JOBS_ROOT", "JOBS_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/workspace/jobs"));

        let worker_slots = env_or_fallback("GENFLOW_JOB_WORKERS", "UPSCALER_JOB_WORKERS")
            .map(|s| {
                s.trim()
                    .parse::<usize>()
                    .map_err(|_| anyhow::anyhow!("GENFLOW_JOB_WORKERS must be a number, got {s:?}"))
            })
            .transpose()?
            .unwrap_or(1)
            .clamp(1, 64);

        let api_addr = match env_or_fallback("GENFLOW_API_ADDR", "API_ADDR") {
            Some(s) => normalize_optional_addr(&s),
            None => Some("0.0.0.0:8000".to_string()),
        };

        let log_ring_lines = env_parse("GENFLOW_LOG_RING_LINES")
            .unwrap_or(220)
            .clamp(16, 5000);

        let flush_interval_ms = env_parse("GENFLOW_FLUSH_INTERVAL_MS")
            .unwrap_or(1500)
            .clamp(100, 60_000);

        let max_resident_jobs = env_parse("GENFLOW_MAX_RESIDENT_JOBS")
            .unwrap_or(1000)
            .max(1);

        let log_format = match env_or_fallback("GENFLOW_LOG_FORMAT", "LOG_FORMAT") {
            Some(s) => LogFormat::parse(&s)
                .ok_or_else(|| anyhow::anyhow!("GENFLOW_LOG_FORMAT must be text or json, got {s:?}"))?,
            None => LogFormat::Text,
        };

        let enable_exec = env_bool("GENFLOW_ENABLE_EXEC").unwrap_or(false);

        let public_base = env_or_fallback("GENFLOW_PUBLIC_BASE", "BASE_URL")
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .unwrap_or_default();

        let status_dir = env_or_fallback("GENFLOW_STATUS_DIR", "STATUS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/workspace/status"));

        let tools = ToolPaths {
            python: env_or_fallback("GENFLOW_PYTHON", "LTX_PYTHON")
                .unwrap_or_else(|| "python3".to_string()),
            ltx_root: env_or_fallback("GENFLOW_LTX_ROOT", "LTX_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/workspace/LTX-2")),
            upscale_script: env_or_fallback("GENFLOW_UPSCALE_SCRIPT", "UPSCALE_SCRIPT")
                .map(PathBuf::from),
            ffprobe: env_or_fallback("GENFLOW_FFPROBE", "FFPROBE_PATH")
                .unwrap_or_else(|| "ffprobe".to_string()),
            hf_home: env_or_fallback("GENFLOW_HF_HOME", "HF_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/workspace/.cache/hf")),
            zimage_ready_flag: env_or_fallback("GENFLOW_ZIMAGE_READY_FLAG", "ZIMAGE_READY_FLAG")
                .map(PathBuf::from)
                .unwrap_or_else(|| status_dir.join("zimage_ready")),
        };

        Ok(Self {
            jobs_root,
            worker_slots,
            api_addr,
            log_ring_lines,
            flush_interval_ms,
            max_resident_jobs,
            log_format,
            enable_exec,
            public_base,
            status_dir,
            tools,
        })
    }

    /// Written by the provisioning script once models are downloaded.
    pub fn init_flag(&self) -> PathBuf {
        self.status_dir.join("init_done")
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            worker_slots: self.worker_slots,
            log_ring_lines: self.log_ring_lines,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            max_resident_jobs: self.max_resident_jobs,
            public_base: self.public_base.clone(),
        }
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_addr_values() {
        assert_eq!(normalize_optional_addr("off"), None);
        assert_eq!(normalize_optional_addr(" NONE "), None);
        assert_eq!(normalize_optional_addr(""), None);
        assert_eq!(
            normalize_optional_addr("127.0.0.1:9000"),
            Some("127.0.0.1:9000".to_string())
        );
    }
}
