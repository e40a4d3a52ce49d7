use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::SubmitError;
use crate::jobs::model::WorkDescriptor;
use crate::jobs::process::Invocation;
use crate::jobs::store::JobPaths;

type PlanFn =
    dyn Fn(&WorkDescriptor, &JobPaths) -> Result<Invocation, SubmitError> + Send + Sync;

/// Per-kind submit rules that apply before the planner runs.
#[derive(Debug, Clone, Default)]
pub struct PlannerOptions {
    id_prefix: String,
    ready_flags: Vec<PathBuf>,
}

impl PlannerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix for generated ids, e.g. `zimg_`. Caller ids are taken as-is.
    pub fn id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }

    /// Submits are refused until this file exists.
    pub fn ready_flag(mut self, path: impl Into<PathBuf>) -> Self {
        self.ready_flags.push(path.into());
        self
    }

    pub fn prefix(&self) -> &str {
        &self.id_prefix
    }

    pub fn ready_flags(&self) -> &[PathBuf] {
        &self.ready_flags
    }

    /// True once every ready flag exists.
    pub async fn is_ready(&self) -> bool {
        for flag in &self.ready_flags {
            if !flag_exists(flag).await {
                return false;
            }
        }
        true
    }
}

pub(crate) async fn flag_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

struct PlannerEntry {
    plan: Box<PlanFn>,
    options: PlannerOptions,
}

/// Maps a descriptor `kind` to the function that turns it into a command.
///
/// Planners run at submit time, so a malformed descriptor is rejected before
/// a job record exists.
#[derive(Clone, Default)]
pub struct PlannerRegistry {
    planners: HashMap<String, Arc<PlannerEntry>>,
}

impl PlannerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: &str, planner: F)
    where
        F: Fn(&WorkDescriptor, &JobPaths) -> Result<Invocation, SubmitError>
            + Send
            + Sync
            + 'static,
    {
        self.register_with_options(kind, planner, PlannerOptions::new());
    }

    pub fn register_with_options<F>(&mut self, kind: &str, planner: F, options: PlannerOptions)
    where
        F: Fn(&WorkDescriptor, &JobPaths) -> Result<Invocation, SubmitError>
            + Send
            + Sync
            + 'static,
    {
        self.planners.insert(
            kind.to_string(),
            Arc::new(PlannerEntry {
                plan: Box::new(planner),
                options,
            }),
        );
    }

    pub fn options(&self, kind: &str) -> Result<&PlannerOptions, SubmitError> {
        self.planners
            .get(kind)
            .map(|e| &e.options)
            .ok_or_else(|| SubmitError::UnknownKind(kind.to_string()))
    }

    pub fn plan(&self, desc: &WorkDescriptor, paths: &JobPaths) -> Result<Invocation, SubmitError> {
        let entry = self
            .planners
            .get(&desc.kind)
            .ok_or_else(|| SubmitError::UnknownKind(desc.kind.clone()))?;
        (entry.plan)(desc, paths)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.planners.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Decode `params` into a planner's parameter struct.
pub fn parse_params<T: DeserializeOwned>(desc: &WorkDescriptor) -> Result<T, SubmitError> {
    let params = if desc.params.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        desc.params.clone()
    };
    serde_json::from_value(params).map_err(|e| SubmitError::bad_descriptor(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::path::PathBuf;

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct EchoParams {
        text: String,
    }

    fn paths() -> JobPaths {
        JobPaths {
            job_id: "j".into(),
            dir: PathBuf::from("/tmp/j"),
            status_file: PathBuf::from("/tmp/j/job_status.json"),
            log_file: PathBuf::from("/tmp/j/job.log"),
        }
    }

    fn registry() -> PlannerRegistry {
        let mut reg = PlannerRegistry::new();
        reg.register("echo", |desc, _paths| {
            let p: EchoParams = parse_params(desc)?;
            Ok(Invocation::new("echo", [p.text]))
        });
        reg
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = registry()
            .plan(&WorkDescriptor::new("paint", json!({})), &paths())
            .unwrap_err();
        assert!(matches!(err, SubmitError::UnknownKind(k) if k == "paint"));
    }

    #[test]
    fn unknown_param_keys_are_rejected() {
        let err = registry()
            .plan(
                &WorkDescriptor::new("echo", json!({"text": "hi", "colour": "red"})),
                &paths(),
            )
            .unwrap_err();
        assert!(matches!(err, SubmitError::BadDescriptor(msg) if msg.contains("colour")));
    }

    #[tokio::test]
    async fn options_gate_on_ready_flags() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("ready");
        let mut reg = registry();
        reg.register_with_options(
            "gated",
            |_desc, _paths| Ok(Invocation::new("true", Vec::<String>::new())),
            PlannerOptions::new().id_prefix("g_").ready_flag(&flag),
        );

        let opts = reg.options("gated").unwrap();
        assert_eq!(opts.prefix(), "g_");
        assert!(!opts.is_ready().await);
        std::fs::write(&flag, "").unwrap();
        assert!(opts.is_ready().await);

        assert!(reg.options("echo").unwrap().is_ready().await);
        assert!(matches!(reg.options("paint"), Err(SubmitError::UnknownKind(_))));
    }

    #[test]
    fn plans_known_kind() {
        let inv = registry()
            .plan(&WorkDescriptor::new("echo", json!({"text": "hi"})), &paths())
            .unwrap();
        assert_eq!(inv.argv(), vec!["echo", "hi"]);
    }
}
