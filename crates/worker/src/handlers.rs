use std::path::{Path, PathBuf};

use genflow::config::ToolPaths;
use genflow::error::SubmitError;
use genflow::jobs::{
    parse_params, Invocation, JobPaths, PlannerOptions, PlannerRegistry, PrepareStep,
    ProgressRule, WorkDescriptor,
};
use regex::Regex;
use serde::{Deserialize, Serialize};

const UPSCALE_PROGRESS: &str = r"Testing\s+(\d+)\s+frame_";
const UPSCALE_SCRIPT_CANDIDATES: &[&str] = &[
    "/workspace/upscaler_installer_minimal/upscale_video_ai_cuda.sh",
    "/workspace/realesrgan_gpu_pack/upscale_video_ai_cuda.sh",
    "/workspace/upscale_video_ai_cuda.sh",
];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "webm"];
const LTX_PIPELINE: &str = "packages/ltx-pipelines/src/ltx_pipelines/ti2vid_two_stages.py";
const ZIMAGE_WORKER: &str = include_str!("zimage_worker.py");

fn bad(msg: impl Into<String>) -> SubmitError {
    SubmitError::bad_descriptor(msg)
}

// ---- exec ----

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecParams {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    cwd: Option<PathBuf>,
    /// Relative paths resolve inside the job directory.
    artifact: Option<PathBuf>,
    progress_pattern: Option<String>,
    #[serde(default)]
    progress_offset: u64,
    #[serde(default)]
    total: u64,
}

fn plan_exec(desc: &WorkDescriptor, paths: &JobPaths) -> Result<Invocation, SubmitError> {
    let p: ExecParams = parse_params(desc)?;
    if p.program.trim().is_empty() {
        return Err(bad("program is required"));
    }

    let mut inv = Invocation::new(p.program, p.args).cwd(p.cwd.unwrap_or_else(|| paths.dir.clone()));

    if let Some(artifact) = p.artifact {
        inv = inv.expect_artifact(resolve_in_job_dir(paths, &artifact)?);
    }

    if let Some(pattern) = p.progress_pattern {
        let rule = ProgressRule::new(&pattern, p.progress_offset)
            .map_err(|e| bad(format!("invalid progress_pattern: {e}")))?;
        inv = inv.progress(rule, p.total);
    }

    Ok(inv)
}

fn resolve_in_job_dir(paths: &JobPaths, path: &Path) -> Result<PathBuf, SubmitError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(bad(format!("path escapes the job directory: {}", path.display())));
    }
    Ok(paths.dir.join(path))
}

// ---- upscale ----

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpscaleParams {
    #[serde(alias = "in")]
    input_path: Option<PathBuf>,
    /// Fetched into the job directory before the script starts.
    input_url: Option<String>,
    output_name: Option<String>,
    model: Option<String>,
    scale: Option<u32>,
    target: Option<String>,
    #[serde(default)]
    tile: u32,
    #[serde(default)]
    keep_frames: bool,
    /// Frame count of the input, used as the progress total. Counted with
    /// ffprobe when absent.
    total_frames: Option<u64>,
}

/// Map user-facing model names (including the long Real-ESRGAN names) onto
/// the three variants the wrapper script understands.
fn normalize_model(model: Option<&str>, scale: Option<u32>) -> Result<&'static str, SubmitError> {
    let m = model.unwrap_or("").trim().to_lowercase();
    match m.as_str() {
        "x2" | "x2plus" | "realesrgan_x2plus" | "realesrgan-x2plus" => Ok("x2"),
        "x4" | "x4plus" | "realesrgan_x4plus" | "realesrgan-x4plus" => Ok("x4"),
        _ if m.contains("anime") => Ok("anime"),
        "" => match scale {
            None | Some(2) => Ok("x2"),
            Some(4) => Ok("x4"),
            Some(other) => Err(bad(format!("unsupported scale: {other}. use 2 or 4"))),
        },
        other => Err(bad(format!("unknown model: {other}. use x2, x4 or anime"))),
    }
}

fn sanitize_output_name(name: &str) -> String {
    let mut out: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    out = out.trim_start_matches('.').to_string();
    if out.is_empty() {
        out.push_str("output");
    }
    if !out.to_lowercase().ends_with(".mp4") {
        out.push_str(".mp4");
    }
    out
}

/// The configured script, or the first install location that exists.
fn resolve_upscale_script(configured: Option<&Path>) -> Result<PathBuf, SubmitError> {
    if let Some(path) = configured {
        return Ok(path.to_path_buf());
    }
    UPSCALE_SCRIPT_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
        .ok_or_else(|| SubmitError::NotReady("upscale script".to_string()))
}

/// `input.<ext>` keeping a known video extension from the URL path.
fn download_name(url: &str) -> Result<String, SubmitError> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| bad(format!("input_url must be http or https: {url}")))?;
    let path = rest
        .split(['?', '#'])
        .next()
        .and_then(|r| r.split_once('/'))
        .map(|(_, p)| p)
        .unwrap_or("");
    let ext = path
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .filter(|e| VIDEO_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or_else(|| "mp4".to_string());
    Ok(format!("input.{ext}"))
}

fn plan_upscale(
    tools: &ToolPaths,
    target_re: &Regex,
    progress: &ProgressRule,
    desc: &WorkDescriptor,
    paths: &JobPaths,
) -> Result<Invocation, SubmitError> {
    let p: UpscaleParams = parse_params(desc)?;

    let mut prepare = Vec::new();
    let input = match (p.input_path, p.input_url) {
        (Some(path), _) => {
            if !path.is_absolute() {
                return Err(bad("input_path must be absolute"));
            }
            if !path.exists() {
                return Err(bad(format!("input not found: {}", path.display())));
            }
            path
        }
        (None, Some(url)) => {
            let dest = paths.dir.join(download_name(url.trim())?);
            prepare.push(PrepareStep::Download {
                url: url.trim().to_string(),
                dest: dest.clone(),
            });
            dest
        }
        (None, None) => return Err(bad("input_path or input_url is required")),
    };
    let script = resolve_upscale_script(tools.upscale_script.as_deref())?;

    let model = normalize_model(p.model.as_deref(), p.scale)?;
    let target = p
        .target
        .as_deref()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "none".to_string());
    if target != "none" && !target_re.is_match(&target) {
        return Err(bad(format!("invalid target: {target}. use WxH or none")));
    }

    let out_name = p
        .output_name
        .as_deref()
        .map(sanitize_output_name)
        .unwrap_or_else(|| format!("{}.mp4", paths.job_id));
    let out_path = paths.dir.join(out_name);

    let mut args = vec![
        script.display().to_string(),
        "--in".to_string(),
        input.display().to_string(),
        "--out".to_string(),
        out_path.display().to_string(),
        "--model".to_string(),
        model.to_string(),
        "--target".to_string(),
        target,
        "--tile".to_string(),
        p.tile.to_string(),
    ];
    if p.keep_frames {
        args.push("--keep-frames".to_string());
    }

    if p.total_frames.is_none() {
        prepare.push(PrepareStep::CountFrames {
            ffprobe: tools.ffprobe.clone(),
            input,
        });
    }

    let mut inv = Invocation::new("bash", args)
        .cwd(paths.dir.clone())
        .expect_artifact(out_path)
        .progress(progress.clone(), p.total_frames.unwrap_or(0));
    for step in prepare {
        inv = inv.prepare(step);
    }
    Ok(inv)
}

// ---- ltx2 ----

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Ltx2Params {
    prompt: String,
    #[serde(default)]
    overrides: Ltx2Overrides,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Ltx2Overrides {
    width: Option<u32>,
    height: Option<u32>,
    num_frames: Option<u32>,
    frame_rate: Option<f32>,
    seed: Option<u64>,
    #[serde(alias = "steps")]
    num_inference_steps: Option<u32>,
}

impl Ltx2Overrides {
    fn validate(&self) -> Result<(), SubmitError> {
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if let Some(v) = value {
                if !(64..=4096).contains(&v) || v % 64 != 0 {
                    return Err(bad(format!("{name} must be a multiple of 64 in 64..=4096, got {v}")));
                }
            }
        }
        if let Some(n) = self.num_frames {
            if n == 0 || n > 1001 || (n - 1) % 8 != 0 {
                return Err(bad(format!("num_frames must be 8k+1 and at most 1001, got {n}")));
            }
        }
        if let Some(fps) = self.frame_rate {
            if !(fps > 0.0 && fps <= 120.0) {
                return Err(bad(format!("frame_rate must be in (0, 120], got {fps}")));
            }
        }
        if let Some(steps) = self.num_inference_steps {
            if !(1..=200).contains(&steps) {
                return Err(bad(format!("num_inference_steps must be in 1..=200, got {steps}")));
            }
        }
        Ok(())
    }

    fn push_args(&self, args: &mut Vec<String>) {
        let mut flag = |name: &str, value: Option<String>| {
            if let Some(v) = value {
                args.push(format!("--{name}"));
                args.push(v);
            }
        };
        flag("width", self.width.map(|v| v.to_string()));
        flag("height", self.height.map(|v| v.to_string()));
        flag("num-frames", self.num_frames.map(|v| v.to_string()));
        flag("frame-rate", self.frame_rate.map(|v| v.to_string()));
        flag("seed", self.seed.map(|v| v.to_string()));
        flag(
            "num-inference-steps",
            self.num_inference_steps.map(|v| v.to_string()),
        );
    }
}

fn plan_ltx2(tools: &ToolPaths, desc: &WorkDescriptor, paths: &JobPaths) -> Result<Invocation, SubmitError> {
    let p: Ltx2Params = parse_params(desc)?;
    if p.prompt.trim().is_empty() {
        return Err(bad("prompt is required"));
    }
    p.overrides.validate()?;

    let ckpt = tools.ltx_root.join("checkpoints");
    let model_dir = ckpt.join("ltx-2");
    let output = paths.dir.join(format!("{}.mp4", paths.job_id));

    let mut args = vec![
        LTX_PIPELINE.to_string(),
        "--checkpoint-path".to_string(),
        model_dir.join("ltx-2-19b-dev-fp8.safetensors").display().to_string(),
        "--spatial-upsampler-path".to_string(),
        model_dir
            .join("ltx-2-spatial-upscaler-x2-1.0.safetensors")
            .display()
            .to_string(),
        "--distilled-lora".to_string(),
        model_dir
            .join("ltx-2-19b-distilled-lora-384.safetensors")
            .display()
            .to_string(),
        "1.0".to_string(),
        "--gemma-root".to_string(),
        ckpt.join("gemma-3").display().to_string(),
        "--prompt".to_string(),
        p.prompt,
        "--output-path".to_string(),
        output.display().to_string(),
        "--enable-fp8".to_string(),
    ];
    p.overrides.push_args(&mut args);

    Ok(Invocation::new(tools.python.clone(), args)
        .cwd(tools.ltx_root.clone())
        .expect_artifact(output))
}

// ---- zimage ----

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ZImageParams {
    prompt: String,
    #[serde(default = "default_side")]
    width: u32,
    #[serde(default = "default_side")]
    height: u32,
    #[serde(default = "default_steps")]
    steps: u32,
    #[serde(default)]
    guidance_scale: f32,
    /// `null` means unseeded.
    #[serde(default = "default_seed")]
    seed: Option<u64>,
}

fn default_side() -> u32 {
    768
}

fn default_steps() -> u32 {
    9
}

fn default_seed() -> Option<u64> {
    Some(42)
}

/// Contents of `request.json`, read by the generator through `JOB_JSON`.
#[derive(Debug, Serialize)]
struct ZImageRequest<'a> {
    prompt: &'a str,
    width: u32,
    height: u32,
    steps: u32,
    guidance_scale: f32,
    seed: Option<u64>,
    out_path: &'a Path,
}

impl ZImageParams {
    fn validate(&self) -> Result<(), SubmitError> {
        if self.prompt.trim().is_empty() {
            return Err(bad("prompt is required"));
        }
        for (name, v) in [("width", self.width), ("height", self.height)] {
            if !(256..=2048).contains(&v) {
                return Err(bad(format!("{name} must be in 256..=2048, got {v}")));
            }
        }
        if !(1..=30).contains(&self.steps) {
            return Err(bad(format!("steps must be in 1..=30, got {}", self.steps)));
        }
        if !(0.0..=20.0).contains(&self.guidance_scale) {
            return Err(bad(format!(
                "guidance_scale must be in 0..=20, got {}",
                self.guidance_scale
            )));
        }
        Ok(())
    }
}

fn plan_zimage(tools: &ToolPaths, desc: &WorkDescriptor, paths: &JobPaths) -> Result<Invocation, SubmitError> {
    let p: ZImageParams = parse_params(desc)?;
    p.validate()?;

    let out_path = paths.dir.join("out.png");
    let request_path = paths.dir.join("request.json");
    let request = serde_json::to_vec_pretty(&ZImageRequest {
        prompt: &p.prompt,
        width: p.width,
        height: p.height,
        steps: p.steps,
        guidance_scale: p.guidance_scale,
        seed: p.seed,
        out_path: &out_path,
    })
    .map_err(|e| bad(format!("encoding request: {e}")))?;

    Ok(Invocation::new(tools.python.clone(), ["-c", ZIMAGE_WORKER])
        .cwd(paths.dir.clone())
        .env("HF_HOME", tools.hf_home.display().to_string())
        .env("JOB_JSON", request_path.display().to_string())
        .prepare(PrepareStep::WriteFile {
            path: request_path,
            contents: request,
        })
        .expect_artifact(out_path))
}

pub fn build_registry(tools: &ToolPaths, enable_exec: bool) -> anyhow::Result<PlannerRegistry> {
    let mut registry = PlannerRegistry::new();

    if enable_exec {
        registry.register("exec", plan_exec);
    }

    let up_tools = tools.clone();
    let target_re = Regex::new(r"^\d+x\d+$")?;
    let progress = ProgressRule::new(UPSCALE_PROGRESS, 1)?;
    registry.register("upscale", move |desc, paths| {
        plan_upscale(&up_tools, &target_re, &progress, desc, paths)
    });

    let ltx_tools = tools.clone();
    registry.register("ltx2", move |desc, paths| plan_ltx2(&ltx_tools, desc, paths));

    let zimage_tools = tools.clone();
    registry.register_with_options(
        "zimage",
        move |desc, paths| plan_zimage(&zimage_tools, desc, paths),
        PlannerOptions::new()
            .id_prefix("zimg_")
            .ready_flag(tools.zimage_ready_flag.clone()),
    );

    Ok(registry)
}
