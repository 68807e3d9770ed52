//! Launch-document validation.
//!
//! Turns a parsed YAML document (tree of maps, lists, scalars) into the
//! immutable [`ChildSpec`] list the group supervisor consumes. Parsing the
//! text itself is `serde_yaml`'s job; template expansion happens before this
//! layer (see `template`).

use anyhow::{Context, Result, bail};
use serde_yaml::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Immutable description of one managed child. Produced here, consumed by
/// the child supervisor, never mutated.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    /// Unique within a launch; log filename stem and state-event key.
    pub name: String,
    /// Absolute path to the executable (bare names are resolved via the
    /// computed environment's `PATH`).
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// The complete environment the child sees.
    pub environment: HashMap<String, String>,
    /// Re-spawn on exit.
    pub restart: bool,
    /// Pause between an exit and the next re-spawn.
    pub restart_backoff: Duration,
    /// Pause before the first spawn.
    pub start_delay: Duration,
    /// This child's exit triggers group shutdown.
    pub quit_on_terminate: bool,
    /// Opaque, passed through uninterpreted.
    pub tags: Vec<String>,
}

/// A validated launch: optional document-level name plus ordered specs.
#[derive(Debug)]
pub struct Launch {
    pub name: Option<String>,
    pub tasks: Vec<ChildSpec>,
}

/// Validate launch-file text against the launcher's own environment.
pub fn load_launch_str(text: &str, cwd: &Path) -> Result<Launch> {
    let doc: Value = serde_yaml::from_str(text).context("parse launch document")?;
    let base_env: HashMap<String, String> = std::env::vars().collect();
    load_launch_document(&doc, cwd, &base_env)
}

/// Validate a parsed launch document. `base_env` is the environment tasks
/// inherit (normally the launcher's own).
pub fn load_launch_document(
    doc: &Value,
    cwd: &Path,
    base_env: &HashMap<String, String>,
) -> Result<Launch> {
    let name = doc
        .get("name")
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .context("launch `name` must be a string")
        })
        .transpose()?;

    let tasks_value = doc
        .get("tasks")
        .context("launch document requires a `tasks` list")?;
    let tasks_seq = tasks_value
        .as_sequence()
        .context("`tasks` must be a list")?;

    let mut tasks = Vec::with_capacity(tasks_seq.len());
    let mut seen = HashSet::new();
    for task in tasks_seq {
        let spec = parse_task(task, cwd, base_env)?;
        if !seen.insert(spec.name.clone()) {
            bail!("duplicate task name: {}", spec.name);
        }
        tasks.push(spec);
    }

    Ok(Launch { name, tasks })
}

fn parse_task(task: &Value, cwd: &Path, base_env: &HashMap<String, String>) -> Result<ChildSpec> {
    let map = task.as_mapping().context("each task must be a mapping")?;

    let name = map
        .get("name")
        .and_then(Value::as_str)
        .context("task requires a `name` string")?
        .to_string();
    let within = |field: &str| format!("task `{name}`: {field}");

    let program = map
        .get("program")
        .and_then(Value::as_str)
        .with_context(|| within("requires a `program` string"))?
        .to_string();

    let task_cwd = match map.get("cwd") {
        Some(v) => PathBuf::from(
            v.as_str()
                .with_context(|| within("`cwd` must be a string"))?,
        ),
        None => cwd.to_path_buf(),
    };

    let args = match map.get("args") {
        Some(v) => parse_args(v).with_context(|| within("bad `args`"))?,
        None => Vec::new(),
    };

    let restart = parse_bool(map.get("restart"), false).with_context(|| within("`restart`"))?;
    let restart_backoff = parse_seconds(map.get("restart-backoff"), 5.0)
        .with_context(|| within("`restart-backoff`"))?;
    let start_delay =
        parse_seconds(map.get("start-delay"), 0.0).with_context(|| within("`start-delay`"))?;
    let quit_on_terminate = parse_bool(map.get("quit-on-terminate"), false)
        .with_context(|| within("`quit-on-terminate`"))?;

    let tags = match map.get("tags") {
        Some(v) => {
            let seq = v
                .as_sequence()
                .with_context(|| within("`tags` must be a list"))?;
            seq.iter()
                .map(|t| {
                    t.as_str()
                        .map(str::to_string)
                        .with_context(|| within("`tags` entries must be strings"))
                })
                .collect::<Result<Vec<_>>>()?
        }
        None => Vec::new(),
    };

    // Environment: launcher env + per-task overrides, unless an env-file
    // replaces the whole thing.
    let mut environment = base_env.clone();
    if let Some(env_value) = map.get("environment") {
        let env_map = env_value
            .as_mapping()
            .with_context(|| within("`environment` must be a mapping"))?;
        for (k, v) in env_map {
            let key = k
                .as_str()
                .with_context(|| within("`environment` keys must be strings"))?;
            environment.insert(key.to_string(), scalar_to_string(v)?);
        }
    }
    if let Some(env_file) = map.get("env-file") {
        let path = env_file
            .as_str()
            .with_context(|| within("`env-file` must be a string"))?;
        environment = load_env_file(path).with_context(|| within("`env-file`"))?;
    }

    let program = resolve_program(&program, &environment)
        .with_context(|| format!("task `{name}`: program `{program}`"))?;

    Ok(ChildSpec {
        name,
        program,
        args,
        cwd: task_cwd,
        environment,
        restart,
        restart_backoff,
        start_delay,
        quit_on_terminate,
        tags,
    })
}

/// `args` accepts a string (whitespace-split), a list (each element
/// stringified), or a bare scalar (single-element list).
fn parse_args(value: &Value) -> Result<Vec<String>> {
    match value {
        Value::String(s) => Ok(s.split_whitespace().map(str::to_string).collect()),
        Value::Sequence(seq) => seq.iter().map(scalar_to_string).collect(),
        Value::Bool(_) | Value::Number(_) => Ok(vec![scalar_to_string(value)?]),
        Value::Null => Ok(Vec::new()),
        _ => bail!("process args must be a string or list"),
    }
}

fn scalar_to_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        _ => bail!("expected a scalar value"),
    }
}

fn parse_bool(value: Option<&Value>, default: bool) -> Result<bool> {
    match value {
        None => Ok(default),
        Some(v) => v.as_bool().context("must be a boolean"),
    }
}

fn parse_seconds(value: Option<&Value>, default: f64) -> Result<Duration> {
    let secs = match value {
        None => default,
        Some(v) => v.as_f64().context("must be a number of seconds")?,
    };
    if !secs.is_finite() || secs < 0.0 {
        bail!("must be a non-negative number of seconds");
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Load an environment from a .env-style file: `KEY=VALUE` lines; blank
/// lines and lines starting with `#` are ignored. When a task names an
/// env-file, this is the child's *entire* environment.
pub fn load_env_file(path: &str) -> Result<HashMap<String, String>> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("read env-file {path}"))?;
    let mut vars = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(pos) = line.find('=') {
            vars.insert(line[..pos].to_string(), line[pos + 1..].to_string());
        }
    }
    Ok(vars)
}

/// Resolve a bare program name via the computed environment's `PATH`.
/// Programs with a directory component pass through untouched.
fn resolve_program(program: &str, env: &HashMap<String, String>) -> Result<PathBuf> {
    let as_path = Path::new(program);
    if as_path.file_name() != Some(std::ffi::OsStr::new(program)) {
        return Ok(PathBuf::from(program));
    }

    let path_var = env
        .get("PATH")
        .context("bare program name and no PATH in the computed environment")?;
    for dir in std::env::split_paths(path_var) {
        let candidate = dir.join(program);
        if is_executable_file(&candidate) {
            return Ok(candidate);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{program}.exe"));
            if is_executable_file(&exe) {
                return Ok(exe);
            }
        }
    }
    bail!("not found on PATH");
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(m) => m.is_file() && m.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

// ---------- Unit tests ----------
