//! Template entry path for `--config-j2`.
//!
//! Renders a Jinja-style launch template to YAML text before the normal
//! document validation runs. Template variables come from `--var-<name>=<value>`
//! command-line arguments; undefined variables are hard errors so a typo
//! fails before any child starts.

use anyhow::{Context, Result, bail};
use minijinja::{Environment, UndefinedBehavior, context, path_loader};
use std::collections::HashMap;
use std::path::Path;

/// Split raw CLI tokens into (template args, CLI-parser args).
///
/// `--var-*` tokens always belong to the template loader. Any other `--flag`
/// whose key is not a known launcher flag is preserved for the template
/// loader as well instead of failing the parse (the loader ignores what it
/// does not understand). A value following an unknown bare flag travels with
/// it.
pub fn split_extra_args(raw: &[String]) -> (Vec<String>, Vec<String>) {
    const KNOWN: &[&str] = &[
        "--config",
        "--config-j2",
        "--cwd",
        "--name",
        "--quiet",
        "--gui",
        "--sentinel",
        "--verbose",
        "-v",
        "-vv",
        "--help",
        "-h",
        "--version",
        "-V",
    ];

    let mut extra = Vec::new();
    let mut cli = Vec::new();
    let mut iter = raw.iter().peekable();
    while let Some(arg) = iter.next() {
        if arg.starts_with("--var-") {
            extra.push(arg.clone());
            continue;
        }
        if arg.starts_with("--") {
            let key = arg.split('=').next().unwrap_or(arg.as_str());
            if !KNOWN.contains(&key) {
                extra.push(arg.clone());
                // A separate value token travels with its unknown flag.
                if !arg.contains('=')
                    && let Some(next) = iter.peek()
                    && !next.starts_with('-')
                {
                    extra.push(iter.next().unwrap().clone());
                }
                continue;
            }
        }
        cli.push(arg.clone());
    }
    (extra, cli)
}

/// Extract the `vars` mapping from `--var-<name>=<value>` arguments.
pub fn parse_template_vars(extra_args: &[String]) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    for arg in extra_args {
        if let Some(rest) = arg.strip_prefix("--var-") {
            let Some((name, value)) = rest.split_once('=') else {
                bail!("template variable must be --var-NAME=VALUE, got `{arg}`");
            };
            if name.is_empty() {
                bail!("template variable must be --var-NAME=VALUE, got `{arg}`");
            }
            vars.insert(name.to_string(), value.to_string());
        }
    }
    Ok(vars)
}

/// Render a launch template file to launch-document text.
///
/// The template sees `configdir`, `configpath`, `env` (the launcher's full
/// environment), `vars` (from `--var-*`), and `platform`. Includes resolve
/// relative to the template's own directory.
pub fn render_launch_template(config_path: &Path, extra_args: &[String]) -> Result<String> {
    let absolute = std::fs::canonicalize(config_path)
        .with_context(|| format!("resolve template path {}", config_path.display()))?;
    let config_dir = absolute
        .parent()
        .context("template file has no parent directory")?
        .to_path_buf();
    let text = std::fs::read_to_string(&absolute)
        .with_context(|| format!("read template {}", absolute.display()))?;

    let vars = parse_template_vars(extra_args)?;
    let env_map: HashMap<String, String> = std::env::vars().collect();

    let mut env = Environment::new();
    env.set_loader(path_loader(&config_dir));
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);

    env.render_str(
        &text,
        context! {
            configdir => config_dir.display().to_string(),
            configpath => absolute.display().to_string(),
            env => env_map,
            vars => vars,
            platform => std::env::consts::OS,
        },
    )
    .with_context(|| format!("render template {}", absolute.display()))
}

// ---------- Unit tests ----------
