//! drekar-launch — entry point
//!
//! Wires the CLI to the group supervisor: load the launch file (rendering
//! the template variant if asked), create the per-launch log directory,
//! install the exit-signal source, start everything, then wait for the
//! trigger and drive the bounded shutdown. Tracing logs go to stderr;
//! stdout carries only echoed child output.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use drekar_launch::group::Group;
use drekar_launch::signal::ExitEvent;
use drekar_launch::{cgroup, config, logdir, signal, template};

#[derive(Debug, Parser)]
#[command(name = "drekar-launch")]
#[command(about = "Multi-process launcher", long_about = None)]
struct Cli {
    /// Launch configuration file (default: drekar-launch.yaml in the CWD).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Launch configuration template (Jinja syntax, rendered before
    /// parsing; mutually exclusive with --config).
    #[arg(long = "config-j2")]
    config_j2: Option<PathBuf>,

    /// Default working directory for tasks that do not set one.
    #[arg(long, default_value = ".")]
    cwd: PathBuf,

    /// Override the launch name from the document.
    #[arg(long)]
    name: Option<String>,

    /// Do not echo child output to the terminal.
    #[arg(long)]
    quiet: bool,

    /// Launch the status window.
    #[arg(long)]
    gui: bool,

    /// [Internal] cgroup cleanup sentinel — not for direct use.
    #[arg(long, hide = true, num_args = 2, value_names = ["PARENT_PID", "SCOPE_PATH"])]
    sentinel: Option<Vec<String>>,

    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    // Template variables (--var-*) and other flags this version does not
    // know are split off before clap sees the command line; the template
    // loader is their only consumer.
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let (extra_args, cli_args) = template::split_extra_args(&raw);
    let cli = Cli::parse_from(std::iter::once("drekar-launch".to_string()).chain(cli_args));

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // Logs always go to stderr; stdout is reserved for child echo.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    match run(cli, extra_args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli, extra_args: Vec<String>) -> Result<i32> {
    if let Some(sentinel) = &cli.sentinel {
        let parent_pid: u32 = sentinel[0]
            .parse()
            .with_context(|| format!("bad sentinel parent pid: {}", sentinel[0]))?;
        cgroup::sentinel_main(parent_pid, &PathBuf::from(&sentinel[1]))?;
        return Ok(0);
    }

    if cli.config.is_some() && cli.config_j2.is_some() {
        bail!("only one of --config or --config-j2 can be specified");
    }

    let launch = if let Some(path) = &cli.config_j2 {
        let text = template::render_launch_template(path, &extra_args)?;
        config::load_launch_str(&text, &cli.cwd)?
    } else {
        let path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from("drekar-launch.yaml"));
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("read launch file {}", path.display()))?;
        config::load_launch_str(&text, &cli.cwd)?
    };

    let name = cli
        .name
        .clone()
        .or_else(|| launch.name.clone())
        .unwrap_or_else(|| "drekar-launch".to_string());

    let log_dir = logdir::create_launch_log_dir(&name)?;
    info!(log_dir = %log_dir.display(), "logging to");

    let exit_event = Arc::new(ExitEvent::new());
    signal::install_exit_handler(Arc::clone(&exit_event))?;

    let group = Group::new(
        name,
        launch.tasks,
        Arc::clone(&exit_event),
        log_dir,
        !cli.quiet,
    );

    if cli.gui {
        warn!("status window is not available in this build, continuing headless");
    }

    group.start_all()?;
    info!("press Ctrl-C to exit");
    exit_event.wait();

    info!("exit requested, stopping children");
    group.stop_all();
    group.wait_all_stopped();
    group.close();

    let status = group.exit_status();
    if status != 0 {
        info!(status, "launch finished with a non-zero child status");
    }
    Ok(status)
}
