//! Per-child supervision.
//!
//! One [`ChildSupervisor`] per launch task, driven on its own thread:
//! optional start delay, then spawn → tail stdio → wait → restart decision,
//! until the task finishes for good or shutdown intervenes. The group talks
//! to it only through `close()`/`kill()`/`stopped()`; it talks back through
//! a [`GroupEvents`] endpoint and the shared exit trigger.

use anyhow::{Context, Result};
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error, warn};

use crate::cgroup::LaunchScope;
use crate::config::ChildSpec;
use crate::group::GroupEvents;
use crate::process::{self, ProcessControl};
use crate::signal::ExitEvent;

/// Externally observable child states. Within one life the emitted
/// sequence is strictly `StartPending, Running, Stopped` (possibly cut
/// short by a spawn failure, which still ends in `Stopped`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    StartPending,
    Running,
    Stopped,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::StartPending => write!(f, "start-pending"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopped => write!(f, "stopped"),
        }
    }
}

pub struct ChildSupervisor {
    spec: ChildSpec,
    log_dir: PathBuf,
    screen: bool,
    exit_event: Arc<ExitEvent>,
    events: GroupEvents,
    scope: Arc<LaunchScope>,
    keep_going: AtomicBool,
    /// Soft stops sent during the current shutdown; drives the Windows
    /// escalation ladder and never resets within one shutdown.
    term_attempts: AtomicU32,
    /// Live contained process, shared with the group's shutdown loop.
    process: Mutex<Option<Arc<ProcessControl>>>,
    /// Last observed exit status; -1 before the first exit.
    exit_status: AtomicI32,
    /// At least one spawn was attempted. A child cancelled during its start
    /// delay has no observable status and must not taint the aggregate.
    attempted: AtomicBool,
}

impl ChildSupervisor {
    pub fn new(
        spec: ChildSpec,
        log_dir: PathBuf,
        screen: bool,
        exit_event: Arc<ExitEvent>,
        events: GroupEvents,
        scope: Arc<LaunchScope>,
    ) -> Arc<Self> {
        Arc::new(ChildSupervisor {
            spec,
            log_dir,
            screen,
            exit_event,
            events,
            scope,
            keep_going: AtomicBool::new(true),
            term_attempts: AtomicU32::new(0),
            process: Mutex::new(None),
            exit_status: AtomicI32::new(-1),
            attempted: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// True when no contained process is currently held.
    pub fn stopped(&self) -> bool {
        self.process.lock().expect("process lock poisoned").is_none()
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::SeqCst)
    }

    /// True once this supervisor has tried to spawn its child at least once.
    pub fn attempted_start(&self) -> bool {
        self.attempted.load(Ordering::SeqCst)
    }

    /// Stop supervising and ask the child to terminate politely. Each call
    /// escalates the soft-stop attempt, so the group's shutdown loop can
    /// simply call this once a second.
    pub fn close(&self) {
        self.keep_going.store(false, Ordering::SeqCst);
        let control = self
            .process
            .lock()
            .expect("process lock poisoned")
            .clone();
        if let Some(control) = control {
            let attempt = self.term_attempts.fetch_add(1, Ordering::SeqCst);
            debug!(child = %self.spec.name, attempt, "soft stop");
            if let Err(e) = control.soft_stop(attempt) {
                warn!(child = %self.spec.name, "soft stop failed: {e:#}");
            }
        }
    }

    /// Unconditional termination of the child's container.
    pub fn kill(&self) {
        let control = self
            .process
            .lock()
            .expect("process lock poisoned")
            .clone();
        if let Some(control) = control {
            if let Err(e) = control.hard_kill() {
                warn!(child = %self.spec.name, "hard kill failed: {e:#}");
            }
        }
    }

    /// Thread body: the whole life of this task. Never panics outward; any
    /// failure is logged to the child's stderr log and folded into the
    /// normal restart decision.
    pub fn run(&self) {
        if let Err(e) = self.run_inner() {
            error!(child = %self.spec.name, "supervisor failed: {e:#}");
        }
    }

    fn run_inner(&self) -> Result<()> {
        let s = &self.spec;
        let stdout_path = self.log_dir.join(format!("{}.log", s.name));
        let stderr_path = self.log_dir.join(format!("{}.stderr.log", s.name));
        // Truncate on open; the files span every restart of this task.
        let stdout_log = Arc::new(Mutex::new(File::create(&stdout_path).with_context(
            || format!("create log file {}", stdout_path.display()),
        )?));
        let stderr_log = Arc::new(Mutex::new(File::create(&stderr_path).with_context(
            || format!("create log file {}", stderr_path.display()),
        )?));

        if s.start_delay > std::time::Duration::ZERO {
            log_line(
                &stderr_log,
                &format!(
                    "delaying start of {} for {:.1} seconds...",
                    s.name,
                    s.start_delay.as_secs_f64()
                ),
            );
            if self.exit_event.wait_timeout(s.start_delay) || !self.keep_going() {
                return Ok(());
            }
        }

        while self.keep_going() {
            self.attempted.store(true, Ordering::SeqCst);
            self.events
                .process_state_changed(&s.name, ProcessState::StartPending);
            log_line(&stderr_log, &format!("starting process {}...", s.name));

            match self.run_one_life(&stdout_log, &stderr_log) {
                Ok(status) => {
                    self.exit_status.store(status, Ordering::SeqCst);
                    if status != 0 {
                        log_line(
                            &stderr_log,
                            &format!("process {} exited with status {status}", s.name),
                        );
                        if self.screen {
                            eprintln!("[{}]  process {} exited with status {status}", s.name, s.name);
                        }
                    }
                }
                Err(e) => {
                    log_line(&stderr_log, &format!("\nprocess {} error:\n{e:#}", s.name));
                    error!(child = %s.name, "process error: {e:#}");
                }
            }
            self.events
                .process_state_changed(&s.name, ProcessState::Stopped);
            // Release the container only after the Stopped event: `stopped`
            // must not read true while the group still counts this child.
            let control = self.process.lock().expect("process lock poisoned").take();
            if let Some(control) = control {
                control.dispose();
            }

            if s.quit_on_terminate {
                self.exit_event.set();
                break;
            }
            if !s.restart || !self.keep_going() {
                break;
            }
            if self.exit_event.wait_timeout(s.restart_backoff) {
                break;
            }
        }
        Ok(())
    }

    /// One spawn-to-exit cycle. The container is always released before
    /// this returns, whatever went wrong in between.
    fn run_one_life(
        &self,
        stdout_log: &Arc<Mutex<File>>,
        stderr_log: &Arc<Mutex<File>>,
    ) -> Result<i32> {
        let s = &self.spec;
        let spawned = process::spawn(s, &self.scope)?;
        let control = Arc::clone(&spawned.control);
        let mut child = spawned.child;
        *self.process.lock().expect("process lock poisoned") = Some(Arc::clone(&control));

        log_line(
            stderr_log,
            &format!("process {} started (pid {})\n", s.name, control.pid()),
        );
        self.events
            .process_state_changed(&s.name, ProcessState::Running);

        let tail_stdout = child.stdout.take().map(|pipe| {
            spawn_tail_thread(
                pipe,
                Arc::clone(stdout_log),
                s.name.clone(),
                self.screen,
                StreamKind::Stdout,
            )
        });
        let tail_stderr = child.stderr.take().map(|pipe| {
            spawn_tail_thread(
                pipe,
                Arc::clone(stderr_log),
                s.name.clone(),
                self.screen,
                StreamKind::Stderr,
            )
        });

        let wait_result = child.wait().context("wait for child");

        // The pipes hit EOF when the child (and anything inheriting them)
        // is gone; join so the logs are complete before Stopped is emitted.
        if let Some(t) = tail_stdout {
            let _ = t.join();
        }
        if let Some(t) = tail_stderr {
            let _ = t.join();
        }

        if wait_result.is_ok() {
            control.mark_reaped();
        }
        Ok(process::exit_code(wait_result?))
    }

    fn keep_going(&self) -> bool {
        self.keep_going.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// Write one narration line to a child's stderr log (flushed immediately,
/// like every log line).
fn log_line(log: &Arc<Mutex<File>>, message: &str) {
    if let Ok(mut f) = log.lock() {
        let _ = writeln!(f, "{message}");
        let _ = f.flush();
    }
}

/// Tail one child stream: every line (raw bytes, partial final line
/// included) goes to the log, flushed per line, and optionally echoes to
/// the launcher's terminal with the `[name]  ` prefix.
fn spawn_tail_thread<R>(
    stream: R,
    log: Arc<Mutex<File>>,
    name: String,
    screen: bool,
    kind: StreamKind,
) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf: Vec<u8> = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    if let Ok(mut f) = log.lock() {
                        let _ = f.write_all(&buf);
                        let _ = f.flush();
                    }
                    if screen {
                        let line = String::from_utf8_lossy(&buf);
                        match kind {
                            StreamKind::Stdout => {
                                print!("[{name}]  {line}");
                                let _ = std::io::stdout().flush();
                            }
                            StreamKind::Stderr => {
                                eprint!("[{name}]  {line}");
                                let _ = std::io::stderr().flush();
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(child = %name, "stdio drain error: {e}");
                    break;
                }
            }
        }
    })
}

// ---------- Unit tests ----------
