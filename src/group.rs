//! Group supervision: owns every child supervisor, orchestrates start-all
//! and the bounded shutdown protocol, and aggregates exit status.

use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::cgroup::LaunchScope;
use crate::config::ChildSpec;
use crate::signal::ExitEvent;
use crate::supervisor::{ChildSupervisor, ProcessState};

/// Total budget for the polite phase of shutdown.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(15);
/// Shutdown loop tick.
const SHUTDOWN_TICK: Duration = Duration::from_millis(100);
/// Cadence of repeated soft stops during shutdown.
const RECLOSE_EVERY: Duration = Duration::from_secs(1);
/// Settling time after hard-killing the holdouts.
const POST_KILL_PAUSE: Duration = Duration::from_secs(2);

struct GroupShared {
    closed: AtomicBool,
    children: Mutex<HashMap<String, Arc<ChildSupervisor>>>,
}

/// The send-endpoint a child supervisor reports its state changes through.
/// Holds only a weak reference, so supervisors never keep the group alive.
#[derive(Clone)]
pub struct GroupEvents {
    shared: Weak<GroupShared>,
}

impl GroupEvents {
    /// An endpoint with no listening group (tests, standalone supervisors).
    pub fn detached() -> Self {
        GroupEvents {
            shared: Weak::new(),
        }
    }

    pub fn process_state_changed(&self, name: &str, state: ProcessState) {
        info!(child = name, %state, "process state changed");
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        // During shutdown a stopping child is also deregistered, so the
        // final aggregate ignores children that only died because shutdown
        // killed them.
        if state == ProcessState::Stopped && shared.closed.load(Ordering::SeqCst) {
            shared
                .children
                .lock()
                .expect("children lock poisoned")
                .remove(name);
        }
    }
}

pub struct Group {
    name: String,
    log_dir: PathBuf,
    screen: bool,
    exit_event: Arc<ExitEvent>,
    specs: Vec<ChildSpec>,
    scope: Arc<LaunchScope>,
    shared: Arc<GroupShared>,
}

impl Group {
    /// Build the group and its launch scope. Nothing is started yet.
    pub fn new(
        name: String,
        specs: Vec<ChildSpec>,
        exit_event: Arc<ExitEvent>,
        log_dir: PathBuf,
        screen: bool,
    ) -> Self {
        Group {
            name,
            log_dir,
            screen,
            exit_event,
            specs,
            scope: Arc::new(LaunchScope::create()),
            shared: Arc::new(GroupShared {
                closed: AtomicBool::new(false),
                children: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log_dir(&self) -> &PathBuf {
        &self.log_dir
    }

    fn closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Launch a supervisor for every spec that does not have one yet.
    /// Idempotent.
    pub fn start_all(&self) -> Result<()> {
        if self.closed() {
            bail!("group is closed");
        }
        let mut children = self
            .shared
            .children
            .lock()
            .expect("children lock poisoned");
        for spec in &self.specs {
            if !children.contains_key(&spec.name) {
                self.do_start(&mut children, spec.clone())?;
            }
        }
        Ok(())
    }

    /// Launch one named child.
    pub fn start(&self, name: &str) -> Result<()> {
        if self.closed() {
            bail!("group is closed");
        }
        let spec = self
            .specs
            .iter()
            .find(|s| s.name == name)
            .with_context(|| format!("unknown child: {name}"))?
            .clone();
        let mut children = self
            .shared
            .children
            .lock()
            .expect("children lock poisoned");
        if !children.contains_key(name) {
            self.do_start(&mut children, spec)?;
        }
        Ok(())
    }

    fn do_start(
        &self,
        children: &mut HashMap<String, Arc<ChildSupervisor>>,
        spec: ChildSpec,
    ) -> Result<()> {
        let name = spec.name.clone();
        let supervisor = ChildSupervisor::new(
            spec,
            self.log_dir.clone(),
            self.screen,
            Arc::clone(&self.exit_event),
            GroupEvents {
                shared: Arc::downgrade(&self.shared),
            },
            Arc::clone(&self.scope),
        );
        children.insert(name.clone(), Arc::clone(&supervisor));

        thread::Builder::new()
            .name(format!("child-{name}"))
            .spawn(move || supervisor.run())
            .with_context(|| format!("spawn supervisor thread for {name}"))?;
        Ok(())
    }

    /// Begin shutdown: mark the group closed, fire the exit trigger so
    /// every delay/backoff wait returns, and send the first polite stop to
    /// every child. Idempotent.
    pub fn stop_all(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.exit_event.set();
        let children: Vec<_> = self
            .shared
            .children
            .lock()
            .expect("children lock poisoned")
            .values()
            .cloned()
            .collect();
        for child in children {
            child.close();
        }
    }

    /// Bounded shutdown: poll every 100 ms, re-send the polite stop every
    /// second (which escalates per attempt on Windows), and after 15 s
    /// hard-kill whatever is left, pausing 2 s for the kills to land.
    /// Container disposal in [`Group::close`] covers anything that still
    /// ignored all of that.
    pub fn wait_all_stopped(&self) {
        let start = Instant::now();
        let mut last_close = Duration::ZERO;
        loop {
            let elapsed = start.elapsed();
            if elapsed > SHUTDOWN_BUDGET {
                break;
            }
            let running = self.not_stopped();
            if running.is_empty() {
                break;
            }
            thread::sleep(SHUTDOWN_TICK);
            if elapsed > last_close + RECLOSE_EVERY {
                last_close = elapsed;
                for child in running {
                    child.close();
                }
            }
        }

        let holdouts = self.not_stopped();
        if !holdouts.is_empty() {
            warn!(
                count = holdouts.len(),
                "children still running, sending SIGKILL"
            );
            for child in &holdouts {
                child.kill();
            }
            thread::sleep(POST_KILL_PAUSE);
        }
    }

    fn not_stopped(&self) -> Vec<Arc<ChildSupervisor>> {
        self.shared
            .children
            .lock()
            .expect("children lock poisoned")
            .values()
            .filter(|c| !c.stopped())
            .cloned()
            .collect()
    }

    /// 0 when every still-registered child last exited 0; otherwise the
    /// last non-zero status encountered (map iteration order; the spec
    /// leaves the tie-break to the implementation). Children that never got
    /// as far as a spawn attempt have no status to report.
    pub fn exit_status(&self) -> i32 {
        let children = self
            .shared
            .children
            .lock()
            .expect("children lock poisoned");
        let mut status = 0;
        for child in children.values() {
            if !child.attempted_start() {
                continue;
            }
            let s = child.exit_status();
            if s != 0 {
                status = s;
            }
        }
        status
    }

    /// Final disposal: tear down the launch scope (killing any survivors
    /// with their containers) and stop the sentinel. Supervisor threads are
    /// not joined — a stubborn grandchild can hold a child's stdio pipes
    /// open past every signal, and the scope teardown is what unblocks
    /// those drains. Idempotent.
    pub fn close(&self) {
        self.scope.close();
    }
}

// ---------- Unit tests ----------
