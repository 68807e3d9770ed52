//! cgroup-v2 launch scope and the cleanup sentinel.
//!
//! On kernels exposing the v2 control-group interface, the launcher creates
//! `<own-cgroup>/drekar-launch-<uuid>.scope/` and moves every child into a
//! `task-<pid>.scope/` below it, so the whole descendant tree can be killed
//! by writing to `cgroup.kill` files. A detached sentinel process watches
//! the launcher and tears the scope down should the launcher die without
//! cleaning up. Everything here degrades to a no-op where cgroup v2 is
//! absent (including non-Linux builds, where the probe simply fails).

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::signal::{self, ExitEvent};

/// Controls sentinel spawning. The sentinel itself runs with this set to
/// `"0"` so it can never spawn a sentinel of its own.
pub const SENTINEL_ENV: &str = "DREKAR_LAUNCH_ENABLE_SENTINEL";

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Kernel exposes the v2 control-group interface.
pub fn cgroup_v2_supported() -> bool {
    Path::new(CGROUP_ROOT).join("cgroup.controllers").exists()
}

/// Sentinel spawning is on by default; only `1`/`true` re-enable it
/// explicitly, anything else disables.
pub fn sentinel_enabled() -> bool {
    sentinel_value_enables(std::env::var(SENTINEL_ENV).ok().as_deref())
}

fn sentinel_value_enables(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true"),
    }
}

/// The per-launch scope directory. Shared read-only by every child
/// supervisor for task-scope creation; created once, torn down once.
pub struct LaunchScope {
    scope_path: Mutex<Option<PathBuf>>,
    sentinel: Mutex<Option<Child>>,
}

impl LaunchScope {
    /// A scope that never contains anything (non-cgroup systems, tests).
    pub fn disabled() -> Self {
        LaunchScope {
            scope_path: Mutex::new(None),
            sentinel: Mutex::new(None),
        }
    }

    /// Create the launch scope and, unless disabled through
    /// [`SENTINEL_ENV`], start the sentinel. Never fails: any error leaves
    /// the scope disabled and containment falls back to sessions.
    pub fn create() -> Self {
        if !cgroup_v2_supported() {
            debug!("cgroup v2 not available, scope containment disabled");
            return Self::disabled();
        }
        let Some(parent) = read_own_cgroup() else {
            warn!("could not determine own cgroup, scope containment disabled");
            return Self::disabled();
        };
        let scope_path = parent.join(format!(
            "drekar-launch-{}.scope",
            uuid::Uuid::new_v4().simple()
        ));
        if let Err(e) = std::fs::create_dir(&scope_path) {
            warn!(
                scope = %scope_path.display(),
                "cgroup scope creation failed, scope containment disabled: {e}"
            );
            return Self::disabled();
        }
        info!(scope = %scope_path.display(), "created launch cgroup scope");

        let scope = LaunchScope {
            scope_path: Mutex::new(Some(scope_path.clone())),
            sentinel: Mutex::new(None),
        };
        if sentinel_enabled() {
            if let Err(e) = scope.start_sentinel(&scope_path) {
                warn!("sentinel launch failed, cleanup falls back to launcher teardown: {e:#}");
            }
        } else {
            debug!("sentinel disabled via {SENTINEL_ENV}");
        }
        scope
    }

    pub fn is_active(&self) -> bool {
        self.scope_path
            .lock()
            .expect("scope lock poisoned")
            .is_some()
    }

    /// Move `pid` (and, transitively, everything it will ever spawn) into a
    /// fresh task scope. `None` when the scope is disabled or the move
    /// fails; the caller keeps session-only isolation.
    pub fn create_task_scope(&self, pid: u32) -> Option<TaskScope> {
        let guard = self.scope_path.lock().expect("scope lock poisoned");
        let scope_path = guard.as_ref()?;
        let task_path = scope_path.join(format!("task-{pid}.scope"));
        match try_create_task_scope(&task_path, pid) {
            Ok(()) => {
                debug!(task = %task_path.display(), "child moved into task scope");
                Some(TaskScope { path: task_path })
            }
            Err(e) => {
                warn!(pid, "task scope creation failed, falling back to session isolation: {e:#}");
                let _ = std::fs::remove_dir(&task_path);
                None
            }
        }
    }

    /// Tear the scope down (recursively, children first) and stop the
    /// sentinel. Idempotent.
    pub fn close(&self) {
        let taken = self.scope_path.lock().expect("scope lock poisoned").take();
        if let Some(path) = taken {
            teardown_scope(&path);
        }
        self.stop_sentinel();
    }

    fn start_sentinel(&self, scope_path: &Path) -> Result<()> {
        let exe = std::env::current_exe().context("resolve current exe")?;
        let mut cmd = Command::new(exe);
        cmd.arg("--sentinel")
            .arg(std::process::id().to_string())
            .arg(scope_path.as_os_str())
            .env(SENTINEL_ENV, "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Its own session: the launcher's death must not take it along.
        crate::process::new_session(&mut cmd);
        let child = cmd.spawn().context("spawn sentinel")?;
        debug!(pid = child.id(), "sentinel started");
        *self.sentinel.lock().expect("sentinel lock poisoned") = Some(child);
        Ok(())
    }

    fn stop_sentinel(&self) {
        let taken = self.sentinel.lock().expect("sentinel lock poisoned").take();
        if let Some(mut child) = taken {
            #[cfg(unix)]
            {
                // The sentinel leads its own session, so its pgid is its pid.
                // SAFETY: killpg with a valid signal; failure means it is gone.
                unsafe {
                    libc::killpg(child.id() as libc::pid_t, libc::SIGTERM);
                }
            }
            #[cfg(not(unix))]
            {
                let _ = child.kill();
            }
            // The scope is already gone by now, so the sentinel exits at its
            // next wakeup; reap it if it is quick, leave it to init if not.
            std::thread::sleep(Duration::from_millis(50));
            let _ = child.try_wait();
        }
    }
}

/// One child's sub-scope inside the launch scope.
pub struct TaskScope {
    path: PathBuf,
}

impl TaskScope {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Kill everything still in the scope and remove its directory.
    pub fn close(&self) {
        let kill_file = self.path.join("cgroup.kill");
        if kill_file.exists() {
            if let Err(e) = std::fs::write(&kill_file, "1") {
                warn!(task = %self.path.display(), "cgroup.kill write failed: {e}");
            }
        }
        if let Err(e) = std::fs::remove_dir(&self.path) {
            debug!(task = %self.path.display(), "task scope removal failed: {e}");
        }
    }
}

fn try_create_task_scope(task_path: &Path, pid: u32) -> Result<()> {
    std::fs::create_dir(task_path).context("create task scope directory")?;
    std::fs::write(task_path.join("cgroup.procs"), pid.to_string())
        .context("write cgroup.procs")?;
    Ok(())
}

/// The launcher's own cgroup directory, from `/proc/self/cgroup`.
fn read_own_cgroup() -> Option<PathBuf> {
    let contents = match std::fs::read_to_string(format!("/proc/{}/cgroup", std::process::id())) {
        Ok(c) => c,
        Err(e) => {
            warn!("read /proc/self/cgroup failed: {e}");
            return None;
        }
    };
    parse_cgroup_v2_path(&contents)
}

/// Extract the v2 (`0::`) entry. A bare `/` means the process is not in a
/// named cgroup, which disables the scope.
fn parse_cgroup_v2_path(contents: &str) -> Option<PathBuf> {
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("0::") {
            let rest = rest.trim();
            if rest == "/" {
                return None;
            }
            return Some(Path::new(CGROUP_ROOT).join(rest.trim_matches('/')));
        }
    }
    None
}

/// Depth-first teardown: kill each node's members, then remove the
/// directory. Errors are logged and swallowed so cleanup always makes as
/// much progress as it can.
pub fn teardown_scope(path: &Path) {
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let child = entry.path();
            if child.is_dir() {
                teardown_scope(&child);
            }
        }
    }
    let kill_file = path.join("cgroup.kill");
    if kill_file.exists() {
        if let Err(e) = std::fs::write(&kill_file, "1") {
            warn!(scope = %path.display(), "cgroup.kill write failed: {e}");
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    if let Err(e) = std::fs::remove_dir(path) {
        warn!(scope = %path.display(), "scope removal failed: {e}");
    }
}

/// The `--sentinel <parent-pid> <scope-path>` subcommand: poll until the
/// launcher dies or the scope disappears; if the launcher died first, give
/// its own teardown a grace period, then clean up in its stead.
pub fn sentinel_main(parent_pid: u32, scope_path: &Path) -> Result<()> {
    if !cgroup_v2_supported() {
        return Ok(());
    }
    let exit = Arc::new(ExitEvent::new());
    signal::install_exit_handler(Arc::clone(&exit))?;

    let parent_proc = PathBuf::from(format!("/proc/{parent_pid}"));
    loop {
        if exit.wait_timeout(Duration::from_secs(15)) {
            break;
        }
        if !scope_path.exists() {
            return Ok(());
        }
        if !parent_proc.exists() {
            break;
        }
    }

    if !scope_path.exists() {
        return Ok(());
    }
    std::thread::sleep(Duration::from_secs(10));
    if !scope_path.exists() {
        return Ok(());
    }
    info!(scope = %scope_path.display(), "launcher gone with a live scope, cleaning up");
    teardown_scope(scope_path);
    Ok(())
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cgroup_path_v2_entry() {
        let contents = "2:cpu:/legacy\n0::/user.slice/session-1.scope\n";
        assert_eq!(
            parse_cgroup_v2_path(contents),
            Some(PathBuf::from("/sys/fs/cgroup/user.slice/session-1.scope"))
        );
    }

    #[test]
    fn parse_cgroup_path_root_means_unassigned() {
        assert_eq!(parse_cgroup_v2_path("0::/\n"), None);
        assert_eq!(parse_cgroup_v2_path(""), None);
    }

    #[test]
    fn sentinel_env_gate() {
        assert!(sentinel_value_enables(None));
        for (value, expected) in [
            ("1", true),
            ("true", true),
            (" TRUE ", true),
            ("0", false),
            ("no", false),
            ("", false),
        ] {
            assert_eq!(sentinel_value_enables(Some(value)), expected, "value {value:?}");
        }
    }

    #[test]
    fn teardown_removes_nested_directories_depth_first() {
        let tmp = tempfile::tempdir().unwrap();
        let scope = tmp.path().join("drekar-launch-test.scope");
        std::fs::create_dir_all(scope.join("task-1.scope")).unwrap();
        std::fs::create_dir_all(scope.join("task-2.scope/nested")).unwrap();
        teardown_scope(&scope);
        assert!(!scope.exists());
    }

    #[test]
    fn disabled_scope_never_creates_task_scopes() {
        let scope = LaunchScope::disabled();
        assert!(!scope.is_active());
        assert!(scope.create_task_scope(1234).is_none());
        scope.close();
    }
}
