//! End-to-end tests against the compiled launcher binary.
//!
//! Each test runs the real binary with an isolated log root (via
//! `DREKAR_LAUNCH_LOG_DIR`) and the sentinel disabled, then asserts on the
//! exit code and on the log files the launch produced. Scenarios that need
//! a shell or POSIX signals are unix-only.

use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Path to the compiled binary.
fn binary() -> PathBuf {
    // Prefer the current exe's directory (works inside cargo test).
    let mut p = std::env::current_exe().expect("current exe");
    p.pop(); // remove test binary name
    if p.ends_with("deps") {
        p.pop();
    }
    p.push("drekar-launch");
    if cfg!(windows) {
        p.set_extension("exe");
    }
    p
}

/// Test harness that owns an isolated temporary directory holding the
/// launch file and the log root for one launcher invocation.
struct TestHarness {
    tmp: tempfile::TempDir,
}

impl TestHarness {
    fn new() -> Self {
        TestHarness {
            tmp: tempfile::tempdir().expect("create tempdir"),
        }
    }

    fn write_config(&self, filename: &str, contents: &str) -> PathBuf {
        let path = self.tmp.path().join(filename);
        std::fs::write(&path, contents).expect("write launch file");
        path
    }

    fn log_root(&self) -> PathBuf {
        self.tmp.path().join("logs")
    }

    /// A launcher command wired to this harness's log root, with the
    /// sentinel disabled and terminal echo off.
    fn command(&self) -> Command {
        let mut cmd = Command::new(binary());
        cmd.env("DREKAR_LAUNCH_LOG_DIR", self.log_root())
            .env("DREKAR_LAUNCH_ENABLE_SENTINEL", "0")
            .arg("--quiet")
            .current_dir(self.tmp.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }

    /// The newest per-launch log directory for `name`.
    fn launch_dir(&self, name: &str) -> PathBuf {
        let base = self.log_root().join(name);
        let mut dirs: Vec<PathBuf> = std::fs::read_dir(&base)
            .unwrap_or_else(|e| panic!("read {}: {e}", base.display()))
            .flatten()
            .map(|e| e.path())
            .collect();
        dirs.sort();
        dirs.pop().expect("launch log dir exists")
    }

    fn read_log(&self, name: &str, file: &str) -> String {
        let path = self.launch_dir(name).join(file);
        std::fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("read {}: {e}", path.display()))
    }
}

/// Wait for the launcher to exit, failing the test if it overruns.
#[cfg(unix)]
fn wait_with_deadline(child: &mut Child, deadline: Duration) -> ExitStatus {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().expect("try_wait") {
            return status;
        }
        if start.elapsed() > deadline {
            let _ = child.kill();
            let _ = child.wait();
            panic!("launcher did not exit within {deadline:?}");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(unix)]
fn interrupt(child: &Child) {
    // SAFETY: kill(2) with a valid pid and signal.
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGINT);
    }
}

#[cfg(unix)]
#[test]
fn clean_quit_returns_zero_and_writes_logs() {
    let h = TestHarness::new();
    let config = h.write_config(
        "launch.yaml",
        r#"
name: cleanquit
tasks:
  - name: greeter
    program: /bin/sh
    args: ["-c", "echo hello-from-child"]
    quit-on-terminate: true
"#,
    );

    let status = h
        .command()
        .arg("--config")
        .arg(&config)
        .status()
        .expect("run launcher");
    assert!(status.success(), "status: {status:?}");

    let stdout_log = h.read_log("cleanquit", "greeter.log");
    assert!(stdout_log.contains("hello-from-child"), "log: {stdout_log}");
    let stderr_log = h.read_log("cleanquit", "greeter.stderr.log");
    assert!(stderr_log.contains("starting process greeter"), "log: {stderr_log}");
}

#[cfg(unix)]
#[test]
fn failing_quit_child_sets_the_launcher_exit_code() {
    let h = TestHarness::new();
    let config = h.write_config(
        "launch.yaml",
        r#"
tasks:
  - name: failer
    program: /bin/sh
    args: ["-c", "exit 42"]
    quit-on-terminate: true
"#,
    );

    let status = h
        .command()
        .arg("--config")
        .arg(&config)
        .status()
        .expect("run launcher");
    assert_eq!(status.code(), Some(42));
}

#[cfg(unix)]
#[test]
fn default_config_is_picked_up_from_the_cwd() {
    let h = TestHarness::new();
    h.write_config(
        "drekar-launch.yaml",
        r#"
name: defaulted
tasks:
  - name: quick
    program: /bin/sh
    args: ["-c", "exit 0"]
    quit-on-terminate: true
"#,
    );

    let status = h.command().status().expect("run launcher");
    assert!(status.success(), "status: {status:?}");
}

#[test]
fn invalid_launch_file_fails_before_starting_anything() {
    let h = TestHarness::new();
    let config = h.write_config("launch.yaml", "tasks:\n  - name: broken\n");
    let status = h
        .command()
        .arg("--config")
        .arg(&config)
        .status()
        .expect("run launcher");
    assert_eq!(status.code(), Some(1));
    // Nothing was launched, so no launch log dir either.
    assert!(!h.log_root().exists());
}

#[cfg(unix)]
#[test]
fn interrupt_stops_long_running_children_cleanly() {
    let h = TestHarness::new();
    let config = h.write_config(
        "launch.yaml",
        r#"
name: services
tasks:
  - name: svc-a
    program: /bin/sh
    args: ["-c", "echo a-up; sleep 30"]
  - name: svc-b
    program: /bin/sh
    args: ["-c", "echo b-up; sleep 30"]
"#,
    );

    let mut child = h
        .command()
        .arg("--config")
        .arg(&config)
        .spawn()
        .expect("spawn launcher");
    std::thread::sleep(Duration::from_millis(1500));
    interrupt(&child);
    let status = wait_with_deadline(&mut child, Duration::from_secs(20));

    // Children died from the shutdown, which must not taint the exit code.
    assert_eq!(status.code(), Some(0), "status: {status:?}");
    let dir = h.launch_dir("services");
    for file in ["svc-a.log", "svc-a.stderr.log", "svc-b.log", "svc-b.stderr.log"] {
        assert!(dir.join(file).is_file(), "missing {file}");
    }
    assert!(h.read_log("services", "svc-a.log").contains("a-up"));
    assert!(h.read_log("services", "svc-b.log").contains("b-up"));
}

#[cfg(unix)]
#[test]
fn shutdown_is_bounded_even_for_a_child_that_ignores_signals() {
    let h = TestHarness::new();
    let config = h.write_config(
        "launch.yaml",
        r#"
tasks:
  - name: stubborn
    program: /bin/sh
    args: ["-c", "trap '' INT TERM; while true; do sleep 1; done"]
"#,
    );

    let mut child = h
        .command()
        .arg("--config")
        .arg(&config)
        .spawn()
        .expect("spawn launcher");
    std::thread::sleep(Duration::from_millis(1000));
    let begun = Instant::now();
    interrupt(&child);
    // 15 s polite budget + SIGKILL + 2 s pause, with scheduling slack.
    wait_with_deadline(&mut child, Duration::from_secs(25));
    assert!(
        begun.elapsed() >= Duration::from_secs(14),
        "shutdown escalated implausibly fast: {:?}",
        begun.elapsed()
    );
}

#[cfg(unix)]
#[test]
fn restarting_child_respects_the_backoff() {
    let h = TestHarness::new();
    let config = h.write_config(
        "launch.yaml",
        r#"
name: restarter
tasks:
  - name: tick
    program: /bin/sh
    args: ["-c", "echo tick"]
    restart: true
    restart-backoff: 1
"#,
    );

    let mut child = h
        .command()
        .arg("--config")
        .arg(&config)
        .spawn()
        .expect("spawn launcher");
    std::thread::sleep(Duration::from_millis(3500));
    interrupt(&child);
    let status = wait_with_deadline(&mut child, Duration::from_secs(20));
    assert_eq!(status.code(), Some(0), "status: {status:?}");

    // One tick at t≈0 and one per backoff second after: about four in
    // 3.5 s. Far fewer means the backoff stalled, far more means it was
    // ignored.
    let ticks = h
        .read_log("restarter", "tick.log")
        .matches("tick")
        .count();
    assert!((2..=6).contains(&ticks), "saw {ticks} spawns in 3.5s");
}

#[cfg(unix)]
#[test]
fn template_config_renders_vars_before_launching() {
    let h = TestHarness::new();
    let config = h.write_config(
        "launch.yaml.j2",
        r#"
name: templated
tasks:
  - name: speaker
    program: /bin/sh
    args: ["-c", "echo {{ vars.message }}"]
    quit-on-terminate: true
"#,
    );

    let status = h
        .command()
        .arg("--config-j2")
        .arg(&config)
        .arg("--var-message=hello-template")
        .status()
        .expect("run launcher");
    assert!(status.success(), "status: {status:?}");
    assert!(
        h.read_log("templated", "speaker.log")
            .contains("hello-template")
    );
}

#[test]
fn template_with_undefined_variable_fails() {
    let h = TestHarness::new();
    let config = h.write_config(
        "launch.yaml.j2",
        "tasks:\n  - name: a\n    program: {{ vars.missing }}\n",
    );
    let status = h
        .command()
        .arg("--config-j2")
        .arg(&config)
        .status()
        .expect("run launcher");
    assert_eq!(status.code(), Some(1));
}

#[test]
fn config_and_template_flags_are_mutually_exclusive() {
    let h = TestHarness::new();
    let config = h.write_config("launch.yaml", "tasks: []\n");
    let status = h
        .command()
        .arg("--config")
        .arg(&config)
        .arg("--config-j2")
        .arg(&config)
        .status()
        .expect("run launcher");
    assert_eq!(status.code(), Some(1));
}

#[cfg(unix)]
#[test]
fn start_delayed_child_never_spawns_when_quit_comes_first() {
    let h = TestHarness::new();
    let config = h.write_config(
        "launch.yaml",
        r#"
name: delayed
tasks:
  - name: early
    program: /bin/sh
    args: ["-c", "exit 0"]
    quit-on-terminate: true
  - name: late
    program: /bin/sh
    args: ["-c", "echo late-ran"]
    start-delay: 30
"#,
    );

    let mut child = h
        .command()
        .arg("--config")
        .arg(&config)
        .spawn()
        .expect("spawn launcher");
    // The quitter exits immediately; the delayed child's wait must be cut
    // short by the trigger, well inside its 30 s delay.
    let status = wait_with_deadline(&mut child, Duration::from_secs(20));
    assert_eq!(status.code(), Some(0), "status: {status:?}");
    // The delayed child never ran (its log may not even exist if the
    // launcher won the race to exit).
    let late_log = std::fs::read_to_string(h.launch_dir("delayed").join("late.log"))
        .unwrap_or_default();
    assert!(!late_log.contains("late-ran"), "log: {late_log}");
}
