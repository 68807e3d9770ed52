//! OS process-group backend.
//!
//! Spawns each child inside an OS-level container so that disposal kills
//! every descendant, transitively:
//!   - Windows: a job object with the kill-on-close limit; the child starts
//!     suspended, is assigned to the job, then resumed, so there is no
//!     window in which it runs uncontained.
//!   - Linux with cgroup v2: a per-task scope under the launch scope (see
//!     `cgroup`); new-session isolation underneath as on any POSIX.
//!   - Other POSIX: new-session isolation only; disposal falls back to a
//!     hard kill.
//!
//! Containment failures degrade (with a warning) rather than fail the
//! spawn; the shutdown ladder still works through signals.

use anyhow::{Context, Result};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::cgroup::{LaunchScope, TaskScope};
use crate::config::ChildSpec;

/// A freshly spawned, contained child. The `Child` stays with the
/// supervisor activity (stdio + wait); the [`ProcessControl`] is shared so
/// the group's shutdown loop can signal the child from another thread.
pub struct SpawnedChild {
    pub child: Child,
    pub control: Arc<ProcessControl>,
}

/// The container owned alongside one child process.
pub enum Container {
    /// Job object with kill-on-close.
    #[cfg(windows)]
    Job(win32::JobHandle),
    /// cgroup-v2 task scope.
    Task(TaskScope),
    /// New-session isolation only.
    Session,
}

/// Thread-safe handle for signaling and disposing one contained child.
pub struct ProcessControl {
    pid: u32,
    container: Mutex<Option<Container>>,
    reaped: AtomicBool,
}

/// Spawn `spec` as a contained child process.
pub fn spawn(spec: &ChildSpec, scope: &LaunchScope) -> Result<SpawnedChild> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .env_clear()
        .envs(&spec.environment)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    spawn_contained(cmd, scope, &spec.name)
}

#[cfg(unix)]
fn spawn_contained(mut cmd: Command, scope: &LaunchScope, name: &str) -> Result<SpawnedChild> {
    new_session(&mut cmd);
    let child = cmd.spawn().with_context(|| format!("spawn {name}"))?;
    let pid = child.id();
    debug!(child = name, pid, "spawned in new session");

    let container = match scope.create_task_scope(pid) {
        Some(task) => Container::Task(task),
        None => Container::Session,
    };
    Ok(SpawnedChild {
        child,
        control: Arc::new(ProcessControl::new(pid, container)),
    })
}

#[cfg(windows)]
fn spawn_contained(mut cmd: Command, _scope: &LaunchScope, name: &str) -> Result<SpawnedChild> {
    use std::os::windows::process::CommandExt;
    use windows::Win32::System::Threading::{CREATE_NEW_PROCESS_GROUP, CREATE_SUSPENDED};

    // Suspended spawn closes the containment window: the child cannot fork
    // before it is a member of the job.
    cmd.creation_flags(CREATE_SUSPENDED.0 | CREATE_NEW_PROCESS_GROUP.0);
    let mut child = cmd.spawn().with_context(|| format!("spawn {name}"))?;
    let pid = child.id();

    let container = match win32::create_job_for_process(pid) {
        Ok(job) => Container::Job(job),
        Err(e) => {
            warn!(
                child = name,
                "job object containment unavailable, continuing without: {e:#}"
            );
            Container::Session
        }
    };

    if let Err(e) = win32::resume_process(pid) {
        // A child stuck suspended is worse than no child at all.
        let _ = child.kill();
        let _ = child.wait();
        return Err(e).with_context(|| format!("resume {name} after containment"));
    }
    debug!(child = name, pid, "spawned in job object");

    Ok(SpawnedChild {
        child,
        control: Arc::new(ProcessControl::new(pid, container)),
    })
}

/// Arrange for the child to lead a new session (and therefore a new process
/// group), so group signals can never reach the launcher itself.
#[cfg(unix)]
pub(crate) fn new_session(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.pre_exec(|| {
            // SAFETY: setsid is async-signal-safe and callable post-fork.
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub(crate) fn new_session(_cmd: &mut Command) {}

impl ProcessControl {
    fn new(pid: u32, container: Container) -> Self {
        ProcessControl {
            pid,
            container: Mutex::new(Some(container)),
            reaped: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Record that the child has been waited on, so disposal does not send
    /// a stray kill to a recycled pid.
    pub fn mark_reaped(&self) {
        self.reaped.store(true, Ordering::SeqCst);
    }

    /// Polite termination request. `attempt` counts the soft stops already
    /// sent during the current shutdown and drives the Windows escalation.
    #[cfg(unix)]
    pub fn soft_stop(&self, _attempt: u32) -> Result<()> {
        // SAFETY: getpgid/killpg accept any pid; errors are reported below.
        let pgid = unsafe { libc::getpgid(self.pid as libc::pid_t) };
        if pgid < 0 {
            let err = std::io::Error::last_os_error();
            // Already gone counts as delivered.
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err).context("getpgid");
        }
        let ret = unsafe { libc::killpg(pgid, libc::SIGINT) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err).context("killpg(SIGINT)");
            }
        }
        Ok(())
    }

    /// Polite termination request, Windows ladder: attempts 0..=3 post
    /// `WM_CLOSE` to the container's windows (top-level first, message-only
    /// windows as the fallback for headless programs); later attempts send
    /// a console Ctrl-C event to the child's console group.
    #[cfg(windows)]
    pub fn soft_stop(&self, attempt: u32) -> Result<()> {
        if attempt > 3 {
            return win32::send_console_ctrl_c(self.pid);
        }
        let pids = {
            let container = self.container.lock().expect("container lock poisoned");
            match container.as_ref() {
                Some(Container::Job(job)) => win32::job_pids(job)?,
                _ => vec![self.pid],
            }
        };
        win32::post_wm_close(&pids);
        Ok(())
    }

    /// Unconditional termination of everything in the container.
    #[cfg(unix)]
    pub fn hard_kill(&self) -> Result<()> {
        // SAFETY: kill(2) is safe to call with any pid and valid signal.
        let ret = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGKILL) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err).context("kill(SIGKILL)");
            }
        }
        Ok(())
    }

    #[cfg(windows)]
    pub fn hard_kill(&self) -> Result<()> {
        let container = self.container.lock().expect("container lock poisoned");
        match container.as_ref() {
            Some(Container::Job(job)) => win32::terminate_job(job),
            _ => win32::terminate_process_tree(self.pid),
        }
    }

    /// Release the container. Idempotent; survivors die with it (job
    /// kill-on-close, cgroup kill file, or the POSIX hard-kill fallback).
    pub fn dispose(&self) {
        let taken = self
            .container
            .lock()
            .expect("container lock poisoned")
            .take();
        match taken {
            None => {}
            #[cfg(windows)]
            Some(Container::Job(job)) => job.close(),
            Some(Container::Task(task)) => task.close(),
            Some(Container::Session) => {
                if !self.reaped.load(Ordering::SeqCst) {
                    if let Err(e) = self.hard_kill() {
                        warn!(pid = self.pid, "kill on container release failed: {e:#}");
                    }
                }
            }
        }
    }
}

/// Normalize an [`ExitStatus`] to the signed integer the supervisors track:
/// the exit code when there is one, `-signal` for signal deaths on Unix,
/// `-1` when the status is unknowable.
pub fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|s| -s))
            .unwrap_or(-1)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

#[cfg(windows)]
pub mod win32 {
    //! Job-object plumbing and the WM_CLOSE / console-event ladder.

    use anyhow::{Context, Result, anyhow};
    use tracing::debug;
    use windows::Win32::Foundation::{
        BOOL, CloseHandle, ERROR_INVALID_PARAMETER, HANDLE, HWND, LPARAM, WPARAM,
    };
    use windows::Win32::System::Console::{CTRL_C_EVENT, GenerateConsoleCtrlEvent};
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, TH32CS_SNAPTHREAD, THREADENTRY32, Thread32First, Thread32Next,
    };
    use windows::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
        JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JobObjectBasicProcessIdList,
        JobObjectExtendedLimitInformation, QueryInformationJobObject, SetInformationJobObject,
        TerminateJobObject,
    };
    use windows::Win32::System::Threading::{
        OpenProcess, OpenThread, PROCESS_SET_QUOTA, PROCESS_TERMINATE, ResumeThread,
        TerminateProcess, THREAD_SUSPEND_RESUME,
    };
    use windows::Win32::UI::WindowsAndMessaging::{
        EnumWindows, FindWindowExW, GetWindowThreadProcessId, HWND_MESSAGE, PostMessageW, WM_CLOSE,
    };

    /// Owned job-object handle, shareable across the supervisor and the
    /// group's shutdown loop.
    pub struct JobHandle(HANDLE);

    // SAFETY: a job-object HANDLE is process-global kernel state; the Win32
    // calls made through it here are thread-safe.
    unsafe impl Send for JobHandle {}
    unsafe impl Sync for JobHandle {}

    impl JobHandle {
        /// Closing the last handle kills every remaining member, because
        /// the job carries `JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE`.
        pub fn close(self) {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }

    /// Create an anonymous kill-on-close job object and assign `pid` to it.
    /// The process is expected to still be suspended.
    pub fn create_job_for_process(pid: u32) -> Result<JobHandle> {
        unsafe {
            let job = CreateJobObjectW(None, None).context("CreateJobObjectW")?;

            let mut limits = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
            if let Err(e) = QueryInformationJobObject(
                job,
                JobObjectExtendedLimitInformation,
                &mut limits as *mut _ as *mut core::ffi::c_void,
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
                None,
            ) {
                let _ = CloseHandle(job);
                return Err(anyhow!("QueryInformationJobObject failed: {e}"));
            }
            limits.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
            if let Err(e) = SetInformationJobObject(
                job,
                JobObjectExtendedLimitInformation,
                &limits as *const _ as *const core::ffi::c_void,
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            ) {
                let _ = CloseHandle(job);
                return Err(anyhow!("SetInformationJobObject failed: {e}"));
            }

            let proc_handle = match OpenProcess(PROCESS_SET_QUOTA | PROCESS_TERMINATE, false, pid) {
                Ok(h) => h,
                Err(e) => {
                    let _ = CloseHandle(job);
                    return Err(anyhow!("OpenProcess(pid={pid}) failed: {e}"));
                }
            };
            if let Err(e) = AssignProcessToJobObject(job, proc_handle) {
                let _ = CloseHandle(proc_handle);
                let _ = CloseHandle(job);
                return Err(anyhow!(
                    "AssignProcessToJobObject(pid={pid}) failed \
                     (process may already belong to another job, e.g. in CI): {e}"
                ));
            }
            let _ = CloseHandle(proc_handle);
            Ok(JobHandle(job))
        }
    }

    /// Resume every thread of a suspended process (ToolHelp snapshot walk).
    pub fn resume_process(pid: u32) -> Result<()> {
        unsafe {
            let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0)
                .context("CreateToolhelp32Snapshot(threads)")?;
            let mut entry = THREADENTRY32 {
                dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
                ..Default::default()
            };
            let mut resumed = 0u32;
            if Thread32First(snapshot, &mut entry).is_ok() {
                loop {
                    if entry.th32OwnerProcessID == pid
                        && let Ok(thread) = OpenThread(THREAD_SUSPEND_RESUME, false, entry.th32ThreadID)
                    {
                        ResumeThread(thread);
                        let _ = CloseHandle(thread);
                        resumed += 1;
                    }
                    entry = THREADENTRY32 {
                        dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
                        ..Default::default()
                    };
                    if Thread32Next(snapshot, &mut entry).is_err() {
                        break;
                    }
                }
            }
            let _ = CloseHandle(snapshot);
            if resumed == 0 {
                return Err(anyhow!("no suspended threads found for pid {pid}"));
            }
            Ok(())
        }
    }

    /// Everything currently assigned to the job.
    pub fn job_pids(job: &JobHandle) -> Result<Vec<u32>> {
        // QueryInformationJobObject writes a counted, variable-length pid
        // list; mirror the struct with a fixed upper bound.
        #[repr(C)]
        struct PidList {
            number_of_assigned_processes: u32,
            number_of_process_ids_in_list: u32,
            process_id_list: [usize; 512],
        }

        unsafe {
            let mut list = Box::new(PidList {
                number_of_assigned_processes: 0,
                number_of_process_ids_in_list: 0,
                process_id_list: [0; 512],
            });
            QueryInformationJobObject(
                job.0,
                JobObjectBasicProcessIdList,
                &mut *list as *mut PidList as *mut core::ffi::c_void,
                std::mem::size_of::<PidList>() as u32,
                None,
            )
            .context("QueryInformationJobObject(pid list)")?;
            let count = list.number_of_process_ids_in_list as usize;
            Ok(list.process_id_list[..count.min(512)]
                .iter()
                .map(|&p| p as u32)
                .collect())
        }
    }

    struct WindowSearch {
        pid: u32,
        hwnds: Vec<HWND>,
    }

    unsafe extern "system" fn collect_top_level(hwnd: HWND, lparam: LPARAM) -> BOOL {
        unsafe {
            let search = &mut *(lparam.0 as *mut WindowSearch);
            let mut owner = 0u32;
            GetWindowThreadProcessId(hwnd, Some(&mut owner));
            if owner == search.pid {
                search.hwnds.push(hwnd);
            }
        }
        true.into()
    }

    /// Top-level windows owned by `pid`.
    fn find_main_windows(pid: u32) -> Vec<HWND> {
        let mut search = WindowSearch {
            pid,
            hwnds: Vec::new(),
        };
        unsafe {
            // Err means the callback stopped enumeration; the collected
            // windows are still valid.
            let _ = EnumWindows(
                Some(collect_top_level),
                LPARAM(&mut search as *mut WindowSearch as isize),
            );
        }
        search.hwnds
    }

    /// Message-only windows owned by `pid` (headless programs listen here).
    fn find_message_windows(pid: u32) -> Vec<HWND> {
        let mut hwnds = Vec::new();
        let mut after = HWND::default();
        unsafe {
            loop {
                let Ok(hwnd) = FindWindowExW(HWND_MESSAGE, after, None, None) else {
                    break;
                };
                if hwnd.is_invalid() {
                    break;
                }
                let mut owner = 0u32;
                GetWindowThreadProcessId(hwnd, Some(&mut owner));
                if owner == pid {
                    hwnds.push(hwnd);
                }
                after = hwnd;
            }
        }
        hwnds
    }

    /// Post `WM_CLOSE` to each pid's windows: top-level windows first so
    /// user-visible apps close cleanly, message-only windows otherwise.
    pub fn post_wm_close(pids: &[u32]) {
        for &pid in pids {
            let mut hwnds = find_main_windows(pid);
            if hwnds.is_empty() {
                hwnds = find_message_windows(pid);
            }
            debug!(pid, windows = hwnds.len(), "posting WM_CLOSE");
            for hwnd in hwnds {
                unsafe {
                    let _ = PostMessageW(hwnd, WM_CLOSE, WPARAM(0), LPARAM(0));
                }
            }
        }
    }

    /// Ctrl-C to the child's console process group (`pid` leads its group
    /// thanks to `CREATE_NEW_PROCESS_GROUP`).
    pub fn send_console_ctrl_c(pid: u32) -> Result<()> {
        unsafe { GenerateConsoleCtrlEvent(CTRL_C_EVENT, pid).context("GenerateConsoleCtrlEvent") }
    }

    pub fn terminate_job(job: &JobHandle) -> Result<()> {
        unsafe { TerminateJobObject(job.0, 1).context("TerminateJobObject") }
    }

    /// Containerless fallback: terminate a process and all its descendants
    /// via a ToolHelp process snapshot (children first, then the root).
    pub fn terminate_process_tree(root_pid: u32) -> Result<()> {
        use windows::Win32::System::Diagnostics::ToolHelp::{
            PROCESSENTRY32, Process32First, Process32Next, TH32CS_SNAPPROCESS,
        };

        unsafe {
            let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0)
                .context("CreateToolhelp32Snapshot(processes)")?;

            let mut entries: Vec<(u32, u32)> = Vec::new();
            let mut entry = PROCESSENTRY32 {
                dwSize: std::mem::size_of::<PROCESSENTRY32>() as u32,
                ..Default::default()
            };
            if Process32First(snapshot, &mut entry).is_ok() {
                loop {
                    entries.push((entry.th32ProcessID, entry.th32ParentProcessID));
                    entry = PROCESSENTRY32 {
                        dwSize: std::mem::size_of::<PROCESSENTRY32>() as u32,
                        ..Default::default()
                    };
                    if Process32Next(snapshot, &mut entry).is_err() {
                        break;
                    }
                }
            }
            let _ = CloseHandle(snapshot);

            // BFS over the parent links to collect the subtree.
            let mut to_kill: Vec<u32> = vec![root_pid];
            let mut i = 0;
            while i < to_kill.len() {
                let parent = to_kill[i];
                for &(child_pid, parent_pid) in &entries {
                    if parent_pid == parent && !to_kill.contains(&child_pid) {
                        to_kill.push(child_pid);
                    }
                }
                i += 1;
            }

            for &target in to_kill.iter().rev() {
                match OpenProcess(PROCESS_TERMINATE, false, target) {
                    Ok(h) => {
                        let result = TerminateProcess(h, 1);
                        let _ = CloseHandle(h);
                        result.map_err(|e| {
                            anyhow!("TerminateProcess for pid {target} failed: {e}")
                        })?;
                    }
                    Err(e) => {
                        // ERROR_INVALID_PARAMETER: the process is already
                        // gone, which is the outcome we wanted.
                        if e.code() != ERROR_INVALID_PARAMETER.to_hresult() {
                            return Err(anyhow!("OpenProcess for pid {target} failed: {e}"));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    #[cfg(unix)]
    fn sh_spec(name: &str, script: &str) -> ChildSpec {
        ChildSpec {
            name: name.to_string(),
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: PathBuf::from("."),
            environment: HashMap::from([(
                "PATH".to_string(),
                "/usr/bin:/bin".to_string(),
            )]),
            restart: false,
            restart_backoff: Duration::from_secs(5),
            start_delay: Duration::ZERO,
            quit_on_terminate: false,
            tags: Vec::new(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn exit_code_passes_through() {
        let scope = LaunchScope::disabled();
        let spawned = spawn(&sh_spec("code", "exit 7"), &scope).unwrap();
        let mut child = spawned.child;
        let status = child.wait().unwrap();
        spawned.control.mark_reaped();
        spawned.control.dispose();
        assert_eq!(exit_code(status), 7);
    }

    #[cfg(unix)]
    #[test]
    fn soft_stop_interrupts_the_whole_session() {
        let scope = LaunchScope::disabled();
        let spawned = spawn(&sh_spec("softy", "sleep 30"), &scope).unwrap();
        let mut child = spawned.child;
        std::thread::sleep(Duration::from_millis(200));
        spawned.control.soft_stop(0).unwrap();
        let status = child.wait().unwrap();
        spawned.control.mark_reaped();
        spawned.control.dispose();
        assert_eq!(exit_code(status), -libc::SIGINT);
    }

    #[cfg(unix)]
    #[test]
    fn hard_kill_is_unconditional() {
        let scope = LaunchScope::disabled();
        let spawned = spawn(&sh_spec("hardy", "trap '' INT TERM; sleep 30"), &scope).unwrap();
        let mut child = spawned.child;
        std::thread::sleep(Duration::from_millis(200));
        spawned.control.hard_kill().unwrap();
        let status = child.wait().unwrap();
        spawned.control.mark_reaped();
        spawned.control.dispose();
        assert_eq!(exit_code(status), -libc::SIGKILL);
    }

    #[cfg(unix)]
    #[test]
    fn dispose_is_idempotent_and_signals_are_gone_safe() {
        let scope = LaunchScope::disabled();
        let spawned = spawn(&sh_spec("gone", "exit 0"), &scope).unwrap();
        let mut child = spawned.child;
        child.wait().unwrap();
        spawned.control.mark_reaped();
        spawned.control.dispose();
        spawned.control.dispose();
        // The child is reaped; polite and hard signals must not error.
        spawned.control.soft_stop(1).unwrap();
        spawned.control.hard_kill().unwrap();
    }
}
