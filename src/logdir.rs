//! Launch log directory management.
//!
//! Resolution order for the log root:
//!   1. `DREKAR_LAUNCH_LOG_DIR` environment variable
//!   2. Platform user-log directory:
//!      - Linux: `$XDG_CACHE_HOME/drekar-launch/log` or `~/.cache/drekar-launch/log`
//!      - macOS: `~/Library/Logs/drekar-launch`
//!      - Windows: `%LOCALAPPDATA%\drekar-launch\Logs`
//!
//! Each launch writes under `<root>/<name>/<name>-YYYY-MM-DD--HH-MM-SS/`.

use anyhow::{Context, Result};
use directories::BaseDirs;
use std::path::PathBuf;

/// Resolve the log root directory following the priority chain.
pub fn resolve_log_root() -> PathBuf {
    if let Ok(root) = std::env::var("DREKAR_LAUNCH_LOG_DIR") {
        if !root.is_empty() {
            return PathBuf::from(root);
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
            if !xdg.is_empty() {
                return PathBuf::from(xdg).join("drekar-launch").join("log");
            }
        }
        if let Some(base_dirs) = BaseDirs::new() {
            return base_dirs
                .home_dir()
                .join(".cache")
                .join("drekar-launch")
                .join("log");
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(base_dirs) = BaseDirs::new() {
            return base_dirs
                .home_dir()
                .join("Library")
                .join("Logs")
                .join("drekar-launch");
        }
    }

    #[cfg(windows)]
    {
        if let Some(base_dirs) = BaseDirs::new() {
            return base_dirs
                .data_local_dir()
                .join("drekar-launch")
                .join("Logs");
        }
    }

    // Fallback if the base-dirs lookup fails.
    PathBuf::from(".").join("drekar-launch-logs")
}

/// Create and return `<root>/<name>/<name>-<timestamp>/` for this launch.
pub fn create_launch_log_dir(name: &str) -> Result<PathBuf> {
    let stamp = chrono::Local::now().format("%Y-%m-%d--%H-%M-%S");
    let dir = resolve_log_root()
        .join(name)
        .join(format!("{name}-{stamp}"));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create log directory {}", dir.display()))?;
    Ok(dir)
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;

    // One test so the DREKAR_LAUNCH_LOG_DIR mutations stay sequential.
    #[test]
    fn log_root_resolution_and_launch_dir() {
        // SAFETY: test-only env mutation, confined to this single test.
        unsafe {
            std::env::remove_var("DREKAR_LAUNCH_LOG_DIR");
        }
        let default_root = resolve_log_root();
        let root_str = default_root.to_string_lossy();
        assert!(
            root_str.contains("drekar-launch"),
            "expected drekar-launch in path, got {root_str}"
        );

        unsafe {
            std::env::set_var("DREKAR_LAUNCH_LOG_DIR", "/tmp/launch-logs");
        }
        assert_eq!(resolve_log_root(), PathBuf::from("/tmp/launch-logs"));

        let tmp = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var("DREKAR_LAUNCH_LOG_DIR", tmp.path());
        }
        let dir = create_launch_log_dir("myapp").unwrap();
        unsafe {
            std::env::remove_var("DREKAR_LAUNCH_LOG_DIR");
        }
        assert!(dir.is_dir());
        assert!(dir.starts_with(tmp.path().join("myapp")));
        let leaf = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(leaf.starts_with("myapp-"), "got {leaf}");
    }
}
