//! drekar-launch — core library
//!
//! A cross-platform multi-process supervisor: a declarative launch file
//! names child programs; the launcher starts them concurrently, streams
//! their output to per-child log files, restarts them per policy, and
//! guarantees an orderly, bounded shutdown that leaves no descendant
//! process behind (Windows job objects, Linux cgroup-v2 scopes with a
//! cleanup sentinel, plain POSIX sessions elsewhere).

pub mod cgroup;
pub mod config;
pub mod group;
pub mod logdir;
pub mod process;
pub mod signal;
pub mod supervisor;
pub mod template;
