//! Runs one command in fresh Linux namespaces under a cgroup v2 resource limit.
//!
//! The launcher side ([`container`]) re-executes the current binary as `init`
//! inside new UTS, PID, mount, network and IPC namespaces, attaches it to a
//! cgroup ([`cgroups`]) and then sends it the command over a one-shot pipe
//! ([`channel`]). The init side ([`init`]) reads the command, mounts its own
//! `/proc` and execs the program.

pub mod cgroups;
pub mod channel;
pub mod container;
pub mod error;
mod fs;
pub mod init;
pub mod logging;

pub use error::{Error, Result};
