//! Error taxonomy shared by the launcher, the cgroup controller and the init process.

use std::path::PathBuf;

use thiserror::Error;

/// Exit code for failures of the launcher itself or of the init protocol.
pub const EXIT_SETUP_FAILURE: u8 = 125;
/// Exit code when the resolved command could not be executed.
pub const EXIT_CANNOT_EXECUTE: u8 = 126;
/// Exit code when the command was not found on the search path.
pub const EXIT_NOT_FOUND: u8 = 127;

#[derive(Debug, Error)]
pub enum Error {
    /// No mount of the requested filesystem type exists in the mount table.
    #[error("{fstype} mountpoint not found in {table}")]
    MountpointNotFound { fstype: String, table: PathBuf },

    #[error("I/O error at {path}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The cgroup still has member processes and cannot be removed.
    #[error("cgroup {path} is busy: {pids} process(es) still attached")]
    CgroupBusy { path: PathBuf, pids: usize },

    #[error("invalid PID '{line}' in {path}")]
    InvalidPid { path: PathBuf, line: String },

    #[error("invalid resource configuration: {0}")]
    InvalidConfig(String),

    #[error("missing container command")]
    MissingCommand,

    #[error("failed to create control channel")]
    Pipe(#[source] nix::Error),

    #[error("failed to create namespaced child process")]
    Clone(#[source] nix::Error),

    #[error("failed to wait for child process")]
    Wait(#[source] nix::Error),

    #[error("container process has not been started")]
    NotStarted,

    #[error("container process was already started")]
    AlreadyStarted,

    #[error("no command received from launcher")]
    NoCommandReceived,

    #[error("command not found: {command}")]
    CommandNotFound {
        command: String,
        #[source]
        source: which::Error,
    },

    #[error("failed to mount {target}")]
    Mount {
        target: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to execute {path}")]
    Exec {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code used when this error terminates the launcher or the init process.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::CommandNotFound { .. } => EXIT_NOT_FOUND,
            Self::Exec { .. } => EXIT_CANNOT_EXECUTE,
            _ => EXIT_SETUP_FAILURE,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_cause_is_reported_once() {
        let err = Error::io(
            "/cg/box/memory.max",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert_eq!(err.to_string(), "I/O error at /cg/box/memory.max");
        assert!(err.source().is_some());

        let chain = format!("{:#}", anyhow::Error::from(err));
        assert_eq!(chain.matches("not found").count(), 1);

        let err = Error::Clone(nix::Error::EPERM);
        assert!(!err.to_string().contains(&nix::Error::EPERM.to_string()));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_exit_codes_separate_resolution_and_exec_failures() {
        assert_eq!(Error::MissingCommand.exit_code(), 125);
        assert_eq!(Error::NoCommandReceived.exit_code(), 125);
        assert_eq!(
            Error::Exec {
                path: PathBuf::from("/bin/true"),
                source: nix::Error::EACCES,
            }
            .exit_code(),
            126
        );
        assert_eq!(
            Error::CommandNotFound {
                command: "nope".into(),
                source: which::Error::CannotFindBinaryPath,
            }
            .exit_code(),
            127
        );
    }
}
