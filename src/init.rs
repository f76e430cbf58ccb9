//! Init handoff, run inside the re-executed child.
//!
//! Reads the command from the control channel, gives the container its own
//! `/proc`, resolves the program on `PATH` and replaces the process image
//! with it. On success nothing here returns.

use std::convert::Infallible;
use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::unistd::execv;

use crate::channel;
use crate::error::{Error, Result};
use crate::fs::{make_mounts_private, remount_proc};

/// Runs the whole handoff. Only returns if a step failed.
pub fn run_container_init_process() -> Result<Infallible> {
    let command = channel::read_inherited_command()?;
    tracing::info!(?command, "init process received command");

    make_mounts_private()?;
    remount_proc()?;

    let path = resolve_command(&command[0])?;
    tracing::info!(path = %path.display(), "resolved command");

    exec_replace(&path, &command)
}

/// Finds `name` on the inherited `PATH`, or returns it as-is if it is already a path.
pub fn resolve_command(name: &str) -> Result<PathBuf> {
    which::which(name).map_err(|source| Error::CommandNotFound {
        command: name.to_string(),
        source,
    })
}

/// Replaces the current process with `path`, passing `args` as argv.
///
/// The environment is inherited unchanged.
pub fn exec_replace(path: &Path, args: &[String]) -> Result<Infallible> {
    let exec_error = |source| Error::Exec {
        path: path.to_path_buf(),
        source,
    };
    let program = to_cstring(path.as_os_str()).map_err(exec_error)?;
    let argv = args
        .iter()
        .map(|arg| to_cstring(OsStr::new(arg)))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(exec_error)?;

    execv(&program, &argv).map_err(exec_error)
}

fn to_cstring(value: &OsStr) -> nix::Result<CString> {
    CString::new(value.as_bytes()).map_err(|_| nix::Error::EINVAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_command_on_path() {
        let path = resolve_command("sh").unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("sh"));
    }

    #[test]
    fn test_resolve_absolute_path() {
        assert_eq!(resolve_command("/bin/sh").unwrap(), PathBuf::from("/bin/sh"));
    }

    #[test]
    fn test_resolve_missing_command() {
        let err = resolve_command("definitely-not-a-real-command-4711").unwrap_err();
        assert!(matches!(err, Error::CommandNotFound { ref command, .. }
            if command == "definitely-not-a-real-command-4711"));
        assert_eq!(err.exit_code(), crate::error::EXIT_NOT_FOUND);
    }

    #[test]
    fn test_exec_rejects_interior_nul() {
        let args = vec!["sh".to_string(), "a\0b".to_string()];
        let err = exec_replace(Path::new("/bin/sh"), &args).unwrap_err();
        assert!(matches!(err, Error::Exec { source: nix::Error::EINVAL, .. }));
    }

    #[test]
    fn test_exec_missing_file_returns_error() {
        let args = vec!["ghost".to_string()];
        let err = exec_replace(Path::new("/nonexistent/ghost"), &args).unwrap_err();
        assert!(matches!(err, Error::Exec { source: nix::Error::ENOENT, .. }));
        assert_eq!(err.exit_code(), crate::error::EXIT_CANNOT_EXECUTE);
    }
}
