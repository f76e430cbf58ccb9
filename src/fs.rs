use std::path::Path;

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};

use crate::error::{Error, Result};

const PROC: &str = "/proc";

/// Flags for the container's procfs: no set-uid programs, no execution, no device files.
pub const PROC_MOUNT_FLAGS: MsFlags = MsFlags::MS_NOSUID
    .union(MsFlags::MS_NOEXEC)
    .union(MsFlags::MS_NODEV);

/// Stops mount events in this namespace from propagating back to the host.
pub(crate) fn make_mounts_private() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|source| Error::Mount {
        target: "/".into(),
        source,
    })
}

/// Replaces whatever is mounted on `/proc` with a procfs for the current PID namespace.
///
/// Safe to call whether or not `/proc` is already mounted: an inherited mount
/// is lazily detached first, and a missing mount is not an error.
pub(crate) fn remount_proc() -> Result<()> {
    let proc = Path::new(PROC);
    match umount2(proc, MntFlags::MNT_DETACH) {
        // EINVAL: not a mountpoint, ENOENT: no /proc directory yet
        Ok(()) | Err(Errno::EINVAL) => {}
        Err(Errno::ENOENT) => {
            std::fs::create_dir_all(proc).map_err(|e| Error::io(proc, e))?;
        }
        Err(source) => {
            return Err(Error::Mount {
                target: proc.into(),
                source,
            });
        }
    }

    mount(
        Some("proc"),
        proc,
        Some("proc"),
        PROC_MOUNT_FLAGS,
        None::<&str>,
    )
    .map_err(|source| Error::Mount {
        target: proc.into(),
        source,
    })?;
    tracing::debug!("mounted fresh procfs on /proc");
    Ok(())
}
