use std::ffi::{CString, c_char};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;

use nix::errno::Errno;
use nix::sched::{CloneFlags, clone};
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::cgroups::{CgroupManager, CgroupV2Manager, MountProbe, ResourceConfig};
use crate::channel::{self, CommandSink, ControlWriter, INIT_PIPE_FD};
use crate::error::{Error, Result};
use crate::logging::LogConfig;

const STACK_SIZE: usize = 1024 * 1024;

/// Argument that switches the re-executed binary into init mode.
pub const INIT_SUBCOMMAND: &str = "init";

/// Namespaces the container gets. No user namespace: root inside is root outside.
pub const NAMESPACE_FLAGS: CloneFlags = CloneFlags::CLONE_NEWUTS
    .union(CloneFlags::CLONE_NEWPID)
    .union(CloneFlags::CLONE_NEWNS)
    .union(CloneFlags::CLONE_NEWNET)
    .union(CloneFlags::CLONE_NEWIPC);

/// A child process that can be started once and waited for.
pub trait ContainerProcess {
    fn start(&mut self) -> Result<Pid>;
    /// Blocks until the child exits and returns its exit code.
    fn wait(&mut self) -> Result<i32>;
}

/// The not-yet-started init process: this executable, re-run as `init`
/// inside fresh namespaces, reading its command from the control channel.
#[derive(Debug)]
pub struct ParentProcess {
    program: CString,
    argv: Vec<CString>,
    flags: CloneFlags,
    interactive: bool,
    init_pipe: Option<OwnedFd>,
    pid: Option<Pid>,
}

/// Builds the init process and the write end of its control channel.
///
/// With `interactive` the child shares this process's stdin/stdout/stderr;
/// otherwise they are connected to `/dev/null`. The init process logs with
/// the same settings as the launcher.
pub fn new_parent_process(
    interactive: bool,
    log: &LogConfig,
) -> Result<(ParentProcess, ControlWriter)> {
    let exe = std::env::current_exe().map_err(|e| Error::io("/proc/self/exe", e))?;
    let program = CString::new(exe.as_os_str().as_bytes())
        .map_err(|e| Error::io(&exe, std::io::Error::other(e)))?;
    let mut argv = vec![program.clone()];
    for arg in init_args(log) {
        argv.push(CString::new(arg).map_err(|e| Error::io(&exe, std::io::Error::other(e)))?);
    }

    let (read, writer) = channel::control_channel()?;
    tracing::debug!(exe = %exe.display(), interactive, "prepared init process");

    Ok((
        ParentProcess {
            program,
            argv,
            flags: NAMESPACE_FLAGS,
            interactive,
            init_pipe: Some(read),
            pid: None,
        },
        writer,
    ))
}

/// Arguments after the program name that start this binary in init mode.
fn init_args(log: &LogConfig) -> Vec<String> {
    vec![
        "--log-level".to_string(),
        log.filter.clone(),
        "--log-format".to_string(),
        log.format.as_str().to_string(),
        INIT_SUBCOMMAND.to_string(),
    ]
}

impl ParentProcess {
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }
}

impl ContainerProcess for ParentProcess {
    /// Clones the child with all namespace flags applied at creation time.
    fn start(&mut self) -> Result<Pid> {
        if self.pid.is_some() {
            return Err(Error::AlreadyStarted);
        }
        let init_pipe = self.init_pipe.take().ok_or(Error::AlreadyStarted)?;
        let dev_null = if self.interactive {
            None
        } else {
            Some(open_dev_null()?)
        };

        // execv(3) takes a null-terminated pointer array; build it here so the
        // child does not allocate after clone.
        let program = self.program.as_ptr();
        let argv_ptrs: Vec<*const c_char> = self
            .argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let argv = argv_ptrs.as_ptr();
        let pipe_fd = init_pipe.as_raw_fd();
        let null_fd = dev_null.as_ref().map(AsRawFd::as_raw_fd);

        // allocate stack for the child process
        let mut stack = vec![0u8; STACK_SIZE];
        let child_pid = unsafe {
            clone(
                Box::new(move || {
                    // Only async-signal-safe calls between here and execv.
                    if let Err(errno) = install_child_fds(pipe_fd, null_fd) {
                        return errno as isize;
                    }
                    libc::execv(program, argv);
                    Errno::last_raw() as isize
                }),
                &mut stack,
                self.flags,
                Some(Signal::SIGCHLD as i32),
            )
        }
        .map_err(Error::Clone)?;

        tracing::info!(pid = child_pid.as_raw(), "started init process");
        self.pid = Some(child_pid);
        Ok(child_pid)
    }

    fn wait(&mut self) -> Result<i32> {
        let pid = self.pid.ok_or(Error::NotStarted)?;
        wait_for_child(pid)
    }
}

fn open_dev_null() -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(|e| Error::io("/dev/null", e))
}

/// Runs in the cloned child: puts the channel at its fixed slot and detaches stdio if asked.
fn install_child_fds(pipe_fd: i32, null_fd: Option<i32>) -> nix::Result<()> {
    unsafe {
        if let Some(null_fd) = null_fd {
            for stdio in 0..3 {
                Errno::result(libc::dup2(null_fd, stdio))?;
            }
        }
        if pipe_fd == INIT_PIPE_FD {
            let flags = Errno::result(libc::fcntl(pipe_fd, libc::F_GETFD))?;
            Errno::result(libc::fcntl(pipe_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC))?;
        } else {
            Errno::result(libc::dup2(pipe_fd, INIT_PIPE_FD))?;
        }
    }
    Ok(())
}

fn wait_for_child(pid: Pid) -> Result<i32> {
    let code = match waitpid(pid, None).map_err(Error::Wait)? {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 1,
    };
    tracing::info!(pid = pid.as_raw(), code, "container process exited");
    Ok(code)
}

/// Everything needed to run one container.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub command: Vec<String>,
    pub interactive: bool,
    pub resources: ResourceConfig,
    /// Name of the cgroup under the cgroup2 mountpoint.
    pub cgroup_name: String,
    /// Logging settings handed to the init process.
    pub log: LogConfig,
}

/// Runs `options.command` in a new container and returns its exit code.
///
/// Input is validated before any pipe, process or cgroup is created.
pub fn run_container(options: &RunOptions, probe: &impl MountProbe) -> Result<i32> {
    if options.command.is_empty() {
        return Err(Error::MissingCommand);
    }
    options.resources.validate()?;

    let (process, writer) = new_parent_process(options.interactive, &options.log)?;
    let cgroup = CgroupV2Manager::new(&options.cgroup_name, probe)?;
    launch(process, writer, &cgroup, &options.resources, &options.command)
}

/// Drives one container through its lifecycle.
///
/// The child is attached to the cgroup before the command is sent, so it
/// never runs the command unconstrained. If anything fails after the child
/// started, the channel is closed empty, which makes the child exit without
/// running anything; it is reaped and the cgroup removed before the error is
/// returned.
pub fn launch<P, W, C>(
    mut process: P,
    writer: W,
    cgroup: &C,
    resources: &ResourceConfig,
    command: &[String],
) -> Result<i32>
where
    P: ContainerProcess,
    W: CommandSink,
    C: CgroupManager,
{
    cgroup.create()?;
    if let Err(e) = cgroup.set(resources) {
        release_cgroup(cgroup);
        return Err(e);
    }

    let pid = match process.start() {
        Ok(pid) => pid,
        Err(e) => {
            release_cgroup(cgroup);
            return Err(e);
        }
    };

    if let Err(e) = cgroup.add_process(pid) {
        // closing the channel unsent is what lets the child exit
        drop(writer);
        return Err(abort(&mut process, cgroup, pid, e));
    }
    if let Err(e) = writer.send(command) {
        return Err(abort(&mut process, cgroup, pid, e));
    }

    let status = process.wait();
    release_cgroup(cgroup);
    status
}

fn abort(
    process: &mut impl ContainerProcess,
    cgroup: &impl CgroupManager,
    pid: Pid,
    cause: Error,
) -> Error {
    tracing::error!(pid = pid.as_raw(), error = %cause, "aborting container start");
    if let Err(e) = process.wait() {
        tracing::warn!(error = %e, "failed to reap aborted init process");
    }
    release_cgroup(cgroup);
    cause
}

fn release_cgroup(cgroup: &impl CgroupManager) {
    if let Err(e) = cgroup.destroy() {
        tracing::warn!(error = %e, "failed to remove cgroup");
    }
}
