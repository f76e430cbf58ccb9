use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;
use regex::Regex;

use crate::error::{Error, Result};

const PROC_MOUNTS: &str = "/proc/mounts";
const CGROUP2_FSTYPE: &str = "cgroup2";

const CGROUP_PROCS: &str = "cgroup.procs";
const SUBTREE_CONTROL: &str = "cgroup.subtree_control";
const MEMORY_MAX: &str = "memory.max";
const CPUSET_CPUS: &str = "cpuset.cpus";
const CPU_WEIGHT: &str = "cpu.weight";

const CONTROLLERS: [&str; 3] = ["cpuset", "cpu", "memory"];

/// Resource limits for a container. `None` leaves that dimension unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceConfig {
    /// Memory ceiling written to `memory.max` (e.g. "512m", "max").
    pub memory_limit: Option<String>,
    /// CPU weight written to `cpu.weight` (1-10000).
    pub cpu_share: Option<String>,
    /// CPU list written to `cpuset.cpus` (e.g. "0", "0-3,6").
    pub cpu_set: Option<String>,
}

impl ResourceConfig {
    /// Checks every present field against the format the cgroup v2 interface accepts.
    pub fn validate(&self) -> Result<()> {
        if let Some(limit) = &self.memory_limit {
            validate_memory_limit(limit)?;
        }
        if let Some(cpus) = &self.cpu_set {
            validate_cpu_set(cpus)?;
        }
        if let Some(weight) = &self.cpu_share {
            validate_cpu_weight(weight)?;
        }
        Ok(())
    }
}

/// Locates the mountpoint of a cgroup v2 hierarchy.
pub trait MountProbe {
    fn cgroup2_mountpoint(&self) -> Result<PathBuf>;
}

/// Scans a mount table in `/proc/mounts` format.
#[derive(Debug, Clone)]
pub struct ProcMounts {
    table: PathBuf,
}

impl ProcMounts {
    pub fn new(table: impl Into<PathBuf>) -> Self {
        Self {
            table: table.into(),
        }
    }
}

impl Default for ProcMounts {
    fn default() -> Self {
        Self::new(PROC_MOUNTS)
    }
}

impl MountProbe for ProcMounts {
    fn cgroup2_mountpoint(&self) -> Result<PathBuf> {
        let contents =
            fs::read_to_string(&self.table).map_err(|e| Error::io(&self.table, e))?;
        find_mountpoint(&contents, CGROUP2_FSTYPE).ok_or_else(|| Error::MountpointNotFound {
            fstype: CGROUP2_FSTYPE.to_string(),
            table: self.table.clone(),
        })
    }
}

/// A mountpoint supplied by the caller instead of discovered.
#[derive(Debug, Clone)]
pub struct FixedMountpoint(pub PathBuf);

impl MountProbe for FixedMountpoint {
    fn cgroup2_mountpoint(&self) -> Result<PathBuf> {
        Ok(self.0.clone())
    }
}

/// Lifecycle of a single control group.
pub trait CgroupManager {
    /// Ensures the cgroup directory exists.
    fn create(&self) -> Result<()>;
    /// Applies every present limit, stopping at the first failed write.
    fn set(&self, res: &ResourceConfig) -> Result<()>;
    /// Moves a process into the cgroup.
    fn add_process(&self, pid: Pid) -> Result<()>;
    /// Lists member processes in the order the kernel reports them.
    fn get_processes(&self) -> Result<Vec<Pid>>;
    /// Removes the cgroup. Fails while processes are still attached.
    fn destroy(&self) -> Result<()>;
}

/// A cgroup v2 node at `<mountpoint>/<name>`.
#[derive(Debug, Clone)]
pub struct CgroupV2Manager {
    root: PathBuf,
    path: PathBuf,
}

impl CgroupV2Manager {
    /// Resolves the cgroup2 mountpoint through `probe` and names the group under it.
    ///
    /// Nothing is created on disk until [`CgroupManager::create`] is called.
    pub fn new(name: &str, probe: &impl MountProbe) -> Result<Self> {
        let root = probe.cgroup2_mountpoint()?;
        let path = root.join(name);
        tracing::debug!(path = %path.display(), "resolved cgroup path");
        Ok(Self { root, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Enables the controllers needed by [`ResourceConfig`] for children of the mountpoint.
    fn enable_controllers(&self) {
        let subtree_control = self.root.join(SUBTREE_CONTROL);
        for controller in CONTROLLERS {
            if let Err(e) = fs::write(&subtree_control, format!("+{controller}")) {
                tracing::warn!(
                    controller,
                    file = %subtree_control.display(),
                    error = %e,
                    "could not enable cgroup controller"
                );
            }
        }
    }

    fn write_file(&self, name: &str, value: &str) -> Result<()> {
        let file = self.path.join(name);
        let mut handle = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&file)
            .map_err(|e| Error::io(&file, e))?;
        handle
            .write_all(value.as_bytes())
            .map_err(|e| Error::io(&file, e))?;
        tracing::debug!(file = %file.display(), value, "cgroup parameter written");
        Ok(())
    }
}

impl CgroupManager for CgroupV2Manager {
    fn create(&self) -> Result<()> {
        self.enable_controllers();
        fs::create_dir_all(&self.path).map_err(|e| Error::io(&self.path, e))?;
        tracing::info!(path = %self.path.display(), "cgroup created");
        Ok(())
    }

    fn set(&self, res: &ResourceConfig) -> Result<()> {
        if let Some(limit) = &res.memory_limit {
            self.write_file(MEMORY_MAX, limit)?;
        }
        if let Some(cpus) = &res.cpu_set {
            self.write_file(CPUSET_CPUS, cpus)?;
        }
        if let Some(weight) = &res.cpu_share {
            self.write_file(CPU_WEIGHT, weight)?;
        }
        Ok(())
    }

    fn add_process(&self, pid: Pid) -> Result<()> {
        let procs_file = self.path.join(CGROUP_PROCS);
        let mut handle = OpenOptions::new()
            .append(true)
            .open(&procs_file)
            .map_err(|e| Error::io(&procs_file, e))?;
        handle
            .write_all(format!("{pid}\n").as_bytes())
            .map_err(|e| Error::io(&procs_file, e))?;
        tracing::debug!(pid = pid.as_raw(), "added process to cgroup");
        Ok(())
    }

    fn get_processes(&self) -> Result<Vec<Pid>> {
        let procs_file = self.path.join(CGROUP_PROCS);
        let contents = fs::read_to_string(&procs_file).map_err(|e| Error::io(&procs_file, e))?;
        parse_pids(&contents, &procs_file)
    }

    fn destroy(&self) -> Result<()> {
        if self.path.join(CGROUP_PROCS).exists() {
            let pids = self.get_processes()?;
            if !pids.is_empty() {
                return Err(Error::CgroupBusy {
                    path: self.path.clone(),
                    pids: pids.len(),
                });
            }
        }
        match fs::remove_dir(&self.path) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                return Err(Error::CgroupBusy {
                    path: self.path.clone(),
                    pids: 0,
                });
            }
            Err(e) => return Err(Error::io(&self.path, e)),
        }
        tracing::info!(path = %self.path.display(), "cgroup destroyed");
        Ok(())
    }
}

fn parse_pids(contents: &str, source: &Path) -> Result<Vec<Pid>> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<i32>()
                .ok()
                .filter(|pid| *pid > 0)
                .map(Pid::from_raw)
                .ok_or_else(|| Error::InvalidPid {
                    path: source.to_path_buf(),
                    line: line.to_string(),
                })
        })
        .collect()
}

/// Returns the mountpoint of the first entry with filesystem type `fstype`.
fn find_mountpoint(mount_table: &str, fstype: &str) -> Option<PathBuf> {
    mount_table.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let mountpoint = fields.nth(1)?;
        (fields.next()? == fstype).then(|| PathBuf::from(unescape_mount_field(mountpoint)))
    })
}

/// Decodes the `\ooo` octal escapes the kernel uses for spaces, tabs and backslashes.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Validates a memory limit for cgroup v2 `memory.max`.
///
/// Accepts "max" or a positive byte count with an optional K/M/G/T suffix,
/// case-insensitive: "max", "1048576", "512m", "2G".
fn validate_memory_limit(limit: &str) -> Result<()> {
    let re = Regex::new(r"^(?i)(?:max|(\d+)[kmgt]?)$")
        .map_err(|e| Error::InvalidConfig(e.to_string()))?;
    let caps = re.captures(limit).ok_or_else(|| {
        Error::InvalidConfig(format!(
            "unsupported memory limit '{limit}'. Use: max, bytes, or units K/M/G/T"
        ))
    })?;
    let zero = caps
        .get(1)
        .is_some_and(|amount| amount.as_str().bytes().all(|b| b == b'0'));
    if zero {
        return Err(Error::InvalidConfig(format!(
            "memory limit '{limit}' must be greater than 0"
        )));
    }
    Ok(())
}

/// Validates a CPU list such as "0", "0-3" or "0,2-4".
fn validate_cpu_set(cpus: &str) -> Result<()> {
    let re = Regex::new(r"^\d+(?:-\d+)?(?:,\d+(?:-\d+)?)*$")
        .map_err(|e| Error::InvalidConfig(e.to_string()))?;
    if !re.is_match(cpus) {
        return Err(Error::InvalidConfig(format!(
            "unsupported cpuset '{cpus}'. Use a list like 0,2-3"
        )));
    }
    Ok(())
}

/// Validates a `cpu.weight` value, which cgroup v2 bounds to 1-10000.
fn validate_cpu_weight(weight: &str) -> Result<()> {
    match weight.parse::<u32>() {
        Ok(w) if (1..=10000).contains(&w) => Ok(()),
        _ => Err(Error::InvalidConfig(format!(
            "cpu weight '{weight}' must be an integer between 1 and 10000"
        ))),
    }
}
