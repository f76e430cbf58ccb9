//! End-to-end runs of the binary. The ignored ones need root and a cgroup2 mount:
//! `sudo -E cargo test --test end_to_end -- --ignored --test-threads=1`

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

use minidock::cgroups::{MountProbe, ProcMounts};

const BIN: &str = env!("CARGO_BIN_EXE_minidock");

fn minidock(name: &str, command: &[&str]) -> Output {
    Command::new(BIN)
        .args(["run", "--ti", "-m", "512m", "--cpuset", "0", "--cpushare", "1024"])
        .args(["--name", name])
        .args(command)
        .output()
        .unwrap()
}

fn cgroup_dir(name: &str) -> PathBuf {
    ProcMounts::default().cgroup2_mountpoint().unwrap().join(name)
}

#[test]
#[ignore = "needs root and cgroup2"]
fn test_echo_runs() {
    let name = "minidock-it-echo";
    let output = minidock(name, &["echo", "hello"]);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hello\n");
    assert!(!cgroup_dir(name).exists());
}

#[test]
#[ignore = "needs root and cgroup2"]
fn test_limits_are_in_force_while_command_runs() {
    let name = "minidock-it-limits";
    let dir = cgroup_dir(name);
    let files: Vec<String> = ["memory.max", "cpuset.cpus", "cpu.weight"]
        .iter()
        .map(|file| dir.join(file).display().to_string())
        .collect();
    let mut command = vec!["cat"];
    command.extend(files.iter().map(String::as_str));

    let output = minidock(name, &command);
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().collect::<Vec<_>>(), ["536870912", "0", "1024"]);
    assert!(!dir.exists());
}

#[test]
#[ignore = "needs root and cgroup2"]
fn test_container_is_pid_one() {
    let output = minidock("minidock-it-pid", &["readlink", "/proc/self"]);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "1");
}

#[test]
#[ignore = "needs root and cgroup2"]
fn test_exit_code_is_propagated() {
    let output = minidock("minidock-it-exit", &["false"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
#[ignore = "needs root and cgroup2"]
fn test_log_level_reaches_init() {
    let output = Command::new(BIN)
        .args(["--log-level", "error", "run", "--ti", "--name", "minidock-it-log"])
        .args(["echo", "hello"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert!(!String::from_utf8_lossy(&output.stderr).contains("INFO"));
}

#[test]
#[ignore = "needs root and cgroup2"]
fn test_unknown_command_exits_not_found() {
    let name = "minidock-it-missing";
    let output = minidock(name, &["no-such-program-4711"]);
    assert_eq!(output.status.code(), Some(127));
    assert!(String::from_utf8_lossy(&output.stderr).contains("command not found"));
    assert!(!cgroup_dir(name).exists());
}

#[test]
fn test_missing_command_fails_before_setup() {
    let tmp = tempfile::tempdir().unwrap();
    let output = Command::new(BIN)
        .args(["run", "--name", "unused", "--cgroup-root"])
        .arg(tmp.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(125));
    assert!(String::from_utf8_lossy(&output.stderr).contains("missing container command"));
    assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
}
