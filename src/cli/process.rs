use std::{
    env,
    process::{Command, Stdio},
};

use anyhow::{bail, Context, Result};
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};

use crate::{daemon::lifecycle::running_pid, utils::dir::AppPaths};

use super::daemon_path::to_daemon_path;

/// Sends SIGTERM to the daemon that owns the pid marker and waits until it exits. Returns the pid
/// of the stopped daemon.
pub fn kill_daemon(paths: &AppPaths) -> Result<Option<u32>> {
    let Some(pid) = running_pid(&paths.pid_file()) else {
        return Ok(None);
    };
    let process_id = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[process_id]), true);
    let Some(process) = system.process(process_id) else {
        return Ok(None);
    };

    if process.kill_with(Signal::Term).is_none() {
        process.kill();
    }
    process.wait();
    Ok(Some(pid))
}

/// Stops the running daemon, if any, and starts a detached one for the same directory.
pub fn restart_daemon(paths: &AppPaths) -> Result<()> {
    if let Some(pid) = kill_daemon(paths)? {
        println!("Stopped daemon {pid}");
    }

    // The daemon binary is expected next to the current executable.
    let process_name = env::current_exe().context("Can't operate without an executable")?;
    let mut command = Command::new(to_daemon_path(process_name));
    command.arg("--dir").arg(paths.root());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command.stdin(Stdio::null());
    command.stdout(Stdio::null());

    // The daemon forks itself, so this only waits for the parent half.
    let status = command.status().context("Failed to launch the daemon")?;
    if !status.success() {
        bail!("Daemon exited with {status}");
    }
    println!("Created daemon");
    Ok(())
}
