use std::{env::args, process::ExitCode};

use anyhow::Result;
use clap::Parser;
use tracing::error;
use worktally::{
    daemon::{args::DaemonArgs, lifecycle::ensure_not_running, serve_daemon},
    error::TrackerError,
    utils::{
        dir::AppPaths,
        logging::{enable_logging, DAEMON_PREFIX},
    },
};

fn main() -> ExitCode {
    match run_service(args().collect::<Vec<_>>()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("worktally daemon failed {e:?}");
            if let Some(TrackerError::AlreadyRunning { pid }) = e.downcast_ref::<TrackerError>() {
                eprintln!("worktally daemon is already running with pid {pid}");
            } else {
                eprintln!("worktally daemon failed: {e:?}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run_service(command_args: Vec<String>) -> Result<()> {
    let mut args = DaemonArgs::parse_from(&command_args);
    let paths = AppPaths::resolve(args.dir.clone())?;
    // Checked before forking so the invoking shell sees the refusal. The child still takes the
    // real lock for its own pid.
    ensure_not_running(&paths.pid_file())?;
    args.config = args.config.map(std::path::absolute).transpose()?;

    if !args.force {
        use daemonize::Daemonize;

        let daemonize = Daemonize::new()
            .stdout(daemonize::Stdio::devnull())
            .stderr(daemonize::Stdio::devnull())
            .execute();
        match daemonize {
            daemonize::Outcome::Parent(parent) => {
                parent?;
                println!("Created daemon");
                return Ok(());
            }
            daemonize::Outcome::Child(child) => child?,
        };
    }

    enable_logging(DAEMON_PREFIX, &paths.logs(), args.log, args.log_console)?;
    serve_daemon(paths, args.config)
}
