pub mod daemon_path;
pub mod output;
pub mod process;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use process::{kill_daemon, restart_daemon};
use tracing::level_filters::LevelFilter;

use crate::{
    control::{
        protocol::{Reply, Request},
        ControlClient,
    },
    daemon::{
        serve_daemon,
        storage::entities::{IssueRelationship, OutcomeType},
    },
    utils::{
        dir::AppPaths,
        logging::{enable_logging, CLI_PREFIX},
    },
};

#[derive(Parser, Debug)]
#[command(name = "worktally", version, long_about = None)]
#[command(about = "Tracks where your working time goes", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(
        long,
        global = true,
        help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
    )]
    dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Print the raw JSON reply")]
    json: bool,
    #[arg(long, global = true, help = "Enable logging")]
    log: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Show the daemon, the open session and what is being tracked")]
    Status,
    #[command(about = "Start a session, or resume the paused one")]
    Start {
        #[arg(long)]
        project: Option<String>,
    },
    #[command(about = "End the open session")]
    Stop,
    #[command(about = "Pause tracking without ending the session")]
    Pause,
    #[command(about = "Resume a paused session")]
    Resume,
    #[command(about = "Attribute tracked time to a linked work item")]
    WorkOn { work_item_id: String },
    #[command(about = "Stop attributing time to a work item")]
    WorkOff,
    #[command(about = "Manage sessions by id")]
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
    #[command(about = "Manage the background daemon")]
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SessionCommand {
    #[command(about = "Start a session with a chosen id")]
    Start {
        id: String,
        #[arg(long)]
        project: Option<String>,
    },
    #[command(about = "End a session")]
    End {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    #[command(about = "Link an issue to a session")]
    Link {
        id: String,
        issue_id: String,
        #[arg(long)]
        system: String,
        #[arg(long, value_enum, default_value_t = IssueRelationship::Referenced)]
        relationship: IssueRelationship,
    },
    #[command(about = "Record an outcome of a session")]
    Outcome {
        id: String,
        #[arg(long = "type", value_enum)]
        kind: OutcomeType,
        #[arg(long)]
        reference: Option<String>,
        description: String,
    },
}

#[derive(Subcommand, Debug)]
enum DaemonCommand {
    #[command(about = "Start a detached daemon, replacing the running one")]
    Init,
    #[command(
        about = "Run a daemon directly in current console. Used for debugging",
        long_about = None
    )]
    Serve {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    #[command(about = "Stop the running daemon")]
    Kill,
}

impl Commands {
    /// Control request for commands answered by the daemon.
    fn into_request(self) -> Result<Request, DaemonCommand> {
        Ok(match self {
            Commands::Status => Request::Status,
            Commands::Start { project } => Request::Start { project },
            Commands::Stop => Request::Stop,
            Commands::Pause => Request::Pause,
            Commands::Resume => Request::Resume,
            Commands::WorkOn { work_item_id } => Request::WorkOn { work_item_id },
            Commands::WorkOff => Request::WorkOff,
            Commands::Session { command } => match command {
                SessionCommand::Start { id, project } => Request::SessionStart { id, project },
                SessionCommand::End { id, reason } => Request::SessionEnd { id, reason },
                SessionCommand::Link {
                    id,
                    issue_id,
                    system,
                    relationship,
                } => Request::SessionLink {
                    id,
                    issue_id,
                    system,
                    relationship,
                },
                SessionCommand::Outcome {
                    id,
                    kind,
                    reference,
                    description,
                } => Request::SessionOutcome {
                    id,
                    kind,
                    reference,
                    description,
                },
            },
            Commands::Daemon { command } => return Err(command),
        })
    }
}

pub fn run_cli() -> Result<()> {
    let args = Args::parse();
    let paths = AppPaths::resolve(args.dir)?;

    let logging_level = if args.log {
        Some(LevelFilter::TRACE)
    } else {
        None
    };

    match args.commands.into_request() {
        Ok(request) => {
            enable_logging(CLI_PREFIX, &paths.logs(), logging_level, args.log)?;
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?
                .block_on(send(&paths, request, args.json))
        }
        Err(DaemonCommand::Init) => {
            enable_logging(CLI_PREFIX, &paths.logs(), logging_level, args.log)?;
            restart_daemon(&paths)
        }
        Err(DaemonCommand::Kill) => {
            enable_logging(CLI_PREFIX, &paths.logs(), logging_level, args.log)?;
            match kill_daemon(&paths)? {
                Some(pid) => println!("Stopped daemon {pid}"),
                None => println!("Daemon is not running"),
            }
            Ok(())
        }
        Err(DaemonCommand::Serve { config }) => {
            enable_logging(
                crate::utils::logging::DAEMON_PREFIX,
                &paths.logs(),
                logging_level,
                true,
            )?;
            serve_daemon(paths, config)
        }
    }
}

async fn send(paths: &AppPaths, request: Request, json: bool) -> Result<()> {
    let client = ControlClient::new(paths.socket());
    let reply: Reply = client.call(&request).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&reply)?);
    } else {
        println!("{}", output::render_reply(&reply));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use crate::{
        control::protocol::Request,
        daemon::storage::entities::{IssueRelationship, OutcomeType},
    };

    use super::Args;

    fn request(args: &[&str]) -> Request {
        Args::parse_from(args)
            .commands
            .into_request()
            .unwrap_or_else(|command| panic!("{command:?} is not a control request"))
    }

    #[test]
    fn test_commands_map_to_requests() {
        assert_eq!(
            request(&["worktally", "work-on", "GH-4"]),
            Request::WorkOn {
                work_item_id: "GH-4".into()
            }
        );
        assert_eq!(
            request(&[
                "worktally",
                "session",
                "link",
                "s1",
                "GH-4",
                "--system",
                "github",
                "--relationship",
                "worked_on",
            ]),
            Request::SessionLink {
                id: "s1".into(),
                issue_id: "GH-4".into(),
                system: "github".into(),
                relationship: IssueRelationship::WorkedOn,
            }
        );
        assert_eq!(
            request(&[
                "worktally",
                "session",
                "outcome",
                "s1",
                "--type",
                "commit",
                "--reference",
                "abc123",
                "fix the parser",
            ]),
            Request::SessionOutcome {
                id: "s1".into(),
                kind: OutcomeType::Commit,
                reference: Some("abc123".into()),
                description: "fix the parser".into(),
            }
        );
    }

    #[test]
    fn test_daemon_commands_stay_local() {
        let args = Args::parse_from(["worktally", "daemon", "kill"]);
        assert!(args.commands.into_request().is_err());
    }
}
