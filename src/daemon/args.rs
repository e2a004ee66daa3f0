use std::path::PathBuf;

use clap::Parser;
use tracing::level_filters::LevelFilter;

#[derive(Parser, Debug)]
#[command(name = "worktally-daemon", version, about = "Background activity tracker")]
pub struct DaemonArgs {
    /// Run in the foreground instead of detaching.
    #[arg(long)]
    pub force: bool,
    #[arg(long, help = "Application directory. Defaults to $XDG_STATE_HOME/worktally")]
    pub dir: Option<PathBuf>,
    #[arg(long, help = "Configuration file. Defaults to config.toml in the application directory")]
    pub config: Option<PathBuf>,
    /// This option is for debugging purposes only.
    #[arg(long = "log-console")]
    pub log_console: bool,
    #[arg(long = "log-filter")]
    pub log: Option<LevelFilter>,
}
