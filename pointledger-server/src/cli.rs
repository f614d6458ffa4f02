use clap::{Parser, Subcommand};

const HELP_EPILOG: &str = r#"Server options can also be provided via environment variables:
  CONFIG_PATH (default: ./config.yaml)
  DB_PATH     (default: data/app.db)
  PORT        (default: 5152 or config.listen_port)

The `reconcile` command replays the transaction log and repairs derived
state (totals, levels, streaks, missed achievement unlocks). It is safe to
run at any time, including while the server is up.
"#;

#[derive(Debug, Parser)]
#[command(
    name = "pointledger-server",
    version,
    about = "Pointledger gamification engine server",
    long_about = None,
    after_long_help = HELP_EPILOG,
)]
pub struct Cli {
    /// Optional subcommand. Without one, runs the server.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Recompute derived state from the transaction log and repair drift
    Reconcile {
        /// Limit the sweep to a single child id
        #[arg(long)]
        child: Option<String>,
    },
}
