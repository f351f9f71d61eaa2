use clap::{Parser as ClapParser, Subcommand};
use lens_daemon::{Preference, Scope};
use std::path::PathBuf;

#[derive(ClapParser, Debug)]
#[command(
    name = "sourcelens",
    about = "Symbol lookup and ranked symbol search for Swift workspaces",
    version
)]
pub struct Args {
    /// Path to the daemon socket (overrides SOURCELENS_SOCKET_PATH)
    #[arg(long, global = true)]
    pub socket: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long = "log-level", global = true, default_value = "warn")]
    pub log_level: String,

    /// Answer the query in this process instead of going through the daemon
    #[arg(long = "no-daemon", global = true)]
    pub no_daemon: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonCommand,
    },

    /// Describe the symbol at a position: definition, hover text and module
    Symbol {
        /// Source file, absolute or relative to the current directory
        file: PathBuf,

        /// One-based line
        line: u32,

        /// One-based column
        column: u32,

        #[command(flatten)]
        workspace: WorkspaceArgs,

        /// Lines of source to include around the definition
        #[arg(short = 'C', long = "context")]
        context_lines: Option<u32>,
    },

    /// Ranked workspace symbol search across the project and its dependencies
    Search {
        /// Symbol name or fragment
        query: String,

        #[command(flatten)]
        workspace: WorkspaceArgs,

        /// Which results to return: project, package or all
        #[arg(long, default_value = "all")]
        scope: Scope,

        /// Favor project or dependency results among equal matches
        #[arg(long = "prefer", default_value = "none")]
        preference: Preference,

        /// Only return results whose name equals the query
        #[arg(long)]
        exact: bool,

        /// Maximum number of results (0 for no limit)
        #[arg(short = 'l', long, default_value = "20")]
        limit: usize,

        /// Add hover signature and documentation to each result
        #[arg(long)]
        enrich: bool,

        /// Lines of source to include around each result
        #[arg(short = 'C', long = "context", default_value = "0")]
        context_lines: u32,
    },

    /// Show recent daemon log entries
    Logs {
        /// Number of entries to show
        #[arg(short = 'n', long = "lines", default_value = "100")]
        lines: usize,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct WorkspaceArgs {
    /// Workspace root; defaults to the current directory
    #[arg(short = 'w', long = "workspace")]
    pub root: Option<PathBuf>,

    /// Workspace kind (package, ide-project, ide-workspace); detected when omitted
    #[arg(long = "kind")]
    pub kind: Option<String>,

    /// Toolchain directory whose sourcekit-lsp should be used
    #[arg(long)]
    pub toolchain: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Start the daemon
    Start {
        /// Run in the foreground instead of spawning a background process
        #[arg(short, long)]
        foreground: bool,
    },

    /// Ask a running daemon to shut down
    Stop,

    /// Show daemon version, uptime and pooled sessions
    Status {
        /// Print the raw status JSON
        #[arg(long)]
        json: bool,
    },
}
