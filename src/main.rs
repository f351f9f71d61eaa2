use anyhow::Result;
use clap::Parser as ClapParser;
use colored::*;
use lens_daemon::LensError;
use sourcelens::cli::{Args, Commands, DaemonCommand};
use sourcelens::client::daemon_error_code;
use sourcelens::commands;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(err) = run(args).await {
        let code = daemon_error_code(&err)
            .or_else(|| err.downcast_ref::<LensError>().map(LensError::code));
        match code {
            Some(code) => eprintln!("{} [{}] {}", "Error:".red().bold(), code, err),
            None => eprintln!("{} {:#}", "Error:".red().bold(), err),
        }
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    // The foreground daemon installs its own subscriber with the in-memory log layer
    let foreground_daemon = matches!(
        args.command,
        Commands::Daemon {
            action: DaemonCommand::Start { foreground: true }
        }
    );
    if !foreground_daemon {
        lens_daemon::logging::init_cli_logging(&args.log_level)?;
    }

    let cwd = std::env::current_dir()?;
    let client_config = commands::client_config(args.socket.clone(), &args.log_level);
    let via_daemon = (!args.no_daemon).then(|| client_config.clone());

    match args.command {
        Commands::Daemon { action } => match action {
            DaemonCommand::Start { foreground: true } => {
                commands::run_daemon_foreground(args.socket, &args.log_level).await
            }
            DaemonCommand::Start { foreground: false } => {
                commands::run_daemon_start(client_config).await
            }
            DaemonCommand::Stop => commands::run_daemon_stop(client_config).await,
            DaemonCommand::Status { json } => {
                commands::run_daemon_status(client_config, json).await
            }
        },
        Commands::Symbol {
            file,
            line,
            column,
            workspace,
            context_lines,
        } => {
            let params =
                commands::symbol_params(&file, line, column, &workspace, context_lines, &cwd);
            commands::run_symbol(params, via_daemon).await
        }
        Commands::Search {
            query,
            workspace,
            scope,
            preference,
            exact,
            limit,
            enrich,
            context_lines,
        } => {
            let params = commands::search_params(
                &query,
                &workspace,
                scope,
                preference,
                exact,
                limit,
                enrich,
                context_lines,
                &cwd,
            );
            commands::run_search(params, via_daemon).await
        }
        Commands::Logs { lines } => {
            if args.no_daemon {
                anyhow::bail!("logs are only kept by a running daemon");
            }
            commands::run_logs(lines, client_config).await
        }
    }
}
