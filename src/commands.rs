//! Command handlers shared by the daemon and `--no-daemon` paths.

use crate::cli::WorkspaceArgs;
use crate::client::{ClientConfig, DaemonClient};
use anyhow::{anyhow, Context, Result};
use colored::*;
use lens_daemon::logging::{init_daemon_logging, install_crash_hook, LogBuffer};
use lens_daemon::protocol::{LogEntry, LogLevel, StatusResult};
use lens_daemon::{
    LensConfig, LensDaemon, Preference, QueryEngine, Scope, SearchSymbolsParams, SymbolInfoParams,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Absolute workspace root, defaulting to the current directory.
pub fn resolve_workspace_root(root: Option<&Path>, cwd: &Path) -> PathBuf {
    match root {
        Some(root) if root.is_absolute() => root.to_path_buf(),
        Some(root) => cwd.join(root),
        None => cwd.to_path_buf(),
    }
}

/// Relative files are taken from the current directory when they exist there,
/// otherwise left for the daemon to resolve against the workspace root.
pub fn resolve_source_file(file: &Path, cwd: &Path) -> PathBuf {
    if file.is_absolute() {
        return file.to_path_buf();
    }
    let candidate = cwd.join(file);
    if candidate.exists() {
        candidate
    } else {
        file.to_path_buf()
    }
}

pub fn symbol_params(
    file: &Path,
    line: u32,
    column: u32,
    workspace: &WorkspaceArgs,
    context_lines: Option<u32>,
    cwd: &Path,
) -> SymbolInfoParams {
    SymbolInfoParams {
        workspace_root_path: resolve_workspace_root(workspace.root.as_deref(), cwd),
        file_path: resolve_source_file(file, cwd),
        line,
        column,
        context_lines,
        workspace_kind: workspace.kind.clone(),
        toolchain: workspace.toolchain.clone(),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn search_params(
    query: &str,
    workspace: &WorkspaceArgs,
    scope: Scope,
    preference: Preference,
    exact: bool,
    limit: usize,
    enrich: bool,
    context_lines: u32,
    cwd: &Path,
) -> SearchSymbolsParams {
    SearchSymbolsParams {
        workspace_root_path: resolve_workspace_root(workspace.root.as_deref(), cwd),
        query: query.to_string(),
        limit,
        enrich,
        scope,
        preference,
        exact,
        context_lines,
        workspace_kind: workspace.kind.clone(),
        toolchain: workspace.toolchain.clone(),
    }
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn client_config(socket: Option<String>, log_level: &str) -> ClientConfig {
    ClientConfig {
        daemon_log_level: log_level.to_string(),
        ..ClientConfig::default()
    }
    .with_socket(socket)
}

pub async fn run_symbol(params: SymbolInfoParams, config: Option<ClientConfig>) -> Result<()> {
    match config {
        Some(config) => {
            let mut client = DaemonClient::connect(config).await?;
            print_json(&client.symbol_info(&params).await?)
        }
        None => {
            let engine = QueryEngine::from_config(&LensConfig::from_env());
            let result = engine.symbol_info(&params).await;
            engine.pool().shutdown_all().await;
            print_json(&result?)
        }
    }
}

pub async fn run_search(params: SearchSymbolsParams, config: Option<ClientConfig>) -> Result<()> {
    match config {
        Some(config) => {
            let mut client = DaemonClient::connect(config).await?;
            print_json(&client.search_symbols(&params).await?)
        }
        None => {
            let engine = QueryEngine::from_config(&LensConfig::from_env());
            let result = engine.search_symbols(&params).await;
            engine.pool().shutdown_all().await;
            print_json(&result?)
        }
    }
}

pub async fn run_logs(lines: usize, config: ClientConfig) -> Result<()> {
    let socket = config.socket_path.clone();
    let mut client = DaemonClient::connect_existing(&socket)
        .await
        .ok_or_else(|| anyhow!("Daemon is not running on {}", socket))?;
    for entry in client.logs(Some(lines)).await? {
        println!("{}", format_log_entry(&entry));
    }
    Ok(())
}

pub fn format_log_entry(entry: &LogEntry) -> String {
    let level = match entry.level {
        LogLevel::Error => entry.level.to_string().red().bold(),
        LogLevel::Warn => entry.level.to_string().yellow().bold(),
        LogLevel::Info => entry.level.to_string().green(),
        LogLevel::Debug | LogLevel::Trace => entry.level.to_string().dimmed(),
    };
    format!(
        "{} {:>5} {}: {}",
        entry.timestamp.dimmed(),
        level,
        entry.target,
        entry.message
    )
}

/// Run the daemon in this process until it is told to stop.
pub async fn run_daemon_foreground(socket: Option<String>, log_level: &str) -> Result<()> {
    let crash_log = install_crash_hook();
    let buffer = LogBuffer::new();
    init_daemon_logging(log_level, buffer.clone())?;
    tracing::info!("Crash log: {}", crash_log.display());

    let mut config = LensConfig::from_env();
    if let Some(socket) = socket {
        config.daemon.socket_path = socket;
    }
    LensDaemon::new(&config, buffer).run().await
}

pub async fn run_daemon_start(config: ClientConfig) -> Result<()> {
    let socket = config.socket_path.clone();
    if let Some(mut client) = DaemonClient::connect_existing(&socket).await {
        let ping = client.ping().await?;
        eprintln!(
            "{} Daemon already running on {} (PID: {})",
            "✓".green(),
            socket,
            ping.pid
        );
        return Ok(());
    }

    let mut client = DaemonClient::connect(ClientConfig {
        auto_start: true,
        ..config
    })
    .await?;
    let ping = client.ping().await?;
    eprintln!(
        "{} Daemon started on {} (PID: {})",
        "✓".green(),
        socket,
        ping.pid
    );
    Ok(())
}

pub async fn run_daemon_stop(config: ClientConfig) -> Result<()> {
    let socket = config.socket_path.clone();
    let Some(client) = DaemonClient::connect_existing(&socket).await else {
        eprintln!("Daemon is not running on {}", socket);
        return Ok(());
    };
    client
        .shutdown()
        .await
        .with_context(|| format!("Failed to stop daemon on {}", socket))?;
    eprintln!("{} Daemon stopped", "✓".green());
    Ok(())
}

pub async fn run_daemon_status(config: ClientConfig, json: bool) -> Result<()> {
    let socket = config.socket_path.clone();
    let Some(mut client) = DaemonClient::connect_existing(&socket).await else {
        if json {
            print_json(&serde_json::json!({ "running": false, "socket": socket }))?;
        } else {
            eprintln!("Daemon is not running on {}", socket);
        }
        return Ok(());
    };
    let status = client.status().await?;
    if json {
        print_json(&status)
    } else {
        println!("{}", format_status(&status, &socket));
        Ok(())
    }
}

pub fn format_status(status: &StatusResult, socket: &str) -> String {
    let mut out = vec![
        format!("{}", "sourcelens daemon".bold().green()),
        format!("  Version:     {}", status.version),
        format!("  PID:         {}", status.pid),
        format!("  Socket:      {}", socket),
        format!(
            "  Uptime:      {}",
            format_uptime(Duration::from_secs(status.uptime_secs))
        ),
        format!("  Requests:    {}", status.request_count),
        format!("  Connections: {}", status.active_connections),
    ];
    if status.sessions.is_empty() {
        out.push("  Sessions:    none".to_string());
    } else {
        out.push(format!("  Sessions:    {}", status.sessions.len()));
        for session in &status.sessions {
            out.push(format!(
                "    {} [{}] gen {} {} idle {}s, {} open",
                session.workspace.display(),
                session.kind,
                session.generation,
                session.state,
                session.idle_secs,
                session.opened_documents
            ));
        }
    }
    out.join("\n")
}

fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m {}s", secs / 60, secs % 60),
        _ => format!("{}h {}m", secs / 3600, (secs % 3600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lens_daemon::protocol::SessionSnapshot;

    #[test]
    fn test_workspace_root_resolution() {
        let cwd = Path::new("/work");
        assert_eq!(resolve_workspace_root(None, cwd), PathBuf::from("/work"));
        assert_eq!(
            resolve_workspace_root(Some(Path::new("App")), cwd),
            PathBuf::from("/work/App")
        );
        assert_eq!(
            resolve_workspace_root(Some(Path::new("/other")), cwd),
            PathBuf::from("/other")
        );
    }

    #[test]
    fn test_source_file_prefers_cwd_when_present() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("App.swift"), "struct App {}\n")?;

        let found = resolve_source_file(Path::new("App.swift"), dir.path());
        assert_eq!(found, dir.path().join("App.swift"));

        let missing = resolve_source_file(Path::new("Sources/Kit.swift"), dir.path());
        assert_eq!(missing, PathBuf::from("Sources/Kit.swift"));
        Ok(())
    }

    #[test]
    fn test_search_params_carry_flags() {
        let workspace = WorkspaceArgs {
            root: None,
            kind: Some("package".to_string()),
            toolchain: None,
        };
        let params = search_params(
            "Router",
            &workspace,
            Scope::Package,
            Preference::Project,
            true,
            5,
            true,
            2,
            Path::new("/work/App"),
        );
        assert_eq!(params.workspace_root_path, PathBuf::from("/work/App"));
        assert_eq!(params.scope, Scope::Package);
        assert_eq!(params.preference, Preference::Project);
        assert!(params.exact && params.enrich);
        assert_eq!((params.limit, params.context_lines), (5, 2));
        assert_eq!(params.workspace_kind.as_deref(), Some("package"));
    }

    #[test]
    fn test_status_lists_sessions() {
        colored::control::set_override(false);
        let status = StatusResult {
            version: "0.3.0".to_string(),
            pid: 42,
            uptime_secs: 3725,
            request_count: 9,
            active_connections: 1,
            sessions: vec![SessionSnapshot {
                workspace: PathBuf::from("/work/App"),
                kind: "package".to_string(),
                generation: 2,
                state: "ready".to_string(),
                idle_secs: 12,
                opened_documents: 3,
            }],
        };
        let text = format_status(&status, "/tmp/lens.sock");
        assert!(text.contains("Uptime:      1h 2m"));
        assert!(text.contains("/work/App [package] gen 2 ready idle 12s, 3 open"));
    }

    #[test]
    fn test_uptime_formatting() {
        assert_eq!(format_uptime(Duration::from_secs(42)), "42s");
        assert_eq!(format_uptime(Duration::from_secs(125)), "2m 5s");
    }
}
