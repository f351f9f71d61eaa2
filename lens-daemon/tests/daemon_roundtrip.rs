mod fake_server;

use anyhow::Result;
use fake_server::{fast_config, location, symbol, Script};
use lens_daemon::config::{DaemonConfig, PoolConfig};
use lens_daemon::engine::QueryEngine;
use lens_daemon::ipc::{self, IpcStream};
use lens_daemon::logging::LogBuffer;
use lens_daemon::pool::SessionPool;
use lens_daemon::protocol::{
    DaemonMethod, DaemonRequest, DaemonResponse, MessageCodec, PingResult, StatusResult,
    INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR,
};
use lens_daemon::search::CheckoutDirectoryLocator;
use lens_daemon::workspace::MarkerLocator;
use lens_daemon::LensDaemon;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

struct Running {
    _dir: TempDir,
    socket: String,
    workspace: PathBuf,
    handle: JoinHandle<Result<()>>,
}

async fn start(script: &Script) -> Result<Running> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("lens.sock").to_string_lossy().to_string();
    let workspace = std::fs::canonicalize(dir.path())?.join("App");
    std::fs::create_dir_all(workspace.join("Sources/App"))?;
    std::fs::write(workspace.join("Package.swift"), "// swift-tools-version:5.9\n")?;
    std::fs::write(workspace.join("Sources/App/App.swift"), "final class App {}\n")?;

    let pool = Arc::new(SessionPool::new(
        PoolConfig::default(),
        fast_config(),
        script.factory(),
    ));
    let engine = Arc::new(QueryEngine::new(
        pool,
        Arc::new(MarkerLocator),
        Arc::new(CheckoutDirectoryLocator),
    ));
    let config = DaemonConfig {
        socket_path: socket.clone(),
        request_timeout: Duration::from_secs(10),
        ..DaemonConfig::default()
    };
    let daemon = LensDaemon::with_engine(config, engine, LogBuffer::with_capacity(64));
    let handle = tokio::spawn(daemon.run());

    for _ in 0..100 {
        if IpcStream::connect(&socket).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    Ok(Running {
        _dir: dir,
        socket,
        workspace,
        handle,
    })
}

async fn exchange(stream: &mut IpcStream, body: &[u8]) -> Result<DaemonResponse> {
    MessageCodec::write_framed(stream, body, IO_TIMEOUT).await?;
    let reply = MessageCodec::read_framed(stream, IO_TIMEOUT).await?;
    MessageCodec::decode(&reply)
}

async fn call(socket: &str, method: &str, params: Value) -> Result<DaemonResponse> {
    let mut stream = ipc::connect(socket).await?;
    let request = json!({"id": 42, "method": method, "params": params});
    exchange(&mut stream, &serde_json::to_vec(&request)?).await
}

fn search_params(workspace: &Path, query: &str) -> Value {
    json!({"workspaceRootPath": workspace, "query": query, "scope": "project"})
}

#[tokio::test]
async fn test_ping_and_status() -> Result<()> {
    let script = Script::new(|_| Ok(json!([])));
    let daemon = start(&script).await?;

    let ping = call(&daemon.socket, "ping", Value::Null).await?;
    assert_eq!(ping.id, json!(42));
    let ping: PingResult = serde_json::from_value(ping.into_result().unwrap())?;
    assert_eq!(ping.pid, std::process::id());
    assert!(!ping.version.is_empty());

    let status = call(&daemon.socket, "status", json!({})).await?;
    let status: StatusResult = serde_json::from_value(status.into_result().unwrap())?;
    assert!(status.request_count >= 2);
    assert!(status.sessions.is_empty());

    call(&daemon.socket, "shutdown", Value::Null).await?;
    tokio::time::timeout(IO_TIMEOUT, daemon.handle).await???;
    Ok(())
}

#[tokio::test]
async fn test_search_over_socket() -> Result<()> {
    let file_holder = Arc::new(std::sync::Mutex::new(PathBuf::new()));
    let file_for_script = file_holder.clone();
    let script = Script::new(move |call| match call.method {
        "workspace/symbol" => {
            let file = file_for_script.lock().unwrap().clone();
            Ok(json!([symbol("App", 5, &file, 1)]))
        }
        _ => Ok(Value::Null),
    });
    let daemon = start(&script).await?;
    *file_holder.lock().unwrap() = daemon.workspace.join("Sources/App/App.swift");

    let response = call(
        &daemon.socket,
        "searchSymbols",
        search_params(&daemon.workspace, "App"),
    )
    .await?;
    let results = response.into_result().unwrap();
    assert_eq!(results[0]["result"]["name"], "App");
    assert_eq!(results[0]["source"]["kind"], "project");
    assert_eq!(results[0]["isExactMatch"], true);

    let status = call(&daemon.socket, "status", Value::Null).await?;
    let status: StatusResult = serde_json::from_value(status.into_result().unwrap())?;
    assert_eq!(status.sessions.len(), 1);
    assert_eq!(status.sessions[0].workspace, daemon.workspace);
    assert_eq!(status.sessions[0].generation, 1);

    call(&daemon.socket, "shutdown", Value::Null).await?;
    tokio::time::timeout(IO_TIMEOUT, daemon.handle).await???;
    Ok(())
}

#[tokio::test]
async fn test_symbol_info_over_socket() -> Result<()> {
    let script = Script::new(|call| match call.method {
        "textDocument/definition" => {
            let file = call.root.join("Sources/App/App.swift");
            Ok(json!([location(&file, 1, 13)]))
        }
        _ => Ok(Value::Null),
    });
    let daemon = start(&script).await?;

    let response = call(
        &daemon.socket,
        "symbolInfo",
        json!({
            "workspaceRootPath": daemon.workspace,
            "filePath": "Sources/App/App.swift",
            "line": 1,
            "column": 13,
        }),
    )
    .await?;
    let info = response.into_result().unwrap();
    assert_eq!(info["symbol"], "App");
    assert_eq!(info["kind"], "class");
    assert_eq!(info["definition"]["startLine"], 1);

    call(&daemon.socket, "shutdown", Value::Null).await?;
    tokio::time::timeout(IO_TIMEOUT, daemon.handle).await???;
    Ok(())
}

#[tokio::test]
async fn test_error_envelopes() -> Result<()> {
    let script = Script::new(|_| Ok(json!([])));
    let daemon = start(&script).await?;

    let unknown = call(&daemon.socket, "definition", Value::Null).await?;
    assert_eq!(unknown.error.as_ref().map(|e| e.code), Some(METHOD_NOT_FOUND));

    let invalid = call(&daemon.socket, "symbolInfo", json!({"line": "three"})).await?;
    assert_eq!(invalid.error.as_ref().map(|e| e.code), Some(INVALID_PARAMS));

    let missing = call(
        &daemon.socket,
        "searchSymbols",
        search_params(&daemon.workspace, "Nothing"),
    )
    .await?;
    let error = missing.into_result().unwrap_err();
    assert_eq!(error.code, 1004);

    let mut stream = ipc::connect(&daemon.socket).await?;
    let garbage = exchange(&mut stream, b"{not json").await?;
    assert_eq!(garbage.error.as_ref().map(|e| e.code), Some(PARSE_ERROR));
    assert_eq!(garbage.id, Value::Null);

    // The connection stays usable after a malformed frame
    let request = DaemonRequest::new(7, DaemonMethod::Ping, Value::Null)?;
    let ping = exchange(&mut stream, &serde_json::to_vec(&request)?).await?;
    assert_eq!(ping.id, json!(7));
    assert!(ping.error.is_none());

    call(&daemon.socket, "shutdown", Value::Null).await?;
    tokio::time::timeout(IO_TIMEOUT, daemon.handle).await???;
    Ok(())
}

#[tokio::test]
async fn test_second_daemon_on_same_socket_fails() -> Result<()> {
    let script = Script::new(|_| Ok(json!([])));
    let daemon = start(&script).await?;

    let pool = Arc::new(SessionPool::new(
        PoolConfig::default(),
        fast_config(),
        script.factory(),
    ));
    let engine = Arc::new(QueryEngine::new(
        pool,
        Arc::new(MarkerLocator),
        Arc::new(CheckoutDirectoryLocator),
    ));
    let config = DaemonConfig {
        socket_path: daemon.socket.clone(),
        ..DaemonConfig::default()
    };
    let second = LensDaemon::with_engine(config, engine, LogBuffer::with_capacity(8));
    assert!(second.run().await.is_err());

    // The first daemon is unaffected
    let ping = call(&daemon.socket, "ping", Value::Null).await?;
    assert!(ping.error.is_none());

    call(&daemon.socket, "shutdown", Value::Null).await?;
    tokio::time::timeout(IO_TIMEOUT, daemon.handle).await???;
    assert!(!Path::new(&daemon.socket).exists());
    Ok(())
}
