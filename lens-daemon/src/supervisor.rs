//! Ownership of the sourcekit-lsp subprocess for one workspace.

use crate::config::SessionConfig;
use crate::error::{LensError, LensResult};
use crate::lsp_server::LspServer;
use crate::symbols::path_to_uri;
use crate::workspace::{Workspace, WorkspaceKind};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const BINARY_NAME: &str = "sourcekit-lsp";

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A ready, initialized connection. `id` is unique per launch, so a changed
/// id means the process behind the session was replaced.
#[async_trait]
pub trait AnalysisConnection: Send + Sync {
    fn id(&self) -> u64;

    fn is_alive(&self) -> bool {
        true
    }

    async fn request(&self, method: &str, params: Value) -> LensResult<Value>;

    async fn notify(&self, method: &str, params: Value) -> LensResult<()>;
}

#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Return the live connection, launching and initializing a process if needed.
    async fn acquire(
        &mut self,
        workspace: &Workspace,
        toolchain: Option<&Path>,
    ) -> LensResult<Arc<dyn AnalysisConnection>>;

    /// Kill the process unconditionally and forget the connection.
    async fn force_terminate(&mut self);

    /// `shutdown`/`exit` with a bounded wait, killing the process on failure.
    async fn shutdown(&mut self) -> LensResult<()>;
}

/// Creates a supervisor for each new session in the pool.
pub trait SupervisorFactory: Send + Sync {
    fn create(&self, config: &SessionConfig) -> Box<dyn Supervisor>;
}

#[derive(Debug, Default, Clone)]
pub struct SourceKitSupervisorFactory;

impl SupervisorFactory for SourceKitSupervisorFactory {
    fn create(&self, config: &SessionConfig) -> Box<dyn Supervisor> {
        Box::new(SourceKitSupervisor::new(config.clone()))
    }
}

pub struct SourceKitSupervisor {
    config: SessionConfig,
    current: Option<Arc<LspServer>>,
}

impl SourceKitSupervisor {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    async fn launch(
        &self,
        workspace: &Workspace,
        toolchain: Option<&Path>,
    ) -> LensResult<Arc<LspServer>> {
        let binary = resolve_sourcekit_lsp(toolchain).await?;
        let args = launch_arguments(workspace, &cache_root());
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst);
        info!(
            connection = id,
            "Launching {} {} for {}",
            binary.display(),
            args.join(" "),
            workspace
        );

        let child = tokio::process::Command::new(&binary)
            .args(&args)
            .current_dir(&workspace.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LensError::ProcessLaunchFailed {
                message: format!("{}: {}", binary.display(), e),
            })?;

        let server = Arc::new(LspServer::from_child(id, child)?);
        let budget = self.config.initialize_timeout;
        let handshake = async {
            server
                .request("initialize", initialize_params(workspace)?)
                .await?;
            server.notify("initialized", json!({})).await
        };

        match tokio::time::timeout(budget, handshake).await {
            Ok(Ok(())) => {
                debug!(connection = id, "sourcekit-lsp initialized");
                Ok(server)
            }
            Ok(Err(e)) => {
                server.terminate().await;
                Err(LensError::InitializationFailed {
                    message: e.to_string(),
                })
            }
            Err(_) => {
                server.terminate().await;
                Err(LensError::Timeout {
                    operation: "initialize",
                    budget,
                })
            }
        }
    }
}

#[async_trait]
impl Supervisor for SourceKitSupervisor {
    async fn acquire(
        &mut self,
        workspace: &Workspace,
        toolchain: Option<&Path>,
    ) -> LensResult<Arc<dyn AnalysisConnection>> {
        if let Some(server) = &self.current {
            if server.is_alive() {
                return Ok(server.clone());
            }
            warn!(connection = server.id(), "sourcekit-lsp connection is gone, relaunching");
            server.terminate().await;
            self.current = None;
        }

        let server = self.launch(workspace, toolchain).await?;
        self.current = Some(server.clone());
        Ok(server)
    }

    async fn force_terminate(&mut self) {
        if let Some(server) = self.current.take() {
            debug!(connection = server.id(), "Force terminating sourcekit-lsp");
            server.terminate().await;
        }
    }

    async fn shutdown(&mut self) -> LensResult<()> {
        match self.current.take() {
            Some(server) => server.shutdown(self.config.shutdown_timeout).await,
            None => Ok(()),
        }
    }
}

fn cache_root() -> PathBuf {
    dirs::cache_dir().unwrap_or_else(std::env::temp_dir)
}

/// Per-workspace scratch directory, kept apart from the user's `.build`.
pub fn scratch_path(cache_root: &Path, root: &Path) -> PathBuf {
    let digest = md5::compute(root.to_string_lossy().as_bytes());
    cache_root
        .join("sourcelens")
        .join("scratch")
        .join(format!("{digest:x}"))
}

pub fn launch_arguments(workspace: &Workspace, cache_root: &Path) -> Vec<String> {
    match workspace.kind {
        WorkspaceKind::Package => vec![
            "--default-workspace-type".to_string(),
            "swiftPM".to_string(),
            "--scratch-path".to_string(),
            scratch_path(cache_root, &workspace.root)
                .to_string_lossy()
                .to_string(),
        ],
        WorkspaceKind::IdeProject | WorkspaceKind::IdeWorkspace => {
            if workspace.build_server_descriptor().is_some() {
                vec![
                    "--default-workspace-type".to_string(),
                    "buildServer".to_string(),
                ]
            } else {
                warn!(
                    "No buildServer.json in {}; results will be limited to what the index already knows",
                    workspace.root.display()
                );
                Vec::new()
            }
        }
    }
}

pub fn initialize_params(workspace: &Workspace) -> LensResult<Value> {
    let root_uri = path_to_uri(&workspace.root)?;
    Ok(json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": "sourcelens",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "rootUri": root_uri,
        "rootPath": workspace.root.to_string_lossy(),
        "workspaceFolders": [{ "uri": root_uri, "name": workspace.name() }],
        "capabilities": {
            "textDocument": {
                "hover": { "contentFormat": ["markdown", "plaintext"] },
                "definition": { "linkSupport": true },
                "synchronization": { "didSave": false, "dynamicRegistration": false },
            },
            "workspace": {
                "symbol": { "dynamicRegistration": false },
                "configuration": true,
                "workspaceFolders": true,
            },
            "window": { "workDoneProgress": true },
        },
    }))
}

/// Find the sourcekit-lsp binary: toolchain override, then
/// `SOURCELENS_SOURCEKIT_LSP`, then `PATH`, then `xcrun --find`.
pub async fn resolve_sourcekit_lsp(toolchain: Option<&Path>) -> LensResult<PathBuf> {
    if let Some(toolchain) = toolchain {
        return binary_in_toolchain(toolchain).ok_or_else(|| LensError::ProcessLaunchFailed {
            message: format!("no {BINARY_NAME} in toolchain {}", toolchain.display()),
        });
    }

    if let Some(path) = std::env::var_os("SOURCELENS_SOURCEKIT_LSP") {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
        warn!(
            "SOURCELENS_SOURCEKIT_LSP points at {} which does not exist",
            path.display()
        );
    }

    if let Ok(path) = which::which(BINARY_NAME) {
        return Ok(path);
    }

    let output = tokio::process::Command::new("xcrun")
        .args(["--find", BINARY_NAME])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await;
    if let Ok(output) = output {
        let found = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() && !found.is_empty() {
            return Ok(PathBuf::from(found));
        }
    }

    Err(LensError::ProcessLaunchFailed {
        message: format!("{BINARY_NAME} not found on PATH or via xcrun"),
    })
}

fn binary_in_toolchain(toolchain: &Path) -> Option<PathBuf> {
    if toolchain.is_file() {
        return Some(toolchain.to_path_buf());
    }
    [
        toolchain.join("usr").join("bin").join(BINARY_NAME),
        toolchain.join("bin").join(BINARY_NAME),
    ]
    .into_iter()
    .find(|candidate| candidate.is_file())
}
