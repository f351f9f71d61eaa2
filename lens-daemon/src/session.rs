//! Per-workspace session: request execution with timeouts, the one-restart
//! recovery protocol and the generation-scoped opened-document cache.

use crate::config::SessionConfig;
use crate::error::{LensError, LensResult};
use crate::protocol::SessionSnapshot;
use crate::recovery::{is_transient_severe, RestartBudget};
use crate::search::ranking::classify_source;
use crate::snippet::{declaration_keyword, module_from_path, SourceFile};
use crate::supervisor::{AnalysisConnection, Supervisor};
use crate::symbols::{
    kind_from_keyword, parse_definition_response, parse_hover_response, parse_workspace_symbols,
    path_to_uri, HoverText, LspPosition, SymbolInfo, SymbolLocation, SymbolSearchResult,
};
use crate::workspace::Workspace;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Uninitialized,
    Acquiring,
    Ready,
    InFlight,
    Restarting,
    ShutDown,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Acquiring => "acquiring",
            SessionState::Ready => "ready",
            SessionState::InFlight => "in-flight",
            SessionState::Restarting => "restarting",
            SessionState::ShutDown => "shut-down",
        }
    }
}

pub struct Session {
    workspace: Workspace,
    toolchain: Option<PathBuf>,
    config: SessionConfig,
    supervisor: Box<dyn Supervisor>,
    state: SessionState,
    generation: u64,
    connection_id: Option<u64>,
    /// Document URI -> generation it was opened under
    opened: HashMap<String, u64>,
    restarts: u64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("workspace", &self.workspace)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("opened", &self.opened.len())
            .finish()
    }
}

impl Session {
    pub fn new(
        workspace: Workspace,
        config: SessionConfig,
        supervisor: Box<dyn Supervisor>,
        toolchain: Option<PathBuf>,
    ) -> Self {
        Self {
            workspace,
            toolchain,
            config,
            supervisor,
            state: SessionState::Uninitialized,
            generation: 0,
            connection_id: None,
            opened: HashMap::new(),
            restarts: 0,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn restart_count(&self) -> u64 {
        self.restarts
    }

    /// Documents opened under the current generation
    pub fn opened_documents(&self) -> usize {
        self.opened
            .values()
            .filter(|g| **g == self.generation)
            .count()
    }

    pub fn is_document_open(&self, uri: &str) -> bool {
        self.opened.get(uri) == Some(&self.generation)
    }

    pub fn snapshot(&self, idle: Duration) -> SessionSnapshot {
        SessionSnapshot {
            workspace: self.workspace.root.clone(),
            kind: self.workspace.kind.to_string(),
            generation: self.generation,
            state: self.state.as_str().to_string(),
            idle_secs: idle.as_secs(),
            opened_documents: self.opened_documents(),
        }
    }

    async fn connection(&mut self) -> LensResult<Arc<dyn AnalysisConnection>> {
        if self.state == SessionState::ShutDown {
            return Err(LensError::SessionClosed {
                root: self.workspace.root.clone(),
            });
        }
        self.state = SessionState::Acquiring;
        let conn = match self
            .supervisor
            .acquire(&self.workspace, self.toolchain.as_deref())
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                self.state = SessionState::Uninitialized;
                return Err(e);
            }
        };

        if self.connection_id != Some(conn.id()) {
            self.generation += 1;
            self.opened.clear();
            self.connection_id = Some(conn.id());
            debug!(
                workspace = %self.workspace.root.display(),
                generation = self.generation,
                connection = conn.id(),
                "New sourcekit-lsp connection"
            );
        }
        self.state = SessionState::Ready;
        Ok(conn)
    }

    async fn ensure_open(&mut self, conn: &Arc<dyn AnalysisConnection>, path: &Path) -> LensResult<()> {
        let uri = path_to_uri(path)?;
        if self.is_document_open(&uri) {
            return Ok(());
        }

        let budget = self.config.open_timeout;
        let open = async {
            let text = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| LensError::io(path, e))?;
            conn.notify(
                "textDocument/didOpen",
                json!({
                    "textDocument": {
                        "uri": uri,
                        "languageId": language_id(path),
                        "version": 1,
                        "text": text,
                    }
                }),
            )
            .await
        };
        timeout(budget, open)
            .await
            .map_err(|_| LensError::Timeout {
                operation: "textDocument/didOpen",
                budget,
            })??;

        self.opened.insert(uri, self.generation);
        Ok(())
    }

    async fn attempt(
        &mut self,
        method: &'static str,
        document: Option<&Path>,
        params: &Value,
        budget: Duration,
    ) -> LensResult<Value> {
        let conn = self.connection().await?;
        if let Some(path) = document {
            self.ensure_open(&conn, path).await?;
        }

        self.state = SessionState::InFlight;
        let outcome = timeout(budget, conn.request(method, params.clone()))
            .await
            .map_err(|_| LensError::Timeout {
                operation: method,
                budget,
            })
            .and_then(|r| r);
        self.state = SessionState::Ready;
        outcome
    }

    /// Forget the current connection so the next acquisition starts a new generation.
    async fn discard_connection(&mut self) {
        self.supervisor.force_terminate().await;
        self.connection_id = None;
        self.opened.clear();
    }

    /// Run one logical request with at most one restart.
    pub async fn execute(
        &mut self,
        method: &'static str,
        document: Option<&Path>,
        params: Value,
        budget: Duration,
    ) -> LensResult<Value> {
        let mut restart = RestartBudget::default();
        self.execute_within(&mut restart, method, document, params, budget)
            .await
    }

    /// Run one request against a restart budget shared by every request of
    /// the calling operation.
    async fn execute_within(
        &mut self,
        restart: &mut RestartBudget,
        method: &'static str,
        document: Option<&Path>,
        params: Value,
        budget: Duration,
    ) -> LensResult<Value> {
        loop {
            match self.attempt(method, document, &params, budget).await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient_severe(&e) && self.state != SessionState::ShutDown => {
                    if restart.try_consume() {
                        warn!(
                            workspace = %self.workspace.root.display(),
                            "{} failed ({}), restarting sourcekit-lsp",
                            method,
                            e
                        );
                        self.state = SessionState::Restarting;
                        self.restarts += 1;
                        self.discard_connection().await;
                        continue;
                    }
                    warn!("{} failed again after restart: {}", method, e);
                    self.discard_connection().await;
                    self.state = SessionState::Uninitialized;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn definition(
        &mut self,
        path: &Path,
        line: u32,
        column: u32,
    ) -> LensResult<Vec<SymbolLocation>> {
        let mut restart = RestartBudget::default();
        self.definition_within(&mut restart, path, line, column).await
    }

    async fn definition_within(
        &mut self,
        restart: &mut RestartBudget,
        path: &Path,
        line: u32,
        column: u32,
    ) -> LensResult<Vec<SymbolLocation>> {
        let params = position_params(path, line, column)?;
        let budget = self.config.definition_timeout;
        let value = self
            .execute_within(restart, "textDocument/definition", Some(path), params, budget)
            .await?;
        Ok(parse_definition_response(&value))
    }

    pub async fn hover(&mut self, path: &Path, line: u32, column: u32) -> LensResult<Option<HoverText>> {
        let mut restart = RestartBudget::default();
        self.hover_within(&mut restart, path, line, column).await
    }

    async fn hover_within(
        &mut self,
        restart: &mut RestartBudget,
        path: &Path,
        line: u32,
        column: u32,
    ) -> LensResult<Option<HoverText>> {
        let params = position_params(path, line, column)?;
        let budget = self.config.hover_timeout;
        let value = self
            .execute_within(restart, "textDocument/hover", Some(path), params, budget)
            .await?;
        Ok(parse_hover_response(&value))
    }

    /// `workspace/symbol`, retrying empty answers while the index warms up.
    /// Empty answers do not spend the restart budget, and all attempts share it.
    pub async fn workspace_symbols(&mut self, query: &str) -> LensResult<Vec<SymbolSearchResult>> {
        let (attempts, delay) = self.config.symbol_retry_policy(self.workspace.kind);
        let attempts = attempts.max(1);
        let budget = self.config.workspace_symbol_timeout;
        let mut restart = RestartBudget::default();
        for attempt in 1..=attempts {
            let value = self
                .execute_within(
                    &mut restart,
                    "workspace/symbol",
                    None,
                    json!({ "query": query }),
                    budget,
                )
                .await?;
            let results = parse_workspace_symbols(&value)?;
            if !results.is_empty() {
                debug!(
                    "workspace/symbol '{}' returned {} results on attempt {}",
                    query,
                    results.len(),
                    attempt
                );
                return Ok(results);
            }
            if attempt < attempts {
                debug!(
                    "workspace/symbol '{}' empty (attempt {}/{}), retrying in {}ms",
                    query,
                    attempt,
                    attempts,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
        }
        Ok(Vec::new())
    }

    /// Merge definition and hover at one position into a [`SymbolInfo`].
    pub async fn symbol_info(
        &mut self,
        path: &Path,
        line: u32,
        column: u32,
        context_lines: Option<u32>,
    ) -> LensResult<SymbolInfo> {
        let open_budget = self.config.open_timeout;
        let source = SourceFile::load_within(path, open_budget).await?;
        let mut restart = RestartBudget::default();
        let mut info = SymbolInfo {
            symbol: source.identifier_at(line, column),
            ..Default::default()
        };

        let definitions = self
            .definition_within(&mut restart, path, line, column)
            .await?;
        if let Some(mut definition) = definitions.into_iter().next() {
            let def_path = definition.file_path();
            let def_source = match def_path.as_deref() {
                Some(p) if p == path => Some(source.clone()),
                Some(p) => SourceFile::load_within(p, open_budget).await.ok(),
                None => None,
            };
            if let Some(file) = &def_source {
                info.signature = file.declaration(definition.start_line);
                info.documentation = file.doc_comment_above(definition.start_line);
                if let Some(context) = context_lines {
                    definition.snippet = file.snippet(definition.start_line, context);
                }
            }
            if let Some(def_path) = &def_path {
                info.module = classify_source(def_path, &self.workspace.root)
                    .dependency_name
                    .or_else(|| module_from_path(def_path));
            }
            info.definition = Some(definition);
        }

        if let Some(hover) = self.hover_within(&mut restart, path, line, column).await? {
            info.merge_hover(hover);
        }
        info.kind = info
            .signature
            .as_deref()
            .and_then(declaration_keyword)
            .and_then(kind_from_keyword)
            .map(str::to_string);

        if info.is_empty() {
            return Err(LensError::not_found(format!(
                "no definition or hover at {}:{}:{}",
                path.display(),
                line,
                column
            )));
        }
        Ok(info)
    }

    /// Settle a state left behind by a request that was cancelled mid-flight.
    pub fn settle_interrupted(&mut self) {
        match self.state {
            SessionState::Acquiring | SessionState::InFlight => {
                self.state = if self.connection_id.is_some() {
                    SessionState::Ready
                } else {
                    SessionState::Uninitialized
                };
            }
            SessionState::Restarting => {
                self.connection_id = None;
                self.opened.clear();
                self.state = SessionState::Uninitialized;
            }
            _ => return,
        }
        debug!(
            workspace = %self.workspace.root.display(),
            state = self.state.as_str(),
            "Recovered session from an interrupted request"
        );
    }

    /// Graceful shutdown bounded by the configured budget; kills on failure.
    pub async fn shutdown(&mut self) -> LensResult<()> {
        if self.state == SessionState::ShutDown {
            return Ok(());
        }
        let budget = self.config.shutdown_timeout;
        let outcome = match timeout(budget, self.supervisor.shutdown()).await {
            Ok(result) => result,
            Err(_) => Err(LensError::Timeout {
                operation: "shutdown",
                budget,
            }),
        };
        if let Err(e) = &outcome {
            warn!(
                workspace = %self.workspace.root.display(),
                "Graceful shutdown failed, force terminating: {}", e
            );
            self.supervisor.force_terminate().await;
        }
        self.mark_shut_down();
        info!(workspace = %self.workspace.root.display(), "Session shut down");
        outcome
    }

    pub async fn force_terminate(&mut self) {
        self.supervisor.force_terminate().await;
        self.mark_shut_down();
    }

    fn mark_shut_down(&mut self) {
        self.state = SessionState::ShutDown;
        self.connection_id = None;
        self.opened.clear();
    }
}

fn position_params(path: &Path, line: u32, column: u32) -> LensResult<Value> {
    let position = LspPosition::from_api(line, column)?;
    Ok(json!({
        "textDocument": { "uri": path_to_uri(path)? },
        "position": position.to_json(),
    }))
}

fn language_id(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("swift") | Some("swiftinterface") => "swift",
        Some("m") => "objective-c",
        Some("mm") => "objective-cpp",
        Some("c") | Some("h") => "c",
        Some("cpp") | Some("cc") | Some("cxx") | Some("hpp") => "cpp",
        _ => "plaintext",
    }
}
