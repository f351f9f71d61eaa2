//! The two exposed queries, shared by the daemon and the in-process CLI path.

use crate::config::LensConfig;
use crate::error::{LensError, LensResult};
use crate::pool::SessionPool;
use crate::protocol::{SearchSymbolsParams, SymbolInfoParams};
use crate::search::augment::has_exact_type_match;
use crate::search::{
    rank_results, Augmenter, CheckoutDirectoryLocator, DependencyLocator, SearchOptions,
};
use crate::snippet::SourceFile;
use crate::supervisor::{SourceKitSupervisorFactory, SupervisorFactory};
use crate::symbols::{RankedSymbolSearchResult, SymbolInfo};
use crate::workspace::{MarkerLocator, Workspace, WorkspaceLocator};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct QueryEngine {
    pool: Arc<SessionPool>,
    locator: Arc<dyn WorkspaceLocator>,
    augmenter: Augmenter,
}

impl QueryEngine {
    pub fn new(
        pool: Arc<SessionPool>,
        locator: Arc<dyn WorkspaceLocator>,
        dependencies: Arc<dyn DependencyLocator>,
    ) -> Self {
        Self {
            pool,
            locator,
            augmenter: Augmenter::new(dependencies),
        }
    }

    /// sourcekit-lsp sessions, marker-based workspace detection, checkout directories.
    pub fn from_config(config: &LensConfig) -> Self {
        Self::with_factory(config, Arc::new(SourceKitSupervisorFactory))
    }

    pub fn with_factory(config: &LensConfig, factory: Arc<dyn SupervisorFactory>) -> Self {
        let pool = Arc::new(SessionPool::new(
            config.pool.clone(),
            config.session.clone(),
            factory,
        ));
        Self::new(
            pool,
            Arc::new(MarkerLocator),
            Arc::new(CheckoutDirectoryLocator),
        )
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    fn locate(&self, root: &Path, kind: Option<&str>) -> LensResult<Workspace> {
        self.locator.locate(root, kind)
    }

    pub async fn symbol_info(&self, params: &SymbolInfoParams) -> LensResult<SymbolInfo> {
        let workspace = self.locate(&params.workspace_root_path, params.workspace_kind.as_deref())?;
        let file = resolve_file(&workspace, &params.file_path).await;
        debug!(
            "symbolInfo {}:{}:{} in {}",
            file.display(),
            params.line,
            params.column,
            workspace
        );

        let mut session = self
            .pool
            .checkout(&workspace, params.toolchain.as_deref())
            .await?;
        session
            .symbol_info(&file, params.line, params.column, params.context_lines)
            .await
    }

    pub async fn search_symbols(
        &self,
        params: &SearchSymbolsParams,
    ) -> LensResult<Vec<RankedSymbolSearchResult>> {
        let query = params.query.trim();
        if query.is_empty() {
            return Err(LensError::invalid("query must not be empty"));
        }
        let options = SearchOptions {
            query: query.to_string(),
            limit: params.limit,
            enrich: params.enrich,
            scope: params.scope,
            preference: params.preference,
            exact: params.exact,
            context_lines: params.context_lines,
        };
        let workspace = self.locate(&params.workspace_root_path, params.workspace_kind.as_deref())?;
        let toolchain = params.toolchain.as_deref();

        let raw = {
            let mut session = self.pool.checkout(&workspace, toolchain).await?;
            session.workspace_symbols(&options.query).await?
        };
        let mut ranked = rank_results(raw.clone(), &options, &workspace.root);

        if options.scope.allows_dependencies() && !has_exact_type_match(&ranked) {
            let extra = self
                .augmenter
                .augment(&self.pool, &workspace, toolchain, &options.query)
                .await;
            if !extra.is_empty() {
                info!(
                    "'{}': {} candidates from dependencies",
                    options.query,
                    extra.len()
                );
                let mut merged = raw;
                merged.extend(extra);
                ranked = rank_results(merged, &options, &workspace.root);
            }
        }

        if options.limit > 0 {
            ranked.truncate(options.limit);
        }
        if ranked.is_empty() {
            return Err(LensError::not_found(format!(
                "no symbols matching '{}' in {}",
                options.query,
                workspace.root.display()
            )));
        }

        if options.enrich {
            self.enrich(&workspace, toolchain, &mut ranked).await;
        }
        if options.context_lines > 0 {
            let budget = self.pool.session_config().open_timeout;
            attach_snippets(&mut ranked, options.context_lines, budget).await;
        }
        Ok(ranked)
    }

    async fn enrich(
        &self,
        workspace: &Workspace,
        toolchain: Option<&Path>,
        ranked: &mut [RankedSymbolSearchResult],
    ) {
        let mut session = match self.pool.checkout(workspace, toolchain).await {
            Ok(session) => session,
            Err(e) => {
                debug!("Skipping enrichment: {}", e);
                return;
            }
        };
        for entry in ranked.iter_mut() {
            let Some(location) = entry.result.location.clone() else {
                continue;
            };
            let Some(path) = location.file_path() else {
                continue;
            };
            match session
                .hover(&path, location.start_line, location.start_column)
                .await
            {
                Ok(Some(hover)) => {
                    if hover.signature.is_some() {
                        entry.result.signature = hover.signature;
                    }
                    if hover.documentation.is_some() {
                        entry.result.documentation = hover.documentation;
                    }
                }
                Ok(None) => {}
                Err(e) => debug!("Hover for {} failed: {}", entry.result.name, e),
            }
        }
    }
}

async fn resolve_file(workspace: &Workspace, file: &Path) -> PathBuf {
    let joined = if file.is_absolute() {
        file.to_path_buf()
    } else {
        workspace.root.join(file)
    };
    tokio::fs::canonicalize(&joined).await.unwrap_or(joined)
}

/// Snippets are best effort: a file that cannot be read within `budget`
/// leaves its results without one.
async fn attach_snippets(ranked: &mut [RankedSymbolSearchResult], context: u32, budget: Duration) {
    let mut files: HashMap<PathBuf, Option<SourceFile>> = HashMap::new();
    for entry in ranked.iter_mut() {
        let Some(location) = entry.result.location.as_mut() else {
            continue;
        };
        let Some(path) = location.file_path() else {
            continue;
        };
        if !files.contains_key(&path) {
            let loaded = match SourceFile::load_within(&path, budget).await {
                Ok(file) => Some(file),
                Err(e) => {
                    debug!("No snippet for {}: {}", path.display(), e);
                    None
                }
            };
            files.insert(path.clone(), loaded);
        }
        if let Some(Some(file)) = files.get(&path) {
            location.snippet = file.snippet(location.start_line, context);
        }
    }
}
