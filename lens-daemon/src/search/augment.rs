//! Dependency augmentation: when the primary search has no exact type match,
//! look inside dependency checkouts for the declaration.

use super::dependencies::{plausible_dependencies, Dependency, DependencyLocator};
use super::ranking::is_exact_match;
use super::text_scan::{scan_declarations, MAX_MATCHES, MAX_SCANNED_FILES};
use crate::pool::SessionPool;
use crate::symbols::{RankedSymbolSearchResult, SymbolSearchResult};
use crate::workspace::{Workspace, WorkspaceKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Text scan candidates enriched through hover
pub const MAX_ENRICHED_CANDIDATES: usize = 5;

pub fn has_exact_type_match(ranked: &[RankedSymbolSearchResult]) -> bool {
    ranked
        .iter()
        .any(|r| r.is_exact_match && r.result.is_type())
}

pub struct Augmenter {
    locator: Arc<dyn DependencyLocator>,
}

impl Augmenter {
    pub fn new(locator: Arc<dyn DependencyLocator>) -> Self {
        Self { locator }
    }

    /// Extra candidates for `query` from the primary workspace's dependencies.
    ///
    /// Must be called without holding the primary session: dependency
    /// sessions and the primary are locked one at a time.
    pub async fn augment(
        &self,
        pool: &SessionPool,
        primary: &Workspace,
        toolchain: Option<&Path>,
        query: &str,
    ) -> Vec<SymbolSearchResult> {
        let locator = self.locator.clone();
        let workspace = primary.clone();
        let owned_query = query.to_string();
        let discovered = tokio::task::spawn_blocking(move || {
            let all = locator.dependencies(&workspace);
            let plausible = plausible_dependencies(&all, &owned_query);
            (all, plausible)
        })
        .await;
        let (all, plausible) = match discovered {
            Ok(found) => found,
            Err(e) => {
                warn!("Dependency discovery failed: {}", e);
                return Vec::new();
            }
        };
        if all.is_empty() {
            return Vec::new();
        }
        debug!(
            "'{}': {} dependencies, {} plausible",
            query,
            all.len(),
            plausible.len()
        );

        let mut found = Vec::new();
        for dependency in &plausible {
            let results = self.search_dependency(pool, dependency, toolchain, query).await;
            let has_type = results.iter().any(SymbolSearchResult::is_type);
            found.extend(results);
            if has_type {
                return found;
            }
        }

        let mut roots: Vec<PathBuf> = plausible.iter().map(|d| d.root.clone()).collect();
        roots.extend(
            all.iter()
                .filter(|d| !plausible.contains(d))
                .map(|d| d.root.clone()),
        );
        let scan_query = query.to_string();
        let scanned = tokio::task::spawn_blocking(move || {
            scan_declarations(&roots, &scan_query, MAX_SCANNED_FILES, MAX_MATCHES)
        })
        .await
        .unwrap_or_default();

        let mut candidates: Vec<SymbolSearchResult> = scanned
            .into_iter()
            .filter_map(|m| {
                let module = all
                    .iter()
                    .find(|d| m.path.starts_with(&d.root))
                    .map(|d| d.name.clone());
                m.into_result(query, module)
            })
            .collect();
        self.enrich(pool, primary, toolchain, &mut candidates).await;
        found.extend(candidates);
        found
    }

    async fn search_dependency(
        &self,
        pool: &SessionPool,
        dependency: &Dependency,
        toolchain: Option<&Path>,
        query: &str,
    ) -> Vec<SymbolSearchResult> {
        let workspace = Workspace::new(dependency.root.clone(), WorkspaceKind::Package);
        let outcome = match pool.checkout(&workspace, toolchain).await {
            Ok(mut session) => session.workspace_symbols(query).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(results) => results
                .into_iter()
                .filter(|r| is_exact_match(&r.name, query))
                .map(|mut r| {
                    r.module.get_or_insert_with(|| dependency.name.clone());
                    r
                })
                .collect(),
            Err(e) => {
                warn!("Search in dependency {} failed: {}", dependency.name, e);
                Vec::new()
            }
        }
    }

    /// Fill signature/documentation of text-scan hits from hover in the primary session.
    async fn enrich(
        &self,
        pool: &SessionPool,
        primary: &Workspace,
        toolchain: Option<&Path>,
        candidates: &mut [SymbolSearchResult],
    ) {
        if candidates.is_empty() {
            return;
        }
        let mut session = match pool.checkout(primary, toolchain).await {
            Ok(session) => session,
            Err(e) => {
                debug!("Skipping enrichment: {}", e);
                return;
            }
        };
        for candidate in candidates.iter_mut().take(MAX_ENRICHED_CANDIDATES) {
            let Some(location) = candidate.location.clone() else {
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
                        candidate.signature = hover.signature;
                    }
                    candidate.documentation = hover.documentation;
                }
                Ok(None) => {}
                Err(e) => debug!("Hover enrichment for {} failed: {}", candidate.name, e),
            }
        }
    }
}
