//! Scoring, filtering and ordering of raw workspace/symbol candidates.
//!
//! Everything here is pure: the same inputs always produce the same order.

use super::SearchOptions;
use crate::symbols::{
    uri_to_path, RankedSymbolSearchResult, SourceKind, SymbolSearchResult, SymbolSearchSource,
};
use std::collections::HashSet;
use std::path::Path;

const SCORE_FULL_MATCH: i64 = 1000;
const SCORE_LAST_COMPONENT_MATCH: i64 = 950;
const SCORE_PREFIX: i64 = 800;
const SCORE_LAST_COMPONENT_PREFIX: i64 = 750;
const SCORE_CONTAINS: i64 = 600;

const MANGLED_PENALTY: i64 = 400;
const TEST_PATH_PENALTY: i64 = 100;
const PREFERENCE_BONUS: i64 = 50;

const MANGLED_PREFIXES: &[&str] = &["$s", "_$s", "$S", "_$S", "_T0"];
const CHECKOUT_MARKER: &str = "checkouts";
const BUILD_MARKERS: &[&str] = &[".build", "DerivedData", "ModuleCache", "ModuleCache.noindex"];

fn is_marker(component: &str) -> bool {
    component == CHECKOUT_MARKER || BUILD_MARKERS.contains(&component)
}

/// Classify a file by where it lives relative to the workspace root.
pub fn classify_source(path: &Path, root: &Path) -> SymbolSearchSource {
    if let Ok(rest) = path.strip_prefix(root) {
        let first_party = !rest
            .components()
            .any(|c| is_marker(&c.as_os_str().to_string_lossy()));
        if first_party {
            return SymbolSearchSource {
                kind: SourceKind::Project,
                dependency_name: None,
                is_build_cache: false,
            };
        }
    }

    let components: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();

    if let Some(pos) = components.iter().position(|c| c == CHECKOUT_MARKER) {
        if let Some(name) = components.get(pos + 1) {
            return SymbolSearchSource {
                kind: SourceKind::Dependency,
                dependency_name: Some(name.clone()),
                is_build_cache: false,
            };
        }
    }

    if components.iter().any(|c| BUILD_MARKERS.contains(&c.as_str())) {
        return SymbolSearchSource {
            kind: SourceKind::Dependency,
            dependency_name: None,
            is_build_cache: true,
        };
    }

    SymbolSearchSource {
        kind: SourceKind::Other,
        dependency_name: None,
        is_build_cache: false,
    }
}

fn classify_result(result: &SymbolSearchResult, root: &Path) -> SymbolSearchSource {
    match result.file_path() {
        Some(path) => classify_source(&path, root),
        None => SymbolSearchSource {
            kind: SourceKind::Other,
            dependency_name: None,
            is_build_cache: false,
        },
    }
}

fn last_component(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

/// Case-insensitive equality in full or in the last dot-separated component.
pub fn is_exact_match(name: &str, query: &str) -> bool {
    let name = name.to_lowercase();
    let query = query.to_lowercase();
    name == query || last_component(&name) == query
}

pub fn is_mangled(name: &str) -> bool {
    MANGLED_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// `Tests` directory, a directory ending in `Tests`, or a `*Tests.swift` / `*Test.swift` file.
pub fn is_test_path(uri_or_path: &str) -> bool {
    let path = uri_to_path(uri_or_path)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|| uri_or_path.to_string());
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let Some((file, dirs)) = segments.split_last() else {
        return false;
    };
    dirs.iter().any(|d| d.ends_with("Tests"))
        || file.ends_with("Tests.swift")
        || file.ends_with("Test.swift")
}

/// Base score for how well `name` matches `query`, and whether it is exact.
pub fn match_score(name: &str, query: &str) -> (i64, bool) {
    let name = name.to_lowercase();
    let query = query.to_lowercase();
    let last = last_component(&name);

    if name == query {
        (SCORE_FULL_MATCH, true)
    } else if last == query {
        (SCORE_LAST_COMPONENT_MATCH, true)
    } else if name.starts_with(&query) {
        (SCORE_PREFIX, false)
    } else if last.starts_with(&query) {
        (SCORE_LAST_COMPONENT_PREFIX, false)
    } else if name.contains(&query) {
        (SCORE_CONTAINS, false)
    } else {
        (0, false)
    }
}

/// Drop repeated `(name, uri, start line)` triples, keeping the first.
pub fn dedupe(results: Vec<SymbolSearchResult>) -> Vec<SymbolSearchResult> {
    let mut seen: HashSet<(String, Option<String>, Option<u32>)> = HashSet::new();
    results
        .into_iter()
        .filter(|r| {
            seen.insert((
                r.name.clone(),
                r.uri().map(str::to_string),
                r.location.as_ref().map(|l| l.start_line),
            ))
        })
        .collect()
}

/// Deduplicate, classify, filter, score and sort raw candidates.
pub fn rank_results(
    results: Vec<SymbolSearchResult>,
    options: &SearchOptions,
    root: &Path,
) -> Vec<RankedSymbolSearchResult> {
    let mut ranked: Vec<RankedSymbolSearchResult> = dedupe(results)
        .into_iter()
        .filter_map(|result| {
            let source = classify_result(&result, root);
            if !options.scope.admits(source.kind) {
                return None;
            }
            let (mut score, is_exact_match) = match_score(&result.name, &options.query);
            if options.exact && !is_exact_match {
                return None;
            }
            if is_mangled(&result.name) {
                score -= MANGLED_PENALTY;
            }
            if result.uri().is_some_and(is_test_path) {
                score -= TEST_PATH_PENALTY;
            }
            if options.preference.favors(source.kind) {
                score += PREFERENCE_BONUS;
            }
            Some(RankedSymbolSearchResult {
                result,
                source,
                score,
                is_exact_match,
            })
        })
        .collect();

    // Stable sort keeps the original order for full ties
    ranked.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.is_exact_match.cmp(&a.is_exact_match))
    });
    ranked
}
