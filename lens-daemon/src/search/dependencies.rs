//! Discovery of third-party dependency source trees and the cheap
//! "could this dependency declare the query" filter.

use crate::workspace::Workspace;
use ignore::WalkBuilder;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Files inspected per dependency when checking plausibility
pub const MAX_FILES_PER_DEPENDENCY: usize = 2000;
/// Dependencies searched with a dedicated session
pub const MAX_PLAUSIBLE_DEPENDENCIES: usize = 4;

const CHECKOUT_DIRS: &[&str] = &[".build/checkouts", "SourcePackages/checkouts"];

static LOCAL_PACKAGE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"\.package\s*\(\s*(?:name\s*:\s*"[^"]*"\s*,\s*)?path\s*:\s*"([^"]+)""#).ok());

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub name: String,
    pub root: PathBuf,
}

impl Dependency {
    pub fn new(root: PathBuf) -> Self {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| root.to_string_lossy().to_string());
        Self { name, root }
    }
}

pub trait DependencyLocator: Send + Sync {
    fn dependencies(&self, workspace: &Workspace) -> Vec<Dependency>;
}

/// Lists checkout directories under the workspace plus local path packages.
#[derive(Debug, Default, Clone)]
pub struct CheckoutDirectoryLocator;

impl DependencyLocator for CheckoutDirectoryLocator {
    fn dependencies(&self, workspace: &Workspace) -> Vec<Dependency> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        for dir in CHECKOUT_DIRS {
            let Ok(entries) = std::fs::read_dir(workspace.root.join(dir)) else {
                continue;
            };
            let mut roots: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            roots.sort();
            for root in roots {
                if seen.insert(root.clone()) {
                    found.push(Dependency::new(root));
                }
            }
        }

        for root in local_package_paths(&workspace.root) {
            if seen.insert(root.clone()) {
                found.push(Dependency::new(root));
            }
        }

        debug!(
            "Found {} dependency roots for {}",
            found.len(),
            workspace.root.display()
        );
        found
    }
}

/// `.package(path: "…")` entries of `Package.swift`, resolved against the root.
pub fn local_package_paths(root: &Path) -> Vec<PathBuf> {
    let Ok(manifest) = std::fs::read_to_string(root.join("Package.swift")) else {
        return Vec::new();
    };
    let Some(re) = LOCAL_PACKAGE.as_ref() else {
        return Vec::new();
    };
    re.captures_iter(&manifest)
        .filter_map(|c| c.get(1))
        .map(|m| {
            let path = root.join(m.as_str());
            std::fs::canonicalize(&path).unwrap_or(path)
        })
        .filter(|p| p.is_dir())
        .collect()
}

/// Swift sources under `root`, skipping hidden directories such as `.build`.
pub fn swift_source_files(root: &Path) -> impl Iterator<Item = PathBuf> {
    WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .git_exclude(true)
        .git_global(false)
        .build()
        .flatten()
        .filter(|e| e.file_type().is_some_and(|t| t.is_file()))
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "swift"))
}

fn token_regex(query: &str) -> Option<Regex> {
    Regex::new(&format!(r"\b{}\b", regex::escape(query))).ok()
}

/// A dependency plausibly declares `query` if it has `<Query>.swift`, or a
/// file whose name contains the query and whose text has it as a whole token.
pub fn is_plausible(dependency: &Dependency, query: &str) -> bool {
    let exact_file = format!("{query}.swift");
    let lowered = query.to_lowercase();
    let token = token_regex(query);

    for path in swift_source_files(&dependency.root).take(MAX_FILES_PER_DEPENDENCY) {
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        if file_name == exact_file {
            return true;
        }
        if !file_name.to_lowercase().contains(&lowered) {
            continue;
        }
        if let (Some(re), Ok(text)) = (&token, std::fs::read_to_string(&path)) {
            if re.is_match(&text) {
                return true;
            }
        }
    }
    false
}

pub fn plausible_dependencies(dependencies: &[Dependency], query: &str) -> Vec<Dependency> {
    dependencies
        .iter()
        .filter(|d| is_plausible(d, query))
        .take(MAX_PLAUSIBLE_DEPENDENCIES)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceKind;
    use tempfile::tempdir;

    fn write(path: &Path, text: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    #[test]
    fn test_checkouts_and_local_packages() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join(".build/checkouts/Yams")).unwrap();
        std::fs::create_dir_all(root.join("SourcePackages/checkouts/Tessera")).unwrap();
        std::fs::create_dir_all(root.join("Local/Kit")).unwrap();
        write(
            &root.join("Package.swift"),
            r#"let package = Package(dependencies: [.package(path: "Local/Kit"), .package(url: "x", from: "1.0.0")])"#,
        );

        let ws = Workspace::new(root, WorkspaceKind::Package);
        let names: Vec<String> = CheckoutDirectoryLocator
            .dependencies(&ws)
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, ["Yams", "Tessera", "Kit"]);
    }

    #[test]
    fn test_plausibility_by_file_name_or_token() {
        let dir = tempdir().unwrap();
        let by_name = Dependency::new(dir.path().join("A"));
        write(&by_name.root.join("Sources/A/TesseraPlacement.swift"), "// empty");

        let by_token = Dependency::new(dir.path().join("B"));
        write(
            &by_token.root.join("Sources/B/TesseraPlacementTypes.swift"),
            "public enum TesseraPlacement { case grid }",
        );

        let unrelated = Dependency::new(dir.path().join("C"));
        write(
            &unrelated.root.join("Sources/C/Placement.swift"),
            "struct TesseraPlacementStyle {}",
        );

        assert!(is_plausible(&by_name, "TesseraPlacement"));
        assert!(is_plausible(&by_token, "TesseraPlacement"));
        assert!(!is_plausible(&by_token, "Placement"));
        assert!(!is_plausible(&unrelated, "TesseraPlacement"));

        let all = vec![by_name.clone(), unrelated, by_token];
        let kept = plausible_dependencies(&all, "TesseraPlacement");
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0], by_name);
    }
}
