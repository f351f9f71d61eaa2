//! Workspace identity and the marker-based locator.
//!
//! The locator only inspects the root it is given; walking up the directory
//! tree to find a root is the caller's job.

use crate::error::{LensError, LensResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkspaceKind {
    /// SwiftPM package (`Package.swift`)
    Package,
    /// `.xcodeproj`
    IdeProject,
    /// `.xcworkspace`
    IdeWorkspace,
}

impl WorkspaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceKind::Package => "package",
            WorkspaceKind::IdeProject => "ide-project",
            WorkspaceKind::IdeWorkspace => "ide-workspace",
        }
    }
}

impl fmt::Display for WorkspaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkspaceKind {
    type Err = LensError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "package" | "swiftpm" => Ok(WorkspaceKind::Package),
            "ide-project" | "xcodeproj" | "project" => Ok(WorkspaceKind::IdeProject),
            "ide-workspace" | "xcworkspace" => Ok(WorkspaceKind::IdeWorkspace),
            other => Err(LensError::UnsupportedWorkspaceKind {
                kind: other.to_string(),
            }),
        }
    }
}

/// A resolved workspace. Identity is `(root, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Workspace {
    pub root: PathBuf,
    pub kind: WorkspaceKind,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, kind: WorkspaceKind) -> Self {
        Self {
            root: root.into(),
            kind,
        }
    }

    /// `buildServer.json` at the root switches sourcekit-lsp into build-server mode
    pub fn build_server_descriptor(&self) -> Option<PathBuf> {
        let path = self.root.join("buildServer.json");
        path.is_file().then_some(path)
    }

    pub fn name(&self) -> &str {
        self.root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("workspace")
    }
}

impl fmt::Display for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.root.display(), self.kind)
    }
}

/// Resolves a workspace root path into a [`Workspace`].
pub trait WorkspaceLocator: Send + Sync {
    fn locate(&self, root: &Path, kind_hint: Option<&str>) -> LensResult<Workspace>;
}

/// Detects the workspace kind from marker files directly inside the root.
#[derive(Debug, Default, Clone)]
pub struct MarkerLocator;

impl MarkerLocator {
    fn absolute(root: &Path) -> LensResult<PathBuf> {
        let abs = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| LensError::io(root, e))?
                .join(root)
        };
        Ok(std::fs::canonicalize(&abs).unwrap_or(abs))
    }

    fn detect_kind(root: &Path) -> Option<WorkspaceKind> {
        if root.join("Package.swift").is_file() {
            return Some(WorkspaceKind::Package);
        }
        let entries = std::fs::read_dir(root).ok()?;
        let mut project = false;
        for entry in entries.flatten() {
            match entry.path().extension().and_then(|e| e.to_str()) {
                Some("xcworkspace") => return Some(WorkspaceKind::IdeWorkspace),
                Some("xcodeproj") => project = true,
                _ => {}
            }
        }
        project.then_some(WorkspaceKind::IdeProject)
    }
}

impl WorkspaceLocator for MarkerLocator {
    fn locate(&self, root: &Path, kind_hint: Option<&str>) -> LensResult<Workspace> {
        let root = Self::absolute(root)?;
        if !root.is_dir() {
            return Err(LensError::WorkspaceNotFound { path: root });
        }
        let kind = match kind_hint {
            Some(hint) => hint.parse()?,
            None => Self::detect_kind(&root).ok_or_else(|| LensError::WorkspaceNotFound {
                path: root.clone(),
            })?,
        };
        Ok(Workspace::new(root, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_detects_package() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Package.swift"), "// swift-tools-version:5.9").unwrap();
        let ws = MarkerLocator.locate(dir.path(), None).unwrap();
        assert_eq!(ws.kind, WorkspaceKind::Package);
        assert!(ws.root.is_absolute());
    }

    #[test]
    fn test_workspace_beats_project() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("App.xcodeproj")).unwrap();
        std::fs::create_dir(dir.path().join("App.xcworkspace")).unwrap();
        let ws = MarkerLocator.locate(dir.path(), None).unwrap();
        assert_eq!(ws.kind, WorkspaceKind::IdeWorkspace);
    }

    #[test]
    fn test_missing_markers_is_not_found() {
        let dir = tempdir().unwrap();
        let err = MarkerLocator.locate(dir.path(), None).unwrap_err();
        assert!(matches!(err, LensError::WorkspaceNotFound { .. }));
    }

    #[test]
    fn test_kind_hint_overrides_and_validates() {
        let dir = tempdir().unwrap();
        let ws = MarkerLocator.locate(dir.path(), Some("xcodeproj")).unwrap();
        assert_eq!(ws.kind, WorkspaceKind::IdeProject);

        let err = MarkerLocator.locate(dir.path(), Some("gradle")).unwrap_err();
        assert!(matches!(err, LensError::UnsupportedWorkspaceKind { .. }));
    }

    #[test]
    fn test_build_server_descriptor() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path(), WorkspaceKind::IdeProject);
        assert!(ws.build_server_descriptor().is_none());
        std::fs::write(dir.path().join("buildServer.json"), "{}").unwrap();
        assert!(ws.build_server_descriptor().is_some());
    }
}
