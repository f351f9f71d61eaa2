//! Symbol search: ranking and source classification, plus dependency augmentation.

pub mod augment;
pub mod dependencies;
pub mod ranking;
pub mod text_scan;

pub use augment::Augmenter;
pub use dependencies::{CheckoutDirectoryLocator, Dependency, DependencyLocator};
pub use ranking::{classify_source, dedupe, rank_results};

use crate::symbols::SourceKind;
use serde::{Deserialize, Serialize};

/// Which provenance a search may return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Project,
    #[serde(alias = "dependency")]
    Package,
    #[default]
    All,
}

impl Scope {
    pub fn admits(&self, kind: SourceKind) -> bool {
        match self {
            Scope::Project => kind == SourceKind::Project,
            Scope::Package => kind == SourceKind::Dependency,
            Scope::All => true,
        }
    }

    pub fn allows_dependencies(&self) -> bool {
        !matches!(self, Scope::Project)
    }
}

impl std::str::FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "project" => Ok(Scope::Project),
            "package" | "dependency" => Ok(Scope::Package),
            "all" => Ok(Scope::All),
            other => Err(format!("unknown scope '{other}'")),
        }
    }
}

/// Which provenance earns a small score bonus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preference {
    #[default]
    None,
    Project,
    #[serde(alias = "package")]
    Dependency,
}

impl Preference {
    pub fn favors(&self, kind: SourceKind) -> bool {
        match self {
            Preference::None => false,
            Preference::Project => kind == SourceKind::Project,
            Preference::Dependency => kind == SourceKind::Dependency,
        }
    }
}

impl std::str::FromStr for Preference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Preference::None),
            "project" => Ok(Preference::Project),
            "dependency" | "package" => Ok(Preference::Dependency),
            other => Err(format!("unknown preference '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub query: String,
    pub limit: usize,
    pub enrich: bool,
    pub scope: Scope,
    pub preference: Preference,
    pub exact: bool,
    pub context_lines: u32,
}

impl SearchOptions {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: 20,
            enrich: false,
            scope: Scope::All,
            preference: Preference::None,
            exact: false,
            context_lines: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_filters() {
        assert!(Scope::Project.admits(SourceKind::Project));
        assert!(!Scope::Project.admits(SourceKind::Dependency));
        assert!(Scope::Package.admits(SourceKind::Dependency));
        assert!(!Scope::Package.admits(SourceKind::Other));
        assert!(Scope::All.admits(SourceKind::Other));
        assert_eq!("dependency".parse::<Scope>(), Ok(Scope::Package));
        assert!(!Scope::Project.allows_dependencies());
    }

    #[test]
    fn test_scope_deserializes_both_spellings() {
        let a: Scope = serde_json::from_str("\"dependency\"").unwrap();
        let b: Scope = serde_json::from_str("\"package\"").unwrap();
        assert_eq!(a, b);
    }
}
