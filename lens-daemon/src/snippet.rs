//! Source text helpers: context snippets, declaration lines and doc comments.
//! All line and column arguments are one-based.

use crate::error::{LensError, LensResult};
use std::path::Path;
use std::time::Duration;

const MODIFIERS: &[&str] = &[
    "public",
    "private",
    "fileprivate",
    "internal",
    "package",
    "open",
    "final",
    "static",
    "override",
    "mutating",
    "nonmutating",
    "indirect",
    "nonisolated",
    "convenience",
    "required",
    "lazy",
    "weak",
    "unowned",
    "dynamic",
    "optional",
];

#[derive(Debug, Clone)]
pub struct SourceFile {
    lines: Vec<String>,
}

impl SourceFile {
    pub fn from_text(text: &str) -> Self {
        Self {
            lines: text.lines().map(str::to_string).collect(),
        }
    }

    pub async fn load(path: &Path) -> LensResult<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| LensError::io(path, e))?;
        Ok(Self::from_text(&text))
    }

    /// [`SourceFile::load`] bounded by `budget`.
    pub async fn load_within(path: &Path, budget: Duration) -> LensResult<Self> {
        tokio::time::timeout(budget, Self::load(path))
            .await
            .map_err(|_| LensError::Timeout {
                operation: "read source",
                budget,
            })?
    }

    pub fn line(&self, line: u32) -> Option<&str> {
        let index = (line as usize).checked_sub(1)?;
        self.lines.get(index).map(String::as_str)
    }

    /// `context` lines on each side of `line`, clamped to the file.
    pub fn snippet(&self, line: u32, context: u32) -> Option<String> {
        let index = (line as usize).checked_sub(1)?;
        if index >= self.lines.len() {
            return None;
        }
        let start = index.saturating_sub(context as usize);
        let end = (index + context as usize + 1).min(self.lines.len());
        Some(self.lines[start..end].join("\n"))
    }

    /// Trimmed declaration line at `line`.
    pub fn declaration(&self, line: u32) -> Option<String> {
        let text = self.line(line)?.trim();
        let text = text.strip_suffix('{').unwrap_or(text).trim_end();
        (!text.is_empty()).then(|| text.to_string())
    }

    /// The `///` run or `/** */` block directly above `line`, skipping
    /// attribute lines such as `@MainActor`.
    pub fn doc_comment_above(&self, line: u32) -> Option<String> {
        let mut index = (line as usize).checked_sub(1)?;
        if index >= self.lines.len() {
            return None;
        }
        while index > 0 && self.lines[index - 1].trim_start().starts_with('@') {
            index -= 1;
        }

        let mut collected: Vec<String> = Vec::new();
        if index > 0 && self.lines[index - 1].trim_end().ends_with("*/") {
            let mut cursor = index;
            while cursor > 0 {
                cursor -= 1;
                let raw = self.lines[cursor].trim();
                let opens = raw.starts_with("/**");
                let body = raw
                    .trim_start_matches("/**")
                    .trim_end_matches("*/")
                    .trim_start_matches('*')
                    .trim();
                collected.push(body.to_string());
                if opens {
                    break;
                }
                if cursor == 0 || raw.starts_with("/*") {
                    return None;
                }
            }
        } else {
            while index > 0 {
                let raw = self.lines[index - 1].trim_start();
                match raw.strip_prefix("///") {
                    Some(body) => collected.push(body.strip_prefix(' ').unwrap_or(body).to_string()),
                    None => break,
                }
                index -= 1;
            }
        }

        collected.reverse();
        let doc = collected.join("\n").trim().to_string();
        (!doc.is_empty()).then_some(doc)
    }

    /// The identifier touching `column` on `line`.
    pub fn identifier_at(&self, line: u32, column: u32) -> Option<String> {
        identifier_at(self.line(line)?, column)
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

pub fn identifier_at(text: &str, column: u32) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut index = (column as usize).checked_sub(1)?;
    if index >= chars.len() {
        return None;
    }
    // Cursor just past the end of a name still selects it
    if !is_ident_char(chars[index]) {
        if index > 0 && is_ident_char(chars[index - 1]) {
            index -= 1;
        } else {
            return None;
        }
    }
    let mut start = index;
    while start > 0 && is_ident_char(chars[start - 1]) {
        start -= 1;
    }
    let mut end = index + 1;
    while end < chars.len() && is_ident_char(chars[end]) {
        end += 1;
    }
    Some(chars[start..end].iter().collect())
}

/// First declaration keyword of a Swift declaration, ignoring modifiers and attributes.
pub fn declaration_keyword(signature: &str) -> Option<&str> {
    for token in signature.split_whitespace() {
        if token.starts_with('@') || MODIFIERS.contains(&token) {
            continue;
        }
        // Access modifiers with a setter qualifier, e.g. `private(set)`
        if token.contains('(') && MODIFIERS.iter().any(|m| token.starts_with(m)) {
            continue;
        }
        let keyword = token.split(['(', '<', ':']).next().unwrap_or(token);
        return crate::symbols::kind_from_keyword(keyword).map(|_| keyword);
    }
    None
}

/// Module name from a `Sources/<Module>/…` layout.
pub fn module_from_path(path: &Path) -> Option<String> {
    let mut components = path.components().map(|c| c.as_os_str().to_string_lossy());
    while let Some(component) = components.next() {
        if component == "Sources" {
            let module = components.next()?;
            // A file directly under Sources/ has no module directory
            components.next()?;
            return Some(module.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "import Foundation\n\n/// Where a tile goes.\n/// Second line.\n@frozen\npublic enum TesseraPlacement {\n    case grid\n}\n\n/**\n * Block docs.\n */\nstruct Other {}\n";

    #[test]
    fn test_snippet_clamps() {
        let file = SourceFile::from_text(SOURCE);
        assert_eq!(file.snippet(1, 1).unwrap(), "import Foundation\n");
        assert_eq!(file.snippet(7, 1).unwrap(), "public enum TesseraPlacement {\n    case grid\n}");
        assert!(file.snippet(0, 2).is_none());
        assert!(file.snippet(99, 2).is_none());
    }

    #[test]
    fn test_declaration_and_doc_comments() {
        let file = SourceFile::from_text(SOURCE);
        assert_eq!(file.declaration(6).unwrap(), "public enum TesseraPlacement");
        assert_eq!(
            file.doc_comment_above(6).unwrap(),
            "Where a tile goes.\nSecond line."
        );
        assert_eq!(file.doc_comment_above(13).unwrap(), "Block docs.");
        assert!(file.doc_comment_above(7).is_none());
    }

    #[test]
    fn test_identifier_at_column() {
        assert_eq!(identifier_at("let p = TesseraPlacement.grid", 9).as_deref(), Some("TesseraPlacement"));
        assert_eq!(identifier_at("let p = TesseraPlacement.grid", 25).as_deref(), Some("TesseraPlacement"));
        assert_eq!(identifier_at("a + b", 3), None);
        assert_eq!(identifier_at("abc", 10), None);
    }

    #[test]
    fn test_declaration_keyword_skips_modifiers() {
        assert_eq!(declaration_keyword("public final class App"), Some("class"));
        assert_eq!(declaration_keyword("@MainActor private(set) var x: Int"), Some("var"));
        assert_eq!(declaration_keyword("init(frame: CGRect)"), Some("init"));
        assert_eq!(declaration_keyword("return x"), None);
    }

    #[tokio::test]
    async fn test_load_within_reads_and_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Tile.swift");
        std::fs::write(&path, SOURCE).unwrap();

        let file = SourceFile::load_within(&path, Duration::from_secs(2)).await.unwrap();
        assert_eq!(file.line(6), Some("public enum TesseraPlacement {"));

        let missing = dir.path().join("Gone.swift");
        let err = SourceFile::load_within(&missing, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, LensError::Io { .. }), "{err:?}");
    }

    #[test]
    fn test_module_from_sources_layout() {
        assert_eq!(
            module_from_path(Path::new("/w/Sources/Tessera/TesseraPlacement.swift")).as_deref(),
            Some("Tessera")
        );
        assert_eq!(module_from_path(Path::new("/w/Sources/main.swift")), None);
        assert_eq!(module_from_path(Path::new("/w/App/App.swift")), None);
    }
}
