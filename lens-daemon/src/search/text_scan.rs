//! Bounded textual fallback: find `class|struct|enum|protocol|actor|typealias <Name>`
//! declarations directly in source files.

use super::dependencies::swift_source_files;
use crate::symbols::{kind_from_keyword, path_to_uri, SymbolLocation, SymbolSearchResult};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MAX_SCANNED_FILES: usize = 5000;
pub const MAX_MATCHES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclarationMatch {
    pub path: PathBuf,
    pub keyword: String,
    /// One-based
    pub line: u32,
    /// One-based column of the name
    pub column: u32,
    pub text: String,
}

impl DeclarationMatch {
    pub fn into_result(self, name: &str, module: Option<String>) -> Option<SymbolSearchResult> {
        let uri = path_to_uri(&self.path).ok()?;
        Some(SymbolSearchResult {
            name: name.to_string(),
            kind: kind_from_keyword(&self.keyword).map(str::to_string),
            module,
            location: Some(SymbolLocation::point(
                uri,
                self.line,
                self.column,
                name.chars().count() as u32,
            )),
            signature: Some(self.text),
            ..Default::default()
        })
    }
}

pub fn declaration_regex(query: &str) -> Option<Regex> {
    Regex::new(&format!(
        r"\b(class|struct|enum|protocol|actor|typealias)\s+({})\b",
        regex::escape(query)
    ))
    .ok()
}

/// Scan `roots` in order until either cap is reached.
pub fn scan_declarations(
    roots: &[PathBuf],
    query: &str,
    max_files: usize,
    max_matches: usize,
) -> Vec<DeclarationMatch> {
    let Some(re) = declaration_regex(query) else {
        return Vec::new();
    };
    let mut matches = Vec::new();
    let mut scanned = 0usize;

    'roots: for root in roots {
        for path in swift_source_files(root) {
            if scanned >= max_files {
                debug!("Text scan stopped after {} files", scanned);
                break 'roots;
            }
            scanned += 1;
            scan_file(&path, &re, &mut matches, max_matches);
            if matches.len() >= max_matches {
                break 'roots;
            }
        }
    }
    matches
}

fn scan_file(path: &Path, re: &Regex, out: &mut Vec<DeclarationMatch>, max_matches: usize) {
    let Ok(text) = std::fs::read_to_string(path) else {
        return;
    };
    for (index, line) in text.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("//") || trimmed.starts_with('*') {
            continue;
        }
        if let Some(caps) = re.captures(line) {
            let (Some(keyword), Some(name)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            out.push(DeclarationMatch {
                path: path.to_path_buf(),
                keyword: keyword.as_str().to_string(),
                line: index as u32 + 1,
                column: line[..name.start()].chars().count() as u32 + 1,
                text: line.trim().trim_end_matches('{').trim_end().to_string(),
            });
            if out.len() >= max_matches {
                return;
            }
        }
    }
}
