//! Symbol data model and conversion from sourcekit-lsp responses.
//!
//! Lines and columns are one-based everywhere in this crate. The only place
//! zero-based LSP positions exist is the boundary handled here:
//! `external = api - 1` on the way out and `api = external + 1` on the way in.

use crate::error::{LensError, LensResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use url::Url;

/// A zero-based position as sent to sourcekit-lsp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LspPosition {
    pub line: u32,
    pub character: u32,
}

impl LspPosition {
    /// Convert a one-based API position into the external zero-based form.
    pub fn from_api(line: u32, column: u32) -> LensResult<Self> {
        if line == 0 || column == 0 {
            return Err(LensError::invalid(format!(
                "line and column are one-based, got {line}:{column}"
            )));
        }
        Ok(Self {
            line: line - 1,
            character: column - 1,
        })
    }

    pub fn to_json(self) -> Value {
        json!({ "line": self.line, "character": self.character })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolLocation {
    pub uri: String,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

impl SymbolLocation {
    /// Build from an LSP `uri` plus a zero-based `range` object.
    pub fn from_lsp_range(uri: &str, range: &Value) -> Option<Self> {
        let pos = |key: &str| -> Option<(u32, u32)> {
            let p = range.get(key)?;
            let one_based = |key: &str| -> Option<u32> {
                u32::try_from(p.get(key)?.as_u64()?).ok()?.checked_add(1)
            };
            Some((one_based("line")?, one_based("character")?))
        };
        let (start_line, start_column) = pos("start")?;
        let (end_line, end_column) = pos("end").unwrap_or((start_line, start_column));
        Some(Self {
            uri: uri.to_string(),
            start_line,
            start_column,
            end_line,
            end_column,
            snippet: None,
        })
    }

    /// A single-point location, used by the text scan
    pub fn point(uri: String, line: u32, column: u32, len: u32) -> Self {
        Self {
            uri,
            start_line: line,
            start_column: column,
            end_line: line,
            end_column: column.saturating_add(len),
            snippet: None,
        }
    }

    pub fn file_path(&self) -> Option<PathBuf> {
        uri_to_path(&self.uri)
    }
}

pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    Url::parse(uri).ok()?.to_file_path().ok()
}

pub fn path_to_uri(path: &std::path::Path) -> LensResult<String> {
    Url::from_file_path(path)
        .map(|u| u.to_string())
        .map_err(|_| LensError::invalid(format!("not an absolute file path: {}", path.display())))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<SymbolLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
}

impl SymbolInfo {
    /// Merge hover text over definition-derived fields; hover wins when present.
    pub fn merge_hover(&mut self, hover: HoverText) {
        if hover.signature.is_some() {
            self.signature = hover.signature;
        }
        if hover.documentation.is_some() {
            self.documentation = hover.documentation;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.definition.is_none() && self.signature.is_none() && self.documentation.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolSearchResult {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SymbolLocation>,
    #[serde(default, rename = "documentURI", skip_serializing_if = "Option::is_none")]
    pub document_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
}

impl SymbolSearchResult {
    /// URI of the result, from the location or the bare document URI
    pub fn uri(&self) -> Option<&str> {
        self.location
            .as_ref()
            .map(|l| l.uri.as_str())
            .or(self.document_uri.as_deref())
    }

    pub fn file_path(&self) -> Option<PathBuf> {
        self.uri().and_then(uri_to_path)
    }

    pub fn is_type(&self) -> bool {
        self.kind.as_deref().is_some_and(is_type_kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Project,
    Dependency,
    Other,
}

/// Provenance of a search result relative to the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolSearchSource {
    pub kind: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_name: Option<String>,
    pub is_build_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedSymbolSearchResult {
    pub result: SymbolSearchResult,
    pub source: SymbolSearchSource,
    pub score: i64,
    pub is_exact_match: bool,
}

/// Hover content split into the declaration and its prose.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HoverText {
    pub signature: Option<String>,
    pub documentation: Option<String>,
}

/// Lowercase LSP `SymbolKind` name
pub fn symbol_kind_name(kind: u64) -> &'static str {
    match kind {
        1 => "file",
        2 => "module",
        3 => "namespace",
        4 => "package",
        5 => "class",
        6 => "method",
        7 => "property",
        8 => "field",
        9 => "constructor",
        10 => "enum",
        11 => "interface",
        12 => "function",
        13 => "variable",
        14 => "constant",
        15 => "string",
        16 => "number",
        17 => "boolean",
        18 => "array",
        19 => "object",
        20 => "key",
        21 => "null",
        22 => "enumMember",
        23 => "struct",
        24 => "event",
        25 => "operator",
        26 => "typeParameter",
        _ => "unknown",
    }
}

/// Class, struct, enum and protocol (reported as `interface`) declarations
pub fn is_type_kind(kind: &str) -> bool {
    matches!(kind, "class" | "struct" | "enum" | "interface")
}

/// Map a Swift declaration keyword onto the LSP kind vocabulary.
pub fn kind_from_keyword(keyword: &str) -> Option<&'static str> {
    Some(match keyword {
        "class" | "actor" => "class",
        "struct" => "struct",
        "enum" => "enum",
        "protocol" => "interface",
        "typealias" | "associatedtype" => "typeParameter",
        "func" => "function",
        "init" => "constructor",
        "var" => "variable",
        "let" => "constant",
        "case" => "enumMember",
        "extension" => "namespace",
        "subscript" => "method",
        _ => return None,
    })
}

/// Parse `textDocument/definition`: `null`, a `Location`, or an array of
/// `Location`/`LocationLink`.
pub fn parse_definition_response(value: &Value) -> Vec<SymbolLocation> {
    fn one(item: &Value) -> Option<SymbolLocation> {
        if let Some(uri) = item.get("targetUri").and_then(|u| u.as_str()) {
            let range = item
                .get("targetSelectionRange")
                .or_else(|| item.get("targetRange"))?;
            return SymbolLocation::from_lsp_range(uri, range);
        }
        let uri = item.get("uri")?.as_str()?;
        SymbolLocation::from_lsp_range(uri, item.get("range")?)
    }

    match value {
        Value::Array(items) => items.iter().filter_map(one).collect(),
        Value::Object(_) => one(value).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// Parse `textDocument/hover`. Returns `None` for `null` or empty contents.
pub fn parse_hover_response(value: &Value) -> Option<HoverText> {
    let contents = value.get("contents")?;
    let text = hover_contents_to_markdown(contents);
    if text.trim().is_empty() {
        return None;
    }
    Some(split_hover_markdown(&text))
}

fn hover_contents_to_markdown(contents: &Value) -> String {
    match contents {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(hover_contents_to_markdown)
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
        Value::Object(obj) => {
            let value = obj.get("value").and_then(|v| v.as_str()).unwrap_or("");
            match obj.get("language").and_then(|l| l.as_str()) {
                // MarkedString with a language is a code block
                Some(lang) => format!("```{lang}\n{value}\n```"),
                None => value.to_string(),
            }
        }
        _ => String::new(),
    }
}

/// Split hover markdown: the first fenced block is the signature, the rest is
/// documentation (horizontal rules dropped).
pub fn split_hover_markdown(text: &str) -> HoverText {
    let mut signature_lines: Vec<&str> = Vec::new();
    let mut doc_lines: Vec<&str> = Vec::new();
    let mut in_fence = false;
    let mut seen_fence = false;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            if in_fence {
                in_fence = false;
                seen_fence = true;
            } else if !seen_fence {
                in_fence = true;
            } else {
                doc_lines.push(line);
            }
            continue;
        }
        if in_fence {
            signature_lines.push(line);
        } else if trimmed != "---" && trimmed != "***" {
            doc_lines.push(line);
        }
    }

    let signature = signature_lines.join("\n").trim().to_string();
    let documentation = doc_lines.join("\n").trim().to_string();
    HoverText {
        signature: (!signature.is_empty()).then_some(signature),
        documentation: (!documentation.is_empty()).then_some(documentation),
    }
}

/// Parse `workspace/symbol`: `SymbolInformation[]` or `WorkspaceSymbol[]`.
pub fn parse_workspace_symbols(value: &Value) -> LensResult<Vec<SymbolSearchResult>> {
    let items = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        other => {
            return Err(LensError::protocol(format!(
                "workspace/symbol returned {}",
                short_json(other)
            )))
        }
    };

    Ok(items
        .iter()
        .filter_map(|item| {
            let name = item.get("name")?.as_str()?.to_string();
            let kind = item
                .get("kind")
                .and_then(|k| k.as_u64())
                .map(|k| symbol_kind_name(k).to_string());
            let container_name = item
                .get("containerName")
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .map(str::to_string);

            let location_value = item.get("location");
            let uri = location_value
                .and_then(|l| l.get("uri"))
                .and_then(|u| u.as_str());
            let location = match (uri, location_value.and_then(|l| l.get("range"))) {
                (Some(uri), Some(range)) => SymbolLocation::from_lsp_range(uri, range),
                _ => None,
            };
            let document_uri = match &location {
                Some(_) => None,
                None => uri.map(str::to_string),
            };

            Some(SymbolSearchResult {
                name,
                kind,
                container_name,
                location,
                document_uri,
                ..Default::default()
            })
        })
        .collect())
}

fn short_json(value: &Value) -> String {
    let s = value.to_string();
    if s.len() > 120 {
        format!("{}...", &s[..s.char_indices().nth(117).map_or(s.len(), |(i, _)| i)])
    } else {
        s
    }
}
