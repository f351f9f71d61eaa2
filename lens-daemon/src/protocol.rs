//! Daemon wire protocol: length-prefixed JSON envelopes over the Unix socket.

use crate::search::{Preference, Scope};
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

/// Maximum frame body accepted in either direction (10MB)
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl DaemonRequest {
    pub fn new(id: u64, method: DaemonMethod, params: impl Serialize) -> Result<Self> {
        Ok(Self {
            id: Value::from(id),
            method: method.as_str().to_string(),
            params: serde_json::to_value(params)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl DaemonResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }

    /// Unwrap the envelope into its result, turning an error body into `Err`.
    pub fn into_result(self) -> std::result::Result<Value, ErrorBody> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonMethod {
    Ping,
    Status,
    SymbolInfo,
    SearchSymbols,
    Logs,
    Shutdown,
}

impl DaemonMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonMethod::Ping => "ping",
            DaemonMethod::Status => "status",
            DaemonMethod::SymbolInfo => "symbolInfo",
            DaemonMethod::SearchSymbols => "searchSymbols",
            DaemonMethod::Logs => "logs",
            DaemonMethod::Shutdown => "shutdown",
        }
    }
}

impl FromStr for DaemonMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ping" => Ok(DaemonMethod::Ping),
            "status" => Ok(DaemonMethod::Status),
            "symbolInfo" => Ok(DaemonMethod::SymbolInfo),
            "searchSymbols" => Ok(DaemonMethod::SearchSymbols),
            "logs" => Ok(DaemonMethod::Logs),
            "shutdown" => Ok(DaemonMethod::Shutdown),
            other => Err(format!("Unknown method: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfoParams {
    pub workspace_root_path: PathBuf,
    pub file_path: PathBuf,
    pub line: u32,
    pub column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_lines: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolchain: Option<PathBuf>,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSymbolsParams {
    pub workspace_root_path: PathBuf,
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub enrich: bool,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub preference: Preference,
    #[serde(default)]
    pub exact: bool,
    #[serde(default)]
    pub context_lines: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolchain: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogsParams {
    #[serde(default)]
    pub lines: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResult {
    pub version: String,
    pub git_hash: String,
    pub build_date: String,
    pub pid: u32,
}

/// One pool entry as reported by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub workspace: PathBuf,
    pub kind: String,
    pub generation: u64,
    pub state: String,
    pub idle_secs: u64,
    pub opened_documents: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResult {
    pub version: String,
    pub pid: u32,
    pub uptime_secs: u64,
    pub request_count: u64,
    pub active_connections: usize,
    pub sessions: Vec<SessionSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub sequence: u64,
    pub timestamp: String,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

pub struct MessageCodec;

impl MessageCodec {
    pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(msg)?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(anyhow::anyhow!(
                "Message size {} exceeds maximum allowed size of {} bytes",
                bytes.len(),
                MAX_MESSAGE_SIZE
            ));
        }
        Ok(bytes)
    }

    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Read one frame: a 4-byte big-endian length followed by the body.
    pub async fn read_framed<R>(reader: &mut R, read_timeout: Duration) -> Result<Vec<u8>>
    where
        R: AsyncReadExt + Unpin,
    {
        let mut length_buf = [0u8; 4];
        timeout(read_timeout, reader.read_exact(&mut length_buf))
            .await
            .map_err(|_| anyhow::anyhow!("Timeout reading message length"))?
            .map_err(|e| anyhow::anyhow!("Failed to read message length: {}", e))?;

        let message_len = u32::from_be_bytes(length_buf) as usize;
        if message_len > MAX_MESSAGE_SIZE {
            return Err(anyhow::anyhow!(
                "Message size {} exceeds maximum allowed size of {} bytes",
                message_len,
                MAX_MESSAGE_SIZE
            ));
        }

        let mut message_buf = vec![0u8; message_len];
        timeout(read_timeout, reader.read_exact(&mut message_buf))
            .await
            .map_err(|_| anyhow::anyhow!("Timeout reading message body"))?
            .map_err(|e| anyhow::anyhow!("Failed to read message body: {}", e))?;

        Ok(message_buf)
    }

    pub async fn write_framed<W>(writer: &mut W, data: &[u8], write_timeout: Duration) -> Result<()>
    where
        W: AsyncWriteExt + Unpin,
    {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(anyhow::anyhow!(
                "Message size {} exceeds maximum allowed size of {} bytes",
                data.len(),
                MAX_MESSAGE_SIZE
            ));
        }

        let mut frame = Vec::with_capacity(4 + data.len());
        frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
        frame.extend_from_slice(data);

        timeout(write_timeout, writer.write_all(&frame))
            .await
            .map_err(|_| anyhow::anyhow!("Timeout writing message"))?
            .map_err(|e| anyhow::anyhow!("Failed to write message: {}", e))?;
        timeout(write_timeout, writer.flush())
            .await
            .map_err(|_| anyhow::anyhow!("Timeout flushing message"))?
            .map_err(|e| anyhow::anyhow!("Failed to flush message: {}", e))?;

        Ok(())
    }
}
