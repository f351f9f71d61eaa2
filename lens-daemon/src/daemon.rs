//! Socket server: accepts clients, frames requests and dispatches them to the
//! [`QueryEngine`] in their own tasks.

use crate::config::{DaemonConfig, LensConfig};
use crate::engine::QueryEngine;
use crate::error::LensError;
use crate::ipc::{IpcListener, IpcStream, OwnedWriteHalf};
use crate::logging::LogBuffer;
use crate::pid_lock::PidLock;
use crate::protocol::{
    DaemonMethod, DaemonRequest, DaemonResponse, ErrorBody, LogsParams, MessageCodec, PingResult,
    SearchSymbolsParams, StatusResult, SymbolInfoParams, INTERNAL_ERROR, INVALID_PARAMS,
    METHOD_NOT_FOUND, PARSE_ERROR,
};
use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Connections with no traffic for this long are closed
const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Entries returned by `logs` when the request does not say
const DEFAULT_LOG_LINES: usize = 100;

pub fn version_info() -> PingResult {
    PingResult {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("LENS_GIT_HASH").unwrap_or("unknown").to_string(),
        build_date: option_env!("LENS_BUILD_DATE")
            .unwrap_or("unknown")
            .to_string(),
        pid: std::process::id(),
    }
}

#[derive(Clone)]
pub struct LensDaemon {
    config: DaemonConfig,
    engine: Arc<QueryEngine>,
    log_buffer: LogBuffer,
    start_time: Instant,
    request_count: Arc<AtomicU64>,
    active_connections: Arc<AtomicUsize>,
    connection_semaphore: Arc<Semaphore>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl LensDaemon {
    pub fn new(config: &LensConfig, log_buffer: LogBuffer) -> Self {
        Self::with_engine(
            config.daemon.clone(),
            Arc::new(QueryEngine::from_config(config)),
            log_buffer,
        )
    }

    pub fn with_engine(config: DaemonConfig, engine: Arc<QueryEngine>, log_buffer: LogBuffer) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections.max(1) as usize)),
            config,
            engine,
            log_buffer,
            start_time: Instant::now(),
            request_count: Arc::new(AtomicU64::new(0)),
            active_connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    pub fn socket_path(&self) -> &str {
        &self.config.socket_path
    }

    /// Ask a running [`run`](Self::run) loop to stop.
    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub async fn run(self) -> Result<()> {
        let mut pid_lock = PidLock::new(&self.config.socket_path);
        pid_lock
            .try_lock()
            .map_err(|e| anyhow!("Failed to acquire daemon lock: {}", e))?;

        let listener = IpcListener::bind(&self.config.socket_path).await?;
        info!(
            "sourcelens daemon v{} listening on {}",
            env!("CARGO_PKG_VERSION"),
            listener.local_addr()
        );

        let sweeper = self.engine.pool().spawn_sweeper();
        let signals = self.spawn_signal_handler()?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(stream) => self.admit(stream),
                    Err(e) => error!("Error accepting connection: {}", e),
                },
                _ = shutdown_rx.changed() => {}
            }
        }

        info!("Daemon shutting down");
        sweeper.abort();
        signals.abort();
        drop(listener);
        self.engine.pool().shutdown_all().await;
        pid_lock.unlock()?;
        info!("Daemon shutdown complete");
        Ok(())
    }

    fn admit(&self, stream: IpcStream) {
        match self.connection_semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                let daemon = self.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    daemon.handle_connection(stream).await;
                });
            }
            Err(_) => {
                warn!(
                    "Connection limit reached ({} connections), rejecting new connection",
                    self.config.max_connections
                );
                drop(stream);
            }
        }
    }

    #[cfg(unix)]
    fn spawn_signal_handler(&self) -> Result<tokio::task::JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let daemon = self.clone();
        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
            }
            daemon.request_shutdown();
        }))
    }

    async fn handle_connection(&self, stream: IpcStream) {
        let client_id = Uuid::new_v4();
        let connected_at = Instant::now();
        let mut last_activity = Instant::now();
        self.active_connections.fetch_add(1, Ordering::SeqCst);
        debug!("[{}] Client connected", client_id);

        let (mut reader, mut writer) = stream.into_split();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let frame = tokio::select! {
                frame = MessageCodec::read_framed(&mut reader, self.config.read_timeout) => frame,
                _ = shutdown_rx.changed() => break,
            };
            let body = match frame {
                Ok(body) => body,
                Err(e) => {
                    let message = e.to_string();
                    if message.contains("Timeout reading message length")
                        && last_activity.elapsed() < CONNECTION_IDLE_TIMEOUT
                    {
                        continue;
                    }
                    if message.contains("early eof") || message.contains("Connection reset") {
                        debug!("[{}] Client disconnected", client_id);
                    } else {
                        debug!("[{}] Closing connection: {}", client_id, message);
                    }
                    break;
                }
            };
            last_activity = Instant::now();

            let (response, stop) = match MessageCodec::decode::<DaemonRequest>(&body) {
                Ok(request) => {
                    let stop = request.method == DaemonMethod::Shutdown.as_str();
                    (self.handle_request(request).await, stop)
                }
                Err(e) => {
                    warn!("[{}] Malformed request: {}", client_id, e);
                    let response = DaemonResponse::failure(
                        recover_id(&body),
                        PARSE_ERROR,
                        format!("Malformed request: {e}"),
                    );
                    (response, false)
                }
            };

            if let Err(e) = self.send_response(&mut writer, &response).await {
                error!("[{}] Failed to send response: {}", client_id, e);
                break;
            }
            if stop {
                self.request_shutdown();
                break;
            }
        }

        self.active_connections.fetch_sub(1, Ordering::SeqCst);
        debug!(
            "[{}] Client disconnected after {:?}",
            client_id,
            connected_at.elapsed()
        );
    }

    async fn send_response(&self, writer: &mut OwnedWriteHalf, response: &DaemonResponse) -> Result<()> {
        let bytes = match MessageCodec::encode(response) {
            Ok(bytes) => bytes,
            Err(e) => MessageCodec::encode(&DaemonResponse::failure(
                response.id.clone(),
                INTERNAL_ERROR,
                format!("Failed to encode response: {e}"),
            ))?,
        };
        MessageCodec::write_framed(writer, &bytes, self.config.write_timeout).await
    }

    /// Run one request to completion in its own task, bounded by the request timeout.
    pub async fn handle_request(&self, request: DaemonRequest) -> DaemonResponse {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        let DaemonRequest { id, method, params } = request;

        let method = match method.parse::<DaemonMethod>() {
            Ok(method) => method,
            Err(message) => return DaemonResponse::failure(id, METHOD_NOT_FOUND, message),
        };
        debug!("Handling {} request", method.as_str());

        let daemon = self.clone();
        let budget = self.config.request_timeout;
        let mut task = tokio::spawn(async move { daemon.dispatch(method, params).await });

        let outcome = match tokio::time::timeout(budget, &mut task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => {
                error!("{} handler failed: {}", method.as_str(), join_error);
                Err(ErrorBody {
                    code: INTERNAL_ERROR,
                    message: format!("Internal error while handling {}", method.as_str()),
                })
            }
            Err(_) => {
                task.abort();
                warn!(
                    "{} request exceeded {}s, abandoned",
                    method.as_str(),
                    budget.as_secs()
                );
                Err(error_body(&LensError::Timeout {
                    operation: method.as_str(),
                    budget,
                }))
            }
        };

        match outcome {
            Ok(result) => DaemonResponse::success(id, result),
            Err(error) => DaemonResponse {
                id,
                result: None,
                error: Some(error),
            },
        }
    }

    async fn dispatch(&self, method: DaemonMethod, params: Value) -> Result<Value, ErrorBody> {
        match method {
            DaemonMethod::Ping => to_value(version_info()),
            DaemonMethod::Status => to_value(self.status()),
            DaemonMethod::SymbolInfo => {
                let params: SymbolInfoParams = parse_params(params)?;
                let info = self
                    .engine
                    .symbol_info(&params)
                    .await
                    .map_err(|e| error_body(&e))?;
                to_value(info)
            }
            DaemonMethod::SearchSymbols => {
                let params: SearchSymbolsParams = parse_params(params)?;
                let results = self
                    .engine
                    .search_symbols(&params)
                    .await
                    .map_err(|e| error_body(&e))?;
                to_value(results)
            }
            DaemonMethod::Logs => {
                let params: LogsParams = if params.is_null() {
                    LogsParams::default()
                } else {
                    parse_params(params)?
                };
                to_value(
                    self.log_buffer
                        .get_last(params.lines.unwrap_or(DEFAULT_LOG_LINES)),
                )
            }
            DaemonMethod::Shutdown => Ok(Value::Null),
        }
    }

    pub fn status(&self) -> StatusResult {
        StatusResult {
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            request_count: self.request_count.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::SeqCst),
            sessions: self.engine.pool().snapshot(),
        }
    }
}

fn error_body(error: &LensError) -> ErrorBody {
    ErrorBody {
        code: error.code(),
        message: error.to_string(),
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, ErrorBody> {
    serde_json::from_value(params).map_err(|e| ErrorBody {
        code: INVALID_PARAMS,
        message: format!("Invalid params: {e}"),
    })
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, ErrorBody> {
    serde_json::to_value(value).map_err(|e| ErrorBody {
        code: INTERNAL_ERROR,
        message: format!("Failed to serialize result: {e}"),
    })
}

/// Best-effort id from a frame that did not decode as a request.
fn recover_id(body: &[u8]) -> Value {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("id").cloned())
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recover_id() {
        assert_eq!(recover_id(br#"{"id": 7, "params": {}}"#), json!(7));
        assert_eq!(recover_id(b"not json"), Value::Null);
    }

    #[test]
    fn test_version_info() {
        let info = version_info();
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn test_invalid_params_code() {
        let err = parse_params::<SymbolInfoParams>(json!({"line": "x"})).unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }

    #[test]
    fn test_lens_error_codes_pass_through() {
        let body = error_body(&LensError::not_found("Foo"));
        assert_eq!(body.code, 1004);
        assert!(body.message.contains("Foo"));
    }
}
