//! A single stdio connection to a running sourcekit-lsp process.
//!
//! Writes go straight to the child's stdin. A background reader task owns
//! stdout, decodes `Content-Length` frames and routes each response to the
//! waiting request by id, so a caller that gives up on a request simply
//! drops its receiver.

use crate::error::{LensError, LensResult};
use crate::supervisor::AnalysisConnection;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Pending = Arc<DashMap<i64, oneshot::Sender<LensResult<Value>>>>;

const METHOD_NOT_FOUND: i64 = -32601;

/// Largest frame accepted from the server; workspace/symbol answers on big
/// projects run to several megabytes.
pub const MAX_LSP_FRAME_SIZE: usize = 64 * 1024 * 1024;

pub struct LspServer {
    id: u64,
    child: Mutex<Option<Child>>,
    stdin: Arc<Mutex<Writer>>,
    pending: Pending,
    next_request_id: AtomicI64,
    alive: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
    stderr_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for LspServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspServer")
            .field("id", &self.id)
            .field("alive", &self.alive.load(Ordering::Relaxed))
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Removes a pending entry if the request future is dropped before completion.
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl LspServer {
    /// Wrap an already spawned child. Its stdio must be piped.
    pub fn from_child(id: u64, mut child: Child) -> LensResult<Self> {
        let stdin = child.stdin.take().ok_or_else(|| LensError::ProcessLaunchFailed {
            message: "sourcekit-lsp stdin was not captured".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| LensError::ProcessLaunchFailed {
            message: "sourcekit-lsp stdout was not captured".to_string(),
        })?;

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            debug!(target: "sourcekit_stderr", connection = id, "{}", line)
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(target: "sourcekit_stderr", "Error reading stderr: {}", e);
                            break;
                        }
                    }
                }
            })
        });

        let mut server = Self::from_streams(id, stdout, stdin);
        server.child = Mutex::new(Some(child));
        server.stderr_task = stderr_task;
        Ok(server)
    }

    /// Build a connection over arbitrary streams; no child process is owned.
    pub fn from_streams<R, W>(id: u64, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let stdin: Arc<Mutex<Writer>> = Arc::new(Mutex::new(Box::new(writer)));
        let pending: Pending = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(Self::read_loop(
            id,
            BufReader::new(reader),
            stdin.clone(),
            pending.clone(),
            alive.clone(),
        ));

        Self {
            id,
            child: Mutex::new(None),
            stdin,
            pending,
            next_request_id: AtomicI64::new(1),
            alive,
            reader_task,
            stderr_task: None,
        }
    }

    async fn read_loop<R>(
        id: u64,
        mut reader: BufReader<R>,
        stdin: Arc<Mutex<Writer>>,
        pending: Pending,
        alive: Arc<AtomicBool>,
    ) where
        R: AsyncRead + Unpin,
    {
        let reason = loop {
            match read_frame(&mut reader).await {
                Ok(Some(msg)) => Self::dispatch(id, msg, &stdin, &pending).await,
                Ok(None) => break "stream closed".to_string(),
                Err(e) => {
                    // Malformed framing leaves the stream unrecoverable
                    break match e {
                        LensError::Transport { message } => message,
                        other => format!("stream closed: {other}"),
                    };
                }
            }
        };

        alive.store(false, Ordering::SeqCst);
        debug!(connection = id, "sourcekit-lsp reader stopped: {}", reason);
        let ids: Vec<i64> = pending.iter().map(|e| *e.key()).collect();
        for request_id in ids {
            if let Some((_, tx)) = pending.remove(&request_id) {
                let _ = tx.send(Err(LensError::transport(reason.clone())));
            }
        }
    }

    async fn dispatch(id: u64, msg: Value, stdin: &Arc<Mutex<Writer>>, pending: &Pending) {
        let method = msg.get("method").and_then(|m| m.as_str());
        let request_id = msg.get("id").cloned();

        match (method, request_id) {
            (None, Some(request_id)) => {
                let Some(request_id) = request_id.as_i64() else {
                    warn!(connection = id, "Response with unexpected id: {}", request_id);
                    return;
                };
                let Some((_, tx)) = pending.remove(&request_id) else {
                    trace!(connection = id, "Dropping late response {}", request_id);
                    return;
                };
                let outcome = match msg.get("error") {
                    Some(error) => Err(LensError::Lsp {
                        code: error.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
                        message: error
                            .get("message")
                            .and_then(|m| m.as_str())
                            .unwrap_or("unknown error")
                            .to_string(),
                    }),
                    None => Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            }
            (Some(method), Some(request_id)) => {
                let reply = server_request_reply(method, msg.get("params"), request_id);
                if let Err(e) = write_message(stdin, &reply).await {
                    warn!(connection = id, "Failed to answer {}: {}", method, e);
                }
            }
            (Some("window/logMessage"), None) | (Some("window/showMessage"), None) => {
                let text = msg
                    .pointer("/params/message")
                    .and_then(|m| m.as_str())
                    .unwrap_or_default();
                debug!(target: "sourcekit_stderr", connection = id, "{}", text);
            }
            (Some(method), None) => {
                trace!(target: "lsp_protocol", connection = id, "notification {}", method)
            }
            (None, None) => warn!(connection = id, "Ignoring message without id or method"),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send `shutdown` then `exit`, then wait for the process to go away.
    /// Kills it if it is still running when `budget` runs out.
    pub async fn shutdown(&self, budget: Duration) -> LensResult<()> {
        let graceful = tokio::time::timeout(budget, async {
            if self.is_alive() {
                self.request("shutdown", Value::Null).await?;
                self.notify("exit", Value::Null).await?;
            }
            let mut child = self.child.lock().await;
            if let Some(child) = child.as_mut() {
                child
                    .wait()
                    .await
                    .map_err(|e| LensError::transport(e.to_string()))?;
            }
            Ok::<(), LensError>(())
        })
        .await;

        match graceful {
            Ok(Ok(())) => {
                debug!(connection = self.id, "sourcekit-lsp exited gracefully");
                self.terminate().await;
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(connection = self.id, "Graceful shutdown failed, killing: {}", e);
                self.terminate().await;
                Err(e)
            }
            Err(_) => {
                warn!(
                    connection = self.id,
                    "sourcekit-lsp did not exit within {}ms, killing",
                    budget.as_millis()
                );
                self.terminate().await;
                Err(LensError::Timeout {
                    operation: "shutdown",
                    budget,
                })
            }
        }
    }

    /// Kill the process unconditionally and fail every pending request.
    pub async fn terminate(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(connection = self.id, "kill: {}", e);
            }
        }
        self.reader_task.abort();
        if let Some(task) = &self.stderr_task {
            task.abort();
        }
        let ids: Vec<i64> = self.pending.iter().map(|e| *e.key()).collect();
        for request_id in ids {
            if let Some((_, tx)) = self.pending.remove(&request_id) {
                let _ = tx.send(Err(LensError::transport("connection closed")));
            }
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(|c| c.id())
    }
}

#[async_trait]
impl AnalysisConnection for LspServer {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_alive(&self) -> bool {
        LspServer::is_alive(self)
    }

    async fn request(&self, method: &str, params: Value) -> LensResult<Value> {
        if !self.is_alive() {
            return Err(LensError::transport("stream closed"));
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: request_id,
        };

        let msg = json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": method,
            "params": params,
        });
        write_message(&self.stdin, &msg).await?;

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(LensError::transport("stream closed")),
        }
    }

    async fn notify(&self, method: &str, params: Value) -> LensResult<()> {
        let msg = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        write_message(&self.stdin, &msg).await
    }
}

impl Drop for LspServer {
    fn drop(&mut self) {
        self.reader_task.abort();
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        if let Ok(mut child) = self.child.try_lock() {
            if let Some(child) = child.as_mut() {
                if let Err(e) = child.start_kill() {
                    debug!(connection = self.id, "start_kill in drop: {}", e);
                }
            }
        } else {
            warn!(
                connection = self.id,
                "Could not lock child in drop, process may still be running"
            );
        }
    }
}

fn server_request_reply(method: &str, params: Option<&Value>, id: Value) -> Value {
    match method {
        "workspace/configuration" => {
            let count = params
                .and_then(|p| p.get("items"))
                .and_then(|i| i.as_array())
                .map_or(0, |items| items.len());
            let result = vec![json!({}); count];
            json!({ "jsonrpc": "2.0", "id": id, "result": result })
        }
        "window/workDoneProgress/create" | "client/registerCapability" => {
            json!({ "jsonrpc": "2.0", "id": id, "result": null })
        }
        other => {
            info!("Unhandled server request {}", other);
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": METHOD_NOT_FOUND, "message": format!("Method not found: {other}") }
            })
        }
    }
}

async fn write_message(stdin: &Arc<Mutex<Writer>>, msg: &Value) -> LensResult<()> {
    let body = msg.to_string();
    trace!(target: "lsp_protocol", ">>> {}", body);
    let frame = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);

    let mut stdin = stdin.lock().await;
    stdin
        .write_all(frame.as_bytes())
        .await
        .map_err(|e| LensError::transport(e.to_string()))?;
    stdin
        .flush()
        .await
        .map_err(|e| LensError::transport(e.to_string()))
}

/// Read one `Content-Length` framed message. `Ok(None)` on clean EOF.
async fn read_frame<R>(reader: &mut BufReader<R>) -> LensResult<Option<Value>>
where
    R: AsyncRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    loop {
        let mut header = String::new();
        let n = reader
            .read_line(&mut header)
            .await
            .map_err(|e| LensError::transport(e.to_string()))?;
        if n == 0 {
            return Ok(None);
        }
        let header = header.trim_end();
        if header.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok();
            }
        }
    }

    let len = content_length.ok_or_else(|| LensError::protocol("missing Content-Length"))?;
    if len > MAX_LSP_FRAME_SIZE {
        return Err(LensError::transport(format!(
            "sourcekit-lsp frame of {} bytes exceeds the {} byte limit",
            len, MAX_LSP_FRAME_SIZE
        )));
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| LensError::transport(e.to_string()))?;
    trace!(target: "lsp_protocol", "<<< {}", String::from_utf8_lossy(&body));

    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| LensError::protocol(format!("invalid JSON from sourcekit-lsp: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    async fn send(stream: &mut DuplexStream, msg: Value) {
        let body = msg.to_string();
        stream
            .write_all(format!("Content-Length: {}\r\n\r\n{}", body.len(), body).as_bytes())
            .await
            .unwrap();
    }

    async fn recv(reader: &mut BufReader<DuplexStream>) -> Value {
        read_frame(reader).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (reader, mut writer) = duplex(4096);
        let mut reader = BufReader::new(reader);
        writer
            .write_all(format!("Content-Length: {}\r\n\r\n{{}}", MAX_LSP_FRAME_SIZE + 1).as_bytes())
            .await
            .unwrap();

        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, LensError::Transport { .. }), "{err:?}");
        assert!(err.to_string().contains("exceeds"));
    }

    #[tokio::test]
    async fn test_response_routed_by_id() {
        let (client_read, mut server_write) = duplex(4096);
        let (client_write, server_read) = duplex(4096);
        let conn = Arc::new(LspServer::from_streams(1, client_read, client_write));
        let mut server_read = BufReader::new(server_read);

        let c = conn.clone();
        let call = tokio::spawn(async move { c.request("workspace/symbol", json!({"query": "A"})).await });

        let req = recv(&mut server_read).await;
        assert_eq!(req["method"], "workspace/symbol");
        send(&mut server_write, json!({"jsonrpc": "2.0", "id": req["id"], "result": [1]})).await;

        assert_eq!(call.await.unwrap().unwrap(), json!([1]));
    }

    #[tokio::test]
    async fn test_server_configuration_request_answered() {
        let (client_read, mut server_write) = duplex(4096);
        let (client_write, server_read) = duplex(4096);
        let _conn = LspServer::from_streams(2, client_read, client_write);
        let mut server_read = BufReader::new(server_read);

        send(
            &mut server_write,
            json!({"jsonrpc": "2.0", "id": 99, "method": "workspace/configuration",
                   "params": {"items": [{"section": "a"}, {"section": "b"}]}}),
        )
        .await;
        let reply = recv(&mut server_read).await;
        assert_eq!(reply["id"], 99);
        assert_eq!(reply["result"], json!([{}, {}]));

        send(
            &mut server_write,
            json!({"jsonrpc": "2.0", "id": "x", "method": "custom/thing"}),
        )
        .await;
        let reply = recv(&mut server_read).await;
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_eof_fails_pending_with_stream_closed() {
        let (client_read, server_write) = duplex(4096);
        let (client_write, _server_read) = duplex(4096);
        let conn = Arc::new(LspServer::from_streams(3, client_read, client_write));

        let c = conn.clone();
        let call = tokio::spawn(async move { c.request("textDocument/hover", json!({})).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(server_write);

        let err = call.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("stream closed"));
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn test_error_response_is_lsp_error() {
        let (client_read, mut server_write) = duplex(4096);
        let (client_write, server_read) = duplex(4096);
        let conn = Arc::new(LspServer::from_streams(4, client_read, client_write));
        let mut server_read = BufReader::new(server_read);

        let c = conn.clone();
        let call = tokio::spawn(async move { c.request("textDocument/definition", json!({})).await });
        let req = recv(&mut server_read).await;
        send(
            &mut server_write,
            json!({"jsonrpc": "2.0", "id": req["id"], "error": {"code": -32001, "message": "sourcekitd crashed"}}),
        )
        .await;

        match call.await.unwrap().unwrap_err() {
            LensError::Lsp { code, message } => {
                assert_eq!(code, -32001);
                assert_eq!(message, "sourcekitd crashed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abandoned_request_is_forgotten() {
        let (client_read, _server_write) = duplex(4096);
        let (client_write, _server_read) = duplex(4096);
        let conn = LspServer::from_streams(5, client_read, client_write);

        let outcome = tokio::time::timeout(
            Duration::from_millis(20),
            conn.request("workspace/symbol", json!({})),
        )
        .await;
        assert!(outcome.is_err());
        assert!(conn.pending.is_empty());
    }
}
