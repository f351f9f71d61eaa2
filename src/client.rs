//! Client side of the daemon socket, including race-safe auto-start.

use anyhow::{anyhow, Context, Result};
use lens_daemon::ipc::IpcStream;
use lens_daemon::pid_lock::{is_process_running, read_pid};
use lens_daemon::protocol::{LogEntry, LogsParams, StatusResult};
use lens_daemon::{
    effective_socket_path, DaemonMethod, DaemonRequest, MessageCodec, PingResult,
    RankedSymbolSearchResult, SearchSymbolsParams, SymbolInfo, SymbolInfoParams,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Failures the daemon reported, as opposed to transport problems.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{message}")]
    Daemon { code: i64, message: String },

    #[error("daemon is not running on {socket}")]
    NotRunning { socket: String },

    #[error("response id {got} does not match request id {expected}")]
    MismatchedId { expected: u64, got: Value },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket_path: String,
    /// Spawn a daemon when none answers on the socket
    pub auto_start: bool,
    pub connect_timeout: Duration,
    /// Covers the daemon's own request budget plus transport slack
    pub request_timeout: Duration,
    /// Log level handed to an auto-started daemon
    pub daemon_log_level: String,
    /// Binary to spawn for auto-start; the current executable when unset
    pub daemon_exe: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: effective_socket_path(),
            auto_start: true,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(190),
            daemon_log_level: "info".to_string(),
            daemon_exe: None,
        }
    }
}

impl ClientConfig {
    pub fn with_socket(mut self, socket: Option<String>) -> Self {
        if let Some(socket) = socket {
            self.socket_path = socket;
        }
        self
    }
}

pub struct DaemonClient {
    stream: IpcStream,
    config: ClientConfig,
    next_id: u64,
}

impl DaemonClient {
    /// Connect to a running daemon, starting one first when allowed.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let socket = config.socket_path.clone();
        debug!("Connecting to daemon at {}", socket);

        match try_connect(&socket, config.connect_timeout).await {
            Ok(stream) => return Ok(Self::from_stream(stream, config)),
            Err(e) => debug!("No daemon answering on {}: {}", socket, e),
        }

        if !config.auto_start {
            return Err(ClientError::NotRunning { socket }.into());
        }

        info!("Starting daemon on {}", socket);
        // Held until the new daemon answers
        let startup = start_daemon_background(&config).await?;
        let stream = wait_for_daemon(&socket, config.connect_timeout).await?;
        drop(startup);
        Ok(Self::from_stream(stream, config))
    }

    /// Connect without auto-start, returning `None` when nothing answers.
    pub async fn connect_existing(socket: &str) -> Option<Self> {
        let config = ClientConfig {
            auto_start: false,
            ..ClientConfig::default()
        }
        .with_socket(Some(socket.to_string()));
        let stream = try_connect(socket, config.connect_timeout).await.ok()?;
        Some(Self::from_stream(stream, config))
    }

    fn from_stream(stream: IpcStream, config: ClientConfig) -> Self {
        Self {
            stream,
            config,
            next_id: 1,
        }
    }

    pub fn socket_path(&self) -> &str {
        &self.config.socket_path
    }

    /// Send one request and decode its result.
    pub async fn call<T: DeserializeOwned>(
        &mut self,
        method: DaemonMethod,
        params: impl Serialize,
    ) -> Result<T> {
        let id = self.next_id;
        self.next_id += 1;
        let request = DaemonRequest::new(id, method, params)?;
        let body = MessageCodec::encode(&request)?;

        MessageCodec::write_framed(&mut self.stream, &body, self.config.connect_timeout)
            .await
            .with_context(|| format!("Failed to send {} request", method.as_str()))?;
        let reply = MessageCodec::read_framed(&mut self.stream, self.config.request_timeout)
            .await
            .with_context(|| format!("Failed to read {} response", method.as_str()))?;
        let response: lens_daemon::DaemonResponse = MessageCodec::decode(&reply)?;

        if response.id != Value::from(id) {
            return Err(ClientError::MismatchedId {
                expected: id,
                got: response.id,
            }
            .into());
        }

        match response.into_result() {
            Ok(value) => Ok(serde_json::from_value(value)?),
            Err(error) => Err(ClientError::Daemon {
                code: error.code,
                message: error.message,
            }
            .into()),
        }
    }

    pub async fn ping(&mut self) -> Result<PingResult> {
        self.call(DaemonMethod::Ping, Value::Null).await
    }

    pub async fn status(&mut self) -> Result<StatusResult> {
        self.call(DaemonMethod::Status, Value::Null).await
    }

    pub async fn symbol_info(&mut self, params: &SymbolInfoParams) -> Result<SymbolInfo> {
        self.call(DaemonMethod::SymbolInfo, params).await
    }

    pub async fn search_symbols(
        &mut self,
        params: &SearchSymbolsParams,
    ) -> Result<Vec<RankedSymbolSearchResult>> {
        self.call(DaemonMethod::SearchSymbols, params).await
    }

    pub async fn logs(&mut self, lines: Option<usize>) -> Result<Vec<LogEntry>> {
        self.call(DaemonMethod::Logs, LogsParams { lines }).await
    }

    /// Ask the daemon to exit and wait until its socket is gone.
    pub async fn shutdown(mut self) -> Result<()> {
        let _: Value = self.call(DaemonMethod::Shutdown, Value::Null).await?;
        let socket = self.config.socket_path.clone();
        drop(self);

        let deadline = Instant::now() + Duration::from_secs(10);
        while Path::new(&socket).exists() {
            if Instant::now() > deadline {
                warn!("Daemon acknowledged shutdown but {} still exists", socket);
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }
}

async fn try_connect(socket: &str, connect_timeout: Duration) -> Result<IpcStream> {
    match timeout(connect_timeout, IpcStream::connect(socket)).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("Connection to {} timed out", socket)),
    }
}

/// Poll a freshly spawned daemon, quickly at first and then backing off.
async fn wait_for_daemon(socket: &str, connect_timeout: Duration) -> Result<IpcStream> {
    let retry_delays = [100, 200, 300, 500, 1000, 1000, 2000, 2000, 3000, 3000];
    for (attempt, delay_ms) in retry_delays.iter().enumerate() {
        sleep(Duration::from_millis(*delay_ms)).await;
        match try_connect(socket, connect_timeout).await {
            Ok(stream) => {
                info!("Connected to newly started daemon at {}", socket);
                return Ok(stream);
            }
            Err(e) => debug!("Connection attempt {} failed: {}", attempt + 1, e),
        }
    }
    Err(anyhow!(
        "Failed to connect to daemon on {} after starting it",
        socket
    ))
}

/// Spawn `<exe> daemon start --foreground` unless another client beat us to it.
///
/// Returns the startup lock when this call spawned the daemon. The caller
/// keeps it until the daemon accepts connections. `None` means a daemon was
/// already answering once the lock was ours.
pub async fn start_daemon_background(config: &ClientConfig) -> Result<Option<StartupLock>> {
    let socket = config.socket_path.clone();
    let lock_path = client_lock_path(&socket);
    let lock =
        tokio::task::spawn_blocking(move || acquire_startup_lock(&lock_path, STARTUP_LOCK_WAIT))
            .await??;

    // Another client may have finished starting it while we waited
    if try_connect(&socket, config.connect_timeout).await.is_ok() {
        debug!("Daemon already running (after acquiring startup lock)");
        return Ok(None);
    }

    let exe = match &config.daemon_exe {
        Some(exe) => exe.clone(),
        None => std::env::current_exe().context("Failed to get current executable path")?,
    };
    debug!("Starting daemon using {:?}", exe);

    let mut cmd = std::process::Command::new(&exe);
    cmd.args([
        "daemon",
        "start",
        "--foreground",
        "--socket",
        &socket,
        "--log-level",
        &config.daemon_log_level,
    ])
    .stdin(std::process::Stdio::null());
    // SOURCELENS_VERBOSE_SPAWN=1 keeps early bind/lock failures visible
    if std::env::var("SOURCELENS_VERBOSE_SPAWN").ok().as_deref() == Some("1") {
        cmd.stdout(std::process::Stdio::inherit())
            .stderr(std::process::Stdio::inherit());
    } else {
        cmd.stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
    }
    let child = cmd
        .spawn()
        .map_err(|e| anyhow!("Failed to spawn daemon: {}", e))?;

    info!("Started daemon in background (PID: {})", child.id());
    Ok(Some(lock))
}

const STARTUP_LOCK_WAIT: Duration = Duration::from_secs(10);
const STARTUP_LOCK_STALE_THRESHOLD: Duration = Duration::from_secs(30);

/// Startup lock file; removed when dropped.
#[derive(Debug)]
pub struct StartupLock {
    _file: File,
    path: PathBuf,
}

impl StartupLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StartupLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        debug!("Released client startup lock");
    }
}

/// Lock serializing auto-start attempts against one socket.
pub fn client_lock_path(socket: &str) -> PathBuf {
    PathBuf::from(format!("{socket}.start.lock"))
}

fn lock_file_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Remove the lock when its owner is gone and it is old enough to be abandoned.
fn cleanup_stale_startup_lock(path: &Path) -> Result<bool> {
    let age = lock_file_age(path);

    if let Some(pid) = read_pid(path) {
        if is_process_running(pid) {
            debug!("Startup lock {:?} held by running PID {}", path, pid);
            return Ok(false);
        }
        if age.map_or(true, |age| age > STARTUP_LOCK_STALE_THRESHOLD) {
            debug!("Removing stale startup lock {:?} left by PID {}", path, pid);
            std::fs::remove_file(path)?;
            return Ok(true);
        }
        return Ok(false);
    }

    if age.map_or(false, |age| age > STARTUP_LOCK_STALE_THRESHOLD) {
        debug!("Removing stale startup lock {:?} with no PID", path);
        std::fs::remove_file(path)?;
        return Ok(true);
    }
    Ok(false)
}

/// Create the lock file exclusively, waiting up to `max_wait` for its holder.
pub fn acquire_startup_lock(path: &Path, max_wait: Duration) -> Result<StartupLock> {
    let mut start_time = Instant::now();

    loop {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                debug!("Acquired client startup lock {:?}", path);
                return Ok(StartupLock {
                    _file: file,
                    path: path.to_path_buf(),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if cleanup_stale_startup_lock(path)? {
                    start_time = Instant::now();
                    continue;
                }

                if start_time.elapsed() > max_wait {
                    return Err(match read_pid(path) {
                        Some(pid) => anyhow!(
                            "Timeout waiting for client startup lock held by PID {}",
                            pid
                        ),
                        None => anyhow!("Timeout waiting for client startup lock"),
                    });
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(anyhow!("Failed to acquire client startup lock: {}", e)),
        }
    }
}

/// Error code carried by a daemon failure, if that is what `err` is.
pub fn daemon_error_code(err: &anyhow::Error) -> Option<i64> {
    match err.downcast_ref::<ClientError>() {
        Some(ClientError::Daemon { code, .. }) => Some(*code),
        _ => None,
    }
}
