//! Scripted stand-in for sourcekit-lsp.
//!
//! A [`FakeFactory`] hands out supervisors whose connections answer requests
//! through a shared handler closure. The handler sees which launch it is
//! talking to and how many times the method has been called so far, which is
//! enough to script crashes, empty warm-up answers and slow replies.

#![allow(dead_code)]

use async_trait::async_trait;
use lens_daemon::config::SessionConfig;
use lens_daemon::error::{LensError, LensResult};
use lens_daemon::supervisor::{AnalysisConnection, Supervisor, SupervisorFactory};
use lens_daemon::workspace::Workspace;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

static NEXT_ID: AtomicU64 = AtomicU64::new(1_000);

/// One request as the handler sees it.
pub struct Call<'a> {
    /// Workspace root the supervisor was acquired for
    pub root: &'a Path,
    /// 1-based launch number within the supervisor
    pub launch: u64,
    /// 1-based count of this method across all launches of the supervisor
    pub nth: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

pub type Handler = Arc<dyn Fn(Call<'_>) -> LensResult<Value> + Send + Sync>;

/// Counters shared by every supervisor a factory creates.
#[derive(Default)]
pub struct FakeLog {
    pub created: AtomicU64,
    pub launches: AtomicU64,
    pub terminations: AtomicU64,
    pub shutdowns: AtomicU64,
    pub calls: Mutex<Vec<(u64, String)>>,
}

impl FakeLog {
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> u64 {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> u64 {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    /// `(launch, method)` for every request and notification, in order
    pub fn calls(&self) -> Vec<(u64, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls().iter().filter(|(_, m)| m == method).count()
    }
}

#[derive(Clone)]
pub struct Script {
    handler: Handler,
    delays: HashMap<String, Duration>,
    hang_on_shutdown: bool,
    log: Arc<FakeLog>,
}

impl Script {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(Call<'_>) -> LensResult<Value> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            delays: HashMap::new(),
            hang_on_shutdown: false,
            log: Arc::new(FakeLog::default()),
        }
    }

    /// Every request to `method` sleeps for `delay` before answering.
    pub fn delay(mut self, method: &str, delay: Duration) -> Self {
        self.delays.insert(method.to_string(), delay);
        self
    }

    /// Graceful shutdown never completes, like a wedged server.
    pub fn hang_on_shutdown(mut self) -> Self {
        self.hang_on_shutdown = true;
        self
    }

    pub fn log(&self) -> Arc<FakeLog> {
        self.log.clone()
    }

    pub fn supervisor(&self) -> Box<dyn Supervisor> {
        self.log.created.fetch_add(1, Ordering::SeqCst);
        Box::new(FakeSupervisor {
            script: self.clone(),
            current: None,
            launch: 0,
            counts: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn factory(&self) -> Arc<dyn SupervisorFactory> {
        Arc::new(FakeFactory {
            script: self.clone(),
        })
    }
}

pub struct FakeConnection {
    id: u64,
    root: PathBuf,
    launch: u64,
    script: Script,
    counts: Arc<Mutex<HashMap<String, u64>>>,
}

#[async_trait]
impl AnalysisConnection for FakeConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn request(&self, method: &str, params: Value) -> LensResult<Value> {
        self.script
            .log
            .calls
            .lock()
            .unwrap()
            .push((self.launch, method.to_string()));
        let nth = {
            let mut counts = self.counts.lock().unwrap();
            let n = counts.entry(method.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        if let Some(delay) = self.script.delays.get(method) {
            tokio::time::sleep(*delay).await;
        }
        (self.script.handler)(Call {
            root: &self.root,
            launch: self.launch,
            nth,
            method,
            params: &params,
        })
    }

    async fn notify(&self, method: &str, _params: Value) -> LensResult<()> {
        self.script
            .log
            .calls
            .lock()
            .unwrap()
            .push((self.launch, method.to_string()));
        Ok(())
    }
}

pub struct FakeSupervisor {
    script: Script,
    current: Option<Arc<FakeConnection>>,
    launch: u64,
    counts: Arc<Mutex<HashMap<String, u64>>>,
}

#[async_trait]
impl Supervisor for FakeSupervisor {
    async fn acquire(
        &mut self,
        workspace: &Workspace,
        _toolchain: Option<&Path>,
    ) -> LensResult<Arc<dyn AnalysisConnection>> {
        if let Some(conn) = &self.current {
            return Ok(conn.clone());
        }
        self.launch += 1;
        self.script.log.launches.fetch_add(1, Ordering::SeqCst);
        let conn = Arc::new(FakeConnection {
            id: NEXT_ID.fetch_add(1, Ordering::SeqCst),
            root: workspace.root.clone(),
            launch: self.launch,
            script: self.script.clone(),
            counts: self.counts.clone(),
        });
        self.current = Some(conn.clone());
        Ok(conn)
    }

    async fn force_terminate(&mut self) {
        if self.current.take().is_some() {
            self.script.log.terminations.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn shutdown(&mut self) -> LensResult<()> {
        if self.script.hang_on_shutdown {
            std::future::pending::<()>().await;
        }
        self.current = None;
        self.script.log.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeFactory {
    script: Script,
}

impl SupervisorFactory for FakeFactory {
    fn create(&self, _config: &SessionConfig) -> Box<dyn Supervisor> {
        self.script.supervisor()
    }
}

/// Session config with short retry delays so tests stay fast.
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        package_symbol_attempts: 3,
        package_symbol_delay: Duration::from_millis(5),
        ide_symbol_attempts: 2,
        ide_symbol_delay: Duration::from_millis(5),
        ..SessionConfig::default()
    }
}

pub fn connection_reset() -> LensError {
    LensError::transport("Connection reset by peer")
}

/// `Location` JSON for a one-based line/column in `path`.
pub fn location(path: &Path, line: u32, column: u32) -> Value {
    json!({
        "uri": format!("file://{}", path.display()),
        "range": {
            "start": {"line": line - 1, "character": column - 1},
            "end": {"line": line - 1, "character": column + 3},
        }
    })
}

/// A `SymbolInformation` entry.
pub fn symbol(name: &str, kind: u64, path: &Path, line: u32) -> Value {
    json!({
        "name": name,
        "kind": kind,
        "location": location(path, line, 1),
    })
}
