//! Workspace-keyed pool of sessions with idle eviction.
//!
//! Each entry guards its [`Session`] with its own async mutex, so requests for
//! different workspaces run in parallel while requests for the same
//! workspace are serialized.

use crate::config::{PoolConfig, SessionConfig};
use crate::error::LensResult;
use crate::protocol::SessionSnapshot;
use crate::session::{Session, SessionState};
use crate::supervisor::SupervisorFactory;
use crate::workspace::Workspace;
use dashmap::DashMap;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct PoolEntry {
    session: Arc<Mutex<Session>>,
    created: Instant,
    last_used_ms: AtomicU64,
}

impl PoolEntry {
    fn new(session: Session) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            created: Instant::now(),
            last_used_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        self.last_used_ms
            .store(self.created.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub fn idle(&self) -> Duration {
        let last_used = Duration::from_millis(self.last_used_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last_used)
    }
}

/// Exclusive access to one pooled session. Marks the entry used on release.
pub struct PoolGuard {
    guard: OwnedMutexGuard<Session>,
    entry: Arc<PoolEntry>,
}

impl Deref for PoolGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.guard
    }
}

impl DerefMut for PoolGuard {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.guard
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        self.entry.touch();
    }
}

pub struct SessionPool {
    entries: DashMap<Workspace, Arc<PoolEntry>>,
    config: PoolConfig,
    session_config: SessionConfig,
    factory: Arc<dyn SupervisorFactory>,
}

impl SessionPool {
    pub fn new(
        config: PoolConfig,
        session_config: SessionConfig,
        factory: Arc<dyn SupervisorFactory>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            session_config,
            factory,
        }
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.session_config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, workspace: &Workspace) -> bool {
        self.entries.contains_key(workspace)
    }

    /// Lock the session for `workspace`, creating it on first use. A session
    /// that was shut down while we waited for its lock is replaced.
    pub async fn checkout(
        &self,
        workspace: &Workspace,
        toolchain: Option<&Path>,
    ) -> LensResult<PoolGuard> {
        loop {
            let entry = self
                .entries
                .entry(workspace.clone())
                .or_insert_with(|| {
                    debug!("Creating session for {}", workspace);
                    let toolchain = toolchain
                        .map(Path::to_path_buf)
                        .or_else(|| self.session_config.toolchain.clone());
                    Arc::new(PoolEntry::new(Session::new(
                        workspace.clone(),
                        self.session_config.clone(),
                        self.factory.create(&self.session_config),
                        toolchain,
                    )))
                })
                .clone();

            let mut guard = entry.session.clone().lock_owned().await;
            entry.touch();
            guard.settle_interrupted();
            if guard.state() == SessionState::ShutDown {
                drop(guard);
                self.entries
                    .remove_if(workspace, |_, current| Arc::ptr_eq(current, &entry));
                continue;
            }
            return Ok(PoolGuard { guard, entry });
        }
    }

    async fn shutdown_session(&self, session: &mut Session) {
        let budget = self.config.shutdown_timeout;
        match tokio::time::timeout(budget, session.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Session for {} shut down with error: {}", session.workspace(), e),
            Err(_) => {
                warn!(
                    "Shutdown of {} exceeded {}ms, force terminating",
                    session.workspace(),
                    budget.as_millis()
                );
                session.force_terminate().await;
            }
        }
    }

    /// Shut down and remove sessions unused for longer than the idle threshold.
    /// Busy sessions are skipped until the next sweep.
    pub async fn sweep_idle(&self) -> usize {
        let threshold = self.config.idle_timeout;
        let candidates: Vec<(Workspace, Arc<PoolEntry>)> = self
            .entries
            .iter()
            .filter(|e| e.value().idle() >= threshold)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut evicted = 0;
        for (workspace, entry) in candidates {
            let Ok(mut session) = entry.session.clone().try_lock_owned() else {
                debug!("Session for {} is busy, skipping eviction", workspace);
                continue;
            };
            if entry.idle() < threshold {
                continue;
            }
            let removed = self
                .entries
                .remove_if(&workspace, |_, current| Arc::ptr_eq(current, &entry))
                .is_some();
            if removed {
                info!(
                    "Evicting session for {} after {}s idle",
                    workspace,
                    entry.idle().as_secs()
                );
                self.shutdown_session(&mut session).await;
                evicted += 1;
            }
        }
        evicted
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `sweep_interval` until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = pool.sweep_idle().await;
                if evicted > 0 {
                    debug!("Idle sweep evicted {} sessions", evicted);
                }
            }
        })
    }

    pub async fn shutdown_all(&self) {
        let workspaces: Vec<Workspace> = self.entries.iter().map(|e| e.key().clone()).collect();
        info!("Shutting down {} sessions", workspaces.len());

        for workspace in workspaces {
            let Some((_, entry)) = self.entries.remove(&workspace) else {
                continue;
            };
            match tokio::time::timeout(
                self.config.shutdown_timeout,
                entry.session.clone().lock_owned(),
            )
            .await
            {
                Ok(mut session) => self.shutdown_session(&mut session).await,
                Err(_) => warn!("Timeout acquiring session lock for {} during shutdown", workspace),
            }
        }
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .entries
            .iter()
            .map(|e| {
                let entry = e.value();
                match entry.session.try_lock() {
                    Ok(mut session) => {
                        session.settle_interrupted();
                        session.snapshot(entry.idle())
                    }
                    Err(_) => SessionSnapshot {
                        workspace: e.key().root.clone(),
                        kind: e.key().kind.to_string(),
                        generation: 0,
                        state: "busy".to_string(),
                        idle_secs: 0,
                        opened_documents: 0,
                    },
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.workspace.cmp(&b.workspace));
        snapshots
    }
}
