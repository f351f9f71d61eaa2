mod fake_server;

use anyhow::Result;
use fake_server::{fast_config, Script};
use lens_daemon::config::PoolConfig;
use lens_daemon::pool::SessionPool;
use lens_daemon::session::SessionState;
use lens_daemon::workspace::{Workspace, WorkspaceKind};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn pool_with(script: &Script, idle_timeout: Duration) -> SessionPool {
    SessionPool::new(
        PoolConfig {
            idle_timeout,
            sweep_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_millis(200),
        },
        fast_config(),
        script.factory(),
    )
}

#[tokio::test]
async fn test_checkout_reuses_session_per_workspace() -> Result<()> {
    let script = Script::new(|_| Ok(json!([])));
    let log = script.log();
    let pool = pool_with(&script, Duration::from_secs(60));
    let app = Workspace::new("/work/App", WorkspaceKind::Package);
    let kit = Workspace::new("/work/Kit", WorkspaceKind::Package);

    drop(pool.checkout(&app, None).await?);
    drop(pool.checkout(&app, None).await?);
    drop(pool.checkout(&kit, None).await?);

    assert_eq!(pool.len(), 2);
    assert!(pool.contains(&app));
    assert_eq!(log.created(), 2);

    // Same root under another kind is a different workspace
    let app_ide = Workspace::new("/work/App", WorkspaceKind::IdeProject);
    drop(pool.checkout(&app_ide, None).await?);
    assert_eq!(pool.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_same_workspace_requests_are_serialized() -> Result<()> {
    let script = Script::new(|_| Ok(json!([])));
    let pool = Arc::new(pool_with(&script, Duration::from_secs(60)));
    let app = Workspace::new("/work/App", WorkspaceKind::Package);

    let held = pool.checkout(&app, None).await?;
    let waiter = {
        let pool = pool.clone();
        let app = app.clone();
        tokio::spawn(async move { pool.checkout(&app, None).await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    drop(held);
    tokio::time::timeout(Duration::from_secs(1), waiter).await???;
    Ok(())
}

#[tokio::test]
async fn test_idle_sessions_are_evicted() -> Result<()> {
    let script = Script::new(|_| Ok(json!([])));
    let log = script.log();
    let pool = pool_with(&script, Duration::ZERO);
    let app = Workspace::new("/work/App", WorkspaceKind::Package);
    let kit = Workspace::new("/work/Kit", WorkspaceKind::Package);

    drop(pool.checkout(&app, None).await?);
    let busy = pool.checkout(&kit, None).await?;

    // The held session is skipped until a later sweep
    assert_eq!(pool.sweep_idle().await, 1);
    assert!(!pool.contains(&app));
    assert!(pool.contains(&kit));
    assert_eq!(log.shutdowns(), 1);

    drop(busy);
    assert_eq!(pool.sweep_idle().await, 1);
    assert!(pool.is_empty());
    assert_eq!(log.shutdowns(), 2);
    Ok(())
}

#[tokio::test]
async fn test_recent_sessions_survive_sweep() -> Result<()> {
    let script = Script::new(|_| Ok(json!([])));
    let pool = pool_with(&script, Duration::from_secs(600));
    let app = Workspace::new("/work/App", WorkspaceKind::Package);

    drop(pool.checkout(&app, None).await?);
    assert_eq!(pool.sweep_idle().await, 0);
    assert!(pool.contains(&app));
    Ok(())
}

#[tokio::test]
async fn test_shut_down_session_is_replaced_on_checkout() -> Result<()> {
    let script = Script::new(|_| Ok(json!([])));
    let log = script.log();
    let pool = pool_with(&script, Duration::from_secs(60));
    let app = Workspace::new("/work/App", WorkspaceKind::Package);

    {
        let mut session = pool.checkout(&app, None).await?;
        session.shutdown().await?;
        assert_eq!(session.state(), SessionState::ShutDown);
    }

    let session = pool.checkout(&app, None).await?;
    assert_eq!(session.state(), SessionState::Uninitialized);
    assert_eq!(log.created(), 2);
    assert_eq!(pool.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_snapshot_and_shutdown_all() -> Result<()> {
    let script = Script::new(|_| Ok(json!([])));
    let log = script.log();
    let pool = pool_with(&script, Duration::from_secs(60));
    let app = Workspace::new("/work/App", WorkspaceKind::Package);
    let kit = Workspace::new("/work/Kit", WorkspaceKind::IdeWorkspace);

    drop(pool.checkout(&kit, None).await?);
    drop(pool.checkout(&app, None).await?);

    let snapshot = pool.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].workspace, app.root);
    assert_eq!(snapshot[0].kind, "package");
    assert_eq!(snapshot[0].state, "uninitialized");
    assert_eq!(snapshot[1].kind, "ide-workspace");

    pool.shutdown_all().await;
    assert!(pool.is_empty());
    assert_eq!(log.shutdowns(), 2);
    Ok(())
}

#[tokio::test]
async fn test_sweeper_task_evicts_in_background() -> Result<()> {
    let script = Script::new(|_| Ok(json!([])));
    let pool = Arc::new(pool_with(&script, Duration::ZERO));
    let app = Workspace::new("/work/App", WorkspaceKind::Package);
    drop(pool.checkout(&app, None).await?);

    let sweeper = pool.spawn_sweeper();
    tokio::time::sleep(Duration::from_millis(200)).await;
    sweeper.abort();
    assert!(pool.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_hung_shutdown_is_force_terminated() -> Result<()> {
    let script = Script::new(|_| Ok(json!([]))).hang_on_shutdown();
    let log = script.log();
    let pool = pool_with(&script, Duration::ZERO);
    let app = Workspace::new("/work/App", WorkspaceKind::Package);
    let kit = Workspace::new("/work/Kit", WorkspaceKind::Package);
    for workspace in [&app, &kit] {
        let mut session = pool.checkout(workspace, None).await?;
        session.workspace_symbols("App").await?;
    }

    let started = Instant::now();
    let evicted = tokio::time::timeout(Duration::from_secs(5), pool.sweep_idle()).await?;
    assert_eq!(evicted, 2);
    // Two sessions, each cut off at the 200ms shutdown budget
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(log.terminations(), 2);
    assert_eq!(log.shutdowns(), 0);
    assert!(pool.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_held_session_does_not_block_other_workspaces() -> Result<()> {
    let script = Script::new(|_| Ok(json!([])));
    let pool = pool_with(&script, Duration::from_secs(60));
    let app = Workspace::new("/work/App", WorkspaceKind::Package);
    let kit = Workspace::new("/work/Kit", WorkspaceKind::Package);

    let _held = pool.checkout(&app, None).await?;
    let results = tokio::time::timeout(Duration::from_secs(1), async {
        let mut session = pool.checkout(&kit, None).await?;
        session.workspace_symbols("Kit").await
    })
    .await??;
    assert!(results.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_cancelled_request_does_not_leave_stale_state() -> Result<()> {
    let script = Script::new(|_| Ok(json!([]))).delay("workspace/symbol", Duration::from_secs(30));
    let pool = Arc::new(pool_with(&script, Duration::from_secs(60)));
    let app = Workspace::new("/work/App", WorkspaceKind::Package);

    let request = {
        let pool = pool.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let mut session = pool.checkout(&app, None).await?;
            session.workspace_symbols("App").await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.snapshot()[0].state, "busy");

    request.abort();
    assert!(request.await.unwrap_err().is_cancelled());

    assert_eq!(pool.snapshot()[0].state, "ready");
    let session = pool.checkout(&app, None).await?;
    assert_eq!(session.state(), SessionState::Ready);
    Ok(())
}
