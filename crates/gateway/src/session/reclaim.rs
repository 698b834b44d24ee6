//! Periodic sweep that destroys sessions nobody has touched for a while.
//!
//! Connection teardown normally destroys a session as soon as its transport
//! closes. This sweep catches whatever slipped through (a connection task that
//! never got to run its cleanup, for instance).

use std::sync::Arc;
use std::time::Duration;

use protocol::now_millis;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::pty::SessionId;
use super::registry::SessionRegistry;

/// Sweep schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Idle time after which a session is destroyed.
    pub stale_after: Duration,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(3600),
        }
    }
}

/// Destroys every session idle for longer than `stale_after`.
///
/// Sessions with a subscriber are not exempt: a half-open transport keeps
/// its connection task, and so its subscription, alive indefinitely.
///
/// Returns the ids that were destroyed by this call.
pub fn reclaim_stale(registry: &SessionRegistry, stale_after: Duration) -> Vec<SessionId> {
    let now = now_millis();
    let mut reclaimed = Vec::new();

    for info in registry.list_sessions() {
        let idle = info.idle_for(now);
        if idle <= stale_after {
            continue;
        }
        if registry.destroy_session(&info.id) {
            tracing::info!(
                session_id = %info.id,
                pid = info.pid,
                idle_secs = idle.as_secs(),
                "Reclaimed stale session"
            );
            reclaimed.push(info.id);
        }
    }

    reclaimed
}

/// Runs [`reclaim_stale`] every `config.interval` until `shutdown` fires.
///
/// `on_reclaimed` is called with the ids of each non-empty sweep.
pub fn spawn_reclaim_task<F>(
    registry: Arc<SessionRegistry>,
    config: ReclaimConfig,
    shutdown: CancellationToken,
    on_reclaimed: F,
) -> JoinHandle<()>
where
    F: Fn(&[SessionId]) + Send + 'static,
{
    tokio::spawn(async move {
        tracing::debug!(
            interval_secs = config.interval.as_secs(),
            stale_after_secs = config.stale_after.as_secs(),
            "Reclaim task started"
        );
        let mut ticker = tokio::time::interval(config.interval);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let reclaimed = reclaim_stale(&registry, config.stale_after);
                    if !reclaimed.is_empty() {
                        on_reclaimed(&reclaimed);
                    }
                }
            }
        }

        tracing::debug!("Reclaim task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::registry::{CreateRequest, RegistryOptions};
    use std::sync::Mutex;

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(RegistryOptions::new("/bin/sh")))
    }

    fn request() -> CreateRequest {
        CreateRequest::new(80, 24, std::env::temp_dir())
    }

    #[tokio::test]
    async fn test_fresh_sessions_are_kept() {
        let registry = registry();
        let info = registry.create_session(request()).await.unwrap();

        let reclaimed = reclaim_stale(&registry, Duration::from_secs(3600));

        assert!(reclaimed.is_empty());
        assert!(registry.exists(&info.id));
        registry.destroy_session(&info.id);
    }

    #[tokio::test]
    async fn test_idle_sessions_are_reclaimed() {
        let registry = registry();
        let info = registry.create_session(request()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let reclaimed = reclaim_stale(&registry, Duration::from_millis(500));

        assert!(reclaimed.contains(&info.id));
        assert!(!registry.exists(&info.id));
    }

    #[tokio::test]
    async fn test_idle_subscribed_session_is_reclaimed() {
        let registry = registry();
        let info = registry.create_session(request()).await.unwrap();
        let mut rx = registry.subscribe(&info.id).unwrap();
        assert!(registry.get_session(&info.id).unwrap().subscribed);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let reclaimed = reclaim_stale(&registry, Duration::from_millis(500));

        assert_eq!(reclaimed, vec![info.id.clone()]);
        assert!(!registry.exists(&info.id));

        // The subscriber sees its stream end.
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn test_reclaim_task_runs_until_cancelled() {
        let registry = registry();
        let info = registry.create_session(request()).await.unwrap();
        let seen: Arc<Mutex<Vec<SessionId>>> = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let sink = Arc::clone(&seen);
        let handle = spawn_reclaim_task(
            Arc::clone(&registry),
            ReclaimConfig {
                interval: Duration::from_millis(200),
                stale_after: Duration::from_millis(100),
            },
            shutdown.clone(),
            move |ids| sink.lock().unwrap().extend_from_slice(ids),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while registry.exists(&info.id) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!registry.exists(&info.id));
        assert_eq!(seen.lock().unwrap().as_slice(), &[info.id.clone()]);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
