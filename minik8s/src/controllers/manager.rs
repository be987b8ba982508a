//! Controller lifecycle management.
//!
//! A [`Controller`] owns one reconciliation domain: `start` spawns its
//! background loop bound to a cancellation token, `sync` performs one
//! idempotent pass, `stop` releases resources. The [`ControllerManager`]
//! holds a set of controllers, starts them together, and layers a periodic
//! tick that drives every controller's `sync` in sequence so progress does
//! not depend on any single controller's internal timer.

use anyhow::Result;
use async_trait::async_trait;
use log::{error, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Default cadence of a controller's internal reconcile timer.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Controller: Send + Sync {
    /// Unique name used for registration and logging.
    fn name(&self) -> &'static str;

    /// Begin background work. Loops must exit promptly once `shutdown`
    /// fires, bounded by at most one in-flight store operation.
    async fn start(&self, shutdown: CancellationToken) -> Result<()>;

    /// Release resources. Idempotent.
    async fn stop(&self) -> Result<()>;

    /// One reconciliation pass. Object-level errors are absorbed and
    /// logged inside the pass; an `Err` means the pass could not run at
    /// all (store unavailable) and the next tick retries.
    async fn sync(&self) -> Result<()>;
}

pub struct ControllerManager {
    controllers: RwLock<HashMap<&'static str, Arc<dyn Controller>>>,
    sync_interval: Duration,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl ControllerManager {
    pub fn new(sync_interval: Duration) -> Self {
        Self {
            controllers: RwLock::new(HashMap::new()),
            sync_interval,
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    pub async fn add_controller(&self, controller: Arc<dyn Controller>) {
        let name = controller.name();
        if self
            .controllers
            .write()
            .await
            .insert(name, controller)
            .is_some()
        {
            error!("controller {name} registered twice, previous instance replaced");
        }
    }

    /// Start every registered controller and the manager tick loop. The
    /// provided token parents all controller tokens so cancelling it tears
    /// the whole tree down.
    pub async fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("controller manager is already running");
        }

        let controllers = self.controllers.read().await;
        for controller in controllers.values() {
            controller.start(shutdown.child_token()).await?;
            info!("started controller {}", controller.name());
        }
        drop(controllers);

        let manager = self.clone();
        let local_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.sync_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = local_shutdown.cancelled() => return,
                    _ = ticker.tick() => manager.sync_all().await,
                }
            }
        });

        Ok(())
    }

    /// Drive one `sync` of every controller, in sequence. Pass-level
    /// failures are logged; the tick keeps going.
    pub async fn sync_all(&self) {
        let controllers: Vec<Arc<dyn Controller>> =
            self.controllers.read().await.values().cloned().collect();
        for controller in controllers {
            if let Err(e) = controller.sync().await {
                error!("controller {} sync failed: {e:#}", controller.name());
            }
        }
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        for controller in self.controllers.read().await.values() {
            if let Err(e) = controller.stop().await {
                error!("controller {} stop failed: {e:#}", controller.name());
            }
        }
        info!("controller manager stopped");
    }
}

/// Shared shape of a controller's internal timer loop: tick, run one pass,
/// log failures, exit on cancellation.
pub(crate) fn spawn_reconcile_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    shutdown: CancellationToken,
    pass: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("{name} reconcile loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = pass().await {
                        error!("{name} reconcile pass failed: {e:#}");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingController {
        name: &'static str,
        started: AtomicBool,
        syncs: AtomicUsize,
    }

    impl CountingController {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                started: AtomicBool::new(false),
                syncs: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Controller for CountingController {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn start(&self, _shutdown: CancellationToken) -> Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.started.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn sync(&self) -> Result<()> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_runs_every_controller_and_refuses_double_start() {
        let manager = Arc::new(ControllerManager::new(Duration::from_secs(30)));
        let a = CountingController::new("a");
        let b = CountingController::new("b");
        manager.add_controller(a.clone()).await;
        manager.add_controller(b.clone()).await;

        let shutdown = CancellationToken::new();
        manager.start(shutdown.clone()).await.unwrap();
        assert!(a.started.load(Ordering::SeqCst));
        assert!(b.started.load(Ordering::SeqCst));

        assert!(manager.start(shutdown.clone()).await.is_err());

        manager.stop().await;
        assert!(!a.started.load(Ordering::SeqCst));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn sync_all_drives_each_controller_once() {
        let manager = Arc::new(ControllerManager::new(Duration::from_secs(30)));
        let a = CountingController::new("a");
        manager.add_controller(a.clone()).await;

        manager.sync_all().await;
        manager.sync_all().await;
        assert_eq!(a.syncs.load(Ordering::SeqCst), 2);
    }
}
