//! Runtime supervision.
//!
//! The [`Scheduler`] owns every moving part of the daemon: the database
//! gateway, the chains channel, the worker pool, both intake loops and the
//! coordination state (active-chain registry and execution latch). One call
//! to [`Scheduler::run`] covers the life of one database attachment; the
//! binary re-enters it after a reconnect.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::builtins::BuiltinRegistry;
use crate::command::{Commander, TokioCommander};
use crate::config::Config;
use crate::db::{Chain, Database};
use crate::worker::ActiveChains;

/// Why [`Scheduler::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The root token was cancelled; the daemon is shutting down.
    Shutdown,
    /// The notification stream ended; reconnect, repair and run again.
    ConnectionDropped,
}

/// The scheduling daemon runtime.
pub struct Scheduler<C: Commander = TokioCommander> {
    pub(crate) db: Database,
    pub(crate) config: Config,
    pub(crate) commander: Arc<C>,
    pub(crate) builtins: Arc<BuiltinRegistry>,
    pub(crate) active_chains: ActiveChains,
    pub(crate) exclusive_latch: Arc<RwLock<()>>,
    pub(crate) chains_tx: mpsc::Sender<Chain>,
    pub(crate) chains_rx: Arc<Mutex<mpsc::Receiver<Chain>>>,
}

impl<C: Commander> Clone for Scheduler<C> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            config: self.config.clone(),
            commander: Arc::clone(&self.commander),
            builtins: Arc::clone(&self.builtins),
            active_chains: self.active_chains.clone(),
            exclusive_latch: Arc::clone(&self.exclusive_latch),
            chains_tx: self.chains_tx.clone(),
            chains_rx: Arc::clone(&self.chains_rx),
        }
    }
}

impl<C: Commander + 'static> Scheduler<C> {
    pub fn new(db: Database, config: Config, commander: C) -> Self {
        let (chains_tx, chains_rx) = mpsc::channel(config.cron_workers.max(1));
        Self {
            db,
            config,
            commander: Arc::new(commander),
            builtins: Arc::new(BuiltinRegistry::default()),
            active_chains: ActiveChains::default(),
            exclusive_latch: Arc::new(RwLock::new(())),
            chains_tx,
            chains_rx: Arc::new(Mutex::new(chains_rx)),
        }
    }

    /// Replace the built-in task table.
    pub fn with_builtins(mut self, builtins: BuiltinRegistry) -> Self {
        self.builtins = Arc::new(builtins);
        self
    }

    /// Registry of in-flight chain executions.
    pub fn active_chains(&self) -> &ActiveChains {
        &self.active_chains
    }

    /// Run the daemon until the root token cancels or the notification
    /// stream drops.
    ///
    /// Acquires the client-name advisory lock (with backoff), repairs
    /// run-status residue from a prior crash, then starts both intakes and
    /// the worker pool. On either exit path the in-flight chains are
    /// cancelled and drained before returning.
    pub async fn run(&self, root: &CancellationToken) -> RunStatus {
        if self
            .db
            .try_lock_client_name(
                root,
                self.config.lock_wait_time,
                self.config.lock_max_wait_time,
            )
            .await
            .is_err()
        {
            // Only cancellation escapes the backoff loop.
            return RunStatus::Shutdown;
        }

        // A failure here is logged by the gateway; a broken connection will
        // surface again through the notification stream.
        let _ = self.db.fix_scheduler_crash().await;

        let local = root.child_token();

        let mut workers = Vec::with_capacity(self.config.cron_workers);
        for worker_id in 0..self.config.cron_workers {
            let scheduler = self.clone();
            let worker_token = local.clone();
            let fut: Pin<Box<dyn Future<Output = ()> + Send>> =
                Box::pin(async move { scheduler.chain_worker(worker_token, worker_id).await });
            workers.push(tokio::spawn(fut));
        }
        let scheduled_scheduler = self.clone();
        let scheduled_token = local.clone();
        let scheduled_fut: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
            scheduled_scheduler.scheduled_intake(scheduled_token).await
        });
        let scheduled = tokio::spawn(scheduled_fut);
        let async_scheduler = self.clone();
        let async_token = local.clone();
        let async_fut: Pin<Box<dyn Future<Output = ()> + Send>> =
            Box::pin(async move { async_scheduler.async_intake(async_token).await });
        let mut notifications = tokio::spawn(async_fut);

        info!(
            workers = self.config.cron_workers,
            client = %self.config.client_name,
            "scheduler started"
        );

        let status = tokio::select! {
            biased;
            _ = root.cancelled() => RunStatus::Shutdown,
            _ = &mut notifications => {
                warn!("notification stream ended, scheduling reconnect");
                RunStatus::ConnectionDropped
            }
        };

        local.cancel();
        self.terminate_chains().await;
        let _ = scheduled.await;
        if status == RunStatus::Shutdown {
            let _ = notifications.await;
        }
        for worker in workers {
            let _ = worker.await;
        }
        if status == RunStatus::Shutdown {
            self.db.release_client_name_lock().await;
        }
        info!(?status, "scheduler run finished");
        status
    }
}
