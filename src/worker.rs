//! Chain workers.
//!
//! A fixed pool of workers drains the bounded chains channel. Each worker
//! runs a priority select so that shutdown always wins over an available
//! chain, then wraps every execution in the admission check, the
//! exclusive/shared latch and the active-chain registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::command::Commander;
use crate::db::Chain;
use crate::supervisor::Scheduler;

/// Registry of in-flight chain executions, keyed by configuration id.
///
/// An entry exists exactly while a worker is executing the chain; STOP
/// signals cancel through the stored token.
#[derive(Clone, Default)]
pub struct ActiveChains {
    inner: Arc<Mutex<HashMap<i32, CancellationToken>>>,
}

impl ActiveChains {
    pub fn insert(&self, config_id: i32, token: CancellationToken) {
        self.inner
            .lock()
            .expect("active chain registry poisoned")
            .insert(config_id, token);
    }

    pub fn remove(&self, config_id: i32) {
        self.inner
            .lock()
            .expect("active chain registry poisoned")
            .remove(&config_id);
    }

    /// Cancel the in-flight execution of a chain. Returns false when the
    /// chain is not currently active.
    pub fn cancel(&self, config_id: i32) -> bool {
        let guard = self.inner.lock().expect("active chain registry poisoned");
        match guard.get(&config_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight execution.
    pub fn cancel_all(&self) {
        let guard = self.inner.lock().expect("active chain registry poisoned");
        for (config_id, token) in guard.iter() {
            debug!(chain = config_id, "terminating chain");
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("active chain registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Guard holding the process-wide execution latch for one chain.
pub(crate) enum LatchGuard {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// Hand a chain to the workers without blocking. A full channel drops the
/// chain with an error; the next scheduled poll re-presents it.
pub(crate) fn offer_chain(chains: &mpsc::Sender<Chain>, chain: Chain) {
    let config_id = chain.config_id;
    match chains.try_send(chain) {
        Ok(()) => debug!(chain = config_id, "chain sent to the execution channel"),
        Err(mpsc::error::TrySendError::Full(_)) => {
            error!(chain = config_id, "chains channel full, dropping chain");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error!(chain = config_id, "chains channel closed, dropping chain");
        }
    }
}

impl<C: Commander + 'static> Scheduler<C> {
    /// Worker loop: consume chains until the token fires or the channel
    /// closes. The cancellation check has priority over available chains.
    pub(crate) async fn chain_worker(self, token: CancellationToken, worker_id: usize) {
        debug!(worker = worker_id, "chain worker started");
        loop {
            if token.is_cancelled() {
                break;
            }
            let chain = {
                let mut chains = self.chains_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    received = chains.recv() => match received {
                        Some(chain) => chain,
                        None => break,
                    },
                }
            };
            Box::pin(self.run_chain(&token, chain)).await;
        }
        debug!(worker = worker_id, "chain worker stopped");
    }

    async fn run_chain(&self, token: &CancellationToken, chain: Chain) {
        let run_id = match self.db.insert_chain_run_status(token, &chain).await {
            Ok(Some(run_id)) => run_id,
            Ok(None) => {
                info!(chain = chain.config_id, "cannot proceed, execution cap reached");
                return;
            }
            Err(_) => return,
        };
        info!(
            chain = chain.config_id,
            name = %chain.chain_name,
            exclusive = chain.exclusive_execution,
            reboot = chain.reboot,
            "starting chain"
        );
        let _latch = self.acquire_latch(chain.exclusive_execution).await;
        let chain_token = token.child_token();
        self.active_chains.insert(chain.config_id, chain_token.clone());
        self.execute_chain(&chain_token, &chain, run_id).await;
        self.active_chains.remove(chain.config_id);
        chain_token.cancel();
    }

    /// Take the execution latch: any number of shared holders, or one
    /// exclusive holder running alone.
    pub(crate) async fn acquire_latch(&self, exclusive: bool) -> LatchGuard {
        if exclusive {
            LatchGuard::Exclusive(self.exclusive_latch.clone().write_owned().await)
        } else {
            LatchGuard::Shared(self.exclusive_latch.clone().read_owned().await)
        }
    }

    /// Cancel every active chain, then poll until the registry drains.
    pub(crate) async fn terminate_chains(&self) {
        self.active_chains.cancel_all();
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let still_active = self.active_chains.len();
            if still_active == 0 {
                return;
            }
            debug!(count = still_active, "waiting for active chains to stop");
        }
    }
}
