//! Chain intake.
//!
//! Two producers feed the chains channel: a periodic poll of the cron
//! schedule (plus one reboot-chain fetch at startup) and the asynchronous
//! START/STOP signal stream. The async intake returning is the signal that
//! the database connection dropped.

use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::Commander;
use crate::db::SignalCommand;
use crate::supervisor::Scheduler;
use crate::worker::offer_chain;

/// Delay between sends when a scheduled batch is large enough to spread
/// over the refetch window instead of spiking the workers.
pub(crate) fn spread_delay(
    count: usize,
    cron_workers: usize,
    refetch_timeout: u64,
) -> Option<Duration> {
    if count as u64 > cron_workers as u64 * refetch_timeout {
        Some(Duration::from_millis(refetch_timeout * 1000 / count as u64))
    } else {
        None
    }
}

impl<C: Commander + 'static> Scheduler<C> {
    /// Periodic scheduled-chain fetcher. Runs the reboot chains once at
    /// startup, then polls on the configured interval.
    pub(crate) async fn scheduled_intake(self, token: CancellationToken) {
        self.fetch_and_enqueue(&token, true).await;

        let mut ticker = interval_at(
            Instant::now() + self.config.poll_interval,
            self.config.poll_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = ticker.tick() => self.fetch_and_enqueue(&token, false).await,
            }
        }
    }

    async fn fetch_and_enqueue(&self, token: &CancellationToken, reboot: bool) {
        let fetched = if reboot {
            self.db.select_reboot_chains(token).await
        } else {
            self.db.select_chains(token).await
        };
        let chains = match fetched {
            Ok(chains) => chains,
            // Already logged by the gateway; the next poll retries.
            Err(_) => return,
        };
        info!(count = chains.len(), reboot, "retrieved scheduled chains to run");

        let delay = spread_delay(
            chains.len(),
            self.config.cron_workers,
            self.config.refetch_timeout,
        );
        for chain in chains {
            if token.is_cancelled() {
                return;
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.send_chain(chain);
        }
    }

    pub(crate) fn send_chain(&self, chain: crate::db::Chain) {
        offer_chain(&self.chains_tx, chain);
    }

    /// Consume START/STOP signals until the stream terminates. Returning
    /// reports the dropped connection to the supervisor.
    pub(crate) async fn async_intake(self, token: CancellationToken) {
        let mut listener = match self.db.signal_listener().await {
            Ok(listener) => listener,
            Err(err) => {
                error!(error = %err, "cannot open the chain signal stream");
                return;
            }
        };
        loop {
            let signal = listener.wait(&token).await;
            if signal.is_closed() {
                return;
            }
            match signal.command {
                SignalCommand::Start => {
                    match self.db.select_chain(&token, signal.config_id).await {
                        Ok(Some(chain)) => self.send_chain(chain),
                        Ok(None) => {
                            warn!(chain = signal.config_id, "no live chain for START signal");
                        }
                        // Logged by the gateway; keep consuming signals.
                        Err(_) => {}
                    }
                }
                SignalCommand::Stop => {
                    if !self.active_chains.cancel(signal.config_id) {
                        debug!(chain = signal.config_id, "STOP for a chain that is not active");
                    }
                }
            }
        }
    }
}
