//! Fan-out and supervision of consumer workers.
//!
//! `run_consume` spawns the configured number of workers for every
//! registered subscription and then parks on the pool's error signal. The
//! first transport failure tears the whole connection pool down, rebuilds
//! it, and respawns every worker; failures reported while a rebuild is in
//! flight are dropped by the coalescing flag in `set_connect_error`.

use crate::consumers::worker::consume_task;
use crate::pool::{RabbitPool, RECONNECT_BACKOFF};
use anyhow::Context;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};

impl RabbitPool {
    /// Serve every registered subscription until the process exits.
    ///
    /// Fails fast when no subscriptions are registered or when the runtime is
    /// already serving this pool. Transport failures never surface here; they
    /// are absorbed by rebuild-and-respawn cycles.
    pub async fn run_consume(self: Arc<Self>) -> Result<(), anyhow::Error> {
        let subscriptions = self.subscriptions();
        if subscriptions.is_empty() {
            anyhow::bail!("no subscriptions registered; call register_subscription first");
        }
        let mut error_rx = self
            .take_error_receiver()
            .context("the consumer runtime is already serving this pool")?;

        loop {
            let workers = self.max_consume_channels();
            for subscription in &subscriptions {
                for slot in 0..workers {
                    tokio::spawn(consume_task(
                        slot,
                        Arc::clone(&self),
                        Arc::clone(subscription),
                    ));
                }
            }

            match error_rx.recv().await {
                Some(signal) => {
                    warn!(
                        code = signal.code().value(),
                        reason = signal.message(),
                        "consumer transport failure; rebuilding connection pool"
                    );
                    self.rebuild_after_failure().await;
                }
                // The sender lives on the pool, so this only happens while
                // tearing the process down.
                None => return Ok(()),
            }
        }
    }

    /// Probe the broker until it answers, then rebuild every connection.
    ///
    /// The rebuild flag stays up for the whole cycle so late failure signals
    /// from the dying worker generation are dropped; it is lowered only once
    /// the new connection set is in place.
    async fn rebuild_after_failure(&self) {
        loop {
            let attempt = self.consume_current_retry.fetch_add(1, Ordering::Relaxed) + 1;
            info!(attempt, "probing broker in 2s");
            tokio::time::sleep(RECONNECT_BACKOFF).await;

            let Ok(factory) = self.factory() else {
                continue;
            };
            match factory.new_connection().await {
                Ok(probe) => {
                    let _ = probe.close().await;
                    match self.init_connections().await {
                        Ok(()) => {
                            self.finish_rebuild();
                            info!("connection pool rebuilt; respawning workers");
                            return;
                        }
                        Err(e) => warn!(error = %e, "pool rebuild failed; probing again"),
                    }
                }
                Err(e) => {
                    if attempt > self.consume_max_retries() {
                        error!(error = %e, attempt, "broker still unreachable");
                    } else {
                        warn!(error = %e, attempt, "broker still unreachable");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_consume_without_subscriptions_fails() {
        let pool = Arc::new(RabbitPool::consumer());

        let error = pool.run_consume().await.unwrap_err();

        assert!(error.to_string().contains("no subscriptions registered"));
    }
}
