//! Background task failing expired HTLCs and advancing channels on chain.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kestrel_core::error::Result;

use crate::manager::{ChannelManager, PollReport, SweepReport};

/// Periodically sweeps expired HTLCs and polls channel transactions.
#[derive(Clone, Debug)]
pub struct HtlcSweeper {
    manager: Arc<ChannelManager>,
    interval: Duration,
}

impl HtlcSweeper {
    /// Creates a sweeper running every `interval`.
    pub fn new(manager: Arc<ChannelManager>, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// One pass at the current chain height.
    pub async fn run_once(&self) -> Result<(SweepReport, PollReport)> {
        let height = self.manager.chain().get_block_height().await?;
        let swept = self.manager.sweep_expired(height).await?;
        let polled = self.manager.poll_chain().await?;
        debug!(
            height,
            failed = swept.failed.len(),
            opened = polled.opened.len(),
            closed = polled.closed.len(),
            "Sweep pass done"
        );
        Ok((swept, polled))
    }

    /// Runs until `cancel` fires. A failed pass is logged and retried on the
    /// next tick.
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "HTLC sweeper started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self.run_once().await {
                warn!(error = %e, "Sweep pass failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("HTLC sweeper stopped");
    }

    /// Spawns [`run`](Self::run) on the current runtime.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use kestrel_chain::MemoryChain;
    use kestrel_core::types::Network;
    use kestrel_crypto::{ExtendedPrivateKey, Seed};
    use kestrel_store::MemoryRepository;
    use kestrel_tx::UtxoReservations;

    use crate::config::ChannelConfig;
    use crate::funder::KeyFunder;

    fn manager() -> Arc<ChannelManager> {
        let key = ExtendedPrivateKey::from_seed(&Seed::from_bytes(&[1; 32]).unwrap()).unwrap();
        let funder = KeyFunder::new(key.clone(), Network::Regtest, Arc::new(UtxoReservations::new()))
            .unwrap();
        Arc::new(ChannelManager::new(
            ChannelConfig::default(),
            Network::Regtest,
            key,
            Arc::new(MemoryChain::new(Network::Regtest)),
            Arc::new(MemoryRepository::new()),
            Arc::new(funder),
        ))
    }

    #[tokio::test]
    async fn test_run_once_without_channels() {
        let sweeper = HtlcSweeper::new(manager(), Duration::from_millis(10));
        let (swept, polled) = sweeper.run_once().await.unwrap();
        assert_eq!(swept, SweepReport::default());
        assert_eq!(polled, PollReport::default());
    }

    #[tokio::test]
    async fn test_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let handle = HtlcSweeper::new(manager(), Duration::from_millis(10)).spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
