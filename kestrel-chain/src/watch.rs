//! Confirmation watching.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use kestrel_core::error::Result;
use kestrel_core::traits::ChainClient;
use kestrel_core::types::Txid;

/// How a wait ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Reached the requested depth (carries the observed depth).
    Confirmed(u32),
    /// The cancellation token fired first.
    Cancelled,
}

/// Polls a chain client until a transaction is buried deep enough.
///
/// Transient chain errors are logged and polling continues; anything else
/// ends the wait with that error.
#[derive(Clone)]
pub struct ConfirmationWatcher {
    client: Arc<dyn ChainClient>,
    poll_interval: Duration,
}

impl ConfirmationWatcher {
    /// Creates a watcher polling every `poll_interval`.
    pub fn new(client: Arc<dyn ChainClient>, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    /// Waits until `txid` has at least `depth` confirmations or `cancel` fires.
    #[instrument(skip_all, fields(txid = %txid, depth = depth))]
    pub async fn wait_for(
        &self,
        txid: Txid,
        depth: u32,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome> {
        loop {
            if cancel.is_cancelled() {
                info!("Confirmation wait cancelled");
                return Ok(WaitOutcome::Cancelled);
            }

            match self.client.get_confirmation_depth(&txid).await {
                Ok(seen) if seen >= depth => {
                    info!(confirmations = seen, "Transaction confirmed");
                    return Ok(WaitOutcome::Confirmed(seen));
                }
                Ok(seen) => debug!(confirmations = seen, target = depth, "Waiting for confirmations"),
                Err(e) if e.is_recoverable() => warn!(error = %e, "Confirmation poll failed"),
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => {
                    info!("Confirmation wait cancelled during sleep");
                    return Ok(WaitOutcome::Cancelled);
                }
            }
        }
    }
}

impl std::fmt::Debug for ConfirmationWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationWatcher")
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryChain;
    use kestrel_core::error::KestrelError;
    use kestrel_address::Address;
    use kestrel_core::types::{Network, ScriptType};

    fn regtest_address() -> Address {
        Address::from_payload(Network::Regtest, ScriptType::P2wpkh, &[0x3c; 20]).unwrap()
    }

    #[tokio::test]
    async fn test_confirms_after_mining() {
        let chain = Arc::new(MemoryChain::new(Network::Regtest));
        let (outpoint, _) = chain.fund(&regtest_address(), 10_000).unwrap();
        let watcher = ConfirmationWatcher::new(chain.clone(), Duration::from_millis(5));

        let miner = {
            let chain = chain.clone();
            tokio::spawn(async move {
                for _ in 0..3 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    chain.mine(1);
                }
            })
        };

        let outcome = watcher
            .wait_for(outpoint.txid, 3, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Confirmed(3));
        miner.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation() {
        let chain = Arc::new(MemoryChain::new(Network::Regtest));
        let (outpoint, _) = chain.fund(&regtest_address(), 10_000).unwrap();
        let watcher = ConfirmationWatcher::new(chain, Duration::from_secs(30));

        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });

        let outcome = watcher.wait_for(outpoint.txid, 1, &token).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_txid_is_an_error() {
        let chain = Arc::new(MemoryChain::new(Network::Regtest));
        let watcher = ConfirmationWatcher::new(chain, Duration::from_millis(5));
        let err = watcher
            .wait_for(Txid::from_bytes([9; 32]), 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::NotFound { .. }));
    }
}
