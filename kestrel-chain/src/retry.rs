//! Retry with exponential backoff around any [`ChainClient`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use kestrel_core::error::{KestrelError, Result};
use kestrel_core::traits::ChainClient;
use kestrel_core::types::{Txid, Utxo};

/// Retry schedule for chain calls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Growth factor between retries
    pub multiplier: u32,
    /// Upper bound on a single delay
    pub max_delay_ms: u64,
    /// Per-call timeout
    pub call_timeout_ms: u64,
    /// Add up to 10% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 200,
            multiplier: 2,
            max_delay_ms: 5_000,
            call_timeout_ms: 10_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Sets the attempt budget.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets initial delay, multiplier and cap.
    pub fn with_backoff(mut self, initial_ms: u64, multiplier: u32, max_ms: u64) -> Self {
        self.initial_delay_ms = initial_ms;
        self.multiplier = multiplier.max(1);
        self.max_delay_ms = max_ms;
        self
    }

    /// Sets the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = (self.multiplier as u64).saturating_pow(attempt - 1);
        let capped = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);

        let jitter = match capped / 10 {
            range if self.jitter && range > 0 => rand::thread_rng().gen_range(0..range),
            _ => 0,
        };
        Duration::from_millis(capped + jitter)
    }

    /// Per-call timeout.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Runs `op` until it succeeds, fails with a non-recoverable error, or the
    /// attempt budget runs out. The last error is returned.
    pub async fn run<T, F, Fut>(&self, name: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.call_timeout();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(KestrelError::ConnectionTimeout(format!(
                    "{} exceeded {:?}",
                    name, timeout
                ))),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(call = name, attempt, "Chain call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_recoverable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        call = name,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Chain call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A [`ChainClient`] that retries recoverable failures of an inner client.
#[derive(Clone)]
pub struct RetryingChainClient {
    inner: Arc<dyn ChainClient>,
    policy: RetryPolicy,
}

impl RetryingChainClient {
    /// Wraps `inner` with `policy`.
    pub fn new(inner: Arc<dyn ChainClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Active policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl ChainClient for RetryingChainClient {
    async fn broadcast_transaction(&self, raw: &[u8]) -> Result<Txid> {
        self.policy
            .run("broadcast_transaction", || self.inner.broadcast_transaction(raw))
            .await
    }

    async fn get_utxo_set(&self, address: &str) -> Result<Vec<Utxo>> {
        self.policy
            .run("get_utxo_set", || self.inner.get_utxo_set(address))
            .await
    }

    async fn get_confirmation_depth(&self, txid: &Txid) -> Result<u32> {
        self.policy
            .run("get_confirmation_depth", || self.inner.get_confirmation_depth(txid))
            .await
    }

    async fn get_block_height(&self) -> Result<u32> {
        self.policy
            .run("get_block_height", || self.inner.get_block_height())
            .await
    }
}

impl std::fmt::Debug for RetryingChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingChainClient")
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use test_case::test_case;

    /// Fails the first `failures` calls with the error built by `make_error`.
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        make_error: fn() -> KestrelError,
        hang: bool,
    }

    impl Flaky {
        fn new(failures: u32, make_error: fn() -> KestrelError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures,
                make_error,
                hang: false,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChainClient for Flaky {
        async fn broadcast_transaction(&self, _raw: &[u8]) -> Result<Txid> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if n < self.failures {
                Err((self.make_error)())
            } else {
                Ok(Txid::from_bytes([n as u8; 32]))
            }
        }

        async fn get_utxo_set(&self, _address: &str) -> Result<Vec<Utxo>> {
            Ok(Vec::new())
        }

        async fn get_confirmation_depth(&self, _txid: &Txid) -> Result<u32> {
            Ok(0)
        }

        async fn get_block_height(&self) -> Result<u32> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err((self.make_error)())
            } else {
                Ok(100)
            }
        }
    }

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(attempts)
            .with_backoff(1, 2, 4)
            .with_jitter(false)
    }

    #[test]
    fn test_delay_schedule() {
        let policy = RetryPolicy::default().with_backoff(100, 2, 1_000).with_jitter(false);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_millis(1_000));

        let jittered = RetryPolicy::default().with_backoff(100, 2, 1_000);
        let d = jittered.delay_for(2).as_millis();
        assert!((200..220).contains(&d));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let flaky = Flaky::new(2, || KestrelError::BroadcastFailed("node busy".into()));
        let client = RetryingChainClient::new(flaky.clone(), fast(5));
        let txid = client.broadcast_transaction(&[0x02]).await.unwrap();
        assert_eq!(txid, Txid::from_bytes([2; 32]));
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn test_stops_at_max_attempts() {
        let flaky = Flaky::new(10, || KestrelError::RpcError("connection refused".into()));
        let client = RetryingChainClient::new(flaky.clone(), fast(3));
        let err = client.get_block_height().await.unwrap_err();
        assert!(matches!(err, KestrelError::RpcError(_)));
        assert_eq!(flaky.calls(), 3);
    }

    #[test_case(|| KestrelError::TransactionRejected("bad-txns-inputs-missingorspent".into()) ; "rejected")]
    #[test_case(|| KestrelError::ValidationError("bad input".into()) ; "validation")]
    #[test_case(|| KestrelError::IntegrityViolation("broken".into()) ; "integrity")]
    fn test_never_retries_non_network_errors(make_error: fn() -> KestrelError) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let flaky = Flaky::new(10, make_error);
            let client = RetryingChainClient::new(flaky.clone(), fast(5));
            assert!(client.broadcast_transaction(&[]).await.is_err());
            assert_eq!(flaky.calls(), 1);
        });
    }

    #[tokio::test]
    async fn test_call_timeout_is_recoverable() {
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            failures: 0,
            make_error: || KestrelError::RpcError(String::new()),
            hang: true,
        });
        let policy = fast(2).with_call_timeout(Duration::from_millis(10));
        let client = RetryingChainClient::new(flaky.clone(), policy);
        let err = client.broadcast_transaction(&[]).await.unwrap_err();
        assert!(matches!(err, KestrelError::ConnectionTimeout(_)));
        assert_eq!(flaky.calls(), 2);
    }
}
