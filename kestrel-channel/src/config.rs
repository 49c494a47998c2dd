//! Channel manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use kestrel_core::constants::{
    DEFAULT_CLOSING_FEE, DEFAULT_MIN_FINAL_CLTV, DEFAULT_MIN_FUNDING_DEPTH, DEFAULT_TO_SELF_DELAY,
};

/// Routing fees and CLTV margin we charge for forwarding over a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPolicy {
    /// Flat fee per forwarded HTLC
    pub base_fee: u64,
    /// Proportional fee in parts per million
    pub fee_ppm: u64,
    /// Blocks added to the expiry of a forwarded HTLC
    pub cltv_delta: u32,
}

impl RelayPolicy {
    /// Fee for forwarding `amount`. `None` on overflow.
    pub fn fee_for(&self, amount: u64) -> Option<u64> {
        let proportional = (amount as u128 * self.fee_ppm as u128 / 1_000_000) as u64;
        self.base_fee.checked_add(proportional)
    }
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            base_fee: 1_000,
            fee_ppm: 100,
            cltv_delta: 40,
        }
    }
}

/// Channel configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Confirmations before a funded channel opens
    pub min_funding_depth: u32,
    /// Dispute window after a force close, in blocks
    pub to_self_delay: u32,
    /// Upper bound on waiting for a counterparty response
    pub countersign_timeout_ms: u64,
    /// Fee of the commitment transaction, paid by the funder
    pub commitment_fee: u64,
    /// Fee of the cooperative settlement, paid by the funder
    pub closing_fee: u64,
    /// Smallest channel we open
    pub min_capacity: u64,
    /// Most HTLCs pending on one channel at once
    pub max_pending_htlcs: usize,
    /// CLTV margin required by the final hop
    pub min_final_cltv: u32,
    /// Poll interval while waiting for funding confirmations
    pub funding_poll_ms: u64,
    /// Fees advertised for our channels
    pub relay: RelayPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            min_funding_depth: DEFAULT_MIN_FUNDING_DEPTH,
            to_self_delay: DEFAULT_TO_SELF_DELAY,
            countersign_timeout_ms: 5_000,
            commitment_fee: 500,
            closing_fee: DEFAULT_CLOSING_FEE,
            min_capacity: 20_000,
            max_pending_htlcs: 30,
            min_final_cltv: DEFAULT_MIN_FINAL_CLTV,
            funding_poll_ms: 1_000,
            relay: RelayPolicy::default(),
        }
    }
}

impl ChannelConfig {
    /// Sets the funding depth.
    pub fn with_min_funding_depth(mut self, depth: u32) -> Self {
        self.min_funding_depth = depth;
        self
    }

    /// Sets the dispute window.
    pub fn with_to_self_delay(mut self, blocks: u32) -> Self {
        self.to_self_delay = blocks;
        self
    }

    /// Sets the counterparty response timeout.
    pub fn with_countersign_timeout(mut self, timeout: Duration) -> Self {
        self.countersign_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the cooperative close fee.
    pub fn with_closing_fee(mut self, fee: u64) -> Self {
        self.closing_fee = fee;
        self
    }

    /// Sets the funding poll interval.
    pub fn with_funding_poll(mut self, interval: Duration) -> Self {
        self.funding_poll_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the advertised relay policy.
    pub fn with_relay_policy(mut self, relay: RelayPolicy) -> Self {
        self.relay = relay;
        self
    }

    /// Counterparty response timeout.
    pub fn countersign_timeout(&self) -> Duration {
        Duration::from_millis(self.countersign_timeout_ms)
    }

    /// Funding poll interval.
    pub fn funding_poll(&self) -> Duration {
        Duration::from_millis(self.funding_poll_ms)
    }
}
