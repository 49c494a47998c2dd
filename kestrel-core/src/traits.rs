//! Collaborator traits for Kestrel.
//!
//! The engine consumes two external services: a chain backend and a
//! persistence layer. Both are async and object-safe so they can be shared as
//! `Arc<dyn ...>` across wallets, channels and background tasks.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ChannelId, ChannelRecord, Txid, Utxo, WalletId, WalletMetadata};

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN TRAIT
// ═══════════════════════════════════════════════════════════════════════════════

/// Interface to a chain backend (node RPC, indexer, or an in-memory chain).
///
/// Every call is fallible and may be slow; callers wrap it in a retry policy and
/// never hold a wallet or channel lock across it.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Broadcasts a serialized transaction and returns its txid.
    async fn broadcast_transaction(&self, raw: &[u8]) -> Result<Txid>;

    /// Returns the unspent outputs paying `address`.
    async fn get_utxo_set(&self, address: &str) -> Result<Vec<Utxo>>;

    /// Returns the confirmation depth of `txid` (0 while in the mempool).
    async fn get_confirmation_depth(&self, txid: &Txid) -> Result<u32>;

    /// Returns the current tip height.
    async fn get_block_height(&self) -> Result<u32>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// REPOSITORY TRAIT
// ═══════════════════════════════════════════════════════════════════════════════

/// Persistence for non-secret wallet and channel state.
///
/// Implementations might use:
/// - In-memory storage (for testing/development)
/// - A JSON file (single-node deployments)
/// - A database
///
/// Each `save_*` call is one committed transition; implementations must make it
/// atomic.
#[async_trait]
pub trait WalletRepository: Send + Sync {
    /// Inserts or replaces wallet metadata.
    async fn save_wallet_metadata(&self, metadata: &WalletMetadata) -> Result<()>;

    /// Loads wallet metadata by id.
    async fn load_wallet_metadata(&self, id: &WalletId) -> Result<Option<WalletMetadata>>;

    /// Lists all stored wallets.
    async fn list_wallets(&self) -> Result<Vec<WalletMetadata>>;

    /// Removes a wallet. Returns true if it existed.
    async fn delete_wallet(&self, id: &WalletId) -> Result<bool>;

    /// Inserts or replaces a channel's committed state.
    async fn save_channel_state(&self, record: &ChannelRecord) -> Result<()>;

    /// Loads a channel's committed state.
    async fn load_channel_state(&self, id: &ChannelId) -> Result<Option<ChannelRecord>>;

    /// Lists all stored channels.
    async fn list_channels(&self) -> Result<Vec<ChannelRecord>>;
}
