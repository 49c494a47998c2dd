//! In-memory repository.
//!
//! Thread-safe storage for tests, the CLI demo and single-process
//! deployments that do not need durability.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use kestrel_core::error::Result;
use kestrel_core::traits::WalletRepository;
use kestrel_core::types::{ChannelId, ChannelRecord, WalletId, WalletMetadata};

/// Everything a repository holds, as one serializable value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Wallets, oldest first
    pub wallets: Vec<WalletMetadata>,
    /// Channels ordered by id
    pub channels: Vec<ChannelRecord>,
}

/// Repository backed by two concurrent maps.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    wallets: DashMap<WalletId, WalletMetadata>,
    channels: DashMap<ChannelId, ChannelRecord>,
}

impl MemoryRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored wallets.
    pub fn wallet_count(&self) -> usize {
        self.wallets.len()
    }

    /// Number of stored channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Removes everything.
    pub fn clear(&self) {
        self.wallets.clear();
        self.channels.clear();
    }

    /// Copies the current contents.
    pub fn snapshot(&self) -> Snapshot {
        let mut wallets: Vec<WalletMetadata> =
            self.wallets.iter().map(|e| e.value().clone()).collect();
        wallets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut channels: Vec<ChannelRecord> =
            self.channels.iter().map(|e| e.value().clone()).collect();
        channels.sort_by_key(|c| c.id);

        Snapshot { wallets, channels }
    }

    /// Replaces the contents with `snapshot`.
    pub fn restore(&self, snapshot: Snapshot) {
        self.clear();
        for wallet in snapshot.wallets {
            self.wallets.insert(wallet.id, wallet);
        }
        for channel in snapshot.channels {
            self.channels.insert(channel.id, channel);
        }
    }
}

#[async_trait]
impl WalletRepository for MemoryRepository {
    #[instrument(skip_all, fields(wallet = %metadata.id))]
    async fn save_wallet_metadata(&self, metadata: &WalletMetadata) -> Result<()> {
        self.wallets.insert(metadata.id, metadata.clone());
        debug!("Wallet metadata saved");
        Ok(())
    }

    async fn load_wallet_metadata(&self, id: &WalletId) -> Result<Option<WalletMetadata>> {
        Ok(self.wallets.get(id).map(|e| e.value().clone()))
    }

    async fn list_wallets(&self) -> Result<Vec<WalletMetadata>> {
        Ok(self.snapshot().wallets)
    }

    async fn delete_wallet(&self, id: &WalletId) -> Result<bool> {
        Ok(self.wallets.remove(id).is_some())
    }

    #[instrument(skip_all, fields(channel = %record.id, version = record.commitment.version))]
    async fn save_channel_state(&self, record: &ChannelRecord) -> Result<()> {
        self.channels.insert(record.id, record.clone());
        debug!("Channel state saved");
        Ok(())
    }

    async fn load_channel_state(&self, id: &ChannelId) -> Result<Option<ChannelRecord>> {
        Ok(self.channels.get(id).map(|e| e.value().clone()))
    }

    async fn list_channels(&self) -> Result<Vec<ChannelRecord>> {
        let mut channels: Vec<ChannelRecord> =
            self.channels.iter().map(|e| e.value().clone()).collect();
        channels.sort_by_key(|c| c.id);
        Ok(channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{channel, wallet};

    #[tokio::test]
    async fn test_wallet_round_trip() {
        let repo = MemoryRepository::new();
        let w = wallet("alice");
        repo.save_wallet_metadata(&w).await.unwrap();

        assert_eq!(repo.load_wallet_metadata(&w.id).await.unwrap(), Some(w.clone()));
        assert_eq!(repo.list_wallets().await.unwrap().len(), 1);
        assert!(repo.delete_wallet(&w.id).await.unwrap());
        assert!(!repo.delete_wallet(&w.id).await.unwrap());
        assert_eq!(repo.load_wallet_metadata(&w.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_channel_save_replaces() {
        let repo = MemoryRepository::new();
        let mut c = channel(1);
        repo.save_channel_state(&c).await.unwrap();

        c.commitment.version = 4;
        repo.save_channel_state(&c).await.unwrap();

        let loaded = repo.load_channel_state(&c.id).await.unwrap().unwrap();
        assert_eq!(loaded.commitment.version, 4);
        assert_eq!(repo.channel_count(), 1);
    }

    #[tokio::test]
    async fn test_listing_is_ordered() {
        let repo = MemoryRepository::new();
        for n in [3u8, 1, 2] {
            repo.save_channel_state(&channel(n)).await.unwrap();
        }
        let ids: Vec<ChannelId> = repo.list_channels().await.unwrap().iter().map(|c| c.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let repo = MemoryRepository::new();
        repo.save_wallet_metadata(&wallet("a")).await.unwrap();
        repo.save_channel_state(&channel(7)).await.unwrap();

        let copy = MemoryRepository::new();
        copy.restore(repo.snapshot());
        assert_eq!(copy.snapshot(), repo.snapshot());
    }
}
