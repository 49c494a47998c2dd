//! File-backed repository.
//!
//! Keeps a [`MemoryRepository`] as the working set and rewrites the whole
//! file after every committed change.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use kestrel_core::error::{KestrelError, Result};
use kestrel_core::traits::WalletRepository;
use kestrel_core::types::{ChannelId, ChannelRecord, WalletId, WalletMetadata};

use crate::memory::{MemoryRepository, Snapshot};

/// File format magic bytes
const MAGIC: &[u8; 4] = b"KSTR";
/// Current file format version
const VERSION: u8 = 1;
const HEADER_LEN: usize = 5;

/// Durable repository in a single file.
///
/// # File Format
///
/// ```text
/// magic (4 bytes): "KSTR"
/// version (1 byte): 1
/// body (variable): JSON snapshot { wallets, channels }
/// ```
///
/// Writes go to `<path>.tmp` and are renamed over the file, so a crash leaves
/// either the old or the new contents.
pub struct FileRepository {
    path: PathBuf,
    memory: MemoryRepository,
    write_lock: Mutex<()>,
}

impl FileRepository {
    /// Opens the repository at `path`, loading it if the file exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let repo = Self {
            path: path.as_ref().to_path_buf(),
            memory: MemoryRepository::new(),
            write_lock: Mutex::new(()),
        };
        if fs::try_exists(&repo.path).await? {
            repo.load().await?;
        }
        Ok(repo)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[instrument(skip(self), fields(path = ?self.path))]
    async fn load(&self) -> Result<()> {
        let contents = fs::read(&self.path).await?;
        if contents.len() < HEADER_LEN {
            return Err(KestrelError::StorageError("file too short".into()));
        }
        if &contents[..4] != MAGIC {
            return Err(KestrelError::StorageError("invalid magic bytes".into()));
        }
        if contents[4] != VERSION {
            return Err(KestrelError::VersionMismatch {
                expected: VERSION,
                actual: contents[4],
            });
        }

        let snapshot: Snapshot = serde_json::from_slice(&contents[HEADER_LEN..])
            .map_err(|e| KestrelError::StorageError(format!("corrupt body: {}", e)))?;
        info!(
            wallets = snapshot.wallets.len(),
            channels = snapshot.channels.len(),
            "Repository loaded"
        );
        self.memory.restore(snapshot);
        Ok(())
    }

    /// Writes the working set with `change` applied, then applies it in
    /// memory. A failed write leaves memory untouched.
    ///
    /// Returns false without writing when the change is a no-op.
    async fn commit(&self, change: Change<'_>) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let mut snapshot = self.memory.snapshot();
        if !change.apply_to(&mut snapshot) {
            return Ok(false);
        }
        self.write(&snapshot).await?;

        match change {
            Change::SaveWallet(metadata) => self.memory.save_wallet_metadata(metadata).await?,
            Change::DeleteWallet(id) => {
                self.memory.delete_wallet(id).await?;
            }
            Change::SaveChannel(record) => self.memory.save_channel_state(record).await?,
        }
        Ok(true)
    }

    async fn write(&self, snapshot: &Snapshot) -> Result<()> {
        let body = serde_json::to_vec(snapshot)?;
        let mut contents = Vec::with_capacity(HEADER_LEN + body.len());
        contents.extend_from_slice(MAGIC);
        contents.push(VERSION);
        contents.extend_from_slice(&body);

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&contents).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &self.path).await?;

        debug!(bytes = contents.len(), "Repository persisted");
        Ok(())
    }
}

enum Change<'a> {
    SaveWallet(&'a WalletMetadata),
    DeleteWallet(&'a WalletId),
    SaveChannel(&'a ChannelRecord),
}

impl Change<'_> {
    fn apply_to(&self, snapshot: &mut Snapshot) -> bool {
        match *self {
            Change::SaveWallet(metadata) => {
                match snapshot.wallets.iter_mut().find(|w| w.id == metadata.id) {
                    Some(existing) => *existing = metadata.clone(),
                    None => snapshot.wallets.push(metadata.clone()),
                }
                true
            }
            Change::DeleteWallet(id) => {
                let before = snapshot.wallets.len();
                snapshot.wallets.retain(|w| w.id != *id);
                snapshot.wallets.len() != before
            }
            Change::SaveChannel(record) => {
                match snapshot.channels.iter_mut().find(|c| c.id == record.id) {
                    Some(existing) => *existing = record.clone(),
                    None => snapshot.channels.push(record.clone()),
                }
                true
            }
        }
    }
}

#[async_trait]
impl WalletRepository for FileRepository {
    async fn save_wallet_metadata(&self, metadata: &WalletMetadata) -> Result<()> {
        self.commit(Change::SaveWallet(metadata)).await.map(drop)
    }

    async fn load_wallet_metadata(&self, id: &WalletId) -> Result<Option<WalletMetadata>> {
        self.memory.load_wallet_metadata(id).await
    }

    async fn list_wallets(&self) -> Result<Vec<WalletMetadata>> {
        self.memory.list_wallets().await
    }

    async fn delete_wallet(&self, id: &WalletId) -> Result<bool> {
        self.commit(Change::DeleteWallet(id)).await
    }

    async fn save_channel_state(&self, record: &ChannelRecord) -> Result<()> {
        self.commit(Change::SaveChannel(record)).await.map(drop)
    }

    async fn load_channel_state(&self, id: &ChannelId) -> Result<Option<ChannelRecord>> {
        self.memory.load_channel_state(id).await
    }

    async fn list_channels(&self) -> Result<Vec<ChannelRecord>> {
        self.memory.list_channels().await
    }
}

impl std::fmt::Debug for FileRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRepository")
            .field("path", &self.path)
            .field("wallets", &self.memory.wallet_count())
            .field("channels", &self.memory.channel_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{channel, wallet};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_survives_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kestrel.db");

        let w = wallet("savings");
        let c = channel(2);
        {
            let repo = FileRepository::open(&path).await.unwrap();
            repo.save_wallet_metadata(&w).await.unwrap();
            repo.save_channel_state(&c).await.unwrap();
        }

        let repo = FileRepository::open(&path).await.unwrap();
        assert_eq!(repo.load_wallet_metadata(&w.id).await.unwrap(), Some(w));
        assert_eq!(repo.load_channel_state(&c.id).await.unwrap(), Some(c));
    }

    #[tokio::test]
    async fn test_delete_is_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kestrel.db");
        let w = wallet("temp");

        let repo = FileRepository::open(&path).await.unwrap();
        repo.save_wallet_metadata(&w).await.unwrap();
        assert!(repo.delete_wallet(&w.id).await.unwrap());

        let reopened = FileRepository::open(&path).await.unwrap();
        assert!(reopened.list_wallets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_header_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kestrel.db");
        let repo = FileRepository::open(&path).await.unwrap();
        repo.save_channel_state(&channel(1)).await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], b"KSTR");
        assert_eq!(bytes[4], 1);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kestrel.db");
        let repo = FileRepository::open(&path).await.unwrap();
        let kept = channel(1);
        repo.save_channel_state(&kept).await.unwrap();

        // A directory where the temp file goes makes every write fail.
        std::fs::create_dir(path.with_extension("tmp")).unwrap();
        let w = wallet("savings");
        assert!(repo.save_wallet_metadata(&w).await.is_err());
        assert_eq!(repo.load_wallet_metadata(&w.id).await.unwrap(), None);

        let mut changed = kept.clone();
        changed.commitment.version += 1;
        assert!(repo.save_channel_state(&changed).await.is_err());
        assert_eq!(repo.load_channel_state(&kept.id).await.unwrap(), Some(kept.clone()));

        std::fs::remove_dir(path.with_extension("tmp")).unwrap();
        repo.save_wallet_metadata(&w).await.unwrap();
        let reopened = FileRepository::open(&path).await.unwrap();
        assert_eq!(reopened.load_wallet_metadata(&w.id).await.unwrap(), Some(w));
        assert_eq!(reopened.load_channel_state(&kept.id).await.unwrap(), Some(kept));
    }

    #[tokio::test]
    async fn test_invalid_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kestrel.db");
        std::fs::write(&path, b"garbage data").unwrap();
        let err = FileRepository::open(&path).await.unwrap_err();
        assert!(matches!(err, KestrelError::StorageError(_)));
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kestrel.db");
        std::fs::write(&path, b"KSTR\x09{}").unwrap();
        let err = FileRepository::open(&path).await.unwrap_err();
        assert!(matches!(err, KestrelError::VersionMismatch { expected: 1, actual: 9 }));
    }
}
