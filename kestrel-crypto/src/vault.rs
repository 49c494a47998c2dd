//! Per-wallet key vault.
//!
//! The vault is the only owner of seeds and master keys. Everything it hands
//! out is either public (`ExtendedPublicKey`, `Signature`) or a short-lived
//! derived private key that zeroizes itself when dropped.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, instrument};

use kestrel_core::constants::HASH_SIZE;
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{DerivationPath, EncryptedSeed, Signature, WalletId};

use crate::bip32::{ExtendedPrivateKey, ExtendedPublicKey};
use crate::seed::Seed;

/// Starting point for [`KeyVault::derive`].
pub enum DeriveFrom<'a> {
    /// Derive from the master key of a seed; the path is absolute.
    Seed(&'a Seed),
    /// Derive below a private parent; the path is relative.
    Private(&'a ExtendedPrivateKey),
    /// Derive below a public parent (non-hardened only); the path is relative.
    Public(&'a ExtendedPublicKey),
}

/// Result of [`KeyVault::derive`].
#[derive(Debug, Clone)]
pub enum ExtendedKey {
    /// Private derivation result.
    Private(ExtendedPrivateKey),
    /// Public derivation result.
    Public(ExtendedPublicKey),
}

impl ExtendedKey {
    /// Public half of the key.
    pub fn to_public(&self) -> ExtendedPublicKey {
        match self {
            ExtendedKey::Private(k) => k.to_extended_public(),
            ExtendedKey::Public(k) => k.clone(),
        }
    }

    /// The private key, if this is one.
    pub fn private(&self) -> Option<&ExtendedPrivateKey> {
        match self {
            ExtendedKey::Private(k) => Some(k),
            ExtendedKey::Public(_) => None,
        }
    }
}

struct VaultEntry {
    seed: Seed,
    master: ExtendedPrivateKey,
}

/// Seed store keyed by wallet.
///
/// Entries are immutable once inserted and shared as `Arc`, so signing never
/// holds the map lock while doing curve arithmetic.
#[derive(Default)]
pub struct KeyVault {
    entries: RwLock<HashMap<WalletId, Arc<VaultEntry>>>,
}

impl KeyVault {
    /// Creates an empty vault.
    pub fn new() -> Self {
        Self::default()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // STATELESS OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Generates a fresh seed from the OS RNG.
    pub fn generate_seed(entropy_bits: usize) -> Result<Seed> {
        Seed::generate(entropy_bits)
    }

    /// BIP32 derivation from a seed, private parent or public parent.
    pub fn derive(from: DeriveFrom<'_>, path: &DerivationPath) -> Result<ExtendedKey> {
        match from {
            DeriveFrom::Seed(seed) => {
                let master = ExtendedPrivateKey::from_seed(seed)?;
                Ok(ExtendedKey::Private(master.derive_path(path)?))
            }
            DeriveFrom::Private(parent) => Ok(ExtendedKey::Private(parent.derive_path(path)?)),
            DeriveFrom::Public(parent) => Ok(ExtendedKey::Public(parent.derive_path(path)?)),
        }
    }

    /// Signs a digest with an already-derived key.
    pub fn sign(key: &ExtendedPrivateKey, hash: &[u8; HASH_SIZE]) -> Result<Signature> {
        crate::sign::sign(key, hash)
    }

    /// One-way export of the public half.
    pub fn export_public(key: &ExtendedPrivateKey) -> ExtendedPublicKey {
        key.to_extended_public()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // STORE
    // ═══════════════════════════════════════════════════════════════════════════

    /// Stores a seed for `wallet`.
    ///
    /// # Errors
    /// `ValidationError` if the wallet already has a seed.
    #[instrument(skip(self, seed))]
    pub fn insert(&self, wallet: WalletId, seed: Seed) -> Result<()> {
        let master = ExtendedPrivateKey::from_seed(&seed)?;
        let mut entries = self.entries.write();
        if entries.contains_key(&wallet) {
            return Err(KestrelError::ValidationError(format!(
                "wallet {} already has a seed",
                wallet
            )));
        }
        entries.insert(wallet, Arc::new(VaultEntry { seed, master }));
        info!(wallet = %wallet, "Seed stored");
        Ok(())
    }

    /// True if a seed is stored for `wallet`.
    pub fn contains(&self, wallet: &WalletId) -> bool {
        self.entries.read().contains_key(wallet)
    }

    fn entry(&self, wallet: &WalletId) -> Result<Arc<VaultEntry>> {
        self.entries
            .read()
            .get(wallet)
            .cloned()
            .ok_or_else(|| KestrelError::not_found("wallet seed", wallet.to_string()))
    }

    /// Derives the private key at an absolute path.
    pub fn derive_private(
        &self,
        wallet: &WalletId,
        path: &DerivationPath,
    ) -> Result<ExtendedPrivateKey> {
        self.entry(wallet)?.master.derive_path(path)
    }

    /// Derives the public key at an absolute path.
    #[instrument(skip(self), fields(path = %path))]
    pub fn derive_public(
        &self,
        wallet: &WalletId,
        path: &DerivationPath,
    ) -> Result<ExtendedPublicKey> {
        let key = self.derive_private(wallet, path)?;
        debug!("Derived public key");
        Ok(key.to_extended_public())
    }

    /// Signs `hash` with the key at `path`.
    #[instrument(skip(self, hash), fields(path = %path))]
    pub fn sign_with(
        &self,
        wallet: &WalletId,
        path: &DerivationPath,
        hash: &[u8; HASH_SIZE],
    ) -> Result<Signature> {
        let key = self.derive_private(wallet, path)?;
        key.sign(hash)
    }

    /// Fingerprint of the wallet's master key.
    pub fn master_fingerprint(&self, wallet: &WalletId) -> Result<[u8; 4]> {
        Ok(self.entry(wallet)?.master.fingerprint())
    }

    /// Seals the wallet's seed under `passphrase`. The seed itself never
    /// leaves the vault.
    pub fn seal(&self, wallet: &WalletId, passphrase: &str, rounds: u32) -> Result<EncryptedSeed> {
        crate::keystore::seal(&self.entry(wallet)?.seed, wallet, passphrase, rounds)
    }

    /// Opens a sealed seed and stores it for `wallet`.
    ///
    /// # Errors
    /// `VerificationFailed` for a wrong passphrase; `ValidationError` if the
    /// wallet already has a seed.
    pub fn unseal(&self, wallet: WalletId, sealed: &EncryptedSeed, passphrase: &str) -> Result<()> {
        let seed = crate::keystore::open(sealed, &wallet, passphrase)?;
        self.insert(wallet, seed)
    }

    /// Seed size in bits, for diagnostics.
    pub fn seed_bits(&self, wallet: &WalletId) -> Result<usize> {
        Ok(self.entry(wallet)?.seed.bits())
    }

    /// Removes and zeroizes the wallet's seed. Returns true if it existed.
    ///
    /// Outstanding `Arc` clones held by in-flight signers are wiped when the
    /// last one drops.
    #[instrument(skip(self))]
    pub fn erase(&self, wallet: &WalletId) -> bool {
        let removed = self.entries.write().remove(wallet).is_some();
        if removed {
            info!(wallet = %wallet, "Seed erased");
        }
        removed
    }

    /// Number of wallets with a stored seed.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if no seeds are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault")
            .field("wallets", &self.len())
            .finish()
    }
}
