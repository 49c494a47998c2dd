//! Passphrase-sealed seeds.
//!
//! A seed is encrypted with AES-256-GCM under a key stretched from the
//! passphrase with PBKDF2-HMAC-SHA256. Salt and nonce are fresh per seal.
//! The wallet id is authenticated as associated data.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{EncryptedSeed, WalletId};

use crate::seed::Seed;

/// PBKDF2 salt length.
pub const SALT_SIZE: usize = 16;

/// AES-GCM nonce length.
pub const NONCE_SIZE: usize = 12;

/// Default PBKDF2 iteration count.
pub const DEFAULT_KDF_ROUNDS: u32 = 210_000;

fn derive_key(passphrase: &str, salt: &[u8], rounds: u32) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, rounds, key.as_mut());
    key
}

fn cipher(key: &[u8; 32]) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
}

/// Encrypts `seed` for `wallet` under `passphrase`.
///
/// # Errors
/// - `ValidationError` for an empty passphrase or zero rounds
/// - `InsufficientEntropy` if the OS RNG fails
#[instrument(skip(seed, passphrase))]
pub fn seal(seed: &Seed, wallet: &WalletId, passphrase: &str, rounds: u32) -> Result<EncryptedSeed> {
    if passphrase.is_empty() {
        return Err(KestrelError::ValidationError("passphrase is empty".into()));
    }
    if rounds == 0 {
        return Err(KestrelError::ValidationError("kdf_rounds must be at least 1".into()));
    }

    let mut salt = vec![0u8; SALT_SIZE];
    let mut nonce = vec![0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut salt)
        .and_then(|_| OsRng.try_fill_bytes(&mut nonce))
        .map_err(|e| KestrelError::InsufficientEntropy(e.to_string()))?;

    let key = derive_key(passphrase, &salt, rounds);
    let aad = wallet.to_string();
    let ciphertext = cipher(&key)
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: seed.as_bytes(),
                aad: aad.as_bytes(),
            },
        )
        .map_err(|e| KestrelError::InternalError(format!("seed encryption failed: {}", e)))?;

    debug!(rounds, "Seed sealed");
    Ok(EncryptedSeed {
        kdf_rounds: rounds,
        salt,
        nonce,
        ciphertext,
    })
}

/// Decrypts a sealed seed.
///
/// # Errors
/// - `VerificationFailed` for a wrong passphrase, another wallet's keystore
///   or a modified ciphertext
/// - `ValidationError` for malformed salt, nonce or rounds
#[instrument(skip(sealed, passphrase))]
pub fn open(sealed: &EncryptedSeed, wallet: &WalletId, passphrase: &str) -> Result<Seed> {
    if sealed.nonce.len() != NONCE_SIZE || sealed.salt.is_empty() || sealed.kdf_rounds == 0 {
        return Err(KestrelError::ValidationError("malformed keystore".into()));
    }

    let key = derive_key(passphrase, &sealed.salt, sealed.kdf_rounds);
    let aad = wallet.to_string();
    let plain = cipher(&key)
        .decrypt(
            Nonce::from_slice(&sealed.nonce),
            Payload {
                msg: &sealed.ciphertext,
                aad: aad.as_bytes(),
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| {
            KestrelError::VerificationFailed("wrong passphrase or corrupted keystore".into())
        })?;

    Seed::from_bytes(&plain)
}
