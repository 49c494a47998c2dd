//! # Kestrel Cryptography
//!
//! Key material for the Kestrel wallet engine.
//!
//! This crate provides:
//!
//! - **Seed**: raw entropy from the OS RNG, zeroized on drop
//! - **BIP32**: extended private/public keys and path derivation over secp256k1
//! - **Signing**: ECDSA over 32-byte digests with RFC6979 deterministic nonces
//! - **Hash**: SHA-256, double SHA-256, HASH160, HMAC-SHA512
//! - **KeyVault**: per-wallet seed store; the only owner of private material
//! - **Keystore**: AES-256-GCM sealing of seeds under a PBKDF2-stretched passphrase
//!
//! ## Security Properties
//!
//! - Seeds, secret scalars and chain codes are zeroized on drop
//! - None of the secret types implement `Serialize`, and their `Debug` is redacted
//! - Seeds leave the vault only sealed, or through an explicit export
//! - Signing borrows keys immutably and never mutates them
//!
//! ## Example
//!
//! ```rust,ignore
//! use kestrel_crypto::{KeyVault, Seed};
//! use kestrel_core::{DerivationPath, WalletId};
//!
//! let vault = KeyVault::new();
//! let wallet = WalletId::new();
//! vault.insert(wallet, KeyVault::generate_seed(256)?)?;
//!
//! let path: DerivationPath = "m/84'/1'/0'/0/0".parse()?;
//! let xpub = vault.derive_public(&wallet, &path)?;
//! let sig = vault.sign_with(&wallet, &path, &[0u8; 32])?;
//! assert!(kestrel_crypto::verify(xpub.public_key(), &[0u8; 32], &sig));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod bip32;
pub mod hash;
pub mod keystore;
pub mod seed;
pub mod sign;
pub mod vault;

// Re-export main types at crate root
pub use bip32::{ExtendedPrivateKey, ExtendedPublicKey};
pub use hash::{hash160, hmac_sha512, sha256, sha256_concat, sha256d};
pub use keystore::DEFAULT_KDF_ROUNDS;
pub use seed::Seed;
pub use sign::{from_der, sign, to_der, verify};
pub use vault::{DeriveFrom, ExtendedKey, KeyVault};
