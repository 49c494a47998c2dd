//! # Kestrel Core
//!
//! Core types, errors, and collaborator traits for the Kestrel wallet and
//! payment-channel engine.
//!
//! This crate provides the foundational building blocks used by all other Kestrel crates:
//!
//! - **Types**: networks, keys, derivation paths, UTXOs, channels, HTLCs, wallet metadata
//! - **Errors**: one error enum grouped by input / resource / coordination / network / integrity
//! - **Constants**: consensus-ish sizes, dust thresholds, engine defaults
//! - **Traits**: [`WalletRepository`] and [`ChainClient`], the two external collaborators
//!
//! ## Example
//!
//! ```rust
//! use kestrel_core::{DerivationPath, Network};
//!
//! let path: DerivationPath = "m/84'/1'/0'/0/3".parse().unwrap();
//! assert_eq!(path.depth(), 5);
//! assert_eq!(Network::Testnet.bech32_hrp(), "tb");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]

pub mod constants;
pub mod error;
pub mod traits;
pub mod types;

// Re-export commonly used items at crate root
pub use constants::*;
pub use error::{ErrorCategory, KestrelError, Result};
pub use traits::*;
pub use types::*;
