//! # Kestrel Wallet Engine
//!
//! One facade over every Kestrel component:
//!
//! - HD wallets: create, import, delete (secure erase), account xpub export
//! - passphrase keystores: seal, unlock after restart, export for backup
//! - receive and change addresses, UTXO refresh and balances
//! - on-chain payments with reserved inputs until confirmation
//! - multisig co-signing through the shared coordinator
//! - channels funded from a wallet, invoices and payments over them
//!
//! ## Example
//!
//! ```rust,ignore
//! use kestrel_wallet::{EngineConfig, WalletEngine};
//!
//! let engine = WalletEngine::start(EngineConfig::from_env()?, chain, &node_seed).await?;
//! let wallet = engine.create_wallet("savings").await?;
//! let address = engine.next_address(&wallet.id).await?;
//!
//! let balance = engine.refresh_utxos(&wallet.id).await?;
//! let tx = engine.send(&wallet.id, vec![TxOutput::parse(dest, 40_000)?], None).await?;
//! engine.confirm_pending(&wallet.id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

mod account;
pub mod config;
pub mod engine;
pub mod funder;

pub use config::{EngineConfig, REPOSITORY_FILE};
pub use engine::{RestoreReport, WalletEngine, WalletExport};
pub use funder::WalletFunder;

// Re-exported so callers of the engine need no direct component dependencies.
pub use kestrel_channel::{CloseMode, Counterparty, LoopbackPeer};
pub use kestrel_core::{Balance, KestrelError, Network, Result, WalletId, WalletMetadata};
pub use kestrel_crypto::Seed;
pub use kestrel_invoice::{Invoice, InvoiceStatus};
pub use kestrel_tx::{FeePolicy, SignedTransaction, TxOutput};
