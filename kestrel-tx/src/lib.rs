//! # Kestrel Transactions
//!
//! On-chain spending for Kestrel wallets.
//!
//! ## Pipeline
//!
//! ```text
//! Utxos ──► TransactionBuilder::build ──► UnsignedTransaction
//!                 (coin selection, fee, change)      │
//!                                                    ▼
//!            KeyVault keys / MultisigWitnessSource ─► Signer::sign ──► SignedTransaction
//!                                                                          │
//!                                                        Signer::verify ◄──┘
//! ```
//!
//! Every unsigned transaction satisfies `Σinputs == Σoutputs + fee` exactly;
//! change below dust is folded into the fee.
//!
//! ## Example
//!
//! ```rust,ignore
//! use kestrel_tx::{BuilderConfig, FeePolicy, Signer, TransactionBuilder, TxOutput};
//!
//! let builder = TransactionBuilder::new(BuilderConfig::default()).with_change(change_addr);
//! let unsigned = builder.build(&utxos, vec![TxOutput::to_address(&dest, 40_000)], FeePolicy::Fixed(1_000))?;
//! let signed = Signer::sign(unsigned, &keys, None)?;
//! assert!(Signer::verify(&signed));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod builder;
pub mod reservation;
pub mod sighash;
pub mod signer;
pub mod transaction;

pub use builder::{BuilderConfig, FeePolicy, SelectionStrategy, TransactionBuilder};
pub use reservation::{ReservationId, UtxoReservations};
pub use sighash::{all_input_hashes, SighashCache};
pub use signer::{MultisigWitnessSource, Signer};
pub use transaction::{
    parse_raw, RawOutput, RawTransaction, SignedTransaction, TxInput, TxOutput,
    UnsignedTransaction,
};
