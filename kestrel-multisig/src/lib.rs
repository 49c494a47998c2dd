//! # Kestrel Multisig
//!
//! Threshold (M-of-N) wallets and the coordinator that collects co-signer
//! signatures into a spendable transaction.
//!
//! ## Proposal lifecycle
//!
//! ```text
//! propose ──► Collecting ──(M distinct valid signers)──► Ready ──finalize──► Finalized
//!                 │                                        │                    │
//!                 └──────── deadline / cancel ─────────────┴──► Expired         │
//!                                                                 confirm ◄─────┴────► abandon
//!                                                                    │                    │
//!                                                                Confirmed            Abandoned
//! ```
//!
//! Expiry, cancellation and abandonment release any UTXOs the proposal
//! reserved; confirmation marks them spent.
//!
//! ## Example
//!
//! ```rust,ignore
//! use kestrel_multisig::{sign_partial, CoordinatorConfig, MultisigCoordinator, MultisigWallet};
//!
//! let wallet = Arc::new(MultisigWallet::new(2, keys, path, ScriptType::P2wsh, Network::Testnet)?);
//! let coordinator = MultisigCoordinator::new(CoordinatorConfig::default(), reservations);
//!
//! let id = coordinator.propose(unsigned.clone(), wallet)?;
//! coordinator.submit_partial(id, alice.public_key(), sign_partial(&unsigned, &alice)?)?;
//! coordinator.submit_partial(id, bob.public_key(), sign_partial(&unsigned, &bob)?)?;
//! let signed = coordinator.finalize(id)?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod coordinator;
pub mod proposal;
pub mod wallet;

pub use coordinator::{sign_partial, CoordinatorConfig, MultisigCoordinator};
pub use proposal::{ProposalId, ProposalState, ProposalStatus};
pub use wallet::MultisigWallet;
