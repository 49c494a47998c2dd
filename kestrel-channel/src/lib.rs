//! # Kestrel Channels
//!
//! Two-party payment channels with hash-time-locked contracts.
//!
//! ## Lifecycle
//!
//! ```text
//!   open ──► Negotiating ──(funding depth)──► Open ──close──► Closing ──► Closed
//!                 │                             │                │
//!                 └──(cancel / error)──► Failed └──force──► ForceClosing ──(dispute window)──► Closed
//! ```
//!
//! Every balance change is a new commitment version countersigned by the
//! peer before it is persisted. At all times
//! `local + remote + Σ pending HTLCs == capacity`.
//!
//! ## Modules
//!
//! - [`manager`]: channel aggregates, HTLC add/settle/fail, closing, recovery
//! - [`commitment`]: funding script and commitment/settlement transactions
//! - [`graph`]: channel graph and cheapest-route search
//! - [`peer`]: the counterparty protocol and an in-process peer
//! - [`funder`]: on-chain funding of new channels
//! - [`sweeper`]: background expiry sweeping
//!
//! ## Example
//!
//! ```rust,ignore
//! use kestrel_channel::{ChannelConfig, ChannelManager, CloseMode};
//!
//! let manager = ChannelManager::new(ChannelConfig::default(), network, node_key, chain, repo, funder);
//! let channel_id = manager.open(peer, 1_000_000, 0).await?;
//! manager.wait_for_funding(&channel_id, &cancel).await?;
//!
//! let htlc = manager.add_htlc(channel_id, payment_hash, 100_000, height + 40).await?;
//! manager.fulfill_htlc(htlc, &preimage).await?;
//! manager.close(channel_id, CloseMode::Cooperative).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod commitment;
pub mod config;
pub mod funder;
pub mod graph;
pub mod manager;
pub mod payment;
pub mod peer;
pub mod sweeper;

pub use commitment::{
    commitment_transaction, funding_address, funding_script, htlc_script, settlement_transaction,
    ChannelParams,
};
pub use config::{ChannelConfig, RelayPolicy};
pub use funder::{ChannelFunder, FundingTransaction, KeyFunder};
pub use graph::{ChannelEdge, ChannelGraph, Route, RouteHop};
pub use manager::{ChannelManager, CloseMode, HtlcStatus, LoadReport, PollReport, SweepReport};
pub use peer::{ClosingProposal, CommitmentUpdate, Counterparty, LoopbackPeer, OpenRequest};
pub use sweeper::HtlcSweeper;
