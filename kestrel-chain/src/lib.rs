//! # Kestrel Chain
//!
//! Plumbing between the engine and a chain backend.
//!
//! - [`RetryingChainClient`]: wraps any [`ChainClient`](kestrel_core::ChainClient)
//!   with a per-call timeout and exponential backoff; only network errors retry
//! - [`ConfirmationWatcher`]: cancellable wait for a confirmation depth
//! - [`MemoryChain`]: deterministic regtest chain with failure injection
//!
//! ## Example
//!
//! ```rust,ignore
//! use kestrel_chain::{MemoryChain, RetryPolicy, RetryingChainClient};
//!
//! let chain = Arc::new(MemoryChain::new(Network::Regtest));
//! let client = RetryingChainClient::new(chain.clone(), RetryPolicy::default().with_max_attempts(3));
//! let txid = client.broadcast_transaction(&signed.serialize()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod memory;
pub mod retry;
pub mod watch;

pub use memory::MemoryChain;
pub use retry::{RetryPolicy, RetryingChainClient};
pub use watch::{ConfirmationWatcher, WaitOutcome};
