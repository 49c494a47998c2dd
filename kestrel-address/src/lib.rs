//! # Kestrel Address Codec
//!
//! Locking scripts and their address encodings.
//!
//! | Script type      | Source     | Encoding                         |
//! |------------------|------------|----------------------------------|
//! | P2PKH            | public key | Base58Check `version ‖ hash160`  |
//! | P2SH             | script     | Base58Check `version ‖ hash160`  |
//! | P2WPKH           | public key | Bech32 witness v0, 20 bytes      |
//! | P2WSH            | script     | Bech32 witness v0, 32 bytes      |
//! | MultisigRedeem   | script     | same string as P2SH              |
//!
//! ## Example
//!
//! ```rust,ignore
//! use kestrel_address::{AddressCodec, AddressSource};
//! use kestrel_core::{Network, ScriptType};
//!
//! let addr = AddressCodec::encode(AddressSource::PublicKey(&pk), Network::Testnet, ScriptType::P2wpkh)?;
//! let decoded = AddressCodec::decode(addr.as_str())?;
//! assert_eq!(decoded.payload, addr.payload());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod codec;
pub mod script;

pub use codec::{Address, AddressCodec, AddressSource, DecodedAddress};
pub use script::{classify_script_pubkey, multisig_redeem, parse_multisig, parse_pushes};
