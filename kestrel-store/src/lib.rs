//! # Kestrel Store
//!
//! [`WalletRepository`](kestrel_core::WalletRepository) backends.
//!
//! | Backend | Durability | Use |
//! |---------|------------|-----|
//! | [`MemoryRepository`] | none | tests, demos |
//! | [`FileRepository`] | atomic rewrite per commit | single-node deployments |
//!
//! Only public data is stored: extended public keys, paths, addresses, UTXO
//! references and channel balances. Seeds never reach a repository.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod file;
pub mod memory;

pub use file::FileRepository;
pub use memory::{MemoryRepository, Snapshot};

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use kestrel_core::types::*;

    const GENERATOR: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

    pub fn wallet(name: &str) -> WalletMetadata {
        WalletMetadata {
            id: WalletId::new(),
            name: name.to_string(),
            network: Network::Regtest,
            script_type: ScriptType::P2wpkh,
            account_path: "m/84'/1'/0'".parse().unwrap(),
            account_xpub: "tpubDummy".to_string(),
            master_fingerprint: "01020304".to_string(),
            addresses: Vec::new(),
            next_receive_index: 0,
            next_change_index: 0,
            utxos: Vec::new(),
            pending: Vec::new(),
            keystore: None,
            created_at: Utc::now(),
        }
    }

    pub fn channel(n: u8) -> ChannelRecord {
        let key = PublicKey::from_hex(GENERATOR).unwrap();
        ChannelRecord {
            id: ChannelId::from_bytes([n; 32]),
            counterparty: key,
            capacity: 1_000_000,
            is_funder: true,
            state: ChannelState::Open,
            commitment: Commitment {
                version: 0,
                local_balance: 1_000_000,
                remote_balance: 0,
                htlcs: BTreeMap::new(),
                remote_signature: None,
            },
            funding_outpoint: Some(OutPoint::new(Txid::from_bytes([n; 32]), 0)),
            funding_script: vec![0x52, 0xae],
            local_key_path: "m/1017'/1'/0'".parse().unwrap(),
            local_funding_key: key,
            remote_funding_key: key,
            closing_txid: None,
            dispute_deadline: None,
            resolved: Vec::new(),
            next_htlc_index: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
