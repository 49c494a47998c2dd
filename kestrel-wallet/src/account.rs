//! Operations on one wallet's metadata.
//!
//! Callers hold the wallet's lock; nothing here touches the chain or the
//! repository.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

use kestrel_address::{Address, AddressCodec, AddressSource};
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{
    AddressRecord, Balance, ChildNumber, DerivationPath, OutPoint, SpendCondition, Utxo,
    WalletMetadata,
};
use kestrel_crypto::{ExtendedPrivateKey, KeyVault};
use kestrel_tx::{UnsignedTransaction, UtxoReservations};

/// A wallet behind its own lock.
pub(crate) type WalletHandle = Arc<Mutex<WalletMetadata>>;

/// Branch of the account used for receive addresses.
const RECEIVE_BRANCH: u32 = 0;
/// Branch of the account used for change addresses.
const CHANGE_BRANCH: u32 = 1;

/// Derives the next receive or change address and records it.
pub(crate) fn derive_address(
    vault: &KeyVault,
    meta: &mut WalletMetadata,
    change: bool,
) -> Result<AddressRecord> {
    let (branch, index) = if change {
        (CHANGE_BRANCH, meta.next_change_index)
    } else {
        (RECEIVE_BRANCH, meta.next_receive_index)
    };
    let path = meta
        .account_path
        .child(ChildNumber::normal(branch)?)?
        .child(ChildNumber::normal(index)?)?;
    let key = vault.derive_public(&meta.id, &path)?;
    let address = AddressCodec::encode(
        AddressSource::PublicKey(key.public_key()),
        meta.network,
        meta.script_type,
    )?;

    let record = AddressRecord {
        address: address.to_string(),
        path,
        index,
        change,
    };
    meta.addresses.push(record.clone());
    if change {
        meta.next_change_index += 1;
    } else {
        meta.next_receive_index += 1;
    }
    Ok(record)
}

/// Next change address, parsed.
pub(crate) fn change_address(vault: &KeyVault, meta: &mut WalletMetadata) -> Result<Address> {
    derive_address(vault, meta, true)?.address.parse()
}

/// Replaces the wallet's UTXO list with `observed`, tagging each output with
/// the path of the address it pays.
pub(crate) fn apply_utxos(meta: &mut WalletMetadata, observed: Vec<Utxo>) {
    let mut seen = HashSet::new();
    meta.utxos = observed
        .into_iter()
        .filter(|u| seen.insert(u.outpoint))
        .filter_map(|mut utxo| {
            let record = meta.address(&utxo.address)?;
            utxo.spend = SpendCondition::SingleKey {
                path: Some(record.path.clone()),
            };
            Some(utxo)
        })
        .collect();
    meta.utxos.sort_by_key(|u| u.outpoint);
}

/// Outputs that may be selected for a new spend.
pub(crate) fn spendable(
    meta: &WalletMetadata,
    reservations: &UtxoReservations,
    min_confirmations: u32,
) -> Vec<Utxo> {
    meta.utxos
        .iter()
        .filter(|u| u.confirmations >= min_confirmations)
        .filter(|u| reservations.is_available(&u.outpoint))
        .cloned()
        .collect()
}

/// Splits the wallet's outputs into balance buckets.
pub(crate) fn balance(meta: &WalletMetadata, reservations: &UtxoReservations) -> Balance {
    let mut balance = Balance::default();
    for utxo in &meta.utxos {
        if reservations.is_spent(&utxo.outpoint) {
            continue;
        }
        let bucket = if reservations.is_reserved(&utxo.outpoint) {
            &mut balance.reserved
        } else if utxo.confirmations > 0 {
            &mut balance.confirmed
        } else {
            &mut balance.unconfirmed
        };
        *bucket = bucket.saturating_add(utxo.amount);
    }
    balance
}

/// Private keys for every input of `unsigned`, one per distinct path.
///
/// # Errors
/// - `ValidationError` if an input is not a single-key output of this wallet
/// - `NotFound` if the wallet's seed is not in the vault
pub(crate) fn signing_keys(
    vault: &KeyVault,
    meta: &WalletMetadata,
    unsigned: &UnsignedTransaction,
) -> Result<Vec<ExtendedPrivateKey>> {
    let mut paths: Vec<&DerivationPath> = Vec::new();
    for input in unsigned.inputs() {
        match &input.spend {
            SpendCondition::SingleKey { path: Some(path) } => {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
            _ => {
                return Err(KestrelError::ValidationError(format!(
                    "input {} is not a key of wallet {}",
                    input.outpoint, meta.id
                )))
            }
        }
    }
    paths
        .into_iter()
        .map(|path| vault.derive_private(&meta.id, path))
        .collect()
}

/// Drops outputs consumed by `spent`.
pub(crate) fn remove_spent(meta: &mut WalletMetadata, spent: &[OutPoint]) {
    meta.utxos.retain(|u| !spent.contains(&u.outpoint));
}
