//! M-of-N wallet descriptors.

use serde::{Deserialize, Serialize};

use kestrel_address::{multisig_redeem, Address, AddressCodec, AddressSource};
use kestrel_core::constants::MAX_MULTISIG_KEYS;
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{
    DerivationPath, Network, OutPoint, PublicKey, ScriptType, SpendCondition, Utxo,
};
use kestrel_tx::TxInput;

/// A threshold wallet: M signatures out of N sorted co-signer keys.
///
/// Keys are sorted lexicographically by their compressed encoding (BIP67), so
/// every co-signer derives the same redeem script regardless of the order
/// the keys were exchanged in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigWallet {
    threshold: usize,
    keys: Vec<PublicKey>,
    path: DerivationPath,
    wrapping: ScriptType,
    #[serde(with = "hex")]
    redeem_script: Vec<u8>,
    address: Address,
}

impl MultisigWallet {
    /// Builds the wallet and its address.
    ///
    /// # Errors
    /// `ValidationError` unless `1 ≤ threshold ≤ keys.len() ≤ 15`, the keys are
    /// distinct and `wrapping` is `P2sh` or `P2wsh`.
    pub fn new(
        threshold: usize,
        mut keys: Vec<PublicKey>,
        path: DerivationPath,
        wrapping: ScriptType,
        network: Network,
    ) -> Result<Self> {
        if !matches!(wrapping, ScriptType::P2sh | ScriptType::P2wsh) {
            return Err(KestrelError::ValidationError(format!(
                "multisig wrapping must be p2sh or p2wsh, got {}",
                wrapping
            )));
        }
        if threshold == 0 || threshold > keys.len() || keys.len() > MAX_MULTISIG_KEYS {
            return Err(KestrelError::ValidationError(format!(
                "invalid multisig shape {}-of-{}",
                threshold,
                keys.len()
            )));
        }

        keys.sort();
        if keys.windows(2).any(|w| w[0] == w[1]) {
            return Err(KestrelError::ValidationError(
                "co-signer keys must be distinct".into(),
            ));
        }

        let redeem_script = multisig_redeem(threshold, &keys)?;
        let address = AddressCodec::encode(AddressSource::Script(&redeem_script), network, wrapping)?;

        Ok(Self {
            threshold,
            keys,
            path,
            wrapping,
            redeem_script,
            address,
        })
    }

    /// Threshold M.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Co-signer keys in redeem-script order.
    pub fn keys(&self) -> &[PublicKey] {
        &self.keys
    }

    /// Position of `key` in the redeem script.
    pub fn key_index(&self, key: &PublicKey) -> Option<usize> {
        self.keys.binary_search(key).ok()
    }

    /// Derivation path the co-signers use for their keys.
    pub fn path(&self) -> &DerivationPath {
        &self.path
    }

    /// `P2sh` or `P2wsh`.
    pub fn wrapping(&self) -> ScriptType {
        self.wrapping
    }

    /// CHECKMULTISIG redeem script.
    pub fn redeem_script(&self) -> &[u8] {
        &self.redeem_script
    }

    /// Receive address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Spend condition carried by this wallet's UTXOs.
    pub fn spend_condition(&self) -> SpendCondition {
        SpendCondition::Multisig {
            redeem_script: self.redeem_script.clone(),
        }
    }

    /// True if `input` spends this wallet's redeem script.
    pub fn owns(&self, input: &TxInput) -> bool {
        matches!(&input.spend, SpendCondition::Multisig { redeem_script } if *redeem_script == self.redeem_script)
            && input.script_pubkey == self.address.script_pubkey()
    }

    /// A UTXO paying this wallet, as observed on chain.
    pub fn utxo(&self, outpoint: OutPoint, amount: u64, confirmations: u32) -> Utxo {
        Utxo {
            outpoint,
            amount,
            script_pubkey: self.address.script_pubkey(),
            script_type: self.wrapping,
            address: self.address.to_string(),
            confirmations,
            spend: self.spend_condition(),
        }
    }
}
