//! Signature digests.
//!
//! Witness inputs (P2WPKH, P2WSH) use the BIP143 layout, which commits to
//! all prevouts, all sequences, the spent amount, the script code and all
//! outputs:
//!
//! ```text
//! version ‖ hashPrevouts ‖ hashSequence ‖ outpoint ‖ scriptCode ‖ amount
//!         ‖ nSequence ‖ hashOutputs ‖ nLockTime ‖ sighashType
//! ```
//!
//! Legacy inputs (P2PKH, P2SH, bare multisig) hash the whole transaction
//! with every scriptSig emptied except the signed input's, which carries the
//! script code, followed by the sighash type.

use kestrel_address::script;
use kestrel_core::constants::{HASH160_SIZE, HASH_SIZE};
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{ScriptType, SpendCondition};
use kestrel_crypto::sha256d;

use crate::transaction::{encode, write_bytes, write_outpoint, write_output, TxInput, UnsignedTransaction};

/// `SIGHASH_ALL`, the only sighash type produced or accepted.
pub const SIGHASH_ALL: u32 = 0x01;

/// Precomputed per-transaction hashes shared by every input's digest.
#[derive(Debug, Clone)]
pub struct SighashCache {
    hash_prevouts: [u8; HASH_SIZE],
    hash_sequence: [u8; HASH_SIZE],
    hash_outputs: [u8; HASH_SIZE],
}

impl SighashCache {
    /// Hashes prevouts, sequences and outputs of `tx`.
    pub fn new(tx: &UnsignedTransaction) -> Self {
        let mut prevouts = Vec::with_capacity(tx.inputs().len() * 36);
        let mut sequences = Vec::with_capacity(tx.inputs().len() * 4);
        for input in tx.inputs() {
            write_outpoint(&mut prevouts, &input.outpoint);
            sequences.extend_from_slice(&input.sequence.to_le_bytes());
        }
        let mut outputs = Vec::new();
        for output in tx.outputs() {
            write_output(&mut outputs, output);
        }

        Self {
            hash_prevouts: sha256d(&prevouts),
            hash_sequence: sha256d(&sequences),
            hash_outputs: sha256d(&outputs),
        }
    }

    /// Digest for input `index` with an explicit script code.
    pub fn signature_hash(
        &self,
        tx: &UnsignedTransaction,
        index: usize,
        script_code: &[u8],
    ) -> Result<[u8; HASH_SIZE]> {
        let input = tx.inputs().get(index).ok_or_else(|| {
            KestrelError::ValidationError(format!("input {} out of range", index))
        })?;
        if !is_witness_input(input) {
            return Ok(legacy_signature_hash(tx, index, script_code));
        }

        let mut preimage = Vec::with_capacity(160 + script_code.len());
        preimage.extend_from_slice(&tx.version().to_le_bytes());
        preimage.extend_from_slice(&self.hash_prevouts);
        preimage.extend_from_slice(&self.hash_sequence);
        write_outpoint(&mut preimage, &input.outpoint);
        write_bytes(&mut preimage, script_code);
        preimage.extend_from_slice(&input.amount.to_le_bytes());
        preimage.extend_from_slice(&input.sequence.to_le_bytes());
        preimage.extend_from_slice(&self.hash_outputs);
        preimage.extend_from_slice(&tx.lock_time().to_le_bytes());
        preimage.extend_from_slice(&SIGHASH_ALL.to_le_bytes());

        Ok(sha256d(&preimage))
    }

    /// Digest for input `index` using the script code implied by its spend condition.
    pub fn input_hash(&self, tx: &UnsignedTransaction, index: usize) -> Result<[u8; HASH_SIZE]> {
        let input = tx.inputs().get(index).ok_or_else(|| {
            KestrelError::ValidationError(format!("input {} out of range", index))
        })?;
        self.signature_hash(tx, index, &script_code(input)?)
    }
}

/// Pre-segwit `SIGHASH_ALL` digest of input `index`.
fn legacy_signature_hash(tx: &UnsignedTransaction, index: usize, script_code: &[u8]) -> [u8; HASH_SIZE] {
    let script_sigs: Vec<Vec<u8>> = (0..tx.inputs().len())
        .map(|i| if i == index { script_code.to_vec() } else { Vec::new() })
        .collect();
    let mut preimage = encode(tx, &script_sigs, &[], false);
    preimage.extend_from_slice(&SIGHASH_ALL.to_le_bytes());
    sha256d(&preimage)
}

/// True if `input` is spent through the witness.
pub fn is_witness_input(input: &TxInput) -> bool {
    script::classify_script_pubkey(&input.script_pubkey)
        .map_or(input.script_type.is_segwit(), |(script_type, _)| script_type.is_segwit())
}

/// Digests for every input of `tx`.
pub fn all_input_hashes(tx: &UnsignedTransaction) -> Result<Vec<[u8; HASH_SIZE]>> {
    let cache = SighashCache::new(tx);
    (0..tx.inputs().len())
        .map(|i| cache.input_hash(tx, i))
        .collect()
}

/// Script code committed to when signing `input`.
///
/// Key-hash inputs use the P2PKH template of their key hash; multisig inputs
/// use the redeem script.
pub fn script_code(input: &TxInput) -> Result<Vec<u8>> {
    match &input.spend {
        SpendCondition::Multisig { redeem_script } => Ok(redeem_script.clone()),
        SpendCondition::SingleKey { .. } => {
            let (script_type, payload) = script::classify_script_pubkey(&input.script_pubkey)
                .ok_or_else(|| {
                    KestrelError::InvalidScript(format!(
                        "input {} has a non-standard locking script",
                        input.outpoint
                    ))
                })?;
            match script_type {
                ScriptType::P2pkh | ScriptType::P2wpkh => {
                    let mut hash = [0u8; HASH160_SIZE];
                    hash.copy_from_slice(&payload);
                    Ok(script::p2pkh(&hash))
                }
                other => Err(KestrelError::InvalidScript(format!(
                    "single-key spend of a {} output",
                    other
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{TxOutput, SEQUENCE_FINAL};
    use kestrel_core::types::{OutPoint, Txid};

    fn tx(amount: u64, lock_time: u32) -> UnsignedTransaction {
        let input = TxInput {
            outpoint: OutPoint::new(Txid::from_bytes([4; 32]), 1),
            amount,
            script_pubkey: script::p2wpkh(&[5; 20]),
            script_type: ScriptType::P2wpkh,
            spend: SpendCondition::default(),
            sequence: SEQUENCE_FINAL,
        };
        let output = TxOutput {
            address: String::new(),
            script_pubkey: script::p2wpkh(&[6; 20]),
            amount: amount - 1000,
        };
        UnsignedTransaction::new(vec![input], vec![output], 1000, lock_time, None).unwrap()
    }

    #[test]
    fn test_commits_to_amount_and_lock_time() {
        let base = all_input_hashes(&tx(50_000, 0)).unwrap();
        assert_ne!(base, all_input_hashes(&tx(60_000, 0)).unwrap());
        assert_ne!(base, all_input_hashes(&tx(50_000, 1)).unwrap());
        assert_eq!(base, all_input_hashes(&tx(50_000, 0)).unwrap());
    }

    #[test]
    fn test_script_code_for_wpkh_is_p2pkh_template() {
        let t = tx(10_000, 0);
        assert_eq!(script_code(&t.inputs()[0]).unwrap(), script::p2pkh(&[5; 20]));
    }

    fn legacy_tx(amount: u64) -> UnsignedTransaction {
        let input = TxInput {
            outpoint: OutPoint::new(Txid::from_bytes([4; 32]), 1),
            amount,
            script_pubkey: script::p2pkh(&[5; 20]),
            script_type: ScriptType::P2pkh,
            spend: SpendCondition::default(),
            sequence: SEQUENCE_FINAL,
        };
        let output = TxOutput {
            address: String::new(),
            script_pubkey: script::p2wpkh(&[6; 20]),
            amount: 40_000,
        };
        UnsignedTransaction::new(vec![input], vec![output], amount - 40_000, 0, None).unwrap()
    }

    #[test]
    fn test_legacy_digest_layout() {
        let t = legacy_tx(50_000);
        let code = script::p2pkh(&[5; 20]);

        let mut preimage = Vec::new();
        preimage.extend_from_slice(&t.version().to_le_bytes());
        preimage.push(1);
        preimage.extend_from_slice(&[4; 32]);
        preimage.extend_from_slice(&1u32.to_le_bytes());
        preimage.push(code.len() as u8);
        preimage.extend_from_slice(&code);
        preimage.extend_from_slice(&SEQUENCE_FINAL.to_le_bytes());
        preimage.push(1);
        preimage.extend_from_slice(&40_000u64.to_le_bytes());
        let out_script = script::p2wpkh(&[6; 20]);
        preimage.push(out_script.len() as u8);
        preimage.extend_from_slice(&out_script);
        preimage.extend_from_slice(&0u32.to_le_bytes());
        preimage.extend_from_slice(&SIGHASH_ALL.to_le_bytes());

        assert_eq!(all_input_hashes(&t).unwrap(), vec![sha256d(&preimage)]);
    }

    #[test]
    fn test_legacy_digest_ignores_amount() {
        // Pre-segwit digests do not commit to the spent value.
        assert_eq!(
            all_input_hashes(&legacy_tx(50_000)).unwrap(),
            all_input_hashes(&legacy_tx(60_000)).unwrap()
        );
        assert!(!is_witness_input(&legacy_tx(50_000).inputs()[0]));
        assert!(is_witness_input(&tx(50_000, 0).inputs()[0]));
    }

    #[test]
    fn test_out_of_range_input() {
        let t = tx(10_000, 0);
        assert!(SighashCache::new(&t).input_hash(&t, 3).is_err());
    }
}
