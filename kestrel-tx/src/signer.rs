//! Signing and verification.

use std::collections::HashMap;

use tracing::{debug, instrument, warn};

use kestrel_address::script::{self, push_slice};
use kestrel_core::constants::{HASH160_SIZE, HASH_SIZE};
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{PublicKey, ScriptType, Signature, SpendCondition};
use kestrel_crypto::{from_der, hash160, sha256, to_der, verify, ExtendedPrivateKey};

use crate::sighash::{SighashCache, SIGHASH_ALL};
use crate::transaction::{SignedTransaction, UnsignedTransaction};

/// Supplies the signatures of multisig inputs.
///
/// Implemented by the multisig coordinator (collected partial signatures) and
/// by the channel manager (local plus counterparty funding signatures).
pub trait MultisigWitnessSource {
    /// Signatures for input `index`, ordered by the signer's position in
    /// `redeem_script`. Returning fewer than the threshold makes signing
    /// fail with `IncompleteSignatures`.
    fn multisig_signatures(
        &self,
        index: usize,
        redeem_script: &[u8],
        sighash: &[u8; HASH_SIZE],
    ) -> Result<Vec<Signature>>;
}

/// Transaction signer and verifier.
pub struct Signer;

impl Signer {
    /// Signs every input of `unsigned`.
    ///
    /// Single-key inputs use the key in `keys` whose HASH160 matches the
    /// locking script; multisig inputs ask `multisig`. The result is verified
    /// before it is returned.
    ///
    /// # Errors
    /// - `MissingSigningKey(index)` if no key matches a single-key input
    /// - `IncompleteSignatures` if a multisig input lacks its threshold
    /// - `VerificationFailed` if the assembled transaction does not verify
    #[instrument(skip_all, fields(inputs = unsigned.inputs().len()))]
    pub fn sign(
        unsigned: UnsignedTransaction,
        keys: &[ExtendedPrivateKey],
        multisig: Option<&dyn MultisigWitnessSource>,
    ) -> Result<SignedTransaction> {
        let ring: HashMap<[u8; HASH160_SIZE], &ExtendedPrivateKey> = keys
            .iter()
            .map(|k| (hash160(k.public_key().as_bytes()), k))
            .collect();

        let cache = SighashCache::new(&unsigned);
        let mut script_sigs = Vec::with_capacity(unsigned.inputs().len());
        let mut witnesses = Vec::with_capacity(unsigned.inputs().len());

        for (index, input) in unsigned.inputs().iter().enumerate() {
            let sighash = cache.input_hash(&unsigned, index)?;
            let (script_type, payload) = script::classify_script_pubkey(&input.script_pubkey)
                .ok_or_else(|| {
                    KestrelError::InvalidScript(format!("input {} is non-standard", index))
                })?;

            match &input.spend {
                SpendCondition::SingleKey { .. } => {
                    let mut hash = [0u8; HASH160_SIZE];
                    hash.copy_from_slice(&payload);
                    let key = ring
                        .get(&hash)
                        .ok_or(KestrelError::MissingSigningKey(index))?;
                    let sig = encode_signature(&key.sign(&sighash)?)?;
                    let pubkey = key.public_key().as_bytes().to_vec();

                    match script_type {
                        ScriptType::P2pkh => {
                            let mut script_sig = Vec::new();
                            push_slice(&mut script_sig, &sig);
                            push_slice(&mut script_sig, &pubkey);
                            script_sigs.push(script_sig);
                            witnesses.push(Vec::new());
                        }
                        _ => {
                            script_sigs.push(Vec::new());
                            witnesses.push(vec![sig, pubkey]);
                        }
                    }
                }
                SpendCondition::Multisig { redeem_script } => {
                    let (m, _) = script::parse_multisig(redeem_script)?;
                    let sigs = match multisig {
                        Some(source) => source.multisig_signatures(index, redeem_script, &sighash)?,
                        None => Vec::new(),
                    };
                    if sigs.len() < m {
                        return Err(KestrelError::IncompleteSignatures {
                            collected: sigs.len(),
                            required: m,
                        });
                    }

                    let mut stack = vec![Vec::new()];
                    for sig in sigs.iter().take(m) {
                        stack.push(encode_signature(sig)?);
                    }
                    stack.push(redeem_script.clone());

                    match script_type {
                        ScriptType::P2wsh => {
                            script_sigs.push(Vec::new());
                            witnesses.push(stack);
                        }
                        _ => {
                            let mut script_sig = Vec::new();
                            for item in &stack {
                                push_slice(&mut script_sig, item);
                            }
                            script_sigs.push(script_sig);
                            witnesses.push(Vec::new());
                        }
                    }
                }
            }
        }

        let signed = SignedTransaction::assemble(unsigned, script_sigs, witnesses);
        for index in 0..signed.inputs().len() {
            Self::verify_input(&signed, &cache, index)?;
        }
        debug!(txid = %signed.txid(), "Transaction signed");
        Ok(signed)
    }

    /// True if every input's witness checks against its locking script.
    pub fn verify(signed: &SignedTransaction) -> bool {
        let cache = SighashCache::new(signed.unsigned());
        (0..signed.inputs().len()).all(|index| match Self::verify_input(signed, &cache, index) {
            Ok(()) => true,
            Err(e) => {
                warn!(txid = %signed.txid(), index, error = %e, "Input failed verification");
                false
            }
        })
    }

    fn verify_input(signed: &SignedTransaction, cache: &SighashCache, index: usize) -> Result<()> {
        let fail = |why: String| KestrelError::VerificationFailed(format!("input {}: {}", index, why));
        let input = &signed.inputs()[index];
        let (script_type, payload) = script::classify_script_pubkey(&input.script_pubkey)
            .ok_or_else(|| fail("non-standard locking script".into()))?;

        let items: Vec<Vec<u8>> = match script_type {
            ScriptType::P2pkh | ScriptType::P2sh | ScriptType::MultisigRedeem => {
                if !signed.witness(index).is_empty() {
                    return Err(fail("unexpected witness".into()));
                }
                script::parse_pushes(signed.script_sig(index)).map_err(|e| fail(e.to_string()))?
            }
            ScriptType::P2wpkh | ScriptType::P2wsh => {
                if !signed.script_sig(index).is_empty() {
                    return Err(fail("witness input with a scriptSig".into()));
                }
                signed.witness(index).to_vec()
            }
        };

        match script_type {
            ScriptType::P2pkh | ScriptType::P2wpkh => {
                let [sig, pubkey] = items.as_slice() else {
                    return Err(fail(format!("expected 2 stack items, got {}", items.len())));
                };
                if hash160(pubkey).as_slice() != payload.as_slice() {
                    return Err(fail("public key does not match key hash".into()));
                }
                let pubkey = PublicKey::from_bytes(pubkey).map_err(|e| fail(e.to_string()))?;
                let script_code = script::p2pkh(&hash160(pubkey.as_bytes()));
                let sighash = cache.signature_hash(signed.unsigned(), index, &script_code)?;
                if !verify(&pubkey, &sighash, &decode_signature(sig).map_err(|e| fail(e.to_string()))?) {
                    return Err(fail("bad signature".into()));
                }
                Ok(())
            }
            ScriptType::P2sh | ScriptType::P2wsh | ScriptType::MultisigRedeem => {
                let Some((redeem, rest)) = items.split_last() else {
                    return Err(fail("empty stack".into()));
                };
                let commits = if script_type == ScriptType::P2wsh {
                    sha256(redeem).as_slice() == payload.as_slice()
                } else {
                    hash160(redeem).as_slice() == payload.as_slice()
                };
                if !commits {
                    return Err(fail("redeem script does not match script hash".into()));
                }
                let sighash = cache.signature_hash(signed.unsigned(), index, redeem)?;
                check_multisig(rest, redeem, &sighash).map_err(|e| fail(e.to_string()))
            }
        }
    }
}

/// CHECKMULTISIG semantics: after the dummy element, exactly `m` signatures,
/// each matching a key strictly after the key matched by the previous one.
fn check_multisig(stack: &[Vec<u8>], redeem: &[u8], sighash: &[u8; HASH_SIZE]) -> Result<()> {
    let (m, keys) = script::parse_multisig(redeem)?;
    let Some((dummy, sigs)) = stack.split_first() else {
        return Err(KestrelError::VerificationFailed("missing dummy element".into()));
    };
    if !dummy.is_empty() {
        return Err(KestrelError::VerificationFailed("dummy element must be empty".into()));
    }
    if sigs.len() != m {
        return Err(KestrelError::VerificationFailed(format!(
            "expected {} signatures, got {}",
            m,
            sigs.len()
        )));
    }

    let mut key_index = 0;
    for raw in sigs {
        let sig = decode_signature(raw)?;
        loop {
            let Some(key) = keys.get(key_index) else {
                return Err(KestrelError::VerificationFailed(
                    "signatures out of key order or invalid".into(),
                ));
            };
            key_index += 1;
            if verify(key, sighash, &sig) {
                break;
            }
        }
    }
    Ok(())
}

fn encode_signature(sig: &Signature) -> Result<Vec<u8>> {
    let mut der = to_der(sig)?;
    der.push(SIGHASH_ALL as u8);
    Ok(der)
}

fn decode_signature(raw: &[u8]) -> Result<Signature> {
    match raw.split_last() {
        Some((&flag, der)) if flag as u32 == SIGHASH_ALL => from_der(der),
        _ => Err(KestrelError::VerificationFailed(
            "missing SIGHASH_ALL flag".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{TxInput, TxOutput, SEQUENCE_FINAL};
    use kestrel_core::types::{ChildNumber, OutPoint, Txid};
    use kestrel_crypto::Seed;

    fn key(i: u32) -> ExtendedPrivateKey {
        ExtendedPrivateKey::from_seed(&Seed::from_bytes(&[0x21; 32]).unwrap())
            .unwrap()
            .derive_child(ChildNumber::Normal(i))
            .unwrap()
    }

    fn single_input(key: &ExtendedPrivateKey, script_type: ScriptType, amount: u64) -> TxInput {
        let hash = hash160(key.public_key().as_bytes());
        let script_pubkey = match script_type {
            ScriptType::P2pkh => script::p2pkh(&hash),
            _ => script::p2wpkh(&hash),
        };
        TxInput {
            outpoint: OutPoint::new(Txid::from_bytes([amount as u8; 32]), 0),
            amount,
            script_pubkey,
            script_type,
            spend: SpendCondition::default(),
            sequence: SEQUENCE_FINAL,
        }
    }

    fn pay(amount: u64) -> TxOutput {
        TxOutput {
            address: String::new(),
            script_pubkey: script::p2wpkh(&[0x33; 20]),
            amount,
        }
    }

    /// Signs with fixed keys, in the order given.
    struct FixedSigners(Vec<ExtendedPrivateKey>);

    impl MultisigWitnessSource for FixedSigners {
        fn multisig_signatures(
            &self,
            _index: usize,
            _redeem_script: &[u8],
            sighash: &[u8; HASH_SIZE],
        ) -> Result<Vec<Signature>> {
            self.0.iter().map(|k| k.sign(sighash)).collect()
        }
    }

    fn multisig_tx(script_type: ScriptType) -> (UnsignedTransaction, Vec<ExtendedPrivateKey>) {
        let mut keys: Vec<ExtendedPrivateKey> = (0..3).map(key).collect();
        keys.sort_by(|a, b| a.public_key().cmp(b.public_key()));
        let pubs: Vec<PublicKey> = keys.iter().map(|k| *k.public_key()).collect();
        let redeem = script::multisig_redeem(2, &pubs).unwrap();
        let script_pubkey = match script_type {
            ScriptType::P2wsh => script::p2wsh(&sha256(&redeem)),
            _ => script::p2sh(&hash160(&redeem)),
        };
        let input = TxInput {
            outpoint: OutPoint::new(Txid::from_bytes([9; 32]), 1),
            amount: 80_000,
            script_pubkey,
            script_type,
            spend: SpendCondition::Multisig { redeem_script: redeem },
            sequence: SEQUENCE_FINAL,
        };
        let unsigned = UnsignedTransaction::new(vec![input], vec![pay(79_000)], 1_000, 0, None).unwrap();
        (unsigned, keys)
    }

    #[test]
    fn test_sign_and_verify_single_key_inputs() {
        let (a, b) = (key(0), key(1));
        let unsigned = UnsignedTransaction::new(
            vec![
                single_input(&a, ScriptType::P2wpkh, 30_000),
                single_input(&b, ScriptType::P2pkh, 20_000),
            ],
            vec![pay(49_000)],
            1_000,
            0,
            None,
        )
        .unwrap();
        let signed = Signer::sign(unsigned, &[a, b], None).unwrap();
        assert!(Signer::verify(&signed));
        assert!(signed.script_sig(0).is_empty());
        assert_eq!(signed.witness(0).len(), 2);
        assert!(signed.witness(1).is_empty());
    }

    #[test]
    fn test_missing_key() {
        let (a, b) = (key(0), key(1));
        let unsigned = UnsignedTransaction::new(
            vec![single_input(&a, ScriptType::P2wpkh, 30_000), single_input(&b, ScriptType::P2wpkh, 5_000)],
            vec![pay(34_000)],
            1_000,
            0,
            None,
        )
        .unwrap();
        assert!(matches!(
            Signer::sign(unsigned, &[a], None),
            Err(KestrelError::MissingSigningKey(1))
        ));
    }

    #[test]
    fn test_multisig_p2wsh_and_p2sh() {
        for script_type in [ScriptType::P2wsh, ScriptType::P2sh] {
            let (unsigned, keys) = multisig_tx(script_type);
            let source = FixedSigners(vec![keys[0].clone(), keys[2].clone()]);
            let signed = Signer::sign(unsigned, &[], Some(&source)).unwrap();
            assert!(Signer::verify(&signed));
        }
    }

    #[test]
    fn test_multisig_order_enforced() {
        let (unsigned, keys) = multisig_tx(ScriptType::P2wsh);
        let reversed = FixedSigners(vec![keys[2].clone(), keys[0].clone()]);
        assert!(matches!(
            Signer::sign(unsigned, &[], Some(&reversed)),
            Err(KestrelError::VerificationFailed(_))
        ));
    }

    #[test]
    fn test_multisig_below_threshold() {
        let (unsigned, keys) = multisig_tx(ScriptType::P2wsh);
        let one = FixedSigners(vec![keys[1].clone()]);
        assert!(matches!(
            Signer::sign(unsigned.clone(), &[], Some(&one)),
            Err(KestrelError::IncompleteSignatures { collected: 1, required: 2 })
        ));
        assert!(matches!(
            Signer::sign(unsigned, &[], None),
            Err(KestrelError::IncompleteSignatures { collected: 0, required: 2 })
        ));
    }
}
