//! On-chain transactions of a channel.
//!
//! Both parties build the same commitment and settlement transactions from
//! their own view of the channel. Outputs are laid out funder first, then the
//! other party, then HTLCs by index, so the two views hash identically:
//!
//! ```text
//! input:   funding outpoint (2-of-2 P2WSH)
//! outputs: funder balance - fee   (P2WPKH, funder funding key)
//!          other balance          (P2WPKH, other funding key)
//!          htlc 0..n              (P2WSH of the HTLC script)
//! fee:     capacity - Σoutputs    (dust outputs fall into the fee)
//! ```
//!
//! Revocation and penalty scripts are not built; a force close records the
//! dispute window instead.

use kestrel_address::script::{opcodes, push_slice};
use kestrel_address::{multisig_redeem, parse_multisig, Address, AddressCodec, AddressSource};
use kestrel_core::constants::{DUST_P2WPKH, DUST_P2WSH, HASH_SIZE};
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{
    checked_sum, ChannelId, ChannelRecord, Commitment, Htlc, HtlcDirection, Network, OutPoint,
    PaymentHash, PublicKey, ScriptType, Signature, SpendCondition,
};
use kestrel_crypto::{sha256, ExtendedPrivateKey};
use kestrel_tx::transaction::SEQUENCE_FINAL;
use kestrel_tx::{
    MultisigWitnessSource, SighashCache, SignedTransaction, Signer, TxInput, TxOutput,
    UnsignedTransaction,
};

const OP_IF: u8 = 0x63;
const OP_ELSE: u8 = 0x67;
const OP_ENDIF: u8 = 0x68;
const OP_DROP: u8 = 0x75;
const OP_SHA256: u8 = 0xa8;
const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;

/// One party's view of the fixed parameters of a funded channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelParams {
    /// Channel id
    pub channel_id: ChannelId,
    /// Network addresses are encoded for
    pub network: Network,
    /// Funding amount
    pub capacity: u64,
    /// True if this view belongs to the funder
    pub is_funder: bool,
    /// Funding output
    pub funding_outpoint: OutPoint,
    /// 2-of-2 redeem script of the funding output
    pub funding_script: Vec<u8>,
    /// This party's funding key
    pub local_key: PublicKey,
    /// The other party's funding key
    pub remote_key: PublicKey,
}

impl ChannelParams {
    /// Parameters of a stored channel.
    ///
    /// # Errors
    /// `ChannelNotOpen` if the funding transaction has not been built.
    pub fn from_record(record: &ChannelRecord, network: Network) -> Result<Self> {
        let funding_outpoint = record.funding_outpoint.ok_or_else(|| {
            KestrelError::ChannelNotOpen(format!("channel {} has no funding output", record.id))
        })?;
        Ok(Self {
            channel_id: record.id,
            network,
            capacity: record.capacity,
            is_funder: record.is_funder,
            funding_outpoint,
            funding_script: record.funding_script.clone(),
            local_key: record.local_funding_key,
            remote_key: record.remote_funding_key,
        })
    }

    /// The same channel seen from the other side.
    pub fn mirrored(&self) -> Self {
        Self {
            is_funder: !self.is_funder,
            local_key: self.remote_key,
            remote_key: self.local_key,
            ..self.clone()
        }
    }

    fn funder_key(&self) -> PublicKey {
        if self.is_funder {
            self.local_key
        } else {
            self.remote_key
        }
    }

    fn fundee_key(&self) -> PublicKey {
        if self.is_funder {
            self.remote_key
        } else {
            self.local_key
        }
    }
}

/// The same commitment seen from the other side: balances swapped, HTLC
/// directions flipped, no signature.
pub fn mirror_commitment(commitment: &Commitment) -> Commitment {
    Commitment {
        version: commitment.version,
        local_balance: commitment.remote_balance,
        remote_balance: commitment.local_balance,
        htlcs: commitment
            .htlcs
            .iter()
            .map(|(index, htlc)| {
                let direction = match htlc.direction {
                    HtlcDirection::Offered => HtlcDirection::Received,
                    HtlcDirection::Received => HtlcDirection::Offered,
                };
                (
                    *index,
                    Htlc {
                        direction,
                        forwarded_from: None,
                        ..htlc.clone()
                    },
                )
            })
            .collect(),
        remote_signature: None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCRIPTS
// ═══════════════════════════════════════════════════════════════════════════════

/// 2-of-2 funding redeem script with keys in BIP67 order.
///
/// # Errors
/// `ValidationError` if both keys are the same.
pub fn funding_script(a: &PublicKey, b: &PublicKey) -> Result<Vec<u8>> {
    if a == b {
        return Err(KestrelError::ValidationError(
            "funding keys must be distinct".into(),
        ));
    }
    let mut keys = [*a, *b];
    keys.sort();
    multisig_redeem(2, &keys)
}

/// P2WSH address of a funding redeem script.
pub fn funding_address(script: &[u8], network: Network) -> Result<Address> {
    AddressCodec::encode(AddressSource::Script(script), network, ScriptType::P2wsh)
}

/// HTLC witness script.
///
/// ```text
/// OP_IF
///     OP_SHA256 <payment_hash> OP_EQUALVERIFY <receiver>
/// OP_ELSE
///     <expiry> OP_CHECKLOCKTIMEVERIFY OP_DROP <sender>
/// OP_ENDIF
/// OP_CHECKSIG
/// ```
pub fn htlc_script(
    payment_hash: &PaymentHash,
    expiry: u32,
    receiver: &PublicKey,
    sender: &PublicKey,
) -> Vec<u8> {
    let mut s = Vec::with_capacity(2 * 34 + HASH_SIZE + 16);
    s.push(OP_IF);
    s.push(OP_SHA256);
    push_slice(&mut s, &payment_hash.0);
    s.push(opcodes::OP_EQUALVERIFY);
    push_slice(&mut s, receiver.as_bytes());
    s.push(OP_ELSE);
    push_number(&mut s, expiry);
    s.extend_from_slice(&[OP_CHECKLOCKTIMEVERIFY, OP_DROP]);
    push_slice(&mut s, sender.as_bytes());
    s.push(OP_ENDIF);
    s.push(opcodes::OP_CHECKSIG);
    s
}

/// Minimal script-number push.
fn push_number(script: &mut Vec<u8>, n: u32) {
    match n {
        0 => script.push(opcodes::OP_0),
        1..=16 => script.push(opcodes::OP_1 + (n as u8) - 1),
        _ => {
            let mut bytes: Vec<u8> = n.to_le_bytes().to_vec();
            while bytes.len() > 1 && bytes[bytes.len() - 1] == 0 && bytes[bytes.len() - 2] & 0x80 == 0 {
                bytes.pop();
            }
            if bytes[bytes.len() - 1] & 0x80 != 0 {
                bytes.push(0);
            }
            push_slice(script, &bytes);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSACTIONS
// ═══════════════════════════════════════════════════════════════════════════════

fn funding_input(params: &ChannelParams) -> TxInput {
    TxInput {
        outpoint: params.funding_outpoint,
        amount: params.capacity,
        script_pubkey: kestrel_address::script::p2wsh(&sha256(&params.funding_script)),
        script_type: ScriptType::P2wsh,
        spend: SpendCondition::Multisig {
            redeem_script: params.funding_script.clone(),
        },
        sequence: SEQUENCE_FINAL,
    }
}

fn key_output(key: &PublicKey, amount: u64, network: Network) -> Result<Option<TxOutput>> {
    if amount < DUST_P2WPKH {
        return Ok(None);
    }
    let address = AddressCodec::encode(AddressSource::PublicKey(key), network, ScriptType::P2wpkh)?;
    Ok(Some(TxOutput::to_address(&address, amount)))
}

fn balance_outputs(
    params: &ChannelParams,
    local: u64,
    remote: u64,
    fee: u64,
) -> Result<Vec<TxOutput>> {
    let (funder_balance, fundee_balance) = if params.is_funder {
        (local, remote)
    } else {
        (remote, local)
    };
    let funder_balance = funder_balance.checked_sub(fee).ok_or(
        KestrelError::InsufficientChannelBalance {
            needed: fee,
            available: funder_balance,
        },
    )?;

    let outputs = [
        key_output(&params.funder_key(), funder_balance, params.network)?,
        key_output(&params.fundee_key(), fundee_balance, params.network)?,
    ];
    Ok(outputs.into_iter().flatten().collect())
}

fn balanced(params: &ChannelParams, outputs: Vec<TxOutput>) -> Result<UnsignedTransaction> {
    if outputs.is_empty() {
        return Err(KestrelError::ValidationError(format!(
            "channel {}: every output is dust",
            params.channel_id
        )));
    }
    let paid = checked_sum(outputs.iter().map(|o| o.amount))?;
    let fee = params.capacity.checked_sub(paid).ok_or_else(|| {
        KestrelError::IntegrityViolation(format!(
            "channel {}: outputs {} exceed capacity {}",
            params.channel_id, paid, params.capacity
        ))
    })?;
    UnsignedTransaction::new(vec![funding_input(params)], outputs, fee, 0, None)
}

/// Commitment transaction for `commitment`, with `fee` taken from the funder.
///
/// # Errors
/// - `IntegrityViolation` if the balances do not add up to the capacity
/// - `InsufficientChannelBalance` if the funder cannot cover `fee`
pub fn commitment_transaction(
    params: &ChannelParams,
    commitment: &Commitment,
    fee: u64,
) -> Result<UnsignedTransaction> {
    if commitment.total() != Some(params.capacity) {
        return Err(KestrelError::IntegrityViolation(format!(
            "channel {}: commitment {} does not add up to capacity {}",
            params.channel_id, commitment.version, params.capacity
        )));
    }

    let mut outputs = balance_outputs(
        params,
        commitment.local_balance,
        commitment.remote_balance,
        fee,
    )?;
    for htlc in commitment.htlcs.values() {
        if htlc.amount < DUST_P2WSH {
            continue;
        }
        let (sender, receiver) = match htlc.direction {
            HtlcDirection::Offered => (params.local_key, params.remote_key),
            HtlcDirection::Received => (params.remote_key, params.local_key),
        };
        let script = htlc_script(&htlc.payment_hash, htlc.expiry, &receiver, &sender);
        let address = Address::from_payload(params.network, ScriptType::P2wsh, &sha256(&script))?;
        outputs.push(TxOutput::to_address(&address, htlc.amount));
    }
    balanced(params, outputs)
}

/// Cooperative settlement paying the given balances, `fee` taken from the funder.
pub fn settlement_transaction(
    params: &ChannelParams,
    local: u64,
    remote: u64,
    fee: u64,
) -> Result<UnsignedTransaction> {
    let total = local.checked_add(remote).ok_or(KestrelError::AmountOverflow)?;
    if total != params.capacity {
        return Err(KestrelError::IntegrityViolation(format!(
            "channel {}: settlement pays {} of capacity {}",
            params.channel_id, total, params.capacity
        )));
    }
    let outputs = balance_outputs(params, local, remote, fee)?;
    balanced(params, outputs)
}

/// Digest both parties sign: the BIP143 hash of the funding input.
pub fn signing_digest(tx: &UnsignedTransaction) -> Result<[u8; HASH_SIZE]> {
    SighashCache::new(tx).input_hash(tx, 0)
}

/// Local and remote funding signatures, handed out in redeem-script order.
struct FundingSignatures {
    local: (PublicKey, Signature),
    remote: (PublicKey, Signature),
}

impl MultisigWitnessSource for FundingSignatures {
    fn multisig_signatures(
        &self,
        _index: usize,
        redeem_script: &[u8],
        _sighash: &[u8; HASH_SIZE],
    ) -> Result<Vec<Signature>> {
        let (_, keys) = parse_multisig(redeem_script)?;
        keys.iter()
            .map(|key| {
                if *key == self.local.0 {
                    Ok(self.local.1)
                } else if *key == self.remote.0 {
                    Ok(self.remote.1)
                } else {
                    Err(KestrelError::UnknownSigner(key.to_hex()))
                }
            })
            .collect()
    }
}

/// Signs the funding input with `local_key` and completes it with the
/// counterparty's signature.
///
/// # Errors
/// `VerificationFailed` if `remote_signature` does not verify.
pub fn complete_transaction(
    tx: UnsignedTransaction,
    params: &ChannelParams,
    local_key: &ExtendedPrivateKey,
    remote_signature: Signature,
) -> Result<SignedTransaction> {
    let digest = signing_digest(&tx)?;
    let source = FundingSignatures {
        local: (*local_key.public_key(), local_key.sign(&digest)?),
        remote: (params.remote_key, remote_signature),
    };
    Signer::sign(tx, &[], Some(&source as &dyn MultisigWitnessSource))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use kestrel_core::types::{ChildNumber, Txid};
    use kestrel_crypto::Seed;

    fn key(n: u8) -> ExtendedPrivateKey {
        let master = ExtendedPrivateKey::from_seed(&Seed::from_bytes(&[n; 32]).unwrap()).unwrap();
        master.derive_child(ChildNumber::Hardened(0)).unwrap()
    }

    fn params(local: &ExtendedPrivateKey, remote: &ExtendedPrivateKey) -> ChannelParams {
        let local_key = *local.public_key();
        let remote_key = *remote.public_key();
        ChannelParams {
            channel_id: ChannelId::from_bytes([7; 32]),
            network: Network::Regtest,
            capacity: 1_000_000,
            is_funder: true,
            funding_outpoint: OutPoint::new(Txid::from_bytes([1; 32]), 0),
            funding_script: funding_script(&local_key, &remote_key).unwrap(),
            local_key,
            remote_key,
        }
    }

    fn commitment(local: u64, remote: u64, htlcs: Vec<Htlc>) -> Commitment {
        Commitment {
            version: 1,
            local_balance: local,
            remote_balance: remote,
            htlcs: htlcs.into_iter().map(|h| (h.index, h)).collect::<BTreeMap<_, _>>(),
            remote_signature: None,
        }
    }

    fn offered(index: u64, amount: u64) -> Htlc {
        Htlc {
            index,
            payment_hash: PaymentHash([index as u8; 32]),
            amount,
            expiry: 500,
            direction: HtlcDirection::Offered,
            forwarded_from: None,
        }
    }

    #[test]
    fn test_funding_script_order_independent() {
        let (a, b) = (key(1), key(2));
        assert_eq!(
            funding_script(a.public_key(), b.public_key()).unwrap(),
            funding_script(b.public_key(), a.public_key()).unwrap()
        );
        assert!(funding_script(a.public_key(), a.public_key()).is_err());
    }

    #[test]
    fn test_both_views_sign_same_digest() {
        let (a, b) = (key(1), key(2));
        let ours = params(&a, &b);
        let state = commitment(800_000, 100_000, vec![offered(0, 100_000)]);

        let tx = commitment_transaction(&ours, &state, 500).unwrap();
        let theirs = commitment_transaction(&ours.mirrored(), &mirror_commitment(&state), 500).unwrap();
        assert_eq!(signing_digest(&tx).unwrap(), signing_digest(&theirs).unwrap());
    }

    #[test]
    fn test_commitment_layout() {
        let (a, b) = (key(1), key(2));
        let p = params(&a, &b);
        let tx = commitment_transaction(&p, &commitment(800_000, 100_000, vec![offered(0, 100_000)]), 500)
            .unwrap();

        let amounts: Vec<u64> = tx.outputs().iter().map(|o| o.amount).collect();
        assert_eq!(amounts, vec![799_500, 100_000, 100_000]);
        assert_eq!(tx.fee(), 500);
        assert_eq!(tx.outputs()[2].script_type(), Some(ScriptType::P2wsh));
    }

    #[test]
    fn test_dust_htlc_goes_to_fee() {
        let (a, b) = (key(1), key(2));
        let p = params(&a, &b);
        let tx = commitment_transaction(&p, &commitment(999_900, 0, vec![offered(0, 100)]), 500).unwrap();
        assert_eq!(tx.outputs().len(), 1);
        assert_eq!(tx.fee(), 600);
    }

    #[test]
    fn test_unbalanced_commitment_refused() {
        let (a, b) = (key(1), key(2));
        let err = commitment_transaction(&params(&a, &b), &commitment(10, 10, vec![]), 0).unwrap_err();
        assert!(matches!(err, KestrelError::IntegrityViolation(_)));
    }

    #[test]
    fn test_settlement_fee_from_funder() {
        let (a, b) = (key(1), key(2));
        let mut p = params(&a, &b);
        let tx = settlement_transaction(&p, 600_000, 400_000, 1_000).unwrap();
        assert_eq!(tx.outputs()[0].amount, 599_000);
        assert_eq!(tx.outputs()[1].amount, 400_000);

        p.is_funder = false;
        let tx = settlement_transaction(&p, 600_000, 400_000, 1_000).unwrap();
        assert_eq!(tx.outputs()[0].amount, 399_000);
        assert_eq!(tx.outputs()[1].amount, 600_000);
    }

    #[test]
    fn test_complete_verifies() {
        let (a, b) = (key(1), key(2));
        let p = params(&a, &b);
        let tx = settlement_transaction(&p, 500_000, 500_000, 1_000).unwrap();
        let remote_sig = b.sign(&signing_digest(&tx).unwrap()).unwrap();

        let signed = complete_transaction(tx.clone(), &p, &a, remote_sig).unwrap();
        assert!(Signer::verify(&signed));

        let wrong = key(3).sign(&signing_digest(&tx).unwrap()).unwrap();
        assert!(complete_transaction(tx, &p, &a, wrong).is_err());
    }

    #[test]
    fn test_script_numbers() {
        let mut s = Vec::new();
        push_number(&mut s, 16);
        assert_eq!(s, vec![0x60]);

        let mut s = Vec::new();
        push_number(&mut s, 500);
        assert_eq!(s, vec![0x02, 0xf4, 0x01]);

        let mut s = Vec::new();
        push_number(&mut s, 128);
        assert_eq!(s, vec![0x02, 0x80, 0x00]);
    }
}
