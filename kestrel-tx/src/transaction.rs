//! Transaction model and wire serialization.

use serde::{Deserialize, Serialize};

use kestrel_address::{classify_script_pubkey, Address, AddressCodec};
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{checked_sum, OutPoint, ScriptType, SpendCondition, Txid, Utxo};
use kestrel_crypto::sha256d;

/// Transaction version written on the wire.
pub const TX_VERSION: i32 = 2;

/// Final sequence (no RBF, no relative lock).
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// Sequence signalling replace-by-fee.
pub const SEQUENCE_RBF: u32 = 0xffff_fffd;

// ═══════════════════════════════════════════════════════════════════════════════
// INPUTS / OUTPUTS
// ═══════════════════════════════════════════════════════════════════════════════

/// An input: the spent output plus what it takes to spend it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Spent output
    pub outpoint: OutPoint,
    /// Value of the spent output
    pub amount: u64,
    /// Locking script of the spent output
    #[serde(with = "hex")]
    pub script_pubkey: Vec<u8>,
    /// Template of the locking script
    pub script_type: ScriptType,
    /// Key path or redeem script
    pub spend: SpendCondition,
    /// nSequence
    pub sequence: u32,
}

impl TxInput {
    /// Builds an input spending `utxo`.
    pub fn from_utxo(utxo: &Utxo, sequence: u32) -> Self {
        Self {
            outpoint: utxo.outpoint,
            amount: utxo.amount,
            script_pubkey: utxo.script_pubkey.clone(),
            script_type: utxo.script_type,
            spend: utxo.spend.clone(),
            sequence,
        }
    }
}

/// A payment output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Encoded destination address
    pub address: String,
    /// Locking script
    #[serde(with = "hex")]
    pub script_pubkey: Vec<u8>,
    /// Value in minor units
    pub amount: u64,
}

impl TxOutput {
    /// Output paying `amount` to `address`.
    pub fn to_address(address: &Address, amount: u64) -> Self {
        Self {
            address: address.as_str().to_string(),
            script_pubkey: address.script_pubkey(),
            amount,
        }
    }

    /// Output paying `amount` to an encoded address string.
    pub fn parse(address: &str, amount: u64) -> Result<Self> {
        let decoded = AddressCodec::decode(address)?;
        Ok(Self {
            address: address.trim().to_string(),
            script_pubkey: decoded.script_pubkey(),
            amount,
        })
    }

    /// Script type of the locking script, if standard.
    pub fn script_type(&self) -> Option<ScriptType> {
        classify_script_pubkey(&self.script_pubkey).map(|(t, _)| t)
    }

    /// Dust threshold for this output's script type.
    pub fn dust_threshold(&self) -> u64 {
        self.script_type()
            .unwrap_or(ScriptType::P2wsh)
            .dust_threshold()
    }

    /// Serialized output size in vbytes.
    pub fn vbytes(&self) -> u64 {
        self.script_type()
            .map(ScriptType::output_vbytes)
            .unwrap_or(9 + self.script_pubkey.len() as u64)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// UNSIGNED TRANSACTION
// ═══════════════════════════════════════════════════════════════════════════════

/// A balanced, not yet signed transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransaction {
    version: i32,
    inputs: Vec<TxInput>,
    outputs: Vec<TxOutput>,
    fee: u64,
    lock_time: u32,
    change_index: Option<usize>,
}

impl UnsignedTransaction {
    /// Assembles a transaction, checking `Σinputs == Σoutputs + fee`.
    ///
    /// # Errors
    /// - `ValidationError` for empty inputs/outputs, an unbalanced total, or a
    ///   change index out of range
    /// - `AmountOverflow` if a sum overflows
    pub fn new(
        inputs: Vec<TxInput>,
        outputs: Vec<TxOutput>,
        fee: u64,
        lock_time: u32,
        change_index: Option<usize>,
    ) -> Result<Self> {
        if inputs.is_empty() || outputs.is_empty() {
            return Err(KestrelError::ValidationError(
                "transaction needs at least one input and one output".into(),
            ));
        }
        if matches!(change_index, Some(i) if i >= outputs.len()) {
            return Err(KestrelError::ValidationError("change index out of range".into()));
        }

        let total_in = checked_sum(inputs.iter().map(|i| i.amount))?;
        let total_out = checked_sum(outputs.iter().map(|o| o.amount))?;
        let spent = total_out.checked_add(fee).ok_or(KestrelError::AmountOverflow)?;
        if total_in != spent {
            return Err(KestrelError::ValidationError(format!(
                "inputs {} != outputs {} + fee {}",
                total_in, total_out, fee
            )));
        }

        Ok(Self {
            version: TX_VERSION,
            inputs,
            outputs,
            fee,
            lock_time,
            change_index,
        })
    }

    /// Inputs in order.
    pub fn inputs(&self) -> &[TxInput] {
        &self.inputs
    }

    /// Outputs in order.
    pub fn outputs(&self) -> &[TxOutput] {
        &self.outputs
    }

    /// Fee paid.
    pub fn fee(&self) -> u64 {
        self.fee
    }

    /// nLockTime.
    pub fn lock_time(&self) -> u32 {
        self.lock_time
    }

    /// Transaction version.
    pub fn version(&self) -> i32 {
        self.version
    }

    /// Index of the change output, if any.
    pub fn change_index(&self) -> Option<usize> {
        self.change_index
    }

    /// Change amount (0 without change).
    pub fn change_amount(&self) -> u64 {
        self.change_index
            .map(|i| self.outputs[i].amount)
            .unwrap_or(0)
    }

    /// Sum of input values.
    pub fn input_total(&self) -> u64 {
        self.inputs.iter().map(|i| i.amount).sum()
    }

    /// Sum of output values.
    pub fn output_total(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    /// Outpoints spent by this transaction.
    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.inputs.iter().map(|i| i.outpoint).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SIGNED TRANSACTION
// ═══════════════════════════════════════════════════════════════════════════════

/// A fully signed transaction. Immutable; content-addressed by its txid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedTransaction {
    unsigned: UnsignedTransaction,
    script_sigs: Vec<Vec<u8>>,
    witnesses: Vec<Vec<Vec<u8>>>,
    txid: Txid,
    wtxid: Txid,
}

impl SignedTransaction {
    pub(crate) fn assemble(
        unsigned: UnsignedTransaction,
        script_sigs: Vec<Vec<u8>>,
        witnesses: Vec<Vec<Vec<u8>>>,
    ) -> Self {
        let base = encode(&unsigned, &script_sigs, &witnesses, false);
        let full = encode(&unsigned, &script_sigs, &witnesses, true);
        Self {
            txid: Txid::from_bytes(sha256d(&base)),
            wtxid: Txid::from_bytes(sha256d(&full)),
            unsigned,
            script_sigs,
            witnesses,
        }
    }

    /// Hash of the serialization without witnesses.
    pub fn txid(&self) -> Txid {
        self.txid
    }

    /// Hash of the full serialization including witnesses.
    pub fn wtxid(&self) -> Txid {
        self.wtxid
    }

    /// The transaction that was signed.
    pub fn unsigned(&self) -> &UnsignedTransaction {
        &self.unsigned
    }

    /// Inputs in order.
    pub fn inputs(&self) -> &[TxInput] {
        self.unsigned.inputs()
    }

    /// Outputs in order.
    pub fn outputs(&self) -> &[TxOutput] {
        self.unsigned.outputs()
    }

    /// Fee paid.
    pub fn fee(&self) -> u64 {
        self.unsigned.fee()
    }

    /// scriptSig of input `index`.
    pub fn script_sig(&self, index: usize) -> &[u8] {
        &self.script_sigs[index]
    }

    /// Witness stack of input `index`.
    pub fn witness(&self, index: usize) -> &[Vec<u8>] {
        &self.witnesses[index]
    }

    /// True if any input carries witness data.
    pub fn has_witness(&self) -> bool {
        self.witnesses.iter().any(|w| !w.is_empty())
    }

    /// Wire serialization (segwit format when witnesses are present).
    pub fn serialize(&self) -> Vec<u8> {
        encode(&self.unsigned, &self.script_sigs, &self.witnesses, true)
    }

    /// Hex of [`serialize`](Self::serialize).
    pub fn to_hex(&self) -> String {
        hex::encode(self.serialize())
    }

    /// Virtual size: `ceil((3 * base + total) / 4)`.
    pub fn vsize(&self) -> u64 {
        let base = encode(&self.unsigned, &self.script_sigs, &self.witnesses, false).len() as u64;
        let total = self.serialize().len() as u64;
        (base * 3 + total + 3) / 4
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENCODING
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) fn write_varint(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

pub(crate) fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    write_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

pub(crate) fn write_outpoint(buf: &mut Vec<u8>, outpoint: &OutPoint) {
    buf.extend_from_slice(outpoint.txid.as_bytes());
    buf.extend_from_slice(&outpoint.vout.to_le_bytes());
}

pub(crate) fn write_output(buf: &mut Vec<u8>, output: &TxOutput) {
    buf.extend_from_slice(&output.amount.to_le_bytes());
    write_bytes(buf, &output.script_pubkey);
}

pub(crate) fn encode(
    tx: &UnsignedTransaction,
    script_sigs: &[Vec<u8>],
    witnesses: &[Vec<Vec<u8>>],
    with_witness: bool,
) -> Vec<u8> {
    let segwit = with_witness && witnesses.iter().any(|w| !w.is_empty());
    let mut buf = Vec::with_capacity(64 + tx.inputs.len() * 160 + tx.outputs.len() * 44);

    buf.extend_from_slice(&tx.version.to_le_bytes());
    if segwit {
        buf.extend_from_slice(&[0x00, 0x01]);
    }

    write_varint(&mut buf, tx.inputs.len() as u64);
    for (i, input) in tx.inputs.iter().enumerate() {
        write_outpoint(&mut buf, &input.outpoint);
        write_bytes(&mut buf, script_sigs.get(i).map(Vec::as_slice).unwrap_or(&[]));
        buf.extend_from_slice(&input.sequence.to_le_bytes());
    }

    write_varint(&mut buf, tx.outputs.len() as u64);
    for output in &tx.outputs {
        write_output(&mut buf, output);
    }

    if segwit {
        for i in 0..tx.inputs.len() {
            let stack = witnesses.get(i).map(Vec::as_slice).unwrap_or(&[]);
            write_varint(&mut buf, stack.len() as u64);
            for item in stack {
                write_bytes(&mut buf, item);
            }
        }
    }

    buf.extend_from_slice(&tx.lock_time.to_le_bytes());
    buf
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARSING
// ═══════════════════════════════════════════════════════════════════════════════

/// An output as read from raw bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawOutput {
    /// Value
    pub amount: u64,
    /// Locking script
    pub script_pubkey: Vec<u8>,
}

/// The parts of a raw transaction a chain backend needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawTransaction {
    /// Txid (witness-stripped hash)
    pub txid: Txid,
    /// Spent outpoints
    pub inputs: Vec<OutPoint>,
    /// Created outputs
    pub outputs: Vec<RawOutput>,
    /// nLockTime
    pub lock_time: u32,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.data.len()).ok_or_else(|| {
            KestrelError::ValidationError(format!("raw transaction truncated at byte {}", self.pos))
        })?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(arr))
    }

    fn varint(&mut self) -> Result<u64> {
        let first = self.take(1)?[0];
        Ok(match first {
            0xfd => {
                let b = self.take(2)?;
                u16::from_le_bytes([b[0], b[1]]) as u64
            }
            0xfe => self.u32()? as u64,
            0xff => self.u64()?,
            n => n as u64,
        })
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.varint()?;
        let len = usize::try_from(len)
            .map_err(|_| KestrelError::ValidationError("length prefix too large".into()))?;
        self.take(len)
    }
}

/// Parses wire bytes (legacy or segwit format).
pub fn parse_raw(data: &[u8]) -> Result<RawTransaction> {
    let mut r = Reader { data, pos: 0 };
    let version = r.take(4)?;

    let segwit = data.get(4) == Some(&0x00) && data.get(5) == Some(&0x01);
    if segwit {
        r.take(2)?;
    }

    let body_start = r.pos;
    let n_in = r.varint()?;
    let mut inputs = Vec::new();
    for _ in 0..n_in {
        let mut txid = [0u8; 32];
        txid.copy_from_slice(r.take(32)?);
        let vout = r.u32()?;
        r.bytes()?;
        r.u32()?;
        inputs.push(OutPoint::new(Txid::from_bytes(txid), vout));
    }

    let n_out = r.varint()?;
    let mut outputs = Vec::new();
    for _ in 0..n_out {
        let amount = r.u64()?;
        let script_pubkey = r.bytes()?.to_vec();
        outputs.push(RawOutput {
            amount,
            script_pubkey,
        });
    }
    let body_end = r.pos;

    if segwit {
        for _ in 0..n_in {
            let items = r.varint()?;
            for _ in 0..items {
                r.bytes()?;
            }
        }
    }

    let lock_bytes = r.take(4)?;
    let lock_time = u32::from_le_bytes([lock_bytes[0], lock_bytes[1], lock_bytes[2], lock_bytes[3]]);
    if r.pos != data.len() {
        return Err(KestrelError::ValidationError(format!(
            "{} trailing bytes after transaction",
            data.len() - r.pos
        )));
    }

    let mut stripped = Vec::with_capacity(body_end - body_start + 8);
    stripped.extend_from_slice(version);
    stripped.extend_from_slice(&data[body_start..body_end]);
    stripped.extend_from_slice(lock_bytes);

    Ok(RawTransaction {
        txid: Txid::from_bytes(sha256d(&stripped)),
        inputs,
        outputs,
        lock_time,
    })
}
