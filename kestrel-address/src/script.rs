//! Locking-script templates.

use kestrel_core::constants::{COMPRESSED_PUBLIC_KEY_SIZE, HASH160_SIZE, HASH_SIZE, MAX_MULTISIG_KEYS};
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::types::{PublicKey, ScriptType};

/// Script opcodes used by the supported templates.
pub mod opcodes {
    /// Pushes an empty byte vector (also witness version 0).
    pub const OP_0: u8 = 0x00;
    /// Largest direct-push length opcode.
    pub const OP_PUSHBYTES_75: u8 = 0x4b;
    /// One-byte length prefix follows.
    pub const OP_PUSHDATA1: u8 = 0x4c;
    /// Two-byte length prefix follows.
    pub const OP_PUSHDATA2: u8 = 0x4d;
    /// `OP_1`; `OP_n` is `OP_1 + n - 1`.
    pub const OP_1: u8 = 0x51;
    /// `OP_16`.
    pub const OP_16: u8 = 0x60;
    /// Duplicate top stack item.
    pub const OP_DUP: u8 = 0x76;
    /// Equality check.
    pub const OP_EQUAL: u8 = 0x87;
    /// Equality check, then verify.
    pub const OP_EQUALVERIFY: u8 = 0x88;
    /// HASH160 of top stack item.
    pub const OP_HASH160: u8 = 0xa9;
    /// Single signature check.
    pub const OP_CHECKSIG: u8 = 0xac;
    /// M-of-N signature check.
    pub const OP_CHECKMULTISIG: u8 = 0xae;
}

use opcodes::*;

/// Appends a minimal data push of `data` to `script`.
pub fn push_slice(script: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len <= OP_PUSHBYTES_75 as usize {
        script.push(len as u8);
    } else if len <= u8::MAX as usize {
        script.push(OP_PUSHDATA1);
        script.push(len as u8);
    } else {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(len as u16).to_le_bytes());
    }
    script.extend_from_slice(data);
}

/// `OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG`
pub fn p2pkh(pubkey_hash: &[u8; HASH160_SIZE]) -> Vec<u8> {
    let mut s = Vec::with_capacity(25);
    s.extend_from_slice(&[OP_DUP, OP_HASH160]);
    push_slice(&mut s, pubkey_hash);
    s.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    s
}

/// `OP_HASH160 <hash> OP_EQUAL`
pub fn p2sh(script_hash: &[u8; HASH160_SIZE]) -> Vec<u8> {
    let mut s = Vec::with_capacity(23);
    s.push(OP_HASH160);
    push_slice(&mut s, script_hash);
    s.push(OP_EQUAL);
    s
}

/// `OP_0 <20-byte key hash>`
pub fn p2wpkh(pubkey_hash: &[u8; HASH160_SIZE]) -> Vec<u8> {
    let mut s = Vec::with_capacity(22);
    s.push(OP_0);
    push_slice(&mut s, pubkey_hash);
    s
}

/// `OP_0 <32-byte script hash>`
pub fn p2wsh(script_hash: &[u8; HASH_SIZE]) -> Vec<u8> {
    let mut s = Vec::with_capacity(34);
    s.push(OP_0);
    push_slice(&mut s, script_hash);
    s
}

/// `OP_m <key>... OP_n OP_CHECKMULTISIG`, keys in the order given.
///
/// # Errors
/// `ValidationError` unless `1 ≤ m ≤ n ≤ 15`.
pub fn multisig_redeem(m: usize, keys: &[PublicKey]) -> Result<Vec<u8>> {
    let n = keys.len();
    if m == 0 || m > n || n > MAX_MULTISIG_KEYS {
        return Err(KestrelError::ValidationError(format!(
            "invalid multisig threshold {}-of-{}",
            m, n
        )));
    }

    let mut s = Vec::with_capacity(3 + n * (COMPRESSED_PUBLIC_KEY_SIZE + 1));
    s.push(OP_1 + (m as u8) - 1);
    for key in keys {
        push_slice(&mut s, key.as_bytes());
    }
    s.push(OP_1 + (n as u8) - 1);
    s.push(OP_CHECKMULTISIG);
    Ok(s)
}

fn small_int(op: u8) -> Option<usize> {
    (OP_1..=OP_16).contains(&op).then(|| (op - OP_1 + 1) as usize)
}

/// Parses a multisig redeem script into `(m, keys)`.
///
/// # Errors
/// `InvalidScript` if the script is not exactly the template.
pub fn parse_multisig(script: &[u8]) -> Result<(usize, Vec<PublicKey>)> {
    let bad = |why: &str| KestrelError::InvalidScript(format!("not a multisig script: {}", why));

    if script.len() < 3 || script[script.len() - 1] != OP_CHECKMULTISIG {
        return Err(bad("missing OP_CHECKMULTISIG"));
    }
    let m = small_int(script[0]).ok_or_else(|| bad("bad threshold"))?;
    let n = small_int(script[script.len() - 2]).ok_or_else(|| bad("bad key count"))?;

    let body = &script[1..script.len() - 2];
    let chunk = COMPRESSED_PUBLIC_KEY_SIZE + 1;
    if body.len() != n * chunk {
        return Err(bad("key section length"));
    }

    let mut keys = Vec::with_capacity(n);
    for push in body.chunks_exact(chunk) {
        if push[0] as usize != COMPRESSED_PUBLIC_KEY_SIZE {
            return Err(bad("key push length"));
        }
        keys.push(PublicKey::from_bytes(&push[1..])?);
    }
    if m > n {
        return Err(bad("threshold above key count"));
    }
    Ok((m, keys))
}

/// Splits a push-only script (a scriptSig) into its pushed items.
///
/// `OP_0` yields an empty item.
///
/// # Errors
/// `InvalidScript` on non-push opcodes or truncated pushes.
pub fn parse_pushes(script: &[u8]) -> Result<Vec<Vec<u8>>> {
    let truncated = || KestrelError::InvalidScript("truncated push".into());
    let mut items = Vec::new();
    let mut i = 0;
    while i < script.len() {
        let op = script[i];
        i += 1;
        let len = match op {
            OP_0 => 0,
            1..=OP_PUSHBYTES_75 => op as usize,
            OP_PUSHDATA1 => {
                let len = *script.get(i).ok_or_else(truncated)? as usize;
                i += 1;
                len
            }
            OP_PUSHDATA2 => {
                let bytes = script.get(i..i + 2).ok_or_else(truncated)?;
                i += 2;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            other => {
                return Err(KestrelError::InvalidScript(format!(
                    "non-push opcode 0x{:02x}",
                    other
                )))
            }
        };
        let data = script.get(i..i + len).ok_or_else(truncated)?;
        items.push(data.to_vec());
        i += len;
    }
    Ok(items)
}

/// Recognizes a standard locking script, returning its type and hash payload.
pub fn classify_script_pubkey(script: &[u8]) -> Option<(ScriptType, Vec<u8>)> {
    match script {
        [OP_DUP, OP_HASH160, 20, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG] if hash.len() == 20 => {
            Some((ScriptType::P2pkh, hash.to_vec()))
        }
        [OP_HASH160, 20, hash @ .., OP_EQUAL] if hash.len() == 20 => {
            Some((ScriptType::P2sh, hash.to_vec()))
        }
        [OP_0, 20, hash @ ..] if hash.len() == 20 => Some((ScriptType::P2wpkh, hash.to_vec())),
        [OP_0, 32, hash @ ..] if hash.len() == 32 => Some((ScriptType::P2wsh, hash.to_vec())),
        _ => None,
    }
}
