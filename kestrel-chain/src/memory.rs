//! Deterministic in-process regtest chain.
//!
//! Used by tests and the CLI demo. Blocks are produced only by [`MemoryChain::mine`];
//! transient failures can be injected to exercise retry paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use kestrel_address::{classify_script_pubkey, Address};
use kestrel_core::error::{KestrelError, Result};
use kestrel_core::traits::ChainClient;
use kestrel_core::types::{checked_sum, Network, OutPoint, SpendCondition, Txid, Utxo};
use kestrel_crypto::sha256d;
use kestrel_tx::{parse_raw, RawTransaction};

#[derive(Default)]
struct ChainState {
    height: u32,
    utxos: BTreeMap<OutPoint, Utxo>,
    /// txid → height of the block that included it
    confirmed: HashMap<Txid, u32>,
    mempool: Vec<Txid>,
    transactions: HashMap<Txid, Vec<u8>>,
    nonce: u64,
}

impl ChainState {
    fn depth(&self, txid: &Txid) -> Option<u32> {
        match self.confirmed.get(txid) {
            Some(&at) => Some(self.height - at + 1),
            None if self.mempool.contains(txid) => Some(0),
            None => None,
        }
    }
}

/// In-memory chain implementing [`ChainClient`].
pub struct MemoryChain {
    network: Network,
    state: Mutex<ChainState>,
    failing_broadcasts: AtomicU32,
    failing_queries: AtomicU32,
}

impl MemoryChain {
    /// Empty chain at height 0.
    pub fn new(network: Network) -> Self {
        Self::with_height(network, 0)
    }

    /// Empty chain starting at `height`.
    pub fn with_height(network: Network, height: u32) -> Self {
        Self {
            network,
            state: Mutex::new(ChainState {
                height,
                ..ChainState::default()
            }),
            failing_broadcasts: AtomicU32::new(0),
            failing_queries: AtomicU32::new(0),
        }
    }

    /// Network the chain serves.
    pub fn network(&self) -> Network {
        self.network
    }

    /// Creates an unconfirmed output paying `address`.
    pub fn fund(&self, address: &Address, amount: u64) -> Result<(OutPoint, Utxo)> {
        let mut state = self.state.lock();
        state.nonce += 1;

        let script_pubkey = address.script_pubkey();
        let mut preimage = b"kestrel/fund".to_vec();
        preimage.extend_from_slice(&state.nonce.to_le_bytes());
        preimage.extend_from_slice(&script_pubkey);
        let txid = Txid::from_bytes(sha256d(&preimage));

        let outpoint = OutPoint::new(txid, 0);
        let utxo = Utxo {
            outpoint,
            amount,
            script_pubkey,
            script_type: address.script_type().on_chain(),
            address: address.to_string(),
            confirmations: 0,
            spend: SpendCondition::default(),
        };
        state.utxos.insert(outpoint, utxo.clone());
        state.mempool.push(txid);
        debug!(%outpoint, amount, address = %address, "Funded address");
        Ok((outpoint, utxo))
    }

    /// Parses `address` and funds it.
    pub fn fund_address(&self, address: &str, amount: u64) -> Result<(OutPoint, Utxo)> {
        self.fund(&address.parse()?, amount)
    }

    /// Mines `blocks` blocks; the first includes the whole mempool. Returns the new height.
    pub fn mine(&self, blocks: u32) -> u32 {
        let mut state = self.state.lock();
        if blocks == 0 {
            return state.height;
        }
        let included = state.height + 1;
        let mempool = std::mem::take(&mut state.mempool);
        let count = mempool.len();
        for txid in mempool {
            state.confirmed.insert(txid, included);
        }
        state.height += blocks;
        info!(height = state.height, included = count, "Mined blocks");
        state.height
    }

    /// Current tip height.
    pub fn height(&self) -> u32 {
        self.state.lock().height
    }

    /// Makes the next `n` broadcasts fail with `BroadcastFailed`.
    pub fn fail_next_broadcasts(&self, n: u32) {
        self.failing_broadcasts.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` queries fail with `RpcError`.
    pub fn fail_next_queries(&self, n: u32) {
        self.failing_queries.store(n, Ordering::SeqCst);
    }

    /// A transaction the chain has seen.
    pub fn transaction(&self, txid: &Txid) -> Option<RawTransaction> {
        let state = self.state.lock();
        state.transactions.get(txid).and_then(|raw| parse_raw(raw).ok())
    }

    /// True if `outpoint` exists and is unspent.
    pub fn is_unspent(&self, outpoint: &OutPoint) -> bool {
        self.state.lock().utxos.contains_key(outpoint)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn query_guard(&self) -> Result<()> {
        if Self::take_failure(&self.failing_queries) {
            return Err(KestrelError::RpcError("injected query failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainClient for MemoryChain {
    async fn broadcast_transaction(&self, raw: &[u8]) -> Result<Txid> {
        if Self::take_failure(&self.failing_broadcasts) {
            return Err(KestrelError::BroadcastFailed("injected broadcast failure".into()));
        }
        let tx = parse_raw(raw).map_err(|e| KestrelError::TransactionRejected(e.to_string()))?;

        let mut state = self.state.lock();
        if state.transactions.contains_key(&tx.txid) {
            return Ok(tx.txid);
        }

        let mut spent = Vec::with_capacity(tx.inputs.len());
        for outpoint in &tx.inputs {
            let utxo = state.utxos.get(outpoint).ok_or_else(|| {
                KestrelError::TransactionRejected(format!("missing or spent input {}", outpoint))
            })?;
            spent.push(utxo.amount);
        }
        let input_total = checked_sum(spent)?;
        let output_total = checked_sum(tx.outputs.iter().map(|o| o.amount))?;
        if output_total > input_total {
            return Err(KestrelError::TransactionRejected(format!(
                "outputs {} exceed inputs {}",
                output_total, input_total
            )));
        }

        for outpoint in &tx.inputs {
            state.utxos.remove(outpoint);
        }
        for (vout, output) in tx.outputs.iter().enumerate() {
            let Some((script_type, _)) = classify_script_pubkey(&output.script_pubkey) else {
                continue;
            };
            let address = Address::from_script_pubkey(&output.script_pubkey, self.network)
                .map(|a| a.to_string())
                .unwrap_or_default();
            let outpoint = OutPoint::new(tx.txid, vout as u32);
            state.utxos.insert(
                outpoint,
                Utxo {
                    outpoint,
                    amount: output.amount,
                    script_pubkey: output.script_pubkey.clone(),
                    script_type,
                    address,
                    confirmations: 0,
                    spend: SpendCondition::default(),
                },
            );
        }
        state.mempool.push(tx.txid);
        state.transactions.insert(tx.txid, raw.to_vec());
        info!(txid = %tx.txid, fee = input_total - output_total, "Transaction accepted");
        Ok(tx.txid)
    }

    async fn get_utxo_set(&self, address: &str) -> Result<Vec<Utxo>> {
        self.query_guard()?;
        let state = self.state.lock();
        Ok(state
            .utxos
            .values()
            .filter(|u| u.address == address)
            .map(|u| Utxo {
                confirmations: state.depth(&u.outpoint.txid).unwrap_or(0),
                ..u.clone()
            })
            .collect())
    }

    async fn get_confirmation_depth(&self, txid: &Txid) -> Result<u32> {
        self.query_guard()?;
        self.state
            .lock()
            .depth(txid)
            .ok_or_else(|| KestrelError::not_found("transaction", txid))
    }

    async fn get_block_height(&self) -> Result<u32> {
        self.query_guard()?;
        Ok(self.state.lock().height)
    }
}

impl std::fmt::Debug for MemoryChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryChain")
            .field("network", &self.network)
            .field("height", &state.height)
            .field("utxos", &state.utxos.len())
            .field("mempool", &state.mempool.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_address::{AddressCodec, AddressSource};
    use kestrel_core::types::ScriptType;
    use kestrel_crypto::{ExtendedPrivateKey, Seed};
    use kestrel_tx::{BuilderConfig, FeePolicy, Signer, TransactionBuilder, TxOutput};

    fn key() -> ExtendedPrivateKey {
        ExtendedPrivateKey::from_seed(&Seed::from_bytes(&[0x77; 32]).unwrap()).unwrap()
    }

    fn address_of(key: &ExtendedPrivateKey) -> Address {
        AddressCodec::encode(AddressSource::PublicKey(key.public_key()), Network::Regtest, ScriptType::P2wpkh)
            .unwrap()
    }

    #[tokio::test]
    async fn test_fund_and_confirm() {
        let chain = MemoryChain::new(Network::Regtest);
        let addr = address_of(&key());
        let (outpoint, _) = chain.fund(&addr, 50_000).unwrap();

        assert_eq!(chain.get_confirmation_depth(&outpoint.txid).await.unwrap(), 0);
        assert_eq!(chain.mine(6), 6);
        assert_eq!(chain.get_confirmation_depth(&outpoint.txid).await.unwrap(), 6);

        let utxos = chain.get_utxo_set(addr.as_str()).await.unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].confirmations, 6);
        assert_eq!(utxos[0].script_type, ScriptType::P2wpkh);
    }

    #[tokio::test]
    async fn test_broadcast_moves_outputs() {
        let chain = MemoryChain::new(Network::Regtest);
        let key = key();
        let addr = address_of(&key);
        let (_, utxo) = chain.fund(&addr, 100_000).unwrap();
        chain.mine(1);

        let dest = Address::from_payload(Network::Regtest, ScriptType::P2wpkh, &[0xab; 20]).unwrap();
        let unsigned = TransactionBuilder::new(BuilderConfig::default())
            .with_change(addr.clone())
            .build(&[utxo.clone()], vec![TxOutput::to_address(&dest, 40_000)], FeePolicy::Fixed(1_000))
            .unwrap();
        let signed = Signer::sign(unsigned, &[key], None).unwrap();

        let txid = chain.broadcast_transaction(&signed.serialize()).await.unwrap();
        assert_eq!(txid, signed.txid());
        assert!(!chain.is_unspent(&utxo.outpoint));

        let paid = chain.get_utxo_set(dest.as_str()).await.unwrap();
        assert_eq!(paid.len(), 1);
        assert_eq!(paid[0].amount, 40_000);
        assert_eq!(paid[0].confirmations, 0);

        // Rebroadcast is idempotent; a conflicting spend is not.
        assert_eq!(chain.broadcast_transaction(&signed.serialize()).await.unwrap(), txid);
        assert_eq!(chain.transaction(&txid).unwrap().outputs.len(), 2);
    }

    #[tokio::test]
    async fn test_double_spend_rejected() {
        let chain = MemoryChain::new(Network::Regtest);
        let key = key();
        let addr = address_of(&key);
        let (_, utxo) = chain.fund(&addr, 100_000).unwrap();

        let spend = |amount: u64| {
            let unsigned = TransactionBuilder::new(BuilderConfig::default())
                .with_change(addr.clone())
                .build(&[utxo.clone()], vec![TxOutput::to_address(&addr, amount)], FeePolicy::Fixed(1_000))
                .unwrap();
            Signer::sign(unsigned, &[key.clone()], None).unwrap()
        };

        chain.broadcast_transaction(&spend(30_000).serialize()).await.unwrap();
        let err = chain
            .broadcast_transaction(&spend(20_000).serialize())
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::TransactionRejected(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let chain = MemoryChain::new(Network::Regtest);
        chain.fail_next_queries(2);
        assert!(matches!(chain.get_block_height().await, Err(KestrelError::RpcError(_))));
        assert!(chain.get_block_height().await.is_err());
        assert_eq!(chain.get_block_height().await.unwrap(), 0);

        chain.fail_next_broadcasts(1);
        let err = chain.broadcast_transaction(&[]).await.unwrap_err();
        assert!(err.is_recoverable());
        let err = chain.broadcast_transaction(&[]).await.unwrap_err();
        assert!(matches!(err, KestrelError::TransactionRejected(_)));
    }
}
