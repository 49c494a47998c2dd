//! End-to-end scenarios over the engine and an in-memory regtest chain.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use kestrel_address::{Address, AddressCodec};
use kestrel_chain::{MemoryChain, RetryPolicy};
use kestrel_channel::HtlcStatus;
use kestrel_core::constants::PURPOSE_NODE;
use kestrel_core::types::{
    ChannelId, ChannelState, ChildNumber, DerivationPath, PaymentHash, Preimage, ScriptType,
};
use kestrel_core::KestrelError;
use kestrel_crypto::{sha256, ExtendedPrivateKey};
use kestrel_invoice::InvoiceTerms;
use kestrel_multisig::{MultisigWallet, ProposalState};
use kestrel_tx::{BuilderConfig, Signer, TransactionBuilder};
use kestrel_wallet::{
    CloseMode, EngineConfig, FeePolicy, Invoice, InvoiceStatus, LoopbackPeer, Network, Seed,
    TxOutput, WalletEngine, WalletId,
};

const PEER_SEED: [u8; 32] = [9; 32];

struct Node {
    chain: Arc<MemoryChain>,
    engine: WalletEngine,
}

fn node() -> Node {
    let chain = Arc::new(MemoryChain::new(Network::Regtest));
    let mut config = EngineConfig::for_network(Network::Regtest);
    config.retry = RetryPolicy::default()
        .with_backoff(1, 2, 5)
        .with_jitter(false);
    let engine = WalletEngine::new(
        config,
        chain.clone(),
        Arc::new(kestrel_store::MemoryRepository::new()),
        &Seed::from_bytes(&[1; 32]).unwrap(),
    )
    .unwrap();
    Node { chain, engine }
}

async fn funded_wallet(node: &Node, amount: u64) -> WalletId {
    let wallet = node.engine.create_wallet("spending").await.unwrap().id;
    let address = node.engine.next_address(&wallet).await.unwrap();
    node.chain.fund(&address, amount).unwrap();
    node.chain.mine(1);
    node.engine.refresh_utxos(&wallet).await.unwrap();
    wallet
}

async fn open_channel(node: &Node, wallet: &WalletId) -> (ChannelId, Arc<LoopbackPeer>) {
    let peer = Arc::new(LoopbackPeer::from_seed(&Seed::from_bytes(&PEER_SEED).unwrap()).unwrap());
    let channel = node
        .engine
        .open_channel(wallet, peer.clone(), 1_000_000, 0)
        .await
        .unwrap();
    node.chain.mine(3);
    let state = node.engine.channels().confirm_funding(&channel).await.unwrap();
    assert_eq!(state, ChannelState::Open);
    (channel, peer)
}

fn payment(byte: u8) -> (Preimage, PaymentHash) {
    let preimage = Preimage::from_bytes([byte; 32]);
    let hash = PaymentHash(sha256(preimage.as_bytes()));
    (preimage, hash)
}

fn external(amount: u64) -> TxOutput {
    let address = Address::from_payload(Network::Regtest, ScriptType::P2wpkh, &[0xee; 20]).unwrap();
    TxOutput::to_address(&address, amount)
}

// ═══════════════════════════════════════════════════════════════════════════════
// A: ADDRESS DERIVATION
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn scenario_a_three_receive_addresses() {
    let node = node();
    let wallet = node.engine.create_wallet("receive").await.unwrap().id;

    let mut seen = HashSet::new();
    for _ in 0..3 {
        let address = node.engine.next_address(&wallet).await.unwrap();
        let decoded = AddressCodec::decode(address.as_str()).unwrap();
        assert_eq!(decoded.network, Network::Regtest);
        assert_eq!(decoded.script_type, ScriptType::P2wpkh);
        let again =
            Address::from_payload(decoded.network, decoded.script_type, &decoded.payload).unwrap();
        assert_eq!(again, address);
        assert!(seen.insert(address.to_string()));
    }

    let records = node.engine.addresses(&wallet).await.unwrap();
    assert_eq!(records.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(records.iter().all(|r| !r.change));
}

// ═══════════════════════════════════════════════════════════════════════════════
// B: ON-CHAIN PAYMENT WITH CHANGE
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn scenario_b_payment_returns_change() {
    let node = node();
    let wallet = funded_wallet(&node, 100_000).await;
    assert_eq!(node.engine.get_balance(&wallet).await.unwrap().confirmed, 100_000);

    let signed = node
        .engine
        .send(&wallet, vec![external(40_000)], Some(FeePolicy::Fixed(1_000)))
        .await
        .unwrap();
    assert_eq!(signed.fee(), 1_000);
    assert_eq!(signed.unsigned().change_amount(), 59_000);
    assert_eq!(signed.unsigned().input_total(), 100_000);
    assert!(Signer::verify(&signed));

    let change = signed.unsigned().change_index().unwrap();
    let change_address = &signed.outputs()[change].address;
    let records = node.engine.addresses(&wallet).await.unwrap();
    assert!(records.iter().any(|r| r.change && &r.address == change_address));

    let balance = node.engine.refresh_utxos(&wallet).await.unwrap();
    assert_eq!(balance.unconfirmed, 59_000);
    assert_eq!(balance.confirmed, 0);

    node.chain.mine(1);
    assert_eq!(
        node.engine.confirm_pending(&wallet).await.unwrap(),
        vec![signed.txid()]
    );
    let balance = node.engine.refresh_utxos(&wallet).await.unwrap();
    assert_eq!(balance.confirmed, 59_000);
    assert_eq!(balance.reserved, 0);
}

// ═══════════════════════════════════════════════════════════════════════════════
// C: 2-OF-3 MULTISIG
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn scenario_c_two_of_three_ready_after_second_signer() {
    let node = node();
    let mut signers = Vec::new();
    for name in ["a", "b", "c"] {
        signers.push(node.engine.create_wallet(name).await.unwrap().id);
    }
    let keys = signers
        .iter()
        .map(|w| node.engine.cosigner_key(w).unwrap())
        .collect();
    let path: DerivationPath = "m/48'/1'/0'/2'".parse().unwrap();
    let multisig = Arc::new(
        MultisigWallet::new(2, keys, path, ScriptType::P2wsh, Network::Regtest).unwrap(),
    );

    let (outpoint, _) = node.chain.fund(multisig.address(), 100_000).unwrap();
    node.chain.mine(1);
    let unsigned = TransactionBuilder::new(BuilderConfig::default())
        .with_change(multisig.address().clone())
        .build(
            &[multisig.utxo(outpoint, 100_000, 1)],
            vec![external(40_000)],
            FeePolicy::Fixed(1_000),
        )
        .unwrap();
    let proposal = node.engine.multisig().propose(unsigned, multisig.clone()).unwrap();

    let status = node.engine.sign_proposal(&signers[0], proposal).unwrap();
    assert_eq!(status.state, ProposalState::Collecting);
    assert_eq!(status.collected, 1);

    let err = node.engine.sign_proposal(&signers[0], proposal).unwrap_err();
    assert!(matches!(err, KestrelError::DuplicateSignature(_)));
    assert_eq!(
        node.engine.multisig().status(proposal).unwrap().state,
        ProposalState::Collecting
    );

    let status = node.engine.sign_proposal(&signers[1], proposal).unwrap();
    assert_eq!(status.state, ProposalState::Ready);
    assert_eq!(status.collected, 2);

    let signed = node.engine.multisig().finalize(proposal).unwrap();
    assert!(Signer::verify(&signed));
    let txid = node.engine.broadcast_proposal(proposal).await.unwrap();
    assert_eq!(txid, signed.txid());
    assert!(!node.chain.is_unspent(&outpoint));
    assert!(node.engine.reservations().is_reserved(&outpoint));

    let status = node.engine.settle_proposal(proposal).await.unwrap();
    assert_eq!(status.state, ProposalState::Finalized);
    node.chain.mine(1);
    let status = node.engine.settle_proposal(proposal).await.unwrap();
    assert_eq!(status.state, ProposalState::Confirmed);
    assert!(node.engine.reservations().is_spent(&outpoint));
    assert_eq!(node.engine.reservations().active(), 0);
}

#[tokio::test]
async fn scenario_c_unbroadcast_multisig_spend_is_abandoned() {
    let node = node();
    let mut signers = Vec::new();
    for name in ["a", "b", "c"] {
        signers.push(node.engine.create_wallet(name).await.unwrap().id);
    }
    let keys = signers
        .iter()
        .map(|w| node.engine.cosigner_key(w).unwrap())
        .collect();
    let path: DerivationPath = "m/48'/1'/0'/2'".parse().unwrap();
    let multisig = Arc::new(
        MultisigWallet::new(2, keys, path, ScriptType::P2wsh, Network::Regtest).unwrap(),
    );
    let (outpoint, _) = node.chain.fund(multisig.address(), 100_000).unwrap();
    node.chain.mine(1);
    let unsigned = TransactionBuilder::new(BuilderConfig::default())
        .with_change(multisig.address().clone())
        .build(
            &[multisig.utxo(outpoint, 100_000, 1)],
            vec![external(40_000)],
            FeePolicy::Fixed(1_000),
        )
        .unwrap();
    let proposal = node.engine.multisig().propose(unsigned, multisig.clone()).unwrap();
    node.engine.sign_proposal(&signers[0], proposal).unwrap();
    node.engine.sign_proposal(&signers[2], proposal).unwrap();

    node.chain.fail_next_broadcasts(5);
    node.engine.broadcast_proposal(proposal).await.unwrap_err();
    assert_eq!(
        node.engine.multisig().status(proposal).unwrap().state,
        ProposalState::Finalized
    );
    assert!(node.engine.reservations().is_reserved(&outpoint));

    let status = node.engine.settle_proposal(proposal).await.unwrap();
    assert_eq!(status.state, ProposalState::Abandoned);
    assert!(!node.engine.reservations().is_reserved(&outpoint));
    assert_eq!(node.engine.reservations().active(), 0);
    assert!(node.chain.is_unspent(&outpoint));
}

// ═══════════════════════════════════════════════════════════════════════════════
// D: CHANNEL PAYMENTS
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn scenario_d_fulfilled_htlc_moves_balance() {
    let node = node();
    let wallet = funded_wallet(&node, 2_000_000).await;
    let (channel, _peer) = open_channel(&node, &wallet).await;
    let channels = node.engine.channels();

    let (preimage, hash) = payment(7);
    let htlc = channels
        .add_htlc(channel, hash, 100_000, node.chain.height() + 40)
        .await
        .unwrap();
    assert_eq!(channels.fulfill_htlc(htlc, &preimage).await.unwrap(), HtlcStatus::Fulfilled);

    let record = channels.channel(&channel).await.unwrap();
    assert_eq!(record.commitment.local_balance, 900_000);
    assert_eq!(record.commitment.remote_balance, 100_000);
    assert!(record.commitment.htlcs.is_empty());
    record.check_balance_invariant().unwrap();

    assert_eq!(
        channels.fulfill_htlc(htlc, &preimage).await.unwrap(),
        HtlcStatus::AlreadySettled
    );
    assert_eq!(
        channels.channel(&channel).await.unwrap().commitment.local_balance,
        900_000
    );
}

#[tokio::test]
async fn scenario_d_funding_spends_wallet_outputs() {
    let node = node();
    let wallet = funded_wallet(&node, 2_000_000).await;
    open_channel(&node, &wallet).await;

    // The funded output is committed as spent; only the change remains.
    assert_eq!(node.engine.get_balance(&wallet).await.unwrap().total(), 0);
    let balance = node.engine.refresh_utxos(&wallet).await.unwrap();
    assert!(balance.confirmed > 990_000 && balance.confirmed < 1_000_000);
    assert_eq!(node.engine.reservations().active(), 0);
}

#[tokio::test]
async fn scenario_d_invoice_settles_incoming_htlc() {
    let node = node();
    let wallet = funded_wallet(&node, 2_000_000).await;
    let (channel, _peer) = open_channel(&node, &wallet).await;
    let channels = node.engine.channels();

    // Give the peer something to pay with.
    let (preimage, hash) = payment(3);
    let htlc = channels
        .add_htlc(channel, hash, 100_000, node.chain.height() + 40)
        .await
        .unwrap();
    channels.fulfill_htlc(htlc, &preimage).await.unwrap();

    let invoice = node
        .engine
        .create_invoice(50_000, None, "coffee")
        .await
        .unwrap();
    let decoded = node.engine.invoices().decode(&invoice.encode().unwrap()).unwrap();
    assert_eq!(decoded, invoice);

    let incoming = channels
        .receive_htlc(channel, invoice.payment_hash, 50_000, node.chain.height() + 40)
        .await
        .unwrap();
    let status = node.engine.invoices().on_incoming_htlc(incoming).await.unwrap();
    assert!(matches!(status, Some(InvoiceStatus::Settled { htlc, .. }) if htlc == incoming));

    let record = channels.channel(&channel).await.unwrap();
    assert_eq!(record.commitment.local_balance, 950_000);
    assert_eq!(record.commitment.remote_balance, 50_000);
    record.check_balance_invariant().unwrap();
}

#[tokio::test]
async fn scenario_d_pay_invoice_over_channel() {
    let node = node();
    let wallet = funded_wallet(&node, 2_000_000).await;
    let (channel, peer) = open_channel(&node, &wallet).await;

    // The peer's node key, as the loopback peer derives it.
    let peer_key = ExtendedPrivateKey::from_seed(&Seed::from_bytes(&PEER_SEED).unwrap())
        .unwrap()
        .derive_path(&DerivationPath::from_children(vec![
            ChildNumber::Hardened(PURPOSE_NODE),
            ChildNumber::Hardened(0),
        ])
        .unwrap())
        .unwrap();
    assert_eq!(*peer_key.public_key(), kestrel_channel::Counterparty::node_id(&*peer));

    let (preimage, hash) = payment(5);
    let terms = InvoiceTerms {
        amount: 30_000,
        payment_hash: hash,
        created_at: Utc::now().timestamp() as u64,
        expiry: 600,
        min_final_cltv: 18,
        description: "sticker".into(),
        route_hints: vec![],
    };
    let invoice = Invoice::sign(Network::Regtest, terms, &peer_key).unwrap();

    let (paid, route, htlc) = node
        .engine
        .pay_invoice(&invoice.encode().unwrap())
        .await
        .unwrap();
    assert_eq!(paid.payment_hash, hash);
    assert_eq!(route.hops.len(), 1);
    assert_eq!(htlc.channel_id, channel);

    let channels = node.engine.channels();
    assert_eq!(channels.htlc_status(htlc).await.unwrap(), HtlcStatus::Pending);
    assert_eq!(channels.fulfill_htlc(htlc, &preimage).await.unwrap(), HtlcStatus::Fulfilled);
    let record = channels.channel(&channel).await.unwrap();
    assert_eq!(record.commitment.local_balance, 970_000);

    let err = node
        .engine
        .pay_invoice(&node.engine.create_invoice(1_000, None, "self").await.unwrap().encode().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, KestrelError::ValidationError(_)));
}

#[tokio::test]
async fn scenario_d_cooperative_close() {
    let node = node();
    let wallet = funded_wallet(&node, 2_000_000).await;
    let (channel, _peer) = open_channel(&node, &wallet).await;

    node.engine
        .close_channel(channel, CloseMode::Cooperative)
        .await
        .unwrap();
    assert_eq!(
        node.engine.channels().channel(&channel).await.unwrap().state,
        ChannelState::Closing
    );

    node.chain.mine(1);
    let report = node.engine.channels().poll_chain().await.unwrap();
    assert_eq!(report.closed, vec![channel]);
}

// ═══════════════════════════════════════════════════════════════════════════════
// E: HTLC EXPIRY
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn scenario_e_expired_htlc_is_failed_back() {
    let node = node();
    let wallet = funded_wallet(&node, 2_000_000).await;
    let (channel, _peer) = open_channel(&node, &wallet).await;
    let channels = node.engine.channels();

    let (_, hash) = payment(11);
    let htlc = channels
        .add_htlc(channel, hash, 100_000, node.chain.height() + 5)
        .await
        .unwrap();
    assert_eq!(
        channels.channel(&channel).await.unwrap().commitment.local_balance,
        900_000
    );

    let (swept, _) = node.engine.sweeper().run_once().await.unwrap();
    assert!(swept.failed.is_empty());

    node.chain.mine(5);
    let (swept, _) = node.engine.sweeper().run_once().await.unwrap();
    assert_eq!(swept.failed, vec![htlc]);
    assert!(swept.force_closed.is_empty());

    let record = channels.channel(&channel).await.unwrap();
    assert_eq!(record.state, ChannelState::Open);
    assert_eq!(record.commitment.local_balance, 1_000_000);
    assert!(record.commitment.htlcs.is_empty());
    record.check_balance_invariant().unwrap();
    assert_eq!(channels.htlc_status(htlc).await.unwrap(), HtlcStatus::Failed);
}
