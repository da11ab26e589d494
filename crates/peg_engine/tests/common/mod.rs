#![allow(dead_code)]

use peg_engine::bitcoin::absolute::LockTime;
use peg_engine::bitcoin::address::{NetworkUnchecked, Payload};
use peg_engine::bitcoin::consensus::encode::serialize;
use peg_engine::bitcoin::hashes::Hash;
use peg_engine::bitcoin::opcodes::all::OP_RETURN;
use peg_engine::bitcoin::script::{Builder, PushBytesBuf};
use peg_engine::bitcoin::secp256k1::{Secp256k1, SecretKey};
use peg_engine::bitcoin::{
    Address, Network, OutPoint, PubkeyHash, Script, Transaction, TxIn, TxOut, Txid,
};
use peg_engine::storage::PendingRelease;
use peg_engine::{
    BitcoinSigner, Bridge, BridgeCall, BridgeConstants, BridgeEvent, BridgeStorage, CallContext,
    CallResult, FederationMember, MemoryBridgeStorage, MemoryBtcBlockchain, Result,
    REGTEST_FEDERATION_SECRET_KEYS,
};
use ethers_core::types::{H160, H256};
use std::str::FromStr;

pub fn genesis_signers() -> Vec<BitcoinSigner> {
    REGTEST_FEDERATION_SECRET_KEYS
        .iter()
        .map(|sk| BitcoinSigner::new(SecretKey::from_str(sk).unwrap()))
        .collect()
}

/// Keys that do not overlap with the regtest genesis federation.
pub fn fresh_keys(n: u8) -> Vec<SecretKey> {
    (0..n)
        .map(|i| SecretKey::from_slice(&[0x40 + i; 32]).unwrap())
        .collect()
}

pub fn members_of(keys: &[SecretKey]) -> Vec<FederationMember> {
    let secp = Secp256k1::new();
    keys.iter()
        .map(|sk| FederationMember::from_single_key(sk.public_key(&secp)))
        .collect()
}

pub fn user_address(seed: u8) -> Address<NetworkUnchecked> {
    Address::new(
        Network::Regtest,
        Payload::PubkeyHash(PubkeyHash::from_byte_array([seed; 20])),
    )
        .to_string()
        .parse()
        .unwrap()
}

pub fn pegin_payload(recipient: H160) -> TxOut {
    let mut payload = b"RSKT".to_vec();
    payload.push(1);
    payload.extend_from_slice(recipient.as_bytes());
    TxOut {
        value: 0,
        script_pubkey: Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(PushBytesBuf::try_from(payload).unwrap())
            .into_script(),
    }
}

/// Transaction paying `outputs`, spending an outpoint unique to `seed`.
pub fn tx_paying(seed: u8, outputs: &[(&Script, u64)]) -> Transaction {
    Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::hash(&[seed]), 0),
            ..Default::default()
        }],
        output: outputs
            .iter()
            .map(|(script, value)| TxOut {
                value: *value,
                script_pubkey: (*script).to_owned(),
            })
            .collect(),
    }
}

/// Bridge state that outlives single calls, together with the bitcoin chain it observes.
pub struct Harness {
    pub constants: BridgeConstants,
    pub storage: MemoryBridgeStorage,
    pub chain: MemoryBtcBlockchain,
    pub events: Vec<BridgeEvent>,
}

impl Harness {
    pub fn new(constants: BridgeConstants) -> Self {
        let mut chain = MemoryBtcBlockchain::new();
        chain.mine_empty_blocks(1);
        Self {
            constants,
            storage: MemoryBridgeStorage::new(),
            chain,
            events: vec![],
        }
    }

    pub fn with_bridge<T>(
        &mut self,
        f: impl FnOnce(&mut Bridge<'_, MemoryBridgeStorage, MemoryBtcBlockchain>) -> T,
    ) -> T {
        let mut bridge = Bridge::new(&self.constants, &mut self.storage, &self.chain);
        let out = f(&mut bridge);
        self.events.extend(bridge.take_events());
        out
    }

    pub fn call(&mut self, ctx: &CallContext, call: BridgeCall) -> Result<CallResult> {
        self.with_bridge(|bridge| bridge.execute(ctx, call))
    }

    /// Sender that belongs to the active federation.
    pub fn federator(&self, block_number: u64) -> CallContext {
        let active = match self.storage.active_federation().unwrap() {
            Some(active) => active,
            None => self.constants.genesis_federation().unwrap(),
        };
        CallContext::direct(
            active.members()[0].sidechain_address(),
            H256::from_low_u64_be(block_number),
            block_number,
        )
    }

    pub fn user(&self, sender: H160, block_number: u64) -> CallContext {
        CallContext::direct(sender, H256::from_low_u64_be(0x1000 + block_number), block_number)
    }

    /// Mines `tx` with enough confirmations and registers it.
    pub fn register(&mut self, tx: &Transaction, block_number: u64) -> Result<CallResult> {
        let txid = tx.txid();
        let filler = Txid::hash(&serialize(&block_number));
        let (height, pmt) = self.chain.mine_block(&[filler, txid], &txid);
        self.chain
            .mine_empty_blocks(self.constants.btc_confirmations - 1);
        let ctx = self.federator(block_number);
        self.call(
            &ctx,
            BridgeCall::RegisterBtcTransaction {
                raw_tx: serialize(tx),
                height,
                pmt,
            },
        )
    }

    pub fn update_collections(&mut self, block_number: u64) -> Result<CallResult> {
        let ctx = self.federator(block_number);
        self.call(&ctx, BridgeCall::UpdateCollections)
    }

    /// Only pending release, panics when there is not exactly one.
    pub fn single_release(&self) -> (H256, PendingRelease) {
        let waiting = self.storage.pegouts_waiting_for_signatures().unwrap();
        assert_eq!(waiting.len(), 1);
        waiting.into_iter().next().unwrap()
    }

    /// Has `signers` sign `pending` in order and returns the last result.
    pub fn sign(
        &mut self,
        block_number: u64,
        signers: &[BitcoinSigner],
        request_id: H256,
        pending: &PendingRelease,
    ) -> CallResult {
        let mut last = None;
        for signer in signers {
            let signatures = signer
                .sign_release(&pending.btc_tx, &pending.outpoint_values)
                .unwrap();
            let ctx = self.user(H160::from_low_u64_be(0xf00d), block_number);
            last = Some(
                self.call(
                    &ctx,
                    BridgeCall::AddSignature {
                        signer: signer.public_key(),
                        signatures,
                        request_id,
                    },
                )
                .unwrap(),
            );
        }
        last.unwrap()
    }
}
