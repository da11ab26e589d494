//! Persistent bridge state, as seen by a single invocation.
//!
//! Hosts back this with their own state tree and discard every write of an invocation that
//! returns an error.

use crate::federation::Federation;
use crate::Result;
use bitcoin::{OutPoint, Script, ScriptBuf, Transaction, Txid};
use ethers_core::types::{H160, H256, U256};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FederationUtxo {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script_pubkey: ScriptBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseRequest {
    pub destination: ScriptBuf,
    pub amount: u64,
    pub request_id: H256,
}

/// Release transaction waiting for sidechain confirmations before signing starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PegoutWaitingForConfirmations {
    pub btc_tx: Transaction,
    pub creation_block_number: u64,
    pub creation_request_id: H256,
    pub outpoint_values: Vec<u64>,
}

/// Release transaction (possibly partially signed) waiting for federator signatures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRelease {
    pub btc_tx: Transaction,
    pub outpoint_values: Vec<u64>,
}

/// Links a flyover deposit script back to the federation that can spend it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlyoverFederationInformation {
    pub derivation_hash: H256,
    pub federation_redeem_script: ScriptBuf,
    pub flyover_script_pubkey: ScriptBuf,
}

pub trait BridgeStorage {
    fn active_federation(&self) -> Result<Option<Federation>>;
    fn set_active_federation(&mut self, federation: Federation) -> Result<()>;
    fn retiring_federation(&self) -> Result<Option<Federation>>;
    fn set_retiring_federation(&mut self, federation: Option<Federation>) -> Result<()>;
    fn proposed_federation(&self) -> Result<Option<Federation>>;
    fn set_proposed_federation(&mut self, federation: Option<Federation>) -> Result<()>;
    fn proposed_federation_validated(&self) -> Result<bool>;
    fn set_proposed_federation_validated(&mut self, validated: bool) -> Result<()>;
    fn last_retired_federation_script(&self) -> Result<Option<ScriptBuf>>;
    fn set_last_retired_federation_script(&mut self, script: Option<ScriptBuf>) -> Result<()>;
    /// Sidechain block at which the active federation took over from the retiring one.
    fn federation_change_block_number(&self) -> Result<Option<u64>>;
    fn set_federation_change_block_number(&mut self, block_number: Option<u64>) -> Result<()>;

    fn active_federation_utxos(&self) -> Result<Vec<FederationUtxo>>;
    fn set_active_federation_utxos(&mut self, utxos: Vec<FederationUtxo>) -> Result<()>;
    fn retiring_federation_utxos(&self) -> Result<Vec<FederationUtxo>>;
    fn set_retiring_federation_utxos(&mut self, utxos: Vec<FederationUtxo>) -> Result<()>;

    fn svp_fund_tx_hash_unsigned(&self) -> Result<Option<Txid>>;
    fn set_svp_fund_tx_hash_unsigned(&mut self, hash: Option<Txid>) -> Result<()>;
    fn svp_fund_tx_signed(&self) -> Result<Option<Transaction>>;
    fn set_svp_fund_tx_signed(&mut self, tx: Option<Transaction>) -> Result<()>;
    fn svp_spend_tx_waiting_for_signatures(&self) -> Result<Option<(H256, PendingRelease)>>;
    fn set_svp_spend_tx_waiting_for_signatures(
        &mut self,
        entry: Option<(H256, PendingRelease)>,
    ) -> Result<()>;
    fn svp_spend_tx_hash_unsigned(&self) -> Result<Option<Txid>>;
    fn set_svp_spend_tx_hash_unsigned(&mut self, hash: Option<Txid>) -> Result<()>;

    fn clear_svp_values(&mut self) -> Result<()> {
        self.set_svp_fund_tx_hash_unsigned(None)?;
        self.set_svp_fund_tx_signed(None)?;
        self.set_svp_spend_tx_waiting_for_signatures(None)?;
        self.set_svp_spend_tx_hash_unsigned(None)
    }

    fn has_pegout_tx_sig_hash(&self, sighash: &[u8; 32]) -> Result<bool>;
    fn set_pegout_tx_sig_hash(&mut self, sighash: [u8; 32]) -> Result<()>;
    fn btc_tx_hash_processed_height(&self, txid: &Txid) -> Result<Option<u64>>;
    fn set_btc_tx_hash_processed_height(&mut self, txid: Txid, height: u64) -> Result<()>;
    fn is_flyover_derivation_hash_used(&self, txid: &Txid, derivation_hash: &H256) -> Result<bool>;
    fn mark_flyover_derivation_hash_used(&mut self, txid: Txid, derivation_hash: H256)
        -> Result<()>;
    fn flyover_federation_information(
        &self,
        flyover_script_pubkey: &Script,
    ) -> Result<Option<FlyoverFederationInformation>>;
    fn set_flyover_federation_information(
        &mut self,
        info: FlyoverFederationInformation,
    ) -> Result<()>;

    fn release_requests(&self) -> Result<Vec<ReleaseRequest>>;
    fn set_release_requests(&mut self, requests: Vec<ReleaseRequest>) -> Result<()>;
    fn pegouts_waiting_for_confirmations(&self) -> Result<Vec<PegoutWaitingForConfirmations>>;
    fn set_pegouts_waiting_for_confirmations(
        &mut self,
        pegouts: Vec<PegoutWaitingForConfirmations>,
    ) -> Result<()>;
    fn pegouts_waiting_for_signatures(&self) -> Result<BTreeMap<H256, PendingRelease>>;
    fn set_pegouts_waiting_for_signatures(
        &mut self,
        pegouts: BTreeMap<H256, PendingRelease>,
    ) -> Result<()>;

    fn locking_cap(&self) -> Result<Option<u64>>;
    fn set_locking_cap(&mut self, cap: u64) -> Result<()>;
    /// Sats held by the federations on behalf of sidechain accounts.
    fn custodied_balance(&self) -> Result<u64>;
    fn set_custodied_balance(&mut self, balance: u64) -> Result<()>;
    fn fee_per_kb(&self) -> Result<Option<u64>>;
    fn set_fee_per_kb(&mut self, fee_per_kb: u64) -> Result<()>;

    fn sidechain_balance(&self, address: &H160) -> Result<U256>;
    fn set_sidechain_balance(&mut self, address: H160, balance: U256) -> Result<()>;
}

#[derive(Clone, Debug, Default)]
pub struct MemoryBridgeStorage {
    active_federation: Option<Federation>,
    retiring_federation: Option<Federation>,
    proposed_federation: Option<Federation>,
    proposed_federation_validated: bool,
    last_retired_federation_script: Option<ScriptBuf>,
    federation_change_block_number: Option<u64>,
    active_federation_utxos: Vec<FederationUtxo>,
    retiring_federation_utxos: Vec<FederationUtxo>,
    svp_fund_tx_hash_unsigned: Option<Txid>,
    svp_fund_tx_signed: Option<Transaction>,
    svp_spend_tx_waiting_for_signatures: Option<(H256, PendingRelease)>,
    svp_spend_tx_hash_unsigned: Option<Txid>,
    pegout_tx_sig_hashes: BTreeSet<[u8; 32]>,
    processed_btc_txs: HashMap<Txid, u64>,
    used_flyover_derivation_hashes: BTreeSet<(Txid, H256)>,
    flyover_federation_information: HashMap<ScriptBuf, FlyoverFederationInformation>,
    release_requests: Vec<ReleaseRequest>,
    pegouts_waiting_for_confirmations: Vec<PegoutWaitingForConfirmations>,
    pegouts_waiting_for_signatures: BTreeMap<H256, PendingRelease>,
    locking_cap: Option<u64>,
    custodied_balance: u64,
    fee_per_kb: Option<u64>,
    sidechain_balances: HashMap<H160, U256>,
}

impl MemoryBridgeStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BridgeStorage for MemoryBridgeStorage {
    fn active_federation(&self) -> Result<Option<Federation>> {
        Ok(self.active_federation.clone())
    }

    fn set_active_federation(&mut self, federation: Federation) -> Result<()> {
        self.active_federation = Some(federation);
        Ok(())
    }

    fn retiring_federation(&self) -> Result<Option<Federation>> {
        Ok(self.retiring_federation.clone())
    }

    fn set_retiring_federation(&mut self, federation: Option<Federation>) -> Result<()> {
        self.retiring_federation = federation;
        Ok(())
    }

    fn proposed_federation(&self) -> Result<Option<Federation>> {
        Ok(self.proposed_federation.clone())
    }

    fn set_proposed_federation(&mut self, federation: Option<Federation>) -> Result<()> {
        self.proposed_federation = federation;
        Ok(())
    }

    fn proposed_federation_validated(&self) -> Result<bool> {
        Ok(self.proposed_federation_validated)
    }

    fn set_proposed_federation_validated(&mut self, validated: bool) -> Result<()> {
        self.proposed_federation_validated = validated;
        Ok(())
    }

    fn last_retired_federation_script(&self) -> Result<Option<ScriptBuf>> {
        Ok(self.last_retired_federation_script.clone())
    }

    fn set_last_retired_federation_script(&mut self, script: Option<ScriptBuf>) -> Result<()> {
        self.last_retired_federation_script = script;
        Ok(())
    }

    fn federation_change_block_number(&self) -> Result<Option<u64>> {
        Ok(self.federation_change_block_number)
    }

    fn set_federation_change_block_number(&mut self, block_number: Option<u64>) -> Result<()> {
        self.federation_change_block_number = block_number;
        Ok(())
    }

    fn active_federation_utxos(&self) -> Result<Vec<FederationUtxo>> {
        Ok(self.active_federation_utxos.clone())
    }

    fn set_active_federation_utxos(&mut self, utxos: Vec<FederationUtxo>) -> Result<()> {
        self.active_federation_utxos = utxos;
        Ok(())
    }

    fn retiring_federation_utxos(&self) -> Result<Vec<FederationUtxo>> {
        Ok(self.retiring_federation_utxos.clone())
    }

    fn set_retiring_federation_utxos(&mut self, utxos: Vec<FederationUtxo>) -> Result<()> {
        self.retiring_federation_utxos = utxos;
        Ok(())
    }

    fn svp_fund_tx_hash_unsigned(&self) -> Result<Option<Txid>> {
        Ok(self.svp_fund_tx_hash_unsigned)
    }

    fn set_svp_fund_tx_hash_unsigned(&mut self, hash: Option<Txid>) -> Result<()> {
        self.svp_fund_tx_hash_unsigned = hash;
        Ok(())
    }

    fn svp_fund_tx_signed(&self) -> Result<Option<Transaction>> {
        Ok(self.svp_fund_tx_signed.clone())
    }

    fn set_svp_fund_tx_signed(&mut self, tx: Option<Transaction>) -> Result<()> {
        self.svp_fund_tx_signed = tx;
        Ok(())
    }

    fn svp_spend_tx_waiting_for_signatures(&self) -> Result<Option<(H256, PendingRelease)>> {
        Ok(self.svp_spend_tx_waiting_for_signatures.clone())
    }

    fn set_svp_spend_tx_waiting_for_signatures(
        &mut self,
        entry: Option<(H256, PendingRelease)>,
    ) -> Result<()> {
        self.svp_spend_tx_waiting_for_signatures = entry;
        Ok(())
    }

    fn svp_spend_tx_hash_unsigned(&self) -> Result<Option<Txid>> {
        Ok(self.svp_spend_tx_hash_unsigned)
    }

    fn set_svp_spend_tx_hash_unsigned(&mut self, hash: Option<Txid>) -> Result<()> {
        self.svp_spend_tx_hash_unsigned = hash;
        Ok(())
    }

    fn has_pegout_tx_sig_hash(&self, sighash: &[u8; 32]) -> Result<bool> {
        Ok(self.pegout_tx_sig_hashes.contains(sighash))
    }

    fn set_pegout_tx_sig_hash(&mut self, sighash: [u8; 32]) -> Result<()> {
        self.pegout_tx_sig_hashes.insert(sighash);
        Ok(())
    }

    fn btc_tx_hash_processed_height(&self, txid: &Txid) -> Result<Option<u64>> {
        Ok(self.processed_btc_txs.get(txid).copied())
    }

    fn set_btc_tx_hash_processed_height(&mut self, txid: Txid, height: u64) -> Result<()> {
        self.processed_btc_txs.insert(txid, height);
        Ok(())
    }

    fn is_flyover_derivation_hash_used(&self, txid: &Txid, derivation_hash: &H256) -> Result<bool> {
        Ok(self
            .used_flyover_derivation_hashes
            .contains(&(*txid, *derivation_hash)))
    }

    fn mark_flyover_derivation_hash_used(
        &mut self,
        txid: Txid,
        derivation_hash: H256,
    ) -> Result<()> {
        self.used_flyover_derivation_hashes
            .insert((txid, derivation_hash));
        Ok(())
    }

    fn flyover_federation_information(
        &self,
        flyover_script_pubkey: &Script,
    ) -> Result<Option<FlyoverFederationInformation>> {
        Ok(self
            .flyover_federation_information
            .get(flyover_script_pubkey)
            .cloned())
    }

    fn set_flyover_federation_information(
        &mut self,
        info: FlyoverFederationInformation,
    ) -> Result<()> {
        self.flyover_federation_information
            .insert(info.flyover_script_pubkey.clone(), info);
        Ok(())
    }

    fn release_requests(&self) -> Result<Vec<ReleaseRequest>> {
        Ok(self.release_requests.clone())
    }

    fn set_release_requests(&mut self, requests: Vec<ReleaseRequest>) -> Result<()> {
        self.release_requests = requests;
        Ok(())
    }

    fn pegouts_waiting_for_confirmations(&self) -> Result<Vec<PegoutWaitingForConfirmations>> {
        Ok(self.pegouts_waiting_for_confirmations.clone())
    }

    fn set_pegouts_waiting_for_confirmations(
        &mut self,
        pegouts: Vec<PegoutWaitingForConfirmations>,
    ) -> Result<()> {
        self.pegouts_waiting_for_confirmations = pegouts;
        Ok(())
    }

    fn pegouts_waiting_for_signatures(&self) -> Result<BTreeMap<H256, PendingRelease>> {
        Ok(self.pegouts_waiting_for_signatures.clone())
    }

    fn set_pegouts_waiting_for_signatures(
        &mut self,
        pegouts: BTreeMap<H256, PendingRelease>,
    ) -> Result<()> {
        self.pegouts_waiting_for_signatures = pegouts;
        Ok(())
    }

    fn locking_cap(&self) -> Result<Option<u64>> {
        Ok(self.locking_cap)
    }

    fn set_locking_cap(&mut self, cap: u64) -> Result<()> {
        self.locking_cap = Some(cap);
        Ok(())
    }

    fn custodied_balance(&self) -> Result<u64> {
        Ok(self.custodied_balance)
    }

    fn set_custodied_balance(&mut self, balance: u64) -> Result<()> {
        self.custodied_balance = balance;
        Ok(())
    }

    fn fee_per_kb(&self) -> Result<Option<u64>> {
        Ok(self.fee_per_kb)
    }

    fn set_fee_per_kb(&mut self, fee_per_kb: u64) -> Result<()> {
        self.fee_per_kb = Some(fee_per_kb);
        Ok(())
    }

    fn sidechain_balance(&self, address: &H160) -> Result<U256> {
        Ok(self
            .sidechain_balances
            .get(address)
            .copied()
            .unwrap_or_default())
    }

    fn set_sidechain_balance(&mut self, address: H160, balance: U256) -> Result<()> {
        self.sidechain_balances.insert(address, balance);
        Ok(())
    }
}
