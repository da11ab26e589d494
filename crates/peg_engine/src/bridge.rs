use crate::activations::{ActivationsForBlock, ConsensusRule};
use crate::chain::BtcBlockchain;
use crate::classifier::{classify, ClassifierContext, PegTxType};
use crate::constants::BridgeConstants;
use crate::dispatch::CallKind;
use crate::events::{BridgeEvent, EventLog};
use crate::federation::{Federation, FederationMember, FederationRole};
use crate::metrics::{CUSTODIED_BALANCE, PEGOUT_TXS_CREATED};
use crate::registry::FederationRegistry;
use crate::scripts::{encode_outpoint_values, redeem_script_of};
use crate::storage::{
    BridgeStorage, FederationUtxo, PegoutWaitingForConfirmations, PendingRelease, ReleaseRequest,
};
use crate::wallet::{
    build_payment, build_sweep, fee_rate_from_fee_per_kb, BuiltTransaction, FeePolicy, FeeRate,
    SpendableUtxo,
};
use crate::{sats_to_wei, wei_to_sats, Error, Result};
use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use ethers_core::types::{H160, H256, U256};
use tracing::{debug, info, warn};

/// Invocation metadata supplied by the host ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallContext {
    /// Hash of the sidechain transaction, doubles as the request id
    pub tx_hash: H256,
    pub sender: H160,
    pub sender_is_contract: bool,
    pub kind: CallKind,
    pub block_number: u64,
}

impl CallContext {
    pub fn direct(sender: H160, tx_hash: H256, block_number: u64) -> Self {
        Self {
            tx_hash,
            sender,
            sender_is_contract: false,
            kind: CallKind::Call,
            block_number,
        }
    }

    pub fn from_contract(sender: H160, tx_hash: H256, block_number: u64) -> Self {
        Self {
            sender_is_contract: true,
            ..Self::direct(sender, tx_hash, block_number)
        }
    }
}

/// Federations relevant to a single call, read once.
pub(crate) struct FederationSnapshot {
    pub active: Federation,
    pub retiring: Option<Federation>,
    pub last_retired_script: Option<ScriptBuf>,
}

impl FederationSnapshot {
    pub fn classifier_context(
        &self,
        activations: ActivationsForBlock,
        minimum_pegin_value: u64,
    ) -> ClassifierContext<'_> {
        ClassifierContext {
            active_federation: &self.active,
            retiring_federation: self.retiring.as_ref(),
            last_retired_federation_script: self.last_retired_script.as_deref(),
            activations,
            minimum_pegin_value,
        }
    }

    pub fn federation(&self, role: FederationRole) -> Option<&Federation> {
        match role {
            FederationRole::Active => Some(&self.active),
            FederationRole::Retiring => self.retiring.as_ref(),
            FederationRole::Proposed => None,
        }
    }
}

/// The peg engine, bound to the state of one invocation.
pub struct Bridge<'a, S: ?Sized, B: ?Sized> {
    pub(crate) constants: &'a BridgeConstants,
    pub(crate) storage: &'a mut S,
    pub(crate) btc_chain: &'a B,
    pub(crate) events: EventLog,
}

impl<'a, S, B> Bridge<'a, S, B>
where
    S: BridgeStorage + ?Sized,
    B: BtcBlockchain + ?Sized,
{
    pub fn new(constants: &'a BridgeConstants, storage: &'a mut S, btc_chain: &'a B) -> Self {
        Self {
            constants,
            storage,
            btc_chain,
            events: EventLog::default(),
        }
    }

    pub fn events(&self) -> &[BridgeEvent] {
        self.events.events()
    }

    pub fn take_events(&mut self) -> Vec<BridgeEvent> {
        self.events.take()
    }

    pub fn storage(&self) -> &S {
        self.storage
    }

    pub fn constants(&self) -> &BridgeConstants {
        self.constants
    }

    pub fn activations(&self, ctx: &CallContext) -> ActivationsForBlock {
        self.constants.activations.for_block(ctx.block_number)
    }

    pub fn registry(&self) -> FederationRegistry<'_, S> {
        FederationRegistry::new(&*self.storage, self.constants)
    }

    pub(crate) fn federation_snapshot(&self) -> Result<FederationSnapshot> {
        let registry = self.registry();
        Ok(FederationSnapshot {
            active: registry.active_federation()?,
            retiring: registry.retiring_federation()?,
            last_retired_script: registry.last_retired_federation_script()?,
        })
    }

    pub fn classify_transaction(
        &self,
        tx: &Transaction,
        activations: ActivationsForBlock,
    ) -> Result<PegTxType> {
        let snapshot = self.federation_snapshot()?;
        let ctx = snapshot.classifier_context(activations, self.constants.minimum_pegin_value);
        classify(tx, &ctx, &*self.storage)
    }

    pub fn locking_cap(&self) -> Result<u64> {
        Ok(self
            .storage
            .locking_cap()?
            .unwrap_or(self.constants.initial_locking_cap))
    }

    pub fn custodied_balance(&self) -> Result<u64> {
        self.storage.custodied_balance()
    }

    pub fn fee_per_kb(&self) -> Result<u64> {
        Ok(self
            .storage
            .fee_per_kb()?
            .unwrap_or(self.constants.default_fee_per_kb))
    }

    pub(crate) fn fee_rate(&self) -> Result<FeeRate> {
        Ok(fee_rate_from_fee_per_kb(self.fee_per_kb()?))
    }

    pub(crate) fn credit_sidechain(&mut self, recipient: H160, sats: u64) -> Result<()> {
        let balance = self.storage.sidechain_balance(&recipient)?;
        self.storage
            .set_sidechain_balance(recipient, balance + sats_to_wei(sats))
    }

    pub(crate) fn add_custodied(&mut self, sats: u64) -> Result<()> {
        let balance = self.storage.custodied_balance()? + sats;
        self.storage.set_custodied_balance(balance)?;
        CUSTODIED_BALANCE.set(balance as i64);
        Ok(())
    }

    fn remove_custodied(&mut self, sats: u64) -> Result<()> {
        let balance = self.storage.custodied_balance()?.saturating_sub(sats);
        self.storage.set_custodied_balance(balance)?;
        CUSTODIED_BALANCE.set(balance as i64);
        Ok(())
    }

    pub(crate) fn add_federation_utxos(
        &mut self,
        role: FederationRole,
        new_utxos: Vec<FederationUtxo>,
    ) -> Result<()> {
        if new_utxos.is_empty() {
            return Ok(());
        }
        let mut utxos = self.registry().utxos(role)?;
        for utxo in new_utxos {
            if !utxos.iter().any(|x| x.outpoint == utxo.outpoint) {
                utxos.push(utxo);
            }
        }
        match role {
            FederationRole::Active => self.storage.set_active_federation_utxos(utxos),
            FederationRole::Retiring => self.storage.set_retiring_federation_utxos(utxos),
            FederationRole::Proposed => Err(Error::IllegalState(
                "the proposed federation holds no utxos".into(),
            )),
        }
    }

    pub(crate) fn remove_federation_utxos(&mut self, role: FederationRole, spent: &[OutPoint]) -> Result<()> {
        let utxos = self
            .registry()
            .utxos(role)?
            .into_iter()
            .filter(|x| !spent.contains(&x.outpoint))
            .collect();
        match role {
            FederationRole::Active => self.storage.set_active_federation_utxos(utxos),
            FederationRole::Retiring => self.storage.set_retiring_federation_utxos(utxos),
            FederationRole::Proposed => Ok(()),
        }
    }

    /// Outputs of `tx` paying one of the given federation scripts.
    pub(crate) fn federation_outputs(tx: &Transaction, script_pubkey: &bitcoin::Script) -> Vec<FederationUtxo> {
        let txid = tx.txid();
        tx.output
            .iter()
            .enumerate()
            .filter(|(_, output)| output.script_pubkey.as_script() == script_pubkey)
            .map(|(vout, output)| FederationUtxo {
                outpoint: OutPoint::new(txid, vout as u32),
                value: output.value,
                script_pubkey: output.script_pubkey.clone(),
            })
            .collect()
    }

    /// Attaches the spending script to each utxo of `federation`.
    pub(crate) fn spendable_utxos(
        &self,
        federation: &Federation,
        utxos: &[FederationUtxo],
    ) -> Result<Vec<SpendableUtxo>> {
        utxos
            .iter()
            .map(|utxo| {
                let redeem_script = if utxo.script_pubkey.as_script() == federation.script_pubkey() {
                    federation.redeem_script().to_owned()
                } else {
                    match self
                        .storage
                        .flyover_federation_information(&utxo.script_pubkey)?
                    {
                        Some(info)
                            if info.federation_redeem_script.as_script()
                                == federation.redeem_script() =>
                        {
                            federation.flyover_redeem_script(&info.derivation_hash)
                        }
                        _ => {
                            return Err(Error::IllegalState(format!(
                                "utxo {} is not spendable by federation {}",
                                utxo.outpoint,
                                federation.address()
                            )))
                        }
                    }
                };
                Ok(SpendableUtxo {
                    outpoint: utxo.outpoint,
                    value: utxo.value,
                    script_pubkey: utxo.script_pubkey.clone(),
                    redeem_script,
                    format: federation.format(),
                })
            })
            .collect()
    }

    /// Queues an outbound transaction until it has enough sidechain confirmations.
    pub(crate) fn enqueue_for_confirmations(
        &mut self,
        ctx: &CallContext,
        built: &BuiltTransaction,
        kind: &str,
    ) -> Result<Txid> {
        let mut waiting = self.storage.pegouts_waiting_for_confirmations()?;
        waiting.push(PegoutWaitingForConfirmations {
            btc_tx: built.tx.clone(),
            creation_block_number: ctx.block_number,
            creation_request_id: ctx.tx_hash,
            outpoint_values: built.outpoint_values.clone(),
        });
        self.storage.set_pegouts_waiting_for_confirmations(waiting)?;

        let btc_tx_hash = built.tx.txid();
        self.events.emit(BridgeEvent::PegoutTransactionCreated {
            btc_tx_hash,
            outpoint_values: encode_outpoint_values(&built.outpoint_values),
        });
        PEGOUT_TXS_CREATED.with_label_values(&[kind]).inc();
        info!(%btc_tx_hash, kind, fee = built.fee, "Created outbound bitcoin transaction");
        Ok(btc_tx_hash)
    }

    pub fn request_release(
        &mut self,
        ctx: &CallContext,
        destination: &Address<NetworkUnchecked>,
        value: U256,
    ) -> Result<()> {
        let destination = destination
            .clone()
            .require_network(self.constants.btc_network)?;
        let amount = wei_to_sats(value);
        if amount < self.constants.minimum_pegout_value {
            return Err(Error::InvalidAmount(format!(
                "{amount} is below the minimum pegout value"
            )));
        }
        if amount > self.custodied_balance()? {
            return Err(Error::InvalidAmount(format!(
                "{amount} exceeds the custodied balance"
            )));
        }
        let balance = self.storage.sidechain_balance(&ctx.sender)?;
        let debit = sats_to_wei(amount);
        if balance < debit {
            return Err(Error::InvalidAmount(format!(
                "{:?} cannot release {amount} sats",
                ctx.sender
            )));
        }

        self.storage
            .set_sidechain_balance(ctx.sender, balance - debit)?;
        self.remove_custodied(amount)?;

        let mut requests = self.storage.release_requests()?;
        requests.push(ReleaseRequest {
            destination: destination.script_pubkey(),
            amount,
            request_id: ctx.tx_hash,
        });
        self.storage.set_release_requests(requests)?;

        self.events.emit(BridgeEvent::ReleaseRequestReceived {
            sender: ctx.sender,
            destination: destination.script_pubkey(),
            amount,
        });
        info!("Queued release of {amount} sats to {destination}");
        Ok(())
    }

    pub fn increase_locking_cap(&mut self, ctx: &CallContext, new_cap: u64) -> Result<()> {
        if ctx.sender != self.constants.locking_cap_authorizer {
            return Err(Error::Unauthorized(ctx.sender));
        }
        let current = self.locking_cap()?;
        let max = current.saturating_mul(self.constants.locking_cap_increments_multiplier);
        if new_cap < current || new_cap > max {
            return Err(Error::InvalidAmount(format!(
                "locking cap must be between {current} and {max}"
            )));
        }

        self.storage.set_locking_cap(new_cap)?;
        self.events.emit(BridgeEvent::LockingCapIncreased {
            caller: ctx.sender,
            old_cap: current,
            new_cap,
        });
        info!("Locking cap increased from {current} to {new_cap}");
        Ok(())
    }

    pub fn propose_federation(
        &mut self,
        ctx: &CallContext,
        members: Vec<FederationMember>,
    ) -> Result<Federation> {
        if ctx.sender != self.constants.federation_change_authorizer {
            return Err(Error::Unauthorized(ctx.sender));
        }
        if self.storage.proposed_federation()?.is_some() {
            return Err(Error::IllegalState(
                "a federation is already proposed".into(),
            ));
        }

        let federation = Federation::new(
            members,
            ctx.block_number,
            self.constants.federation_format,
            self.constants.btc_network,
        )?;
        if federation.redeem_script() == self.registry().active_federation()?.redeem_script() {
            return Err(Error::InvalidFederation(
                "proposal equals the active federation".into(),
            ));
        }

        // without validation the proposal can be committed right away
        let needs_validation = self.activations(ctx).is_active(ConsensusRule::Svp);
        self.storage
            .set_proposed_federation(Some(federation.clone()))?;
        self.storage
            .set_proposed_federation_validated(!needs_validation)?;
        self.storage.clear_svp_values()?;

        info!(
            "Proposed federation {} with {} members",
            federation.address(),
            federation.size()
        );
        Ok(federation)
    }

    pub fn commit_proposed_federation(&mut self, ctx: &CallContext) -> Result<()> {
        if ctx.sender != self.constants.federation_change_authorizer {
            return Err(Error::Unauthorized(ctx.sender));
        }
        let proposed = self
            .storage
            .proposed_federation()?
            .ok_or_else(|| Error::IllegalState("no proposed federation".into()))?;
        if !self.storage.proposed_federation_validated()? {
            return Err(Error::IllegalState(
                "proposed federation is not validated".into(),
            ));
        }
        if self.storage.retiring_federation()?.is_some() {
            return Err(Error::IllegalState(
                "the retiring federation has not been retired yet".into(),
            ));
        }

        let active = self.registry().active_federation()?;
        let active_utxos = self.storage.active_federation_utxos()?;
        self.storage.set_retiring_federation(Some(active.clone()))?;
        self.storage.set_retiring_federation_utxos(active_utxos)?;
        self.storage.set_active_federation_utxos(vec![])?;
        self.storage.set_active_federation(proposed.clone())?;
        self.storage.set_proposed_federation(None)?;
        self.storage.set_proposed_federation_validated(false)?;
        self.storage
            .set_federation_change_block_number(Some(ctx.block_number))?;

        self.events.emit(BridgeEvent::CommitFederation {
            old_federation_script: active.script_pubkey().to_owned(),
            new_federation_script: proposed.script_pubkey().to_owned(),
            activation_block_number: ctx.block_number,
        });
        info!(
            "Federation {} is now active, {} is retiring",
            proposed.address(),
            active.address()
        );
        Ok(())
    }

    /// Block tick: batches releases, hands confirmed pegouts to the signers, migrates retiring
    /// funds and advances the proposed federation validation.
    pub fn update_collections(&mut self, ctx: &CallContext) -> Result<()> {
        let activations = self.activations(ctx);
        self.process_release_requests(ctx)?;
        self.process_confirmed_pegouts(ctx)?;
        self.process_funds_migration(ctx)?;
        self.process_svp(ctx, activations)
    }

    fn process_release_requests(&mut self, ctx: &CallContext) -> Result<()> {
        let mut requests = self.storage.release_requests()?;
        if requests.is_empty() {
            return Ok(());
        }
        let batch_len = requests.len().min(self.constants.max_release_batch_size);
        let outputs = requests[..batch_len]
            .iter()
            .map(|request| TxOut {
                value: request.amount,
                script_pubkey: request.destination.clone(),
            })
            .collect();

        let active = self.registry().active_federation()?;
        let utxos = self.storage.active_federation_utxos()?;
        let spendable = self.spendable_utxos(&active, &utxos)?;
        let built = match build_payment(
            &spendable,
            outputs,
            active.script_pubkey(),
            self.fee_rate()?,
            FeePolicy::DeductFromOutputs,
        ) {
            Ok(built) => built,
            Err(err) => {
                warn!("Unable to build a release batch of {batch_len} requests: {err}");
                return Ok(());
            }
        };

        self.remove_federation_utxos(FederationRole::Active, &built.spent_outpoints())?;
        let btc_tx_hash = self.enqueue_for_confirmations(ctx, &built, "release")?;
        let amount = requests[..batch_len].iter().map(|r| r.amount).sum();
        requests.drain(..batch_len);
        self.storage.set_release_requests(requests)?;

        self.events.emit(BridgeEvent::ReleaseRequested {
            request_id: ctx.tx_hash,
            btc_tx_hash,
            amount,
        });
        Ok(())
    }

    fn process_confirmed_pegouts(&mut self, ctx: &CallContext) -> Result<()> {
        let mut waiting = self.storage.pegouts_waiting_for_confirmations()?;
        let confirmations = self.constants.pegout_confirmations;
        let Some(position) = waiting
            .iter()
            .position(|p| p.creation_block_number + confirmations <= ctx.block_number)
        else {
            return Ok(());
        };

        let pegout = waiting.remove(position);
        let mut signing = self.storage.pegouts_waiting_for_signatures()?;
        if signing.contains_key(&ctx.tx_hash) {
            return Err(Error::IllegalState(format!(
                "request {:?} is already waiting for signatures",
                ctx.tx_hash
            )));
        }
        debug!(
            "Pegout {} created at {} is ready for signing",
            pegout.btc_tx.txid(),
            pegout.creation_block_number
        );
        signing.insert(
            ctx.tx_hash,
            PendingRelease {
                btc_tx: pegout.btc_tx,
                outpoint_values: pegout.outpoint_values,
            },
        );
        self.storage.set_pegouts_waiting_for_confirmations(waiting)?;
        self.storage.set_pegouts_waiting_for_signatures(signing)
    }

    fn process_funds_migration(&mut self, ctx: &CallContext) -> Result<()> {
        let Some(retiring) = self.storage.retiring_federation()? else {
            return Ok(());
        };
        let change_block = self
            .storage
            .federation_change_block_number()?
            .unwrap_or_default();
        if ctx.block_number < change_block + self.constants.federation_migration_age {
            return Ok(());
        }

        let utxos = self.storage.retiring_federation_utxos()?;
        if !utxos.is_empty() {
            let active = self.registry().active_federation()?;
            let spendable = self.spendable_utxos(&retiring, &utxos)?;
            match build_sweep(&spendable, active.script_pubkey(), self.fee_rate()?) {
                Ok(built) => {
                    self.storage.set_retiring_federation_utxos(vec![])?;
                    self.enqueue_for_confirmations(ctx, &built, "migration")?;
                }
                Err(err) => {
                    warn!("Unable to build the migration transaction: {err}");
                    return Ok(());
                }
            }
        }

        // the retiring federation still has to sign its last spends
        if !self.has_pending_spend_from(&retiring)? {
            self.storage
                .set_last_retired_federation_script(Some(retiring.script_pubkey().to_owned()))?;
            self.storage.set_retiring_federation(None)?;
            self.storage.set_federation_change_block_number(None)?;
            info!("Retired federation {}", retiring.address());
        }
        Ok(())
    }

    fn has_pending_spend_from(&self, federation: &Federation) -> Result<bool> {
        let spends_from = |tx: &Transaction| {
            tx.input
                .first()
                .and_then(redeem_script_of)
                .map_or(false, |(script, _)| federation.owns_redeem_script(&script))
        };
        Ok(self
            .storage
            .pegouts_waiting_for_confirmations()?
            .iter()
            .any(|p| spends_from(&p.btc_tx))
            || self
                .storage
                .pegouts_waiting_for_signatures()?
                .values()
                .any(|p| spends_from(&p.btc_tx)))
    }
}
