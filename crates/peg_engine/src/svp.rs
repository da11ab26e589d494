//! Validation of a proposed federation: the active federation funds two outputs the proposed
//! federation controls (one of them flyover-prefixed), and the proposed federation spends both
//! back before its deadline.

use crate::activations::{ActivationsForBlock, ConsensusRule};
use crate::bridge::{Bridge, CallContext};
use crate::chain::BtcBlockchain;
use crate::events::BridgeEvent;
use crate::federation::{Federation, FederationRole};
use crate::metrics::{PEGOUT_TXS_CREATED, SVP_TRANSITIONS};
use crate::scripts::{encode_outpoint_values, unsigned_tx_hash};
use crate::storage::{BridgeStorage, PendingRelease};
use crate::wallet::{build_payment, build_sweep, FeePolicy, SpendableUtxo};
use crate::{Error, Result};
use bitcoin::{OutPoint, Transaction, TxOut, Txid};
use ethers_core::types::H256;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SvpState {
    None,
    FundUnsigned(Txid),
    FundSigned(Transaction),
    SpendPendingSignatures { request_id: H256, tx: Transaction },
    SpendUnsigned(Txid),
}

impl<'a, S, B> Bridge<'a, S, B>
where
    S: BridgeStorage + ?Sized,
    B: BtcBlockchain + ?Sized,
{
    pub fn svp_state(&self) -> Result<SvpState> {
        if let Some(hash) = self.storage.svp_fund_tx_hash_unsigned()? {
            return Ok(SvpState::FundUnsigned(hash));
        }
        if let Some(tx) = self.storage.svp_fund_tx_signed()? {
            return Ok(SvpState::FundSigned(tx));
        }
        if let Some((request_id, pending)) = self.storage.svp_spend_tx_waiting_for_signatures()? {
            return Ok(SvpState::SpendPendingSignatures {
                request_id,
                tx: pending.btc_tx,
            });
        }
        if let Some(hash) = self.storage.svp_spend_tx_hash_unsigned()? {
            return Ok(SvpState::SpendUnsigned(hash));
        }
        Ok(SvpState::None)
    }

    pub(crate) fn process_svp(
        &mut self,
        ctx: &CallContext,
        activations: ActivationsForBlock,
    ) -> Result<()> {
        if !activations.is_active(ConsensusRule::Svp) {
            return Ok(());
        }
        let Some(proposed) = self.storage.proposed_federation()? else {
            return Ok(());
        };
        if self.storage.proposed_federation_validated()? {
            return Ok(());
        }

        let deadline = proposed.creation_block_number() + self.constants.svp_period_blocks;
        if ctx.block_number >= deadline {
            return self.fail_svp(ctx, &proposed);
        }

        match self.svp_state()? {
            SvpState::None => self.create_svp_fund_transaction(ctx, &proposed),
            SvpState::FundSigned(fund_tx) => {
                // the spend shares no request id with the pending pegouts
                if self
                    .storage
                    .pegouts_waiting_for_signatures()?
                    .contains_key(&ctx.tx_hash)
                {
                    debug!(
                        "Request {:?} already waiting for signatures, spend deferred",
                        ctx.tx_hash
                    );
                    return Ok(());
                }
                self.create_svp_spend_transaction(ctx, &proposed, &fund_tx)
            }
            state => {
                debug!("Validation of {} waiting in state {state:?}", proposed.address());
                Ok(())
            }
        }
    }

    fn fail_svp(&mut self, ctx: &CallContext, proposed: &Federation) -> Result<()> {
        self.storage.clear_svp_values()?;
        self.storage.set_proposed_federation(None)?;
        self.storage.set_proposed_federation_validated(false)?;

        self.events.emit(BridgeEvent::CommitFederationFailed {
            proposed_redeem_script: proposed.redeem_script().to_owned(),
            failure_height: ctx.block_number,
        });
        SVP_TRANSITIONS.with_label_values(&["failed"]).inc();
        info!(
            "Validation of proposed federation {} expired at block {}",
            proposed.address(),
            ctx.block_number
        );
        Ok(())
    }

    fn create_svp_fund_transaction(
        &mut self,
        ctx: &CallContext,
        proposed: &Federation,
    ) -> Result<()> {
        let value = self.constants.svp_spendable_value;
        let prefix = self.constants.proposed_federation_flyover_prefix;
        let outputs = vec![
            TxOut {
                value,
                script_pubkey: proposed.script_pubkey().to_owned(),
            },
            TxOut {
                value,
                script_pubkey: proposed.flyover_script_pubkey(&prefix),
            },
        ];

        let active = self.registry().active_federation()?;
        let utxos = self.storage.active_federation_utxos()?;
        let spendable = self.spendable_utxos(&active, &utxos)?;
        let built = match build_payment(
            &spendable,
            outputs,
            active.script_pubkey(),
            self.fee_rate()?,
            FeePolicy::PaidByChange,
        ) {
            Ok(built) => built,
            Err(
                err @ (Error::InsufficientFunds { .. }
                | Error::CoinSelection(_)
                | Error::DustOutput(_)),
            ) => {
                warn!("Unable to fund the proposed federation validation: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        self.remove_federation_utxos(FederationRole::Active, &built.spent_outpoints())?;
        self.storage
            .set_svp_fund_tx_hash_unsigned(Some(unsigned_tx_hash(&built.tx)?))?;
        self.enqueue_for_confirmations(ctx, &built, "svp_fund")?;
        SVP_TRANSITIONS.with_label_values(&["fund_created"]).inc();
        info!(
            "Created validation fund transaction {} for {}",
            built.tx.txid(),
            proposed.address()
        );
        Ok(())
    }

    /// Moves the validation to signed once the fund transaction is registered.
    pub(crate) fn register_svp_fund(&mut self, tx: &Transaction) -> Result<()> {
        let Some(expected) = self.storage.svp_fund_tx_hash_unsigned()? else {
            return Ok(());
        };
        if unsigned_tx_hash(tx).ok() != Some(expected) {
            return Ok(());
        }
        self.storage.set_svp_fund_tx_hash_unsigned(None)?;
        self.storage.set_svp_fund_tx_signed(Some(tx.clone()))?;
        SVP_TRANSITIONS.with_label_values(&["fund_signed"]).inc();
        info!("Validation fund transaction {} registered", tx.txid());
        Ok(())
    }

    fn create_svp_spend_transaction(
        &mut self,
        ctx: &CallContext,
        proposed: &Federation,
        fund_tx: &Transaction,
    ) -> Result<()> {
        let prefix = self.constants.proposed_federation_flyover_prefix;
        let fund_txid = fund_tx.txid();
        let inputs = [
            (
                proposed.script_pubkey().to_owned(),
                proposed.redeem_script().to_owned(),
            ),
            (
                proposed.flyover_script_pubkey(&prefix),
                proposed.flyover_redeem_script(&prefix),
            ),
        ]
        .into_iter()
        .map(|(script_pubkey, redeem_script)| {
            let vout = fund_tx
                .output
                .iter()
                .position(|output| output.script_pubkey == script_pubkey)
                .ok_or_else(|| {
                    Error::IllegalState(format!(
                        "fund transaction {fund_txid} does not pay {script_pubkey}"
                    ))
                })?;
            Ok(SpendableUtxo {
                outpoint: OutPoint::new(fund_txid, vout as u32),
                value: fund_tx.output[vout].value,
                script_pubkey,
                redeem_script,
                format: proposed.format(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

        let active = self.registry().active_federation()?;
        let built = match build_sweep(&inputs, active.script_pubkey(), self.fee_rate()?) {
            Ok(built) => built,
            Err(err @ (Error::InsufficientFunds { .. } | Error::DustOutput(_))) => {
                warn!("Unable to build the validation spend transaction: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let btc_tx_hash = built.tx.txid();
        self.storage.set_svp_fund_tx_signed(None)?;
        self.storage.set_svp_spend_tx_waiting_for_signatures(Some((
            ctx.tx_hash,
            PendingRelease {
                btc_tx: built.tx.clone(),
                outpoint_values: built.outpoint_values.clone(),
            },
        )))?;

        self.events.emit(BridgeEvent::PegoutTransactionCreated {
            btc_tx_hash,
            outpoint_values: encode_outpoint_values(&built.outpoint_values),
        });
        self.events.emit(BridgeEvent::ReleaseRequested {
            request_id: ctx.tx_hash,
            btc_tx_hash,
            amount: built.tx.output[0].value,
        });
        PEGOUT_TXS_CREATED.with_label_values(&["svp_spend"]).inc();
        SVP_TRANSITIONS.with_label_values(&["spend_created"]).inc();
        info!(
            "Created validation spend transaction {btc_tx_hash} for {}",
            proposed.address()
        );
        Ok(())
    }

    /// Completes the validation when the signed spend transaction is registered.
    pub(crate) fn register_svp_spend(&mut self, tx: &Transaction) -> Result<bool> {
        let Some(expected) = self.storage.svp_spend_tx_hash_unsigned()? else {
            return Ok(false);
        };
        if unsigned_tx_hash(tx).ok() != Some(expected) {
            return Ok(false);
        }

        let active = self.registry().active_federation()?;
        self.add_federation_utxos(
            FederationRole::Active,
            Self::federation_outputs(tx, active.script_pubkey()),
        )?;
        self.storage.clear_svp_values()?;
        self.storage.set_proposed_federation_validated(true)?;
        SVP_TRANSITIONS.with_label_values(&["validated"]).inc();
        info!("Proposed federation validated by spend transaction {}", tx.txid());
        Ok(true)
    }
}
