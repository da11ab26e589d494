use crate::activations::{ActivationsForBlock, ConsensusRule};
use crate::bridge::{Bridge, CallContext, FederationSnapshot};
use crate::chain::{validate_registration, BtcBlockchain};
use crate::classifier::{pegin_value, PegTxType};
use crate::events::{BridgeEvent, RejectedPeginReason};
use crate::federation::{sidechain_address, FederationRole};
use crate::metrics::BTC_TX_REGISTRATIONS;
use crate::scripts::script_pushes;
use crate::storage::{BridgeStorage, FederationUtxo};
use crate::wallet::{build_sweep, SpendableUtxo};
use crate::{Error, Result};
use bitcoin::consensus::encode::deserialize;
use bitcoin::hashes::Hash;
use bitcoin::script::Instruction;
use bitcoin::{OutPoint, PubkeyHash, PublicKey as BitcoinPublicKey, Script, ScriptBuf, ScriptHash};
use bitcoin::{Transaction, Txid};
use ethers_core::types::H160;
use strum::IntoStaticStr;
use tracing::{debug, info, warn};

const PEGIN_PAYLOAD_PREFIX: &[u8] = b"RSKT";
const PEGIN_PROTOCOL_VERSION: u8 = 1;
const REFUND_ADDRESS_P2PKH: u8 = 1;
const REFUND_ADDRESS_P2SH: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RegistrationOutcome {
    AlreadyProcessed,
    PeginCredited {
        recipient: H160,
        amount: u64,
    },
    PeginRejected {
        reason: RejectedPeginReason,
        refunded: bool,
    },
    PegoutOrMigration,
    SvpSpendRegistered,
    Unknown,
}

/// Who a pegin credits, and where a rejected pegin is refunded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeginInformation {
    pub recipient: H160,
    pub refund_script: Option<ScriptBuf>,
    /// Zero when derived from the sender's public key
    pub protocol_version: u8,
}

/// Reads the pegin payload of `tx`, falling back to the sender of its first input.
pub fn parse_pegin_information(tx: &Transaction) -> Result<PeginInformation> {
    let payloads = tx
        .output
        .iter()
        .filter(|output| output.script_pubkey.is_op_return())
        .filter_map(|output| op_return_payload(&output.script_pubkey))
        .filter(|payload| payload.starts_with(PEGIN_PAYLOAD_PREFIX))
        .collect::<Vec<_>>();

    match payloads.as_slice() {
        [] => {
            let (key, _) = sender_public_key(tx).ok_or_else(|| {
                Error::ParsingError("no pegin payload and no recognizable sender".into())
            })?;
            Ok(PeginInformation {
                recipient: sidechain_address(&key.inner),
                refund_script: sender_refund_script(tx),
                protocol_version: 0,
            })
        }
        [payload] => parse_payload(&payload[PEGIN_PAYLOAD_PREFIX.len()..]),
        _ => Err(Error::ParsingError(
            "multiple pegin payloads in one transaction".into(),
        )),
    }
}

fn op_return_payload(script: &Script) -> Option<Vec<u8>> {
    match script.instructions().nth(1) {
        Some(Ok(Instruction::PushBytes(bytes))) => Some(bytes.as_bytes().to_vec()),
        _ => None,
    }
}

fn parse_payload(payload: &[u8]) -> Result<PeginInformation> {
    let (&version, rest) = payload
        .split_first()
        .ok_or_else(|| Error::ParsingError("empty pegin payload".into()))?;
    if version != PEGIN_PROTOCOL_VERSION {
        return Err(Error::ParsingError(format!(
            "unsupported pegin protocol version {version}"
        )));
    }

    let refund_script = match rest.len() {
        20 => None,
        41 => {
            let hash: [u8; 20] = rest[21..]
                .try_into()
                .map_err(|_| Error::ParsingError("refund address hash".into()))?;
            match rest[20] {
                REFUND_ADDRESS_P2PKH => {
                    Some(ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(hash)))
                }
                REFUND_ADDRESS_P2SH => {
                    Some(ScriptBuf::new_p2sh(&ScriptHash::from_byte_array(hash)))
                }
                other => {
                    return Err(Error::ParsingError(format!(
                        "unknown refund address type {other}"
                    )))
                }
            }
        }
        len => {
            return Err(Error::ParsingError(format!(
                "pegin payload of {len} bytes"
            )))
        }
    };

    Ok(PeginInformation {
        recipient: H160::from_slice(&rest[..20]),
        refund_script,
        protocol_version: version,
    })
}

/// Public key spent by the first input, and whether it was a witness spend.
fn sender_public_key(tx: &Transaction) -> Option<(BitcoinPublicKey, bool)> {
    let input = tx.input.first()?;
    if input.witness.is_empty() {
        match script_pushes(&input.script_sig)?.as_slice() {
            [_signature, key] => BitcoinPublicKey::from_slice(key).ok().map(|k| (k, false)),
            _ => None,
        }
    } else if input.witness.len() == 2 && input.script_sig.is_empty() {
        BitcoinPublicKey::from_slice(input.witness.last()?)
            .ok()
            .map(|k| (k, true))
    } else {
        None
    }
}

pub(crate) fn sender_refund_script(tx: &Transaction) -> Option<ScriptBuf> {
    match sender_public_key(tx)? {
        (key, false) => Some(ScriptBuf::new_p2pkh(&key.pubkey_hash())),
        (key, true) => Some(ScriptBuf::new_v0_p2wpkh(&key.wpubkey_hash()?)),
    }
}

fn record(outcome: RegistrationOutcome) -> RegistrationOutcome {
    let label: &'static str = (&outcome).into();
    BTC_TX_REGISTRATIONS.with_label_values(&[label]).inc();
    outcome
}

impl<'a, S, B> Bridge<'a, S, B>
where
    S: BridgeStorage + ?Sized,
    B: BtcBlockchain + ?Sized,
{
    pub fn register_btc_transaction(
        &mut self,
        ctx: &CallContext,
        raw_tx: &[u8],
        height: u32,
        pmt: &[u8],
    ) -> Result<RegistrationOutcome> {
        let tx: Transaction = deserialize(raw_tx)
            .map_err(|err| Error::ParsingError(format!("bitcoin transaction: {err}")))?;
        let txid = tx.txid();
        if let Some(processed_at) = self.storage.btc_tx_hash_processed_height(&txid)? {
            debug!("Transaction {txid} was already processed at block {processed_at}");
            return Ok(record(RegistrationOutcome::AlreadyProcessed));
        }
        validate_registration(
            self.btc_chain,
            &txid,
            height,
            pmt,
            self.constants.btc_confirmations,
        )?;

        let activations = self.activations(ctx);
        let outcome = if self.register_svp_spend(&tx)? {
            RegistrationOutcome::SvpSpendRegistered
        } else {
            match self.classify_transaction(&tx, activations)? {
                PegTxType::Pegin => self.register_pegin(ctx, &tx, activations)?,
                PegTxType::PegoutOrMigration => {
                    self.register_pegout(&tx)?;
                    RegistrationOutcome::PegoutOrMigration
                }
                PegTxType::Unknown => {
                    info!("Ignoring transaction {txid}, it does not interact with the bridge");
                    return Ok(record(RegistrationOutcome::Unknown));
                }
            }
        };

        self.storage
            .set_btc_tx_hash_processed_height(txid, ctx.block_number)?;
        Ok(record(outcome))
    }

    fn register_pegin(
        &mut self,
        ctx: &CallContext,
        tx: &Transaction,
        activations: ActivationsForBlock,
    ) -> Result<RegistrationOutcome> {
        let txid = tx.txid();
        let snapshot = self.federation_snapshot()?;
        let value = pegin_value(
            tx,
            &snapshot.classifier_context(activations, self.constants.minimum_pegin_value),
        );
        // a rejected pegin gives back every federation output, counted or not
        let inputs = value
            .outputs
            .iter()
            .chain(&value.below_minimum)
            .map(|output| {
                let federation = snapshot.federation(output.role).ok_or_else(|| {
                    Error::IllegalState(format!("no {:?} federation", output.role))
                })?;
                Ok((
                    output.role,
                    SpendableUtxo {
                        outpoint: OutPoint::new(txid, output.vout),
                        value: output.value,
                        script_pubkey: federation.script_pubkey().to_owned(),
                        redeem_script: federation.redeem_script().to_owned(),
                        format: federation.format(),
                    },
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let information = match parse_pegin_information(tx) {
            Ok(information) => information,
            Err(err) => {
                warn!("Rejecting pegin {txid}: {err}");
                return self.reject_pegin(
                    ctx,
                    tx,
                    inputs,
                    sender_refund_script(tx),
                    RejectedPeginReason::InvalidPeginInformation,
                );
            }
        };

        let locking_cap = self.locking_cap()?;
        if self.custodied_balance()? + value.total > locking_cap {
            warn!(
                "Rejecting pegin {txid} of {} sats, locking cap of {locking_cap} surpassed",
                value.total
            );
            let refund_script = information
                .refund_script
                .or_else(|| sender_refund_script(tx));
            return self.reject_pegin(
                ctx,
                tx,
                inputs,
                refund_script,
                RejectedPeginReason::LockingCapSurpassed,
            );
        }

        self.credit_sidechain(information.recipient, value.total)?;
        self.add_custodied(value.total)?;
        self.track_pegin_outputs(tx, &snapshot, activations)?;

        self.events.emit(BridgeEvent::PeginBtc {
            recipient: information.recipient,
            btc_tx_hash: txid,
            amount: value.total,
        });
        info!(
            "Credited {} sats to {:?} for pegin {txid}",
            value.total, information.recipient
        );
        Ok(RegistrationOutcome::PeginCredited {
            recipient: information.recipient,
            amount: value.total,
        })
    }

    fn track_pegin_outputs(
        &mut self,
        tx: &Transaction,
        snapshot: &FederationSnapshot,
        activations: ActivationsForBlock,
    ) -> Result<()> {
        self.add_federation_utxos(
            FederationRole::Active,
            Self::federation_outputs(tx, snapshot.active.script_pubkey()),
        )?;
        if let Some(retiring) = &snapshot.retiring {
            if activations.is_active(ConsensusRule::RetiringFederationPegins) {
                self.add_federation_utxos(
                    FederationRole::Retiring,
                    Self::federation_outputs(tx, retiring.script_pubkey()),
                )?;
            }
        }
        Ok(())
    }

    fn reject_pegin(
        &mut self,
        ctx: &CallContext,
        tx: &Transaction,
        inputs: Vec<(FederationRole, SpendableUtxo)>,
        refund_script: Option<ScriptBuf>,
        reason: RejectedPeginReason,
    ) -> Result<RegistrationOutcome> {
        let btc_tx_hash = tx.txid();
        let refunded = match refund_script {
            Some(refund_script) => {
                let spendable = inputs.iter().map(|(_, x)| x.clone()).collect::<Vec<_>>();
                self.queue_refund(ctx, &spendable, &refund_script, "pegin_refund")?
                    .is_some()
            }
            None => false,
        };

        if !refunded {
            warn!("Pegin {btc_tx_hash} cannot be refunded, value stays with the federation");
            for role in [FederationRole::Active, FederationRole::Retiring] {
                let utxos = inputs
                    .iter()
                    .filter(|(r, _)| *r == role)
                    .map(|(_, x)| FederationUtxo {
                        outpoint: x.outpoint,
                        value: x.value,
                        script_pubkey: x.script_pubkey.clone(),
                    })
                    .collect();
                self.add_federation_utxos(role, utxos)?;
            }
        }

        self.events
            .emit(BridgeEvent::RejectedPegin { btc_tx_hash, reason });
        Ok(RegistrationOutcome::PeginRejected { reason, refunded })
    }

    /// Sweeps `inputs` back to `destination`. `None` when the value cannot cover the fee.
    pub(crate) fn queue_refund(
        &mut self,
        ctx: &CallContext,
        inputs: &[SpendableUtxo],
        destination: &Script,
        kind: &str,
    ) -> Result<Option<Txid>> {
        match build_sweep(inputs, destination, self.fee_rate()?) {
            Ok(built) => self.enqueue_for_confirmations(ctx, &built, kind).map(Some),
            Err(err @ (Error::DustOutput(_) | Error::InsufficientFunds { .. })) => {
                warn!("Unable to build refund transaction: {err}");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn register_pegout(&mut self, tx: &Transaction) -> Result<()> {
        let snapshot = self.federation_snapshot()?;
        self.add_federation_utxos(
            FederationRole::Active,
            Self::federation_outputs(tx, snapshot.active.script_pubkey()),
        )?;
        if let Some(retiring) = &snapshot.retiring {
            self.add_federation_utxos(
                FederationRole::Retiring,
                Self::federation_outputs(tx, retiring.script_pubkey()),
            )?;
        }
        debug!("Registered outgoing transaction {}", tx.txid());
        self.register_svp_fund(tx)
    }
}
