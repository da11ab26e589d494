pub use bdk::FeeRate;

use crate::federation::FederationFormat;
use crate::scripts::{redeem_script_of, InputTemplate};
use crate::{Error, Result};
use bdk::database::MemoryDatabase;
use bdk::wallet::coin_selection::{CoinSelectionAlgorithm, Excess, LargestFirstCoinSelection};
use bdk::{KeychainKind, LocalUtxo, WeightedUtxo};
use bitcoin::absolute::LockTime;
use bitcoin::{OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut};

const TRANSACTION_VERSION: i32 = 2;
const LOCK_TIME: LockTime = LockTime::ZERO;

/// Federation output together with the script needed to spend it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpendableUtxo {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script_pubkey: ScriptBuf,
    pub redeem_script: ScriptBuf,
    pub format: FederationFormat,
}

impl SpendableUtxo {
    fn unsigned_input(&self) -> Result<TxIn> {
        let mut txin = TxIn {
            previous_output: self.outpoint,
            sequence: Sequence::MAX,
            ..Default::default()
        };
        InputTemplate::unsigned(self.redeem_script.clone(), self.format)?
            .apply_unsigned(&mut txin)?;
        Ok(txin)
    }

    fn satisfaction_weight(&self) -> Result<usize> {
        let signed = InputTemplate::unsigned(self.redeem_script.clone(), self.format)?
            .dummy_signed_input()?;
        Ok(signed.segwit_weight() - TxIn::default().segwit_weight())
    }
}

/// Unsigned transaction spending federation funds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuiltTransaction {
    pub tx: Transaction,
    /// Value of each spent outpoint, in input order
    pub outpoint_values: Vec<u64>,
    pub fee: u64,
}

impl BuiltTransaction {
    pub fn spent_outpoints(&self) -> Vec<OutPoint> {
        self.tx.input.iter().map(|txin| txin.previous_output).collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeePolicy {
    /// Fees are split over the payment outputs
    DeductFromOutputs,
    /// Fees come out of the change
    PaidByChange,
}

pub fn fee_rate_from_fee_per_kb(fee_per_kb: u64) -> FeeRate {
    FeeRate::from_sat_per_vb(fee_per_kb as f32 / 1000.0)
}

/// Fee of `tx` once every federation input carries its signatures.
pub fn estimate_fee(tx: &Transaction, fee_rate: FeeRate) -> Result<u64> {
    let mut signed = tx.clone();
    for txin in signed.input.iter_mut() {
        if let Some((redeem_script, format)) = redeem_script_of(txin) {
            let dummy = InputTemplate::unsigned(redeem_script, format)?.dummy_signed_input()?;
            txin.script_sig = dummy.script_sig;
            txin.witness = dummy.witness;
        }
    }
    Ok(fee_rate.fee_wu(signed.weight()))
}

fn check_dust(output: &TxOut) -> Result<()> {
    if output.value < output.script_pubkey.dust_value().to_sat() {
        return Err(Error::DustOutput(output.value));
    }
    Ok(())
}

/// Pays `outputs` from `utxos`, sending any change back to `change_script`.
pub fn build_payment(
    utxos: &[SpendableUtxo],
    outputs: Vec<TxOut>,
    change_script: &Script,
    fee_rate: FeeRate,
    policy: FeePolicy,
) -> Result<BuiltTransaction> {
    if outputs.is_empty() {
        return Err(Error::InvalidAmount("payment without outputs".into()));
    }
    let num_payments = outputs.len() as u64;
    let total_out_value: u64 = outputs.iter().map(|x| x.value).sum();

    let weighted = utxos
        .iter()
        .map(|utxo| {
            Ok(WeightedUtxo {
                satisfaction_weight: utxo.satisfaction_weight()?,
                utxo: bdk::Utxo::Local(LocalUtxo {
                    outpoint: utxo.outpoint,
                    txout: TxOut {
                        value: utxo.value,
                        script_pubkey: utxo.script_pubkey.clone(),
                    },
                    keychain: KeychainKind::External,
                    is_spent: false,
                }),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut tx = Transaction {
        version: TRANSACTION_VERSION,
        lock_time: LOCK_TIME,
        input: vec![],
        output: outputs,
    };

    let (selection_fee_rate, target) = match policy {
        // selection ignores fees, they are taken from the outputs afterwards
        FeePolicy::DeductFromOutputs => (FeeRate::from_sat_per_vb(0.0), total_out_value),
        FeePolicy::PaidByChange => (
            fee_rate,
            total_out_value + fee_rate.fee_wu(tx.weight()),
        ),
    };

    let selected = LargestFirstCoinSelection::default()
        .coin_select(
            &MemoryDatabase::new(),
            vec![],
            weighted,
            selection_fee_rate,
            target,
            change_script,
        )
        .map_err(|e| match e {
            bdk::Error::InsufficientFunds { needed, available } => {
                Error::InsufficientFunds { needed, available }
            }
            other => Error::CoinSelection(other.to_string()),
        })?;

    let mut outpoint_values = vec![];
    for utxo in selected.selected.iter() {
        let spendable = utxos
            .iter()
            .find(|x| x.outpoint == utxo.outpoint())
            .ok_or_else(|| Error::CoinSelection("selected unknown utxo".into()))?;
        tx.input.push(spendable.unsigned_input()?);
        outpoint_values.push(spendable.value);
    }

    let has_change = matches!(selected.excess, Excess::Change { .. });
    if has_change {
        tx.output.push(TxOut {
            script_pubkey: change_script.to_owned(),
            value: 0,
        });
    }

    let selected_value: u64 = outpoint_values.iter().sum();
    let fee = estimate_fee(&tx, fee_rate)?;
    let change_value = match policy {
        FeePolicy::DeductFromOutputs => selected_value - total_out_value,
        FeePolicy::PaidByChange => selected_value
            .checked_sub(total_out_value + fee)
            .ok_or(Error::InsufficientFunds {
                needed: total_out_value + fee,
                available: selected_value,
            })?,
    };
    if has_change {
        if let Some(change) = tx.output.last_mut() {
            change.value = change_value;
            check_dust(change)?;
        }
    }

    if policy == FeePolicy::DeductFromOutputs {
        // note: adding `num_payments - 1` to get a rounded up division
        let fee_per_output = (fee + num_payments - 1) / num_payments;
        for output in tx.output.iter_mut().take(num_payments as usize) {
            output.value = output
                .value
                .checked_sub(fee_per_output)
                .ok_or(Error::DustOutput(0))?;
            check_dust(output)?;
        }
    }

    Ok(BuiltTransaction {
        tx,
        outpoint_values,
        fee,
    })
}

/// Spends every input to a single output, net of fees.
pub fn build_sweep(
    inputs: &[SpendableUtxo],
    destination: &Script,
    fee_rate: FeeRate,
) -> Result<BuiltTransaction> {
    let available: u64 = inputs.iter().map(|x| x.value).sum();
    if available == 0 {
        return Err(Error::InsufficientFunds {
            needed: 1,
            available,
        });
    }

    let mut tx = Transaction {
        version: TRANSACTION_VERSION,
        lock_time: LOCK_TIME,
        input: inputs
            .iter()
            .map(SpendableUtxo::unsigned_input)
            .collect::<Result<Vec<_>>>()?,
        output: vec![TxOut {
            script_pubkey: destination.to_owned(),
            value: available,
        }],
    };

    let fee = estimate_fee(&tx, fee_rate)?;
    tx.output[0].value = available
        .checked_sub(fee)
        .ok_or(Error::DustOutput(0))?;
    check_dust(&tx.output[0])?;

    Ok(BuiltTransaction {
        tx,
        outpoint_values: inputs.iter().map(|x| x.value).collect(),
        fee,
    })
}
