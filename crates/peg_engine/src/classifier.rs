use crate::activations::{ActivationsForBlock, ConsensusRule};
use crate::federation::{Federation, FederationRole};
use crate::scripts::{first_input_sighash, redeem_script_of, standard_redeem_script};
use crate::storage::BridgeStorage;
use crate::Result;
use bitcoin::{Script, Transaction};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PegTxType {
    Pegin,
    PegoutOrMigration,
    Unknown,
}

pub struct ClassifierContext<'a> {
    pub active_federation: &'a Federation,
    pub retiring_federation: Option<&'a Federation>,
    pub last_retired_federation_script: Option<&'a Script>,
    pub activations: ActivationsForBlock,
    pub minimum_pegin_value: u64,
}

/// Output of a transaction paying one of the federations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FederationOutput {
    pub vout: u32,
    pub value: u64,
    pub role: FederationRole,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeginValue {
    pub total: u64,
    /// Outputs that count towards `total`.
    pub outputs: Vec<FederationOutput>,
    /// Outputs to a federation that are too small to count.
    pub below_minimum: Vec<FederationOutput>,
}

impl<'a> ClassifierContext<'a> {
    fn retiring_receives_pegins(&self) -> Option<&'a Federation> {
        self.retiring_federation
            .filter(|_| self.activations.is_active(ConsensusRule::RetiringFederationPegins))
    }
}

/// Value a transaction sends to the federations.
///
/// Before per-output minimums are enforced every federation output counts; afterwards each
/// output has to reach the minimum on its own.
pub fn pegin_value(tx: &Transaction, ctx: &ClassifierContext<'_>) -> PeginValue {
    let per_output_minimum = ctx.activations.is_active(ConsensusRule::PeginPerOutputMinimum);
    let retiring = ctx.retiring_receives_pegins();

    let mut value = PeginValue::default();
    for (vout, output) in tx.output.iter().enumerate() {
        let role = if output.script_pubkey.as_script() == ctx.active_federation.script_pubkey() {
            FederationRole::Active
        } else if retiring.map_or(false, |f| output.script_pubkey.as_script() == f.script_pubkey()) {
            FederationRole::Retiring
        } else {
            continue;
        };

        let federation_output = FederationOutput {
            vout: vout as u32,
            value: output.value,
            role,
        };
        if per_output_minimum && output.value < ctx.minimum_pegin_value {
            value.below_minimum.push(federation_output);
            continue;
        }
        value.total = value.total.saturating_add(output.value);
        value.outputs.push(federation_output);
    }
    value
}

fn spends_from_known_federation(tx: &Transaction, ctx: &ClassifierContext<'_>) -> bool {
    let Some((redeem_script, format)) = tx.input.first().and_then(redeem_script_of) else {
        return false;
    };
    let script_pubkey = format.script_pubkey(standard_redeem_script(&redeem_script));
    let script_pubkey = script_pubkey.as_script();

    script_pubkey == ctx.active_federation.script_pubkey()
        || ctx
            .retiring_federation
            .map_or(false, |f| script_pubkey == f.script_pubkey())
        || ctx
            .last_retired_federation_script
            .map_or(false, |s| script_pubkey == s)
}

pub fn classify<S: BridgeStorage + ?Sized>(
    tx: &Transaction,
    ctx: &ClassifierContext<'_>,
    storage: &S,
) -> Result<PegTxType> {
    if ctx.activations.is_active(ConsensusRule::PegoutTxIndex) {
        if let Some(sighash) = first_input_sighash(tx) {
            if storage.has_pegout_tx_sig_hash(&sighash)? {
                trace!("Transaction {} found in the pegout index", tx.txid());
                return Ok(PegTxType::PegoutOrMigration);
            }
        }
    }

    if !ctx
        .activations
        .is_active(ConsensusRule::PegoutTxIndexAuthoritative)
        && spends_from_known_federation(tx, ctx)
    {
        return Ok(PegTxType::PegoutOrMigration);
    }

    let value = pegin_value(tx, ctx);
    if value.total > 0 && value.total >= ctx.minimum_pegin_value {
        return Ok(PegTxType::Pegin);
    }

    Ok(PegTxType::Unknown)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::activations::ActivationConfig;
    use crate::federation::tests::members;
    use crate::federation::FederationFormat;
    use crate::scripts::InputTemplate;
    use crate::storage::MemoryBridgeStorage;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::{Network, OutPoint, ScriptBuf, TxIn, TxOut, Txid, WPubkeyHash};

    const MIN: u64 = 500_000;

    pub fn user_script() -> ScriptBuf {
        ScriptBuf::new_v0_p2wpkh(&WPubkeyHash::all_zeros())
    }

    pub fn tx_paying(outputs: &[(&Script, u64)]) -> Transaction {
        Transaction {
            version: 2,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::all_zeros(), 0),
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

    fn federations() -> (Federation, Federation) {
        let active = Federation::new(members(5), 10, FederationFormat::P2sh, Network::Regtest).unwrap();
        let retiring = Federation::new(members(3), 0, FederationFormat::P2sh, Network::Regtest).unwrap();
        (active, retiring)
    }

    fn context<'a>(
        active: &'a Federation,
        retiring: Option<&'a Federation>,
        activations: ActivationConfig,
    ) -> ClassifierContext<'a> {
        ClassifierContext {
            active_federation: active,
            retiring_federation: retiring,
            last_retired_federation_script: None,
            activations: activations.for_block(100),
            minimum_pegin_value: MIN,
        }
    }

    #[test]
    fn test_pegin_value_per_epoch() {
        let (active, _) = federations();
        let legacy = context(&active, None, ActivationConfig::default());
        let current = context(
            &active,
            None,
            ActivationConfig::new([(ConsensusRule::PeginPerOutputMinimum, 0)]),
        );
        let storage = MemoryBridgeStorage::new();
        let fed = active.script_pubkey();

        // one big and one small output
        let tx = tx_paying(&[(fed, MIN), (fed, MIN / 2)]);
        assert_eq!(pegin_value(&tx, &legacy).total, MIN + MIN / 2);
        let value = pegin_value(&tx, &current);
        assert_eq!(value.total, MIN);
        assert_eq!(value.below_minimum.len(), 1);
        assert_eq!(classify(&tx, &current, &storage).unwrap(), PegTxType::Pegin);

        // two small outputs only add up under the legacy rule
        let tx = tx_paying(&[(fed, MIN / 2), (fed, MIN / 2)]);
        assert_eq!(classify(&tx, &legacy, &storage).unwrap(), PegTxType::Pegin);
        assert_eq!(classify(&tx, &current, &storage).unwrap(), PegTxType::Unknown);
        assert_eq!(pegin_value(&tx, &current).total, 0);
    }

    #[test]
    fn test_pegins_to_retiring_federation() {
        let (active, retiring) = federations();
        let tx = tx_paying(&[(retiring.script_pubkey(), MIN), (user_script().as_script(), MIN)]);
        let storage = MemoryBridgeStorage::new();

        let without = context(&active, Some(&retiring), ActivationConfig::default());
        assert_eq!(classify(&tx, &without, &storage).unwrap(), PegTxType::Unknown);

        let with = context(
            &active,
            Some(&retiring),
            ActivationConfig::new([(ConsensusRule::RetiringFederationPegins, 0)]),
        );
        assert_eq!(classify(&tx, &with, &storage).unwrap(), PegTxType::Pegin);
        assert_eq!(
            pegin_value(&tx, &with).outputs,
            vec![FederationOutput {
                vout: 0,
                value: MIN,
                role: FederationRole::Retiring
            }]
        );
    }

    fn spend_from(federation: &Federation, to: &Script) -> Transaction {
        let mut tx = tx_paying(&[(to, MIN * 2)]);
        InputTemplate::unsigned(federation.redeem_script().to_owned(), federation.format())
            .unwrap()
            .apply_unsigned(&mut tx.input[0])
            .unwrap();
        tx
    }

    #[test]
    fn test_pegout_detection() {
        let (active, retiring) = federations();
        let tx = spend_from(&retiring, active.script_pubkey());
        let mut storage = MemoryBridgeStorage::new();

        // the legacy fallback recognizes the migration by its input script
        let legacy = context(&active, Some(&retiring), ActivationConfig::default());
        assert_eq!(
            classify(&tx, &legacy, &storage).unwrap(),
            PegTxType::PegoutOrMigration
        );

        // with the authoritative index only indexed transactions are pegouts
        let authoritative = ActivationConfig::new([
            (ConsensusRule::PegoutTxIndex, 0),
            (ConsensusRule::PegoutTxIndexAuthoritative, 0),
        ]);
        let ctx = context(&active, Some(&retiring), authoritative);
        assert_eq!(classify(&tx, &ctx, &storage).unwrap(), PegTxType::Pegin);

        storage
            .set_pegout_tx_sig_hash(first_input_sighash(&tx).unwrap())
            .unwrap();
        assert_eq!(
            classify(&tx, &ctx, &storage).unwrap(),
            PegTxType::PegoutOrMigration
        );
    }

    #[test]
    fn test_last_retired_federation() {
        let (active, retiring) = federations();
        let tx = spend_from(&retiring, &user_script());
        let storage = MemoryBridgeStorage::new();

        let mut ctx = context(&active, None, ActivationConfig::default());
        assert_eq!(classify(&tx, &ctx, &storage).unwrap(), PegTxType::Unknown);

        ctx.last_retired_federation_script = Some(retiring.script_pubkey());
        assert_eq!(
            classify(&tx, &ctx, &storage).unwrap(),
            PegTxType::PegoutOrMigration
        );
    }
}
