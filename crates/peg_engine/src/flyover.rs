use crate::activations::ConsensusRule;
use crate::bridge::{Bridge, CallContext};
use crate::chain::{validate_registration, BtcBlockchain};
use crate::federation::FederationRole;
use crate::metrics::FLYOVER_REGISTRATIONS;
use crate::storage::{BridgeStorage, FederationUtxo, FlyoverFederationInformation};
use crate::wallet::SpendableUtxo;
use crate::{sats_to_wei, wei_to_sats, Error, Result};
use bitcoin::address::Payload;
use bitcoin::consensus::encode::deserialize;
use bitcoin::hashes::Hash;
use bitcoin::{Address, Network, OutPoint, Transaction};
use ethers_core::types::{H160, H256, I256};
use ethers_core::utils::keccak256;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use strum::IntoStaticStr;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[repr(i64)]
pub enum FlyoverTxResponseCode {
    RefundedUser = -100,
    RefundedLp = -200,
    NotContract = -300,
    InvalidSender = -301,
    AlreadyProcessed = -302,
    ValidationsError = -303,
    UnprocessableValueZero = -304,
    UnprocessableUtxoBelowMinimum = -305,
    GenericError = -900,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlyoverOutcome {
    Credited { amount: u64 },
    Code(FlyoverTxResponseCode),
}

impl FlyoverOutcome {
    /// Credited amounts in wei, response codes as negative values.
    pub fn to_signed_value(&self) -> I256 {
        match self {
            Self::Credited { amount } => I256::from_raw(sats_to_wei(*amount)),
            Self::Code(code) => I256::from(*code as i64),
        }
    }

    pub fn from_signed_value(value: I256) -> Option<Self> {
        if value.is_positive() {
            Some(Self::Credited {
                amount: wei_to_sats(value.into_raw()),
            })
        } else {
            FlyoverTxResponseCode::from_i64(value.as_i64()).map(Self::Code)
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Credited { .. } => "credited",
            Self::Code(code) => code.into(),
        }
    }
}

/// Arguments of a flyover deposit registration.
#[derive(Debug, Clone)]
pub struct FlyoverDeposit {
    pub raw_tx: Vec<u8>,
    pub height: u32,
    pub pmt: Vec<u8>,
    pub derivation_arguments_hash: H256,
    pub user_refund_address: Address,
    pub lp_address: Address,
    /// Contract allowed to register this deposit, and credited on success
    pub caller_address: H160,
    /// Refund the liquidity provider instead of the user
    pub should_transfer_to_contract: bool,
}

/// Version byte and hash of a legacy base58 address.
fn versioned_hash(address: &Address) -> Result<Vec<u8>> {
    let mainnet = address.network == Network::Bitcoin;
    let (version, hash) = match &address.payload {
        Payload::PubkeyHash(hash) => (if mainnet { 0x00 } else { 0x6f }, hash.to_byte_array()),
        Payload::ScriptHash(hash) => (if mainnet { 0x05 } else { 0xc4 }, hash.to_byte_array()),
        _ => {
            return Err(Error::InvalidScript(format!(
                "{address} is not a p2pkh or p2sh address"
            )))
        }
    };
    Ok(std::iter::once(version).chain(hash).collect())
}

pub fn flyover_derivation_hash(
    derivation_arguments_hash: &H256,
    user_refund_address: &Address,
    lp_address: &Address,
    caller_address: &H160,
) -> Result<H256> {
    let mut preimage = derivation_arguments_hash.as_bytes().to_vec();
    preimage.extend(versioned_hash(user_refund_address)?);
    preimage.extend(versioned_hash(lp_address)?);
    preimage.extend_from_slice(caller_address.as_bytes());
    Ok(H256(keccak256(preimage)))
}

impl<'a, S, B> Bridge<'a, S, B>
where
    S: BridgeStorage + ?Sized,
    B: BtcBlockchain + ?Sized,
{
    pub fn register_flyover_deposit(
        &mut self,
        ctx: &CallContext,
        deposit: &FlyoverDeposit,
    ) -> Result<FlyoverOutcome> {
        let outcome = self.process_flyover_deposit(ctx, deposit)?;
        FLYOVER_REGISTRATIONS
            .with_label_values(&[outcome.label()])
            .inc();
        Ok(outcome)
    }

    fn process_flyover_deposit(
        &mut self,
        ctx: &CallContext,
        deposit: &FlyoverDeposit,
    ) -> Result<FlyoverOutcome> {
        use FlyoverTxResponseCode::*;

        if !ctx.sender_is_contract {
            warn!("Flyover registration from {:?} is not a contract call", ctx.sender);
            return Ok(FlyoverOutcome::Code(NotContract));
        }
        if ctx.sender != deposit.caller_address {
            warn!(
                "Flyover registration for {:?} sent by {:?}",
                deposit.caller_address, ctx.sender
            );
            return Ok(FlyoverOutcome::Code(InvalidSender));
        }

        let tx: Transaction = match deserialize(&deposit.raw_tx) {
            Ok(tx) => tx,
            Err(err) => {
                warn!("Unable to decode flyover transaction: {err}");
                return Ok(FlyoverOutcome::Code(ValidationsError));
            }
        };
        let txid = tx.txid();
        let derivation_hash = match flyover_derivation_hash(
            &deposit.derivation_arguments_hash,
            &deposit.user_refund_address,
            &deposit.lp_address,
            &deposit.caller_address,
        ) {
            Ok(hash) => hash,
            Err(err) => {
                warn!("Unable to compute flyover derivation hash: {err}");
                return Ok(FlyoverOutcome::Code(GenericError));
            }
        };
        if self
            .storage
            .is_flyover_derivation_hash_used(&txid, &derivation_hash)?
        {
            debug!("Flyover deposit {txid} with derivation hash {derivation_hash:?} already processed");
            return Ok(FlyoverOutcome::Code(AlreadyProcessed));
        }
        if let Err(err) = validate_registration(
            self.btc_chain,
            &txid,
            deposit.height,
            &deposit.pmt,
            self.constants.btc_confirmations,
        ) {
            warn!("Flyover deposit {txid} failed validations: {err}");
            return Ok(FlyoverOutcome::Code(ValidationsError));
        }

        let snapshot = self.federation_snapshot()?;
        let mut federations = vec![(FederationRole::Active, &snapshot.active)];
        if let Some(retiring) = &snapshot.retiring {
            if self
                .activations(ctx)
                .is_active(ConsensusRule::FlyoverRetiringFederation)
            {
                federations.push((FederationRole::Retiring, retiring));
            }
        }

        let minimum = self.constants.minimum_pegin_value;
        let mut deposits = vec![];
        let mut below_minimum = vec![];
        for (role, federation) in federations {
            let script_pubkey = federation.flyover_script_pubkey(&derivation_hash);
            for (vout, output) in tx.output.iter().enumerate() {
                if output.script_pubkey != script_pubkey {
                    continue;
                }
                let utxo = SpendableUtxo {
                    outpoint: OutPoint::new(txid, vout as u32),
                    value: output.value,
                    script_pubkey: script_pubkey.clone(),
                    redeem_script: federation.flyover_redeem_script(&derivation_hash),
                    format: federation.format(),
                };
                if output.value < minimum {
                    below_minimum.push((role, utxo));
                } else {
                    deposits.push((role, utxo));
                }
            }
        }

        let total: u64 = deposits.iter().map(|(_, utxo)| utxo.value).sum();
        if total == 0 {
            let code = if !below_minimum.is_empty() {
                UnprocessableUtxoBelowMinimum
            } else {
                UnprocessableValueZero
            };
            info!("Flyover deposit {txid} has no value to process ({code:?})");
            return Ok(FlyoverOutcome::Code(code));
        }

        // small outputs travel with the deposit without counting towards it
        deposits.extend(below_minimum);

        let locking_cap = self.locking_cap()?;
        if self.custodied_balance()? + total > locking_cap {
            let (refund_address, code) = if deposit.should_transfer_to_contract {
                (&deposit.lp_address, RefundedLp)
            } else {
                (&deposit.user_refund_address, RefundedUser)
            };
            let inputs = deposits.into_iter().map(|(_, utxo)| utxo).collect::<Vec<_>>();
            if self
                .queue_refund(ctx, &inputs, &refund_address.script_pubkey(), "flyover_refund")?
                .is_none()
            {
                return Ok(FlyoverOutcome::Code(GenericError));
            }
            self.storage
                .mark_flyover_derivation_hash_used(txid, derivation_hash)?;
            info!("Flyover deposit {txid} of {total} sats surpasses the locking cap, refunding {refund_address}");
            return Ok(FlyoverOutcome::Code(code));
        }

        self.credit_sidechain(deposit.caller_address, total)?;
        self.add_custodied(total)?;
        self.storage
            .mark_flyover_derivation_hash_used(txid, derivation_hash)?;
        for role in [FederationRole::Active, FederationRole::Retiring] {
            let Some(federation) = snapshot.federation(role) else {
                continue;
            };
            let utxos = deposits
                .iter()
                .filter(|(r, _)| *r == role)
                .map(|(_, utxo)| FederationUtxo {
                    outpoint: utxo.outpoint,
                    value: utxo.value,
                    script_pubkey: utxo.script_pubkey.clone(),
                })
                .collect::<Vec<_>>();
            if utxos.is_empty() {
                continue;
            }
            self.storage
                .set_flyover_federation_information(FlyoverFederationInformation {
                    derivation_hash,
                    federation_redeem_script: federation.redeem_script().to_owned(),
                    flyover_script_pubkey: federation.flyover_script_pubkey(&derivation_hash),
                })?;
            self.add_federation_utxos(role, utxos)?;
        }

        info!(
            "Credited {total} sats to {:?} for flyover deposit {txid}",
            deposit.caller_address
        );
        Ok(FlyoverOutcome::Credited { amount: total })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::MemoryBtcBlockchain;
    use crate::classifier::tests::tx_paying;
    use crate::constants::REGTEST;
    use crate::federation::tests::secret_keys;
    use crate::pegin::tests::mine;
    use crate::storage::MemoryBridgeStorage;
    use crate::BridgeConstants;
    use bitcoin::consensus::encode::serialize;
    use bitcoin::secp256k1::Secp256k1;
    use bitcoin::PublicKey as BitcoinPublicKey;

    pub const LP_CONTRACT: H160 = H160([0x1c; 20]);

    pub fn address(key_index: usize) -> Address {
        let secp = Secp256k1::new();
        let key = BitcoinPublicKey::new(secret_keys(4)[key_index].public_key(&secp));
        Address::p2pkh(&key, Network::Regtest)
    }

    pub fn contract_ctx(block_number: u64) -> CallContext {
        CallContext::from_contract(LP_CONTRACT, H256::from_low_u64_be(block_number), block_number)
    }

    /// Deposit of `values` to the flyover address of the genesis federation, mined and confirmed.
    pub fn deposit(
        chain: &mut MemoryBtcBlockchain,
        constants: &BridgeConstants,
        values: &[u64],
        should_transfer_to_contract: bool,
    ) -> FlyoverDeposit {
        let derivation_arguments_hash = H256::repeat_byte(0xd1);
        let (user_refund_address, lp_address) = (address(0), address(1));
        let derivation_hash = flyover_derivation_hash(
            &derivation_arguments_hash,
            &user_refund_address,
            &lp_address,
            &LP_CONTRACT,
        )
        .unwrap();
        let script = constants
            .genesis_federation()
            .unwrap()
            .flyover_script_pubkey(&derivation_hash);
        let outputs = values
            .iter()
            .map(|value| (script.as_script(), *value))
            .collect::<Vec<_>>();
        let tx = tx_paying(&outputs);
        let (height, pmt) = mine(chain, constants, &tx);
        FlyoverDeposit {
            raw_tx: serialize(&tx),
            height,
            pmt,
            derivation_arguments_hash,
            user_refund_address,
            lp_address,
            caller_address: LP_CONTRACT,
            should_transfer_to_contract,
        }
    }

    #[test]
    fn test_derivation_hash() {
        let args = H256::repeat_byte(1);
        let hash = flyover_derivation_hash(&args, &address(0), &address(1), &LP_CONTRACT).unwrap();
        assert_eq!(
            hash,
            flyover_derivation_hash(&args, &address(0), &address(1), &LP_CONTRACT).unwrap()
        );
        assert_ne!(
            hash,
            flyover_derivation_hash(&args, &address(1), &address(0), &LP_CONTRACT).unwrap()
        );
        assert_ne!(
            hash,
            flyover_derivation_hash(&args, &address(0), &address(1), &H160::zero()).unwrap()
        );

        let secp = Secp256k1::new();
        let key = BitcoinPublicKey::new(secret_keys(1)[0].public_key(&secp));
        let segwit = Address::p2wpkh(&key, Network::Regtest).unwrap();
        assert!(flyover_derivation_hash(&args, &segwit, &address(1), &LP_CONTRACT).is_err());
    }

    #[test]
    fn test_signed_values() {
        let credited = FlyoverOutcome::Credited { amount: 1_500 };
        assert_eq!(credited.to_signed_value(), I256::from_raw(sats_to_wei(1_500)));
        assert_eq!(
            FlyoverOutcome::from_signed_value(credited.to_signed_value()),
            Some(credited)
        );

        let refunded = FlyoverOutcome::Code(FlyoverTxResponseCode::RefundedLp);
        assert_eq!(refunded.to_signed_value(), I256::from(-200i64));
        assert_eq!(
            FlyoverOutcome::from_signed_value(I256::from(-305i64)),
            Some(FlyoverOutcome::Code(
                FlyoverTxResponseCode::UnprocessableUtxoBelowMinimum
            ))
        );
        assert_eq!(FlyoverOutcome::from_signed_value(I256::from(-1i64)), None);
    }

    #[test]
    fn test_credit_deposit() {
        let constants = REGTEST.clone();
        let mut chain = MemoryBtcBlockchain::new();
        let deposit = deposit(&mut chain, &constants, &[700_000, 300_000, 600_000], false);
        let mut storage = MemoryBridgeStorage::new();
        let mut bridge = Bridge::new(&constants, &mut storage, &chain);

        let outcome = bridge.register_flyover_deposit(&contract_ctx(3), &deposit).unwrap();
        // the output below the minimum is not credited
        assert_eq!(outcome, FlyoverOutcome::Credited { amount: 1_300_000 });
        assert_eq!(bridge.custodied_balance().unwrap(), 1_300_000);
        assert_eq!(
            bridge.storage().sidechain_balance(&LP_CONTRACT).unwrap(),
            sats_to_wei(1_300_000)
        );

        // but the federation still tracks it
        let utxos = bridge.storage().active_federation_utxos().unwrap();
        assert_eq!(utxos.len(), 3);
        assert_eq!(utxos.iter().map(|utxo| utxo.value).sum::<u64>(), 1_600_000);
        let info = bridge
            .storage()
            .flyover_federation_information(&utxos[0].script_pubkey)
            .unwrap()
            .unwrap();
        let genesis = constants.genesis_federation().unwrap();
        assert_eq!(info.federation_redeem_script.as_script(), genesis.redeem_script());
        // tracked utxos can be spent by the federation
        assert_eq!(bridge.spendable_utxos(&genesis, &utxos).unwrap().len(), 3);

        let replay = bridge.register_flyover_deposit(&contract_ctx(4), &deposit).unwrap();
        assert_eq!(replay, FlyoverOutcome::Code(FlyoverTxResponseCode::AlreadyProcessed));
        assert_eq!(bridge.custodied_balance().unwrap(), 1_300_000);
    }

    #[test]
    fn test_preconditions() {
        use FlyoverTxResponseCode::*;

        let constants = REGTEST.clone();
        let mut chain = MemoryBtcBlockchain::new();
        let deposit = deposit(&mut chain, &constants, &[700_000], false);
        let mut storage = MemoryBridgeStorage::new();
        let mut bridge = Bridge::new(&constants, &mut storage, &chain);

        let direct = CallContext::direct(LP_CONTRACT, H256::zero(), 3);
        assert_eq!(
            bridge.register_flyover_deposit(&direct, &deposit).unwrap(),
            FlyoverOutcome::Code(NotContract)
        );
        let other = CallContext::from_contract(H160::repeat_byte(2), H256::zero(), 3);
        assert_eq!(
            bridge.register_flyover_deposit(&other, &deposit).unwrap(),
            FlyoverOutcome::Code(InvalidSender)
        );

        let bad_proof = FlyoverDeposit {
            height: deposit.height + 1,
            ..deposit.clone()
        };
        assert_eq!(
            bridge.register_flyover_deposit(&contract_ctx(3), &bad_proof).unwrap(),
            FlyoverOutcome::Code(ValidationsError)
        );
        let garbage = FlyoverDeposit {
            raw_tx: vec![1, 2, 3],
            ..deposit.clone()
        };
        assert_eq!(
            bridge.register_flyover_deposit(&contract_ctx(3), &garbage).unwrap(),
            FlyoverOutcome::Code(ValidationsError)
        );
        assert_eq!(bridge.custodied_balance().unwrap(), 0);
    }

    #[test]
    fn test_unprocessable_values() {
        let constants = REGTEST.clone();
        let mut chain = MemoryBtcBlockchain::new();
        let small = deposit(&mut chain, &constants, &[1_000], false);
        let empty = deposit(&mut chain, &constants, &[], false);
        let mut storage = MemoryBridgeStorage::new();
        let mut bridge = Bridge::new(&constants, &mut storage, &chain);

        assert_eq!(
            bridge.register_flyover_deposit(&contract_ctx(3), &small).unwrap(),
            FlyoverOutcome::Code(FlyoverTxResponseCode::UnprocessableUtxoBelowMinimum)
        );
        assert_eq!(
            bridge.register_flyover_deposit(&contract_ctx(3), &empty).unwrap(),
            FlyoverOutcome::Code(FlyoverTxResponseCode::UnprocessableValueZero)
        );
    }

    #[test]
    fn test_locking_cap_refunds_liquidity_provider() {
        let constants = REGTEST.clone();
        let mut chain = MemoryBtcBlockchain::new();
        let deposit = deposit(&mut chain, &constants, &[constants.minimum_pegin_value], true);
        let mut storage = MemoryBridgeStorage::new();
        storage
            .set_locking_cap(constants.minimum_pegin_value - 1)
            .unwrap();
        let mut bridge = Bridge::new(&constants, &mut storage, &chain);

        assert_eq!(
            bridge.register_flyover_deposit(&contract_ctx(3), &deposit).unwrap(),
            FlyoverOutcome::Code(FlyoverTxResponseCode::RefundedLp)
        );
        assert_eq!(bridge.custodied_balance().unwrap(), 0);
        let waiting = bridge.storage().pegouts_waiting_for_confirmations().unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(
            waiting[0].btc_tx.output[0].script_pubkey,
            deposit.lp_address.script_pubkey()
        );

        assert_eq!(
            bridge.register_flyover_deposit(&contract_ctx(4), &deposit).unwrap(),
            FlyoverOutcome::Code(FlyoverTxResponseCode::AlreadyProcessed)
        );
        assert_eq!(
            bridge.storage().pegouts_waiting_for_confirmations().unwrap().len(),
            1
        );
    }
}
