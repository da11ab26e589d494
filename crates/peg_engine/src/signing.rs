use crate::activations::ConsensusRule;
use crate::bridge::{Bridge, CallContext};
use crate::chain::BtcBlockchain;
use crate::events::BridgeEvent;
use crate::federation::{Federation, FederationFormat};
use crate::metrics::{RELEASES_FINALIZED, RELEASE_SIGNATURES};
use crate::scripts::{first_input_sighash, redeem_script_of, unsigned_tx_hash, InputTemplate};
use crate::storage::{BridgeStorage, PendingRelease};
use crate::{Error, Result};
use bitcoin::consensus::encode::serialize;
use bitcoin::ecdsa::Signature as BitcoinSignature;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa::Signature, All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{PublicKey as BitcoinPublicKey, Transaction};
use ethers_core::types::H256;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddSignatureOutcome {
    /// One signature per input is required
    InvalidSignatureCount { expected: usize, got: usize },
    InvalidSignature { input: usize },
    AlreadySigned,
    Accepted,
    Finalized { signed_tx: Transaction },
}

/// Messages each federation member signs, one per input.
pub fn input_sighashes(tx: &Transaction, outpoint_values: &[u64]) -> Result<Vec<Message>> {
    let mut sighash_cache = SighashCache::new(tx);
    tx.input
        .iter()
        .enumerate()
        .map(|(idx, txin)| {
            let (redeem_script, format) = redeem_script_of(txin).ok_or_else(|| {
                Error::InvalidScript(format!("input {idx} does not spend a federation output"))
            })?;
            let sighash = match format {
                FederationFormat::P2sh => sighash_cache
                    .legacy_signature_hash(idx, &redeem_script, EcdsaSighashType::All.to_u32())?
                    .to_byte_array(),
                FederationFormat::P2shP2wsh => {
                    let value = outpoint_values.get(idx).copied().ok_or_else(|| {
                        Error::IllegalState(format!("no spent value for input {idx}"))
                    })?;
                    sighash_cache
                        .segwit_signature_hash(idx, &redeem_script, value, EcdsaSighashType::All)?
                        .to_byte_array()
                }
            };
            Ok(Message::from_slice(&sighash)?)
        })
        .collect()
}

/// Signs pending releases on behalf of one federation member.
pub struct BitcoinSigner {
    secret_key: SecretKey,
    public_key: BitcoinPublicKey,
    secp: Secp256k1<All>,
}

impl BitcoinSigner {
    pub fn new(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        Self {
            public_key: BitcoinPublicKey::new(secret_key.public_key(&secp)),
            secret_key,
            secp,
        }
    }

    pub fn public_key(&self) -> BitcoinPublicKey {
        self.public_key
    }

    /// DER signatures for every input of `tx`, in input order.
    pub fn sign_release(&self, tx: &Transaction, outpoint_values: &[u64]) -> Result<Vec<Vec<u8>>> {
        Ok(input_sighashes(tx, outpoint_values)?
            .iter()
            .map(|msg| {
                self.secp
                    .sign_ecdsa(msg, &self.secret_key)
                    .serialize_der()
                    .to_vec()
            })
            .collect())
    }
}

impl<'a, S, B> Bridge<'a, S, B>
where
    S: BridgeStorage + ?Sized,
    B: BtcBlockchain + ?Sized,
{
    /// Federation expected to sign `pending`: the proposed one for the validation spend,
    /// otherwise whichever federation owns the spent outputs.
    fn signing_federation(&self, pending: &PendingRelease, svp_spend: bool) -> Result<Federation> {
        if svp_spend {
            return self.storage.proposed_federation()?.ok_or_else(|| {
                Error::IllegalState("validation spend without a proposed federation".into())
            });
        }
        let (redeem_script, _) = pending
            .btc_tx
            .input
            .first()
            .and_then(redeem_script_of)
            .ok_or(Error::UnknownSpendingFederation)?;
        self.registry()
            .spending_federation(&redeem_script)?
            .map(|(_, federation)| federation)
            .ok_or(Error::UnknownSpendingFederation)
    }

    pub fn add_signature(
        &mut self,
        ctx: &CallContext,
        signer: &BitcoinPublicKey,
        signatures: &[Vec<u8>],
        request_id: H256,
    ) -> Result<AddSignatureOutcome> {
        let (pending, svp_spend) = match self.storage.svp_spend_tx_waiting_for_signatures()? {
            Some((id, pending)) if id == request_id => (pending, true),
            _ => match self
                .storage
                .pegouts_waiting_for_signatures()?
                .remove(&request_id)
            {
                Some(pending) => (pending, false),
                None => return Err(Error::UnknownSigningRequest(request_id)),
            },
        };

        let federation = self.signing_federation(&pending, svp_spend)?;
        let Some(member) = federation
            .members()
            .iter()
            .find(|member| &member.btc_public_key == signer)
            .cloned()
        else {
            RELEASE_SIGNATURES.with_label_values(&["not_member"]).inc();
            return Err(Error::SignerNotInFederation(*signer));
        };

        let mut tx = pending.btc_tx.clone();
        if signatures.len() != tx.input.len() {
            RELEASE_SIGNATURES.with_label_values(&["rejected"]).inc();
            return Ok(AddSignatureOutcome::InvalidSignatureCount {
                expected: tx.input.len(),
                got: signatures.len(),
            });
        }

        let mut templates = tx
            .input
            .iter()
            .map(InputTemplate::parse)
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                Error::IllegalState(format!(
                    "pending transaction {} has a malformed input",
                    tx.txid()
                ))
            })?;
        let positions = templates
            .iter()
            .map(|template| template.key_position(signer))
            .collect::<Option<Vec<_>>>()
            .ok_or(Error::SignerNotInFederation(*signer))?;
        if templates
            .iter()
            .zip(&positions)
            .all(|(template, position)| template.has_signature(*position))
        {
            debug!("{signer} already signed request {request_id:?}");
            return Ok(AddSignatureOutcome::AlreadySigned);
        }

        let secp = Secp256k1::verification_only();
        let messages = input_sighashes(&tx, &pending.outpoint_values)?;
        let mut verified = Vec::with_capacity(signatures.len());
        for (input, (signature, msg)) in signatures.iter().zip(&messages).enumerate() {
            let valid = Signature::from_der(signature).ok().and_then(|mut sig| {
                sig.normalize_s();
                secp.verify_ecdsa(msg, &sig, &signer.inner).ok().map(|_| sig)
            });
            match valid {
                Some(sig) => verified.push(sig),
                None => {
                    warn!("Invalid signature from {signer} for input {input} of request {request_id:?}");
                    RELEASE_SIGNATURES.with_label_values(&["rejected"]).inc();
                    return Ok(AddSignatureOutcome::InvalidSignature { input });
                }
            }
        }

        for ((template, position), sig) in templates.iter_mut().zip(&positions).zip(verified) {
            if !template.has_signature(*position) {
                let signature = BitcoinSignature::sighash_all(sig);
                template.set_signature(*position, signature.to_vec());
            }
        }
        self.events.emit(BridgeEvent::AddSignature {
            request_id,
            signer_sidechain_address: member.sidechain_address(),
            signer_btc_public_key: *signer,
        });
        RELEASE_SIGNATURES.with_label_values(&["accepted"]).inc();

        if !templates.iter().all(InputTemplate::is_complete) {
            for (template, txin) in templates.iter().zip(tx.input.iter_mut()) {
                template.apply_unsigned(txin)?;
            }
            let partial = PendingRelease {
                btc_tx: tx,
                outpoint_values: pending.outpoint_values,
            };
            if svp_spend {
                self.storage
                    .set_svp_spend_tx_waiting_for_signatures(Some((request_id, partial)))?;
            } else {
                let mut waiting = self.storage.pegouts_waiting_for_signatures()?;
                waiting.insert(request_id, partial);
                self.storage.set_pegouts_waiting_for_signatures(waiting)?;
            }
            return Ok(AddSignatureOutcome::Accepted);
        }

        for (template, txin) in templates.iter().zip(tx.input.iter_mut()) {
            template.apply_finalized(txin)?;
        }
        self.finalize_release(ctx, request_id, &tx, svp_spend)?;
        Ok(AddSignatureOutcome::Finalized { signed_tx: tx })
    }

    fn finalize_release(
        &mut self,
        ctx: &CallContext,
        request_id: H256,
        signed_tx: &Transaction,
        svp_spend: bool,
    ) -> Result<()> {
        if svp_spend {
            self.storage.set_svp_spend_tx_waiting_for_signatures(None)?;
            self.storage
                .set_svp_spend_tx_hash_unsigned(Some(unsigned_tx_hash(signed_tx)?))?;
        } else {
            let mut waiting = self.storage.pegouts_waiting_for_signatures()?;
            waiting.remove(&request_id);
            self.storage.set_pegouts_waiting_for_signatures(waiting)?;
        }

        if self.activations(ctx).is_active(ConsensusRule::PegoutTxIndex) {
            if let Some(sighash) = first_input_sighash(signed_tx) {
                self.storage.set_pegout_tx_sig_hash(sighash)?;
            }
        }

        self.events.emit(BridgeEvent::ReleaseBtc {
            request_id,
            signed_tx: serialize(signed_tx),
        });
        RELEASES_FINALIZED.inc();
        info!(
            "Release {request_id:?} reached quorum, broadcasting {}",
            signed_tx.txid()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::ctx;
    use crate::chain::MemoryBtcBlockchain;
    use crate::constants::REGTEST;
    use crate::federation::tests::{members, secret_keys};
    use crate::scripts::InputTemplate;
    use crate::storage::MemoryBridgeStorage;
    use crate::wallet::tests::spendable;
    use crate::wallet::{build_payment, fee_rate_from_fee_per_kb, FeePolicy};
    use bitcoin::{Network, PubkeyHash, ScriptBuf, TxOut};

    fn pending_release(federation: &Federation) -> PendingRelease {
        let built = build_payment(
            &spendable(federation, &[600_000, 700_000]),
            vec![TxOut {
                value: 1_000_000,
                script_pubkey: ScriptBuf::new_p2pkh(&PubkeyHash::all_zeros()),
            }],
            federation.script_pubkey(),
            fee_rate_from_fee_per_kb(10_000),
            FeePolicy::DeductFromOutputs,
        )
        .unwrap();
        PendingRelease {
            btc_tx: built.tx,
            outpoint_values: built.outpoint_values,
        }
    }

    #[test]
    fn test_signer_round_trip() {
        for format in [FederationFormat::P2sh, FederationFormat::P2shP2wsh] {
            let federation = Federation::new(
                members(3),
                0,
                format,
                Network::Regtest,
            )
            .unwrap();
            let pending = pending_release(&federation);
            let signer = BitcoinSigner::new(secret_keys(1)[0]);
            let signatures = signer
                .sign_release(&pending.btc_tx, &pending.outpoint_values)
                .unwrap();
            assert_eq!(signatures.len(), pending.btc_tx.input.len());

            let secp = Secp256k1::verification_only();
            let messages = input_sighashes(&pending.btc_tx, &pending.outpoint_values).unwrap();
            for (signature, msg) in signatures.iter().zip(&messages) {
                let sig = Signature::from_der(signature).unwrap();
                secp.verify_ecdsa(msg, &sig, &signer.public_key().inner)
                    .unwrap();
            }
        }
    }

    #[test]
    fn test_quorum() {
        let constants = REGTEST.clone();
        let federation = constants.genesis_federation().unwrap();
        let mut storage = MemoryBridgeStorage::new();
        let pending = pending_release(&federation);
        let request_id = H256::repeat_byte(0x77);
        storage
            .set_pegouts_waiting_for_signatures([(request_id, pending.clone())].into())
            .unwrap();
        let chain = MemoryBtcBlockchain::new();
        let mut bridge = Bridge::new(&constants, &mut storage, &chain);

        let signers = secret_keys(4)
            .into_iter()
            .map(BitcoinSigner::new)
            .collect::<Vec<_>>();
        let sign = |signer: &BitcoinSigner| {
            signer
                .sign_release(&pending.btc_tx, &pending.outpoint_values)
                .unwrap()
        };

        assert!(matches!(
            bridge.add_signature(&ctx(1), &signers[0].public_key(), &sign(&signers[0]), H256::zero()),
            Err(Error::UnknownSigningRequest(_))
        ));
        assert!(matches!(
            bridge.add_signature(&ctx(1), &signers[3].public_key(), &sign(&signers[3]), request_id),
            Err(Error::SignerNotInFederation(_))
        ));
        // signatures by another member do not verify
        assert_eq!(
            bridge
                .add_signature(&ctx(1), &signers[0].public_key(), &sign(&signers[1]), request_id)
                .unwrap(),
            AddSignatureOutcome::InvalidSignature { input: 0 }
        );
        assert_eq!(
            bridge
                .add_signature(&ctx(1), &signers[0].public_key(), &sign(&signers[0])[..1], request_id)
                .unwrap(),
            AddSignatureOutcome::InvalidSignatureCount {
                expected: 2,
                got: 1
            }
        );
        assert!(bridge.events().is_empty());

        assert_eq!(
            bridge
                .add_signature(&ctx(1), &signers[0].public_key(), &sign(&signers[0]), request_id)
                .unwrap(),
            AddSignatureOutcome::Accepted
        );
        assert_eq!(
            bridge
                .add_signature(&ctx(1), &signers[0].public_key(), &sign(&signers[0]), request_id)
                .unwrap(),
            AddSignatureOutcome::AlreadySigned
        );
        let partial = &bridge.storage().pegouts_waiting_for_signatures().unwrap()[&request_id];
        assert_eq!(
            InputTemplate::parse(&partial.btc_tx.input[0])
                .unwrap()
                .signature_count(),
            1
        );

        let AddSignatureOutcome::Finalized { signed_tx } = bridge
            .add_signature(&ctx(1), &signers[2].public_key(), &sign(&signers[2]), request_id)
            .unwrap()
        else {
            panic!("release should reach quorum with two of three signatures");
        };
        assert!(bridge
            .storage()
            .pegouts_waiting_for_signatures()
            .unwrap()
            .is_empty());
        assert_eq!(
            unsigned_tx_hash(&signed_tx).unwrap(),
            pending.btc_tx.txid()
        );
        assert!(bridge
            .storage()
            .has_pegout_tx_sig_hash(&first_input_sighash(&signed_tx).unwrap())
            .unwrap());

        let topics = bridge
            .events()
            .iter()
            .map(BridgeEvent::topic)
            .collect::<Vec<_>>();
        assert_eq!(topics, vec!["add_signature", "add_signature", "release_btc"]);
    }
}
