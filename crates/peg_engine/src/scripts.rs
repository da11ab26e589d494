use crate::federation::FederationFormat;
use crate::{Error, Result};
use bitcoin::consensus::encode::{deserialize_partial, serialize, VarInt};
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_DROP, OP_PUSHBYTES_32, OP_PUSHNUM_1, OP_PUSHNUM_16};
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{PublicKey as BitcoinPublicKey, Script, ScriptBuf, Transaction, TxIn, Txid, Witness};
use ethers_core::types::H256;

/// `<32 byte push> OP_DROP`
const FLYOVER_PREFIX_LEN: usize = 34;
/// Upper bound of a DER signature plus sighash byte, used for fee estimation.
const DUMMY_SIGNATURE_LEN: usize = 73;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultisigInfo {
    pub threshold: usize,
    pub public_keys: Vec<BitcoinPublicKey>,
}

pub(crate) fn multisig_script(threshold: usize, keys: &[BitcoinPublicKey]) -> ScriptBuf {
    keys.iter()
        .fold(Builder::new().push_int(threshold as i64), |builder, key| {
            builder.push_key(key)
        })
        .push_int(keys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

fn small_int(instruction: &Instruction) -> Option<usize> {
    match instruction {
        Instruction::Op(op) => {
            let code = op.to_u8();
            (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8())
                .contains(&code)
                .then(|| (code - OP_PUSHNUM_1.to_u8() + 1) as usize)
        }
        _ => None,
    }
}

/// Parses `OP_m <keys> OP_n OP_CHECKMULTISIG`.
pub fn parse_multisig(script: &Script) -> Option<MultisigInfo> {
    let instructions = script
        .instructions()
        .collect::<std::result::Result<Vec<_>, _>>()
        .ok()?;
    let (first, rest) = instructions.split_first()?;
    let (last, middle) = rest.split_last()?;
    if *last != Instruction::Op(OP_CHECKMULTISIG) {
        return None;
    }
    let (count, keys) = middle.split_last()?;

    let threshold = small_int(first)?;
    let n = small_int(count)?;
    let public_keys = keys
        .iter()
        .map(|instruction| match instruction {
            Instruction::PushBytes(bytes) => BitcoinPublicKey::from_slice(bytes.as_bytes()).ok(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;

    if public_keys.len() != n || threshold > n {
        return None;
    }
    Some(MultisigInfo {
        threshold,
        public_keys,
    })
}

/// Drops a flyover derivation prefix, if any.
pub fn standard_redeem_script(script: &Script) -> &Script {
    let bytes = script.as_bytes();
    if bytes.len() > FLYOVER_PREFIX_LEN
        && bytes[0] == OP_PUSHBYTES_32.to_u8()
        && bytes[FLYOVER_PREFIX_LEN - 1] == OP_DROP.to_u8()
    {
        Script::from_bytes(&bytes[FLYOVER_PREFIX_LEN..])
    } else {
        script
    }
}

pub(crate) fn flyover_redeem_script(derivation_hash: &H256, redeem_script: &Script) -> ScriptBuf {
    let mut bytes = Vec::with_capacity(FLYOVER_PREFIX_LEN + redeem_script.len());
    bytes.push(OP_PUSHBYTES_32.to_u8());
    bytes.extend_from_slice(derivation_hash.as_bytes());
    bytes.push(OP_DROP.to_u8());
    bytes.extend_from_slice(redeem_script.as_bytes());
    ScriptBuf::from_bytes(bytes)
}

pub(crate) fn script_pushes(script: &Script) -> Option<Vec<Vec<u8>>> {
    script
        .instructions()
        .map(|instruction| match instruction {
            Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes().to_vec()),
            _ => None,
        })
        .collect()
}

fn push_all(elements: &[Vec<u8>]) -> Result<ScriptBuf> {
    elements
        .iter()
        .try_fold(Builder::new(), |builder, element| {
            let push = PushBytesBuf::try_from(element.clone())
                .map_err(|_| Error::InvalidScript("push too large".into()))?;
            Ok(builder.push_slice(push))
        })
        .map(|builder| builder.into_script())
}

/// Redeem script (possibly flyover-prefixed) revealed by an input spending a federation multisig.
pub(crate) fn redeem_script_of(txin: &TxIn) -> Option<(ScriptBuf, FederationFormat)> {
    let (script, format) = if txin.witness.is_empty() {
        let pushes = script_pushes(&txin.script_sig)?;
        (ScriptBuf::from_bytes(pushes.last()?.clone()), FederationFormat::P2sh)
    } else {
        (
            ScriptBuf::from_bytes(txin.witness.last()?.to_vec()),
            FederationFormat::P2shP2wsh,
        )
    };
    parse_multisig(standard_redeem_script(&script))?;
    Some((script, format))
}

/// Multisig input with one signature slot per federation key, in key order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct InputTemplate {
    redeem_script: ScriptBuf,
    format: FederationFormat,
    multisig: MultisigInfo,
    slots: Vec<Option<Vec<u8>>>,
}

impl InputTemplate {
    pub fn unsigned(redeem_script: ScriptBuf, format: FederationFormat) -> Result<Self> {
        let multisig = parse_multisig(standard_redeem_script(&redeem_script))
            .ok_or_else(|| Error::InvalidScript("not a multisig redeem script".into()))?;
        let slots = vec![None; multisig.public_keys.len()];
        Ok(Self {
            redeem_script,
            format,
            multisig,
            slots,
        })
    }

    /// Reads back a template previously written with `apply_unsigned`.
    pub fn parse(txin: &TxIn) -> Option<Self> {
        let (redeem_script, format) = redeem_script_of(txin)?;
        let multisig = parse_multisig(standard_redeem_script(&redeem_script))?;
        let elements = match format {
            FederationFormat::P2sh => script_pushes(&txin.script_sig)?,
            FederationFormat::P2shP2wsh => txin.witness.to_vec(),
        };
        let n = multisig.public_keys.len();
        if elements.len() != n + 2 || !elements[0].is_empty() {
            return None;
        }
        let slots = elements[1..=n]
            .iter()
            .map(|element| (!element.is_empty()).then(|| element.clone()))
            .collect();
        Some(Self {
            redeem_script,
            format,
            multisig,
            slots,
        })
    }

    pub fn redeem_script(&self) -> &Script {
        &self.redeem_script
    }

    pub fn format(&self) -> FederationFormat {
        self.format
    }

    pub fn key_position(&self, key: &BitcoinPublicKey) -> Option<usize> {
        self.multisig.public_keys.iter().position(|k| k == key)
    }

    pub fn has_signature(&self, position: usize) -> bool {
        matches!(self.slots.get(position), Some(Some(_)))
    }

    pub fn set_signature(&mut self, position: usize, signature: Vec<u8>) {
        if let Some(slot) = self.slots.get_mut(position) {
            *slot = Some(signature);
        }
    }

    pub fn signature_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_complete(&self) -> bool {
        self.signature_count() >= self.multisig.threshold
    }

    pub fn apply_unsigned(&self, txin: &mut TxIn) -> Result<()> {
        let elements = std::iter::once(vec![])
            .chain(self.slots.iter().map(|slot| slot.clone().unwrap_or_default()))
            .chain(std::iter::once(self.redeem_script.to_bytes()))
            .collect::<Vec<_>>();
        self.write(txin, &elements)
    }

    /// Writes `OP_0 <threshold signatures in key order> <redeem script>`.
    pub fn apply_finalized(&self, txin: &mut TxIn) -> Result<()> {
        if !self.is_complete() {
            return Err(Error::IllegalState(format!(
                "input has {} of {} signatures",
                self.signature_count(),
                self.multisig.threshold
            )));
        }
        let elements = std::iter::once(vec![])
            .chain(self.slots.iter().flatten().take(self.multisig.threshold).cloned())
            .chain(std::iter::once(self.redeem_script.to_bytes()))
            .collect::<Vec<_>>();
        self.write(txin, &elements)
    }

    /// Fully signed input with placeholder signatures, for weight estimation.
    pub fn dummy_signed_input(&self) -> Result<TxIn> {
        let elements = std::iter::once(vec![])
            .chain((0..self.multisig.threshold).map(|_| vec![0u8; DUMMY_SIGNATURE_LEN]))
            .chain(std::iter::once(self.redeem_script.to_bytes()))
            .collect::<Vec<_>>();
        let mut txin = TxIn::default();
        self.write(&mut txin, &elements)?;
        Ok(txin)
    }

    fn write(&self, txin: &mut TxIn, elements: &[Vec<u8>]) -> Result<()> {
        match self.format {
            FederationFormat::P2sh => {
                txin.script_sig = push_all(elements)?;
                txin.witness = Witness::default();
            }
            FederationFormat::P2shP2wsh => {
                let program = ScriptBuf::new_v0_p2wsh(&self.redeem_script.wscript_hash());
                txin.script_sig = push_all(&[program.to_bytes()])?;
                txin.witness = Witness::from_slice(elements);
            }
        }
        Ok(())
    }
}

/// Legacy sighash of input 0 over its standard redeem script. Signing does not change it.
pub fn first_input_sighash(tx: &Transaction) -> Option<[u8; 32]> {
    let (redeem_script, _) = redeem_script_of(tx.input.first()?)?;
    SighashCache::new(tx)
        .legacy_signature_hash(
            0,
            standard_redeem_script(&redeem_script),
            EcdsaSighashType::All.to_u32(),
        )
        .ok()
        .map(|sighash| sighash.to_byte_array())
}

/// Txid of the transaction with every federation input reset to its unsigned template.
pub fn unsigned_tx_hash(tx: &Transaction) -> Result<Txid> {
    let mut unsigned = tx.clone();
    for txin in unsigned.input.iter_mut() {
        if let Some((redeem_script, format)) = redeem_script_of(txin) {
            InputTemplate::unsigned(redeem_script, format)?.apply_unsigned(txin)?;
        }
    }
    Ok(unsigned.txid())
}

pub fn encode_outpoint_values(values: &[u64]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|value| serialize(&VarInt(*value)))
        .collect()
}

pub fn decode_outpoint_values(mut bytes: &[u8]) -> Result<Vec<u64>> {
    let mut values = vec![];
    while !bytes.is_empty() {
        let (VarInt(value), used) = deserialize_partial::<VarInt>(bytes)?;
        values.push(value);
        bytes = &bytes[used..];
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::tests::members;
    use crate::federation::Federation;
    use bitcoin::absolute::LockTime;
    use bitcoin::{Network, OutPoint, TxOut};

    fn federation(format: FederationFormat) -> Federation {
        Federation::new(members(3), 0, format, Network::Regtest).unwrap()
    }

    fn spending_tx(template: &InputTemplate) -> Transaction {
        let mut txin = TxIn {
            previous_output: OutPoint::new(Txid::all_zeros(), 3),
            ..Default::default()
        };
        template.apply_unsigned(&mut txin).unwrap();
        Transaction {
            version: 2,
            lock_time: LockTime::ZERO,
            input: vec![txin],
            output: vec![TxOut {
                value: 10_000,
                script_pubkey: ScriptBuf::new_p2sh(&bitcoin::ScriptHash::all_zeros()),
            }],
        }
    }

    #[test]
    fn test_template_round_trip() {
        for format in [FederationFormat::P2sh, FederationFormat::P2shP2wsh] {
            let federation = federation(format);
            let mut template =
                InputTemplate::unsigned(federation.redeem_script().to_owned(), format).unwrap();
            let tx = spending_tx(&template);

            let parsed = InputTemplate::parse(&tx.input[0]).unwrap();
            assert_eq!(parsed, template);
            assert_eq!(parsed.signature_count(), 0);

            template.set_signature(1, vec![0x30; 71]);
            let mut txin = tx.input[0].clone();
            template.apply_unsigned(&mut txin).unwrap();
            let parsed = InputTemplate::parse(&txin).unwrap();
            assert!(parsed.has_signature(1));
            assert!(!parsed.has_signature(0));
            assert!(!parsed.is_complete());
            assert!(parsed.apply_finalized(&mut txin.clone()).is_err());
        }
    }

    #[test]
    fn test_unsigned_hash_and_sighash_ignore_signatures() {
        for format in [FederationFormat::P2sh, FederationFormat::P2shP2wsh] {
            let federation = federation(format);
            let mut template =
                InputTemplate::unsigned(federation.redeem_script().to_owned(), format).unwrap();
            let tx = spending_tx(&template);
            let hash = unsigned_tx_hash(&tx).unwrap();
            let sighash = first_input_sighash(&tx).unwrap();

            template.set_signature(0, vec![0x30; 72]);
            template.set_signature(2, vec![0x30; 70]);
            let mut signed = tx.clone();
            template.apply_finalized(&mut signed.input[0]).unwrap();

            assert_eq!(unsigned_tx_hash(&signed).unwrap(), hash);
            assert_eq!(first_input_sighash(&signed).unwrap(), sighash);
            // finalized inputs no longer carry empty slots
            assert!(InputTemplate::parse(&signed.input[0]).is_none());
            assert_eq!(
                redeem_script_of(&signed.input[0]).unwrap().0.as_script(),
                federation.redeem_script()
            );
        }
    }

    #[test]
    fn test_flyover_prefix() {
        let federation = federation(FederationFormat::P2sh);
        let hash = H256::repeat_byte(7);
        let flyover = federation.flyover_redeem_script(&hash);
        assert_eq!(standard_redeem_script(&flyover), federation.redeem_script());
        assert_eq!(
            standard_redeem_script(federation.redeem_script()),
            federation.redeem_script()
        );

        let template = InputTemplate::unsigned(flyover.clone(), FederationFormat::P2sh).unwrap();
        let tx = spending_tx(&template);
        assert_eq!(redeem_script_of(&tx.input[0]).unwrap().0, flyover);
        assert!(first_input_sighash(&tx).is_some());
    }

    #[test]
    fn test_non_federation_input() {
        let txin = TxIn {
            script_sig: Builder::new()
                .push_slice(PushBytesBuf::try_from(vec![0x30u8; 71]).unwrap())
                .push_key(&federation(FederationFormat::P2sh).btc_public_keys()[0])
                .into_script(),
            ..Default::default()
        };
        assert!(redeem_script_of(&txin).is_none());
        assert!(parse_multisig(&ScriptBuf::new()).is_none());
    }

    #[test]
    fn test_outpoint_values_codec() {
        let values = vec![1, 252, 253, 70_000, 5_000_000_000];
        let encoded = encode_outpoint_values(&values);
        // 1 + 1 + 3 + 5 + 9 bytes of compact size
        assert_eq!(encoded.len(), 19);
        assert_eq!(decode_outpoint_values(&encoded).unwrap(), values);
        assert!(decode_outpoint_values(&[0xfd, 0x01]).is_err());
    }
}
