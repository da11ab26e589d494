use crate::scripts::{flyover_redeem_script, multisig_script};
use crate::{Error, Result};
use bitcoin::secp256k1::PublicKey as SecpPublicKey;
use bitcoin::{Address, Network, PublicKey as BitcoinPublicKey, Script, ScriptBuf};
use ethers_core::types::{H160, H256};
use ethers_core::utils::keccak256;
use serde::{Deserialize, Serialize};

/// Largest redeem script a legacy p2sh input can push.
const MAX_P2SH_REDEEM_SCRIPT_LEN: usize = 520;
const MAX_MEMBERS: usize = 15;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationMember {
    pub btc_public_key: BitcoinPublicKey,
    pub sidechain_public_key: SecpPublicKey,
}

impl FederationMember {
    pub fn new(btc_public_key: BitcoinPublicKey, sidechain_public_key: SecpPublicKey) -> Self {
        Self {
            btc_public_key,
            sidechain_public_key,
        }
    }

    /// Member that uses the same key on both chains.
    pub fn from_single_key(key: SecpPublicKey) -> Self {
        Self::new(BitcoinPublicKey::new(key), key)
    }

    pub fn sidechain_address(&self) -> H160 {
        sidechain_address(&self.sidechain_public_key)
    }
}

pub fn sidechain_address(key: &SecpPublicKey) -> H160 {
    let uncompressed = key.serialize_uncompressed();
    H160::from_slice(&keccak256(&uncompressed[1..])[12..])
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FederationFormat {
    #[default]
    P2sh,
    P2shP2wsh,
}

impl FederationFormat {
    pub fn script_pubkey(&self, redeem_script: &Script) -> ScriptBuf {
        match self {
            Self::P2sh => ScriptBuf::new_p2sh(&redeem_script.script_hash()),
            Self::P2shP2wsh => {
                let program = ScriptBuf::new_v0_p2wsh(&redeem_script.wscript_hash());
                ScriptBuf::new_p2sh(&program.script_hash())
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FederationRole {
    Active,
    Retiring,
    Proposed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Federation {
    members: Vec<FederationMember>,
    threshold: usize,
    redeem_script: ScriptBuf,
    script_pubkey: ScriptBuf,
    address: Address,
    format: FederationFormat,
    creation_block_number: u64,
}

impl Federation {
    pub fn new(
        mut members: Vec<FederationMember>,
        creation_block_number: u64,
        format: FederationFormat,
        network: Network,
    ) -> Result<Self> {
        if members.is_empty() || members.len() > MAX_MEMBERS {
            return Err(Error::InvalidFederation(format!(
                "expected 1 to {MAX_MEMBERS} members, got {}",
                members.len()
            )));
        }
        for member in members.iter() {
            if !member.btc_public_key.compressed {
                return Err(Error::InvalidFederation(
                    "bitcoin keys must be compressed".into(),
                ));
            }
        }

        members.sort_by(|a, b| {
            a.btc_public_key
                .inner
                .serialize()
                .cmp(&b.btc_public_key.inner.serialize())
        });
        if members
            .windows(2)
            .any(|pair| pair[0].btc_public_key == pair[1].btc_public_key)
        {
            return Err(Error::InvalidFederation("duplicate bitcoin key".into()));
        }

        let threshold = members.len() / 2 + 1;
        let pubkeys = members.iter().map(|m| m.btc_public_key).collect::<Vec<_>>();
        let redeem_script = multisig_script(threshold, &pubkeys);

        // flyover scripts prepend a 32 byte push and OP_DROP
        if format == FederationFormat::P2sh
            && redeem_script.len() + 34 > MAX_P2SH_REDEEM_SCRIPT_LEN
        {
            return Err(Error::InvalidFederation(
                "redeem script too large for p2sh".into(),
            ));
        }

        let script_pubkey = format.script_pubkey(&redeem_script);
        let address = Address::from_script(&script_pubkey, network)?;

        Ok(Self {
            members,
            threshold,
            redeem_script,
            script_pubkey,
            address,
            format,
            creation_block_number,
        })
    }

    pub fn members(&self) -> &[FederationMember] {
        &self.members
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn btc_public_keys(&self) -> Vec<BitcoinPublicKey> {
        self.members.iter().map(|m| m.btc_public_key).collect()
    }

    pub fn redeem_script(&self) -> &Script {
        &self.redeem_script
    }

    pub fn script_pubkey(&self) -> &Script {
        &self.script_pubkey
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn format(&self) -> FederationFormat {
        self.format
    }

    pub fn creation_block_number(&self) -> u64 {
        self.creation_block_number
    }

    pub fn member_index(&self, btc_public_key: &BitcoinPublicKey) -> Option<usize> {
        self.members
            .iter()
            .position(|m| &m.btc_public_key == btc_public_key)
    }

    pub fn is_member(&self, btc_public_key: &BitcoinPublicKey) -> bool {
        self.member_index(btc_public_key).is_some()
    }

    pub fn member_by_sidechain_address(&self, address: &H160) -> Option<&FederationMember> {
        self.members
            .iter()
            .find(|m| &m.sidechain_address() == address)
    }

    pub fn flyover_redeem_script(&self, derivation_hash: &H256) -> ScriptBuf {
        flyover_redeem_script(derivation_hash, &self.redeem_script)
    }

    pub fn flyover_script_pubkey(&self, derivation_hash: &H256) -> ScriptBuf {
        self.format
            .script_pubkey(&self.flyover_redeem_script(derivation_hash))
    }

    pub fn flyover_address(&self, derivation_hash: &H256) -> Result<Address> {
        Ok(Address::from_script(
            &self.flyover_script_pubkey(derivation_hash),
            self.address.network,
        )?)
    }

    /// Whether `script` is this federation's redeem script, with or without a flyover prefix.
    pub fn owns_redeem_script(&self, script: &Script) -> bool {
        crate::scripts::standard_redeem_script(script) == self.redeem_script.as_script()
    }
}
