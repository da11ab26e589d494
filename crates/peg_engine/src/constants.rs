use crate::activations::{ActivationConfig, ConsensusRule};
use crate::federation::{Federation, FederationFormat, FederationMember};
use crate::{Error, Result};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::Network;
use ethers_core::types::{H160, H256};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisFederation {
    pub members: Vec<FederationMember>,
    pub creation_block_number: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConstants {
    pub btc_network: Network,
    pub genesis_federation: GenesisFederation,
    /// Format of every federation created by this bridge
    pub federation_format: FederationFormat,
    /// Sats a pegin must carry to be accepted
    pub minimum_pegin_value: u64,
    pub minimum_pegout_value: u64,
    /// Bitcoin confirmations required to register a transaction
    pub btc_confirmations: u32,
    /// Sidechain blocks a pegout waits before being handed to the signers
    pub pegout_confirmations: u64,
    /// Sidechain blocks before a retiring federation is swept to the active one
    pub federation_migration_age: u64,
    pub max_release_batch_size: usize,
    /// Sats sent to each proposed federation output during validation
    pub svp_spendable_value: u64,
    /// Sidechain blocks a proposed federation has to complete validation
    pub svp_period_blocks: u64,
    /// Derivation hash of the proposed federation's flyover output
    pub proposed_federation_flyover_prefix: H256,
    pub initial_locking_cap: u64,
    pub locking_cap_increments_multiplier: u64,
    pub locking_cap_authorizer: H160,
    pub federation_change_authorizer: H160,
    /// Fee rate in sats per kilobyte used when no other rate was voted
    pub default_fee_per_kb: u64,
    pub activations: ActivationConfig,
}

pub const REGTEST_FEDERATION_SECRET_KEYS: [&str; 3] = [
    "0000000000000000000000000000000000000000000000000000000000000001",
    "0000000000000000000000000000000000000000000000000000000000000002",
    "0000000000000000000000000000000000000000000000000000000000000003",
];

pub static REGTEST: Lazy<BridgeConstants> = Lazy::new(|| {
    let secp = Secp256k1::new();
    let members = REGTEST_FEDERATION_SECRET_KEYS
        .iter()
        .map(|sk| SecretKey::from_str(sk).unwrap().public_key(&secp))
        .map(FederationMember::from_single_key)
        .collect();

    BridgeConstants {
        btc_network: Network::Regtest,
        genesis_federation: GenesisFederation {
            members,
            creation_block_number: 0,
        },
        federation_format: FederationFormat::P2sh,
        minimum_pegin_value: 500_000,
        minimum_pegout_value: 250_000,
        btc_confirmations: 3,
        pegout_confirmations: 10,
        federation_migration_age: 20,
        max_release_batch_size: 50,
        svp_spendable_value: 100_000,
        svp_period_blocks: 125,
        proposed_federation_flyover_prefix: H256::from_low_u64_be(1),
        initial_locking_cap: 1_000 * 100_000_000,
        locking_cap_increments_multiplier: 2,
        locking_cap_authorizer: "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf".parse().unwrap(),
        federation_change_authorizer: "0x2b5ad5c4795c026514f8317c7a215e218dccd6cf"
            .parse()
            .unwrap(),
        default_fee_per_kb: 10_000,
        activations: ActivationConfig::new([
            (ConsensusRule::PegoutTxIndex, 0),
            (ConsensusRule::RetiringFederationPegins, 0),
            (ConsensusRule::PeginPerOutputMinimum, 0),
            (ConsensusRule::FlyoverDeposits, 0),
            (ConsensusRule::FlyoverRetiringFederation, 0),
            (ConsensusRule::Svp, 0),
            (ConsensusRule::StrictCallKind, 0),
        ]),
    }
});

impl Default for BridgeConstants {
    fn default() -> Self {
        REGTEST.clone()
    }
}

impl BridgeConstants {
    /// Either a preset name or the path of a json file.
    pub fn from_value(s: &str) -> Result<Self> {
        let constants: Self = match s {
            "regtest" | "dev" => REGTEST.clone(),
            _ => {
                let raw = std::fs::read_to_string(PathBuf::from(s))
                    .map_err(|e| Error::Config(format!("{s}: {e}")))?;
                serde_json::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?
            }
        };
        constants.validate()?;
        Ok(constants)
    }

    pub fn validate(&self) -> Result<()> {
        if self.minimum_pegin_value == 0 {
            return Err(Error::Config("minimumPeginValue must be positive".into()));
        }
        if self.max_release_batch_size == 0 {
            return Err(Error::Config("maxReleaseBatchSize must be positive".into()));
        }
        if self.locking_cap_increments_multiplier < 1 {
            return Err(Error::Config(
                "lockingCapIncrementsMultiplier must be at least 1".into(),
            ));
        }
        self.genesis_federation()?;
        Ok(())
    }

    pub fn genesis_federation(&self) -> Result<Federation> {
        Federation::new(
            self.genesis_federation.members.clone(),
            self.genesis_federation.creation_block_number,
            self.federation_format,
            self.btc_network,
        )
    }
}
