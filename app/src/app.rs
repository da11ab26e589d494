use bitcoin::address::NetworkUnchecked;
use bitcoin::consensus::encode::deserialize;
use bitcoin::secp256k1::{PublicKey as SecpPublicKey, SecretKey};
use bitcoin::{Address, Transaction};
use clap::{Parser, Subcommand};
use ethers_core::types::{H160, H256};
use eyre::Result;
use peg_engine::{
    classify, flyover_derivation_hash, parse_pegin_information, pegin_value, BitcoinSigner,
    BridgeConstants, ClassifierContext, Federation, FederationMember, MemoryBridgeStorage,
};
use serde_json::{json, Value};
use std::str::FromStr;
use tracing::*;
use tracing_subscriber::{prelude::*, EnvFilter};

#[inline]
pub fn run() -> Result<()> {
    App::parse().run()
}

pub fn constants_value_parser(s: &str) -> Result<BridgeConstants, eyre::Error> {
    Ok(BridgeConstants::from_value(s)?)
}

pub fn parse_bitcoin_secret_key(s: &str) -> Result<SecretKey, eyre::Error> {
    let secret_key =
        SecretKey::from_str(s).map_err(|_err| eyre::Error::msg("Failed to deserialize key"))?;
    Ok(secret_key)
}

fn parse_raw_tx(s: &str) -> Result<Transaction, eyre::Error> {
    Ok(deserialize(&hex::decode(s.trim())?)?)
}

#[derive(Parser)]
#[command(author, about = "Offline tooling for the bitcoin peg", long_about = None)]
pub struct App {
    /// Preset name or path of a json file with the bridge constants
    #[arg(
        long = "constants",
        value_name = "PRESET_OR_PATH",
        value_parser = constants_value_parser,
        default_value = "regtest",
        global = true
    )]
    constants: BridgeConstants,

    #[arg(
        long = "full-log-context",
        env = "FULL_LOG_CONTEXT",
        default_value_t = false,
        global = true
    )]
    pub full_log_context: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Classify a raw bitcoin transaction against the genesis federation
    Classify {
        #[arg(value_parser = parse_raw_tx)]
        raw_tx: Transaction,
        /// Sidechain height used to resolve the consensus rules
        #[arg(long, default_value_t = 0)]
        block: u64,
    },
    /// Describe the genesis federation, or one made of the given keys
    Federation {
        #[arg(long, value_delimiter = ',')]
        members: Vec<SecpPublicKey>,
    },
    /// Derive the flyover deposit address of the genesis federation
    FlyoverAddress {
        #[arg(long)]
        derivation_arguments_hash: H256,
        #[arg(long)]
        user_refund_address: Address<NetworkUnchecked>,
        #[arg(long)]
        lp_address: Address<NetworkUnchecked>,
        #[arg(long)]
        caller: H160,
    },
    /// Sign every input of a pending release
    SignRelease {
        #[arg(long = "bitcoin-secret-key", value_parser = parse_bitcoin_secret_key)]
        bitcoin_secret_key: SecretKey,
        #[arg(value_parser = parse_raw_tx)]
        raw_tx: Transaction,
        /// Values of the spent outpoints, in input order
        #[arg(long, value_delimiter = ',', required = true)]
        values: Vec<u64>,
    },
    /// Print the resolved bridge constants
    Constants,
}

impl App {
    pub fn run(self) -> Result<()> {
        self.init_tracing();
        let output = self.execute()?;
        println!("{}", serde_json::to_string_pretty(&output)?);
        Ok(())
    }

    fn init_tracing(&self) {
        let rust_log_level = std::env::var("RUST_LOG")
            .ok()
            .and_then(|level| Level::from_str(&level).ok())
            .unwrap_or(Level::INFO);

        let filter = if self.full_log_context {
            EnvFilter::builder().parse_lossy(rust_log_level.as_str())
        } else {
            let filter_tag = format!("pegctl={rust_log_level},peg_engine={rust_log_level}");
            EnvFilter::builder().parse_lossy(filter_tag.as_str())
        };

        let main_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr);

        let layers = if rust_log_level == Level::DEBUG || rust_log_level == Level::TRACE {
            vec![main_layer
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter)
                .boxed()]
        } else {
            vec![main_layer.with_filter(filter).boxed()]
        };

        tracing_subscriber::registry().with(layers).init();
    }

    fn execute(&self) -> Result<Value> {
        let constants = &self.constants;
        match &self.command {
            Command::Classify { raw_tx, block } => classify_transaction(constants, raw_tx, *block),
            Command::Federation { members } => {
                let federation = if members.is_empty() {
                    constants.genesis_federation()?
                } else {
                    Federation::new(
                        members
                            .iter()
                            .copied()
                            .map(FederationMember::from_single_key)
                            .collect(),
                        0,
                        constants.federation_format,
                        constants.btc_network,
                    )?
                };
                Ok(describe_federation(&federation))
            }
            Command::FlyoverAddress {
                derivation_arguments_hash,
                user_refund_address,
                lp_address,
                caller,
            } => {
                let derivation_hash = flyover_derivation_hash(
                    derivation_arguments_hash,
                    &user_refund_address
                        .clone()
                        .require_network(constants.btc_network)?,
                    &lp_address.clone().require_network(constants.btc_network)?,
                    caller,
                )?;
                let federation = constants.genesis_federation()?;
                let address = federation.flyover_address(&derivation_hash)?;
                info!("Flyover address {address} for derivation hash {derivation_hash:?}");
                Ok(json!({
                    "derivationHash": derivation_hash,
                    "address": address.to_string(),
                }))
            }
            Command::SignRelease {
                bitcoin_secret_key,
                raw_tx,
                values,
            } => {
                if values.len() != raw_tx.input.len() {
                    eyre::bail!(
                        "{} values given for {} inputs",
                        values.len(),
                        raw_tx.input.len()
                    );
                }
                let signer = BitcoinSigner::new(*bitcoin_secret_key);
                let signatures = signer.sign_release(raw_tx, values)?;
                Ok(json!({
                    "signer": signer.public_key().to_string(),
                    "signatures": signatures.iter().map(hex::encode).collect::<Vec<_>>(),
                }))
            }
            Command::Constants => Ok(serde_json::to_value(constants)?),
        }
    }
}

fn classify_transaction(constants: &BridgeConstants, tx: &Transaction, block: u64) -> Result<Value> {
    let genesis = constants.genesis_federation()?;
    let ctx = ClassifierContext {
        active_federation: &genesis,
        retiring_federation: None,
        last_retired_federation_script: None,
        activations: constants.activations.for_block(block),
        minimum_pegin_value: constants.minimum_pegin_value,
    };
    let storage = MemoryBridgeStorage::new();
    let tx_type = classify(tx, &ctx, &storage)?;
    let value = pegin_value(tx, &ctx);
    let recipient = match parse_pegin_information(tx) {
        Ok(information) => Some(information.recipient),
        Err(err) => {
            debug!("No pegin information in {}: {err}", tx.txid());
            None
        }
    };

    Ok(json!({
        "txid": tx.txid().to_string(),
        "type": format!("{tx_type:?}"),
        "peginValue": value.total,
        "belowMinimum": value.below_minimum.len(),
        "recipient": recipient,
    }))
}

fn describe_federation(federation: &Federation) -> Value {
    json!({
        "address": federation.address().to_string(),
        "redeemScript": hex::encode(federation.redeem_script().as_bytes()),
        "format": format!("{:?}", federation.format()),
        "size": federation.size(),
        "threshold": federation.threshold(),
        "members": federation
            .members()
            .iter()
            .map(|member| json!({
                "btcPublicKey": member.btc_public_key.to_string(),
                "sidechainAddress": member.sidechain_address(),
            }))
            .collect::<Vec<_>>(),
    })
}
