mod activations;
mod bridge;
mod chain;
mod classifier;
mod constants;
mod dispatch;
mod federation;
mod flyover;
pub mod metrics;
mod pegin;
mod registry;
mod scripts;
mod signing;
pub mod storage;
mod svp;
mod wallet;

pub mod events;

pub use bitcoin;
use bitcoin::PublicKey as BitcoinPublicKey;
use ethers_core::types::{H160, U256};
use thiserror::Error;

pub use activations::{ActivationConfig, ActivationsForBlock, ConsensusRule};
pub use bridge::{Bridge, CallContext};
pub use chain::{BtcBlockchain, MemoryBtcBlockchain};
pub use classifier::{classify, pegin_value, ClassifierContext, PegTxType, PeginValue};
pub use constants::{BridgeConstants, GenesisFederation, REGTEST, REGTEST_FEDERATION_SECRET_KEYS};
pub use dispatch::{BridgeCall, BridgeMethod, CallKind, CallResult, MethodPermissions};
pub use events::{BridgeEvent, EventLog, RejectedPeginReason};
pub use federation::{Federation, FederationFormat, FederationMember, FederationRole};
pub use flyover::{flyover_derivation_hash, FlyoverDeposit, FlyoverOutcome, FlyoverTxResponseCode};
pub use pegin::{parse_pegin_information, PeginInformation, RegistrationOutcome};
pub use registry::FederationRegistry;
pub use scripts::{first_input_sighash, unsigned_tx_hash, MultisigInfo};
pub use signing::{input_sighashes, AddSignatureOutcome, BitcoinSigner};
pub use storage::{BridgeStorage, MemoryBridgeStorage};
pub use svp::SvpState;

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub fn wei_to_sats(wei: U256) -> u64 {
    // eth has 18 decimals, bitcoin 8 --> div by 10^10
    (wei / U256::from(10_000_000_000u64)).low_u64()
}

pub fn sats_to_wei(sats: u64) -> U256 {
    U256::from(sats) * U256::from(10_000_000_000u64)
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage access error: {0}")]
    DbError(String),
    #[error("Parsing failure: {0}")]
    ParsingError(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Method {0} is not enabled at this height")]
    FunctionDisabled(&'static str),
    #[error("Call kind {kind:?} is not allowed for {method}")]
    CallKindNotAllowed { method: &'static str, kind: CallKind },
    #[error("Sender {0:?} is not a federation member")]
    NotFederationMember(H160),
    #[error("Sender {0:?} is not authorized")]
    Unauthorized(H160),
    #[error("Insufficient bitcoin confirmations ({got} of {required})")]
    InsufficientConfirmations { got: u32, required: u32 },
    #[error("No bitcoin block header at height {0}")]
    MissingBlockHeader(u32),
    #[error("Invalid merkle proof")]
    InvalidMerkleProof,
    #[error("Signer {0} does not belong to the federation owning the transaction")]
    SignerNotInFederation(BitcoinPublicKey),
    #[error("No pending transaction for signing request {0:?}")]
    UnknownSigningRequest(ethers_core::types::H256),
    #[error("Transaction does not spend from a known federation")]
    UnknownSpendingFederation,
    #[error("Insufficient funds: needed {needed}, available {available}")]
    InsufficientFunds { needed: u64, available: u64 },
    #[error("Coin selection failed: {0}")]
    CoinSelection(String),
    #[error("Output of {0} sats would be dust")]
    DustOutput(u64),
    #[error("Invalid script: {0}")]
    InvalidScript(String),
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Invalid federation: {0}")]
    InvalidFederation(String),
    #[error("Illegal bridge state: {0}")]
    IllegalState(String),
    #[error("Sighash error: {0}")]
    Sighash(#[from] bitcoin::sighash::Error),
    #[error("Encoding error: {0}")]
    Encode(#[from] bitcoin::consensus::encode::Error),
    #[error("Address error: {0}")]
    Address(#[from] bitcoin::address::Error),
    #[error("Secp256k1 error: {0}")]
    Secp(#[from] bitcoin::secp256k1::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_conversion() {
        assert_eq!(sats_to_wei(1), U256::from(10_000_000_000u64));
        assert_eq!(wei_to_sats(sats_to_wei(123_456)), 123_456);
        // sub-satoshi remainders are truncated
        assert_eq!(wei_to_sats(U256::from(19_999_999_999u64)), 1);
    }
}
