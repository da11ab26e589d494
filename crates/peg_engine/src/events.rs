use bitcoin::{PublicKey as BitcoinPublicKey, ScriptBuf, Txid};
use ethers_core::types::{H160, H256};
use strum::IntoStaticStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RejectedPeginReason {
    LockingCapSurpassed,
    InvalidPeginInformation,
}

/// Log entries emitted by bridge calls, in emission order.
#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum BridgeEvent {
    ReleaseRequested {
        request_id: H256,
        btc_tx_hash: Txid,
        amount: u64,
    },
    /// Carries the values of the spent outpoints, as concatenated compact size integers.
    PegoutTransactionCreated {
        btc_tx_hash: Txid,
        outpoint_values: Vec<u8>,
    },
    AddSignature {
        request_id: H256,
        signer_sidechain_address: H160,
        signer_btc_public_key: BitcoinPublicKey,
    },
    ReleaseBtc {
        request_id: H256,
        signed_tx: Vec<u8>,
    },
    CommitFederationFailed {
        proposed_redeem_script: ScriptBuf,
        failure_height: u64,
    },
    CommitFederation {
        old_federation_script: ScriptBuf,
        new_federation_script: ScriptBuf,
        activation_block_number: u64,
    },
    PeginBtc {
        recipient: H160,
        btc_tx_hash: Txid,
        amount: u64,
    },
    RejectedPegin {
        btc_tx_hash: Txid,
        reason: RejectedPeginReason,
    },
    ReleaseRequestReceived {
        sender: H160,
        destination: ScriptBuf,
        amount: u64,
    },
    LockingCapIncreased {
        caller: H160,
        old_cap: u64,
        new_cap: u64,
    },
}

impl BridgeEvent {
    pub fn topic(&self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventLog {
    events: Vec<BridgeEvent>,
}

impl EventLog {
    pub fn emit(&mut self, event: BridgeEvent) {
        tracing::debug!(topic = event.topic(), "Emitting bridge event");
        self.events.push(event);
    }

    pub fn events(&self) -> &[BridgeEvent] {
        &self.events
    }

    pub fn take(&mut self) -> Vec<BridgeEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
