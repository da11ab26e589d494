//! Permission table of the bridge methods, checked before any of them runs.

use crate::activations::{ActivationsForBlock, ConsensusRule};
use crate::bridge::{Bridge, CallContext};
use crate::chain::BtcBlockchain;
use crate::federation::{Federation, FederationMember};
use crate::flyover::{FlyoverDeposit, FlyoverOutcome};
use crate::pegin::RegistrationOutcome;
use crate::signing::AddSignatureOutcome;
use crate::storage::BridgeStorage;
use crate::svp::SvpState;
use crate::{Error, Result};
use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, PublicKey as BitcoinPublicKey};
use ethers_core::types::{H256, U256};
use strum::{EnumIter, EnumString, IntoStaticStr};
use tracing::debug;

/// How the sidechain transaction reached the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, IntoStaticStr)]
#[strum(serialize_all = "camelCase")]
pub enum CallKind {
    Call,
    StaticCall,
    DelegateCall,
    InternalCall,
}

const ANY_CALL_KIND: &[CallKind] = &[
    CallKind::Call,
    CallKind::StaticCall,
    CallKind::DelegateCall,
    CallKind::InternalCall,
];
const READ_ONLY_CALL_KINDS: &[CallKind] = &[CallKind::Call, CallKind::StaticCall];
const DIRECT_CALL_ONLY: &[CallKind] = &[CallKind::Call];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "camelCase")]
pub enum BridgeMethod {
    RegisterBtcTransaction,
    RegisterFlyoverBtcTransaction,
    AddSignature,
    UpdateCollections,
    RequestRelease,
    IncreaseLockingCap,
    ProposeFederation,
    CommitFederation,
    GetLockingCap,
    GetCustodiedBalance,
    GetActiveFederationAddress,
    GetProposedFederationAddress,
    GetSvpState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodPermissions {
    /// Rule that introduces the method, if it did not exist from genesis
    pub enabled_by: Option<ConsensusRule>,
    pub mutates_state: bool,
    /// Sender must belong to the active or retiring federation
    pub requires_membership: bool,
}

impl MethodPermissions {
    const fn mutating() -> Self {
        Self {
            enabled_by: None,
            mutates_state: true,
            requires_membership: false,
        }
    }

    const fn read_only() -> Self {
        Self {
            enabled_by: None,
            mutates_state: false,
            requires_membership: false,
        }
    }

    pub fn allowed_call_kinds(&self, activations: ActivationsForBlock) -> &'static [CallKind] {
        if !self.mutates_state {
            READ_ONLY_CALL_KINDS
        } else if activations.is_active(ConsensusRule::StrictCallKind) {
            DIRECT_CALL_ONLY
        } else {
            ANY_CALL_KIND
        }
    }
}

impl BridgeMethod {
    pub fn permissions(self) -> MethodPermissions {
        use BridgeMethod::*;
        match self {
            RegisterBtcTransaction | UpdateCollections => MethodPermissions {
                requires_membership: true,
                ..MethodPermissions::mutating()
            },
            RegisterFlyoverBtcTransaction => MethodPermissions {
                enabled_by: Some(ConsensusRule::FlyoverDeposits),
                ..MethodPermissions::mutating()
            },
            AddSignature | RequestRelease | IncreaseLockingCap | ProposeFederation
            | CommitFederation => MethodPermissions::mutating(),
            GetLockingCap
            | GetCustodiedBalance
            | GetActiveFederationAddress
            | GetProposedFederationAddress
            | GetSvpState => MethodPermissions::read_only(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum BridgeCall {
    RegisterBtcTransaction {
        raw_tx: Vec<u8>,
        height: u32,
        pmt: Vec<u8>,
    },
    RegisterFlyoverBtcTransaction(FlyoverDeposit),
    AddSignature {
        signer: BitcoinPublicKey,
        signatures: Vec<Vec<u8>>,
        request_id: H256,
    },
    UpdateCollections,
    RequestRelease {
        destination: Address<NetworkUnchecked>,
        value: U256,
    },
    IncreaseLockingCap {
        new_cap: u64,
    },
    ProposeFederation {
        members: Vec<FederationMember>,
    },
    CommitFederation,
    GetLockingCap,
    GetCustodiedBalance,
    GetActiveFederationAddress,
    GetProposedFederationAddress,
    GetSvpState,
}

impl BridgeCall {
    pub fn method(&self) -> BridgeMethod {
        match self {
            Self::RegisterBtcTransaction { .. } => BridgeMethod::RegisterBtcTransaction,
            Self::RegisterFlyoverBtcTransaction(_) => BridgeMethod::RegisterFlyoverBtcTransaction,
            Self::AddSignature { .. } => BridgeMethod::AddSignature,
            Self::UpdateCollections => BridgeMethod::UpdateCollections,
            Self::RequestRelease { .. } => BridgeMethod::RequestRelease,
            Self::IncreaseLockingCap { .. } => BridgeMethod::IncreaseLockingCap,
            Self::ProposeFederation { .. } => BridgeMethod::ProposeFederation,
            Self::CommitFederation => BridgeMethod::CommitFederation,
            Self::GetLockingCap => BridgeMethod::GetLockingCap,
            Self::GetCustodiedBalance => BridgeMethod::GetCustodiedBalance,
            Self::GetActiveFederationAddress => BridgeMethod::GetActiveFederationAddress,
            Self::GetProposedFederationAddress => BridgeMethod::GetProposedFederationAddress,
            Self::GetSvpState => BridgeMethod::GetSvpState,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallResult {
    Done,
    Registration(RegistrationOutcome),
    Flyover(FlyoverOutcome),
    Signature(AddSignatureOutcome),
    Federation(Federation),
    Amount(u64),
    Address(Option<Address>),
    Svp(SvpState),
}

impl<'a, S, B> Bridge<'a, S, B>
where
    S: BridgeStorage + ?Sized,
    B: BtcBlockchain + ?Sized,
{
    pub fn execute(&mut self, ctx: &CallContext, call: BridgeCall) -> Result<CallResult> {
        let method = call.method();
        let name: &'static str = method.into();
        let activations = self.activations(ctx);
        let permissions = method.permissions();

        if let Some(rule) = permissions.enabled_by {
            if !activations.is_active(rule) {
                return Err(Error::FunctionDisabled(name));
            }
        }
        if !permissions
            .allowed_call_kinds(activations)
            .contains(&ctx.kind)
        {
            return Err(Error::CallKindNotAllowed {
                method: name,
                kind: ctx.kind,
            });
        }
        if permissions.requires_membership && !self.registry().is_federation_member(&ctx.sender)? {
            return Err(Error::NotFederationMember(ctx.sender));
        }
        debug!(method = name, sender = ?ctx.sender, "Executing bridge call");

        Ok(match call {
            BridgeCall::RegisterBtcTransaction {
                raw_tx,
                height,
                pmt,
            } => CallResult::Registration(self.register_btc_transaction(ctx, &raw_tx, height, &pmt)?),
            BridgeCall::RegisterFlyoverBtcTransaction(deposit) => {
                CallResult::Flyover(self.register_flyover_deposit(ctx, &deposit)?)
            }
            BridgeCall::AddSignature {
                signer,
                signatures,
                request_id,
            } => CallResult::Signature(self.add_signature(ctx, &signer, &signatures, request_id)?),
            BridgeCall::UpdateCollections => {
                self.update_collections(ctx)?;
                CallResult::Done
            }
            BridgeCall::RequestRelease { destination, value } => {
                self.request_release(ctx, &destination, value)?;
                CallResult::Done
            }
            BridgeCall::IncreaseLockingCap { new_cap } => {
                self.increase_locking_cap(ctx, new_cap)?;
                CallResult::Done
            }
            BridgeCall::ProposeFederation { members } => {
                CallResult::Federation(self.propose_federation(ctx, members)?)
            }
            BridgeCall::CommitFederation => {
                self.commit_proposed_federation(ctx)?;
                CallResult::Done
            }
            BridgeCall::GetLockingCap => CallResult::Amount(self.locking_cap()?),
            BridgeCall::GetCustodiedBalance => CallResult::Amount(self.custodied_balance()?),
            BridgeCall::GetActiveFederationAddress => {
                CallResult::Address(Some(self.registry().active_federation()?.address().clone()))
            }
            BridgeCall::GetProposedFederationAddress => CallResult::Address(
                self.registry()
                    .proposed_federation()?
                    .map(|federation| federation.address().clone()),
            ),
            BridgeCall::GetSvpState => CallResult::Svp(self.svp_state()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::ctx_from;
    use crate::chain::MemoryBtcBlockchain;
    use crate::constants::REGTEST;
    use crate::storage::MemoryBridgeStorage;
    use ethers_core::types::H160;
    use strum::IntoEnumIterator;

    fn with_kind(ctx: CallContext, kind: CallKind) -> CallContext {
        CallContext { kind, ..ctx }
    }

    #[test]
    fn test_method_names() {
        assert_eq!(
            "registerFlyoverBtcTransaction".parse::<BridgeMethod>().unwrap(),
            BridgeMethod::RegisterFlyoverBtcTransaction
        );
        let getters = BridgeMethod::iter()
            .filter(|method| !method.permissions().mutates_state)
            .count();
        assert_eq!(getters, 5);
        let kind: &'static str = CallKind::StaticCall.into();
        assert_eq!(kind, "staticCall");
    }

    #[test]
    fn test_disabled_method() {
        let mut constants = REGTEST.clone();
        constants.activations = constants
            .activations
            .with_rule(ConsensusRule::FlyoverDeposits, 100);
        let mut storage = MemoryBridgeStorage::new();
        let chain = MemoryBtcBlockchain::new();
        let mut bridge = Bridge::new(&constants, &mut storage, &chain);

        let call = BridgeCall::RegisterFlyoverBtcTransaction(crate::flyover::tests::deposit(
            &mut MemoryBtcBlockchain::new(),
            &constants,
            &[600_000],
            false,
        ));
        let ctx = ctx_from(H160::repeat_byte(1), 99);
        assert!(matches!(
            bridge.execute(&ctx, call),
            Err(Error::FunctionDisabled("registerFlyoverBtcTransaction"))
        ));
    }

    #[test]
    fn test_call_kinds() {
        let mut constants = REGTEST.clone();
        constants.activations = constants
            .activations
            .with_rule(ConsensusRule::StrictCallKind, 50);
        let mut storage = MemoryBridgeStorage::new();
        let chain = MemoryBtcBlockchain::new();
        let mut bridge = Bridge::new(&constants, &mut storage, &chain);
        let authorizer = constants.locking_cap_authorizer;
        let new_cap = constants.initial_locking_cap + 1;

        // delegate calls are accepted before the strict call kind rule
        let early = with_kind(ctx_from(authorizer, 10), CallKind::DelegateCall);
        assert_eq!(
            bridge
                .execute(&early, BridgeCall::IncreaseLockingCap { new_cap })
                .unwrap(),
            CallResult::Done
        );

        let late = with_kind(ctx_from(authorizer, 50), CallKind::DelegateCall);
        assert!(matches!(
            bridge.execute(&late, BridgeCall::IncreaseLockingCap { new_cap }),
            Err(Error::CallKindNotAllowed {
                method: "increaseLockingCap",
                kind: CallKind::DelegateCall
            })
        ));

        let read = with_kind(ctx_from(H160::zero(), 50), CallKind::StaticCall);
        assert_eq!(
            bridge.execute(&read, BridgeCall::GetLockingCap).unwrap(),
            CallResult::Amount(new_cap)
        );
        let internal = with_kind(ctx_from(H160::zero(), 1), CallKind::InternalCall);
        assert!(bridge.execute(&internal, BridgeCall::GetLockingCap).is_err());
    }

    #[test]
    fn test_membership() {
        let constants = REGTEST.clone();
        let mut storage = MemoryBridgeStorage::new();
        let chain = MemoryBtcBlockchain::new();
        let mut bridge = Bridge::new(&constants, &mut storage, &chain);

        let outsider = ctx_from(H160::repeat_byte(9), 5);
        assert!(matches!(
            bridge.execute(&outsider, BridgeCall::UpdateCollections),
            Err(Error::NotFederationMember(_))
        ));

        let member = constants.genesis_federation().unwrap().members()[0].sidechain_address();
        assert_eq!(
            bridge
                .execute(&ctx_from(member, 5), BridgeCall::UpdateCollections)
                .unwrap(),
            CallResult::Done
        );
        assert_eq!(
            bridge
                .execute(&outsider, BridgeCall::GetProposedFederationAddress)
                .unwrap(),
            CallResult::Address(None)
        );
    }
}
