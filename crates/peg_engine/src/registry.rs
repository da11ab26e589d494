use crate::constants::BridgeConstants;
use crate::federation::{Federation, FederationRole};
use crate::storage::{BridgeStorage, FederationUtxo};
use crate::Result;
use bitcoin::{Script, ScriptBuf};

/// Read-only view over the federations known to the bridge.
pub struct FederationRegistry<'a, S: ?Sized> {
    storage: &'a S,
    constants: &'a BridgeConstants,
}

impl<'a, S: BridgeStorage + ?Sized> FederationRegistry<'a, S> {
    pub fn new(storage: &'a S, constants: &'a BridgeConstants) -> Self {
        Self { storage, constants }
    }

    /// Falls back to the genesis federation until the first federation change.
    pub fn active_federation(&self) -> Result<Federation> {
        match self.storage.active_federation()? {
            Some(federation) => Ok(federation),
            None => self.constants.genesis_federation(),
        }
    }

    pub fn retiring_federation(&self) -> Result<Option<Federation>> {
        self.storage.retiring_federation()
    }

    pub fn proposed_federation(&self) -> Result<Option<Federation>> {
        self.storage.proposed_federation()
    }

    pub fn last_retired_federation_script(&self) -> Result<Option<ScriptBuf>> {
        self.storage.last_retired_federation_script()
    }

    pub fn federation(&self, role: FederationRole) -> Result<Option<Federation>> {
        match role {
            FederationRole::Active => self.active_federation().map(Some),
            FederationRole::Retiring => self.retiring_federation(),
            FederationRole::Proposed => self.proposed_federation(),
        }
    }

    pub fn utxos(&self, role: FederationRole) -> Result<Vec<FederationUtxo>> {
        match role {
            FederationRole::Active => self.storage.active_federation_utxos(),
            FederationRole::Retiring => self.storage.retiring_federation_utxos(),
            FederationRole::Proposed => Ok(vec![]),
        }
    }

    /// Active or retiring federation that can spend with `redeem_script`.
    pub fn spending_federation(
        &self,
        redeem_script: &Script,
    ) -> Result<Option<(FederationRole, Federation)>> {
        for role in [FederationRole::Active, FederationRole::Retiring] {
            if let Some(federation) = self.federation(role)? {
                if federation.owns_redeem_script(redeem_script) {
                    return Ok(Some((role, federation)));
                }
            }
        }
        Ok(None)
    }

    /// Whether the sidechain address belongs to a member of the active or retiring federation.
    pub fn is_federation_member(&self, address: &ethers_core::types::H160) -> Result<bool> {
        for role in [FederationRole::Active, FederationRole::Retiring] {
            if let Some(federation) = self.federation(role)? {
                if federation.member_by_sidechain_address(address).is_some() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}
