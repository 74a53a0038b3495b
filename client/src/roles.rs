//! Role membership and the capabilities it grants.
//!
//! Role identifiers are contract constants and are read once. Membership is
//! cached per (role, identity) until a role change or a session reset.

use futures_util::future::try_join;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use ticket_api::{Address, Role, RoleId};
use tracing::debug;

use crate::error::Result;
use crate::gateway::ContractGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    CreateEvents,
    ToggleEvents,
    MintTickets,
    ManageRoles,
    WithdrawFunds,
    ValidateEntry,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::CreateEvents,
        Capability::ToggleEvents,
        Capability::MintTickets,
        Capability::ManageRoles,
        Capability::WithdrawFunds,
        Capability::ValidateEntry,
    ];

    pub fn required_role(self) -> Role {
        match self {
            Capability::ValidateEntry => Role::Validator,
            _ => Role::Organizer,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::CreateEvents => "create events",
            Capability::ToggleEvents => "pause and resume events",
            Capability::MintTickets => "issue tickets",
            Capability::ManageRoles => "manage roles",
            Capability::WithdrawFunds => "withdraw funds",
            Capability::ValidateEntry => "validate entry",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct RoleState {
    ids: HashMap<Role, RoleId>,
    membership: HashMap<(Role, Address), bool>,
    generation: u64,
}

#[derive(Default)]
pub struct RoleGate {
    state: Mutex<RoleState>,
}

impl RoleGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RoleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn role_id(&self, gateway: &ContractGateway, role: Role) -> Result<RoleId> {
        if let Some(id) = self.lock().ids.get(&role) {
            return Ok(id.clone());
        }
        let id = gateway.get_role(role).await?;
        debug!("Resolved {} to {}", role.getter(), id);
        self.lock().ids.insert(role, id.clone());
        Ok(id)
    }

    /// `false` for non-members; errors only when the ledger cannot be read.
    pub async fn has_role(&self, gateway: &ContractGateway, role: Role, identity: &Address) -> Result<bool> {
        let (cached, generation) = {
            let state = self.lock();
            (
                state.membership.get(&(role, identity.clone())).copied(),
                state.generation,
            )
        };
        if let Some(member) = cached {
            return Ok(member);
        }
        let id = self.role_id(gateway, role).await?;
        let member = gateway.has_role(&id, identity).await?;
        debug!("{} has {} role: {}", identity.short(), role, member);
        let mut state = self.lock();
        if state.generation == generation {
            state.membership.insert((role, identity.clone()), member);
        }
        Ok(member)
    }

    pub async fn has_capability(
        &self,
        gateway: &ContractGateway,
        identity: &Address,
        capability: Capability,
    ) -> Result<bool> {
        self.has_role(gateway, capability.required_role(), identity)
            .await
    }

    pub async fn capabilities(&self, gateway: &ContractGateway, identity: &Address) -> Result<BTreeSet<Capability>> {
        let (organizer, validator) = try_join(
            self.has_role(gateway, Role::Organizer, identity),
            self.has_role(gateway, Role::Validator, identity),
        )
        .await?;
        Ok(Capability::ALL
            .into_iter()
            .filter(|c| match c.required_role() {
                Role::Organizer => organizer,
                Role::Validator => validator,
            })
            .collect())
    }

    pub fn cached_membership(&self, role: Role, identity: &Address) -> Option<bool> {
        self.lock().membership.get(&(role, identity.clone())).copied()
    }

    pub fn invalidate_membership(&self) {
        let mut state = self.lock();
        state.membership.clear();
        state.generation += 1;
    }

    /// Forgets role identifiers too, for when the network changed.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.ids.clear();
        state.membership.clear();
        state.generation += 1;
    }
}
