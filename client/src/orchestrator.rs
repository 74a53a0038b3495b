//! Drives every write from signature request to a terminal state.
//!
//! Lifecycle per action: `Idle -> AwaitingSignature -> Submitted ->
//! Confirmed | Failed`. Each run happens in its own task, so a caller that
//! stops waiting does not stop the transaction, its refresh, or the release of
//! its action key.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use ticket_api::TxHash;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::actions::{ActionKey, CacheKind, WriteAction};
use crate::catalog::EventCatalog;
use crate::error::{ClientError, Result};
use crate::gateway::{ConfirmationSettings, ContractGateway, TransactionHandle};
use crate::inventory::TicketInventory;
use crate::roles::RoleGate;
use crate::session::{Signer, WalletSession};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    AwaitingSignature,
    Submitted,
    Confirmed,
    Failed,
}

impl TxState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxState::Confirmed | TxState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingTransaction {
    pub key: ActionKey,
    pub action: WriteAction,
    pub state: TxState,
    pub hash: Option<TxHash>,
    pub error: Option<ClientError>,
    /// Set when the action was confirmed but re-reading an affected cache failed.
    pub refresh_error: Option<ClientError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingTransaction {
    fn new(action: WriteAction) -> Self {
        let now = Utc::now();
        PendingTransaction {
            key: action.key(),
            action,
            state: TxState::Idle,
            hash: None,
            error: None,
            refresh_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == TxState::Confirmed
    }

    /// Confirmed runs pass through; failed runs become their error.
    pub fn into_result(self) -> Result<PendingTransaction> {
        match (&self.state, &self.error) {
            (TxState::Failed, Some(e)) => Err(e.clone()),
            (TxState::Failed, None) => Err(ClientError::reverted(None)),
            _ => Ok(self),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxUpdate {
    pub key: ActionKey,
    pub state: TxState,
    pub hash: Option<TxHash>,
}

#[derive(Default)]
struct Registry {
    records: HashMap<ActionKey, PendingTransaction>,
    in_flight: HashSet<ActionKey>,
}

/// Holds an action key for the lifetime of one run.
struct InFlightGuard {
    orchestrator: Arc<TransactionOrchestrator>,
    key: ActionKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.orchestrator.lock().in_flight.remove(&self.key);
        debug!("Released {}", self.key);
    }
}

pub struct TransactionOrchestrator {
    session: Arc<WalletSession>,
    gateway: Arc<ContractGateway>,
    catalog: Arc<EventCatalog>,
    inventory: Arc<TicketInventory>,
    roles: Arc<RoleGate>,
    settings: ConfirmationSettings,
    registry: Mutex<Registry>,
    updates: broadcast::Sender<TxUpdate>,
}

impl TransactionOrchestrator {
    pub fn new(
        session: Arc<WalletSession>,
        gateway: Arc<ContractGateway>,
        catalog: Arc<EventCatalog>,
        inventory: Arc<TicketInventory>,
        roles: Arc<RoleGate>,
        settings: ConfirmationSettings,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        TransactionOrchestrator {
            session,
            gateway,
            catalog,
            inventory,
            roles,
            settings,
            registry: Mutex::new(Registry::default()),
            updates,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TxUpdate> {
        self.updates.subscribe()
    }

    /// Latest record for `key`, terminal ones included. `None` means idle.
    pub fn status(&self, key: &ActionKey) -> Option<PendingTransaction> {
        self.lock().records.get(key).cloned()
    }

    pub fn is_in_flight(&self, key: &ActionKey) -> bool {
        self.lock().in_flight.contains(key)
    }

    /// Runs `action` to a terminal state. `Err` only when the run could not
    /// start: no session, or the same action is already running.
    pub async fn execute(self: &Arc<Self>, action: WriteAction) -> Result<PendingTransaction> {
        let key = action.key();
        let task = self.submit(action)?;
        task.await.map_err(|e| {
            error!("Transaction task for {} ended abnormally: {}", key, e);
            ClientError::ReadFailed(format!("{} did not finish: {}", key, e))
        })
    }

    /// Claims the action key and starts the run in the background.
    pub fn submit(self: &Arc<Self>, action: WriteAction) -> Result<JoinHandle<PendingTransaction>> {
        let signer = self.session.signer()?;
        let (tx, guard) = self.claim(action)?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let outcome = this.run(&signer, tx).await;
            drop(guard);
            outcome
        }))
    }

    fn claim(self: &Arc<Self>, action: WriteAction) -> Result<(PendingTransaction, InFlightGuard)> {
        let tx = PendingTransaction::new(action);
        {
            let mut registry = self.lock();
            if !registry.in_flight.insert(tx.key.clone()) {
                warn!("Rejected {}: already in progress", tx.key);
                return Err(ClientError::AlreadyInFlight(tx.key.to_string()));
            }
            registry.records.insert(tx.key.clone(), tx.clone());
        }
        self.publish(&tx);
        let guard = InFlightGuard {
            orchestrator: Arc::clone(self),
            key: tx.key.clone(),
        };
        Ok((tx, guard))
    }

    async fn run(&self, signer: &Signer, mut tx: PendingTransaction) -> PendingTransaction {
        info!("Starting {}", tx.action.description());
        self.transition(&mut tx, TxState::AwaitingSignature);

        let handle = match self.dispatch(signer, &tx.action).await {
            Ok(handle) => handle,
            Err(e) => return self.fail(tx, e),
        };
        tx.hash = Some(handle.hash.clone());
        self.transition(&mut tx, TxState::Submitted);

        if let Err(e) = self
            .gateway
            .wait_for_confirmation(&handle, self.settings)
            .await
        {
            return self.fail(tx, e);
        }
        self.transition(&mut tx, TxState::Confirmed);
        info!("Confirmed: {}", tx.action.description());

        if !self.session.is_current(signer) {
            debug!("Session changed during {}; caches were already reset", tx.key);
            return tx;
        }
        if let Some(e) = self.refresh(signer, &tx.action).await {
            tx.refresh_error = Some(e);
            self.store(&tx);
        }
        tx
    }

    async fn dispatch(&self, signer: &Signer, action: &WriteAction) -> Result<TransactionHandle> {
        let gateway = &self.gateway;
        match action {
            WriteAction::CreateEvent { name, price } => {
                gateway.create_event(signer, name, *price).await
            }
            WriteAction::ToggleEventStatus { event_id } => {
                gateway.toggle_event_status(signer, *event_id).await
            }
            WriteAction::BuyTickets(order) if order.is_batch() => {
                gateway
                    .batch_buy_tickets(
                        signer,
                        order.event_id(),
                        order.attachments(),
                        order.total_price(),
                    )
                    .await
            }
            WriteAction::BuyTickets(order) => {
                let attachment = order.attachments().first().ok_or_else(|| {
                    ClientError::InvalidInput("purchase has no attachment".to_string())
                })?;
                gateway
                    .buy_ticket(signer, order.event_id(), attachment, order.total_price())
                    .await
            }
            WriteAction::TransferTicket { ticket_id, to } => {
                gateway.transfer_ticket(signer, *ticket_id, to).await
            }
            WriteAction::RefundTicket { ticket_id } => {
                gateway.refund_ticket(signer, *ticket_id).await
            }
            WriteAction::ValidateEntry { ticket_id } => {
                gateway.validate_entry(signer, *ticket_id).await
            }
            WriteAction::AdminMint {
                to,
                event_id,
                attachment,
                value,
            } => {
                gateway
                    .admin_mint(signer, to, *event_id, attachment, *value)
                    .await
            }
            WriteAction::GrantRole { role, account } => {
                let role_id = self.roles.role_id(gateway, *role).await?;
                gateway.grant_role(signer, &role_id, account).await
            }
            WriteAction::RevokeRole { role, account } => {
                let role_id = self.roles.role_id(gateway, *role).await?;
                gateway.revoke_role(signer, &role_id, account).await
            }
            WriteAction::WithdrawFunds => gateway.withdraw_funds(signer).await,
        }
    }

    /// Re-reads the caches `action` may have made stale. Returns the first
    /// failure; the others are logged.
    async fn refresh(&self, signer: &Signer, action: &WriteAction) -> Option<ClientError> {
        let mut first_error = None;
        for cache in action.affected_caches(signer.address()) {
            debug!("Refreshing {:?} after {}", cache, action.key());
            let result = match cache {
                CacheKind::Catalog => match self.catalog.load(&self.gateway).await.error {
                    Some(e) => Err(e),
                    None => Ok(()),
                },
                CacheKind::Inventory => self
                    .inventory
                    .refresh(&self.gateway, signer.address())
                    .await
                    .map(|_| ()),
                CacheKind::Roles => {
                    self.roles.invalidate_membership();
                    match action {
                        WriteAction::GrantRole { role, account }
                        | WriteAction::RevokeRole { role, account } => self
                            .roles
                            .has_role(&self.gateway, *role, account)
                            .await
                            .map(|_| ()),
                        _ => Ok(()),
                    }
                }
            };
            if let Err(e) = result {
                warn!("Refresh of {:?} after {} failed: {}", cache, action.key(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error
    }

    fn fail(&self, mut tx: PendingTransaction, e: ClientError) -> PendingTransaction {
        error!("{} failed: {}", tx.key, e);
        tx.error = Some(e);
        self.transition(&mut tx, TxState::Failed);
        tx
    }

    fn transition(&self, tx: &mut PendingTransaction, state: TxState) {
        debug!("{}: {:?} -> {:?}", tx.key, tx.state, state);
        tx.state = state;
        tx.updated_at = Utc::now();
        self.store(tx);
        self.publish(tx);
    }

    fn store(&self, tx: &PendingTransaction) {
        self.lock().records.insert(tx.key.clone(), tx.clone());
    }

    fn publish(&self, tx: &PendingTransaction) {
        // No subscribers is fine.
        let _ = self.updates.send(TxUpdate {
            key: tx.key.clone(),
            state: tx.state,
            hash: tx.hash.clone(),
        });
    }
}
