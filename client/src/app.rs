//! Wires the components together and keeps them consistent with the wallet.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use ticket_api::contract::TicketingContractClient;
use ticket_api::{Address, EventId, EventRecord, Role, TicketId, Wei};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wallet::{ProviderNotification, RpcWallet, WalletProvider};

use crate::actions::WriteAction;
use crate::attachments::{AttachmentStore, HttpAttachmentStore, generate_ticket_attachments};
use crate::catalog::{CatalogLoad, EventCatalog};
use crate::config::Config;
use crate::error::{ClientError, Result};
use crate::gateway::{ConfirmationSettings, ContractGateway};
use crate::inventory::{PurchaseOrder, TicketInventory, TicketPage};
use crate::ledger::ContractLedger;
use crate::orchestrator::{PendingTransaction, TransactionOrchestrator};
use crate::roles::{Capability, RoleGate};
use crate::session::{SessionSnapshot, WalletSession};
use crate::validation::{TicketInput, ValidationFlow, ValidationOutcome};

#[derive(Debug, Clone, Copy)]
pub struct AppSettings {
    pub scan_ceiling: u64,
    pub page_size: u64,
    pub confirmations: ConfirmationSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        AppSettings {
            scan_ceiling: 20,
            page_size: 6,
            confirmations: ConfirmationSettings::default(),
        }
    }
}

impl From<&Config> for AppSettings {
    fn from(config: &Config) -> Self {
        AppSettings {
            scan_ceiling: config.catalog.scan_ceiling,
            page_size: config.inventory.page_size,
            confirmations: ConfirmationSettings {
                poll_interval: config.transactions.poll_interval(),
                timeout: config.transactions.confirmation_timeout(),
                ..ConfirmationSettings::default()
            },
        }
    }
}

pub struct TicketingApp {
    pub session: Arc<WalletSession>,
    pub gateway: Arc<ContractGateway>,
    pub catalog: Arc<EventCatalog>,
    pub inventory: Arc<TicketInventory>,
    pub roles: Arc<RoleGate>,
    pub orchestrator: Arc<TransactionOrchestrator>,
    pub validation: ValidationFlow,
    attachments: Option<Arc<dyn AttachmentStore>>,
}

impl TicketingApp {
    pub fn new(
        ledger: Arc<dyn ContractLedger>,
        wallet: Arc<dyn WalletProvider>,
        attachments: Option<Arc<dyn AttachmentStore>>,
        settings: AppSettings,
    ) -> Arc<Self> {
        let session = Arc::new(WalletSession::new(wallet.clone()));
        let gateway = Arc::new(ContractGateway::new(ledger, wallet));
        let catalog = Arc::new(EventCatalog::new(settings.scan_ceiling));
        let inventory = Arc::new(TicketInventory::new(settings.page_size));
        let roles = Arc::new(RoleGate::new());
        let orchestrator = Arc::new(TransactionOrchestrator::new(
            session.clone(),
            gateway.clone(),
            catalog.clone(),
            inventory.clone(),
            roles.clone(),
            settings.confirmations,
        ));
        Arc::new(TicketingApp {
            session,
            gateway,
            catalog,
            inventory,
            roles,
            validation: ValidationFlow::new(orchestrator.clone()),
            orchestrator,
            attachments,
        })
    }

    /// Builds the JSON-RPC backed app and starts the wallet watcher. Needs a
    /// running tokio runtime.
    pub fn from_config(config: &Config) -> anyhow::Result<Arc<Self>> {
        let contract = Address::parse(&config.ledger.contract_address)?;
        let ledger = Arc::new(TicketingContractClient::new(
            config.ledger.url.clone(),
            contract,
        ));
        let wallet_url = config
            .wallet
            .url
            .clone()
            .unwrap_or_else(|| config.ledger.url.clone());
        let wallet = Arc::new(RpcWallet::new(wallet_url));
        let _watcher = wallet.spawn_watcher(Duration::from_millis(config.wallet.notification_poll_ms));
        let attachments = config
            .attachments
            .as_ref()
            .map(|a| Arc::new(HttpAttachmentStore::new(&a.url)) as Arc<dyn AttachmentStore>);
        Ok(Self::new(ledger, wallet, attachments, AppSettings::from(config)))
    }

    /// Drops every per-account view.
    pub fn reset_caches(&self) {
        self.catalog.invalidate();
        self.inventory.invalidate();
        self.roles.reset();
    }

    /// Caches go first, so nobody sees the new account next to old data.
    pub fn handle_notification(&self, notification: &ProviderNotification) -> SessionSnapshot {
        debug!("Provider notification: {:?}", notification);
        self.reset_caches();
        self.session.apply(notification)
    }

    /// Follows provider notifications for as long as the app lives.
    pub fn spawn_notification_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.session.provider().subscribe();
        let app: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let received = rx.recv().await;
                let Some(app) = app.upgrade() else {
                    break;
                };
                match received {
                    Ok(notification) => {
                        app.handle_notification(&notification);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} provider notifications; rebuilding session", missed);
                        app.reset_caches();
                        app.session.disconnect();
                        if let Err(e) = app.session.restore().await {
                            error!("Session restore after missed notifications failed: {}", e);
                        }
                    }
                    Err(RecvError::Closed) => {
                        info!("Provider notifications closed");
                        break;
                    }
                }
            }
        })
    }

    pub async fn connect(&self) -> Result<SessionSnapshot> {
        self.session.connect().await
    }

    pub async fn restore(&self) -> Result<Option<SessionSnapshot>> {
        self.session.restore().await
    }

    fn current_address(&self) -> Result<Address> {
        self.session.address().ok_or(ClientError::NotConnected)
    }

    pub async fn load_events(&self) -> CatalogLoad {
        self.catalog.load(&self.gateway).await
    }

    pub async fn my_tickets(&self, page: u64) -> Result<TicketPage> {
        let owner = self.current_address()?;
        self.inventory
            .fetch_page(&self.gateway, &owner, page, self.inventory.page_size())
            .await
    }

    /// Capabilities of `account`, or of the connected account when `None`.
    pub async fn capabilities(&self, account: Option<&Address>) -> Result<BTreeSet<Capability>> {
        let account = match account {
            Some(a) => a.clone(),
            None => self.current_address()?,
        };
        self.roles.capabilities(&self.gateway, &account).await
    }

    async fn event_on_sale(&self, event_id: EventId) -> Result<EventRecord> {
        let event = match self.catalog.get(event_id) {
            Some(event) => event,
            None => self.gateway.get_event(event_id).await?,
        };
        if !event.exists() {
            return Err(ClientError::InvalidInput(format!("event #{} does not exist", event_id)));
        }
        if !event.is_active {
            return Err(ClientError::InvalidInput(format!("event #{} is not on sale", event_id)));
        }
        Ok(event)
    }

    fn attachment_store(&self) -> Result<&dyn AttachmentStore> {
        self.attachments
            .as_deref()
            .ok_or_else(|| ClientError::Attachment("no attachment store configured".to_string()))
    }

    async fn run(&self, action: WriteAction) -> Result<PendingTransaction> {
        self.orchestrator.execute(action).await?.into_result()
    }

    /// Buys `quantity` tickets at the event's current price.
    pub async fn buy_tickets(&self, event_id: EventId, quantity: u64) -> Result<PendingTransaction> {
        self.session.signer()?;
        let event = self.event_on_sale(event_id).await?;
        let attachments =
            generate_ticket_attachments(self.attachment_store()?, event_id, quantity).await?;
        let order = PurchaseOrder::new(&event, quantity, attachments)?;
        info!(
            "Buying {} ticket(s) for '{}' at {} wei total",
            order.quantity(),
            event.name,
            order.total_price()
        );
        self.run(WriteAction::buy(order)).await
    }

    pub async fn transfer_ticket(&self, ticket_id: TicketId, to: &str) -> Result<PendingTransaction> {
        self.run(WriteAction::transfer(ticket_id, to)?).await
    }

    pub async fn refund_ticket(&self, ticket_id: TicketId) -> Result<PendingTransaction> {
        self.run(WriteAction::refund(ticket_id)?).await
    }

    pub async fn validate(&self, input: TicketInput) -> ValidationOutcome {
        self.validation.validate(input).await
    }

    pub async fn create_event(&self, name: &str, price: Wei) -> Result<PendingTransaction> {
        self.run(WriteAction::create_event(name, price)?).await
    }

    pub async fn toggle_event(&self, event_id: EventId) -> Result<PendingTransaction> {
        self.run(WriteAction::toggle_event_status(event_id)?).await
    }

    /// Issues one ticket to `to`, attaching `value` as the recorded price.
    pub async fn admin_mint(&self, to: &str, event_id: EventId, value: Wei) -> Result<PendingTransaction> {
        self.session.signer()?;
        let mut attachments =
            generate_ticket_attachments(self.attachment_store()?, event_id, 1).await?;
        let attachment = attachments
            .pop()
            .ok_or_else(|| ClientError::Attachment("no identifier returned".to_string()))?;
        self.run(WriteAction::admin_mint(to, event_id, attachment, value)?)
            .await
    }

    pub async fn grant_role(&self, role: Role, account: &str) -> Result<PendingTransaction> {
        self.run(WriteAction::grant_role(role, account)?).await
    }

    pub async fn revoke_role(&self, role: Role, account: &str) -> Result<PendingTransaction> {
        self.run(WriteAction::revoke_role(role, account)?).await
    }

    pub async fn withdraw_funds(&self) -> Result<PendingTransaction> {
        self.run(WriteAction::WithdrawFunds).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{FakeLedger, MemoryAttachmentStore, alice, bob, fast_confirmations};
    use ticket_api::NetworkId;

    fn app(fake: &Arc<FakeLedger>, store: Option<Arc<MemoryAttachmentStore>>) -> Arc<TicketingApp> {
        let settings = AppSettings {
            confirmations: fast_confirmations(),
            ..AppSettings::default()
        };
        TicketingApp::new(
            fake.clone(),
            fake.clone(),
            store.map(|s| s as Arc<dyn AttachmentStore>),
            settings,
        )
    }

    #[tokio::test]
    async fn batch_purchase_uploads_one_attachment_per_ticket() {
        let fake = FakeLedger::new();
        fake.set_accounts(vec![alice()]);
        fake.add_event("Opening Night", Wei::new(250), true);
        let store = Arc::new(MemoryAttachmentStore::default());
        let app = app(&fake, Some(store.clone()));
        app.connect().await.unwrap();

        let tx = app.buy_tickets(1, 4).await.unwrap();
        assert!(tx.is_confirmed());
        assert_eq!(store.len(), 4);
        assert_eq!(fake.balance(), Wei::new(1000));
        assert_eq!(app.my_tickets(0).await.unwrap().tickets.len(), 4);
    }

    #[tokio::test]
    async fn purchases_need_an_event_on_sale_and_a_store() {
        let fake = FakeLedger::new();
        fake.set_accounts(vec![alice()]);
        fake.add_event("Paused", Wei::new(1), false);
        let app_without_store = app(&fake, None);
        app_without_store.connect().await.unwrap();
        assert!(matches!(
            app_without_store.buy_tickets(1, 1).await,
            Err(ClientError::InvalidInput(_))
        ));

        fake.add_event("Open", Wei::new(1), true);
        assert!(matches!(
            app_without_store.buy_tickets(2, 1).await,
            Err(ClientError::Attachment(_))
        ));
        assert!(matches!(
            app_without_store.buy_tickets(9, 1).await,
            Err(ClientError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn network_switch_resets_every_cache() {
        let fake = FakeLedger::new();
        fake.set_accounts(vec![alice()]);
        fake.add_event("Opening Night", Wei::new(1), true);
        fake.mint_to(&alice(), 1, Wei::new(1));
        let app = app(&fake, None);
        app.connect().await.unwrap();
        app.load_events().await;
        app.my_tickets(0).await.unwrap();
        app.capabilities(None).await.unwrap();

        let snapshot = app.handle_notification(&ProviderNotification::ChainChanged(NetworkId(1)));
        assert_eq!(snapshot.network, Some(NetworkId(1)));
        assert_eq!(snapshot.address, Some(alice()));
        assert!(!app.catalog.is_loaded());
        assert!(app.inventory.current().is_none());
        assert_eq!(app.roles.cached_membership(Role::Organizer, &alice()), None);
    }

    #[tokio::test]
    async fn listener_follows_the_provider() {
        let fake = FakeLedger::new();
        fake.set_accounts(vec![alice()]);
        let app = app(&fake, None);
        app.connect().await.unwrap();
        let mut snapshots = app.session.subscribe();
        let listener = app.spawn_notification_listener();

        fake.emit(ProviderNotification::AccountsChanged(vec![bob()]));
        snapshots
            .wait_for(|s| s.address.as_ref() == Some(&bob()))
            .await
            .unwrap();
        listener.abort();
    }

    #[tokio::test]
    async fn admin_mint_to_someone_else() {
        let fake = FakeLedger::new();
        fake.set_accounts(vec![alice()]);
        fake.add_event("Opening Night", Wei::new(1), true);
        fake.add_role_member(Role::Organizer, alice());
        let app = app(&fake, Some(Arc::new(MemoryAttachmentStore::default())));
        app.connect().await.unwrap();

        app.admin_mint(bob().as_str(), 1, Wei::ZERO).await.unwrap();
        let (owner, ticket) = fake.ticket(1).unwrap();
        assert_eq!(owner, bob());
        assert_eq!(ticket.purchase_price, Wei::ZERO);
    }
}
