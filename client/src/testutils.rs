//! In-memory stand-ins for the ticketing contract, the wallet provider and the
//! attachment store. One `FakeLedger` plays both the read connection and the
//! signing wallet, so a write sent through it is visible to the next read.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use ticket_api::{
    Address, EventId, EventRecord, NetworkId, Receipt, Role, RoleId, TicketId, TicketRecord,
    TicketState, TransactionRequest, TxHash, Wei,
};
use tokio::sync::{broadcast, watch};
use wallet::{ProviderNotification, WalletError, WalletProvider};

use crate::attachments::AttachmentStore;
use crate::error::{ClientError, Result};
use crate::gateway::ConfirmationSettings;
use crate::ledger::ContractLedger;

pub const TEST_NETWORK: NetworkId = NetworkId(31337);

pub fn alice() -> Address {
    Address::parse("0x70997970c51812dc3a010c7d01b50e0d17dc79c8").expect("valid address")
}

pub fn bob() -> Address {
    Address::parse("0x3c44cdddb6a900fa2b585dd299e03d12fa4293bc").expect("valid address")
}

pub fn carol() -> Address {
    Address::parse("0x90f79bf6eb2c4f870365e785982e1f101e93b906").expect("valid address")
}

pub fn contract_address() -> Address {
    Address::parse("0x5fbdb2315678afecb367f032d93f642f64180aa3").expect("valid address")
}

pub fn fast_confirmations() -> ConfirmationSettings {
    ConfirmationSettings {
        poll_interval: Duration::from_millis(2),
        timeout: Duration::from_secs(5),
        max_poll_failures: 3,
    }
}

pub fn role_id_of(role: Role) -> RoleId {
    match role {
        Role::Organizer => RoleId(format!("0x{}", "a1".repeat(32))),
        Role::Validator => RoleId(format!("0x{}", "b2".repeat(32))),
    }
}

fn role_of(id: &str) -> Option<Role> {
    Role::ALL.into_iter().find(|r| role_id_of(*r).0 == id)
}

#[derive(Debug, Clone)]
struct StoredTicket {
    owner: Address,
    record: TicketRecord,
}

#[derive(Default)]
struct FakeState {
    // wallet side
    grantable: Vec<Address>,
    authorized: Vec<Address>,
    network: Option<NetworkId>,
    unavailable: bool,
    reject_connect: bool,
    reject_signatures: bool,
    // contract side
    events: Vec<EventRecord>,
    tickets: Vec<StoredTicket>,
    members: HashSet<(Role, Address)>,
    balance: u128,
    receipts: HashMap<TxHash, Receipt>,
    tx_count: u64,
    block: u64,
    // read behaviour
    hold_receipts: bool,
    fail_receipts: bool,
    fail_events: bool,
    failing_event_ids: HashSet<EventId>,
    fail_tickets: bool,
    fail_roles: bool,
    event_reads: usize,
    role_id_reads: usize,
    stall_next_event_read: bool,
    stall_next_ticket_read: bool,
    stalled_reads: usize,
}

pub struct FakeLedger {
    contract: Address,
    state: Mutex<FakeState>,
    notifications: broadcast::Sender<ProviderNotification>,
    signatures_held: watch::Sender<bool>,
    ticket_reads_held: watch::Sender<bool>,
    stalled_reads_held: watch::Sender<bool>,
}

type Execution = std::result::Result<(), String>;

impl FakeLedger {
    pub fn new() -> Arc<Self> {
        let (notifications, _) = broadcast::channel(16);
        let (signatures_held, _) = watch::channel(false);
        let (ticket_reads_held, _) = watch::channel(false);
        let (stalled_reads_held, _) = watch::channel(false);
        let state = FakeState {
            network: Some(TEST_NETWORK),
            ..FakeState::default()
        };
        Arc::new(FakeLedger {
            contract: contract_address(),
            state: Mutex::new(state),
            notifications,
            signatures_held,
            ticket_reads_held,
            stalled_reads_held,
        })
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accounts the wallet hands out when the user approves a connect.
    pub fn set_accounts(&self, accounts: Vec<Address>) {
        self.lock().grantable = accounts;
    }

    /// Accounts that are authorized already, as after an earlier visit.
    pub fn authorize(&self, accounts: Vec<Address>) {
        let mut state = self.lock();
        state.grantable = accounts.clone();
        state.authorized = accounts;
    }

    pub fn reject_connect(&self, reject: bool) {
        self.lock().reject_connect = reject;
    }

    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    pub fn reject_signatures(&self, reject: bool) {
        self.lock().reject_signatures = reject;
    }

    /// Keeps signature requests waiting, as when the wallet prompt is open.
    pub fn hold_signatures(&self, hold: bool) {
        self.signatures_held.send_replace(hold);
    }

    /// Submitted transactions stay pending while held.
    pub fn hold_receipts(&self, hold: bool) {
        self.lock().hold_receipts = hold;
    }

    pub fn fail_receipt_reads(&self, fail: bool) {
        self.lock().fail_receipts = fail;
    }

    pub fn fail_event_reads(&self, fail: bool) {
        self.lock().fail_events = fail;
    }

    pub fn fail_event_read(&self, id: EventId) {
        self.lock().failing_event_ids.insert(id);
    }

    pub fn fail_ticket_reads(&self, fail: bool) {
        self.lock().fail_tickets = fail;
    }

    pub fn block_ticket_reads(&self) {
        self.ticket_reads_held.send_replace(true);
    }

    pub fn unblock_ticket_reads(&self) {
        self.ticket_reads_held.send_replace(false);
    }

    /// The next event read takes its snapshot, then waits for
    /// `release_stalled_reads` before returning it.
    pub fn stall_next_event_read(&self) {
        self.stalled_reads_held.send_replace(true);
        self.lock().stall_next_event_read = true;
    }

    /// Like `stall_next_event_read`, for the next ticket page read.
    pub fn stall_next_ticket_read(&self) {
        self.stalled_reads_held.send_replace(true);
        self.lock().stall_next_ticket_read = true;
    }

    /// Reads that have taken their snapshot and are waiting to return it.
    pub fn stalled_reads(&self) -> usize {
        self.lock().stalled_reads
    }

    pub fn release_stalled_reads(&self) {
        self.stalled_reads_held.send_replace(false);
    }

    async fn stall(&self) {
        let mut held = self.stalled_reads_held.subscribe();
        self.lock().stalled_reads += 1;
        // Sender lives as long as self.
        let _ = held.wait_for(|held| !*held).await;
    }

    pub fn fail_role_reads(&self, fail: bool) {
        self.lock().fail_roles = fail;
    }

    pub fn event_reads(&self) -> usize {
        self.lock().event_reads
    }

    pub fn role_id_reads(&self) -> usize {
        self.lock().role_id_reads
    }

    pub fn add_event(&self, name: &str, price: Wei, active: bool) -> EventId {
        let mut state = self.lock();
        let id = state.events.len() as EventId + 1;
        state.events.push(EventRecord {
            id,
            name: name.to_string(),
            ticket_price: price,
            is_active: active,
        });
        id
    }

    /// The stored record, or a zeroed one for unknown ids.
    pub fn event_record(&self, id: EventId) -> EventRecord {
        lookup_event(&self.lock(), id)
    }

    pub fn set_event_active(&self, id: EventId, active: bool) {
        if let Some(event) = self.lock().events.iter_mut().find(|e| e.id == id) {
            event.is_active = active;
        }
    }

    pub fn add_role_member(&self, role: Role, account: Address) {
        self.lock().members.insert((role, account));
    }

    pub fn mint_to(&self, owner: &Address, event_id: EventId, price: Wei) -> TicketId {
        mint(&mut self.lock(), owner, event_id, price)
    }

    pub fn put_ticket(&self, owner: &Address, record: TicketRecord) {
        let mut state = self.lock();
        state.tickets.retain(|t| t.record.id != record.id);
        state.tickets.push(StoredTicket {
            owner: owner.clone(),
            record,
        });
        state.tickets.sort_by_key(|t| t.record.id);
    }

    pub fn set_ticket_state(&self, id: TicketId, ticket_state: TicketState) {
        if let Some(t) = self.lock().tickets.iter_mut().find(|t| t.record.id == id) {
            t.record.state = ticket_state;
        }
    }

    pub fn ticket(&self, id: TicketId) -> Option<(Address, TicketRecord)> {
        self.lock()
            .tickets
            .iter()
            .find(|t| t.record.id == id)
            .map(|t| (t.owner.clone(), t.record.clone()))
    }

    pub fn balance(&self) -> Wei {
        Wei::new(self.lock().balance)
    }

    /// Simulates an account or network switch made in the wallet.
    pub fn emit(&self, notification: ProviderNotification) {
        {
            let mut state = self.lock();
            match &notification {
                ProviderNotification::AccountsChanged(accounts) => {
                    state.authorized = accounts.clone();
                    state.grantable = accounts.clone();
                }
                ProviderNotification::ChainChanged(network) => state.network = Some(*network),
            }
        }
        let _ = self.notifications.send(notification);
    }

    fn wallet_check(&self) -> std::result::Result<(), WalletError> {
        if self.lock().unavailable {
            Err(WalletError::Unavailable("no wallet provider".to_string()))
        } else {
            Ok(())
        }
    }
}

fn lookup_event(state: &FakeState, id: EventId) -> EventRecord {
    state
        .events
        .iter()
        .find(|e| e.id == id)
        .cloned()
        .unwrap_or(EventRecord {
            id: 0,
            name: String::new(),
            ticket_price: Wei::ZERO,
            is_active: false,
        })
}

fn mint(state: &mut FakeState, owner: &Address, event_id: EventId, price: Wei) -> TicketId {
    let id = state.tickets.iter().map(|t| t.record.id).max().unwrap_or(0) + 1;
    state.tickets.push(StoredTicket {
        owner: owner.clone(),
        record: TicketRecord {
            id,
            event_id,
            state: TicketState::Valid,
            purchase_price: price,
        },
    });
    id
}

fn arg<'a>(args: &'a [Value], i: usize) -> std::result::Result<&'a Value, String> {
    args.get(i).ok_or_else(|| format!("missing argument {}", i))
}

fn arg_u64(args: &[Value], i: usize) -> std::result::Result<u64, String> {
    let v = arg(args, i)?;
    v.as_u64()
        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| format!("argument {} is not an integer", i))
}

fn arg_str(args: &[Value], i: usize) -> std::result::Result<String, String> {
    arg(args, i)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| format!("argument {} is not a string", i))
}

fn arg_address(args: &[Value], i: usize) -> std::result::Result<Address, String> {
    Address::parse(&arg_str(args, i)?).map_err(|e| e.to_string())
}

fn arg_wei(args: &[Value], i: usize) -> std::result::Result<Wei, String> {
    arg_str(args, i)?.parse().map_err(|_| format!("argument {} is not an amount", i))
}

fn require_role(state: &FakeState, role: Role, who: &Address) -> Execution {
    if state.members.contains(&(role, who.clone())) {
        Ok(())
    } else {
        Err(format!(
            "AccessControl: account {} is missing role {}",
            who,
            role.getter()
        ))
    }
}

fn owned_ticket<'a>(
    state: &'a mut FakeState,
    id: TicketId,
    who: &Address,
) -> std::result::Result<&'a mut StoredTicket, String> {
    let ticket = state
        .tickets
        .iter_mut()
        .find(|t| t.record.id == id)
        .ok_or_else(|| "Ticket not found".to_string())?;
    if &ticket.owner != who {
        return Err("Not the ticket owner".to_string());
    }
    if !ticket.record.state.is_valid() {
        return Err("Ticket not valid".to_string());
    }
    Ok(ticket)
}

/// Applies one contract call the way the deployed contract would.
fn execute(state: &mut FakeState, tx: &TransactionRequest) -> Execution {
    let args = &tx.call.args;
    let from = &tx.from;
    match tx.call.function.as_str() {
        "createEvent" => {
            require_role(state, Role::Organizer, from)?;
            let name = arg_str(args, 0)?;
            let price = arg_wei(args, 1)?;
            let id = state.events.len() as EventId + 1;
            state.events.push(EventRecord {
                id,
                name,
                ticket_price: price,
                is_active: true,
            });
            Ok(())
        }
        "toggleEventStatus" => {
            require_role(state, Role::Organizer, from)?;
            let id = arg_u64(args, 0)?;
            let event = state
                .events
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| "Event does not exist".to_string())?;
            event.is_active = !event.is_active;
            Ok(())
        }
        "buyTicket" | "batchBuyTickets" => {
            let event_id = arg_u64(args, 0)?;
            let quantity = if tx.call.function == "buyTicket" {
                arg_str(args, 1)?;
                1
            } else {
                let cids = arg(args, 1)?
                    .as_array()
                    .ok_or_else(|| "argument 1 is not a list".to_string())?;
                if cids.is_empty() || cids.len() > 10 {
                    return Err("Invalid quantity".to_string());
                }
                cids.len() as u64
            };
            let event = lookup_event(state, event_id);
            if !event.exists() {
                return Err("Event does not exist".to_string());
            }
            if !event.is_active {
                return Err("Event is not active".to_string());
            }
            if event.ticket_price.checked_mul(quantity) != Some(tx.value) {
                return Err("Incorrect payment amount".to_string());
            }
            for _ in 0..quantity {
                mint(state, from, event_id, event.ticket_price);
            }
            state.balance += tx.value.value();
            Ok(())
        }
        "transferTicket" => {
            let id = arg_u64(args, 0)?;
            let to = arg_address(args, 1)?;
            if to.is_zero() {
                return Err("Invalid recipient".to_string());
            }
            owned_ticket(state, id, from)?.owner = to;
            Ok(())
        }
        "refundTicket" => {
            let id = arg_u64(args, 0)?;
            let ticket = owned_ticket(state, id, from)?;
            ticket.record.state = TicketState::Refunded;
            let price = ticket.record.purchase_price.value();
            state.balance = state.balance.saturating_sub(price);
            Ok(())
        }
        "validateEntry" => {
            require_role(state, Role::Validator, from)?;
            let id = arg_u64(args, 0)?;
            let ticket = state
                .tickets
                .iter_mut()
                .find(|t| t.record.id == id)
                .ok_or_else(|| "Ticket not found".to_string())?;
            if !ticket.record.state.is_valid() {
                return Err("Ticket not valid or already used".to_string());
            }
            ticket.record.state = TicketState::Used;
            Ok(())
        }
        "adminMint" => {
            require_role(state, Role::Organizer, from)?;
            let to = arg_address(args, 0)?;
            let event_id = arg_u64(args, 1)?;
            arg_str(args, 2)?;
            let value = arg_wei(args, 3)?;
            if !lookup_event(state, event_id).exists() {
                return Err("Event does not exist".to_string());
            }
            mint(state, &to, event_id, value);
            state.balance += tx.value.value();
            Ok(())
        }
        "grantRole" | "revokeRole" => {
            require_role(state, Role::Organizer, from)?;
            let role = role_of(&arg_str(args, 0)?).ok_or_else(|| "Unknown role".to_string())?;
            let account = arg_address(args, 1)?;
            if tx.call.function == "grantRole" {
                state.members.insert((role, account));
            } else {
                state.members.remove(&(role, account));
            }
            Ok(())
        }
        "withdrawFunds" => {
            require_role(state, Role::Organizer, from)?;
            state.balance = 0;
            Ok(())
        }
        other => Err(format!("unknown function {}", other)),
    }
}

fn read_failed() -> ClientError {
    ClientError::ReadFailed("connection reset by peer".to_string())
}

#[async_trait]
impl ContractLedger for FakeLedger {
    fn contract_address(&self) -> &Address {
        &self.contract
    }

    async fn event(&self, id: EventId) -> Result<EventRecord> {
        let (result, stall) = {
            let mut state = self.lock();
            state.event_reads += 1;
            let result = if state.fail_events || state.failing_event_ids.contains(&id) {
                Err(read_failed())
            } else {
                Ok(lookup_event(&state, id))
            };
            (result, std::mem::take(&mut state.stall_next_event_read))
        };
        if stall {
            self.stall().await;
        }
        result
    }

    async fn role_id(&self, role: Role) -> Result<RoleId> {
        let mut state = self.lock();
        if state.fail_roles {
            return Err(read_failed());
        }
        state.role_id_reads += 1;
        Ok(role_id_of(role))
    }

    async fn has_role(&self, role: &RoleId, account: &Address) -> Result<bool> {
        let state = self.lock();
        if state.fail_roles {
            return Err(read_failed());
        }
        Ok(role_of(&role.0).is_some_and(|r| state.members.contains(&(r, account.clone()))))
    }

    async fn tickets_by_user_paginated(
        &self,
        account: &Address,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<TicketRecord>> {
        let mut held = self.ticket_reads_held.subscribe();
        // Sender lives as long as self.
        let _ = held.wait_for(|held| !*held).await;

        let (page, stall) = {
            let mut state = self.lock();
            if state.fail_tickets {
                return Err(read_failed());
            }
            let mut page: Vec<TicketRecord> = state
                .tickets
                .iter()
                .filter(|t| &t.owner == account)
                .skip(offset as usize)
                .take(limit as usize)
                .map(|t| t.record.clone())
                .collect();
            page.resize(limit as usize, TicketRecord::placeholder());
            (page, std::mem::take(&mut state.stall_next_ticket_read))
        };
        if stall {
            self.stall().await;
        }
        Ok(page)
    }

    async fn receipt(&self, tx: &TxHash) -> Result<Option<Receipt>> {
        let state = self.lock();
        if state.fail_receipts {
            return Err(read_failed());
        }
        if state.hold_receipts {
            return Ok(None);
        }
        Ok(state.receipts.get(tx).cloned())
    }
}

#[async_trait]
impl WalletProvider for FakeLedger {
    async fn request_accounts(&self) -> std::result::Result<Vec<Address>, WalletError> {
        self.wallet_check()?;
        let mut state = self.lock();
        if state.reject_connect {
            return Err(WalletError::UserRejected);
        }
        state.authorized = state.grantable.clone();
        Ok(state.authorized.clone())
    }

    async fn accounts(&self) -> std::result::Result<Vec<Address>, WalletError> {
        self.wallet_check()?;
        Ok(self.lock().authorized.clone())
    }

    async fn get_network(&self) -> std::result::Result<NetworkId, WalletError> {
        self.wallet_check()?;
        self.lock()
            .network
            .ok_or_else(|| WalletError::Rpc("no network".to_string()))
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> std::result::Result<TxHash, WalletError> {
        self.wallet_check()?;
        let mut held = self.signatures_held.subscribe();
        let _ = held.wait_for(|held| !*held).await;

        let mut state = self.lock();
        if state.reject_signatures {
            return Err(WalletError::UserRejected);
        }
        state.tx_count += 1;
        state.block += 1;
        let hash = TxHash(format!("0x{:064x}", state.tx_count));
        let outcome = execute(&mut state, &tx);
        let receipt = Receipt {
            transaction_hash: hash.clone(),
            block_number: state.block,
            status: outcome.is_ok(),
            revert_reason: outcome.err().map(|r| format!("execution reverted: {}", r)),
        };
        state.receipts.insert(hash.clone(), receipt);
        Ok(hash)
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderNotification> {
        self.notifications.subscribe()
    }
}

#[derive(Default)]
pub struct MemoryAttachmentStore {
    files: Mutex<HashMap<String, Vec<u8>>>,
    next: AtomicU64,
    failing: AtomicBool,
}

impl MemoryAttachmentStore {
    pub fn fail(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, cid: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cid)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AttachmentStore for MemoryAttachmentStore {
    async fn put(&self, _name: &str, content: Vec<u8>) -> Result<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ClientError::Attachment("store offline".to_string()));
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let cid = format!("ipfs://mem{:08}", n);
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cid.clone(), content);
        Ok(cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ticket_api::ContractCall;

    fn request(from: &Address, call: ContractCall, value: Wei) -> TransactionRequest {
        TransactionRequest {
            from: from.clone(),
            to: contract_address(),
            call,
            value,
        }
    }

    #[tokio::test]
    async fn contract_rules_produce_revert_receipts() {
        let fake = FakeLedger::new();
        fake.add_event("Opening Night", Wei::new(1000), true);

        let ok = fake
            .send_transaction(request(
                &alice(),
                ContractCall::new("buyTicket").arg(1u64).arg("ipfs://a"),
                Wei::new(1000),
            ))
            .await
            .unwrap();
        assert!(fake.receipt(&ok).await.unwrap().unwrap().status);
        assert_eq!(fake.balance(), Wei::new(1000));

        let underpaid = fake
            .send_transaction(request(
                &alice(),
                ContractCall::new("buyTicket").arg(1u64).arg("ipfs://b"),
                Wei::new(999),
            ))
            .await
            .unwrap();
        let receipt = fake.receipt(&underpaid).await.unwrap().unwrap();
        assert!(!receipt.status);
        assert_eq!(
            receipt.revert_reason.as_deref(),
            Some("execution reverted: Incorrect payment amount")
        );
    }

    #[tokio::test]
    async fn pages_are_padded_with_zeroed_slots() {
        let fake = FakeLedger::new();
        fake.mint_to(&alice(), 1, Wei::new(5));
        let page = fake.tickets_by_user_paginated(&alice(), 0, 4).await.unwrap();
        assert_eq!(page.len(), 4);
        assert_eq!(page.iter().filter(|t| t.is_placeholder()).count(), 3);
    }
}
