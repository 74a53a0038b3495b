//! A user's tickets, one page at a time.
//!
//! Pages are cached per (owner, page). After a confirmed write the current page
//! is re-read instead of patched: a transfer or refund changes which tickets
//! the query returns, and with it every page boundary.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use ticket_api::{Address, EventId, EventRecord, TicketRecord, Wei};
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::gateway::ContractGateway;

pub const MAX_BATCH_QUANTITY: u64 = 10;

/// A validated purchase: quantity in `1..=10`, one distinct attachment id per
/// ticket, and a total computed in integer wei.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOrder {
    event_id: EventId,
    unit_price: Wei,
    attachments: Vec<String>,
    total: Wei,
}

impl PurchaseOrder {
    pub fn new(event: &EventRecord, quantity: u64, attachments: Vec<String>) -> Result<Self> {
        if !event.exists() {
            return Err(ClientError::InvalidInput("unknown event".to_string()));
        }
        if !(1..=MAX_BATCH_QUANTITY).contains(&quantity) {
            return Err(ClientError::InvalidInput(format!(
                "quantity must be between 1 and {}, got {}",
                MAX_BATCH_QUANTITY, quantity
            )));
        }
        if attachments.len() as u64 != quantity {
            return Err(ClientError::InvalidInput(format!(
                "{} attachment identifiers supplied for {} tickets",
                attachments.len(),
                quantity
            )));
        }
        if attachments.iter().any(|a| a.trim().is_empty()) {
            return Err(ClientError::InvalidInput(
                "attachment identifiers cannot be empty".to_string(),
            ));
        }
        let distinct: HashSet<&String> = attachments.iter().collect();
        if distinct.len() != attachments.len() {
            return Err(ClientError::InvalidInput(
                "attachment identifiers must be distinct".to_string(),
            ));
        }
        let total = event
            .ticket_price
            .checked_mul(quantity)
            .ok_or_else(|| ClientError::InvalidInput("total price overflows".to_string()))?;
        Ok(PurchaseOrder {
            event_id: event.id,
            unit_price: event.ticket_price,
            attachments,
            total,
        })
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn quantity(&self) -> u64 {
        self.attachments.len() as u64
    }

    pub fn unit_price(&self) -> Wei {
        self.unit_price
    }

    pub fn total_price(&self) -> Wei {
        self.total
    }

    pub fn attachments(&self) -> &[String] {
        &self.attachments
    }

    /// Single purchases use `buyTicket`; anything more uses `batchBuyTickets`.
    pub fn is_batch(&self) -> bool {
        self.quantity() > 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketPage {
    pub owner: Address,
    pub page: u64,
    pub page_size: u64,
    pub tickets: Vec<TicketRecord>,
}

impl TicketPage {
    /// A short page means the ledger has nothing further.
    pub fn has_next(&self) -> bool {
        self.tickets.len() as u64 >= self.page_size
    }

    pub fn has_previous(&self) -> bool {
        self.page > 0
    }

    pub fn valid_tickets(&self) -> Vec<TicketRecord> {
        self.tickets
            .iter()
            .filter(|t| t.state.is_valid())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PageKey {
    owner: Address,
    page: u64,
    page_size: u64,
}

#[derive(Debug, Default)]
struct InventoryState {
    pages: HashMap<PageKey, Vec<TicketRecord>>,
    current: Option<TicketPage>,
    loading: bool,
    // Bumped by invalidate(); reads started before it are dropped.
    generation: u64,
    // Every read takes the next number; one older than the last applied
    // read lost the race and is dropped.
    issued: u64,
    applied: u64,
}

pub struct TicketInventory {
    page_size: u64,
    state: Mutex<InventoryState>,
}

struct LoadingGuard<'a> {
    inventory: &'a TicketInventory,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.inventory.lock().loading = false;
    }
}

impl TicketInventory {
    pub fn new(page_size: u64) -> Self {
        TicketInventory {
            page_size: page_size.max(1),
            state: Mutex::new(InventoryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InventoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn current(&self) -> Option<TicketPage> {
        self.lock().current.clone()
    }

    pub fn valid_tickets(&self) -> Vec<TicketRecord> {
        self.lock()
            .current
            .as_ref()
            .map(TicketPage::valid_tickets)
            .unwrap_or_default()
    }

    pub fn cached_page(&self, owner: &Address, page: u64) -> Option<Vec<TicketRecord>> {
        let key = PageKey {
            owner: owner.clone(),
            page,
            page_size: self.page_size,
        };
        self.lock().pages.get(&key).cloned()
    }

    pub fn is_loading(&self) -> bool {
        self.lock().loading
    }

    pub fn can_next(&self) -> bool {
        let state = self.lock();
        !state.loading && state.current.as_ref().is_some_and(TicketPage::has_next)
    }

    pub fn can_previous(&self) -> bool {
        let state = self.lock();
        !state.loading && state.current.as_ref().is_some_and(TicketPage::has_previous)
    }

    /// Reads one page, drops zeroed slots and makes it the current page.
    /// Refused while another page load is still running.
    pub async fn fetch_page(
        &self,
        gateway: &ContractGateway,
        owner: &Address,
        page: u64,
        page_size: u64,
    ) -> Result<TicketPage> {
        {
            let mut state = self.lock();
            if state.loading {
                return Err(ClientError::AlreadyInFlight("ticket page load".to_string()));
            }
            state.loading = true;
        }
        let _guard = LoadingGuard { inventory: self };
        self.read_page(gateway, owner, page, page_size)
            .await?
            .ok_or_else(|| {
                ClientError::ReadFailed("ticket page was reloaded while this read ran".to_string())
            })
    }

    /// `Ok(None)` when a read that started later has already been applied.
    async fn read_page(
        &self,
        gateway: &ContractGateway,
        owner: &Address,
        page: u64,
        page_size: u64,
    ) -> Result<Option<TicketPage>> {
        if page_size == 0 {
            return Err(ClientError::InvalidInput("page size must be positive".to_string()));
        }
        let offset = page
            .checked_mul(page_size)
            .ok_or_else(|| ClientError::InvalidInput(format!("page {} is out of range", page)))?;
        let (generation, sequence) = {
            let mut state = self.lock();
            state.issued += 1;
            (state.generation, state.issued)
        };

        let result = gateway.get_tickets_paginated(owner, offset, page_size).await;

        let mut state = self.lock();
        if state.generation != generation {
            debug!("Discarding ticket page read from a previous session");
            return Err(ClientError::ReadFailed(
                "session changed while loading tickets".to_string(),
            ));
        }
        if sequence < state.applied {
            debug!(
                "Discarding page {} of {}: a newer read was applied",
                page,
                owner.short()
            );
            return Ok(None);
        }
        state.applied = sequence;
        match result {
            Ok(raw) => {
                let slots = raw.len();
                let tickets: Vec<TicketRecord> =
                    raw.into_iter().filter(|t| !t.is_placeholder()).collect();
                debug!(
                    "Page {} of {}: {} tickets ({} empty slots dropped)",
                    page,
                    owner.short(),
                    tickets.len(),
                    slots - tickets.len()
                );
                let key = PageKey {
                    owner: owner.clone(),
                    page,
                    page_size,
                };
                state.pages.insert(key, tickets.clone());
                let current = TicketPage {
                    owner: owner.clone(),
                    page,
                    page_size,
                    tickets,
                };
                state.current = Some(current.clone());
                Ok(Some(current))
            }
            Err(e) => {
                warn!("Failed to load page {} of {}: {}", page, owner.short(), e);
                state.current = Some(TicketPage {
                    owner: owner.clone(),
                    page,
                    page_size,
                    tickets: Vec::new(),
                });
                Err(e)
            }
        }
    }

    /// First page for `owner` at the configured page size.
    pub async fn load(&self, gateway: &ContractGateway, owner: &Address) -> Result<TicketPage> {
        self.fetch_page(gateway, owner, 0, self.page_size).await
    }

    pub async fn next(&self, gateway: &ContractGateway) -> Result<TicketPage> {
        let current = self.navigable_page()?;
        if !current.has_next() {
            return Err(ClientError::InvalidInput("no further tickets".to_string()));
        }
        self.fetch_page(gateway, &current.owner, current.page + 1, current.page_size)
            .await
    }

    pub async fn previous(&self, gateway: &ContractGateway) -> Result<TicketPage> {
        let current = self.navigable_page()?;
        if !current.has_previous() {
            return Err(ClientError::InvalidInput("already at the first page".to_string()));
        }
        self.fetch_page(gateway, &current.owner, current.page - 1, current.page_size)
            .await
    }

    fn navigable_page(&self) -> Result<TicketPage> {
        let state = self.lock();
        if state.loading {
            return Err(ClientError::AlreadyInFlight("ticket page load".to_string()));
        }
        state
            .current
            .clone()
            .ok_or_else(|| ClientError::InvalidInput("no ticket page loaded".to_string()))
    }

    /// Forgets every cached page of `owner` and re-reads the current page when
    /// it belongs to them. Any page load already running when this starts can
    /// no longer replace its result.
    pub async fn refresh(&self, gateway: &ContractGateway, owner: &Address) -> Result<Option<TicketPage>> {
        let current = {
            let mut state = self.lock();
            state.pages.retain(|key, _| &key.owner != owner);
            state.current.clone()
        };
        match current {
            Some(page) if &page.owner == owner => {
                info!("Refreshing page {} of {}", page.page, owner.short());
                match self.read_page(gateway, owner, page.page, page.page_size).await? {
                    Some(fresh) => Ok(Some(fresh)),
                    // Overtaken by a read that started after this one.
                    None => Ok(self.current()),
                }
            }
            _ => Ok(None),
        }
    }

    pub fn invalidate(&self) {
        let mut state = self.lock();
        state.pages.clear();
        state.current = None;
        state.generation += 1;
    }
}
