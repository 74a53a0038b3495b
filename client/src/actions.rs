//! Write intents understood by the orchestrator.
//!
//! Constructors validate locally, so a `WriteAction` that exists is one the
//! client is willing to send.

use std::fmt;
use ticket_api::{Address, EventId, Role, TicketId, Wei};

use crate::error::{ClientError, Result};
use crate::inventory::PurchaseOrder;

/// Identifies one logical action instance (one button, one form). At most one
/// transaction per key is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActionKey {
    CreateEvent,
    ToggleEvent(EventId),
    BuyTickets(EventId),
    TransferTicket(TicketId),
    RefundTicket(TicketId),
    ValidateEntry,
    AdminMint,
    ChangeRole(Role, Address),
    WithdrawFunds,
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKey::CreateEvent => write!(f, "event creation"),
            ActionKey::ToggleEvent(id) => write!(f, "status change of event #{}", id),
            ActionKey::BuyTickets(id) => write!(f, "purchase for event #{}", id),
            ActionKey::TransferTicket(id) => write!(f, "transfer of ticket #{}", id),
            ActionKey::RefundTicket(id) => write!(f, "refund of ticket #{}", id),
            ActionKey::ValidateEntry => write!(f, "entry validation"),
            ActionKey::AdminMint => write!(f, "ticket issuance"),
            ActionKey::ChangeRole(role, account) => {
                write!(f, "{} role change for {}", role, account.short())
            }
            ActionKey::WithdrawFunds => write!(f, "withdrawal"),
        }
    }
}

/// Local views a confirmed write can make stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Catalog,
    Inventory,
    Roles,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteAction {
    CreateEvent {
        name: String,
        price: Wei,
    },
    ToggleEventStatus {
        event_id: EventId,
    },
    BuyTickets(PurchaseOrder),
    TransferTicket {
        ticket_id: TicketId,
        to: Address,
    },
    RefundTicket {
        ticket_id: TicketId,
    },
    ValidateEntry {
        ticket_id: TicketId,
    },
    AdminMint {
        to: Address,
        event_id: EventId,
        attachment: String,
        value: Wei,
    },
    GrantRole {
        role: Role,
        account: Address,
    },
    RevokeRole {
        role: Role,
        account: Address,
    },
    WithdrawFunds,
}

fn positive(id: u64, what: &str) -> Result<u64> {
    if id == 0 {
        Err(ClientError::InvalidInput(format!("{} id must be positive", what)))
    } else {
        Ok(id)
    }
}

fn recipient(to: &str) -> Result<Address> {
    let address = Address::parse(to)?;
    if address.is_zero() {
        return Err(ClientError::InvalidInput(
            "recipient cannot be the zero address".to_string(),
        ));
    }
    Ok(address)
}

impl WriteAction {
    pub fn create_event(name: &str, price: Wei) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ClientError::InvalidInput("event name is required".to_string()));
        }
        Ok(WriteAction::CreateEvent {
            name: name.to_string(),
            price,
        })
    }

    pub fn toggle_event_status(event_id: EventId) -> Result<Self> {
        Ok(WriteAction::ToggleEventStatus {
            event_id: positive(event_id, "event")?,
        })
    }

    pub fn buy(order: PurchaseOrder) -> Self {
        WriteAction::BuyTickets(order)
    }

    pub fn transfer(ticket_id: TicketId, to: &str) -> Result<Self> {
        Ok(WriteAction::TransferTicket {
            ticket_id: positive(ticket_id, "ticket")?,
            to: recipient(to)?,
        })
    }

    pub fn refund(ticket_id: TicketId) -> Result<Self> {
        Ok(WriteAction::RefundTicket {
            ticket_id: positive(ticket_id, "ticket")?,
        })
    }

    pub fn validate_entry(ticket_id: TicketId) -> Result<Self> {
        Ok(WriteAction::ValidateEntry {
            ticket_id: positive(ticket_id, "ticket")?,
        })
    }

    pub fn admin_mint(to: &str, event_id: EventId, attachment: String, value: Wei) -> Result<Self> {
        if attachment.trim().is_empty() {
            return Err(ClientError::InvalidInput(
                "attachment identifier is required".to_string(),
            ));
        }
        Ok(WriteAction::AdminMint {
            to: recipient(to)?,
            event_id: positive(event_id, "event")?,
            attachment,
            value,
        })
    }

    pub fn grant_role(role: Role, account: &str) -> Result<Self> {
        Ok(WriteAction::GrantRole {
            role,
            account: recipient(account)?,
        })
    }

    pub fn revoke_role(role: Role, account: &str) -> Result<Self> {
        Ok(WriteAction::RevokeRole {
            role,
            account: recipient(account)?,
        })
    }

    pub fn key(&self) -> ActionKey {
        match self {
            WriteAction::CreateEvent { .. } => ActionKey::CreateEvent,
            WriteAction::ToggleEventStatus { event_id } => ActionKey::ToggleEvent(*event_id),
            WriteAction::BuyTickets(order) => ActionKey::BuyTickets(order.event_id()),
            WriteAction::TransferTicket { ticket_id, .. } => ActionKey::TransferTicket(*ticket_id),
            WriteAction::RefundTicket { ticket_id } => ActionKey::RefundTicket(*ticket_id),
            WriteAction::ValidateEntry { .. } => ActionKey::ValidateEntry,
            WriteAction::AdminMint { .. } => ActionKey::AdminMint,
            WriteAction::GrantRole { role, account } | WriteAction::RevokeRole { role, account } => {
                ActionKey::ChangeRole(*role, account.clone())
            }
            WriteAction::WithdrawFunds => ActionKey::WithdrawFunds,
        }
    }

    pub fn description(&self) -> String {
        match self {
            WriteAction::CreateEvent { name, price } => {
                format!("create event '{}' at {} wei", name, price)
            }
            WriteAction::ToggleEventStatus { event_id } => format!("toggle event #{}", event_id),
            WriteAction::BuyTickets(order) => format!(
                "buy {} ticket(s) for event #{}",
                order.quantity(),
                order.event_id()
            ),
            WriteAction::TransferTicket { ticket_id, to } => {
                format!("transfer ticket #{} to {}", ticket_id, to.short())
            }
            WriteAction::RefundTicket { ticket_id } => format!("refund ticket #{}", ticket_id),
            WriteAction::ValidateEntry { ticket_id } => format!("validate ticket #{}", ticket_id),
            WriteAction::AdminMint { to, event_id, .. } => {
                format!("issue a ticket for event #{} to {}", event_id, to.short())
            }
            WriteAction::GrantRole { role, account } => {
                format!("grant {} to {}", role, account.short())
            }
            WriteAction::RevokeRole { role, account } => {
                format!("revoke {} from {}", role, account.short())
            }
            WriteAction::WithdrawFunds => "withdraw funds".to_string(),
        }
    }

    /// Caches to re-read once this action is confirmed for `signer`.
    pub fn affected_caches(&self, signer: &Address) -> Vec<CacheKind> {
        match self {
            WriteAction::CreateEvent { .. } | WriteAction::ToggleEventStatus { .. } => {
                vec![CacheKind::Catalog]
            }
            WriteAction::BuyTickets(_)
            | WriteAction::TransferTicket { .. }
            | WriteAction::RefundTicket { .. } => vec![CacheKind::Inventory],
            WriteAction::AdminMint { to, .. } if to == signer => vec![CacheKind::Inventory],
            WriteAction::GrantRole { .. } | WriteAction::RevokeRole { .. } => {
                vec![CacheKind::Roles]
            }
            WriteAction::AdminMint { .. }
            | WriteAction::ValidateEntry { .. }
            | WriteAction::WithdrawFunds => Vec::new(),
        }
    }
}
