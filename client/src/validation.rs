//! Door-side entry validation.
//!
//! A ticket id arrives typed by hand or decoded from a scanned code (the code
//! holds the id as plain text). Both go through the same parsing.

use std::fmt;
use std::sync::Arc;
use ticket_api::{TicketId, TxHash};
use tracing::{info, warn};

use crate::actions::{ActionKey, WriteAction};
use crate::error::ClientError;
use crate::orchestrator::{TransactionOrchestrator, TxState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketInput {
    Manual(String),
    Scanned(String),
}

impl TicketInput {
    pub fn raw(&self) -> &str {
        match self {
            TicketInput::Manual(s) | TicketInput::Scanned(s) => s,
        }
    }

    pub fn ticket_id(&self) -> Result<TicketId, ClientError> {
        let raw = self.raw().trim();
        let digits = raw.strip_prefix('#').unwrap_or(raw);
        match digits.parse::<TicketId>() {
            Ok(id) if id > 0 => Ok(id),
            _ => Err(ClientError::InvalidInput(format!(
                "'{}' is not a ticket id",
                raw
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationFailure {
    /// Ticket exists but is used, refunded or cancelled.
    AlreadyUsedOrInvalid,
    NotFound,
    InvalidInput(String),
    /// Another validation is still running.
    Busy,
    Generic(ClientError),
}

impl ValidationFailure {
    /// Sorts a failed `validateEntry` by its revert reason.
    pub fn classify(error: ClientError) -> Self {
        let Some(reason) = error.revert_reason().map(str::to_lowercase) else {
            return match error {
                ClientError::InvalidInput(msg) => ValidationFailure::InvalidInput(msg),
                ClientError::AlreadyInFlight(_) => ValidationFailure::Busy,
                other => ValidationFailure::Generic(other),
            };
        };
        if reason.contains("not valid") || reason.contains("already used") {
            ValidationFailure::AlreadyUsedOrInvalid
        } else if reason.contains("not found") || reason.contains("does not exist") {
            ValidationFailure::NotFound
        } else {
            ValidationFailure::Generic(error)
        }
    }

    pub fn message(&self) -> String {
        match self {
            ValidationFailure::AlreadyUsedOrInvalid => {
                "Ticket is not valid or has already been used".to_string()
            }
            ValidationFailure::NotFound => "Ticket not found".to_string(),
            ValidationFailure::InvalidInput(msg) => format!("Invalid ticket id: {}", msg),
            ValidationFailure::Busy => "A validation is already in progress".to_string(),
            ValidationFailure::Generic(e) => format!("Validation failed: {}", e.user_message()),
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Admitted {
        ticket_id: TicketId,
        hash: Option<TxHash>,
    },
    Refused {
        ticket_id: Option<TicketId>,
        failure: ValidationFailure,
    },
}

impl ValidationOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, ValidationOutcome::Admitted { .. })
    }

    pub fn message(&self) -> String {
        match self {
            ValidationOutcome::Admitted { ticket_id, .. } => {
                format!("Ticket #{} validated", ticket_id)
            }
            ValidationOutcome::Refused { failure, .. } => failure.message(),
        }
    }
}

pub struct ValidationFlow {
    orchestrator: Arc<TransactionOrchestrator>,
}

impl ValidationFlow {
    pub fn new(orchestrator: Arc<TransactionOrchestrator>) -> Self {
        ValidationFlow { orchestrator }
    }

    /// False while a validation is between submission and its terminal state.
    pub fn input_enabled(&self) -> bool {
        !self.orchestrator.is_in_flight(&ActionKey::ValidateEntry)
    }

    pub fn last_state(&self) -> Option<TxState> {
        self.orchestrator
            .status(&ActionKey::ValidateEntry)
            .map(|tx| tx.state)
    }

    pub async fn validate(&self, input: TicketInput) -> ValidationOutcome {
        let refuse = |ticket_id, error| {
            let failure = ValidationFailure::classify(error);
            warn!("Entry refused: {}", failure);
            ValidationOutcome::Refused { ticket_id, failure }
        };

        let ticket_id = match input.ticket_id() {
            Ok(id) => id,
            Err(e) => return refuse(None, e),
        };
        let action = match WriteAction::validate_entry(ticket_id) {
            Ok(action) => action,
            Err(e) => return refuse(Some(ticket_id), e),
        };
        let outcome = match self.orchestrator.execute(action).await {
            Ok(tx) => tx,
            Err(e) => return refuse(Some(ticket_id), e),
        };
        match outcome.into_result() {
            Ok(tx) => {
                info!("Ticket #{} admitted", ticket_id);
                ValidationOutcome::Admitted {
                    ticket_id,
                    hash: tx.hash,
                }
            }
            Err(e) => refuse(Some(ticket_id), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scanned_and_typed_ids_parse_the_same() {
        assert_eq!(TicketInput::Manual(" 42 ".into()).ticket_id().unwrap(), 42);
        assert_eq!(TicketInput::Scanned("42".into()).ticket_id().unwrap(), 42);
        assert_eq!(TicketInput::Scanned("#42".into()).ticket_id().unwrap(), 42);
        assert!(TicketInput::Manual("0".into()).ticket_id().is_err());
        assert!(TicketInput::Scanned("ticket-42".into()).ticket_id().is_err());
        assert!(TicketInput::Manual("".into()).ticket_id().is_err());
    }

    #[test]
    fn revert_reasons_pick_the_message() {
        let used = ClientError::reverted(Some("Ticket not valid or already used".into()));
        assert_eq!(
            ValidationFailure::classify(used),
            ValidationFailure::AlreadyUsedOrInvalid
        );

        let missing = ClientError::reverted(Some("execution reverted: Ticket does not exist".into()));
        assert_eq!(ValidationFailure::classify(missing), ValidationFailure::NotFound);

        let other = ClientError::reverted(Some("Pausable: paused".into()));
        let failure = ValidationFailure::classify(other);
        assert!(matches!(failure, ValidationFailure::Generic(_)));
        assert!(failure.message().starts_with("Validation failed"));

        let silent = ValidationFailure::classify(ClientError::reverted(None));
        assert_eq!(silent.message(), "Validation failed: transaction failed");
    }

    #[test]
    fn local_errors_keep_their_meaning() {
        assert_eq!(
            ValidationFailure::classify(ClientError::AlreadyInFlight("entry validation".into())),
            ValidationFailure::Busy
        );
        assert!(matches!(
            ValidationFailure::classify(ClientError::InvalidInput("x".into())),
            ValidationFailure::InvalidInput(_)
        ));
    }
}
