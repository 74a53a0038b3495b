//! Failure taxonomy shared by every component of the client core.

use thiserror::Error;
use ticket_api::ParseError;
use wallet::WalletError;

pub type Result<T> = std::result::Result<T, ClientError>;

pub const GENERIC_FAILURE: &str = "transaction failed";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// No wallet provider could be reached.
    #[error("wallet provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The user declined a connect or signature request.
    #[error("request rejected by the user")]
    UserRejected,

    /// A ledger read did not complete.
    #[error("ledger read failed: {0}")]
    ReadFailed(String),

    /// The ledger rejected a submitted write.
    #[error("{}", revert_message(.reason.as_deref()))]
    Reverted { reason: Option<String> },

    /// Rejected locally, before any ledger interaction.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("wallet not connected")]
    NotConnected,

    /// The same logical action already has a transaction in flight.
    #[error("{0} is already in progress")]
    AlreadyInFlight(String),

    #[error("attachment store error: {0}")]
    Attachment(String),
}

impl ClientError {
    pub fn reverted(reason: Option<String>) -> Self {
        ClientError::Reverted {
            reason: reason
                .map(|r| clean_reason(&r))
                .filter(|r| !r.is_empty()),
        }
    }

    /// Raw ledger revert reason, if this is a revert that carried one.
    pub fn revert_reason(&self) -> Option<&str> {
        match self {
            ClientError::Reverted { reason } => reason.as_deref(),
            _ => None,
        }
    }

    /// Message suitable for a toast or a CLI line.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::ProviderUnavailable(_) => "Install or unlock a wallet provider".to_string(),
            ClientError::UserRejected => "Request rejected in the wallet".to_string(),
            ClientError::NotConnected => "Connect your wallet first".to_string(),
            other => other.to_string(),
        }
    }

    /// Local failures are never retried and never touched the ledger.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ClientError::InvalidInput(_)
                | ClientError::UserRejected
                | ClientError::NotConnected
                | ClientError::AlreadyInFlight(_)
        )
    }
}

fn clean_reason(reason: &str) -> String {
    let trimmed = reason.trim();
    trimmed
        .strip_prefix("execution reverted:")
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

fn revert_message(reason: Option<&str>) -> String {
    match reason {
        Some(r) => format!("{}: {}", GENERIC_FAILURE, r),
        None => GENERIC_FAILURE.to_string(),
    }
}

impl From<WalletError> for ClientError {
    fn from(e: WalletError) -> Self {
        match e {
            WalletError::Unavailable(msg) => ClientError::ProviderUnavailable(msg),
            WalletError::UserRejected => ClientError::UserRejected,
            WalletError::Reverted(reason) => ClientError::reverted(reason),
            WalletError::Rpc(msg) => ClientError::ReadFailed(msg),
        }
    }
}

impl From<ParseError> for ClientError {
    fn from(e: ParseError) -> Self {
        ClientError::InvalidInput(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revert_reasons_are_cleaned_and_fall_back() {
        let e = ClientError::reverted(Some("execution reverted: Ticket not valid".into()));
        assert_eq!(e.revert_reason(), Some("Ticket not valid"));
        assert_eq!(e.to_string(), "transaction failed: Ticket not valid");

        let blank = ClientError::reverted(Some("  ".into()));
        assert_eq!(blank.revert_reason(), None);
        assert_eq!(blank.user_message(), GENERIC_FAILURE);
    }

    #[test]
    fn wallet_errors_keep_their_kind() {
        assert_eq!(ClientError::from(WalletError::UserRejected), ClientError::UserRejected);
        assert!(matches!(
            ClientError::from(WalletError::Unavailable("none".into())),
            ClientError::ProviderUnavailable(_)
        ));
        assert!(ClientError::UserRejected.is_local());
        assert!(!ClientError::ReadFailed("timeout".into()).is_local());
    }
}
