//! The signing side of the client: whatever holds the user's keys.
//!
//! A provider hands out accounts and the active network, signs and submits
//! transactions, and announces account or network switches made outside the
//! client.

use async_trait::async_trait;
use thiserror::Error;
use ticket_api::rpc::RpcError;
use ticket_api::{Address, NetworkId, TransactionRequest, TxHash};
use tokio::sync::broadcast;

mod rpc_wallet;

pub use rpc_wallet::RpcWallet;

/// EIP-1193 code for a request the user declined.
pub const USER_REJECTED_CODE: i64 = 4001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderNotification {
    AccountsChanged(Vec<Address>),
    ChainChanged(NetworkId),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("wallet provider unavailable: {0}")]
    Unavailable(String),
    #[error("user rejected the request")]
    UserRejected,
    #[error("transaction would revert: {}", .0.as_deref().unwrap_or("no reason given"))]
    Reverted(Option<String>),
    #[error("wallet provider error: {0}")]
    Rpc(String),
}

impl From<RpcError> for WalletError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Connect { url, message } => {
                WalletError::Unavailable(format!("{}: {}", url, message))
            }
            RpcError::Rpc { code, .. } if code == USER_REJECTED_CODE => WalletError::UserRejected,
            RpcError::Rpc { message, data, .. } if message.contains("execution reverted") => {
                let reason = data
                    .as_ref()
                    .and_then(|d| d.as_str())
                    .map(str::to_string)
                    .or_else(|| {
                        message
                            .split_once("execution reverted:")
                            .map(|(_, r)| r.trim().to_string())
                    })
                    .filter(|r| !r.is_empty());
                WalletError::Reverted(reason)
            }
            other => WalletError::Rpc(other.to_string()),
        }
    }
}

#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Prompts the user to authorize accounts.
    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError>;

    /// Accounts already authorized, without prompting.
    async fn accounts(&self) -> Result<Vec<Address>, WalletError>;

    async fn get_network(&self) -> Result<NetworkId, WalletError>;

    /// Signs and submits; returns as soon as the ledger accepted the transaction
    /// for inclusion.
    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, WalletError>;

    fn subscribe(&self) -> broadcast::Receiver<ProviderNotification>;
}
