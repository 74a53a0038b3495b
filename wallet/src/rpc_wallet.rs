use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use ticket_api::rpc::RpcClient;
use ticket_api::{Address, NetworkId, TransactionRequest, TxHash};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{ProviderNotification, WalletError, WalletProvider};

const NOTIFICATION_CAPACITY: usize = 16;

/// Provider reached over JSON-RPC (a node with unlocked accounts or a signer
/// proxy). It has no push channel, so `spawn_watcher` polls for switches.
#[derive(Debug)]
pub struct RpcWallet {
    rpc: RpcClient,
    notifications: broadcast::Sender<ProviderNotification>,
}

impl RpcWallet {
    pub fn new(url: impl Into<String>) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        RpcWallet {
            rpc: RpcClient::new(url),
            notifications,
        }
    }

    /// Polls accounts and network every `interval` and broadcasts changes.
    /// The task ends once the wallet is dropped.
    pub fn spawn_watcher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<RpcWallet> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut last_accounts: Option<Vec<Address>> = None;
            let mut last_network: Option<NetworkId> = None;
            loop {
                tokio::time::sleep(interval).await;
                let Some(wallet) = weak.upgrade() else {
                    debug!("Wallet dropped, stopping watcher");
                    return;
                };

                match wallet.accounts().await {
                    Ok(accounts) => {
                        if last_accounts.as_ref().is_some_and(|prev| *prev != accounts) {
                            info!("Accounts changed: {:?}", accounts);
                            let _ = wallet
                                .notifications
                                .send(ProviderNotification::AccountsChanged(accounts.clone()));
                        }
                        last_accounts = Some(accounts);
                    }
                    Err(e) => debug!("Account poll failed: {}", e),
                }

                match wallet.get_network().await {
                    Ok(network) => {
                        if last_network.is_some_and(|prev| prev != network) {
                            info!("Network changed to {}", network);
                            let _ = wallet
                                .notifications
                                .send(ProviderNotification::ChainChanged(network));
                        }
                        last_network = Some(network);
                    }
                    Err(e) => debug!("Network poll failed: {}", e),
                }
            }
        })
    }
}

#[async_trait]
impl WalletProvider for RpcWallet {
    async fn request_accounts(&self) -> Result<Vec<Address>, WalletError> {
        let accounts: Vec<Address> = self
            .rpc
            .call("eth_requestAccounts", Vec::<String>::new())
            .await?;
        Ok(accounts)
    }

    async fn accounts(&self) -> Result<Vec<Address>, WalletError> {
        let accounts: Vec<Address> = self.rpc.call("eth_accounts", Vec::<String>::new()).await?;
        Ok(accounts)
    }

    async fn get_network(&self) -> Result<NetworkId, WalletError> {
        let network: NetworkId = self.rpc.call("eth_chainId", Vec::<String>::new()).await?;
        Ok(network)
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, WalletError> {
        debug!(
            "Sending transaction from {} calling {} with value {}",
            tx.from, tx.call.function, tx.value
        );
        let hash: TxHash = self.rpc.call("eth_sendTransaction", (tx,)).await?;
        Ok(hash)
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderNotification> {
        self.notifications.subscribe()
    }
}
