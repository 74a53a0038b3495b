//! The user's signing identity and active network.
//!
//! There is one session per process. Other components never keep the address
//! around: they take a fresh [`Signer`] or [`SessionSnapshot`] per action.

use std::sync::Arc;
use ticket_api::{Address, NetworkId};
use tokio::sync::watch;
use tracing::{info, warn};
use wallet::{ProviderNotification, WalletProvider};

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub address: Option<Address>,
    pub network: Option<NetworkId>,
    /// Bumped on every connect and every provider notification.
    pub epoch: u64,
}

impl SessionSnapshot {
    pub fn state(&self) -> ConnectionState {
        if self.address.is_some() && self.network.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

/// Write capability. Only a connected session hands these out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signer {
    address: Address,
    network: NetworkId,
    epoch: u64,
}

impl Signer {
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn network(&self) -> NetworkId {
        self.network
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

pub struct WalletSession {
    provider: Arc<dyn WalletProvider>,
    state: watch::Sender<SessionSnapshot>,
}

impl WalletSession {
    pub fn new(provider: Arc<dyn WalletProvider>) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::default());
        WalletSession { provider, state }
    }

    pub fn provider(&self) -> &Arc<dyn WalletProvider> {
        &self.provider
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn address(&self) -> Option<Address> {
        self.state.borrow().address.clone()
    }

    pub fn network(&self) -> Option<NetworkId> {
        self.state.borrow().network
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().state() == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    pub fn signer(&self) -> Result<Signer> {
        let snapshot = self.state.borrow();
        match (&snapshot.address, snapshot.network) {
            (Some(address), Some(network)) => Ok(Signer {
                address: address.clone(),
                network,
                epoch: snapshot.epoch,
            }),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// False once the account or network moved on since `signer` was issued.
    pub fn is_current(&self, signer: &Signer) -> bool {
        self.state.borrow().epoch == signer.epoch
    }

    /// Asks the provider for an account. On failure the previous state stays
    /// as it was.
    pub async fn connect(&self) -> Result<SessionSnapshot> {
        let accounts = self.provider.request_accounts().await?;
        let address = accounts
            .into_iter()
            .next()
            .ok_or(ClientError::UserRejected)?;
        let network = self.provider.get_network().await?;
        info!("Wallet connected: {} on network {}", address.short(), network);
        Ok(self.publish(Some(address), Some(network)))
    }

    /// Picks up an already authorized account without prompting.
    pub async fn restore(&self) -> Result<Option<SessionSnapshot>> {
        let accounts = self.provider.accounts().await?;
        let Some(address) = accounts.into_iter().next() else {
            return Ok(None);
        };
        let network = self.provider.get_network().await?;
        info!("Wallet session restored: {} on network {}", address.short(), network);
        Ok(Some(self.publish(Some(address), Some(network))))
    }

    pub fn disconnect(&self) {
        self.publish(None, None);
    }

    /// Applies an account or network switch reported by the provider.
    pub fn apply(&self, notification: &ProviderNotification) -> SessionSnapshot {
        self.state.send_modify(|s| {
            match notification {
                ProviderNotification::AccountsChanged(accounts) => {
                    s.address = accounts.first().cloned();
                    if s.address.is_none() {
                        warn!("Provider reports no authorized accounts");
                    }
                }
                ProviderNotification::ChainChanged(network) => {
                    s.network = Some(*network);
                }
            }
            s.epoch += 1;
        });
        let snapshot = self.snapshot();
        info!(
            "Session reset by provider: address={:?} network={:?} epoch={}",
            snapshot.address.as_ref().map(Address::short),
            snapshot.network.map(|n| n.0),
            snapshot.epoch
        );
        snapshot
    }

    fn publish(&self, address: Option<Address>, network: Option<NetworkId>) -> SessionSnapshot {
        self.state.send_modify(|s| {
            s.address = address;
            s.network = network;
            s.epoch += 1;
        });
        self.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{FakeLedger, alice, bob};

    #[tokio::test]
    async fn connect_stores_account_and_network() {
        let fake = FakeLedger::new();
        fake.set_accounts(vec![alice()]);
        let session = WalletSession::new(fake.clone());
        assert!(matches!(session.signer(), Err(ClientError::NotConnected)));

        let snapshot = session.connect().await.unwrap();
        assert_eq!(snapshot.address, Some(alice()));
        assert_eq!(snapshot.state(), ConnectionState::Connected);
        assert_eq!(session.signer().unwrap().address(), &alice());
    }

    #[tokio::test]
    async fn rejected_connect_leaves_state_untouched() {
        let fake = FakeLedger::new();
        fake.set_accounts(vec![alice()]);
        let session = WalletSession::new(fake.clone());
        session.connect().await.unwrap();
        let before = session.snapshot();

        fake.reject_connect(true);
        assert_eq!(session.connect().await, Err(ClientError::UserRejected));
        assert_eq!(session.snapshot(), before);

        fake.set_available(false);
        assert!(matches!(
            session.connect().await,
            Err(ClientError::ProviderUnavailable(_))
        ));
        assert_eq!(session.snapshot(), before);
    }

    #[tokio::test]
    async fn restore_without_authorized_account_is_not_an_error() {
        let fake = FakeLedger::new();
        let session = WalletSession::new(fake.clone());
        assert_eq!(session.restore().await.unwrap(), None);
        assert!(!session.is_connected());

        fake.authorize(vec![bob()]);
        let restored = session.restore().await.unwrap().unwrap();
        assert_eq!(restored.address, Some(bob()));
    }

    #[tokio::test]
    async fn notifications_bump_the_epoch() {
        let fake = FakeLedger::new();
        fake.set_accounts(vec![alice()]);
        let session = WalletSession::new(fake.clone());
        session.connect().await.unwrap();
        let signer = session.signer().unwrap();

        let snapshot = session.apply(&ProviderNotification::AccountsChanged(vec![bob()]));
        assert_eq!(snapshot.address, Some(bob()));
        assert!(!session.is_current(&signer));

        let snapshot = session.apply(&ProviderNotification::AccountsChanged(vec![]));
        assert_eq!(snapshot.state(), ConnectionState::Disconnected);
        assert!(session.signer().is_err());
    }
}
