//! Typed façade over the ticketing contract. Nothing else talks to the ledger.
//!
//! Reads go straight to the read-only ledger connection. Writes are signed by
//! the wallet provider and come back as an unconfirmed [`TransactionHandle`];
//! waiting for inclusion is a separate step.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use ticket_api::{
    Address, ContractCall, EventId, EventRecord, Receipt, Role, RoleId, TicketId, TicketRecord,
    TransactionRequest, TxHash, Wei,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use wallet::WalletProvider;

use crate::error::{ClientError, Result};
use crate::ledger::ContractLedger;
use crate::session::Signer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionHandle {
    pub hash: TxHash,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct ConfirmationSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// Consecutive failed receipt reads tolerated before giving up.
    pub max_poll_failures: u32,
}

impl Default for ConfirmationSettings {
    fn default() -> Self {
        ConfirmationSettings {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(120),
            max_poll_failures: 3,
        }
    }
}

pub struct ContractGateway {
    ledger: Arc<dyn ContractLedger>,
    wallet: Arc<dyn WalletProvider>,
}

impl ContractGateway {
    pub fn new(ledger: Arc<dyn ContractLedger>, wallet: Arc<dyn WalletProvider>) -> Self {
        ContractGateway { ledger, wallet }
    }

    pub fn contract_address(&self) -> &Address {
        self.ledger.contract_address()
    }

    pub async fn get_event(&self, id: EventId) -> Result<EventRecord> {
        debug!("Reading event {}", id);
        self.ledger.event(id).await
    }

    pub async fn get_role(&self, role: Role) -> Result<RoleId> {
        debug!("Reading {} identifier", role.getter());
        self.ledger.role_id(role).await
    }

    pub async fn has_role(&self, role: &RoleId, identity: &Address) -> Result<bool> {
        self.ledger.has_role(role, identity).await
    }

    pub async fn get_tickets_paginated(
        &self,
        identity: &Address,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<TicketRecord>> {
        debug!(
            "Reading tickets of {} offset={} limit={}",
            identity.short(),
            offset,
            limit
        );
        self.ledger
            .tickets_by_user_paginated(identity, offset, limit)
            .await
    }

    async fn send(&self, signer: &Signer, call: ContractCall, value: Wei) -> Result<TransactionHandle> {
        info!(
            "Requesting signature from {} for {} (value {} wei)",
            signer.address().short(),
            call.function,
            value
        );
        let request = TransactionRequest {
            from: signer.address().clone(),
            to: self.contract_address().clone(),
            call,
            value,
        };
        let hash = self.wallet.send_transaction(request).await?;
        info!("Transaction submitted: {}", hash);
        Ok(TransactionHandle {
            hash,
            submitted_at: Utc::now(),
        })
    }

    pub async fn create_event(&self, signer: &Signer, name: &str, price: Wei) -> Result<TransactionHandle> {
        let call = ContractCall::new("createEvent").arg(name).arg(price);
        self.send(signer, call, Wei::ZERO).await
    }

    pub async fn toggle_event_status(&self, signer: &Signer, event_id: EventId) -> Result<TransactionHandle> {
        let call = ContractCall::new("toggleEventStatus").arg(event_id);
        self.send(signer, call, Wei::ZERO).await
    }

    pub async fn buy_ticket(
        &self,
        signer: &Signer,
        event_id: EventId,
        attachment: &str,
        value: Wei,
    ) -> Result<TransactionHandle> {
        let call = ContractCall::new("buyTicket").arg(event_id).arg(attachment);
        self.send(signer, call, value).await
    }

    pub async fn batch_buy_tickets(
        &self,
        signer: &Signer,
        event_id: EventId,
        attachments: &[String],
        value: Wei,
    ) -> Result<TransactionHandle> {
        let call = ContractCall::new("batchBuyTickets")
            .arg(event_id)
            .arg(attachments.to_vec());
        self.send(signer, call, value).await
    }

    pub async fn transfer_ticket(
        &self,
        signer: &Signer,
        ticket_id: TicketId,
        to: &Address,
    ) -> Result<TransactionHandle> {
        let call = ContractCall::new("transferTicket").arg(ticket_id).arg(to.clone());
        self.send(signer, call, Wei::ZERO).await
    }

    pub async fn refund_ticket(&self, signer: &Signer, ticket_id: TicketId) -> Result<TransactionHandle> {
        let call = ContractCall::new("refundTicket").arg(ticket_id);
        self.send(signer, call, Wei::ZERO).await
    }

    pub async fn validate_entry(&self, signer: &Signer, ticket_id: TicketId) -> Result<TransactionHandle> {
        let call = ContractCall::new("validateEntry").arg(ticket_id);
        self.send(signer, call, Wei::ZERO).await
    }

    /// `value` is both the recorded purchase price and the amount attached.
    pub async fn admin_mint(
        &self,
        signer: &Signer,
        to: &Address,
        event_id: EventId,
        attachment: &str,
        value: Wei,
    ) -> Result<TransactionHandle> {
        let call = ContractCall::new("adminMint")
            .arg(to.clone())
            .arg(event_id)
            .arg(attachment)
            .arg(value);
        self.send(signer, call, value).await
    }

    pub async fn grant_role(&self, signer: &Signer, role: &RoleId, account: &Address) -> Result<TransactionHandle> {
        let call = ContractCall::new("grantRole").arg(role.clone()).arg(account.clone());
        self.send(signer, call, Wei::ZERO).await
    }

    pub async fn revoke_role(&self, signer: &Signer, role: &RoleId, account: &Address) -> Result<TransactionHandle> {
        let call = ContractCall::new("revokeRole").arg(role.clone()).arg(account.clone());
        self.send(signer, call, Wei::ZERO).await
    }

    pub async fn withdraw_funds(&self, signer: &Signer) -> Result<TransactionHandle> {
        self.send(signer, ContractCall::new("withdrawFunds"), Wei::ZERO)
            .await
    }

    /// Polls for the receipt until the ledger reports inclusion. Always ends in
    /// a receipt or an error: a revert, too many failed polls, or the timeout.
    pub async fn wait_for_confirmation(
        &self,
        handle: &TransactionHandle,
        settings: ConfirmationSettings,
    ) -> Result<Receipt> {
        let deadline = Instant::now() + settings.timeout;
        let mut failures = 0u32;
        loop {
            match self.ledger.receipt(&handle.hash).await {
                Ok(Some(receipt)) if receipt.status => {
                    info!(
                        "Transaction {} confirmed in block {}",
                        handle.hash, receipt.block_number
                    );
                    return Ok(receipt);
                }
                Ok(Some(receipt)) => {
                    warn!(
                        "Transaction {} reverted: {:?}",
                        handle.hash, receipt.revert_reason
                    );
                    return Err(ClientError::reverted(receipt.revert_reason));
                }
                Ok(None) => {
                    failures = 0;
                    debug!("Transaction {} still pending", handle.hash);
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        "Receipt poll {} for {} failed: {}",
                        failures, handle.hash, e
                    );
                    if failures > settings.max_poll_failures {
                        return Err(e);
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(ClientError::ReadFailed(format!(
                    "no receipt for {} within {}s",
                    handle.hash,
                    settings.timeout.as_secs()
                )));
            }
            tokio::time::sleep(settings.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::WalletSession;
    use crate::testutils::{FakeLedger, alice, fast_confirmations};

    async fn connected(fake: &Arc<FakeLedger>) -> (ContractGateway, Signer) {
        fake.set_accounts(vec![alice()]);
        let session = WalletSession::new(fake.clone());
        session.connect().await.unwrap();
        (ContractGateway::new(fake.clone(), fake.clone()), session.signer().unwrap())
    }

    #[tokio::test]
    async fn reads_need_no_signer() {
        let fake = FakeLedger::new();
        fake.add_event("Opening Night", Wei::new(1000), true);
        let gateway = ContractGateway::new(fake.clone(), fake.clone());
        assert_eq!(gateway.get_event(1).await.unwrap().name, "Opening Night");
        assert!(!gateway.get_event(2).await.unwrap().exists());
    }

    #[tokio::test]
    async fn writes_return_a_handle_before_confirmation() {
        let fake = FakeLedger::new();
        fake.add_event("Opening Night", Wei::new(1000), true);
        fake.hold_receipts(true);
        let (gateway, signer) = connected(&fake).await;

        let handle = gateway
            .buy_ticket(&signer, 1, "ipfs://a", Wei::new(1000))
            .await
            .unwrap();
        assert!(fake.receipt(&handle.hash).await.unwrap().is_none());

        fake.hold_receipts(false);
        let receipt = gateway
            .wait_for_confirmation(&handle, fast_confirmations())
            .await
            .unwrap();
        assert!(receipt.status);
    }

    #[tokio::test]
    async fn reverted_receipt_carries_the_reason() {
        let fake = FakeLedger::new();
        fake.add_event("Opening Night", Wei::new(1000), true);
        let (gateway, signer) = connected(&fake).await;

        let handle = gateway
            .buy_ticket(&signer, 1, "ipfs://a", Wei::new(1))
            .await
            .unwrap();
        let err = gateway
            .wait_for_confirmation(&handle, fast_confirmations())
            .await
            .unwrap_err();
        assert_eq!(err.revert_reason(), Some("Incorrect payment amount"));
    }

    #[tokio::test]
    async fn pending_transaction_times_out_into_a_failure() {
        let fake = FakeLedger::new();
        fake.hold_receipts(true);
        let (gateway, signer) = connected(&fake).await;
        let handle = gateway.withdraw_funds(&signer).await.unwrap();

        let settings = ConfirmationSettings {
            poll_interval: Duration::from_millis(5),
            timeout: Duration::from_millis(30),
            max_poll_failures: 3,
        };
        let err = gateway.wait_for_confirmation(&handle, settings).await.unwrap_err();
        assert!(matches!(err, ClientError::ReadFailed(_)));
    }

    #[tokio::test]
    async fn repeated_poll_failures_give_up() {
        let fake = FakeLedger::new();
        let (gateway, signer) = connected(&fake).await;
        fake.add_role_member(ticket_api::Role::Organizer, alice());
        let handle = gateway.withdraw_funds(&signer).await.unwrap();

        fake.fail_receipt_reads(true);
        let err = gateway
            .wait_for_confirmation(&handle, fast_confirmations())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ReadFailed(_)));
    }

    #[tokio::test]
    async fn rejected_signature_is_user_rejected() {
        let fake = FakeLedger::new();
        let (gateway, signer) = connected(&fake).await;
        fake.reject_signatures(true);
        assert_eq!(
            gateway.refund_ticket(&signer, 1).await,
            Err(ClientError::UserRejected)
        );
    }
}
