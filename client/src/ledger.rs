//! Read side of the ticketing contract, as the rest of the core sees it.

use async_trait::async_trait;
use ticket_api::contract::TicketingContractClient;
use ticket_api::rpc::RpcError;
use ticket_api::{Address, EventId, EventRecord, Receipt, Role, RoleId, TicketRecord, TxHash};

use crate::error::{ClientError, Result};

#[async_trait]
pub trait ContractLedger: Send + Sync {
    fn contract_address(&self) -> &Address;

    async fn event(&self, id: EventId) -> Result<EventRecord>;

    async fn role_id(&self, role: Role) -> Result<RoleId>;

    async fn has_role(&self, role: &RoleId, account: &Address) -> Result<bool>;

    async fn tickets_by_user_paginated(
        &self,
        account: &Address,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<TicketRecord>>;

    async fn receipt(&self, tx: &TxHash) -> Result<Option<Receipt>>;
}

fn read_failed(e: RpcError) -> ClientError {
    ClientError::ReadFailed(e.to_string())
}

#[async_trait]
impl ContractLedger for TicketingContractClient {
    fn contract_address(&self) -> &Address {
        self.contract()
    }

    async fn event(&self, id: EventId) -> Result<EventRecord> {
        self.events(id).await.map_err(read_failed)
    }

    async fn role_id(&self, role: Role) -> Result<RoleId> {
        self.role_identifier(role).await.map_err(read_failed)
    }

    async fn has_role(&self, role: &RoleId, account: &Address) -> Result<bool> {
        TicketingContractClient::has_role(self, role, account)
            .await
            .map_err(read_failed)
    }

    async fn tickets_by_user_paginated(
        &self,
        account: &Address,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<TicketRecord>> {
        self.get_tickets_by_user_paginated(account, offset, limit)
            .await
            .map_err(read_failed)
    }

    async fn receipt(&self, tx: &TxHash) -> Result<Option<Receipt>> {
        self.get_transaction_receipt(tx).await.map_err(read_failed)
    }
}
