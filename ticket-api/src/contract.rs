use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::rpc::{RpcClient, RpcError};
use crate::types::{
    Address, ContractCall, EventId, EventRecord, Receipt, Role, RoleId, TicketRecord, TxHash,
};

#[derive(Debug, Serialize)]
struct ReadRequest<'a> {
    to: &'a Address,
    #[serde(flatten)]
    call: ContractCall,
}

/// Read-only view of the deployed ticketing contract. Reads need no signing
/// identity; writes go through the wallet provider instead.
#[derive(Debug)]
pub struct TicketingContractClient {
    rpc: RpcClient,
    contract: Address,
}

impl TicketingContractClient {
    pub fn new(url: impl Into<String>, contract: Address) -> Self {
        TicketingContractClient {
            rpc: RpcClient::new(url),
            contract,
        }
    }

    pub fn contract(&self) -> &Address {
        &self.contract
    }

    async fn read<R: DeserializeOwned>(&self, call: ContractCall) -> Result<R, RpcError> {
        debug!(function = %call.function, args = ?call.args, "Contract read");
        let request = ReadRequest {
            to: &self.contract,
            call,
        };
        self.rpc.call("ticketing_call", (request,)).await
    }

    pub async fn events(&self, id: EventId) -> Result<EventRecord, RpcError> {
        self.read(ContractCall::new("events").arg(id)).await
    }

    /// Reads `ORGANIZER_ROLE()` or `VALIDATOR_ROLE()`.
    pub async fn role_identifier(&self, role: Role) -> Result<RoleId, RpcError> {
        self.read(ContractCall::new(role.getter())).await
    }

    pub async fn has_role(&self, role: &RoleId, account: &Address) -> Result<bool, RpcError> {
        self.read(
            ContractCall::new("hasRole")
                .arg(role.clone())
                .arg(account.clone()),
        )
        .await
    }

    pub async fn get_tickets_by_user_paginated(
        &self,
        account: &Address,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<TicketRecord>, RpcError> {
        self.read(
            ContractCall::new("getTicketsByUserPaginated")
                .arg(account.clone())
                .arg(offset)
                .arg(limit),
        )
        .await
    }

    /// `None` while the transaction has not been included yet.
    pub async fn get_transaction_receipt(&self, hash: &TxHash) -> Result<Option<Receipt>, RpcError> {
        self.rpc.call("eth_getTransactionReceipt", (hash,)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn read_request_flattens_the_call() {
        let contract = Address::parse("0x00000000000000000000000000000000000000aa").unwrap();
        let request = ReadRequest {
            to: &contract,
            call: ContractCall::new("events").arg(3u64),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "to": "0x00000000000000000000000000000000000000aa",
                "function": "events",
                "args": [3]
            })
        );
    }
}
