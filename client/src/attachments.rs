//! Off-chain ticket attachments.
//!
//! Each ticket carries the content identifier of a small JSON document in a
//! content-addressed store. The ledger only records the identifier.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use ticket_api::EventId;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::inventory::MAX_BATCH_QUANTITY;

#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Stores `content` and returns its identifier, e.g. `ipfs://Qm...`.
    async fn put(&self, name: &str, content: Vec<u8>) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

/// IPFS HTTP API (`POST /api/v0/add`).
pub struct HttpAttachmentStore {
    http: reqwest::Client,
    url: String,
}

impl HttpAttachmentStore {
    pub fn new(url: &str) -> Self {
        HttpAttachmentStore {
            http: reqwest::Client::new(),
            url: url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AttachmentStore for HttpAttachmentStore {
    async fn put(&self, name: &str, content: Vec<u8>) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(content).file_name(name.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self
            .http
            .post(format!("{}/api/v0/add", self.url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ClientError::Attachment(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Attachment(format!("{}: {}", status, body)));
        }
        let added: AddResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Attachment(e.to_string()))?;
        debug!("Stored {} as {}", name, added.hash);
        Ok(format!("ipfs://{}", added.hash))
    }
}

/// Uploads one document per ticket and returns `quantity` distinct identifiers.
pub async fn generate_ticket_attachments(
    store: &dyn AttachmentStore,
    event_id: EventId,
    quantity: u64,
) -> Result<Vec<String>> {
    if !(1..=MAX_BATCH_QUANTITY).contains(&quantity) {
        return Err(ClientError::InvalidInput(format!(
            "quantity must be between 1 and {}, got {}",
            MAX_BATCH_QUANTITY, quantity
        )));
    }
    let mut cids = Vec::with_capacity(quantity as usize);
    let mut seen = HashSet::new();
    for unit in 1..=quantity {
        let serial = Uuid::new_v4();
        let document = json!({
            "eventId": event_id,
            "serial": serial.to_string(),
            "unit": unit,
            "issuedAt": Utc::now().to_rfc3339(),
        });
        let content = serde_json::to_vec(&document)
            .map_err(|e| ClientError::Attachment(e.to_string()))?;
        let cid = store
            .put(&format!("ticket-{}-{}.json", event_id, serial), content)
            .await?;
        if !seen.insert(cid.clone()) {
            return Err(ClientError::Attachment(format!(
                "store returned duplicate identifier {}",
                cid
            )));
        }
        cids.push(cid);
    }
    info!("Prepared {} attachments for event #{}", cids.len(), event_id);
    Ok(cids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::MemoryAttachmentStore;

    #[tokio::test]
    async fn one_distinct_identifier_per_ticket() {
        let store = MemoryAttachmentStore::default();
        for q in 1..=MAX_BATCH_QUANTITY {
            let cids = generate_ticket_attachments(&store, 3, q).await.unwrap();
            assert_eq!(cids.len() as u64, q);
            let distinct: HashSet<_> = cids.iter().collect();
            assert_eq!(distinct.len() as u64, q);
        }
    }

    #[tokio::test]
    async fn documents_name_the_event() {
        let store = MemoryAttachmentStore::default();
        let cids = generate_ticket_attachments(&store, 9, 1).await.unwrap();
        let doc: serde_json::Value =
            serde_json::from_slice(&store.get(&cids[0]).unwrap()).unwrap();
        assert_eq!(doc["eventId"], 9);
        assert!(Uuid::parse_str(doc["serial"].as_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn quantity_is_bounded() {
        let store = MemoryAttachmentStore::default();
        assert!(generate_ticket_attachments(&store, 1, 0).await.is_err());
        assert!(generate_ticket_attachments(&store, 1, 11).await.is_err());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn store_failures_surface() {
        let store = MemoryAttachmentStore::default();
        store.fail(true);
        assert!(matches!(
            generate_ticket_attachments(&store, 1, 2).await,
            Err(ClientError::Attachment(_))
        ));
    }
}
