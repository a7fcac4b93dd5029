use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use shared::{
    domain::ShipmentRecord,
    protocol::{ShipmentPayload, ShipmentsResponse},
};
use tracing::{info, warn};
use url::Url;

use crate::error::SnapshotError;

/// Source of the one-shot shipment snapshot.
#[async_trait]
pub trait ShipmentSource: Send + Sync {
    async fn fetch_shipments(&self) -> Result<Vec<ShipmentRecord>, SnapshotError>;
}

/// Fetches `GET <endpoint>[?size=N]` and decodes `{ "data": [...] }`.
pub struct SnapshotLoader {
    http: Client,
    endpoint: Url,
    page_size: Option<u32>,
}

impl SnapshotLoader {
    pub fn new(endpoint: &str, page_size: Option<u32>) -> Result<Self, SnapshotError> {
        let endpoint = Url::parse(endpoint).map_err(|source| SnapshotError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            source,
        })?;
        Ok(Self {
            http: Client::new(),
            endpoint,
            page_size,
        })
    }

    pub fn request_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        if let Some(size) = self.page_size {
            url.query_pairs_mut().append_pair("size", &size.to_string());
        }
        url
    }
}

#[async_trait]
impl ShipmentSource for SnapshotLoader {
    async fn fetch_shipments(&self) -> Result<Vec<ShipmentRecord>, SnapshotError> {
        let url = self.request_url();
        let res = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(SnapshotError::Request)?;
        let status = res.status();
        if !status.is_success() {
            return Err(SnapshotError::Status(status));
        }
        let body: ShipmentsResponse = res.json().await.map_err(SnapshotError::Decode)?;
        let rows = body.data.len();
        let records = decode_rows(body.data);
        info!(
            url = %url,
            rows,
            accepted = records.len(),
            "snapshot: fetched shipments"
        );
        Ok(records)
    }
}

/// Rows without a usable `shippingId`/`status` are skipped individually.
pub fn decode_rows(rows: Vec<Value>) -> Vec<ShipmentRecord> {
    rows.into_iter()
        .enumerate()
        .filter_map(|(index, row)| {
            let decoded = serde_json::from_value::<ShipmentPayload>(row)
                .map_err(|err| err.to_string())
                .and_then(|payload| payload.into_snapshot_record().map_err(|err| err.to_string()));
            match decoded {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(index, error = %err, "snapshot: skipping shipment row");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
#[path = "tests/snapshot_tests.rs"]
mod tests;
