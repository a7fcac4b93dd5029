use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::{
        CourierId, DeliveryPositionRecord, GeoPoint, Location, Numeric, OrderNo, ShipmentId,
        ShipmentRecord, ShipmentStatus, TrackingNumber,
    },
    error::PayloadError,
};

/// Broker destination carrying shipment status/location events.
pub const SHIPPING_TOPIC: &str = "/topic/shipping";
/// Broker destination carrying courier position pings.
pub const DELIVERY_LOCATION_TOPIC: &str = "/topic/delivery/location";
/// Local storage key under which the active delivery set is persisted.
pub const ACTIVE_DELIVERIES_KEY: &str = "activeDeliveries";

/// Shipment as it appears on the wire, before validation.
///
/// Used both for `/topic/shipping` events and for rows of the REST snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipmentPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_id: Option<ShipmentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_number: Option<TrackingNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_no: Option<OrderNo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(
        default,
        deserialize_with = "crate::time::deserialize_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_date: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ShipmentPayload {
    /// Validates a live event: `shippingId`, `status` and `location` are all required.
    pub fn into_event_record(self) -> Result<ShipmentRecord, PayloadError> {
        if self.location.is_none() {
            return Err(PayloadError::MissingField("location"));
        }
        self.into_record()
    }

    /// Validates a snapshot row: only `shippingId` and `status` are required.
    pub fn into_snapshot_record(self) -> Result<ShipmentRecord, PayloadError> {
        self.into_record()
    }

    fn into_record(self) -> Result<ShipmentRecord, PayloadError> {
        let shipping_id = self
            .shipping_id
            .filter(|id| !id.is_blank())
            .ok_or(PayloadError::MissingField("shippingId"))?;
        let status = self
            .status
            .filter(|status| !status.trim().is_empty())
            .ok_or(PayloadError::MissingField("status"))?;

        Ok(ShipmentRecord {
            shipping_id,
            tracking_number: self.tracking_number,
            order_no: self.order_no,
            status: ShipmentStatus::parse(&status),
            location: self.location,
            created_date: self.created_date,
            extra: self.extra,
        })
    }
}

/// Courier position ping from `/topic/delivery/location`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryLocationPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_number: Option<TrackingNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<Numeric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<Numeric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<CourierId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<Numeric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<Numeric>,
}

impl DeliveryLocationPayload {
    /// Builds the record stamped with the local receipt time; any timestamp
    /// carried by the sender is ignored.
    pub fn into_record(
        self,
        received_at: DateTime<Utc>,
    ) -> Result<DeliveryPositionRecord, PayloadError> {
        let tracking_number = self
            .tracking_number
            .filter(|number| !number.is_blank())
            .ok_or(PayloadError::MissingField("trackingNumber"))?;
        let position = match (&self.latitude, &self.longitude) {
            (Some(lat), Some(lng)) => lat
                .value()
                .zip(lng.value())
                .and_then(|(lat, lng)| GeoPoint::new(lat, lng)),
            _ => None,
        };

        Ok(DeliveryPositionRecord {
            tracking_number,
            position,
            status: self
                .status
                .map(|status| status.trim().to_lowercase())
                .unwrap_or_default(),
            user_id: self.user_id,
            timestamp: received_at,
            speed: self.speed.as_ref().and_then(Numeric::value).unwrap_or(0.0),
            accuracy: self.accuracy.as_ref().and_then(Numeric::value),
        })
    }
}

/// Body of `GET <shipments-endpoint>`. Rows stay raw so one bad row cannot
/// fail the whole snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShipmentsResponse {
    #[serde(default)]
    pub data: Vec<Value>,
}

/// Blob stored under [`ACTIVE_DELIVERIES_KEY`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedDeliveries {
    pub deliveries: Vec<DeliveryPositionRecord>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
