use shared::{
    error::PayloadError,
    protocol::{
        DeliveryLocationPayload, ShipmentPayload, DELIVERY_LOCATION_TOPIC, SHIPPING_TOPIC,
    },
};
use tracing::{debug, warn};

use crate::store::{DeliveryChange, ReconciliationStore, ShipmentChange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Shipping,
    DeliveryLocation,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::Shipping, Topic::DeliveryLocation];

    pub fn parse(destination: &str) -> Option<Self> {
        match destination {
            SHIPPING_TOPIC => Some(Self::Shipping),
            DELIVERY_LOCATION_TOPIC => Some(Self::DeliveryLocation),
            _ => None,
        }
    }

    pub fn destination(self) -> &'static str {
        match self {
            Self::Shipping => SHIPPING_TOPIC,
            Self::DeliveryLocation => DELIVERY_LOCATION_TOPIC,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Shipment(ShipmentChange),
    Delivery(DeliveryChange),
    /// Payload bytes were not a JSON object of the expected shape.
    Malformed { topic: Topic, error: PayloadError },
    UnknownTopic(String),
}

impl DispatchOutcome {
    pub fn touches_deliveries(&self) -> bool {
        matches!(self, Self::Delivery(change) if change.is_mutation())
    }
}

impl ReconciliationStore {
    /// Routes one broker message to the matching store operation. Never
    /// fails: bad payloads are reported in the outcome and otherwise ignored.
    pub fn handle(&mut self, topic: &str, payload: &[u8]) -> DispatchOutcome {
        let Some(parsed) = Topic::parse(topic) else {
            debug!(topic, "dispatch: ignoring message on unknown topic");
            return DispatchOutcome::UnknownTopic(topic.to_string());
        };

        match parsed {
            Topic::Shipping => match serde_json::from_slice::<ShipmentPayload>(payload) {
                Ok(event) => DispatchOutcome::Shipment(self.apply_shipment_event(event)),
                Err(err) => malformed(parsed, err),
            },
            Topic::DeliveryLocation => {
                match serde_json::from_slice::<DeliveryLocationPayload>(payload) {
                    Ok(event) => {
                        DispatchOutcome::Delivery(self.apply_delivery_position_event(event))
                    }
                    Err(err) => malformed(parsed, err),
                }
            }
        }
    }
}

fn malformed(topic: Topic, err: serde_json::Error) -> DispatchOutcome {
    warn!(
        topic = topic.destination(),
        error = %err,
        "dispatch: dropping undecodable payload"
    );
    DispatchOutcome::Malformed {
        topic,
        error: err.into(),
    }
}
