//! Live shipment tracking: a reconciliation store fed by a REST snapshot and
//! a STOMP event feed, with durable courier positions and route selection.

use shared::domain::{DeliveryPositionRecord, ShipmentId, ShipmentRecord};

pub mod clock;
pub mod dispatch;
pub mod error;
pub mod freshness;
pub mod persistence;
pub mod route;
pub mod snapshot;
pub mod stomp;
pub mod store;
pub mod subscriber;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{DispatchOutcome, Topic};
pub use error::{SnapshotError, StompError};
pub use freshness::{is_recently_delivered, FreshnessPolicy};
pub use persistence::{DeliveryPersistence, MemoryPersistence};
pub use route::{FixedLocation, LocationProvider, RoutePlanner, RouteToggle, UnavailableLocation};
pub use snapshot::{ShipmentSource, SnapshotLoader};
pub use store::{
    DeliveryChange, ReconciliationStore, RestoreOutcome, ShipmentChange, SweepReport,
};
pub use subscriber::{EventSink, LiveEventSubscriber, SubscriberConfig};
pub use tracker::{LiveTracker, TrackerHandle};

/// Change notification for presentation layers.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    SnapshotLoaded {
        shipments: usize,
    },
    ShipmentUpserted {
        record: ShipmentRecord,
        inserted: bool,
    },
    ShipmentRemoved {
        shipping_id: ShipmentId,
    },
    DeliveryUpdated {
        record: DeliveryPositionRecord,
    },
    DeliveriesRestored {
        count: usize,
    },
    Swept(SweepReport),
    BrokerConnected,
    BrokerDisconnected,
}
