use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use serde_json::json;
use shared::{
    domain::{GeoPoint, TrackingNumber},
    protocol::{PersistedDeliveries, ACTIVE_DELIVERIES_KEY},
};
use storage::Storage;
use tokio::sync::broadcast::error::TryRecvError;

use super::*;
use crate::{clock::ManualClock, persistence::MemoryPersistence, subscriber::SubscriberConfig};

const DELIVERY_TOPIC: &str = "/topic/delivery/location";
const SHIPPING_TOPIC: &str = "/topic/shipping";

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn tracker_with(
    persistence: Arc<dyn DeliveryPersistence>,
) -> (Arc<ManualClock>, Arc<LiveTracker>) {
    let clock = Arc::new(ManualClock::new(start()));
    let tracker = LiveTracker::new(clock.clone(), FreshnessPolicy::default(), persistence);
    (clock, tracker)
}

fn ping(tracking_number: &str, status: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "trackingNumber": tracking_number,
        "latitude": 11.56,
        "longitude": "104.91",
        "status": status,
        "userId": 7,
        "speed": 12.5
    }))
    .expect("ping json")
}

fn blob_at(timestamp: DateTime<Utc>, statuses: &[(&str, &str, DateTime<Utc>)]) -> String {
    let deliveries = statuses
        .iter()
        .map(|(number, status, seen)| DeliveryPositionRecord {
            tracking_number: TrackingNumber::from(*number),
            position: GeoPoint::new(11.5, 104.9),
            status: status.to_string(),
            user_id: None,
            timestamp: *seen,
            speed: 0.0,
            accuracy: None,
        })
        .collect();
    serde_json::to_string(&PersistedDeliveries {
        deliveries,
        timestamp,
    })
    .expect("blob json")
}

struct FailingSource;

#[async_trait]
impl ShipmentSource for FailingSource {
    async fn fetch_shipments(&self) -> Result<Vec<ShipmentRecord>, SnapshotError> {
        Err(SnapshotError::Status(reqwest::StatusCode::SERVICE_UNAVAILABLE))
    }
}

struct FixedSource(Vec<ShipmentRecord>);

#[async_trait]
impl ShipmentSource for FixedSource {
    async fn fetch_shipments(&self) -> Result<Vec<ShipmentRecord>, SnapshotError> {
        Ok(self.0.clone())
    }
}

fn record(id: &str, status: &str) -> ShipmentRecord {
    serde_json::from_value::<shared::protocol::ShipmentPayload>(json!({
        "shippingId": id,
        "status": status,
        "location": { "latitude": 11.55, "longitude": 104.92 }
    }))
    .expect("payload")
    .into_snapshot_record()
    .expect("record")
}

#[tokio::test]
async fn delivery_ping_is_persisted_and_broadcast() {
    let persistence = Arc::new(MemoryPersistence::default());
    let (_clock, tracker) = tracker_with(persistence.clone());
    let mut events = tracker.subscribe_events();

    let outcome = tracker.handle(DELIVERY_TOPIC, &ping("TRK-1", "IN_TRANSIT")).await;
    assert!(outcome.touches_deliveries());

    let raw = persistence.raw().await.expect("blob written");
    let blob: PersistedDeliveries = serde_json::from_str(&raw).expect("blob decodes");
    assert_eq!(blob.timestamp, start());
    assert_eq!(blob.deliveries.len(), 1);
    assert_eq!(blob.deliveries[0].status, "in_transit");
    assert_eq!(blob.deliveries[0].speed, 12.5);

    match events.try_recv().expect("event") {
        TrackerEvent::DeliveryUpdated { record } => {
            assert_eq!(record.tracking_number.as_str(), "TRK-1");
            assert_eq!(record.timestamp, start());
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn shipment_events_do_not_touch_persistence() {
    let persistence = Arc::new(MemoryPersistence::default());
    let (_clock, tracker) = tracker_with(persistence.clone());
    let mut events = tracker.subscribe_events();

    let body = serde_json::to_vec(&json!({
        "shippingId": "S-1",
        "status": "PENDING",
        "location": { "latitude": 11.55, "longitude": 104.92 }
    }))
    .expect("json");
    tracker.handle(SHIPPING_TOPIC, &body).await;
    tracker.handle(SHIPPING_TOPIC, &body).await;

    assert!(persistence.raw().await.is_none());
    assert!(matches!(
        events.try_recv(),
        Ok(TrackerEvent::ShipmentUpserted { inserted: true, .. })
    ));
    assert!(matches!(
        events.try_recv(),
        Ok(TrackerEvent::ShipmentUpserted { inserted: false, .. })
    ));
    assert_eq!(tracker.current_shipments().await.len(), 1);
}

#[tokio::test]
async fn malformed_messages_change_nothing() {
    let persistence = Arc::new(MemoryPersistence::default());
    let (_clock, tracker) = tracker_with(persistence.clone());
    let mut events = tracker.subscribe_events();

    let outcome = tracker.handle(DELIVERY_TOPIC, b"{not json").await;
    assert!(matches!(outcome, DispatchOutcome::Malformed { .. }));
    let outcome = tracker.handle("/topic/unknown", b"{}").await;
    assert!(matches!(outcome, DispatchOutcome::UnknownTopic(_)));

    assert!(persistence.raw().await.is_none());
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn restore_keeps_recent_blob() {
    let raw = blob_at(
        start() - TimeDelta::hours(1),
        &[
            ("TRK-1", "in_transit", start() - TimeDelta::hours(1)),
            ("TRK-2", "delivered", start() - TimeDelta::hours(2)),
        ],
    );
    let (_clock, tracker) = tracker_with(Arc::new(MemoryPersistence::with_raw(raw)));
    let mut events = tracker.subscribe_events();

    let outcome = tracker.restore().await;
    assert_eq!(
        outcome,
        RestoreOutcome::Restored {
            restored: 2,
            dropped_stale: 0
        }
    );
    assert_eq!(tracker.current_deliveries().await.len(), 2);
    assert!(matches!(
        events.try_recv(),
        Ok(TrackerEvent::DeliveriesRestored { count: 2 })
    ));
}

#[tokio::test]
async fn restore_discards_blob_older_than_window() {
    let raw = blob_at(
        start() - TimeDelta::hours(5),
        &[("TRK-1", "in_transit", start() - TimeDelta::hours(5))],
    );
    let persistence = Arc::new(MemoryPersistence::with_raw(raw));
    let (_clock, tracker) = tracker_with(persistence.clone());

    let outcome = tracker.restore().await;
    assert_eq!(
        outcome,
        RestoreOutcome::Expired {
            age: TimeDelta::hours(5)
        }
    );
    assert!(tracker.current_deliveries().await.is_empty());
    assert!(persistence.raw().await.is_none());
}

#[tokio::test]
async fn restore_treats_corrupt_blob_as_empty() {
    let (_clock, tracker) =
        tracker_with(Arc::new(MemoryPersistence::with_raw("{\"deliveries\": 3")));
    assert_eq!(tracker.restore().await, RestoreOutcome::Empty);
    assert!(tracker.current_deliveries().await.is_empty());
}

#[tokio::test]
async fn persisted_deliveries_survive_a_new_session() {
    let persistence = Arc::new(MemoryPersistence::default());
    let (clock, tracker) = tracker_with(persistence.clone());
    tracker.handle(DELIVERY_TOPIC, &ping("TRK-1", "in_transit")).await;
    tracker.handle(DELIVERY_TOPIC, &ping("TRK-2", "in_transit")).await;
    drop(tracker);

    clock.advance(TimeDelta::minutes(30));
    let next = LiveTracker::new(clock.clone(), FreshnessPolicy::default(), persistence);
    assert!(matches!(
        next.restore().await,
        RestoreOutcome::Restored { restored: 2, .. }
    ));

    let mut numbers: Vec<_> = next
        .current_deliveries()
        .await
        .into_iter()
        .map(|record| record.tracking_number.to_string())
        .collect();
    numbers.sort();
    assert_eq!(numbers, vec!["TRK-1", "TRK-2"]);
}

#[tokio::test]
async fn sweep_drops_expired_deliveries_and_persists() {
    let persistence = Arc::new(MemoryPersistence::default());
    let (clock, tracker) = tracker_with(persistence.clone());
    tracker.handle(DELIVERY_TOPIC, &ping("TRK-1", "delivered")).await;
    tracker.handle(DELIVERY_TOPIC, &ping("TRK-2", "in_transit")).await;
    let mut events = tracker.subscribe_events();

    clock.advance(TimeDelta::hours(25));
    let report = tracker.sweep().await;
    assert_eq!(report.deliveries_removed, 1);

    let blob: PersistedDeliveries =
        serde_json::from_str(&persistence.raw().await.expect("blob")).expect("decode");
    assert_eq!(blob.timestamp, start() + TimeDelta::hours(25));
    assert_eq!(blob.deliveries.len(), 1);
    assert_eq!(blob.deliveries[0].tracking_number.as_str(), "TRK-2");
    assert!(matches!(events.try_recv(), Ok(TrackerEvent::Swept(r)) if r == report));

    let quiet = tracker.sweep().await;
    assert!(quiet.is_empty());
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn failed_snapshot_leaves_working_set_alone() {
    let (_clock, tracker) = tracker_with(Arc::new(MemoryPersistence::default()));
    tracker
        .load_snapshot_from(&FixedSource(vec![record("S-1", "PENDING")]))
        .await
        .expect("snapshot");

    let err = tracker
        .load_snapshot_from(&FailingSource)
        .await
        .expect_err("snapshot should fail");
    assert!(matches!(err, SnapshotError::Status(_)));
    assert_eq!(tracker.current_shipments().await.len(), 1);
}

#[tokio::test]
async fn snapshot_filters_stale_deliveries_and_announces_count() {
    let (_clock, tracker) = tracker_with(Arc::new(MemoryPersistence::default()));
    let mut events = tracker.subscribe_events();
    let kept = tracker
        .load_snapshot(vec![record("S-1", "PENDING"), record("S-2", "DELIVERED")])
        .await;

    assert_eq!(kept, 1);
    assert!(matches!(
        events.try_recv(),
        Ok(TrackerEvent::SnapshotLoaded { shipments: 1 })
    ));
    assert!(tracker.shipment(&ShipmentId::from("S-2")).await.is_none());
    assert_eq!(tracker.displayable_shipments().await.len(), 1);
}

#[tokio::test]
async fn sqlite_storage_round_trips_deliveries() {
    let storage = Arc::new(Storage::in_memory().await.expect("storage"));
    let (clock, tracker) = tracker_with(storage.clone());
    tracker.handle(DELIVERY_TOPIC, &ping("TRK-9", "in_transit")).await;

    clock.advance(TimeDelta::hours(1));
    let next = LiveTracker::new(clock, FreshnessPolicy::default(), storage);
    assert!(matches!(
        next.restore().await,
        RestoreOutcome::Restored { restored: 1, .. }
    ));
}

#[tokio::test]
async fn background_tasks_run_until_shutdown() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let (_clock, tracker) = tracker_with(Arc::new(MemoryPersistence::default()));
    let config = SubscriberConfig {
        reconnect_delay: Duration::from_millis(20),
        ..SubscriberConfig::new(format!("ws://{addr}/ws"))
    };
    let handle = tracker.start(LiveEventSubscriber::new(config), Duration::from_secs(3600));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished());
    handle.shutdown().await;
    assert!(tracker.current_deliveries().await.is_empty());
}

#[tokio::test]
async fn persisted_coordinates_restore_exactly() {
    let persistence = Arc::new(MemoryPersistence::default());
    let (clock, tracker) = tracker_with(persistence.clone());
    let body = br#"{"trackingNumber":"TRK-F","latitude":15.117113722894978,"longitude":104.91234567890123,"status":"in_transit"}"#;
    tracker.handle(DELIVERY_TOPIC, body).await;
    let before = tracker.current_deliveries().await;
    assert_eq!(before[0].position.map(|p| p.lat), Some(15.117113722894978));

    clock.advance(TimeDelta::minutes(10));
    let next = LiveTracker::new(clock, FreshnessPolicy::default(), persistence);
    next.restore().await;
    assert_eq!(next.current_deliveries().await, before);
}

#[tokio::test(start_paused = true)]
async fn sweep_timer_expires_records_on_schedule() {
    let persistence = Arc::new(MemoryPersistence::default());
    let (clock, tracker) = tracker_with(persistence.clone());
    let delivered = serde_json::to_vec(&json!({
        "shippingId": "S-9",
        "status": "DELIVERED",
        "location": { "latitude": 11.55, "longitude": 104.92 },
        "createdDate": start().to_rfc3339()
    }))
    .expect("json");
    tracker.handle(SHIPPING_TOPIC, &delivered).await;
    tracker.handle(DELIVERY_TOPIC, &ping("TRK-9", "delivered")).await;
    assert_eq!(tracker.current_shipments().await.len(), 1);
    assert_eq!(tracker.current_deliveries().await.len(), 1);

    clock.advance(TimeDelta::hours(25));
    let mut events = tracker.subscribe_events();
    let config = SubscriberConfig::new("not a broker url");
    let handle = tracker.start(LiveEventSubscriber::new(config), Duration::from_secs(3600));

    tokio::time::advance(Duration::from_secs(3599)).await;
    tokio::task::yield_now().await;
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(tracker.current_deliveries().await.len(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    let report = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match events.recv().await {
                Ok(TrackerEvent::Swept(report)) => break report,
                Ok(_) => continue,
                Err(err) => panic!("event channel failed: {err}"),
            }
        }
    })
    .await
    .expect("sweep tick");

    assert_eq!(report.shipments_removed, 1);
    assert_eq!(report.deliveries_removed, 1);
    assert!(tracker.current_shipments().await.is_empty());
    assert!(tracker.current_deliveries().await.is_empty());

    let blob: PersistedDeliveries =
        serde_json::from_str(&persistence.raw().await.expect("blob")).expect("decode");
    assert!(blob.deliveries.is_empty());
    assert_eq!(blob.timestamp, start() + TimeDelta::hours(25));

    handle.shutdown().await;
}

#[tokio::test]
async fn expired_blob_is_removed_from_sqlite_storage() {
    let storage = Arc::new(Storage::in_memory().await.expect("storage"));
    let raw = blob_at(start() - TimeDelta::hours(6), &[]);
    storage
        .set_item(ACTIVE_DELIVERIES_KEY, &raw)
        .await
        .expect("seed blob");

    let (_clock, tracker) = tracker_with(storage.clone());
    assert!(matches!(
        tracker.restore().await,
        RestoreOutcome::Expired { .. }
    ));
    assert_eq!(
        storage.get_item(ACTIVE_DELIVERIES_KEY).await.expect("read"),
        None
    );
}
