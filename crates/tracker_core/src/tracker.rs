use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use shared::domain::{DeliveryPositionRecord, ShipmentId, ShipmentRecord};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    dispatch::DispatchOutcome,
    error::SnapshotError,
    freshness::FreshnessPolicy,
    persistence::DeliveryPersistence,
    snapshot::ShipmentSource,
    store::{DeliveryChange, ReconciliationStore, RestoreOutcome, ShipmentChange, SweepReport},
    subscriber::{EventSink, LiveEventSubscriber},
    TrackerEvent,
};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const EVENT_CHANNEL_CAPACITY: usize = 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// The working set plus everything it is wired to: clock, durable delivery
/// storage, and the change-notification channel.
///
/// All mutations go through one async mutex, so each trigger (snapshot
/// completion, broker message, sweep tick) runs to completion before the
/// next one starts.
pub struct LiveTracker {
    store: Mutex<ReconciliationStore>,
    persistence: Arc<dyn DeliveryPersistence>,
    events: broadcast::Sender<TrackerEvent>,
}

impl LiveTracker {
    pub fn new(
        clock: Arc<dyn Clock>,
        policy: FreshnessPolicy,
        persistence: Arc<dyn DeliveryPersistence>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            store: Mutex::new(ReconciliationStore::new(clock, policy)),
            persistence,
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: TrackerEvent) {
        let _ = self.events.send(event);
    }

    /// Seeds deliveries from durable storage. A read failure or corrupt blob
    /// is logged and treated as nothing persisted.
    pub async fn restore(&self) -> RestoreOutcome {
        let blob = match self.persistence.load().await {
            Ok(blob) => blob,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "tracker: ignoring unreadable persisted deliveries");
                None
            }
        };

        let outcome = self.store.lock().await.restore(blob);
        match &outcome {
            RestoreOutcome::Empty => debug!("tracker: no persisted deliveries"),
            RestoreOutcome::Expired { age } => {
                info!(
                    age_secs = age.num_seconds(),
                    "tracker: persisted deliveries too old, starting empty"
                );
                if let Err(err) = self.persistence.clear().await {
                    warn!(error = %format!("{err:#}"), "tracker: failed to drop expired deliveries");
                }
            }
            RestoreOutcome::Restored {
                restored,
                dropped_stale,
            } => {
                info!(
                    restored,
                    dropped_stale, "tracker: restored persisted deliveries"
                );
                self.emit(TrackerEvent::DeliveriesRestored { count: *restored });
            }
        }
        outcome
    }

    /// Writes the current delivery set. Failures are logged, never returned.
    pub async fn persist(&self) {
        let store = self.store.lock().await;
        self.persist_locked(&store).await;
    }

    async fn persist_locked(&self, store: &ReconciliationStore) {
        let blob = store.persisted_deliveries();
        if let Err(err) = self.persistence.save(&blob).await {
            warn!(
                error = %format!("{err:#}"),
                deliveries = blob.deliveries.len(),
                "tracker: failed to persist active deliveries"
            );
        }
    }

    pub async fn load_snapshot(&self, records: Vec<ShipmentRecord>) -> usize {
        let kept = self.store.lock().await.load_snapshot(records);
        self.emit(TrackerEvent::SnapshotLoaded { shipments: kept });
        kept
    }

    /// Fetches and applies the snapshot. On failure the error is logged and
    /// the working set is left exactly as it was.
    pub async fn load_snapshot_from(
        &self,
        source: &dyn ShipmentSource,
    ) -> Result<usize, SnapshotError> {
        match source.fetch_shipments().await {
            Ok(records) => Ok(self.load_snapshot(records).await),
            Err(err) => {
                error!(error = %err, "tracker: error fetching shipment snapshot");
                Err(err)
            }
        }
    }

    /// Applies one broker message and publishes whatever changed.
    pub async fn handle(&self, topic: &str, payload: &[u8]) -> DispatchOutcome {
        let mut store = self.store.lock().await;
        let outcome = store.handle(topic, payload);
        if outcome.touches_deliveries() {
            self.persist_locked(&store).await;
        }
        drop(store);

        match &outcome {
            DispatchOutcome::Shipment(change) => self.emit_shipment_change(change),
            DispatchOutcome::Delivery(DeliveryChange::Upserted { record, .. }) => {
                self.emit(TrackerEvent::DeliveryUpdated {
                    record: record.clone(),
                })
            }
            _ => {}
        }
        outcome
    }

    fn emit_shipment_change(&self, change: &ShipmentChange) {
        match change {
            ShipmentChange::Inserted(record) => self.emit(TrackerEvent::ShipmentUpserted {
                record: record.clone(),
                inserted: true,
            }),
            ShipmentChange::Replaced(record) => self.emit(TrackerEvent::ShipmentUpserted {
                record: record.clone(),
                inserted: false,
            }),
            ShipmentChange::Removed(shipping_id) => self.emit(TrackerEvent::ShipmentRemoved {
                shipping_id: shipping_id.clone(),
            }),
            ShipmentChange::Unchanged(_)
            | ShipmentChange::Ignored(_)
            | ShipmentChange::Discarded(_) => {}
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        let mut store = self.store.lock().await;
        let report = store.sweep();
        if report.deliveries_removed > 0 {
            self.persist_locked(&store).await;
        }
        drop(store);

        if !report.is_empty() {
            info!(
                shipments_removed = report.shipments_removed,
                deliveries_removed = report.deliveries_removed,
                "tracker: swept expired records"
            );
            self.emit(TrackerEvent::Swept(report));
        }
        report
    }

    pub async fn current_shipments(&self) -> Vec<ShipmentRecord> {
        self.store.lock().await.current_shipments().to_vec()
    }

    pub async fn current_deliveries(&self) -> Vec<DeliveryPositionRecord> {
        self.store
            .lock()
            .await
            .current_deliveries()
            .cloned()
            .collect()
    }

    pub async fn displayable_shipments(&self) -> Vec<ShipmentRecord> {
        self.store
            .lock()
            .await
            .displayable_shipments()
            .cloned()
            .collect()
    }

    pub async fn shipment(&self, shipping_id: &ShipmentId) -> Option<ShipmentRecord> {
        self.store.lock().await.shipment(shipping_id).cloned()
    }

    /// Spawns the broker subscriber and the sweep timer.
    pub fn start(
        self: &Arc<Self>,
        subscriber: LiveEventSubscriber,
        sweep_interval: Duration,
    ) -> TrackerHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let tracker = Arc::clone(self);
        let subscriber_task = tokio::spawn(async move {
            subscriber.run_until(tracker.as_ref(), shutdown_rx).await;
        });

        let tracker = Arc::clone(self);
        let first_sweep = Instant::now() + sweep_interval;
        let sweep_task = tokio::spawn(async move {
            let mut timer = interval_at(first_sweep, sweep_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks = IntervalStream::new(timer);
            while ticks.next().await.is_some() {
                tracker.sweep().await;
            }
        });

        TrackerHandle {
            shutdown,
            subscriber_task,
            sweep_task,
        }
    }
}

#[async_trait]
impl EventSink for LiveTracker {
    async fn on_message(&self, destination: &str, body: &[u8]) {
        self.handle(destination, body).await;
    }

    async fn on_connection_change(&self, connected: bool) {
        self.emit(if connected {
            TrackerEvent::BrokerConnected
        } else {
            TrackerEvent::BrokerDisconnected
        });
    }
}

/// Background work started by [`LiveTracker::start`]. Dropping the handle
/// aborts both tasks without saying goodbye to the broker.
pub struct TrackerHandle {
    shutdown: watch::Sender<bool>,
    subscriber_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
}

impl TrackerHandle {
    /// Asks the subscriber to DISCONNECT, waits briefly for it, then stops
    /// the sweep timer.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if timeout(SHUTDOWN_GRACE, &mut self.subscriber_task)
            .await
            .is_err()
        {
            warn!("tracker: subscriber did not stop in time, aborting");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.subscriber_task.is_finished() && self.sweep_task.is_finished()
    }
}

impl Drop for TrackerHandle {
    fn drop(&mut self) {
        self.subscriber_task.abort();
        self.sweep_task.abort();
    }
}

#[cfg(test)]
#[path = "tests/tracker_tests.rs"]
mod tests;
