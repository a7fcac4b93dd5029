use std::{collections::HashMap, sync::Arc};

use chrono::TimeDelta;
use shared::{
    domain::{DeliveryPositionRecord, ShipmentId, ShipmentRecord, TrackingNumber},
    error::PayloadError,
    protocol::{DeliveryLocationPayload, PersistedDeliveries, ShipmentPayload},
};
use tracing::debug;

use crate::{clock::Clock, freshness::FreshnessPolicy};

/// Effect of one shipment event on the working set.
#[derive(Debug, Clone, PartialEq)]
pub enum ShipmentChange {
    /// New record placed at the front of the sequence.
    Inserted(ShipmentRecord),
    /// Existing record replaced at its current position.
    Replaced(ShipmentRecord),
    /// Identical replay of the record already held.
    Unchanged(ShipmentId),
    /// Delivered outside the visibility window; the record was evicted.
    Removed(ShipmentId),
    /// Delivered outside the visibility window and not held anyway.
    Ignored(ShipmentId),
    Discarded(PayloadError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryChange {
    Upserted {
        record: DeliveryPositionRecord,
        created: bool,
    },
    Discarded(PayloadError),
}

impl DeliveryChange {
    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::Upserted { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub shipments_removed: usize,
    pub deliveries_removed: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.shipments_removed == 0 && self.deliveries_removed == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Nothing was persisted, or the blob could not be read.
    Empty,
    /// The blob was older than the restore window and was discarded.
    Expired { age: TimeDelta },
    Restored { restored: usize, dropped_stale: usize },
}

/// In-memory working set merged from the REST snapshot and the live feed.
///
/// Shipments are kept newest-first; deliveries are keyed by tracking
/// number. At most one record exists per key in either collection.
pub struct ReconciliationStore {
    clock: Arc<dyn Clock>,
    policy: FreshnessPolicy,
    shipments: Vec<ShipmentRecord>,
    deliveries: HashMap<TrackingNumber, DeliveryPositionRecord>,
}

impl ReconciliationStore {
    pub fn new(clock: Arc<dyn Clock>, policy: FreshnessPolicy) -> Self {
        Self {
            clock,
            policy,
            shipments: Vec::new(),
            deliveries: HashMap::new(),
        }
    }

    pub fn policy(&self) -> FreshnessPolicy {
        self.policy
    }

    pub fn is_recently_delivered(&self, record: &ShipmentRecord) -> bool {
        self.policy.is_recently_delivered(record, self.clock.now())
    }

    /// Replaces the shipment sequence with the snapshot minus stale
    /// delivered records. Returns how many records were kept.
    pub fn load_snapshot(&mut self, records: Vec<ShipmentRecord>) -> usize {
        let now = self.clock.now();
        let policy = self.policy;
        let received = records.len();
        self.shipments = records
            .into_iter()
            .filter(|record| policy.is_recently_delivered(record, now))
            .collect();
        debug!(
            received,
            kept = self.shipments.len(),
            "store: snapshot loaded"
        );
        self.shipments.len()
    }

    pub fn apply_shipment_event(&mut self, payload: ShipmentPayload) -> ShipmentChange {
        let record = match payload.into_event_record() {
            Ok(record) => record,
            Err(err) => {
                debug!(error = %err, "store: discarding shipment event");
                return ShipmentChange::Discarded(err);
            }
        };
        self.apply_shipment_record(record)
    }

    pub fn apply_shipment_record(&mut self, record: ShipmentRecord) -> ShipmentChange {
        let existing = self
            .shipments
            .iter()
            .position(|held| held.shipping_id == record.shipping_id);

        if record.status.is_delivered() && !self.is_recently_delivered(&record) {
            return match existing {
                Some(index) => {
                    let removed = self.shipments.remove(index);
                    ShipmentChange::Removed(removed.shipping_id)
                }
                None => ShipmentChange::Ignored(record.shipping_id),
            };
        }

        match existing {
            Some(index) if self.shipments[index] == record => {
                ShipmentChange::Unchanged(record.shipping_id)
            }
            Some(index) => {
                self.shipments[index] = record.clone();
                ShipmentChange::Replaced(record)
            }
            None => {
                self.shipments.insert(0, record.clone());
                ShipmentChange::Inserted(record)
            }
        }
    }

    pub fn apply_delivery_position_event(
        &mut self,
        payload: DeliveryLocationPayload,
    ) -> DeliveryChange {
        let record = match payload.into_record(self.clock.now()) {
            Ok(record) => record,
            Err(err) => {
                debug!(error = %err, "store: discarding delivery position event");
                return DeliveryChange::Discarded(err);
            }
        };
        let created = self
            .deliveries
            .insert(record.tracking_number.clone(), record.clone())
            .is_none();
        DeliveryChange::Upserted { record, created }
    }

    /// Drops every record that no longer passes the freshness policy.
    pub fn sweep(&mut self) -> SweepReport {
        let now = self.clock.now();
        let policy = self.policy;

        let shipments_before = self.shipments.len();
        self.shipments
            .retain(|record| policy.is_recently_delivered(record, now));
        let deliveries_before = self.deliveries.len();
        self.deliveries
            .retain(|_, record| policy.is_delivery_fresh(record, now));

        SweepReport {
            shipments_removed: shipments_before - self.shipments.len(),
            deliveries_removed: deliveries_before - self.deliveries.len(),
        }
    }

    /// Blob to write to durable storage, stamped with the current time.
    pub fn persisted_deliveries(&self) -> PersistedDeliveries {
        let mut deliveries: Vec<_> = self.deliveries.values().cloned().collect();
        deliveries.sort_by(|a, b| a.tracking_number.cmp(&b.tracking_number));
        PersistedDeliveries {
            deliveries,
            timestamp: self.clock.now(),
        }
    }

    /// Seeds the delivery set from a persisted blob. The whole blob is
    /// discarded once it is older than the restore window; inside the window
    /// each record must still pass the delivery freshness check.
    pub fn restore(&mut self, blob: Option<PersistedDeliveries>) -> RestoreOutcome {
        self.deliveries.clear();
        let Some(blob) = blob else {
            return RestoreOutcome::Empty;
        };

        let now = self.clock.now();
        if !self.policy.is_blob_restorable(blob.timestamp, now) {
            return RestoreOutcome::Expired {
                age: now - blob.timestamp,
            };
        }

        let total = blob.deliveries.len();
        for record in blob.deliveries {
            if self.policy.is_delivery_fresh(&record, now) {
                self.deliveries.insert(record.tracking_number.clone(), record);
            }
        }
        let restored = self.deliveries.len();
        RestoreOutcome::Restored {
            restored,
            dropped_stale: total - restored,
        }
    }

    pub fn current_shipments(&self) -> &[ShipmentRecord] {
        &self.shipments
    }

    pub fn current_deliveries(&self) -> impl Iterator<Item = &DeliveryPositionRecord> {
        self.deliveries.values()
    }

    pub fn displayable_shipments(&self) -> impl Iterator<Item = &ShipmentRecord> {
        self.shipments.iter().filter(|record| record.is_displayable())
    }

    pub fn shipment(&self, shipping_id: &ShipmentId) -> Option<&ShipmentRecord> {
        self.shipments
            .iter()
            .find(|record| &record.shipping_id == shipping_id)
    }

    pub fn delivery(&self, tracking_number: &TrackingNumber) -> Option<&DeliveryPositionRecord> {
        self.deliveries.get(tracking_number)
    }

    pub fn shipment_count(&self) -> usize {
        self.shipments.len()
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.len()
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
