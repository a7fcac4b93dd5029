//! Visibility window for delivered records.
//!
//! One predicate decides whether a delivered record is still shown. The
//! store applies it at snapshot load, on every shipment event, on the
//! periodic sweep, and when restoring persisted deliveries.

use chrono::{DateTime, TimeDelta, Utc};
use shared::domain::{DeliveryPositionRecord, ShipmentRecord, ShipmentStatus};

pub const DEFAULT_DELIVERED_WINDOW: TimeDelta = TimeDelta::hours(24);
/// 4.56 hours.
pub const DEFAULT_RESTORE_WINDOW: TimeDelta = TimeDelta::seconds(16_416);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    /// How long a delivered record stays visible after `createdDate`.
    pub delivered_window: TimeDelta,
    /// Maximum age of a persisted delivery blob that may still be restored.
    pub restore_window: TimeDelta,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            delivered_window: DEFAULT_DELIVERED_WINDOW,
            restore_window: DEFAULT_RESTORE_WINDOW,
        }
    }
}

impl FreshnessPolicy {
    pub fn is_recently_delivered(&self, record: &ShipmentRecord, now: DateTime<Utc>) -> bool {
        is_recently_delivered(
            &record.status,
            record.created_date,
            now,
            self.delivered_window,
        )
    }

    /// Delivery pings carry no `createdDate`; their receipt `timestamp` plays that role.
    pub fn is_delivery_fresh(&self, record: &DeliveryPositionRecord, now: DateTime<Utc>) -> bool {
        !record.is_delivered() || now - record.timestamp <= self.delivered_window
    }

    pub fn is_blob_restorable(&self, captured_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - captured_at <= self.restore_window
    }
}

/// True for every non-delivered status. Delivered records without a
/// `created_date` fail closed.
pub fn is_recently_delivered(
    status: &ShipmentStatus,
    created_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: TimeDelta,
) -> bool {
    if !status.is_delivered() {
        return true;
    }
    match created_date {
        Some(created_date) => now - created_date <= window,
        None => false,
    }
}
