use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::domain::{GeoPoint, ShipmentId, ShipmentRecord};
use tracing::{info, warn};

/// One-shot source of the operator's current position.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_position(&self) -> Result<GeoPoint>;
}

/// Position supplied up front, e.g. from configuration.
pub struct FixedLocation(pub GeoPoint);

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn current_position(&self) -> Result<GeoPoint> {
        Ok(self.0)
    }
}

pub struct UnavailableLocation;

#[async_trait]
impl LocationProvider for UnavailableLocation {
    async fn current_position(&self) -> Result<GeoPoint> {
        Err(anyhow!("location is not available on this device"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Route {
    pub from: GeoPoint,
    pub to: GeoPoint,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteToggle {
    Selected { shipping_id: ShipmentId, route: Route },
    Cleared,
    WarehouseNotSet,
    NoCoordinates(ShipmentId),
}

/// Warehouse pin and the route currently shown from a shipment to it.
/// Neither survives a restart.
#[derive(Debug, Default)]
pub struct RoutePlanner {
    warehouse: Option<GeoPoint>,
    selected: Option<Route>,
}

impl RoutePlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the provider once. On failure the previous pin is kept and
    /// route display stays unavailable if there was none.
    pub async fn pin_warehouse(&mut self, provider: &dyn LocationProvider) -> Option<GeoPoint> {
        match provider.current_position().await {
            Ok(point) => {
                info!(lat = point.lat, lng = point.lng, "route: warehouse pinned");
                self.warehouse = Some(point);
            }
            Err(err) => warn!(error = %err, "route: could not read current location"),
        }
        self.warehouse
    }

    pub fn warehouse(&self) -> Option<GeoPoint> {
        self.warehouse
    }

    pub fn selected(&self) -> Option<Route> {
        self.selected
    }

    /// Selecting the shipment that is already the route origin clears the route.
    pub fn toggle_route(&mut self, shipment: &ShipmentRecord) -> RouteToggle {
        let Some(warehouse) = self.warehouse else {
            info!(
                shipping_id = %shipment.shipping_id,
                "route: pin a warehouse location before selecting a shipment"
            );
            return RouteToggle::WarehouseNotSet;
        };
        let Some(origin) = shipment.point() else {
            return RouteToggle::NoCoordinates(shipment.shipping_id.clone());
        };

        if self.selected.is_some_and(|route| route.from == origin) {
            self.selected = None;
            return RouteToggle::Cleared;
        }

        let route = Route {
            from: origin,
            to: warehouse,
        };
        self.selected = Some(route);
        RouteToggle::Selected {
            shipping_id: shipment.shipping_id.clone(),
            route,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;
    use shared::domain::{Location, ShipmentStatus};

    use super::*;

    fn shipment(id: &str, lat: f64, lng: f64) -> ShipmentRecord {
        ShipmentRecord {
            shipping_id: ShipmentId::from(id),
            tracking_number: None,
            order_no: None,
            status: ShipmentStatus::Pending,
            location: Some(Location::new(lat, lng, "Phnom Penh")),
            created_date: None,
            extra: Map::new(),
        }
    }

    fn warehouse() -> GeoPoint {
        GeoPoint::new(11.53, 104.93).expect("point")
    }

    #[test]
    fn selecting_without_warehouse_is_refused() {
        let mut planner = RoutePlanner::new();
        assert_eq!(
            planner.toggle_route(&shipment("S-1", 11.5, 104.9)),
            RouteToggle::WarehouseNotSet
        );
        assert!(planner.selected().is_none());
    }

    #[tokio::test]
    async fn reselecting_the_same_shipment_clears_the_route() {
        let mut planner = RoutePlanner::new();
        planner.pin_warehouse(&FixedLocation(warehouse())).await;

        let target = shipment("S-1", 11.5, 104.9);
        let RouteToggle::Selected { route, .. } = planner.toggle_route(&target) else {
            panic!("route should be selected");
        };
        assert_eq!(route.to, warehouse());
        assert_eq!(planner.toggle_route(&target), RouteToggle::Cleared);
        assert!(planner.selected().is_none());
    }

    #[tokio::test]
    async fn selecting_another_shipment_moves_the_route() {
        let mut planner = RoutePlanner::new();
        planner.pin_warehouse(&FixedLocation(warehouse())).await;
        planner.toggle_route(&shipment("S-1", 11.5, 104.9));

        let toggle = planner.toggle_route(&shipment("S-2", 11.6, 104.8));
        assert!(matches!(toggle, RouteToggle::Selected { ref shipping_id, .. } if shipping_id.as_str() == "S-2"));
        assert_eq!(planner.selected().map(|r| r.from), GeoPoint::new(11.6, 104.8));
    }

    #[tokio::test]
    async fn unavailable_location_leaves_routes_disabled() {
        let mut planner = RoutePlanner::new();
        assert_eq!(planner.pin_warehouse(&UnavailableLocation).await, None);
        assert_eq!(
            planner.toggle_route(&shipment("S-1", 11.5, 104.9)),
            RouteToggle::WarehouseNotSet
        );
    }

    #[tokio::test]
    async fn shipment_without_coordinates_cannot_be_routed() {
        let mut planner = RoutePlanner::new();
        planner.pin_warehouse(&FixedLocation(warehouse())).await;
        let mut target = shipment("S-3", 0.0, 0.0);
        target.location = None;
        assert_eq!(
            planner.toggle_route(&target),
            RouteToggle::NoCoordinates(ShipmentId::from("S-3"))
        );
    }
}
