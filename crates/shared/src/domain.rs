use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Identifiers arrive from the backend as either JSON strings or numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Text(String),
    Integer(i64),
    Unsigned(u64),
    Float(f64),
}

impl StringOrNumber {
    fn into_string(self) -> String {
        match self {
            Self::Text(value) => value,
            Self::Integer(value) => value.to_string(),
            Self::Unsigned(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
        }
    }
}

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                StringOrNumber::deserialize(deserializer).map(|raw| Self(raw.into_string()))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(ShipmentId);
id_newtype!(TrackingNumber);
id_newtype!(OrderNo);
id_newtype!(CourierId);

/// Shipment lifecycle status, always held in lowercase form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ShipmentStatus {
    Pending,
    InTransit,
    Delivered,
    Other(String),
}

impl ShipmentStatus {
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_lowercase();
        match normalized.as_str() {
            "pending" => Self::Pending,
            "in_transit" => Self::InTransit,
            "delivered" => Self::Delivered,
            _ => Self::Other(normalized),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::InTransit => "in_transit",
            Self::Delivered => "delivered",
            Self::Other(raw) => raw,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

impl From<String> for ShipmentStatus {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<ShipmentStatus> for String {
    fn from(value: ShipmentStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A numeric field that the feed sends either as a JSON number or a numeric string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Numeric {
    Number(f64),
    Text(String),
}

impl Numeric {
    /// Finite value, if the field holds one.
    pub fn value(&self) -> Option<f64> {
        let value = match self {
            Self::Number(value) => *value,
            Self::Text(raw) => raw.trim().parse::<f64>().ok()?,
        };
        value.is_finite().then_some(value)
    }
}

impl From<f64> for Numeric {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    /// Returns `None` unless both components are finite and within geographic range.
    pub fn new(lat: f64, lng: f64) -> Option<Self> {
        let valid = lat.is_finite()
            && lng.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lng);
        valid.then_some(Self { lat, lng })
    }

    fn from_numeric(lat: Option<&Numeric>, lng: Option<&Numeric>) -> Option<Self> {
        Self::new(lat?.value()?, lng?.value()?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<Numeric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<Numeric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64, city: impl Into<String>) -> Self {
        Self {
            latitude: Some(Numeric::Number(latitude)),
            longitude: Some(Numeric::Number(longitude)),
            city: Some(city.into()),
            extra: Map::new(),
        }
    }

    pub fn point(&self) -> Option<GeoPoint> {
        GeoPoint::from_numeric(self.latitude.as_ref(), self.longitude.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipmentRecord {
    pub shipping_id: ShipmentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_number: Option<TrackingNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_no: Option<OrderNo>,
    pub status: ShipmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(
        default,
        deserialize_with = "crate::time::deserialize_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_date: Option<DateTime<Utc>>,
    /// Payload fields the tracker does not interpret, kept for presentation.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ShipmentRecord {
    pub fn point(&self) -> Option<GeoPoint> {
        self.location.as_ref().and_then(Location::point)
    }

    pub fn is_displayable(&self) -> bool {
        self.point().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPositionRecord {
    pub tracking_number: TrackingNumber,
    #[serde(default)]
    pub position: Option<GeoPoint>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<CourierId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
}

impl DeliveryPositionRecord {
    pub fn is_delivered(&self) -> bool {
        self.status == "delivered"
    }

    pub fn is_displayable(&self) -> bool {
        self.position.is_some()
    }
}
