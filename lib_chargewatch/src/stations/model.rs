use serde::{Deserialize, Serialize};

use crate::errors::SyncError;

/// Nominal voltage reported for an occupied port. The vendor exposes occupancy only.
pub const OCCUPIED_VOLTAGE: f64 = 220.0;
/// Nominal current reported for an occupied port.
pub const OCCUPIED_CURRENT: f64 = 10.0;

pub fn now_unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Occupancy of a single port. Persisted and serialized with the labels operators know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortStatus {
    #[serde(rename = "空闲")]
    Free,
    #[serde(rename = "占用")]
    Occupied,
}

impl PortStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "空闲",
            Self::Occupied => "占用",
        }
    }

    pub fn parse_str(value: &str) -> Option<Self> {
        match value {
            "空闲" => Some(Self::Free),
            "占用" => Some(Self::Occupied),
            _ => None,
        }
    }

    /// Vendor code `0` is free; every other code is occupied.
    pub fn from_vendor_code(code: i64) -> Self {
        if code == 0 {
            Self::Free
        } else {
            Self::Occupied
        }
    }
}

/// A station as held in durable storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub created_at_ms: i64,
}

/// One port's observed state inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortReading {
    pub port_number: i64,
    pub status: PortStatus,
    pub service: String,
    pub voltage: f64,
    pub current: f64,
    pub observed_at_ms: i64,
}

impl PortReading {
    /// Applies the fixed occupancy-to-electrical mapping.
    pub fn from_occupancy(port_number: i64, status: PortStatus, service: &str, observed_at_ms: i64) -> Self {
        let (voltage, current) = match status {
            PortStatus::Occupied => (OCCUPIED_VOLTAGE, OCCUPIED_CURRENT),
            PortStatus::Free => (0.0, 0.0),
        };
        Self {
            port_number,
            status,
            service: service.to_string(),
            voltage,
            current,
            observed_at_ms,
        }
    }
}

/// Why a snapshot had to be synthesized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    TransientNetwork,
    VendorBusiness,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::VendorBusiness => "vendor_business",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub class: FailureClass,
    pub reason: String,
}

impl FetchFailure {
    /// Keeps the class of a fetch error. Anything outside the two fetch classes counts as business.
    pub fn from_error(error: &SyncError) -> Self {
        let class = match error {
            SyncError::TransientNetwork(_) => FailureClass::TransientNetwork,
            _ => FailureClass::VendorBusiness,
        };
        Self {
            class,
            reason: error.to_string(),
        }
    }

    pub fn to_error(&self) -> SyncError {
        match self.class {
            FailureClass::TransientNetwork => SyncError::TransientNetwork(self.reason.clone()),
            FailureClass::VendorBusiness => SyncError::VendorBusiness(self.reason.clone()),
        }
    }
}

/// Where a snapshot came from. Synthetic data has the same shape as vendor data, so this is the only marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotOrigin {
    Vendor,
    ForcedSynthetic,
    Fallback(FetchFailure),
}

impl SnapshotOrigin {
    pub fn is_synthetic(&self) -> bool {
        !matches!(self, Self::Vendor)
    }

    /// The failure behind a fallback snapshot.
    pub fn failure(&self) -> Option<&FetchFailure> {
        match self {
            Self::Fallback(failure) => Some(failure),
            Self::Vendor | Self::ForcedSynthetic => None,
        }
    }
}

/// The port readings of one station at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub station_id: String,
    pub ports: Vec<PortReading>,
    pub origin: SnapshotOrigin,
    pub fetched_at_ms: i64,
}

/// A durable port row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortRecord {
    pub station_id: String,
    pub port_number: i64,
    pub status: PortStatus,
    pub service: String,
    pub voltage: f64,
    pub current: f64,
    pub updated_at_ms: i64,
}

impl PortRecord {
    pub fn from_reading(station_id: &str, reading: &PortReading) -> Self {
        Self {
            station_id: station_id.to_string(),
            port_number: reading.port_number,
            status: reading.status,
            service: reading.service.clone(),
            voltage: reading.voltage,
            current: reading.current,
            updated_at_ms: reading.observed_at_ms,
        }
    }

    /// Overwrites every reading-derived field.
    pub fn apply(&mut self, reading: &PortReading) {
        self.status = reading.status;
        self.service = reading.service.clone();
        self.voltage = reading.voltage;
        self.current = reading.current;
        self.updated_at_ms = reading.observed_at_ms;
    }
}
