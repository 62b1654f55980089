//! Device identity and lifecycle states

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid device id: {0:?}")]
pub struct InvalidDeviceKey(pub String);

/// Node-scoped device identity.
///
/// `Serial` is used whenever the sharing agent exposes a serial number and
/// disambiguates identical devices. Without a serial the identity falls back
/// to the bus position, which does not survive re-cabling: moving such a
/// device to another port makes it a new device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceKey {
    /// `<bus>-<port>`, e.g. `1-2`
    Port { bus: u32, port: u32 },
    /// `<vendor>:<product>:<serial>`, e.g. `0781:5567:4C5300`
    Serial {
        vendor_id: String,
        product_id: String,
        serial: String,
    },
}

impl DeviceKey {
    pub fn port(bus: u32, port: u32) -> Self {
        DeviceKey::Port { bus, port }
    }

    pub fn serial(vendor_id: &str, product_id: &str, serial: &str) -> Self {
        DeviceKey::Serial {
            vendor_id: vendor_id.to_ascii_lowercase(),
            product_id: product_id.to_ascii_lowercase(),
            serial: serial.to_string(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKey::Port { bus, port } => write!(f, "{bus}-{port}"),
            DeviceKey::Serial { vendor_id, product_id, serial } => {
                write!(f, "{vendor_id}:{product_id}:{serial}")
            }
        }
    }
}

impl FromStr for DeviceKey {
    type Err = InvalidDeviceKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidDeviceKey(s.to_string());

        if s.contains(':') {
            let mut parts = s.splitn(3, ':');
            let (Some(vendor), Some(product), Some(serial)) = (parts.next(), parts.next(), parts.next()) else {
                return Err(invalid());
            };
            if vendor.is_empty() || product.is_empty() || serial.is_empty() {
                return Err(invalid());
            }
            return Ok(DeviceKey::serial(vendor, product, serial));
        }

        let (bus, port) = s.split_once('-').ok_or_else(invalid)?;
        Ok(DeviceKey::Port {
            bus: bus.parse().map_err(|_| invalid())?,
            port: port.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for DeviceKey {
    type Error = InvalidDeviceKey;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceKey> for String {
    fn from(key: DeviceKey) -> Self {
        key.to_string()
    }
}

/// Lifecycle state of a device record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceStatus {
    Available,
    InUse,
    Offline,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Available => "Available",
            DeviceStatus::InUse => "InUse",
            DeviceStatus::Offline => "Offline",
        };
        f.write_str(s)
    }
}

/// Status carried by a `status_update`: a lifecycle state, or `Error` when a
/// claim/release command failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportedStatus {
    Available,
    InUse,
    Offline,
    Error,
}

impl ReportedStatus {
    pub fn device_status(self) -> Option<DeviceStatus> {
        match self {
            ReportedStatus::Available => Some(DeviceStatus::Available),
            ReportedStatus::InUse => Some(DeviceStatus::InUse),
            ReportedStatus::Offline => Some(DeviceStatus::Offline),
            ReportedStatus::Error => None,
        }
    }
}

impl From<DeviceStatus> for ReportedStatus {
    fn from(status: DeviceStatus) -> Self {
        match status {
            DeviceStatus::Available => ReportedStatus::Available,
            DeviceStatus::InUse => ReportedStatus::InUse,
            DeviceStatus::Offline => ReportedStatus::Offline,
        }
    }
}

/// A device as seen by its node, as carried in heartbeat snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReport {
    pub device_id: DeviceKey,
    /// Current bus position, the address the sharing agent understands
    pub address: String,
    pub name: String,
    pub status: DeviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    pub last_seen: DateTime<Utc>,
}
