//! Device discovery through the VirtualHere agent
//!
//! All knowledge of the agent's text formats stays in `parser`; this module
//! turns listings into identified devices and wraps the claim/release
//! commands. Agent failures never escape `discover`: they are logged and
//! yield an empty cycle.
//!
//! A serial identity, once resolved for an address, survives a failed
//! `DEVICE INFO` as long as the same device name is listed there.

pub mod parser;
pub mod reconciler;

use crate::agent::{AgentError, DeviceAgent};
use chrono::{DateTime, Utc};
use ncod_protocol::DeviceKey;
use parser::{parse_device_info, ListingParser, RawDevice};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// A listed device with its node-scoped identity resolved
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub key: DeviceKey,
    /// Current `<bus>-<port>` position
    pub address: String,
    pub name: String,
    pub discovered_at: DateTime<Utc>,
}

/// Outcome of a `DEVICE INFO` lookup
enum SerialLookup {
    Resolved(DeviceKey),
    NoSerial,
    Failed,
}

pub struct DeviceDiscovery<A> {
    agent: A,
    parser: ListingParser,
    resolve_serials: bool,
    /// address -> (listed name, serial key) from the last successful lookup
    resolved: Mutex<HashMap<String, (String, DeviceKey)>>,
}

impl<A: DeviceAgent> DeviceDiscovery<A> {
    pub fn new(agent: A, resolve_serials: bool) -> Result<Self, regex::Error> {
        Ok(Self {
            agent,
            parser: ListingParser::new()?,
            resolve_serials,
            resolved: Mutex::new(HashMap::new()),
        })
    }

    /// One `LIST` cycle
    pub async fn discover(&self) -> Vec<RawDevice> {
        let output = match self.agent.execute("LIST").await {
            Ok(output) => output,
            Err(e) => {
                error!("Device listing failed: {e}");
                return Vec::new();
            }
        };

        let listing = self.parser.parse(&output, Utc::now());
        for parse_error in &listing.errors {
            warn!("Skipping agent output: {parse_error}");
        }
        debug!("Agent listed {} devices", listing.devices.len());
        listing.devices
    }

    /// `discover` plus identity resolution
    pub async fn scan(&self) -> Vec<DiscoveredDevice> {
        let raw = self.discover().await;
        let mut resolved = self.resolved.lock().await;
        let mut seen = HashSet::new();
        let mut devices = Vec::with_capacity(raw.len());

        for device in raw {
            let address = device.address();
            let port_key = DeviceKey::port(device.bus_id, device.port);
            let mut key = match self.serial_key(&address).await {
                SerialLookup::Resolved(key) => {
                    resolved.insert(address.clone(), (device.name.clone(), key.clone()));
                    key
                }
                SerialLookup::NoSerial => {
                    resolved.remove(&address);
                    port_key.clone()
                }
                SerialLookup::Failed => {
                    let kept = resolved
                        .get(&address)
                        .filter(|(name, _)| *name == device.name)
                        .map(|(_, key)| key.clone());
                    match kept {
                        Some(key) => {
                            debug!(device_id = %key, address = %address, "Keeping previously resolved identity");
                            key
                        }
                        None => {
                            resolved.remove(&address);
                            port_key.clone()
                        }
                    }
                }
            };
            if !seen.insert(key.clone()) {
                warn!(device_id = %key, address = %address, "Duplicate serial identity, falling back to bus position");
                key = port_key;
                seen.insert(key.clone());
            }

            debug!(
                device_id = %key,
                hub = %format!("{}:{}", device.hub_vendor_id, device.hub_product_id),
                "Identified device"
            );
            devices.push(DiscoveredDevice {
                key,
                address,
                name: device.name,
                discovered_at: device.discovery_time,
            });
        }

        // unplugged addresses are resolved afresh when something shows up there
        let listed: HashSet<&str> = devices.iter().map(|d| d.address.as_str()).collect();
        resolved.retain(|address, _| listed.contains(address.as_str()));
        devices
    }

    async fn serial_key(&self, address: &str) -> SerialLookup {
        if !self.resolve_serials {
            return SerialLookup::NoSerial;
        }
        match self.agent.execute(&format!("DEVICE INFO,{address}")).await {
            Ok(output) => match parse_device_info(&output).key() {
                Some(key) => SerialLookup::Resolved(key),
                None => SerialLookup::NoSerial,
            },
            Err(e) => {
                debug!(address, "No device info: {e}");
                SerialLookup::Failed
            }
        }
    }

    pub async fn claim(&self, address: &str, password: Option<&str>) -> Result<(), AgentError> {
        let command = match password {
            Some(password) => format!("USE,{address},{password}"),
            None => format!("USE,{address}"),
        };
        let response = self.agent.execute(&command).await?;
        expect_ok(&response)
    }

    pub async fn release(&self, address: &str) -> Result<(), AgentError> {
        let response = self.agent.execute(&format!("STOP USING,{address}")).await?;
        expect_ok(&response)
    }
}

fn expect_ok(response: &str) -> Result<(), AgentError> {
    if response.lines().any(|line| line.trim() == "OK") {
        Ok(())
    } else {
        Err(AgentError::Rejected(response.trim().to_string()))
    }
}
