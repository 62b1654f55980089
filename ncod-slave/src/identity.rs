//! Node identity discovery
//!
//! This module handles:
//! - Primary MAC address detection with priority (Ethernet > WiFi > Other)
//! - Network interface enumeration with IP addresses
//! - System identification (hostname, OS, architecture)
//! - Node ID derivation from the primary MAC address

use if_addrs::{get_if_addrs, IfAddr};
use ncod_protocol::{IdentityError, NodeId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Network interface information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub mac: NodeId,
    pub ip: String,
    #[serde(rename = "type")]
    pub interface_type: InterfaceType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Ethernet,
    Wireless,
    Loopback,
    Other,
}

#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub node_id: NodeId,
    pub hostname: String,
    pub os: String,
    pub architecture: String,
    /// IP of the interface the node id was taken from
    pub address: String,
    pub interfaces: Vec<NetworkInterface>,
}

impl SystemInfo {
    pub fn discover() -> Result<Self, IdentityError> {
        info!("Starting system discovery...");

        let interfaces = enumerate_interfaces();
        let primary = select_primary(&interfaces)?;

        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let info = SystemInfo {
            node_id: primary.mac.clone(),
            hostname,
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            address: primary.ip.clone(),
            interfaces,
        };

        info!(
            node_id = %info.node_id,
            hostname = %info.hostname,
            os = %info.os,
            interfaces = info.interfaces.len(),
            "Discovery complete"
        );
        Ok(info)
    }
}

fn enumerate_interfaces() -> Vec<NetworkInterface> {
    let if_addrs = match get_if_addrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("Failed to enumerate network interfaces: {e}");
            return Vec::new();
        }
    };

    let mut interfaces: Vec<NetworkInterface> = Vec::new();
    for if_addr in if_addrs {
        if if_addr.is_loopback() {
            continue;
        }
        // first address wins, normally the IPv4 one
        if interfaces.iter().any(|i| i.name == if_addr.name) {
            continue;
        }

        let ip = match if_addr.addr {
            IfAddr::V4(v4) => v4.ip.to_string(),
            IfAddr::V6(v6) => v6.ip.to_string(),
        };

        let mac = match mac_address::mac_address_by_name(&if_addr.name) {
            Ok(Some(mac)) => mac,
            Ok(None) => {
                debug!("No MAC found for interface: {}", if_addr.name);
                continue;
            }
            Err(e) => {
                debug!("Error getting MAC for {}: {}", if_addr.name, e);
                continue;
            }
        };

        match NodeId::from_bytes(mac.bytes()) {
            Ok(mac) => {
                debug!("Found interface: {} ({})", if_addr.name, mac);
                interfaces.push(NetworkInterface {
                    interface_type: classify_interface(&if_addr.name),
                    name: if_addr.name,
                    mac,
                    ip,
                });
            }
            // virtual interfaces often report 00:00:00:00:00:00
            Err(e) => debug!("Ignoring {}: {}", if_addr.name, e),
        }
    }
    interfaces
}

fn classify_interface(name: &str) -> InterfaceType {
    let name = name.to_lowercase();

    if name == "lo" || name.starts_with("lo0") {
        return InterfaceType::Loopback;
    }
    if ["wlan", "wifi", "wlp", "wlo"].iter().any(|p| name.contains(p)) {
        return InterfaceType::Wireless;
    }
    if name.starts_with("eth") || name.starts_with("en") {
        return InterfaceType::Ethernet;
    }
    InterfaceType::Other
}

fn select_primary(interfaces: &[NetworkInterface]) -> Result<&NetworkInterface, IdentityError> {
    for wanted in [InterfaceType::Ethernet, InterfaceType::Wireless] {
        if let Some(interface) = interfaces.iter().find(|i| i.interface_type == wanted) {
            info!("Selected {:?} interface as primary: {}", wanted, interface.name);
            return Ok(interface);
        }
    }

    let interface = interfaces
        .iter()
        .find(|i| i.interface_type != InterfaceType::Loopback)
        .ok_or(IdentityError::NoHardwareAddress)?;
    warn!("No Ethernet/WiFi found, using first interface: {}", interface.name);
    Ok(interface)
}
