//! Text parsing of VirtualHere agent output
//!
//! `LIST` prints a hub line followed by its devices:
//!
//! ```text
//! Bench Hub (VID=1a40 PID=0101)
//!    |_ Device 1-2: SanDisk Cruzer Blade
//!    |_ Device 1-3: USB Keyboard
//! ```
//!
//! `DEVICE INFO,<addr>` prints `Key: value` lines (`Vendor ID`, `Product ID`,
//! `Serial`). Anything else (banners, blank lines) is not device data.

use chrono::{DateTime, Utc};
use ncod_protocol::DeviceKey;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("line {line}: malformed device entry {text:?}")]
    MalformedDevice { line: usize, text: String },
    #[error("line {line}: device listed before any hub: {text:?}")]
    OrphanDevice { line: usize, text: String },
}

/// One device as listed by the agent
#[derive(Debug, Clone, PartialEq)]
pub struct RawDevice {
    pub bus_id: u32,
    pub port: u32,
    pub name: String,
    pub hub_vendor_id: String,
    pub hub_product_id: String,
    pub discovery_time: DateTime<Utc>,
}

impl RawDevice {
    /// `<bus>-<port>`, the address `USE`/`STOP USING` expect
    pub fn address(&self) -> String {
        format!("{}-{}", self.bus_id, self.port)
    }
}

/// Output of a whole `LIST`: the devices that parsed and the lines that did not
#[derive(Debug, Default)]
pub struct Listing {
    pub devices: Vec<RawDevice>,
    pub errors: Vec<ParseError>,
}

/// Compiled `LIST` grammar
#[derive(Debug, Clone)]
pub struct ListingParser {
    hub: Regex,
    device: Regex,
}

impl ListingParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            hub: Regex::new(r"VID=([0-9A-Fa-f]{4})\s+PID=([0-9A-Fa-f]{4})")?,
            device: Regex::new(r"^\|_\s*Device\s+(\d+)-(\d+):\s*(.+?)\s*$")?,
        })
    }

    pub fn parse(&self, output: &str, discovery_time: DateTime<Utc>) -> Listing {
        let mut listing = Listing::default();
        let mut hub: Option<(String, String)> = None;

        for (index, raw_line) in output.lines().enumerate() {
            let line = raw_line.trim();
            let line_no = index + 1;

            if line.starts_with("|_") {
                let Some(caps) = self.device.captures(line) else {
                    listing.errors.push(ParseError::MalformedDevice {
                        line: line_no,
                        text: line.to_string(),
                    });
                    continue;
                };
                let Some((vendor, product)) = hub.as_ref() else {
                    listing.errors.push(ParseError::OrphanDevice {
                        line: line_no,
                        text: line.to_string(),
                    });
                    continue;
                };
                // \d+ may still overflow u32
                match (caps[1].parse::<u32>(), caps[2].parse::<u32>()) {
                    (Ok(bus_id), Ok(port)) => listing.devices.push(RawDevice {
                        bus_id,
                        port,
                        name: caps[3].to_string(),
                        hub_vendor_id: vendor.clone(),
                        hub_product_id: product.clone(),
                        discovery_time,
                    }),
                    _ => listing.errors.push(ParseError::MalformedDevice {
                        line: line_no,
                        text: line.to_string(),
                    }),
                }
            } else if let Some(caps) = self.hub.captures(line) {
                hub = Some((caps[1].to_ascii_lowercase(), caps[2].to_ascii_lowercase()));
            }
        }
        listing
    }
}

/// Identity fields from `DEVICE INFO`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub vendor_id: Option<String>,
    pub product_id: Option<String>,
    pub serial: Option<String>,
}

impl DeviceInfo {
    /// Serial-based key when the agent gave all three fields
    pub fn key(&self) -> Option<DeviceKey> {
        match (&self.vendor_id, &self.product_id, &self.serial) {
            (Some(vendor), Some(product), Some(serial)) => Some(DeviceKey::serial(vendor, product, serial)),
            _ => None,
        }
    }
}

pub fn parse_device_info(output: &str) -> DeviceInfo {
    let mut info = DeviceInfo::default();

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }

        match key.trim().to_ascii_lowercase().as_str() {
            "vendor id" => info.vendor_id = Some(strip_hex_prefix(value)),
            "product id" => info.product_id = Some(strip_hex_prefix(value)),
            "serial" => info.serial = Some(value.to_string()),
            _ => {}
        }
    }
    info
}

fn strip_hex_prefix(value: &str) -> String {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
VirtualHere Client IPC, below are the available devices:

Bench Hub (VID=1A40 PID=0101)
   |_ Device 1-2: SanDisk Cruzer Blade
   |_ Device 1-3: USB Keyboard
Second Hub (VID=05e3 PID=0608)
   |_ Device 2-1: Logitech Receiver
";

    #[test]
    fn test_parses_hierarchy() {
        let now = Utc::now();
        let listing = ListingParser::new().unwrap().parse(LISTING, now);

        assert!(listing.errors.is_empty());
        assert_eq!(listing.devices.len(), 3);

        let first = &listing.devices[0];
        assert_eq!((first.bus_id, first.port), (1, 2));
        assert_eq!(first.name, "SanDisk Cruzer Blade");
        assert_eq!(first.hub_vendor_id, "1a40");
        assert_eq!(first.address(), "1-2");
        assert_eq!(first.discovery_time, now);

        assert_eq!(listing.devices[2].hub_product_id, "0608");
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let output = "\
Hub (VID=1a40 PID=0101)
   |_ Device x-2: Broken
   |_ Device 1-4: Good
   |_ garbage
";
        let listing = ListingParser::new().unwrap().parse(output, Utc::now());

        assert_eq!(listing.devices.len(), 1);
        assert_eq!(listing.devices[0].port, 4);
        assert_eq!(listing.errors.len(), 2);
        assert!(matches!(listing.errors[0], ParseError::MalformedDevice { line: 2, .. }));
    }

    #[test]
    fn test_orphan_device_rejected() {
        let listing = ListingParser::new().unwrap().parse("|_ Device 1-2: Lonely\n", Utc::now());
        assert!(listing.devices.is_empty());
        assert!(matches!(listing.errors[0], ParseError::OrphanDevice { .. }));
    }

    #[test]
    fn test_empty_output() {
        let listing = ListingParser::new().unwrap().parse("", Utc::now());
        assert!(listing.devices.is_empty() && listing.errors.is_empty());
    }

    #[test]
    fn test_device_info() {
        let output = "\
Address: 1-2
Vendor ID: 0x0781
Product ID: 0x5567
Serial: 4C530001
";
        let info = parse_device_info(output);
        assert_eq!(info.key(), Some(DeviceKey::serial("0781", "5567", "4C530001")));
    }

    #[test]
    fn test_device_info_without_serial() {
        let info = parse_device_info("Vendor ID: 0x0781\nProduct ID: 0x5567\nSerial:\n");
        assert_eq!(info.serial, None);
        assert_eq!(info.key(), None);
    }
}
