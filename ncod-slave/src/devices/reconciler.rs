//! Local device table and discovery reconciliation
//!
//! The table is the slave's view of its devices. Discovery cycles are
//! reconciled into it; claim/release commands mark a device `pending` while
//! the agent works, and a pending device is never marked vanished.

use super::DiscoveredDevice;
use chrono::{DateTime, Utc};
use ncod_protocol::{DeviceKey, DeviceReport, DeviceStatus};
use std::collections::{BTreeMap, BTreeSet};

/// Split of the previous and current id sets
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Partition {
    pub appeared: BTreeSet<DeviceKey>,
    pub present: BTreeSet<DeviceKey>,
    pub vanished: BTreeSet<DeviceKey>,
}

pub fn partition(previous: &BTreeSet<DeviceKey>, current: &BTreeSet<DeviceKey>) -> Partition {
    Partition {
        appeared: current.difference(previous).cloned().collect(),
        present: current.intersection(previous).cloned().collect(),
        vanished: previous.difference(current).cloned().collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    /// First sighting
    Registered,
    /// Offline device seen again
    Returned,
    Vanished,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub kind: TransitionKind,
    pub device: DeviceReport,
}

#[derive(Debug, Clone)]
struct LocalDevice {
    address: String,
    name: String,
    status: DeviceStatus,
    claimed_by: Option<String>,
    last_seen: DateTime<Utc>,
    pending: bool,
}

/// Why a claim or release cannot start
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Refusal {
    #[error("device {0} is unknown on this node")]
    Unknown(DeviceKey),
    #[error("device {0} is offline")]
    Offline(DeviceKey),
    #[error("device {key} is already in use by {user}")]
    InUse { key: DeviceKey, user: String },
    #[error("device {0} is not in use")]
    NotInUse(DeviceKey),
    #[error("another command is running on device {0}")]
    Busy(DeviceKey),
}

#[derive(Debug, Default)]
pub struct DeviceTable {
    devices: BTreeMap<DeviceKey, LocalDevice>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one discovery cycle. Records are never removed.
    pub fn reconcile(&mut self, discovered: &[DiscoveredDevice], now: DateTime<Utc>) -> Vec<Transition> {
        let previous: BTreeSet<DeviceKey> = self
            .devices
            .iter()
            .filter(|(_, d)| d.status != DeviceStatus::Offline)
            .map(|(k, _)| k.clone())
            .collect();
        let current: BTreeSet<DeviceKey> = discovered.iter().map(|d| d.key.clone()).collect();
        let split = partition(&previous, &current);

        let mut transitions = Vec::new();
        for device in discovered {
            if split.appeared.contains(&device.key) {
                let kind = match self.devices.get_mut(&device.key) {
                    Some(known) => {
                        known.status = DeviceStatus::Available;
                        known.address = device.address.clone();
                        known.name = device.name.clone();
                        known.last_seen = now;
                        TransitionKind::Returned
                    }
                    None => {
                        self.devices.insert(
                            device.key.clone(),
                            LocalDevice {
                                address: device.address.clone(),
                                name: device.name.clone(),
                                status: DeviceStatus::Available,
                                claimed_by: None,
                                last_seen: now,
                                pending: false,
                            },
                        );
                        TransitionKind::Registered
                    }
                };
                if let Some(report) = self.report(&device.key) {
                    transitions.push(Transition { kind, device: report });
                }
            } else if split.present.contains(&device.key) {
                let Some(known) = self.devices.get_mut(&device.key) else {
                    continue;
                };
                known.last_seen = now;
                known.address = device.address.clone();
                known.name = device.name.clone();
            }
        }

        for key in &split.vanished {
            let Some(known) = self.devices.get_mut(key) else {
                continue;
            };
            if known.pending {
                continue;
            }
            known.status = DeviceStatus::Offline;
            known.claimed_by = None;
            if let Some(report) = self.report(key) {
                transitions.push(Transition {
                    kind: TransitionKind::Vanished,
                    device: report,
                });
            }
        }
        transitions
    }

    /// Marks the device pending and returns its current address
    pub fn begin_claim(&mut self, key: &DeviceKey) -> Result<String, Refusal> {
        let device = self.startable(key)?;
        match (&device.status, &device.claimed_by) {
            (DeviceStatus::Offline, _) => Err(Refusal::Offline(key.clone())),
            (DeviceStatus::InUse, user) => Err(Refusal::InUse {
                key: key.clone(),
                user: user.clone().unwrap_or_else(|| "another user".into()),
            }),
            (DeviceStatus::Available, _) => {
                device.pending = true;
                Ok(device.address.clone())
            }
        }
    }

    pub fn finish_claim(&mut self, key: &DeviceKey, user: Option<String>, succeeded: bool) -> Option<DeviceReport> {
        let device = self.devices.get_mut(key)?;
        device.pending = false;
        if succeeded {
            device.status = DeviceStatus::InUse;
            device.claimed_by = user;
        }
        self.report(key)
    }

    pub fn begin_release(&mut self, key: &DeviceKey) -> Result<String, Refusal> {
        let device = self.startable(key)?;
        if device.status != DeviceStatus::InUse {
            return Err(Refusal::NotInUse(key.clone()));
        }
        device.pending = true;
        Ok(device.address.clone())
    }

    pub fn finish_release(&mut self, key: &DeviceKey, succeeded: bool) -> Option<DeviceReport> {
        let device = self.devices.get_mut(key)?;
        device.pending = false;
        if succeeded {
            device.status = DeviceStatus::Available;
            device.claimed_by = None;
        }
        self.report(key)
    }

    fn startable(&mut self, key: &DeviceKey) -> Result<&mut LocalDevice, Refusal> {
        let device = self.devices.get_mut(key).ok_or_else(|| Refusal::Unknown(key.clone()))?;
        if device.pending {
            return Err(Refusal::Busy(key.clone()));
        }
        Ok(device)
    }

    pub fn report(&self, key: &DeviceKey) -> Option<DeviceReport> {
        self.devices.get(key).map(|d| DeviceReport {
            device_id: key.clone(),
            address: d.address.clone(),
            name: d.name.clone(),
            status: d.status,
            claimed_by: d.claimed_by.clone(),
            last_seen: d.last_seen,
        })
    }

    /// Full table, ordered by device id
    pub fn reports(&self) -> Vec<DeviceReport> {
        self.devices.keys().filter_map(|k| self.report(k)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn seen(bus: u32, port: u32, name: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            key: DeviceKey::port(bus, port),
            address: format!("{bus}-{port}"),
            name: name.to_string(),
            discovered_at: Utc::now(),
        }
    }

    fn kinds(transitions: &[Transition]) -> Vec<(String, TransitionKind)> {
        transitions
            .iter()
            .map(|t| (t.device.device_id.to_string(), t.kind))
            .collect()
    }

    #[test]
    fn test_partition() {
        let set = |keys: &[(u32, u32)]| keys.iter().map(|(b, p)| DeviceKey::port(*b, *p)).collect::<BTreeSet<_>>();
        let split = partition(&set(&[(1, 1), (1, 2)]), &set(&[(1, 2), (1, 3)]));

        assert_eq!(split.appeared, set(&[(1, 3)]));
        assert_eq!(split.present, set(&[(1, 2)]));
        assert_eq!(split.vanished, set(&[(1, 1)]));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut table = DeviceTable::new();
        let cycle = vec![seen(1, 2, "Keyboard"), seen(1, 3, "Mouse")];

        let first = table.reconcile(&cycle, Utc::now());
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|t| t.kind == TransitionKind::Registered));
        assert!(first.iter().all(|t| t.device.status == DeviceStatus::Available));

        assert!(table.reconcile(&cycle, Utc::now()).is_empty());
    }

    #[test]
    fn test_vanish_then_reappear_keeps_identity() {
        let mut table = DeviceTable::new();
        table.reconcile(&[seen(1, 2, "Keyboard")], Utc::now());

        let gone = table.reconcile(&[], Utc::now());
        assert_eq!(kinds(&gone), vec![("1-2".to_string(), TransitionKind::Vanished)]);
        assert_eq!(gone[0].device.status, DeviceStatus::Offline);
        // still one record, not deleted
        assert_eq!(table.reports().len(), 1);
        assert!(table.reconcile(&[], Utc::now()).is_empty());

        let back = table.reconcile(&[seen(1, 2, "Keyboard")], Utc::now());
        assert_eq!(kinds(&back), vec![("1-2".to_string(), TransitionKind::Returned)]);
        assert_eq!(back[0].device.status, DeviceStatus::Available);
    }

    #[test]
    fn test_still_present_refreshes_last_seen_only() {
        let mut table = DeviceTable::new();
        let t0 = Utc::now();
        table.reconcile(&[seen(1, 2, "Keyboard")], t0);
        table.begin_claim(&DeviceKey::port(1, 2)).unwrap();
        table.finish_claim(&DeviceKey::port(1, 2), Some("u1".into()), true);

        let t1 = t0 + Duration::seconds(10);
        assert!(table.reconcile(&[seen(1, 2, "Keyboard")], t1).is_empty());

        let report = table.report(&DeviceKey::port(1, 2)).unwrap();
        assert_eq!(report.last_seen, t1);
        assert_eq!(report.status, DeviceStatus::InUse);
        assert_eq!(report.claimed_by.as_deref(), Some("u1"));
    }

    #[test]
    fn test_pending_device_never_vanishes() {
        let mut table = DeviceTable::new();
        let key = DeviceKey::port(1, 2);
        table.reconcile(&[seen(1, 2, "Keyboard")], Utc::now());
        table.begin_claim(&key).unwrap();

        assert!(table.reconcile(&[], Utc::now()).is_empty());
        assert_eq!(table.report(&key).unwrap().status, DeviceStatus::Available);

        // once the command settles the next cycle catches up
        table.finish_claim(&key, Some("u1".into()), false);
        let gone = table.reconcile(&[], Utc::now());
        assert_eq!(gone.len(), 1);
    }

    #[test]
    fn test_vanished_claim_is_dropped() {
        let mut table = DeviceTable::new();
        let key = DeviceKey::port(1, 2);
        table.reconcile(&[seen(1, 2, "Keyboard")], Utc::now());
        table.begin_claim(&key).unwrap();
        table.finish_claim(&key, Some("u1".into()), true);

        table.reconcile(&[], Utc::now());
        assert_eq!(table.report(&key).unwrap().claimed_by, None);
    }

    #[test]
    fn test_claim_refusals() {
        let mut table = DeviceTable::new();
        let key = DeviceKey::port(1, 2);

        assert_eq!(table.begin_claim(&key), Err(Refusal::Unknown(key.clone())));

        table.reconcile(&[seen(1, 2, "Keyboard")], Utc::now());
        assert_eq!(table.begin_release(&key), Err(Refusal::NotInUse(key.clone())));

        table.begin_claim(&key).unwrap();
        assert_eq!(table.begin_claim(&key), Err(Refusal::Busy(key.clone())));
        table.finish_claim(&key, Some("u1".into()), true);

        assert_eq!(
            table.begin_claim(&key),
            Err(Refusal::InUse {
                key: key.clone(),
                user: "u1".into()
            })
        );

        assert_eq!(table.begin_release(&key), Ok("1-2".to_string()));
        let report = table.finish_release(&key, true).unwrap();
        assert_eq!(report.status, DeviceStatus::Available);
        assert_eq!(report.claimed_by, None);
    }
}
