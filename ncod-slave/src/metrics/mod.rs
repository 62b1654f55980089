//! Load sampling for placement decisions
//!
//! Produces the `{cpu_percent, memory_percent, disk_percent}` triple pushed
//! in every `load_report`. CPU usage is a delta between two refreshes, so the
//! sampler is kept alive across cycles; the very first sample reads 0%.

use chrono::Utc;
use ncod_protocol::LoadReport;
use std::path::Path;
use sysinfo::{Disks, System};
use tracing::debug;

pub struct LoadSampler {
    sys: System,
    disks: Disks,
}

impl Default for LoadSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();

        Self {
            sys,
            disks: Disks::new_with_refreshed_list(),
        }
    }

    pub fn sample(&mut self) -> LoadReport {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();
        self.disks.refresh();

        let cpu_percent = self.sys.global_cpu_info().cpu_usage();
        let memory_percent = percent(self.sys.used_memory(), self.sys.total_memory());

        let usage: Vec<DiskUsage<'_>> = self
            .disks
            .list()
            .iter()
            .map(|d| DiskUsage {
                mount_point: d.mount_point(),
                total: d.total_space(),
                available: d.available_space(),
            })
            .collect();
        let disk_percent = disk_percent(&usage);

        debug!(cpu_percent, memory_percent, disk_percent, "Load sampled");
        LoadReport {
            cpu_percent: clamp(cpu_percent),
            memory_percent,
            disk_percent,
            timestamp: Utc::now(),
        }
    }
}

struct DiskUsage<'a> {
    mount_point: &'a Path,
    total: u64,
    available: u64,
}

/// Root filesystem when mounted, otherwise all disks together
fn disk_percent(disks: &[DiskUsage<'_>]) -> f32 {
    if let Some(root) = disks.iter().find(|d| d.mount_point == Path::new("/")) {
        return percent(root.total.saturating_sub(root.available), root.total);
    }

    let total: u64 = disks.iter().map(|d| d.total).sum();
    let available: u64 = disks.iter().map(|d| d.available).sum();
    percent(total.saturating_sub(available), total)
}

fn percent(used: u64, total: u64) -> f32 {
    if total == 0 {
        return 0.0;
    }
    clamp((used as f64 / total as f64 * 100.0) as f32)
}

fn clamp(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}
