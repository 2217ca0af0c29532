//! Host sampling sources

use std::path::{Path, PathBuf};
use std::time::Instant;
use sysinfo::{Disks, System, MINIMUM_CPU_UPDATE_INTERVAL};

use crate::ResourceSample;

/// Produces resource samples
pub trait Sampler: Send {
    fn sample(&mut self) -> ResourceSample;
}

/// Reads the live host through `sysinfo`
pub struct SystemSampler {
    system: System,
    disks: Disks,
    disk_path: PathBuf,
    cpu_refreshed_at: Instant,
}

impl SystemSampler {
    /// Track free space of the disk holding `disk_path`
    pub fn new(disk_path: impl AsRef<Path>) -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes; prime the first one.
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
            disk_path: disk_path.as_ref().to_path_buf(),
            cpu_refreshed_at: Instant::now(),
        }
    }

    fn disk_free_bytes(&self) -> u64 {
        self.disks
            .list()
            .iter()
            .filter(|disk| self.disk_path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            // No matching mount (e.g. minimal containers): never a disk breach
            .unwrap_or(u64::MAX)
    }
}

impl Sampler for SystemSampler {
    fn sample(&mut self) -> ResourceSample {
        // Two CPU refreshes closer than this yield a meaningless delta
        let since = self.cpu_refreshed_at.elapsed();
        if since < MINIMUM_CPU_UPDATE_INTERVAL {
            std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL - since);
        }
        self.system.refresh_cpu();
        self.cpu_refreshed_at = Instant::now();
        self.system.refresh_memory();
        self.disks.refresh();

        let cpu_pct = self.system.global_cpu_info().cpu_usage();
        let total = self.system.total_memory();
        let mem_pct = if total == 0 {
            0.0
        } else {
            (self.system.used_memory() as f64 / total as f64 * 100.0) as f32
        };

        ResourceSample::new(cpu_pct, mem_pct, self.disk_free_bytes())
    }
}
