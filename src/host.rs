//! Host resource stats.
//!
//! Jail-independent data: gathered even when the enforcement daemon is down,
//! so operators can still tell the host itself is alive.

use serde::Serialize;
use std::path::Path;
use sysinfo::{Disks, System};

/// Point-in-time host resource usage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStats {
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub kernel: Option<String>,
    pub uptime_secs: u64,
    pub cpu_count: usize,
    pub load_1: f64,
    pub load_5: f64,
    pub load_15: f64,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
    /// Root filesystem; zero when it could not be found.
    pub disk_total_bytes: u64,
    pub disk_available_bytes: u64,
}

impl HostStats {
    pub fn memory_used_percent(&self) -> f64 {
        if self.memory_total_bytes == 0 {
            return 0.0;
        }
        self.memory_used_bytes as f64 * 100.0 / self.memory_total_bytes as f64
    }
}

fn gather() -> HostStats {
    let mut sys = System::new();
    sys.refresh_memory();
    let load = System::load_average();

    let disks = Disks::new_with_refreshed_list();
    let (disk_total_bytes, disk_available_bytes) = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .map(|d| (d.total_space(), d.available_space()))
        .unwrap_or((0, 0));

    HostStats {
        hostname: System::host_name(),
        os: System::long_os_version(),
        kernel: System::kernel_version(),
        uptime_secs: System::uptime(),
        cpu_count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        load_1: load.one,
        load_5: load.five,
        load_15: load.fifteen,
        memory_total_bytes: sys.total_memory(),
        memory_used_bytes: sys.used_memory(),
        swap_total_bytes: sys.total_swap(),
        swap_used_bytes: sys.used_swap(),
        disk_total_bytes,
        disk_available_bytes,
    }
}

/// Collect host stats off the async runtime.
pub async fn collect() -> Result<HostStats, String> {
    tokio::task::spawn_blocking(gather)
        .await
        .map_err(|e| format!("host stats collection failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collects_something_plausible() {
        let stats = collect().await.unwrap();
        assert!(stats.cpu_count >= 1);
        assert!(stats.memory_used_percent() <= 100.0);
        let json = serde_json::to_value(&stats).unwrap();
        assert!(json.get("memoryTotalBytes").is_some());
    }
}
