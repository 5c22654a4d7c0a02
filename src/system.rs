use sysinfo::{Disks, System, MINIMUM_CPU_UPDATE_INTERVAL};

/// Point-in-time host utilization for the public dashboard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostSnapshot {
    pub cpu_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
}

/// Sample host CPU, memory and disk usage. Blocks briefly between the two
/// CPU refreshes sysinfo needs for a meaningful percentage; call from a
/// blocking-friendly context.
pub fn host_snapshot() -> HostSnapshot {
    let mut sys = System::new();

    sys.refresh_cpu_usage();
    std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let disks = Disks::new_with_refreshed_list();
    let mut disk_total = 0u64;
    let mut disk_available = 0u64;
    for disk in disks.list() {
        disk_total += disk.total_space();
        disk_available += disk.available_space();
    }

    HostSnapshot {
        cpu_percent: sys.global_cpu_usage(),
        memory_used_bytes: sys.used_memory(),
        memory_total_bytes: sys.total_memory(),
        disk_used_bytes: disk_total.saturating_sub(disk_available),
        disk_total_bytes: disk_total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reports_plausible_values() {
        let snapshot = host_snapshot();

        assert!(snapshot.memory_total_bytes > 0);
        assert!(snapshot.memory_used_bytes <= snapshot.memory_total_bytes);
        assert!(snapshot.cpu_percent >= 0.0);
        assert!(snapshot.disk_used_bytes <= snapshot.disk_total_bytes);
    }
}
