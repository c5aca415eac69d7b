use async_trait::async_trait;

use super::{Collector, CollectorError, Dimension, RateWindow, Reading};

/// /proc/diskstats reports sector counts; the kernel fixes the unit at
/// 512 bytes regardless of the device's physical sector size.
const SECTOR_BYTES: u64 = 512;

/// Aggregate disk I/O (read + write, all physical devices) from
/// /proc/diskstats, converted to KB/s against the previous call's
/// counter.
pub struct DiskCollector {
    path: String,
    window: RateWindow,
}

impl DiskCollector {
    pub fn new() -> Self {
        Self {
            path: "/proc/diskstats".to_string(),
            window: RateWindow::new(),
        }
    }
}

impl Default for DiskCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for DiskCollector {
    fn dimension(&self) -> Dimension {
        Dimension::Disk
    }

    async fn sample(&self) -> Result<Reading, CollectorError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|source| CollectorError::Io {
            path: self.path.clone(),
            source,
        })?;

        let total = parse_diskstats(&contents);
        Ok(Reading::DiskKbps(self.window.observe(total)))
    }
}

/// Sum bytes read + written across whole physical devices. Partitions
/// are skipped so the same I/O is not counted twice; virtual devices
/// (loop, ram, zram, device-mapper, sr) are skipped entirely.
pub(crate) fn parse_diskstats(contents: &str) -> u64 {
    let mut total: u64 = 0;

    for line in contents.lines() {
        // major minor name reads merged sectors_read ms_read
        //                  writes merged sectors_written ms_written ...
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }

        let name = fields[2];
        if !is_physical_device(name) {
            continue;
        }

        let sectors_read: u64 = fields[5].parse().unwrap_or(0);
        let sectors_written: u64 = fields[9].parse().unwrap_or(0);
        total = total.saturating_add((sectors_read + sectors_written) * SECTOR_BYTES);
    }

    total
}

pub(crate) fn is_physical_device(name: &str) -> bool {
    for prefix in ["loop", "ram", "zram", "dm-", "sr", "fd", "md"] {
        if name.starts_with(prefix) {
            return false;
        }
    }

    // nvme0n1 is the device, nvme0n1p1 a partition.
    if let Some(rest) = name.strip_prefix("nvme") {
        return !rest.contains('p');
    }

    // sda / vda / xvda are devices, sda1 / vda1 / xvda1 partitions.
    !name.ends_with(|c: char| c.is_ascii_digit())
}
