use std::path::{Path, PathBuf};

use super::{LinkCounters, StatsError, StatsSource};

const SYSFS_NET: &str = "/sys/class/net";

/// Reads `tx_bytes`, `tx_packets` and `tx_dropped` from
/// `/sys/class/net/<iface>/statistics/`.
#[derive(Debug, Clone)]
pub struct SysfsStats {
    dir: PathBuf,
}

impl SysfsStats {
    pub fn new(iface: &str) -> Self {
        Self::with_root(SYSFS_NET, iface)
    }

    /// Uses `root` in place of `/sys/class/net` (tests, containers with a
    /// bind-mounted sysfs).
    pub fn with_root(root: impl AsRef<Path>, iface: &str) -> Self {
        Self {
            dir: root.as_ref().join(iface).join("statistics"),
        }
    }

    fn read_counter(&self, name: &str) -> Result<u64, StatsError> {
        let raw = std::fs::read_to_string(self.dir.join(name))?;
        raw.trim()
            .parse::<u64>()
            .map_err(|e| StatsError::Parse(format!("{}: {:?} ({})", name, raw.trim(), e)))
    }
}

impl StatsSource for SysfsStats {
    fn sample(&mut self) -> Result<LinkCounters, StatsError> {
        Ok(LinkCounters {
            sent_bytes: self.read_counter("tx_bytes")?,
            sent_packets: self.read_counter("tx_packets")?,
            dropped_packets: self.read_counter("tx_dropped")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

    fn fake_sysfs(iface: &str, files: &[(&str, &str)]) -> PathBuf {
        let seq = DIR_SEQ.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "framegate-sysfs-{}-{}",
            std::process::id(),
            seq
        ));
        let stats = root.join(iface).join("statistics");
        std::fs::create_dir_all(&stats).unwrap();
        for (name, value) in files {
            std::fs::write(stats.join(name), value).unwrap();
        }
        root
    }

    #[test]
    fn reads_all_three_counters() {
        let root = fake_sysfs(
            "wlan0",
            &[
                ("tx_bytes", "123456789\n"),
                ("tx_packets", "98765\n"),
                ("tx_dropped", "42\n"),
            ],
        );
        let mut stats = SysfsStats::with_root(&root, "wlan0");
        let counters = stats.sample().unwrap();
        assert_eq!(
            counters,
            LinkCounters {
                sent_bytes: 123_456_789,
                sent_packets: 98_765,
                dropped_packets: 42,
            }
        );
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn missing_interface_is_io_error() {
        let mut stats = SysfsStats::with_root(std::env::temp_dir(), "does_not_exist_xyz99");
        assert!(matches!(stats.sample(), Err(StatsError::Io(_))));
    }

    #[test]
    fn garbage_counter_is_parse_error() {
        let root = fake_sysfs(
            "eth9",
            &[
                ("tx_bytes", "lots\n"),
                ("tx_packets", "1\n"),
                ("tx_dropped", "0\n"),
            ],
        );
        let mut stats = SysfsStats::with_root(&root, "eth9");
        match stats.sample() {
            Err(StatsError::Parse(msg)) => assert!(msg.contains("tx_bytes"), "{msg}"),
            other => panic!("expected parse error, got {:?}", other),
        }
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn loopback_counters_readable() {
        // `lo` exists on every Linux box with sysfs mounted.
        if !Path::new("/sys/class/net/lo/statistics").exists() {
            return;
        }
        let mut stats = SysfsStats::new("lo");
        assert!(stats.sample().is_ok());
    }
}
