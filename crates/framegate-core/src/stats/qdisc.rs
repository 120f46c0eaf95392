use std::process::Command;

use super::{LinkCounters, StatsError, StatsSource};

/// Reads queue-discipline counters from `tc -s qdisc show dev <iface>`.
///
/// A qdisc dump carries one `Sent` line per qdisc; the root `mq` comes first
/// and the per-queue children follow. `index` selects which line to use.
#[derive(Debug, Clone)]
pub struct QdiscStats {
    iface: String,
    index: usize,
}

impl QdiscStats {
    pub fn new(iface: &str, index: usize) -> Self {
        Self {
            iface: iface.to_string(),
            index,
        }
    }
}

impl StatsSource for QdiscStats {
    fn sample(&mut self) -> Result<LinkCounters, StatsError> {
        let output = Command::new("tc")
            .args(["-s", "qdisc", "show", "dev", &self.iface])
            .output()?;
        if !output.status.success() {
            return Err(StatsError::CommandFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_qdisc_output(&String::from_utf8_lossy(&output.stdout), self.index)
    }
}

/// Extracts counters from the `index`-th `Sent` line of a qdisc dump.
pub fn parse_qdisc_output(text: &str, index: usize) -> Result<LinkCounters, StatsError> {
    let line = text
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("Sent "))
        .nth(index)
        .ok_or_else(|| StatsError::Parse(format!("no Sent line #{}", index)))?;
    parse_sent_line(line).ok_or_else(|| StatsError::Parse(line.to_string()))
}

/// Parses ` Sent <bytes> bytes <pkts> pkt (dropped <n>, overlimits ...)`.
fn parse_sent_line(line: &str) -> Option<LinkCounters> {
    let mut tokens = line.split_whitespace();
    if tokens.next()? != "Sent" {
        return None;
    }
    let sent_bytes = tokens.next()?.parse().ok()?;
    if tokens.next()? != "bytes" {
        return None;
    }
    let sent_packets = tokens.next()?.parse().ok()?;
    if tokens.next()? != "pkt" {
        return None;
    }
    if tokens.next()? != "(dropped" {
        return None;
    }
    let dropped_packets = tokens.next()?.trim_end_matches(',').parse().ok()?;
    Some(LinkCounters {
        sent_bytes,
        sent_packets,
        dropped_packets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "\
qdisc mq 0: root
 Sent 987654321 bytes 712345 pkt (dropped 17, overlimits 0 requeues 3)
 backlog 0b 0p requeues 3
qdisc fq_codel 0: parent :1 limit 10240p flows 1024 quantum 1514 target 5ms interval 100ms memory_limit 32Mb ecn drop_batch 64
 Sent 123456 bytes 789 pkt (dropped 12, overlimits 0 requeues 0)
 backlog 0b 0p requeues 0
  maxpacket 1514 drop_overlimit 0 new_flow_count 5 ecn_mark 0
";

    #[test]
    fn picks_requested_sent_line() {
        let root = parse_qdisc_output(DUMP, 0).unwrap();
        assert_eq!(root.sent_bytes, 987_654_321);
        assert_eq!(root.sent_packets, 712_345);
        assert_eq!(root.dropped_packets, 17);

        let child = parse_qdisc_output(DUMP, 1).unwrap();
        assert_eq!(
            child,
            LinkCounters {
                sent_bytes: 123_456,
                sent_packets: 789,
                dropped_packets: 12,
            }
        );
    }

    #[test]
    fn missing_line_is_parse_error() {
        assert!(matches!(parse_qdisc_output(DUMP, 2), Err(StatsError::Parse(_))));
        assert!(matches!(parse_qdisc_output("", 0), Err(StatsError::Parse(_))));
    }

    #[test]
    fn malformed_sent_line_is_parse_error() {
        let text = " Sent many bytes 1 pkt (dropped 0, overlimits 0 requeues 0)\n";
        assert!(matches!(parse_qdisc_output(text, 0), Err(StatsError::Parse(_))));
        let text = " Sent 10 bytes 1 pkt\n";
        assert!(matches!(parse_qdisc_output(text, 0), Err(StatsError::Parse(_))));
    }

    #[test]
    fn missing_tc_binary_or_device_is_error() {
        let mut stats = QdiscStats::new("does_not_exist_xyz99", 0);
        assert!(stats.sample().is_err());
    }
}
