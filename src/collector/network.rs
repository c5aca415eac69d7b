use async_trait::async_trait;

use super::{Collector, CollectorError, Dimension, RateWindow, Reading};

/// Aggregate network throughput (rx + tx, all non-loopback interfaces)
/// from /proc/net/dev, converted to KB/s against the previous call's
/// byte counter.
pub struct NetworkCollector {
    path: String,
    window: RateWindow,
}

impl NetworkCollector {
    pub fn new() -> Self {
        Self {
            path: "/proc/net/dev".to_string(),
            window: RateWindow::new(),
        }
    }
}

impl Default for NetworkCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for NetworkCollector {
    fn dimension(&self) -> Dimension {
        Dimension::Network
    }

    async fn sample(&self) -> Result<Reading, CollectorError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|source| CollectorError::Io {
            path: self.path.clone(),
            source,
        })?;

        let total = parse_net_dev(&contents).ok_or_else(|| CollectorError::Parse {
            path: self.path.clone(),
            detail: "no interface lines".to_string(),
        })?;

        Ok(Reading::NetworkKbps(self.window.observe(total)))
    }
}

/// Sum rx + tx bytes over every interface except loopback.
pub(crate) fn parse_net_dev(contents: &str) -> Option<u64> {
    let mut total: u64 = 0;
    let mut saw_interface = false;

    // Inter-|   Receive                    ...       |  Transmit
    //  face |bytes packets errs ...                  |bytes packets ...
    for line in contents.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name == "lo" {
            continue;
        }

        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }

        let rx: u64 = fields[0].parse().ok()?;
        let tx: u64 = fields[8].parse().ok()?;
        total = total.saturating_add(rx).saturating_add(tx);
        saw_interface = true;
    }

    saw_interface.then_some(total)
}
