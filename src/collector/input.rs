use async_trait::async_trait;

use super::{Collector, CollectorError, Dimension, Reading};

/// Seconds since the last keyboard or pointer event.
///
/// The probe is host-specific and opaque to the rest of the agent; this
/// implementation shells out to `xprintidle` (milliseconds on stdout).
/// Hosts without a probe report the dimension as unsupported, which the
/// idleness predicate treats as satisfied — a headless server has no
/// human input to wait out.
pub struct InputCollector {
    probe: String,
}

impl InputCollector {
    pub fn new() -> Self {
        Self {
            probe: "xprintidle".to_string(),
        }
    }
}

impl Default for InputCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for InputCollector {
    fn dimension(&self) -> Dimension {
        Dimension::Input
    }

    async fn sample(&self) -> Result<Reading, CollectorError> {
        let output = match tokio::process::Command::new(&self.probe).output().await {
            Ok(o) => o,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Reading::InputIdle(None));
            }
            Err(e) => {
                return Err(CollectorError::Probe {
                    probe: self.probe.clone(),
                    detail: e.to_string(),
                });
            }
        };

        if !output.status.success() {
            // Present but unusable (no X display, etc.) — unsupported, not an error.
            return Ok(Reading::InputIdle(None));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let millis: u64 =
            stdout
                .trim()
                .parse()
                .map_err(|_| CollectorError::Probe {
                    probe: self.probe.clone(),
                    detail: format!("unparseable output {:?}", stdout.trim()),
                })?;

        Ok(Reading::InputIdle(Some(millis / 1000)))
    }
}
