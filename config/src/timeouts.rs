//! Wall-clock limits for every bounded wait in a run.
//!
//! In configuration files all values are given in seconds and may be
//! fractional:
//!
//! ```toml
//! [timeouts]
//! command = 10
//! receive = 180
//! sql = 600
//! ```

use crate::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeouts used by the runner, the exchange and the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Limit for a single external command
    #[serde(with = "secs")]
    pub command: Duration,
    /// Limit for decoding one process accounting file
    #[serde(with = "secs")]
    pub accounting: Duration,
    /// How long the producer waits for the consumer to become ready
    #[serde(with = "secs")]
    pub handshake: Duration,
    /// How long the producer waits for room in the channel
    #[serde(with = "secs")]
    pub send: Duration,
    /// How long the consumer waits for the next item
    #[serde(with = "secs")]
    pub receive: Duration,
    /// Limit for one database session
    #[serde(with = "secs")]
    pub sql: Duration,
    /// Grace period for a worker to exit after the run is over
    #[serde(with = "secs")]
    pub join: Duration,
    /// Upper bound for the whole collection worker
    #[serde(with = "secs")]
    pub run: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(10),
            accounting: Duration::from_secs(120),
            handshake: Duration::from_secs(10),
            send: Duration::from_secs(60),
            receive: Duration::from_secs(180),
            sql: Duration::from_secs(600),
            join: Duration::from_secs(10),
            run: Duration::from_secs(6 * 3600),
        }
    }
}

impl Timeouts {
    /// Longest single wait the producer can spend on one item.
    pub fn producer_item_max(&self) -> Duration {
        self.send.max(self.command).max(self.accounting)
    }

    /// Check the relations between timeouts.
    ///
    /// The consumer's receive timeout must exceed every producer-side
    /// per-item wait, otherwise a slow producer looks like a dead one.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("handshake", self.handshake),
            ("send", self.send),
            ("receive", self.receive),
            ("command", self.command),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "timeout '{}' must be greater than zero",
                    name
                )));
            }
        }

        let producer = self.producer_item_max();
        if self.receive <= producer {
            return Err(ConfigError::Invalid(format!(
                "receive timeout ({:?}) must be larger than the longest producer wait ({:?})",
                self.receive, producer
            )));
        }

        if self.run <= self.receive {
            tracing::warn!(
                run = ?self.run,
                receive = ?self.receive,
                "Run timeout is shorter than the receive timeout"
            );
        }

        Ok(())
    }
}

mod secs {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
