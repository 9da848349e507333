//! Engine and transaction tunables.

use std::time::Duration;

use crate::error::ConfigError;

/// Tunables shared by every transaction an [`IaxEngine`](crate::engine::IaxEngine) drives.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    /// Number of retransmissions attempted before a frame is given up on
    /// (spec.md §8 invariant 8: transmitted at most `retrans_count + 1` times).
    pub retrans_count: u32,

    /// Delay between retransmission attempts.
    pub retrans_interval: Duration,

    /// How long an idle transaction may go without activity before it is
    /// timed out.
    pub transaction_timeout: Duration,

    /// Interval between keepalive Pings while a transaction is connected.
    pub ping_interval: Duration,

    /// Maximum payload bytes in a single full frame before it must be
    /// fragmented (fragmentation itself is out of scope; this bounds the
    /// encoder's refusal point).
    pub max_full_frame_data_len: usize,

    /// Maximum full frames queued inbound before new ones are dropped
    /// (spec.md §7 "Resource exhaustion").
    pub max_in_frames: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retrans_count: 5,
            retrans_interval: Duration::from_millis(500),
            transaction_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(20),
            max_full_frame_data_len: 1024,
            max_in_frames: 100,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Reject configurations that would stall retransmission or the event
    /// pump entirely.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retrans_interval.is_zero() {
            return Err(ConfigError::ZeroRetransInterval);
        }
        if self.transaction_timeout.is_zero() {
            return Err(ConfigError::ZeroTransactionTimeout);
        }
        if self.max_in_frames == 0 {
            return Err(ConfigError::ZeroMaxInFrames);
        }
        Ok(())
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    retrans_count: Option<u32>,
    retrans_interval: Option<Duration>,
    transaction_timeout: Option<Duration>,
    ping_interval: Option<Duration>,
    max_full_frame_data_len: Option<usize>,
    max_in_frames: Option<usize>,
}

impl EngineConfigBuilder {
    #[must_use]
    pub fn retrans_count(mut self, value: u32) -> Self {
        self.retrans_count = Some(value);
        self
    }

    #[must_use]
    pub fn retrans_interval(mut self, value: Duration) -> Self {
        self.retrans_interval = Some(value);
        self
    }

    #[must_use]
    pub fn transaction_timeout(mut self, value: Duration) -> Self {
        self.transaction_timeout = Some(value);
        self
    }

    #[must_use]
    pub fn ping_interval(mut self, value: Duration) -> Self {
        self.ping_interval = Some(value);
        self
    }

    #[must_use]
    pub fn max_full_frame_data_len(mut self, value: usize) -> Self {
        self.max_full_frame_data_len = Some(value);
        self
    }

    #[must_use]
    pub fn max_in_frames(mut self, value: usize) -> Self {
        self.max_in_frames = Some(value);
        self
    }

    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        let defaults = EngineConfig::default();
        let config = EngineConfig {
            retrans_count: self.retrans_count.unwrap_or(defaults.retrans_count),
            retrans_interval: self.retrans_interval.unwrap_or(defaults.retrans_interval),
            transaction_timeout: self.transaction_timeout.unwrap_or(defaults.transaction_timeout),
            ping_interval: self.ping_interval.unwrap_or(defaults.ping_interval),
            max_full_frame_data_len: self
                .max_full_frame_data_len
                .unwrap_or(defaults.max_full_frame_data_len),
            max_in_frames: self.max_in_frames.unwrap_or(defaults.max_in_frames),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code: unwrap/expect are acceptable
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_only_specified_fields() {
        let config = EngineConfig::builder().retrans_count(9).build().expect("valid config");
        assert_eq!(config.retrans_count, 9);
        assert_eq!(config.ping_interval, EngineConfig::default().ping_interval);
    }

    #[test]
    fn zero_transaction_timeout_is_rejected() {
        let err = EngineConfig::builder()
            .transaction_timeout(Duration::from_secs(0))
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroTransactionTimeout);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = EngineConfig::builder().retrans_count(3).build().expect("valid config");
        let json = serde_json::to_string(&config).expect("serializes");
        let restored: EngineConfig = serde_json::from_str(&json).expect("deserializes");
        assert_eq!(restored.retrans_count, 3);
    }
}
