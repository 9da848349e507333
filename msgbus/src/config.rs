//! Dispatcher configuration.

use crate::error::ConfigError;

/// Tunables for a [`Dispatcher`](crate::dispatcher::Dispatcher).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DispatcherConfig {
    /// Dispatch time, in milliseconds, beyond which a `warn!` is logged with
    /// the offending message name and handler chain (spec.md §4.1 "Timing
    /// warnings").
    pub warn_time_ms: u64,

    /// How long [`Dispatcher::uninstall`](crate::dispatcher::Dispatcher::uninstall)
    /// waits for a handler's in-flight call count to reach zero before
    /// giving up.
    pub uninstall_timeout_ms: u64,

    /// Maximum depth of the async FIFO queue; `0` means unbounded.
    /// [`Dispatcher::enqueue`](crate::dispatcher::Dispatcher::enqueue) rejects
    /// a message with [`DispatchError::QueueFull`](crate::error::DispatchError::QueueFull)
    /// once the queue is at this depth.
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            warn_time_ms: 100,
            uninstall_timeout_ms: 5_000,
            queue_capacity: 0,
        }
    }
}

impl DispatcherConfig {
    pub fn builder() -> DispatcherConfigBuilder {
        DispatcherConfigBuilder::default()
    }

    /// Reject configurations that would make the dispatcher unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.uninstall_timeout_ms == 0 {
            return Err(ConfigError::ZeroUninstallTimeout);
        }
        Ok(())
    }
}

/// Builder for [`DispatcherConfig`].
#[derive(Debug, Default)]
pub struct DispatcherConfigBuilder {
    config: OptionalConfig,
}

#[derive(Debug, Default)]
struct OptionalConfig {
    warn_time_ms: Option<u64>,
    uninstall_timeout_ms: Option<u64>,
    queue_capacity: Option<usize>,
}

impl DispatcherConfigBuilder {
    #[must_use]
    pub fn warn_time_ms(mut self, value: u64) -> Self {
        self.config.warn_time_ms = Some(value);
        self
    }

    #[must_use]
    pub fn uninstall_timeout_ms(mut self, value: u64) -> Self {
        self.config.uninstall_timeout_ms = Some(value);
        self
    }

    #[must_use]
    pub fn queue_capacity(mut self, value: usize) -> Self {
        self.config.queue_capacity = Some(value);
        self
    }

    pub fn build(self) -> Result<DispatcherConfig, ConfigError> {
        let defaults = DispatcherConfig::default();
        let config = DispatcherConfig {
            warn_time_ms: self.config.warn_time_ms.unwrap_or(defaults.warn_time_ms),
            uninstall_timeout_ms: self
                .config
                .uninstall_timeout_ms
                .unwrap_or(defaults.uninstall_timeout_ms),
            queue_capacity: self.config.queue_capacity.unwrap_or(defaults.queue_capacity),
        };
        config.validate()?;
        Ok(config)
    }
}
