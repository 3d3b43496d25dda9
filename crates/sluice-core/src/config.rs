//! Task configuration types.

use std::time::Duration;

/// Default interval between automatic commit passes.
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Default capacity of each inter-pump buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Minimum buffer capacity (must hold at least a few messages).
pub const MIN_BUFFER_SIZE: usize = 4;

/// Maximum buffer capacity (prevents excessive memory usage).
pub const MAX_BUFFER_SIZE: usize = 1 << 20;

/// Configuration for a running task.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Interval between automatic commit passes.
    pub commit_interval: Duration,

    /// Capacity of each inter-pump buffer (rounded up to a power of 2).
    pub buffer_size: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl TaskConfig {
    /// Creates a configuration with the specified buffer size.
    #[must_use]
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE),
            ..Default::default()
        }
    }

    /// Creates a builder for custom configuration.
    #[must_use]
    pub fn builder() -> TaskConfigBuilder {
        TaskConfigBuilder::default()
    }

    /// Returns the effective buffer capacity (clamped, rounded to power of 2).
    #[must_use]
    pub fn effective_buffer_size(&self) -> usize {
        self.buffer_size
            .clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE)
            .next_power_of_two()
    }
}

/// Builder for [`TaskConfig`].
#[derive(Debug, Default)]
pub struct TaskConfigBuilder {
    commit_interval: Option<Duration>,
    buffer_size: Option<usize>,
}

impl TaskConfigBuilder {
    /// Sets the interval between automatic commit passes.
    #[must_use]
    pub fn commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = Some(interval);
        self
    }

    /// Sets the inter-pump buffer capacity.
    #[must_use]
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> TaskConfig {
        TaskConfig {
            commit_interval: self.commit_interval.unwrap_or(DEFAULT_COMMIT_INTERVAL),
            buffer_size: self
                .buffer_size
                .unwrap_or(DEFAULT_BUFFER_SIZE)
                .clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE),
        }
    }
}
