use core::time::Duration;

use crate::error::{ThreadError, ThreadResult};
use crate::stack::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};

/// What happens to a terminated thread's context and stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaim {
    /// Released when a scan reaches the terminated thread.
    Lazy,
    /// Kept until [`shutdown`](crate::sync::shutdown).
    Never,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Usable stack size for every thread created without an explicit size.
    pub stack_size: usize,
    /// Period of the preemption timer.
    pub preemption_interval: Duration,
    /// Arm the preemption timer while `join` runs.
    pub preemption: bool,
    pub reclaim: Reclaim,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            stack_size: DEFAULT_STACK_SIZE,
            preemption_interval: Duration::from_secs(3),
            preemption: true,
            reclaim: Reclaim::Lazy,
        }
    }
}

impl SchedulerConfig {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> ThreadResult<()> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ThreadError::InvalidStackSize {
                size: self.stack_size,
                min: MIN_STACK_SIZE,
            });
        }
        if self.preemption && self.preemption_interval.is_zero() {
            return Err(ThreadError::InvalidConfig(
                "preemption interval must be non-zero",
            ));
        }
        Ok(())
    }
}

pub struct ConfigBuilder {
    config: SchedulerConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder {
            config: SchedulerConfig::default(),
        }
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = size;
        self
    }

    pub fn preemption_interval(mut self, interval: Duration) -> Self {
        self.config.preemption_interval = interval;
        self
    }

    pub fn preemption(mut self, enabled: bool) -> Self {
        self.config.preemption = enabled;
        self
    }

    pub fn reclaim(mut self, policy: Reclaim) -> Self {
        self.config.reclaim = policy;
        self
    }

    /// Finishes the configuration, rejecting values the scheduler cannot use.
    pub fn build(self) -> ThreadResult<SchedulerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
