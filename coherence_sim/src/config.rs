use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{bus::BusPolicy, common::CoreId, memory::MemoryInit, trace::MalformedPolicy};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("`{0}` must be at least 1")]
    Zero(&'static str),
    #[error("malformed configuration: {0}")]
    Deser(#[from] serde_json::Error),
}

/// Artificial pause before each instruction, to make interleavings visible.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayPolicy {
    #[default]
    None,
    /// same pause for every core, in milliseconds
    Fixed(u64),
    /// `(core + 1) * ms`, so later cores lag behind
    Staggered(u64),
}

impl DelayPolicy {
    pub fn for_core(self, core: CoreId) -> Option<Duration> {
        match self {
            DelayPolicy::None => None,
            DelayPolicy::Fixed(ms) => Some(Duration::from_millis(ms)),
            DelayPolicy::Staggered(ms) => {
                Some(Duration::from_millis(ms.saturating_mul(core.index() as u64 + 1)))
            }
        }
    }
}

/// What happens once every unit has terminated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// nothing: provisional states and dirty lines stay as they are
    #[default]
    Halt,
    /// drain the bus until no unit publishes anything
    Settle,
    /// settle, then write every MODIFIED line back
    SettleAndFlush,
}

impl ShutdownPolicy {
    pub fn settles(self) -> bool {
        !matches!(self, ShutdownPolicy::Halt)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub cores: usize,
    /// direct-mapped; line index = address mod `cache_lines`
    pub cache_lines: usize,
    pub memory_size: usize,
    pub memory_init: MemoryInit,
    pub bus: BusPolicy,
    pub delay: DelayPolicy,
    pub malformed: MalformedPolicy,
    pub shutdown: ShutdownPolicy,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            cores: 2,
            cache_lines: 2,
            memory_size: 24,
            memory_init: MemoryInit::Identity,
            bus: BusPolicy::Unbounded,
            delay: DelayPolicy::None,
            malformed: MalformedPolicy::Abort,
            shutdown: ShutdownPolicy::Halt,
        }
    }
}

impl SimConfig {
    pub fn from_reader(r: impl std::io::Read) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_reader(r)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        macro_rules! nonzero {
            ($($field:ident),*) => {
                $(if self.$field == 0 {
                    return Err(ConfigError::Zero(stringify!($field)));
                })*
            };
        }
        nonzero!(cores, cache_lines, memory_size);
        if let BusPolicy::Bounded { capacity: 0 } = self.bus {
            return Err(ConfigError::Zero("bus.capacity"));
        }
        Ok(())
    }
}
