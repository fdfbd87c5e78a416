//! Crate-wide configuration, validated once at construction time rather
//! than deep inside an algorithm.

use crate::error::CoreError;

/// Whether the scheduler's clock is pulsed by a background timer or by
/// explicit `trigger()` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Auto,
    Manual,
}

/// Settings recognized by the pool and scheduler, all with defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Pool size. Defaults to hardware parallelism.
    pub worker_count: usize,
    /// Wall-clock duration of one tick in automatic mode.
    pub tick_length_ms: u64,
    /// Cap on tasks simultaneously outstanding in the pool. 0 = unlimited.
    pub max_concurrent: usize,
    /// Manual vs. automatic clock.
    pub mode: Mode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            tick_length_ms: 100,
            max_concurrent: 0,
            mode: Mode::Auto,
        }
    }
}

impl Config {
    /// Validates the settings, raising [`CoreError::InvalidConfiguration`]
    /// for a zero worker count or a zero tick length.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.worker_count == 0 {
            return Err(CoreError::InvalidConfiguration(
                "worker_count must be greater than zero".to_string(),
            ));
        }
        if self.tick_length_ms == 0 {
            return Err(CoreError::InvalidConfiguration(
                "tick_length_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_worker_count_is_invalid() {
        let cfg = Config {
            worker_count: 0,
            ..Config::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(CoreError::InvalidConfiguration(
                "worker_count must be greater than zero".to_string()
            ))
        );
    }

    #[test]
    fn zero_tick_length_is_invalid() {
        let cfg = Config {
            tick_length_ms: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
