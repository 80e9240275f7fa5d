//! Run configuration and derived sizing.

use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::net::Endpoint;
use crate::time::Stamp;

/// How the measurement roles are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    /// Every role multiplexed on one event loop.
    #[default]
    SingleThread,
    /// One thread per role.
    MultiThread,
}

/// When a completed measurement is pushed toward the writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResultMode {
    /// Forward as soon as the reply is validated.
    #[default]
    Immediate,
    /// Forward when the probe's ledger slot is recycled, keeping the
    /// receive path free of pipe writes.
    OnRecycle,
}

/// Output encoding for measurement records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// `<id> <ms>.<ns> ms`, one line per probe.
    #[default]
    Friendly,
    /// `<id>,<microseconds>`, one line per probe.
    Csv,
    /// Native-endian `u64` pairs of identifier and microseconds.
    Binary,
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "friendly" => Ok(Self::Friendly),
            "csv" => Ok(Self::Csv),
            "bin" | "binary" => Ok(Self::Binary),
            other => Err(ConfigError::UnknownFormat(other.to_string())),
        }
    }
}

/// Complete run configuration, with the same defaults the CLI applies.
#[derive(Debug, Clone)]
pub struct Config {
    /// Mirror endpoint. Its port doubles as the local reply port: the
    /// mirror reflects probes back to this port on the measurer's host.
    pub mirror: Endpoint,
    /// Milliseconds between send timer ticks.
    pub interval_ms: u64,
    /// Probes transmitted per tick.
    pub packets_per_tick: usize,
    /// Round trips slower than this are discarded as expired.
    pub max_latency_ms: u64,
    /// Records staged before one pipe transfer to the writer.
    pub batch_size: usize,
    /// Stop after this many probes; `None` runs until interrupted.
    pub send_limit: Option<u64>,
    pub strategy: Strategy,
    pub result_mode: ResultMode,
    pub format: OutputFormat,
    /// Output path; `None` writes to stdout.
    pub output: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mirror: Endpoint::localhost(0),
            interval_ms: 1_000,
            packets_per_tick: 1,
            max_latency_ms: 500,
            batch_size: 1,
            send_limit: None,
            strategy: Strategy::default(),
            result_mode: ResultMode::default(),
            format: OutputFormat::default(),
            output: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be nonzero")]
    Zero(&'static str),
    #[error("mirror port must be nonzero")]
    Port,
    #[error("unknown output format: {0} (expected friendly, csv, or bin)")]
    UnknownFormat(String),
}

impl Config {
    /// Rejects configurations the pipeline cannot size a ledger for.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("batch size"));
        }
        if self.interval_ms == 0 {
            return Err(ConfigError::Zero("send interval"));
        }
        if self.packets_per_tick == 0 {
            return Err(ConfigError::Zero("packet count"));
        }
        if self.max_latency_ms == 0 {
            return Err(ConfigError::Zero("max latency"));
        }
        if self.mirror.port() == 0 {
            return Err(ConfigError::Port);
        }
        Ok(())
    }

    /// Ledger capacity: enough slots for every probe that can be in flight
    /// within the latency window, plus one tick of margin.
    #[must_use]
    pub fn capacity(&self) -> usize {
        (self.max_latency_ms.div_ceil(self.interval_ms) + 1) as usize * self.packets_per_tick
    }

    /// Expiry threshold as a timestamp difference.
    #[must_use]
    pub const fn max_latency(&self) -> Stamp {
        Stamp::from_millis(self.max_latency_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            mirror: Endpoint::localhost(9100),
            ..Config::default()
        }
    }

    #[test]
    fn defaults_pass_validation() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn zero_fields_are_rejected() {
        let mut config = valid_config();
        config.interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Zero(_))));

        let mut config = valid_config();
        config.batch_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Zero(_))));

        let mut config = valid_config();
        config.packets_per_tick = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Zero(_))));

        let mut config = valid_config();
        config.max_latency_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Zero(_))));

        assert!(matches!(
            Config::default().validate(),
            Err(ConfigError::Port)
        ));
    }

    #[test]
    fn capacity_keeps_one_tick_of_margin() {
        // Latency window shorter than one interval still leaves two slots:
        // the probe in flight and the one claimed at the next tick.
        let mut config = valid_config();
        config.interval_ms = 1_000;
        config.max_latency_ms = 500;
        assert_eq!(config.capacity(), 2);

        config.interval_ms = 10;
        config.max_latency_ms = 1_000;
        config.packets_per_tick = 3;
        assert_eq!(config.capacity(), 303);

        config.interval_ms = 500;
        config.max_latency_ms = 500;
        config.packets_per_tick = 1;
        assert_eq!(config.capacity(), 2);
    }

    #[test]
    fn format_parsing_accepts_short_and_long_names() {
        assert_eq!("friendly".parse::<OutputFormat>().ok(), Some(OutputFormat::Friendly));
        assert_eq!("csv".parse::<OutputFormat>().ok(), Some(OutputFormat::Csv));
        assert_eq!("bin".parse::<OutputFormat>().ok(), Some(OutputFormat::Binary));
        assert_eq!("binary".parse::<OutputFormat>().ok(), Some(OutputFormat::Binary));
        assert!("yaml".parse::<OutputFormat>().is_err());
    }
}
