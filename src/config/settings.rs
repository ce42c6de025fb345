use clap::ArgMatches;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::devices::motor::ControlWords;
use crate::devices::status::{StatusDecodeTable, StatusRule};
use crate::utils::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Connection settings
    pub port: String,
    pub baud_rate: u32,
    pub parity: ParityConfig,
    pub slave_id: u8,
    pub timeout_ms: u64,

    // Polling settings
    pub poll_interval_ms: u64,
    pub retry_count: u32,
    pub retry_backoff_ms: Vec<u64>,
    pub failure_threshold: u32,
    pub debounce_threshold: u32,

    pub maintenance: MaintenanceSettings,
    pub motor: MotorSettings,
    pub scoring: ScoringSettings,
    pub output: OutputSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParityConfig {
    None,
    Even,
    Odd,
}

/// The part of [`Config`] a serial link needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub parity: ParityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    /// Consecutive healthy verdicts that clear an open alert. Defaults to the debounce threshold.
    pub clear_threshold: Option<u32>,
    pub window_size: usize,
    pub history_limit: usize,
    pub channel_capacity: usize,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            clear_threshold: None,
            window_size: 32,
            history_limit: 256,
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorSettings {
    pub speed_limit_percent: f64,
    pub control_words: ControlWords,
    pub status_rules: Vec<StatusRule>,
}

impl Default for MotorSettings {
    fn default() -> Self {
        Self {
            speed_limit_percent: 100.0,
            control_words: ControlWords::default(),
            status_rules: StatusDecodeTable::default().rules().to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    SpeedBand,
    ZScore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringSettings {
    pub kind: ScorerKind,

    // Speed band scorer
    pub speed_factor: f64,
    /// Band upper bounds are inclusive.
    pub stopped_max: f64,
    pub slow_max: f64,
    pub high_above: f64,

    // Z-score scorer
    pub register: String,
    pub window_size: usize,
    pub min_samples: usize,
    pub z_threshold: f64,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            kind: ScorerKind::SpeedBand,
            speed_factor: 8.10 / 242.0,
            stopped_max: 0.1,
            slow_max: 7.0,
            high_above: 13.0,
            register: "CURRENT".to_string(),
            window_size: 30,
            min_samples: 5,
            z_threshold: 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Console,
    Json,
    Csv,
}

impl std::str::FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "console" => Ok(OutputFormat::Console),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(ConfigError::Invalid(format!("unknown output format '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub console: bool,
    pub console_format: OutputFormat,
    /// Per-sink queue depth; a full queue drops the record instead of stalling the monitor.
    pub channel_capacity: usize,
    pub file: FileOutputSettings,
    pub database: DatabaseSettings,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            console: true,
            console_format: OutputFormat::Console,
            channel_capacity: 256,
            file: FileOutputSettings::default(),
            database: DatabaseSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOutputSettings {
    pub enabled: bool,
    pub path: String,
    pub format: OutputFormat,
}

impl Default for FileOutputSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "./data/motor_records.jsonl".to_string(),
            format: OutputFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub enabled: bool,
    pub path: String,
    pub max_connections: u32,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "data/inverter.db".to_string(),
            max_connections: 5,
            batch_size: 50,
            flush_interval_ms: 10_000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Connection settings
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            parity: ParityConfig::None,
            slave_id: 2,
            timeout_ms: 3000,

            // Polling settings
            poll_interval_ms: 2000,
            retry_count: 3,
            retry_backoff_ms: vec![50, 100, 200],
            failure_threshold: 5,
            debounce_threshold: 3,

            maintenance: MaintenanceSettings::default(),
            motor: MotorSettings::default(),
            scoring: ScoringSettings::default(),
            output: OutputSettings::default(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        info!("📁 Configuration loaded from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Applies `--port`, `--baud`, `--slave` and `--interval` when given.
    pub fn apply_overrides(&mut self, matches: &ArgMatches) -> Result<(), ConfigError> {
        if let Some(port) = matches.get_one::<String>("port") {
            self.port = port.clone();
        }
        if let Some(baud) = matches.get_one::<u32>("baud") {
            self.baud_rate = *baud;
        }
        if let Some(slave) = matches.get_one::<u8>("slave") {
            self.slave_id = *slave;
        }
        if let Some(interval) = matches.get_one::<u64>("interval") {
            self.poll_interval_ms = *interval;
        }
        debug!("⚙️  Effective configuration: {:?}", self);
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port.trim().is_empty() {
            return Err(ConfigError::Invalid("port must not be empty".into()));
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud_rate must be positive".into()));
        }
        if !(1..=247).contains(&self.slave_id) {
            return Err(ConfigError::Invalid(format!(
                "slave_id {} outside 1..=247",
                self.slave_id
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout_ms must be positive".into()));
        }
        if self.retry_count == 0 {
            return Err(ConfigError::Invalid("retry_count must be at least 1".into()));
        }
        if self.retry_backoff_ms.is_empty() {
            return Err(ConfigError::Invalid("retry_backoff_ms must not be empty".into()));
        }
        if self.failure_threshold == 0 || self.debounce_threshold == 0 {
            return Err(ConfigError::Invalid(
                "failure_threshold and debounce_threshold must be at least 1".into(),
            ));
        }
        if self.maintenance.clear_threshold == Some(0) {
            return Err(ConfigError::Invalid("maintenance.clear_threshold must be at least 1".into()));
        }
        if self.maintenance.window_size == 0 || self.maintenance.history_limit == 0 {
            return Err(ConfigError::Invalid(
                "maintenance window_size and history_limit must be positive".into(),
            ));
        }
        if !(self.motor.speed_limit_percent.is_finite() && self.motor.speed_limit_percent > 0.0) {
            return Err(ConfigError::Invalid("motor.speed_limit_percent must be positive".into()));
        }
        if self.motor.status_rules.is_empty() {
            return Err(ConfigError::Invalid("motor.status_rules must not be empty".into()));
        }
        if self.scoring.window_size < 2 || self.scoring.min_samples < 2 {
            return Err(ConfigError::Invalid("scoring window needs at least 2 samples".into()));
        }
        if self.output.channel_capacity == 0 {
            return Err(ConfigError::Invalid("output.channel_capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn serial(&self) -> SerialSettings {
        SerialSettings {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            parity: self.parity,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Vec<Duration> {
        self.retry_backoff_ms.iter().copied().map(Duration::from_millis).collect()
    }

    pub fn clear_threshold(&self) -> u32 {
        self.maintenance.clear_threshold.unwrap_or(self.debounce_threshold)
    }
}
