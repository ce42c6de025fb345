//! Sinamics drive control and continuous condition monitoring over Modbus RTU.
//!
//! The [`services::monitor::ContinuousMonitor`] owns the serial link, polls the
//! drive on a fixed cadence, decodes each sample into a [`devices::MotorState`]
//! and hands one record per tick to anomaly scoring, maintenance evaluation,
//! persistence and console output.

pub mod analysis;
pub mod cli;
pub mod config;
pub mod devices;
pub mod modbus;
pub mod output;
pub mod services;
#[cfg(feature = "sqlite")]
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use analysis::{AnomalyScorer, AnomalyVerdict};
pub use config::Config;
pub use devices::{Command, MotorModel, MotorState, OperatingMode};
pub use modbus::{RegisterClient, SerialTransport, SimulatedDrive, Transport};
pub use services::{ContinuousMonitor, MaintenanceService, MonitorHandle, MonitorState};
#[cfg(feature = "sqlite")]
pub use storage::SampleStore;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
