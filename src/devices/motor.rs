//! Typed model of the drive: decodes raw samples into [`MotorState`], gates
//! commands against the current state and encodes accepted commands into
//! register writes.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::num::NonZeroU16;

use super::registers::Register;
use super::sample::RawSample;
use super::status::{ModeClass, StatusDecodeTable};
use crate::config::MotorSettings;
use crate::utils::error::CommandError;

/// HSW/HIW normalisation: 0x4000 is 100 % of the reference.
const SETPOINT_FULL_SCALE: f64 = 16384.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaultCode(NonZeroU16);

impl FaultCode {
    pub fn new(code: u16) -> Option<Self> {
        NonZeroU16::new(code).map(Self)
    }

    pub fn get(&self) -> u16 {
        self.0.get()
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// A faulted drive always carries its fault code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingMode {
    Stopped,
    Running,
    Faulted(FaultCode),
    Unknown,
}

impl OperatingMode {
    pub fn label(&self) -> &'static str {
        match self {
            OperatingMode::Stopped => "STOPPED",
            OperatingMode::Running => "RUNNING",
            OperatingMode::Faulted(_) => "FAULTED",
            OperatingMode::Unknown => "UNKNOWN",
        }
    }

    pub fn fault_code(&self) -> Option<FaultCode> {
        match self {
            OperatingMode::Faulted(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingMode::Faulted(code) => write!(f, "FAULTED ({})", code),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorState {
    pub mode: OperatingMode,
    /// Speed setpoint in percent of the reference (HSW).
    pub commanded_speed: Option<f64>,
    /// Measured speed in RPM.
    pub actual_speed: Option<f64>,
    pub status_word: Option<u16>,
    pub warning_code: Option<u16>,
    pub sampled_at: Option<DateTime<Utc>>,
}

impl MotorState {
    /// State before the first successful sample.
    pub fn unknown() -> Self {
        Self {
            mode: OperatingMode::Unknown,
            commanded_speed: None,
            actual_speed: None,
            status_word: None,
            warning_code: None,
            sampled_at: None,
        }
    }

    pub fn fault_code(&self) -> Option<FaultCode> {
        self.mode.fault_code()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "mode": self.mode.label(),
            "fault_code": self.fault_code().map(|c| c.get()),
            "commanded_speed": self.commanded_speed,
            "actual_speed": self.actual_speed,
            "status_word": self.status_word,
            "warning_code": self.warning_code,
            "sampled_at": self.sampled_at.map(|t| t.to_rfc3339()),
        })
    }
}

impl Default for MotorState {
    fn default() -> Self {
        Self::unknown()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Start,
    Stop,
    /// Setpoint in percent of the reference frequency; negative reverses.
    SetSpeed(f64),
    ResetFault,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Start => f.write_str("Start"),
            Command::Stop => f.write_str("Stop"),
            Command::SetSpeed(value) => write!(f, "SetSpeed({}%)", value),
            Command::ResetFault => f.write_str("ResetFault"),
        }
    }
}

/// A single register write produced by [`MotorModel::encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    pub register: Register,
    pub value: u16,
    /// Whether repeating the write leaves the device in the same state.
    pub idempotent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlWords {
    pub start: u16,
    pub stop: u16,
    pub fault_ack: u16,
}

impl Default for ControlWords {
    fn default() -> Self {
        Self {
            start: 0x047F,
            stop: 0x047E,
            fault_ack: 0x04FE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MotorModel {
    status_table: StatusDecodeTable,
    control_words: ControlWords,
    speed_limit_percent: f64,
}

impl MotorModel {
    pub fn new(
        status_table: StatusDecodeTable,
        control_words: ControlWords,
        speed_limit_percent: f64,
    ) -> Self {
        Self {
            status_table,
            control_words,
            speed_limit_percent,
        }
    }

    pub fn from_settings(settings: &MotorSettings) -> Self {
        Self::new(
            StatusDecodeTable::new(settings.status_rules.clone()),
            settings.control_words,
            settings.speed_limit_percent,
        )
    }

    /// Decodes a sample into a state. Same sample, same state.
    pub fn apply(&self, sample: &RawSample) -> MotorState {
        let status_word = sample.get(Register::Zsw);
        let mode = match status_word {
            Some(word) => self.decode_mode(word, sample),
            None => OperatingMode::Unknown,
        };

        MotorState {
            mode,
            commanded_speed: sample
                .get_signed(Register::Hsw)
                .map(|raw| raw as f64 * 100.0 / SETPOINT_FULL_SCALE),
            actual_speed: sample.scaled(Register::Speed),
            status_word,
            warning_code: sample.get(Register::Warning).filter(|code| *code != 0),
            sampled_at: Some(sample.captured_at()),
        }
    }

    fn decode_mode(&self, word: u16, sample: &RawSample) -> OperatingMode {
        match self.status_table.classify(word) {
            Some(ModeClass::Stopped) => OperatingMode::Stopped,
            Some(ModeClass::Running) => OperatingMode::Running,
            Some(ModeClass::Faulted) => {
                let code = sample
                    .get(Register::Fault)
                    .and_then(FaultCode::new)
                    .or_else(|| sample.get(Register::LastFault).and_then(FaultCode::new));
                match code {
                    Some(code) => OperatingMode::Faulted(code),
                    None => {
                        warn!(
                            "⚠️  Protocol anomaly: status word 0x{:04x} reports a fault but no fault code is set",
                            word
                        );
                        OperatingMode::Unknown
                    }
                }
            }
            None => {
                warn!("⚠️  Protocol anomaly: unrecognised status word 0x{:04x}", word);
                OperatingMode::Unknown
            }
        }
    }

    /// The only gate between callers and the drive.
    pub fn validate(&self, command: &Command, current: &MotorState) -> Result<(), CommandError> {
        let allowed = match command {
            Command::Stop => true,
            Command::Start => matches!(current.mode, OperatingMode::Stopped | OperatingMode::Running),
            Command::SetSpeed(value) => {
                if !value.is_finite() || value.abs() > self.speed_limit_percent {
                    return Err(CommandError::SetpointOutOfRange {
                        value: *value,
                        limit: self.speed_limit_percent,
                    });
                }
                matches!(current.mode, OperatingMode::Stopped | OperatingMode::Running)
            }
            Command::ResetFault => matches!(current.mode, OperatingMode::Faulted(_)),
        };

        if allowed {
            debug!("✅ {} accepted in mode {}", command, current.mode);
            Ok(())
        } else {
            Err(CommandError::InvalidTransition {
                command: *command,
                mode: current.mode,
            })
        }
    }

    pub fn encode(&self, command: &Command) -> Vec<RegisterWrite> {
        match command {
            Command::Start => vec![RegisterWrite {
                register: Register::Stw,
                value: self.control_words.start,
                idempotent: true,
            }],
            Command::Stop => vec![RegisterWrite {
                register: Register::Stw,
                value: self.control_words.stop,
                idempotent: true,
            }],
            Command::SetSpeed(percent) => {
                let scaled = (percent / 100.0 * SETPOINT_FULL_SCALE)
                    .round()
                    .clamp(i16::MIN as f64, i16::MAX as f64) as i16;
                vec![RegisterWrite {
                    register: Register::Hsw,
                    value: scaled as u16,
                    idempotent: true,
                }]
            }
            // Acknowledge acts on the rising edge of STW bit 7.
            Command::ResetFault => vec![RegisterWrite {
                register: Register::Stw,
                value: self.control_words.fault_ack,
                idempotent: false,
            }],
        }
    }
}

impl Default for MotorModel {
    fn default() -> Self {
        Self::from_settings(&MotorSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(zsw: u16, fault: u16, speed: u16, hsw: u16) -> RawSample {
        RawSample::from_pairs([
            (Register::Speed, speed),
            (Register::Fault, fault),
            (Register::LastFault, 0),
            (Register::Warning, 0),
            (Register::Hsw, hsw),
            (Register::Zsw, zsw),
        ])
    }

    fn state(mode: OperatingMode) -> MotorState {
        MotorState {
            mode,
            ..MotorState::unknown()
        }
    }

    #[test]
    fn apply_is_deterministic() {
        let model = MotorModel::default();
        let raw = sample(0xEF37, 0, 50, 0x2000);
        let first = model.apply(&raw);
        let second = model.apply(&raw);
        assert_eq!(first, second);
        assert_eq!(first.mode, OperatingMode::Running);
        assert_eq!(first.actual_speed, Some(50.0));
        assert_eq!(first.commanded_speed, Some(50.0));
    }

    #[test]
    fn faulted_state_carries_fault_code() {
        let model = MotorModel::default();
        let decoded = model.apply(&sample(0xEA38, 85, 0, 0));
        assert_eq!(decoded.fault_code().map(|c| c.get()), Some(85));
    }

    #[test]
    fn fault_without_code_decodes_to_unknown() {
        let model = MotorModel::default();
        let decoded = model.apply(&sample(0xEA38, 0, 0, 0));
        assert_eq!(decoded.mode, OperatingMode::Unknown);
    }

    #[test]
    fn last_fault_is_used_when_current_fault_is_clear() {
        let model = MotorModel::default();
        let raw = RawSample::from_pairs([
            (Register::Fault, 0),
            (Register::LastFault, 3),
            (Register::Zsw, 0x0008),
        ]);
        assert_eq!(model.apply(&raw).fault_code().map(|c| c.get()), Some(3));
    }

    #[test]
    fn unrecognised_status_word_is_unknown_not_fault() {
        let model = MotorModel::default();
        let decoded = model.apply(&sample(0x0006, 12, 0, 0));
        assert_eq!(decoded.mode, OperatingMode::Unknown);
        assert!(decoded.fault_code().is_none());
    }

    #[test]
    fn missing_status_word_is_unknown() {
        let model = MotorModel::default();
        let decoded = model.apply(&RawSample::from_pairs([(Register::Speed, 10)]));
        assert_eq!(decoded.mode, OperatingMode::Unknown);
    }

    #[test]
    fn set_speed_rejected_when_faulted_or_unknown() {
        let model = MotorModel::default();
        let faulted = state(OperatingMode::Faulted(FaultCode::new(7).unwrap()));
        for current in [faulted, state(OperatingMode::Unknown)] {
            assert!(matches!(
                model.validate(&Command::SetSpeed(40.0), &current),
                Err(CommandError::InvalidTransition { .. })
            ));
        }
        for current in [state(OperatingMode::Stopped), state(OperatingMode::Running)] {
            assert!(model.validate(&Command::SetSpeed(40.0), &current).is_ok());
        }
    }

    #[test]
    fn set_speed_out_of_range_is_rejected() {
        let model = MotorModel::default();
        assert!(matches!(
            model.validate(&Command::SetSpeed(120.0), &state(OperatingMode::Running)),
            Err(CommandError::SetpointOutOfRange { .. })
        ));
        assert!(model
            .validate(&Command::SetSpeed(f64::NAN), &state(OperatingMode::Running))
            .is_err());
    }

    #[test]
    fn reset_fault_only_when_faulted_and_stop_always() {
        let model = MotorModel::default();
        assert!(model
            .validate(&Command::ResetFault, &state(OperatingMode::Running))
            .is_err());
        let faulted = state(OperatingMode::Faulted(FaultCode::new(1).unwrap()));
        assert!(model.validate(&Command::ResetFault, &faulted).is_ok());
        assert!(model.validate(&Command::Start, &faulted).is_err());
        assert!(model.validate(&Command::Stop, &faulted).is_ok());
        assert!(model.validate(&Command::Stop, &state(OperatingMode::Unknown)).is_ok());
    }

    #[test]
    fn encode_maps_commands_to_control_registers() {
        let model = MotorModel::default();
        assert_eq!(
            model.encode(&Command::SetSpeed(50.0)),
            vec![RegisterWrite {
                register: Register::Hsw,
                value: 0x2000,
                idempotent: true
            }]
        );
        assert_eq!(model.encode(&Command::SetSpeed(-100.0))[0].value, 0xC000);
        let ack = model.encode(&Command::ResetFault);
        assert_eq!(ack[0].register, Register::Stw);
        assert!(!ack[0].idempotent);
        assert_eq!(model.encode(&Command::Start)[0].value, 0x047F);
    }
}
