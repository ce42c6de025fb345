//! Anomaly scoring contract and the built-in scorers.
//!
//! A scorer sees every tick's raw sample together with the decoded state and
//! returns an [`AnomalyVerdict`]. Scorers may keep history, so `score` takes
//! `&mut self`; the monitor owns its scorer and calls it from the tick loop only.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::config::{ScorerKind, ScoringSettings};
use crate::devices::motor::{MotorState, OperatingMode};
use crate::devices::registers::Register;
use crate::devices::sample::RawSample;
use crate::utils::error::{ConfigError, ScoringError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonTag {
    Nominal,
    SlowSpeed,
    HighSpeed,
    Outlier,
    DriveFault,
    InsufficientData,
}

impl fmt::Display for ReasonTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReasonTag::Nominal => "nominal",
            ReasonTag::SlowSpeed => "slow_speed",
            ReasonTag::HighSpeed => "high_speed",
            ReasonTag::Outlier => "outlier",
            ReasonTag::DriveFault => "drive_fault",
            ReasonTag::InsufficientData => "insufficient_data",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyVerdict {
    pub score: f64,
    pub is_anomalous: bool,
    pub reason: ReasonTag,
}

impl AnomalyVerdict {
    pub fn healthy(score: f64) -> Self {
        Self {
            score,
            is_anomalous: false,
            reason: ReasonTag::Nominal,
        }
    }

    pub fn anomalous(score: f64, reason: ReasonTag) -> Self {
        Self {
            score,
            is_anomalous: true,
            reason,
        }
    }
}

pub trait AnomalyScorer: Send {
    fn score(&mut self, sample: &RawSample, state: &MotorState) -> Result<AnomalyVerdict, ScoringError>;

    fn name(&self) -> &'static str;
}

impl<S: AnomalyScorer + ?Sized> AnomalyScorer for Box<S> {
    fn score(&mut self, sample: &RawSample, state: &MotorState) -> Result<AnomalyVerdict, ScoringError> {
        (**self).score(sample, state)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Speed classes of the maintenance heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedClass {
    Stopped,
    Slow,
    Normal,
    High,
}

/// Classifies the SPEED register into bands after a linear conversion.
/// Slow and high bands only count as anomalous while the drive is running.
#[derive(Debug, Clone)]
pub struct SpeedBandScorer {
    factor: f64,
    stopped_max: f64,
    slow_max: f64,
    high_above: f64,
}

impl SpeedBandScorer {
    pub fn new(factor: f64, stopped_max: f64, slow_max: f64, high_above: f64) -> Self {
        Self {
            factor,
            stopped_max,
            slow_max,
            high_above,
        }
    }

    pub fn from_settings(settings: &ScoringSettings) -> Self {
        Self::new(
            settings.speed_factor,
            settings.stopped_max,
            settings.slow_max,
            settings.high_above,
        )
    }

    pub fn classify(&self, speed: f64) -> SpeedClass {
        let speed = speed.abs();
        if speed <= self.stopped_max {
            SpeedClass::Stopped
        } else if speed <= self.slow_max {
            SpeedClass::Slow
        } else if speed > self.high_above {
            SpeedClass::High
        } else {
            SpeedClass::Normal
        }
    }

    pub fn converted_speed(&self, sample: &RawSample) -> Option<f64> {
        sample.scaled(Register::Speed).map(|rpm| rpm * self.factor)
    }
}

impl Default for SpeedBandScorer {
    fn default() -> Self {
        Self::from_settings(&ScoringSettings::default())
    }
}

impl AnomalyScorer for SpeedBandScorer {
    fn score(&mut self, sample: &RawSample, state: &MotorState) -> Result<AnomalyVerdict, ScoringError> {
        if let OperatingMode::Faulted(code) = state.mode {
            debug!("⚠️  Drive fault {} scored as anomaly", code);
            return Ok(AnomalyVerdict::anomalous(1.0, ReasonTag::DriveFault));
        }

        let speed = self
            .converted_speed(sample)
            .ok_or_else(|| ScoringError("sample carries no SPEED register".to_string()))?;
        let running = state.mode == OperatingMode::Running;

        let verdict = match self.classify(speed) {
            SpeedClass::Slow if running => AnomalyVerdict::anomalous(
                (self.slow_max - speed.abs()) / self.slow_max,
                ReasonTag::SlowSpeed,
            ),
            SpeedClass::High if running => AnomalyVerdict::anomalous(
                (speed.abs() - self.high_above) / self.high_above,
                ReasonTag::HighSpeed,
            ),
            _ => AnomalyVerdict::healthy(0.0),
        };
        Ok(verdict)
    }

    fn name(&self) -> &'static str {
        "speed_band"
    }
}

/// Rolling z-score of one register against its recent history.
#[derive(Debug, Clone)]
pub struct ZScoreScorer {
    register: Register,
    window: VecDeque<f64>,
    window_size: usize,
    min_samples: usize,
    threshold: f64,
}

impl ZScoreScorer {
    pub fn new(register: Register, window_size: usize, min_samples: usize, threshold: f64) -> Self {
        Self {
            register,
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(2),
            min_samples: min_samples.clamp(2, window_size.max(2)),
            threshold,
        }
    }

    pub fn from_settings(settings: &ScoringSettings) -> Result<Self, ConfigError> {
        let register = Register::from_name(&settings.register).ok_or_else(|| {
            ConfigError::Invalid(format!("unknown scoring register '{}'", settings.register))
        })?;
        Ok(Self::new(
            register,
            settings.window_size,
            settings.min_samples,
            settings.z_threshold,
        ))
    }

    fn push(&mut self, value: f64) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
    }

    fn mean_and_deviation(&self) -> (f64, f64) {
        let n = self.window.len() as f64;
        let mean = self.window.iter().sum::<f64>() / n;
        let variance = self.window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        (mean, variance.sqrt())
    }
}

impl AnomalyScorer for ZScoreScorer {
    fn score(&mut self, sample: &RawSample, _state: &MotorState) -> Result<AnomalyVerdict, ScoringError> {
        let value = sample
            .scaled(self.register)
            .ok_or_else(|| ScoringError(format!("sample carries no {} register", self.register.name())))?;

        if self.window.len() < self.min_samples {
            self.push(value);
            return Ok(AnomalyVerdict {
                score: 0.0,
                is_anomalous: false,
                reason: ReasonTag::InsufficientData,
            });
        }

        let (mean, deviation) = self.mean_and_deviation();
        let z = if deviation > f64::EPSILON {
            (value - mean).abs() / deviation
        } else if (value - mean).abs() > f64::EPSILON {
            // Any change from a perfectly flat history is an outlier.
            self.threshold * 2.0
        } else {
            0.0
        };
        self.push(value);

        if z > self.threshold {
            Ok(AnomalyVerdict::anomalous(z, ReasonTag::Outlier))
        } else {
            Ok(AnomalyVerdict::healthy(z))
        }
    }

    fn name(&self) -> &'static str {
        "z_score"
    }
}

pub fn build_scorer(settings: &ScoringSettings) -> Result<Box<dyn AnomalyScorer>, ConfigError> {
    let scorer: Box<dyn AnomalyScorer> = match settings.kind {
        ScorerKind::SpeedBand => Box::new(SpeedBandScorer::from_settings(settings)),
        ScorerKind::ZScore => Box::new(ZScoreScorer::from_settings(settings)?),
    };
    Ok(scorer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::motor::FaultCode;

    fn state(mode: OperatingMode) -> MotorState {
        MotorState {
            mode,
            ..MotorState::unknown()
        }
    }

    fn speed_sample(raw_rpm: u16) -> RawSample {
        RawSample::from_pairs([(Register::Speed, raw_rpm)])
    }

    #[test]
    fn speed_bands_follow_converted_speed() {
        let scorer = SpeedBandScorer::default();
        assert_eq!(scorer.classify(0.0), SpeedClass::Stopped);
        assert_eq!(scorer.classify(0.1), SpeedClass::Stopped);
        assert_eq!(scorer.classify(5.0), SpeedClass::Slow);
        assert_eq!(scorer.classify(7.0), SpeedClass::Slow);
        assert_eq!(scorer.classify(7.01), SpeedClass::Normal);
        assert_eq!(scorer.classify(10.0), SpeedClass::Normal);
        assert_eq!(scorer.classify(13.0), SpeedClass::Normal);
        assert_eq!(scorer.classify(-14.0), SpeedClass::High);
    }

    #[test]
    fn slow_speed_is_anomalous_only_while_running() {
        let mut scorer = SpeedBandScorer::default();
        // 100 RPM converts to about 3.3.
        let sample = speed_sample(100);

        let running = scorer.score(&sample, &state(OperatingMode::Running)).unwrap();
        assert!(running.is_anomalous);
        assert_eq!(running.reason, ReasonTag::SlowSpeed);

        let stopped = scorer.score(&sample, &state(OperatingMode::Stopped)).unwrap();
        assert!(!stopped.is_anomalous);
    }

    #[test]
    fn normal_band_is_healthy() {
        let mut scorer = SpeedBandScorer::default();
        // 300 RPM converts to about 10.0.
        let verdict = scorer.score(&speed_sample(300), &state(OperatingMode::Running)).unwrap();
        assert_eq!(verdict, AnomalyVerdict::healthy(0.0));
    }

    #[test]
    fn fault_is_always_anomalous() {
        let mut scorer = SpeedBandScorer::default();
        let faulted = state(OperatingMode::Faulted(FaultCode::new(85).unwrap()));
        let verdict = scorer.score(&speed_sample(0), &faulted).unwrap();
        assert_eq!(verdict.reason, ReasonTag::DriveFault);
    }

    #[test]
    fn missing_speed_is_a_scoring_error() {
        let mut scorer = SpeedBandScorer::default();
        let sample = RawSample::from_pairs([(Register::Zsw, 0xEF37)]);
        assert!(scorer.score(&sample, &state(OperatingMode::Running)).is_err());
    }

    #[test]
    fn z_score_needs_history_then_flags_outliers() {
        let mut scorer = ZScoreScorer::new(Register::Current, 30, 5, 3.0);
        let running = state(OperatingMode::Running);
        let current = |raw: u16| RawSample::from_pairs([(Register::Current, raw)]);

        for raw in [400, 410, 390, 405, 395] {
            let verdict = scorer.score(&current(raw), &running).unwrap();
            assert_eq!(verdict.reason, ReasonTag::InsufficientData);
        }

        let steady = scorer.score(&current(402), &running).unwrap();
        assert!(!steady.is_anomalous);

        let spike = scorer.score(&current(900), &running).unwrap();
        assert!(spike.is_anomalous);
        assert_eq!(spike.reason, ReasonTag::Outlier);
    }

    #[test]
    fn unknown_scoring_register_is_rejected() {
        let settings = ScoringSettings {
            kind: ScorerKind::ZScore,
            register: "NOPE".to_string(),
            ..ScoringSettings::default()
        };
        assert!(build_scorer(&settings).is_err());
    }
}
