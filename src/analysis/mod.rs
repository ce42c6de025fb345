pub mod scoring;

pub use scoring::{build_scorer, AnomalyScorer, AnomalyVerdict, ReasonTag, SpeedBandScorer, ZScoreScorer};
