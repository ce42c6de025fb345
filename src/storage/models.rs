use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::services::maintenance::AlertEvent;
use crate::services::monitor::TickRecord;
use crate::utils::error::StorageError;

/// One row of `motor_samples`: a flattened tick record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoredSample {
    pub id: Option<i64>,
    pub sequence: i64,
    /// Capture time, unix milliseconds.
    pub captured_at: i64,
    pub mode: String,
    pub fault_code: Option<i64>,
    pub commanded_speed: Option<f64>,
    pub actual_speed: Option<f64>,
    pub status_word: Option<i64>,
    pub anomaly_score: Option<f64>,
    pub is_anomalous: Option<bool>,
    pub reason: Option<String>,
    /// Raw register values as a JSON object keyed by register name.
    pub registers: String,
}

impl StoredSample {
    pub fn from_record(record: &TickRecord) -> Result<Self, StorageError> {
        let state = &record.state;
        let verdict = record.verdict.as_ref();
        Ok(Self {
            id: None,
            sequence: record.sequence as i64,
            captured_at: record.sample.captured_at().timestamp_millis(),
            mode: state.mode.label().to_string(),
            fault_code: state.fault_code().map(|code| code.get() as i64),
            commanded_speed: state.commanded_speed,
            actual_speed: state.actual_speed,
            status_word: state.status_word.map(i64::from),
            anomaly_score: verdict.map(|v| v.score),
            is_anomalous: verdict.map(|v| v.is_anomalous),
            reason: verdict.map(|v| v.reason.to_string()),
            registers: serde_json::to_string(&record.sample.to_json()["registers"])?,
        })
    }
}

/// One row of `alert_events`. Opening and clearing are separate rows.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoredAlertEvent {
    pub id: Option<i64>,
    pub alert_id: String,
    pub event: String,
    pub occurred_at: i64,
    pub mode: String,
    pub triggering: String,
}

impl StoredAlertEvent {
    pub fn from_event(event: &AlertEvent) -> Result<Self, StorageError> {
        let alert = event.alert();
        let (kind, occurred_at) = match event {
            AlertEvent::Opened(_) => ("opened", alert.raised_at),
            AlertEvent::Cleared(_) => ("cleared", alert.cleared_at.unwrap_or(alert.raised_at)),
        };
        Ok(Self {
            id: None,
            alert_id: alert.id.to_string(),
            event: kind.to_string(),
            occurred_at: occurred_at.timestamp_millis(),
            mode: alert.snapshot.mode.label().to_string(),
            triggering: serde_json::to_string(&alert.triggering)?,
        })
    }
}
