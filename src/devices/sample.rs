use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio::time::Instant;

use super::registers::Register;

/// One poll cycle's register values. Built once by the protocol client and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    timestamp: Instant,
    captured_at: DateTime<Utc>,
    values: BTreeMap<Register, u16>,
}

impl RawSample {
    pub fn new(values: BTreeMap<Register, u16>) -> Self {
        Self {
            timestamp: Instant::now(),
            captured_at: Utc::now(),
            values,
        }
    }

    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (Register, u16)>,
    {
        Self::new(pairs.into_iter().collect())
    }

    /// Monotonic capture time.
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Wall-clock capture time, for persistence and display.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn get(&self, register: Register) -> Option<u16> {
        self.values.get(&register).copied()
    }

    pub fn get_signed(&self, register: Register) -> Option<i16> {
        self.get(register).map(|raw| raw as i16)
    }

    /// Engineering value using the register's scale and signedness.
    pub fn scaled(&self, register: Register) -> Option<f64> {
        self.get(register).map(|raw| register.scale_value(raw))
    }

    pub fn values(&self) -> &BTreeMap<Register, u16> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_json(&self) -> Value {
        let registers: serde_json::Map<String, Value> = self
            .values
            .iter()
            .map(|(register, raw)| (register.name().to_string(), json!(raw)))
            .collect();
        json!({
            "captured_at": self.captured_at.to_rfc3339(),
            "registers": registers,
        })
    }
}
