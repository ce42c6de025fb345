use serde_json::json;

use crate::config::OutputFormat;
use crate::devices::motor::MotorState;
use crate::devices::registers::Register;
use crate::devices::sample::RawSample;
use crate::services::maintenance::AlertEvent;
use crate::services::monitor::TickRecord;

pub trait RecordFormatter: Send + Sync {
    fn format_record(&self, record: &TickRecord) -> String;

    /// Printed once before the first record, if the format has one.
    fn format_header(&self) -> Option<String> {
        None
    }

    fn format_alert(&self, event: &AlertEvent) -> String {
        let alert = event.alert();
        match event {
            AlertEvent::Opened(_) => format!(
                "🚨 ALERT {} opened at {} ({} anomalous verdicts, motor {})",
                alert.id,
                alert.raised_at.format("%Y-%m-%d %H:%M:%S"),
                alert.triggering.len(),
                alert.snapshot.mode
            ),
            AlertEvent::Cleared(_) => format!(
                "✅ ALERT {} cleared at {}",
                alert.id,
                alert
                    .cleared_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default()
            ),
        }
    }
}

pub fn formatter_for(format: OutputFormat) -> Box<dyn RecordFormatter> {
    match format {
        OutputFormat::Console => Box::new(ConsoleFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
        OutputFormat::Csv => Box::new(CsvFormatter),
    }
}

fn optional<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub struct ConsoleFormatter;

impl ConsoleFormatter {
    /// Multi-line view of one decoded sample, used by the `read` command.
    pub fn format_state(&self, state: &MotorState, sample: &RawSample) -> String {
        let mut output = format!("🔹 Motor state: {}\n", state.mode);
        output.push_str(&"═".repeat(48));
        output.push('\n');
        output.push_str(&format!(
            "  Actual speed:    {} RPM\n",
            state.actual_speed.map(|s| format!("{:.0}", s)).unwrap_or_else(|| "-".into())
        ));
        output.push_str(&format!(
            "  Commanded speed: {} %\n",
            state.commanded_speed.map(|s| format!("{:.1}", s)).unwrap_or_else(|| "-".into())
        ));
        if let Some(word) = state.status_word {
            output.push_str(&format!("  Status word:     0x{:04X}\n", word));
        }
        if let Some(warning) = state.warning_code {
            output.push_str(&format!("  Warning:         A{}\n", warning));
        }
        output.push_str(&"-".repeat(48));
        output.push('\n');

        for (register, raw) in sample.values() {
            let spec = register.spec();
            output.push_str(&format!(
                "  {:<14} {:>6} = {:>10.2} {}\n",
                register.name(),
                spec.reference,
                register.scale_value(*raw),
                spec.unit
            ));
        }
        output
    }
}

impl RecordFormatter for ConsoleFormatter {
    fn format_record(&self, record: &TickRecord) -> String {
        let state = &record.state;
        let verdict = match &record.verdict {
            Some(v) if v.is_anomalous => format!("⚠️  {} ({:.3})", v.reason, v.score),
            Some(v) => format!("{} ({:.3})", v.reason, v.score),
            None => "unscored".to_string(),
        };
        format!(
            "🔹 #{} {} {:<8} speed {:>6} RPM  set {:>6} %  I {:>6} A  ZSW {}  {}",
            record.sequence,
            record.sample.captured_at().format("%H:%M:%S"),
            state.mode.label(),
            state.actual_speed.map(|s| format!("{:.0}", s)).unwrap_or_else(|| "-".into()),
            state.commanded_speed.map(|s| format!("{:.1}", s)).unwrap_or_else(|| "-".into()),
            record
                .sample
                .scaled(Register::Current)
                .map(|c| format!("{:.2}", c))
                .unwrap_or_else(|| "-".into()),
            state.status_word.map(|w| format!("0x{:04X}", w)).unwrap_or_else(|| "-".into()),
            verdict
        )
    }
}

/// One JSON object per line.
pub struct JsonFormatter;

impl RecordFormatter for JsonFormatter {
    fn format_record(&self, record: &TickRecord) -> String {
        json!({
            "sequence": record.sequence,
            "captured_at": record.sample.captured_at().to_rfc3339(),
            "state": record.state.to_json(),
            "verdict": record.verdict,
            "registers": record.sample.to_json()["registers"],
        })
        .to_string()
    }

    fn format_alert(&self, event: &AlertEvent) -> String {
        let kind = match event {
            AlertEvent::Opened(_) => "alert_opened",
            AlertEvent::Cleared(_) => "alert_cleared",
        };
        json!({ "event": kind, "alert": event.alert().to_json() }).to_string()
    }
}

pub struct CsvFormatter;

impl RecordFormatter for CsvFormatter {
    fn format_record(&self, record: &TickRecord) -> String {
        let state = &record.state;
        let sample = &record.sample;
        [
            record.sequence.to_string(),
            sample.captured_at().to_rfc3339(),
            state.mode.label().to_string(),
            optional(state.fault_code().map(|c| c.get())),
            optional(state.actual_speed),
            optional(state.commanded_speed),
            optional(sample.scaled(Register::Current)),
            optional(sample.scaled(Register::Torque)),
            optional(sample.scaled(Register::ActualPower)),
            optional(sample.scaled(Register::DcBusVolts)),
            optional(state.status_word),
            optional(state.warning_code),
            optional(record.verdict.map(|v| v.score)),
            optional(record.verdict.map(|v| v.is_anomalous)),
            optional(record.verdict.map(|v| v.reason)),
        ]
        .join(",")
    }

    fn format_header(&self) -> Option<String> {
        Some(
            "sequence,captured_at,mode,fault_code,actual_speed_rpm,commanded_speed_pct,current_a,\
torque_nm,power_kw,dc_bus_v,status_word,warning,score,anomalous,reason"
                .to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::scoring::{AnomalyVerdict, ReasonTag};
    use crate::devices::motor::MotorModel;
    use std::sync::Arc;

    fn record() -> TickRecord {
        let sample = RawSample::from_pairs([
            (Register::Speed, 750),
            (Register::Current, 280),
            (Register::Hsw, 0x2000),
            (Register::Zsw, 0xEF37),
        ]);
        let state = MotorModel::default().apply(&sample);
        TickRecord {
            sequence: 4,
            sample,
            state: Arc::new(state),
            verdict: Some(AnomalyVerdict::anomalous(0.5, ReasonTag::HighSpeed)),
        }
    }

    #[test]
    fn csv_row_matches_header_columns() {
        let formatter = CsvFormatter;
        let header = formatter.format_header().unwrap();
        let row = formatter.format_record(&record());
        assert_eq!(header.split(',').count(), row.split(',').count());
        assert!(row.starts_with("4,"));
        assert!(row.contains(",RUNNING,,750,50,2.8,"));
        assert!(row.ends_with(",0.5,true,high_speed"));
    }

    #[test]
    fn json_line_carries_state_and_verdict() {
        let line = JsonFormatter.format_record(&record());
        assert!(!line.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["state"]["mode"], "RUNNING");
        assert_eq!(value["verdict"]["reason"], "high_speed");
        assert_eq!(value["registers"]["ZSW"], 0xEF37);
    }

    #[test]
    fn console_line_flags_anomalies() {
        let line = ConsoleFormatter.format_record(&record());
        assert!(line.contains("RUNNING"));
        assert!(line.contains("⚠️"));
        assert!(line.contains("0xEF37"));
    }
}
