use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::analysis::scoring::AnomalyVerdict;
use crate::config::Config;
use crate::devices::motor::MotorState;
use crate::output::sinks::ChannelSink;
use crate::services::monitor::{RecordSink, TickRecord};
use crate::utils::error::MonitorError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatorSettings {
    pub debounce_threshold: u32,
    pub clear_threshold: u32,
    pub window_size: usize,
    pub history_limit: usize,
}

impl EvaluatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            debounce_threshold: config.debounce_threshold,
            clear_threshold: config.clear_threshold(),
            window_size: config.maintenance.window_size,
            history_limit: config.maintenance.history_limit,
        }
    }
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub raised_at: DateTime<Utc>,
    pub cleared_at: Option<DateTime<Utc>>,
    pub snapshot: MotorState,
    /// The anomalous streak that crossed the debounce threshold, oldest first.
    pub triggering: Vec<AnomalyVerdict>,
}

impl Alert {
    pub fn is_open(&self) -> bool {
        self.cleared_at.is_none()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id.to_string(),
            "raised_at": self.raised_at.to_rfc3339(),
            "cleared_at": self.cleared_at.map(|t| t.to_rfc3339()),
            "snapshot": self.snapshot.to_json(),
            "triggering": self.triggering,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertEvent {
    Opened(Alert),
    Cleared(Alert),
}

impl AlertEvent {
    pub fn alert(&self) -> &Alert {
        match self {
            AlertEvent::Opened(alert) | AlertEvent::Cleared(alert) => alert,
        }
    }
}

/// Debounced alerting over a stream of verdicts.
///
/// Opens an alert when `debounce_threshold` anomalous verdicts arrive in a row
/// and none is open; clears it after `clear_threshold` healthy verdicts in a
/// row. The newest history entry is the open alert, if any. Only the open
/// alert's `cleared_at` is ever written after it enters history.
#[derive(Debug)]
pub struct MaintenanceEvaluator {
    settings: EvaluatorSettings,
    window: VecDeque<AnomalyVerdict>,
    anomalous_run: u32,
    healthy_run: u32,
    history: VecDeque<Alert>,
    observed: u64,
}

impl MaintenanceEvaluator {
    pub fn new(settings: EvaluatorSettings) -> Self {
        Self {
            window: VecDeque::with_capacity(settings.window_size),
            settings,
            anomalous_run: 0,
            healthy_run: 0,
            history: VecDeque::new(),
            observed: 0,
        }
    }

    pub fn observe(&mut self, verdict: &AnomalyVerdict, state: &MotorState) -> Option<AlertEvent> {
        self.observed += 1;
        if self.window.len() == self.settings.window_size {
            self.window.pop_front();
        }
        self.window.push_back(*verdict);

        if verdict.is_anomalous {
            self.anomalous_run += 1;
            self.healthy_run = 0;
            if self.open_alert().is_none() && self.anomalous_run >= self.settings.debounce_threshold {
                return Some(self.open(state));
            }
        } else {
            self.healthy_run += 1;
            self.anomalous_run = 0;
            if self.healthy_run >= self.settings.clear_threshold {
                return self.clear();
            }
        }
        None
    }

    fn open(&mut self, state: &MotorState) -> AlertEvent {
        let streak = (self.anomalous_run as usize).min(self.window.len());
        let triggering: Vec<AnomalyVerdict> =
            self.window.iter().skip(self.window.len() - streak).copied().collect();

        let alert = Alert {
            id: Uuid::new_v4(),
            raised_at: Utc::now(),
            cleared_at: None,
            snapshot: state.clone(),
            triggering,
        };
        warn!(
            "🚨 Maintenance alert {} opened: {} consecutive anomalies (last: {}, score {:.3}), motor {}",
            alert.id,
            alert.triggering.len(),
            alert.triggering.last().map(|v| v.reason.to_string()).unwrap_or_default(),
            alert.triggering.last().map(|v| v.score).unwrap_or_default(),
            state.mode
        );

        if self.history.len() == self.settings.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(alert.clone());
        AlertEvent::Opened(alert)
    }

    fn clear(&mut self) -> Option<AlertEvent> {
        let alert = self.history.back_mut().filter(|alert| alert.is_open())?;
        alert.cleared_at = Some(Utc::now());
        info!(
            "✅ Maintenance alert {} cleared after {} healthy verdicts",
            alert.id, self.healthy_run
        );
        Some(AlertEvent::Cleared(alert.clone()))
    }

    pub fn open_alert(&self) -> Option<&Alert> {
        self.history.back().filter(|alert| alert.is_open())
    }

    /// All retained alerts, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Alert> {
        self.history.iter()
    }

    pub fn alert_count(&self) -> usize {
        self.history.len()
    }

    pub fn window(&self) -> impl Iterator<Item = &AnomalyVerdict> {
        self.window.iter()
    }

    pub fn anomalous_run(&self) -> u32 {
        self.anomalous_run
    }

    pub fn healthy_run(&self) -> u32 {
        self.healthy_run
    }

    pub fn observed(&self) -> u64 {
        self.observed
    }
}

/// Runs a [`MaintenanceEvaluator`] in its own task, fed by the monitor's record stream.
pub struct MaintenanceService {
    sink: Arc<ChannelSink>,
    events: broadcast::Sender<AlertEvent>,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<MaintenanceEvaluator>,
}

impl MaintenanceService {
    pub fn spawn(evaluator: MaintenanceEvaluator, capacity: usize) -> Self {
        let (sink, records) = ChannelSink::new("maintenance", capacity);
        let (events, _) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(Self::run(evaluator, records, events.clone(), shutdown_rx));
        info!("🔧 Maintenance evaluator started");

        Self {
            sink: Arc::new(sink),
            events,
            shutdown_tx,
            task,
        }
    }

    /// Sink to register with the monitor.
    pub fn sink(&self) -> Arc<dyn RecordSink> {
        self.sink.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.events.subscribe()
    }

    /// Drains already-delivered records, stops the task and hands the evaluator back.
    pub async fn shutdown(self) -> Result<MaintenanceEvaluator, MonitorError> {
        let _ = self.shutdown_tx.send(());
        let evaluator = self.task.await.map_err(|e| {
            error!("❌ Maintenance task failed: {}", e);
            MonitorError::TaskPanicked
        })?;
        info!(
            "🛑 Maintenance evaluator stopped ({} verdicts observed, {} alerts)",
            evaluator.observed(),
            evaluator.alert_count()
        );
        Ok(evaluator)
    }

    async fn run(
        mut evaluator: MaintenanceEvaluator,
        mut records: mpsc::Receiver<Arc<TickRecord>>,
        events: broadcast::Sender<AlertEvent>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> MaintenanceEvaluator {
        loop {
            tokio::select! {
                biased;
                record = records.recv() => match record {
                    Some(record) => Self::handle(&mut evaluator, &events, &record),
                    None => break,
                },
                _ = &mut shutdown_rx => {
                    while let Ok(record) = records.try_recv() {
                        Self::handle(&mut evaluator, &events, &record);
                    }
                    break;
                }
            }
        }
        evaluator
    }

    fn handle(
        evaluator: &mut MaintenanceEvaluator,
        events: &broadcast::Sender<AlertEvent>,
        record: &TickRecord,
    ) {
        let Some(verdict) = record.verdict.as_ref() else {
            debug!("Tick {} has no verdict, skipped", record.sequence);
            return;
        };
        if let Some(event) = evaluator.observe(verdict, &record.state) {
            // No subscribers is fine; the evaluator keeps its own history.
            let _ = events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::scoring::ReasonTag;
    use crate::devices::motor::OperatingMode;
    use crate::devices::sample::RawSample;

    fn anomalous() -> AnomalyVerdict {
        AnomalyVerdict::anomalous(0.8, ReasonTag::SlowSpeed)
    }

    fn healthy() -> AnomalyVerdict {
        AnomalyVerdict::healthy(0.0)
    }

    fn running() -> MotorState {
        MotorState {
            mode: OperatingMode::Running,
            ..MotorState::unknown()
        }
    }

    fn evaluator() -> MaintenanceEvaluator {
        MaintenanceEvaluator::new(EvaluatorSettings {
            debounce_threshold: 3,
            clear_threshold: 3,
            window_size: 32,
            history_limit: 256,
        })
    }

    fn feed(evaluator: &mut MaintenanceEvaluator, verdicts: &[AnomalyVerdict]) -> Vec<AlertEvent> {
        verdicts
            .iter()
            .filter_map(|v| evaluator.observe(v, &running()))
            .collect()
    }

    #[test]
    fn fewer_than_threshold_anomalies_raise_nothing() {
        let mut evaluator = evaluator();
        let events = feed(&mut evaluator, &[anomalous(), anomalous(), healthy(), anomalous()]);
        assert!(events.is_empty());
        assert_eq!(evaluator.alert_count(), 0);
    }

    #[test]
    fn threshold_anomalies_raise_exactly_one_alert() {
        let mut evaluator = evaluator();
        let events = feed(&mut evaluator, &[anomalous(); 7]);
        assert_eq!(events.len(), 1);
        match &events[0] {
            AlertEvent::Opened(alert) => {
                assert_eq!(alert.triggering.len(), 3);
                assert_eq!(alert.snapshot.mode, OperatingMode::Running);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(evaluator.open_alert().is_some());
    }

    #[test]
    fn healthy_streak_clears_open_alert() {
        let mut evaluator = evaluator();
        feed(&mut evaluator, &[anomalous(); 3]);

        let events = feed(&mut evaluator, &[healthy(), healthy()]);
        assert!(events.is_empty());
        assert!(evaluator.open_alert().is_some());

        let events = feed(&mut evaluator, &[healthy()]);
        assert!(matches!(events.as_slice(), [AlertEvent::Cleared(alert)] if alert.cleared_at.is_some()));
        assert!(evaluator.open_alert().is_none());

        let closed = evaluator.history().next().unwrap();
        assert_eq!(closed.triggering.len(), 3);
    }

    #[test]
    fn interrupted_healthy_streak_does_not_clear() {
        let mut evaluator = evaluator();
        feed(&mut evaluator, &[anomalous(); 3]);
        let events = feed(&mut evaluator, &[healthy(), healthy(), anomalous(), healthy(), healthy()]);
        assert!(events.is_empty());
        assert!(evaluator.open_alert().is_some());
    }

    #[test]
    fn new_alert_after_clear_is_appended() {
        let mut evaluator = evaluator();
        feed(&mut evaluator, &[anomalous(); 3]);
        feed(&mut evaluator, &[healthy(); 3]);
        feed(&mut evaluator, &[anomalous(); 4]);

        let alerts: Vec<&Alert> = evaluator.history().collect();
        assert_eq!(alerts.len(), 2);
        assert!(!alerts[0].is_open());
        assert!(alerts[1].is_open());
        assert_ne!(alerts[0].id, alerts[1].id);
    }

    #[test]
    fn history_is_bounded() {
        let mut evaluator = MaintenanceEvaluator::new(EvaluatorSettings {
            debounce_threshold: 1,
            clear_threshold: 1,
            window_size: 4,
            history_limit: 2,
        });
        for _ in 0..5 {
            feed(&mut evaluator, &[anomalous(), healthy()]);
        }
        assert_eq!(evaluator.alert_count(), 2);
        assert_eq!(evaluator.window().count(), 4);
    }

    fn record(sequence: u64, verdict: Option<AnomalyVerdict>) -> Arc<TickRecord> {
        Arc::new(TickRecord {
            sequence,
            sample: RawSample::from_pairs([]),
            state: Arc::new(running()),
            verdict,
        })
    }

    #[tokio::test]
    async fn service_publishes_alerts_and_returns_evaluator() {
        let service = MaintenanceService::spawn(evaluator(), 16);
        let mut alerts = service.subscribe();
        let sink = service.sink();

        sink.deliver(&record(1, Some(anomalous()))).unwrap();
        sink.deliver(&record(2, None)).unwrap();
        sink.deliver(&record(3, Some(anomalous()))).unwrap();
        sink.deliver(&record(4, Some(anomalous()))).unwrap();

        let event = alerts.recv().await.unwrap();
        assert!(matches!(event, AlertEvent::Opened(ref alert) if alert.triggering.len() == 3));

        let evaluator = service.shutdown().await.unwrap();
        assert_eq!(evaluator.observed(), 3);
        assert_eq!(evaluator.alert_count(), 1);
    }
}
