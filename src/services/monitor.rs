//! Continuous Monitor: the tick loop that owns the drive link.
//!
//! Lifecycle is `IDLE → RUNNING → {STOPPING → IDLE, FAILED}`, with `reset`
//! taking FAILED back to IDLE. While running, a single task owns the
//! [`RegisterClient`] and every tick does, in order:
//!
//! 1. apply queued commands (validated against the last published state),
//! 2. read the poll set,
//! 3. decode it and publish the new [`MotorState`] snapshot,
//! 4. score it,
//! 5. hand the immutable [`TickRecord`] to the broadcast stream and every sink.
//!
//! Ticks never overlap. A tick that overruns its slot skips the missed
//! deadlines instead of queueing them.

use log::{debug, error, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};

use crate::analysis::scoring::{AnomalyScorer, AnomalyVerdict};
use crate::config::Config;
use crate::devices::motor::{Command, MotorModel, MotorState};
use crate::devices::registers::POLL_SET;
use crate::devices::sample::RawSample;
use crate::modbus::client::RegisterClient;
use crate::modbus::transport::Transport;
use crate::utils::error::{CommandError, MonitorError, SinkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitorState {
    Idle,
    Running,
    Stopping,
    Failed,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MonitorState::Idle => "IDLE",
            MonitorState::Running => "RUNNING",
            MonitorState::Stopping => "STOPPING",
            MonitorState::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorStats {
    pub ticks_completed: u64,
    pub ticks_failed: u64,
    pub consecutive_failures: u32,
    pub cadence_misses: u64,
    pub ticks_skipped: u64,
    pub commands_applied: u64,
    pub commands_rejected: u64,
    pub scoring_failures: u64,
    pub sink_drops: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorStatus {
    pub state: MonitorState,
    pub stats: MonitorStats,
    pub last_error: Option<String>,
}

/// Everything one successful tick produced. Shared read-only with every consumer.
#[derive(Debug, Clone)]
pub struct TickRecord {
    pub sequence: u64,
    pub sample: RawSample,
    pub state: Arc<MotorState>,
    /// `None` when the scorer failed on this tick.
    pub verdict: Option<AnomalyVerdict>,
}

/// Downstream consumer of tick records. `deliver` runs on the tick loop and
/// must return without waiting; hand the record off and do the work elsewhere.
pub trait RecordSink: Send + Sync {
    fn deliver(&self, record: &Arc<TickRecord>) -> Result<(), SinkError>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub failure_threshold: u32,
    /// How long an in-flight tick may keep running after a stop request.
    pub stop_grace: Duration,
    pub command_queue: usize,
    pub record_buffer: usize,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            failure_threshold: config.failure_threshold.max(1),
            stop_grace: config.timeout(),
            command_queue: 32,
            record_buffer: config.output.channel_capacity,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

struct PendingCommand {
    command: Command,
    reply: oneshot::Sender<Result<(), CommandError>>,
}

/// Cloneable access to a monitor from other tasks.
#[derive(Clone)]
pub struct MonitorHandle {
    commands: mpsc::Sender<PendingCommand>,
    status: watch::Receiver<MonitorStatus>,
    motor: watch::Receiver<Arc<MotorState>>,
    records: broadcast::Sender<Arc<TickRecord>>,
}

impl MonitorHandle {
    /// Queues a command for the next tick boundary and waits for its outcome.
    pub async fn issue(&self, command: Command) -> Result<(), CommandError> {
        if self.status.borrow().state != MonitorState::Running {
            return Err(CommandError::MonitorNotRunning);
        }

        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(PendingCommand { command, reply })
            .await
            .map_err(|_| CommandError::MonitorNotRunning)?;
        debug!("📨 {} queued for next tick", command);

        let mut status = self.status.clone();
        tokio::select! {
            result = outcome => result.map_err(|_| CommandError::MonitorNotRunning)?,
            // The loop drains the queue on exit; anything sent after that is never answered.
            _ = status.wait_for(|s| matches!(s.state, MonitorState::Idle | MonitorState::Failed)) => {
                Err(CommandError::MonitorNotRunning)
            }
        }
    }

    /// Latest decoded state. Replaced atomically after every successful read.
    pub fn motor_state(&self) -> Arc<MotorState> {
        self.motor.borrow().clone()
    }

    pub fn state(&self) -> MonitorState {
        self.status.borrow().state
    }

    pub fn status(&self) -> MonitorStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<MonitorStatus> {
        self.status.clone()
    }

    pub fn watch_motor(&self) -> watch::Receiver<Arc<MotorState>> {
        self.motor.clone()
    }

    /// Per-tick record stream. Slow subscribers lag and lose records; they never stall the loop.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TickRecord>> {
        self.records.subscribe()
    }
}

#[derive(Clone)]
struct Shared {
    status: Arc<watch::Sender<MonitorStatus>>,
    motor: Arc<watch::Sender<Arc<MotorState>>>,
    records: broadcast::Sender<Arc<TickRecord>>,
    sinks: Arc<[Arc<dyn RecordSink>]>,
}

enum TickOutcome {
    Completed,
    Failed(String),
}

/// State owned by the tick loop while it runs and handed back when it exits.
struct TickCore<T: Transport> {
    client: RegisterClient<T>,
    model: MotorModel,
    scorer: Box<dyn AnomalyScorer>,
    sequence: u64,
}

impl<T: Transport> TickCore<T> {
    async fn tick(&mut self, commands: &mut mpsc::Receiver<PendingCommand>, shared: &Shared) -> TickOutcome {
        while let Ok(pending) = commands.try_recv() {
            let result = self.execute(pending.command, shared).await;
            shared.status.send_modify(|s| match result {
                Ok(()) => s.stats.commands_applied += 1,
                Err(_) => s.stats.commands_rejected += 1,
            });
            let _ = pending.reply.send(result);
        }

        let sample = match self.client.read_registers(POLL_SET).await {
            Ok(sample) => sample,
            Err(e) => return TickOutcome::Failed(e.to_string()),
        };

        let state = Arc::new(self.model.apply(&sample));
        shared.motor.send_replace(Arc::clone(&state));

        let verdict = match self.scorer.score(&sample, &state) {
            Ok(verdict) => Some(verdict),
            Err(e) => {
                warn!("⚠️  {} scorer failed, tick continues unscored: {}", self.scorer.name(), e);
                shared.status.send_modify(|s| s.stats.scoring_failures += 1);
                None
            }
        };

        self.sequence += 1;
        let record = Arc::new(TickRecord {
            sequence: self.sequence,
            sample,
            state,
            verdict,
        });

        // Err only means nobody is subscribed.
        let _ = shared.records.send(Arc::clone(&record));
        for sink in shared.sinks.iter() {
            if let Err(e) = sink.deliver(&record) {
                warn!("⚠️  Sink '{}' rejected tick {}: {}", sink.name(), record.sequence, e);
                shared.status.send_modify(|s| s.stats.sink_drops += 1);
            }
        }
        TickOutcome::Completed
    }

    async fn execute(&mut self, command: Command, shared: &Shared) -> Result<(), CommandError> {
        let current = shared.motor.borrow().clone();
        if let Err(e) = self.model.validate(&command, &current) {
            warn!("🚫 {} rejected: {}", command, e);
            return Err(e);
        }
        for write in self.model.encode(&command) {
            self.client.write_register(write).await?;
        }
        info!("🎛️  {} applied", command);
        Ok(())
    }
}

struct LoopExit<T: Transport> {
    core: TickCore<T>,
    commands: mpsc::Receiver<PendingCommand>,
    result: Result<(), MonitorError>,
}

pub struct ContinuousMonitor<T: Transport + 'static> {
    settings: MonitorSettings,
    core: Option<TickCore<T>>,
    commands_rx: Option<mpsc::Receiver<PendingCommand>>,
    commands_tx: mpsc::Sender<PendingCommand>,
    sinks: Vec<Arc<dyn RecordSink>>,
    status: Arc<watch::Sender<MonitorStatus>>,
    motor: Arc<watch::Sender<Arc<MotorState>>>,
    records: broadcast::Sender<Arc<TickRecord>>,
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<LoopExit<T>>>,
}

impl<T: Transport + 'static> ContinuousMonitor<T> {
    pub fn new(
        settings: MonitorSettings,
        client: RegisterClient<T>,
        model: MotorModel,
        scorer: Box<dyn AnomalyScorer>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(settings.command_queue.max(1));
        let (status, _) = watch::channel(MonitorStatus {
            state: MonitorState::Idle,
            stats: MonitorStats::default(),
            last_error: None,
        });
        let (motor, _) = watch::channel(Arc::new(MotorState::unknown()));
        let (records, _) = broadcast::channel(settings.record_buffer.max(1));

        Self {
            settings,
            core: Some(TickCore {
                client,
                model,
                scorer,
                sequence: 0,
            }),
            commands_rx: Some(commands_rx),
            commands_tx,
            sinks: Vec::new(),
            status: Arc::new(status),
            motor: Arc::new(motor),
            records,
            stop_tx: None,
            task: None,
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn state(&self) -> MonitorState {
        self.status.borrow().state
    }

    pub fn status(&self) -> MonitorStatus {
        self.status.borrow().clone()
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            commands: self.commands_tx.clone(),
            status: self.status.subscribe(),
            motor: self.motor.subscribe(),
            records: self.records.clone(),
        }
    }

    /// Registers a sink. Sinks are fixed for the duration of a run.
    pub fn add_sink(&mut self, sink: Arc<dyn RecordSink>) -> Result<(), MonitorError> {
        let state = self.state();
        if state != MonitorState::Idle {
            return Err(MonitorError::InvalidState {
                from: state,
                action: "add a sink",
            });
        }
        info!("🔗 Sink '{}' registered", sink.name());
        self.sinks.push(sink);
        Ok(())
    }

    /// The register client, available while the loop is not running.
    pub fn client_mut(&mut self) -> Option<&mut RegisterClient<T>> {
        self.core.as_mut().map(|core| &mut core.client)
    }

    pub fn start(&mut self, interval: Duration) -> Result<(), MonitorError> {
        let state = self.state();
        if state != MonitorState::Idle {
            return Err(MonitorError::InvalidState { from: state, action: "start" });
        }
        if interval.is_zero() {
            return Err(MonitorError::InvalidInterval(interval));
        }
        let (Some(core), Some(mut commands)) = (self.core.take(), self.commands_rx.take()) else {
            return Err(MonitorError::TaskPanicked);
        };

        // Leftovers from a previous run whose callers already gave up.
        while let Ok(stale) = commands.try_recv() {
            let _ = stale.reply.send(Err(CommandError::MonitorNotRunning));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Shared {
            status: Arc::clone(&self.status),
            motor: Arc::clone(&self.motor),
            records: self.records.clone(),
            sinks: self.sinks.clone().into(),
        };
        self.status.send_modify(|s| {
            s.state = MonitorState::Running;
            s.stats.consecutive_failures = 0;
        });

        info!(
            "🚀 Monitoring started: interval {:?}, failure threshold {}, {} sink(s)",
            interval,
            self.settings.failure_threshold,
            self.sinks.len()
        );
        self.task = Some(tokio::spawn(Self::run(
            core,
            commands,
            stop_rx,
            shared,
            interval,
            self.settings.stop_grace,
            self.settings.failure_threshold,
        )));
        self.stop_tx = Some(stop_tx);
        Ok(())
    }

    /// Requests STOPPING and waits until the loop has settled to IDLE.
    pub async fn stop(&mut self) -> Result<(), MonitorError> {
        let state = self.state();
        if !matches!(state, MonitorState::Running | MonitorState::Stopping) {
            return Err(MonitorError::InvalidState { from: state, action: "stop" });
        }
        if state == MonitorState::Running {
            info!("⏹️  Stop requested");
            self.status.send_modify(|s| s.state = MonitorState::Stopping);
        }
        if let Some(stop_tx) = &self.stop_tx {
            let _ = stop_tx.send(true);
        }
        self.wait().await
    }

    /// Waits for the loop to exit. Returns the fatal error if it failed.
    /// Cancelling this future leaves the loop running.
    pub async fn wait(&mut self) -> Result<(), MonitorError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let joined = task.await;
        self.task = None;
        self.stop_tx = None;

        let exit = match joined {
            Ok(exit) => exit,
            Err(e) => {
                error!("❌ Monitor task panicked: {}", e);
                self.status.send_modify(|s| {
                    s.state = MonitorState::Failed;
                    s.last_error = Some(e.to_string());
                });
                return Err(MonitorError::TaskPanicked);
            }
        };

        let LoopExit { core, mut commands, result } = exit;
        while let Ok(pending) = commands.try_recv() {
            let _ = pending.reply.send(Err(CommandError::MonitorNotRunning));
        }
        self.core = Some(core);
        self.commands_rx = Some(commands);

        if result.is_ok() {
            self.status.send_modify(|s| s.state = MonitorState::Idle);
            info!("🛑 Monitoring stopped");
        }
        result
    }

    /// FAILED → IDLE. Reopens the transport first if the link is broken.
    pub async fn reset(&mut self) -> Result<(), MonitorError> {
        let state = self.state();
        if state != MonitorState::Failed {
            return Err(MonitorError::InvalidState { from: state, action: "reset" });
        }
        let core = self.core.as_mut().ok_or(MonitorError::TaskPanicked)?;
        if core.client.is_broken() {
            core.client.reopen().await?;
        }
        self.status.send_modify(|s| {
            s.state = MonitorState::Idle;
            s.stats.consecutive_failures = 0;
            s.last_error = None;
        });
        info!("🔄 Monitor reset to IDLE");
        Ok(())
    }

    async fn run(
        mut core: TickCore<T>,
        mut commands: mpsc::Receiver<PendingCommand>,
        mut stop_rx: watch::Receiver<bool>,
        shared: Shared,
        interval: Duration,
        grace: Duration,
        failure_threshold: u32,
    ) -> LoopExit<T> {
        let mut next_deadline = Instant::now();

        let result = loop {
            tokio::select! {
                biased;
                _ = stop_rx.changed() => break Ok(()),
                _ = sleep_until(next_deadline) => {}
            }

            let tick_started = Instant::now();
            let mut stop_requested = false;
            let outcome = {
                let tick = core.tick(&mut commands, &shared);
                tokio::pin!(tick);
                tokio::select! {
                    biased;
                    outcome = &mut tick => Some(outcome),
                    _ = stop_rx.changed() => {
                        stop_requested = true;
                        match timeout(grace, &mut tick).await {
                            Ok(outcome) => Some(outcome),
                            Err(_) => {
                                warn!("⏹️  In-flight tick abandoned after {:?}", grace);
                                None
                            }
                        }
                    }
                }
            };

            match outcome {
                Some(TickOutcome::Completed) => shared.status.send_modify(|s| {
                    s.stats.ticks_completed += 1;
                    s.stats.consecutive_failures = 0;
                }),
                Some(TickOutcome::Failed(reason)) => {
                    let mut consecutive = 0;
                    shared.status.send_modify(|s| {
                        s.stats.ticks_failed += 1;
                        s.stats.consecutive_failures += 1;
                        s.last_error = Some(reason.clone());
                        consecutive = s.stats.consecutive_failures;
                    });
                    warn!(
                        "⚠️  Tick failed ({}/{} consecutive): {}",
                        consecutive, failure_threshold, reason
                    );
                    if consecutive >= failure_threshold {
                        error!(
                            "❌ Monitor FAILED after {} consecutive failed ticks: {}",
                            consecutive, reason
                        );
                        shared.status.send_modify(|s| s.state = MonitorState::Failed);
                        break Err(MonitorError::Fatal {
                            consecutive_failures: consecutive,
                            last_error: reason,
                        });
                    }
                }
                None => {}
            }

            if stop_requested {
                break Ok(());
            }

            next_deadline += interval;
            let now = Instant::now();
            let mut skipped = 0u64;
            while next_deadline < now {
                next_deadline += interval;
                skipped += 1;
            }
            if skipped > 0 {
                warn!(
                    "⏱️  Cadence miss: tick took {:?} (interval {:?}), skipping {} tick(s)",
                    now - tick_started,
                    interval,
                    skipped
                );
                shared.status.send_modify(|s| {
                    s.stats.cadence_misses += 1;
                    s.stats.ticks_skipped += skipped;
                });
            }
        };

        while let Ok(pending) = commands.try_recv() {
            let _ = pending.reply.send(Err(CommandError::MonitorNotRunning));
        }
        LoopExit { core, commands, result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::scoring::{ReasonTag, SpeedBandScorer};
    use crate::devices::motor::{ControlWords, OperatingMode};
    use crate::modbus::client::ClientSettings;
    use crate::modbus::simulator::{Injection, SimulatedDrive, SimulatorControls};
    use crate::services::maintenance::{AlertEvent, EvaluatorSettings, MaintenanceEvaluator, MaintenanceService};
    use crate::utils::error::ScoringError;
    use std::collections::VecDeque;

    /// Hands out scripted verdicts, then healthy ones.
    struct ScriptedScorer(VecDeque<AnomalyVerdict>);

    impl AnomalyScorer for ScriptedScorer {
        fn score(&mut self, _: &RawSample, _: &MotorState) -> Result<AnomalyVerdict, ScoringError> {
            Ok(self.0.pop_front().unwrap_or_else(|| AnomalyVerdict::healthy(0.0)))
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    struct FailingScorer;

    impl AnomalyScorer for FailingScorer {
        fn score(&mut self, _: &RawSample, _: &MotorState) -> Result<AnomalyVerdict, ScoringError> {
            Err(ScoringError("model unavailable".into()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn config() -> Config {
        Config {
            poll_interval_ms: 1000,
            timeout_ms: 100,
            retry_count: 3,
            debounce_threshold: 3,
            failure_threshold: 5,
            ..Config::default()
        }
    }

    fn monitor_with(
        config: &Config,
        scorer: Box<dyn AnomalyScorer>,
    ) -> (ContinuousMonitor<SimulatedDrive>, SimulatorControls) {
        let drive = SimulatedDrive::new(config.slave_id, ControlWords::default());
        let controls = drive.controls();
        let client = RegisterClient::new(drive, ClientSettings::from_config(config));
        let monitor = ContinuousMonitor::new(
            MonitorSettings::from_config(config),
            client,
            MotorModel::default(),
            scorer,
        );
        (monitor, controls)
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_failures_recover_and_debounced_alert_opens() {
        let config = config();
        let scorer = ScriptedScorer(VecDeque::from(vec![
            AnomalyVerdict::healthy(0.0),
            AnomalyVerdict::anomalous(0.9, ReasonTag::SlowSpeed),
            AnomalyVerdict::anomalous(0.9, ReasonTag::SlowSpeed),
            AnomalyVerdict::anomalous(0.9, ReasonTag::SlowSpeed),
        ]));
        let (mut monitor, controls) = monitor_with(&config, Box::new(scorer));
        controls.force_running(50.0);
        // Two reads whose every attempt times out.
        controls.inject_many(Injection::Timeout, 6);

        let maintenance = MaintenanceService::spawn(
            MaintenanceEvaluator::new(EvaluatorSettings::from_config(&config)),
            16,
        );
        let mut alerts = maintenance.subscribe();
        monitor.add_sink(maintenance.sink()).unwrap();
        let handle = monitor.handle();
        let mut records = handle.subscribe();

        monitor.start(config.poll_interval()).unwrap();

        let first = records.recv().await.unwrap();
        let status = handle.status();
        assert_eq!(status.state, MonitorState::Running);
        assert_eq!(status.stats.ticks_failed, 2);
        assert_eq!(status.stats.consecutive_failures, 0);
        assert_eq!(first.state.mode, OperatingMode::Running);
        assert_eq!(first.state.actual_speed, Some(50.0));
        assert_eq!(handle.motor_state().mode, OperatingMode::Running);
        assert!(alerts.try_recv().is_err());

        for _ in 0..3 {
            records.recv().await.unwrap();
        }
        monitor.stop().await.unwrap();
        assert_eq!(monitor.state(), MonitorState::Idle);

        let evaluator = maintenance.shutdown().await.unwrap();
        assert_eq!(evaluator.alert_count(), 1);
        match alerts.try_recv().unwrap() {
            AlertEvent::Opened(alert) => {
                assert_eq!(alert.triggering.len(), 3);
                assert_eq!(alert.snapshot.mode, OperatingMode::Running);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(alerts.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_threshold_failures_escalate_to_failed() {
        let config = config();
        let (mut monitor, controls) = monitor_with(&config, Box::new(SpeedBandScorer::default()));
        controls.set_persistent(Some(Injection::Timeout));
        let handle = monitor.handle();

        monitor.start(config.poll_interval()).unwrap();
        // Four ticks at 0s..3s, each failing after three attempts.
        tokio::time::sleep(Duration::from_millis(3_900)).await;
        assert_eq!(handle.state(), MonitorState::Running);
        assert_eq!(handle.status().stats.consecutive_failures, 4);

        let result = monitor.wait().await;
        assert!(matches!(
            result,
            Err(MonitorError::Fatal { consecutive_failures: 5, .. })
        ));
        assert_eq!(monitor.state(), MonitorState::Failed);
        assert!(matches!(
            handle.issue(Command::Stop).await,
            Err(CommandError::MonitorNotRunning)
        ));
        assert!(matches!(
            monitor.start(config.poll_interval()),
            Err(MonitorError::InvalidState { from: MonitorState::Failed, .. })
        ));

        controls.set_persistent(None);
        monitor.reset().await.unwrap();
        monitor.start(config.poll_interval()).unwrap();
        let mut records = handle.subscribe();
        assert!(records.recv().await.is_ok());
        monitor.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn broken_link_fails_fast_and_reset_reopens_it() {
        let config = Config {
            failure_threshold: 2,
            ..config()
        };
        let (mut monitor, controls) = monitor_with(&config, Box::new(SpeedBandScorer::default()));
        controls.inject(Injection::Io);

        monitor.start(config.poll_interval()).unwrap();
        assert!(matches!(monitor.wait().await, Err(MonitorError::Fatal { .. })));
        // One request broke the link; the second tick never reached the wire.
        assert_eq!(controls.request_count(), 1);
        assert!(monitor.client_mut().unwrap().is_broken());

        monitor.reset().await.unwrap();
        assert!(!monitor.client_mut().unwrap().is_broken());
        assert_eq!(monitor.state(), MonitorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn overrunning_tick_skips_exactly_one_deadline() {
        let config = Config {
            timeout_ms: 1000,
            ..config()
        };
        let (mut monitor, controls) = monitor_with(&config, Box::new(SpeedBandScorer::default()));
        // Five frames per tick at 300 ms each: a tick takes 1.5 intervals.
        controls.set_latency(Duration::from_millis(300));
        let handle = monitor.handle();

        monitor.start(config.poll_interval()).unwrap();
        tokio::time::sleep(Duration::from_millis(3_600)).await;

        // Ticks ran at 0s and 2s; the 1s and 3s slots were dropped, not queued.
        let stats = handle.status().stats;
        assert_eq!(stats.ticks_completed, 2);
        assert_eq!(stats.cadence_misses, 2);
        assert_eq!(stats.ticks_skipped, 2);
        assert_eq!(controls.request_count(), 10);

        monitor.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_abandons_a_stuck_tick_within_one_timeout() {
        let config = Config {
            timeout_ms: 3000,
            ..config()
        };
        let (mut monitor, controls) = monitor_with(&config, Box::new(SpeedBandScorer::default()));
        controls.set_latency(Duration::from_millis(2_500));

        monitor.start(config.poll_interval()).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let requested = Instant::now();
        monitor.stop().await.unwrap();
        assert!(requested.elapsed() <= Duration::from_millis(3_010));
        assert_eq!(monitor.state(), MonitorState::Idle);
        assert_eq!(monitor.status().stats.ticks_completed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_are_validated_and_applied_at_tick_boundary() {
        let config = config();
        let (mut monitor, controls) = monitor_with(&config, Box::new(SpeedBandScorer::default()));
        let handle = monitor.handle();
        assert!(matches!(
            handle.issue(Command::Start).await,
            Err(CommandError::MonitorNotRunning)
        ));

        monitor.start(config.poll_interval()).unwrap();
        let mut records = handle.subscribe();
        records.recv().await.unwrap();
        assert_eq!(handle.motor_state().mode, OperatingMode::Stopped);

        handle.issue(Command::SetSpeed(50.0)).await.unwrap();
        handle.issue(Command::Start).await.unwrap();
        assert!(matches!(
            handle.issue(Command::ResetFault).await,
            Err(CommandError::InvalidTransition { .. })
        ));
        assert!(matches!(
            handle.issue(Command::SetSpeed(250.0)).await,
            Err(CommandError::SetpointOutOfRange { .. })
        ));

        // Each command was answered after the read of its own tick.
        let state = handle.motor_state();
        assert_eq!(state.mode, OperatingMode::Running);
        assert_eq!(state.commanded_speed, Some(50.0));
        assert_eq!(controls.register(crate::devices::registers::Register::Stw), 0x047F);

        let stats = handle.status().stats;
        assert_eq!(stats.commands_applied, 2);
        assert_eq!(stats.commands_rejected, 2);
        monitor.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn setpoint_waits_for_a_fresh_sample_after_fault_reset() {
        let config = config();
        let (mut monitor, controls) = monitor_with(&config, Box::new(SpeedBandScorer::default()));
        controls.trip(85);
        let handle = monitor.handle();
        let mut records = handle.subscribe();

        monitor.start(config.poll_interval()).unwrap();
        let faulted = records.recv().await.unwrap();
        assert_eq!(faulted.state.fault_code().map(|c| c.get()), Some(85));

        // Both land in the same tick; the setpoint is checked against the faulted snapshot.
        let (reset, setpoint) = tokio::join!(
            handle.issue(Command::ResetFault),
            handle.issue(Command::SetSpeed(40.0)),
        );
        reset.unwrap();
        assert!(matches!(
            setpoint,
            Err(CommandError::InvalidTransition {
                command: Command::SetSpeed(_),
                mode: OperatingMode::Faulted(_),
            })
        ));

        let acknowledged = records.recv().await.unwrap();
        assert_eq!(acknowledged.state.mode, OperatingMode::Stopped);
        handle.issue(Command::SetSpeed(40.0)).await.unwrap();

        let stats = handle.status().stats;
        assert_eq!(stats.commands_applied, 2);
        assert_eq!(stats.commands_rejected, 1);
        monitor.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn commands_queued_at_shutdown_are_answered_not_running() {
        let config = Config {
            timeout_ms: 3000,
            ..config()
        };
        let (mut monitor, controls) = monitor_with(&config, Box::new(SpeedBandScorer::default()));
        controls.set_latency(Duration::from_millis(2_500));
        let handle = monitor.handle();

        monitor.start(config.poll_interval()).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // The first tick is stuck on the wire, so this stays queued.
        let queued = tokio::spawn({
            let handle = handle.clone();
            async move { handle.issue(Command::Start).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!queued.is_finished());

        monitor.stop().await.unwrap();
        assert!(matches!(
            queued.await.unwrap(),
            Err(CommandError::MonitorNotRunning)
        ));
        let stats = handle.status().stats;
        assert_eq!(stats.commands_applied, 0);
        assert_eq!(stats.commands_rejected, 0);
        assert_eq!(controls.register(crate::devices::registers::Register::Stw), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scoring_failure_yields_unscored_record() {
        let config = config();
        let (mut monitor, _) = monitor_with(&config, Box::new(FailingScorer));
        let handle = monitor.handle();
        let mut records = handle.subscribe();

        monitor.start(config.poll_interval()).unwrap();
        let record = records.recv().await.unwrap();
        assert!(record.verdict.is_none());
        assert_eq!(handle.status().stats.scoring_failures, 1);
        assert_eq!(handle.state(), MonitorState::Running);
        monitor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn lifecycle_rejects_out_of_order_calls() {
        let config = config();
        let (mut monitor, _) = monitor_with(&config, Box::new(SpeedBandScorer::default()));
        assert!(matches!(
            monitor.stop().await,
            Err(MonitorError::InvalidState { from: MonitorState::Idle, .. })
        ));
        assert!(matches!(monitor.reset().await, Err(MonitorError::InvalidState { .. })));
        assert!(matches!(
            monitor.start(Duration::ZERO),
            Err(MonitorError::InvalidInterval(_))
        ));
    }
}
