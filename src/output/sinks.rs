use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use super::formatters::RecordFormatter;
use super::senders::DataSender;
use crate::services::monitor::{RecordSink, TickRecord};
use crate::utils::error::SinkError;

/// Bounded queue hand-off; a full queue drops the record rather than waiting.
pub struct ChannelSink {
    name: String,
    tx: mpsc::Sender<Arc<TickRecord>>,
}

impl ChannelSink {
    pub fn new(name: &str, capacity: usize) -> (Self, mpsc::Receiver<Arc<TickRecord>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: name.to_string(),
                tx,
            },
            rx,
        )
    }
}

impl RecordSink for ChannelSink {
    fn deliver(&self, record: &Arc<TickRecord>) -> Result<(), SinkError> {
        self.tx.try_send(Arc::clone(record)).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Backpressure(self.name.clone()),
            TrySendError::Closed(_) => SinkError::Closed(self.name.clone()),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Writes each record to the log at debug level, anomalies at info.
pub struct LogSink;

impl RecordSink for LogSink {
    fn deliver(&self, record: &Arc<TickRecord>) -> Result<(), SinkError> {
        match &record.verdict {
            Some(verdict) if verdict.is_anomalous => info!(
                "📊 Tick {}: {} anomalous ({}, score {:.3})",
                record.sequence, record.state.mode, verdict.reason, verdict.score
            ),
            _ => debug!("📊 Tick {}: {}", record.sequence, record.state.mode),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Spawns a task that formats records and hands them to `sender`.
/// Returns the sink to register with the monitor and the task, which yields
/// the number of records written once the sink side is dropped.
pub fn spawn_writer(
    name: &str,
    formatter: Box<dyn RecordFormatter>,
    mut sender: Box<dyn DataSender>,
    write_header: bool,
    capacity: usize,
) -> (ChannelSink, JoinHandle<u64>) {
    let (sink, mut records) = ChannelSink::new(name, capacity);
    let name = name.to_string();

    let task = tokio::spawn(async move {
        info!(
            "📤 Output '{}' writing to {} ({})",
            name,
            sender.destination(),
            sender.sender_type()
        );
        if write_header {
            if let Some(header) = formatter.format_header() {
                if let Err(e) = sender.send(&header).await {
                    warn!("⚠️  Output '{}' header failed: {}", name, e);
                }
            }
        }

        let mut written = 0u64;
        while let Some(record) = records.recv().await {
            let line = formatter.format_record(&record);
            match sender.send(&line).await {
                Ok(()) => written += 1,
                Err(e) => warn!("⚠️  Output '{}' dropped record {}: {}", name, record.sequence, e),
            }
            // Flush once the queue is drained rather than per record.
            if records.is_empty() {
                if let Err(e) = sender.flush().await {
                    warn!("⚠️  Output '{}' flush failed: {}", name, e);
                }
            }
        }

        if let Err(e) = sender.flush().await {
            warn!("⚠️  Output '{}' final flush failed: {}", name, e);
        }
        info!("🛑 Output '{}' closed after {} records", name, written);
        written
    });

    (sink, task)
}
