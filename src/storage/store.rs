use log::{debug, error, info, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::models::{StoredAlertEvent, StoredSample};
use crate::config::DatabaseSettings;
use crate::output::sinks::ChannelSink;
use crate::services::maintenance::AlertEvent;
use crate::services::monitor::TickRecord;
use crate::utils::error::StorageError;

/// Append-only SQLite store for tick records and alert events.
#[derive(Clone)]
pub struct SampleStore {
    pool: SqlitePool,
    settings: DatabaseSettings,
}

impl SampleStore {
    pub async fn open(settings: &DatabaseSettings) -> Result<Self, StorageError> {
        if let Some(parent) = Path::new(&settings.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!("🗄️  Opening SQLite database: {}", settings.path);
        let options = SqliteConnectOptions::new()
            .filename(&settings.path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            settings: settings.clone(),
        };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS motor_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sequence INTEGER NOT NULL,
                captured_at INTEGER NOT NULL,
                mode TEXT NOT NULL,
                fault_code INTEGER,
                commanded_speed REAL,
                actual_speed REAL,
                status_word INTEGER,
                anomaly_score REAL,
                is_anomalous INTEGER,
                reason TEXT,
                registers TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alert_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                alert_id TEXT NOT NULL,
                event TEXT NOT NULL,
                occurred_at INTEGER NOT NULL,
                mode TEXT NOT NULL,
                triggering TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        for index_sql in [
            "CREATE INDEX IF NOT EXISTS idx_samples_time ON motor_samples(captured_at)",
            "CREATE INDEX IF NOT EXISTS idx_alert_events_alert ON alert_events(alert_id)",
        ] {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        debug!("✅ Database schema ready");
        Ok(())
    }

    /// Inserts one batch in a single transaction.
    pub async fn insert_samples(&self, samples: &[StoredSample]) -> Result<usize, StorageError> {
        if samples.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for sample in samples {
            sqlx::query(
                r#"
                INSERT INTO motor_samples (
                    sequence, captured_at, mode, fault_code, commanded_speed, actual_speed,
                    status_word, anomaly_score, is_anomalous, reason, registers
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            )
            .bind(sample.sequence)
            .bind(sample.captured_at)
            .bind(&sample.mode)
            .bind(sample.fault_code)
            .bind(sample.commanded_speed)
            .bind(sample.actual_speed)
            .bind(sample.status_word)
            .bind(sample.anomaly_score)
            .bind(sample.is_anomalous)
            .bind(&sample.reason)
            .bind(&sample.registers)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!("💾 Inserted {} samples", samples.len());
        Ok(samples.len())
    }

    pub async fn record_alert(&self, event: &AlertEvent) -> Result<(), StorageError> {
        let row = StoredAlertEvent::from_event(event)?;
        sqlx::query(
            r#"
            INSERT INTO alert_events (alert_id, event, occurred_at, mode, triggering)
            VALUES (?, ?, ?, ?, ?)
        "#,
        )
        .bind(&row.alert_id)
        .bind(&row.event)
        .bind(row.occurred_at)
        .bind(&row.mode)
        .bind(&row.triggering)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent samples first.
    pub async fn recent_samples(&self, limit: i64) -> Result<Vec<StoredSample>, StorageError> {
        let samples = sqlx::query_as::<_, StoredSample>(
            "SELECT * FROM motor_samples ORDER BY captured_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(samples)
    }

    pub async fn recent_alert_events(&self, limit: i64) -> Result<Vec<StoredAlertEvent>, StorageError> {
        let events = sqlx::query_as::<_, StoredAlertEvent>(
            "SELECT * FROM alert_events ORDER BY occurred_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    pub async fn sample_count(&self) -> Result<i64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM motor_samples")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Spawns the batched writer. Records are buffered and written when the
    /// batch fills or the flush interval elapses, whichever comes first. The
    /// task drains and flushes once the returned sink is dropped and yields
    /// the number of samples written.
    pub fn spawn_writer(&self, capacity: usize) -> (Arc<ChannelSink>, JoinHandle<u64>) {
        let (sink, records) = ChannelSink::new("sqlite", capacity);
        let store = self.clone();
        let task = tokio::spawn(store.run_writer(records));
        (Arc::new(sink), task)
    }

    async fn run_writer(self, mut records: mpsc::Receiver<Arc<TickRecord>>) -> u64 {
        let batch_size = self.settings.batch_size.max(1);
        let mut flush_timer = interval(Duration::from_millis(self.settings.flush_interval_ms.max(1)));
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buffer: Vec<StoredSample> = Vec::with_capacity(batch_size);
        let mut written = 0u64;

        info!(
            "💾 Sample writer started (batch {}, flush every {} ms)",
            batch_size, self.settings.flush_interval_ms
        );
        loop {
            tokio::select! {
                record = records.recv() => match record {
                    Some(record) => {
                        match StoredSample::from_record(&record) {
                            Ok(sample) => buffer.push(sample),
                            Err(e) => warn!("⚠️  Tick {} not stored: {}", record.sequence, e),
                        }
                        if buffer.len() >= batch_size {
                            written += self.flush(&mut buffer).await;
                        }
                    }
                    None => break,
                },
                _ = flush_timer.tick() => {
                    written += self.flush(&mut buffer).await;
                }
            }
        }

        written += self.flush(&mut buffer).await;
        info!("🛑 Sample writer stopped after {} samples", written);
        written
    }

    async fn flush(&self, buffer: &mut Vec<StoredSample>) -> u64 {
        if buffer.is_empty() {
            return 0;
        }
        let batch: Vec<StoredSample> = buffer.drain(..).collect();
        match self.insert_samples(&batch).await {
            Ok(count) => count as u64,
            Err(e) => {
                error!("❌ Failed to store {} samples: {}", batch.len(), e);
                0
            }
        }
    }

    pub async fn close(&self) {
        info!("🔒 Closing SQLite database");
        self.pool.close().await;
    }
}
