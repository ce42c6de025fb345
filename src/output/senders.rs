use async_trait::async_trait;
use log::{debug, error};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::utils::error::SinkError;

/// Final hop of a formatted line: stdout, a file, ...
#[async_trait]
pub trait DataSender: Send + Sync {
    async fn send(&mut self, line: &str) -> Result<(), SinkError>;

    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn sender_type(&self) -> &str;

    fn destination(&self) -> String;
}

pub struct ConsoleSender;

#[async_trait]
impl DataSender for ConsoleSender {
    async fn send(&mut self, line: &str) -> Result<(), SinkError> {
        println!("{}", line);
        Ok(())
    }

    fn sender_type(&self) -> &str {
        "console"
    }

    fn destination(&self) -> String {
        "stdout".to_string()
    }
}

/// Appends one line per record. The file and its directory are created on open.
pub struct FileSender {
    path: PathBuf,
    file: fs::File,
}

impl FileSender {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let write_error = |source| SinkError::Write {
            destination: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(write_error)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                error!("❌ Failed to open file {}: {}", path.display(), e);
                write_error(e)
            })?;

        debug!("📝 Appending records to {}", path.display());
        Ok(Self { path, file })
    }

    /// True when nothing has been written to the file yet.
    pub async fn is_empty(&self) -> bool {
        self.file.metadata().await.map(|m| m.len() == 0).unwrap_or(true)
    }

    fn write_error(&self, source: std::io::Error) -> SinkError {
        SinkError::Write {
            destination: self.path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl DataSender for FileSender {
    async fn send(&mut self, line: &str) -> Result<(), SinkError> {
        let mut buffer = Vec::with_capacity(line.len() + 1);
        buffer.extend_from_slice(line.as_bytes());
        buffer.push(b'\n');
        self.file
            .write_all(&buffer)
            .await
            .map_err(|e| self.write_error(e))
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.file.flush().await.map_err(|e| self.write_error(e))
    }

    fn sender_type(&self) -> &str {
        "file"
    }

    fn destination(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_sender_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("records.jsonl");

        let mut sender = FileSender::open(&path).await.unwrap();
        assert!(sender.is_empty().await);
        sender.send("{\"a\":1}").await.unwrap();
        sender.send("{\"a\":2}").await.unwrap();
        sender.flush().await.unwrap();
        drop(sender);

        let mut sender = FileSender::open(&path).await.unwrap();
        sender.send("{\"a\":3}").await.unwrap();
        sender.flush().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert_eq!(sender.destination(), path.display().to_string());
    }
}
