//! JSON-Lines file sink
//!
//! Appends one JSON object per event. The file handle is opened lazily and
//! kept across batches; IO failures are transient (disk pressure, rotation
//! by an external tool) and the handle is reopened on the next attempt.

use anyhow::Context;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::sink::{EventSink, SinkError};
use crate::events::ProxyEvent;

pub struct FileSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    async fn open(&self) -> anyhow::Result<File> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))
    }
}

#[async_trait]
impl EventSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn send(&self, batch: &[ProxyEvent]) -> Result<(), SinkError> {
        let mut lines = String::new();
        for event in batch {
            let line = serde_json::to_string(event)
                .map_err(|e| SinkError::Permanent(anyhow::anyhow!(e)))?;
            lines.push_str(&line);
            lines.push('\n');
        }

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(
                self.open()
                    .await
                    .map_err(SinkError::Transient)?,
            );
        }
        let file = guard.as_mut().expect("file opened above");

        let result = async {
            file.write_all(lines.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(err) = result {
            // Drop the handle so the next attempt reopens it
            *guard = None;
            return Err(SinkError::Transient(anyhow::anyhow!(err)));
        }
        Ok(())
    }

    async fn close(&self) {
        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_mut() {
            let _ = file.flush().await;
        }
        *guard = None;
    }
}
