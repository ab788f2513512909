//! JSONL sink for `spool`. Appends one JSON object per event to a file.
//! The file is opened on activation (or on first append) and created if missing.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use spool::{Batch, FlushTimeout, Flushable, LogRecord, Payload, Sink, SinkError};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonlSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into(), file: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self) -> Result<File, SinkError> {
        let file = OpenOptions::new().create(true).append(true).open(&self.path).await?;
        tracing::debug!(path = %self.path.display(), "jsonl sink opened");
        Ok(file)
    }
}

#[async_trait]
impl Flushable for JsonlSink {
    /// Syncs written data to disk within `timeout`.
    async fn flush(&self, timeout: FlushTimeout) -> bool {
        let guard = self.file.lock().await;
        let Some(file) = guard.as_ref() else {
            return true;
        };
        let synced = match timeout.as_duration() {
            Some(budget) => match tokio::time::timeout(budget, file.sync_data()).await {
                Ok(result) => result,
                Err(_) => return false,
            },
            None => file.sync_data().await,
        };
        if let Err(err) = &synced {
            tracing::warn!(path = %self.path.display(), error = %err, "jsonl sync failed");
        }
        synced.is_ok()
    }
}

#[async_trait]
impl Sink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn activate(&self) -> Result<(), SinkError> {
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        Ok(())
    }

    async fn append(&self, batch: &Batch) -> Result<(), SinkError> {
        let mut out = String::new();
        for event in batch.iter() {
            out.push_str(&payload_to_json(event).to_string());
            out.push('\n');
        }

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(out.as_bytes()).await?;
            file.flush().await?;
        }
        Ok(())
    }

    async fn close(&self) {
        if let Some(mut file) = self.file.lock().await.take() {
            if let Err(err) = file.flush().await {
                tracing::warn!(path = %self.path.display(), error = %err, "jsonl close failed");
            }
        }
    }
}

/// Records become structured objects. Encoded payloads holding a JSON object are written as
/// is; any other bytes go into a `message` field.
fn payload_to_json(payload: &Payload) -> Value {
    match payload {
        Payload::Record(record) => record_to_json(record),
        Payload::Encoded(bytes) => match serde_json::from_slice::<Value>(bytes) {
            Ok(value @ Value::Object(_)) => value,
            _ => json!({ "message": String::from_utf8_lossy(bytes) }),
        },
    }
}

fn record_to_json(record: &LogRecord) -> Value {
    let mut value = json!({
        "timestamp": record.timestamp().to_rfc3339(),
        "level": record.level().as_str(),
        "target": record.target(),
        "message": record.message(),
        "file": record.location().file(),
        "line": record.location().line(),
    });
    if let Value::Object(fields) = &mut value {
        if let Some(thread) = record.thread_name() {
            fields.insert("thread".into(), Value::String(thread));
        }
        let properties = record.properties();
        if !properties.is_empty() {
            let props: Map<String, Value> =
                properties.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
            fields.insert("properties".into(), Value::Object(props));
        }
        if let Some(error) = record.error_text() {
            fields.insert("error".into(), Value::String(error));
        }
    }
    value
}
