use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::images::{GridAspect, ImageId};

/// What a session records about its own progress.
///
/// Serialized internally tagged, so every line of `events.jsonl` carries a
/// `type` such as `grid_created` next to the variant's fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        root: String,
        resumed: bool,
        images: usize,
    },
    GridCreated {
        label: String,
        path: String,
        aspect: GridAspect,
        requested: usize,
        image_ids: Vec<ImageId>,
        width: u32,
        height: u32,
    },
    OracleSelection {
        label: String,
        judge: String,
        grid_path: String,
        total: usize,
        limit: usize,
        positions: Vec<usize>,
        strategy: String,
    },
    SearchFinished {
        queries: usize,
        found: usize,
        /// `source:query` of every search that failed.
        failed: Vec<String>,
    },
    RoundFinished {
        round: usize,
        pages: usize,
        input: usize,
        winners: Option<usize>,
        timed_out: bool,
    },
    SelectionFinished {
        strategy: String,
        final_count: usize,
        /// Canonical keys of the shortlist, in order.
        selected: Vec<String>,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::SessionStarted { .. } => "session_started",
            SessionEvent::GridCreated { .. } => "grid_created",
            SessionEvent::OracleSelection { .. } => "oracle_selection",
            SessionEvent::SearchFinished { .. } => "search_finished",
            SessionEvent::RoundFinished { .. } => "round_finished",
            SessionEvent::SelectionFinished { .. } => "selection_finished",
        }
    }
}

/// One line of the log as read back.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub session_id: String,
    pub ts: String,
    pub event: SessionEvent,
}

/// Appends [`SessionEvent`]s to a session's `events.jsonl`. Clones share one
/// file handle, opened on the first write.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<LogFile>,
}

#[derive(Debug)]
struct LogFile {
    path: PathBuf,
    session_id: String,
    handle: Mutex<Option<File>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LogFile {
                path: path.into(),
                session_id: session_id.into(),
                handle: Mutex::new(None),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, event: &SessionEvent) -> anyhow::Result<EventRecord> {
        let record = EventRecord {
            session_id: self.inner.session_id.clone(),
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            event: event.clone(),
        };
        let mut line = serde_json::to_value(event)?;
        if let Value::Object(fields) = &mut line {
            fields.insert("session_id".to_string(), Value::from(record.session_id.clone()));
            fields.insert("ts".to_string(), Value::from(record.ts.clone()));
        }
        let mut encoded = serde_json::to_vec(&line)?;
        encoded.push(b'\n');

        let mut handle = self
            .inner
            .handle
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        if handle.is_none() {
            *handle = Some(self.open()?);
        }
        if let Some(file) = handle.as_mut() {
            file.write_all(&encoded)
                .with_context(|| format!("failed appending to {}", self.inner.path.display()))?;
        }
        Ok(record)
    }

    fn open(&self) -> anyhow::Result<File> {
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)
            .with_context(|| format!("failed opening {}", self.inner.path.display()))
    }

    /// Every decodable line of the log, oldest first. Lines from other
    /// sessions sharing the file are included.
    pub fn records(&self) -> anyhow::Result<Vec<EventRecord>> {
        let raw = match std::fs::read_to_string(&self.inner.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(raw.lines().filter_map(decode_line).collect())
    }

    pub fn event_types(&self) -> anyhow::Result<Vec<String>> {
        Ok(self
            .records()?
            .iter()
            .map(|record| record.event.kind().to_string())
            .collect())
    }
}

fn decode_line(line: &str) -> Option<EventRecord> {
    let value: Value = serde_json::from_str(line).ok()?;
    let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
    Some(EventRecord {
        session_id: text("session_id")?,
        ts: text("ts")?,
        event: serde_json::from_value(value.clone()).ok()?,
    })
}
