use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

/// Entries kept by [`BoundedLog`].
pub const LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.level {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(
            f,
            "[{}] {:5} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            level,
            self.message
        )
    }
}

/// Append-only, human-readable diagnostics for the operator.
pub trait LogSink: Send + Sync {
    fn record(&self, level: LogLevel, message: String);

    fn info(&self, message: String) {
        self.record(LogLevel::Info, message)
    }

    fn warn(&self, message: String) {
        self.record(LogLevel::Warn, message)
    }

    fn error(&self, message: String) {
        self.record(LogLevel::Error, message)
    }
}

/// Keeps the most recent [`LOG_CAPACITY`] entries and mirrors each one to `tracing`.
#[derive(Debug)]
pub struct BoundedLog {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl Default for BoundedLog {
    fn default() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }
}

impl BoundedLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(LOG_CAPACITY))),
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    fn push(&self, entry: LogEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            while entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Load previously persisted entries. A missing file yields an empty log.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let log = Self::new();
        if !path.exists() {
            return Ok(log);
        }
        let json = std::fs::read_to_string(path)?;
        let entries: Vec<LogEntry> = serde_json::from_str(&json).map_err(std::io::Error::other)?;
        for entry in entries {
            log.push(entry);
        }
        Ok(log)
    }

    pub fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(&self.entries()).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}

impl LogSink for BoundedLog {
    fn record(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Info => tracing::info!(target: "imgpress::log", "{}", message),
            LogLevel::Warn => tracing::warn!(target: "imgpress::log", "{}", message),
            LogLevel::Error => tracing::error!(target: "imgpress::log", "{}", message),
        }
        self.push(LogEntry {
            timestamp: Utc::now(),
            level,
            message,
        });
    }
}
