// src/exec/sink.rs

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::errors::Result;

/// Per-node job log. Lines are only ever appended.
#[derive(Debug, Clone)]
pub enum LogSink {
    File(PathBuf),
    Memory(Arc<Mutex<Vec<String>>>),
}

impl LogSink {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        LogSink::File(path.into())
    }

    pub fn memory() -> Self {
        LogSink::Memory(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn append(&self, line: &str) -> Result<()> {
        match self {
            LogSink::File(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)?;
                    }
                }
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                writeln!(file, "{line}")?;
            }
            LogSink::Memory(lines) => {
                lines
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(line.to_string());
            }
        }
        Ok(())
    }

    /// Everything written so far. A log file that does not exist yet reads
    /// as empty.
    pub fn lines(&self) -> Result<Vec<String>> {
        match self {
            LogSink::File(path) => match fs::read_to_string(path) {
                Ok(s) => Ok(s.lines().map(str::to_string).collect()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
                Err(e) => Err(e.into()),
            },
            LogSink::Memory(lines) => Ok(lines
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()),
        }
    }

    /// Where the log can be found; carried in event metadata.
    pub fn reference(&self) -> String {
        match self {
            LogSink::File(path) => path.display().to_string(),
            LogSink::Memory(_) => "memory".to_string(),
        }
    }
}
