//! Backend Contract
//!
//! The logger façade hands every row to one or more backends: the local disk
//! writer, the replicating client, or the in-memory double used in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::LogId;
use crate::error::Result;

/// Protocol version stamped on rows produced by this build
pub const PROTOCOL_VERSION: u16 = 1;

/// Disk-space backpressure snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityReport {
    pub available: bool,
    pub free_bytes: u64,
    pub required_bytes: u64,
}

impl AvailabilityReport {
    /// Report used before anything has been measured
    pub fn assume_available() -> Self {
        Self {
            available: true,
            free_bytes: 0,
            required_bytes: 0,
        }
    }
}

/// One row (or a run of rows of the same stream) handed to a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub protocol_version: u16,
    pub log_id: LogId,
    pub payload: Vec<u8>,
}

/// A destination for rows
pub trait LogBackend: Send + Sync {
    /// Short name used in diagnostics
    fn name(&self) -> &str;

    /// Accept a row. `now` decides which bucket it lands in.
    fn log(&self, record: &LogRecord, now: DateTime<Utc>) -> Result<()>;

    fn is_logging_available(&self) -> bool {
        self.availability_report().available
    }

    fn availability_report(&self) -> AvailabilityReport;
}

/// Backend that keeps everything in memory
#[derive(Debug)]
pub struct MemoryBackend {
    records: Mutex<Vec<(LogRecord, DateTime<Utc>)>>,
    available: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Everything logged so far, with the instant it was logged at
    pub fn records(&self) -> Vec<(LogRecord, DateTime<Utc>)> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn log(&self, record: &LogRecord, now: DateTime<Utc>) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((record.clone(), now));
        Ok(())
    }

    fn is_logging_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn availability_report(&self) -> AvailabilityReport {
        AvailabilityReport {
            available: self.is_logging_available(),
            free_bytes: 0,
            required_bytes: 0,
        }
    }
}
