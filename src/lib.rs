//! Logship - Time-Bucketed Log Shipping
//!
//! Producers hand rows of typed columns to a [`Logger`]; the logger fans them
//! out to backends that write rotating, optionally compressed files on local
//! disk and/or ship them to a remote collector that writes the same layout.
//!
//! # Architecture
//!
//! - [`bucket`]: splits each hour into fixed-width buckets; every file covers
//!   exactly one bucket of one stream.
//! - [`naming`]: renders file names from a `{VAR}` pattern.
//! - [`codec`]: stream identity (`LogId`), schemas and the row payload layout.
//! - [`disk`]: the rotating writer with free-space backpressure.
//! - [`network`]: the buffered replicating client and the collector server,
//!   which acknowledges only after data and cursor are durable.
//!
//! # Features
//!
//! - Rotation driven purely by the `now` passed to each write, no timers
//! - gzip or lz4 files, one compressed member per bucket file
//! - At-least-once delivery with no reprocessing after a collector restart
//! - Protocol version checks on every frame and record

pub mod backend;
pub mod bucket;
pub mod clock;
pub mod codec;
pub mod config;
pub mod disk;
pub mod error;
pub mod logger;
pub mod naming;
pub mod network;

pub use config::LogshipConfig;
pub use error::{Error, Result};
pub use logger::Logger;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backend::{AvailabilityReport, LogBackend, LogRecord, MemoryBackend};
    pub use crate::bucket::TimeBucketer;
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::codec::{ColumnType, LogId, RowRenderer, Schema, TypeTag};
    pub use crate::config::LogshipConfig;
    pub use crate::disk::DiskBackend;
    pub use crate::error::{Error, Result};
    pub use crate::logger::Logger;
    pub use crate::naming::FileNamer;
    pub use crate::network::{CollectorServer, ReplicatorClient};
}
