//! Disk Backend
//!
//! Owns one rotating writer per bucket file. The file a row lands in is
//! decided entirely by the rendered path for the `now` passed to `write`;
//! there is no rotation timer. Streams whose rendered paths collide share the
//! one writer for that path, so a file never has two encoders appending to it.
//! When the last stream moves off a path its file is finalized (compression
//! trailer written) and dropped from the file map.
//!
//! The route map is only locked long enough to find or move a route; each
//! file has its own mutex. Lock order is route map, then file.

mod space;
mod writer;

pub use space::{FixedProbe, SpaceProbe, StatvfsProbe};
pub use writer::WriterHandle;

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};

use crate::backend::{AvailabilityReport, LogBackend, LogRecord};
use crate::bucket::TimeBucketer;
use crate::codec::LogId;
use crate::config::{Compression, DiskConfig};
use crate::error::{Error, Result};
use crate::naming::FileNamer;

/// Writer state for one bucket file
#[derive(Debug)]
enum FileSlot {
    Idle,
    Open(WriterHandle),
    /// Removed from the file map; holders look the path up again
    Retired,
}

struct FileEntry {
    slot: Arc<Mutex<FileSlot>>,
    /// Streams currently routed to this path
    streams: usize,
}

impl FileEntry {
    fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(FileSlot::Idle)),
            streams: 0,
        }
    }
}

/// Where one stream currently writes, and whether its last I/O failed
struct Route {
    path: PathBuf,
    failed: Arc<AtomicBool>,
}

#[derive(Default)]
struct Routes {
    streams: HashMap<LogId, Route>,
    files: HashMap<PathBuf, FileEntry>,
}

/// Rotating, time-bucketed file writer
pub struct DiskBackend {
    base_dir: PathBuf,
    namer: FileNamer,
    bucketer: TimeBucketer,
    compression: Compression,
    log_version: u32,
    required_free_space: AtomicU64,
    probe: Arc<dyn SpaceProbe>,
    routes: RwLock<Routes>,
    /// Streams whose most recent write or flush failed
    failed_streams: AtomicUsize,
}

impl DiskBackend {
    /// Create a backend from configuration. `server_host` fills `SERVER_HOST`.
    pub fn new(config: &DiskConfig, bucketer: TimeBucketer, server_host: &str) -> Result<Self> {
        let namer = FileNamer::from_env(&config.filename_pattern, server_host, &config.region_env)?;

        tracing::info!(
            base_dir = ?config.base_dir,
            pattern = %config.filename_pattern,
            compression = ?config.compression,
            buckets_per_hour = bucketer.buckets_per_hour(),
            "Disk backend initialized"
        );

        Ok(Self {
            base_dir: config.base_dir.clone(),
            namer,
            bucketer,
            compression: config.compression,
            log_version: config.log_version,
            required_free_space: AtomicU64::new(config.required_free_space_bytes),
            probe: Arc::new(StatvfsProbe),
            routes: RwLock::new(Routes::default()),
            failed_streams: AtomicUsize::new(0),
        })
    }

    /// Replace the free-space probe
    pub fn with_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn bucketer(&self) -> &TimeBucketer {
        &self.bucketer
    }

    /// Change the free-space threshold; takes effect on the next check
    pub fn set_required_free_space(&self, bytes: u64) {
        self.required_free_space.store(bytes, Ordering::SeqCst);
    }

    /// Path a row for `log_id` written at `now` lands in
    pub fn path_for(&self, log_id: &LogId, now: DateTime<Utc>) -> Result<PathBuf> {
        let prefix = Path::new(log_id.file_prefix());
        if log_id.file_prefix().is_empty()
            || !prefix.components().all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(Error::Template(format!(
                "Invalid file prefix '{}'",
                log_id.file_prefix()
            )));
        }

        let name = self
            .namer
            .render_name(log_id, now, &self.bucketer, self.log_version)?;
        if name.is_empty() {
            return Err(Error::Template(format!(
                "Pattern '{}' rendered an empty name for {}",
                self.namer.pattern(),
                log_id
            )));
        }

        Ok(self.bucketer.path(
            &self.base_dir.join(prefix),
            now,
            &name,
            self.compression.extension(),
        ))
    }

    /// Append `bytes` to the bucket file for `log_id` at `now`, rotating first
    /// if the rendered path changed. Returns the path written to.
    pub fn write(&self, log_id: &LogId, bytes: &[u8], now: DateTime<Utc>) -> Result<PathBuf> {
        let path = self.path_for(log_id, now)?;

        loop {
            let (slot, failed, vacated) = self.route(log_id, &path)?;
            if let Some(old) = vacated {
                self.retire(old);
            }

            let mut slot = slot
                .lock()
                .map_err(|_| Error::Internal(format!("Writer lock poisoned for {:?}", path)))?;
            if matches!(*slot, FileSlot::Retired) {
                continue;
            }

            let result = self.write_locked(&mut slot, &path, bytes);
            drop(slot);
            self.record_outcome(log_id, &failed, result.is_ok());

            return match result {
                Ok(()) => Ok(path),
                Err(e) => {
                    tracing::warn!("Disk write failed for {}: {}", log_id, e);
                    Err(e)
                }
            };
        }
    }

    fn write_locked(&self, slot: &mut FileSlot, path: &Path, bytes: &[u8]) -> Result<()> {
        if matches!(slot, FileSlot::Idle) {
            tracing::debug!("Opening {:?}", path);
            *slot = FileSlot::Open(WriterHandle::open(path.to_path_buf(), self.compression)?);
        }

        if let FileSlot::Open(writer) = slot {
            if let Err(e) = writer.write(bytes) {
                // A writer that failed mid-append is not trusted again
                *slot = FileSlot::Idle;
                return Err(e);
            }
        }

        Ok(())
    }

    /// Point `log_id` at `path` and return the file slot, the stream's failure
    /// flag, and the path it left if no other stream still uses it.
    fn route(
        &self,
        log_id: &LogId,
        path: &Path,
    ) -> Result<(Arc<Mutex<FileSlot>>, Arc<AtomicBool>, Option<PathBuf>)> {
        {
            let routes = self
                .routes
                .read()
                .map_err(|_| Error::Internal("Route map lock poisoned".into()))?;
            if let Some(route) = routes.streams.get(log_id) {
                if route.path == path {
                    if let Some(entry) = routes.files.get(path) {
                        return Ok((Arc::clone(&entry.slot), Arc::clone(&route.failed), None));
                    }
                }
            }
        }

        let mut routes = self
            .routes
            .write()
            .map_err(|_| Error::Internal("Route map lock poisoned".into()))?;

        let previous = routes.streams.get(log_id).map(|r| r.path.clone());
        let mut vacated = None;
        if previous.as_deref() != Some(path) || !routes.files.contains_key(path) {
            routes
                .files
                .entry(path.to_path_buf())
                .or_insert_with(FileEntry::new)
                .streams += 1;
        }
        if let Some(old) = previous.filter(|old| old != path) {
            if let Some(entry) = routes.files.get_mut(&old) {
                entry.streams = entry.streams.saturating_sub(1);
                if entry.streams == 0 {
                    vacated = Some(old);
                }
            }
        }

        let route = routes
            .streams
            .entry(log_id.clone())
            .or_insert_with(|| Route {
                path: path.to_path_buf(),
                failed: Arc::new(AtomicBool::new(false)),
            });
        route.path = path.to_path_buf();
        let failed = Arc::clone(&route.failed);

        let slot = routes
            .files
            .get(path)
            .map(|entry| Arc::clone(&entry.slot))
            .ok_or_else(|| Error::Internal(format!("No writer entry for {:?}", path)))?;
        Ok((slot, failed, vacated))
    }

    /// Finalize the file at `path` and drop it from the map, unless a stream
    /// moved back onto it in the meantime.
    fn retire(&self, path: PathBuf) {
        let slot = match self.routes.read() {
            Ok(routes) => match routes.files.get(&path) {
                Some(entry) if entry.streams == 0 => Arc::clone(&entry.slot),
                _ => return,
            },
            Err(_) => return,
        };

        // Finish outside the route map so other streams keep writing
        if let Ok(mut slot) = slot.lock() {
            if let FileSlot::Open(writer) = std::mem::replace(&mut *slot, FileSlot::Idle) {
                finish_writer(writer);
            }
        }

        let Ok(mut routes) = self.routes.write() else {
            return;
        };
        let unused = routes
            .files
            .get(&path)
            .map(|entry| entry.streams == 0 && Arc::ptr_eq(&entry.slot, &slot))
            .unwrap_or(false);
        if !unused {
            return;
        }
        if let Ok(mut slot) = slot.lock() {
            if let FileSlot::Open(writer) = std::mem::replace(&mut *slot, FileSlot::Retired) {
                finish_writer(writer);
            }
        }
        routes.files.remove(&path);
    }

    fn record_outcome(&self, log_id: &LogId, failed: &AtomicBool, ok: bool) {
        let was_failed = failed.swap(!ok, Ordering::SeqCst);
        match (was_failed, ok) {
            (false, false) => {
                self.failed_streams.fetch_add(1, Ordering::SeqCst);
            }
            (true, true) => {
                self.failed_streams.fetch_sub(1, Ordering::SeqCst);
                tracing::info!("Disk writes for {} recovered", log_id);
            }
            _ => {}
        }
    }

    fn file_slots(&self) -> Result<Vec<(PathBuf, Arc<Mutex<FileSlot>>)>> {
        let routes = self
            .routes
            .read()
            .map_err(|_| Error::Internal("Route map lock poisoned".into()))?;
        Ok(routes
            .files
            .iter()
            .map(|(path, entry)| (path.clone(), Arc::clone(&entry.slot)))
            .collect())
    }

    fn log_ids(&self) -> Result<Vec<LogId>> {
        let routes = self
            .routes
            .read()
            .map_err(|_| Error::Internal("Route map lock poisoned".into()))?;
        Ok(routes.streams.keys().cloned().collect())
    }

    /// Flush and fsync the open file for `log_id`, if any
    pub fn flush(&self, log_id: &LogId) -> Result<()> {
        let (slot, failed) = {
            let routes = self
                .routes
                .read()
                .map_err(|_| Error::Internal("Route map lock poisoned".into()))?;
            let Some(route) = routes.streams.get(log_id) else {
                return Ok(());
            };
            let Some(entry) = routes.files.get(&route.path) else {
                return Ok(());
            };
            (Arc::clone(&entry.slot), Arc::clone(&route.failed))
        };

        let mut slot = slot
            .lock()
            .map_err(|_| Error::Internal(format!("Writer lock poisoned for {}", log_id)))?;
        let result = match &mut *slot {
            FileSlot::Open(writer) => writer.sync(),
            _ => return Ok(()),
        };
        drop(slot);
        self.record_outcome(log_id, &failed, result.is_ok());
        result
    }

    /// Flush and fsync every open file
    pub fn flush_all(&self) -> Result<()> {
        for log_id in self.log_ids()? {
            self.flush(&log_id)?;
        }
        Ok(())
    }

    /// Finalize every open file. Routes are kept; the next write reopens.
    pub fn close_all(&self) -> Result<()> {
        let mut first_error = None;

        for (path, slot) in self.file_slots()? {
            let mut slot = slot
                .lock()
                .map_err(|_| Error::Internal(format!("Writer lock poisoned for {:?}", path)))?;
            if let FileSlot::Open(writer) = std::mem::replace(&mut *slot, FileSlot::Idle) {
                match writer.finish() {
                    Ok(path) => tracing::debug!("Closed {:?}", path),
                    Err(e) => {
                        tracing::error!("Failed to close {:?}: {}", path, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of bucket files currently open
    pub fn open_writer_count(&self) -> usize {
        self.file_slots()
            .map(|slots| {
                slots
                    .iter()
                    .filter(|(_, slot)| matches!(slot.lock().as_deref(), Ok(FileSlot::Open(_))))
                    .count()
            })
            .unwrap_or(0)
    }

    /// `free_space(base_dir) >= required_free_space` and no stream is failing
    pub fn is_logging_available(&self) -> bool {
        self.availability_report().available
    }

    pub fn availability_report(&self) -> AvailabilityReport {
        let required_bytes = self.required_free_space.load(Ordering::SeqCst);
        let free_bytes = match self.probe.free_bytes(&self.base_dir) {
            Ok(free) => free,
            Err(e) => {
                tracing::debug!("Free space probe failed for {:?}: {}", self.base_dir, e);
                0
            }
        };

        AvailabilityReport {
            available: free_bytes >= required_bytes
                && self.failed_streams.load(Ordering::SeqCst) == 0,
            free_bytes,
            required_bytes,
        }
    }
}

fn finish_writer(writer: WriterHandle) {
    let path = writer.path().to_path_buf();
    match writer.finish() {
        Ok(_) => tracing::debug!("Closed {:?}", path),
        Err(e) => tracing::error!("Failed to close {:?}: {}", path, e),
    }
}

impl LogBackend for DiskBackend {
    fn name(&self) -> &str {
        "disk"
    }

    fn log(&self, record: &LogRecord, now: DateTime<Utc>) -> Result<()> {
        self.write(&record.log_id, &record.payload, now).map(|_| ())
    }

    fn is_logging_available(&self) -> bool {
        DiskBackend::is_logging_available(self)
    }

    fn availability_report(&self) -> AvailabilityReport {
        DiskBackend::availability_report(self)
    }
}

impl Drop for DiskBackend {
    fn drop(&mut self) {
        if let Err(e) = self.close_all() {
            tracing::warn!("Disk backend closed with errors: {}", e);
        }
    }
}
