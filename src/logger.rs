//! Logger
//!
//! The producer-facing entry point. Builds the stream identity for a row,
//! stamps it with the clock's `now`, and hands it to every configured backend.
//! Nothing here returns an error to the producer; failures are logged.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::{AvailabilityReport, LogBackend, LogRecord, PROTOCOL_VERSION};
use crate::clock::Clock;
use crate::codec::{ColumnType, LogId, RowRenderer};
use crate::config::UnavailablePolicy;

/// Fan-out logger over one or more backends
pub struct Logger {
    client_hostname: String,
    backends: Vec<Arc<dyn LogBackend>>,
    clock: Arc<dyn Clock>,
    policy: UnavailablePolicy,
    dropped: AtomicU64,
}

impl Logger {
    pub fn new(client_hostname: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client_hostname: client_hostname.into(),
            backends: Vec::new(),
            clock,
            policy: UnavailablePolicy::Write,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn LogBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn with_policy(mut self, policy: UnavailablePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn client_hostname(&self) -> &str {
        &self.client_hostname
    }

    pub fn backends(&self) -> &[Arc<dyn LogBackend>] {
        &self.backends
    }

    /// Log one payload of rows rendered under `headers` / `column_types`
    pub fn log(
        &self,
        file_prefix: &str,
        tags: &BTreeMap<String, String>,
        log_type: &str,
        headers: &[String],
        column_types: &[ColumnType],
        bytes: &[u8],
    ) {
        let log_id = match LogId::new(
            file_prefix,
            log_type,
            self.client_hostname.as_str(),
            tags.clone(),
            headers.to_vec(),
            column_types.to_vec(),
        ) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("Dropping {} row for {}: {}", log_type, file_prefix, e);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        self.dispatch(LogRecord {
            protocol_version: PROTOCOL_VERSION,
            log_id,
            payload: bytes.to_vec(),
        });
    }

    /// Render `objects` with `renderer` and log them as one payload
    pub fn log_objects<T>(
        &self,
        file_prefix: &str,
        tags: &BTreeMap<String, String>,
        log_type: &str,
        renderer: &dyn RowRenderer<T>,
        objects: &[T],
    ) {
        let mut payload = Vec::new();
        for object in objects {
            match renderer.render(object) {
                Ok(bytes) => payload.extend_from_slice(&bytes),
                Err(e) => {
                    tracing::error!("Failed to render {} row: {}", log_type, e);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        if payload.is_empty() {
            return;
        }

        let log_id = LogId::with_schema(
            file_prefix,
            log_type,
            self.client_hostname.as_str(),
            tags.clone(),
            renderer.schema().clone(),
        );
        self.dispatch(LogRecord {
            protocol_version: PROTOCOL_VERSION,
            log_id,
            payload,
        });
    }

    fn dispatch(&self, record: LogRecord) {
        let now = self.clock.now();

        for backend in &self.backends {
            if self.policy == UnavailablePolicy::Drop && !backend.is_logging_available() {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    tracing::warn!(
                        "Backend {} unavailable, {} rows dropped so far",
                        backend.name(),
                        dropped
                    );
                }
                continue;
            }

            if let Err(e) = backend.log(&record, now) {
                tracing::error!(
                    "Backend {} failed to log {}: {}",
                    backend.name(),
                    record.log_id,
                    e
                );
            }
        }
    }

    /// True only when every backend can accept rows
    pub fn is_logging_available(&self) -> bool {
        self.backends.iter().all(|b| b.is_logging_available())
    }

    pub fn availability_reports(&self) -> Vec<(String, AvailabilityReport)> {
        self.backends
            .iter()
            .map(|b| (b.name().to_string(), b.availability_report()))
            .collect()
    }

    /// Rows dropped by policy, bad schema or render failure
    pub fn dropped_rows(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::clock::ManualClock;
    use crate::codec::{RowEncoder, Schema, TypeTag, Value};
    use crate::error::Result;
    use chrono::{TimeZone, Utc};

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 0).unwrap(),
        ))
    }

    fn tags() -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert("tenant".to_string(), "acme".to_string());
        tags
    }

    #[test]
    fn test_fans_out_to_every_backend() {
        let a = Arc::new(MemoryBackend::new());
        let b = Arc::new(MemoryBackend::new());
        let clock = clock();
        let logger = Logger::new("web-1", clock.clone())
            .with_backend(a.clone())
            .with_backend(b.clone());

        logger.log(
            "clicks",
            &tags(),
            "click",
            &["url".to_string()],
            &[TypeTag::String.into()],
            b"row",
        );

        for backend in [&a, &b] {
            let records = backend.records();
            assert_eq!(records.len(), 1);
            let (record, at) = &records[0];
            assert_eq!(record.protocol_version, PROTOCOL_VERSION);
            assert_eq!(record.log_id.client_hostname(), "web-1");
            assert_eq!(record.log_id.tags(), &tags());
            assert_eq!(record.payload, b"row");
            assert_eq!(*at, clock.now());
        }
    }

    #[test]
    fn test_schema_mismatch_is_dropped() {
        let memory = Arc::new(MemoryBackend::new());
        let logger = Logger::new("web-1", clock()).with_backend(memory.clone());

        logger.log(
            "clicks",
            &BTreeMap::new(),
            "click",
            &["a".to_string(), "b".to_string()],
            &[TypeTag::String.into()],
            b"row",
        );

        assert!(memory.is_empty());
        assert_eq!(logger.dropped_rows(), 1);
    }

    #[test]
    fn test_availability_is_all_backends() {
        let a = Arc::new(MemoryBackend::new());
        let b = Arc::new(MemoryBackend::new());
        let logger = Logger::new("web-1", clock())
            .with_backend(a.clone())
            .with_backend(b.clone());

        assert!(logger.is_logging_available());
        b.set_available(false);
        assert!(!logger.is_logging_available());

        let reports = logger.availability_reports();
        assert_eq!(reports.len(), 2);
        assert!(reports[0].1.available);
        assert!(!reports[1].1.available);
    }

    #[test]
    fn test_write_policy_logs_while_unavailable() {
        let memory = Arc::new(MemoryBackend::new());
        memory.set_available(false);
        let logger = Logger::new("web-1", clock()).with_backend(memory.clone());

        logger.log("p", &BTreeMap::new(), "t", &[], &[], b"x");

        assert_eq!(memory.len(), 1);
        assert_eq!(logger.dropped_rows(), 0);
    }

    #[test]
    fn test_drop_policy_skips_unavailable_backend() {
        let up = Arc::new(MemoryBackend::new());
        let down = Arc::new(MemoryBackend::new());
        down.set_available(false);
        let logger = Logger::new("web-1", clock())
            .with_backend(up.clone())
            .with_backend(down.clone())
            .with_policy(UnavailablePolicy::Drop);

        logger.log("p", &BTreeMap::new(), "t", &[], &[], b"x");

        assert_eq!(up.len(), 1);
        assert!(down.is_empty());
        assert_eq!(logger.dropped_rows(), 1);
    }

    struct Click {
        url: String,
        count: i64,
    }

    struct ClickRenderer {
        schema: Schema,
    }

    impl RowRenderer<Click> for ClickRenderer {
        fn schema(&self) -> &Schema {
            &self.schema
        }

        fn render(&self, click: &Click) -> Result<Vec<u8>> {
            let mut encoder = RowEncoder::new(&self.schema);
            encoder.push_row(&[Value::String(click.url.clone()), Value::Long(click.count)])?;
            Ok(encoder.finish())
        }
    }

    #[test]
    fn test_log_objects_concatenates_rows() {
        let memory = Arc::new(MemoryBackend::new());
        let logger = Logger::new("web-1", clock()).with_backend(memory.clone());
        let renderer = ClickRenderer {
            schema: Schema::new(
                vec!["url".into(), "count".into()],
                vec![TypeTag::String.into(), TypeTag::Long.into()],
            )
            .unwrap(),
        };

        logger.log_objects(
            "clicks",
            &BTreeMap::new(),
            "click",
            &renderer,
            &[
                Click {
                    url: "/a".into(),
                    count: 1,
                },
                Click {
                    url: "/b".into(),
                    count: 2,
                },
            ],
        );

        let records = memory.records();
        assert_eq!(records.len(), 1);
        let rows = crate::codec::RowDecoder::new(renderer.schema(), &records[0].0.payload)
            .read_all()
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0], Value::String("/b".into()));
    }
}
