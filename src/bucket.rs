//! Time Buckets
//!
//! Maps instants onto fixed-width slots within an hour. Files are grouped and
//! rolled over per slot. Every operation is a pure function of its inputs and
//! the configured `buckets_per_hour`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Timelike, Utc};

use crate::error::{Error, Result};

/// Bucket arithmetic for a fixed number of buckets per hour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBucketer {
    buckets_per_hour: u32,
}

impl TimeBucketer {
    /// Create a bucketer. `buckets_per_hour` must evenly divide 60.
    pub fn new(buckets_per_hour: u32) -> Result<Self> {
        if buckets_per_hour == 0 || 60 % buckets_per_hour != 0 {
            return Err(Error::Config(format!(
                "buckets_per_hour must evenly divide 60, got {}",
                buckets_per_hour
            )));
        }
        Ok(Self { buckets_per_hour })
    }

    pub fn buckets_per_hour(&self) -> u32 {
        self.buckets_per_hour
    }

    /// Width of one bucket in minutes
    pub fn minutes_per_bucket(&self) -> u32 {
        60 / self.buckets_per_hour
    }

    /// Index of the bucket containing `instant` within its hour
    pub fn current_bucket(&self, instant: DateTime<Utc>) -> u32 {
        instant.minute() / self.minutes_per_bucket()
    }

    /// Render as `YYYY-MM-DD-HH-BB`
    pub fn format(&self, instant: DateTime<Utc>) -> String {
        format!(
            "{}-{:02}",
            instant.format("%Y-%m-%d-%H"),
            self.current_bucket(instant)
        )
    }

    /// Inverse of [`format`](Self::format); resolves to the bucket's start.
    pub fn parse(&self, timestamp: &str) -> Result<DateTime<Utc>> {
        let invalid = |reason: &str| Error::Timestamp {
            input: timestamp.to_string(),
            reason: reason.to_string(),
        };

        let (date_hour, bucket) = timestamp
            .rsplit_once('-')
            .ok_or_else(|| invalid("missing bucket index"))?;

        if bucket.is_empty() || !bucket.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("bucket index is not a number"));
        }
        let bucket: u32 = bucket
            .parse()
            .map_err(|_| invalid("bucket index is not a number"))?;
        if bucket >= self.buckets_per_hour {
            return Err(invalid("bucket index out of range"));
        }

        let naive = NaiveDateTime::parse_from_str(&format!("{}:00", date_hour), "%Y-%m-%d-%H:%M")
            .map_err(|e| invalid(&e.to_string()))?;

        let start = Utc.from_utc_datetime(&naive)
            + Duration::minutes(i64::from(bucket * self.minutes_per_bucket()));
        // Only the exact rendering of a bucket is accepted
        if self.format(start) != timestamp {
            return Err(invalid("not in YYYY-MM-DD-HH-BB form"));
        }
        Ok(start)
    }

    /// Directory for a formatted timestamp: `YYYY-MM/DD`
    pub fn directory_name(&self, timestamp: &str) -> Result<String> {
        let instant = self.parse(timestamp)?;
        Ok(instant.format("%Y-%m/%d").to_string())
    }

    /// Full path `base_dir/YYYY-MM/DD/{filename}-{YYYY-MM-DD-HH-BB}.{ext}`
    pub fn path(&self, base_dir: &Path, instant: DateTime<Utc>, filename: &str, ext: &str) -> PathBuf {
        base_dir
            .join(instant.format("%Y-%m").to_string())
            .join(instant.format("%d").to_string())
            .join(format!("{}-{}.{}", filename, self.format(instant), ext))
    }

    /// Floor `instant` to the start of its bucket
    pub fn to_start_of_bucket(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let into_bucket = i64::from(instant.minute() % self.minutes_per_bucket()) * 60
            + i64::from(instant.second());
        instant
            - Duration::seconds(into_bucket)
            - Duration::nanoseconds(i64::from(instant.nanosecond()))
    }

    /// The `count` buckets preceding the one containing `since`, newest first
    pub fn timestamps_before(&self, since: DateTime<Utc>, count: usize) -> BucketSequence {
        BucketSequence {
            bucketer: *self,
            anchor: self.to_start_of_bucket(since),
            count,
            direction: Direction::Backward,
        }
    }

    /// The `count` buckets following the one containing `since`, oldest first
    pub fn timestamps_after(&self, since: DateTime<Utc>, count: usize) -> BucketSequence {
        BucketSequence {
            bucketer: *self,
            anchor: self.to_start_of_bucket(since),
            count,
            direction: Direction::Forward,
        }
    }

    fn step(&self) -> Duration {
        Duration::minutes(i64::from(self.minutes_per_bucket()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Finite run of bucket timestamps. Iterating does not consume it, so the
/// same sequence can be walked again after an interrupted backfill.
#[derive(Debug, Clone)]
pub struct BucketSequence {
    bucketer: TimeBucketer,
    anchor: DateTime<Utc>,
    count: usize,
    direction: Direction,
}

impl BucketSequence {
    pub fn iter(&self) -> BucketIter {
        let step = match self.direction {
            Direction::Forward => self.bucketer.step(),
            Direction::Backward => -self.bucketer.step(),
        };
        BucketIter {
            bucketer: self.bucketer,
            next: self.anchor + step,
            step,
            remaining: self.count,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl<'a> IntoIterator for &'a BucketSequence {
    type Item = String;
    type IntoIter = BucketIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy iterator over bucket timestamps
#[derive(Debug, Clone)]
pub struct BucketIter {
    bucketer: TimeBucketer,
    next: DateTime<Utc>,
    step: Duration,
    remaining: usize,
}

impl BucketIter {
    /// Next bucket start as an instant rather than a string
    pub fn next_instant(&mut self) -> Option<DateTime<Utc>> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.next;
        self.next += self.step;
        self.remaining -= 1;
        Some(current)
    }
}

impl Iterator for BucketIter {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.next_instant().map(|t| self.bucketer.format(t))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for BucketIter {}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, h, m, s).unwrap()
    }

    #[test]
    fn test_rejects_uneven_bucket_counts() {
        assert!(TimeBucketer::new(0).is_err());
        assert!(TimeBucketer::new(7).is_err());
        assert!(TimeBucketer::new(60).is_ok());
    }

    #[test]
    fn test_five_minute_buckets() {
        let b = TimeBucketer::new(12).unwrap();
        assert_eq!(b.minutes_per_bucket(), 5);
        assert_eq!(b.current_bucket(at(1, 14, 0)), 2);
        assert_eq!(b.current_bucket(at(1, 59, 59)), 11);
        assert_eq!(b.current_bucket(at(1, 0, 0)), 0);
    }

    #[test]
    fn test_format_and_parse() {
        let b = TimeBucketer::new(12).unwrap();
        assert_eq!(b.format(at(1, 14, 33)), "2024-01-02-01-02");
        assert_eq!(b.parse("2024-01-02-01-02").unwrap(), at(1, 10, 0));

        for minute in [0, 5, 10, 55] {
            let t = at(13, minute, 0);
            assert_eq!(b.parse(&b.format(t)).unwrap(), b.to_start_of_bucket(t));
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let b = TimeBucketer::new(4).unwrap();
        assert!(b.parse("2024-01-02-01").is_err());
        assert!(b.parse("2024-01-02-01-04").is_err());
        assert!(b.parse("2024-01-02-xx-01").is_err());
        assert!(b.parse("nonsense").is_err());
    }

    #[test]
    fn test_parse_only_accepts_canonical_form() {
        let b = TimeBucketer::new(12).unwrap();
        assert!(b.parse("2024-01-02-01-02").is_ok());
        assert!(b.parse("2024-01-02-01-002").is_err());
        assert!(b.parse("2024-01-02-01-2").is_err());
        assert!(b.parse("2024-01-02-1-02").is_err());
        assert!(b.parse("2024-1-02-01-02").is_err());
    }

    #[test]
    fn test_to_start_of_bucket() {
        let b = TimeBucketer::new(4).unwrap();
        let t = at(9, 29, 59) + Duration::milliseconds(250);
        assert_eq!(b.to_start_of_bucket(t), at(9, 15, 0));
    }

    #[test]
    fn test_directory_and_path() {
        let b = TimeBucketer::new(12).unwrap();
        assert_eq!(b.directory_name("2024-01-02-01-02").unwrap(), "2024-01/02");

        let path = b.path(Path::new("/data/clicks"), at(1, 14, 0), "click-v1", "log");
        assert_eq!(
            path,
            PathBuf::from("/data/clicks/2024-01/02/click-v1-2024-01-02-01-02.log")
        );
    }

    #[test]
    fn test_sequences_are_restartable() {
        let b = TimeBucketer::new(2).unwrap();
        let after = b.timestamps_after(at(23, 40, 0), 3);
        let first: Vec<String> = after.iter().collect();
        assert_eq!(
            first,
            vec!["2024-01-03-00-00", "2024-01-03-00-01", "2024-01-03-01-00"]
        );
        let second: Vec<String> = (&after).into_iter().collect();
        assert_eq!(first, second);

        let before: Vec<String> = b.timestamps_before(at(0, 10, 0), 2).iter().collect();
        assert_eq!(before, vec!["2024-01-01-23-01", "2024-01-01-23-00"]);
    }

    #[test]
    fn test_empty_sequence() {
        let b = TimeBucketer::new(1).unwrap();
        let seq = b.timestamps_after(at(1, 0, 0), 0);
        assert!(seq.is_empty());
        assert_eq!(seq.iter().count(), 0);
    }
}
