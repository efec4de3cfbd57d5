//! Bucket File Writer
//!
//! One open file bound to one rendered path. Compressed writers keep a single
//! encoder open for the whole bucket so that every write lands in the same
//! gzip member (or lz4 frame); the trailer is written once, in `finish`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use lz4_flex::frame::FrameEncoder;

use crate::config::Compression;
use crate::error::{Error, Result};

const WRITE_BUFFER: usize = 64 * 1024;

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Lz4(FrameEncoder<BufWriter<File>>),
}

/// Writer for one bucket file
pub struct WriterHandle {
    path: PathBuf,
    sink: Sink,
    bytes_written: u64,
}

impl WriterHandle {
    /// Open (or append to) the file at `path`, creating parent directories
    pub fn open(path: PathBuf, compression: Compression) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let buffered = BufWriter::with_capacity(WRITE_BUFFER, file);

        let sink = match compression {
            Compression::None => Sink::Plain(buffered),
            Compression::Gzip => Sink::Gzip(GzEncoder::new(buffered, flate2::Compression::default())),
            Compression::Lz4 => Sink::Lz4(FrameEncoder::new(buffered)),
        };

        Ok(Self {
            path,
            sink,
            bytes_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Uncompressed bytes accepted since this writer was opened
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match &mut self.sink {
            Sink::Plain(w) => w.write_all(bytes)?,
            Sink::Gzip(w) => w.write_all(bytes)?,
            Sink::Lz4(w) => w.write_all(bytes)?,
        }
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Push buffered bytes to the file and fsync it. Compressed writers emit
    /// a sync point, not a trailer; the bucket stays open.
    pub fn sync(&mut self) -> Result<()> {
        let file = match &mut self.sink {
            Sink::Plain(w) => {
                w.flush()?;
                w.get_ref()
            }
            Sink::Gzip(w) => {
                w.flush()?;
                w.get_ref().get_ref()
            }
            Sink::Lz4(w) => {
                w.flush()?;
                w.get_ref().get_ref()
            }
        };
        file.sync_data()?;
        Ok(())
    }

    /// Write the compression trailer, flush, fsync and close
    pub fn finish(self) -> Result<PathBuf> {
        let buffered = match self.sink {
            Sink::Plain(w) => w,
            Sink::Gzip(w) => w.finish()?,
            Sink::Lz4(w) => w
                .finish()
                .map_err(|e| Error::Disk(format!("lz4 finish failed for {:?}: {}", self.path, e)))?,
        };

        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(self.path)
    }
}

impl std::fmt::Debug for WriterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterHandle")
            .field("path", &self.path)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::MultiGzDecoder;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn test_plain_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a/b/plain.log");

        let mut w = WriterHandle::open(path.clone(), Compression::None).unwrap();
        w.write(b"one").unwrap();
        w.write(b"two").unwrap();
        assert_eq!(w.bytes_written(), 6);
        w.finish().unwrap();

        let mut w = WriterHandle::open(path.clone(), Compression::None).unwrap();
        w.write(b"three").unwrap();
        w.finish().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"onetwothree");
    }

    #[test]
    fn test_gzip_single_member() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("g.log.gz");

        let mut w = WriterHandle::open(path.clone(), Compression::Gzip).unwrap();
        w.write(b"first ").unwrap();
        w.sync().unwrap();
        w.write(b"second").unwrap();
        w.finish().unwrap();

        // A single-member decoder sees both writes
        let raw = fs::read(&path).unwrap();
        let mut out = String::new();
        flate2::read::GzDecoder::new(&raw[..])
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "first second");
    }

    #[test]
    fn test_gzip_reopen_appends_member() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("g.log.gz");

        for chunk in [&b"abc"[..], &b"def"[..]] {
            let mut w = WriterHandle::open(path.clone(), Compression::Gzip).unwrap();
            w.write(chunk).unwrap();
            w.finish().unwrap();
        }

        let mut out = Vec::new();
        MultiGzDecoder::new(fs::File::open(&path).unwrap())
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"abcdef");
    }

    #[test]
    fn test_lz4_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("l.log.lz4");

        let mut w = WriterHandle::open(path.clone(), Compression::Lz4).unwrap();
        w.write(b"hello ").unwrap();
        w.write(b"world").unwrap();
        w.finish().unwrap();

        let mut out = Vec::new();
        lz4_flex::frame::FrameDecoder::new(fs::File::open(&path).unwrap())
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"hello world");
    }
}
