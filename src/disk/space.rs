//! Free Space Measurement

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Measures free bytes on the volume holding a path
pub trait SpaceProbe: Send + Sync {
    fn free_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// `statvfs` on the nearest existing ancestor of the path
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn free_bytes(&self, path: &Path) -> io::Result<u64> {
        let existing = path
            .ancestors()
            .find(|p| p.exists())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no existing ancestor"))?;

        let stat = nix::sys::statvfs::statvfs(existing).map_err(io::Error::from)?;
        Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
    }
}

/// Reports a settable number of free bytes, for tests and dry runs
#[derive(Debug)]
pub struct FixedProbe {
    free: AtomicU64,
}

impl FixedProbe {
    pub fn new(free: u64) -> Self {
        Self {
            free: AtomicU64::new(free),
        }
    }

    pub fn set(&self, free: u64) {
        self.free.store(free, Ordering::SeqCst);
    }
}

impl SpaceProbe for FixedProbe {
    fn free_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.free.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_statvfs_on_missing_child() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("not/yet/created");
        assert!(StatvfsProbe.free_bytes(&missing).is_ok());
    }

    #[test]
    fn test_fixed_probe() {
        let probe = FixedProbe::new(10);
        assert_eq!(probe.free_bytes(Path::new("/")).unwrap(), 10);
        probe.set(0);
        assert_eq!(probe.free_bytes(Path::new("/")).unwrap(), 0);
    }
}
