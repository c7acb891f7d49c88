//! Per-run cache of whole-file scan results.
//!
//! Several detectors want the silence map of the same file (silence,
//! black-frame enhancement, runtime matching). The cache is an explicit
//! object owned by the run and shared by reference, so it is dropped with
//! the run and never outlives the file it describes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::EpisplitError;
use crate::scan::SilenceRegion;

/// Silence regions keyed by file path.
#[derive(Debug, Default)]
pub struct ScanCache {
    silences: Mutex<HashMap<PathBuf, Vec<SilenceRegion>>>,
}

impl ScanCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached silences for `path`, or run `scan` and store the
    /// result. Failed scans are not cached.
    ///
    /// The lock is not held while scanning, so two threads may scan the same
    /// file once each; the first stored result wins.
    pub fn silences_or_scan<F>(&self, path: &Path, scan: F) -> Result<Vec<SilenceRegion>, EpisplitError>
    where
        F: FnOnce() -> Result<Vec<SilenceRegion>, EpisplitError>,
    {
        if let Some(hit) = self.cached_silences(path) {
            log::debug!("Silence cache hit for {}", path.display());
            return Ok(hit);
        }

        let regions = scan()?;
        let mut guard = self
            .silences
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.entry(path.to_path_buf()).or_insert(regions).clone())
    }

    pub fn cached_silences(&self, path: &Path) -> Option<Vec<SilenceRegion>> {
        self.silences
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(path)
            .cloned()
    }

    pub fn clear(&self) {
        self.silences
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn second_lookup_skips_the_scan() {
        let cache = ScanCache::new();
        let calls = Cell::new(0);
        let path = Path::new("a.mkv");

        for _ in 0..2 {
            let regions = cache
                .silences_or_scan(path, || {
                    calls.set(calls.get() + 1);
                    Ok(vec![SilenceRegion::new(10.0, 13.0)])
                })
                .unwrap();
            assert_eq!(regions.len(), 1);
        }
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn errors_are_not_cached() {
        let cache = ScanCache::new();
        let path = Path::new("b.mkv");
        let first = cache.silences_or_scan(path, || Err(EpisplitError::NoAudioStream));
        assert!(first.is_err());
        assert!(cache.cached_silences(path).is_none());

        cache.clear();
        assert!(cache.cached_silences(path).is_none());
    }
}
