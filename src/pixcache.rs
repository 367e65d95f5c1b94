//! In-memory cache of decoded, display-ready images.
//!
//! One instance per zoom state. Entries are width-specific: a window resize
//! changes the requested width, which must invalidate the fit. Eviction is
//! batched: once the entry count exceeds `CACHE_SIZE`, the oldest half (by
//! insertion order) is dropped in one pass, amortizing eviction cost.
//!
//! The in-flight set is the backpressure heart of the pipeline: when the
//! background prefetcher and the foreground display want the same image at
//! the same moment, the second caller blocks on a condvar until the first
//! decode lands, instead of starting a duplicate decode.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::DynamicImage;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::DecodeError;

/// Maximum entries per zoom state before the batched eviction kicks in.
pub const CACHE_SIZE: usize = 50;

struct Entry {
    image: Arc<DynamicImage>,
    width: u32,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<PathBuf, Entry>,
    in_flight: HashSet<PathBuf>,
    seq: u64,
}

#[derive(Default)]
pub struct PixbufCache {
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl PixbufCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached image for `path` at `width`, decoding on miss.
    ///
    /// A hit requires a matching width. If another thread is already
    /// decoding the same path, this blocks until that decode completes and
    /// then re-checks the cache, so a concurrent burst for one key costs
    /// exactly one decode. `force` skips the hit check (refresh after a
    /// viewport change) but still participates in the in-flight protocol.
    pub fn get_or_decode<F>(
        &self,
        path: &Path,
        width: u32,
        force: bool,
        decode: F,
    ) -> Result<Arc<DynamicImage>, DecodeError>
    where
        F: FnOnce() -> Result<DynamicImage, DecodeError>,
    {
        let mut inner = self.inner.lock();
        loop {
            if !force {
                if let Some(entry) = inner.entries.get(path) {
                    if entry.width == width {
                        trace!(?path, "Pixbuf cache hit");
                        return Ok(entry.image.clone());
                    }
                }
            }
            if inner.in_flight.contains(path) {
                trace!(?path, "Waiting on in-flight decode");
                self.ready.wait(&mut inner);
            } else {
                break;
            }
        }
        inner.in_flight.insert(path.to_path_buf());
        drop(inner);

        let result = decode();

        let mut inner = self.inner.lock();
        inner.in_flight.remove(path);
        let out = result.map(|img| {
            let image = Arc::new(img);
            inner.seq += 1;
            let seq = inner.seq;
            inner.entries.insert(
                path.to_path_buf(),
                Entry {
                    image: image.clone(),
                    width,
                    seq,
                },
            );
            Self::evict(&mut inner);
            image
        });
        self.ready.notify_all();
        out
    }

    /// Peek without populating or waiting.
    pub fn contains(&self, path: &Path) -> bool {
        self.inner.lock().entries.contains_key(path)
    }

    /// Return the cached image regardless of its width, without decoding.
    /// A stale-width entry is still useful as an instant stand-in while the
    /// properly sized decode runs.
    pub fn get(&self, path: &Path) -> Option<Arc<DynamicImage>> {
        self.inner.lock().entries.get(path).map(|e| e.image.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wholesale clear (folder change, fullscreen toggle, zoom change).
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Drop the oldest half once the bound is exceeded.
    fn evict(inner: &mut Inner) {
        if inner.entries.len() <= CACHE_SIZE {
            return;
        }
        let mut seqs: Vec<u64> = inner.entries.values().map(|e| e.seq).collect();
        seqs.sort_unstable();
        // Everything at or below the cutoff goes; the newest half stays.
        let cutoff = seqs[seqs.len() - CACHE_SIZE / 2 - 1];
        inner.entries.retain(|_, e| e.seq > cutoff);
        trace!(retained = inner.entries.len(), "Batched eviction");
    }
}
