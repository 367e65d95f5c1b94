//! The top-level materialization pipeline.
//!
//! Owns every shared component (metadata store, decoder, pixbuf caches,
//! thumbnail cache and scheduler, prefetcher) and exposes the operations a
//! viewer front-end drives: fetch the displayed image, warm the neighbors,
//! switch folders, and feed user-activity hints to the background workers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use image::DynamicImage;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::config::{default_cache_root, settings_handle, Settings, SettingsHandle, SortBy, SortOrder};
use crate::decode::ImageDecoder;
use crate::error::{DecodeError, FolderUnreadable};
use crate::formats;
use crate::metadata::{ImageMetadata, MetadataStore};
use crate::pixcache::PixbufCache;
use crate::thumbs::scheduler::{Mode, ThumbSink, ThumbnailScheduler, UiState};
use crate::thumbs::ThumbnailCache;

/// A folder listing: images in display order plus subfolders.
pub struct FolderView {
    pub images: Vec<PathBuf>,
    pub folders: Vec<PathBuf>,
}

pub struct Pipeline {
    settings: SettingsHandle,
    store: Arc<MetadataStore>,
    decoder: Arc<ImageDecoder>,
    thumbs: Arc<ThumbnailCache>,
    scheduler: ThumbnailScheduler,
    unzoomed: Arc<PixbufCache>,
    zoomed: Arc<PixbufCache>,
    ui: Arc<UiState>,
    cancel: CancellationToken,
    viewport: Arc<Mutex<(u32, u32)>>,
    prefetch_tx: Option<flume::Sender<(PathBuf, bool)>>,
    prefetch_thread: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Build the pipeline with the platform cache location.
    pub fn new(settings: Settings, sink: Arc<dyn ThumbSink>) -> anyhow::Result<Self> {
        let root = default_cache_root()?;
        Ok(Self::with_cache_root(settings, root, sink))
    }

    pub fn with_cache_root(
        settings: Settings,
        cache_root: PathBuf,
        sink: Arc<dyn ThumbSink>,
    ) -> Self {
        let settings = settings_handle(settings);
        let store = Arc::new(MetadataStore::new());
        let decoder = Arc::new(ImageDecoder::new(store.clone(), settings.clone()));
        let thumbs = Arc::new(ThumbnailCache::new(
            cache_root,
            decoder.clone(),
            settings.clone(),
        ));
        let ui = Arc::new(UiState::new());
        let scheduler =
            ThumbnailScheduler::new(thumbs.clone(), settings.clone(), ui.clone(), sink);

        let unzoomed = Arc::new(PixbufCache::new());
        let zoomed = Arc::new(PixbufCache::new());
        let viewport = Arc::new(Mutex::new((0u32, 0u32)));

        let (prefetch_tx, rx) = flume::unbounded::<(PathBuf, bool)>();
        let prefetch_thread = {
            let decoder = decoder.clone();
            let store = store.clone();
            let settings = settings.clone();
            let unzoomed = unzoomed.clone();
            let zoomed = zoomed.clone();
            let viewport = viewport.clone();
            std::thread::Builder::new()
                .name("pix-prefetch".into())
                .spawn(move || {
                    for (path, zoom) in rx.iter() {
                        let cache = if zoom { &zoomed } else { &unzoomed };
                        if cache.contains(&path) {
                            continue;
                        }
                        let size = *viewport.lock();
                        let enlarge = settings.read().enlarge_smaller;
                        let target = decode_target(&store, &path, size, zoom, enlarge);
                        let width = cache_width(size, zoom);
                        let result = cache.get_or_decode(&path, width, false, || {
                            decoder.decode(&path, target)
                        });
                        if let Err(e) = result {
                            warn!(?path, error = %e, "Prefetch decode failed");
                        }
                    }
                })
                .ok()
        };

        Self {
            settings,
            store,
            decoder,
            thumbs,
            scheduler,
            unzoomed,
            zoomed,
            ui,
            cancel: CancellationToken::new(),
            viewport,
            prefetch_tx: Some(prefetch_tx),
            prefetch_thread,
        }
    }

    /// Decode (or fetch from cache) the image to display.
    ///
    /// `force` re-decodes even on a cache hit, used after a viewport
    /// change. Zoomed requests decode at full size; unzoomed requests fit
    /// the current viewport.
    pub fn get_pixbuf(
        &self,
        path: &Path,
        force: bool,
        zoomed: bool,
    ) -> Result<Arc<DynamicImage>, DecodeError> {
        let size = *self.viewport.lock();
        let enlarge = self.settings.read().enlarge_smaller;
        let target = decode_target(&self.store, path, size, zoomed, enlarge);
        let cache = self.pix_cache(zoomed);
        cache.get_or_decode(path, cache_width(size, zoomed), force, || {
            self.decoder.decode(path, target)
        })
    }

    /// Already-decoded image for `path`, if any. Never decodes.
    pub fn cached_pixbuf(&self, path: &Path, zoomed: bool) -> Option<Arc<DynamicImage>> {
        self.pix_cache(zoomed).get(path)
    }

    /// Queue the neighbors of `selected` for background decoding, nearest
    /// first.
    pub fn cache_around(&self, images: &[PathBuf], selected: &Path, zoomed: bool) {
        let Some(pos) = images.iter().position(|p| p == selected) else {
            return;
        };
        let Some(tx) = &self.prefetch_tx else { return };
        let cache = self.pix_cache(zoomed);
        for idx in [pos + 1, pos.wrapping_sub(1)] {
            if let Some(neighbor) = images.get(idx) {
                if !cache.contains(neighbor) {
                    let _ = tx.send((neighbor.clone(), zoomed));
                }
            }
        }
    }

    /// Enter `folder`: list and sort its contents, drop all per-folder
    /// caches, then queue thumbnail work with the images at the front.
    pub fn change_folder(&self, folder: &Path) -> Result<FolderView, FolderUnreadable> {
        let (show_hidden, show_folder_thumbs, sort_by, sort_order) = {
            let s = self.settings.read();
            (s.show_hidden, s.show_folder_thumbs, s.sort_by, s.sort_order)
        };
        let (mut images, mut folders) = formats::list_entries(folder, show_hidden)?;
        sort_paths(&mut images, sort_by, sort_order);
        folders.sort();
        debug!(?folder, images = images.len(), folders = folders.len(), "Changed folder");

        // Old entries must be gone before new work lands in the queue.
        self.store.clear();
        self.unzoomed.clear();
        self.zoomed.clear();
        self.scheduler.reset();

        self.scheduler.priority_thumbs(images.clone());
        if show_folder_thumbs {
            self.scheduler.enqueue(folders.clone());
        }
        Ok(FolderView { images, folders })
    }

    /// Re-order thumbnail production, visible rows first.
    pub fn priority_thumbs(&self, files: Vec<PathBuf>) {
        self.scheduler.priority_thumbs(files);
    }

    pub fn metadata(&self, path: &Path) -> ImageMetadata {
        self.store.get(path)
    }

    pub fn cached_metadata(&self, path: &Path) -> Option<ImageMetadata> {
        self.store.get_cached(path)
    }

    /// Record a navigation action; workers back off while these are recent.
    pub fn note_user_action(&self) {
        self.ui.note_action();
    }

    pub fn set_mode(&self, mode: Mode) {
        self.ui.set_mode(mode);
    }

    /// Update the display size. Cached unzoomed fits are stale afterwards.
    pub fn set_viewport(&self, width: u32, height: u32) {
        *self.viewport.lock() = (width, height);
        self.unzoomed.clear();
    }

    pub fn viewport(&self) -> (u32, u32) {
        *self.viewport.lock()
    }

    pub fn clear_unzoomed(&self) {
        self.unzoomed.clear();
    }

    /// Drop both zoom states' decoded images.
    pub fn clear_zoom_caches(&self) {
        self.unzoomed.clear();
        self.zoomed.clear();
    }

    pub fn clear_thumbnails(&self, folder: &Path) {
        self.thumbs.clear_thumbnails(folder);
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn thumbnail_cache(&self) -> &Arc<ThumbnailCache> {
        &self.thumbs
    }

    fn pix_cache(&self, zoomed: bool) -> &Arc<PixbufCache> {
        if zoomed {
            &self.zoomed
        } else {
            &self.unzoomed
        }
    }

    /// Stop all background work and wait for it. Idempotent.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        // Closing the channel ends the prefetcher's iteration.
        self.prefetch_tx.take();
        if let Some(handle) = self.prefetch_thread.take() {
            let _ = handle.join();
        }
        self.scheduler.stop();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cache key width for a request. Zoomed decodes are viewport-independent,
/// so they share one width bucket.
fn cache_width(viewport: (u32, u32), zoomed: bool) -> u32 {
    if zoomed {
        0
    } else {
        viewport.0
    }
}

/// Decode bound for a request. Zoomed requests are unbounded. Unzoomed
/// requests fit the viewport, clamped to the source dimensions when known
/// so small images stay small unless enlarging is on.
fn decode_target(
    store: &MetadataStore,
    path: &Path,
    viewport: (u32, u32),
    zoomed: bool,
    enlarge_smaller: bool,
) -> Option<(u32, u32)> {
    if zoomed {
        return None;
    }
    let (w, h) = viewport;
    if w == 0 || h == 0 {
        return None;
    }
    if enlarge_smaller {
        return Some((w, h));
    }
    let meta = store.get(path);
    if meta.width > 0 && meta.height > 0 {
        Some((w.min(meta.width), h.min(meta.height)))
    } else {
        Some((w, h))
    }
}

/// Sort a listing in place per the configured mode and direction.
fn sort_paths(paths: &mut [PathBuf], by: SortBy, order: SortOrder) {
    match by {
        SortBy::Name => paths.sort_by_key(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_default()
        }),
        SortBy::Date => paths.sort_by_key(|p| {
            std::fs::metadata(p)
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH)
        }),
        SortBy::Size => {
            paths.sort_by_key(|p| std::fs::metadata(p).map(|m| m.len()).unwrap_or(0))
        }
    }
    if order == SortOrder::Desc {
        paths.reverse();
    }
}
