//! Persistent, content-addressed thumbnail cache.
//!
//! One cache root per configured height, mirroring the source directory
//! structure beneath it. Filenames embed an xxhash fingerprint of
//! (absolute path, mtime, height), so a changed mtime yields a different
//! filename and therefore a miss; the stale file simply becomes
//! unreferenced garbage. There is no index: existence of the file at the
//! computed path is proof of validity.
//!
//! Writes are atomic (temp file in the cache directory, then rename), so
//! readers never observe a partially-written thumbnail.

use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::DynamicImage;
use tracing::{debug, warn};
use walkdir::WalkDir;
use xxhash_rust::xxh3::xxh3_64;

use crate::cancel::CancellationToken;
use crate::config::SettingsHandle;
use crate::decode::ImageDecoder;
use crate::error::{DecodeError, ThumbError};
use crate::formats::{self, FormatClass};
use crate::thumbs::composer;

/// JPEG quality for thumbnail encoding (0-100).
const JPEG_QUALITY: u8 = 85;

/// Bump when thumbnail rendering semantics change.
const THUMB_CACHE_VERSION: u8 = 1;

/// Fingerprint of (absolute path, mtime, height), embedded in the cached
/// filename. Pure: the mtime is an input, not something this reads.
pub fn fingerprint(path: &Path, mtime: SystemTime, height: u32) -> u64 {
    let since_epoch = mtime.duration_since(UNIX_EPOCH).unwrap_or_default();
    let path_str = path.to_string_lossy();
    let mut data = Vec::with_capacity(path_str.len() + 17);
    data.push(THUMB_CACHE_VERSION);
    data.extend_from_slice(path_str.as_bytes());
    data.extend_from_slice(&since_epoch.as_secs().to_le_bytes());
    data.extend_from_slice(&since_epoch.subsec_nanos().to_le_bytes());
    data.extend_from_slice(&height.to_le_bytes());
    xxh3_64(&data)
}

pub struct ThumbnailCache {
    cache_root: PathBuf,
    decoder: Arc<ImageDecoder>,
    settings: SettingsHandle,
}

impl ThumbnailCache {
    pub fn new(cache_root: PathBuf, decoder: Arc<ImageDecoder>, settings: SettingsHandle) -> Self {
        if let Err(e) = std::fs::create_dir_all(&cache_root) {
            warn!(?cache_root, error = ?e, "Failed to create cache directory");
        }
        debug!(?cache_root, "Initialized thumbnail cache");
        Self {
            cache_root,
            decoder,
            settings,
        }
    }

    pub(crate) fn decoder(&self) -> &Arc<ImageDecoder> {
        &self.decoder
    }

    pub(crate) fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    fn thumb_height(&self) -> u32 {
        self.settings.read().thumb_height
    }

    /// Cache root for single-image thumbnails at `height`.
    pub fn thumbs_dir(&self, height: u32) -> PathBuf {
        self.cache_root.join(height.to_string())
    }

    /// Cache root for folder composites at `height`.
    pub fn folderthumbs_dir(&self, height: u32) -> PathBuf {
        self.cache_root.join(format!("folderthumbs_{height}"))
    }

    /// Computed cache path for a file's thumbnail. Pure, no I/O.
    ///
    /// Animated inputs serve as their own thumbnail (downstream rendering
    /// preserves the animation), unless `force_cache` asks for the real
    /// cached location (used when clearing).
    pub fn thumbnail_path(&self, path: &Path, mtime: SystemTime, force_cache: bool) -> PathBuf {
        if !force_cache && FormatClass::of(path) == Some(FormatClass::Animated) {
            return path.to_path_buf();
        }
        let height = self.thumb_height();
        let hash = fingerprint(path, mtime, height);
        let ext = if formats::prefers_png_thumbnail(path) {
            "png"
        } else {
            "jpg"
        };
        let name = format!(
            "{}_{:016x}.{}",
            path.file_name().unwrap_or_default().to_string_lossy(),
            hash,
            ext
        );
        // Mirror the original directory structure under the cache root.
        mirrored_dir(
            &self.thumbs_dir(height),
            path.parent().unwrap_or(Path::new("")),
        )
        .join(name)
    }

    /// Stat `path` and compute its cache location.
    pub fn thumbnail_path_for(&self, path: &Path, force_cache: bool) -> std::io::Result<PathBuf> {
        let mtime = std::fs::metadata(path)?.modified()?;
        Ok(self.thumbnail_path(path, mtime, force_cache))
    }

    /// Computed cache path for a folder composite. Pure, no I/O.
    pub fn folder_thumbnail_path(&self, folder: &Path, mtime: SystemTime) -> PathBuf {
        let height = self.thumb_height();
        let hash = fingerprint(folder, mtime, height);
        let name = format!(
            "{}_{:016x}.png",
            folder.file_name().unwrap_or_default().to_string_lossy(),
            hash
        );
        mirrored_dir(
            &self.folderthumbs_dir(height),
            folder.parent().unwrap_or(Path::new("")),
        )
        .join(name)
    }

    pub fn folder_thumbnail_path_for(&self, folder: &Path) -> std::io::Result<PathBuf> {
        let mtime = std::fs::metadata(folder)?.modified()?;
        Ok(self.folder_thumbnail_path(folder, mtime))
    }

    /// Render-and-persist a thumbnail unless the computed path already
    /// exists. Directories route to the folder composer; `Ok(None)` is the
    /// valid outcome for a folder without images.
    pub fn ensure(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<PathBuf>, ThumbError> {
        if cancel.is_cancelled() {
            return Err(ThumbError::Cancelled);
        }
        if path.is_dir() {
            let cached = self.folder_thumbnail_path_for(path)?;
            if cached.exists() {
                return Ok(Some(cached));
            }
            return composer::compose(self, path, &cached, cancel);
        }
        if FormatClass::of(path) == Some(FormatClass::Animated) {
            return Ok(Some(path.to_path_buf()));
        }
        let cached = self.thumbnail_path_for(path, false)?;
        self.render_to(path, &cached, width, height, |src, target| {
            self.decoder.decode(src, Some(target))
        })?;
        Ok(Some(cached))
    }

    /// Render `src` into `cached` through `render`, skipping the render
    /// entirely when the file already exists.
    fn render_to<F>(
        &self,
        src: &Path,
        cached: &Path,
        width: u32,
        height: u32,
        render: F,
    ) -> Result<(), ThumbError>
    where
        F: FnOnce(&Path, (u32, u32)) -> Result<DynamicImage, DecodeError>,
    {
        if cached.exists() {
            return Ok(());
        }
        if let Some(parent) = cached.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let img = render(src, (width, height))?;
        write_atomic(&img, cached, formats::prefers_png_thumbnail(src))
    }

    /// Delete this folder's thumbnails from the current height's cache
    /// root. Other heights are left untouched.
    pub fn clear_thumbnails(&self, folder: &Path) {
        let root = self.thumbs_dir(self.thumb_height());
        let mirror = mirrored_dir(&root, folder);
        for entry in WalkDir::new(&mirror)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .flatten()
        {
            let path = entry.path();
            if path.is_file() && path.starts_with(&root) {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(?path, error = ?e, "Could not delete cached thumbnail");
                }
            }
        }
    }
}

/// Append `dir`'s components (minus the root) to `root`.
fn mirrored_dir(root: &Path, dir: &Path) -> PathBuf {
    let mut out = root.to_path_buf();
    for comp in dir.components() {
        if let Component::Normal(c) = comp {
            out.push(c);
        }
    }
    out
}

/// Write to a temp file in the destination directory, then rename into
/// place. Partially-written thumbnails are never observable.
pub(crate) fn write_atomic(img: &DynamicImage, dest: &Path, png: bool) -> Result<(), ThumbError> {
    let dir = dest.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".lumo-thumb-")
        .tempfile_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        if png {
            img.to_rgba8()
                .write_with_encoder(PngEncoder::new(&mut writer))?;
        } else {
            img.to_rgb8()
                .write_with_encoder(JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY))?;
        }
        writer.flush()?;
    }
    tmp.persist(dest)?;
    debug!(?dest, "Saved thumbnail");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{settings_handle, Settings};
    use crate::metadata::MetadataStore;
    use image::{GenericImageView, ImageBuffer, Rgb};
    use std::cell::Cell;
    use std::time::Duration;

    fn make_cache(root: &Path, thumb_height: u32) -> ThumbnailCache {
        let settings = settings_handle(Settings {
            thumb_height,
            ..Settings::default()
        });
        let store = Arc::new(MetadataStore::new());
        let decoder = Arc::new(ImageDecoder::new(store, settings.clone()));
        ThumbnailCache::new(root.to_path_buf(), decoder, settings)
    }

    fn write_png(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
        let path = dir.join(name);
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(w, h, Rgb([200, 100, 50]));
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_path_is_stable_for_same_mtime() {
        let root = tempfile::tempdir().unwrap();
        let cache = make_cache(root.path(), 180);
        let mtime = UNIX_EPOCH + Duration::from_secs(1_000_000);
        let a = cache.thumbnail_path(Path::new("/pics/cat.jpg"), mtime, false);
        let b = cache.thumbnail_path(Path::new("/pics/cat.jpg"), mtime, false);
        assert_eq!(a, b);
        assert!(a.starts_with(cache.thumbs_dir(180)));
        assert!(a.to_string_lossy().ends_with(".jpg"));
        assert!(a.file_name().unwrap().to_string_lossy().starts_with("cat.jpg_"));
    }

    #[test]
    fn test_changed_mtime_changes_path() {
        let root = tempfile::tempdir().unwrap();
        let cache = make_cache(root.path(), 180);
        let a = cache.thumbnail_path(
            Path::new("/pics/cat.jpg"),
            UNIX_EPOCH + Duration::from_secs(1),
            false,
        );
        let b = cache.thumbnail_path(
            Path::new("/pics/cat.jpg"),
            UNIX_EPOCH + Duration::from_secs(2),
            false,
        );
        assert_ne!(a, b);
    }

    #[test]
    fn test_path_mirrors_source_structure() {
        let root = tempfile::tempdir().unwrap();
        let cache = make_cache(root.path(), 120);
        let p = cache.thumbnail_path(Path::new("/home/me/pics/cat.jpg"), UNIX_EPOCH, false);
        assert!(p.starts_with(cache.thumbs_dir(120).join("home/me/pics")));
    }

    #[test]
    fn test_png_extension_for_transparent_formats() {
        let root = tempfile::tempdir().unwrap();
        let cache = make_cache(root.path(), 180);
        let p = cache.thumbnail_path(Path::new("/pics/logo.png"), UNIX_EPOCH, false);
        assert!(p.to_string_lossy().ends_with(".png"));
    }

    #[test]
    fn test_animated_passthrough_and_force_cache() {
        let root = tempfile::tempdir().unwrap();
        let cache = make_cache(root.path(), 180);
        let src = Path::new("/pics/loop.gif");
        assert_eq!(cache.thumbnail_path(src, UNIX_EPOCH, false), src);
        let forced = cache.thumbnail_path(src, UNIX_EPOCH, true);
        assert!(forced.starts_with(cache.thumbs_dir(180)));
    }

    #[test]
    fn test_ensure_renders_and_is_idempotent() {
        let pics = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let src = write_png(pics.path(), "photo.png", 640, 480);
        let cache = make_cache(root.path(), 80);

        let cancel = CancellationToken::new();
        let thumb = cache.ensure(&src, 240, 80, &cancel).unwrap().unwrap();
        assert!(thumb.exists());
        let rendered = image::open(&thumb).unwrap();
        assert!(rendered.width() <= 240 && rendered.height() <= 80);
        // Aspect preserved: 640x480 into 240x80 -> 106x80.
        assert_eq!(rendered.dimensions().1, 80);

        // Second call finds the file and performs no second render.
        let calls = Cell::new(0);
        cache
            .render_to(&src, &thumb, 240, 80, |_, _| {
                calls.set(calls.get() + 1);
                Ok(DynamicImage::new_rgba8(1, 1))
            })
            .unwrap();
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let pics = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let src = write_png(pics.path(), "photo.png", 64, 48);
        let cache = make_cache(root.path(), 80);

        let thumb = cache
            .ensure(&src, 240, 80, &CancellationToken::new())
            .unwrap()
            .unwrap();
        let siblings: Vec<_> = std::fs::read_dir(thumb.parent().unwrap())
            .unwrap()
            .flatten()
            .collect();
        assert_eq!(siblings.len(), 1);
    }

    #[test]
    fn test_cancelled_ensure_writes_nothing() {
        let pics = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let src = write_png(pics.path(), "photo.png", 64, 48);
        let cache = make_cache(root.path(), 80);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = cache.ensure(&src, 240, 80, &cancel).unwrap_err();
        assert!(matches!(err, ThumbError::Cancelled));
        let cached = cache.thumbnail_path_for(&src, false).unwrap();
        assert!(!cached.exists());
    }

    #[test]
    fn test_ensure_empty_folder_is_none() {
        let pics = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let empty = pics.path().join("empty");
        std::fs::create_dir(&empty).unwrap();
        let cache = make_cache(root.path(), 80);

        let out = cache
            .ensure(&empty, 240, 80, &CancellationToken::new())
            .unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn test_clear_thumbnails_scoped_to_height_root() {
        let pics = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let src = write_png(pics.path(), "photo.png", 64, 48);
        let cancel = CancellationToken::new();

        let cache80 = make_cache(root.path(), 80);
        let cache120 = make_cache(root.path(), 120);
        let thumb80 = cache80.ensure(&src, 240, 80, &cancel).unwrap().unwrap();
        let thumb120 = cache120.ensure(&src, 360, 120, &cancel).unwrap().unwrap();
        assert!(thumb80.exists() && thumb120.exists());

        cache80.clear_thumbnails(pics.path());
        assert!(!thumb80.exists());
        assert!(thumb120.exists(), "other cache heights must be untouched");
    }
}
