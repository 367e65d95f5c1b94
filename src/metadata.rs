//! Per-file metadata with an in-memory cache.
//!
//! `MetadataStore::get` never fails: when the EXIF read errors out it falls
//! back to a minimal record built from a header-only dimension probe. The
//! cache lives until a folder change clears it wholesale. Concurrent
//! readers are fine; a read/insert race on the same key is tolerated since
//! both writers produce value-equal records.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use exif::{In, Tag};
use image::ImageReader;
use parking_lot::RwLock;
use tracing::{trace, warn};

/// EXIF orientation tag semantics (values 1 through 8, exiftool naming).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Normal,
    MirrorHorizontal,
    Rotate180,
    MirrorVertical,
    MirrorHorizontalRotate270,
    Rotate90,
    MirrorHorizontalRotate90,
    Rotate270,
}

impl Orientation {
    pub fn from_exif(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Normal),
            2 => Some(Self::MirrorHorizontal),
            3 => Some(Self::Rotate180),
            4 => Some(Self::MirrorVertical),
            5 => Some(Self::MirrorHorizontalRotate270),
            6 => Some(Self::Rotate90),
            7 => Some(Self::MirrorHorizontalRotate90),
            8 => Some(Self::Rotate270),
            _ => None,
        }
    }

    /// True for the 90/270 degree variants that swap width and height.
    pub fn needs_rotation(self) -> bool {
        matches!(
            self,
            Self::MirrorHorizontalRotate270
                | Self::Rotate90
                | Self::MirrorHorizontalRotate90
                | Self::Rotate270
        )
    }
}

/// One record per file path. `width`/`height` always reflect the displayed
/// orientation, never the raw stored one.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetadata {
    pub filename: String,
    pub width: u32,
    pub height: u32,
    pub orientation: Option<Orientation>,
    pub needs_rotation: bool,
    pub file_date: Option<SystemTime>,
    pub file_size: u64,
    pub exif: BTreeMap<String, String>,
}

/// EXIF keys surfaced to the UI.
const EXIF_KEYS: &[(Tag, &str)] = &[(Tag::DateTimeOriginal, "DateTimeOriginal")];

#[derive(Default)]
pub struct MetadataStore {
    cache: RwLock<HashMap<PathBuf, ImageMetadata>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (and cache) metadata for a path. Never fails: a failed EXIF
    /// read degrades to a minimal record with probed dimensions only.
    pub fn get(&self, path: &Path) -> ImageMetadata {
        if let Some(meta) = self.cache.read().get(path) {
            trace!(?path, "Metadata cache hit");
            return meta.clone();
        }

        let meta = match Self::read_full(path) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(?path, error = ?e, "Could not parse meta-info, using minimal record");
                Self::read_minimal(path)
            }
        };
        self.cache.write().insert(path.to_path_buf(), meta.clone());
        meta
    }

    /// Non-populating peek, for callers that only want already-warm data.
    pub fn get_cached(&self, path: &Path) -> Option<ImageMetadata> {
        self.cache.read().get(path).cloned()
    }

    /// Pre-populate an entry, used by background warmers.
    pub fn insert(&self, path: &Path, meta: ImageMetadata) {
        self.cache.write().insert(path.to_path_buf(), meta);
    }

    /// Drop all entries; called on folder navigation.
    pub fn clear(&self) {
        self.cache.write().clear();
    }

    fn read_full(path: &Path) -> anyhow::Result<ImageMetadata> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let exif_data = exif::Reader::new().read_from_container(&mut reader)?;

        let orientation = exif_data
            .get_field(Tag::Orientation, In::PRIMARY)
            .and_then(|f| f.value.get_uint(0))
            .and_then(Orientation::from_exif);
        let needs_rotation = orientation.map(Orientation::needs_rotation).unwrap_or(false);

        let mut exif = BTreeMap::new();
        for (tag, name) in EXIF_KEYS {
            if let Some(field) = exif_data.get_field(*tag, In::PRIMARY) {
                exif.insert((*name).to_string(), field.display_value().to_string());
            }
        }

        let (raw_w, raw_h) = Self::probe_dimensions(path);
        let (width, height) = if needs_rotation { (raw_h, raw_w) } else { (raw_w, raw_h) };
        let (file_date, file_size) = Self::stat(path);

        Ok(ImageMetadata {
            filename: Self::display_name(path),
            width,
            height,
            orientation,
            needs_rotation,
            file_date,
            file_size,
            exif,
        })
    }

    fn read_minimal(path: &Path) -> ImageMetadata {
        let (width, height) = Self::probe_dimensions(path);
        let (file_date, file_size) = Self::stat(path);
        ImageMetadata {
            filename: Self::display_name(path),
            width,
            height,
            orientation: None,
            needs_rotation: false,
            file_date,
            file_size,
            exif: BTreeMap::new(),
        }
    }

    /// Header-only size probe; (0, 0) marks an unreadable file.
    fn probe_dimensions(path: &Path) -> (u32, u32) {
        match ImageReader::open(path) {
            Ok(reader) => reader.into_dimensions().unwrap_or((0, 0)),
            Err(_) => (0, 0),
        }
    }

    fn stat(path: &Path) -> (Option<SystemTime>, u64) {
        match std::fs::metadata(path) {
            Ok(meta) => (meta.modified().ok(), meta.len()),
            Err(_) => (None, 0),
        }
    }

    fn display_name(path: &Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn write_png(dir: &Path, name: &str, w: u32, h: u32) -> PathBuf {
        let path = dir.join(name);
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(w, h, Rgb([10, 20, 30]));
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_orientation_values_roundtrip() {
        for v in 1..=8 {
            assert!(Orientation::from_exif(v).is_some());
        }
        assert!(Orientation::from_exif(0).is_none());
        assert!(Orientation::from_exif(9).is_none());
    }

    #[test]
    fn test_needs_rotation_only_for_quarter_turns() {
        assert!(!Orientation::Normal.needs_rotation());
        assert!(!Orientation::MirrorHorizontal.needs_rotation());
        assert!(!Orientation::Rotate180.needs_rotation());
        assert!(!Orientation::MirrorVertical.needs_rotation());
        assert!(Orientation::MirrorHorizontalRotate270.needs_rotation());
        assert!(Orientation::Rotate90.needs_rotation());
        assert!(Orientation::MirrorHorizontalRotate90.needs_rotation());
        assert!(Orientation::Rotate270.needs_rotation());
    }

    #[test]
    fn test_fallback_record_for_plain_png() {
        // PNGs carry no EXIF container, so this exercises the minimal path.
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "plain.png", 31, 17);

        let store = MetadataStore::new();
        let meta = store.get(&path);
        assert_eq!((meta.width, meta.height), (31, 17));
        assert_eq!(meta.orientation, None);
        assert!(!meta.needs_rotation);
        assert!(meta.exif.is_empty());
        assert!(meta.file_size > 0);
        assert_eq!(meta.filename, "plain.png");
    }

    #[test]
    fn test_cache_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "a.png", 4, 4);

        let store = MetadataStore::new();
        assert!(store.get_cached(&path).is_none());
        let first = store.get(&path);
        assert_eq!(store.get_cached(&path), Some(first));
        store.clear();
        assert!(store.get_cached(&path).is_none());
    }

    #[test]
    fn test_unreadable_file_still_yields_record() {
        let store = MetadataStore::new();
        let meta = store.get(Path::new("/nonexistent/nope.jpg"));
        assert_eq!((meta.width, meta.height), (0, 0));
        assert_eq!(meta.file_size, 0);
    }
}
