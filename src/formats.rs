//! Format classification and folder listing.
//!
//! The decode fallback chain and the thumbnail file format both depend on a
//! coarse class computed once from the file extension, instead of scattered
//! extension checks at each call site.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

use crate::error::FolderUnreadable;

/// Camera raw extensions. Direct decoders frequently mis-decode or mis-size
/// raw sensor data, so these prefer their embedded previews.
static RAW_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "3fr", "ari", "arw", "bay", "braw", "crw", "cr2", "cr3", "cap", "dcs", "dcr", "dng",
        "drf", "eip", "erf", "fff", "gpr", "iiq", "k25", "kdc", "mdc", "mef", "mos", "mrw",
        "nef", "nrw", "obm", "orf", "pef", "ptx", "pxn", "r3d", "raf", "raw", "rwl", "rw2",
        "rwz", "sr2", "srf", "srw", "x3f",
    ]
    .into_iter()
    .collect()
});

static STANDARD_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "jpg", "jpeg", "jpe", "png", "webp", "bmp", "dib", "tiff", "tif", "pcx", "ppm", "pgm",
        "pbm", "psd", "xbm", "xpm",
    ]
    .into_iter()
    .collect()
});

/// Coarse format class driving decode-strategy order and thumbnail format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatClass {
    Raw,
    Standard,
    /// Looping formats that are used directly as their own thumbnail.
    Animated,
    Vector,
}

impl FormatClass {
    /// Classify a path by extension; `None` means not a supported image.
    pub fn of(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "gif" => Some(Self::Animated),
            "svg" => Some(Self::Vector),
            e if RAW_EXTENSIONS.contains(e) => Some(Self::Raw),
            e if STANDARD_EXTENSIONS.contains(e) => Some(Self::Standard),
            _ => None,
        }
    }
}

/// Thumbnails for these keep transparency or line art, so they are stored
/// as PNG instead of JPEG.
pub fn prefers_png_thumbnail(path: &Path) -> bool {
    match FormatClass::of(path) {
        Some(FormatClass::Animated) | Some(FormatClass::Vector) => true,
        _ => path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("png") || e.eq_ignore_ascii_case("xpm"))
            .unwrap_or(false),
    }
}

pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

/// Decide if something might be a supported image based on extension.
pub fn is_image(path: &Path) -> bool {
    path.is_file() && FormatClass::of(path).is_some()
}

/// Non-recursive listing of the images in a folder, unsorted.
pub fn list_images(folder: &Path, show_hidden: bool) -> Result<Vec<PathBuf>, FolderUnreadable> {
    Ok(list_entries(folder, show_hidden)?.0)
}

/// Non-recursive listing split into (images, subfolders).
pub fn list_entries(
    folder: &Path,
    show_hidden: bool,
) -> Result<(Vec<PathBuf>, Vec<PathBuf>), FolderUnreadable> {
    let entries = std::fs::read_dir(folder).map_err(|source| FolderUnreadable {
        path: folder.to_path_buf(),
        source,
    })?;

    let mut images = Vec::new();
    let mut folders = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !show_hidden && is_hidden(&path) {
            continue;
        }
        if path.is_dir() {
            folders.push(path);
        } else if is_image(&path) {
            images.push(path);
        }
    }
    Ok((images, folders))
}
