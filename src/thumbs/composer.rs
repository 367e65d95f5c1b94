//! Folder montage thumbnails.
//!
//! A folder's thumbnail is a single strip built from a sample of its
//! images: shuffle the listing with a fixed seed (the same folder always
//! produces the same sampling order), lay the per-image thumbnails out
//! left-to-right with a fixed margin, stop when the strip is full, crop to
//! the used width and persist as PNG.

use std::path::{Path, PathBuf};

use image::{imageops, DynamicImage, GenericImageView, RgbaImage};
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::error::ThumbError;
use crate::formats;
use crate::thumbs::cache::{write_atomic, ThumbnailCache};

/// Bound on the montage's content width.
pub const MAX_COMPOSITE_WIDTH: u32 = 400;

/// At most this many children are sampled.
const MAX_IMAGES: usize = 20;

/// Horizontal gap between pasted tiles.
const MARGIN: u32 = 8;

/// Fixed seed: composites must be reproducible across runs.
const SHUFFLE_SEED: u64 = 1234;

/// Height of a single tile inside the montage.
pub fn folder_tile_height(thumb_height: u32) -> u32 {
    (thumb_height / 4).max(1)
}

/// Deterministically shuffle the candidate listing.
fn sample_order(images: &mut [PathBuf]) {
    fastrand::Rng::with_seed(SHUFFLE_SEED).shuffle(images);
}

/// Build the montage for `folder` and persist it at `dest`.
///
/// `Ok(None)` means the folder holds no composable images, a valid
/// non-error terminal state. The cancellation token is checked between
/// children, since one composite can span many decodes.
pub fn compose(
    cache: &ThumbnailCache,
    folder: &Path,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<Option<PathBuf>, ThumbError> {
    let (thumb_height, show_hidden) = {
        let s = cache.settings().read();
        (s.thumb_height, s.show_hidden)
    };

    let mut images = formats::list_images(folder, show_hidden)?;
    if images.is_empty() {
        return Ok(None);
    }
    sample_order(&mut images);

    let tile_h = folder_tile_height(thumb_height);
    let canvas_w = MAX_COMPOSITE_WIDTH + 100;
    let mut canvas = RgbaImage::new(canvas_w, tile_h);
    let mut used_width: u32 = 0;

    for child in images.iter().take(MAX_IMAGES) {
        if cancel.is_cancelled() {
            return Err(ThumbError::Cancelled);
        }
        let tile = match render_tile(cache, child, thumb_height, tile_h, cancel) {
            Ok(tile) => tile,
            Err(ThumbError::Cancelled) => return Err(ThumbError::Cancelled),
            Err(e) => {
                warn!(?child, error = %e, "Skipping failed montage child");
                continue;
            }
        };
        let (w, _) = tile.dimensions();
        if used_width + MARGIN + w > canvas_w {
            break;
        }
        imageops::replace(&mut canvas, &tile.to_rgba8(), used_width as i64, 0);
        used_width += MARGIN + w;
    }

    if used_width == 0 {
        return Ok(None);
    }

    let cropped = DynamicImage::ImageRgba8(canvas).crop_imm(
        0,
        0,
        used_width.min(MAX_COMPOSITE_WIDTH),
        tile_h,
    );
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_atomic(&cropped, dest, true)?;
    debug!(?folder, ?dest, used_width, "Composed folder thumbnail");
    Ok(Some(dest.to_path_buf()))
}

/// Fetch (or lazily render) the child's own thumbnail, then fit it to the
/// montage tile box.
fn render_tile(
    cache: &ThumbnailCache,
    child: &Path,
    thumb_height: u32,
    tile_h: u32,
    cancel: &CancellationToken,
) -> Result<DynamicImage, ThumbError> {
    let thumb = cache
        .ensure(child, 3 * thumb_height, thumb_height, cancel)?
        .ok_or_else(|| ThumbError::Write(std::io::Error::other("no thumbnail for child")))?;
    Ok(cache
        .decoder()
        .decode(&thumb, Some((MAX_COMPOSITE_WIDTH, tile_h)))?)
}
