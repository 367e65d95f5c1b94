//! Multi-strategy image decoding.
//!
//! Three strategies are tried in a format-dependent order:
//!
//! - direct decode (`image::open`, or a full rawler develop for raw files),
//! - embedded-preview extraction (rawler preview/thumbnail payloads),
//! - a tolerant decode that sniffs the real format, ignoring the extension.
//!
//! Raw files prefer their embedded previews because direct decoders
//! frequently mis-decode or mis-size raw sensor data; ordinary formats
//! prefer direct decode since their embedded previews, when present at
//! all, can be wrong. Vector inputs have no bitmap to decode and are
//! rasterized through resvg in the direct slot instead. Orientation
//! correction happens after decode but before the final scale-down, with
//! a second resize pass because a quarter-turn can swap the aspect ratio.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader};
use tracing::{debug, trace};

use crate::config::SettingsHandle;
use crate::error::DecodeError;
use crate::formats::FormatClass;
use crate::metadata::{MetadataStore, Orientation};

pub struct ImageDecoder {
    store: Arc<MetadataStore>,
    settings: SettingsHandle,
}

impl ImageDecoder {
    pub fn new(store: Arc<MetadataStore>, settings: SettingsHandle) -> Self {
        Self { store, settings }
    }

    pub fn metadata_store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// Decode `path`, optionally bounded by a `(width, height)` box.
    ///
    /// The result is orientation-corrected and fits entirely inside the box
    /// (aspect preserved, never cropped). Sources smaller than the box are
    /// only upscaled when the `enlarge_smaller` setting is on.
    pub fn decode(
        &self,
        path: &Path,
        target: Option<(u32, u32)>,
    ) -> Result<DynamicImage, DecodeError> {
        let class = FormatClass::of(path);
        let orientation = self.store.get(path).orientation;

        let img = run_strategies(
            path,
            class,
            || direct_decode(path, class, target),
            || embedded_preview(path, target),
            || tolerant_decode(path),
        )?;

        let enlarge = self.settings.read().enlarge_smaller;
        Ok(finish(img, orientation, target, enlarge))
    }
}

/// Run the strategies in class-dependent order, returning the first success.
fn run_strategies<D, P, T>(
    path: &Path,
    class: Option<FormatClass>,
    direct: D,
    preview: P,
    tolerant: T,
) -> Result<DynamicImage, DecodeError>
where
    D: Fn() -> anyhow::Result<DynamicImage>,
    P: Fn() -> anyhow::Result<DynamicImage>,
    T: Fn() -> anyhow::Result<DynamicImage>,
{
    let ordered: [(&str, &dyn Fn() -> anyhow::Result<DynamicImage>); 3] =
        if class == Some(FormatClass::Raw) {
            [("preview", &preview), ("direct", &direct), ("tolerant", &tolerant)]
        } else {
            [("direct", &direct), ("preview", &preview), ("tolerant", &tolerant)]
        };

    let mut last = String::new();
    for (name, attempt) in ordered {
        match attempt() {
            Ok(img) => {
                trace!(?path, strategy = name, "Decoded");
                return Ok(img);
            }
            Err(e) => {
                debug!(?path, strategy = name, error = %e, "Decode strategy failed");
                last = e.to_string();
            }
        }
    }
    Err(DecodeError::AllStrategiesFailed {
        path: path.to_path_buf(),
        last,
    })
}

fn direct_decode(
    path: &Path,
    class: Option<FormatClass>,
    target: Option<(u32, u32)>,
) -> anyhow::Result<DynamicImage> {
    match class {
        Some(FormatClass::Raw) => {
            let raw = rawler::decode_file(path)?;
            let develop = rawler::imgop::develop::RawDevelop::default();
            let intermediate = develop.develop_intermediate(&raw)?;
            intermediate
                .to_dynamic_image()
                .ok_or_else(|| anyhow::anyhow!("raw develop produced invalid image"))
        }
        Some(FormatClass::Vector) => rasterize_svg(path, target),
        _ => Ok(image::open(path)?),
    }
}

/// Fallback raster size for an SVG when no target is requested.
const SVG_RASTER_SIZE: u32 = 512;

/// Rasterize an SVG with its longest side scaled to the target bound.
/// Vectors have no native resolution, so this upscales freely regardless
/// of the `enlarge_smaller` setting.
fn rasterize_svg(path: &Path, target: Option<(u32, u32)>) -> anyhow::Result<DynamicImage> {
    use resvg::tiny_skia;
    use resvg::usvg::{self, TreeParsing, TreeTextToPath};

    let data = std::fs::read(path)?;
    let mut tree = usvg::Tree::from_data(&data, &usvg::Options::default())?;
    let mut fontdb = usvg::fontdb::Database::new();
    fontdb.load_system_fonts();
    tree.convert_text(&fontdb);
    let rtree = resvg::Tree::from_usvg(&tree);

    let bound = target.map(|(w, h)| w.max(h)).unwrap_or(SVG_RASTER_SIZE).max(1);
    let size = if rtree.size.width() > rtree.size.height() {
        rtree.size.to_int_size().scale_to_width(bound)
    } else {
        rtree.size.to_int_size().scale_to_height(bound)
    }
    .ok_or_else(|| anyhow::anyhow!("svg has a degenerate size"))?;

    let transform = tiny_skia::Transform::from_scale(
        size.width() as f32 / rtree.size.width(),
        size.height() as f32 / rtree.size.height(),
    );
    let mut pixmap = tiny_skia::Pixmap::new(size.width(), size.height())
        .ok_or_else(|| anyhow::anyhow!("could not allocate pixmap"))?;
    rtree.render(transform, &mut pixmap.as_mut());

    let (w, h) = (pixmap.width(), pixmap.height());
    image::RgbaImage::from_raw(w, h, pixmap.take())
        .map(DynamicImage::ImageRgba8)
        .ok_or_else(|| anyhow::anyhow!("pixmap buffer size mismatch"))
}

/// Extract the best-fitting embedded preview.
fn embedded_preview(path: &Path, target: Option<(u32, u32)>) -> anyhow::Result<DynamicImage> {
    let source = rawler::rawsource::RawSource::new(path)?;
    let decoder = rawler::get_decoder(&source)?;
    let params = rawler::decoders::RawDecodeParams::default();

    let mut previews = Vec::new();
    if let Ok(Some(img)) = decoder.preview_image(&source, &params) {
        previews.push(img);
    }
    if let Ok(Some(img)) = decoder.thumbnail_image(&source, &params) {
        previews.push(img);
    }
    if let Ok(Some(img)) = decoder.full_image(&source, &params) {
        previews.push(img);
    }

    pick_preview(previews, target).ok_or_else(|| anyhow::anyhow!("no embedded previews"))
}

/// Slow path: sniff the content, ignoring a possibly-lying extension.
fn tolerant_decode(path: &Path) -> anyhow::Result<DynamicImage> {
    let file = File::open(path)?;
    let reader = ImageReader::new(BufReader::new(file)).with_guessed_format()?;
    Ok(reader.decode()?)
}

/// Pick the smallest preview that still meets the requested size, else the
/// single largest available.
fn pick_preview(previews: Vec<DynamicImage>, target: Option<(u32, u32)>) -> Option<DynamicImage> {
    if previews.is_empty() {
        return None;
    }
    if let Some((w, h)) = target {
        if let Some(best) = previews
            .iter()
            .filter(|p| p.width() >= w && p.height() >= h)
            .min_by_key(|p| p.width())
        {
            let best = best.clone();
            return Some(best);
        }
    }
    previews.into_iter().max_by_key(|p| p.width())
}

/// Orientation correction, then bounding-box fitting.
///
/// Pre-scales to the bounding square before rotating so the rotation works
/// on a smaller buffer, then re-checks against the box since the rotation
/// may have swapped the aspect ratio.
fn finish(
    img: DynamicImage,
    orientation: Option<Orientation>,
    target: Option<(u32, u32)>,
    enlarge_smaller: bool,
) -> DynamicImage {
    let Some((w, h)) = target else {
        return apply_orientation(img, orientation);
    };

    let side = w.max(h).max(1);
    let mut img = if img.width() > side || img.height() > side {
        img.resize(side, side, FilterType::CatmullRom)
    } else {
        img
    };
    img = apply_orientation(img, orientation);

    let (cw, ch) = img.dimensions();
    if cw > w || ch > h {
        img.resize(w.max(1), h.max(1), FilterType::CatmullRom)
    } else if enlarge_smaller && cw < w && ch < h {
        img.resize(w, h, FilterType::CatmullRom)
    } else {
        img
    }
}

/// Apply the transform that undoes a stored EXIF orientation.
pub fn apply_orientation(img: DynamicImage, orientation: Option<Orientation>) -> DynamicImage {
    match orientation {
        None | Some(Orientation::Normal) => img,
        Some(Orientation::MirrorHorizontal) => img.fliph(),
        Some(Orientation::Rotate180) => img.rotate180(),
        Some(Orientation::MirrorVertical) => img.flipv(),
        Some(Orientation::MirrorHorizontalRotate270) => img.fliph().rotate270(),
        Some(Orientation::Rotate90) => img.rotate90(),
        Some(Orientation::MirrorHorizontalRotate90) => img.fliph().rotate90(),
        Some(Orientation::Rotate270) => img.rotate270(),
    }
}
