//! lumo: image materialization for a folder-browsing viewer.
//!
//! Turns files on disk into display-ready pixels: a multi-strategy decoder
//! with EXIF orientation correction, bounded in-memory caches for the
//! decoded images, a persistent content-addressed thumbnail cache with
//! folder montages, and a background worker pool that fills it without
//! getting in the foreground's way. [`Pipeline`] ties it all together.

pub mod cancel;
pub mod config;
pub mod decode;
pub mod error;
pub mod formats;
pub mod metadata;
pub mod pipeline;
pub mod pixcache;
pub mod thumbs;

pub use cancel::CancellationToken;
pub use config::{Settings, SettingsHandle, SortBy, SortOrder, THUMB_HEIGHTS};
pub use decode::ImageDecoder;
pub use error::{DecodeError, FolderUnreadable, ThumbError};
pub use metadata::{ImageMetadata, MetadataStore, Orientation};
pub use pipeline::{FolderView, Pipeline};
pub use pixcache::PixbufCache;
pub use thumbs::{Mode, ThumbSink, ThumbnailCache, ThumbnailScheduler, UiState};
