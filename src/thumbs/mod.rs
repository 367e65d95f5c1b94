//! Thumbnail production: the persistent cache, folder montages and the
//! background worker pool that fills them.

pub mod cache;
pub mod composer;
pub mod scheduler;

pub use cache::{fingerprint, ThumbnailCache};
pub use composer::{folder_tile_height, MAX_COMPOSITE_WIDTH};
pub use scheduler::{Mode, ThumbSink, ThumbnailScheduler, UiState};
