//! Background thumbnail production.
//!
//! A small pool of worker threads drains a re-prioritizable queue of
//! paths (files and folders), renders each through the persistent cache
//! and hands results to a [`ThumbSink`]. The pool yields to the
//! foreground: while the viewer is in image mode and the user is
//! actively navigating, workers pause so decodes for the displayed image
//! win the CPU.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::cancel::CancellationToken;
use crate::config::SettingsHandle;
use crate::error::ThumbError;
use crate::formats;
use crate::thumbs::cache::ThumbnailCache;

/// Workers pause while the user acted within this window (image mode).
const ACTION_COOLDOWN: Duration = Duration::from_secs(1);

/// Startup grace period before thumbnailing competes with first paint.
const STARTUP_DELAY: Duration = Duration::from_secs(2);

/// What the viewer is currently showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Image,
    Folder,
}

/// Foreground activity the workers yield to.
pub struct UiState {
    last_action: Mutex<Instant>,
    mode: Mutex<Mode>,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            last_action: Mutex::new(Instant::now()),
            mode: Mutex::new(Mode::Folder),
        }
    }
}

impl UiState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_action(&self) {
        *self.last_action.lock() = Instant::now();
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock() = mode;
    }

    pub fn mode(&self) -> Mode {
        *self.mode.lock()
    }

    pub fn since_last_action(&self) -> Duration {
        self.last_action.lock().elapsed()
    }
}

/// Consumer of finished thumbnails. Implementations must tolerate calls
/// from the scheduler's result thread.
pub trait ThumbSink: Send + Sync {
    /// A thumbnail is available, or `None` for a folder with no images.
    fn on_thumb_ready(&self, path: &Path, thumb: Option<&Path>);

    fn on_thumb_failed(&self, path: &Path, reason: &str);
}

enum Outcome {
    Ready(Option<PathBuf>),
    Failed(String),
    Cancelled,
}

struct TaskResult {
    path: PathBuf,
    outcome: Outcome,
}

/// The queue plus the bookkeeping that makes re-prioritization and
/// dedup possible.
#[derive(Default)]
struct QueueState {
    queue: Vec<PathBuf>,
    processing: HashSet<PathBuf>,
    completed: HashSet<PathBuf>,
}

impl QueueState {
    /// Move `files` to the head of the queue, in their given order.
    ///
    /// The head entries bypass the completed filter: an explicit priority
    /// request re-renders even previously finished items (their cache hit
    /// makes the re-run cheap). The remainder keeps its relative order.
    fn prioritize(&mut self, files: Vec<PathBuf>) {
        let head: HashSet<&PathBuf> = files.iter().collect();
        let rest: Vec<PathBuf> = std::mem::take(&mut self.queue)
            .into_iter()
            .filter(|p| !head.contains(p) && !self.completed.contains(p))
            .collect();
        self.queue = files;
        self.queue.extend(rest);
    }

    /// Add to the tail, skipping anything queued, running or done.
    fn append(&mut self, paths: Vec<PathBuf>) {
        for p in paths {
            if !self.queue.contains(&p)
                && !self.processing.contains(&p)
                && !self.completed.contains(&p)
            {
                self.queue.push(p);
            }
        }
    }

    fn claim(&mut self) -> Option<PathBuf> {
        if self.queue.is_empty() {
            return None;
        }
        let path = self.queue.remove(0);
        self.processing.insert(path.clone());
        Some(path)
    }

    fn complete(&mut self, path: &Path) {
        self.processing.remove(path);
        self.completed.insert(path.to_path_buf());
    }

    fn reset(&mut self) {
        self.queue.clear();
        self.completed.clear();
    }
}

struct Shared {
    state: Mutex<QueueState>,
    work_ready: Condvar,
    cancel: CancellationToken,
    ui: Arc<UiState>,
    cache: Arc<ThumbnailCache>,
    settings: SettingsHandle,
}

pub struct ThumbnailScheduler {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    result_loop: Option<JoinHandle<()>>,
}

impl ThumbnailScheduler {
    pub fn new(
        cache: Arc<ThumbnailCache>,
        settings: SettingsHandle,
        ui: Arc<UiState>,
        sink: Arc<dyn ThumbSink>,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState::default()),
            work_ready: Condvar::new(),
            cancel: CancellationToken::new(),
            ui,
            cache,
            settings,
        });

        let pool_size = std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1);
        debug!(pool_size, "Starting thumbnail workers");

        let (tx, rx) = flume::unbounded::<TaskResult>();
        let mut workers = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            let shared = Arc::clone(&shared);
            let tx = tx.clone();
            match std::thread::Builder::new()
                .name(format!("thumb-worker-{i}"))
                .spawn(move || worker_loop(shared, tx))
            {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!(error = ?e, "Could not spawn thumbnail worker"),
            }
        }
        drop(tx);

        let result_loop = std::thread::Builder::new()
            .name("thumb-results".into())
            .spawn(move || {
                for res in rx.iter() {
                    match res.outcome {
                        Outcome::Ready(thumb) => sink.on_thumb_ready(&res.path, thumb.as_deref()),
                        Outcome::Failed(reason) => sink.on_thumb_failed(&res.path, &reason),
                        Outcome::Cancelled => {}
                    }
                }
            })
            .ok();

        Self {
            shared,
            workers,
            result_loop,
        }
    }

    /// Jump `files` to the front of the queue.
    pub fn priority_thumbs(&self, files: Vec<PathBuf>) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        let mut state = self.shared.state.lock();
        state.prioritize(files);
        trace!(queued = state.queue.len(), "Re-prioritized thumbnail queue");
        drop(state);
        self.shared.work_ready.notify_all();
    }

    /// Append `paths` to the queue tail (used for subfolder composites).
    pub fn enqueue(&self, paths: Vec<PathBuf>) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        let mut state = self.shared.state.lock();
        state.append(paths);
        drop(state);
        self.shared.work_ready.notify_all();
    }

    /// Forget queued and completed work. Tasks already claimed by a
    /// worker finish normally.
    pub fn reset(&self) {
        self.shared.state.lock().reset();
    }

    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Stop workers and wait for them. Idempotent.
    pub fn stop(&mut self) {
        self.shared.cancel.cancel();
        self.shared.state.lock().queue.clear();
        self.shared.work_ready.notify_all();
        for handle in std::mem::take(&mut self.workers) {
            if handle.join().is_err() {
                warn!("Thumbnail worker panicked");
            }
        }
        if let Some(handle) = self.result_loop.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ThumbnailScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: Arc<Shared>, tx: flume::Sender<TaskResult>) {
    // Give the first image paint a head start after launch.
    let started = Instant::now();
    while started.elapsed() < STARTUP_DELAY
        && shared.ui.mode() == Mode::Image
        && !shared.cancel.is_cancelled()
    {
        std::thread::sleep(Duration::from_millis(100));
    }

    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        // Yield to foreground navigation.
        if shared.ui.mode() == Mode::Image && shared.ui.since_last_action() < ACTION_COOLDOWN {
            std::thread::sleep(Duration::from_millis(200));
            continue;
        }

        let claimed = {
            let mut state = shared.state.lock();
            match state.claim() {
                Some(path) => Some(path),
                None => {
                    shared
                        .work_ready
                        .wait_for(&mut state, Duration::from_millis(500));
                    None
                }
            }
        };
        let Some(path) = claimed else { continue };

        let outcome = run_task(&shared, &path);
        shared.state.lock().complete(&path);
        if tx.send(TaskResult { path, outcome }).is_err() {
            break;
        }
    }
}

fn run_task(shared: &Shared, path: &Path) -> Outcome {
    if shared.cancel.is_cancelled() {
        return Outcome::Cancelled;
    }
    if !path.exists() {
        return Outcome::Failed("file no longer exists".into());
    }
    if !path.is_dir() && !formats::is_image(path) {
        return Outcome::Failed("not an image".into());
    }
    let height = shared.settings.read().thumb_height;
    match shared.cache.ensure(path, 3 * height, height, &shared.cancel) {
        Ok(thumb) => Outcome::Ready(thumb),
        Err(ThumbError::Cancelled) => Outcome::Cancelled,
        Err(e) => {
            warn!(?path, error = %e, "Thumbnail failed");
            Outcome::Failed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{settings_handle, Settings};
    use crate::decode::ImageDecoder;
    use crate::metadata::MetadataStore;
    use image::{ImageBuffer, Rgb};

    fn queue_of(paths: &[&str]) -> QueueState {
        QueueState {
            queue: paths.iter().map(PathBuf::from).collect(),
            ..QueueState::default()
        }
    }

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_prioritize_moves_to_head_keeping_remainder_order() {
        let mut state = queue_of(&["a", "b", "d"]);
        state.prioritize(paths(&["b", "c"]));
        assert_eq!(state.queue, paths(&["b", "c", "a", "d"]));
    }

    #[test]
    fn test_prioritize_filters_completed_from_remainder_only() {
        let mut state = queue_of(&["a", "b", "d"]);
        state.completed.insert(PathBuf::from("a"));
        state.completed.insert(PathBuf::from("b"));
        state.prioritize(paths(&["b", "c"]));
        // "b" survives at the head despite being completed; "a" does not.
        assert_eq!(state.queue, paths(&["b", "c", "d"]));
    }

    #[test]
    fn test_append_skips_known_paths() {
        let mut state = queue_of(&["a"]);
        state.processing.insert(PathBuf::from("b"));
        state.completed.insert(PathBuf::from("c"));
        state.append(paths(&["a", "b", "c", "d"]));
        assert_eq!(state.queue, paths(&["a", "d"]));
    }

    #[test]
    fn test_claim_and_complete() {
        let mut state = queue_of(&["a", "b"]);
        let first = state.claim().unwrap();
        assert_eq!(first, PathBuf::from("a"));
        assert!(state.processing.contains(&first));
        state.complete(&first);
        assert!(!state.processing.contains(&first));
        assert!(state.completed.contains(&first));
        assert_eq!(state.queue, paths(&["b"]));
    }

    struct ChannelSink(flume::Sender<(PathBuf, Result<Option<PathBuf>, String>)>);

    impl ThumbSink for ChannelSink {
        fn on_thumb_ready(&self, path: &Path, thumb: Option<&Path>) {
            let _ = self.0.send((path.to_path_buf(), Ok(thumb.map(Path::to_path_buf))));
        }

        fn on_thumb_failed(&self, path: &Path, reason: &str) {
            let _ = self.0.send((path.to_path_buf(), Err(reason.to_string())));
        }
    }

    fn make_scheduler(
        root: &Path,
        ui: Arc<UiState>,
    ) -> (
        ThumbnailScheduler,
        flume::Receiver<(PathBuf, Result<Option<PathBuf>, String>)>,
    ) {
        let settings = settings_handle(Settings {
            thumb_height: 80,
            ..Settings::default()
        });
        let store = Arc::new(MetadataStore::new());
        let decoder = Arc::new(ImageDecoder::new(store, settings.clone()));
        let cache = Arc::new(ThumbnailCache::new(
            root.to_path_buf(),
            decoder,
            settings.clone(),
        ));
        let (tx, rx) = flume::unbounded();
        let scheduler = ThumbnailScheduler::new(cache, settings, ui, Arc::new(ChannelSink(tx)));
        (scheduler, rx)
    }

    fn write_test_png(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(64, 48, Rgb([80, 0, 0]));
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_scheduler_produces_thumbnails() {
        let pics = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let mut sources = Vec::new();
        for i in 0..3 {
            sources.push(write_test_png(pics.path(), &format!("img{i}.png")));
        }

        let (mut scheduler, rx) = make_scheduler(root.path(), Arc::new(UiState::new()));
        scheduler.priority_thumbs(sources.clone());

        let mut seen = HashSet::new();
        for _ in 0..3 {
            let (path, result) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
            let thumb = result.unwrap().unwrap();
            assert!(thumb.exists());
            seen.insert(path);
        }
        assert_eq!(seen, sources.into_iter().collect());
        scheduler.stop();
    }

    #[test]
    fn test_scheduler_reports_failures() {
        let root = tempfile::tempdir().unwrap();
        let (mut scheduler, rx) = make_scheduler(root.path(), Arc::new(UiState::new()));
        scheduler.priority_thumbs(vec![PathBuf::from("/no/such/file.jpg")]);

        let (path, result) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(path, PathBuf::from("/no/such/file.jpg"));
        assert!(result.is_err());
        scheduler.stop();
    }

    #[test]
    fn test_scheduler_empty_folder_reports_none() {
        let pics = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let empty = pics.path().join("empty");
        std::fs::create_dir(&empty).unwrap();

        let (mut scheduler, rx) = make_scheduler(root.path(), Arc::new(UiState::new()));
        scheduler.enqueue(vec![empty.clone()]);

        let (path, result) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(path, empty);
        assert_eq!(result.unwrap(), None);
        scheduler.stop();
    }

    #[test]
    fn test_image_mode_cooldown_defers_work() {
        let pics = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let src = write_test_png(pics.path(), "img.png");

        let ui = Arc::new(UiState::new());
        let (mut scheduler, rx) = make_scheduler(root.path(), ui.clone());

        ui.set_mode(Mode::Image);
        ui.note_action();
        // Let idle workers park on the condvar before the queue fills.
        std::thread::sleep(Duration::from_millis(50));
        ui.note_action();
        scheduler.priority_thumbs(vec![src.clone()]);

        // Nothing may complete while the action is fresh.
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());

        // Once the cooldown lapses the task runs to completion.
        let (path, result) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(path, src);
        assert!(result.unwrap().unwrap().exists());
        scheduler.stop();
    }

    #[test]
    fn test_startup_grace_in_image_mode() {
        let pics = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let src = write_test_png(pics.path(), "img.png");

        let ui = Arc::new(UiState::new());
        ui.set_mode(Mode::Image);
        let (mut scheduler, rx) = make_scheduler(root.path(), ui.clone());
        scheduler.priority_thumbs(vec![src.clone()]);

        // Workers hold off for the whole grace period while in image mode.
        assert!(rx.recv_timeout(Duration::from_millis(800)).is_err());

        // Leaving image mode releases them immediately.
        ui.set_mode(Mode::Folder);
        let (path, result) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(path, src);
        assert!(result.unwrap().unwrap().exists());
        scheduler.stop();
    }

    #[test]
    fn test_stop_is_idempotent_and_rejects_new_work() {
        let root = tempfile::tempdir().unwrap();
        let (mut scheduler, _rx) = make_scheduler(root.path(), Arc::new(UiState::new()));
        scheduler.stop();
        scheduler.stop();
        scheduler.priority_thumbs(vec![PathBuf::from("/ignored.jpg")]);
        assert_eq!(scheduler.queue_len(), 0);
    }
}
