//! Recursive directory watcher (§4.1 of the spec).
//!
//! `notify`'s native backends only ever watch individual directories (inotify has no recursive
//! mode; `ReadDirectoryChangesW` and FSEvents are the exceptions, but we deliberately watch
//! non-recursively everywhere so the dynamic re-registration and back-fill logic below is
//! exercised uniformly across platforms). Subdirectory creation and deletion therefore require
//! us to track the watched set ourselves and re-walk the tree when it changes.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, SystemTime},
};

use fsdex_types::FsDexError;
use notify::{
    event::{ModifyKind, RenameMode},
    Config, EventKind as NotifyEventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher as _,
};
use rustc_hash::FxHashSet;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};
use walkdir::WalkDir;

/// The kind of change a [`FileNotification`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Modified,
    Deleted,
}

/// A raw file-system event for a single regular file. Directory create/delete events are
/// consumed internally by the Watcher and never reach this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNotification {
    pub kind: EventKind,
    pub path: PathBuf,
    /// The OS-reported modification time. Always `Some` for `Created`/`Modified`, always `None`
    /// for `Deleted`.
    pub mtime: Option<SystemTime>,
}

/// Tuning knobs for the Watcher.
#[derive(Debug, Clone, Default)]
pub struct WatcherConfig {
    /// When set, the watcher uses `notify`'s polling backend at this interval instead of the
    /// platform-native one. Intended for filesystems (network shares, some container overlays)
    /// where the native backend is unavailable or has low default sensitivity; the spec calls
    /// for "the highest-frequency polling option available" in that situation.
    pub poll_interval: Option<Duration>,
}

enum NotifyWatcherImpl {
    Recommended(RecommendedWatcher),
    Polling(PollWatcher),
}

impl NotifyWatcherImpl {
    fn watch(&mut self, path: &Path) -> notify::Result<()> {
        match self {
            Self::Recommended(w) => w.watch(path, RecursiveMode::NonRecursive),
            Self::Polling(w) => w.watch(path, RecursiveMode::NonRecursive),
        }
    }

    fn unwatch(&mut self, path: &Path) -> notify::Result<()> {
        match self {
            Self::Recommended(w) => w.unwatch(path),
            Self::Polling(w) => w.unwatch(path),
        }
    }
}

/// A live recursive watch over `root`. Dropping (or calling [`Watcher::close`]) signals the
/// worker thread to shut down; it notices within one poll tick, drops the `notify` watcher it
/// owns (releasing the OS watch resources), and exits.
pub struct Watcher {
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Watcher {
    /// Walks `root`, registers every directory found with the OS watch service, and starts the
    /// background worker. Fails with [`FsDexError::ConfigError`] if `root` does not exist or is
    /// not a directory.
    #[instrument(skip(config), fields(root = %root.as_ref().display()))]
    pub fn new(
        root: impl AsRef<Path>,
        config: WatcherConfig,
    ) -> Result<(Self, mpsc::Receiver<FileNotification>), FsDexError> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(FsDexError::ConfigError { path: root });
        }

        let (raw_tx, raw_rx) = std::sync::mpsc::channel();
        let notify_config = Config::default();
        let to_watch_failure = |source: notify::Error| FsDexError::WatchServiceFailure {
            path: root.clone(),
            source,
        };
        let mut notify_watcher = match config.poll_interval {
            Some(interval) => NotifyWatcherImpl::Polling(
                PollWatcher::new(raw_tx, notify_config.with_poll_interval(interval))
                    .map_err(to_watch_failure)?,
            ),
            None => NotifyWatcherImpl::Recommended(
                RecommendedWatcher::new(raw_tx, notify_config).map_err(to_watch_failure)?,
            ),
        };

        // Registered here, synchronously, so construction failures and the initial watch count
        // are visible to the caller before the worker thread takes over. The same watcher
        // instance is then moved into the worker so later re-registration sweeps operate on the
        // very watches that feed `raw_rx` — using a second instance would register directories
        // whose events nobody is listening for.
        let watched_folders = register_tree(&root, &mut notify_watcher);
        info!(dirs = watched_folders.len(), "initial watch registration complete");

        let (out_tx, out_rx) = mpsc::channel(1024);
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_shutdown = shutdown.clone();
        let worker_root = root.clone();
        let worker = std::thread::Builder::new()
            .name("fsdex-watch".into())
            .spawn(move || {
                run_worker(
                    worker_root,
                    watched_folders,
                    raw_rx,
                    out_tx,
                    notify_watcher,
                    worker_shutdown,
                )
            })
            .expect("failed to spawn fsdex-watch worker thread");

        Ok((
            Self {
                shutdown,
                worker: Some(worker),
            },
            out_rx,
        ))
    }

    /// Stops watching, releases OS resources, and waits for the worker thread to exit.
    pub fn close(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        // Signal only; `close` is the place to wait for a clean shutdown, so `Drop` stays quick.
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Walks `root` and watches every directory found (including `root` itself). Returns the set of
/// directories that were actually registered; directories that vanish mid-walk are skipped with
/// a warning rather than failing the whole registration.
fn register_tree(root: &Path, watcher: &mut NotifyWatcherImpl) -> FxHashSet<PathBuf> {
    let mut watched = FxHashSet::default();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_dir() {
            continue;
        }
        let dir = entry.path().to_path_buf();
        match watcher.watch(&dir) {
            Ok(()) => {
                watched.insert(dir);
            }
            Err(err) => warn!(?dir, %err, "failed to register directory watch"),
        }
    }
    watched
}

fn unregister_all(watcher: &mut NotifyWatcherImpl, dirs: &FxHashSet<PathBuf>) {
    for dir in dirs {
        if let Err(err) = watcher.unwatch(dir) {
            trace!(?dir, %err, "unwatch failed during re-registration sweep");
        }
    }
}

/// Synthesizes `Created` notifications for every regular file found under a freshly created
/// subtree (the back-fill described in §4.1/§6). Files and sub-subdirectories created between
/// the watch event and this walk are picked up too, for free, by `WalkDir`.
fn backfill_created_files(dir: &Path, out_tx: &mpsc::Sender<FileNotification>) {
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path().to_path_buf();
        match fs::metadata(&path) {
            Ok(meta) => {
                let _ = out_tx.blocking_send(FileNotification {
                    kind: EventKind::Created,
                    path,
                    mtime: meta.modified().ok(),
                });
            }
            Err(err) => trace!(?path, %err, "back-fill stat failed, file vanished; dropping"),
        }
    }
}

/// How often the worker checks the shutdown flag between watch-service events. Bounds
/// cancellation latency without needing a second channel to select alongside `raw_rx`.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn run_worker(
    root: PathBuf,
    mut watched_folders: FxHashSet<PathBuf>,
    raw_rx: std::sync::mpsc::Receiver<notify::Result<notify::Event>>,
    out_tx: mpsc::Sender<FileNotification>,
    mut notify_watcher: NotifyWatcherImpl,
    shutdown: Arc<AtomicBool>,
) {
    // `watched_folders`, `needs_reregister`, and `notify_watcher` are owned exclusively by this
    // thread, per the spec's single-owner policy for Watcher state. `notify_watcher` is the same
    // instance `Watcher::new` used for the initial registration, moved in wholesale so
    // re-registration sweeps watch/unwatch through the one instance that actually feeds
    // `raw_rx` — a second instance would watch directories nobody is listening to.
    let mut needs_reregister = false;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            debug!("shutdown requested, worker exiting");
            break;
        }

        let event = match raw_rx.recv_timeout(SHUTDOWN_POLL_INTERVAL) {
            Ok(event) => event,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                debug!("watch channel disconnected, worker exiting");
                break;
            }
        };
        process_raw_event(
            event,
            &root,
            &mut watched_folders,
            &mut needs_reregister,
            &out_tx,
        );

        // Drain anything else already queued before considering a re-registration sweep, so a
        // burst of directory churn collapses into a single re-walk.
        while let Ok(event) = raw_rx.try_recv() {
            process_raw_event(
                event,
                &root,
                &mut watched_folders,
                &mut needs_reregister,
                &out_tx,
            );
        }

        if needs_reregister {
            unregister_all(&mut notify_watcher, &watched_folders);
            watched_folders.clear();
            watched_folders = register_tree(&root, &mut notify_watcher);
            info!(dirs = watched_folders.len(), "re-registered watch tree");
            needs_reregister = false;
        }
    }
    // `notify_watcher` drops here, releasing the OS watch resources.
}

fn process_raw_event(
    event: notify::Result<notify::Event>,
    root: &Path,
    watched_folders: &mut FxHashSet<PathBuf>,
    needs_reregister: &mut bool,
    out_tx: &mpsc::Sender<FileNotification>,
) {
    let event = match event {
        Ok(event) => event,
        Err(err) => {
            warn!(%err, "watch service reported an error");
            return;
        }
    };

    match event.kind {
        NotifyEventKind::Create(_) => {
            for path in &event.paths {
                handle_created(path, watched_folders, needs_reregister, out_tx);
            }
        }
        NotifyEventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let [from, to, ..] = event.paths.as_slice() {
                handle_removed(from, root, watched_folders, needs_reregister, out_tx);
                handle_created(to, watched_folders, needs_reregister, out_tx);
            }
        }
        NotifyEventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in &event.paths {
                handle_removed(path, root, watched_folders, needs_reregister, out_tx);
            }
        }
        NotifyEventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in &event.paths {
                handle_created(path, watched_folders, needs_reregister, out_tx);
            }
        }
        NotifyEventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => {
            for path in &event.paths {
                handle_modified(path, out_tx);
            }
        }
        NotifyEventKind::Remove(_) => {
            for path in &event.paths {
                handle_removed(path, root, watched_folders, needs_reregister, out_tx);
            }
        }
        // Metadata-only changes, access events, and backend-specific "other" events carry no
        // content change; ignored per §4.1 (only Created/Modified/Deleted are meaningful here).
        NotifyEventKind::Modify(ModifyKind::Metadata(_) | ModifyKind::Other)
        | NotifyEventKind::Access(_)
        | NotifyEventKind::Any
        | NotifyEventKind::Other => {}
    }
}

fn handle_created(
    path: &Path,
    watched_folders: &mut FxHashSet<PathBuf>,
    needs_reregister: &mut bool,
    out_tx: &mpsc::Sender<FileNotification>,
) {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            debug!(?path, "directory created, scheduling re-registration");
            *needs_reregister = true;
            watched_folders.insert(path.to_path_buf());
            backfill_created_files(path, out_tx);
        }
        Ok(meta) if meta.is_file() => {
            trace!(?path, "file created");
            let _ = out_tx.blocking_send(FileNotification {
                kind: EventKind::Created,
                path: path.to_path_buf(),
                mtime: meta.modified().ok(),
            });
        }
        Ok(_) => {
            // Neither a regular file nor a directory (e.g. a socket, FIFO, or symlink we chose
            // not to follow). Not part of the index's domain.
        }
        Err(source) => {
            // Created and deleted faster than we could stat it. Not an error (§4.1 edge case).
            let err = FsDexError::TransientFsError { path: path.to_path_buf(), source };
            trace!(%err, "stat failed for just-created path, dropping");
        }
    }
}

fn handle_modified(path: &Path, out_tx: &mpsc::Sender<FileNotification>) {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => {
            trace!(?path, "file modified");
            let _ = out_tx.blocking_send(FileNotification {
                kind: EventKind::Modified,
                path: path.to_path_buf(),
                mtime: meta.modified().ok(),
            });
        }
        Ok(_) => {
            // A directory's own metadata changed (e.g. a child was added/removed); directory
            // membership changes are already observed as separate Create/Remove events.
        }
        Err(source) => {
            let err = FsDexError::TransientFsError { path: path.to_path_buf(), source };
            trace!(%err, "stat failed for modified path, dropping");
        }
    }
}

fn handle_removed(
    path: &Path,
    root: &Path,
    watched_folders: &mut FxHashSet<PathBuf>,
    needs_reregister: &mut bool,
    out_tx: &mpsc::Sender<FileNotification>,
) {
    // The path no longer exists, so the only way to tell a directory from a file is whether we
    // were watching it as a directory (§4.1: "the target is a directory iff its path is in
    // watchedFolders").
    if watched_folders.contains(path) || path == root {
        debug!(?path, "directory removed, scheduling re-registration");
        *needs_reregister = true;
        watched_folders.remove(path);
    } else {
        trace!(?path, "file removed");
        let _ = out_tx.blocking_send(FileNotification {
            kind: EventKind::Deleted,
            path: path.to_path_buf(),
            mtime: None,
        });
    }
}
