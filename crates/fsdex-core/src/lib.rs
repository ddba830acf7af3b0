//! The Indexer: binds Loader output to `IndexDb` and performs the initial synchronous scan
//! (§4.4 of the spec).
//!
//! Construction starts the Watcher/Loader pipeline first, so no event occurring after the scan
//! begins is ever missed, then walks the tree once to populate the index with whatever already
//! existed. A file can therefore be indexed twice — once by the scan, once by a native Created
//! event racing it — which is harmless because `createFileIndex` always replaces wholesale.

use std::{path::PathBuf, sync::Arc};

use fsdex_index::{FilePosition, IndexDb, SingleFileIndex};
use fsdex_load::{LoaderConfig, LoadedFileNotification, Loader};
use fsdex_tokenizer::Tokenizer;
use fsdex_types::{FsDexError, Instant};
use fsdex_watch::{EventKind, WatcherConfig};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub root: PathBuf,
    pub loader: LoaderConfig,
    pub watcher: WatcherConfig,
}

impl IndexerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            loader: LoaderConfig::default(),
            watcher: WatcherConfig::default(),
        }
    }
}

/// Glues a Loader stream to an `IndexDb`, exposing the combined index as a queryable handle.
///
/// Closing cascades: Indexer → Loader → Watcher, per the spec's cancellation order.
pub struct Indexer {
    db: Arc<IndexDb>,
    scan_complete: watch::Receiver<bool>,
    loader: Option<Loader>,
    dispatch_task: Option<JoinHandle<()>>,
}

impl Indexer {
    #[instrument(skip(config, tokenizer), fields(root = %config.root.display()))]
    pub async fn start(
        config: IndexerConfig,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Result<Self, FsDexError> {
        let (loader, mut loader_rx) =
            Loader::new(&config.root, config.loader, config.watcher)?;

        let db = Arc::new(IndexDb::new());
        let (scan_tx, scan_rx) = watch::channel(false);

        run_initial_scan(&config.root, &db, tokenizer.as_ref());
        info!("initial scan complete");
        let _ = scan_tx.send(true);

        let dispatch_db = db.clone();
        let dispatch_task = tokio::spawn(async move {
            while let Some(notification) = loader_rx.recv().await {
                dispatch(&dispatch_db, tokenizer.as_ref(), notification);
            }
        });

        Ok(Self {
            db,
            scan_complete: scan_rx,
            loader: Some(loader),
            dispatch_task: Some(dispatch_task),
        })
    }

    /// Resolves once the initial scan has completed. Safe to call (and re-await) any number of
    /// times, before or after completion.
    pub async fn await_initial_scan(&self) {
        let mut rx = self.scan_complete.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn query(&self, token: &str) -> Vec<FilePosition> {
        self.db.query(token)
    }

    /// The underlying index, for callers that want direct access (e.g. the CLI's status line).
    pub fn index(&self) -> &Arc<IndexDb> {
        &self.db
    }

    /// Cascades the close down through the Loader and Watcher (Indexer → Loader → Watcher, per
    /// the cancellation order), then waits for the dispatch task to drain.
    pub async fn close(mut self) {
        if let Some(loader) = self.loader.take() {
            loader.close().await;
        }
        if let Some(task) = self.dispatch_task.take() {
            let _ = task.await;
        }
    }
}

fn run_initial_scan(root: &std::path::Path, db: &IndexDb, tokenizer: &dyn Tokenizer) {
    let mut files_indexed = 0usize;
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path().to_path_buf();
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let tokens = tokenizer.tokenize(&text);
                let entry = SingleFileIndex::from_tokens(&path, tokens, Instant::now());
                db.create_file_index(path, entry);
                files_indexed += 1;
            }
            Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
                let err = FsDexError::EncodingError { path: path.clone() };
                warn!(%err, "initial scan: skipping");
            }
            Err(source) => {
                let err = FsDexError::TransientFsError { path: path.clone(), source };
                warn!(%err, "initial scan: read failed, skipping");
            }
        }
    }
    info!(files_indexed, "initial scan walked tree");
}

fn dispatch(db: &IndexDb, tokenizer: &dyn Tokenizer, notification: LoadedFileNotification) {
    match notification.kind {
        EventKind::Created => {
            let Some(text) = notification.text else {
                return;
            };
            let Some(timestamp) = notification.timestamp else {
                return;
            };
            debug!(path = %notification.path.display(), "dispatch: created");
            let tokens = tokenizer.tokenize(&text);
            let entry = SingleFileIndex::from_tokens(&notification.path, tokens, timestamp);
            db.create_file_index(notification.path, entry);
        }
        EventKind::Modified => {
            let Some(text) = notification.text else {
                return;
            };
            let Some(timestamp) = notification.timestamp else {
                return;
            };
            debug!(path = %notification.path.display(), "dispatch: modified");
            let tokens = tokenizer.tokenize(&text);
            let entry = SingleFileIndex::from_tokens(&notification.path, tokens, timestamp);
            db.modify_file_index(notification.path, entry);
        }
        EventKind::Deleted => {
            debug!(path = %notification.path.display(), "dispatch: deleted");
            db.delete_file_index(&notification.path);
        }
    }
}
