//! The literal end-to-end scenarios from §8, driving the real `notify` backend against
//! ephemeral directories.

use std::{fs, sync::Arc, time::Duration};

use fsdex_core::{Indexer, IndexerConfig};
use fsdex_load::LoaderConfig;
use fsdex_tokenizer::WhitespaceTokenizer;
use fsdex_watch::WatcherConfig;
use tempfile::tempdir;

fn fast_config(root: &std::path::Path) -> IndexerConfig {
    IndexerConfig {
        root: root.to_path_buf(),
        loader: LoaderConfig {
            delay_before_read: Duration::from_millis(50),
        },
        watcher: WatcherConfig::default(),
    }
}

async fn wait_until(mut check: impl FnMut() -> bool, timeout_after: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout_after;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Scenario 1: create + read.
#[tokio::test]
async fn scenario_create_then_read() {
    let dir = tempdir().unwrap();
    let indexer = Indexer::start(fast_config(dir.path()), Arc::new(WhitespaceTokenizer))
        .await
        .unwrap();
    indexer.await_initial_scan().await;

    let path = dir.path().join("a.txt");
    fs::write(&path, b"hello world").unwrap();

    assert!(wait_until(|| indexer.query("world").len() == 1, Duration::from_secs(2)).await);
    let hits = indexer.query("world");
    assert_eq!(hits[0].file_path, path);
    assert!(indexer.query("missing").is_empty());

    indexer.close().await;
}

/// Scenario 2: two-file addition.
#[tokio::test]
async fn scenario_two_file_addition() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), b"hello world").unwrap();

    let indexer = Indexer::start(fast_config(dir.path()), Arc::new(WhitespaceTokenizer))
        .await
        .unwrap();
    indexer.await_initial_scan().await;
    assert_eq!(indexer.query("world").len(), 1);

    fs::write(dir.path().join("b.txt"), b"world peace").unwrap();
    assert!(wait_until(|| indexer.query("world").len() == 2, Duration::from_secs(10)).await);

    indexer.close().await;
}

/// Scenario 4: subtree back-fill.
#[tokio::test]
async fn scenario_subdirectory_backfill() {
    let dir = tempdir().unwrap();
    let indexer = Indexer::start(fast_config(dir.path()), Arc::new(WhitespaceTokenizer))
        .await
        .unwrap();
    indexer.await_initial_scan().await;

    let subdir = dir.path().join("s");
    fs::create_dir(&subdir).unwrap();
    fs::write(subdir.join("x.txt"), b"alpha").unwrap();

    assert!(wait_until(|| indexer.query("alpha").len() == 1, Duration::from_secs(10)).await);

    indexer.close().await;
}

/// Scenario 5: delete.
#[tokio::test]
async fn scenario_delete() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a.txt");
    fs::write(&path, b"hello world").unwrap();

    let indexer = Indexer::start(fast_config(dir.path()), Arc::new(WhitespaceTokenizer))
        .await
        .unwrap();
    indexer.await_initial_scan().await;
    assert_eq!(indexer.query("world").len(), 1);

    fs::remove_file(&path).unwrap();
    assert!(wait_until(|| indexer.query("world").is_empty(), Duration::from_secs(2)).await);

    indexer.close().await;
}

/// Scenario 3: rapid rewrites never yield a torn read, seen end-to-end through the index.
#[tokio::test]
async fn scenario_rapid_rewrites_settle_to_uniform_contents() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("f.txt");
    fs::write(&path, vec![b'x'; 100_000]).unwrap();

    let indexer = Indexer::start(fast_config(dir.path()), Arc::new(WhitespaceTokenizer))
        .await
        .unwrap();
    indexer.await_initial_scan().await;

    for i in 0..20u32 {
        let byte = b'a' + (i % 26) as u8;
        fs::write(&path, vec![byte; 100_000]).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Give the pipeline time to settle, then compare against whatever actually landed on disk.
    // The whitespace tokenizer treats a buffer with no whitespace as one 100_000-byte token, so
    // a torn read (a splice of two different repeated bytes) would still tokenize to a single
    // token but at the wrong byte value — querying the exact final contents is how we'd notice.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let final_contents = fs::read_to_string(&path).unwrap();
    assert_eq!(final_contents.len(), 100_000);

    assert!(wait_until(|| indexer.query(&final_contents).len() == 1, Duration::from_secs(5)).await);
    let hits = indexer.query(&final_contents);
    assert_eq!(hits[0].range, 0..100_000);

    indexer.close().await;
}
