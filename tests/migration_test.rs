mod common;

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use bytes::Bytes;
use common::{config, scenario_source, CheckedDestination, FlakySource, ALLOCATION};
use s3migrate::{
    destination::{
        local::LocalStore, Allocation, CommitOperation, FileAttributes, UploadRequest,
        UploadSource,
    },
    error::{DestinationError, SetupError, SourceError},
    source::memory::MemorySource,
    Migrator, StagingStrategy,
};
use tokio_util::sync::CancellationToken;

async fn seed(store: &LocalStore, path: &str, data: &'static [u8]) {
    let allocation = store.open_allocation(ALLOCATION).await.unwrap();
    allocation
        .upload(UploadRequest {
            source: UploadSource::Reader(Box::pin(data)),
            remote_path: path.to_string(),
            attributes: FileAttributes::default(),
            encrypt: false,
            expected_size: None,
        })
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
}

#[tokio::test]
async fn test_migrates_every_object() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let staging = scratch.path().join("staging");
    let store = LocalStore::new(dest.path());
    store.create_allocation(ALLOCATION).await.unwrap();

    let report = Migrator::new(
        config(&staging).build().unwrap(),
        Arc::new(scenario_source()),
        Arc::new(store.clone()),
    )
    .run()
    .await
    .unwrap();
    let allocation = store.open_allocation(ALLOCATION).await.unwrap();

    assert_eq!(report.migrated, 2);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(report.commit_failed, 0);
    assert!(!staging.join("tmp").exists());

    assert_eq!(allocation.read_file("/b1/a.txt").await.unwrap(), vec![b'a'; 10]);
    assert_eq!(allocation.read_file("/b1/b.txt").await.unwrap(), vec![b'b'; 20]);
    assert!(allocation.commit_log().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_existing_object_is_skipped() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dest.path());
    store.create_allocation(ALLOCATION).await.unwrap();
    seed(&store, "/b1/a.txt", b"aaaaaaaaaa").await;

    let source = Arc::new(FlakySource::new(scenario_source()));
    let report = Migrator::new(
        config(scratch.path()).build().unwrap(),
        source.clone(),
        Arc::new(store),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.migrated, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);
    // b.txt is 20 bytes at 8 bytes per part; a.txt was never fetched
    assert_eq!(source.get_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_second_run_skips_what_the_first_migrated() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dest.path());
    store.create_allocation(ALLOCATION).await.unwrap();

    let source = MemorySource::new(2)
        .with_object("b1", "a.txt", vec![1u8; 10])
        .with_object("b1", "nested/b.txt", vec![2u8; 20])
        .with_object("b2", "c.bin", vec![3u8; 33])
        .with_object("b2", "d.bin", Bytes::new());

    let migrator = Migrator::new(
        config(scratch.path()).build().unwrap(),
        Arc::new(source),
        Arc::new(store),
    );
    let first = migrator.run().await.unwrap();
    let second = migrator.run().await.unwrap();

    assert_eq!(first.migrated, 4);
    assert_eq!(second.skipped, first.migrated);
    assert_eq!(second.migrated, 0);
    assert_eq!(second.failed, 0);
}

#[tokio::test]
async fn test_size_mismatch_is_reuploaded() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dest.path());
    let allocation = store.create_allocation(ALLOCATION).await.unwrap();
    seed(&store, "/b1/a.txt", b"stale").await;

    let report = Migrator::new(
        config(scratch.path()).commit(true).build().unwrap(),
        Arc::new(scenario_source()),
        Arc::new(store.clone()),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.migrated, 2);
    assert_eq!(report.replaced, 1);
    assert_eq!(report.skipped, 0);

    let reopened = store.open_allocation(ALLOCATION).await.unwrap();
    assert_eq!(reopened.entry("/b1/a.txt").await.unwrap().size, 10);

    let log = allocation.commit_log().await.unwrap();
    let update = log.iter().find(|c| c.remote_path == "/b1/a.txt").unwrap();
    assert_eq!(update.operation, CommitOperation::Update);
    let upload = log.iter().find(|c| c.remote_path == "/b1/b.txt").unwrap();
    assert_eq!(upload.operation, CommitOperation::Upload);
}

#[tokio::test]
async fn test_download_failure_does_not_stop_the_run() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let staging = scratch.path().join("staging");
    let destination = CheckedDestination::new(dest.path(), &[], false).await;
    let allocation = destination.allocation.clone();

    let source = MemorySource::new(1)
        .with_object("b1", "1", vec![0u8; 12])
        .with_object("b1", "2", vec![0u8; 12])
        .with_object("b1", "3", vec![0u8; 12])
        .with_object("b1", "4", vec![0u8; 12]);
    let source = FlakySource::new(source).fail_get("2");

    let report = Migrator::new(
        config(&staging).build().unwrap(),
        Arc::new(source),
        Arc::new(destination),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.migrated, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failed_paths, vec!["/b1/2".to_string()]);
    assert_eq!(allocation.uploads.load(Ordering::SeqCst), 3);
    assert_eq!(allocation.leaked.load(Ordering::SeqCst), 0);
    assert!(!staging.join("tmp").exists());
}

#[tokio::test]
async fn test_upload_failure_still_cleans_up() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let destination = CheckedDestination::new(dest.path(), &["/b1/a.txt"], false).await;
    let allocation = destination.allocation.clone();

    let source = scenario_source().with_object("b1", "c.txt", vec![b'c'; 3]);
    let report = Migrator::new(
        config(scratch.path()).build().unwrap(),
        Arc::new(source),
        Arc::new(destination),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.migrated, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failed_paths, vec!["/b1/a.txt".to_string()]);
    // every staged file was gone before the next upload started
    assert_eq!(allocation.leaked.load(Ordering::SeqCst), 0);
    assert_eq!(allocation.leaked_now(), 0);
}

#[tokio::test]
async fn test_commit_failure_is_reported_separately() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let destination = CheckedDestination::new(dest.path(), &[], true).await;

    let report = Migrator::new(
        config(scratch.path()).commit(true).build().unwrap(),
        Arc::new(scenario_source()),
        Arc::new(destination),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.migrated, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(report.commit_failed, 2);
    let mut retry = report.commit_retry_paths.clone();
    retry.sort();
    assert_eq!(retry, vec!["/b1/a.txt".to_string(), "/b1/b.txt".to_string()]);
}

#[tokio::test]
async fn test_commits_every_upload() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dest.path());
    let allocation = store.create_allocation(ALLOCATION).await.unwrap();

    let report = Migrator::new(
        config(scratch.path()).commit(true).build().unwrap(),
        Arc::new(scenario_source()),
        Arc::new(store),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.migrated, 2);
    assert_eq!(report.commit_failed, 0);
    let log = allocation.commit_log().await.unwrap();
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|c| c.operation == CommitOperation::Upload));
}

#[tokio::test]
async fn test_missing_allocation_touches_nothing() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let source = Arc::new(FlakySource::new(scenario_source()));

    let err = Migrator::new(
        config(scratch.path()).build().unwrap(),
        source.clone(),
        Arc::new(LocalStore::new(dest.path())),
    )
    .run()
    .await
    .unwrap_err();

    assert!(matches!(err, SetupError::Allocation { .. }));
    assert_eq!(source.list_calls.load(Ordering::SeqCst), 0);
    assert_eq!(source.get_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_no_visible_buckets_is_fatal() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dest.path());
    store.create_allocation(ALLOCATION).await.unwrap();

    let err = Migrator::new(
        config(scratch.path()).build().unwrap(),
        Arc::new(MemorySource::new(10)),
        Arc::new(store),
    )
    .run()
    .await
    .unwrap_err();

    assert!(matches!(err, SetupError::NoBuckets));
}

#[tokio::test]
async fn test_bucket_listing_failure_is_isolated() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dest.path());
    store.create_allocation(ALLOCATION).await.unwrap();

    let source = scenario_source().with_object("b2", "c.txt", vec![b'c'; 5]);
    let source = FlakySource::new(source).fail_listing("b1");

    let report = Migrator::new(
        config(scratch.path()).build().unwrap(),
        Arc::new(source),
        Arc::new(store),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.failed_buckets, vec!["b1".to_string()]);
    assert_eq!(report.migrated, 1);
}

#[tokio::test]
async fn test_streaming_strategy() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dest.path());
    store.create_allocation(ALLOCATION).await.unwrap();

    let report = Migrator::new(
        config(scratch.path())
            .strategy(StagingStrategy::Stream)
            .build()
            .unwrap(),
        Arc::new(scenario_source()),
        Arc::new(store.clone()),
    )
    .run()
    .await
    .unwrap();
    let allocation = store.open_allocation(ALLOCATION).await.unwrap();

    assert_eq!(report.migrated, 2);
    assert_eq!(allocation.read_file("/b1/b.txt").await.unwrap(), vec![b'b'; 20]);
}

#[tokio::test]
async fn test_encrypted_migration() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dest.path());
    store.create_allocation(ALLOCATION).await.unwrap();

    let report = Migrator::new(
        config(scratch.path())
            .encrypt(true)
            .read_payer(Some("owner".to_string()))
            .build()
            .unwrap(),
        Arc::new(scenario_source()),
        Arc::new(store.clone()),
    )
    .run()
    .await
    .unwrap();
    let allocation = store.open_allocation(ALLOCATION).await.unwrap();

    assert_eq!(report.migrated, 2);
    let entry = allocation.entry("/b1/a.txt").await.unwrap();
    assert!(entry.encrypted);
    assert_eq!(entry.size, 10);
    assert_eq!(allocation.read_file("/b1/a.txt").await.unwrap(), vec![b'a'; 10]);
}

#[tokio::test]
async fn test_invalid_read_payer_fails_each_object() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dest.path());
    store.create_allocation(ALLOCATION).await.unwrap();

    let report = Migrator::new(
        config(scratch.path())
            .read_payer(Some("nobody".to_string()))
            .build()
            .unwrap(),
        Arc::new(scenario_source()),
        Arc::new(store),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.failed, 2);
    assert_eq!(report.migrated, 0);
}

#[tokio::test]
async fn test_parallel_workers() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dest.path());
    store.create_allocation(ALLOCATION).await.unwrap();

    let mut source = MemorySource::new(7);
    for i in 0..25u8 {
        let key = format!("dir{}/obj{i}", i % 3);
        source = source.with_object("b1", &key, vec![i; 40 + usize::from(i)]);
    }

    let report = Migrator::new(
        config(scratch.path())
            .object_workers(4)
            .download_workers(3)
            .build()
            .unwrap(),
        Arc::new(source),
        Arc::new(store.clone()),
    )
    .run()
    .await
    .unwrap();
    let allocation = store.open_allocation(ALLOCATION).await.unwrap();

    assert_eq!(report.migrated, 25);
    assert_eq!(report.failed, 0);
    assert_eq!(
        allocation.read_file("/b1/dir1/obj7").await.unwrap(),
        vec![7u8; 47]
    );
}

#[tokio::test]
async fn test_directory_markers_are_skipped() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dest.path());
    store.create_allocation(ALLOCATION).await.unwrap();

    let source = scenario_source().with_object("b1", "photos/", Bytes::new());
    let report = Migrator::new(
        config(scratch.path()).build().unwrap(),
        Arc::new(source),
        Arc::new(store),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.migrated, 2);
    assert_eq!(report.skipped, 1);
}

#[tokio::test]
async fn test_object_timeout() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let staging = scratch.path().join("staging");
    let store = LocalStore::new(dest.path());
    store.create_allocation(ALLOCATION).await.unwrap();

    let source = FlakySource::new(scenario_source()).slow_get("a.txt");
    let report = Migrator::new(
        config(&staging)
            .object_timeout(Some(Duration::from_millis(100)))
            .build()
            .unwrap(),
        Arc::new(source),
        Arc::new(store),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.migrated, 1);
    assert!(!staging.join("tmp").exists());
}

#[tokio::test]
async fn test_cancelled_run_migrates_nothing() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dest.path());
    store.create_allocation(ALLOCATION).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = Migrator::new(
        config(scratch.path()).build().unwrap(),
        Arc::new(scenario_source()),
        Arc::new(store),
    )
    .with_cancellation(cancel)
    .run()
    .await
    .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.total(), 0);
}

#[tokio::test]
async fn test_staging_dir_contents_survive_the_run() {
    let dest = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    let notes = home.path().join("notes.txt");
    std::fs::write(&notes, b"keep me").unwrap();
    let store = LocalStore::new(dest.path());
    store.create_allocation(ALLOCATION).await.unwrap();

    let report = Migrator::new(
        config(home.path()).build().unwrap(),
        Arc::new(scenario_source()),
        Arc::new(store),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.migrated, 2);
    assert_eq!(std::fs::read(&notes).unwrap(), b"keep me");
    assert!(!home.path().join("tmp").exists());
}

#[tokio::test]
async fn test_keys_sharing_a_normalized_path_migrate_in_parallel() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dest.path());
    store.create_allocation(ALLOCATION).await.unwrap();

    let source = MemorySource::new(10)
        .with_object("b1", "a", vec![1u8; 30])
        .with_object("b1", "a/b", vec![2u8; 31])
        .with_object("b1", "a//b", vec![3u8; 32])
        .with_object("b1", "a/./b", vec![4u8; 33]);

    let report = Migrator::new(
        config(scratch.path()).object_workers(4).build().unwrap(),
        Arc::new(source),
        Arc::new(store.clone()),
    )
    .run()
    .await
    .unwrap();
    let allocation = store.open_allocation(ALLOCATION).await.unwrap();

    assert_eq!(report.migrated, 4);
    assert_eq!(report.failed, 0);
    assert_eq!(allocation.read_file("/b1/a").await.unwrap(), vec![1u8; 30]);
    assert_eq!(allocation.read_file("/b1/a/b").await.unwrap(), vec![2u8; 31]);
    assert_eq!(allocation.read_file("/b1/a//b").await.unwrap(), vec![3u8; 32]);
    assert_eq!(allocation.read_file("/b1/a/./b").await.unwrap(), vec![4u8; 33]);
}

#[tokio::test]
async fn test_unreadable_file_tree_is_fatal() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let destination = CheckedDestination::with_unreadable_tree(dest.path()).await;
    let allocation = destination.allocation.clone();
    let source = Arc::new(FlakySource::new(scenario_source()));

    let err = Migrator::new(
        config(scratch.path()).build().unwrap(),
        source.clone(),
        Arc::new(destination),
    )
    .run()
    .await
    .unwrap_err();

    assert!(matches!(err, SetupError::IndexBuild(DestinationError::Io(_))));
    assert_eq!(source.list_calls.load(Ordering::SeqCst), 0);
    assert_eq!(source.get_calls.load(Ordering::SeqCst), 0);
    assert_eq!(allocation.uploads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_bucket_resolution_failure_is_fatal() {
    let dest = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let destination = CheckedDestination::new(dest.path(), &[], false).await;
    let allocation = destination.allocation.clone();
    let source = Arc::new(FlakySource::new(scenario_source()).fail_bucket_listing());

    let err = Migrator::new(
        config(scratch.path()).build().unwrap(),
        source.clone(),
        Arc::new(destination),
    )
    .run()
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        SetupError::BucketResolution(SourceError::ListBuckets { .. })
    ));
    assert_eq!(source.get_calls.load(Ordering::SeqCst), 0);
    assert_eq!(allocation.uploads.load(Ordering::SeqCst), 0);
}
