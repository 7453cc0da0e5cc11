use crate::integration::support::*;
use kmsorter::bus::MemoryBus;
use kmsorter::codec::ChunkMessage;
use kmsorter::dedup::{dedup_key, DedupCoordinator, DedupScope};
use kmsorter::error::SorterError;
use kmsorter::imaging::{ImageCodec, RasterCodec};
use kmsorter::ingest::IngestOutcome;
use kmsorter::retry::RetryPolicy;
use kmsorter::store::{DedupIndex, MemoryDedupIndex, SledDedupIndex};
use kmsorter::types::ContentDigest;
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn directory_scan_ingests_rgb_and_grayscale() {
    let images = TempDir::new().unwrap();
    let rgb = write_rgb_png(images.path(), "rgb.png", [200, 40, 40]);
    let gray = write_gray_png(images.path(), "gray.png", 90);

    let bus = Arc::new(MemoryBus::new());
    let index: Arc<dyn DedupIndex> = Arc::new(MemoryDedupIndex::new());
    let chunk_size = 64;
    let ingestor = ingestor(
        bus.clone(),
        Arc::clone(&index),
        "hostA",
        chunk_size,
        RetryPolicy::none(),
    );

    let report = ingestor.ingest_dir(images.path()).await.unwrap();
    assert_eq!(report.published.len(), 2);
    assert!(report.failed.is_empty());
    assert_eq!(index.key_count().unwrap(), 2);

    let codec = RasterCodec::new();
    let messages: Vec<ChunkMessage> = bus
        .published(LOAD)
        .iter()
        .map(|wire| ChunkMessage::decode(wire).unwrap())
        .collect();
    for (path, name) in [(rgb, "rgb.png"), (gray, "gray.png")] {
        let size = codec.normalize(&path).unwrap().len();
        let identity = format!("hostA:{}", name);
        let sent = messages
            .iter()
            .filter(|m| m.identity.as_str() == identity)
            .count();
        assert_eq!(sent, size.div_ceil(chunk_size), "chunks for {}", name);
    }
}

#[tokio::test]
async fn identical_content_from_second_host_is_duplicate() {
    let store = TempDir::new().unwrap();
    let index: Arc<dyn DedupIndex> =
        Arc::new(SledDedupIndex::open(&store.path().join("index")).unwrap());
    let host_a_dir = TempDir::new().unwrap();
    let host_b_dir = TempDir::new().unwrap();
    let on_a = write_rgb_png(host_a_dir.path(), "sunset.png", [250, 120, 20]);
    let on_b = write_rgb_png(host_b_dir.path(), "sunset.png", [250, 120, 20]);

    let bus = Arc::new(MemoryBus::new());
    let loader_a = ingestor(bus.clone(), Arc::clone(&index), "hostA", 4096, RetryPolicy::none());
    let loader_b = ingestor(bus.clone(), Arc::clone(&index), "hostB", 4096, RetryPolicy::none());

    let first = loader_a.ingest(&on_a).await.unwrap();
    assert!(matches!(first, IngestOutcome::Published { .. }));
    let published_before = bus.published(LOAD).len();

    let second = loader_b.ingest(&on_b).await.unwrap();
    match second {
        IngestOutcome::Duplicate { host, existing } => {
            assert_eq!(host, "hostA");
            assert_eq!(existing.as_str(), "hostA:sunset.png");
        }
        other => panic!("expected duplicate, got {:?}", other),
    }
    assert_eq!(bus.published(LOAD).len(), published_before);
    assert_eq!(index.entries(&dedup_key("sunset.png")).unwrap().len(), 1);
}

#[tokio::test]
async fn same_name_with_new_content_gets_suffix() {
    let index: Arc<dyn DedupIndex> = Arc::new(MemoryDedupIndex::new());
    let bus = Arc::new(MemoryBus::new());
    let first_dir = TempDir::new().unwrap();
    let second_dir = TempDir::new().unwrap();
    let third_dir = TempDir::new().unwrap();
    let loader_a = ingestor(bus.clone(), Arc::clone(&index), "hostA", 4096, RetryPolicy::none());
    let loader_b = ingestor(bus.clone(), Arc::clone(&index), "hostB", 4096, RetryPolicy::none());

    let v1 = write_rgb_png(first_dir.path(), "photo.png", [10, 10, 10]);
    let v2 = write_rgb_png(second_dir.path(), "photo.png", [20, 20, 20]);
    let v3 = write_rgb_png(third_dir.path(), "photo.png", [30, 30, 30]);

    let identity_of = |outcome: IngestOutcome| match outcome {
        IngestOutcome::Published { identity, .. } => identity.to_string(),
        other => panic!("expected publish, got {:?}", other),
    };
    assert_eq!(identity_of(loader_a.ingest(&v1).await.unwrap()), "hostA:photo.png");
    assert_eq!(identity_of(loader_a.ingest(&v2).await.unwrap()), "hostA:photo_0.png");
    assert_eq!(identity_of(loader_b.ingest(&v3).await.unwrap()), "hostB:photo.png");
    assert_eq!(index.entries(&dedup_key("photo.png")).unwrap().len(), 3);
}

#[tokio::test]
async fn reingesting_is_idempotent() {
    let images = TempDir::new().unwrap();
    write_rgb_png(images.path(), "a.png", [1, 2, 3]);
    write_gray_png(images.path(), "b.png", 7);

    let index: Arc<dyn DedupIndex> = Arc::new(MemoryDedupIndex::new());
    let bus = Arc::new(MemoryBus::new());
    let loader = ingestor(bus.clone(), Arc::clone(&index), "hostA", 4096, RetryPolicy::none());

    loader.ingest_dir(images.path()).await.unwrap();
    let published = bus.published(LOAD).len();
    let keys = index.key_count().unwrap();

    let again = loader.ingest_dir(images.path()).await.unwrap();
    assert_eq!(again.duplicates.len(), 2);
    assert!(again.published.is_empty());
    assert_eq!(bus.published(LOAD).len(), published);
    assert_eq!(index.key_count().unwrap(), keys);
}

#[tokio::test]
async fn publish_failure_after_retries() {
    let images = TempDir::new().unwrap();
    let path = write_rgb_png(images.path(), "a.png", [9, 9, 9]);
    let bus = Arc::new(MemoryBus::new());
    bus.fail_next_publishes(100);
    let loader = ingestor(
        bus.clone(),
        Arc::new(MemoryDedupIndex::new()),
        "hostA",
        4096,
        fast_retry(3),
    );

    let err = loader.ingest(&path).await.unwrap_err();
    assert!(matches!(err, SorterError::PublishFailure { attempts: 3, .. }));
    assert!(bus.published(LOAD).is_empty());
}

#[test]
fn name_scope_allows_same_bytes_under_new_name() {
    let coordinator = DedupCoordinator::new(
        Arc::new(MemoryDedupIndex::new()),
        DedupScope::Name,
        RetryPolicy::none(),
    );
    let digest = ContentDigest::of(b"same bytes");
    coordinator.resolve("hostA", "a.png", digest).unwrap();
    let renamed = coordinator.resolve("hostA", "b.png", digest).unwrap();
    assert_eq!(renamed.as_str(), "hostA:b.png");
    assert!(coordinator
        .resolve("hostB", "a.png", digest)
        .unwrap_err()
        .is_duplicate());
}

#[test]
fn loaders_with_separate_index_handles_share_the_store() {
    let store = TempDir::new().unwrap();
    let path = store.path().join("index");
    let patient = RetryPolicy {
        max_attempts: 200,
        base_delay_ms: 1,
        max_delay_ms: 10,
    };
    let handle_a: Arc<dyn DedupIndex> =
        Arc::new(SledDedupIndex::open_with_retry(&path, patient).unwrap());
    let handle_b: Arc<dyn DedupIndex> =
        Arc::new(SledDedupIndex::open_with_retry(&path, patient).unwrap());
    let coordinator = |index: Arc<dyn DedupIndex>| {
        Arc::new(DedupCoordinator::new(index, DedupScope::Global, patient))
    };

    let loaders = vec![
        ("hostA", coordinator(Arc::clone(&handle_a))),
        ("hostB", coordinator(Arc::clone(&handle_b))),
    ];
    let threads: Vec<_> = loaders
        .into_iter()
        .map(|(host, loader)| {
            std::thread::spawn(move || {
                (0..10)
                    .map(|i| {
                        let content = format!("{}-{}", host, i);
                        loader.resolve(
                            host,
                            &format!("img-{}.png", i),
                            ContentDigest::of(content.as_bytes()),
                        )
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    for thread in threads {
        for resolved in thread.join().unwrap() {
            resolved.unwrap();
        }
    }

    for i in 0..10 {
        let records = handle_a.entries(&format!("img-{}.png", i)).unwrap();
        assert_eq!(records.len(), 2, "records for img-{}.png", i);
    }

    // Content indexed through one handle is a duplicate through the other.
    let err = coordinator(Arc::clone(&handle_b))
        .resolve("hostB", "copy.png", ContentDigest::of(b"hostA-3"))
        .unwrap_err();
    assert!(matches!(
        err,
        SorterError::DuplicateArtifact { ref host, .. } if host == "hostA"
    ));
}
