use crate::integration::support::*;
use kmsorter::bus::{MemoryBus, MessageBus, SpoolBus};
use kmsorter::classify::{ClassificationResult, ColorSignature, Palette};
use kmsorter::imaging::RasterCodec;
use kmsorter::process::{ProcessConfig, ProcessPipeline, SortPipeline};
use kmsorter::retry::RetryPolicy;
use kmsorter::store::MemoryDedupIndex;
use kmsorter::types::Rgb;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

fn red_green_palette() -> Palette {
    Palette::new(vec![Rgb::new(255, 0, 0), Rgb::new(0, 255, 0)]).unwrap()
}

#[tokio::test]
async fn chunks_delivered_out_of_order_are_processed_and_classified() {
    let images = TempDir::new().unwrap();
    let path = write_rgb_png(images.path(), "reddish.png", [250, 10, 6]);
    let bus = Arc::new(MemoryBus::new());
    let loader = ingestor(
        bus.clone(),
        Arc::new(MemoryDedupIndex::new()),
        "hostA",
        16,
        RetryPolicy::none(),
    );
    loader.ingest(&path).await.unwrap();

    let processor = ProcessPipeline::new(
        bus.clone(),
        Arc::new(RasterCodec::new()),
        &ProcessConfig::default(),
        RetryPolicy::none(),
    )
    .with_channels(LOAD, PROCESSED, SORTED)
    .with_palette(red_green_palette());

    let mut chunks = bus.published(LOAD);
    assert!(chunks.len() > 2);
    chunks.rotate_left(1);
    let mut outcome = None;
    for wire in &chunks {
        if let Some(done) = processor.handle_message(wire).await {
            outcome = Some(done);
        }
    }
    let processed = outcome.expect("all chunks delivered");
    assert_eq!(processed.identity.as_str(), "hostA:reddish.png");
    assert_eq!(processed.classification.unwrap().palette_index, 0);

    let signatures = bus.published(PROCESSED);
    assert_eq!(signatures.len(), 1);
    let (signature, identity) = ColorSignature::parse_wire(&signatures[0]).unwrap();
    assert_eq!(identity, processed.identity);
    assert!(signature.r > signature.g && signature.r > signature.b);
    assert_eq!(processor.stats().completed, 1);
}

#[tokio::test]
async fn sort_pipeline_consumes_processor_output() {
    let bus = Arc::new(MemoryBus::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sorter = SortPipeline::new(bus.clone(), red_green_palette(), RetryPolicy::none())
        .with_channels(PROCESSED, SORTED)
        .with_result_sink(tx);
    let (stop_tx, stop_rx) = watch::channel(false);

    let driver = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(PROCESSED, b"250,10,5|hostA:a.png").await.unwrap();
        bus.publish(PROCESSED, b"not a signature").await.unwrap();
        bus.publish(PROCESSED, b"5,240,9|hostB:b.png").await.unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        stop_tx.send(true).unwrap();
        (first, second)
    };
    let (stats, (first, second)) = tokio::join!(sorter.run(stop_rx), driver);
    let stats = stats.unwrap();

    assert_eq!(first.palette_index, 0);
    assert_eq!(second.palette_index, 1);
    assert_eq!(stats.classified, 2);
    assert_eq!(stats.dropped, 1);

    let published: Vec<ClassificationResult> = bus
        .published(SORTED)
        .iter()
        .map(|p| serde_json::from_slice(p).unwrap())
        .collect();
    assert_eq!(published.len(), 2);
    assert_eq!(published[1].identity.as_str(), "hostB:b.png");
}

#[tokio::test]
async fn spool_bus_carries_images_between_agents() {
    let spool = TempDir::new().unwrap();
    let images = TempDir::new().unwrap();
    write_rgb_png(images.path(), "leaf.png", [20, 230, 30]);
    write_gray_png(images.path(), "stone.png", 120);

    let bus: Arc<dyn MessageBus> =
        Arc::new(SpoolBus::connect(spool.path(), Duration::from_millis(5)).unwrap());
    let loader = ingestor(
        Arc::clone(&bus),
        Arc::new(MemoryDedupIndex::new()),
        "hostA",
        100,
        RetryPolicy::none(),
    );
    let report = loader.ingest_dir(images.path()).await.unwrap();
    assert_eq!(report.published.len(), 2);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let processor = ProcessPipeline::new(
        Arc::clone(&bus),
        Arc::new(RasterCodec::new()),
        &ProcessConfig::default(),
        RetryPolicy::none(),
    )
    .with_channels(LOAD, PROCESSED, SORTED)
    .with_palette(red_green_palette())
    .with_result_sink(tx);
    let (stop_tx, stop_rx) = watch::channel(false);

    let driver = async {
        let mut results = Vec::new();
        while results.len() < 2 {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
                Ok(Some(result)) => results.push(result),
                _ => break,
            }
        }
        stop_tx.send(true).unwrap();
        results
    };
    let (stats, mut results) = tokio::join!(processor.run(stop_rx), driver);
    assert_eq!(stats.unwrap().completed, 2);

    results.sort_by(|a, b| a.identity.cmp(&b.identity));
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].identity.as_str(), "hostA:leaf.png");
    assert_eq!(results[0].palette_index, 1);
    assert_eq!(results[1].identity.as_str(), "hostA:stone.png");
}

#[tokio::test]
async fn stalled_transfer_is_evicted_and_reported() {
    let bus = Arc::new(MemoryBus::new());
    let processor = ProcessPipeline::new(
        bus.clone(),
        Arc::new(RasterCodec::new()),
        &ProcessConfig {
            stall_timeout_ms: 50,
            sweep_interval_ms: 10,
        },
        RetryPolicy::none(),
    )
    .with_channels(LOAD, PROCESSED, SORTED);

    assert!(processor
        .handle_message(b"hostA:lost.png|0|3|abc")
        .await
        .is_none());
    assert!(processor
        .handle_message(b"hostA:lost.png|2|3|ghi")
        .await
        .is_none());
    assert_eq!(processor.reassembler().in_flight(), 1);

    assert_eq!(processor.sweep(Instant::now()), 0);
    let later = Instant::now() + Duration::from_millis(200);
    assert_eq!(processor.sweep(later), 1);
    assert_eq!(processor.reassembler().in_flight(), 0);
    assert_eq!(processor.stats().stalled, 1);
    assert!(bus.published(PROCESSED).is_empty());
}
