use image::{GrayImage, Luma, Rgb, RgbImage};
use kmsorter::bus::MessageBus;
use kmsorter::dedup::{DedupCoordinator, DedupScope};
use kmsorter::imaging::RasterCodec;
use kmsorter::ingest::{IngestConfig, Ingestor};
use kmsorter::retry::RetryPolicy;
use kmsorter::store::DedupIndex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const LOAD: &str = "kmsorter.load";
pub const PROCESSED: &str = "kmsorter.processed";
pub const SORTED: &str = "kmsorter.sorted";

pub fn fast_retry(max_attempts: usize) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 2,
    }
}

pub fn ingestor(
    bus: Arc<dyn MessageBus>,
    index: Arc<dyn DedupIndex>,
    host: &str,
    chunk_size: usize,
    retry: RetryPolicy,
) -> Ingestor {
    let coordinator = Arc::new(DedupCoordinator::new(index, DedupScope::Global, retry));
    Ingestor::new(
        bus,
        coordinator,
        Arc::new(RasterCodec::new()),
        LOAD,
        IngestConfig {
            host: Some(host.to_string()),
            chunk_size,
            ..IngestConfig::default()
        },
        retry,
    )
    .unwrap()
}

/// Write a solid-color RGB PNG with a small gradient so it spans several chunks.
pub fn write_rgb_png(dir: &Path, name: &str, color: [u8; 3]) -> PathBuf {
    let path = dir.join(name);
    let img = RgbImage::from_fn(16, 16, |x, y| {
        if (x + y) % 2 == 0 {
            Rgb(color)
        } else {
            Rgb([color[0] / 2, color[1] / 2, color[2] / 2])
        }
    });
    img.save(&path).unwrap();
    path
}

pub fn write_gray_png(dir: &Path, name: &str, level: u8) -> PathBuf {
    let path = dir.join(name);
    GrayImage::from_fn(12, 9, |x, _| Luma([level.wrapping_add(x as u8)]))
        .save(&path)
        .unwrap();
    path
}
