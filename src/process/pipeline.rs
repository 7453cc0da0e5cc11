//! Consumer loops for the `process` and `sort` commands.

use super::reassembler::{Accepted, Reassembler};
use crate::bus::{publish_with_retry, MessageBus};
use crate::classify::{classify, ClassificationResult, ColorSignature, Palette};
use crate::error::SorterError;
use crate::imaging::ImageCodec;
use crate::retry::RetryPolicy;
use crate::types::LogicalIdentity;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Processing settings (`[process]` in the config file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Evict a partial transfer after this long without a new chunk (milliseconds)
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
    /// How often stalled transfers are looked for (milliseconds)
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_stall_timeout_ms() -> u64 {
    30_000
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            stall_timeout_ms: default_stall_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

/// Counters reported when a consumer loop stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub received: usize,
    pub completed: usize,
    pub classified: usize,
    pub dropped: usize,
    pub stalled: usize,
    pub failed: usize,
}

/// What became of one fully reassembled image.
#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    pub identity: LogicalIdentity,
    pub signature: ColorSignature,
    pub classification: Option<ClassificationResult>,
}

/// Sink for classification results, e.g. the CLI printer.
pub type ResultSink = mpsc::UnboundedSender<ClassificationResult>;

/// Consumes chunk messages, reassembles images and publishes their color
/// signatures; with a palette it also classifies them inline.
pub struct ProcessPipeline {
    bus: Arc<dyn MessageBus>,
    codec: Arc<dyn ImageCodec>,
    reassembler: Reassembler,
    palette: Option<Palette>,
    load_channel: String,
    process_channel: String,
    sort_channel: String,
    sweep_interval: Duration,
    retry: RetryPolicy,
    results: Option<ResultSink>,
    stats: RwLock<PipelineStats>,
}

impl ProcessPipeline {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        codec: Arc<dyn ImageCodec>,
        config: &ProcessConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            bus,
            codec,
            reassembler: Reassembler::new(Duration::from_millis(config.stall_timeout_ms)),
            palette: None,
            load_channel: "kmsorter.load".to_string(),
            process_channel: "kmsorter.processed".to_string(),
            sort_channel: "kmsorter.sorted".to_string(),
            sweep_interval: Duration::from_millis(config.sweep_interval_ms.max(1)),
            retry,
            results: None,
            stats: RwLock::new(PipelineStats::default()),
        }
    }

    pub fn with_channels(
        mut self,
        load: impl Into<String>,
        process: impl Into<String>,
        sort: impl Into<String>,
    ) -> Self {
        self.load_channel = load.into();
        self.process_channel = process.into();
        self.sort_channel = sort.into();
        self
    }

    /// Classify completed images against `palette` as well.
    pub fn with_palette(mut self, palette: Palette) -> Self {
        self.palette = Some(palette);
        self
    }

    pub fn with_result_sink(mut self, sink: ResultSink) -> Self {
        self.results = Some(sink);
        self
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.read().clone()
    }

    /// Consume the load channel until `shutdown` flips to true or the
    /// subscription ends.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PipelineStats, SorterError> {
        let mut subscription = self.bus.subscribe(&self.load_channel).await?;
        let mut sweep = tokio::time::interval(self.sweep_interval);
        info!(channel = %self.load_channel, "Processing loaded images");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                message = subscription.recv() => match message {
                    Some(message) => {
                        self.handle_message(&message).await;
                    }
                    None => {
                        warn!(channel = %self.load_channel, "Subscription closed");
                        break;
                    }
                },
                _ = sweep.tick() => {
                    self.sweep(Instant::now());
                }
            }
        }

        let stats = self.stats();
        info!(
            received = stats.received,
            completed = stats.completed,
            dropped = stats.dropped,
            stalled = stats.stalled,
            in_flight = self.reassembler.in_flight(),
            "Processor stopped"
        );
        Ok(stats)
    }

    /// Handle one chunk message. Returns the processed image once its last chunk
    /// arrives; every failure is logged and counted, never propagated.
    pub async fn handle_message(&self, message: &[u8]) -> Option<Processed> {
        self.stats.write().received += 1;

        let (identity, bytes) = match self.reassembler.accept(message) {
            Ok(Accepted::Complete { identity, bytes }) => (identity, bytes),
            Ok(Accepted::Pending { .. }) => return None,
            Err(e) => {
                warn!(error = %e, "Dropping chunk message");
                self.stats.write().dropped += 1;
                return None;
            }
        };
        self.stats.write().completed += 1;

        match self.finish(identity.clone(), bytes).await {
            Ok(processed) => Some(processed),
            Err(e) => {
                warn!(identity = %identity, error = %e, "Failed to process image");
                self.stats.write().failed += 1;
                None
            }
        }
    }

    async fn finish(
        &self,
        identity: LogicalIdentity,
        bytes: Vec<u8>,
    ) -> Result<Processed, SorterError> {
        let codec = Arc::clone(&self.codec);
        let pixels = tokio::task::spawn_blocking(move || codec.decode(&bytes)).await??;
        let signature = ColorSignature::from_pixels(&pixels).ok_or_else(|| {
            SorterError::Image(format!("image {} has no pixels", identity))
        })?;
        publish_with_retry(
            self.bus.as_ref(),
            &self.retry,
            &self.process_channel,
            &signature.to_wire(&identity),
        )
        .await?;
        info!(
            identity = %identity,
            r = signature.r,
            g = signature.g,
            b = signature.b,
            "Processed image"
        );

        let classification = match &self.palette {
            Some(palette) => {
                let result = classify(identity.clone(), signature, palette);
                emit_result(
                    self.bus.as_ref(),
                    &self.retry,
                    &self.sort_channel,
                    self.results.as_ref(),
                    &result,
                )
                .await?;
                self.stats.write().classified += 1;
                Some(result)
            }
            None => None,
        };

        Ok(Processed {
            identity,
            signature,
            classification,
        })
    }

    /// Evict stalled transfers; returns how many were dropped.
    pub fn sweep(&self, now: Instant) -> usize {
        let evicted = self.reassembler.evict_stalled(now);
        if !evicted.is_empty() {
            self.stats.write().stalled += evicted.len();
        }
        evicted.len()
    }
}

/// Publish a classification result as JSON and hand it to the local sink.
async fn emit_result(
    bus: &dyn MessageBus,
    retry: &RetryPolicy,
    channel: &str,
    sink: Option<&ResultSink>,
    result: &ClassificationResult,
) -> Result<(), SorterError> {
    let payload = serde_json::to_vec(result)?;
    publish_with_retry(bus, retry, channel, &payload).await?;
    if let Some(sink) = sink {
        if sink.send(result.clone()).is_err() {
            debug!("Result sink closed");
        }
    }
    Ok(())
}

/// Consumes color signatures and classifies each against a palette.
pub struct SortPipeline {
    bus: Arc<dyn MessageBus>,
    palette: Palette,
    process_channel: String,
    sort_channel: String,
    retry: RetryPolicy,
    results: Option<ResultSink>,
    stats: RwLock<PipelineStats>,
}

impl SortPipeline {
    pub fn new(bus: Arc<dyn MessageBus>, palette: Palette, retry: RetryPolicy) -> Self {
        Self {
            bus,
            palette,
            process_channel: "kmsorter.processed".to_string(),
            sort_channel: "kmsorter.sorted".to_string(),
            retry,
            results: None,
            stats: RwLock::new(PipelineStats::default()),
        }
    }

    pub fn with_channels(mut self, process: impl Into<String>, sort: impl Into<String>) -> Self {
        self.process_channel = process.into();
        self.sort_channel = sort.into();
        self
    }

    pub fn with_result_sink(mut self, sink: ResultSink) -> Self {
        self.results = Some(sink);
        self
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.read().clone()
    }

    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PipelineStats, SorterError> {
        let mut subscription = self.bus.subscribe(&self.process_channel).await?;
        info!(
            channel = %self.process_channel,
            palette = self.palette.len(),
            "Sorting processed images"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                message = subscription.recv() => match message {
                    Some(message) => {
                        self.handle_message(&message).await;
                    }
                    None => {
                        warn!(channel = %self.process_channel, "Subscription closed");
                        break;
                    }
                },
            }
        }

        let stats = self.stats();
        info!(
            received = stats.received,
            classified = stats.classified,
            dropped = stats.dropped,
            "Sorter stopped"
        );
        Ok(stats)
    }

    pub async fn handle_message(&self, message: &[u8]) -> Option<ClassificationResult> {
        self.stats.write().received += 1;
        let (signature, identity) = match ColorSignature::parse_wire(message) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Dropping signature message");
                self.stats.write().dropped += 1;
                return None;
            }
        };

        let result = classify(identity, signature, &self.palette);
        match emit_result(
            self.bus.as_ref(),
            &self.retry,
            &self.sort_channel,
            self.results.as_ref(),
            &result,
        )
        .await
        {
            Ok(()) => {
                debug!(
                    identity = %result.identity,
                    color = %result.color,
                    distance = result.distance,
                    "Classified image"
                );
                self.stats.write().classified += 1;
                Some(result)
            }
            Err(e) => {
                warn!(identity = %result.identity, error = %e, "Failed to publish classification");
                self.stats.write().failed += 1;
                None
            }
        }
    }
}
