//! Processing Pipeline
//!
//! Reassembles chunked images from the load channel, computes their color
//! signatures and hands them on for classification. Chunks are handled one at a
//! time in delivery order; partial transfers that stop making progress are
//! evicted on a timer.

pub mod pipeline;
pub mod reassembler;

pub use pipeline::{
    PipelineStats, ProcessConfig, ProcessPipeline, Processed, ResultSink, SortPipeline,
};
pub use reassembler::{Accepted, Reassembler};
