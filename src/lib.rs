//! kmsorter: Distributed Image Sorting
//!
//! Loader agents normalize images, deduplicate them against a shared index and
//! publish them in chunks over a message bus. Processor agents reassemble the
//! chunks and compute each image's mean color; sorter agents assign every image to
//! the nearest color of an operator palette.

pub mod bus;
pub mod classify;
pub mod codec;
pub mod concurrency;
pub mod config;
pub mod dedup;
pub mod error;
pub mod imaging;
pub mod ingest;
pub mod logging;
pub mod process;
pub mod retry;
pub mod store;
pub mod tooling;
pub mod types;
