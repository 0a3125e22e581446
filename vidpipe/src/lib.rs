//! vidpipe library crate.
//!
//! A video pipeline engine: downloads remote assets, cuts them into
//! segments, encodes the segments in parallel on the best available
//! hardware, and merges the results into a single deliverable.

pub mod config;
pub mod dispatch;
pub mod downloader;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod media;
pub mod merge;
pub mod pipeline;
pub mod processing;
pub mod utils;

pub use error::{Error, Result};
