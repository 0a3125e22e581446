//! Recombining segments and episodes into one deliverable.
//!
//! A single valid input is copied. Inputs that agree on codec, resolution
//! and frame rate are stream-copied through the concat demuxer; anything
//! else is re-encoded through a concat filter graph.

mod engine;
mod types;

pub use engine::{MergeEngine, MergeProgress, concat_filter_graph};
pub use types::{Chapter, MergeConfig, MergeMethod, MergeResult};
