//! Segmentation and parallel encoding.
//!
//! A source is probed, cut into stream-copied segments of fixed duration,
//! and each segment is re-encoded under a concurrency gate with parameters
//! negotiated once per file. Compress-only runs first sample the source to
//! tune quality and rate control.

mod analysis;
mod encoder;
mod parallel;
mod profile;
mod segmenter;

pub use analysis::{
    ContentAnalysis, ContentAnalyzer, ContentComplexity, SampleScore, determine_complexity,
    recommend, sample_windows,
};
pub use encoder::{
    EncodeProgressSink, EncodeSettings, FfmpegEncoder, NoopEncodeSink, SegmentEncoder,
    TargetResolution,
};
pub use parallel::{EncodeReport, ParallelEncoder};
pub use profile::CompressionProfile;
pub use segmenter::{Segment, SegmentReport, Segmenter, cleanup, plan_segments};
