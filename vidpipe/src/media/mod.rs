//! Media tooling shared by the processing and merge stages.
//!
//! Covers probing, external tool invocation with timeouts and cancellation,
//! and parsing of the tools' line-oriented progress output.

mod command;
mod descriptor;
mod probe;
mod progress;
mod records;

pub use command::{
    ProcessRunner, RecordSink, ToolInvocation, ToolOutput, ToolRunner, require_input,
    spawn_process_waiter,
};
pub use descriptor::{
    DEFAULT_FRAME_RATE, FRAME_RATE_TOLERANCE, MediaDescriptor, parse_frame_rate,
};
pub use probe::{FfprobeProbe, MediaProbe};
pub use progress::{
    EncodeProgress, ProgressParser, parse_bitrate_kbps, parse_size, parse_speed,
    parse_stats_line, parse_time, tokens,
};
pub use records::RecordReader;
