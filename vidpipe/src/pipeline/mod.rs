//! Pipeline orchestration.
//!
//! A run moves through download, process and merge stages according to its
//! [`ProcessingMode`]. The [`PipelineOrchestrator`] owns the run registry,
//! aggregates weighted progress and reports every transition to a
//! [`JobStateSink`].

mod orchestrator;
mod progress;
mod request;
mod run;
mod sink;
mod stages;
mod status;

pub use orchestrator::{DEFAULT_RUN_HISTORY, PipelineOrchestrator, merged_name, process_jobs};
pub use progress::{ProgressTracker, StageWeights};
pub use request::PipelineRequest;
pub use run::{PipelineRun, RunReport};
pub use sink::{ChannelSink, JobStateSink, NoopSink, RunEvent};
pub use stages::{
    DownloadStage, MergeStage, ProcessJob, ProcessStage, SegmentedProcessor, StageContext,
    StageOutput, StageProgress,
};
pub use status::{ProcessingMode, RunStatus, Stage};
