//! Fetching source assets.
//!
//! [`DownloadOrchestrator`] picks a [`FetchStrategy`] per source, gates
//! concurrency with a semaphore and tracks each transfer so it can be
//! observed or cancelled by id.

mod extractor;
mod http;
mod manager;
mod resilience;
mod strategy;
mod types;

pub use extractor::{
    DEFAULT_FORMAT, ExtractorProgress, ExtractorStrategy, SUPPORTED_DOMAINS, parse_download_line,
};
pub use http::{HttpStrategy, container_from_mime};
pub use manager::{DownloadOrchestrator, TransferInfo, output_path};
pub use resilience::{RetryConfig, retry_with_backoff};
pub use strategy::FetchStrategy;
pub use types::{
    BatchReport, FetchFailure, FetchOptions, FetchOutcome, NoopTransferSink, SourceRef,
    TransferProgress, TransferReporter, TransferSink, TransferState, transfer_id,
};
