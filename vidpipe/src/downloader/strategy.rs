//! Fetch strategy trait.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::types::{FetchOptions, SourceRef, TransferReporter};
use crate::Result;
use crate::media::MediaDescriptor;

/// One way of bringing a remote asset onto local disk.
///
/// Strategies are kept in an ordered list; the first one whose
/// [`supports_source`](Self::supports_source) returns true handles the source.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn supports_source(&self, source: &SourceRef) -> bool;

    /// Resolve title, duration and container without downloading.
    async fn probe_metadata(
        &self,
        source: &SourceRef,
        cancel: &CancellationToken,
    ) -> Result<MediaDescriptor>;

    /// Download `source` to `dest`, returning what is known about the result.
    ///
    /// Must return [`Error::Cancelled`](crate::Error::Cancelled) promptly once
    /// `cancel` fires.
    async fn fetch(
        &self,
        source: &SourceRef,
        dest: &Path,
        options: &FetchOptions,
        reporter: &TransferReporter,
        cancel: &CancellationToken,
    ) -> Result<MediaDescriptor>;
}
