//! Plain HTTP(S) downloads with range resume.

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, RANGE};
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::strategy::FetchStrategy;
use super::types::{FetchOptions, SourceRef, TransferReporter};
use crate::media::MediaDescriptor;
use crate::utils::filename::{extension_from_url, file_name_from_url};
use crate::utils::fs::{ensure_parent_dir, file_size, io_error};
use crate::{Error, Result};

/// Streams a URL to disk with `reqwest`.
///
/// When a partial file already exists the request carries
/// `Range: bytes=N-`. A `206` appends; any other success status means the
/// server ignored the range and the file is rewritten from the start.
pub struct HttpStrategy {
    client: Client,
}

impl HttpStrategy {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn headers(options: &FetchOptions) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (key, value) in &options.headers {
            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %key, "Skipping invalid header"),
            }
        }
        headers
    }
}

/// Map a `Content-Type` onto a container extension.
pub fn container_from_mime(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next()?.trim().to_ascii_lowercase();
    let ext = match essence.as_str() {
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/x-matroska" => "mkv",
        "video/quicktime" => "mov",
        "video/x-flv" => "flv",
        "video/mp2t" => "ts",
        "video/x-msvideo" => "avi",
        _ => return None,
    };
    Some(ext)
}

#[async_trait]
impl FetchStrategy for HttpStrategy {
    fn name(&self) -> &'static str {
        "http"
    }

    fn supports_source(&self, source: &SourceRef) -> bool {
        source.is_remote()
    }

    async fn probe_metadata(
        &self,
        source: &SourceRef,
        cancel: &CancellationToken,
    ) -> Result<MediaDescriptor> {
        let url = source
            .url()
            .ok_or_else(|| Error::fetch(&source.location, "not a valid URL"))?;
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = self.client.head(url.clone()).send() => response?,
        };
        if !response.status().is_success() {
            return Err(Error::fetch(
                &source.location,
                format!("HEAD returned {}", response.status()),
            ));
        }

        let container = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(container_from_mime)
            .map(str::to_string)
            .or_else(|| extension_from_url(&url));
        let title = file_name_from_url(&url).map(|name| match name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => name,
        });

        Ok(MediaDescriptor {
            title,
            source_url: Some(source.location.clone()),
            container,
            size_bytes: response.content_length(),
            ..Default::default()
        })
    }

    async fn fetch(
        &self,
        source: &SourceRef,
        dest: &Path,
        options: &FetchOptions,
        reporter: &TransferReporter,
        cancel: &CancellationToken,
    ) -> Result<MediaDescriptor> {
        let url = source
            .url()
            .ok_or_else(|| Error::fetch(&source.location, "not a valid URL"))?;
        ensure_parent_dir(dest).await?;

        let existing = if options.resume {
            file_size(dest).await.unwrap_or(0)
        } else {
            0
        };

        let mut request = self.client.get(url).headers(Self::headers(options));
        if existing > 0 {
            request = request.header(RANGE, format!("bytes={}-", existing));
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = request.send() => r?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(Error::fetch(
                &source.location,
                format!("server returned {}", status),
            ));
        }

        let append = existing > 0 && status == StatusCode::PARTIAL_CONTENT;
        if existing > 0 && !append {
            warn!(
                transfer_id = reporter.transfer_id(),
                status = %status,
                partial_bytes = existing,
                "Server ignored range request, restarting download"
            );
        }
        let offset = if append { existing } else { 0 };
        let total = response.content_length().map(|len| len + offset);
        let container = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(container_from_mime)
            .map(str::to_string);

        let mut file = if append {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(dest)
                .await
                .map_err(|e| io_error("opening partial file", dest, e))?
        } else {
            tokio::fs::File::create(dest)
                .await
                .map_err(|e| io_error("creating file", dest, e))?
        };

        let started = Instant::now();
        let mut written = offset;
        let mut stream = response.bytes_stream();
        reporter.update(written, total, 0.0, None);

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = file.flush().await;
                    return Err(Error::Cancelled);
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| io_error("writing download", dest, e))?;
            written += chunk.len() as u64;

            let elapsed = started.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 {
                (written - offset) as f64 / elapsed
            } else {
                0.0
            };
            let eta = match total {
                Some(t) if rate > 0.0 => Some(t.saturating_sub(written) as f64 / rate),
                _ => None,
            };
            reporter.update(written, total, rate, eta);
        }

        file.flush()
            .await
            .map_err(|e| io_error("flushing download", dest, e))?;

        if let Some(expected) = total
            && written < expected
        {
            return Err(Error::fetch(
                &source.location,
                format!("connection closed after {} of {} bytes", written, expected),
            ));
        }

        debug!(
            transfer_id = reporter.transfer_id(),
            bytes = written,
            resumed_from = offset,
            "HTTP download finished"
        );

        Ok(MediaDescriptor {
            path: Some(dest.to_path_buf()),
            source_url: Some(source.location.clone()),
            container,
            size_bytes: Some(written),
            ..Default::default()
        })
    }
}
