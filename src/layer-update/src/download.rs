//! Resumable payload download with durable checkpoints.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{UpdateError, UpdateResult};
use crate::manifest::UpdateManifest;

/// Progress information during download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes flushed to the staging file so far
    pub downloaded: u64,
    /// Total bytes to download
    pub total: u64,
}

impl DownloadProgress {
    /// Get download progress as a percentage (0-100).
    pub fn percentage(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        (self.downloaded as f32 / self.total as f32) * 100.0
    }

    /// Get human-readable downloaded size.
    pub fn downloaded_human(&self) -> String {
        format_bytes(self.downloaded)
    }

    /// Get human-readable total size.
    pub fn total_human(&self) -> String {
        format_bytes(self.total)
    }
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Receives durable progress from the downloader.
///
/// Every reported byte count has already been synced to the staging file. A
/// report lower than the previous one means the transfer restarted.
#[async_trait]
pub trait CheckpointSink: Send {
    async fn checkpoint(&mut self, progress: DownloadProgress) -> UpdateResult<()>;
}

/// An open payload transfer.
pub struct TransferStream {
    /// Offset the body starts at; 0 when the remote ignored the range request
    pub resumed_from: u64,
    pub body: BoxStream<'static, UpdateResult<Bytes>>,
}

/// Byte source for payloads.
#[async_trait]
pub trait PayloadTransport: Send + Sync {
    /// Open `url` starting at byte `offset`.
    async fn open(&self, url: &str, offset: u64) -> UpdateResult<TransferStream>;
}

/// HTTP transport using byte-range requests when resuming.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn request(&self, url: &str, offset: Option<u64>) -> UpdateResult<reqwest::Response> {
        let mut request = self.client.get(url);
        if let Some(offset) = offset {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        request
            .send()
            .await
            .map_err(|e| UpdateError::DownloadFailed {
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl PayloadTransport for HttpTransport {
    async fn open(&self, url: &str, offset: u64) -> UpdateResult<TransferStream> {
        let mut response = self.request(url, (offset > 0).then_some(offset)).await?;

        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            debug!(offset, "Range not satisfiable, requesting full payload");
            response = self.request(url, None).await?;
        }

        let status = response.status();
        let resumed_from = if status == StatusCode::PARTIAL_CONTENT {
            let start = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(content_range_start);
            match start {
                Some(start) if start == offset => offset,
                other => {
                    return Err(UpdateError::DownloadFailed {
                        message: format!(
                            "server returned range starting at {:?}, requested {}",
                            other, offset
                        ),
                    });
                }
            }
        } else if status.is_success() {
            0
        } else {
            return Err(UpdateError::ServerError {
                status: status.as_u16(),
                message: format!("payload request for {} failed", url),
            });
        };

        let body = response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| UpdateError::DownloadFailed {
                    message: e.to_string(),
                })
            })
            .boxed();

        Ok(TransferStream { resumed_from, body })
    }
}

/// Parse the start offset of a `Content-Range: bytes start-end/total` header.
fn content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

/// A payload fully written to the staging location.
///
/// Owned by the cycle that produced it and deleted with [`discard`] once the
/// cycle ends.
///
/// [`discard`]: DownloadedPayload::discard
#[derive(Debug)]
pub struct DownloadedPayload {
    path: PathBuf,
    manifest: UpdateManifest,
}

impl DownloadedPayload {
    pub(crate) fn new(path: PathBuf, manifest: UpdateManifest) -> Self {
        Self { path, manifest }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &UpdateManifest {
        &self.manifest
    }

    /// Expected payload size in bytes.
    pub fn size(&self) -> u64 {
        self.manifest.payload_size
    }

    /// Delete the staging file.
    pub async fn discard(self) -> UpdateResult<()> {
        remove_if_exists(&self.path).await
    }
}

pub(crate) async fn remove_if_exists(path: &Path) -> UpdateResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Downloads payloads into a single staging file, resuming where the last
/// checkpoint left off.
pub struct PackageDownloader {
    transport: Arc<dyn PayloadTransport>,
    staging_path: PathBuf,
    chunk_timeout: Duration,
    checkpoint_interval: u64,
}

impl PackageDownloader {
    pub fn new(
        transport: Arc<dyn PayloadTransport>,
        staging_path: impl Into<PathBuf>,
        chunk_timeout: Duration,
        checkpoint_interval: u64,
    ) -> Self {
        Self {
            transport,
            staging_path: staging_path.into(),
            chunk_timeout,
            checkpoint_interval: checkpoint_interval.max(1),
        }
    }

    /// The payload currently in the staging file, for cycles resumed past
    /// the download stage.
    pub fn staged_payload(&self, manifest: &UpdateManifest) -> DownloadedPayload {
        DownloadedPayload::new(self.staging_path.clone(), manifest.clone())
    }

    /// Delete whatever is in the staging file.
    pub async fn clear_staging(&self) -> UpdateResult<()> {
        remove_if_exists(&self.staging_path).await
    }

    /// Download the manifest's payload, continuing from `resume_offset`.
    ///
    /// Bytes already on disk beyond `resume_offset` are discarded because
    /// they were never checkpointed. Progress is reported to `sink` every
    /// `checkpoint_interval` bytes and whenever the transfer stops, so an
    /// interrupted download resumes from its last flushed byte.
    pub async fn download(
        &self,
        manifest: &UpdateManifest,
        resume_offset: u64,
        sink: &mut dyn CheckpointSink,
        cancel: &CancellationToken,
    ) -> UpdateResult<DownloadedPayload> {
        let total = manifest.payload_size;

        if let Some(parent) = self.staging_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.staging_path)
            .await?;

        let on_disk = file.metadata().await?.len();
        let mut offset = resume_offset.min(on_disk).min(total);
        if offset < resume_offset {
            warn!(
                checkpoint = resume_offset,
                on_disk, "Staging file shorter than checkpoint, resuming from its end"
            );
        }

        if offset == total {
            file.set_len(total).await?;
            file.sync_all().await?;
            sink.checkpoint(DownloadProgress {
                downloaded: total,
                total,
            })
            .await?;
            return Ok(self.staged_payload(manifest));
        }

        let transfer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            opened = tokio::time::timeout(
                self.chunk_timeout,
                self.transport.open(&manifest.download_url, offset),
            ) => opened.map_err(|_| self.chunk_timeout_error())??,
        };

        if transfer.resumed_from != offset {
            if transfer.resumed_from != 0 {
                return Err(UpdateError::DownloadFailed {
                    message: format!(
                        "transport resumed at {}, requested {}",
                        transfer.resumed_from, offset
                    ),
                });
            }
            info!(offset, "Remote does not support partial fetch, restarting download");
            offset = 0;
        }

        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.sync_all().await?;
        sink.checkpoint(DownloadProgress {
            downloaded: offset,
            total,
        })
        .await?;

        info!(
            url = %manifest.download_url,
            offset,
            total = %format_bytes(total),
            "Downloading payload"
        );

        let mut body = transfer.body;
        let mut written = offset;
        let mut unsynced: u64 = 0;

        let result: UpdateResult<()> = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(UpdateError::Cancelled),
                next = tokio::time::timeout(self.chunk_timeout, body.next()) => next,
            };

            let chunk = match next {
                Err(_) => break Err(self.chunk_timeout_error()),
                Ok(None) => break Ok(()),
                Ok(Some(Err(e))) => break Err(e),
                Ok(Some(Ok(chunk))) => chunk,
            };

            let len = chunk.len() as u64;
            if written + len > total {
                break Err(UpdateError::DownloadFailed {
                    message: format!("payload larger than the {} bytes announced", total),
                });
            }
            if let Err(e) = file.write_all(&chunk).await {
                break Err(e.into());
            }
            written += len;
            unsynced += len;

            if unsynced >= self.checkpoint_interval {
                if let Err(e) = sync(&mut file).await {
                    break Err(e);
                }
                unsynced = 0;
                let progress = DownloadProgress {
                    downloaded: written,
                    total,
                };
                debug!(
                    downloaded = %progress.downloaded_human(),
                    total = %progress.total_human(),
                    percent = progress.percentage(),
                    "Download checkpoint"
                );
                if let Err(e) = sink.checkpoint(progress).await {
                    break Err(e);
                }
            }
        };

        // Record whatever made it to disk before reporting the outcome; if
        // the sync fails the previous checkpoint stands.
        sync(&mut file).await?;
        if unsynced > 0 {
            let progress = DownloadProgress {
                downloaded: written,
                total,
            };
            match (sink.checkpoint(progress).await, &result) {
                (Err(e), Ok(())) => return Err(e),
                (Err(e), Err(_)) => {
                    warn!(error = %e, "Failed to record final download checkpoint");
                }
                (Ok(()), _) => {}
            }
        }

        result?;

        if written != total {
            return Err(UpdateError::DownloadFailed {
                message: format!("transfer ended at {} of {} bytes", written, total),
            });
        }

        Ok(self.staged_payload(manifest))
    }

    fn chunk_timeout_error(&self) -> UpdateError {
        UpdateError::Timeout {
            operation: "Payload chunk read",
            seconds: self.chunk_timeout.as_secs(),
        }
    }
}

async fn sync(file: &mut fs::File) -> UpdateResult<()> {
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}
