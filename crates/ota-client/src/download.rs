//! Chunked range downloader.
//!
//! Content is fetched in [`CHUNK_SIZE`] ranges over a single session and
//! pushed into a [`Sink`] as it arrives, so an image never has to fit in
//! memory. The server's `Content-Range` total is authoritative for when the
//! download is complete.
//!
//! A transient failure (socket error, timeout, connection dropped mid-range)
//! costs one reconnect-and-retry, resuming at the first missing byte. A
//! second failure without any progress in between ends the download.
//! A range that completes without delivering a byte is a protocol error, so
//! every completed range either moves the download forward or ends it.

use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::connection::{BoxedSession, Connector};
use crate::error::UpdateError;
use crate::flash::{FlashRegion, FlashStorage};
use crate::http::{self, RECV_BUF_LEN};
use crate::redirect::Endpoint;
use crate::writer::DeferredCommitWriter;

/// Bytes requested per range.
pub const CHUNK_SIZE: u32 = 4096;

/// Destination of downloaded bytes.
pub trait Sink: Send {
    /// Accept `bytes` at absolute `offset`. Offsets arrive in order.
    fn accept(&mut self, offset: u32, bytes: &[u8]) -> Result<(), UpdateError>;
}

/// Collects content into a caller-provided buffer.
pub struct MemorySink<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> MemorySink<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    /// Bytes received so far.
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl Sink for MemorySink<'_> {
    fn accept(&mut self, offset: u32, bytes: &[u8]) -> Result<(), UpdateError> {
        let start = offset as usize;
        let end = start + bytes.len();
        let capacity = self.buf.len();
        let target = self
            .buf
            .get_mut(start..end)
            .ok_or(UpdateError::BufferTooSmall {
                capacity,
                needed: end,
            })?;
        target.copy_from_slice(bytes);
        self.len = self.len.max(end);
        Ok(())
    }
}

/// Streams content into a flash region through the deferred-commit writer.
pub struct FlashSink<'a, F> {
    writer: &'a mut DeferredCommitWriter<F>,
    region: FlashRegion,
}

impl<'a, F: FlashStorage> FlashSink<'a, F> {
    pub fn new(writer: &'a mut DeferredCommitWriter<F>, region: FlashRegion) -> Self {
        Self { writer, region }
    }
}

impl<F: FlashStorage> Sink for FlashSink<'_, F> {
    fn accept(&mut self, offset: u32, bytes: &[u8]) -> Result<(), UpdateError> {
        self.writer.write(self.region, offset, bytes)?;
        Ok(())
    }
}

/// Download progress: bytes stored and the advertised total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes handed to the sink so far.
    pub collected: u32,
    /// Total size from the server, once known.
    pub total: Option<u32>,
}

impl DownloadProgress {
    pub fn is_complete(&self) -> bool {
        self.total.is_some_and(|total| self.collected >= total)
    }

    /// Download progress as a percentage (0.0 to 100.0).
    pub fn percentage(&self) -> f64 {
        match self.total {
            Some(0) | None => 0.0,
            Some(total) => (self.collected as f64 / total as f64) * 100.0,
        }
    }
}

impl std::fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.total {
            Some(total) => write!(
                f,
                "{}/{} bytes ({:.1}%)",
                self.collected,
                total,
                self.percentage()
            ),
            None => write!(f, "{} bytes", self.collected),
        }
    }
}

/// How one range request ended.
enum ChunkEnd {
    /// Response body fully received.
    Complete { keep_alive: bool },
    /// Peer closed the connection before the body was complete.
    Closed,
}

/// Fetches content from a resolved endpoint in fixed-size ranges.
pub struct Downloader<'a> {
    connector: &'a mut dyn Connector,
    network: &'a NetworkConfig,
}

impl<'a> Downloader<'a> {
    pub fn new(connector: &'a mut dyn Connector, network: &'a NetworkConfig) -> Self {
        Self { connector, network }
    }

    /// Download the content at `endpoint` into `sink`.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - Final location, as returned by the redirect resolver
    /// * `sink` - Where the bytes go
    /// * `max_len` - Largest acceptable total size
    ///
    /// # Returns
    ///
    /// The number of bytes handed to the sink. This is the full size unless
    /// the server closed cleanly mid-download after a retry; callers compare
    /// it with the size they expect.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::TooLarge`] when the advertised total exceeds `max_len`
    /// - [`UpdateError::Server`] / [`UpdateError::Protocol`] for unusable responses
    /// - [`UpdateError::DownloadFailed`] after a failed retry
    /// - sink errors ([`UpdateError::BufferTooSmall`], flash errors) as-is
    pub async fn download(
        &mut self,
        endpoint: &Endpoint,
        sink: &mut dyn Sink,
        max_len: u32,
    ) -> Result<u32, UpdateError> {
        info!("Starting download: {}", endpoint);

        let mut progress = DownloadProgress::default();
        let mut session = match self.open(endpoint).await {
            Ok(session) => session,
            Err(e) if e.is_transient() => {
                warn!("Connect to {} failed ({}), retrying once", endpoint.host, e);
                self.reopen(endpoint, &progress, e).await?
            }
            Err(e) => return Err(e),
        };
        let mut retried = false;

        while !progress.is_complete() {
            let before = progress.collected;
            let result = self
                .fetch_range(&mut session, endpoint, sink, &mut progress, max_len)
                .await;
            if progress.collected > before {
                retried = false;
            }

            let failure = match result {
                Ok(ChunkEnd::Complete { keep_alive }) => {
                    debug!("Range complete: {}", progress);
                    if !keep_alive && !progress.is_complete() {
                        session = self.reopen_after_close(endpoint, &progress).await?;
                    }
                    continue;
                }
                Ok(ChunkEnd::Closed) => None,
                Err(e) if e.is_transient() => Some(e),
                Err(e) => return Err(e),
            };

            if retried {
                return match failure {
                    None if progress.collected > 0 => {
                        warn!("Server closed early, returning truncated download: {}", progress);
                        Ok(progress.collected)
                    }
                    None => Err(closed_early(progress.collected)),
                    Some(e) => Err(UpdateError::DownloadFailed {
                        offset: progress.collected,
                        source: Box::new(e),
                    }),
                };
            }

            retried = true;
            let cause = failure.unwrap_or_else(|| closed_early(progress.collected));
            warn!(
                "Range at byte {} failed ({}), reconnecting",
                progress.collected, cause
            );
            session = self.reopen(endpoint, &progress, cause).await?;
        }

        info!("Download complete: {} bytes", progress.collected);
        Ok(progress.collected)
    }

    async fn open(&mut self, endpoint: &Endpoint) -> Result<BoxedSession, UpdateError> {
        Ok(self
            .connector
            .connect(&endpoint.host, endpoint.port, endpoint.use_tls)
            .await?)
    }

    /// Reconnect after a failure; a failed reconnect ends the download.
    async fn reopen(
        &mut self,
        endpoint: &Endpoint,
        progress: &DownloadProgress,
        cause: UpdateError,
    ) -> Result<BoxedSession, UpdateError> {
        tokio::time::sleep(self.network.reconnect_delay()).await;
        self.open(endpoint).await.map_err(|e| {
            warn!("Reconnect after '{}' failed: {}", cause, e);
            UpdateError::DownloadFailed {
                offset: progress.collected,
                source: Box::new(e),
            }
        })
    }

    /// Reconnect after the server announced it would close the session.
    async fn reopen_after_close(
        &mut self,
        endpoint: &Endpoint,
        progress: &DownloadProgress,
    ) -> Result<BoxedSession, UpdateError> {
        match self.open(endpoint).await {
            Ok(session) => Ok(session),
            Err(e) if e.is_transient() => self.reopen(endpoint, progress, e).await,
            Err(e) => Err(e),
        }
    }

    async fn fetch_range(
        &mut self,
        session: &mut BoxedSession,
        endpoint: &Endpoint,
        sink: &mut dyn Sink,
        progress: &mut DownloadProgress,
        max_len: u32,
    ) -> Result<ChunkEnd, UpdateError> {
        let io_timeout = self.network.io_timeout();
        let start = progress.collected;
        let end = start.saturating_add(CHUNK_SIZE - 1);
        let request = http::range_request(
            &endpoint.host,
            &endpoint.path,
            start,
            end,
            &self.network.user_agent,
        );
        http::send(session, &request, io_timeout).await?;

        let raw = match http::read_head(session, io_timeout).await? {
            Some(raw) => raw,
            None => return Ok(ChunkEnd::Closed),
        };

        let (content_length, total, keep_alive) = {
            let head = raw.head()?;
            let range = match head.status {
                206 => {
                    let range = head.content_range().ok_or_else(|| {
                        UpdateError::Protocol("206 response without Content-Range".to_string())
                    })?;
                    if range.start != start {
                        return Err(UpdateError::Protocol(format!(
                            "asked for byte {start}, server sent {}",
                            range.start
                        )));
                    }
                    Some(range)
                }
                200 if start == 0 => None,
                status => return Err(UpdateError::Server { status }),
            };
            let content_length = head.content_length().ok_or_else(|| {
                UpdateError::Protocol("response without Content-Length".to_string())
            })?;
            let total = range.map_or(content_length, |range| range.total);
            (content_length, total, head.keep_alive())
        };

        if total > max_len {
            return Err(UpdateError::TooLarge {
                size: total,
                limit: max_len,
            });
        }
        progress.total = Some(total);
        if content_length == 0 && start < total {
            return Err(UpdateError::Protocol(format!(
                "empty range at byte {start} of {total}"
            )));
        }

        let mut remaining = content_length;
        let pipelined = raw.pipelined_body();
        if !pipelined.is_empty() {
            let take = pipelined.len().min(remaining as usize);
            sink.accept(progress.collected, &pipelined[..take])?;
            progress.collected += take as u32;
            remaining -= take as u32;
        }

        let mut buf = [0u8; RECV_BUF_LEN];
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = http::bounded(io_timeout, session.read(&mut buf[..want])).await?;
            if n == 0 {
                return Ok(ChunkEnd::Closed);
            }
            sink.accept(progress.collected, &buf[..n])?;
            progress.collected += n as u32;
            remaining -= n as u32;
        }

        Ok(ChunkEnd::Complete { keep_alive })
    }
}

fn closed_early(offset: u32) -> UpdateError {
    UpdateError::DownloadFailed {
        offset,
        source: Box::new(UpdateError::Connection(crate::error::ConnError::Io(
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            ),
        ))),
    }
}
