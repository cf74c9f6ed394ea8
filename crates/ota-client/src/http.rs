//! Minimal HTTP/1.1 framing: range requests out, response heads in.
//!
//! Only what the update protocol needs is understood. A response head is
//! scanned once into a fixed table of header slices; lookups are
//! case-insensitive and do not depend on header order.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ConnError, UpdateError};

/// Upper bound on a response head.
pub const HEADER_BUFFER_LEN: usize = 8000;

/// Size of a single socket read.
pub const RECV_BUF_LEN: usize = 1390;

/// Headers beyond this count are ignored.
pub const MAX_HEADERS: usize = 32;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Build a ranged `GET` request for `path` on `host`.
pub fn range_request(host: &str, path: &str, start: u32, end: u32, user_agent: &str) -> String {
    format!(
        "GET /{path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: {user_agent}\r\nRange: bytes={start}-{end}\r\n\r\n"
    )
}

/// Length of the response head including its terminator, if complete.
pub fn head_len(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

/// Run a socket operation under `limit`.
pub async fn bounded<T, F>(limit: Duration, op: F) -> Result<T, ConnError>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::time::timeout(limit, op)
        .await
        .map_err(|_| ConnError::Timeout)?
        .map_err(ConnError::Io)
}

/// Send a complete request.
pub async fn send<S>(session: &mut S, request: &str, limit: Duration) -> Result<(), ConnError>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    bounded(limit, session.write_all(request.as_bytes())).await?;
    bounded(limit, session.flush()).await
}

/// A response head read off the wire, plus any body bytes that arrived with it.
#[derive(Debug)]
pub struct RawResponse {
    buf: Vec<u8>,
    head_len: usize,
}

impl RawResponse {
    pub fn head(&self) -> Result<ResponseHead<'_>, UpdateError> {
        ResponseHead::parse(&self.buf[..self.head_len])
    }

    /// Body bytes received in the same reads as the head.
    pub fn pipelined_body(&self) -> &[u8] {
        &self.buf[self.head_len..]
    }
}

/// Read until a full response head is buffered.
///
/// Returns `Ok(None)` when the peer closes before the head is complete. A
/// head longer than [`HEADER_BUFFER_LEN`] is a protocol violation.
pub async fn read_head<S>(
    session: &mut S,
    limit: Duration,
) -> Result<Option<RawResponse>, UpdateError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(RECV_BUF_LEN);
    let mut chunk = [0u8; RECV_BUF_LEN];
    loop {
        let n = bounded(limit, session.read(&mut chunk)).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(head_len) = head_len(&buf) {
            return Ok(Some(RawResponse { buf, head_len }));
        }
        if buf.len() > HEADER_BUFFER_LEN {
            return Err(UpdateError::Protocol(format!(
                "response head exceeds {HEADER_BUFFER_LEN} bytes"
            )));
        }
    }
}

/// Parsed `Content-Range: bytes start-end/total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u32,
    pub end: u32,
    pub total: u32,
}

/// A scanned response head borrowing from the receive buffer.
#[derive(Debug)]
pub struct ResponseHead<'a> {
    pub status: u16,
    headers: [(&'a str, &'a str); MAX_HEADERS],
    count: usize,
}

impl<'a> ResponseHead<'a> {
    /// Scan a complete head (status line and headers).
    pub fn parse(head: &'a [u8]) -> Result<Self, UpdateError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| UpdateError::Protocol("response head is not valid UTF-8".to_string()))?;
        let mut lines = text.split("\r\n");

        let status_line = lines.next().unwrap_or_default();
        let status = parse_status_line(status_line).ok_or_else(|| {
            UpdateError::Protocol(format!("malformed status line: {status_line:?}"))
        })?;

        let mut headers = [("", ""); MAX_HEADERS];
        let mut count = 0;
        for line in lines {
            if line.is_empty() {
                break;
            }
            if count == MAX_HEADERS {
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers[count] = (name.trim(), value.trim());
                count += 1;
            }
        }

        Ok(Self {
            status,
            headers,
            count,
        })
    }

    /// Value of the first header called `name`, ignoring case.
    pub fn get(&self, name: &str) -> Option<&'a str> {
        self.headers[..self.count]
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| *value)
    }

    pub fn content_length(&self) -> Option<u32> {
        self.get("content-length")?.parse().ok()
    }

    pub fn content_range(&self) -> Option<ContentRange> {
        parse_content_range(self.get("content-range")?)
    }

    pub fn location(&self) -> Option<&'a str> {
        self.get("location").filter(|value| !value.is_empty())
    }

    /// Whether the server will keep the connection open after this response.
    pub fn keep_alive(&self) -> bool {
        !self
            .get("connection")
            .is_some_and(|value| value.eq_ignore_ascii_case("close"))
    }
}

fn parse_status_line(line: &str) -> Option<u16> {
    let (version, rest) = line.split_once(' ')?;
    if !version.get(..7)?.eq_ignore_ascii_case("http/1.") {
        return None;
    }
    let code = rest.trim_start().get(..3)?;
    if !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    code.parse().ok()
}

fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim();
    let rest = rest.get(..6)?.eq_ignore_ascii_case("bytes ").then(|| &rest[6..])?;
    let (span, total) = rest.split_once('/')?;
    let (start, end) = span.split_once('-')?;
    Some(ContentRange {
        start: start.trim().parse().ok()?,
        end: end.trim().parse().ok()?,
        total: total.trim().parse().ok()?,
    })
}
