//! Testing utilities: an in-process release server and small fixtures.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::config::{FlashLayout, NetworkConfig};
use crate::connection::{BoxedSession, Connector};
use crate::error::ConnError;
use crate::flash::{FlashRegion, SECTOR_SIZE};
use crate::http;
use crate::trust::TrustAnchors;

/// Network settings with short timeouts and no reconnect pause.
pub fn fast_network() -> NetworkConfig {
    NetworkConfig {
        io_timeout_secs: 2,
        reconnect_delay_ms: 0,
        ..NetworkConfig::default()
    }
}

/// Small flash layout: two 64 KiB boot slots and two certificate sectors.
pub fn small_layout() -> FlashLayout {
    FlashLayout {
        boot: [
            FlashRegion::new(2, 16 * SECTOR_SIZE),
            FlashRegion::new(18, 16 * SECTOR_SIZE),
        ],
        certs: Some([
            FlashRegion::new(34, SECTOR_SIZE),
            FlashRegion::new(35, SECTOR_SIZE),
        ]),
    }
}

/// Flash size covering [`small_layout`].
pub const SMALL_FLASH_SIZE: u32 = 36 * SECTOR_SIZE;

/// A request as seen by the mock server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub host: String,
    pub path: String,
    /// Inclusive byte range from the `Range` header.
    pub range: Option<(u32, u32)>,
}

#[derive(Debug, Clone)]
enum Route {
    Asset(Bytes),
    Redirect(String),
    Status(u16),
}

#[derive(Debug, Default)]
struct ServerState {
    routes: HashMap<(String, String), Route>,
    requests: Vec<RecordedRequest>,
    connections: usize,
    refuse: usize,
    interrupt_at: Option<u32>,
    close_each: bool,
    anchors: Option<TrustAnchors>,
}

/// One response, ready to write.
struct Reply {
    head: String,
    body: Bytes,
    /// Body bytes to send before dropping the connection.
    cut: Option<usize>,
    close: bool,
}

/// In-process release server implementing [`Connector`].
///
/// Every connection is a `tokio::io::duplex` pipe served by a spawned task.
/// Cloning yields another handle onto the same server, so a test can keep a
/// handle while the client owns another.
#[derive(Debug, Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    /// Create a server with no routes; unknown paths answer 404.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `content` at `host/path`.
    pub fn serve(&self, host: &str, path: &str, content: impl Into<Bytes>) {
        self.route(host, path, Route::Asset(content.into()));
    }

    /// Answer `host/path` with a 302 to `location`.
    pub fn redirect(&self, host: &str, path: &str, location: &str) {
        self.route(host, path, Route::Redirect(location.to_string()));
    }

    /// Answer `host/path` with a bare status.
    pub fn status(&self, host: &str, path: &str, code: u16) {
        self.route(host, path, Route::Status(code));
    }

    /// Remove whatever `host/path` serves.
    pub fn remove(&self, host: &str, path: &str) {
        self.state
            .lock()
            .routes
            .remove(&(host.to_string(), path.to_string()));
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next_connections(&self, count: usize) {
        self.state.lock().refuse = count;
    }

    /// Drop the connection once, in the middle of the first response body
    /// that covers absolute byte `offset`.
    pub fn interrupt_once_at(&self, offset: u32) {
        self.state.lock().interrupt_at = Some(offset);
    }

    /// Send `Connection: close` and hang up after every response.
    pub fn close_after_each_response(&self) {
        self.state.lock().close_each = true;
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    /// Trust anchors most recently installed by the client.
    pub fn trust_anchors(&self) -> Option<TrustAnchors> {
        self.state.lock().anchors.clone()
    }

    fn route(&self, host: &str, path: &str, route: Route) {
        self.state
            .lock()
            .routes
            .insert((host.to_string(), path.to_string()), route);
    }
}

#[async_trait]
impl Connector for MockServer {
    async fn connect(
        &mut self,
        host: &str,
        port: u16,
        _use_tls: bool,
    ) -> Result<BoxedSession, ConnError> {
        {
            let mut state = self.state.lock();
            if state.refuse > 0 {
                state.refuse -= 1;
                return Err(ConnError::Connect {
                    host: host.to_string(),
                    port,
                    source: std::io::ErrorKind::ConnectionRefused.into(),
                });
            }
            state.connections += 1;
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_connection(self.state.clone(), server));
        Ok(Box::new(client))
    }

    fn set_trust_anchors(&mut self, anchors: Option<TrustAnchors>) {
        self.state.lock().anchors = anchors;
    }
}

async fn serve_connection(state: Arc<Mutex<ServerState>>, mut stream: DuplexStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        let head_len = loop {
            if let Some(len) = http::head_len(&buf) {
                break len;
            }
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };
        let request = parse_request(&buf[..head_len]);
        buf.drain(..head_len);

        let Some(request) = request else {
            return;
        };
        let reply = state.lock().respond(request);

        if stream.write_all(reply.head.as_bytes()).await.is_err() {
            return;
        }
        let body = match reply.cut {
            Some(len) => reply.body.slice(..len),
            None => reply.body,
        };
        if stream.write_all(&body).await.is_err() || stream.flush().await.is_err() {
            return;
        }
        if reply.cut.is_some() || reply.close {
            return;
        }
    }
}

fn parse_request(head: &[u8]) -> Option<RecordedRequest> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    if request_line.next()? != "GET" {
        return None;
    }
    let path = request_line.next()?.trim_start_matches('/').to_string();

    let mut host = String::new();
    let mut range = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("host") {
            host = value.to_string();
        } else if name.eq_ignore_ascii_case("range") {
            let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
            range = Some((start.parse().ok()?, end.parse().ok()?));
        }
    }

    Some(RecordedRequest { host, path, range })
}

impl ServerState {
    fn respond(&mut self, request: RecordedRequest) -> Reply {
        self.requests.push(request.clone());
        let route = self
            .routes
            .get(&(request.host.clone(), request.path.clone()))
            .cloned();

        let mut reply = match route {
            Some(Route::Asset(content)) => self.asset_reply(content, request.range),
            Some(Route::Redirect(location)) => Reply::bare(
                format!("HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\n"),
            ),
            Some(Route::Status(code)) => {
                Reply::bare(format!("HTTP/1.1 {code} Status\r\nContent-Length: 0\r\n"))
            }
            None => Reply::bare("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n".to_string()),
        };

        if self.close_each {
            reply.head.push_str("Connection: close\r\n");
            reply.close = true;
        }
        reply.head.push_str("\r\n");
        reply
    }

    fn asset_reply(&mut self, content: Bytes, range: Option<(u32, u32)>) -> Reply {
        let total = content.len() as u32;
        let (start, end) = match range {
            Some((start, _)) if total == 0 || start >= total => {
                let mut reply = Reply::bare(format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\n"
                ));
                reply.body = content;
                return reply;
            }
            Some((start, end)) => (start, end.min(total - 1)),
            None => {
                let mut reply = Reply::bare(format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\n"
                ));
                reply.body = content;
                return reply;
            }
        };

        let body = content.slice(start as usize..=end as usize);
        let cut = match self.interrupt_at {
            Some(offset) if start < offset && offset <= end => {
                self.interrupt_at = None;
                Some((offset - start) as usize)
            }
            _ => None,
        };

        Reply {
            head: format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {start}-{end}/{total}\r\nContent-Length: {}\r\n",
                body.len()
            ),
            body,
            cut,
            close: false,
        }
    }
}

impl Reply {
    fn bare(head: String) -> Self {
        Self {
            head,
            body: Bytes::new(),
            cut: None,
            close: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serves_ranges() {
        let mut server = MockServer::new();
        server.serve("cdn.local", "a.bin", b"0123456789".to_vec());

        let mut session = server.connect("cdn.local", 80, false).await.unwrap();
        session
            .write_all(b"GET /a.bin HTTP/1.1\r\nHost: cdn.local\r\nRange: bytes=2-5\r\n\r\n")
            .await
            .unwrap();

        let mut response = vec![0u8; 256];
        let mut len = 0;
        while http::head_len(&response[..len]).is_none() || !response[..len].ends_with(b"2345") {
            len += session.read(&mut response[len..]).await.unwrap();
        }
        let text = String::from_utf8_lossy(&response[..len]);
        assert!(text.starts_with("HTTP/1.1 206"));
        assert!(text.contains("Content-Range: bytes 2-5/10"));

        assert_eq!(
            server.requests(),
            vec![RecordedRequest {
                host: "cdn.local".to_string(),
                path: "a.bin".to_string(),
                range: Some((2, 5)),
            }]
        );
    }

    #[tokio::test]
    async fn test_refuses_connections() {
        let mut server = MockServer::new();
        server.refuse_next_connections(1);
        assert!(matches!(
            server.connect("cdn.local", 80, false).await,
            Err(ConnError::Connect { port: 80, .. })
        ));
        assert!(server.connect("cdn.local", 80, false).await.is_ok());
        assert_eq!(server.connections(), 1);
    }

    #[test]
    fn test_parse_request_line() {
        let request =
            parse_request(b"GET /x/y HTTP/1.1\r\nhost: h\r\nRANGE: bytes=0-1\r\n\r\n").unwrap();
        assert_eq!(request.path, "x/y");
        assert_eq!(request.host, "h");
        assert_eq!(request.range, Some((0, 1)));
        assert!(parse_request(b"POST / HTTP/1.1\r\n\r\n").is_none());
    }
}
