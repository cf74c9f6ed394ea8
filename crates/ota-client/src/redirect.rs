//! Redirect resolution.
//!
//! Release assets are usually served through one or more `302` hops to a
//! CDN. The resolver checks the asset with a two-byte range request and
//! follows `Location` headers until a server answers with content.

use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::connection::{BoxedSession, Connector};
use crate::error::{ConnError, UpdateError};
use crate::http;

/// Maximum number of consecutive redirects followed.
pub const MAX_REDIRECTS: usize = 10;

/// Where an asset is fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    /// Request path without its leading `/`.
    pub path: String,
    pub port: u16,
    pub use_tls: bool,
}

impl Endpoint {
    /// Endpoint for `asset` below `repo` (`host[/prefix]`).
    pub fn for_asset(repo: &str, asset: &str, port: u16, use_tls: bool) -> Self {
        let repo = strip_scheme(repo).trim_end_matches('/');
        let (host, prefix) = repo.split_once('/').unwrap_or((repo, ""));
        let asset = asset.trim_start_matches('/');
        let path = if prefix.is_empty() {
            asset.to_string()
        } else {
            format!("{prefix}/{asset}")
        };
        Self {
            host: host.to_string(),
            path,
            port,
            use_tls,
        }
    }

    /// Point this endpoint at a `Location` header value.
    ///
    /// Absolute URLs switch scheme (and default port) when a scheme is
    /// given; scheme-relative and host-relative locations keep the current
    /// scheme and port.
    pub fn follow(&mut self, location: &str) -> Result<(), UpdateError> {
        let location = location.trim();

        let authority_and_path = if let Some(rest) = location.strip_prefix_ignore_case("https://") {
            self.use_tls = true;
            self.port = 443;
            rest
        } else if let Some(rest) = location.strip_prefix_ignore_case("http://") {
            self.use_tls = false;
            self.port = 80;
            rest
        } else if let Some(rest) = location.strip_prefix("//") {
            rest
        } else if let Some(path) = location.strip_prefix('/') {
            self.path = path.to_string();
            return Ok(());
        } else {
            return Err(UpdateError::Protocol(format!(
                "unsupported redirect location: {location:?}"
            )));
        };

        let (authority, path) = authority_and_path
            .split_once('/')
            .unwrap_or((authority_and_path, ""));
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    UpdateError::Protocol(format!("invalid port in redirect: {authority:?}"))
                })?;
                (host, Some(port))
            }
            None => (authority, None),
        };
        if host.is_empty() {
            return Err(UpdateError::Protocol(format!(
                "redirect without host: {location:?}"
            )));
        }

        self.host = host.to_string();
        if let Some(port) = port {
            self.port = port;
        }
        self.path = path.to_string();
        Ok(())
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.use_tls { "https" } else { "http" };
        write!(f, "{}://{}:{}/{}", scheme, self.host, self.port, self.path)
    }
}

trait StripPrefixIgnoreCase {
    fn strip_prefix_ignore_case(&self, prefix: &str) -> Option<&str>;
}

impl StripPrefixIgnoreCase for str {
    fn strip_prefix_ignore_case(&self, prefix: &str) -> Option<&str> {
        self.get(..prefix.len())
            .filter(|head| head.eq_ignore_ascii_case(prefix))
            .map(|_| &self[prefix.len()..])
    }
}

fn strip_scheme(repo: &str) -> &str {
    repo.strip_prefix_ignore_case("https://")
        .or_else(|| repo.strip_prefix_ignore_case("http://"))
        .unwrap_or(repo)
}

/// Status and redirect target of one range check.
struct Hop {
    status: u16,
    location: Option<String>,
}

/// Follows redirects to the final location of an asset.
pub struct RedirectResolver<'a> {
    connector: &'a mut dyn Connector,
    network: &'a NetworkConfig,
}

impl<'a> RedirectResolver<'a> {
    pub fn new(connector: &'a mut dyn Connector, network: &'a NetworkConfig) -> Self {
        Self { connector, network }
    }

    /// Resolve `asset` in `repo` to the endpoint that serves its content.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::Server`] for any status other than 200, 206 or 302
    /// - [`UpdateError::TooManyRedirects`] after [`MAX_REDIRECTS`] hops
    /// - [`UpdateError::Protocol`] for a 302 without a usable `Location`
    /// - connection errors once the single retry of a hop has failed
    pub async fn resolve(
        &mut self,
        repo: &str,
        asset: &str,
        port: u16,
        use_tls: bool,
    ) -> Result<Endpoint, UpdateError> {
        let mut endpoint = Endpoint::for_asset(repo, asset, port, use_tls);

        for hop in 0..=MAX_REDIRECTS {
            let response = self.request_with_retry(&endpoint).await?;
            match response.status {
                200 | 206 => {
                    info!("Resolved {} after {} redirect(s)", endpoint, hop);
                    return Ok(endpoint);
                }
                302 if hop == MAX_REDIRECTS => {
                    warn!("Giving up on {} after {} redirects", asset, hop);
                    return Err(UpdateError::TooManyRedirects {
                        limit: MAX_REDIRECTS,
                    });
                }
                302 => {
                    let location = response.location.ok_or_else(|| {
                        UpdateError::Protocol("302 response without Location".to_string())
                    })?;
                    endpoint.follow(&location)?;
                    debug!(hop, target = %endpoint, "Following redirect");
                }
                status => return Err(UpdateError::Server { status }),
            }
        }

        Err(UpdateError::TooManyRedirects {
            limit: MAX_REDIRECTS,
        })
    }

    async fn request_with_retry(&mut self, endpoint: &Endpoint) -> Result<Hop, UpdateError> {
        match self.request(endpoint).await {
            Err(e) if e.is_transient() => {
                warn!("Range check of {} failed ({}), retrying once", endpoint, e);
                tokio::time::sleep(self.network.reconnect_delay()).await;
                self.request(endpoint).await
            }
            result => result,
        }
    }

    async fn request(&mut self, endpoint: &Endpoint) -> Result<Hop, UpdateError> {
        let mut session: BoxedSession = self
            .connector
            .connect(&endpoint.host, endpoint.port, endpoint.use_tls)
            .await?;

        let request = http::range_request(
            &endpoint.host,
            &endpoint.path,
            0,
            1,
            &self.network.user_agent,
        );
        http::send(&mut session, &request, self.network.io_timeout()).await?;

        let raw = http::read_head(&mut session, self.network.io_timeout())
            .await?
            .ok_or_else(|| {
                UpdateError::Connection(ConnError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before response head",
                )))
            })?;
        let head = raw.head()?;
        Ok(Hop {
            status: head.status,
            location: head.location().map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_network as network, MockServer};

    #[test]
    fn test_endpoint_for_asset() {
        let endpoint = Endpoint::for_asset(
            "github.com/acme/widget",
            "releases/latest/download/version.txt",
            443,
            true,
        );
        assert_eq!(endpoint.host, "github.com");
        assert_eq!(endpoint.path, "acme/widget/releases/latest/download/version.txt");

        let bare = Endpoint::for_asset("https://updates.example.com/", "/fw.bin", 8443, true);
        assert_eq!(bare.host, "updates.example.com");
        assert_eq!(bare.path, "fw.bin");
    }

    #[test]
    fn test_follow_location_forms() {
        let mut endpoint = Endpoint::for_asset("github.com/acme/widget", "fw.bin", 443, true);

        endpoint
            .follow("https://objects.example.net/store/fw.bin?sig=abc")
            .unwrap();
        assert_eq!(endpoint.host, "objects.example.net");
        assert_eq!(endpoint.path, "store/fw.bin?sig=abc");
        assert!(endpoint.use_tls);

        endpoint.follow("/other/path").unwrap();
        assert_eq!(endpoint.host, "objects.example.net");
        assert_eq!(endpoint.path, "other/path");

        endpoint.follow("HTTP://mirror.local:8080/fw.bin").unwrap();
        assert_eq!(endpoint.host, "mirror.local");
        assert_eq!(endpoint.port, 8080);
        assert!(!endpoint.use_tls);

        endpoint.follow("//cdn.local/x").unwrap();
        assert_eq!(endpoint.host, "cdn.local");
        assert_eq!(endpoint.path, "x");
        assert_eq!(endpoint.port, 8080);
        assert!(!endpoint.use_tls);

        assert!(endpoint.follow("ftp://nowhere/x").is_err());
        assert!(endpoint.follow("http://:80/x").is_err());
    }

    #[tokio::test]
    async fn test_resolve_direct_asset() {
        let mut server = MockServer::new();
        server.serve("repo.local", "acme/releases/fw.bin", vec![1u8; 100]);

        let network = network();
        let endpoint = RedirectResolver::new(&mut server, &network)
            .resolve("repo.local/acme", "releases/fw.bin", 80, false)
            .await
            .unwrap();
        assert_eq!(endpoint.host, "repo.local");
        assert_eq!(endpoint.path, "acme/releases/fw.bin");
    }

    #[tokio::test]
    async fn test_resolve_follows_redirect_chain() {
        let mut server = MockServer::new();
        server.redirect("repo.local", "fw.bin", "http://cdn-a.local/one");
        server.redirect("cdn-a.local", "one", "/two");
        server.serve("cdn-a.local", "two", vec![7u8; 10]);

        let network = network();
        let mut resolver = RedirectResolver::new(&mut server, &network);
        let first = resolver.resolve("repo.local", "fw.bin", 80, false).await.unwrap();
        let second = resolver.resolve("repo.local", "fw.bin", 80, false).await.unwrap();

        assert_eq!(first.host, "cdn-a.local");
        assert_eq!(first.path, "two");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_resolve_redirect_bound() {
        let mut server = MockServer::new();
        for i in 0..MAX_REDIRECTS {
            server.redirect("repo.local", &format!("hop{i}"), &format!("/hop{}", i + 1));
        }
        server.serve("repo.local", &format!("hop{MAX_REDIRECTS}"), vec![1u8; 4]);

        let network = network();
        let endpoint = RedirectResolver::new(&mut server, &network)
            .resolve("repo.local", "hop0", 80, false)
            .await
            .unwrap();
        assert_eq!(endpoint.path, format!("hop{MAX_REDIRECTS}"));

        let mut looping = MockServer::new();
        looping.redirect("repo.local", "loop", "/loop");
        let result = RedirectResolver::new(&mut looping, &network)
            .resolve("repo.local", "loop", 80, false)
            .await;
        assert!(matches!(
            result,
            Err(UpdateError::TooManyRedirects { limit: MAX_REDIRECTS })
        ));
        assert_eq!(looping.requests().len(), MAX_REDIRECTS + 1);
    }

    #[tokio::test]
    async fn test_resolve_unexpected_status() {
        let mut server = MockServer::new();
        let network = network();
        let result = RedirectResolver::new(&mut server, &network)
            .resolve("repo.local", "missing.bin", 80, false)
            .await;
        assert!(matches!(result, Err(UpdateError::Server { status: 404 })));
    }

    #[tokio::test]
    async fn test_resolve_redirect_without_location() {
        let mut server = MockServer::new();
        server.status("repo.local", "fw.bin", 302);
        let network = network();
        let result = RedirectResolver::new(&mut server, &network)
            .resolve("repo.local", "fw.bin", 80, false)
            .await;
        assert!(matches!(result, Err(UpdateError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_resolve_retries_refused_connection_once() {
        let mut server = MockServer::new();
        server.serve("repo.local", "fw.bin", vec![1u8; 4]);
        server.refuse_next_connections(1);

        let network = network();
        RedirectResolver::new(&mut server, &network)
            .resolve("repo.local", "fw.bin", 80, false)
            .await
            .unwrap();

        server.refuse_next_connections(2);
        let result = RedirectResolver::new(&mut server, &network)
            .resolve("repo.local", "fw.bin", 80, false)
            .await;
        assert!(result.unwrap_err().is_transient());
    }
}
