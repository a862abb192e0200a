//! Network-identity directory client.
//!
//! The directory is the external collaborator that maps a peer network
//! address to the user behind it. PeerGate consumes it through the
//! [`Directory`] trait; [`HttpDirectory`] is the concrete client speaking the
//! directory's HTTP local-API. The trait seam keeps the request pipeline
//! testable without a live directory.

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Errors from the directory collaborator.
///
/// The request pipeline treats every variant the same way (the peer cannot be
/// identified right now), so granularity here exists for logs, not for
/// control flow.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Transport-level failure (connect, timeout, protocol).
    #[error("directory request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The configured directory base URL did not parse.
    #[error("invalid directory URL {url:?}: {reason}")]
    BadUrl {
        /// The URL as configured
        url: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Who-is answer for a single peer address.
#[derive(Debug, Clone, Deserialize)]
pub struct WhoisReply {
    /// The peer node itself.
    #[serde(default)]
    pub node: NodeInfo,
    /// The user the node belongs to. Absent fields stay empty.
    #[serde(default)]
    pub user: UserInfo,
}

impl WhoisReply {
    /// Tagged nodes are service endpoints; they never identify a user.
    pub fn is_tagged(&self) -> bool {
        !self.node.tags.is_empty()
    }
}

/// Node portion of a who-is answer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeInfo {
    /// ACL tags on the node; non-empty means the node is a service endpoint.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// User portion of a who-is answer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserInfo {
    /// Login identifier, e.g. `ada@example.com`.
    #[serde(default)]
    pub login: String,
    /// Human-readable display name.
    #[serde(default)]
    pub display_name: String,
    /// Profile picture URL.
    #[serde(default)]
    pub avatar_url: String,
}

/// The network-identity directory, at its interface boundary.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Resolve a peer address to the node and user behind it.
    ///
    /// This is the only call in the whole pipeline that crosses a process
    /// boundary. No timeout is applied here beyond what the underlying client
    /// carries.
    async fn whois(&self, addr: SocketAddr) -> Result<WhoisReply, DirectoryError>;
}

/// HTTP client for the directory's local-API.
pub struct HttpDirectory {
    http: reqwest::Client,
    base: url::Url,
}

impl HttpDirectory {
    /// Connect to the directory at `base_url`, announcing this gateway as
    /// `hostname`.
    ///
    /// Probes the directory's status endpoint so an unreachable directory is
    /// a startup failure rather than a surprise on the first request.
    pub async fn connect(base_url: &str, hostname: &str) -> Result<Self, DirectoryError> {
        let base = url::Url::parse(base_url).map_err(|e| DirectoryError::BadUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;

        let mut headers = http::HeaderMap::new();
        if let Ok(value) = http::HeaderValue::from_str(hostname) {
            headers.insert("peergate-node", value);
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        let dir = Self { http, base };
        dir.status().await?;
        debug!(directory = %dir.base, hostname, "connected to identity directory");
        Ok(dir)
    }

    fn endpoint(&self, path: &str) -> Result<url::Url, DirectoryError> {
        self.base.join(path).map_err(|e| DirectoryError::BadUrl {
            url: self.base.to_string(),
            reason: e.to_string(),
        })
    }

    /// Reachability probe against the directory's status endpoint.
    async fn status(&self) -> Result<(), DirectoryError> {
        let url = self.endpoint("v0/status")?;
        self.http.get(url).send().await?.error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn whois(&self, addr: SocketAddr) -> Result<WhoisReply, DirectoryError> {
        let url = self.endpoint("v0/whois")?;
        let reply = self
            .http
            .get(url)
            .query(&[("addr", addr.to_string())])
            .send()
            .await?
            .error_for_status()?
            .json::<WhoisReply>()
            .await?;
        Ok(reply)
    }
}
