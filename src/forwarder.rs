//! Forwarding strategies.
//!
//! Once the pipeline has decided what a request is, one of two strategies
//! turns that decision into a response. The strategy is picked once at
//! startup, never per-request:
//!
//! - [`AccessCheck`] answers with a status and identity headers only, for an
//!   external reverse proxy consulting PeerGate as a sub-request.
//! - [`ReverseProxy`] rewrites the request's headers and relays it to a
//!   single upstream origin, keeping protocol-upgrade (websocket) traffic
//!   working and writing one access-log line per request.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{
    CONNECTION, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING,
    UPGRADE, USER_AGENT,
};
use http::uri::{Authority, Scheme};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::GateError;
use crate::pipeline::{apply_identity, peer_from_headers, strip_identity, AuthPipeline, Decision};

/// Uniform response body for every path through the gateway.
pub type GateBody = BoxBody<Bytes, hyper::Error>;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// An empty body.
pub fn empty() -> GateBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// A bodiless response with `status`.
///
/// Denials carry nothing beyond the status code, so nothing internal leaks
/// to unauthenticated callers.
pub fn status_response(status: StatusCode) -> Response<GateBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
}

/// Per-request behavior after the pipeline has decided.
#[async_trait]
pub trait ForwardStrategy: Send + Sync + 'static {
    /// Produce the response for one request from `peer` (the connection's
    /// remote address).
    async fn handle(&self, peer: SocketAddr, req: Request<Incoming>) -> Response<GateBody>;
}

// === Access-check strategy ===

/// Status-only responder for sub-request authentication.
///
/// The peer is whoever the fronting proxy says it is, declared through the
/// remote-addr/remote-port request headers; the connection's own remote
/// address is ignored. Never forwards anything anywhere.
pub struct AccessCheck {
    pipeline: Arc<AuthPipeline>,
}

impl AccessCheck {
    /// Build the access-check strategy over a shared pipeline.
    pub fn new(pipeline: Arc<AuthPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl ForwardStrategy for AccessCheck {
    async fn handle(&self, _peer: SocketAddr, req: Request<Incoming>) -> Response<GateBody> {
        let declared = match peer_from_headers(req.headers()) {
            Ok(addr) => addr,
            // Unparsable origin: deny without ever consulting the directory.
            Err(reason) => return status_response(reason.status()),
        };

        match self.pipeline.authorize(declared).await {
            Decision::Bypassed => status_response(StatusCode::NO_CONTENT),
            Decision::Resolved(profile) => {
                let mut response = status_response(StatusCode::NO_CONTENT);
                apply_identity(response.headers_mut(), &profile);
                response
            }
            Decision::Denied(reason) => status_response(reason.status()),
        }
    }
}

// === Reverse-proxy strategy ===

/// The single upstream origin requests are forwarded to.
#[derive(Debug, Clone)]
pub struct UpstreamOrigin {
    scheme: Scheme,
    authority: Authority,
}

impl UpstreamOrigin {
    /// Parse and validate the upstream origin URL.
    ///
    /// Only the scheme and authority are kept; the inbound request supplies
    /// the path. Anything other than an http/https URL with a host is a
    /// fatal configuration error.
    pub fn parse(raw: &str) -> Result<Self, GateError> {
        let invalid = |reason: &str| GateError::InvalidUpstream {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let url = url::Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        let host = url.host_str().ok_or_else(|| invalid("URL has no host"))?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        Ok(Self {
            scheme: Scheme::try_from(url.scheme()).map_err(|e| invalid(&e.to_string()))?,
            authority: Authority::try_from(authority.as_str())
                .map_err(|e| invalid(&e.to_string()))?,
        })
    }

    /// Rebase an inbound origin-form URI onto this origin.
    fn rebase(&self, inbound: &Uri) -> Result<Uri, http::Error> {
        let path_and_query = inbound.path_and_query().map_or("/", |pq| pq.as_str());
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
    }
}

impl std::fmt::Display for UpstreamOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

/// Why a forward attempt failed. Every variant surfaces as `502`.
#[derive(Debug, Error)]
enum ForwardError {
    #[error("failed to build upstream request: {0}")]
    Request(#[from] http::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("connection does not support protocol takeover")]
    TakeoverUnsupported,
}

/// Reverse proxy to a single fixed upstream origin.
pub struct ReverseProxy {
    pipeline: Arc<AuthPipeline>,
    origin: UpstreamOrigin,
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
}

impl ReverseProxy {
    /// Build the proxy strategy over a shared pipeline.
    pub fn new(pipeline: Arc<AuthPipeline>, origin: UpstreamOrigin) -> Result<Self, GateError> {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(GateError::HttpClient)?
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(https);
        Ok(Self {
            pipeline,
            origin,
            client,
        })
    }

    /// Forward `req` upstream and relay the answer.
    async fn forward(
        &self,
        peer: SocketAddr,
        mut req: Request<Incoming>,
    ) -> Result<Response<GateBody>, ForwardError> {
        let is_upgrade = wants_upgrade(req.headers());
        let upgrade_proto = req.headers().get(UPGRADE).cloned();

        // Take the takeover capability out of the request before it moves
        // upstream. Its absence on an upgrade request is a hard failure, not
        // a silent downgrade to a plain round trip.
        let takeover = req.extensions_mut().remove::<OnUpgrade>();
        if is_upgrade && takeover.is_none() {
            return Err(ForwardError::TakeoverUnsupported);
        }

        *req.uri_mut() = self.origin.rebase(req.uri())?;
        strip_hop_headers(req.headers_mut());
        if is_upgrade {
            if let Some(proto) = upgrade_proto {
                req.headers_mut().insert(UPGRADE, proto);
                req.headers_mut()
                    .insert(CONNECTION, HeaderValue::from_static("upgrade"));
            }
        }
        append_forwarded_for(req.headers_mut(), peer.ip());

        let mut response = self.client.request(req).await?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let client_side = takeover.ok_or(ForwardError::TakeoverUnsupported)?;
            let upstream_side = hyper::upgrade::on(&mut response);
            tokio::spawn(tunnel(client_side, upstream_side, peer));

            // Relay the 101 verbatim; the connection is handed over once the
            // response reaches the caller.
            let (parts, _) = response.into_parts();
            return Ok(Response::from_parts(parts, empty()));
        }

        let (mut parts, body) = response.into_parts();
        strip_hop_headers(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[async_trait]
impl ForwardStrategy for ReverseProxy {
    async fn handle(&self, peer: SocketAddr, mut req: Request<Incoming>) -> Response<GateBody> {
        // Captured up front: the forward consumes the request.
        let method = req.method().clone();
        let path = req.uri().to_string();
        let version = req.version();
        let user_agent = req
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        // A client never gets to claim its own identity.
        strip_identity(req.headers_mut());

        let decision = self.pipeline.authorize(peer).await;
        let response = match &decision {
            Decision::Denied(reason) => status_response(reason.status()),
            Decision::Bypassed | Decision::Resolved(_) => {
                if let Decision::Resolved(profile) = &decision {
                    apply_identity(req.headers_mut(), profile);
                }
                match self.forward(peer, req).await {
                    Ok(response) => response,
                    Err(err) => {
                        warn!(peer = %peer, upstream = %self.origin, error = %err, "forward failed");
                        status_response(StatusCode::BAD_GATEWAY)
                    }
                }
            }
        };

        info!(
            target: "peergate::access",
            peer = %peer,
            login = %decision.login(),
            time = %chrono::Local::now().format("%d/%b/%Y:%H:%M:%S %z"),
            method = %method,
            path = %path,
            version = ?version,
            status = response.status().as_u16(),
            user_agent = %user_agent,
            "request"
        );

        response
    }
}

/// Join the two taken-over byte streams until either side closes.
async fn tunnel(
    client_side: OnUpgrade,
    upstream_side: OnUpgrade,
    peer: SocketAddr,
) {
    let (client_io, upstream_io) = match tokio::try_join!(client_side, upstream_side) {
        Ok(both) => both,
        Err(err) => {
            warn!(peer = %peer, error = %err, "protocol takeover failed");
            return;
        }
    };

    let mut client_io = TokioIo::new(client_io);
    let mut upstream_io = TokioIo::new(upstream_io);
    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
        Ok((up, down)) => {
            debug!(peer = %peer, bytes_up = up, bytes_down = down, "upgraded connection closed")
        }
        Err(err) => debug!(peer = %peer, error = %err, "upgraded connection errored"),
    }
}

/// Whether the request asks for a protocol upgrade.
fn wants_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrades = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrades && headers.contains_key(UPGRADE)
}

/// Remove hop-by-hop headers, including anything named by `Connection`.
///
/// The Host header is left alone so the upstream sees the name the caller
/// used.
fn strip_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| name.trim().parse::<HeaderName>().ok())
        .filter(|name| *name != HOST)
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in [
        CONNECTION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
    ] {
        headers.remove(name);
    }
    headers.remove(KEEP_ALIVE);
    headers.remove(PROXY_CONNECTION);
}

/// Append the peer to `X-Forwarded-For`, preserving any prior hops.
fn append_forwarded_for(headers: &mut HeaderMap, peer: IpAddr) {
    let peer = peer.to_string();
    let value = match headers
        .get(&X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) => format!("{prior}, {peer}"),
        None => peer,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_origin_parse() {
        let origin = UpstreamOrigin::parse("http://127.0.0.1:3000").unwrap();
        assert_eq!(origin.to_string(), "http://127.0.0.1:3000");

        let origin = UpstreamOrigin::parse("https://app.internal").unwrap();
        assert_eq!(origin.to_string(), "https://app.internal");

        assert!(UpstreamOrigin::parse("ftp://files.internal").is_err());
        assert!(UpstreamOrigin::parse("not a url").is_err());
    }

    #[test]
    fn test_rebase_keeps_path_and_query() {
        let origin = UpstreamOrigin::parse("http://127.0.0.1:3000").unwrap();
        let inbound: Uri = "/search?q=lovelace".parse().unwrap();
        let rebased = origin.rebase(&inbound).unwrap();
        assert_eq!(rebased.to_string(), "http://127.0.0.1:3000/search?q=lovelace");

        let bare: Uri = "/".parse().unwrap();
        assert_eq!(
            origin.rebase(&bare).unwrap().to_string(),
            "http://127.0.0.1:3000/"
        );
    }

    #[test]
    fn test_wants_upgrade() {
        let mut headers = HeaderMap::new();
        assert!(!wants_upgrade(&headers));

        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(!wants_upgrade(&headers), "Upgrade header itself is required");

        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(wants_upgrade(&headers));
    }

    #[test]
    fn test_strip_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-hop"));
        headers.insert(KEEP_ALIVE, HeaderValue::from_static("timeout=5"));
        headers.insert(
            HeaderName::from_static("x-hop"),
            HeaderValue::from_static("1"),
        );
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(HOST, HeaderValue::from_static("app.example"));
        headers.insert(
            HeaderName::from_static("x-request-id"),
            HeaderValue::from_static("abc"),
        );

        strip_hop_headers(&mut headers);

        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get(KEEP_ALIVE).is_none());
        assert!(headers.get("x-hop").is_none());
        assert!(headers.get(TRANSFER_ENCODING).is_none());
        assert_eq!(headers.get(HOST).unwrap(), "app.example");
        assert_eq!(headers.get("x-request-id").unwrap(), "abc");
    }

    #[test]
    fn test_append_forwarded_for() {
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, "100.64.0.5".parse().unwrap());
        assert_eq!(headers.get(&X_FORWARDED_FOR).unwrap(), "100.64.0.5");

        append_forwarded_for(&mut headers, "100.64.0.6".parse().unwrap());
        assert_eq!(
            headers.get(&X_FORWARDED_FOR).unwrap(),
            "100.64.0.5, 100.64.0.6"
        );
    }
}
