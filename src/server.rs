//! Listener set and coordinated lifecycle.
//!
//! One or two TCP listeners serve the request pipeline. When TLS material is
//! configured, the secure listener carries the pipeline and the plain
//! listener switches to issuing permanent redirects to the https scheme.
//! Shutdown fans a single cancellation signal out to every listener; each
//! one stops accepting, drains in-flight connections inside a shared grace
//! period, and reports its own result. The run succeeds only if every serve
//! loop and every drain completed cleanly, and the first failure is
//! surfaced after all listeners have finished.

use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::header::{HOST, LOCATION};
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ListenSettings;
use crate::error::GateError;
use crate::forwarder::{empty, status_response, ForwardStrategy, GateBody};

/// Shared grace period every listener gets to drain in-flight connections.
pub const DRAIN_GRACE: Duration = Duration::from_secs(30);

/// What a listener does with the requests it accepts.
#[derive(Clone)]
enum RequestHandler {
    /// Run the pipeline and forwarding strategy.
    Strategy(Arc<dyn ForwardStrategy>),
    /// Redirect everything to the https scheme (plain listener while TLS is
    /// active).
    RedirectToTls { tls_port: u16 },
}

impl RequestHandler {
    async fn respond(&self, peer: SocketAddr, req: Request<Incoming>) -> Response<GateBody> {
        match self {
            RequestHandler::Strategy(strategy) => strategy.handle(peer, req).await,
            RequestHandler::RedirectToTls { tls_port } => redirect_to_tls(&req, *tls_port),
        }
    }
}

/// Permanent redirect to the secure scheme, preserving host and path.
fn redirect_to_tls(req: &Request<Incoming>, tls_port: u16) -> Response<GateBody> {
    let Some(host) = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(strip_port)
        .filter(|h| !h.is_empty())
    else {
        return status_response(StatusCode::BAD_REQUEST);
    };

    let location = if tls_port == 443 {
        format!("https://{host}{}", req.uri())
    } else {
        format!("https://{host}:{tls_port}{}", req.uri())
    };

    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::PERMANENT_REDIRECT;
    if let Ok(value) = location.parse() {
        response.headers_mut().insert(LOCATION, value);
    }
    response
}

/// Drop a trailing `:port` from a Host header value, bracket-aware.
fn strip_port(host: &str) -> &str {
    if let Some(end) = host.rfind(']') {
        return &host[..=end];
    }
    match host.rsplit_once(':') {
        Some((bare, _)) => bare,
        None => host,
    }
}

/// A listener bound and ready to serve.
struct BoundListener {
    name: &'static str,
    tcp: TcpListener,
    tls: Option<TlsAcceptor>,
    handler: RequestHandler,
}

/// The bound listener set plus the shared shutdown signal.
///
/// `bind` is the Starting state: all sockets are bound (or the whole startup
/// fails) before `run` begins Serving.
pub struct Gateway {
    listeners: Vec<BoundListener>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Bind the configured listener(s).
    ///
    /// With TLS settings present, the secure listener serves the strategy
    /// and the plain listener degrades to a redirect. Bind failures abort
    /// startup; the process never partially starts.
    pub async fn bind(
        settings: &ListenSettings,
        strategy: Arc<dyn ForwardStrategy>,
        shutdown: CancellationToken,
    ) -> Result<Self, GateError> {
        let plain_addr = SocketAddr::new(settings.bind_addr, settings.port);
        let plain = TcpListener::bind(plain_addr)
            .await
            .map_err(|source| GateError::Bind {
                listener: "http",
                addr: plain_addr,
                source,
            })?;

        let mut listeners = Vec::new();
        match &settings.tls {
            Some(tls) => {
                let secure_addr = SocketAddr::new(settings.bind_addr, tls.port);
                let secure = TcpListener::bind(secure_addr)
                    .await
                    .map_err(|source| GateError::Bind {
                        listener: "https",
                        addr: secure_addr,
                        source,
                    })?;
                let acceptor = load_tls(tls)?;
                info!(addr = %secure_addr, "https listener bound");
                info!(addr = %plain_addr, "http listener bound (redirecting to https)");
                listeners.push(BoundListener {
                    name: "https",
                    tcp: secure,
                    tls: Some(acceptor),
                    handler: RequestHandler::Strategy(strategy),
                });
                listeners.push(BoundListener {
                    name: "http",
                    tcp: plain,
                    tls: None,
                    handler: RequestHandler::RedirectToTls { tls_port: tls.port },
                });
            }
            None => {
                info!(addr = %plain_addr, "http listener bound");
                listeners.push(BoundListener {
                    name: "http",
                    tcp: plain,
                    tls: None,
                    handler: RequestHandler::Strategy(strategy),
                });
            }
        }

        Ok(Self {
            listeners,
            shutdown,
        })
    }

    /// Local address of the first bound listener (the one serving the
    /// strategy). Useful when binding to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listeners.first().and_then(|l| l.tcp.local_addr().ok())
    }

    /// Serve until the shutdown signal fires, then drain.
    ///
    /// Every listener runs to completion even when a sibling fails; the
    /// first error is returned once all of them have stopped.
    pub async fn run(self) -> Result<(), GateError> {
        let mut tasks: JoinSet<Result<(), GateError>> = JoinSet::new();
        for listener in self.listeners {
            let shutdown = self.shutdown.clone();
            tasks.spawn(serve_listener(listener, shutdown));
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|join_err| {
                Err(GateError::ListenerTask {
                    listener: "unknown",
                    reason: join_err.to_string(),
                })
            });
            if let Err(err) = result {
                error!(error = %err, "listener failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Accept loop plus drain for one listener.
async fn serve_listener(
    listener: BoundListener,
    shutdown: CancellationToken,
) -> Result<(), GateError> {
    let BoundListener {
        name,
        tcp,
        tls,
        handler,
    } = listener;
    let connections = TaskTracker::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = tcp.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let handler = handler.clone();
                        let tls = tls.clone();
                        let conn_shutdown = shutdown.clone();
                        connections.spawn(async move {
                            match tls {
                                Some(acceptor) => match acceptor.accept(stream).await {
                                    Ok(stream) => {
                                        serve_connection(stream, peer, handler, conn_shutdown).await
                                    }
                                    Err(err) => {
                                        debug!(peer = %peer, error = %err, "TLS handshake failed")
                                    }
                                },
                                None => serve_connection(stream, peer, handler, conn_shutdown).await,
                            }
                        });
                    }
                    // One bad accept never tears the listener down.
                    Err(err) => warn!(listener = name, error = %err, "accept failed"),
                }
            }
        }
    }

    // Draining: the socket is closed by drop; in-flight connections get the
    // shared grace period.
    drop(tcp);
    connections.close();
    info!(listener = name, in_flight = connections.len(), "draining");
    tokio::select! {
        _ = connections.wait() => {
            info!(listener = name, "stopped");
            Ok(())
        }
        _ = tokio::time::sleep(DRAIN_GRACE) => Err(GateError::DrainTimeout { listener: name }),
    }
}

/// Serve one connection, honoring the shutdown signal between requests.
async fn serve_connection<I>(
    io: I,
    peer: SocketAddr,
    handler: RequestHandler,
    shutdown: CancellationToken,
) where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler.respond(peer, req).await) }
    });

    let conn = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(err) = result {
                debug!(peer = %peer, error = %err, "connection ended with error");
            }
        }
        _ = shutdown.cancelled() => {
            // Let the request in flight finish; refuse anything after it.
            conn.as_mut().graceful_shutdown();
            if let Err(err) = conn.as_mut().await {
                debug!(peer = %peer, error = %err, "connection ended during drain");
            }
        }
    }
}

/// Load the certificate chain and private key into a TLS acceptor.
fn load_tls(tls: &crate::config::TlsSettings) -> Result<TlsAcceptor, GateError> {
    let open = |path: &std::path::Path| {
        File::open(path).map_err(|source| GateError::TlsRead {
            path: path.to_path_buf(),
            source,
        })
    };

    let certs = rustls_pemfile::certs(&mut BufReader::new(open(&tls.cert)?))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| GateError::TlsRead {
            path: tls.cert.clone(),
            source,
        })?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(open(&tls.key)?))
        .map_err(|source| GateError::TlsRead {
            path: tls.key.clone(),
            source,
        })?
        .ok_or_else(|| GateError::TlsRead {
            path: tls.key.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "no private key found"),
        })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("app.example:9000"), "app.example");
        assert_eq!(strip_port("app.example"), "app.example");
        assert_eq!(strip_port("[fd7a::2]:9000"), "[fd7a::2]");
        assert_eq!(strip_port("[fd7a::2]"), "[fd7a::2]");
    }
}
