//! PeerGate binary: parse flags, assemble the pipeline, serve.

use std::sync::Arc;

use clap::Parser;
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use peergate::cache::IdentityCache;
use peergate::config::{ensure_state_dir, CheckOpts, Cli, Command, CommonOpts, ListenSettings, ProxyOpts};
use peergate::directory::HttpDirectory;
use peergate::error::GateError;
use peergate::forwarder::{AccessCheck, ReverseProxy, UpstreamOrigin};
use peergate::pipeline::AuthPipeline;
use peergate::resolver::IdentityResolver;
use peergate::server::Gateway;
use peergate::trust::TrustedRanges;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let _ = rustls::crypto::ring::default_provider().install_default();

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown signal received, draining");
            shutdown.cancel();
        }
    });

    let result = match cli.command {
        Command::Check(opts) => run_check(opts, shutdown).await,
        Command::Proxy(opts) => run_proxy(opts, shutdown).await,
    };

    if let Err(err) = result {
        error!(error = %err, "exiting");
        std::process::exit(1);
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let terminate = async {
        #[cfg(unix)]
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
        #[cfg(not(unix))]
        std::future::pending::<()>().await;
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
}

/// Shared startup: state directory, trusted ranges, directory client,
/// cache, resolver.
async fn build_pipeline(common: &CommonOpts) -> Result<Arc<AuthPipeline>, GateError> {
    ensure_state_dir(&common.state_dir)?;
    let trusted = TrustedRanges::parse(&common.trusted_ranges)?;
    let directory = HttpDirectory::connect(&common.directory_url, &common.hostname).await?;
    let cache = IdentityCache::new(common.cache_size, common.cache_expiry);
    let resolver = IdentityResolver::new(Arc::new(directory), cache.clone());
    Ok(Arc::new(AuthPipeline::new(trusted, cache, resolver)))
}

async fn run_check(opts: CheckOpts, shutdown: CancellationToken) -> Result<(), GateError> {
    let pipeline = build_pipeline(&opts.common).await?;
    let strategy = Arc::new(AccessCheck::new(pipeline));
    let settings = ListenSettings {
        bind_addr: opts.common.bind_addr,
        port: opts.common.port,
        tls: None,
    };
    Gateway::bind(&settings, strategy, shutdown).await?.run().await
}

async fn run_proxy(opts: ProxyOpts, shutdown: CancellationToken) -> Result<(), GateError> {
    let pipeline = build_pipeline(&opts.common).await?;
    let origin = UpstreamOrigin::parse(&opts.upstream)?;
    let strategy = Arc::new(ReverseProxy::new(pipeline, origin)?);
    let settings = ListenSettings {
        bind_addr: opts.common.bind_addr,
        port: opts.common.port,
        tls: opts.tls(),
    };
    Gateway::bind(&settings, strategy, shutdown).await?.run().await
}
