//! Command line and configuration surface.
//!
//! All knobs are flags with environment-variable fallbacks. Validation that
//! can fail (state directory, trusted ranges, upstream URL, TLS material)
//! happens during startup and aborts the process with a descriptive error;
//! nothing is re-validated at request time.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::error::GateError;

/// PeerGate command line.
#[derive(Debug, Parser)]
#[command(
    name = "peergate",
    version,
    about = "Identity-aware authentication gateway for overlay networks"
)]
pub struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "PEERGATE_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Operating mode, selected once at startup.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Answer access-check sub-requests with a status and identity headers
    Check(CheckOpts),
    /// Reverse-proxy requests to a single upstream origin
    Proxy(ProxyOpts),
}

/// Flags shared by both modes.
#[derive(Debug, Args)]
pub struct CommonOpts {
    /// Address to bind the listener to
    #[arg(long, short = 'a', default_value = "127.0.0.1", env = "PEERGATE_BIND_ADDR")]
    pub bind_addr: IpAddr,

    /// Port to listen on
    #[arg(long, short = 'p', default_value_t = 9000, env = "PEERGATE_PORT")]
    pub port: u16,

    /// Maximum number of entries in the identity cache
    #[arg(long, short = 's', default_value_t = 1000, env = "PEERGATE_CACHE_SIZE")]
    pub cache_size: u64,

    /// Time after which cached identities expire
    #[arg(
        long,
        short = 'e',
        default_value = "10m",
        value_parser = humantime::parse_duration,
        env = "PEERGATE_CACHE_EXPIRY"
    )]
    pub cache_expiry: Duration,

    /// Base URL of the network-identity directory's local API
    #[arg(
        long,
        short = 'c',
        default_value = "http://127.0.0.1:4640/",
        env = "PEERGATE_DIRECTORY_URL"
    )]
    pub directory_url: String,

    /// Hostname this gateway announces to the directory
    #[arg(long, short = 'H', default_value = "auth-gateway", env = "PEERGATE_HOSTNAME")]
    pub hostname: String,

    /// Directory to store state in
    #[arg(long, short = 'd', default_value = "/var/run/peergate", env = "PEERGATE_STATE_DIR")]
    pub state_dir: PathBuf,

    /// Comma-separated CIDR ranges whose peers bypass identity resolution
    #[arg(long, short = 't', default_value = "", env = "PEERGATE_TRUSTED_RANGES")]
    pub trusted_ranges: String,
}

/// Access-check mode flags.
#[derive(Debug, Args)]
pub struct CheckOpts {
    #[command(flatten)]
    pub common: CommonOpts,
}

/// Reverse-proxy mode flags.
#[derive(Debug, Args)]
pub struct ProxyOpts {
    #[command(flatten)]
    pub common: CommonOpts,

    /// Upstream origin URL to forward requests to
    pub upstream: String,

    /// Path to the TLS certificate file
    #[arg(long, requires = "tls_key", env = "PEERGATE_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// Path to the TLS key file
    #[arg(long, requires = "tls_cert", env = "PEERGATE_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Port for the TLS listener
    #[arg(long, default_value_t = 443, env = "PEERGATE_TLS_PORT")]
    pub tls_port: u16,
}

impl ProxyOpts {
    /// TLS settings when both halves of the pair are configured.
    pub fn tls(&self) -> Option<TlsSettings> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some(TlsSettings {
                cert: cert.clone(),
                key: key.clone(),
                port: self.tls_port,
            }),
            _ => None,
        }
    }
}

/// TLS certificate/key pair plus the port the secure listener binds.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// Certificate chain file (PEM)
    pub cert: PathBuf,
    /// Private key file (PEM)
    pub key: PathBuf,
    /// Secure listener port
    pub port: u16,
}

/// Where the gateway listens.
#[derive(Debug, Clone)]
pub struct ListenSettings {
    /// Bind address shared by all listeners
    pub bind_addr: IpAddr,
    /// Plain listener port
    pub port: u16,
    /// Secure listener, when configured
    pub tls: Option<TlsSettings>,
}

/// Create the state directory if needed and verify it is writable.
pub fn ensure_state_dir(path: &Path) -> Result<(), GateError> {
    std::fs::create_dir_all(path).map_err(|source| GateError::StateDir {
        path: path.to_path_buf(),
        source,
    })?;
    let meta = std::fs::metadata(path).map_err(|source| GateError::StateDir {
        path: path.to_path_buf(),
        source,
    })?;
    if meta.permissions().readonly() {
        return Err(GateError::StateDirNotWritable {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_check_defaults() {
        let cli = Cli::try_parse_from(["peergate", "check"]).unwrap();
        let Command::Check(opts) = cli.command else {
            panic!("expected check mode");
        };
        assert_eq!(opts.common.port, 9000);
        assert_eq!(opts.common.cache_size, 1000);
        assert_eq!(opts.common.cache_expiry, Duration::from_secs(600));
        assert!(opts.common.trusted_ranges.is_empty());
    }

    #[test]
    fn test_proxy_requires_upstream() {
        assert!(Cli::try_parse_from(["peergate", "proxy"]).is_err());

        let cli =
            Cli::try_parse_from(["peergate", "proxy", "http://127.0.0.1:3000"]).unwrap();
        let Command::Proxy(opts) = cli.command else {
            panic!("expected proxy mode");
        };
        assert_eq!(opts.upstream, "http://127.0.0.1:3000");
        assert!(opts.tls().is_none());
    }

    #[test]
    fn test_tls_flags_come_in_pairs() {
        assert!(Cli::try_parse_from([
            "peergate",
            "proxy",
            "http://127.0.0.1:3000",
            "--tls-cert",
            "/tmp/cert.pem",
        ])
        .is_err());

        let cli = Cli::try_parse_from([
            "peergate",
            "proxy",
            "http://127.0.0.1:3000",
            "--tls-cert",
            "/tmp/cert.pem",
            "--tls-key",
            "/tmp/key.pem",
        ])
        .unwrap();
        let Command::Proxy(opts) = cli.command else {
            panic!("expected proxy mode");
        };
        let tls = opts.tls().expect("tls pair should be configured");
        assert_eq!(tls.port, 443);
    }

    #[test]
    fn test_cache_expiry_accepts_humantime() {
        let cli =
            Cli::try_parse_from(["peergate", "check", "--cache-expiry", "90s"]).unwrap();
        let Command::Check(opts) = cli.command else {
            panic!("expected check mode");
        };
        assert_eq!(opts.common.cache_expiry, Duration::from_secs(90));
    }

    #[test]
    fn test_ensure_state_dir_creates_missing() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("state/nested");
        ensure_state_dir(&dir).unwrap();
        assert!(dir.is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_state_dir_rejects_readonly() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("ro");
        std::fs::create_dir(&dir).unwrap();
        let mut perms = std::fs::metadata(&dir).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&dir, perms).unwrap();

        let err = ensure_state_dir(&dir).unwrap_err();
        assert!(matches!(err, GateError::StateDirNotWritable { .. }));

        // Restore so the tempdir can be cleaned up.
        let mut perms = std::fs::metadata(&dir).unwrap().permissions();
        perms.set_readonly(false);
        std::fs::set_permissions(&dir, perms).unwrap();
    }
}
