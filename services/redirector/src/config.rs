//! Redirector configuration (env-driven).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use shunt_negotiate::Credentials;

/// Upstream proxy protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Socks4,
    Socks4a,
    Socks5,
    HttpConnect,
    HttpsConnect,
}

impl ProxyKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "socks4" => Ok(Self::Socks4),
            "socks4a" => Ok(Self::Socks4a),
            "socks5" => Ok(Self::Socks5),
            "http-connect" => Ok(Self::HttpConnect),
            "https-connect" => Ok(Self::HttpsConnect),
            other => bail!(
                "Unknown proxy kind {:?}. \
                 Expected socks4, socks4a, socks5, http-connect, or https-connect.",
                other
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Socks4 => "socks4",
            Self::Socks4a => "socks4a",
            Self::Socks5 => "socks5",
            Self::HttpConnect => "http-connect",
            Self::HttpsConnect => "https-connect",
        }
    }
}

/// TLS options for HTTPS-CONNECT upstreams.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// Name presented for SNI and certificate validation. Defaults to the
    /// proxy address IP when unset.
    pub server_name: String,
    /// PEM bundle of trusted roots for the proxy certificate.
    pub ca_file: Option<PathBuf>,
    /// Skip certificate validation (proxies with self-signed certs).
    pub insecure: bool,
}

/// Configured upstream proxy. Read-only to the relay core.
#[derive(Debug, Clone)]
pub struct ProxyProfile {
    pub addr: SocketAddr,
    pub kind: ProxyKind,
    pub credentials: Option<Credentials>,
    pub tls: Option<TlsOptions>,
}

/// Autoproxy decision cache tunables. None of these are protocol-fixed;
/// they are operator policy.
#[derive(Debug, Clone)]
pub struct AutoproxyOptions {
    /// When false, every session goes through the proxy unconditionally.
    pub enabled: bool,
    /// Direct-connect failures within the window before a destination is
    /// flipped to proxied.
    pub fail_threshold: u32,
    /// Sliding window for the failure counter.
    pub fail_window: Duration,
    /// How long a confirmed-direct destination stays direct.
    pub direct_ttl: Duration,
    /// How long a flipped destination stays proxied before it is
    /// re-probed as direct.
    pub proxied_ttl: Duration,
    /// Entry cap; least-recently-used entries are evicted past it.
    pub capacity: usize,
}

/// Redirector configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the transparent listener binds to (iptables REDIRECT
    /// target).
    pub listen_addr: SocketAddr,

    /// Upstream proxy profile.
    pub proxy: ProxyProfile,

    /// Autoproxy cache tunables.
    pub autoproxy: AutoproxyOptions,

    /// TCP connect timeout for one upstream attempt.
    pub connect_timeout: Duration,

    /// Overall deadline covering upstream connect plus negotiation.
    pub handshake_timeout: Duration,

    /// Relay idle deadline, reset by any byte in either direction.
    /// Zero disables it.
    pub idle_timeout: Duration,

    /// Maximum concurrent sessions; the listener stops accepting when
    /// all permits are in use.
    pub max_sessions: usize,

    /// Skip SO_ORIGINAL_DST and treat every connection as destined here.
    /// Meant for deployments without netfilter and for tests.
    pub fixed_destination: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr: SocketAddr = std::env::var("SHUNT_LISTEN")
            .unwrap_or_else(|_| "127.0.0.1:12345".to_string())
            .parse()
            .context("SHUNT_LISTEN must be an address:port pair.")?;

        let proxy_addr: SocketAddr = std::env::var("SHUNT_PROXY_ADDR")
            .context("Missing proxy address. Set SHUNT_PROXY_ADDR.")?
            .parse()
            .context("SHUNT_PROXY_ADDR must be an address:port pair.")?;

        let kind = ProxyKind::parse(
            &std::env::var("SHUNT_PROXY_KIND").unwrap_or_else(|_| "socks5".to_string()),
        )?;

        let credentials = match std::env::var("SHUNT_PROXY_LOGIN") {
            Ok(username) => Some(Credentials {
                username,
                password: std::env::var("SHUNT_PROXY_PASSWORD").unwrap_or_default(),
            }),
            Err(_) => None,
        };

        let tls = if kind == ProxyKind::HttpsConnect {
            Some(TlsOptions {
                server_name: std::env::var("SHUNT_PROXY_TLS_HOSTNAME")
                    .unwrap_or_else(|_| proxy_addr.ip().to_string()),
                ca_file: std::env::var("SHUNT_PROXY_TLS_CA_FILE")
                    .ok()
                    .map(PathBuf::from),
                insecure: env_bool("SHUNT_PROXY_TLS_INSECURE"),
            })
        } else {
            None
        };

        let autoproxy = AutoproxyOptions {
            enabled: std::env::var("SHUNT_AUTOPROXY")
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(true),
            fail_threshold: env_u32("SHUNT_AUTOPROXY_FAIL_THRESHOLD")?
                .unwrap_or(3)
                .clamp(1, 1000),
            fail_window: Duration::from_secs(
                env_u64("SHUNT_AUTOPROXY_FAIL_WINDOW_SECS")?.unwrap_or(60).max(1),
            ),
            direct_ttl: Duration::from_secs(
                env_u64("SHUNT_AUTOPROXY_DIRECT_TTL_SECS")?.unwrap_or(900).max(1),
            ),
            proxied_ttl: Duration::from_secs(
                env_u64("SHUNT_AUTOPROXY_PROXIED_TTL_SECS")?.unwrap_or(300).max(1),
            ),
            capacity: env_u64("SHUNT_AUTOPROXY_CACHE_CAPACITY")?
                .unwrap_or(4096)
                .clamp(16, 1 << 20) as usize,
        };

        let connect_timeout =
            Duration::from_millis(env_u64("SHUNT_CONNECT_TIMEOUT_MS")?.unwrap_or(2000).max(50));
        let handshake_timeout = Duration::from_millis(
            env_u64("SHUNT_HANDSHAKE_TIMEOUT_MS")?.unwrap_or(10_000).max(100),
        );
        let idle_timeout =
            Duration::from_millis(env_u64("SHUNT_IDLE_TIMEOUT_MS")?.unwrap_or(300_000));

        let max_sessions = env_u64("SHUNT_MAX_SESSIONS")?
            .unwrap_or(10_000)
            .clamp(1, 1 << 20) as usize;

        let fixed_destination = match std::env::var("SHUNT_FIXED_DESTINATION") {
            Ok(v) => Some(
                v.parse()
                    .context("SHUNT_FIXED_DESTINATION must be an address:port pair.")?,
            ),
            Err(_) => None,
        };

        let log_level = std::env::var("SHUNT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            proxy: ProxyProfile {
                addr: proxy_addr,
                kind,
                credentials,
                tls,
            },
            autoproxy,
            connect_timeout,
            handshake_timeout,
            idle_timeout,
            max_sessions,
            fixed_destination,
            log_level,
        })
    }
}

fn env_bool(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    std::env::var(name)
        .ok()
        .map(|v| v.parse())
        .transpose()
        .with_context(|| format!("{} must be an integer.", name))
}

fn env_u32(name: &str) -> Result<Option<u32>> {
    std::env::var(name)
        .ok()
        .map(|v| v.parse())
        .transpose()
        .with_context(|| format!("{} must be an integer.", name))
}
