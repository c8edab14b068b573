//! Per-connection relay session state machine.
//!
//! One session owns one accepted client connection end to end:
//!
//! ```text
//! Resolving -> PolicyLookup -> ConnectingUpstream -> [Negotiating] ->
//! Relaying -> Closing -> Closed
//! ```
//!
//! with `Failed` terminal from any non-terminal state. A destination with
//! no cache opinion is tried direct first; if that connect fails the
//! session records the failure and falls back to the configured proxy
//! exactly once. Session outcomes feed the decision cache so later
//! sessions to the same destination start on the right path.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use shunt_negotiate::{HttpConnect, Negotiator, Socks4, Socks5, Target};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::cache::{DecisionCache, Policy};
use crate::config::{Config, ProxyKind};
use crate::error::{NegotiateFailure, ResolveError, SessionError};
use crate::relay::listener::RelayStats;
use crate::relay::negotiate_io;
use crate::relay::pump::{pump, PumpError, RelayTotals};
use crate::relay::tls::TlsClient;
use crate::resolver::OriginalDst;

/// Stream the relay can pump: plain TCP or TLS-wrapped.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type Upstream = Box<dyn AsyncStream>;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Resolving = 0,
    PolicyLookup = 1,
    ConnectingUpstream = 2,
    Negotiating = 3,
    Relaying = 4,
    Closing = 5,
    Closed = 6,
    Failed = 7,
}

const STATE_COUNT: usize = 8;

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Resolving => "resolving",
            SessionState::PolicyLookup => "policy_lookup",
            SessionState::ConnectingUpstream => "connecting_upstream",
            SessionState::Negotiating => "negotiating",
            SessionState::Relaying => "relaying",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    const ALL: [SessionState; STATE_COUNT] = [
        SessionState::Resolving,
        SessionState::PolicyLookup,
        SessionState::ConnectingUpstream,
        SessionState::Negotiating,
        SessionState::Relaying,
        SessionState::Closing,
        SessionState::Closed,
        SessionState::Failed,
    ];
}

/// Live-state gauges by session state. Non-terminal states count sessions
/// currently in them; `closed`/`failed` accumulate.
#[derive(Default)]
pub struct StateGauges {
    counts: [AtomicU64; STATE_COUNT],
}

impl StateGauges {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, from: Option<SessionState>, to: SessionState) {
        if let Some(from) = from {
            if !from.is_terminal() {
                self.counts[from as usize].fetch_sub(1, Ordering::Relaxed);
            }
        }
        self.counts[to as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, state: SessionState) -> u64 {
        self.counts[state as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for state in SessionState::ALL {
            map.insert(state.as_str().to_string(), json!(self.get(state)));
        }
        serde_json::Value::Object(map)
    }
}

/// State shared by every session of one relay engine. The cache is the
/// only cross-session mutable state; everything else is read-only or
/// atomic counters.
pub struct SessionContext {
    pub config: Arc<Config>,
    pub resolver: Arc<dyn OriginalDst>,
    pub cache: Arc<DecisionCache>,
    pub tls: Option<Arc<TlsClient>>,
    pub stats: Arc<RelayStats>,
    pub gauges: Arc<StateGauges>,
}

impl SessionContext {
    /// Build the shared context, deriving the cache and (for
    /// https-connect) the TLS client from the configuration.
    pub fn new(config: Config, resolver: Arc<dyn OriginalDst>) -> anyhow::Result<Arc<Self>> {
        let tls = match (&config.proxy.kind, &config.proxy.tls) {
            (ProxyKind::HttpsConnect, Some(options)) => {
                Some(Arc::new(TlsClient::from_options(options)?))
            }
            (ProxyKind::HttpsConnect, None) => {
                anyhow::bail!("https-connect proxy configured without TLS options")
            }
            _ => None,
        };
        let cache = Arc::new(DecisionCache::new(config.autoproxy.clone()));
        Ok(Arc::new(Self {
            config: Arc::new(config),
            resolver,
            cache,
            tls,
            stats: Arc::new(RelayStats::default()),
            gauges: Arc::new(StateGauges::new()),
        }))
    }
}

/// Completed-session report.
#[derive(Debug)]
pub struct SessionSummary {
    pub destination: SocketAddr,
    pub policy: Policy,
    pub totals: RelayTotals,
}

/// One client connection being relayed.
pub struct RelaySession {
    ctx: Arc<SessionContext>,
    client: TcpStream,
    peer: SocketAddr,
    listen_addr: SocketAddr,
    state: SessionState,
}

impl RelaySession {
    pub fn new(
        ctx: Arc<SessionContext>,
        client: TcpStream,
        peer: SocketAddr,
        listen_addr: SocketAddr,
    ) -> Self {
        ctx.gauges.record(None, SessionState::Resolving);
        Self {
            ctx,
            client,
            peer,
            listen_addr,
            state: SessionState::Resolving,
        }
    }

    /// Drive the session to completion. Shutdown forces teardown from any
    /// state and is reported as `Cancelled`, distinct from failure.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SessionSummary, SessionError> {
        let result = tokio::select! {
            result = self.drive() => result,
            _ = shutdown.changed() => Err(SessionError::Cancelled),
        };

        let terminal = match &result {
            Ok(_) | Err(SessionError::Cancelled) | Err(SessionError::Timeout(_)) => {
                SessionState::Closed
            }
            Err(_) => SessionState::Failed,
        };
        self.set_state(terminal);
        result
    }

    async fn drive(&mut self) -> Result<SessionSummary, SessionError> {
        let destination = self.ctx.resolver.resolve(&self.client)?;
        if destination == self.listen_addr {
            // Redirect loop: the packet filter sent us our own traffic.
            return Err(ResolveError::Unavailable.into());
        }
        trace!(peer = %self.peer, destination = %destination, "Original destination resolved");

        self.set_state(SessionState::PolicyLookup);
        let autoproxy = self.ctx.config.autoproxy.enabled;
        let policy = if autoproxy {
            self.ctx.cache.lookup(destination.ip()).await
        } else {
            Policy::Proxied
        };

        self.set_state(SessionState::ConnectingUpstream);
        let handshake_deadline = self.ctx.config.handshake_timeout;
        let handshake = self.connect_and_negotiate(destination, policy);
        let (mut upstream, attempted, leftover) =
            match timeout(handshake_deadline, handshake).await {
                Ok(result) => result?,
                Err(_) => return Err(SessionError::Timeout("handshake")),
            };

        // Tunnel bytes the proxy sent past its handshake reply belong to
        // the client.
        if !leftover.is_empty() {
            self.client
                .write_all(&leftover)
                .await
                .map_err(SessionError::RelayIo)?;
        }

        self.set_state(SessionState::Relaying);
        debug!(destination = %destination, policy = attempted.as_str(), "Relay started");
        let relayed = pump(
            &mut self.client,
            &mut upstream,
            self.ctx.config.idle_timeout,
        )
        .await;

        self.set_state(SessionState::Closing);
        match relayed {
            Ok(totals) => {
                if autoproxy {
                    self.ctx
                        .cache
                        .record_outcome(destination.ip(), attempted, true)
                        .await;
                }
                self.ctx
                    .stats
                    .bytes_to_upstream
                    .fetch_add(totals.to_upstream, Ordering::Relaxed);
                self.ctx
                    .stats
                    .bytes_from_upstream
                    .fetch_add(totals.from_upstream, Ordering::Relaxed);
                Ok(SessionSummary {
                    destination,
                    policy: attempted,
                    totals,
                })
            }
            Err(PumpError::IdleTimeout) => Err(SessionError::Timeout("idle")),
            Err(PumpError::Io(error)) => Err(SessionError::RelayIo(error)),
        }
    }

    /// Open the upstream connection per policy, negotiating the proxy
    /// handshake when proxied. A failed direct connect records the
    /// failure and retries through the proxy exactly once.
    async fn connect_and_negotiate(
        &mut self,
        destination: SocketAddr,
        mut policy: Policy,
    ) -> Result<(Upstream, Policy, Vec<u8>), SessionError> {
        let connect_timeout = self.ctx.config.connect_timeout;
        let autoproxy = self.ctx.config.autoproxy.enabled;

        loop {
            match policy {
                Policy::Direct => {
                    match connect_with_timeout(destination, connect_timeout).await {
                        Ok(stream) => {
                            return Ok((Box::new(stream), Policy::Direct, Vec::new()));
                        }
                        Err(error) => {
                            debug!(
                                destination = %destination,
                                error = %error,
                                "Direct connect failed; falling back to proxy"
                            );
                            if autoproxy {
                                self.ctx
                                    .cache
                                    .record_outcome(destination.ip(), Policy::Direct, false)
                                    .await;
                            }
                            self.ctx
                                .stats
                                .direct_fallbacks
                                .fetch_add(1, Ordering::Relaxed);
                            policy = Policy::Proxied;
                        }
                    }
                }
                Policy::Proxied => {
                    let proxy_addr = self.ctx.config.proxy.addr;
                    let stream = connect_with_timeout(proxy_addr, connect_timeout)
                        .await
                        .map_err(SessionError::UpstreamUnreachable)?;

                    self.set_state(SessionState::Negotiating);
                    return match self.negotiate(stream, destination).await {
                        Ok((upstream, leftover)) => Ok((upstream, Policy::Proxied, leftover)),
                        Err(failure) => {
                            if autoproxy {
                                self.ctx
                                    .cache
                                    .record_outcome(destination.ip(), Policy::Proxied, false)
                                    .await;
                            }
                            Err(SessionError::Negotiation(failure))
                        }
                    };
                }
            }
        }
    }

    /// Run the handshake matching the configured proxy variant.
    async fn negotiate(
        &self,
        tcp: TcpStream,
        destination: SocketAddr,
    ) -> Result<(Upstream, Vec<u8>), NegotiateFailure> {
        let profile = &self.ctx.config.proxy;
        let target: Target = destination.into();
        let credentials = profile.credentials.as_ref();

        match profile.kind {
            ProxyKind::Socks4 | ProxyKind::Socks4a => {
                let mut negotiator = Socks4::new(target, credentials);
                finish_plain(tcp, &mut negotiator).await
            }
            ProxyKind::Socks5 => {
                let mut negotiator = Socks5::new(target, credentials);
                finish_plain(tcp, &mut negotiator).await
            }
            ProxyKind::HttpConnect => {
                let mut negotiator = HttpConnect::new(target, credentials);
                finish_plain(tcp, &mut negotiator).await
            }
            ProxyKind::HttpsConnect => {
                let tls = self.ctx.tls.as_ref().ok_or_else(|| {
                    NegotiateFailure::TlsHandshake(io::Error::other("TLS client not configured"))
                })?;
                let mut stream = tls
                    .connect(tcp)
                    .await
                    .map_err(NegotiateFailure::TlsHandshake)?;
                let mut negotiator = HttpConnect::new(target, credentials);
                let leftover = negotiate_io::drive(&mut stream, &mut negotiator).await?;
                Ok((Box::new(stream), leftover))
            }
        }
    }

    fn set_state(&mut self, next: SessionState) {
        trace!(from = self.state.as_str(), to = next.as_str(), "Session state");
        self.ctx.gauges.record(Some(self.state), next);
        self.state = next;
    }
}

async fn finish_plain<N: Negotiator>(
    mut tcp: TcpStream,
    negotiator: &mut N,
) -> Result<(Upstream, Vec<u8>), NegotiateFailure> {
    let leftover = negotiate_io::drive(&mut tcp, negotiator).await?;
    Ok((Box::new(tcp), leftover))
}

async fn connect_with_timeout(addr: SocketAddr, limit: Duration) -> io::Result<TcpStream> {
    match timeout(limit, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_gauges_track_transitions() {
        let gauges = StateGauges::new();
        gauges.record(None, SessionState::Resolving);
        gauges.record(Some(SessionState::Resolving), SessionState::PolicyLookup);
        gauges.record(Some(SessionState::PolicyLookup), SessionState::Closed);

        assert_eq!(gauges.get(SessionState::Resolving), 0);
        assert_eq!(gauges.get(SessionState::PolicyLookup), 0);
        assert_eq!(gauges.get(SessionState::Closed), 1);
    }

    #[test]
    fn terminal_states_accumulate() {
        let gauges = StateGauges::new();
        for _ in 0..3 {
            gauges.record(None, SessionState::Resolving);
            gauges.record(Some(SessionState::Resolving), SessionState::Failed);
        }
        assert_eq!(gauges.get(SessionState::Failed), 3);
        let snapshot = gauges.snapshot();
        assert_eq!(snapshot["failed"], 3);
    }
}
