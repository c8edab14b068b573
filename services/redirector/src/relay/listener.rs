//! Accept loop for redirected client connections.
//!
//! Every accepted connection becomes one spawned session task. Admission
//! is a semaphore sized to the session limit: the loop takes a permit
//! before accepting, so at the limit it stops accepting instead of
//! taking connections it cannot serve, and the kernel backlog absorbs
//! the burst.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::SessionError;
use crate::relay::session::{RelaySession, SessionContext};

/// Accept-loop and session counters. Byte totals are accumulated by
/// sessions as relays finish.
#[derive(Default)]
pub struct RelayStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub sessions_relayed: AtomicU64,
    pub sessions_failed: AtomicU64,
    pub sessions_timed_out: AtomicU64,
    pub sessions_cancelled: AtomicU64,
    pub direct_fallbacks: AtomicU64,
    pub bytes_to_upstream: AtomicU64,
    pub bytes_from_upstream: AtomicU64,
}

impl RelayStats {
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "connections_accepted": self.connections_accepted.load(Ordering::Relaxed),
            "connections_active": self.connections_active.load(Ordering::Relaxed),
            "sessions_relayed": self.sessions_relayed.load(Ordering::Relaxed),
            "sessions_failed": self.sessions_failed.load(Ordering::Relaxed),
            "sessions_timed_out": self.sessions_timed_out.load(Ordering::Relaxed),
            "sessions_cancelled": self.sessions_cancelled.load(Ordering::Relaxed),
            "direct_fallbacks": self.direct_fallbacks.load(Ordering::Relaxed),
            "bytes_to_upstream": self.bytes_to_upstream.load(Ordering::Relaxed),
            "bytes_from_upstream": self.bytes_from_upstream.load(Ordering::Relaxed),
        })
    }
}

pub struct RelayListener {
    ctx: Arc<SessionContext>,
    listener: TcpListener,
    local_addr: SocketAddr,
    limiter: Arc<Semaphore>,
}

impl RelayListener {
    pub async fn bind(ctx: Arc<SessionContext>) -> anyhow::Result<Self> {
        let listen_addr = ctx.config.listen_addr;
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("Unable to bind {}", listen_addr))?;
        let local_addr = listener
            .local_addr()
            .context("Unable to read bound address")?;
        let limiter = Arc::new(Semaphore::new(ctx.config.max_sessions));
        info!(addr = %local_addr, "Redirector listening");
        Ok(Self {
            ctx,
            listener,
            local_addr,
            limiter,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until shutdown. Each session runs in its own task holding
    /// an admission permit for its whole lifetime.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        loop {
            if self.limiter.available_permits() == 0 {
                warn!(
                    limit = self.ctx.config.max_sessions,
                    "Session limit reached; pausing accept"
                );
            }
            let permit = match self.limiter.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let mut shutdown_watch = shutdown.clone();
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown_watch.changed() => break,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    error!(error = %error, "Accept failed");
                    drop(permit);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            stream.set_nodelay(true).ok();

            let stats = Arc::clone(&self.ctx.stats);
            stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
            stats.connections_active.fetch_add(1, Ordering::Relaxed);

            let session = RelaySession::new(Arc::clone(&self.ctx), stream, peer, self.local_addr);
            let session_shutdown = shutdown.clone();
            let span = info_span!("session", peer = %peer);
            tokio::spawn(
                async move {
                    match session.run(session_shutdown).await {
                        Ok(summary) => {
                            stats.sessions_relayed.fetch_add(1, Ordering::Relaxed);
                            debug!(
                                destination = %summary.destination,
                                policy = summary.policy.as_str(),
                                to_upstream = summary.totals.to_upstream,
                                from_upstream = summary.totals.from_upstream,
                                "Session finished"
                            );
                        }
                        Err(SessionError::Cancelled) => {
                            stats.sessions_cancelled.fetch_add(1, Ordering::Relaxed);
                            debug!("Session cancelled by shutdown");
                        }
                        Err(error @ SessionError::Timeout(_)) => {
                            stats.sessions_timed_out.fetch_add(1, Ordering::Relaxed);
                            debug!(reason = error.reason_code(), error = %error, "Session timed out");
                        }
                        Err(error) => {
                            stats.sessions_failed.fetch_add(1, Ordering::Relaxed);
                            warn!(reason = error.reason_code(), error = %error, "Session failed");
                        }
                    }
                    stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                    drop(permit);
                }
                .instrument(span),
            );
        }
        info!("Accept loop stopped");
    }
}
