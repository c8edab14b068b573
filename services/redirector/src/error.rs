//! Session error taxonomy.
//!
//! Every variant is session-local: it terminates exactly one relay
//! session and never the process. The client only ever observes a closed
//! connection; none of this detail leaks to it.

use std::io;

use shunt_negotiate::NegotiateError;
use thiserror::Error;

/// Why the transparent-redirect resolver could not produce a destination.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// getsockopt(SO_ORIGINAL_DST) failed.
    #[error("original destination lookup failed: {0}")]
    Syscall(io::Error),

    /// The socket has no recorded original destination (not redirected,
    /// or the destination equals the listener itself, which is a
    /// redirect loop).
    #[error("no original destination available for this socket")]
    Unavailable,
}

/// Negotiation-phase failure, wrapping the protocol-level error with the
/// transport conditions that can also end a handshake.
#[derive(Debug, Error)]
pub enum NegotiateFailure {
    #[error(transparent)]
    Protocol(#[from] NegotiateError),

    /// TLS to the HTTPS-CONNECT proxy did not come up.
    #[error("tls handshake with proxy failed: {0}")]
    TlsHandshake(io::Error),

    /// The proxy closed the connection before finishing its reply.
    #[error("proxy closed connection mid-handshake")]
    Incomplete,

    #[error("handshake i/o error: {0}")]
    Io(io::Error),
}

/// Terminal outcome of a failed relay session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot recover original destination: {0}")]
    Resolution(#[from] ResolveError),

    /// TCP connect to the chosen target failed or timed out, with no
    /// fallback remaining.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(io::Error),

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiateFailure),

    /// Handshake or idle deadline exceeded. A policy boundary, not a
    /// fault of the proxy or the process.
    #[error("{0} deadline exceeded")]
    Timeout(&'static str),

    #[error("relay i/o error: {0}")]
    RelayIo(io::Error),

    /// Forced teardown by process shutdown, distinct from failure.
    #[error("session cancelled by shutdown")]
    Cancelled,
}

impl SessionError {
    /// Stable reason code for logs and state dumps.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SessionError::Resolution(_) => "resolution_error",
            SessionError::UpstreamUnreachable(_) => "upstream_unreachable",
            SessionError::Negotiation(NegotiateFailure::TlsHandshake(_)) => "tls_handshake",
            SessionError::Negotiation(_) => "negotiation_error",
            SessionError::Timeout(_) => "session_timeout",
            SessionError::RelayIo(_) => "relay_io_error",
            SessionError::Cancelled => "cancelled",
        }
    }
}
