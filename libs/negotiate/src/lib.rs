//! # shunt-negotiate
//!
//! Sans-I/O handshake state machines for upstream proxy protocols.
//!
//! Each supported protocol (SOCKS4/4A, SOCKS5, HTTP CONNECT) is a small
//! state machine that produces the bytes to send and consumes the bytes
//! received, without ever touching a socket:
//!
//! - [`Negotiator::begin`] returns the first outbound bytes.
//! - [`Negotiator::on_bytes`] is fed whatever arrived on the wire and
//!   answers with a [`Step`]: more input needed, more output to send, or
//!   the tunnel is established.
//!
//! Replies may arrive fragmented across any number of reads; negotiators
//! buffer internally and stay resumable, so the I/O driver never has to
//! know protocol frame boundaries. Bytes the proxy sends past the end of
//! its handshake reply belong to the tunnel and are handed back in
//! [`Step::Established`].

mod http;
mod socks4;
mod socks5;

pub use http::HttpConnect;
pub use socks4::Socks4;
pub use socks5::Socks5;

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

/// Upper bound on buffered handshake reply bytes. A proxy that sends more
/// than this before establishing the tunnel is misbehaving.
pub const MAX_TRANSCRIPT: usize = 8192;

/// Destination the proxy is asked to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Literal socket address (IPv4 or IPv6).
    Addr(SocketAddr),
    /// Hostname and port, resolved by the proxy (SOCKS4A, SOCKS5 ATYP=3,
    /// CONNECT host form).
    Domain(String, u16),
}

impl Target {
    /// Port of the destination.
    pub fn port(&self) -> u16 {
        match self {
            Target::Addr(addr) => addr.port(),
            Target::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Addr(addr) => write!(f, "{}", addr),
            Target::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl From<SocketAddr> for Target {
    fn from(addr: SocketAddr) -> Self {
        Target::Addr(addr)
    }
}

/// Proxy credentials (SOCKS5 username/password, HTTP Basic).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Outcome of feeding received bytes to a negotiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The reply is incomplete; at least this many more bytes are expected.
    Need(usize),
    /// Send these bytes upstream, then keep reading.
    Send(Vec<u8>),
    /// Handshake complete. Any bytes the proxy sent past the end of its
    /// reply are tunnel payload and must be delivered to the client.
    Established { leftover: Vec<u8> },
}

/// Handshake failure. Every variant means the session cannot proceed;
/// none of them is recoverable within the same connection.
#[derive(Debug, Error)]
pub enum NegotiateError {
    /// Malformed or unexpected reply frame (bad version byte, short or
    /// oversized frame, unparseable status line).
    #[error("malformed handshake reply: {0}")]
    Protocol(String),

    /// The proxy offered no authentication method we can speak.
    #[error("no acceptable authentication method (offered {offered:#04x})")]
    UnsupportedAuth { offered: u8 },

    /// The proxy rejected the configured credentials.
    #[error("proxy rejected credentials")]
    AuthRejected,

    /// The proxy refused the CONNECT request with a protocol-level code.
    #[error("proxy refused connect: {reason} (code {code:#04x})")]
    Rejected { code: u8, reason: &'static str },

    /// The HTTP proxy answered the CONNECT with a non-2xx status line.
    #[error("proxy returned {status_line:?}")]
    HttpStatus { status_line: String },
}

/// A resumable proxy handshake state machine.
///
/// Contract: call [`begin`](Negotiator::begin) exactly once and send its
/// bytes, then feed every received chunk to
/// [`on_bytes`](Negotiator::on_bytes) (an empty chunk is allowed and just
/// re-attempts progress on buffered data) until it yields
/// [`Step::Established`] or an error.
pub trait Negotiator {
    /// First bytes to send to the proxy after the TCP (or TLS) connection
    /// to it is up.
    fn begin(&mut self) -> Vec<u8>;

    /// Feed bytes received from the proxy.
    fn on_bytes(&mut self, bytes: &[u8]) -> Result<Step, NegotiateError>;
}

/// Shared transcript buffering with an upper bound.
pub(crate) fn buffer_reply(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), NegotiateError> {
    if buf.len() + bytes.len() > MAX_TRANSCRIPT {
        return Err(NegotiateError::Protocol(format!(
            "handshake reply exceeds {} bytes",
            MAX_TRANSCRIPT
        )));
    }
    buf.extend_from_slice(bytes);
    Ok(())
}
