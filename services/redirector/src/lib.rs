//! shunt redirector
//!
//! Transparent TCP-to-proxy redirector. Accepts connections diverted by
//! the packet filter, recovers each connection's original destination,
//! and relays it either directly or through a configured SOCKS4/4a,
//! SOCKS5, or HTTP(S) CONNECT proxy. An adaptive decision cache learns
//! per destination which path works.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod relay;
pub mod resolver;
pub mod subsystem;

pub use cache::{DecisionCache, Policy};
pub use config::{AutoproxyOptions, Config, ProxyKind, ProxyProfile, TlsOptions};
pub use engine::RelayEngine;
pub use error::{NegotiateFailure, ResolveError, SessionError};
pub use relay::{RelayListener, SessionContext};
pub use resolver::{FixedResolver, OriginalDst};
pub use subsystem::Subsystem;
