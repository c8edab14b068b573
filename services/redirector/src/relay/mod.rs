//! Connection relaying: accept loop, per-session state machine,
//! handshake driver, TLS client, and the byte pump.

pub mod listener;
pub mod negotiate_io;
pub mod pump;
pub mod session;
pub mod tls;

pub use listener::{RelayListener, RelayStats};
pub use pump::{pump, PumpError, RelayTotals};
pub use session::{RelaySession, SessionContext, SessionState, SessionSummary, StateGauges};
pub use tls::TlsClient;
