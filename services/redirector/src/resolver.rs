//! Transparent-redirect destination recovery.
//!
//! When netfilter REDIRECTs a connection to the listener, the address the
//! client actually dialed is recorded on the socket and read back with
//! `getsockopt(SO_ORIGINAL_DST)` (IPv4) or `IP6T_SO_ORIGINAL_DST` (IPv6).
//! The resolver is a trait so deployments without netfilter (and tests)
//! can substitute a fixed destination.

use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::error::ResolveError;

/// Recovers the destination a redirected client originally dialed.
pub trait OriginalDst: Send + Sync {
    fn resolve(&self, client: &TcpStream) -> Result<SocketAddr, ResolveError>;
}

/// Resolves via the netfilter original-destination socket option.
#[cfg(target_os = "linux")]
pub struct NetfilterResolver;

#[cfg(target_os = "linux")]
impl OriginalDst for NetfilterResolver {
    fn resolve(&self, client: &TcpStream) -> Result<SocketAddr, ResolveError> {
        use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

        use nix::sys::socket::sockopt::{Ip6tOriginalDst, OriginalDst as IptOriginalDst};

        let local = client.local_addr().map_err(ResolveError::Syscall)?;

        if local.is_ipv4() {
            let sin = nix::sys::socket::getsockopt(client, IptOriginalDst)
                .map_err(|errno| ResolveError::Syscall(errno.into()))?;
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            let port = u16::from_be(sin.sin_port);
            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        } else {
            let sin6 = nix::sys::socket::getsockopt(client, Ip6tOriginalDst)
                .map_err(|errno| ResolveError::Syscall(errno.into()))?;
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let port = u16::from_be(sin6.sin6_port);
            Ok(SocketAddr::new(IpAddr::V6(ip), port))
        }
    }
}

/// Resolves every connection to one configured destination. Used when
/// `SHUNT_FIXED_DESTINATION` is set and by the test harness.
pub struct FixedResolver {
    destination: SocketAddr,
}

impl FixedResolver {
    pub fn new(destination: SocketAddr) -> Self {
        Self { destination }
    }
}

impl OriginalDst for FixedResolver {
    fn resolve(&self, _client: &TcpStream) -> Result<SocketAddr, ResolveError> {
        Ok(self.destination)
    }
}
