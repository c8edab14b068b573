//! SOCKS4 and SOCKS4A CONNECT handshake.
//!
//! Single round trip: an 8+ byte request, an 8-byte fixed reply.
//!
//! Request: `VN=4, CD=1, DSTPORT, DSTIP, USERID, NUL`. For a hostname
//! destination (SOCKS4A) DSTIP is `0.0.0.1` and the hostname follows the
//! USERID terminator, NUL-terminated.
//!
//! Reply: `VN=0, CD, DSTPORT, DSTIP`. CD 90 grants the request; 91/92/93
//! reject it.

use std::net::SocketAddr;

use crate::{buffer_reply, Credentials, NegotiateError, Negotiator, Step, Target};

const REPLY_LEN: usize = 8;

const CD_GRANTED: u8 = 90;
const CD_REJECTED: u8 = 91;
const CD_NO_IDENTD: u8 = 92;
const CD_IDENTD_MISMATCH: u8 = 93;

/// SOCKS4/4A negotiator. The 4A hostname form is used automatically when
/// the target is a domain name.
pub struct Socks4 {
    target: Target,
    user_id: String,
    reply: Vec<u8>,
}

impl Socks4 {
    /// Create a negotiator for `target`. SOCKS4 has no password; the
    /// username (if any) is sent as the USERID field, which some servers
    /// use for access control.
    pub fn new(target: Target, credentials: Option<&Credentials>) -> Self {
        Self {
            target,
            user_id: credentials.map(|c| c.username.clone()).unwrap_or_default(),
            reply: Vec::with_capacity(REPLY_LEN),
        }
    }

    fn encode_request(&self) -> Vec<u8> {
        let mut req = Vec::with_capacity(16 + self.user_id.len());
        req.push(4); // VN
        req.push(1); // CD = CONNECT
        req.extend_from_slice(&self.target.port().to_be_bytes());

        match &self.target {
            Target::Addr(SocketAddr::V4(addr)) => {
                req.extend_from_slice(&addr.ip().octets());
                req.extend_from_slice(self.user_id.as_bytes());
                req.push(0);
            }
            // SOCKS4 cannot encode IPv6; the caller is expected to route
            // IPv6 destinations to a SOCKS5 or CONNECT profile. Falling
            // back to the 4A hostname form keeps the request well-formed.
            Target::Addr(SocketAddr::V6(addr)) => {
                req.extend_from_slice(&[0, 0, 0, 1]);
                req.extend_from_slice(self.user_id.as_bytes());
                req.push(0);
                req.extend_from_slice(addr.ip().to_string().as_bytes());
                req.push(0);
            }
            Target::Domain(host, _) => {
                req.extend_from_slice(&[0, 0, 0, 1]);
                req.extend_from_slice(self.user_id.as_bytes());
                req.push(0);
                req.extend_from_slice(host.as_bytes());
                req.push(0);
            }
        }
        req
    }
}

impl Negotiator for Socks4 {
    fn begin(&mut self) -> Vec<u8> {
        self.encode_request()
    }

    fn on_bytes(&mut self, bytes: &[u8]) -> Result<Step, NegotiateError> {
        buffer_reply(&mut self.reply, bytes)?;

        if self.reply.len() < REPLY_LEN {
            return Ok(Step::Need(REPLY_LEN - self.reply.len()));
        }

        if self.reply[0] != 0 {
            return Err(NegotiateError::Protocol(format!(
                "SOCKS4 reply version byte {:#04x}, expected 0x00",
                self.reply[0]
            )));
        }

        match self.reply[1] {
            CD_GRANTED => Ok(Step::Established {
                leftover: self.reply.split_off(REPLY_LEN),
            }),
            CD_REJECTED => Err(NegotiateError::Rejected {
                code: CD_REJECTED,
                reason: "request rejected or failed",
            }),
            CD_NO_IDENTD => Err(NegotiateError::Rejected {
                code: CD_NO_IDENTD,
                reason: "identd unreachable",
            }),
            CD_IDENTD_MISMATCH => Err(NegotiateError::Rejected {
                code: CD_IDENTD_MISMATCH,
                reason: "identd user mismatch",
            }),
            other => Err(NegotiateError::Protocol(format!(
                "SOCKS4 reply code {:#04x} out of range",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_target() -> Target {
        Target::Addr("93.184.216.34:443".parse().unwrap())
    }

    #[test]
    fn request_encodes_ipv4_destination() {
        let mut n = Socks4::new(v4_target(), None);
        let req = n.begin();
        assert_eq!(
            req,
            vec![4, 1, 0x01, 0xbb, 93, 184, 216, 34, 0],
        );
    }

    #[test]
    fn request_includes_user_id() {
        let creds = Credentials {
            username: "joe".to_string(),
            password: String::new(),
        };
        let mut n = Socks4::new(v4_target(), Some(&creds));
        let req = n.begin();
        assert_eq!(&req[8..], b"joe\0");
    }

    #[test]
    fn socks4a_hostname_follows_user_id() {
        let mut n = Socks4::new(Target::Domain("example.com".to_string(), 80), None);
        let req = n.begin();
        // 0.0.0.1 marker, empty userid, then the hostname
        assert_eq!(&req[4..8], &[0, 0, 0, 1]);
        assert_eq!(&req[8..9], b"\0");
        assert_eq!(&req[9..], b"example.com\0");
    }

    #[test]
    fn granted_reply_establishes() {
        let mut n = Socks4::new(v4_target(), None);
        n.begin();
        let step = n.on_bytes(&[0, 90, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(step, Step::Established { leftover: vec![] });
    }

    #[test]
    fn partial_reply_is_resumable() {
        let mut n = Socks4::new(v4_target(), None);
        n.begin();
        assert_eq!(n.on_bytes(&[0, 90, 0]).unwrap(), Step::Need(5));
        assert_eq!(n.on_bytes(&[0, 0]).unwrap(), Step::Need(3));
        let step = n.on_bytes(&[0, 0, 0, 0xaa, 0xbb]).unwrap();
        assert_eq!(
            step,
            Step::Established {
                leftover: vec![0xaa, 0xbb]
            }
        );
    }

    #[test]
    fn rejected_reply_maps_code() {
        let mut n = Socks4::new(v4_target(), None);
        n.begin();
        let err = n.on_bytes(&[0, 91, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, NegotiateError::Rejected { code: 91, .. }));
    }

    #[test]
    fn nonzero_version_is_protocol_error() {
        let mut n = Socks4::new(v4_target(), None);
        n.begin();
        let err = n.on_bytes(&[4, 90, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, NegotiateError::Protocol(_)));
    }
}
