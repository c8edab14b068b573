//! SOCKS5 CONNECT handshake (RFC 1928), with optional username/password
//! authentication (RFC 1929).
//!
//! Two (or three, with auth) round trips:
//!
//! 1. method negotiation: we offer no-auth, plus username/password when
//!    credentials are configured; the server picks one.
//! 2. optional auth subnegotiation.
//! 3. CONNECT request with ATYP 1 (IPv4), 3 (domain), or 4 (IPv6) chosen
//!    by the address form of the destination; variable-length reply.

use std::net::SocketAddr;

use crate::{buffer_reply, Credentials, NegotiateError, Negotiator, Step, Target};

const VER: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;
const AUTH_VER: u8 = 0x01;

const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

enum State {
    MethodSelect,
    Auth,
    ConnectReply,
    Done,
}

/// SOCKS5 negotiator.
pub struct Socks5 {
    target: Target,
    credentials: Option<Credentials>,
    state: State,
    buf: Vec<u8>,
}

impl Socks5 {
    pub fn new(target: Target, credentials: Option<&Credentials>) -> Self {
        Self {
            target,
            credentials: credentials.cloned(),
            state: State::MethodSelect,
            buf: Vec::new(),
        }
    }

    fn connect_request(&self) -> Result<Vec<u8>, NegotiateError> {
        let mut req = vec![VER, CMD_CONNECT, 0x00];
        match &self.target {
            Target::Addr(SocketAddr::V4(addr)) => {
                req.push(ATYP_V4);
                req.extend_from_slice(&addr.ip().octets());
            }
            Target::Addr(SocketAddr::V6(addr)) => {
                req.push(ATYP_V6);
                req.extend_from_slice(&addr.ip().octets());
            }
            Target::Domain(host, _) => {
                if host.len() > 255 {
                    return Err(NegotiateError::Protocol(format!(
                        "hostname too long for SOCKS5 ({} bytes)",
                        host.len()
                    )));
                }
                req.push(ATYP_DOMAIN);
                req.push(host.len() as u8);
                req.extend_from_slice(host.as_bytes());
            }
        }
        req.extend_from_slice(&self.target.port().to_be_bytes());
        Ok(req)
    }

    fn auth_request(&self, creds: &Credentials) -> Result<Vec<u8>, NegotiateError> {
        if creds.username.len() > 255 || creds.password.len() > 255 {
            return Err(NegotiateError::Protocol(
                "SOCKS5 username/password exceeds 255 bytes".to_string(),
            ));
        }
        let mut req = vec![AUTH_VER, creds.username.len() as u8];
        req.extend_from_slice(creds.username.as_bytes());
        req.push(creds.password.len() as u8);
        req.extend_from_slice(creds.password.as_bytes());
        Ok(req)
    }

    /// Attempt progress on the buffered reply bytes for the current state.
    fn advance(&mut self) -> Result<Step, NegotiateError> {
        match self.state {
            State::MethodSelect => {
                if self.buf.len() < 2 {
                    return Ok(Step::Need(2 - self.buf.len()));
                }
                if self.buf[0] != VER {
                    return Err(NegotiateError::Protocol(format!(
                        "SOCKS5 method reply version {:#04x}, expected 0x05",
                        self.buf[0]
                    )));
                }
                let method = self.buf[1];
                self.buf.drain(..2);
                match method {
                    METHOD_NONE => {
                        self.state = State::ConnectReply;
                        Ok(Step::Send(self.connect_request()?))
                    }
                    METHOD_USERPASS => {
                        let creds = self.credentials.clone().ok_or(
                            NegotiateError::UnsupportedAuth {
                                offered: METHOD_USERPASS,
                            },
                        )?;
                        self.state = State::Auth;
                        Ok(Step::Send(self.auth_request(&creds)?))
                    }
                    _ => Err(NegotiateError::UnsupportedAuth { offered: method }),
                }
            }
            State::Auth => {
                if self.buf.len() < 2 {
                    return Ok(Step::Need(2 - self.buf.len()));
                }
                if self.buf[0] != AUTH_VER {
                    return Err(NegotiateError::Protocol(format!(
                        "SOCKS5 auth reply version {:#04x}, expected 0x01",
                        self.buf[0]
                    )));
                }
                let status = self.buf[1];
                self.buf.drain(..2);
                if status != 0 {
                    return Err(NegotiateError::AuthRejected);
                }
                self.state = State::ConnectReply;
                Ok(Step::Send(self.connect_request()?))
            }
            State::ConnectReply => {
                // VER REP RSV ATYP, then the bound address and port.
                if self.buf.len() < 4 {
                    return Ok(Step::Need(4 - self.buf.len()));
                }
                if self.buf[0] != VER {
                    return Err(NegotiateError::Protocol(format!(
                        "SOCKS5 connect reply version {:#04x}, expected 0x05",
                        self.buf[0]
                    )));
                }
                let rep = self.buf[1];
                if rep != 0 {
                    return Err(NegotiateError::Rejected {
                        code: rep,
                        reason: reply_reason(rep),
                    });
                }
                let addr_len = match self.buf[3] {
                    ATYP_V4 => 4,
                    ATYP_V6 => 16,
                    ATYP_DOMAIN => {
                        if self.buf.len() < 5 {
                            return Ok(Step::Need(1));
                        }
                        1 + self.buf[4] as usize
                    }
                    other => {
                        return Err(NegotiateError::Protocol(format!(
                            "SOCKS5 reply ATYP {:#04x} unknown",
                            other
                        )))
                    }
                };
                let total = 4 + addr_len + 2;
                if self.buf.len() < total {
                    return Ok(Step::Need(total - self.buf.len()));
                }
                self.state = State::Done;
                Ok(Step::Established {
                    leftover: self.buf.split_off(total),
                })
            }
            State::Done => Ok(Step::Established {
                leftover: std::mem::take(&mut self.buf),
            }),
        }
    }
}

impl Negotiator for Socks5 {
    fn begin(&mut self) -> Vec<u8> {
        match self.credentials {
            Some(_) => vec![VER, 0x02, METHOD_NONE, METHOD_USERPASS],
            None => vec![VER, 0x01, METHOD_NONE],
        }
    }

    fn on_bytes(&mut self, bytes: &[u8]) -> Result<Step, NegotiateError> {
        buffer_reply(&mut self.buf, bytes)?;
        self.advance()
    }
}

/// RFC 1928 §6 reply code table.
fn reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unassigned reply code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_target() -> Target {
        Target::Addr("93.184.216.34:443".parse().unwrap())
    }

    fn creds() -> Credentials {
        Credentials {
            username: "user".to_string(),
            password: "pass".to_string(),
        }
    }

    #[test]
    fn no_auth_happy_path() {
        let mut n = Socks5::new(v4_target(), None);
        assert_eq!(n.begin(), vec![0x05, 0x01, 0x00]);

        // Server picks no-auth; we send the CONNECT request.
        let step = n.on_bytes(&[0x05, 0x00]).unwrap();
        let Step::Send(req) = step else {
            panic!("expected Send, got {:?}", step);
        };
        assert_eq!(
            req,
            vec![0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xbb]
        );

        // Server grants with a bound IPv4 address.
        let step = n
            .on_bytes(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .unwrap();
        assert_eq!(step, Step::Established { leftover: vec![] });
    }

    #[test]
    fn userpass_subnegotiation() {
        let c = creds();
        let mut n = Socks5::new(v4_target(), Some(&c));
        assert_eq!(n.begin(), vec![0x05, 0x02, 0x00, 0x02]);

        let step = n.on_bytes(&[0x05, 0x02]).unwrap();
        let Step::Send(auth) = step else {
            panic!("expected Send, got {:?}", step);
        };
        assert_eq!(auth, b"\x01\x04user\x04pass");

        let step = n.on_bytes(&[0x01, 0x00]).unwrap();
        assert!(matches!(step, Step::Send(_)));
    }

    #[test]
    fn auth_rejection() {
        let c = creds();
        let mut n = Socks5::new(v4_target(), Some(&c));
        n.begin();
        n.on_bytes(&[0x05, 0x02]).unwrap();
        let err = n.on_bytes(&[0x01, 0x01]).unwrap_err();
        assert!(matches!(err, NegotiateError::AuthRejected));
    }

    #[test]
    fn no_acceptable_method() {
        let mut n = Socks5::new(v4_target(), None);
        n.begin();
        let err = n.on_bytes(&[0x05, 0xff]).unwrap_err();
        assert!(matches!(
            err,
            NegotiateError::UnsupportedAuth { offered: 0xff }
        ));
    }

    #[test]
    fn bad_version_byte_fails() {
        let mut n = Socks5::new(v4_target(), None);
        n.begin();
        let err = n.on_bytes(&[0x04, 0x00]).unwrap_err();
        assert!(matches!(err, NegotiateError::Protocol(_)));
    }

    #[test]
    fn bad_version_in_connect_reply_fails() {
        let mut n = Socks5::new(v4_target(), None);
        n.begin();
        n.on_bytes(&[0x05, 0x00]).unwrap();
        let err = n.on_bytes(&[0x04, 0x00, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, NegotiateError::Protocol(_)));
    }

    #[test]
    fn reply_codes_are_mapped() {
        let mut n = Socks5::new(v4_target(), None);
        n.begin();
        n.on_bytes(&[0x05, 0x00]).unwrap();
        let err = n.on_bytes(&[0x05, 0x05, 0x00, 0x01]).unwrap_err();
        match err {
            NegotiateError::Rejected { code, reason } => {
                assert_eq!(code, 0x05);
                assert_eq!(reason, "connection refused");
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[test]
    fn domain_target_uses_atyp_3() {
        let mut n = Socks5::new(Target::Domain("example.com".to_string(), 80), None);
        n.begin();
        let Step::Send(req) = n.on_bytes(&[0x05, 0x00]).unwrap() else {
            panic!("expected Send");
        };
        assert_eq!(req[3], 0x03);
        assert_eq!(req[4], 11);
        assert_eq!(&req[5..16], b"example.com");
        assert_eq!(&req[16..], &[0, 80]);
    }

    #[test]
    fn ipv6_target_uses_atyp_4() {
        let mut n = Socks5::new(Target::Addr("[2001:db8::1]:443".parse().unwrap()), None);
        n.begin();
        let Step::Send(req) = n.on_bytes(&[0x05, 0x00]).unwrap() else {
            panic!("expected Send");
        };
        assert_eq!(req[3], 0x04);
        assert_eq!(req.len(), 4 + 16 + 2);
    }

    #[test]
    fn fragmented_replies_are_resumable() {
        let mut n = Socks5::new(v4_target(), None);
        n.begin();

        assert_eq!(n.on_bytes(&[0x05]).unwrap(), Step::Need(1));
        assert!(matches!(n.on_bytes(&[0x00]).unwrap(), Step::Send(_)));

        // Reply arrives one byte at a time.
        let reply = [0x05u8, 0x00, 0x00, 0x01, 1, 2, 3, 4, 0x1f, 0x90];
        for b in &reply[..reply.len() - 1] {
            assert!(matches!(n.on_bytes(&[*b]).unwrap(), Step::Need(_)));
        }
        let step = n.on_bytes(&[reply[reply.len() - 1]]).unwrap();
        assert_eq!(step, Step::Established { leftover: vec![] });
    }

    #[test]
    fn domain_reply_with_leftover() {
        let mut n = Socks5::new(v4_target(), None);
        n.begin();
        n.on_bytes(&[0x05, 0x00]).unwrap();

        let mut reply = vec![0x05, 0x00, 0x00, 0x03, 4];
        reply.extend_from_slice(b"lo.x");
        reply.extend_from_slice(&[0x00, 0x50]);
        reply.extend_from_slice(b"early payload");

        let step = n.on_bytes(&reply).unwrap();
        assert_eq!(
            step,
            Step::Established {
                leftover: b"early payload".to_vec()
            }
        );
    }
}
