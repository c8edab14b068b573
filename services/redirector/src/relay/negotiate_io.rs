//! Drives a sans-I/O negotiator over a live stream.
//!
//! Generic over the stream so the same driver covers plain TCP proxies
//! and TLS-wrapped HTTPS-CONNECT proxies.

use shunt_negotiate::{Negotiator, Step};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NegotiateFailure;

const READ_CHUNK: usize = 2048;

/// Run the handshake to completion. Returns the leftover bytes the proxy
/// sent past the end of its reply; they belong to the tunnel and must be
/// forwarded to the client before relaying starts.
pub async fn drive<S, N>(stream: &mut S, negotiator: &mut N) -> Result<Vec<u8>, NegotiateFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
    N: Negotiator + ?Sized,
{
    let opening = negotiator.begin();
    stream.write_all(&opening).await.map_err(NegotiateFailure::Io)?;

    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut buf).await.map_err(NegotiateFailure::Io)?;
        if n == 0 {
            return Err(NegotiateFailure::Incomplete);
        }

        let mut step = negotiator.on_bytes(&buf[..n])?;
        loop {
            match step {
                Step::Need(_) => break,
                Step::Send(bytes) => {
                    stream.write_all(&bytes).await.map_err(NegotiateFailure::Io)?;
                    // The reply to what we just sent may already be
                    // buffered; re-attempt progress before reading.
                    step = negotiator.on_bytes(&[])?;
                }
                Step::Established { leftover } => return Ok(leftover),
            }
        }
    }
}
