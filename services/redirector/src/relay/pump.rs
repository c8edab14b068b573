//! Bidirectional byte pump.
//!
//! Two independent unidirectional copy loops over the split halves of the
//! client and upstream streams. Each loop reads into a fixed buffer and
//! writes it out in full before reading again, which suspends the source
//! whenever the sink cannot keep up. Memory stays bounded, nothing is
//! dropped, and ordering within each direction is preserved.
//!
//! EOF on one side flushes and half-closes that direction (shutdown on
//! the destination's write half) while the reverse flow keeps running.
//! An I/O error on either socket tears down both flows at once. A shared
//! idle clock, reset by any byte in either direction, bounds how long a
//! silent session may hold its sockets.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Relay buffer size per direction.
const RELAY_BUF: usize = 8192;

/// Bytes moved by a completed relay.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayTotals {
    pub to_upstream: u64,
    pub from_upstream: u64,
}

#[derive(Debug, Error)]
pub enum PumpError {
    /// No byte moved in either direction for the idle deadline.
    #[error("relay idle deadline exceeded")]
    IdleTimeout,

    #[error("relay i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Relay bytes both ways until both directions reach EOF, either socket
/// errors, or the idle deadline passes. `idle_timeout` of zero disables
/// the deadline.
pub async fn pump<C, U>(
    client: &mut C,
    upstream: &mut U,
    idle_timeout: Duration,
) -> Result<RelayTotals, PumpError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

    let start = Instant::now();
    // Millis since `start` of the last byte moved, either direction.
    let last_activity = AtomicU64::new(0);

    let to_upstream = copy_half(&mut client_rd, &mut upstream_wr, start, &last_activity);
    let from_upstream = copy_half(&mut upstream_rd, &mut client_wr, start, &last_activity);
    let both = async { tokio::try_join!(to_upstream, from_upstream) };

    let watchdog = idle_watchdog(idle_timeout, start, &last_activity);

    tokio::select! {
        result = both => {
            let (to_upstream, from_upstream) = result?;
            Ok(RelayTotals { to_upstream, from_upstream })
        }
        _ = watchdog => Err(PumpError::IdleTimeout),
    }
}

/// One direction: read from `src`, write everything read to `dst`,
/// half-close `dst` on EOF. Returns bytes moved.
async fn copy_half<R, W>(
    src: &mut R,
    dst: &mut W,
    start: Instant,
    last_activity: &AtomicU64,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF];
    let mut total = 0u64;
    loop {
        match src.read(&mut buf).await? {
            0 => break,
            n => {
                dst.write_all(&buf[..n]).await?;
                total += n as u64;
                last_activity.store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
            }
        }
    }
    dst.shutdown().await?;
    Ok(total)
}

/// Completes once no byte has moved for `idle_timeout`. Never completes
/// when the deadline is disabled.
async fn idle_watchdog(idle_timeout: Duration, start: Instant, last_activity: &AtomicU64) {
    if idle_timeout.is_zero() {
        std::future::pending::<()>().await;
    }
    let check_interval = (idle_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
    loop {
        tokio::time::sleep(check_interval).await;
        let idle_for = start
            .elapsed()
            .saturating_sub(Duration::from_millis(last_activity.load(Ordering::Relaxed)));
        if idle_for >= idle_timeout {
            return;
        }
    }
}
