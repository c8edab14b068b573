
use std::time::Duration;

use harness::{dead_addr, FakeProxy, ProxyBehavior, RedirectorHandle, RedirectorOpts, SilentBackend};
use shunt_redirector::ProxyKind;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

#[tokio::test]
async fn silent_session_is_torn_down_at_the_idle_deadline() {
    let backend = SilentBackend::spawn().await.unwrap();
    let proxy = FakeProxy::socks5(ProxyBehavior::Tunnel).await.unwrap();

    let mut opts = RedirectorOpts::new(ProxyKind::Socks5, proxy.addr, backend.addr);
    opts.idle_timeout = Duration::from_millis(100);
    let redirector = RedirectorHandle::spawn(opts).await.unwrap();

    let mut stream = TcpStream::connect(redirector.addr).await.unwrap();
    let mut buf = [0u8; 8];
    let read = timeout(Duration::from_secs(3), stream.read(&mut buf))
        .await
        .expect("idle session should be closed well before this");
    assert!(matches!(read, Ok(0) | Err(_)));

    assert!(
        redirector
            .wait_for_counter(&redirector.ctx.stats.sessions_timed_out, 1)
            .await
    );
}

#[tokio::test]
async fn stalled_handshake_is_torn_down_at_the_deadline() {
    // Accepts the proxy connection and never answers the greeting.
    let stalled_proxy = SilentBackend::spawn().await.unwrap();

    let mut opts = RedirectorOpts::new(ProxyKind::Socks5, stalled_proxy.addr, dead_addr().await);
    opts.handshake_timeout = Duration::from_millis(100);
    let redirector = RedirectorHandle::spawn(opts).await.unwrap();

    let mut stream = TcpStream::connect(redirector.addr).await.unwrap();
    let mut buf = [0u8; 8];
    let read = timeout(Duration::from_secs(3), stream.read(&mut buf))
        .await
        .expect("stalled handshake should be cut off well before this");
    assert!(matches!(read, Ok(0) | Err(_)));

    assert!(
        redirector
            .wait_for_counter(&redirector.ctx.stats.sessions_timed_out, 1)
            .await
    );
    assert_eq!(
        redirector
            .ctx
            .stats
            .sessions_relayed
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );
}
