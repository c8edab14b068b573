
use harness::{EchoBackend, FakeProxy, ProxyBehavior, RedirectorOpts};
use shunt_redirector::{ProxyKind, RelayEngine, Subsystem};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn engine_configure_start_dump_stop() {
    let backend = EchoBackend::spawn().await.unwrap();
    let proxy = FakeProxy::socks5(ProxyBehavior::Tunnel).await.unwrap();
    let config = RedirectorOpts::new(ProxyKind::Socks5, proxy.addr, backend.addr).into_config();

    let mut engine = RelayEngine::new();
    assert_eq!(engine.dump_state().await["configured"], false);

    engine.configure(&config).unwrap();
    engine.start().await.unwrap();
    let addr = engine.local_addr().expect("listener bound");

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"lifecycle").await.unwrap();
    let mut got = [0u8; 9];
    stream.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"lifecycle");
    drop(stream);

    let state = engine.dump_state().await;
    assert_eq!(state["configured"], true);
    assert!(state["stats"]["connections_accepted"].as_u64().unwrap() >= 1);
    assert!(state["session_states"].is_object());
    assert!(state["decision_cache"].is_array());

    engine.stop().await;
    // The listener socket is gone after stop.
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn engine_start_fails_on_unbindable_address() {
    let backend = EchoBackend::spawn().await.unwrap();
    let proxy = FakeProxy::socks5(ProxyBehavior::Tunnel).await.unwrap();
    let mut config =
        RedirectorOpts::new(ProxyKind::Socks5, proxy.addr, backend.addr).into_config();
    // A specific port someone else holds.
    let holder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    config.listen_addr = holder.local_addr().unwrap();

    let mut engine = RelayEngine::new();
    engine.configure(&config).unwrap();
    assert!(engine.start().await.is_err());
    engine.stop().await;
}
