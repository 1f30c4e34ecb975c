//! Integration tests for connection teardown.

mod common;

use std::time::Duration;

use common::*;
use reliable_conn::{ConnError, ConnectionState, Flag};

/// The initiator sends FIN; the peer sees `PeerClosed`, closes, and both
/// end up terminated.
#[tokio::test(start_paused = true)]
async fn initiator_and_responder_both_terminate() {
    let bed = Testbed::new();
    let (_listener, mut server, mut client) = bed.establish().await;

    let responder = tokio::spawn(async move {
        let err = server.receive().await.unwrap_err();
        assert!(matches!(err, ConnError::PeerClosed), "got {err:?}");
        assert!(server.peer_closed());
        assert_eq!(server.state(), ConnectionState::CloseWait);
        server.close().await.expect("responder close");
        server.state()
    });

    client.close().await.expect("initiator close");
    assert_eq!(client.state(), ConnectionState::Terminated);
    assert_eq!(responder.await.unwrap(), ConnectionState::Terminated);
}

/// Messages sent before the FIN are still readable after it.
#[tokio::test(start_paused = true)]
async fn data_before_fin_is_delivered() {
    let bed = Testbed::new();
    let (_listener, mut server, mut client) = bed.establish().await;

    let responder = tokio::spawn(async move {
        let mut got = Vec::new();
        loop {
            match server.receive().await {
                Ok(msg) => got.push(msg),
                Err(ConnError::PeerClosed) => break,
                Err(e) => panic!("receive failed: {e}"),
            }
        }
        server.close().await.expect("responder close");
        got
    });

    client.send("one").await.unwrap();
    client.send("two").await.unwrap();
    client.close().await.unwrap();
    assert_eq!(responder.await.unwrap(), vec!["one", "two"]);
}

#[tokio::test(start_paused = true)]
async fn simultaneous_close() {
    let bed = Testbed::new();
    let (_listener, mut server, mut client) = bed.establish().await;

    let (a, b) = tokio::join!(client.close(), server.close());
    a.expect("client close");
    b.expect("server close");
    assert_eq!(client.state(), ConnectionState::Terminated);
    assert_eq!(server.state(), ConnectionState::Terminated);
}

/// The responder acknowledges the FIN but never closes; the initiator gives
/// up waiting and terminates anyway.
#[tokio::test(start_paused = true)]
async fn silent_peer_is_force_closed() {
    let bed = Testbed::new();
    let (_listener, mut server, mut client) = bed.establish().await;

    let responder = tokio::spawn(async move {
        let _ = server.receive().await;
        // Hold the connection open without closing it.
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(server);
    });

    let started = tokio::time::Instant::now();
    client.close().await.expect("force close still succeeds");
    assert_eq!(client.state(), ConnectionState::Terminated);
    assert!(started.elapsed() >= Duration::from_secs(2));
    responder.abort();
}

/// The peer closes while its handshake confirmation is still missing.  The
/// accepted connection comes out of accept() already knowing about the FIN.
#[tokio::test(start_paused = true)]
async fn fin_during_accept_is_reported() {
    let bed = Testbed::new();
    bed.net.drop_next(1, is_client_ack);

    let mut listener = bed.listener(config());
    let server = tokio::spawn(async move {
        let mut conn = listener.accept().await.expect("accept");
        assert_eq!(conn.state(), ConnectionState::CloseWait);
        let err = conn.receive().await.unwrap_err();
        assert!(matches!(err, ConnError::PeerClosed), "got {err:?}");
        conn.close().await.expect("responder close");
        conn.state()
    });

    let mut client = bed.client(CLIENT_PORT, config());
    client.connect(listen_addr()).await.expect("connect");
    client.close().await.expect("initiator close");

    let state = tokio::time::timeout(Duration::from_secs(30), server)
        .await
        .expect("accepted side never saw the close")
        .unwrap();
    assert_eq!(state, ConnectionState::Terminated);
}

/// A peer that vanished never acknowledges the FIN.
#[tokio::test(start_paused = true)]
async fn unacknowledged_fin_breaks_the_link() {
    let bed = Testbed::new();
    let (_listener, _server, mut client) = bed.establish().await;
    bed.net.drop_next(5, |p| p.flag == Flag::Fin);

    let err = client.close().await.unwrap_err();
    assert!(matches!(err, ConnError::LinkBroken(_)), "got {err:?}");
    assert_eq!(client.state(), ConnectionState::Terminated);
}

/// A lost FIN is retransmitted like any other packet.
#[tokio::test(start_paused = true)]
async fn lost_fin_is_retransmitted() {
    let bed = Testbed::new();
    let (_listener, mut server, mut client) = bed.establish().await;
    bed.net.drop_next(2, |p| p.flag == Flag::Fin && *p.src.ip() == CLIENT_IP);

    let responder = tokio::spawn(async move {
        assert!(matches!(server.receive().await, Err(ConnError::PeerClosed)));
        server.close().await.expect("responder close");
    });
    client.close().await.expect("initiator close");
    responder.await.unwrap();
}

/// Sending data to a peer that has started closing reports the close.
#[tokio::test(start_paused = true)]
async fn send_after_peer_fin_reports_peer_closed() {
    let bed = Testbed::new();
    let (_listener, mut server, mut client) = bed.establish().await;

    let responder = tokio::spawn(async move {
        let _ = server.receive().await;
        let err = server.send("too late").await.unwrap_err();
        assert!(matches!(err, ConnError::PeerClosed), "got {err:?}");
        server.close().await.expect("responder close");
    });
    client.close().await.expect("initiator close");
    responder.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn operations_after_close_fail() {
    let bed = Testbed::new();
    let (_listener, mut server, mut client) = bed.establish().await;
    let (a, b) = tokio::join!(client.close(), server.close());
    a.unwrap();
    b.unwrap();

    assert!(matches!(
        client.send("x").await,
        Err(ConnError::NotConnected(ConnectionState::Terminated))
    ));
    assert!(matches!(
        client.receive().await,
        Err(ConnError::NotConnected(ConnectionState::Terminated))
    ));
    // Closing again is a no-op.
    client.close().await.unwrap();
}
