// ABOUTME: Integration-style tests for the end-to-end scenarios: direct/indirect connection
// ABOUTME: racing, supersession, and inbound transfer rendezvous, all over real loopback sockets

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::cancel::CancelToken;
use crate::codec::{Reader, ServerCode};
use crate::connection::{Connection, ConnectionOptions, ConnectionPath, Direction};
use crate::frame::HandshakeFrame;
use crate::message_connection::MessageConnection;
use crate::pcm::PeerConnectionManager;
use crate::server_connection::ServerConnection;

async fn tcp_pair() -> (TcpStream, TcpStream, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (accept_res, connect_res) = tokio::join!(listener.accept(), TcpStream::connect(addr));
    let (accepted, remote) = accept_res.unwrap();
    let connected = connect_res.unwrap();
    (accepted, connected, remote)
}

/// Builds a `ServerConnection` backed by a real loopback pair. Returns the
/// client-facing handle (what `PeerConnectionManager` writes
/// `ConnectToPeerRequest`s into) plus the raw "server-side" connection a
/// test can read those requests back off of.
async fn fake_server_pair() -> (ServerConnection, Connection) {
    let (accepted, connected, remote) = tcp_pair().await;
    let client_conn = Connection::from_socket(
        connected,
        remote,
        ConnectionOptions::default(),
        Direction::Outbound,
        ConnectionPath::Direct,
    );
    let client_mc = MessageConnection::new(client_conn, "server".to_string());
    client_mc.start_continuous_read();

    let server_side = Connection::from_socket(
        accepted,
        remote,
        ConnectionOptions::default(),
        Direction::Inbound,
        ConnectionPath::Direct,
    );
    (ServerConnection::new(client_mc), server_side)
}

#[tokio::test]
async fn direct_connection_wins_when_peer_is_reachable() {
    let (server_connection, _server_side) = fake_server_pair().await;
    let pcm = PeerConnectionManager::new("local_user", server_connection);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = HandshakeFrame::read_from(&mut stream).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let cancel = CancelToken::new();
    let mc = pcm.get_or_add("peer_direct", addr, &cancel).await.unwrap();
    assert_eq!(mc.connection().path(), ConnectionPath::Direct);
    assert_eq!(mc.username(), "peer_direct");
}

#[tokio::test]
async fn indirect_connection_wins_when_direct_dial_fails() {
    let (server_connection, server_side) = fake_server_pair().await;
    let pcm = PeerConnectionManager::new("local_user", server_connection);

    // Reserve and release a port so the direct dial is refused quickly.
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = reserved.local_addr().unwrap();
    drop(reserved);

    let pcm_clone = pcm.clone();
    let cancel = CancelToken::new();
    let get_task = tokio::spawn(async move {
        pcm_clone.get_or_add("peer_indirect", dead_addr, &cancel).await
    });

    // Read the ConnectToPeerRequest the manager sent to the fake server.
    let len_bytes = server_side.read(4, &CancelToken::none()).await.unwrap();
    let len = u32::from_le_bytes(len_bytes[0..4].try_into().unwrap()) as usize;
    let body = server_side.read(len, &CancelToken::none()).await.unwrap();
    let mut reader = Reader::<ServerCode>::new(body);
    reader.expect_code(ServerCode::ConnectToPeer).unwrap();
    let username = reader.read_string().unwrap();
    let _conn_type = reader.read_string().unwrap();
    let token = reader.read_u32().unwrap();
    assert_eq!(username, "peer_indirect");

    // Simulate the peer piercing the firewall back to us.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listen_addr = listener.local_addr().unwrap();
    let mut outbound = TcpStream::connect(listen_addr).await.unwrap();
    let (mut inbound, remote) = listener.accept().await.unwrap();
    HandshakeFrame::PierceFirewall { token }
        .write_to(&mut outbound)
        .await
        .unwrap();
    HandshakeFrame::read_from(&mut inbound).await.unwrap();

    pcm.complete_solicitation(token, inbound, remote)
        .await
        .unwrap();

    let mc = get_task.await.unwrap().unwrap();
    assert_eq!(mc.connection().path(), ConnectionPath::Indirect);
}

#[tokio::test]
async fn inbound_connection_supersedes_the_cached_one() {
    let (server_connection, _server_side) = fake_server_pair().await;
    let pcm = PeerConnectionManager::new("local_user", server_connection);

    let (first_inbound, mut first_peer_side, remote1) = tcp_pair().await;
    pcm.add_message_connection("peer_three".to_string(), first_inbound, remote1)
        .await
        .unwrap();

    let (second_inbound, _second_peer_side, remote2) = tcp_pair().await;
    pcm.add_message_connection("peer_three".to_string(), second_inbound, remote2)
        .await
        .unwrap();

    let mut probe = [0u8; 1];
    let result = tokio::time::timeout(Duration::from_millis(500), first_peer_side.read(&mut probe))
        .await
        .expect("superseded connection should close promptly");
    assert_eq!(result.unwrap(), 0, "superseded connection's socket should be closed");
}

#[tokio::test]
async fn inbound_transfer_connection_completes_matching_wait() {
    let (server_connection, _server_side) = fake_server_pair().await;
    let pcm = PeerConnectionManager::new("local_user", server_connection);

    let pcm_wait = pcm.clone();
    let wait_task = tokio::spawn(async move {
        pcm_wait
            .get_inbound_transfer("uploader", 55, &CancelToken::new())
            .await
    });
    tokio::task::yield_now().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut peer_stream = TcpStream::connect(addr).await.unwrap();
    let (accepted, remote) = listener.accept().await.unwrap();
    peer_stream.write_all(&55u32.to_le_bytes()).await.unwrap();

    pcm.add_transfer_connection("uploader".to_string(), 0, accepted, remote)
        .await
        .unwrap();

    let conn = wait_task.await.unwrap().unwrap();
    assert_eq!(conn.direction(), Direction::Inbound);
}

#[tokio::test]
async fn outbound_transfer_direct_writes_matching_token() {
    let (server_connection, _server_side) = fake_server_pair().await;
    let pcm = PeerConnectionManager::new("local_user", server_connection);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_task = tokio::spawn(async move { listener.accept().await.unwrap() });

    let cancel = CancelToken::new();
    let conn = pcm.get_transfer("carol", addr, 42, &cancel).await.unwrap();
    assert_eq!(conn.path(), ConnectionPath::Direct);

    let (mut accepted, _remote) = accept_task.await.unwrap();
    let handshake = HandshakeFrame::read_from(&mut accepted).await.unwrap();
    assert_eq!(
        handshake,
        HandshakeFrame::PeerInit {
            username: "local_user".to_string(),
            conn_type: "F".to_string(),
            token: 42,
        }
    );
    let mut token_bytes = [0u8; 4];
    accepted.read_exact(&mut token_bytes).await.unwrap();
    assert_eq!(token_bytes, [0x2a, 0x00, 0x00, 0x00]);
}

#[tokio::test]
async fn disposing_the_manager_fails_pending_solicitations() {
    let (server_connection, _server_side) = fake_server_pair().await;
    let pcm = PeerConnectionManager::new("local_user", server_connection);

    let pcm_wait = pcm.clone();
    let wait_task = tokio::spawn(async move {
        pcm_wait
            .get_inbound_transfer("ghost", 1, &CancelToken::new())
            .await
    });
    tokio::task::yield_now().await;

    pcm.dispose().await;

    let err = wait_task.await.unwrap().unwrap_err();
    assert!(matches!(err, crate::error::PeerError::Cancelled));
}
