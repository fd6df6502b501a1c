mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config, eventually, link, start, wait_event, Note, NoteParser, RawPeer};
use heart::protocol::{Command, ErrorCode, Package, Ping, MAXIMUM_PACKAGE_SIZE};
use heart::{
    AddNodeError, AppError, ConnectionStatus, DispatchOrder, NodeEvent, NodeState, TlsMode,
};
use tokio::time;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ping_is_answered_with_matching_pong() {
    let (node, address) = start(config("ping-server")).await;
    let mut peer = RawPeer::connect(address).await;

    // the node introduces itself first
    peer.expect(Command::VERSION).await;

    let ping = Package::new(Command::PING, Vec::new());
    peer.send(&ping).await;
    let pong = peer.expect(Command::PONG).await;

    assert_eq!(pong.header.trigger_hash, ping.hash());
    assert!(pong.is_valid());
    assert_eq!(node.state(), NodeState::Listening);
    assert_eq!(node.local_address(), Some(address));
    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_nodes_confirm_each_other() {
    let (alpha, _) = start(config("alpha")).await;
    let (beta, beta_address) = start(config("beta")).await;

    let alpha_seen_by_beta = link(&alpha, &beta, beta_address).await;

    let outbound = alpha.get_info(&beta_address).unwrap();
    assert_eq!(outbound.status, ConnectionStatus::Confirmed);
    assert!(outbound.is_local);
    assert_eq!(outbound.peer_name.as_deref(), Some("beta"));

    let inbound = beta.get_info(&alpha_seen_by_beta).unwrap();
    assert_eq!(inbound.status, ConnectionStatus::Confirmed);
    assert!(!inbound.is_local);
    assert_eq!(inbound.peer_name.as_deref(), Some("alpha"));

    assert_eq!(alpha.connections_count(), 1);
    assert_eq!(beta.connections().len(), 1);

    alpha.stop().await;
    beta.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn self_signed_tls_link() {
    let mut tls_config = config("tls-alpha");
    tls_config.tls_mode = TlsMode::SelfSigned;
    let (alpha, _) = start(tls_config).await;
    let mut tls_config = config("tls-beta");
    tls_config.tls_mode = TlsMode::SelfSigned;
    let (beta, beta_address) = start(tls_config).await;

    let alpha_seen_by_beta = link(&alpha, &beta, beta_address).await;

    assert!(alpha.get_info(&beta_address).unwrap().tls);
    assert!(beta.get_info(&alpha_seen_by_beta).unwrap().tls);
    assert_ne!(alpha.send_data(&Ping, beta_address, None), 0);

    alpha.stop().await;
    beta.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn application_parser_receives_notes() {
    let (alpha, _) = start(config("sender")).await;
    let (beta, beta_address) = start(config("receiver")).await;
    let parser = NoteParser::default();
    let seen = parser.seen.clone();
    beta.register_parser(Arc::new(parser));

    let alpha_seen_by_beta = link(&alpha, &beta, beta_address).await;

    let hash = alpha.send_data(&Note(7), beta_address, None);
    assert_ne!(hash, 0);
    eventually(|| seen.lock().len() == 1).await;
    assert_eq!(seen.lock()[0], (alpha_seen_by_beta, 7));

    alpha.stop().await;
    beta.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_connection_dispatch_keeps_order() {
    let (alpha, _) = start(config("ordered-sender")).await;
    let mut ordered = config("ordered-receiver");
    ordered.dispatch_order = DispatchOrder::PerConnection;
    ordered.worker_pool_size = 4;
    let (beta, beta_address) = start(ordered).await;
    let parser = NoteParser::default();
    let seen = parser.seen.clone();
    beta.register_parser(Arc::new(parser));

    link(&alpha, &beta, beta_address).await;

    for sequence in 0..200 {
        assert_ne!(alpha.send_data(&Note(sequence), beta_address, None), 0);
    }
    eventually(|| seen.lock().len() == 200).await;
    let sequences: Vec<u32> = seen.lock().iter().map(|(_, sequence)| *sequence).collect();
    assert_eq!(sequences, (0..200).collect::<Vec<_>>());

    alpha.stop().await;
    beta.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unconfirmed_peer_cannot_use_application_commands() {
    let (node, address) = start(config("strict")).await;
    let parser = NoteParser::default();
    let seen = parser.seen.clone();
    node.register_parser(Arc::new(parser));

    let mut peer = RawPeer::connect(address).await;
    let note = Package::from_message(&Note(1), None).unwrap();
    peer.send(&note).await;

    let answer = peer.expect(Command::BAD_REQUEST).await;
    assert_eq!(answer.header.trigger_hash, note.hash());
    let error = <heart::protocol::BadRequest as heart::Message>::decode(&answer.payload).unwrap();
    assert_eq!(error.code, heart::protocol::ErrorCode::NOT_CONFIRMED);
    assert!(seen.lock().is_empty());

    let info = node.get_info(&peer.local_addr()).unwrap();
    assert_eq!(info.trust, heart::TrustLevel::DEFAULT + heart::TrustPenalty::PROTOCOL_ERROR);
    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn send_and_wait_reports_write_outcome() {
    let (alpha, _) = start(config("waiter")).await;
    let (beta, beta_address) = start(config("waited")).await;
    link(&alpha, &beta, beta_address).await;

    let ping = Package::new(Command::PING, Vec::new());
    assert!(alpha.send_package_and_wait_async(ping.clone(), beta_address).await);

    let unknown = "127.0.0.1:1".parse().unwrap();
    assert!(!alpha.send_package_and_wait_async(ping.clone(), unknown).await);
    assert!(!alpha.send_package(ping.clone(), unknown));

    let blocking = alpha.clone();
    let written = tokio::task::spawn_blocking(move || {
        blocking.send_package_and_wait(ping, beta_address)
    })
    .await
    .unwrap();
    assert!(written);

    alpha.stop().await;
    beta.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_closes_every_connection() {
    let (alpha, _) = start(config("stopping")).await;
    let (beta, beta_address) = start(config("staying")).await;
    let alpha_seen_by_beta = link(&alpha, &beta, beta_address).await;
    let mut beta_events = beta.subscribe();

    alpha.stop().await;

    assert_eq!(alpha.state(), NodeState::Idle);
    assert_eq!(alpha.connections_count(), 0);
    assert_eq!(alpha.send_data(&Ping, beta_address, None), 0);
    wait_event(&mut beta_events, |event| {
        matches!(event, NodeEvent::Disconnected(info) if info.address == alpha_seen_by_beta)
    })
    .await;
    eventually(|| beta.connections_count() == 0).await;
    // cleanly closed entries are reaped
    assert!(beta.get_info(&alpha_seen_by_beta).is_none());

    // a stopped node can listen again
    let address = alpha.run("127.0.0.1", 0).await.unwrap();
    assert_eq!(alpha.local_address(), Some(address));
    alpha.stop().await;
    beta.stop().await;
}

/// Connects a peer that never reads and queues more data for it than the
/// socket buffers hold, so the send thread ends up blocked on it.
async fn stall_send_thread(node: &heart::NodeEngine, address: std::net::SocketAddr) -> RawPeer {
    let stalled = RawPeer::connect(address).await;
    let stalled_address = stalled.local_addr();
    eventually(|| node.get_info(&stalled_address).is_some()).await;

    let bulk = Package::new(Command::new(300), vec![0x42; MAXIMUM_PACKAGE_SIZE as usize]);
    for _ in 0..32 {
        assert!(node.send_package(bulk.clone(), stalled_address));
    }
    time::sleep(Duration::from_millis(200)).await;
    stalled
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnecting_a_stalled_peer_frees_the_send_thread() {
    let mut slow_writes = config("stalled-sender");
    slow_writes.send_wait_timeout_ms = 30_000;
    let (node, address) = start(slow_writes).await;
    let stalled = stall_send_thread(&node, address).await;

    assert!(node.disconnect(stalled.local_addr()));

    let mut healthy = RawPeer::connect(address).await;
    let ping = Package::new(Command::PING, Vec::new());
    healthy.send(&ping).await;
    let pong = healthy.expect(Command::PONG).await;
    assert_eq!(pong.header.trigger_hash, ping.hash());
    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_write_times_out_and_drops_the_peer() {
    let (node, address) = start(config("deadline")).await;
    let mut events = node.subscribe();
    let stalled = stall_send_thread(&node, address).await;
    let stalled_address = stalled.local_addr();

    wait_event(&mut events, |event| {
        matches!(
            event,
            NodeEvent::RequestError { address, code, .. }
                if *address == stalled_address && *code == ErrorCode::WRITE_FAILED
        )
    })
    .await;
    wait_event(&mut events, |event| {
        matches!(event, NodeEvent::Disconnected(info) if info.address == stalled_address)
    })
    .await;

    // writes to everyone else flow again
    let mut healthy = RawPeer::connect(address).await;
    healthy.send(&Package::new(Command::PING, Vec::new())).await;
    healthy.expect(Command::PONG).await;
    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_finishes_with_an_unresponsive_peer() {
    let (node, address) = start(config("unblocked-stop")).await;
    let _stalled = stall_send_thread(&node, address).await;

    time::timeout(Duration::from_secs(5), node.stop())
        .await
        .expect("stop hung on a peer that does not read");
    assert_eq!(node.state(), NodeState::Idle);
    assert_eq!(node.connections_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_tls_handshake_is_reported() {
    let mut tls_config = config("tls-guard");
    tls_config.tls_mode = TlsMode::SelfSigned;
    let (node, address) = start(tls_config).await;
    let mut events = node.subscribe();

    let mut plain = RawPeer::connect(address).await;
    let plain_address = plain.local_addr();
    plain.send(&Package::new(Command::PING, Vec::new())).await;

    wait_event(&mut events, |event| {
        matches!(
            event,
            NodeEvent::RequestError { address, code, .. }
                if *address == plain_address && *code == ErrorCode::TLS_HANDSHAKE
        )
    })
    .await;
    assert_eq!(node.connections_count(), 0);
    assert!(node.get_info(&plain_address).is_none());
    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_run_is_refused() {
    let (node, _) = start(config("twice")).await;
    assert!(matches!(
        node.run("127.0.0.1", 0).await,
        Err(AppError::IllegalStateError(_))
    ));
    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_host_fires_add_node_failed() {
    let (node, _) = start(config("resolver")).await;
    let mut events = node.subscribe();

    let attempt = node.connect_to_host("no-such-host.invalid", 7777, TlsMode::NoSsl);
    assert!(matches!(
        attempt.await.unwrap(),
        Err(AppError::HostNotFound(_))
    ));
    wait_event(&mut events, |event| {
        matches!(
            event,
            NodeEvent::AddNodeFailed {
                error: AddNodeError::HostNotFound,
                ..
            }
        )
    })
    .await;
    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn refused_connection_fires_add_node_failed() {
    let (node, _) = start(config("dialer")).await;
    let mut events = node.subscribe();

    // bind and drop to find a port nobody listens on
    let closed_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    assert!(node.connect_to(closed_port, TlsMode::NoSsl).await.is_err());
    wait_event(&mut events, |event| {
        matches!(
            event,
            NodeEvent::AddNodeFailed {
                error: AddNodeError::ConnectionRefused,
                ..
            }
        )
    })
    .await;
    time::sleep(Duration::from_millis(10)).await;
    assert_eq!(node.connections_count(), 0);
    node.stop().await;
}
