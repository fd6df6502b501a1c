#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use heart::protocol::{Command, Message, Package, StreamReassembler};
use heart::{AppError, AppResult, NodeConfig, NodeEngine, NodeEvent};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn config(name: &str) -> NodeConfig {
    NodeConfig {
        node_name: name.to_string(),
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        worker_pool_size: 2,
        worker_monitor_interval_ms: 100,
        confirmation_timeout_ms: 5_000,
        send_wait_timeout_ms: 2_000,
        stop_grace_ms: 1_000,
        ..NodeConfig::default()
    }
}

pub async fn start(config: NodeConfig) -> (Arc<NodeEngine>, SocketAddr) {
    let node = NodeEngine::new(config).unwrap();
    let address = node.run("127.0.0.1", 0).await.unwrap();
    (node, address)
}

pub async fn wait_event(
    events: &mut broadcast::Receiver<NodeEvent>,
    mut matches: impl FnMut(&NodeEvent) -> bool,
) -> NodeEvent {
    time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event not received in time")
}

pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

/// Connects two running nodes and waits until both sides are confirmed.
pub async fn link(
    from: &Arc<NodeEngine>,
    to: &Arc<NodeEngine>,
    to_address: SocketAddr,
) -> SocketAddr {
    let mut from_events = from.subscribe();
    let mut to_events = to.subscribe();
    from.connect_to(to_address, from.config().tls_mode)
        .await
        .unwrap();
    wait_event(&mut from_events, |event| {
        matches!(event, NodeEvent::Confirmed(info) if info.address == to_address)
    })
    .await;
    match wait_event(&mut to_events, |event| matches!(event, NodeEvent::Confirmed(_))).await {
        NodeEvent::Confirmed(info) => info.address,
        _ => unreachable!(),
    }
}

/// A hand-driven peer speaking the wire format directly.
pub struct RawPeer {
    stream: TcpStream,
    reassembler: StreamReassembler,
    ready: VecDeque<Package>,
}

impl RawPeer {
    pub async fn connect(address: SocketAddr) -> RawPeer {
        RawPeer {
            stream: TcpStream::connect(address).await.unwrap(),
            reassembler: StreamReassembler::default(),
            ready: VecDeque::new(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.stream.local_addr().unwrap()
    }

    pub async fn send(&mut self, package: &Package) {
        self.send_raw(&package.serialize()).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// `None` once the node closed the socket.
    pub async fn next_package(&mut self) -> Option<Package> {
        let mut buffer = BytesMut::with_capacity(4096);
        loop {
            if let Some(package) = self.ready.pop_front() {
                return Some(package);
            }
            buffer.clear();
            let read = time::timeout(WAIT, self.stream.read_buf(&mut buffer))
                .await
                .expect("no data from node in time");
            match read {
                Ok(0) | Err(_) => return None,
                Ok(_) => {
                    let completed = self.reassembler.feed(&buffer);
                    self.ready.extend(completed.into_iter().filter_map(Result::ok));
                }
            }
        }
    }

    pub async fn expect(&mut self, command: Command) -> Package {
        loop {
            let package = self
                .next_package()
                .await
                .unwrap_or_else(|| panic!("closed while waiting for {}", command));
            if package.command() == command {
                return package;
            }
        }
    }

    pub async fn expect_closed(&mut self) {
        while self.next_package().await.is_some() {}
    }
}

/// Application message used by the tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Note(pub u32);

impl Note {
    pub const COMMAND: Command = Command::new(300);
}

impl Message for Note {
    fn command(&self) -> Command {
        Note::COMMAND
    }

    fn encode(&self, buffer: &mut BytesMut) -> AppResult<()> {
        buffer.put_u32_le(self.0);
        Ok(())
    }

    fn decode(payload: &[u8]) -> AppResult<Self> {
        let bytes: [u8; 4] = payload
            .try_into()
            .map_err(|_| AppError::MalformedProtocol("note needs 4 bytes".into()))?;
        Ok(Note(u32::from_le_bytes(bytes)))
    }
}

/// Records every note it receives, in handling order.
#[derive(Default)]
pub struct NoteParser {
    pub seen: Arc<Mutex<Vec<(SocketAddr, u32)>>>,
}

impl heart::PackageParser for NoteParser {
    fn commands(&self) -> Vec<Command> {
        vec![Note::COMMAND]
    }

    fn parse_package(
        &self,
        package: &Package,
        sender: &heart::node::ConnectionState,
        _node: &NodeEngine,
    ) -> heart::ParserResult {
        match Note::decode(&package.payload) {
            Ok(note) => {
                self.seen.lock().push((sender.address(), note.0));
                heart::ParserResult::Processed
            }
            Err(_) => heart::ParserResult::Error,
        }
    }
}
