// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The node: listener, connection registry, dispatch and send path.
//!
//! Every connection gets one reader task that feeds a `StreamReassembler`
//! and submits each completed package to the worker pool. Socket writes are
//! queued on a dedicated send thread (`AsyncExecutor`), so a caller of
//! `send_data` never waits for the network.
//!
//! # Ordering
//!
//! Packages of one connection are reassembled and submitted in the order
//! their bytes arrived. With `DispatchOrder::Shared` (the default) any
//! worker may pick up any package, so two packages from the same peer can be
//! *handled* out of order. `DispatchOrder::PerConnection` pins each peer to
//! one worker lane and keeps its packages in arrival order. Writes to a peer
//! leave in the order they were queued.
//!
//! # Ownership
//!
//! The registry holds the only long-lived reference to a `ConnectionState`.
//! Queued work items and write jobs carry the peer address and connection id
//! and look the connection up again when they run; a connection replaced or
//! reaped in between is skipped.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, trace, warn};

use super::parser::CoreParser;
use super::tls::{self, TlsMode, TlsProvider};
use super::{
    AddNodeError, ConnectionInfo, ConnectionRegistry, ConnectionState, NodeEvent,
    PackageParser, ParserRegistry, ParserResult, TrustChange, TrustPenalty,
};
use crate::protocol::{
    BadRequest, CloseConnection, Command, ErrorCode, FrameError, Header, Message, Package,
    StreamReassembler, VersionInfo, PROTOCOL_VERSION,
};
use crate::utils::{AsyncExecutor, PoolHandler, WorkerPool};
use crate::{AppError, AppResult, NodeConfig, Shutdown};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    Listening,
}

#[derive(Debug)]
struct WorkItem {
    connection_id: u64,
    address: SocketAddr,
    package: Package,
}

#[derive(Clone)]
struct DispatchHandler {
    engine: Weak<NodeEngine>,
}

impl PoolHandler<WorkItem> for DispatchHandler {
    fn handle(&self, item: WorkItem) -> impl Future<Output = ()> + Send {
        let engine = self.engine.clone();
        async move {
            if let Some(engine) = engine.upgrade() {
                engine.handle_work(item);
            }
        }
    }
}

struct RunningNode {
    local_address: SocketAddr,
    notify_shutdown: broadcast::Sender<()>,
    pool: Arc<WorkerPool<WorkItem>>,
    listener_task: JoinHandle<()>,
}

pub struct NodeEngine {
    me: Weak<NodeEngine>,
    config: NodeConfig,
    registry: ConnectionRegistry,
    parsers: ParserRegistry,
    events: broadcast::Sender<NodeEvent>,
    send_executor: AsyncExecutor,
    runtime: Handle,
    running: Mutex<Option<RunningNode>>,
    tls_providers: Mutex<HashMap<TlsMode, Arc<dyn TlsProvider>>>,
}

fn lane_key(address: &SocketAddr) -> u64 {
    let mut hasher = DefaultHasher::new();
    address.hash(&mut hasher);
    hasher.finish()
}

impl NodeEngine {
    /// Must be called inside a tokio runtime; the node spawns its tasks there.
    pub fn new(config: NodeConfig) -> AppResult<Arc<NodeEngine>> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| {
            AppError::IllegalStateError(format!("node needs a tokio runtime: {}", e))
        })?;
        let send_executor = AsyncExecutor::new(&format!("{}-send", config.node_name))?;
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));

        let engine = Arc::new_cyclic(|me| NodeEngine {
            me: me.clone(),
            registry: ConnectionRegistry::new(config.max_connections),
            parsers: ParserRegistry::default(),
            events,
            send_executor,
            runtime,
            running: Mutex::new(None),
            tls_providers: Mutex::new(HashMap::new()),
            config,
        });
        engine.parsers.register(Arc::new(CoreParser));
        Ok(engine)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        if self.running.lock().is_some() {
            NodeState::Listening
        } else {
            NodeState::Idle
        }
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|running| running.local_address)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn register_parser(&self, parser: Arc<dyn PackageParser>) {
        self.parsers.register(parser);
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.snapshot()
    }

    /// Live connections; closed and banned entries are not counted.
    pub fn connections_count(&self) -> usize {
        self.registry.active_count()
    }

    pub fn get_info(&self, address: &SocketAddr) -> Option<ConnectionInfo> {
        self.registry.info(address)
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.registry.is_banned(ip)
    }

    /// Starts listening and returns the bound address (useful with port 0).
    ///
    /// Fails if the node already listens, the address cannot be bound or the
    /// configured TLS mode has no usable certificate.
    pub async fn run(self: &Arc<Self>, bind_address: &str, port: u16) -> AppResult<SocketAddr> {
        if self.running.lock().is_some() {
            return Err(AppError::IllegalStateError("node is already listening".into()));
        }
        let acceptor = match self.tls_provider(self.config.tls_mode)? {
            Some(provider) => Some(TlsAcceptor::from(provider.server_config()?)),
            None => None,
        };
        let listener = TcpListener::bind((bind_address, port)).await.map_err(|e| {
            AppError::DetailedIoError(format!("bind {}:{}: {}", bind_address, port, e))
        })?;
        let local_address = listener.local_addr()?;

        let (notify_shutdown, _) = broadcast::channel(1);
        let pool = Arc::new(WorkerPool::new(
            notify_shutdown.clone(),
            DispatchHandler {
                engine: Arc::downgrade(self),
            },
            self.config.worker_pool_config(),
        ));
        let shutdown = Shutdown::subscribe(&notify_shutdown);

        let mut running = self.running.lock();
        if running.is_some() {
            let _ = notify_shutdown.send(());
            return Err(AppError::IllegalStateError("node is already listening".into()));
        }
        let listener_task = self
            .runtime
            .spawn(self.clone().accept_loop(listener, acceptor, shutdown));
        info!(
            "node {} listening on {} ({:?}, {} workers on {} lanes)",
            self.config.node_name,
            local_address,
            self.config.tls_mode,
            pool.worker_count(),
            pool.lane_count()
        );
        *running = Some(RunningNode {
            local_address,
            notify_shutdown,
            pool,
            listener_task,
        });
        Ok(local_address)
    }

    /// Closes the listener, says goodbye to every peer, tears all connections
    /// down and stops the worker pool. Queued packages are dropped, packages
    /// being handled are allowed to finish.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        info!("stopping node on {}", running.local_address);
        let _ = running.notify_shutdown.send(());
        if let Err(e) = running.listener_task.await {
            warn!("listener task ended abnormally: {}", e);
        }

        let states = self.registry.states();
        match Package::from_message(&CloseConnection { code: 0 }, None) {
            Ok(goodbye) => {
                for state in states.iter().filter(|state| state.is_connected()) {
                    if let Some(job) = self.write_job(&goodbye, state.address()) {
                        self.send_executor.run(job);
                    }
                }
                // the send queue is FIFO: once this ran, the goodbyes were written
                self.send_executor
                    .run_and_wait_async(|| true, self.config.send_wait_timeout())
                    .await;
            }
            Err(e) => warn!("cannot build close message: {}", e),
        }
        for state in &states {
            self.teardown(state);
        }

        running.pool.stop(self.config.stop_grace()).await;
        info!("node {} stopped", self.config.node_name);
    }

    pub async fn connect_to(
        self: &Arc<Self>,
        address: SocketAddr,
        mode: TlsMode,
    ) -> AppResult<ConnectionInfo> {
        self.connect(address, None, mode).await
    }

    /// Resolves `domain` and connects to the first address found, without
    /// blocking the caller. Resolution failures fire
    /// `AddNodeFailed(HostNotFound)`.
    pub fn connect_to_host(
        self: &Arc<Self>,
        domain: &str,
        port: u16,
        mode: TlsMode,
    ) -> JoinHandle<AppResult<ConnectionInfo>> {
        let engine = self.clone();
        let domain = domain.to_string();
        self.runtime.spawn(async move {
            let target = format!("{}:{}", domain, port);
            let address = match tokio::net::lookup_host((domain.as_str(), port)).await {
                Ok(mut addresses) => addresses.next(),
                Err(e) => {
                    debug!("resolving {} failed: {}", target, e);
                    None
                }
            };
            let Some(address) = address else {
                engine.add_node_failed(&target, AddNodeError::HostNotFound);
                return Err(AppError::HostNotFound(target));
            };
            engine.connect(address, Some(domain), mode).await
        })
    }

    async fn connect(
        self: &Arc<Self>,
        address: SocketAddr,
        host: Option<String>,
        mode: TlsMode,
    ) -> AppResult<ConnectionInfo> {
        let target = host
            .as_ref()
            .map_or_else(|| address.to_string(), |host| format!("{} ({})", host, address));
        if self.pool().is_none() {
            return Err(AppError::IllegalStateError("node is not running".into()));
        }
        if self.registry.is_banned(address.ip()) {
            self.add_node_failed(&target, AddNodeError::Banned);
            return Err(AppError::PeerBanned(target));
        }
        let connector = match self.tls_connector(mode) {
            Ok(connector) => connector,
            Err(e) => {
                self.add_node_failed(&target, AddNodeError::TlsHandshake);
                return Err(e);
            }
        };

        let stream = match TcpStream::connect(address).await {
            Ok(stream) => stream,
            Err(e) => {
                self.add_node_failed(&target, AddNodeError::ConnectionRefused);
                return Err(AppError::DetailedIoError(format!(
                    "connect to {}: {}",
                    target, e
                )));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            trace!("set_nodelay for {} failed: {}", target, e);
        }

        let registered = match connector {
            None => self.register_socket(stream, address, true, host, false),
            Some(connector) => {
                let name = tls::server_name(host.as_deref(), address.ip())?;
                match connector.connect(name, stream).await {
                    Ok(stream) => self.register_socket(stream, address, true, host, true),
                    Err(e) => {
                        self.add_node_failed(&target, AddNodeError::TlsHandshake);
                        return Err(AppError::TlsError(format!(
                            "handshake with {}: {}",
                            target, e
                        )));
                    }
                }
            }
        };
        if let Err(e) = &registered {
            match e {
                AppError::RegistryFull(_) => {
                    self.add_node_failed(&target, AddNodeError::RegistryFull)
                }
                AppError::PeerBanned(_) => self.add_node_failed(&target, AddNodeError::Banned),
                _ => {}
            }
        }
        registered
    }

    /// Takes ownership of a connected socket (plain or TLS).
    ///
    /// Refused when the peer's IP is banned or the connection ceiling is
    /// reached; the socket is closed in that case. Otherwise the connection
    /// is registered, its reader started, `VERSION` sent and the
    /// confirmation timeout armed.
    pub fn register_socket<S>(
        self: &Arc<Self>,
        stream: S,
        address: SocketAddr,
        is_local: bool,
        host: Option<String>,
        tls: bool,
    ) -> AppResult<ConnectionInfo>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let pool = self
            .pool()
            .ok_or_else(|| AppError::IllegalStateError("node is not running".into()))?;
        if self.registry.is_banned(address.ip()) {
            return Err(AppError::PeerBanned(address.to_string()));
        }
        let (reader, writer) = tokio::io::split(stream);
        let state = Arc::new(ConnectionState::new(
            address,
            is_local,
            host,
            tls,
            Box::new(writer),
        ));
        if let Some(replaced) = self.registry.insert(state.clone())? {
            debug!("connection {} to {} replaced", replaced.id(), address);
            self.teardown(&replaced);
        }

        let info = state.info();
        info!(
            monotonic_counter.connections = 1,
            "connection {} to {} registered (local: {}, tls: {})",
            info.id,
            address,
            is_local,
            tls
        );
        self.notify(NodeEvent::Connected(info.clone()));

        self.runtime
            .spawn(self.clone().read_loop(state.clone(), Box::new(reader), pool));
        self.schedule_confirmation_timeout(&state);
        self.send_data(
            &VersionInfo::current(self.config.node_name.clone()),
            address,
            None,
        );
        Ok(info)
    }

    /// Checks sender and package, then hands the package to the parser of
    /// its command.
    pub fn parse_package(&self, package: &Package, sender: &ConnectionState) -> ParserResult {
        if !sender.is_connected() || sender.is_banned() {
            return ParserResult::Error;
        }
        if let Err(fault) = package.check(self.config.accept_legacy_hash) {
            debug!("invalid package from {}: {}", sender.address(), fault);
            return ParserResult::Error;
        }
        let Some(parser) = self.parsers.select_parser(package.command()) else {
            return ParserResult::NotProcessed;
        };
        if parser.requires_confirmation() && !sender.is_confirmed() {
            debug!(
                "{} from unconfirmed {} refused",
                package.command(),
                sender.address()
            );
            return ParserResult::Error;
        }
        parser.parse_package(package, sender, self)
    }

    /// Applies `trust_delta` to the peer and, if it is still connected,
    /// answers `request` with `error`. A refused trust change bans the peer.
    pub fn bad_request(
        &self,
        address: SocketAddr,
        request: &Header,
        error: BadRequest,
        trust_delta: i32,
    ) {
        if !self.change_trust(address, trust_delta) {
            debug!("trust change for {} refused, banning", address);
            self.ban(address);
            return;
        }
        if self
            .registry
            .get(&address)
            .is_some_and(|state| state.is_connected())
        {
            self.send_data(&error, address, Some(request));
        }
    }

    /// Returns false if the peer is unknown or its trust may not change.
    /// Trust that drops to the floor tears the connection down.
    pub fn change_trust(&self, address: SocketAddr, diff: i32) -> bool {
        let Some(state) = self.registry.get(&address) else {
            return false;
        };
        match state.change_trust(diff) {
            TrustChange::Refused => false,
            TrustChange::Changed(trust) => {
                debug!("trust of {} changed by {} to {}", address, diff, trust);
                true
            }
            TrustChange::Exhausted => {
                info!(monotonic_counter.bans = 1, "trust of {} exhausted", address);
                self.teardown(&state);
                true
            }
        }
    }

    pub fn ban(&self, address: SocketAddr) -> bool {
        let Some(state) = self.registry.get(&address) else {
            return false;
        };
        state.ban();
        info!(monotonic_counter.bans = 1, "{} banned", address);
        self.teardown(&state);
        true
    }

    /// Lifts a ban; the peer may reconnect with `TrustLevel::RESTORE`.
    pub fn unban(&self, address: SocketAddr) -> bool {
        let Some(state) = self.registry.get(&address) else {
            return false;
        };
        if !state.unban() {
            return false;
        }
        info!("{} unbanned", address);
        self.registry.reap(&address, state.id());
        true
    }

    pub fn disconnect(&self, address: SocketAddr) -> bool {
        match self.registry.get(&address) {
            Some(state) => self.teardown(&state),
            None => false,
        }
    }

    /// Queues `message` for `address` and returns the package hash, or 0 if
    /// the message is invalid or nothing could be queued.
    pub fn send_data<M: Message>(
        &self,
        message: &M,
        address: SocketAddr,
        trigger: Option<&Header>,
    ) -> u32 {
        if !message.is_valid() {
            debug!("refusing to send invalid {}", message.command());
            return 0;
        }
        let package = match Package::from_message(message, trigger) {
            Ok(package) => package,
            Err(e) => {
                warn!("cannot encode {}: {}", message.command(), e);
                return 0;
            }
        };
        let hash = package.hash();
        if self.send_package(package, address) {
            hash
        } else {
            0
        }
    }

    /// Queues the write without waiting for it.
    pub fn send_package(&self, package: Package, address: SocketAddr) -> bool {
        match self.write_job(&package, address) {
            Some(job) => self.send_executor.run(job),
            None => false,
        }
    }

    /// Blocks the calling thread until the package was written or the send
    /// timeout elapsed. Async callers use `send_package_and_wait_async`.
    pub fn send_package_and_wait(&self, package: Package, address: SocketAddr) -> bool {
        match self.write_job(&package, address) {
            Some(job) => self
                .send_executor
                .run_and_wait(job, self.config.send_wait_timeout()),
            None => false,
        }
    }

    pub async fn send_package_and_wait_async(&self, package: Package, address: SocketAddr) -> bool {
        match self.write_job(&package, address) {
            Some(job) => {
                self.send_executor
                    .run_and_wait_async(job, self.config.send_wait_timeout())
                    .await
            }
            None => false,
        }
    }

    fn write_job(
        &self,
        package: &Package,
        address: SocketAddr,
    ) -> Option<impl FnOnce() -> bool + Send + 'static> {
        if package.check(false).is_err() {
            debug!("refusing to send invalid package {}", package.header);
            return None;
        }
        let Some(state) = self.registry.get(&address).filter(|state| state.is_connected()) else {
            debug!("no connection to {}, {} not sent", address, package.command());
            return None;
        };
        let id = state.id();
        let engine = self.me.clone();
        let runtime = self.runtime.clone();
        let bytes: Bytes = package.serialize();
        let deadline = self.config.send_wait_timeout();
        Some(move || {
            let Some(engine) = engine.upgrade() else {
                return false;
            };
            let Some(state) = engine.registry.resolve(&address, id) else {
                return false;
            };
            match runtime.block_on(state.write_frame(&bytes, deadline)) {
                Ok(()) => {
                    trace!(
                        monotonic_counter.packages_sent = 1,
                        "{} bytes written to {}",
                        bytes.len(),
                        address
                    );
                    true
                }
                Err(e) => {
                    if state.is_connected() {
                        warn!("write to {} failed: {}", address, e);
                        engine.notify(NodeEvent::RequestError {
                            address,
                            code: ErrorCode::WRITE_FAILED,
                            message: e.to_string(),
                        });
                        engine.teardown(&state);
                    }
                    false
                }
            }
        })
    }

    pub(crate) fn notify(&self, event: NodeEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn on_version_received(&self, sender: &ConnectionState, peer_name: String) {
        if sender.mark_version_received(peer_name) {
            self.confirmed(sender);
        }
    }

    pub(crate) fn on_version_delivered(&self, sender: &ConnectionState) {
        if sender.mark_version_delivered() {
            self.confirmed(sender);
        }
    }

    fn confirmed(&self, state: &ConnectionState) {
        let info = state.info();
        info!(
            monotonic_counter.confirmations = 1,
            "connection {} to {} confirmed, peer {:?}",
            info.id,
            info.address,
            info.peer_name
        );
        self.notify(NodeEvent::Confirmed(info));
    }

    fn add_node_failed(&self, target: &str, error: AddNodeError) {
        warn!("adding node {} failed: {}", target, error);
        self.notify(NodeEvent::AddNodeFailed {
            target: target.to_string(),
            error,
        });
    }

    /// Disconnects, reaps and notifies once per connection.
    fn teardown(&self, state: &ConnectionState) -> bool {
        if !state.disconnect() {
            return false;
        }
        let info = state.info();
        info!(
            monotonic_counter.disconnections = 1,
            "connection {} to {} torn down, trust {}",
            info.id,
            info.address,
            info.trust
        );
        self.registry.reap(&info.address, info.id);
        self.notify(NodeEvent::Disconnected(info));
        true
    }

    fn pool(&self) -> Option<Arc<WorkerPool<WorkItem>>> {
        self.running.lock().as_ref().map(|running| running.pool.clone())
    }

    fn tls_provider(&self, mode: TlsMode) -> AppResult<Option<Arc<dyn TlsProvider>>> {
        if let Some(provider) = self.tls_providers.lock().get(&mode) {
            return Ok(Some(provider.clone()));
        }
        let Some(provider) = tls::provider_for(mode, &self.config)? else {
            return Ok(None);
        };
        Ok(Some(
            self.tls_providers
                .lock()
                .entry(mode)
                .or_insert(provider)
                .clone(),
        ))
    }

    fn tls_connector(&self, mode: TlsMode) -> AppResult<Option<TlsConnector>> {
        match self.tls_provider(mode)? {
            Some(provider) => Ok(Some(TlsConnector::from(provider.client_config()?))),
            None => Ok(None),
        }
    }

    fn schedule_confirmation_timeout(&self, state: &ConnectionState) {
        let timeout = self.config.confirmation_timeout();
        let closed = state.closed_token();
        let (address, id) = (state.address(), state.id());
        let engine = self.me.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = time::sleep(timeout) => {}
                _ = closed.cancelled() => return,
            }
            let Some(engine) = engine.upgrade() else {
                return;
            };
            let Some(state) = engine.registry.resolve(&address, id) else {
                return;
            };
            if !state.is_confirmed() {
                info!(
                    "connection {} to {} not confirmed within {:?}",
                    id, address, timeout
                );
                engine.teardown(&state);
            }
        });
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
        mut shutdown: Shutdown,
    ) {
        loop {
            let (socket, peer) = tokio::select! {
                accepted = self.accept(&listener) => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("listener failed: {}", e);
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    debug!("listener received shutdown signal");
                    break;
                }
            };
            if self.registry.is_banned(peer.ip()) {
                info!("refusing banned peer {}", peer);
                continue;
            }
            if let Err(e) = socket.set_nodelay(true) {
                trace!("set_nodelay for {} failed: {}", peer, e);
            }

            let Some(acceptor) = acceptor.clone() else {
                if let Err(e) = self.register_socket(socket, peer, false, None, false) {
                    info!("inbound connection from {} rejected: {}", peer, e);
                }
                continue;
            };
            let engine = self.clone();
            let handshake_timeout = self.config.confirmation_timeout();
            self.runtime.spawn(async move {
                match time::timeout(handshake_timeout, acceptor.accept(socket)).await {
                    Ok(Ok(stream)) => {
                        if let Err(e) = engine.register_socket(stream, peer, false, None, true) {
                            info!("inbound connection from {} rejected: {}", peer, e);
                        }
                    }
                    Ok(Err(e)) => {
                        engine.tls_handshake_failed(peer, format!("tls handshake failed: {}", e))
                    }
                    Err(_) => engine.tls_handshake_failed(
                        peer,
                        format!("tls handshake timed out after {:?}", handshake_timeout),
                    ),
                }
            });
        }
        debug!("listener loop exited");
    }

    fn tls_handshake_failed(&self, peer: SocketAddr, message: String) {
        warn!("inbound connection from {}: {}", peer, message);
        self.notify(NodeEvent::RequestError {
            address: peer,
            code: ErrorCode::TLS_HANDSHAKE,
            message,
        });
    }

    async fn accept(&self, listener: &TcpListener) -> AppResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::DetailedIoError(format!(
                            "accept tcp connection error: {}",
                            err
                        )));
                    }
                    warn!("accept failed, retrying in {}s: {}", backoff, err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        state: Arc<ConnectionState>,
        mut reader: BoxedReader,
        pool: Arc<WorkerPool<WorkItem>>,
    ) {
        let address = state.address();
        let key = lane_key(&address);
        let closed = state.closed_token();
        let mut reassembler = StreamReassembler::new(self.config.accept_legacy_hash);
        let mut buffer = BytesMut::with_capacity(self.config.read_buffer_size);

        'read: loop {
            buffer.clear();
            let read = tokio::select! {
                read = reader.read_buf(&mut buffer) => read,
                _ = closed.cancelled() => break,
            };
            match read {
                Ok(0) => {
                    debug!("{} closed the connection", address);
                    break;
                }
                Ok(n) => trace!("read {} bytes from {}", n, address),
                Err(e) => {
                    debug!("read from {} failed: {}", address, e);
                    break;
                }
            }

            for result in reassembler.feed(&buffer) {
                match result {
                    Ok(package) => {
                        trace!(
                            monotonic_counter.packages_received = 1,
                            "{} from {}",
                            package.header,
                            address
                        );
                        let item = WorkItem {
                            connection_id: state.id(),
                            address,
                            package,
                        };
                        if let Err(e) = pool.submit(item, key).await {
                            debug!("package from {} dropped: {}", address, e);
                        }
                    }
                    Err(error) => self.framing_error(&state, error),
                }
                if !state.is_connected() {
                    break 'read;
                }
            }
        }

        self.teardown(&state);
        state.close_writer().await;
    }

    fn framing_error(&self, state: &ConnectionState, error: FrameError) {
        warn!(
            monotonic_counter.framing_errors = 1,
            "framing error from {}: {}",
            state.address(),
            error
        );
        self.bad_request(
            state.address(),
            &error.header,
            BadRequest::new(ErrorCode::INVALID_PACKAGE, error.to_string()),
            TrustPenalty::FRAMING_ERROR,
        );
    }

    fn handle_work(&self, item: WorkItem) {
        let WorkItem {
            connection_id,
            address,
            package,
        } = item;
        let Some(state) = self.registry.resolve(&address, connection_id) else {
            trace!("dropping {} from departed connection {}", package.header, address);
            return;
        };
        if !state.is_connected() {
            return;
        }

        let command = package.command();
        match self.parse_package(&package, &state) {
            ParserResult::Processed => {
                trace!(
                    monotonic_counter.packages_processed = 1,
                    "{} from {} processed",
                    command,
                    address
                );
            }
            ParserResult::NotProcessed => {
                debug!("no parser for {} from {}", command, address);
                self.bad_request(
                    address,
                    &package.header,
                    BadRequest::new(
                        ErrorCode::UNKNOWN_COMMAND,
                        format!("command {} is not supported", command),
                    ),
                    TrustPenalty::UNKNOWN_COMMAND,
                );
            }
            ParserResult::Error => {
                let error = if self.parsers.requires_confirmation(command) && !state.is_confirmed() {
                    BadRequest::new(
                        ErrorCode::NOT_CONFIRMED,
                        format!("{} needs a confirmed connection", command),
                    )
                } else if let Some(theirs) = foreign_protocol_version(&package) {
                    BadRequest::new(
                        ErrorCode::PROTOCOL_VERSION,
                        format!(
                            "protocol {} is not supported, expected {}",
                            theirs, PROTOCOL_VERSION
                        ),
                    )
                } else {
                    BadRequest::new(
                        ErrorCode::PROCESSING_FAILED,
                        format!("{} could not be processed", command),
                    )
                };
                self.bad_request(address, &package.header, error, TrustPenalty::PROTOCOL_ERROR);
            }
        }
    }
}

/// The protocol version announced by a `VERSION` package, if it is not ours.
fn foreign_protocol_version(package: &Package) -> Option<u32> {
    if package.command() != Command::VERSION {
        return None;
    }
    VersionInfo::decode(&package.payload)
        .ok()
        .map(|version| version.protocol_version)
        .filter(|version| *version != PROTOCOL_VERSION)
}

impl Drop for NodeEngine {
    fn drop(&mut self) {
        debug!("node {} dropped", self.config.node_name);
    }
}
