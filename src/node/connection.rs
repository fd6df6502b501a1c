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

//! Per-peer connection state.
//!
//! A `ConnectionState` owns the write half of one socket and tracks the
//! peer's trust score and handshake status. Status only moves forward
//! (`Connected` then `Confirmed`) until the connection is torn down, which
//! resets it to `NotConnected`. Being banned is not a status of its own: it
//! is `trust == TrustLevel::BANNED`.

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{AppError, AppResult};

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    #[default]
    NotConnected,
    Connected,
    Confirmed,
}

/// Trust score bounds.
pub struct TrustLevel;

impl TrustLevel {
    pub const BANNED: i32 = 0;
    pub const RESTORE: i32 = 20;
    pub const DEFAULT: i32 = 100;
    pub const MAXIMUM: i32 = 254;
    pub const UNDEFINED: i32 = 255;
}

/// Trust deltas applied for misbehaving peers.
pub struct TrustPenalty;

impl TrustPenalty {
    pub const FRAMING_ERROR: i32 = -20;
    pub const UNKNOWN_COMMAND: i32 = -5;
    pub const PROTOCOL_ERROR: i32 = -10;
}

/// Outcome of `ConnectionState::change_trust`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustChange {
    /// Trust sits on the banned or undefined boundary and was left untouched.
    Refused,
    Changed(i32),
    /// Trust reached the floor; the caller must tear the connection down.
    Exhausted,
}

/// Point-in-time copy of a connection, safe to hold across await points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub address: SocketAddr,
    pub host: Option<String>,
    pub peer_name: Option<String>,
    pub trust: i32,
    pub status: ConnectionStatus,
    pub is_local: bool,
    pub tls: bool,
    pub connected_at: DateTime<Local>,
}

impl ConnectionInfo {
    pub fn is_banned(&self) -> bool {
        self.trust <= TrustLevel::BANNED
    }
}

#[derive(Debug)]
struct PeerState {
    trust: i32,
    status: ConnectionStatus,
    version_received: bool,
    version_delivered: bool,
    peer_name: Option<String>,
}

impl PeerState {
    fn try_confirm(&mut self) -> bool {
        if self.status == ConnectionStatus::Connected
            && self.version_received
            && self.version_delivered
        {
            self.status = ConnectionStatus::Confirmed;
            return true;
        }
        false
    }
}

pub struct ConnectionState {
    id: u64,
    address: SocketAddr,
    is_local: bool,
    host: Option<String>,
    tls: bool,
    connected_at: DateTime<Local>,
    peer: Mutex<PeerState>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Debug for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("is_local", &self.is_local)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .field("peer", &*self.peer.lock())
            .finish()
    }
}

impl ConnectionState {
    /// A freshly registered socket: status `Connected`, default trust.
    pub fn new(
        address: SocketAddr,
        is_local: bool,
        host: Option<String>,
        tls: bool,
        writer: BoxedWriter,
    ) -> Self {
        ConnectionState {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            address,
            is_local,
            host,
            tls,
            connected_at: Local::now(),
            peer: Mutex::new(PeerState {
                trust: TrustLevel::DEFAULT,
                status: ConnectionStatus::Connected,
                version_received: false,
                version_delivered: false,
                peer_name: None,
            }),
            writer: tokio::sync::Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn trust(&self) -> i32 {
        self.peer.lock().trust
    }

    pub fn status(&self) -> ConnectionStatus {
        self.peer.lock().status
    }

    pub fn is_banned(&self) -> bool {
        self.trust() <= TrustLevel::BANNED
    }

    pub fn is_confirmed(&self) -> bool {
        self.status() == ConnectionStatus::Confirmed
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Cancelled once the connection is torn down.
    pub fn closed_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Adds `diff` to the trust score, clamped to `[BANNED, MAXIMUM]`.
    pub fn change_trust(&self, diff: i32) -> TrustChange {
        let mut peer = self.peer.lock();
        if peer.trust <= TrustLevel::BANNED || peer.trust >= TrustLevel::UNDEFINED {
            return TrustChange::Refused;
        }
        peer.trust = peer
            .trust
            .saturating_add(diff)
            .clamp(TrustLevel::BANNED, TrustLevel::MAXIMUM);
        trace!("trust of {} changed by {} to {}", self.address, diff, peer.trust);
        if peer.trust <= TrustLevel::BANNED {
            TrustChange::Exhausted
        } else {
            TrustChange::Changed(peer.trust)
        }
    }

    pub fn ban(&self) {
        self.peer.lock().trust = TrustLevel::BANNED;
    }

    /// Puts a banned peer on probation. Returns false if it was not banned.
    pub fn unban(&self) -> bool {
        let mut peer = self.peer.lock();
        if peer.trust > TrustLevel::BANNED {
            return false;
        }
        peer.trust = TrustLevel::RESTORE;
        true
    }

    /// Records the peer's `VERSION`. Returns true if this confirmed the connection.
    pub fn mark_version_received(&self, peer_name: String) -> bool {
        let mut peer = self.peer.lock();
        peer.version_received = true;
        peer.peer_name = Some(peer_name);
        peer.try_confirm()
    }

    /// Records the peer's `VERSION_ACK`. Returns true if this confirmed the connection.
    pub fn mark_version_delivered(&self) -> bool {
        let mut peer = self.peer.lock();
        peer.version_delivered = true;
        peer.try_confirm()
    }

    /// Moves to `NotConnected` and wakes everything waiting on the connection.
    ///
    /// Only the first call returns true.
    pub fn disconnect(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.peer.lock().status = ConnectionStatus::NotConnected;
        self.cancel.cancel();
        debug!("connection {} to {} closed", self.id, self.address);
        true
    }

    /// Writes one serialized package.
    ///
    /// Fails once the connection is closed, when it is torn down while the
    /// write is in flight, or when the peer does not take the bytes within
    /// `deadline`. The writer lock is released in every case.
    pub async fn write_frame(&self, bytes: &[u8], deadline: Duration) -> AppResult<()> {
        if !self.is_connected() {
            return Err(AppError::IllegalStateError(format!(
                "connection to {} is closed",
                self.address
            )));
        }
        let write = async {
            let mut writer = self.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                return Err(AppError::IllegalStateError(format!(
                    "connection to {} has no writer",
                    self.address
                )));
            };
            writer.write_all(bytes).await.map_err(|e| {
                AppError::DetailedIoError(format!("write to {}: {}", self.address, e))
            })?;
            writer.flush().await.map_err(|e| {
                AppError::DetailedIoError(format!("flush to {}: {}", self.address, e))
            })
        };
        tokio::select! {
            result = time::timeout(deadline, write) => match result {
                Ok(written) => written,
                Err(_) => Err(AppError::DetailedIoError(format!(
                    "write to {} stalled for {:?}",
                    self.address, deadline
                ))),
            },
            _ = self.cancel.cancelled() => Err(AppError::IllegalStateError(format!(
                "connection to {} closed during write",
                self.address
            ))),
        }
    }

    /// Shuts the write half down and drops it, giving up after `CLOSE_TIMEOUT`.
    pub async fn close_writer(&self) {
        let close = async {
            let writer = self.writer.lock().await.take();
            if let Some(mut writer) = writer {
                if let Err(e) = writer.shutdown().await {
                    trace!("shutdown of writer to {} failed: {}", self.address, e);
                }
            }
        };
        if time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
            debug!("writer to {} did not close within {:?}", self.address, CLOSE_TIMEOUT);
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        let peer = self.peer.lock();
        ConnectionInfo {
            id: self.id,
            address: self.address,
            host: self.host.clone(),
            peer_name: peer.peer_name.clone(),
            trust: peer.trust,
            status: peer.status,
            is_local: self.is_local,
            tls: self.tls,
            connected_at: self.connected_at,
        }
    }
}
