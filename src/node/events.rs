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

use std::net::SocketAddr;

use super::ConnectionInfo;

/// Why an outbound connection attempt was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AddNodeError {
    #[error("host not found")]
    HostNotFound,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("tls handshake failed")]
    TlsHandshake,
    #[error("peer is banned")]
    Banned,
    #[error("connection limit reached")]
    RegistryFull,
}

/// Notifications published by a node, see `NodeEngine::subscribe`.
///
/// Connection events carry a snapshot taken when the event fired.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Connected(ConnectionInfo),
    Confirmed(ConnectionInfo),
    Disconnected(ConnectionInfo),
    /// A peer answered with `BAD_REQUEST`, or a write to it failed.
    RequestError {
        address: SocketAddr,
        code: u32,
        message: String,
    },
    AddNodeFailed {
        target: String,
        error: AddNodeError,
    },
}

impl NodeEvent {
    pub fn address(&self) -> Option<SocketAddr> {
        match self {
            NodeEvent::Connected(info)
            | NodeEvent::Confirmed(info)
            | NodeEvent::Disconnected(info) => Some(info.address),
            NodeEvent::RequestError { address, .. } => Some(*address),
            NodeEvent::AddNodeFailed { .. } => None,
        }
    }
}
