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

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{ConnectionInfo, ConnectionState};
use crate::{AppError, AppResult};

/// Address-keyed table of the node's connections.
///
/// Readers get snapshots or a cloned `Arc`, never a reference into the map,
/// so no lock is held while a caller works with a connection. Entries of
/// banned peers outlive their sockets; all other closed entries are reaped.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<SocketAddr, Arc<ConnectionState>>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        ConnectionRegistry {
            connections: Mutex::new(HashMap::new()),
            max_connections,
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Adds `state` under its address, returning the entry it replaced.
    pub fn insert(&self, state: Arc<ConnectionState>) -> AppResult<Option<Arc<ConnectionState>>> {
        let address = state.address();
        let mut connections = self.connections.lock();
        let active = connections
            .iter()
            .filter(|(key, entry)| **key != address && entry.is_connected())
            .count();
        if active >= self.max_connections {
            return Err(AppError::RegistryFull(self.max_connections));
        }
        Ok(connections.insert(address, state))
    }

    pub fn get(&self, address: &SocketAddr) -> Option<Arc<ConnectionState>> {
        self.connections.lock().get(address).cloned()
    }

    /// Looks `address` up and checks it still is connection `id`.
    pub fn resolve(&self, address: &SocketAddr, id: u64) -> Option<Arc<ConnectionState>> {
        self.get(address).filter(|state| state.id() == id)
    }

    pub fn info(&self, address: &SocketAddr) -> Option<ConnectionInfo> {
        self.get(address).map(|state| state.info())
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.states().iter().map(|state| state.info()).collect()
    }

    pub fn states(&self) -> Vec<Arc<ConnectionState>> {
        self.connections.lock().values().cloned().collect()
    }

    /// Live connections only.
    pub fn active_count(&self) -> usize {
        self.connections
            .lock()
            .values()
            .filter(|state| state.is_connected())
            .count()
    }

    /// Drops the entry of connection `id` once it is closed and not banned.
    pub fn reap(&self, address: &SocketAddr, id: u64) -> bool {
        let mut connections = self.connections.lock();
        let reapable = connections
            .get(address)
            .is_some_and(|state| state.id() == id && !state.is_connected() && !state.is_banned());
        if reapable {
            connections.remove(address);
        }
        reapable
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.connections
            .lock()
            .iter()
            .any(|(address, state)| address.ip() == ip && state.is_banned())
    }
}
