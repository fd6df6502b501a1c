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

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace, warn};

use super::{ConnectionState, NodeEngine, NodeEvent};
use crate::protocol::{
    BadRequest, CloseConnection, Command, Message, Package, Pong, VersionAck, VersionInfo,
    PROTOCOL_VERSION,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserResult {
    /// The package was malformed or not acceptable from this sender.
    Error,
    /// Nobody handles this command.
    NotProcessed,
    Processed,
}

/// Handles the packages of a set of commands.
///
/// Parsers run on the node's worker pool. `sender` is only borrowed for the
/// call; a parser that needs the connection later keeps its address and
/// looks it up again.
pub trait PackageParser: Send + Sync + 'static {
    fn commands(&self) -> Vec<Command>;

    /// Whether packages from senders that are not yet `Confirmed` are refused.
    fn requires_confirmation(&self) -> bool {
        true
    }

    fn parse_package(
        &self,
        package: &Package,
        sender: &ConnectionState,
        node: &NodeEngine,
    ) -> ParserResult;
}

/// Command id to parser table.
#[derive(Default)]
pub struct ParserRegistry {
    parsers: DashMap<Command, Arc<dyn PackageParser>>,
}

impl ParserRegistry {
    /// Routes every command of `parser` to it, replacing earlier parsers.
    pub fn register(&self, parser: Arc<dyn PackageParser>) {
        for command in parser.commands() {
            if self.parsers.insert(command, parser.clone()).is_some() {
                warn!("parser for {} replaced", command);
            }
        }
    }

    pub fn select_parser(&self, command: Command) -> Option<Arc<dyn PackageParser>> {
        // clone out so the map shard is unlocked while the parser runs
        self.parsers.get(&command).map(|entry| entry.value().clone())
    }

    pub fn requires_confirmation(&self, command: Command) -> bool {
        self.select_parser(command)
            .is_some_and(|parser| parser.requires_confirmation())
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }
}

/// Built-in commands: keep-alive, error reports, handshake and close.
pub struct CoreParser;

impl CoreParser {
    fn decode<M: Message>(package: &Package, sender: &ConnectionState) -> Option<M> {
        match M::decode(&package.payload) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!("bad {} payload from {}: {}", package.command(), sender.address(), e);
                None
            }
        }
    }
}

impl PackageParser for CoreParser {
    fn commands(&self) -> Vec<Command> {
        vec![
            Command::PING,
            Command::PONG,
            Command::BAD_REQUEST,
            Command::VERSION,
            Command::VERSION_ACK,
            Command::CLOSE_CONNECTION,
        ]
    }

    fn requires_confirmation(&self) -> bool {
        false
    }

    fn parse_package(
        &self,
        package: &Package,
        sender: &ConnectionState,
        node: &NodeEngine,
    ) -> ParserResult {
        let address = sender.address();
        match package.command() {
            Command::PING => {
                if node.send_data(&Pong, address, Some(&package.header)) == 0 {
                    debug!("pong to {} not queued", address);
                }
                ParserResult::Processed
            }
            Command::PONG => {
                trace!("pong from {} for {:#010x}", address, package.header.trigger_hash);
                ParserResult::Processed
            }
            Command::BAD_REQUEST => {
                let Some(error) = Self::decode::<BadRequest>(package, sender) else {
                    return ParserResult::Error;
                };
                warn!(
                    "{} rejected request {:#010x}: [{}] {}",
                    address, package.header.trigger_hash, error.code, error.message
                );
                node.notify(NodeEvent::RequestError {
                    address,
                    code: error.code,
                    message: error.message,
                });
                ParserResult::Processed
            }
            Command::VERSION => {
                let Some(version) = Self::decode::<VersionInfo>(package, sender) else {
                    return ParserResult::Error;
                };
                if version.protocol_version != PROTOCOL_VERSION {
                    warn!(
                        "{} speaks protocol {}, expected {}",
                        address, version.protocol_version, PROTOCOL_VERSION
                    );
                    return ParserResult::Error;
                }
                node.send_data(&VersionAck, address, Some(&package.header));
                node.on_version_received(sender, version.node_name);
                ParserResult::Processed
            }
            Command::VERSION_ACK => {
                if Self::decode::<VersionAck>(package, sender).is_none() {
                    return ParserResult::Error;
                }
                node.on_version_delivered(sender);
                ParserResult::Processed
            }
            Command::CLOSE_CONNECTION => {
                let Some(close) = Self::decode::<CloseConnection>(package, sender) else {
                    return ParserResult::Error;
                };
                debug!("{} closes the connection, code {}", address, close.code);
                node.disconnect(address);
                ParserResult::Processed
            }
            _ => ParserResult::NotProcessed,
        }
    }
}
