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

use std::fmt::{Display, Formatter};

/// Numeric message type carried in `Header::command`.
///
/// Ids below `Command::APPLICATION_BASE` belong to the node protocol itself,
/// the rest are handed out by whoever registers a parser for them. Ids are
/// fixed numbers so two builds always agree on them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Command(u16);

impl Command {
    pub const PING: Command = Command(1);
    pub const PONG: Command = Command(2);
    pub const BAD_REQUEST: Command = Command(3);
    pub const VERSION: Command = Command(4);
    pub const VERSION_ACK: Command = Command(5);
    pub const CLOSE_CONNECTION: Command = Command(6);

    pub const APPLICATION_BASE: u16 = 256;

    pub const fn new(id: u16) -> Command {
        Command(id)
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    pub fn is_builtin(&self) -> bool {
        self.0 < Self::APPLICATION_BASE
    }

    pub fn name(&self) -> &'static str {
        match *self {
            Command::PING => "ping",
            Command::PONG => "pong",
            Command::BAD_REQUEST => "bad_request",
            Command::VERSION => "version",
            Command::VERSION_ACK => "version_ack",
            Command::CLOSE_CONNECTION => "close_connection",
            _ if self.is_builtin() => "reserved",
            _ => "application",
        }
    }
}

impl From<u16> for Command {
    fn from(value: u16) -> Self {
        Command(value)
    }
}

impl From<Command> for u16 {
    fn from(value: Command) -> Self {
        value.0
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}
