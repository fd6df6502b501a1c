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

use bytes::{Buf, BufMut, BytesMut};

use super::Command;
use crate::{AppError, AppResult};

/// Version exchanged in the `VERSION` handshake message.
pub const PROTOCOL_VERSION: u32 = 1;

const MAX_TEXT_LEN: usize = 64 * 1024;

/// Error codes carried by `BadRequest`.
pub struct ErrorCode;

impl ErrorCode {
    pub const UNKNOWN_COMMAND: u32 = 1;
    pub const INVALID_PACKAGE: u32 = 2;
    pub const NOT_CONFIRMED: u32 = 3;
    pub const PROTOCOL_VERSION: u32 = 4;
    pub const PROCESSING_FAILED: u32 = 5;
    pub const WRITE_FAILED: u32 = 6;
    pub const TLS_HANDSHAKE: u32 = 7;
}

/// Anything that can travel as a package payload.
pub trait Message: Sized {
    fn command(&self) -> Command;

    /// A message that reports itself invalid is never sent.
    fn is_valid(&self) -> bool {
        true
    }

    fn encode(&self, buffer: &mut BytesMut) -> AppResult<()>;

    fn decode(payload: &[u8]) -> AppResult<Self>;
}

fn put_text(buffer: &mut BytesMut, text: &str) -> AppResult<()> {
    if text.len() > MAX_TEXT_LEN {
        return Err(AppError::InvalidValue(format!(
            "text of {} bytes is too long",
            text.len()
        )));
    }
    buffer.put_u32_le(text.len() as u32);
    buffer.put_slice(text.as_bytes());
    Ok(())
}

fn get_u32(cursor: &mut &[u8], field: &str) -> AppResult<u32> {
    if cursor.remaining() < 4 {
        return Err(AppError::MalformedProtocol(format!(
            "missing field {}",
            field
        )));
    }
    Ok(cursor.get_u32_le())
}

fn get_text(cursor: &mut &[u8], field: &str) -> AppResult<String> {
    let len = get_u32(cursor, field)? as usize;
    if len > MAX_TEXT_LEN || cursor.remaining() < len {
        return Err(AppError::MalformedProtocol(format!(
            "field {} declares {} bytes, {} available",
            field,
            len,
            cursor.remaining()
        )));
    }
    let text = String::from_utf8(cursor[..len].to_vec())
        .map_err(|e| AppError::MalformedProtocol(format!("field {}: {}", field, e)))?;
    cursor.advance(len);
    Ok(text)
}

fn expect_empty(payload: &[u8], command: Command) -> AppResult<()> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(AppError::MalformedProtocol(format!(
            "{} carries {} unexpected bytes",
            command,
            payload.len()
        )))
    }
}

macro_rules! empty_message {
    ($name:ident, $command:expr) => {
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
        pub struct $name;

        impl Message for $name {
            fn command(&self) -> Command {
                $command
            }

            fn encode(&self, _buffer: &mut BytesMut) -> AppResult<()> {
                Ok(())
            }

            fn decode(payload: &[u8]) -> AppResult<Self> {
                expect_empty(payload, $command)?;
                Ok($name)
            }
        }
    };
}

empty_message!(Ping, Command::PING);
empty_message!(Pong, Command::PONG);
empty_message!(VersionAck, Command::VERSION_ACK);

/// Structured error answer, sent with `trigger_hash` set to the offending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadRequest {
    pub code: u32,
    pub message: String,
}

impl BadRequest {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        BadRequest {
            code,
            message: message.into(),
        }
    }
}

impl Message for BadRequest {
    fn command(&self) -> Command {
        Command::BAD_REQUEST
    }

    fn is_valid(&self) -> bool {
        self.code != 0 && self.message.len() <= MAX_TEXT_LEN
    }

    fn encode(&self, buffer: &mut BytesMut) -> AppResult<()> {
        buffer.put_u32_le(self.code);
        put_text(buffer, &self.message)
    }

    fn decode(payload: &[u8]) -> AppResult<Self> {
        let mut cursor = payload;
        let code = get_u32(&mut cursor, "code")?;
        let message = get_text(&mut cursor, "message")?;
        Ok(BadRequest { code, message })
    }
}

/// Identification sent by both sides right after the socket is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub protocol_version: u32,
    pub node_name: String,
}

impl VersionInfo {
    pub fn current(node_name: impl Into<String>) -> Self {
        VersionInfo {
            protocol_version: PROTOCOL_VERSION,
            node_name: node_name.into(),
        }
    }
}

impl Message for VersionInfo {
    fn command(&self) -> Command {
        Command::VERSION
    }

    fn is_valid(&self) -> bool {
        self.protocol_version != 0
    }

    fn encode(&self, buffer: &mut BytesMut) -> AppResult<()> {
        buffer.put_u32_le(self.protocol_version);
        put_text(buffer, &self.node_name)
    }

    fn decode(payload: &[u8]) -> AppResult<Self> {
        let mut cursor = payload;
        let protocol_version = get_u32(&mut cursor, "protocol_version")?;
        let node_name = get_text(&mut cursor, "node_name")?;
        Ok(VersionInfo {
            protocol_version,
            node_name,
        })
    }
}

/// Asks the receiver to drop the connection without penalising the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseConnection {
    pub code: u32,
}

impl Message for CloseConnection {
    fn command(&self) -> Command {
        Command::CLOSE_CONNECTION
    }

    fn encode(&self, buffer: &mut BytesMut) -> AppResult<()> {
        buffer.put_u32_le(self.code);
        Ok(())
    }

    fn decode(payload: &[u8]) -> AppResult<Self> {
        let mut cursor = payload;
        let code = get_u32(&mut cursor, "code")?;
        Ok(CloseConnection { code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_codec() {
        let error = BadRequest::new(ErrorCode::UNKNOWN_COMMAND, "command 999 is not supported");
        let mut buffer = BytesMut::new();
        error.encode(&mut buffer).unwrap();

        assert_eq!(&buffer[..4], &ErrorCode::UNKNOWN_COMMAND.to_le_bytes());
        assert_eq!(BadRequest::decode(&buffer).unwrap(), error);
    }

    #[test]
    fn version_info_rejects_truncated_name() {
        let mut buffer = BytesMut::new();
        VersionInfo::current("node-a").encode(&mut buffer).unwrap();

        let truncated = &buffer[..buffer.len() - 1];
        assert!(matches!(
            VersionInfo::decode(truncated),
            Err(AppError::MalformedProtocol(_))
        ));
    }

    #[test]
    fn version_info_rejects_bad_utf8() {
        let mut buffer = BytesMut::new();
        buffer.put_u32_le(PROTOCOL_VERSION);
        buffer.put_u32_le(2);
        buffer.put_slice(&[0xff, 0xfe]);
        assert!(VersionInfo::decode(&buffer).is_err());
    }

    #[test]
    fn empty_messages_refuse_payload() {
        assert_eq!(Ping::decode(&[]).unwrap(), Ping);
        assert!(Pong::decode(&[1]).is_err());
        assert_eq!(VersionAck.command(), Command::VERSION_ACK);
    }

    #[test]
    fn bad_request_without_code_is_invalid() {
        assert!(!BadRequest::new(0, "no code").is_valid());
        assert!(BadRequest::new(ErrorCode::INVALID_PACKAGE, "").is_valid());
    }
}
