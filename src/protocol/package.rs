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

use bytes::{Bytes, BytesMut};

use super::header::{legacy_hash, recompute_hash, Header, HeaderFault, HEADER_SIZE, HEADER_VERSION};
use super::{Command, Message};
use crate::AppResult;

/// One framed protocol message: a header followed by `header.size` payload bytes.
///
/// A package is either empty (all-zero header, no payload) or was built from
/// a message / received off the wire; `is_valid` tells which.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Package {
    pub header: Header,
    pub payload: Bytes,
}

impl Package {
    pub fn new(command: Command, payload: impl Into<Bytes>) -> Package {
        let payload = payload.into();
        let header = Header {
            command: command.as_u16(),
            header_version: HEADER_VERSION,
            size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
            hash: recompute_hash(&payload, command.as_u16()),
            trigger_hash: 0,
        };
        Package { header, payload }
    }

    /// Builds a package carrying `message`, answering `trigger` when given.
    pub fn from_message<M: Message>(message: &M, trigger: Option<&Header>) -> AppResult<Package> {
        let mut payload = BytesMut::new();
        message.encode(&mut payload)?;
        let package = Package::new(message.command(), payload.freeze());
        Ok(match trigger {
            Some(request) => package.with_trigger(request.hash),
            None => package,
        })
    }

    pub fn with_trigger(mut self, trigger_hash: u32) -> Package {
        self.header.trigger_hash = trigger_hash;
        self
    }

    pub fn command(&self) -> Command {
        Command::from(self.header.command)
    }

    pub fn hash(&self) -> u32 {
        self.header.hash
    }

    pub fn reset(&mut self) {
        self.header.reset();
        self.payload = Bytes::new();
    }

    pub fn check(&self, accept_legacy_hash: bool) -> Result<(), HeaderFault> {
        self.header.check()?;
        if self.payload.len() != self.header.size as usize {
            return Err(HeaderFault::SizeMismatch(self.header.size));
        }
        let hash = recompute_hash(&self.payload, self.header.command);
        if hash == self.header.hash {
            return Ok(());
        }
        if accept_legacy_hash && legacy_hash(&self.payload) == self.header.hash {
            return Ok(());
        }
        Err(HeaderFault::HashMismatch)
    }

    pub fn is_valid(&self) -> bool {
        self.check(false).is_ok()
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn write_to(&self, buffer: &mut BytesMut) {
        buffer.reserve(self.encoded_len());
        self.header.write_to(buffer);
        buffer.extend_from_slice(&self.payload);
    }

    pub fn serialize(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buffer);
        buffer.freeze()
    }

    /// Inverse of `serialize`.
    ///
    /// Yields an empty package when `bytes` is shorter than a header. The
    /// payload is cut at the declared size, or at the end of `bytes` if it is
    /// shorter, so a lying header produces an invalid package and never a
    /// large allocation.
    pub fn deserialize(bytes: &[u8]) -> Package {
        let Some(header) = Header::read_from(bytes) else {
            return Package::default();
        };
        let body = &bytes[HEADER_SIZE..];
        let take = body.len().min(header.size as usize);
        Package {
            header,
            payload: Bytes::copy_from_slice(&body[..take]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::MAXIMUM_PACKAGE_SIZE;
    use crate::protocol::{BadRequest, Command};

    #[test]
    fn serialize_then_deserialize_restores_package() {
        let package = Package::new(Command::from(300), &b"hello world"[..]).with_trigger(42);
        assert!(package.is_valid());

        let bytes = package.serialize();
        assert_eq!(bytes.len(), HEADER_SIZE + 11);

        let decoded = Package::deserialize(&bytes);
        assert_eq!(decoded, package);
        assert!(decoded.is_valid());
        assert_eq!(decoded.header.trigger_hash, 42);
    }

    #[test]
    fn empty_payload_round_trip() {
        let package = Package::new(Command::PING, Bytes::new());
        let decoded = Package::deserialize(&package.serialize());
        assert!(decoded.is_valid());
        assert_eq!(decoded.header.size, 0);
    }

    #[test]
    fn flipping_any_payload_bit_invalidates() {
        let package = Package::new(Command::from(512), &b"\x00\x01\x02\x03"[..]);
        let bytes = package.serialize();
        for index in HEADER_SIZE..bytes.len() {
            for bit in 0..8 {
                let mut corrupted = bytes.to_vec();
                corrupted[index] ^= 1 << bit;
                assert!(
                    !Package::deserialize(&corrupted).is_valid(),
                    "bit {} of byte {} went unnoticed",
                    bit,
                    index
                );
            }
        }
    }

    #[test]
    fn short_input_yields_empty_package() {
        let package = Package::deserialize(&[1u8; HEADER_SIZE - 1]);
        assert_eq!(package, Package::default());
        assert!(!package.is_valid());
    }

    #[test]
    fn truncated_payload_is_invalid() {
        let package = Package::new(Command::from(300), &b"0123456789"[..]);
        let bytes = package.serialize();
        let decoded = Package::deserialize(&bytes[..bytes.len() - 1]);
        assert_eq!(decoded.check(false), Err(HeaderFault::SizeMismatch(10)));
    }

    #[test]
    fn oversized_payload_is_invalid() {
        let package = Package::new(
            Command::from(300),
            vec![0u8; MAXIMUM_PACKAGE_SIZE as usize + 1],
        );
        assert_eq!(
            package.check(false),
            Err(HeaderFault::Oversized(MAXIMUM_PACKAGE_SIZE + 1))
        );
    }

    #[test]
    fn legacy_hash_only_accepted_on_request() {
        let payload = Bytes::from_static(b"old generation");
        let mut package = Package::new(Command::from(300), payload.clone());
        package.header.hash = legacy_hash(&payload);

        assert_eq!(package.check(false), Err(HeaderFault::HashMismatch));
        assert_eq!(package.check(true), Ok(()));
    }

    #[test]
    fn reset_package_is_empty() {
        let mut package = Package::new(Command::PONG, &b"x"[..]);
        package.reset();
        assert_eq!(package, Package::default());
    }

    #[test]
    fn from_message_sets_trigger() {
        let request = Package::new(Command::from(300), &b"request"[..]);
        let error = BadRequest::new(1, "nope");
        let response = Package::from_message(&error, Some(&request.header)).unwrap();

        assert_eq!(response.command(), Command::BAD_REQUEST);
        assert_eq!(response.header.trigger_hash, request.hash());
        assert!(response.is_valid());
    }
}
