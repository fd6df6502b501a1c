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

//! Turns the byte stream of one connection into packages.
//!
//! Reads may split a package anywhere: inside the header, between header and
//! payload, inside the payload, or pack several packages into one read. The
//! reassembler keeps two pieces of state between reads:
//!
//! - the package being assembled (a header already parsed plus the payload
//!   bytes received so far)
//! - fewer than `HEADER_SIZE` leftover bytes that will be prefixed to the
//!   next read
//!
//! Malformed input never produces an `Err` for the caller to propagate: it is
//! reported as a `FrameError` item so the node can penalise the sender.

use bytes::{Bytes, BytesMut};

use super::header::{Header, HeaderFault, HEADER_SIZE};
use super::Package;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed package ({fault}): {header}")]
pub struct FrameError {
    pub header: Header,
    pub fault: HeaderFault,
}

#[derive(Debug)]
struct PartialPackage {
    header: Header,
    payload: BytesMut,
}

impl PartialPackage {
    fn missing(&self) -> usize {
        self.header.size as usize - self.payload.len()
    }
}

#[derive(Debug, Default)]
pub struct StreamReassembler {
    partial: Option<PartialPackage>,
    header_carry: BytesMut,
    accept_legacy_hash: bool,
}

impl StreamReassembler {
    pub fn new(accept_legacy_hash: bool) -> Self {
        StreamReassembler {
            partial: None,
            header_carry: BytesMut::with_capacity(HEADER_SIZE),
            accept_legacy_hash,
        }
    }

    /// Consumes one read worth of bytes and returns every package completed
    /// by it, in stream order.
    pub fn feed(&mut self, new_bytes: &[u8]) -> Vec<Result<Package, FrameError>> {
        let mut completed = Vec::new();
        if new_bytes.is_empty() {
            return completed;
        }

        let joined: BytesMut;
        let mut cursor: &[u8] = if self.header_carry.is_empty() {
            new_bytes
        } else {
            self.header_carry.extend_from_slice(new_bytes);
            joined = self.header_carry.split();
            &joined
        };

        while !cursor.is_empty() {
            if let Some(partial) = self.partial.as_mut().filter(|p| p.missing() > 0) {
                let take = partial.missing().min(cursor.len());
                partial.payload.extend_from_slice(&cursor[..take]);
                cursor = &cursor[take..];
            } else if cursor.len() < HEADER_SIZE {
                self.header_carry.extend_from_slice(cursor);
                break;
            } else {
                self.partial = None;
                let Some(header) = Header::read_from(cursor) else {
                    break;
                };
                cursor = &cursor[HEADER_SIZE..];
                if let Err(fault) = header.check() {
                    // nothing of the declared payload is buffered
                    completed.push(Err(FrameError { header, fault }));
                    continue;
                }
                // sized by the bytes in hand; the declared size is untrusted
                let take = (header.size as usize).min(cursor.len());
                let payload = BytesMut::from(&cursor[..take]);
                cursor = &cursor[take..];
                self.partial = Some(PartialPackage { header, payload });
            }
            self.take_completed(&mut completed);
        }
        completed
    }

    fn take_completed(&mut self, completed: &mut Vec<Result<Package, FrameError>>) {
        if !matches!(&self.partial, Some(partial) if partial.missing() == 0) {
            return;
        }
        let Some(PartialPackage { header, payload }) = self.partial.take() else {
            return;
        };
        let package = Package {
            header,
            payload: Bytes::from(payload),
        };
        match package.check(self.accept_legacy_hash) {
            Ok(()) => completed.push(Ok(package)),
            Err(fault) => completed.push(Err(FrameError { header, fault })),
        }
    }

    /// Bytes held back between reads: header leftovers plus the payload of
    /// the package in progress.
    pub fn pending_bytes(&self) -> usize {
        self.header_carry.len()
            + self
                .partial
                .as_ref()
                .map_or(0, |partial| HEADER_SIZE + partial.payload.len())
    }

    pub fn is_idle(&self) -> bool {
        self.partial.is_none() && self.header_carry.is_empty()
    }

    pub fn reset(&mut self) {
        self.partial = None;
        self.header_carry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::{recompute_hash, HEADER_VERSION, MAXIMUM_PACKAGE_SIZE};
    use crate::protocol::Command;
    use bytes::BufMut;
    use rand::{Rng, SeedableRng};

    fn package(command: u16, payload: &[u8]) -> Package {
        Package::new(Command::from(command), Bytes::copy_from_slice(payload))
    }

    fn valid(results: Vec<Result<Package, FrameError>>) -> Vec<Package> {
        results
            .into_iter()
            .map(|result| result.expect("unexpected frame error"))
            .collect()
    }

    #[test]
    fn zero_length_read_is_a_no_op() {
        let mut reassembler = StreamReassembler::default();
        assert!(reassembler.feed(&[]).is_empty());
        assert!(reassembler.is_idle());
    }

    #[test]
    fn header_only_package_completes_in_one_read() {
        let ping = package(Command::PING.as_u16(), b"");
        let mut reassembler = StreamReassembler::default();

        let bytes = ping.serialize();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(valid(reassembler.feed(&bytes)), vec![ping]);
        assert!(reassembler.is_idle());
    }

    #[test]
    fn every_split_point_yields_the_same_package() {
        let original = package(300, b"split me anywhere you like");
        let bytes = original.serialize();

        for split in 1..bytes.len() {
            let mut reassembler = StreamReassembler::default();
            let first = reassembler.feed(&bytes[..split]);
            assert!(first.is_empty(), "completed early at split {}", split);
            assert_eq!(valid(reassembler.feed(&bytes[split..])), vec![original.clone()]);
            assert!(reassembler.is_idle());
        }
    }

    #[test]
    fn random_chunking_yields_every_package_in_order() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x4ea7);
        let packages: Vec<Package> = (0..50)
            .map(|i| {
                let len = rng.gen_range(0..600);
                let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                package(256 + i, &payload)
            })
            .collect();
        let mut stream = BytesMut::new();
        for package in &packages {
            package.write_to(&mut stream);
        }

        let mut reassembler = StreamReassembler::default();
        let mut received = Vec::new();
        let mut offset = 0;
        while offset < stream.len() {
            let chunk = rng.gen_range(1..=97).min(stream.len() - offset);
            received.extend(valid(reassembler.feed(&stream[offset..offset + chunk])));
            offset += chunk;
        }

        assert_eq!(received, packages);
        assert!(reassembler.is_idle());
    }

    #[test]
    fn back_to_back_packages_in_one_read() {
        let first = package(300, b"first");
        let second = package(301, b"");
        let third = package(302, b"third one");
        let mut stream = BytesMut::new();
        first.write_to(&mut stream);
        second.write_to(&mut stream);
        third.write_to(&mut stream);

        let mut reassembler = StreamReassembler::default();
        assert_eq!(valid(reassembler.feed(&stream)), vec![first, second, third]);
    }

    #[test]
    fn header_leftover_is_carried_to_next_read() {
        let first = package(300, b"abc");
        let second = package(301, b"defgh");
        let mut stream = BytesMut::new();
        first.write_to(&mut stream);
        second.write_to(&mut stream);

        let cut = first.encoded_len() + 10;
        let mut reassembler = StreamReassembler::default();
        assert_eq!(valid(reassembler.feed(&stream[..cut])), vec![first]);
        assert_eq!(reassembler.pending_bytes(), 10);
        assert_eq!(valid(reassembler.feed(&stream[cut..])), vec![second]);
    }

    #[test]
    fn oversized_header_is_rejected_before_buffering() {
        let mut stream = BytesMut::new();
        Header {
            command: 300,
            header_version: HEADER_VERSION,
            size: MAXIMUM_PACKAGE_SIZE + 1,
            hash: 1,
            trigger_hash: 0,
        }
        .write_to(&mut stream);

        let mut reassembler = StreamReassembler::default();
        let results = reassembler.feed(&stream);
        assert_eq!(results.len(), 1);
        let error = results[0].clone().unwrap_err();
        assert_eq!(error.fault, HeaderFault::Oversized(MAXIMUM_PACKAGE_SIZE + 1));
        assert_eq!(reassembler.pending_bytes(), 0);
        assert!(reassembler.is_idle());
    }

    #[test]
    fn buffer_grows_with_received_bytes_not_declared_size() {
        let big = package(300, &vec![0x5a; MAXIMUM_PACKAGE_SIZE as usize]);
        let bytes = big.serialize();
        let mut reassembler = StreamReassembler::default();

        assert!(reassembler.feed(&bytes[..HEADER_SIZE + 16]).is_empty());
        let buffered = |reassembler: &StreamReassembler| {
            reassembler.partial.as_ref().map_or(0, |p| p.payload.capacity())
        };
        assert!(buffered(&reassembler) < 4 * 1024);

        assert!(reassembler
            .feed(&bytes[HEADER_SIZE + 16..HEADER_SIZE + 64 * 1024])
            .is_empty());
        assert!(buffered(&reassembler) < 256 * 1024);

        assert_eq!(valid(reassembler.feed(&bytes[HEADER_SIZE + 64 * 1024..])), vec![big]);
    }

    #[test]
    fn corrupted_payload_is_surfaced_not_dropped() {
        let good = package(300, b"payload");
        let mut corrupted = good.serialize().to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x01;
        let follow_up = package(301, b"still in sync");
        let mut stream = BytesMut::from(&corrupted[..]);
        follow_up.write_to(&mut stream);

        let mut reassembler = StreamReassembler::default();
        let mut results = reassembler.feed(&stream).into_iter();
        let error = results.next().unwrap().unwrap_err();
        assert_eq!(error.fault, HeaderFault::HashMismatch);
        assert_eq!(error.header, good.header);
        assert_eq!(results.next().unwrap().unwrap(), follow_up);
        assert!(results.next().is_none());
    }

    #[test]
    fn zero_command_header_is_reported() {
        let mut stream = BytesMut::new();
        stream.put_bytes(0, HEADER_SIZE);

        let mut reassembler = StreamReassembler::default();
        let results = reassembler.feed(&stream);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
        assert!(reassembler.is_idle());
    }

    #[test]
    fn legacy_hash_accepted_when_enabled() {
        let payload = b"legacy peer";
        let mut old = package(300, payload);
        old.header.hash = crate::protocol::header::legacy_hash(payload);
        assert_ne!(old.header.hash, recompute_hash(payload, 300));
        let bytes = old.serialize();

        assert!(StreamReassembler::new(false).feed(&bytes)[0].is_err());
        assert_eq!(valid(StreamReassembler::new(true).feed(&bytes)), vec![old]);
    }

    #[test]
    fn reset_discards_partial_state() {
        let bytes = package(300, b"never finished").serialize();
        let mut reassembler = StreamReassembler::default();
        assert!(reassembler.feed(&bytes[..HEADER_SIZE + 3]).is_empty());
        assert!(!reassembler.is_idle());

        reassembler.reset();
        assert!(reassembler.is_idle());
        assert_eq!(reassembler.pending_bytes(), 0);
    }
}
