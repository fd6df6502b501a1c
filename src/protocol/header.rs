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

//! Fixed-size package header.
//!
//! ```text
//! offset  size  field
//! 0       2     command        (u16, little-endian)
//! 2       1     header_version (u8, always HEADER_VERSION)
//! 3       4     size           (u32, payload length in bytes)
//! 7       4     hash           (u32, crc32c over payload ++ decimal(command))
//! 11      4     trigger_hash   (u32, hash of the request being answered, 0 if none)
//! 15      17    reserved       (zero on write, ignored on read)
//! ```

use std::fmt::{Display, Formatter};

use bytes::{Buf, BufMut, BytesMut};

pub const HEADER_SIZE: usize = 32;
pub const HEADER_VERSION: u8 = 1;
pub const RESERVED_SIZE: usize = 17;
/// Upper bound for `Header::size`, 1 MiB.
pub const MAXIMUM_PACKAGE_SIZE: u32 = 1024 * 1024;

const _: () = assert!(2 + 1 + 4 + 4 + 4 + RESERVED_SIZE == HEADER_SIZE);

/// Why a header (or the package it describes) was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderFault {
    #[error("unsupported header version {0}")]
    Version(u8),
    #[error("command id is zero")]
    ZeroCommand,
    #[error("hash is zero")]
    ZeroHash,
    #[error("declared size {0} exceeds the maximum package size")]
    Oversized(u32),
    #[error("payload length does not match declared size {0}")]
    SizeMismatch(u32),
    #[error("hash mismatch")]
    HashMismatch,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header {
    pub command: u16,
    pub header_version: u8,
    pub size: u32,
    pub hash: u32,
    pub trigger_hash: u32,
}

impl Header {
    /// Zeroes every field; a reset header is never valid.
    pub fn reset(&mut self) {
        *self = Header::default();
    }

    pub fn check(&self) -> Result<(), HeaderFault> {
        if self.header_version != HEADER_VERSION {
            return Err(HeaderFault::Version(self.header_version));
        }
        if self.command == 0 {
            return Err(HeaderFault::ZeroCommand);
        }
        if self.hash == 0 {
            return Err(HeaderFault::ZeroHash);
        }
        if self.size > MAXIMUM_PACKAGE_SIZE {
            return Err(HeaderFault::Oversized(self.size));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.check().is_ok()
    }

    pub fn write_to(&self, buffer: &mut BytesMut) {
        buffer.reserve(HEADER_SIZE);
        buffer.put_u16_le(self.command);
        buffer.put_u8(self.header_version);
        buffer.put_u32_le(self.size);
        buffer.put_u32_le(self.hash);
        buffer.put_u32_le(self.trigger_hash);
        buffer.put_bytes(0, RESERVED_SIZE);
    }

    /// Reads a header from the front of `bytes`.
    ///
    /// Returns `None` when fewer than `HEADER_SIZE` bytes are supplied.
    pub fn read_from(bytes: &[u8]) -> Option<Header> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        let mut cursor = &bytes[..HEADER_SIZE];
        let header = Header {
            command: cursor.get_u16_le(),
            header_version: cursor.get_u8(),
            size: cursor.get_u32_le(),
            hash: cursor.get_u32_le(),
            trigger_hash: cursor.get_u32_le(),
        };
        Some(header)
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Header")
            .field("command", &self.command)
            .field("size", &self.size)
            .field("hash", &format_args!("{:#010x}", self.hash))
            .field("trigger_hash", &format_args!("{:#010x}", self.trigger_hash))
            .finish()
    }
}

/// Integrity code of a package: crc32c over the payload followed by the
/// decimal text of the command id.
pub fn recompute_hash(payload: &[u8], command: u16) -> u32 {
    let mut digits = [0u8; 5];
    let text = decimal(command, &mut digits);
    crc32c::crc32c_append(crc32c::crc32c(payload), text)
}

/// Hash used by the previous protocol generation: payload only.
pub fn legacy_hash(payload: &[u8]) -> u32 {
    crc32c::crc32c(payload)
}

fn decimal(mut value: u16, digits: &mut [u8; 5]) -> &[u8] {
    let mut start = digits.len();
    loop {
        start -= 1;
        digits[start] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    &digits[start..]
}
