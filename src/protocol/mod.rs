//! Wire format of the node protocol.
//!
//! A package is a fixed 32-byte `Header` followed by `header.size` payload
//! bytes. The header carries a crc32c integrity code over the payload and the
//! command id, so a receiver detects both corruption and a dishonest `size`.
//! `StreamReassembler` rebuilds packages from an arbitrarily split byte
//! stream.

pub use command::Command;
pub use header::{
    legacy_hash, recompute_hash, Header, HeaderFault, HEADER_SIZE, HEADER_VERSION,
    MAXIMUM_PACKAGE_SIZE,
};
pub use message::{
    BadRequest, CloseConnection, ErrorCode, Message, Ping, Pong, VersionAck, VersionInfo,
    PROTOCOL_VERSION,
};
pub use package::Package;
pub use reassembler::{FrameError, StreamReassembler};

mod command;
mod header;
mod message;
mod package;
mod reassembler;
