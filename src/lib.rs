//! Peer networking engine.
//!
//! Nodes exchange framed binary packages over TCP or TLS, track a trust score
//! per peer and hand every received package to a pool of workers.

pub mod node;
pub mod protocol;
pub mod service;
pub mod utils;

pub use node::{
    AddNodeError, ConnectionInfo, ConnectionStatus, NodeEngine, NodeEvent, NodeState,
    PackageParser, ParserResult, TlsMode, TrustLevel, TrustPenalty,
};
pub use protocol::{Command, Header, Message, Package, StreamReassembler};
pub use service::{setup_local_tracing, setup_tracing, AppError, AppResult, NodeConfig, Shutdown};
pub use utils::{AsyncExecutor, DispatchOrder};
