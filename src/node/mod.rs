//! Connections, trust bookkeeping and the `NodeEngine` that ties them to the
//! wire format.

pub use connection::{
    BoxedWriter, ConnectionInfo, ConnectionState, ConnectionStatus, TrustChange, TrustLevel,
    TrustPenalty,
};
pub use engine::{NodeEngine, NodeState};
pub use events::{AddNodeError, NodeEvent};
pub use parser::{CoreParser, PackageParser, ParserRegistry, ParserResult};
pub use registry::ConnectionRegistry;
pub use tls::{
    generate_self_signed, provider_for, server_name, CertificateBundle, CertificateRequest,
    FileTlsProvider, SelfSignedProvider, TlsMode, TlsProvider,
};

mod connection;
mod engine;
mod events;
mod parser;
mod registry;
mod tls;
