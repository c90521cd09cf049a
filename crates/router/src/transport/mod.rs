//! Backend transports.
//!
//! Every transport speaks JSON-RPC 2.0 and implements [`BackendTransport`];
//! [`connect`] picks the adapter for a backend descriptor.

pub mod http;
pub mod line;
pub mod pipe;
pub mod rpc;
pub mod stream;

use std::sync::Arc;

use gov_bridge_core::{BackendSpec, BackendTransport, Result, TransportSpec};

pub use http::HttpTransport;
pub use line::LineConnection;
pub use pipe::PipeTransport;
pub use stream::StreamTransport;

/// Open a connection for `spec` and complete the protocol handshake.
pub async fn connect(spec: &BackendSpec) -> Result<Arc<dyn BackendTransport>> {
    spec.transport.validate()?;
    let transport: Arc<dyn BackendTransport> = match &spec.transport {
        TransportSpec::Pipe { command, args, env } => {
            Arc::new(PipeTransport::spawn(&spec.id, command, args, env).await?)
        }
        TransportSpec::Http { url, headers } => {
            Arc::new(HttpTransport::connect(&spec.id, url, headers).await?)
        }
        TransportSpec::Stream { address } => {
            Arc::new(StreamTransport::connect(&spec.id, address).await?)
        }
    };
    Ok(transport)
}
