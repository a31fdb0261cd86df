//! Local agent
//!
//! Accepts SOCKS5 clients, negotiates the no-auth method and a domain-name CONNECT,
//! then carries each application connection through its own tunnel connection to the
//! remote agent.

pub mod config;
pub mod server;
pub mod socks5;
pub mod tunnel;

pub use config::{ConfigError, LocalConfig};
pub use server::{LocalOptions, LocalServer, SessionState};

use sockstun_proto::ClientMessage;
use sockstun_transport::{bind_listener, delivery_channel, CompressionPool, Reactor, TransportResult};
use tokio::net::TcpListener;
use tracing::info_span;

/// Reactor running the local agent on `listener`
pub fn build(listener: TcpListener, options: LocalOptions) -> TransportResult<Reactor<LocalServer<CompressionPool<ClientMessage>>>> {
    let (deliveries_tx, deliveries_rx) = delivery_channel();
    let pool = CompressionPool::new(options.send_threads, deliveries_tx)?;
    let remote = options.remote_addr;
    let server = LocalServer::new(options, pool);

    Ok(Reactor::new(listener, server, deliveries_rx).with_span(info_span!("local", %remote)))
}

/// Bind the SOCKS5 listener and run the local agent
pub async fn serve(options: LocalOptions) -> TransportResult<()> {
    let listener = bind_listener(options.listen_addr).await?;
    build(listener, options)?.run().await
}
