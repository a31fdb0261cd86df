//! Remote agent
//!
//! Accepts tunnel connections from local agents, checks each REQUEST, resolves the
//! requested host and relays data between the tunnel and the real destination.

pub mod config;
pub mod relay;
pub mod resolver;
pub mod server;

pub use config::{ConfigError, RemoteConfig};
pub use server::{RemoteOptions, RemoteServer, SessionState};

use sockstun_proto::ServerMessage;
use sockstun_transport::{bind_listener, delivery_channel, CompressionPool, Reactor, TransportResult};
use tokio::net::TcpListener;
use tracing::info_span;

/// Reactor running the remote agent on `listener`
pub fn build(
    listener: TcpListener,
    options: RemoteOptions,
) -> TransportResult<Reactor<RemoteServer<CompressionPool<ServerMessage>>>> {
    let (deliveries_tx, deliveries_rx) = delivery_channel();
    let pool = CompressionPool::new(options.send_threads, deliveries_tx)?;
    let server = RemoteServer::new(options, pool);

    Ok(Reactor::new(listener, server, deliveries_rx).with_span(info_span!("remote")))
}

/// Bind the tunnel listener and run the remote agent
pub async fn serve(options: RemoteOptions) -> TransportResult<()> {
    let listener = bind_listener(options.listen_addr).await?;
    build(listener, options)?.run().await
}
