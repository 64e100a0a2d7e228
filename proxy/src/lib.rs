mod dispatcher;
mod service;
mod yaml_envelope;

pub use dispatcher::QueryProcessor;
pub use service::ProxyService;

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Accept loop: one listener, one spawned task per connection. Runs until
/// the listener fails.
pub async fn run(
    host: &str,
    port: u16,
    processor: Arc<QueryProcessor>,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!("Listening to GET requests on {host}:{port}");

    loop {
        let (stream, _peer_addr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let service = ProxyService::new(processor.clone());

        // Hand the connection to hyper; auto-detect h1/h2 on this socket
        tokio::spawn(async move {
            let _ = Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await;
        });
    }
}
