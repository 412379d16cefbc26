pub mod env;
pub mod error;
pub mod handlers;
pub mod result;
pub mod router;

use std::net::SocketAddr;

use anyhow::Result;
pub use env::Env;
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::{error, info};

use crate::{blobber::BlobberApi, chain::ChainFacade};

/// Binds the streaming front-end and serves it until the env's token is
/// cancelled. In-flight requests finish first.
pub async fn run<B: BlobberApi, C: ChainFacade>(env: Env<B, C>, port: u16) -> Result<JoinHandle<()>> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    let cancel_token = env.cancel_token.clone();
    info!("API Server running @ http://{}", listener.local_addr()?);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router::new(env))
            .with_graceful_shutdown(cancel_token.cancelled_owned())
            .await
        {
            error!("API server failed: {}", e);
        }
        info!("Exited");
    }))
}
