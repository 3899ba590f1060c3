use std::sync::Arc;

use inkmesh_server::{AppState, ServerConfig, ServerError};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inkmesh_server=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    let addr = listener.local_addr()?;
    info!("InkMesh server listening on {}", addr);
    info!("Relay endpoint: ws://{}/ws", addr);
    info!("Rendezvous endpoint: ws://{}/signal", addr);

    let state = Arc::new(AppState::new(&config));
    inkmesh_server::serve(listener, state).await
}
