//! The web module for handling the Axum API.
//! This file declares the other files in this directory as sub-modules.

pub mod api;
pub mod models;

use crate::printer::Printer;
use crate::shutdown::ShutdownToken;
use std::sync::Arc;

/// Serves the API on `address:port` until `token` is cancelled.
pub async fn serve(
    printer: Arc<Printer>,
    address: String,
    port: u16,
    token: ShutdownToken,
) -> Result<(), std::io::Error> {
    let app = api::create_router(printer);
    let listener = tokio::net::TcpListener::bind((address.as_str(), port)).await?;
    tracing::info!("Web API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}
