//! HTTP server lifecycle.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::handler::{self, Bundler};

/// Serves `bundler` on `listener` until `shutdown` resolves.
///
/// In-flight bundles are allowed to finish before this returns.
pub async fn serve<F>(bundler: Arc<Bundler>, listener: TcpListener, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, upstream = %bundler.config().upstream, "listening");
    }
    let app = handler::router(bundler).layer(TraceLayer::new_for_http());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
