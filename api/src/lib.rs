//! Local HTTP control surface for the minus daemon.
//!
//! The daemon implements [`ControlSurface`]; this crate owns the routes and
//! the tokio runtime that serves them, so the rest of the daemon stays on
//! plain threads.

pub mod constants;
pub mod dto;
pub mod error;
pub mod routes;
pub mod surface;

use axum::Router;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;

pub use dto::*;
pub use error::ControlError;
pub use surface::ControlSurface;

pub struct AppState {
    pub control: Arc<dyn ControlSurface>,
}

pub fn router(control: Arc<dyn ControlSurface>) -> Router {
    let state = Arc::new(AppState { control });
    routes::build_routes()
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Running server. Dropping it stops the server.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("Control API thread panicked");
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bind `addr` and serve the control API on a background thread.
///
/// Bind errors are returned here rather than logged from the thread.
pub fn spawn(addr: SocketAddr, control: Arc<dyn ControlSurface>) -> io::Result<ServerHandle> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("minus-api-worker")
        .enable_all()
        .build()?;

    let listener = runtime.block_on(tokio::net::TcpListener::bind(addr))?;
    let local_addr = listener.local_addr()?;
    let app = router(control);
    let (tx, rx) = oneshot::channel::<()>();

    let thread = thread::Builder::new()
        .name("minus-api".into())
        .spawn(move || {
            let result = runtime.block_on(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = rx.await;
                    })
                    .await
            });
            if let Err(e) = result {
                log::error!("Control API server failed: {}", e);
            }
            log::info!("Control API stopped");
        })?;

    log::info!("Control API listening on http://{}", local_addr);
    Ok(ServerHandle {
        addr: local_addr,
        shutdown: Some(tx),
        thread: Some(thread),
    })
}
