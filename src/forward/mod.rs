//! Handoff of a ready dev server to the host's HTTP layer.
//!
//! Once a dev server is ready, the host routes every request it does not
//! handle itself to the dev server. This module provides:
//!
//! - [`ForwardedDevServer`], the value describing where to forward
//! - [`RouteRegistrar`], the registration point implemented by the host router
//! - [`DevServerProxy`] and [`forward_request`], an actix-web default service
//!   doing the forwarding over HTTP, with WebSocket upgrades tunnelled when
//!   the target allows them
//!
//! # Example
//!
//! ```no_run
//! use actix_web::{App, HttpServer, web};
//! use devserver_runner::forward::{DevServerProxy, forward_request};
//! use devserver_runner::{DevServerConfig, DevServerManager};
//!
//! #[actix_web::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = DevServerManager::new("webui")?;
//!     let proxy = web::Data::new(DevServerProxy::new()?);
//!
//!     let config = DevServerConfig::from_file("devserver.yaml")?;
//!     manager.forward(&config, proxy.clone().into_inner()).await?;
//!
//!     let data = proxy.clone();
//!     HttpServer::new(move || {
//!         App::new()
//!             .app_data(data.clone())
//!             .route("/api/health", web::get().to(|| async { "ok" }))
//!             .default_service(web::to(forward_request))
//!     })
//!     .bind(("127.0.0.1", 8080))?
//!     .run()
//!     .await?;
//!
//!     manager.release().await;
//!     Ok(())
//! }
//! ```

pub mod actix_error;
pub mod handler;

pub use handler::{DevServerProxy, forward_request};

use crate::error::Result;
use crate::server::ResolvedAddress;
use async_trait::async_trait;

/// Where unmatched requests go once a dev server is ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedDevServer {
    /// Address the dev server answered on
    pub endpoint: ResolvedAddress,
    /// Whether WebSocket upgrades should be forwarded too
    pub websocket: bool,
}

impl ForwardedDevServer {
    /// Create a forwarding target
    pub fn new(endpoint: ResolvedAddress, websocket: bool) -> Self {
        Self { endpoint, websocket }
    }

    /// Port requests are forwarded to
    pub fn port(&self) -> u16 {
        self.endpoint.port
    }
}

/// Installs forwarding on the host's router.
///
/// Implemented by whatever owns the host application's routing table.
/// [`DevServerManager::forward`](crate::DevServerManager::forward) calls
/// [`RouteRegistrar::install`] once the dev server is ready.
#[async_trait]
pub trait RouteRegistrar: Send + Sync {
    /// Route unmatched requests to `target`
    async fn install(&self, target: &ForwardedDevServer) -> Result<()>;

    /// Stop forwarding
    async fn uninstall(&self) -> Result<()>;
}
