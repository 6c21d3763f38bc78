/*!
 # devserver-runner

 A Rust library for running a front-end dev server next to a host application.

 ## Overview

 devserver-runner provides functionality to:
 - Start the dev server process and stop it (SIGTERM, then kill after a grace period)
 - Poll the dev server until it answers on its port or health-check path
 - Coalesce bursts of dev server output into single log events
 - Reuse a running dev server when the configuration did not change
 - Adopt a dev server started by someone else ("unmanaged")
 - Forward the host's unmatched HTTP requests to the dev server

 ## Basic Usage

 ```no_run
 use devserver_runner::{DevServerConfig, DevServerManager, Result};

 #[tokio::main]
 async fn main() -> Result<()> {
     // Load the dev server configuration
     let config = DevServerConfig::from_file("devserver.yaml")?;

     // Start the dev server, or reuse the one already running
     let manager = DevServerManager::new("webui")?;
     let endpoint = manager.acquire(&config).await?;
     println!("Dev server answering on {}", endpoint);

     // Describe it to the host
     for (key, value) in manager.properties().unwrap_or_default() {
         println!("{} = {}", key, value);
     }

     // Tear it down
     manager.release().await;

     Ok(())
 }
 ```

 ## Features

 - **Process Supervision**: Spawn, terminate and observe the dev server process
 - **Readiness Polling**: TCP or HTTP checks with loopback fallbacks and a bounded wait
 - **Log Debouncing**: 200ms quiet window, ANSI codes stripped
 - **Configuration**: JSON or YAML files
 - **Forwarding**: Actix Web default service proxying to the dev server
 - **Async Support**: Full async/await support on tokio

 ## License

 This project is licensed under the terms in the LICENSE file.
*/

pub mod config;
pub mod error;
pub mod forward;
pub mod logs;
pub mod manager;
pub mod server;

pub use config::DevServerConfig;
pub use error::{Error, Result};
pub use forward::{ForwardedDevServer, RouteRegistrar};
pub use manager::{DevServerInstance, DevServerManager};
pub use server::{DevServerState, ResolvedAddress};
