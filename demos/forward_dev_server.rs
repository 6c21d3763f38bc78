use actix_web::{App, HttpResponse, HttpServer, web};
use devserver_runner::forward::{DevServerProxy, forward_request};
use devserver_runner::{DevServerConfig, DevServerManager};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG=info shows the coalesced dev server output.
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "demos/devserver.yaml".to_string());
    let config = DevServerConfig::from_file(&config_path)?;
    tracing::info!(config = %config_path, "Starting forward_dev_server demo");

    let manager = DevServerManager::new("demo")?;
    let proxy = web::Data::new(DevServerProxy::new()?);

    let target = manager.forward(&config, proxy.clone().into_inner()).await?;
    println!("Dev server ready on {}", target.endpoint);
    for (key, value) in manager.properties().unwrap_or_default() {
        println!("  {} = {}", key, value);
    }

    let data = proxy.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/api/hello", web::get().to(|| async { HttpResponse::Ok().body("hello from the host") }))
            .default_service(web::to(forward_request))
    })
    .bind(("127.0.0.1", 8080))?
    .run();
    let handle = server.handle();
    let server_task = tokio::spawn(server);

    println!("Host listening on http://127.0.0.1:8080, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    handle.stop(true).await;
    if let Err(e) = server_task.await {
        tracing::error!(error = %e, "Host server task error");
    }

    // Also uninstalls the forwarding
    manager.release().await;
    println!("Dev server stopped");

    Ok(())
}
