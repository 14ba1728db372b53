use envconfig::Envconfig;
use tokio::net::TcpListener;
use tracing::info;
use updater_agent::{DevApiConfig, LogSink, dev_api, init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info", false, LogSink::detached());
    let conf = DevApiConfig::init_from_env()?;
    let listener = TcpListener::bind(format!("0.0.0.0:{}", conf.http_port)).await?;
    info!("start server on port {:?}", conf.http_port);
    axum::serve(listener, dev_api::router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
