use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use envconfig::Envconfig;
use tracing::{Instrument, error, info, warn};
use updater_agent::{
    AgentConfig, ApiClient, K8sClient, LogSink, LogUploader, Updater, VersioningService,
    init_tracing, install_crypto_provider, shutdown_signal,
};
use updater_core::UpdaterConfig;

const SELF_LOG_UPLOADER: &str = "self_log_uploader";

#[derive(Parser, Debug)]
#[command(name = "agent-updater", about = "Keeps agent workloads on the latest applicable tag")]
struct Cli {
    /// Local config path
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let agent = AgentConfig::init_from_env()?;
    let sink = LogSink::detached();
    init_tracing("info", agent.json_logs(), sink.clone());
    install_crypto_provider();

    let span = agent.identity().span();
    let result = run(cli, agent, sink).instrument(span).await;
    if let Err(e) = &result {
        error!(error = ?e, "agent updater failed");
    }
    result
}

async fn run(cli: Cli, agent: AgentConfig, sink: LogSink) -> anyhow::Result<()> {
    let config = UpdaterConfig::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    let cluster = Arc::new(K8sClient::try_default().await?);
    let timeout = agent.http_timeout();
    let updater = Updater::bootstrap(config, cluster, |cfg| {
        Ok(Arc::new(ApiClient::new(&cfg.api, timeout)?) as Arc<dyn VersioningService>)
    })
    .await
    .context("failed to construct updater")?;

    let uploader = if updater.log_uploader_enabled() {
        // The uploader has its own runtime and needs its own connection pool.
        let api = ApiClient::new(&updater.config().api, timeout)
            .context("failed to construct log uploader API client")?;
        let uploader = LogUploader::new(
            SELF_LOG_UPLOADER,
            Arc::new(api),
            updater.log_custom_tags(),
            agent.log_queue_size,
            agent.log_flush_interval(),
        );
        sink.attach(uploader.sender());
        uploader.run();
        Some(uploader)
    } else {
        None
    };

    tokio::select! {
        outcome = updater.run() => {
            if let Err(e) = outcome {
                error!(error = %e, "runtime error");
            }
        }
        _ = shutdown_signal() => warn!("interrupted, shutting down"),
    }

    shutdown(uploader, &sink, agent.shutdown_grace()).await;
    Ok(())
}

async fn shutdown(uploader: Option<LogUploader>, sink: &LogSink, grace: Duration) {
    let Some(uploader) = uploader else {
        info!("log uploader is not running, exiting");
        return;
    };
    // Detach first so nothing is queued behind the final flush.
    sink.detach();
    let Some(worker) = uploader.stop() else {
        return;
    };
    info!(grace_secs = grace.as_secs(), "shutdown period started");
    match tokio::time::timeout(grace, worker).await {
        Ok(_) => info!(uploader = uploader.name(), "log uploader stopped"),
        Err(_) => warn!(
            uploader = uploader.name(),
            grace_secs = grace.as_secs(),
            "could not stop log uploader within the graceful shutdown period"
        ),
    }
}
