use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use envconfig::Envconfig;
use tracing::{Instrument, error};
use updater_agent::{
    AgentConfig, ApiClient, K8sClient, LogSink, Updater, VersioningService, init_tracing,
    install_crypto_provider,
};
use updater_core::UpdaterConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let agent = match AgentConfig::init_from_env() {
        Ok(agent) => agent,
        Err(e) => {
            eprintln!("invalid environment: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing("info", agent.json_logs(), LogSink::detached());
    install_crypto_provider();

    let span = agent.identity().span();
    match run(agent).instrument(span).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "updater failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(agent: AgentConfig) -> anyhow::Result<()> {
    let data_path = agent
        .ko_data_path
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| anyhow::anyhow!("KO_DATA_PATH is not set"))?;
    let config = UpdaterConfig::load(Path::new(data_path).join("config.yml"))?;
    let cluster = Arc::new(K8sClient::try_default().await?);
    let timeout = agent.http_timeout();
    let updater = Updater::bootstrap(config, cluster, |cfg| {
        Ok(Arc::new(ApiClient::new(&cfg.api, timeout)?) as Arc<dyn VersioningService>)
    })
    .await
    .map_err(|e| anyhow::anyhow!("failed to construct new updater, err: {e}"))?;
    updater
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("runtime error occurred, err:\n{e}"))
}
