pub mod api;
pub mod config;
pub mod dev_api;
pub mod encoding;
pub mod k8s;
pub mod telemetry;
pub mod updater;
pub mod uploader;

pub use api::{ApiClient, ApiError, VersioningService};
pub use config::{AgentConfig, DevApiConfig, RuntimeIdentity};
pub use k8s::{ClusterClient, K8sClient, K8sError};
pub use telemetry::{LogSink, init_tracing};
pub use updater::{BootstrapError, Updater};
pub use uploader::LogUploader;

use tracing::{debug, warn};

/// Selects aws-lc-rs as the process-wide rustls provider before any TLS
/// client is built.
pub fn install_crypto_provider() {
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::aws_lc_rs::default_provider(),
    ) {
        debug!(?e, "CryptoProvider already installed; proceeding");
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
