use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};
use updater_core::{
    CombinedError, ConfigError, EnvReader, ErrorList, ProcessEnv, ResolveError, SecretMap,
    UpdaterConfig, resolve_metadata_vars, resolve_startup_vars, secret_refs,
};

use crate::api::{ApiError, VersioningService};
use crate::k8s::{ClusterClient, K8sError};

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to resolve config variables: {0}")]
    Resolve(#[from] ResolveError),

    #[error("failed to read secret {namespace}/{name}: {source}")]
    Secret {
        namespace: String,
        name: String,
        #[source]
        source: K8sError,
    },

    #[error("failed to construct API client: {0}")]
    ApiClient(#[source] ApiError),

    #[error("failed to fetch metadata, err: {0}")]
    Metadata(#[source] ApiError),
}

/// Keeps the configured workloads on the tags published by the API.
pub struct Updater {
    config: UpdaterConfig,
    api: Arc<dyn VersioningService>,
    cluster: Arc<dyn ClusterClient>,
}

impl Updater {
    pub async fn bootstrap<F>(
        config: UpdaterConfig,
        cluster: Arc<dyn ClusterClient>,
        api_factory: F,
    ) -> Result<Self, BootstrapError>
    where
        F: FnOnce(&UpdaterConfig) -> Result<Arc<dyn VersioningService>, ApiError>,
    {
        Self::bootstrap_with_env(config, cluster, api_factory, &ProcessEnv).await
    }

    /// Validates and resolves `config`, then builds the API client.
    ///
    /// Entities are checked before any secret is read and once more after
    /// resolution. Metadata is fetched only when its endpoint is configured.
    pub async fn bootstrap_with_env<F>(
        mut config: UpdaterConfig,
        cluster: Arc<dyn ClusterClient>,
        api_factory: F,
        env: &(dyn EnvReader + Sync),
    ) -> Result<Self, BootstrapError>
    where
        F: FnOnce(&UpdaterConfig) -> Result<Arc<dyn VersioningService>, ApiError>,
    {
        config.validate_entities()?;

        let mut secrets = SecretMap::new();
        for secret in secret_refs(&config)? {
            let value = cluster
                .get_secret(&secret.namespace, &secret.name)
                .await
                .map_err(|source| BootstrapError::Secret {
                    namespace: secret.namespace.clone(),
                    name: secret.name.clone(),
                    source,
                })?;
            secrets.insert(secret, value);
        }
        resolve_startup_vars(&mut config, &secrets, env)?;
        config.validate_entities()?;

        let api = api_factory(&config).map_err(BootstrapError::ApiClient)?;
        let metadata = if config.api.metadata.is_some() {
            api.get_metadata().await.map_err(BootstrapError::Metadata)?
        } else {
            BTreeMap::new()
        };
        resolve_metadata_vars(&mut config, &metadata)?;

        Ok(Self {
            config,
            api,
            cluster,
        })
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn log_uploader_enabled(&self) -> bool {
        self.config.log_uploader_enabled()
    }

    /// Fetched metadata overlaid with the resolved custom tags.
    pub fn log_custom_tags(&self) -> BTreeMap<String, String> {
        let mut tags = self.config.metadata.clone();
        tags.extend(self.config.custom_tags());
        tags
    }

    /// One pass over every entity. Failures are collected and returned
    /// together once all entities were tried.
    pub async fn run(&self) -> Result<(), CombinedError> {
        self.log_running_config();
        let mut errors = ErrorList::new();
        for entity in &self.config.entities {
            let latest = match self.api.get_latest_applicable_tag(entity).await {
                Ok(latest) => latest,
                Err(e) => {
                    errors.push_err(
                        format!(
                            "failed to get latest applicable tag from API for entity with ID {}",
                            entity.id
                        ),
                        e,
                    );
                    continue;
                }
            };
            info!(
                entity = %entity.id, tag = %latest.tag, image = %latest.image, url = %latest.url,
                "latest applicable tag from API"
            );
            for path in &entity.k8s_paths {
                if let Err(e) = self.cluster.set_resource_key_value(path, &latest.url).await {
                    errors.push_err(
                        format!(
                            "failed to set K8s resource spec key/value for entity with ID {} \
                             (path: {}, value: {})",
                            entity.id, path, latest.url
                        ),
                        e,
                    );
                }
            }
        }
        errors.into_result()
    }

    fn log_running_config(&self) {
        let entities: Vec<String> = self
            .config
            .entities
            .iter()
            .map(|e| format!("{}:{}", e.image_name, e.id))
            .collect();
        let api = &self.config.api;
        match api.log_upload.as_ref().filter(|u| u.enabled) {
            Some(upload) => debug!(
                entities = %entities.join(", "),
                base_url = %api.base_url,
                latest_tag_endpoint = %api.latest_tag.endpoint,
                presigned_url_endpoint = %upload.presigned_upload_url.endpoint,
                encoding = %upload.encoding.kind,
                compression = %upload.compression,
                "updater is running, log uploader is enabled"
            ),
            None => debug!(
                entities = %entities.join(", "),
                base_url = %api.base_url,
                latest_tag_endpoint = %api.latest_tag.endpoint,
                "updater is running, log uploader is disabled"
            ),
        }
    }
}
