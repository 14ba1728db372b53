use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resource_path::ResourcePath;
use crate::template::{ContextualTemplate, TemplateError, Vars};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("no entity is defined, need at least 1")]
    NoEntities,

    #[error("entity ID {0} is used at least twice")]
    DuplicateEntityId(String),
}

/// A configuration string that may still depend on request-scoped variables.
///
/// Values are read as `Plain`; startup resolution turns the ones carrying
/// `{{ .ctx.<key> }}` placeholders into `Deferred` templates.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum ConfigValue {
    Plain(String),
    Deferred(ContextualTemplate),
}

impl ConfigValue {
    pub fn evaluate(&self, vars: Option<&Vars>) -> Result<String, TemplateError> {
        match self {
            ConfigValue::Plain(value) => Ok(value.clone()),
            ConfigValue::Deferred(template) => template.evaluate(vars),
        }
    }
}

impl Default for ConfigValue {
    fn default() -> Self {
        ConfigValue::Plain(String::new())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::Plain(value)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Plain(value.to_string())
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Plain(value) => f.write_str(value),
            ConfigValue::Deferred(template) => write!(f, "{template}"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct UpdaterConfig {
    #[serde(default)]
    pub entities: Vec<EntityProperties>,
    pub api: ApiConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    /// Filled at startup from the metadata endpoint, never read from file.
    #[serde(skip)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct EntityProperties {
    pub id: String,
    #[serde(rename = "image", default)]
    pub image_name: String,
    #[serde(rename = "paths", default)]
    pub k8s_paths: Vec<ResourcePath>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ApiConfig {
    pub base_url: ConfigValue,
    pub latest_tag: EndpointConfig,
    #[serde(default)]
    pub metadata: Option<EndpointConfig>,
    #[serde(default)]
    pub log_upload: Option<LogUploadConfig>,
    #[serde(default)]
    pub auth: Option<ApiAuth>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct EndpointConfig {
    pub endpoint: ConfigValue,
    #[serde(default)]
    pub auth: Option<ApiAuth>,
    #[serde(default)]
    pub params: Option<ParamConf>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ApiAuth {
    pub header_key: String,
    pub header_value: ConfigValue,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ParamConf {
    #[serde(rename = "query", default)]
    pub query_params: BTreeMap<String, ConfigValue>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LogUploadConfig {
    #[serde(default)]
    pub enabled: bool,
    pub presigned_upload_url: EndpointConfig,
    #[serde(default = "default_upload_method")]
    pub method: String,
    #[serde(alias = "enconding", default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub compression: CompressionType,
    #[serde(default)]
    pub auth: Option<ApiAuth>,
    #[serde(default)]
    pub params: Option<ParamConf>,
}

fn default_upload_method() -> String {
    "PUT".to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct EncodingConfig {
    #[serde(rename = "type", default)]
    pub kind: EncodingType,
    #[serde(default)]
    pub opts: Option<EncodingOptions>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingType {
    #[default]
    Json,
    Raw,
}

impl fmt::Display for EncodingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingType::Json => f.write_str("json"),
            EncodingType::Raw => f.write_str("raw"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct EncodingOptions {
    #[serde(default)]
    pub delimiter: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    Gzip,
    #[default]
    #[serde(alias = "noop", alias = "")]
    None,
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionType::Gzip => f.write_str("gzip"),
            CompressionType::None => f.write_str("none"),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub custom_tags: BTreeMap<String, String>,
}

/// Response body of the latest-applicable-tag endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestTagResponse {
    pub tag: String,
    pub image: String,
    pub url: String,
}

impl UpdaterConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Reads the file at `path` and checks its entities, so a bad config is
    /// reported before any cluster or API client is built.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Self::from_path(path)?;
        config.validate_entities()?;
        Ok(config)
    }

    /// Entity rules: at least one entity, and every ID is unique.
    pub fn validate_entities(&self) -> Result<(), ConfigError> {
        if self.entities.is_empty() {
            return Err(ConfigError::NoEntities);
        }
        let mut ids = HashSet::new();
        for entity in &self.entities {
            if !ids.insert(entity.id.as_str()) {
                return Err(ConfigError::DuplicateEntityId(entity.id.clone()));
            }
        }
        Ok(())
    }

    pub fn log_uploader_enabled(&self) -> bool {
        self.api.log_upload.as_ref().is_some_and(|l| l.enabled)
    }

    pub fn custom_tags(&self) -> BTreeMap<String, String> {
        self.log
            .as_ref()
            .map(|l| l.custom_tags.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FULL: &str = r#"
entities:
  - id: agent
    image: edgedelta/agent
    paths:
      - "ns:ds/my-ds:spec.template.spec.containers[0].image"
      - "ns:deploy/my-deploy:spec.template.spec.containers[1].image"
api:
  base_url: https://api.example.org
  auth:
    header_key: X-API-Key
    header_value: "{{ .env.API_KEY }}"
  latest_tag:
    endpoint: /v1/latest
    params:
      query:
        entity: "{{ .ctx.entity }}"
  metadata:
    endpoint: /v1/metadata
  log_upload:
    enabled: true
    presigned_upload_url:
      endpoint: /v1/upload-url
    method: POST
    enconding:
      type: raw
      opts:
        delimiter: "\\n"
    compression: gzip
log:
  custom_tags:
    cluster: "{{ .meta.cluster }}"
"#;

    #[test]
    fn parses_full_document() {
        let cfg = UpdaterConfig::from_yaml_str(FULL).unwrap();
        assert_eq!(cfg.entities.len(), 1);
        let entity = &cfg.entities[0];
        assert_eq!(entity.image_name, "edgedelta/agent");
        assert_eq!(entity.k8s_paths.len(), 2);
        assert_eq!(cfg.api.base_url, ConfigValue::from("https://api.example.org"));
        assert_eq!(
            cfg.api.latest_tag.params.as_ref().unwrap().query_params["entity"],
            ConfigValue::from("{{ .ctx.entity }}")
        );
        let upload = cfg.api.log_upload.as_ref().unwrap();
        assert_eq!(upload.method, "POST");
        assert_eq!(upload.encoding.kind, EncodingType::Raw);
        assert_eq!(upload.encoding.opts.as_ref().unwrap().delimiter, "\\n");
        assert_eq!(upload.compression, CompressionType::Gzip);
        assert!(cfg.log_uploader_enabled());
        assert!(cfg.metadata.is_empty());
        assert_eq!(cfg.custom_tags()["cluster"], "{{ .meta.cluster }}");
    }

    #[test]
    fn log_upload_defaults() {
        let cfg = UpdaterConfig::from_yaml_str(
            r#"
entities: [{id: a, image: x}]
api:
  base_url: http://x
  latest_tag: {endpoint: /}
  log_upload:
    presigned_upload_url: {endpoint: /u}
"#,
        )
        .unwrap();
        let upload = cfg.api.log_upload.as_ref().unwrap();
        assert!(!upload.enabled);
        assert_eq!(upload.method, "PUT");
        assert_eq!(upload.encoding.kind, EncodingType::Json);
        assert_eq!(upload.compression, CompressionType::None);
        assert!(!cfg.log_uploader_enabled());
    }

    #[test]
    fn rejects_missing_entities() {
        let cfg =
            UpdaterConfig::from_yaml_str("api: {base_url: x, latest_tag: {endpoint: /}}").unwrap();
        assert!(matches!(cfg.validate_entities(), Err(ConfigError::NoEntities)));
    }

    #[test]
    fn rejects_duplicate_entity_ids() {
        let cfg = UpdaterConfig::from_yaml_str(
            r#"
entities: [{id: a, image: x}, {id: b, image: y}, {id: a, image: z}]
api: {base_url: x, latest_tag: {endpoint: /}}
"#,
        )
        .unwrap();
        match cfg.validate_entities() {
            Err(ConfigError::DuplicateEntityId(id)) => assert_eq!(id, "a"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn load_checks_entities_after_reading() {
        let path = std::env::temp_dir()
            .join(format!("updater-dup-entities-{}.yml", std::process::id()));
        let raw = r#"
entities: [{id: a, image: x}, {id: a, image: y}]
api: {base_url: x, latest_tag: {endpoint: /}}
"#;
        std::fs::write(&path, raw).unwrap();
        let loaded = UpdaterConfig::load(&path);
        std::fs::remove_file(&path).unwrap();
        match loaded {
            Err(ConfigError::DuplicateEntityId(id)) => assert_eq!(id, "a"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            UpdaterConfig::from_path("/nonexistent/updater/config.yml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
