//! Placeholder resolution for configuration strings.
//!
//! Startup pass: `{{ .k8s.secrets.<ns>.<name> }}` and `{{ .env.<KEY> }}` are
//! replaced, `{{ .ctx.<key> }}` turns the value into a deferred
//! [`ContextualTemplate`], `{{ .meta.<key> }}` is kept for the metadata pass.
//! Metadata pass: `{{ .meta.<key> }}` in custom log tags is replaced from the
//! fetched metadata.
//!
//! Both passes work on a copy of the configuration and only replace the
//! caller's value when every field resolved.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::config::{ConfigValue, EndpointConfig, UpdaterConfig};
use crate::template::ContextualTemplate;

const SECRET_PREFIX: &str = "k8s.secrets.";
const ENV_PREFIX: &str = "env.";
const CTX_PREFIX: &str = "ctx.";
const META_PREFIX: &str = "meta.";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error(
        "secret path should have pattern .k8s.secrets.<NAMESPACE>.<SECRET-NAME>, got {0:?} instead"
    )]
    InvalidSecretPath(String),

    #[error("unknown config variable namespace in {0:?}")]
    UnknownVariableNamespace(String),

    #[error("metadata with key {0:?} is not found")]
    MetadataKeyNotFound(String),

    #[error("contextual variable {key:?} is not allowed in {field}")]
    UnexpectedContextVariable { field: &'static str, key: String },

    #[error("failed to read secret {namespace}/{name}: {reason}")]
    SecretUnavailable {
        namespace: String,
        name: String,
        reason: String,
    },
}

fn config_var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([^{}\s]+)\s*\}\}").expect("placeholder pattern is valid")
    })
}

/// Source of Kubernetes secret values.
pub trait SecretReader {
    fn read_secret(&self, namespace: &str, name: &str) -> Result<String, ResolveError>;
}

/// Source of process environment values. Absent keys read as empty.
pub trait EnvReader {
    fn var(&self, key: &str) -> Option<String>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnv;

impl EnvReader for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvReader for BTreeMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl EnvReader for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

/// Secrets fetched ahead of resolution.
#[derive(Clone, Debug, Default)]
pub struct SecretMap {
    values: BTreeMap<SecretRef, String>,
}

impl SecretMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, secret: SecretRef, value: String) {
        self.values.insert(secret, value);
    }
}

impl SecretReader for SecretMap {
    fn read_secret(&self, namespace: &str, name: &str) -> Result<String, ResolveError> {
        let key = SecretRef {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.values
            .get(&key)
            .cloned()
            .ok_or_else(|| ResolveError::SecretUnavailable {
                namespace: key.namespace,
                name: key.name,
                reason: "secret was not fetched".into(),
            })
    }
}

enum Placeholder<'a> {
    Secret(SecretRef),
    Env(&'a str),
    Context(&'a str),
    Meta(&'a str),
}

impl<'a> Placeholder<'a> {
    fn classify(inner: &'a str) -> Result<Self, ResolveError> {
        let path = inner.strip_prefix('.').unwrap_or(inner);
        if let Some(secret) = path.strip_prefix(SECRET_PREFIX) {
            let parts: Vec<&str> = secret.split('.').collect();
            let [namespace, name] = parts[..] else {
                return Err(ResolveError::InvalidSecretPath(secret.to_string()));
            };
            return Ok(Placeholder::Secret(SecretRef {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }));
        }
        if let Some(key) = path.strip_prefix(ENV_PREFIX) {
            return Ok(Placeholder::Env(key));
        }
        if let Some(key) = path.strip_prefix(CTX_PREFIX) {
            return Ok(Placeholder::Context(key));
        }
        if let Some(key) = path.strip_prefix(META_PREFIX) {
            return Ok(Placeholder::Meta(key));
        }
        Err(ResolveError::UnknownVariableNamespace(inner.to_string()))
    }
}

enum Substitution {
    Text(String),
    Keep,
    Context(String),
}

/// One regex pass over `raw`; the first error aborts the substitution.
fn substitute<F>(raw: &str, mut replace: F) -> Result<ContextualTemplate, ResolveError>
where
    F: FnMut(Placeholder<'_>) -> Result<Substitution, ResolveError>,
{
    let mut template = ContextualTemplate::default();
    let mut last = 0;
    for caps in config_var_re().captures_iter(raw) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        template.push_literal(&raw[last..whole.start()]);
        match replace(Placeholder::classify(inner.as_str())?)? {
            Substitution::Text(text) => template.push_literal(&text),
            Substitution::Keep => template.push_literal(whole.as_str()),
            Substitution::Context(key) => template.push_var(key),
        }
        last = whole.end();
    }
    template.push_literal(&raw[last..]);
    Ok(template)
}

struct StartupResolver<'a> {
    secrets: &'a dyn SecretReader,
    env: &'a dyn EnvReader,
}

impl StartupResolver<'_> {
    fn template(&self, raw: &str) -> Result<ContextualTemplate, ResolveError> {
        substitute(raw, |placeholder| match placeholder {
            Placeholder::Secret(secret) => self
                .secrets
                .read_secret(&secret.namespace, &secret.name)
                .map(Substitution::Text),
            Placeholder::Env(key) => Ok(Substitution::Text(self.env.var(key).unwrap_or_default())),
            Placeholder::Context(key) => Ok(Substitution::Context(key.to_string())),
            Placeholder::Meta(_) => Ok(Substitution::Keep),
        })
    }

    fn plain(&self, raw: &str, field: &'static str) -> Result<String, ResolveError> {
        let template = self.template(raw)?;
        match template.variables().next() {
            Some(key) => Err(ResolveError::UnexpectedContextVariable {
                field,
                key: key.to_string(),
            }),
            None => Ok(template.as_literal().unwrap_or_default()),
        }
    }

    fn value(&self, value: &mut ConfigValue) -> Result<(), ResolveError> {
        let ConfigValue::Plain(raw) = value else {
            return Ok(());
        };
        let template = self.template(raw)?;
        *value = match template.as_literal() {
            Some(text) => ConfigValue::Plain(text),
            None => ConfigValue::Deferred(template),
        };
        Ok(())
    }
}

/// Mutable view of one startup-resolved configuration field.
enum StartupField<'a> {
    Plain(&'static str, &'a mut String),
    Value(&'a mut ConfigValue),
}

fn for_each_startup_field<F>(config: &mut UpdaterConfig, mut visit: F) -> Result<(), ResolveError>
where
    F: FnMut(StartupField<'_>) -> Result<(), ResolveError>,
{
    fn endpoint<F>(endpoint: &mut EndpointConfig, visit: &mut F) -> Result<(), ResolveError>
    where
        F: FnMut(StartupField<'_>) -> Result<(), ResolveError>,
    {
        visit(StartupField::Value(&mut endpoint.endpoint))?;
        if let Some(auth) = endpoint.auth.as_mut() {
            visit(StartupField::Value(&mut auth.header_value))?;
        }
        if let Some(params) = endpoint.params.as_mut() {
            for value in params.query_params.values_mut() {
                visit(StartupField::Value(value))?;
            }
        }
        Ok(())
    }

    for entity in config.entities.iter_mut() {
        visit(StartupField::Plain("entity id", &mut entity.id))?;
    }
    let api = &mut config.api;
    visit(StartupField::Value(&mut api.base_url))?;
    if let Some(auth) = api.auth.as_mut() {
        visit(StartupField::Value(&mut auth.header_value))?;
    }
    endpoint(&mut api.latest_tag, &mut visit)?;
    if let Some(metadata) = api.metadata.as_mut() {
        endpoint(metadata, &mut visit)?;
    }
    if let Some(upload) = api.log_upload.as_mut() {
        endpoint(&mut upload.presigned_upload_url, &mut visit)?;
        if let Some(auth) = upload.auth.as_mut() {
            visit(StartupField::Value(&mut auth.header_value))?;
        }
        if let Some(params) = upload.params.as_mut() {
            for value in params.query_params.values_mut() {
                visit(StartupField::Value(value))?;
            }
        }
    }
    if let Some(log) = config.log.as_mut() {
        for value in log.custom_tags.values_mut() {
            visit(StartupField::Plain("log custom tag", value))?;
        }
    }
    Ok(())
}

/// Every secret referenced by a startup-resolved field, deduplicated.
///
/// Malformed placeholders are reported here, before anything is fetched.
pub fn secret_refs(config: &UpdaterConfig) -> Result<Vec<SecretRef>, ResolveError> {
    let mut scratch = config.clone();
    let mut refs = BTreeSet::new();
    let mut collect = |raw: &str| {
        substitute(raw, |placeholder| {
            if let Placeholder::Secret(secret) = placeholder {
                refs.insert(secret);
            }
            Ok(Substitution::Keep)
        })
        .map(|_| ())
    };
    for_each_startup_field(&mut scratch, |field| match field {
        StartupField::Plain(_, raw) => collect(raw.as_str()),
        StartupField::Value(ConfigValue::Plain(raw)) => collect(raw.as_str()),
        StartupField::Value(ConfigValue::Deferred(_)) => Ok(()),
    })?;
    Ok(refs.into_iter().collect())
}

/// Startup pass. On error `config` is left exactly as it was.
pub fn resolve_startup_vars(
    config: &mut UpdaterConfig,
    secrets: &dyn SecretReader,
    env: &dyn EnvReader,
) -> Result<(), ResolveError> {
    let resolver = StartupResolver { secrets, env };
    let mut next = config.clone();
    for_each_startup_field(&mut next, |field| match field {
        StartupField::Plain(name, raw) => {
            *raw = resolver.plain(raw.as_str(), name)?;
            Ok(())
        }
        StartupField::Value(value) => resolver.value(value),
    })?;
    debug!("resolved startup config variables");
    *config = next;
    Ok(())
}

/// Metadata pass over custom log tags. Must run after the metadata fetch.
///
/// On success the metadata is also stored in `config.metadata`; on error
/// `config` is left exactly as it was.
pub fn resolve_metadata_vars(
    config: &mut UpdaterConfig,
    metadata: &BTreeMap<String, String>,
) -> Result<(), ResolveError> {
    let mut next = config.clone();
    if let Some(log) = next.log.as_mut() {
        for value in log.custom_tags.values_mut() {
            let template = substitute(value, |placeholder| match placeholder {
                Placeholder::Meta(key) => metadata
                    .get(key)
                    .cloned()
                    .map(Substitution::Text)
                    .ok_or_else(|| ResolveError::MetadataKeyNotFound(key.to_string())),
                _ => Ok(Substitution::Keep),
            })?;
            *value = template.as_literal().unwrap_or_default();
        }
    }
    next.metadata = metadata.clone();
    *config = next;
    Ok(())
}
