use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, PostParams};
use kube::{Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info};
use updater_core::{
    FieldPath, PathError, ResourceIdentifier, ResourceKind, ResourcePath, SetOutcome,
    set_field_by_path,
};

#[derive(Error, Debug)]
pub enum K8sError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),

    #[error("secret {namespace}/{name} has no data key {name:?}")]
    SecretKeyMissing { namespace: String, name: String },

    #[error("secret {namespace}/{name} is not valid UTF-8")]
    SecretNotUtf8 { namespace: String, name: String },
}

/// The Kubernetes operations the updater needs.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Sets the field addressed by `path` to `value`, updating the object
    /// only when the value differs.
    async fn set_resource_key_value(
        &self,
        path: &ResourcePath,
        value: &str,
    ) -> Result<SetOutcome, K8sError>;

    /// Reads the data key named like the secret itself.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<String, K8sError>;
}

#[derive(Clone)]
pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// In-cluster config when available, kubeconfig otherwise.
    pub async fn try_default() -> Result<Self, K8sError> {
        Ok(Self::new(Client::try_default().await?))
    }

    async fn update_workload<K>(
        &self,
        id: &ResourceIdentifier,
        field: &FieldPath,
        value: &str,
    ) -> Result<SetOutcome, K8sError>
    where
        K: Resource<Scope = NamespaceResourceScope>
            + Clone
            + Debug
            + Serialize
            + DeserializeOwned,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &id.namespace);
        let mut object = api.get(&id.name).await?;
        let outcome = set_field_by_path(&mut object, field, value)?;
        if !outcome.changed {
            info!(
                kind = %id.kind, namespace = %id.namespace, name = %id.name,
                path = %field, %value,
                "value is already set, skipping update"
            );
            return Ok(outcome);
        }
        api.replace(&id.name, &PostParams::default(), &object).await?;
        info!(
            kind = %id.kind, namespace = %id.namespace, name = %id.name,
            path = %field, previous = %outcome.previous, %value,
            "updated resource"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl ClusterClient for K8sClient {
    async fn set_resource_key_value(
        &self,
        path: &ResourcePath,
        value: &str,
    ) -> Result<SetOutcome, K8sError> {
        let id = path.parse()?;
        let field = id.field_path()?;
        debug!(%path, %value, "setting resource key value");
        match id.kind {
            ResourceKind::DaemonSet => self.update_workload::<DaemonSet>(&id, &field, value).await,
            ResourceKind::Deployment => {
                self.update_workload::<Deployment>(&id, &field, value).await
            }
            ResourceKind::StatefulSet => {
                self.update_workload::<StatefulSet>(&id, &field, value).await
            }
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<String, K8sError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await?;
        secret_value(&secret, namespace, name)
    }
}

fn secret_value(secret: &Secret, namespace: &str, name: &str) -> Result<String, K8sError> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(name))
        .ok_or_else(|| K8sError::SecretKeyMissing {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })?;
    String::from_utf8(bytes.0.clone()).map_err(|_| K8sError::SecretNotUtf8 {
        namespace: namespace.to_string(),
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret(pairs: Vec<(&str, Vec<u8>)>) -> Secret {
        Secret {
            data: Some(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v)))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn reads_key_named_after_secret() {
        let s = secret(vec![("api-key", b"s3cr3t".to_vec()), ("other", b"x".to_vec())]);
        assert_eq!(secret_value(&s, "ns", "api-key").unwrap(), "s3cr3t");
    }

    #[test]
    fn missing_key_is_an_error() {
        let s = secret(vec![("token", b"x".to_vec())]);
        assert!(matches!(
            secret_value(&s, "ns", "api-key"),
            Err(K8sError::SecretKeyMissing { .. })
        ));
        assert!(matches!(
            secret_value(&Secret::default(), "ns", "api-key"),
            Err(K8sError::SecretKeyMissing { .. })
        ));
    }

    #[test]
    fn non_utf8_value_is_an_error() {
        let s = secret(vec![("api-key", vec![0xff, 0xfe])]);
        assert!(matches!(
            secret_value(&s, "ns", "api-key"),
            Err(K8sError::SecretNotUtf8 { .. })
        ));
    }
}
