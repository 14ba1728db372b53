use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PathError;
use crate::field_path::FieldPath;

/// Workload kinds whose spec can be patched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    DaemonSet,
    Deployment,
    StatefulSet,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::DaemonSet,
        ResourceKind::Deployment,
        ResourceKind::StatefulSet,
    ];

    fn aliases(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::DaemonSet => &["ds", "daemonset"],
            ResourceKind::Deployment => &["deploy", "deployment"],
            ResourceKind::StatefulSet => &["sts", "statefulset"],
        }
    }
}

impl FromStr for ResourceKind {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.aliases().iter().any(|a| a.eq_ignore_ascii_case(s)))
            .ok_or_else(|| PathError::UnsupportedKind(s.to_string()))
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::DaemonSet => "DaemonSet",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::StatefulSet => "StatefulSet",
        };
        f.write_str(name)
    }
}

/// Raw `namespace:kind/name:fieldPath` locator as written in the config.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourcePath(String);

impl ResourcePath {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parse(&self) -> Result<ResourceIdentifier, PathError> {
        let parts: Vec<&str> = self.0.split(':').collect();
        let [namespace, kind_name, update_key_path] = parts[..] else {
            return Err(self.malformed(
                "wrong number of colon-separated items",
            ));
        };
        let kind_name: Vec<&str> = kind_name.split('/').collect();
        let [kind, name] = kind_name[..] else {
            return Err(self.malformed(
                "wrong number of slash-separated items",
            ));
        };
        Ok(ResourceIdentifier {
            namespace: namespace.to_string(),
            kind: kind.parse()?,
            name: name.to_string(),
            update_key_path: update_key_path.to_string(),
        })
    }

    fn malformed(&self, reason: &'static str) -> PathError {
        PathError::MalformedPath {
            path: self.0.clone(),
            reason,
        }
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourcePath {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceIdentifier {
    pub namespace: String,
    pub kind: ResourceKind,
    pub name: String,
    pub update_key_path: String,
}

impl ResourceIdentifier {
    pub fn field_path(&self) -> Result<FieldPath, PathError> {
        self.update_key_path.parse()
    }
}

pub fn parse_resource_path(raw: &str) -> Result<ResourceIdentifier, PathError> {
    ResourcePath::new(raw).parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_daemonset_path() {
        let id = parse_resource_path(
            "ns:ds/my-ds:spec.template.spec.containers[0].image",
        )
        .unwrap();
        assert_eq!(
            id,
            ResourceIdentifier {
                namespace: "ns".into(),
                kind: ResourceKind::DaemonSet,
                name: "my-ds".into(),
                update_key_path: "spec.template.spec.containers[0].image"
                    .into(),
            }
        );
    }

    #[test]
    fn accepts_kind_aliases() {
        for (raw, kind) in [
            ("deploy", ResourceKind::Deployment),
            ("Deployment", ResourceKind::Deployment),
            ("sts", ResourceKind::StatefulSet),
            ("statefulset", ResourceKind::StatefulSet),
            ("daemonset", ResourceKind::DaemonSet),
        ] {
            let id = parse_resource_path(&format!("ns:{raw}/x:spec.replicas"))
                .unwrap();
            assert_eq!(id.kind, kind);
        }
    }

    #[test]
    fn rejects_wrong_colon_count() {
        for raw in ["ns:ds/x", "ns:ds/x:spec:extra", "nothing"] {
            assert!(matches!(
                parse_resource_path(raw),
                Err(PathError::MalformedPath { .. })
            ));
        }
    }

    #[test]
    fn rejects_wrong_slash_count() {
        for raw in ["ns:ds:spec", "ns:ds/x/y:spec"] {
            assert!(matches!(
                parse_resource_path(raw),
                Err(PathError::MalformedPath { .. })
            ));
        }
    }

    #[test]
    fn rejects_unsupported_kind() {
        let err = parse_resource_path("ns:cronjob/x:spec").unwrap_err();
        assert!(matches!(err, PathError::UnsupportedKind(k) if k == "cronjob"));
    }

    #[test]
    fn namespace_is_not_validated() {
        let id = parse_resource_path(":ds/x:spec").unwrap();
        assert_eq!(id.namespace, "");
    }
}
