use std::time::Duration;

use envconfig::Envconfig;
use tracing::{Span, info_span};

const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Process-level settings of the updater binaries.
#[derive(Envconfig, Clone, Debug)]
pub struct AgentConfig {
    /// `json` or `plain`.
    #[envconfig(from = "UPDATER_LOG_FORMAT", default = "json")]
    pub log_format: String,

    #[envconfig(from = "UPDATER_SHUTDOWN_GRACE_SECS", default = "60")]
    pub shutdown_grace_secs: u64,

    #[envconfig(from = "UPDATER_LOG_FLUSH_SECS", default = "60")]
    pub log_flush_secs: u64,

    #[envconfig(from = "UPDATER_LOG_QUEUE_SIZE", default = "100")]
    pub log_queue_size: usize,

    #[envconfig(from = "UPDATER_HTTP_TIMEOUT_SECS", default = "30")]
    pub http_timeout_secs: u64,

    /// Directory holding `config.yml` for the one-shot `updater` binary.
    #[envconfig(from = "KO_DATA_PATH")]
    pub ko_data_path: Option<String>,

    #[envconfig(from = "KUBE_NAMESPACE")]
    pub kube_namespace: Option<String>,

    #[envconfig(from = "KUBE_NODE")]
    pub kube_node: Option<String>,

    #[envconfig(from = "HOSTNAME")]
    pub hostname: Option<String>,

    #[envconfig(from = "KUBE_POD")]
    pub kube_pod: Option<String>,
}

impl AgentConfig {
    pub fn json_logs(&self) -> bool {
        !matches!(
            self.log_format.to_ascii_lowercase().as_str(),
            "plain" | "text" | "pretty"
        )
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_secs(self.log_flush_secs.max(1))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn identity(&self) -> RuntimeIdentity {
        let namespace = non_empty(self.kube_namespace.as_deref())
            .map(str::to_string)
            .or_else(|| {
                std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE)
                    .ok()
                    .map(|ns| ns.trim().to_string())
            })
            .unwrap_or_default();
        let node = non_empty(self.kube_node.as_deref())
            .or(non_empty(self.hostname.as_deref()))
            .unwrap_or_default()
            .to_string();
        RuntimeIdentity {
            namespace,
            node,
            pod: self.kube_pod.clone().unwrap_or_default(),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Where this process runs inside the cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeIdentity {
    pub namespace: String,
    pub node: String,
    pub pod: String,
}

impl RuntimeIdentity {
    /// Root span carrying the identity on every event emitted inside it.
    pub fn span(&self) -> Span {
        info_span!(
            "updater",
            k8s_namespace = %self.namespace,
            k8s_node = %self.node,
            k8s_pod = %self.pod,
        )
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct DevApiConfig {
    #[envconfig(from = "HTTP_PORT", default = "8080")]
    pub http_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(pairs: &[(&str, &str)]) -> AgentConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AgentConfig::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn defaults() {
        let cfg = from_map(&[]);
        assert!(cfg.json_logs());
        assert_eq!(cfg.shutdown_grace(), Duration::from_secs(60));
        assert_eq!(cfg.log_flush_interval(), Duration::from_secs(60));
        assert_eq!(cfg.log_queue_size, 100);
        assert_eq!(cfg.http_timeout(), Duration::from_secs(30));
        assert!(cfg.ko_data_path.is_none());
    }

    #[test]
    fn plain_log_format() {
        assert!(!from_map(&[("UPDATER_LOG_FORMAT", "plain")]).json_logs());
        assert!(!from_map(&[("UPDATER_LOG_FORMAT", "TEXT")]).json_logs());
    }

    #[test]
    fn identity_prefers_explicit_values() {
        let cfg = from_map(&[
            ("KUBE_NAMESPACE", "edgedelta"),
            ("KUBE_NODE", "node-1"),
            ("HOSTNAME", "ignored"),
            ("KUBE_POD", "updater-abc"),
        ]);
        assert_eq!(
            cfg.identity(),
            RuntimeIdentity {
                namespace: "edgedelta".into(),
                node: "node-1".into(),
                pod: "updater-abc".into(),
            }
        );
    }

    #[test]
    fn node_falls_back_to_hostname() {
        let cfg = from_map(&[("KUBE_NAMESPACE", "ns"), ("KUBE_NODE", ""), ("HOSTNAME", "host-7")]);
        let identity = cfg.identity();
        assert_eq!(identity.node, "host-7");
        assert_eq!(identity.pod, "");
    }

    #[test]
    fn dev_api_port_default() {
        let cfg = DevApiConfig::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(cfg.http_port, 8080);
    }
}
