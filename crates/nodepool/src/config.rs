use std::{path::PathBuf, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use clap::Args;
use garde::Validate;
use kube::{
    Client, Config,
    config::{KubeConfigOptions, Kubeconfig},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    Error, Result,
    api::{DrainPlan, NodePoolTarget, NodeSelector, ReadinessRequirement},
};

pub const DEFAULT_NODE_SELECTOR_KEY: &str = "cloud.google.com/gke-nodepool";
pub const DEFAULT_MIN_READY_NODES: u32 = 1;
pub const DEFAULT_READY_TIMEOUT: &str = "300s";
pub const DEFAULT_DRAIN_TIMEOUT: &str = "300s";
pub const DEFAULT_DRAIN_WAIT: &str = "60s";

const KUBECONFIG_ENTRY_NAME: &str = "nodepool";

/// Settings of one managed node pool, as persisted between create and delete.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Validate, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct NodePoolConfig {
    /// Node pool name
    #[garde(length(min = 1))]
    pub node_pool_name: String,
    /// Label key used to select the nodes of the pool
    #[serde(default = "default_node_selector_key")]
    #[garde(length(min = 1))]
    pub node_selector_key: String,
    /// Label value used to select the nodes of the pool. Defaults to the node pool name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(length(min = 1))]
    pub node_selector_value: Option<String>,
    /// Minimum number of ready nodes in the new node pool
    #[serde(default = "default_min_ready_nodes")]
    #[garde(range(min = 1))]
    pub min_ready_nodes: u32,
    /// Maximum time to wait for nodes in a new node pool to be ready
    #[serde(default = "default_ready_timeout")]
    #[garde(custom(valid_duration))]
    pub ready_timeout: String,
    /// Timeout for draining a single node; `0s` waits indefinitely
    #[serde(default = "default_drain_timeout")]
    #[garde(custom(valid_duration))]
    pub drain_timeout: String,
    /// Time to wait after each node drain before draining the next node
    #[serde(default = "default_drain_wait")]
    #[garde(custom(valid_duration))]
    pub drain_wait: String,
}

fn default_node_selector_key() -> String {
    DEFAULT_NODE_SELECTOR_KEY.to_string()
}

fn default_min_ready_nodes() -> u32 {
    DEFAULT_MIN_READY_NODES
}

fn default_ready_timeout() -> String {
    DEFAULT_READY_TIMEOUT.to_string()
}

fn default_drain_timeout() -> String {
    DEFAULT_DRAIN_TIMEOUT.to_string()
}

fn default_drain_wait() -> String {
    DEFAULT_DRAIN_WAIT.to_string()
}

fn valid_duration(value: &str, _ctx: &()) -> garde::Result {
    parse_duration(value)
        .map(|_| ())
        .map_err(|e| garde::Error::new(e.to_string()))
}

impl NodePoolConfig {
    /// Config for `name` with every other field at its default.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            node_pool_name: name.into(),
            node_selector_key: default_node_selector_key(),
            node_selector_value: None,
            min_ready_nodes: DEFAULT_MIN_READY_NODES,
            ready_timeout: default_ready_timeout(),
            drain_timeout: default_drain_timeout(),
            drain_wait: default_drain_wait(),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }

    pub fn target(&self) -> NodePoolTarget {
        let value = self
            .node_selector_value
            .clone()
            .unwrap_or_else(|| self.node_pool_name.clone());

        NodePoolTarget {
            name: self.node_pool_name.clone(),
            selector: NodeSelector::new(self.node_selector_key.clone(), value),
        }
    }

    pub fn readiness_requirement(&self) -> Result<ReadinessRequirement> {
        Ok(ReadinessRequirement {
            min_ready_nodes: self.min_ready_nodes,
            timeout: parse_duration(&self.ready_timeout)?,
        })
    }

    pub fn drain_plan(&self) -> Result<DrainPlan> {
        Ok(DrainPlan {
            drain_timeout: parse_duration(&self.drain_timeout)?,
            inter_node_pause: parse_duration(&self.drain_wait)?,
        })
    }
}

/// Command line form of [`NodePoolConfig`]. Flags override values loaded from `--state`.
#[derive(Args, Debug, Clone, Default)]
pub struct PoolArgs {
    /// YAML file holding a previously persisted node pool state
    #[arg(long)]
    pub state: Option<PathBuf>,
    /// Node pool name
    #[arg(long, env = "NODE_POOL_NAME")]
    pub node_pool_name: Option<String>,
    /// Label key used to select the nodes of the pool [default: cloud.google.com/gke-nodepool]
    #[arg(long, env = "NODE_SELECTOR_KEY")]
    pub node_selector_key: Option<String>,
    /// Label value used to select the nodes of the pool [default: the node pool name]
    #[arg(long, env = "NODE_SELECTOR_VALUE")]
    pub node_selector_value: Option<String>,
    /// Minimum number of ready nodes in the new node pool [default: 1]
    #[arg(long, env = "MIN_READY_NODES")]
    pub min_ready_nodes: Option<u32>,
    /// Maximum time to wait for nodes to be ready [default: 300s]
    #[arg(long, env = "READY_TIMEOUT")]
    pub ready_timeout: Option<String>,
    /// Timeout for draining a single node [default: 300s]
    #[arg(long, env = "DRAIN_TIMEOUT")]
    pub drain_timeout: Option<String>,
    /// Time to wait after each node drain [default: 60s]
    #[arg(long, env = "DRAIN_WAIT")]
    pub drain_wait: Option<String>,
}

impl PoolArgs {
    /// Resolve the flags (and state file, if any) into a validated config.
    pub fn resolve(&self) -> Result<NodePoolConfig> {
        let base = match &self.state {
            Some(path) => Some(NodePoolConfig::from_yaml(&std::fs::read_to_string(path)?)?),
            None => None,
        };
        self.merge(base)
    }

    fn merge(&self, base: Option<NodePoolConfig>) -> Result<NodePoolConfig> {
        let mut config = base.unwrap_or_else(|| NodePoolConfig::new(""));

        if let Some(name) = &self.node_pool_name {
            config.node_pool_name = name.clone();
        }
        if let Some(key) = &self.node_selector_key {
            config.node_selector_key = key.clone();
        }
        if let Some(value) = &self.node_selector_value {
            config.node_selector_value = Some(value.clone());
        }
        if let Some(min) = self.min_ready_nodes {
            config.min_ready_nodes = min;
        }
        if let Some(timeout) = &self.ready_timeout {
            config.ready_timeout = timeout.clone();
        }
        if let Some(timeout) = &self.drain_timeout {
            config.drain_timeout = timeout.clone();
        }
        if let Some(wait) = &self.drain_wait {
            config.drain_wait = wait.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

/// Parse a Go-style duration such as `60s`, `1m30s` or `1.5h`. Negative values are rejected.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let invalid = |reason: &str| Error::InvalidDuration {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let mut rest = value.strip_prefix('+').unwrap_or(value);
    if rest.starts_with('-') {
        return Err(invalid("must not be negative"));
    }
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid("empty duration"));
    }

    let mut nanos: u128 = 0;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let number = &rest[..number_end];
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        rest = &rest[unit_end..];

        let scale: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid(&format!("unknown unit {unit:?}"))),
        };

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
            return Err(invalid("expected a number"));
        }

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid("number out of range"))?
        };
        let mut component = whole
            .checked_mul(scale)
            .ok_or_else(|| invalid("duration out of range"))?;

        let mut place = scale;
        for digit in fraction.bytes() {
            place /= 10;
            component = component
                .checked_add(u128::from(digit - b'0') * place)
                .ok_or_else(|| invalid("duration out of range"))?;
        }

        nanos = nanos
            .checked_add(component)
            .ok_or_else(|| invalid("duration out of range"))?;
    }

    let nanos = u64::try_from(nanos).map_err(|_| invalid("duration out of range"))?;
    Ok(Duration::from_nanos(nanos))
}

/// How to reach the cluster API server.
#[derive(Args, Debug, Clone, Default)]
pub struct ClusterConnection {
    /// HTTPS origin of the Kubernetes API server, e.g. https://10.0.0.1:443
    #[arg(
        long,
        env = "KUBE_HOST",
        requires_all = ["cluster_ca_certificate", "token"],
        conflicts_with = "kubeconfig"
    )]
    pub kube_host: Option<String>,
    /// PEM-encoded root certificate bundle for the API server
    #[arg(long, env = "KUBE_CLUSTER_CA_CERTIFICATE", hide_env_values = true)]
    pub cluster_ca_certificate: Option<String>,
    /// Service account token
    #[arg(long, env = "KUBE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
    /// Kubeconfig file to load instead of the default inference
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,
}

impl ClusterConnection {
    pub async fn client(&self) -> Result<Client> {
        let config = match (&self.kube_host, &self.kubeconfig) {
            (Some(host), _) => {
                Config::from_custom_kubeconfig(
                    self.explicit_kubeconfig(host)?,
                    &KubeConfigOptions::default(),
                )
                .await?
            }
            (None, Some(path)) => {
                Config::from_custom_kubeconfig(
                    Kubeconfig::read_from(path)?,
                    &KubeConfigOptions::default(),
                )
                .await?
            }
            (None, None) => return Ok(Client::try_default().await?),
        };

        Ok(Client::try_from(config)?)
    }

    fn explicit_kubeconfig(&self, host: &str) -> Result<Kubeconfig> {
        validate_https_origin(host)?;

        let ca = self.cluster_ca_certificate.as_deref().unwrap_or_default();
        let token = self.token.as_deref().unwrap_or_default();

        let kubeconfig = json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{
                "name": KUBECONFIG_ENTRY_NAME,
                "cluster": {
                    "server": host,
                    "certificate-authority-data": STANDARD.encode(ca),
                },
            }],
            "users": [{
                "name": KUBECONFIG_ENTRY_NAME,
                "user": { "token": token },
            }],
            "contexts": [{
                "name": KUBECONFIG_ENTRY_NAME,
                "context": {
                    "cluster": KUBECONFIG_ENTRY_NAME,
                    "user": KUBECONFIG_ENTRY_NAME,
                },
            }],
            "current-context": KUBECONFIG_ENTRY_NAME,
        });

        serde_json::from_value(kubeconfig).map_err(|e| Error::InvalidHost {
            host: host.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Accepts `https://host[:port]` with no path, query or fragment.
pub fn validate_https_origin(host: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidHost {
        host: host.to_string(),
        reason: reason.to_string(),
    };

    let Some((scheme, authority)) = host.split_once("://") else {
        return Err(invalid("expected <scheme>://<host>:<port>"));
    };
    if scheme != "https" {
        return Err(invalid("only HTTPS hosts are allowed"));
    }
    if authority.contains(['/', '?', '#']) {
        return Err(invalid("paths are not allowed"));
    }
    if authority.is_empty() || authority.starts_with(':') {
        return Err(invalid("missing host"));
    }

    Ok(())
}
