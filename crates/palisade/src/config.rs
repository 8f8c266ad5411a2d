//! Configuration schema and validation.
//!
//! The file is YAML; durations accept humantime strings ("10s",
//! "300ms"). A config is either fully valid and installed as one
//! generation, or rejected wholesale; there is no partial application.

use crate::auth::Networks;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid config: {0}")]
pub struct ConfigError(pub String);

fn bad(message: impl Into<String>) -> ConfigError {
    ConfigError(message.into())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub log_debug: bool,
    #[serde(default)]
    pub param_groups: Vec<ParamGroupSection>,
    pub clusters: Vec<ClusterSection>,
    pub users: Vec<UserSection>,
    #[serde(default)]
    pub caches: Vec<CacheSection>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub metrics: MetricsSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub allowed_networks: Vec<String>,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            allowed_networks: Vec::new(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:9090".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MetricsSection {
    #[serde(default)]
    pub allowed_networks: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamGroupSection {
    pub name: String,
    pub params: Vec<ParamSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamSection {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterSection {
    pub name: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Flat node list; shorthand for one replica per node is not
    /// implied, the nodes form a single implicit replica.
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub replicas: Vec<ReplicaSection>,
    pub users: Vec<ClusterUserSection>,
    #[serde(default)]
    pub kill_query_user: Option<KillQueryUserSection>,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    /// How many times a failed dispatch may re-select a node.
    #[serde(default)]
    pub retry_number: usize,
}

fn default_scheme() -> String {
    "http".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicaSection {
    pub name: String,
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterUserSection {
    pub name: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub max_concurrent_queries: i64,
    #[serde(default)]
    pub requests_per_minute: i64,
    #[serde(default)]
    pub max_queue_size: usize,
    #[serde(default, with = "humantime_serde")]
    pub max_queue_wait: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub max_execution_time: Option<Duration>,
    #[serde(default)]
    pub allowed_networks: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KillQueryUserSection {
    pub name: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatSection {
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Probe path; defaults to the backend's unauthenticated liveness
    /// endpoint.
    #[serde(default)]
    pub request: Option<String>,
    /// Expected response body.
    #[serde(default)]
    pub response: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserSection {
    pub name: String,
    #[serde(default)]
    pub password: String,
    pub to_cluster: String,
    pub to_user: String,
    #[serde(default)]
    pub max_concurrent_queries: i64,
    #[serde(default)]
    pub requests_per_minute: i64,
    #[serde(default)]
    pub max_queue_size: usize,
    #[serde(default, with = "humantime_serde")]
    pub max_queue_wait: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub max_execution_time: Option<Duration>,
    #[serde(default)]
    pub allowed_networks: Vec<String>,
    #[serde(default)]
    pub deny_http: bool,
    #[serde(default)]
    pub deny_https: bool,
    #[serde(default)]
    pub allow_cors: bool,
    #[serde(default)]
    pub cache: Option<String>,
    #[serde(default)]
    pub params: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    #[default]
    FileSystem,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    pub name: String,
    #[serde(default)]
    pub mode: CacheMode,
    /// Directory for `file_system` mode.
    #[serde(default)]
    pub dir: Option<String>,
    /// Byte bound for the eviction sweeper.
    #[serde(default)]
    pub max_size: Option<u64>,
    /// Item bound for the eviction sweeper.
    #[serde(default)]
    pub max_items: Option<u64>,
    #[serde(with = "humantime_serde")]
    pub expire: Duration,
    #[serde(default, with = "humantime_serde")]
    pub grace_time: Option<Duration>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|err| bad(format!("cannot read {}: {err}", path.as_ref().display())))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(raw).map_err(|err| bad(format!("cannot parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Whole-file validation: either everything is installable or the
    /// config is rejected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server
            .http
            .listen_addr
            .parse::<SocketAddr>()
            .map_err(|_| bad(format!("invalid listen_addr {:?}", self.server.http.listen_addr)))?;
        check_networks("server.http", &self.server.http.allowed_networks)?;
        check_networks("server.metrics", &self.server.metrics.allowed_networks)?;

        check_unique("param_groups", self.param_groups.iter().map(|g| &g.name))?;
        check_unique("clusters", self.clusters.iter().map(|c| &c.name))?;
        check_unique("users", self.users.iter().map(|u| &u.name))?;
        check_unique("caches", self.caches.iter().map(|c| &c.name))?;

        if self.clusters.is_empty() {
            return Err(bad("at least one cluster is required"));
        }
        if self.users.is_empty() {
            return Err(bad("at least one user is required"));
        }

        for cluster in &self.clusters {
            if cluster.scheme != "http" && cluster.scheme != "https" {
                return Err(bad(format!(
                    "cluster {:?}: unsupported scheme {:?}",
                    cluster.name, cluster.scheme
                )));
            }
            match (cluster.nodes.is_empty(), cluster.replicas.is_empty()) {
                (true, true) => {
                    return Err(bad(format!(
                        "cluster {:?} must define nodes or replicas",
                        cluster.name
                    )))
                }
                (false, false) => {
                    return Err(bad(format!(
                        "cluster {:?} cannot define both nodes and replicas",
                        cluster.name
                    )))
                }
                _ => {}
            }
            for replica in &cluster.replicas {
                if replica.nodes.is_empty() {
                    return Err(bad(format!(
                        "replica {:?} of cluster {:?} has no nodes",
                        replica.name, cluster.name
                    )));
                }
            }
            check_unique(
                &format!("users of cluster {:?}", cluster.name),
                cluster.users.iter().map(|u| &u.name),
            )?;
            if cluster.users.is_empty() {
                return Err(bad(format!("cluster {:?} has no users", cluster.name)));
            }
            for user in &cluster.users {
                check_networks(&format!("cluster user {:?}", user.name), &user.allowed_networks)?;
            }
        }

        for user in &self.users {
            let cluster = self
                .clusters
                .iter()
                .find(|c| c.name == user.to_cluster)
                .ok_or_else(|| {
                    bad(format!(
                        "user {:?}: to_cluster {:?} does not exist",
                        user.name, user.to_cluster
                    ))
                })?;
            if !cluster.users.iter().any(|cu| cu.name == user.to_user) {
                return Err(bad(format!(
                    "user {:?}: to_user {:?} does not exist in cluster {:?}",
                    user.name, user.to_user, cluster.name
                )));
            }
            if let Some(cache) = &user.cache {
                if !self.caches.iter().any(|c| &c.name == cache) {
                    return Err(bad(format!(
                        "user {:?}: cache {:?} does not exist",
                        user.name, cache
                    )));
                }
            }
            if let Some(params) = &user.params {
                if !self.param_groups.iter().any(|g| &g.name == params) {
                    return Err(bad(format!(
                        "user {:?}: param group {:?} does not exist",
                        user.name, params
                    )));
                }
            }
            check_networks(&format!("user {:?}", user.name), &user.allowed_networks)?;
        }

        for cache in &self.caches {
            if cache.expire.is_zero() {
                return Err(bad(format!("cache {:?}: expire must be positive", cache.name)));
            }
            if cache.mode == CacheMode::FileSystem {
                if cache.dir.as_deref().unwrap_or("").is_empty() {
                    return Err(bad(format!(
                        "cache {:?}: file_system mode requires a dir",
                        cache.name
                    )));
                }
                if cache.max_size.unwrap_or(0) == 0 {
                    return Err(bad(format!(
                        "cache {:?}: file_system mode requires max_size",
                        cache.name
                    )));
                }
            }
        }

        Ok(())
    }
}

fn check_unique<'a>(
    what: &str,
    names: impl Iterator<Item = &'a String>,
) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(bad(format!("duplicate name {name:?} in {what}")));
        }
    }
    Ok(())
}

fn check_networks(what: &str, entries: &[String]) -> Result<(), ConfigError> {
    Networks::parse(entries).map_err(|err| bad(format!("{what}: {err}")))?;
    Ok(())
}
