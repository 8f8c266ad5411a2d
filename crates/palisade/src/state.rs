//! One installed config generation.
//!
//! `apply` builds the whole object graph for a validated [`Config`]:
//! users, clusters with their topology, caches, and the background
//! tasks (heartbeats, rate-window resets, cache sweepers) that belong
//! to it. The generation is swapped into place atomically; cancelling
//! its token stops every background task it spawned. In-flight scopes
//! keep their `Arc`s into the old generation until they finish.

use crate::auth::Networks;
use crate::config::{CacheMode, Config, ConfigError};
use crate::users::{BackendUser, ParamGroup, User};
use palisade_admission::{IdentityKind, LimitSet};
use palisade_cache::{EntryStore, FsCache, MemoryKv, ResponseCache};
use palisade_topology::{
    spawn_heartbeat, Cluster, Credentials, HeartbeatConfig, Node, ProbeClient, Replica,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One cluster as seen by the dispatcher: topology plus the backend
/// users it owns.
pub struct ClusterHandle {
    pub topology: Arc<Cluster>,
    pub users: HashMap<String, Arc<BackendUser>>,
    pub retry_number: usize,
}

/// Everything a request needs, resolved once per config apply.
pub struct Generation {
    pub users: HashMap<String, Arc<User>>,
    pub clusters: HashMap<String, Arc<ClusterHandle>>,
    pub caches: HashMap<String, Arc<ResponseCache>>,
    pub param_groups: HashMap<String, Arc<ParamGroup>>,
    pub http_networks: Networks,
    pub metrics_networks: Networks,
    shutdown: CancellationToken,
}

impl Generation {
    /// Builds and starts a generation. `config` must already be
    /// validated; errors here are limited to environment problems
    /// (unparseable node addresses, unreachable cache directories).
    pub fn apply(config: &Config, probe_client: ProbeClient) -> Result<Self, ConfigError> {
        let shutdown = CancellationToken::new();

        let param_groups: HashMap<String, Arc<ParamGroup>> = config
            .param_groups
            .iter()
            .map(|group| {
                (
                    group.name.clone(),
                    Arc::new(ParamGroup {
                        name: group.name.clone(),
                        params: group
                            .params
                            .iter()
                            .map(|p| (p.key.clone(), p.value.clone()))
                            .collect(),
                    }),
                )
            })
            .collect();

        let mut caches = HashMap::new();
        for section in &config.caches {
            let store: Arc<dyn EntryStore> = match section.mode {
                CacheMode::FileSystem => {
                    let dir = section.dir.as_deref().unwrap_or_default();
                    let fs = FsCache::new(
                        dir,
                        section.max_size.unwrap_or(0),
                        section.max_items.unwrap_or(u64::MAX),
                    )
                    .map_err(|err| {
                        ConfigError(format!("cache {:?}: cannot open {dir:?}: {err}", section.name))
                    })?;
                    fs.start(shutdown.clone());
                    Arc::new(fs)
                }
                CacheMode::Memory => Arc::new(MemoryKv::new()),
            };
            let mut builder =
                ResponseCache::builder(section.name.clone(), store).ttl(section.expire);
            if let Some(grace) = section.grace_time {
                builder = builder.grace(grace);
            }
            caches.insert(section.name.clone(), Arc::new(builder.build()));
        }

        let mut clusters = HashMap::new();
        for section in &config.clusters {
            let heartbeat_credentials = section.users.first().map(|u| Credentials {
                user: u.name.clone(),
                password: u.password.clone(),
            });
            let mut heartbeat = HeartbeatConfig::default();
            if let Some(interval) = section.heartbeat.interval {
                heartbeat.interval = interval;
            }
            if let Some(timeout) = section.heartbeat.timeout {
                heartbeat.timeout = timeout;
            }
            if let Some(path) = &section.heartbeat.request {
                heartbeat.path = path.clone();
            }
            if let Some(expect) = &section.heartbeat.response {
                heartbeat.expect = expect.clone();
            }
            heartbeat.credentials = heartbeat_credentials;

            let replica_sections: Vec<(String, Vec<String>)> = if section.replicas.is_empty() {
                vec![("default".to_string(), section.nodes.clone())]
            } else {
                section
                    .replicas
                    .iter()
                    .map(|r| (r.name.clone(), r.nodes.clone()))
                    .collect()
            };

            let mut replicas = Vec::with_capacity(replica_sections.len());
            for (replica_name, node_addrs) in replica_sections {
                let mut nodes = Vec::with_capacity(node_addrs.len());
                for addr in &node_addrs {
                    let uri: http::Uri = format!("{}://{}", section.scheme, addr)
                        .parse()
                        .map_err(|err| {
                            ConfigError(format!(
                                "cluster {:?}: invalid node address {addr:?}: {err}",
                                section.name
                            ))
                        })?;
                    nodes.push(Arc::new(Node::new(uri, section.name.clone(), replica_name.clone())));
                }
                replicas.push(Arc::new(Replica::new(replica_name, nodes)));
            }

            let kill_query_user = section.kill_query_user.as_ref().map(|u| Credentials {
                user: u.name.clone(),
                password: u.password.clone(),
            });

            let topology = Arc::new(Cluster::new(
                section.name.clone(),
                replicas,
                kill_query_user,
                heartbeat.clone(),
            ));

            for node in topology.nodes() {
                spawn_heartbeat(
                    Arc::clone(node),
                    heartbeat.clone(),
                    probe_client.clone(),
                    shutdown.clone(),
                );
            }

            let mut backend_users = HashMap::new();
            for user in &section.users {
                let mut limits = LimitSet::builder(user.name.clone(), IdentityKind::BackendUser)
                    .max_concurrent_queries(user.max_concurrent_queries)
                    .requests_per_minute(user.requests_per_minute)
                    .max_queue_size(user.max_queue_size);
                if let Some(wait) = user.max_queue_wait {
                    limits = limits.max_queue_wait(wait);
                }
                let limits = limits.build();
                limits.start(shutdown.clone());

                let networks = Networks::parse(&user.allowed_networks)
                    .map_err(|err| ConfigError(format!("cluster user {:?}: {err}", user.name)))?;
                let mut backend = BackendUser::new(user.name.clone(), user.password.clone(), limits)
                    .allowed_networks(networks);
                if let Some(cap) = user.max_execution_time {
                    backend = backend.max_execution_time(cap);
                }
                backend_users.insert(user.name.clone(), Arc::new(backend));
            }

            clusters.insert(
                section.name.clone(),
                Arc::new(ClusterHandle {
                    topology,
                    users: backend_users,
                    retry_number: section.retry_number,
                }),
            );
        }

        let mut users = HashMap::new();
        for section in &config.users {
            let mut limits = LimitSet::builder(section.name.clone(), IdentityKind::User)
                .max_concurrent_queries(section.max_concurrent_queries)
                .requests_per_minute(section.requests_per_minute)
                .max_queue_size(section.max_queue_size);
            if let Some(wait) = section.max_queue_wait {
                limits = limits.max_queue_wait(wait);
            }
            let limits = limits.build();
            limits.start(shutdown.clone());

            let networks = Networks::parse(&section.allowed_networks)
                .map_err(|err| ConfigError(format!("user {:?}: {err}", section.name)))?;
            let mut user = User::new(
                section.name.clone(),
                section.password.clone(),
                section.to_cluster.clone(),
                section.to_user.clone(),
                limits,
            )
            .allowed_networks(networks)
            .deny_http(section.deny_http)
            .deny_https(section.deny_https)
            .allow_cors(section.allow_cors)
            .cache(section.cache.clone())
            .params(section.params.clone());
            if let Some(cap) = section.max_execution_time {
                user = user.max_execution_time(cap);
            }
            users.insert(section.name.clone(), Arc::new(user));
        }

        let http_networks = Networks::parse(&config.server.http.allowed_networks)
            .map_err(ConfigError)?;
        let metrics_networks = Networks::parse(&config.server.metrics.allowed_networks)
            .map_err(ConfigError)?;

        Ok(Self {
            users,
            clusters,
            caches,
            param_groups,
            http_networks,
            metrics_networks,
            shutdown,
        })
    }

    /// Stops every background task this generation spawned. Called
    /// when a new generation replaces it.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}
