//! Resolved frontend and backend identities.
//!
//! Both types are built at config apply, held in `Arc`s inside the
//! generation, and never mutated in place; a reload builds a fresh set
//! while in-flight scopes keep their old references.

use crate::auth::Networks;
use palisade_admission::LimitSet;
use std::time::Duration;

/// Execution cap applied when neither side configures one.
pub const DEFAULT_MAX_EXECUTION_TIME: Duration = Duration::from_secs(120);

/// A frontend identity the client authenticates as.
#[derive(Debug)]
pub struct User {
    name: String,
    password: String,
    to_cluster: String,
    to_user: String,
    limits: LimitSet,
    max_execution_time: Duration,
    allowed_networks: Networks,
    deny_http: bool,
    deny_https: bool,
    allow_cors: bool,
    cache: Option<String>,
    params: Option<String>,
}

impl User {
    pub fn new(
        name: impl Into<String>,
        password: impl Into<String>,
        to_cluster: impl Into<String>,
        to_user: impl Into<String>,
        limits: LimitSet,
    ) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
            to_cluster: to_cluster.into(),
            to_user: to_user.into(),
            limits,
            max_execution_time: DEFAULT_MAX_EXECUTION_TIME,
            allowed_networks: Networks::default(),
            deny_http: false,
            deny_https: false,
            allow_cors: false,
            cache: None,
            params: None,
        }
    }

    pub fn max_execution_time(mut self, cap: Duration) -> Self {
        if !cap.is_zero() {
            self.max_execution_time = cap;
        }
        self
    }

    pub fn allowed_networks(mut self, networks: Networks) -> Self {
        self.allowed_networks = networks;
        self
    }

    pub fn deny_http(mut self, deny: bool) -> Self {
        self.deny_http = deny;
        self
    }

    pub fn deny_https(mut self, deny: bool) -> Self {
        self.deny_https = deny;
        self
    }

    pub fn allow_cors(mut self, allow: bool) -> Self {
        self.allow_cors = allow;
        self
    }

    pub fn cache(mut self, cache: Option<String>) -> Self {
        self.cache = cache;
        self
    }

    pub fn params(mut self, params: Option<String>) -> Self {
        self.params = params;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn password_matches(&self, candidate: &str) -> bool {
        self.password == candidate
    }

    pub fn to_cluster(&self) -> &str {
        &self.to_cluster
    }

    pub fn to_user(&self) -> &str {
        &self.to_user
    }

    pub fn limits(&self) -> &LimitSet {
        &self.limits
    }

    pub fn execution_cap(&self) -> Duration {
        self.max_execution_time
    }

    pub fn networks(&self) -> &Networks {
        &self.allowed_networks
    }

    pub fn denies_http(&self) -> bool {
        self.deny_http
    }

    pub fn denies_https(&self) -> bool {
        self.deny_https
    }

    pub fn cors_allowed(&self) -> bool {
        self.allow_cors
    }

    pub fn cache_name(&self) -> Option<&str> {
        self.cache.as_deref()
    }

    pub fn param_group(&self) -> Option<&str> {
        self.params.as_deref()
    }
}

/// The backend-side identity a frontend user maps onto.
#[derive(Debug)]
pub struct BackendUser {
    name: String,
    password: String,
    limits: LimitSet,
    max_execution_time: Duration,
    allowed_networks: Networks,
}

impl BackendUser {
    pub fn new(name: impl Into<String>, password: impl Into<String>, limits: LimitSet) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
            limits,
            max_execution_time: DEFAULT_MAX_EXECUTION_TIME,
            allowed_networks: Networks::default(),
        }
    }

    pub fn max_execution_time(mut self, cap: Duration) -> Self {
        if !cap.is_zero() {
            self.max_execution_time = cap;
        }
        self
    }

    pub fn allowed_networks(mut self, networks: Networks) -> Self {
        self.allowed_networks = networks;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn limits(&self) -> &LimitSet {
        &self.limits
    }

    pub fn execution_cap(&self) -> Duration {
        self.max_execution_time
    }

    pub fn networks(&self) -> &Networks {
        &self.allowed_networks
    }
}

/// Named set of default query parameters a user can be pinned to.
#[derive(Debug, Clone, Default)]
pub struct ParamGroup {
    pub name: String,
    pub params: Vec<(String, String)>,
}
