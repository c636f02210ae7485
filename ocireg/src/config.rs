use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;

// per-registry connection parameters. external loaders (docker config,
// host files) build these and merge them into a HostMap; from this crate's
// point of view a HostConfig is read-only.

pub const DEFAULT_BLOB_CHUNK: u64 = 1 << 20;
pub const DEFAULT_BLOB_MAX: i64 = 1 << 30;
pub const DEFAULT_CRED_EXPIRE_SECS: u64 = 3600;

// apiOpts key that upgrades HEAD requests to GET for registries that reject
// or mishandle HEAD
pub const API_OPT_DISABLE_HEAD: &str = "disableHead";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tls {
    #[default]
    Enabled,
    // https without certificate verification
    Insecure,
    // plain http
    Disabled,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostConfig {
    // the registry name requests are keyed by
    pub name: String,
    // actual dns endpoint when it differs from name
    pub hostname: String,
    pub tls: Tls,
    // pem content: server trust anchor and client mtls pair
    pub reg_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
    pub user: Option<String>,
    pub pass: Option<String>,
    // identity token, used for the refresh_token grant
    pub token: Option<String>,
    // external `docker-credential-<name>` subprocess
    pub cred_helper: Option<String>,
    // key passed to the helper when it differs from hostname
    pub cred_host: Option<String>,
    // helper-result freshness bound, seconds
    pub cred_expire: Option<u64>,
    // prepended to every repository path, for registries hosting multiple
    // namespaces on one endpoint
    pub path_prefix: Option<String>,
    pub mirrors: Vec<String>,
    // higher priority endpoints are attempted first
    pub priority: u32,
    // scope auth tokens per repository instead of per host
    pub repo_auth: bool,
    // preferred upload chunk size in bytes, 0 means engine default
    pub blob_chunk: u64,
    // threshold above which a monolithic put is not attempted;
    // -1 disables monolithic entirely, 0 means engine default
    pub blob_max: i64,
    pub req_per_sec: Option<f64>,
    pub api_opts: BTreeMap<String, String>,
}

impl Default for HostConfig {
    fn default() -> HostConfig {
        HostConfig {
            name: String::new(),
            hostname: String::new(),
            tls: Tls::Enabled,
            reg_cert: None,
            client_cert: None,
            client_key: None,
            user: None,
            pass: None,
            token: None,
            cred_helper: None,
            cred_host: None,
            cred_expire: None,
            path_prefix: None,
            mirrors: Vec::new(),
            priority: 0,
            repo_auth: false,
            blob_chunk: 0,
            blob_max: 0,
            req_per_sec: None,
            api_opts: BTreeMap::new(),
        }
    }
}

impl HostConfig {
    pub fn new(name: impl Into<String>) -> HostConfig {
        let name = name.into();
        // the hub's canonical name does not serve the api itself
        let hostname = if name == "docker.io" {
            "registry-1.docker.io".to_string()
        } else {
            String::new()
        };
        HostConfig {
            name,
            hostname,
            ..Default::default()
        }
    }

    pub fn hostname(&self) -> &str {
        if self.hostname.is_empty() {
            &self.name
        } else {
            &self.hostname
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self.tls {
            Tls::Disabled => "http",
            _ => "https",
        }
    }

    pub fn blob_chunk(&self) -> u64 {
        if self.blob_chunk == 0 {
            DEFAULT_BLOB_CHUNK
        } else {
            self.blob_chunk
        }
    }

    // None when monolithic uploads are disabled
    pub fn blob_max(&self) -> Option<u64> {
        match self.blob_max {
            n if n < 0 => None,
            0 => Some(DEFAULT_BLOB_MAX as u64),
            n => Some(n as u64),
        }
    }

    pub fn api_opt(&self, key: &str) -> Option<&str> {
        self.api_opts.get(key).map(|s| s.as_str())
    }

    pub fn head_disabled(&self) -> bool {
        self.api_opt(API_OPT_DISABLE_HEAD) == Some("true")
    }

    // identity of the concrete endpoint, used by the engine's per-call
    // tried set: aliased names resolving to the same endpoint and prefix
    // must collapse to one entry
    pub(crate) fn endpoint_key(&self) -> String {
        format!(
            "{}/{}",
            self.hostname(),
            self.path_prefix.as_deref().unwrap_or("")
        )
    }
}

// process-wide host lookup. the map is copy-on-write: loads clone the
// current snapshot, apply, and swap, so readers never take a lock
#[derive(Clone, Default)]
pub struct HostMap {
    inner: Arc<ArcSwap<BTreeMap<String, Arc<HostConfig>>>>,
}

impl HostMap {
    pub fn new() -> HostMap {
        HostMap::default()
    }

    // unknown hosts resolve to a default config for that name so callers
    // can talk to a registry without configuring it first
    pub fn get(&self, host: &str) -> Arc<HostConfig> {
        match self.inner.load().get(host) {
            Some(cfg) => cfg.clone(),
            None => Arc::new(HostConfig::new(host)),
        }
    }

    pub fn get_configured(&self, host: &str) -> Option<Arc<HostConfig>> {
        self.inner.load().get(host).cloned()
    }

    pub fn set(&self, cfg: HostConfig) {
        let mut next: BTreeMap<_, _> = (**self.inner.load()).clone();
        next.insert(cfg.name.clone(), Arc::new(cfg));
        self.inner.store(Arc::new(next));
    }

    pub fn load_all(&self, configs: impl IntoIterator<Item = HostConfig>) {
        let mut next: BTreeMap<_, _> = (**self.inner.load()).clone();
        for cfg in configs {
            next.insert(cfg.name.clone(), Arc::new(cfg));
        }
        self.inner.store(Arc::new(next));
    }
}
