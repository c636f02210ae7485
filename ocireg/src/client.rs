use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use oci_spec::image::{Descriptor, Digest, ImageIndex};
use reqwest::{Method, StatusCode, header::HeaderMap};
use tokio::io::{AsyncRead, AsyncSeek};

use crate::blob::{self, BlobPutOpts};
use crate::config::{HostConfig, HostMap};
use crate::error::{Error, Result};
use crate::manifest;
use crate::reference::Ref;
use crate::referrer::{self, ReferrerOpts};
use crate::reghttp::{Engine, EngineOpts, Req, Resp, do_req};
use crate::repo::{self, RepoList, RepoOpts};
use crate::tag::{self, TagList, TagOpts};
use crate::version::Version;
use crate::warning::WarningList;

// the user-facing handle. everything is interior-mutable and the type is
// cheap to clone, so one client is shared across tasks.

#[derive(Clone)]
pub struct Client {
    engine: Arc<Engine>,
    hosts: HostMap,
}

pub struct ClientBuilder {
    hosts: Vec<HostConfig>,
    opts: EngineOpts,
}

impl Default for ClientBuilder {
    fn default() -> ClientBuilder {
        ClientBuilder {
            hosts: Vec::new(),
            opts: EngineOpts::default(),
        }
    }
}

impl ClientBuilder {
    pub fn host(mut self, cfg: HostConfig) -> Self {
        self.hosts.push(cfg);
        self
    }

    pub fn retry_limit(mut self, limit: usize) -> Self {
        self.opts.retry_limit = limit.max(1);
        self
    }

    pub fn delay(mut self, init: Duration, max: Duration) -> Self {
        self.opts.delay_init = init;
        self.opts.delay_max = max.max(init);
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.opts.user_agent = ua.into();
        self
    }

    // per-host concurrency cap; 0 disables throttling
    pub fn throttle_capacity(mut self, capacity: usize) -> Self {
        self.opts.throttle_capacity = capacity;
        self
    }

    // sink for deduplicated `Warning: 299` messages
    pub fn warnings(mut self, sink: Arc<WarningList>) -> Self {
        self.opts.warnings = Some(sink);
        self
    }

    pub fn build(self) -> Client {
        let hosts = HostMap::new();
        hosts.load_all(self.hosts);
        Client {
            engine: Engine::new(hosts.clone(), self.opts),
            hosts,
        }
    }
}

// the registry scheme is the only one this crate speaks; layout refs and
// friends are routed a layer above
fn check_reg(r: &Ref) -> Result<()> {
    if r.is_registry() {
        Ok(())
    } else {
        Err(Error::InvalidReference(format!(
            "unsupported scheme {:?}",
            r.scheme()
        )))
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn new() -> Client {
        ClientBuilder::default().build()
    }

    // host configs may be added or replaced at any time; in-flight requests
    // keep the snapshot they started with
    pub fn host_set(&self, cfg: HostConfig) {
        self.hosts.set(cfg);
    }

    pub fn host_get(&self, host: &str) -> Arc<HostConfig> {
        self.hosts.get(host)
    }

    // --- ping -------------------------------------------------------------

    // GET /v2/: reachability, auth and the api version header
    pub async fn ping(&self, host: &str) -> Result<Ping> {
        let req = Req::new(host, Method::GET);
        let resp = do_req(&self.engine, req).await?;
        Ok(Ping {
            status: resp.status(),
            headers: resp.headers().clone(),
        })
    }

    // --- manifests --------------------------------------------------------

    pub async fn manifest_get(&self, r: &Ref) -> Result<(Descriptor, Bytes)> {
        check_reg(r)?;
        manifest::manifest_get(&self.engine, r).await
    }

    pub async fn manifest_head(&self, r: &Ref) -> Result<Descriptor> {
        check_reg(r)?;
        manifest::manifest_head(&self.engine, r).await
    }

    pub async fn manifest_put(&self, r: &Ref, media_type: &str, body: Bytes) -> Result<Digest> {
        check_reg(r)?;
        manifest::manifest_put(&self.engine, r, media_type, body).await
    }

    pub async fn manifest_delete(&self, r: &Ref) -> Result<()> {
        check_reg(r)?;
        manifest::manifest_delete(&self.engine, r).await
    }

    // --- blobs ------------------------------------------------------------

    // returns the verifying response handle; read it with chunk()/bytes()
    pub async fn blob_get(&self, r: &Ref, digest: &Digest) -> Result<Resp> {
        check_reg(r)?;
        blob::blob_get(&self.engine, r, digest).await
    }

    pub async fn blob_get_bytes(&self, r: &Ref, digest: &Digest) -> Result<Bytes> {
        self.blob_get(r, digest).await?.bytes().await
    }

    pub async fn blob_head(&self, r: &Ref, digest: &Digest) -> Result<Resp> {
        check_reg(r)?;
        blob::blob_head(&self.engine, r, digest).await
    }

    pub async fn blob_delete(&self, r: &Ref, digest: &Digest) -> Result<()> {
        check_reg(r)?;
        blob::blob_delete(&self.engine, r, digest).await
    }

    pub async fn blob_mount(&self, target: &Ref, source: &Ref, digest: &Digest) -> Result<()> {
        check_reg(target)?;
        check_reg(source)?;
        blob::blob_mount(&self.engine, target, source, digest).await
    }

    pub async fn blob_put<S>(&self, r: &Ref, opts: BlobPutOpts, src: S) -> Result<Descriptor>
    where
        S: AsyncRead + AsyncSeek + Send + Sync + Unpin + 'static,
    {
        check_reg(r)?;
        blob::blob_put(&self.engine, r, opts, src).await
    }

    // --- tags -------------------------------------------------------------

    pub async fn tag_list(&self, r: &Ref) -> Result<TagList> {
        check_reg(r)?;
        tag::tag_list(&self.engine, r, &TagOpts::default()).await
    }

    pub async fn tag_list_with(&self, r: &Ref, opts: &TagOpts) -> Result<TagList> {
        check_reg(r)?;
        tag::tag_list(&self.engine, r, opts).await
    }

    pub async fn tag_delete(&self, r: &Ref) -> Result<()> {
        check_reg(r)?;
        tag::tag_delete(&self.engine, r).await
    }

    // --- referrers --------------------------------------------------------

    pub async fn referrer_list(&self, r: &Ref) -> Result<ImageIndex> {
        check_reg(r)?;
        referrer::referrer_list(&self.engine, r, &ReferrerOpts::default()).await
    }

    pub async fn referrer_list_with(&self, r: &Ref, opts: &ReferrerOpts) -> Result<ImageIndex> {
        check_reg(r)?;
        referrer::referrer_list(&self.engine, r, opts).await
    }

    pub async fn referrer_put(
        &self,
        subject: &Ref,
        media_type: &str,
        body: Bytes,
    ) -> Result<Digest> {
        check_reg(subject)?;
        referrer::referrer_put(&self.engine, subject, media_type, body).await
    }

    // --- repositories -----------------------------------------------------

    pub async fn repo_list(&self, host: &str) -> Result<RepoList> {
        repo::repo_list(&self.engine, host, &RepoOpts::default()).await
    }

    pub async fn repo_list_with(&self, host: &str, opts: &RepoOpts) -> Result<RepoList> {
        repo::repo_list(&self.engine, host, opts).await
    }
}

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

pub struct Ping {
    status: StatusCode,
    headers: HeaderMap,
}

impl Ping {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    // `Docker-Distribution-API-Version: registry/2.0` parsed for feature
    // gating
    pub fn api_version(&self) -> Option<Version> {
        let raw = self
            .headers
            .get("docker-distribution-api-version")?
            .to_str()
            .ok()?;
        let raw = raw.rsplit_once('/').map(|(_, v)| v).unwrap_or(raw);
        Version::parse(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_api_version() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "docker-distribution-api-version",
            "registry/2.0".parse().unwrap(),
        );
        let ping = Ping {
            status: StatusCode::OK,
            headers,
        };
        assert_eq!(ping.api_version(), Some(Version::new(2, 0, 0)));
        assert!(ping.api_version().unwrap() >= Version::new(2, 0, 0));

        let ping = Ping {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        };
        assert_eq!(ping.api_version(), None);
    }

    #[test]
    fn test_check_reg() {
        let r = Ref::new("registry.example.test/proj:v1").unwrap();
        assert!(check_reg(&r).is_ok());
        let r = Ref::new("ocidir:///tmp/layout").unwrap();
        assert!(check_reg(&r).is_err());
    }

}
