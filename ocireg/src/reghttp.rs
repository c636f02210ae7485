use std::collections::{BTreeMap, BTreeSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, future::BoxFuture};
use log::{trace, warn};
use oci_spec::image::Digest;
use reqwest::{Method, StatusCode, Url, header};
use sha2::{Digest as _, Sha256, Sha512};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::auth::{Auth, Scope};
use crate::config::{HostConfig, HostMap};
use crate::error::{Error, Result};
use crate::throttle::{Throttle, ThrottleGuard};
use crate::warning::{WarningList, parse_warning_value};

pub(crate) const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

// the engine executes one logical request against a registry: pick an
// endpoint out of {host, mirrors}, take the host throttle slot, stamp auth,
// dispatch, and react to the status. retryable failures (5xx, 429, i/o)
// fail over to the next endpoint and back off between passes; auth and
// digest failures surface immediately.

// --- request ---------------------------------------------------------------

pub(crate) type StreamerFn = Arc<
    dyn Fn() -> BoxFuture<'static, std::io::Result<Box<dyn AsyncRead + Send + Sync + Unpin>>>
        + Send
        + Sync,
>;

// a body that can be replayed on retry: fixed bytes clone for free, a
// streamer is invoked once per attempt
#[derive(Clone, Default)]
pub(crate) enum BodySource {
    #[default]
    None,
    Bytes(Bytes),
    Streamer(StreamerFn),
}

#[derive(Clone)]
pub(crate) struct Req {
    pub host: String,
    pub method: Method,
    pub repository: String,
    // appended to the per-host api prefix /v2/<pathPrefix>/<repository>/
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: BodySource,
    pub content_len: Option<u64>,
    // bypasses prefix computation, used to follow upload locations
    pub direct_url: Option<Url>,
    // expected content digest, verified on the streaming body
    pub digest: Option<Digest>,
    // appended to the method-derived scopes (cross-repo mount, catalog)
    pub extra_scope: Option<Scope>,
    // statuses outside 2xx the caller wants handed back instead of classified
    pub extra_ok: Vec<StatusCode>,
    // writes must not fail over to read mirrors
    pub no_mirrors: bool,
    // capability probes: no failover bookkeeping, no backoff passes
    pub ignore_err: bool,
}

impl Req {
    pub fn new(host: impl Into<String>, method: Method) -> Req {
        Req {
            host: host.into(),
            method,
            repository: String::new(),
            path: String::new(),
            query: Vec::new(),
            headers: Vec::new(),
            body: BodySource::None,
            content_len: None,
            direct_url: None,
            digest: None,
            extra_scope: None,
            extra_ok: Vec::new(),
            no_mirrors: false,
            ignore_err: false,
        }
    }

    fn is_read(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }
}

// --- engine ----------------------------------------------------------------

pub(crate) struct EngineOpts {
    pub retry_limit: usize,
    pub delay_init: Duration,
    pub delay_max: Duration,
    pub user_agent: String,
    // per-host concurrency cap; 0 disables throttling
    pub throttle_capacity: usize,
    pub warnings: Option<Arc<WarningList>>,
}

impl Default for EngineOpts {
    fn default() -> EngineOpts {
        EngineOpts {
            retry_limit: 5,
            delay_init: Duration::from_secs(1),
            delay_max: Duration::from_secs(30),
            user_agent: format!("ocireg/{}", env!("CARGO_PKG_VERSION")),
            throttle_capacity: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(3),
            warnings: None,
        }
    }
}

pub(crate) struct Engine {
    hosts: HostMap,
    auth: Auth,
    opts: EngineOpts,
    // lazily built per host: tls trust, client identity, redirect policy
    clients: StdMutex<BTreeMap<String, reqwest::Client>>,
    throttles: StdMutex<BTreeMap<String, Arc<Throttle>>>,
}

enum AttemptOutcome {
    Ok(Resp),
    Fatal(Error),
    NotFound(Error),
    Retry(Error, Option<Duration>),
}

impl Engine {
    pub fn new(hosts: HostMap, opts: EngineOpts) -> Arc<Engine> {
        Arc::new(Engine {
            hosts,
            auth: Auth::new(),
            opts,
            clients: StdMutex::new(BTreeMap::new()),
            throttles: StdMutex::new(BTreeMap::new()),
        })
    }

    pub fn hosts(&self) -> &HostMap {
        &self.hosts
    }

    // host plus its mirrors for reads, ordered by priority (desc, stable)
    fn candidates(&self, req: &Req, primary: &Arc<HostConfig>) -> Vec<Arc<HostConfig>> {
        let mut list = vec![primary.clone()];
        if req.is_read() && !req.no_mirrors {
            for mirror in &primary.mirrors {
                list.push(self.hosts.get(mirror));
            }
        }
        list.sort_by_key(|cfg| std::cmp::Reverse(cfg.priority));
        list
    }

    fn scopes_for(&self, req: &Req) -> Vec<Scope> {
        let mut scopes = Vec::new();
        if !req.repository.is_empty() {
            let actions: &[&str] = if req.is_read() {
                &["pull"]
            } else {
                &["pull", "push"]
            };
            scopes.push(Scope::repo(&req.repository, actions));
        }
        if let Some(extra) = &req.extra_scope {
            scopes.push(extra.clone());
        }
        scopes
    }

    pub(crate) fn endpoint_base(&self, host: &str) -> Result<Url> {
        let cfg = self.hosts.get(host);
        let raw = format!("{}://{}/", cfg.scheme(), cfg.hostname());
        Url::parse(&raw).map_err(|_| Error::ParseFailure(format!("endpoint url {raw}")))
    }

    fn build_url(&self, cfg: &HostConfig, req: &Req) -> Result<Url> {
        let mut url = match &req.direct_url {
            Some(u) => u.clone(),
            None => {
                let mut raw = format!("{}://{}/v2", cfg.scheme(), cfg.hostname());
                if let Some(prefix) = cfg.path_prefix.as_deref().filter(|p| !p.is_empty()) {
                    raw.push('/');
                    raw.push_str(prefix.trim_matches('/'));
                }
                if !req.repository.is_empty() {
                    raw.push('/');
                    raw.push_str(&req.repository);
                }
                raw.push('/');
                raw.push_str(&req.path);
                Url::parse(&raw).map_err(|_| Error::ParseFailure(format!("request url {raw}")))?
            }
        };
        if !req.query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(req.query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        Ok(url)
    }

    fn client_for(&self, cfg: &HostConfig) -> Result<reqwest::Client> {
        if let Some(client) = self.clients.lock().expect("client lock poisoned").get(&cfg.name) {
            return Ok(client.clone());
        }
        let mut builder = reqwest::Client::builder()
            .user_agent(self.opts.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(5));
        if cfg.tls == crate::config::Tls::Insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(pem) = cfg.reg_cert.as_deref() {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem.as_bytes())?);
        }
        if let (Some(cert), Some(key)) = (cfg.client_cert.as_deref(), cfg.client_key.as_deref()) {
            let identity = format!("{cert}\n{key}");
            builder = builder.identity(reqwest::Identity::from_pem(identity.as_bytes())?);
        }
        let client = builder.build()?;
        self.clients
            .lock()
            .expect("client lock poisoned")
            .entry(cfg.name.clone())
            .or_insert(client.clone());
        Ok(client)
    }

    fn throttle_for(&self, cfg: &HostConfig) -> Option<Arc<Throttle>> {
        if self.opts.throttle_capacity == 0 {
            return None;
        }
        let mut throttles = self.throttles.lock().expect("throttle lock poisoned");
        Some(
            throttles
                .entry(cfg.hostname().to_string())
                .or_insert_with(|| {
                    Arc::new(Throttle::new(
                        cfg.hostname(),
                        self.opts.throttle_capacity,
                        cfg.req_per_sec,
                    ))
                })
                .clone(),
        )
    }

    fn collect_warnings(&self, headers: &header::HeaderMap) {
        let Some(sink) = &self.opts.warnings else {
            return;
        };
        for value in headers.get_all(header::WARNING) {
            if let Some(msg) = value.to_str().ok().and_then(parse_warning_value) {
                sink.handle(msg);
            }
        }
    }
}

// executes a logical request, failing over across {host, mirrors} and
// backing off between passes until a success, a fatal error, or the retry
// budget runs out
pub(crate) async fn do_req(engine: &Arc<Engine>, req: Req) -> Result<Resp> {
    let primary = engine.hosts.get(&req.host);
    if req.method == Method::HEAD && primary.head_disabled() {
        return Err(Error::UnsupportedApi(format!("head on {}", primary.name)));
    }
    let candidates = engine.candidates(&req, &primary);

    let mut dead: BTreeSet<String> = BTreeSet::new();
    let mut retries = 0usize;
    let mut delay = engine.opts.delay_init;
    let mut last_err: Option<Error> = None;
    loop {
        let mut live = 0usize;
        let mut retryable_this_pass = false;
        let mut retry_after_hint: Option<Duration> = None;
        for cfg in &candidates {
            let key = cfg.endpoint_key();
            if dead.contains(&key) {
                continue;
            }
            live += 1;
            match attempt(engine, cfg, &req).await {
                AttemptOutcome::Ok(resp) => return Ok(resp),
                AttemptOutcome::Fatal(e) => return Err(e),
                AttemptOutcome::NotFound(e) => {
                    if req.ignore_err {
                        return Err(e);
                    }
                    dead.insert(key);
                    last_err = Some(e);
                }
                AttemptOutcome::Retry(e, after) => {
                    trace!(
                        "retryable failure on {} for {}: {}",
                        cfg.hostname(),
                        req.path,
                        e
                    );
                    last_err = Some(e);
                    retryable_this_pass = true;
                    if after.is_some() {
                        retry_after_hint = after;
                    }
                    if !req.ignore_err {
                        retries += 1;
                        if retries >= engine.opts.retry_limit {
                            let last = last_err.take().expect("assigned above");
                            return Err(Error::RetryLimitExceeded(Box::new(last)));
                        }
                    }
                }
            }
        }
        if live == 0 || !retryable_this_pass || req.ignore_err {
            break;
        }
        let sleep_for = retry_after_hint.unwrap_or_else(|| jitter(delay));
        trace!("backing off {:?} before retrying {}", sleep_for, req.host);
        tokio::time::sleep(sleep_for).await;
        delay = (delay * 2).min(engine.opts.delay_max);
    }
    Err(last_err.unwrap_or(Error::NotFound))
}

async fn attempt(engine: &Arc<Engine>, cfg: &Arc<HostConfig>, req: &Req) -> AttemptOutcome {
    if req.method == Method::HEAD && cfg.head_disabled() {
        return AttemptOutcome::Fatal(Error::UnsupportedApi(format!("head on {}", cfg.name)));
    }
    let client = match engine.client_for(cfg) {
        Ok(c) => c,
        Err(e) => return AttemptOutcome::Fatal(e),
    };
    let throttle = engine.throttle_for(cfg);
    let mut permit = None;
    if let Some(throttle) = &throttle {
        permit = match throttle.acquire().await {
            Ok(p) => Some(p),
            Err(e) => return AttemptOutcome::Fatal(e),
        };
        throttle.pace().await;
    }

    let url = match engine.build_url(cfg, req) {
        Ok(u) => u,
        Err(e) => return AttemptOutcome::Fatal(e),
    };
    let want = engine.scopes_for(req);

    // the inner loop is the auth dance: a 401 that produces a new challenge
    // earns an immediate resend that does not count against the retry budget
    for _ in 0..2 {
        let mut rb = client.request(req.method.clone(), url.clone());
        for (k, v) in &req.headers {
            rb = rb.header(k.as_str(), v.as_str());
        }
        if let Some(len) = req.content_len {
            rb = rb.header(header::CONTENT_LENGTH, len);
        }
        match &req.body {
            BodySource::None => {}
            BodySource::Bytes(b) => {
                rb = rb.body(b.clone());
            }
            BodySource::Streamer(factory) => {
                let reader = match factory().await {
                    Ok(r) => r,
                    Err(e) => return AttemptOutcome::Fatal(e.into()),
                };
                rb = rb.body(reqwest::Body::wrap_stream(
                    tokio_util::io::ReaderStream::new(reader),
                ));
            }
        }
        rb = engine.auth.stamp(cfg, &req.repository, rb).await;

        let res = match rb.send().await {
            Ok(r) => r,
            Err(e) => return AttemptOutcome::Retry(Error::Reqwest(e), None),
        };
        engine.collect_warnings(res.headers());
        let status = res.status();

        if req.extra_ok.contains(&status) {
            return AttemptOutcome::Ok(wrap_resp(engine, cfg, req, permit.take(), res));
        }
        match status {
            StatusCode::UNAUTHORIZED => {
                match engine
                    .auth
                    .handle_challenge(cfg, &req.repository, res.headers(), &want, &client)
                    .await
                {
                    Ok(()) => continue,
                    Err(Error::NoNewChallenge) => {
                        return AttemptOutcome::Fatal(Error::HttpUnauthorized(ident(cfg, req)));
                    }
                    Err(e) => return AttemptOutcome::Fatal(e),
                }
            }
            // some registries use 403 for auth errors
            StatusCode::FORBIDDEN => {
                return AttemptOutcome::Fatal(Error::HttpUnauthorized(ident(cfg, req)));
            }
            StatusCode::NOT_FOUND => return AttemptOutcome::NotFound(Error::NotFound),
            StatusCode::TOO_MANY_REQUESTS => {
                return AttemptOutcome::Retry(Error::RateLimit, retry_after(res.headers()));
            }
            s if s.is_server_error() => {
                return AttemptOutcome::Retry(Error::HttpStatus(s), None);
            }
            s if s.is_success() => {
                if let Some(expect) = &req.digest {
                    if let Err(e) = check_header_digest(res.headers(), expect) {
                        return AttemptOutcome::Fatal(e);
                    }
                }
                return AttemptOutcome::Ok(wrap_resp(engine, cfg, req, permit.take(), res));
            }
            s => return AttemptOutcome::Fatal(Error::HttpStatus(s)),
        }
    }
    // two 401s in a row even though the challenges were accepted
    AttemptOutcome::Fatal(Error::HttpUnauthorized(ident(cfg, req)))
}

fn wrap_resp(
    engine: &Arc<Engine>,
    cfg: &Arc<HostConfig>,
    req: &Req,
    permit: Option<ThrottleGuard>,
    res: reqwest::Response,
) -> Resp {
    let status = res.status();
    let headers = res.headers().clone();
    let accept_ranges = headers
        .get(header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("bytes"))
        .unwrap_or(false);
    let content_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let digester = if req.method == Method::HEAD {
        None
    } else {
        req.digest.as_ref().and_then(Digester::for_digest)
    };
    Resp {
        engine: engine.clone(),
        req: req.clone(),
        status,
        headers,
        stream: if req.method == Method::HEAD {
            None
        } else {
            Some(res.bytes_stream().boxed())
        },
        permit,
        digester,
        expect: req.digest.clone(),
        total: content_len,
        accept_ranges,
        read: 0,
        discard: 0,
        retries_left: engine.opts.retry_limit as u32,
        done: false,
        _cfg: cfg.clone(),
    }
}

fn ident(cfg: &HostConfig, req: &Req) -> String {
    if req.repository.is_empty() {
        cfg.name.clone()
    } else {
        format!("{}/{}", cfg.name, req.repository)
    }
}

// full jitter over the upper half of the window so concurrent retries
// spread out
fn jitter(d: Duration) -> Duration {
    use rand::Rng;
    let ms = d.as_millis().max(2) as u64;
    Duration::from_millis(rand::rng().random_range(ms / 2..=ms))
}

fn retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub(crate) fn docker_content_digest(headers: &header::HeaderMap) -> Result<Option<Digest>> {
    headers
        .get(DOCKER_CONTENT_DIGEST)
        .map(|value| -> Result<Digest> {
            value
                .to_str()
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::ParseFailure("docker-content-digest header".to_string()))
        })
        .transpose()
}

fn check_header_digest(headers: &header::HeaderMap, expect: &Digest) -> Result<()> {
    if let Some(header_digest) = docker_content_digest(headers)? {
        if header_digest != *expect {
            return Err(Error::DigestMismatch {
                expected: expect.to_string(),
                computed: header_digest.to_string(),
            });
        }
    }
    Ok(())
}

// --- digesting -------------------------------------------------------------

pub(crate) enum Digester {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Digester {
    pub fn sha256() -> Digester {
        Digester::Sha256(Sha256::new())
    }

    pub fn for_digest(d: &Digest) -> Option<Digester> {
        match d.algorithm().as_ref() {
            "sha256" => Some(Digester::Sha256(Sha256::new())),
            "sha512" => Some(Digester::Sha512(Sha512::new())),
            _ => None,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Digester::Sha256(h) => h.update(data),
            Digester::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        match self {
            Digester::Sha256(h) => {
                use std::str::FromStr;
                oci_spec::image::Sha256Digest::from_str(&hex::encode(h.finalize()))
                    .expect("sha256 hex is always a valid digest")
                    .into()
            }
            Digester::Sha512(h) => format!("sha512:{}", hex::encode(h.finalize()))
                .parse()
                .expect("sha512 hex is always a valid digest"),
        }
    }
}

pub(crate) fn digest_of(data: &[u8]) -> Digest {
    let mut d = Digester::sha256();
    d.update(data);
    d.finalize()
}

// --- response --------------------------------------------------------------

type BodyStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

// a response handle with a verifying, resumable body. reading tees into a
// hasher when a digest was expected; hitting eof compares the computed
// digest and the delivered length. a transport error mid-read re-issues the
// request, with a `Range` offset when the server advertised byte ranges and
// a restart-plus-discard replay when it did not.
pub struct Resp {
    engine: Arc<Engine>,
    req: Req,
    status: StatusCode,
    headers: header::HeaderMap,
    stream: Option<BodyStream>,
    // slot on the host throttle, freed when the body is drained or dropped
    permit: Option<ThrottleGuard>,
    digester: Option<Digester>,
    expect: Option<Digest>,
    total: Option<u64>,
    accept_ranges: bool,
    read: u64,
    discard: u64,
    retries_left: u32,
    done: bool,
    _cfg: Arc<HostConfig>,
}

impl Resp {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &header::HeaderMap {
        &self.headers
    }

    pub fn content_length(&self) -> Option<u64> {
        self.total
    }

    pub fn header_digest(&self) -> Result<Option<Digest>> {
        docker_content_digest(&self.headers)
    }

    // next slice of the body; Ok(None) is a verified eof
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.done {
                return Ok(None);
            }
            let Some(stream) = self.stream.as_mut() else {
                self.done = true;
                return Ok(None);
            };
            match stream.next().await {
                Some(Ok(mut chunk)) => {
                    if self.discard > 0 {
                        // replaying from zero after a restart, drop what was
                        // already delivered
                        if (chunk.len() as u64) <= self.discard {
                            self.discard -= chunk.len() as u64;
                            continue;
                        }
                        chunk = chunk.split_off(self.discard as usize);
                        self.discard = 0;
                    }
                    if chunk.is_empty() {
                        continue;
                    }
                    if let Some(d) = self.digester.as_mut() {
                        d.update(&chunk);
                    }
                    self.read += chunk.len() as u64;
                    return Ok(Some(chunk));
                }
                Some(Err(e)) => self.recover(Error::Reqwest(e)).await?,
                None => {
                    self.finish()?;
                    return Ok(None);
                }
            }
        }
    }

    // repositions the body by re-issuing a ranged request. seeking to zero
    // restarts verification from scratch; any other offset drops digest
    // verification since the hash is sequential.
    pub async fn seek(&mut self, offset: u64) -> Result<()> {
        let mut req = self.req.clone();
        if offset > 0 {
            req.headers
                .push(("range".to_string(), format!("bytes={offset}-")));
        }
        let next = do_req(&self.engine, req).await?;
        match next.status {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => {}
            s => return Err(Error::HttpStatus(s)),
        }
        self.discard = if offset > 0 && next.status == StatusCode::OK {
            // server ignored the range, replay and drop the prefix
            offset
        } else {
            0
        };
        self.digester = if offset == 0 {
            self.expect.as_ref().and_then(Digester::for_digest)
        } else {
            None
        };
        self.total = match next.total {
            Some(len) if next.status == StatusCode::PARTIAL_CONTENT => Some(offset + len),
            other => other,
        };
        self.read = offset;
        self.done = false;
        self.stream = next.stream;
        self.permit = next.permit;
        Ok(())
    }

    async fn recover(&mut self, err: Error) -> Result<()> {
        if self.req.method != Method::GET || self.retries_left == 0 || !err.is_retryable() {
            return Err(err);
        }
        self.retries_left -= 1;
        let resume = self.accept_ranges && self.read > 0;
        warn!(
            "read of {}/{} failed at offset {}, retrying ({}): {}",
            self.req.host,
            self.req.path,
            self.read,
            if resume { "range resume" } else { "restart" },
            err
        );
        let mut req = self.req.clone();
        if resume {
            req.headers
                .push(("range".to_string(), format!("bytes={}-", self.read)));
            req.extra_ok.push(StatusCode::PARTIAL_CONTENT);
        }
        let next = do_req(&self.engine, req).await?;
        match next.status {
            StatusCode::PARTIAL_CONTENT if resume => {
                // continue where the digester stopped
            }
            StatusCode::OK => {
                // full restart, drop the bytes already handed out
                self.discard = self.read;
                if let Some(len) = next.total {
                    self.total = Some(len);
                }
            }
            s => return Err(Error::HttpStatus(s)),
        }
        self.stream = next.stream;
        self.permit = next.permit;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.done = true;
        self.permit = None;
        if let Some(total) = self.total {
            if self.read != total {
                return Err(Error::ShortRead {
                    expected: total,
                    read: self.read,
                });
            }
        }
        if let (Some(digester), Some(expect)) = (self.digester.take(), self.expect.as_ref()) {
            let computed = digester.finalize();
            if computed != *expect {
                return Err(Error::DigestMismatch {
                    expected: expect.to_string(),
                    computed: computed.to_string(),
                });
            }
        }
        Ok(())
    }

    // drains the body into memory, verifying on the way
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.total.unwrap_or(4096).min(1 << 20) as usize);
        while let Some(chunk) = self.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    pub async fn copy_to<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> Result<u64> {
        let mut copied = 0u64;
        while let Some(chunk) = self.chunk().await? {
            copied += chunk.len() as u64;
            writer.write_all(&chunk).await?;
        }
        writer.flush().await?;
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let d = jitter(Duration::from_millis(1000));
            assert!(d >= Duration::from_millis(500));
            assert!(d <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_retry_after() {
        let mut headers = header::HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(header::RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(header::RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_digest_of() {
        // sha256 of the empty string
        assert_eq!(
            digest_of(b"").to_string(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_digester_sha512() {
        let d = Digest::try_from(format!("sha512:{}", "ab".repeat(64)).as_str());
        assert!(d.is_ok());
        let mut hasher = Digester::for_digest(&d.unwrap()).unwrap();
        hasher.update(b"abc");
        let out = hasher.finalize();
        assert!(out.to_string().starts_with("sha512:ddaf35a1"));
    }

    #[test]
    fn test_build_url() {
        let engine = Engine::new(HostMap::new(), EngineOpts::default());
        let mut cfg = HostConfig::new("registry.example.test");
        cfg.tls = crate::config::Tls::Disabled;
        let mut req = Req::new("registry.example.test", Method::GET);
        req.repository = "proj/app".to_string();
        req.path = "manifests/latest".to_string();
        let url = engine.build_url(&cfg, &req).unwrap();
        assert_eq!(
            url.as_str(),
            "http://registry.example.test/v2/proj/app/manifests/latest"
        );

        cfg.path_prefix = Some("mirror".to_string());
        req.query.push(("n".to_string(), "5".to_string()));
        let url = engine.build_url(&cfg, &req).unwrap();
        assert_eq!(
            url.as_str(),
            "http://registry.example.test/v2/mirror/proj/app/manifests/latest?n=5"
        );
    }

    #[test]
    fn test_candidates_order() {
        let hosts = HostMap::new();
        let mut primary = HostConfig::new("main.example.test");
        primary.mirrors = vec!["m1.example.test".to_string(), "m2.example.test".to_string()];
        let mut m1 = HostConfig::new("m1.example.test");
        m1.priority = 5;
        let mut m2 = HostConfig::new("m2.example.test");
        m2.priority = 10;
        hosts.load_all([primary, m1, m2]);
        let engine = Engine::new(hosts.clone(), EngineOpts::default());

        let req = Req::new("main.example.test", Method::GET);
        let primary = hosts.get("main.example.test");
        let order: Vec<String> = engine
            .candidates(&req, &primary)
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert_eq!(order, ["m2.example.test", "m1.example.test", "main.example.test"]);

        // writes stay on the primary
        let req = Req::new("main.example.test", Method::PUT);
        assert_eq!(engine.candidates(&req, &primary).len(), 1);

        // no_mirrors pins reads too
        let mut req = Req::new("main.example.test", Method::GET);
        req.no_mirrors = true;
        assert_eq!(engine.candidates(&req, &primary).len(), 1);
    }

    #[test]
    fn test_scopes_for() {
        let engine = Engine::new(HostMap::new(), EngineOpts::default());
        let mut req = Req::new("h", Method::GET);
        req.repository = "proj".to_string();
        assert_eq!(engine.scopes_for(&req)[0].to_string(), "repository:proj:pull");
        req.method = Method::PUT;
        assert_eq!(
            engine.scopes_for(&req)[0].to_string(),
            "repository:proj:pull,push"
        );
        req.extra_scope = Some(Scope::repo("other", &["pull"]));
        assert_eq!(engine.scopes_for(&req).len(), 2);
    }
}
