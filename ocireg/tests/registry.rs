// end-to-end scenarios against in-process mock registries. the generic mock
// is a tiny in-memory registry (manifests, blobs, chunked uploads with a
// scriptable 416 truncation); auth, failover and warning behaviors get
// bespoke servers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use sha2::Digest as _;

use ocireg::{BlobPutOpts, Client, Error, HostConfig, Ref, TagOpts, Tls, WarningList};

fn sha256_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(sha2::Sha256::digest(data)))
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("127.0.0.1:{}", addr.port())
}

fn test_client(host: &str) -> Client {
    let mut cfg = HostConfig::new(host);
    cfg.tls = Tls::Disabled;
    Client::builder()
        .host(cfg)
        .delay(Duration::from_millis(10), Duration::from_millis(50))
        .build()
}

// --- generic in-memory registry --------------------------------------------

#[derive(Default)]
struct RegState {
    // key: "repo/tag" or "repo/sha256:..."
    manifests: Mutex<HashMap<String, (String, Bytes)>>,
    blobs: Mutex<HashMap<String, Bytes>>,
    uploads: Mutex<HashMap<String, Vec<u8>>>,
    upload_seq: AtomicU64,
    // scripted 416: when a patch arrives at .0, keep only .1 bytes of it and
    // report the shortened range back
    truncate: Mutex<Option<(u64, usize)>>,
    patch_ranges: Mutex<Vec<(u64, u64)>>,
    upload_posts: AtomicU32,
}

impl RegState {
    fn put_manifest(&self, repo: &str, reference: &str, media: &str, body: &[u8]) {
        let body = Bytes::copy_from_slice(body);
        let digest = sha256_of(&body);
        let mut manifests = self.manifests.lock().unwrap();
        manifests.insert(
            format!("{repo}/{reference}"),
            (media.to_string(), body.clone()),
        );
        manifests.insert(format!("{repo}/{digest}"), (media.to_string(), body));
    }
}

fn registry_app(state: Arc<RegState>) -> Router {
    Router::new()
        .route("/v2/", get(ping))
        .route(
            "/v2/{repo}/manifests/{reference}",
            get(manifest_get)
                .put(manifest_put)
                .delete(manifest_delete),
        )
        .route("/v2/{repo}/tags/list", get(tags_list))
        .route("/v2/{repo}/blobs/{digest}", get(blob_get).delete(blob_delete))
        .route("/v2/{repo}/blobs/uploads/", post(upload_post))
        .route(
            "/v2/{repo}/blobs/uploads/{id}",
            get(upload_status)
                .patch(upload_patch)
                .put(upload_put)
                .delete(upload_delete),
        )
        .route("/v2/{repo}/referrers/{digest}", get(referrers))
        .route("/v2/_catalog", get(catalog))
        .with_state(state)
}

async fn ping() -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        "docker-distribution-api-version",
        "registry/2.0".parse().unwrap(),
    );
    (StatusCode::OK, headers, Bytes::from_static(b"{}"))
}

async fn manifest_get(
    State(state): State<Arc<RegState>>,
    Path((repo, reference)): Path<(String, String)>,
) -> impl IntoResponse {
    let manifests = state.manifests.lock().unwrap();
    match manifests.get(&format!("{repo}/{reference}")) {
        Some((media, body)) => {
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, media.parse().unwrap());
            headers.insert("docker-content-digest", sha256_of(body).parse().unwrap());
            (StatusCode::OK, headers, body.clone())
        }
        None => (StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new()),
    }
}

async fn manifest_put(
    State(state): State<Arc<RegState>>,
    Path((repo, reference)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let media = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/vnd.oci.image.manifest.v1+json")
        .to_string();
    state.put_manifest(&repo, &reference, &media, &body);
    let mut out = HeaderMap::new();
    out.insert("docker-content-digest", sha256_of(&body).parse().unwrap());
    out.insert(
        header::LOCATION,
        format!("/v2/{repo}/manifests/{reference}").parse().unwrap(),
    );
    (StatusCode::CREATED, out)
}

async fn manifest_delete(
    State(state): State<Arc<RegState>>,
    Path((repo, reference)): Path<(String, String)>,
) -> impl IntoResponse {
    if !reference.starts_with("sha256:") {
        // native tag deletion unsupported, clients fall back
        return StatusCode::METHOD_NOT_ALLOWED;
    }
    let mut manifests = state.manifests.lock().unwrap();
    let prefix = format!("{repo}/");
    let existed = manifests.remove(&format!("{repo}/{reference}")).is_some();
    // drop any tag pointing at the deleted content
    manifests.retain(|key, (_, body)| {
        !(key.starts_with(&prefix) && sha256_of(body) == reference)
    });
    if existed {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn tags_list(
    State(state): State<Arc<RegState>>,
    Path(repo): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let manifests = state.manifests.lock().unwrap();
    let prefix = format!("{repo}/");
    let mut tags: Vec<String> = manifests
        .keys()
        .filter_map(|k| k.strip_prefix(&prefix))
        .filter(|t| !t.starts_with("sha256:"))
        .map(|t| t.to_string())
        .collect();
    tags.sort();
    let n: usize = params
        .get("n")
        .and_then(|v| v.parse().ok())
        .unwrap_or(2);
    if let Some(last) = params.get("last") {
        tags.retain(|t| t > last);
    }
    let more = tags.len() > n;
    tags.truncate(n);
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
    if more {
        let link = format!(
            "</v2/{repo}/tags/list?last={}&n={n}>; rel=\"next\"",
            tags.last().unwrap()
        );
        headers.insert(header::LINK, link.parse().unwrap());
    }
    let body = serde_json::json!({ "name": repo, "tags": tags }).to_string();
    (StatusCode::OK, headers, Bytes::from(body))
}

async fn blob_get(
    State(state): State<Arc<RegState>>,
    Path((_repo, digest)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let blobs = state.blobs.lock().unwrap();
    let Some(body) = blobs.get(&digest) else {
        return (StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new());
    };
    let mut out = HeaderMap::new();
    out.insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
    let range_from = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.split('-').next())
        .and_then(|v| v.parse::<usize>().ok());
    match range_from {
        Some(from) if from <= body.len() => {
            (StatusCode::PARTIAL_CONTENT, out, body.slice(from..))
        }
        _ => (StatusCode::OK, out, body.clone()),
    }
}

async fn blob_delete(
    State(state): State<Arc<RegState>>,
    Path((_repo, digest)): Path<(String, String)>,
) -> impl IntoResponse {
    if state.blobs.lock().unwrap().remove(&digest).is_some() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn upload_post(
    State(state): State<Arc<RegState>>,
    Path(repo): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    state.upload_posts.fetch_add(1, Ordering::Relaxed);
    if let Some(mount) = params.get("mount") {
        if state.blobs.lock().unwrap().contains_key(mount) {
            let mut headers = HeaderMap::new();
            headers.insert("docker-content-digest", mount.parse().unwrap());
            return (StatusCode::CREATED, headers);
        }
    }
    let id = state.upload_seq.fetch_add(1, Ordering::Relaxed);
    state
        .uploads
        .lock()
        .unwrap()
        .insert(id.to_string(), Vec::new());
    let mut headers = HeaderMap::new();
    headers.insert(
        header::LOCATION,
        format!("/v2/{repo}/blobs/uploads/{id}").parse().unwrap(),
    );
    (StatusCode::ACCEPTED, headers)
}

fn session_headers(repo: &str, id: &str, len: usize) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::LOCATION,
        format!("/v2/{repo}/blobs/uploads/{id}").parse().unwrap(),
    );
    headers.insert(
        header::RANGE,
        format!("0-{}", len.saturating_sub(1)).parse().unwrap(),
    );
    headers
}

async fn upload_status(
    State(state): State<Arc<RegState>>,
    Path((repo, id)): Path<(String, String)>,
) -> impl IntoResponse {
    let uploads = state.uploads.lock().unwrap();
    match uploads.get(&id) {
        Some(buf) => (StatusCode::NO_CONTENT, session_headers(&repo, &id, buf.len())),
        None => (StatusCode::NOT_FOUND, HeaderMap::new()),
    }
}

async fn upload_patch(
    State(state): State<Arc<RegState>>,
    Path((repo, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let range = headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split_once('-'))
        .and_then(|(s, e)| Some((s.parse::<u64>().ok()?, e.parse::<u64>().ok()?)));
    let Some((start, end)) = range else {
        return (StatusCode::BAD_REQUEST, HeaderMap::new());
    };
    state.patch_ranges.lock().unwrap().push((start, end));

    let mut uploads = state.uploads.lock().unwrap();
    let Some(buf) = uploads.get_mut(&id) else {
        return (StatusCode::NOT_FOUND, HeaderMap::new());
    };

    let scripted = {
        let mut truncate = state.truncate.lock().unwrap();
        match *truncate {
            Some((at, keep)) if at == start => {
                *truncate = None;
                Some(keep)
            }
            _ => None,
        }
    };
    if let Some(keep) = scripted {
        buf.extend_from_slice(&body[..keep]);
        return (
            StatusCode::RANGE_NOT_SATISFIABLE,
            session_headers(&repo, &id, buf.len()),
        );
    }
    if start != buf.len() as u64 {
        return (
            StatusCode::RANGE_NOT_SATISFIABLE,
            session_headers(&repo, &id, buf.len()),
        );
    }
    buf.extend_from_slice(&body);
    (StatusCode::ACCEPTED, session_headers(&repo, &id, buf.len()))
}

async fn upload_put(
    State(state): State<Arc<RegState>>,
    Path((_repo, id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> impl IntoResponse {
    let Some(expected) = params.get("digest") else {
        return (StatusCode::BAD_REQUEST, HeaderMap::new(), Bytes::new());
    };
    let mut uploads = state.uploads.lock().unwrap();
    let Some(mut buf) = uploads.remove(&id) else {
        return (StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new());
    };
    buf.extend_from_slice(&body);
    if sha256_of(&buf) != *expected {
        return (StatusCode::BAD_REQUEST, HeaderMap::new(), Bytes::new());
    }
    state
        .blobs
        .lock()
        .unwrap()
        .insert(expected.clone(), Bytes::from(buf));
    let mut headers = HeaderMap::new();
    headers.insert("docker-content-digest", expected.parse().unwrap());
    (StatusCode::CREATED, headers, Bytes::new())
}

async fn upload_delete(
    State(state): State<Arc<RegState>>,
    Path((_repo, id)): Path<(String, String)>,
) -> impl IntoResponse {
    state.uploads.lock().unwrap().remove(&id);
    StatusCode::ACCEPTED
}

async fn referrers() -> impl IntoResponse {
    // native referrers api not implemented, clients use the tag scheme
    StatusCode::NOT_FOUND
}

async fn catalog(
    State(state): State<Arc<RegState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let manifests = state.manifests.lock().unwrap();
    let mut repos: Vec<String> = manifests
        .keys()
        .filter_map(|k| k.split_once('/').map(|(r, _)| r.to_string()))
        .collect();
    repos.sort();
    repos.dedup();
    let n: usize = params
        .get("n")
        .and_then(|v| v.parse().ok())
        .unwrap_or(2);
    if let Some(last) = params.get("last") {
        repos.retain(|r| r > last);
    }
    let more = repos.len() > n;
    repos.truncate(n);
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
    if more {
        let link = format!(
            "</v2/_catalog?last={}&n={n}>; rel=\"next\"",
            repos.last().unwrap()
        );
        headers.insert(header::LINK, link.parse().unwrap());
    }
    let body = serde_json::json!({ "repositories": repos }).to_string();
    (StatusCode::OK, headers, Bytes::from(body))
}

// --- scenarios --------------------------------------------------------------

const MT_OCI: &str = "application/vnd.oci.image.manifest.v1+json";

#[tokio::test]
async fn s1_basic_get() {
    let state = Arc::new(RegState::default());
    state.put_manifest("proj", "tag-get", MT_OCI, b"get body");
    let host = serve(registry_app(state)).await;
    let client = test_client(&host);

    let r = Ref::new(&format!("{host}/proj:tag-get")).unwrap();
    let (desc, body) = client.manifest_get(&r).await.unwrap();
    assert_eq!(&body[..], b"get body");
    assert_eq!(desc.digest().to_string(), sha256_of(b"get body"));
    assert_eq!(desc.media_type().to_string(), MT_OCI);

    // repeating the request returns bytewise identical content
    let (desc2, body2) = client.manifest_get(&r).await.unwrap();
    assert_eq!(body, body2);
    assert_eq!(desc.digest(), desc2.digest());
}

#[tokio::test]
async fn blob_copy_to_writer() {
    let state = Arc::new(RegState::default());
    let content = b"streamed layer content".to_vec();
    let digest_str = sha256_of(&content);
    state
        .blobs
        .lock()
        .unwrap()
        .insert(digest_str.clone(), Bytes::from(content.clone()));
    let host = serve(registry_app(state)).await;
    let client = test_client(&host);

    let r = Ref::new(&format!("{host}/proj:v1")).unwrap();
    let digest: ocireg::Digest = digest_str.parse().unwrap();
    let mut resp = client.blob_get(&r, &digest).await.unwrap();
    let mut out = Vec::new();
    let copied = resp.copy_to(&mut out).await.unwrap();
    assert_eq!(copied, content.len() as u64);
    assert_eq!(out, content);
}

#[tokio::test]
async fn repo_auth_keys_tokens_per_repository() {
    #[derive(Default)]
    struct AuthState {
        scopes_requested: Mutex<Vec<String>>,
    }

    async fn token(
        State(state): State<Arc<AuthState>>,
        Query(params): Query<Vec<(String, String)>>,
    ) -> impl IntoResponse {
        let scope = params
            .iter()
            .filter(|(k, _)| k == "scope")
            .map(|(_, v)| v.clone())
            .collect::<Vec<_>>()
            .join(" ");
        state.scopes_requested.lock().unwrap().push(scope.clone());
        let body = serde_json::json!({
            "token": format!("tok-{scope}"),
            "expires_in": 900,
        })
        .to_string();
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    let state = Arc::new(AuthState::default());

    let app = Router::new()
        .route("/token", get(token))
        .route(
            "/v2/{repo}/manifests/{r}",
            get({
                let host = host.clone();
                move |Path((repo, _r)): Path<(String, String)>, headers: HeaderMap| {
                    let host = host.clone();
                    async move {
                        let want = format!("Bearer tok-repository:{repo}:pull");
                        if headers
                            .get(header::AUTHORIZATION)
                            .and_then(|v| v.to_str().ok())
                            == Some(want.as_str())
                        {
                            (StatusCode::OK, HeaderMap::new(), Bytes::from_static(b"{}"))
                        } else {
                            let mut h = HeaderMap::new();
                            let challenge = format!(
                                r#"Bearer realm="http://{host}/token",service="test",scope="repository:{repo}:pull""#
                            );
                            h.insert(header::WWW_AUTHENTICATE, challenge.parse().unwrap());
                            (StatusCode::UNAUTHORIZED, h, Bytes::new())
                        }
                    }
                }
            }),
        )
        .with_state(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let mut cfg = HostConfig::new(&host);
    cfg.tls = Tls::Disabled;
    cfg.repo_auth = true;
    let client = Client::builder()
        .host(cfg)
        .delay(Duration::from_millis(10), Duration::from_millis(50))
        .build();

    let ra = Ref::new(&format!("{host}/repo-a:v1")).unwrap();
    let rb = Ref::new(&format!("{host}/repo-b:v1")).unwrap();
    client.manifest_get(&ra).await.unwrap();
    client.manifest_get(&rb).await.unwrap();
    // tokens are keyed per repository, so repo-a's token survived repo-b's
    // exchange and no third token round trip happens
    client.manifest_get(&ra).await.unwrap();

    let scopes = state.scopes_requested.lock().unwrap().clone();
    assert_eq!(
        scopes,
        vec![
            "repository:repo-a:pull".to_string(),
            "repository:repo-b:pull".to_string(),
        ]
    );
}

#[tokio::test]
async fn s2_s3_bearer_token_and_scope_extension() {
    #[derive(Default)]
    struct AuthState {
        scopes_requested: Mutex<Vec<String>>,
    }

    async fn token(
        State(state): State<Arc<AuthState>>,
        Query(params): Query<Vec<(String, String)>>,
    ) -> impl IntoResponse {
        let scope = params
            .iter()
            .filter(|(k, _)| k == "scope")
            .map(|(_, v)| v.clone())
            .collect::<Vec<_>>()
            .join(" ");
        state.scopes_requested.lock().unwrap().push(scope.clone());
        let token = if scope.contains("push") { "T2" } else { "T1" };
        let body = serde_json::json!({
            "token": token,
            "expires_in": 900,
            "issued_at": chrono::Utc::now().to_rfc3339(),
        })
        .to_string();
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    let state = Arc::new(AuthState::default());

    let challenge = |scope: &str| {
        format!(r#"Bearer realm="http://{host}/token",service="test",scope="repository:project:{scope}""#)
    };
    let get_challenge = challenge("pull");
    let put_challenge = challenge("pull,push");

    let app = Router::new()
        .route("/token", get(token))
        .route(
            "/v2/project/manifests/x",
            get({
                let c = get_challenge.clone();
                move |headers: HeaderMap| {
                    let c = c.clone();
                    async move {
                        match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
                            Some("Bearer T1") | Some("Bearer T2") => {
                                (StatusCode::OK, HeaderMap::new(), Bytes::from_static(b"ok"))
                            }
                            _ => {
                                let mut h = HeaderMap::new();
                                h.insert(header::WWW_AUTHENTICATE, c.parse().unwrap());
                                (StatusCode::UNAUTHORIZED, h, Bytes::new())
                            }
                        }
                    }
                }
            })
            .put({
                let c = put_challenge.clone();
                move |headers: HeaderMap| {
                    let c = c.clone();
                    async move {
                        match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
                            Some("Bearer T2") => (StatusCode::CREATED, HeaderMap::new()),
                            _ => {
                                let mut h = HeaderMap::new();
                                h.insert(header::WWW_AUTHENTICATE, c.parse().unwrap());
                                (StatusCode::UNAUTHORIZED, h)
                            }
                        }
                    }
                }
            }),
        )
        .with_state(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = test_client(&host);
    let r = Ref::new(&format!("{host}/project:x")).unwrap();

    // s2: anonymous 401 -> token T1 -> 200
    let (_, body) = client.manifest_get(&r).await.unwrap();
    assert_eq!(&body[..], b"ok");

    // a second read reuses the cached token without a new challenge
    client.manifest_get(&r).await.unwrap();

    // s3: push needs a broader scope, new token T2
    client
        .manifest_put(&r, MT_OCI, Bytes::from_static(b"{}"))
        .await
        .unwrap();

    let scopes = state.scopes_requested.lock().unwrap().clone();
    assert_eq!(
        scopes,
        vec![
            "repository:project:pull".to_string(),
            "repository:project:pull,push".to_string(),
        ]
    );
}

#[tokio::test]
async fn s4_mirror_failover() {
    fn fixed(status: StatusCode, body: &'static str, hits: Arc<AtomicU32>) -> Router {
        Router::new().route(
            "/v2/{repo}/manifests/{r}",
            get(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::Relaxed);
                    (status, Bytes::from_static(body.as_bytes()))
                }
            }),
        )
    }

    let bad_hits = Arc::new(AtomicU32::new(0));
    let missing_hits = Arc::new(AtomicU32::new(0));
    let ok_hits = Arc::new(AtomicU32::new(0));
    let bad = serve(fixed(StatusCode::BAD_GATEWAY, "", bad_hits.clone())).await;
    let missing = serve(fixed(StatusCode::NOT_FOUND, "", missing_hits.clone())).await;
    let ok = serve(fixed(StatusCode::OK, "mirror body", ok_hits.clone())).await;

    let mut primary = HostConfig::new(&ok);
    primary.tls = Tls::Disabled;
    primary.mirrors = vec![bad.clone(), missing.clone()];
    let mut bad_cfg = HostConfig::new(&bad);
    bad_cfg.tls = Tls::Disabled;
    bad_cfg.priority = 10;
    let mut missing_cfg = HostConfig::new(&missing);
    missing_cfg.tls = Tls::Disabled;
    missing_cfg.priority = 5;

    let client = Client::builder()
        .host(primary)
        .host(bad_cfg)
        .host(missing_cfg)
        .delay(Duration::from_millis(10), Duration::from_millis(50))
        .build();

    let r = Ref::new(&format!("{ok}/proj:v1")).unwrap();
    let (_, body) = client.manifest_get(&r).await.unwrap();
    assert_eq!(&body[..], b"mirror body");
    assert_eq!(bad_hits.load(Ordering::Relaxed), 1);
    assert_eq!(missing_hits.load(Ordering::Relaxed), 1);
    assert_eq!(ok_hits.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn s5_chunked_upload_with_truncation() {
    let state = Arc::new(RegState::default());
    // second chunk gets cut: the registry keeps 20 of its bytes and reports
    // 532 acknowledged
    *state.truncate.lock().unwrap() = Some((512, 20));
    let host = serve(registry_app(state.clone())).await;

    let mut cfg = HostConfig::new(&host);
    cfg.tls = Tls::Disabled;
    cfg.blob_chunk = 512;
    cfg.blob_max = -1; // force chunked
    let client = Client::builder()
        .host(cfg)
        .delay(Duration::from_millis(10), Duration::from_millis(50))
        .build();

    let content: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    let digest = sha256_of(&content);
    let r = Ref::new(&format!("{host}/proj:v1")).unwrap();
    let desc = client
        .blob_put(
            &r,
            BlobPutOpts::default(),
            std::io::Cursor::new(content.clone()),
        )
        .await
        .unwrap();
    assert_eq!(desc.digest().to_string(), digest);
    assert_eq!(desc.size(), 1024);

    // the driver resumed from the server-reported offset
    let ranges = state.patch_ranges.lock().unwrap().clone();
    assert_eq!(ranges, vec![(0, 511), (512, 1023), (532, 1023)]);

    // round trip: the stored bytes are bit-identical
    let fetched = client
        .blob_get_bytes(&r, desc.digest())
        .await
        .unwrap();
    assert_eq!(&fetched[..], &content[..]);
}

#[tokio::test]
async fn s6_digest_mismatch() {
    let state = Arc::new(RegState::default());
    let expected = sha256_of(b"right content");
    state
        .blobs
        .lock()
        .unwrap()
        .insert(expected.clone(), Bytes::from_static(b"wrong"));
    let host = serve(registry_app(state)).await;
    let client = test_client(&host);

    let r = Ref::new(&format!("{host}/proj:v1")).unwrap();
    let digest: ocireg::Digest = expected.parse().unwrap();
    let err = client.blob_get_bytes(&r, &digest).await.unwrap_err();
    assert!(matches!(err, Error::DigestMismatch { .. }), "got {err}");
}

#[tokio::test]
async fn s7_tag_delete_fallback() {
    let state = Arc::new(RegState::default());
    state.put_manifest("proj", "del-fallback", MT_OCI, br#"{"layers":[]}"#);
    let host = serve(registry_app(state.clone())).await;
    let client = test_client(&host);

    let r = Ref::new(&format!("{host}/proj:del-fallback")).unwrap();
    client.tag_delete(&r).await.unwrap();

    // the tag is gone
    assert!(matches!(
        client.manifest_get(&r).await,
        Err(Error::NotFound)
    ));
}

#[tokio::test]
async fn blob_round_trip_monolithic_and_mount() {
    let state = Arc::new(RegState::default());
    let host = serve(registry_app(state.clone())).await;
    let client = test_client(&host);

    let content = b"layer bytes".to_vec();
    let digest: ocireg::Digest = sha256_of(&content).parse().unwrap();
    let r = Ref::new(&format!("{host}/proj:v1")).unwrap();
    let desc = client
        .blob_put(
            &r,
            BlobPutOpts {
                digest: Some(digest.clone()),
                size: Some(content.len() as u64),
                mount_from: None,
            },
            std::io::Cursor::new(content.clone()),
        )
        .await
        .unwrap();
    assert_eq!(*desc.digest(), digest);

    let fetched = client.blob_get_bytes(&r, &digest).await.unwrap();
    assert_eq!(fetched.as_ref(), &content[..]);

    let head = client.blob_head(&r, &digest).await.unwrap();
    assert_eq!(head.status(), StatusCode::OK);

    // mounting into another repository uses no upload session
    let posts_before = state.upload_posts.load(Ordering::Relaxed);
    let other = Ref::new(&format!("{host}/other:v1")).unwrap();
    client.blob_mount(&other, &r, &digest).await.unwrap();
    assert_eq!(state.upload_posts.load(Ordering::Relaxed), posts_before + 1);
    assert!(state.uploads.lock().unwrap().is_empty());

    client.blob_delete(&r, &digest).await.unwrap();
    assert!(matches!(
        client.blob_get_bytes(&r, &digest).await,
        Err(Error::NotFound)
    ));
}

#[tokio::test]
async fn blob_get_seek() {
    let state = Arc::new(RegState::default());
    let content = b"0123456789".to_vec();
    let digest_str = sha256_of(&content);
    state
        .blobs
        .lock()
        .unwrap()
        .insert(digest_str.clone(), Bytes::from(content.clone()));
    let host = serve(registry_app(state)).await;
    let client = test_client(&host);

    let r = Ref::new(&format!("{host}/proj:v1")).unwrap();
    let digest: ocireg::Digest = digest_str.parse().unwrap();
    let mut resp = client.blob_get(&r, &digest).await.unwrap();
    let mut full = Vec::new();
    while let Some(chunk) = resp.chunk().await.unwrap() {
        full.extend_from_slice(&chunk);
    }
    assert_eq!(&full, &content);

    // reposition mid-stream via a ranged re-request
    resp.seek(4).await.unwrap();
    let mut tail = Vec::new();
    while let Some(chunk) = resp.chunk().await.unwrap() {
        tail.extend_from_slice(&chunk);
    }
    assert_eq!(&tail, b"456789");
}

#[tokio::test]
async fn tag_listing_pagination() {
    let state = Arc::new(RegState::default());
    for tag in ["t1", "t2", "t3", "t4", "t5"] {
        state.put_manifest("proj", tag, MT_OCI, tag.as_bytes());
    }
    let host = serve(registry_app(state)).await;
    let client = test_client(&host);

    let r = Ref::new(&format!("{host}/proj:t1")).unwrap();
    // auto-follow until the link chain runs dry, no duplicates
    let all = client.tag_list(&r).await.unwrap();
    assert_eq!(all.tags, vec!["t1", "t2", "t3", "t4", "t5"]);
    assert_eq!(all.name, "proj");

    // manual pagination stops at one page
    let page = client
        .tag_list_with(
            &r,
            &TagOpts {
                limit: Some(2),
                last: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(page.tags, vec!["t1", "t2"]);
    let page = client
        .tag_list_with(
            &r,
            &TagOpts {
                limit: Some(2),
                last: Some("t2".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(page.tags, vec!["t3", "t4"]);
}

#[tokio::test]
async fn referrer_put_and_list_fallback() {
    let state = Arc::new(RegState::default());
    state.put_manifest("proj", "v1", MT_OCI, br#"{"subject-of":"test"}"#);
    let host = serve(registry_app(state)).await;
    let client = test_client(&host);

    let tagged = Ref::new(&format!("{host}/proj:v1")).unwrap();
    let (desc, _) = client.manifest_get(&tagged).await.unwrap();
    let subject = tagged.with_digest(&desc.digest().to_string()).unwrap();

    let artifact = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MT_OCI,
        "artifactType": "application/example.sbom",
        "config": {"mediaType": "application/vnd.oci.empty.v1+json"},
        "layers": [],
        "subject": {"mediaType": MT_OCI, "digest": desc.digest().to_string(), "size": 1},
    });
    let body = Bytes::from(serde_json::to_vec(&artifact).unwrap());
    client
        .referrer_put(&subject, MT_OCI, body.clone())
        .await
        .unwrap();

    let index = client.referrer_list(&subject).await.unwrap();
    assert_eq!(index.manifests().len(), 1);
    assert_eq!(
        index.manifests()[0].digest().to_string(),
        sha256_of(&body)
    );
    assert_eq!(
        index.manifests()[0]
            .artifact_type()
            .as_ref()
            .map(|m| m.to_string()),
        Some("application/example.sbom".to_string())
    );

    // idempotent: pushing the same referrer again does not duplicate
    client.referrer_put(&subject, MT_OCI, body).await.unwrap();
    let index = client.referrer_list(&subject).await.unwrap();
    assert_eq!(index.manifests().len(), 1);
}

#[tokio::test]
async fn repo_listing_pagination() {
    let state = Arc::new(RegState::default());
    for repo in ["alpha", "beta", "gamma"] {
        state.put_manifest(repo, "v1", MT_OCI, repo.as_bytes());
    }
    let host = serve(registry_app(state)).await;
    let client = test_client(&host);

    let list = client.repo_list(&host).await.unwrap();
    assert_eq!(list.repositories, vec!["alpha", "beta", "gamma"]);
}

#[tokio::test]
async fn ping_reports_api_version() {
    let state = Arc::new(RegState::default());
    let host = serve(registry_app(state)).await;
    let client = test_client(&host);

    let ping = client.ping(&host).await.unwrap();
    assert_eq!(ping.status(), StatusCode::OK);
    assert_eq!(ping.api_version(), Some(ocireg::Version::new(2, 0, 0)));
}

#[tokio::test]
async fn basic_auth_and_header_reuse() {
    let hits = Arc::new(AtomicU32::new(0));
    let app = Router::new().route(
        "/v2/{repo}/manifests/{r}",
        get({
            let hits = hits.clone();
            move |headers: HeaderMap| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::Relaxed);
                    // "alice:hunter2"
                    let ok = headers
                        .get(header::AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        == Some("Basic YWxpY2U6aHVudGVyMg==");
                    if ok {
                        (StatusCode::OK, HeaderMap::new(), Bytes::from_static(b"ok"))
                    } else {
                        let mut h = HeaderMap::new();
                        h.insert(
                            header::WWW_AUTHENTICATE,
                            r#"Basic realm="registry""#.parse().unwrap(),
                        );
                        (StatusCode::UNAUTHORIZED, h, Bytes::new())
                    }
                }
            }
        }),
    );
    let host = serve(app).await;

    let mut cfg = HostConfig::new(&host);
    cfg.tls = Tls::Disabled;
    cfg.user = Some("alice".to_string());
    cfg.pass = Some("hunter2".to_string());
    let client = Client::builder()
        .host(cfg)
        .delay(Duration::from_millis(10), Duration::from_millis(50))
        .build();

    let r = Ref::new(&format!("{host}/proj:v1")).unwrap();
    client.manifest_get(&r).await.unwrap();
    // challenge plus authorized retry
    assert_eq!(hits.load(Ordering::Relaxed), 2);

    // the second request stamps the header up front
    client.manifest_get(&r).await.unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 3);
}

#[tokio::test]
async fn unauthorized_when_no_new_challenge() {
    let app = Router::new().route(
        "/v2/{repo}/manifests/{r}",
        get(|| async {
            let mut h = HeaderMap::new();
            h.insert(
                header::WWW_AUTHENTICATE,
                r#"Basic realm="registry""#.parse().unwrap(),
            );
            (StatusCode::UNAUTHORIZED, h)
        }),
    );
    let host = serve(app).await;
    // no credentials configured at all
    let client = test_client(&host);
    let r = Ref::new(&format!("{host}/proj:v1")).unwrap();
    let err = client.manifest_get(&r).await.unwrap_err();
    assert!(matches!(err, Error::HttpUnauthorized(_)), "got {err}");
}

#[tokio::test]
async fn warnings_are_collected_once() {
    let app = Router::new().route(
        "/v2/{repo}/manifests/{r}",
        get(|| async {
            let mut h = HeaderMap::new();
            h.append(header::WARNING, r#"299 - "deprecated tag""#.parse().unwrap());
            h.append(header::WARNING, r#"299 - "planned outage""#.parse().unwrap());
            (StatusCode::OK, h, Bytes::from_static(b"{}"))
        }),
    );
    let host = serve(app).await;

    let warnings = Arc::new(WarningList::new());
    let mut cfg = HostConfig::new(&host);
    cfg.tls = Tls::Disabled;
    let client = Client::builder()
        .host(cfg)
        .warnings(warnings.clone())
        .delay(Duration::from_millis(10), Duration::from_millis(50))
        .build();

    let r = Ref::new(&format!("{host}/proj:v1")).unwrap();
    client.manifest_get(&r).await.unwrap();
    client.manifest_get(&r).await.unwrap();
    assert_eq!(warnings.all(), vec!["deprecated tag", "planned outage"]);
}

#[tokio::test]
async fn head_disabled_falls_back_to_get() {
    let state = Arc::new(RegState::default());
    state.put_manifest("proj", "v1", MT_OCI, b"manifest body");
    let host = serve(registry_app(state)).await;

    let mut cfg = HostConfig::new(&host);
    cfg.tls = Tls::Disabled;
    cfg.api_opts
        .insert("disableHead".to_string(), "true".to_string());
    let client = Client::builder()
        .host(cfg)
        .delay(Duration::from_millis(10), Duration::from_millis(50))
        .build();

    let r = Ref::new(&format!("{host}/proj:v1")).unwrap();
    let desc = client.manifest_head(&r).await.unwrap();
    assert_eq!(desc.digest().to_string(), sha256_of(b"manifest body"));
    assert_eq!(desc.size(), b"manifest body".len() as u64);
}

#[tokio::test]
async fn retry_limit_surfaces_last_error() {
    let app = Router::new().route(
        "/v2/{repo}/manifests/{r}",
        get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
    );
    let host = serve(app).await;
    let mut cfg = HostConfig::new(&host);
    cfg.tls = Tls::Disabled;
    let client = Client::builder()
        .host(cfg)
        .retry_limit(2)
        .delay(Duration::from_millis(5), Duration::from_millis(10))
        .build();

    let r = Ref::new(&format!("{host}/proj:v1")).unwrap();
    let err = client.manifest_get(&r).await.unwrap_err();
    match err {
        Error::RetryLimitExceeded(inner) => {
            assert!(matches!(*inner, Error::HttpStatus(StatusCode::SERVICE_UNAVAILABLE)));
        }
        other => panic!("expected retry limit, got {other}"),
    }
}
