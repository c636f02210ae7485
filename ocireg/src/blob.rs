use std::io::SeekFrom;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use log::{info, trace, warn};
use oci_spec::image::{Descriptor, Digest};
use reqwest::{Method, StatusCode, Url, header};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, ReadBuf};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::auth::Scope;
use crate::error::{Error, Result};
use crate::reference::Ref;
use crate::reghttp::{BodySource, Digester, Engine, Req, Resp, StreamerFn, do_req};

// blob transfer driver. uploads follow the distribution-spec state machine:
// an optional cross-repository mount, a POST opening the session, either one
// monolithic PUT or a PATCH loop with Content-Range, and a closing PUT
// carrying the digest. the server may rewrite the upload url on every
// response and may reject a chunk with 416 to report how much it actually
// holds; the driver realigns the source and the running hash to the
// server's view and keeps going.

const OCTET_STREAM: &str = "application/octet-stream";
const CHUNK_MIN_LENGTH: &str = "oci-chunk-min-length";

// status-probe resumes after the engine itself gave up; keeps a flapping
// registry from looping the chunk loop forever
const MAX_RESUMES: usize = 5;

#[derive(Default)]
pub struct BlobPutOpts {
    // expected digest; verified against the computed one before commit
    pub digest: Option<Digest>,
    pub size: Option<u64>,
    // source repository for a mount attempt
    pub mount_from: Option<Ref>,
}

pub(crate) async fn blob_get(engine: &Arc<Engine>, r: &Ref, digest: &Digest) -> Result<Resp> {
    let mut req = Req::new(r.registry(), Method::GET);
    req.repository = r.repository().to_string();
    req.path = format!("blobs/{digest}");
    req.digest = Some(digest.clone());
    do_req(engine, req).await
}

pub(crate) async fn blob_head(engine: &Arc<Engine>, r: &Ref, digest: &Digest) -> Result<Resp> {
    let mut req = Req::new(r.registry(), Method::HEAD);
    req.repository = r.repository().to_string();
    req.path = format!("blobs/{digest}");
    do_req(engine, req).await
}

pub(crate) async fn blob_delete(engine: &Arc<Engine>, r: &Ref, digest: &Digest) -> Result<()> {
    let mut req = Req::new(r.registry(), Method::DELETE);
    req.repository = r.repository().to_string();
    req.path = format!("blobs/{digest}");
    req.no_mirrors = true;
    let resp = do_req(engine, req).await?;
    match resp.status() {
        s if s.is_success() => Ok(()),
        s => Err(Error::HttpStatus(s)),
    }
}

// cross-repository mount as a standalone operation. a registry that
// declines the mount but opens a regular upload gets that session canceled
// and the sentinel returned so the caller knows a plain put would work.
pub(crate) async fn blob_mount(
    engine: &Arc<Engine>,
    target: &Ref,
    source: &Ref,
    digest: &Digest,
) -> Result<()> {
    match open_upload(engine, target, Some((digest, source.repository()))).await? {
        Opened::Mounted => Ok(()),
        Opened::Session { url, .. } => {
            cancel_upload(engine, target, &url).await;
            Err(Error::MountReturnedLocation(url.to_string()))
        }
    }
}

pub(crate) async fn blob_put<S>(
    engine: &Arc<Engine>,
    r: &Ref,
    opts: BlobPutOpts,
    src: S,
) -> Result<Descriptor>
where
    S: AsyncRead + AsyncSeek + Send + Sync + Unpin + 'static,
{
    let cfg = engine.hosts().get(r.registry());
    if let Some(expect) = &opts.digest {
        if Digester::for_digest(expect).is_none() {
            return Err(Error::ParseFailure(format!(
                "digest algorithm {}",
                expect.algorithm()
            )));
        }
    }

    // mount fast path when we know the digest and where to mount from
    let opened = if let (Some(digest), Some(from)) = (&opts.digest, &opts.mount_from) {
        match open_upload(engine, r, Some((digest, from.repository()))).await? {
            Opened::Mounted => {
                trace!("mounted {} from {}", digest, from.common_name());
                return Ok(octet_descriptor(digest.clone(), opts.size.unwrap_or(0)));
            }
            opened @ Opened::Session { .. } => opened,
        }
    } else {
        open_upload(engine, r, None).await?
    };
    let Opened::Session {
        mut url,
        min_chunk,
    } = opened
    else {
        unreachable!("mount-less open never mounts");
    };

    let mut chunk_size = cfg.blob_chunk();
    if let Some(min) = min_chunk {
        if min > chunk_size {
            trace!("registry chunk minimum {min} overrides configured {chunk_size}");
            chunk_size = min;
        }
    }

    let shared = Arc::new(Mutex::new(src));

    // monolithic put needs the digest for the url and a size under the cap
    if let (Some(digest), Some(size)) = (&opts.digest, opts.size) {
        if cfg.blob_max().is_some_and(|max| size <= max) {
            match put_monolithic(engine, r, &url, digest, size, streamer(&shared)).await {
                Ok(()) => return Ok(octet_descriptor(digest.clone(), size)),
                Err(e) => {
                    warn!(
                        "monolithic put of {} to {} failed, falling back to chunked: {e}",
                        digest,
                        r.common_name()
                    );
                    cancel_upload(engine, r, &url).await;
                    match open_upload(engine, r, None).await? {
                        Opened::Session { url: u, min_chunk } => {
                            url = u;
                            if let Some(min) = min_chunk {
                                chunk_size = chunk_size.max(min);
                            }
                        }
                        Opened::Mounted => unreachable!("mount-less open never mounts"),
                    }
                }
            }
        }
    }

    let mut guard = shared.clone().lock_owned().await;
    let (computed, size) = put_chunked(
        engine,
        r,
        url,
        chunk_size,
        opts.digest.as_ref(),
        &mut *guard,
    )
    .await?;
    Ok(octet_descriptor(computed, size))
}

enum Opened {
    Mounted,
    Session { url: Url, min_chunk: Option<u64> },
}

async fn open_upload(
    engine: &Arc<Engine>,
    r: &Ref,
    mount: Option<(&Digest, &str)>,
) -> Result<Opened> {
    let mut req = Req::new(r.registry(), Method::POST);
    req.repository = r.repository().to_string();
    req.path = "blobs/uploads/".to_string();
    req.no_mirrors = true;
    if let Some((digest, from)) = mount {
        req.query.push(("mount".to_string(), digest.to_string()));
        req.query.push(("from".to_string(), from.to_string()));
        // pulling from the source repo needs its own grant
        req.extra_scope = Some(Scope::repo(from, &["pull"]));
    }
    let resp = do_req(engine, req).await?;
    match resp.status() {
        StatusCode::CREATED => Ok(Opened::Mounted),
        StatusCode::ACCEPTED => {
            let url = location_url(engine, r, resp.headers())?
                .ok_or_else(|| Error::ParseFailure("upload location".to_string()))?;
            let min_chunk = resp
                .headers()
                .get(CHUNK_MIN_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            Ok(Opened::Session { url, min_chunk })
        }
        s => Err(Error::HttpStatus(s)),
    }
}

async fn put_monolithic(
    engine: &Arc<Engine>,
    r: &Ref,
    url: &Url,
    digest: &Digest,
    size: u64,
    body: StreamerFn,
) -> Result<()> {
    let mut req = Req::new(r.registry(), Method::PUT);
    req.repository = r.repository().to_string();
    req.direct_url = Some(url.clone());
    req.query.push(("digest".to_string(), digest.to_string()));
    req.headers
        .push(("content-type".to_string(), OCTET_STREAM.to_string()));
    req.content_len = Some(size);
    req.body = BodySource::Streamer(body);
    req.no_mirrors = true;
    let resp = do_req(engine, req).await?;
    match resp.status() {
        StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
        s => Err(Error::HttpStatus(s)),
    }
}

async fn put_chunked<S>(
    engine: &Arc<Engine>,
    r: &Ref,
    mut url: Url,
    chunk_size: u64,
    expect: Option<&Digest>,
    src: &mut S,
) -> Result<(Digest, u64)>
where
    S: AsyncRead + AsyncSeek + Send + Unpin,
{
    let mut digester = match expect {
        Some(d) => Digester::for_digest(d).expect("algorithm checked by blob_put"),
        None => Digester::sha256(),
    };
    let mut buf = vec![0u8; chunk_size as usize];
    let mut start: u64 = 0;
    let mut resumes = 0usize;
    src.seek(SeekFrom::Start(0)).await?;

    loop {
        let n = read_full(src, &mut buf).await?;
        if n == 0 {
            break;
        }
        let end = start + n as u64 - 1;
        let mut req = Req::new(r.registry(), Method::PATCH);
        req.repository = r.repository().to_string();
        req.direct_url = Some(url.clone());
        req.headers
            .push(("content-range".to_string(), format!("{start}-{end}")));
        req.headers
            .push(("content-type".to_string(), OCTET_STREAM.to_string()));
        req.content_len = Some(n as u64);
        req.body = BodySource::Bytes(Bytes::copy_from_slice(&buf[..n]));
        // 416 carries the server's acknowledged range and is handled here
        req.extra_ok = vec![StatusCode::RANGE_NOT_SATISFIABLE];
        req.no_mirrors = true;

        let resp = match do_req(engine, req).await {
            Ok(resp) => resp,
            Err(e) => {
                // the engine already retried; before giving up, ask the
                // registry where the session stands and realign
                if resumes >= MAX_RESUMES || !resumable(&e) {
                    cancel_upload(engine, r, &url).await;
                    return Err(e);
                }
                resumes += 1;
                let Ok((acked, new_url)) = upload_status(engine, r, &url).await else {
                    cancel_upload(engine, r, &url).await;
                    return Err(e);
                };
                if let Some(u) = new_url {
                    url = u;
                }
                digester = realign(expect, src, digester, start, acked, &buf, n).await?;
                start = acked;
                src.seek(SeekFrom::Start(start)).await?;
                continue;
            }
        };
        match resp.status() {
            StatusCode::ACCEPTED => {
                digester.update(&buf[..n]);
                start += n as u64;
                if let Some(u) = location_url(engine, r, resp.headers())? {
                    url = u;
                }
            }
            StatusCode::CREATED => {
                // early commit: the registry finished the session on this
                // chunk, no closing put needed
                digester.update(&buf[..n]);
                start += n as u64;
                info!("upload to {} committed early at {start} bytes", r.common_name());
                let computed = digester.finalize();
                verify_expected(expect, &computed)?;
                return Ok((computed, start));
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                let acked = range_end(resp.headers())
                    .map(|e| e + 1)
                    .ok_or(Error::HttpStatus(StatusCode::RANGE_NOT_SATISFIABLE))?;
                trace!(
                    "registry truncated upload to {}: acked {acked}, local offset {start}",
                    r.common_name()
                );
                if let Some(u) = location_url(engine, r, resp.headers())? {
                    url = u;
                }
                digester = realign(expect, src, digester, start, acked, &buf, n).await?;
                start = acked;
                src.seek(SeekFrom::Start(start)).await?;
            }
            s => {
                cancel_upload(engine, r, &url).await;
                return Err(Error::HttpStatus(s));
            }
        }
    }

    let computed = digester.finalize();
    if let Err(e) = verify_expected(expect, &computed) {
        cancel_upload(engine, r, &url).await;
        return Err(e);
    }

    // close the session
    let mut req = Req::new(r.registry(), Method::PUT);
    req.repository = r.repository().to_string();
    req.direct_url = Some(url.clone());
    req.query.push(("digest".to_string(), computed.to_string()));
    req.headers
        .push(("content-type".to_string(), OCTET_STREAM.to_string()));
    req.content_len = Some(0);
    req.no_mirrors = true;
    let resp = do_req(engine, req).await?;
    match resp.status() {
        StatusCode::CREATED | StatusCode::NO_CONTENT => Ok((computed, start)),
        s => {
            cancel_upload(engine, r, &url).await;
            Err(Error::HttpStatus(s))
        }
    }
}

// the digester has consumed [0, start); the server acknowledges [0, acked).
// when acked lands inside the chunk we were sending, the accepted prefix is
// still in the buffer; when the server is behind what we already hashed the
// whole hash is rebuilt by re-reading the source.
async fn realign<S>(
    expect: Option<&Digest>,
    src: &mut S,
    mut digester: Digester,
    start: u64,
    acked: u64,
    buf: &[u8],
    n: usize,
) -> Result<Digester>
where
    S: AsyncRead + AsyncSeek + Send + Unpin,
{
    if acked >= start && acked <= start + n as u64 {
        digester.update(&buf[..(acked - start) as usize]);
        return Ok(digester);
    }
    trace!("rehashing source up to {acked}");
    let mut fresh = match expect {
        Some(d) => Digester::for_digest(d).expect("algorithm checked by blob_put"),
        None => Digester::sha256(),
    };
    src.seek(SeekFrom::Start(0)).await?;
    let mut remaining = acked;
    let mut scratch = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = remaining.min(scratch.len() as u64) as usize;
        let got = read_full(src, &mut scratch[..want]).await?;
        if got == 0 {
            return Err(Error::ShortRead {
                expected: acked,
                read: acked - remaining,
            });
        }
        fresh.update(&scratch[..got]);
        remaining -= got as u64;
    }
    Ok(fresh)
}

// GET on the session url reports how far the registry got
async fn upload_status(engine: &Arc<Engine>, r: &Ref, url: &Url) -> Result<(u64, Option<Url>)> {
    let mut req = Req::new(r.registry(), Method::GET);
    req.repository = r.repository().to_string();
    req.direct_url = Some(url.clone());
    req.no_mirrors = true;
    req.ignore_err = true;
    let resp = do_req(engine, req).await?;
    let acked = range_end(resp.headers()).map(|e| e + 1).unwrap_or(0);
    let new_url = location_url(engine, r, resp.headers())?;
    Ok((acked, new_url))
}

// best effort: frees server-side session state on abort
async fn cancel_upload(engine: &Arc<Engine>, r: &Ref, url: &Url) {
    let mut req = Req::new(r.registry(), Method::DELETE);
    req.repository = r.repository().to_string();
    req.direct_url = Some(url.clone());
    req.no_mirrors = true;
    req.ignore_err = true;
    if let Err(e) = do_req(engine, req).await {
        trace!("upload cancel on {} failed: {e}", r.common_name());
    }
}

fn verify_expected(expect: Option<&Digest>, computed: &Digest) -> Result<()> {
    match expect {
        Some(expect) if expect != computed => Err(Error::DigestMismatch {
            expected: expect.to_string(),
            computed: computed.to_string(),
        }),
        _ => Ok(()),
    }
}

fn resumable(e: &Error) -> bool {
    match e {
        Error::RetryLimitExceeded(inner) => inner.is_retryable(),
        e => e.is_retryable(),
    }
}

fn octet_descriptor(digest: Digest, size: u64) -> Descriptor {
    Descriptor::new(OCTET_STREAM.into(), size, digest)
}

// resolves a Location header against the endpoint, tolerating both
// relative and absolute forms
fn location_url(
    engine: &Arc<Engine>,
    r: &Ref,
    headers: &header::HeaderMap,
) -> Result<Option<Url>> {
    let Some(value) = headers.get(header::LOCATION) else {
        return Ok(None);
    };
    let raw = value
        .to_str()
        .map_err(|_| Error::ParseFailure("location header".to_string()))?;
    let base = engine.endpoint_base(r.registry())?;
    let url = base
        .join(raw)
        .map_err(|_| Error::ParseFailure(format!("location {raw}")))?;
    Ok(Some(url))
}

// `Range: 0-531` (optionally with a `bytes=` prefix) -> 531
fn range_end(headers: &header::HeaderMap) -> Option<u64> {
    let raw = headers.get(header::RANGE)?.to_str().ok()?;
    let raw = raw.trim().strip_prefix("bytes=").unwrap_or(raw.trim());
    let (_, end) = raw.split_once('-')?;
    end.trim().parse().ok()
}

async fn read_full<S: AsyncRead + Unpin>(src: &mut S, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

// hands the locked source to reqwest as a replayable body: each invocation
// rewinds to the start so engine-level retries resend the full content
fn streamer<S>(shared: &Arc<Mutex<S>>) -> StreamerFn
where
    S: AsyncRead + AsyncSeek + Send + Sync + Unpin + 'static,
{
    use futures::FutureExt;
    let shared = shared.clone();
    Arc::new(move || {
        let src = shared.clone();
        async move {
            let mut guard = src.lock_owned().await;
            guard.seek(SeekFrom::Start(0)).await?;
            Ok(Box::new(GuardReader(guard)) as Box<dyn AsyncRead + Send + Sync + Unpin>)
        }
        .boxed()
    })
}

struct GuardReader<S>(OwnedMutexGuard<S>);

impl<S: AsyncRead + Unpin> AsyncRead for GuardReader<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.0).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_range_end() {
        let mut headers = header::HeaderMap::new();
        assert_eq!(range_end(&headers), None);
        headers.insert(header::RANGE, "0-531".parse().unwrap());
        assert_eq!(range_end(&headers), Some(531));
        headers.insert(header::RANGE, "bytes=0-1023".parse().unwrap());
        assert_eq!(range_end(&headers), Some(1023));
        headers.insert(header::RANGE, "junk".parse().unwrap());
        assert_eq!(range_end(&headers), None);
    }

    #[tokio::test]
    async fn test_read_full() {
        let mut src = Cursor::new(vec![7u8; 700]);
        let mut buf = [0u8; 512];
        assert_eq!(read_full(&mut src, &mut buf).await.unwrap(), 512);
        assert_eq!(read_full(&mut src, &mut buf).await.unwrap(), 188);
        assert_eq!(read_full(&mut src, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_realign_within_buffer() {
        // digester consumed [0, 512), server acked 532, chunk buffer holds
        // [512, 1024): the 20 byte prefix comes straight from the buffer
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let mut src = Cursor::new(data.clone());
        let mut digester = Digester::sha256();
        digester.update(&data[..512]);
        let buf = &data[512..];
        let realigned = realign(None, &mut src, digester, 512, 532, buf, buf.len())
            .await
            .unwrap();
        let mut reference = Digester::sha256();
        reference.update(&data[..532]);
        assert_eq!(realigned.finalize(), reference.finalize());
    }

    #[tokio::test]
    async fn test_realign_rehash() {
        // server acked less than the digester consumed, full rebuild
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let mut src = Cursor::new(data.clone());
        let mut digester = Digester::sha256();
        digester.update(&data[..512]);
        let realigned = realign(None, &mut src, digester, 512, 100, &[], 0)
            .await
            .unwrap();
        let mut reference = Digester::sha256();
        reference.update(&data[..100]);
        assert_eq!(realigned.finalize(), reference.finalize());
    }
}
