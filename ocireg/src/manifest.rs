use std::sync::Arc;

use bytes::Bytes;
use log::trace;
use oci_spec::image::{Descriptor, Digest};
use reqwest::{Method, StatusCode, header};

use crate::error::{Error, Result};
use crate::reference::Ref;
use crate::reghttp::{BodySource, Digester, Engine, Req, Resp, digest_of, do_req};

// manifest operations are thin layers over the engine: the interesting part
// is descriptor derivation (Docker-Content-Digest when the registry sends
// it, a computed digest otherwise) and the HEAD-to-GET fallback for hosts
// with disableHead.

pub(crate) const MT_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub(crate) const MT_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub(crate) const MT_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub(crate) const MT_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub(crate) const MT_DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub(crate) const MT_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

pub(crate) const ACCEPT_MANIFEST: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.oci.image.index.v1+json, ",
    "application/vnd.oci.artifact.manifest.v1+json"
);

fn tag_or_digest(r: &Ref) -> Result<String> {
    if !r.digest().is_empty() {
        Ok(r.digest().to_string())
    } else if !r.tag().is_empty() {
        Ok(r.tag().to_string())
    } else {
        Err(Error::MissingTagOrDigest)
    }
}

fn ref_digest(r: &Ref) -> Result<Option<Digest>> {
    if r.digest().is_empty() {
        return Ok(None);
    }
    r.digest()
        .parse()
        .map(Some)
        .map_err(|_| Error::InvalidReference(r.common_name()))
}

pub(crate) fn content_type(headers: &header::HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim().to_string())
        .unwrap_or_default()
}

pub(crate) async fn manifest_get(engine: &Arc<Engine>, r: &Ref) -> Result<(Descriptor, Bytes)> {
    let td = tag_or_digest(r)?;
    let mut req = Req::new(r.registry(), Method::GET);
    req.repository = r.repository().to_string();
    req.path = format!("manifests/{td}");
    req.headers
        .push(("accept".to_string(), ACCEPT_MANIFEST.to_string()));
    req.digest = ref_digest(r)?;

    let resp = do_req(engine, req).await?;
    let media_type = content_type(resp.headers());
    let header_digest = resp.header_digest()?;
    let body = resp.bytes().await?;

    // when fetching by tag the engine had nothing to verify against, so the
    // advertised digest is checked against the body here
    let digest = match ref_digest(r)? {
        Some(d) => d,
        None => match header_digest {
            Some(advertised) => {
                verify_body(&advertised, &body)?;
                advertised
            }
            None => digest_of(&body),
        },
    };
    let desc = Descriptor::new(media_type.as_str().into(), body.len() as u64, digest);
    Ok((desc, body))
}

pub(crate) async fn manifest_head(engine: &Arc<Engine>, r: &Ref) -> Result<Descriptor> {
    let td = tag_or_digest(r)?;
    let mut req = Req::new(r.registry(), Method::HEAD);
    req.repository = r.repository().to_string();
    req.path = format!("manifests/{td}");
    req.headers
        .push(("accept".to_string(), ACCEPT_MANIFEST.to_string()));

    match do_req(engine, req).await {
        Ok(resp) => {
            let media_type = content_type(resp.headers());
            match resp.header_digest()? {
                Some(digest) => {
                    let size = resp.content_length().unwrap_or(0);
                    Ok(Descriptor::new(media_type.as_str().into(), size, digest))
                }
                // no digest header means the descriptor needs the body
                None => manifest_get(engine, r).await.map(|(desc, _)| desc),
            }
        }
        Err(Error::UnsupportedApi(_)) => {
            trace!("head disabled on {}, using get", r.registry());
            manifest_get(engine, r).await.map(|(desc, _)| desc)
        }
        Err(e) => Err(e),
    }
}

// returns the computed digest plus the response so callers can look at
// headers (the referrers api advertises handling via OCI-Subject)
pub(crate) async fn manifest_put_full(
    engine: &Arc<Engine>,
    r: &Ref,
    media_type: &str,
    body: Bytes,
) -> Result<(Digest, Resp)> {
    let td = tag_or_digest(r)?;
    let digest = digest_of(&body);
    let mut req = Req::new(r.registry(), Method::PUT);
    req.repository = r.repository().to_string();
    req.path = format!("manifests/{td}");
    req.headers
        .push(("content-type".to_string(), media_type.to_string()));
    req.content_len = Some(body.len() as u64);
    req.body = BodySource::Bytes(body);
    req.no_mirrors = true;
    let resp = do_req(engine, req).await?;
    match resp.status() {
        StatusCode::CREATED => Ok((digest, resp)),
        s => Err(Error::HttpStatus(s)),
    }
}

pub(crate) async fn manifest_put(
    engine: &Arc<Engine>,
    r: &Ref,
    media_type: &str,
    body: Bytes,
) -> Result<Digest> {
    manifest_put_full(engine, r, media_type, body)
        .await
        .map(|(digest, _)| digest)
}

// deleting by tag is not expressible in the protocol; callers wanting a tag
// gone use tag_delete which orphans it first
pub(crate) async fn manifest_delete(engine: &Arc<Engine>, r: &Ref) -> Result<()> {
    if r.digest().is_empty() {
        return Err(Error::MissingDigest);
    }
    let mut req = Req::new(r.registry(), Method::DELETE);
    req.repository = r.repository().to_string();
    req.path = format!("manifests/{}", r.digest());
    req.no_mirrors = true;
    let resp = do_req(engine, req).await?;
    match resp.status() {
        s if s.is_success() => Ok(()),
        s => Err(Error::HttpStatus(s)),
    }
}

fn verify_body(expect: &Digest, body: &[u8]) -> Result<()> {
    let Some(mut digester) = Digester::for_digest(expect) else {
        // unknown algorithm in the header, nothing to check against
        return Ok(());
    };
    digester.update(body);
    let computed = digester.finalize();
    if computed != *expect {
        return Err(Error::DigestMismatch {
            expected: expect.to_string(),
            computed: computed.to_string(),
        });
    }
    Ok(())
}
