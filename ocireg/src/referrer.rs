use std::sync::Arc;

use bytes::Bytes;
use log::trace;
use oci_spec::image::{
    Descriptor, DescriptorBuilder, Digest, ImageIndex, ImageIndexBuilder, MediaType,
};
use reqwest::Method;

use crate::error::{Error, Result};
use crate::manifest::{self, MT_OCI_INDEX, content_type};
use crate::reference::Ref;
use crate::reghttp::{Engine, Req, digest_of, do_req};

// referrer discovery has two shapes: the native referrers api
// (GET referrers/<digest> returning an oci index) and the tag-scheme
// fallback, where referrers accumulate in an index stored under the tag
// `<alg>-<hex>`. pushes keep the fallback index up to date whenever the
// registry did not acknowledge the subject.

const OCI_SUBJECT: &str = "oci-subject";

#[derive(Debug, Clone, Default)]
pub struct ReferrerOpts {
    // client-side artifactType filter, also forwarded to the native api
    pub artifact_type: Option<String>,
    // fetch each referenced manifest to materialize annotations the
    // fallback index does not carry
    pub force_get: bool,
}

pub(crate) fn fallback_tag(digest: &Digest) -> String {
    let alg = digest.algorithm().as_ref();
    let hex = digest.digest();
    let hex = &hex[..hex.len().min(64)];
    format!("{alg}-{hex}")
}

fn subject_digest(r: &Ref) -> Result<Digest> {
    if r.digest().is_empty() {
        return Err(Error::MissingDigest);
    }
    r.digest()
        .parse()
        .map_err(|_| Error::InvalidReference(r.common_name()))
}

pub(crate) async fn referrer_list(
    engine: &Arc<Engine>,
    r: &Ref,
    opts: &ReferrerOpts,
) -> Result<ImageIndex> {
    let digest = subject_digest(r)?;

    let native = {
        let mut req = Req::new(r.registry(), Method::GET);
        req.repository = r.repository().to_string();
        req.path = format!("referrers/{digest}");
        req.headers
            .push(("accept".to_string(), MT_OCI_INDEX.to_string()));
        if let Some(at) = &opts.artifact_type {
            req.query.push(("artifactType".to_string(), at.clone()));
        }
        req.ignore_err = true;
        do_req(engine, req).await
    };
    let mut index = match native {
        Ok(resp) if content_type(resp.headers()) == MT_OCI_INDEX => {
            let body = resp.bytes().await?;
            serde_json::from_slice(&body)
                .map_err(|_| Error::ParseFailure(format!("referrers index for {digest}")))?
        }
        // a 200 with the wrong media type means the endpoint exists but is
        // not the referrers api; same treatment as not implemented
        Ok(_) | Err(Error::NotFound) | Err(Error::UnsupportedApi(_)) => {
            trace!("referrers api unavailable on {}, using tag scheme", r.registry());
            fallback_index(engine, r, &digest).await?
        }
        Err(Error::HttpStatus(s)) if s.is_client_error() => {
            fallback_index(engine, r, &digest).await?
        }
        Err(e) => return Err(e),
    };

    if let Some(filter) = &opts.artifact_type {
        let kept: Vec<Descriptor> = index
            .manifests()
            .iter()
            .filter(|d| {
                d.artifact_type()
                    .as_ref()
                    .map(|m| m.to_string() == *filter)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        index = rebuild_index(kept)?;
    }
    if opts.force_get {
        index = materialize(engine, r, index).await?;
    }
    Ok(index)
}

async fn fallback_index(engine: &Arc<Engine>, r: &Ref, digest: &Digest) -> Result<ImageIndex> {
    let tagged = r.with_tag(&fallback_tag(digest))?;
    match manifest::manifest_get(engine, &tagged).await {
        Ok((_, body)) => serde_json::from_slice(&body)
            .map_err(|_| Error::ParseFailure(format!("referrers fallback index for {digest}"))),
        Err(Error::NotFound) => rebuild_index(Vec::new()),
        Err(e) => Err(e),
    }
}

fn rebuild_index(manifests: Vec<Descriptor>) -> Result<ImageIndex> {
    ImageIndexBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageIndex)
        .manifests(manifests)
        .build()
        .map_err(|_| Error::ParseFailure("image index".to_string()))
}

// GETs every referenced manifest to recover artifactType and annotations,
// which the fallback tag index may lack
async fn materialize(engine: &Arc<Engine>, r: &Ref, index: ImageIndex) -> Result<ImageIndex> {
    let mut out = Vec::with_capacity(index.manifests().len());
    for desc in index.manifests() {
        let by_digest = r.with_digest(&desc.digest().to_string())?;
        let (_, body) = match manifest::manifest_get(engine, &by_digest).await {
            Ok(v) => v,
            Err(Error::NotFound) => {
                // stale fallback entry, keep the descriptor as is
                out.push(desc.clone());
                continue;
            }
            Err(e) => return Err(e),
        };
        out.push(annotated_descriptor(desc.media_type().clone(), &body)?);
    }
    rebuild_index(out)
}

mod wire {
    use std::collections::HashMap;

    use serde::Deserialize;

    #[derive(Deserialize, Default)]
    pub(crate) struct ManifestPeek {
        #[serde(default, rename = "artifactType")]
        pub(crate) artifact_type: Option<String>,
        #[serde(default)]
        pub(crate) annotations: Option<HashMap<String, String>>,
        #[serde(default)]
        pub(crate) config: Option<PeekConfig>,
    }

    #[derive(Deserialize)]
    pub(crate) struct PeekConfig {
        #[serde(default, rename = "mediaType")]
        pub(crate) media_type: Option<String>,
    }
}

// descriptor for a manifest body: artifactType falls back to the config
// media type per the image-spec referrer rules
fn annotated_descriptor(media_type: MediaType, body: &[u8]) -> Result<Descriptor> {
    let peek: wire::ManifestPeek = serde_json::from_slice(body).unwrap_or_default();
    let artifact_type = peek
        .artifact_type
        .or(peek.config.and_then(|c| c.media_type));
    let mut builder = DescriptorBuilder::default()
        .media_type(media_type)
        .size(body.len() as u64)
        .digest(digest_of(body));
    if let Some(at) = artifact_type {
        builder = builder.artifact_type(MediaType::from(at.as_str()));
    }
    if let Some(annotations) = peek.annotations {
        builder = builder.annotations(annotations);
    }
    builder
        .build()
        .map_err(|_| Error::ParseFailure("descriptor".to_string()))
}

// pushes a subject-bearing manifest. registries implementing the referrers
// api answer with OCI-Subject and need nothing more; everyone else gets the
// fallback index updated under the subject's tag.
pub(crate) async fn referrer_put(
    engine: &Arc<Engine>,
    subject: &Ref,
    media_type: &str,
    body: Bytes,
) -> Result<Digest> {
    let subject_d = subject_digest(subject)?;
    let digest = digest_of(&body);
    let by_digest = subject.with_digest(&digest.to_string())?;
    let (digest, resp) =
        manifest::manifest_put_full(engine, &by_digest, media_type, body.clone()).await?;
    if resp.headers().contains_key(OCI_SUBJECT) {
        return Ok(digest);
    }

    trace!(
        "registry {} did not acknowledge subject, updating fallback index",
        subject.registry()
    );
    let current = fallback_index(engine, subject, &subject_d).await?;
    let mut manifests = current.manifests().to_vec();
    if !manifests.iter().any(|d| *d.digest() == digest) {
        manifests.push(annotated_descriptor(MediaType::from(media_type), &body)?);
        let index = rebuild_index(manifests)?;
        let index_body = Bytes::from(
            serde_json::to_vec(&index)
                .map_err(|_| Error::ParseFailure("image index".to_string()))?,
        );
        let tagged = subject.with_tag(&fallback_tag(&subject_d))?;
        manifest::manifest_put(engine, &tagged, MT_OCI_INDEX, index_body).await?;
    }
    Ok(digest)
}
