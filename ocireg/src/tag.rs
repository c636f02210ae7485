use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use log::{trace, warn};
use reqwest::{Method, Url, header};

use crate::error::{Error, Result};
use crate::manifest::{
    self, MT_DOCKER_CONFIG, MT_DOCKER_MANIFEST, MT_DOCKER_MANIFEST_LIST, MT_OCI_CONFIG,
    MT_OCI_MANIFEST, content_type,
};
use crate::reference::Ref;
use crate::reghttp::{Engine, Req, digest_of, do_req};
use crate::{blob, blob::BlobPutOpts};

// tag listing follows both pagination dialects: the distribution-spec
// `n`/`last` cursor and docker's `Link: <...>; rel="next"` header. with no
// limit the engine follows links until the registry runs dry.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagList {
    pub name: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TagOpts {
    pub limit: Option<u32>,
    pub last: Option<String>,
}

mod wire {
    use serde::Deserialize;

    #[derive(Deserialize)]
    pub(crate) struct TagDoc {
        #[serde(default)]
        pub(crate) name: String,
        #[serde(default)]
        pub(crate) tags: Vec<String>,
    }
}

pub(crate) async fn tag_list(engine: &Arc<Engine>, r: &Ref, opts: &TagOpts) -> Result<TagList> {
    let (mut doc, mut next) = tag_page(engine, r, opts, None).await?;
    if opts.limit.is_some() || opts.last.is_some() {
        // manual pagination, one page only
        return Ok(doc);
    }
    // auto-follow; tags stay de-duplicated and in first-seen order
    let mut seen: BTreeSet<String> = doc.tags.iter().cloned().collect();
    while let Some(link) = next.take() {
        let (page, page_next) = tag_page(engine, r, opts, Some(link)).await?;
        for tag in page.tags {
            if seen.insert(tag.clone()) {
                doc.tags.push(tag);
            }
        }
        next = page_next;
    }
    Ok(doc)
}

async fn tag_page(
    engine: &Arc<Engine>,
    r: &Ref,
    opts: &TagOpts,
    link: Option<Url>,
) -> Result<(TagList, Option<Url>)> {
    let mut req = Req::new(r.registry(), Method::GET);
    req.repository = r.repository().to_string();
    match link {
        Some(url) => req.direct_url = Some(url),
        None => {
            req.path = "tags/list".to_string();
            if let Some(limit) = opts.limit {
                req.query.push(("n".to_string(), limit.to_string()));
            }
            if let Some(last) = &opts.last {
                req.query.push(("last".to_string(), last.clone()));
            }
        }
    }
    req.headers
        .push(("accept".to_string(), "application/json".to_string()));
    let resp = do_req(engine, req).await?;

    let ct = content_type(resp.headers());
    if !ct.is_empty() && ct != "application/json" && ct != "text/plain" {
        return Err(Error::UnsupportedMediaType(ct));
    }
    let next = parse_link_next(resp.headers())
        .map(|raw| {
            engine
                .endpoint_base(r.registry())?
                .join(&raw)
                .map_err(|_| Error::ParseFailure(format!("link header {raw}")))
        })
        .transpose()?;
    let body = resp.bytes().await?;
    let doc: wire::TagDoc = serde_json::from_slice(&body)
        .map_err(|_| Error::ParseFailure(format!("tag list for {}", r.common_name())))?;
    Ok((
        TagList {
            name: doc.name,
            tags: doc.tags,
        },
        next,
    ))
}

// `Link: </v2/proj/tags/list?last=x&n=50>; rel="next"`
pub(crate) fn parse_link_next(headers: &header::HeaderMap) -> Option<String> {
    for value in headers.get_all(header::LINK) {
        let Ok(raw) = value.to_str() else {
            continue;
        };
        for part in raw.split(',') {
            let part = part.trim();
            let Some(rest) = part.strip_prefix('<') else {
                continue;
            };
            let Some((url, params)) = rest.split_once('>') else {
                continue;
            };
            let is_next = params.split(';').any(|p| {
                let p = p.trim();
                p == r#"rel="next""# || p == "rel=next"
            });
            if is_next {
                return Some(url.to_string());
            }
        }
    }
    None
}

// native tag delete first; registries without it get the tag orphaned by
// pushing a unique placeholder manifest to the tag and deleting that by
// digest, leaving the original content untouched
pub(crate) async fn tag_delete(engine: &Arc<Engine>, r: &Ref) -> Result<()> {
    if r.tag().is_empty() {
        return Err(Error::MissingTag);
    }
    let mut req = Req::new(r.registry(), Method::DELETE);
    req.repository = r.repository().to_string();
    req.path = format!("manifests/{}", r.tag());
    req.no_mirrors = true;
    match do_req(engine, req).await {
        Ok(resp) if resp.status().is_success() => return Ok(()),
        Ok(resp) => {
            warn!(
                "native tag delete on {} returned {}, using fallback",
                r.common_name(),
                resp.status()
            );
        }
        Err(Error::NotFound) => return Err(Error::NotFound),
        Err(Error::HttpStatus(s)) if s.is_client_error() => {
            warn!(
                "native tag delete on {} returned {s}, using fallback",
                r.common_name()
            );
        }
        Err(e) => return Err(e),
    }

    // mirror the existing manifest's flavor so the registry accepts the
    // placeholder
    let existing = manifest::manifest_head(engine, r).await?;
    let docker = matches!(
        existing.media_type().to_string().as_str(),
        MT_DOCKER_MANIFEST | MT_DOCKER_MANIFEST_LIST
    );
    let (manifest_mt, config_mt) = if docker {
        (MT_DOCKER_MANIFEST, MT_DOCKER_CONFIG)
    } else {
        (MT_OCI_MANIFEST, MT_OCI_CONFIG)
    };

    let config_body: &[u8] = b"{}";
    let config_digest = digest_of(config_body);
    blob::blob_put(
        engine,
        r,
        BlobPutOpts {
            digest: Some(config_digest.clone()),
            size: Some(config_body.len() as u64),
            mount_from: None,
        },
        std::io::Cursor::new(config_body),
    )
    .await?;

    let nonce: u64 = {
        use rand::Rng;
        rand::rng().random()
    };
    let placeholder = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": manifest_mt,
        "config": {
            "mediaType": config_mt,
            "digest": config_digest.to_string(),
            "size": config_body.len(),
        },
        "layers": [],
        "annotations": {
            "org.opencontainers.image.created": chrono::Utc::now().to_rfc3339(),
            "com.ocireg.tag-delete": format!("{nonce:016x}"),
        },
    });
    let body = Bytes::from(serde_json::to_vec(&placeholder).expect("literal json serializes"));
    let digest = manifest::manifest_put(engine, r, manifest_mt, body).await?;
    trace!(
        "orphaning {} via placeholder {digest}",
        r.common_name()
    );
    manifest::manifest_delete(engine, &r.with_digest(&digest.to_string())?).await
}
