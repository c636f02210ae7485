use std::collections::BTreeSet;
use std::sync::Arc;

use log::trace;
use reqwest::{Method, Url, header};

use crate::auth::Scope;
use crate::error::{Error, Result};
use crate::manifest::content_type;
use crate::reghttp::{Engine, Req, do_req};

// repository (catalog) listing over GET /v2/_catalog, paginated the same
// two ways tag listing is: the `n`/`last` cursor and the Link header.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoList {
    pub repositories: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RepoOpts {
    pub limit: Option<u32>,
    pub last: Option<String>,
}

mod wire {
    use serde::Deserialize;

    #[derive(Deserialize)]
    pub(crate) struct CatalogDoc {
        #[serde(default)]
        pub(crate) repositories: Vec<String>,
    }
}

pub(crate) async fn repo_list(
    engine: &Arc<Engine>,
    host: &str,
    opts: &RepoOpts,
) -> Result<RepoList> {
    let (mut list, mut next) = repo_page(engine, host, opts, None).await?;
    if opts.limit.is_some() || opts.last.is_some() {
        return Ok(list);
    }
    let mut seen: BTreeSet<String> = list.repositories.iter().cloned().collect();
    while let Some(link) = next.take() {
        let (page, page_next) = repo_page(engine, host, opts, Some(link)).await?;
        for repo in page.repositories {
            if seen.insert(repo.clone()) {
                list.repositories.push(repo);
            }
        }
        next = page_next;
    }
    Ok(list)
}

async fn repo_page(
    engine: &Arc<Engine>,
    host: &str,
    opts: &RepoOpts,
    link: Option<Url>,
) -> Result<(RepoList, Option<Url>)> {
    let mut req = Req::new(host, Method::GET);
    match link {
        Some(url) => req.direct_url = Some(url),
        None => {
            req.path = "_catalog".to_string();
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
    req.extra_scope = Some(Scope::registry_catalog());
    let resp = do_req(engine, req).await?;

    let ct = content_type(resp.headers());
    if !ct.is_empty() && ct != "application/json" && ct != "text/plain" {
        return Err(Error::UnsupportedMediaType(ct));
    }
    let next = parse_next(resp.headers(), engine, host)?;
    let body = resp.bytes().await?;
    let doc: wire::CatalogDoc = serde_json::from_slice(&body)
        .map_err(|_| Error::ParseFailure(format!("catalog for {host}")))?;
    trace!("catalog page from {host}: {} repositories", doc.repositories.len());
    Ok((
        RepoList {
            repositories: doc.repositories,
        },
        next,
    ))
}

fn parse_next(
    headers: &header::HeaderMap,
    engine: &Arc<Engine>,
    host: &str,
) -> Result<Option<Url>> {
    crate::tag::parse_link_next(headers)
        .map(|raw| {
            engine
                .endpoint_base(host)?
                .join(&raw)
                .map_err(|_| Error::ParseFailure(format!("link header {raw}")))
        })
        .transpose()
}
