use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use log::{trace, warn};
use reqwest::{RequestBuilder, StatusCode, header};
use tokio::sync::Mutex;

use crate::config::HostConfig;
use crate::cred::{Cred, CredStore};
use crate::error::{Error, Result};

const CLIENT_ID: &str = "ocireg";

// minimum token lifetime; registries handing out very short expiries would
// otherwise make every other request a token round trip
const MIN_TOKEN_LIFETIME_SECS: i64 = 60;

// a parsed www-authenticate challenge: scheme plus its auth-params
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Challenge {
    pub scheme: String,
    pub params: BTreeMap<String, String>,
}

// `repository:name:pull,push` and friends. actions are a set so merging
// challenges unions them per (kind, name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Scope {
    pub kind: String,
    pub name: String,
    pub actions: BTreeSet<String>,
}

impl Scope {
    pub fn repo(repo: &str, actions: &[&str]) -> Scope {
        Scope {
            kind: "repository".to_string(),
            name: repo.to_string(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn registry_catalog() -> Scope {
        Scope {
            kind: "registry".to_string(),
            name: "catalog".to_string(),
            actions: ["*".to_string()].into(),
        }
    }

    // the name may itself contain ':' (hosts with ports show up in some
    // registries), so kind is split off the front and actions off the back
    pub fn parse(s: &str) -> Option<Scope> {
        let (kind, rest) = s.split_once(':')?;
        let (name, actions) = rest.rsplit_once(':')?;
        if kind.is_empty() || name.is_empty() {
            return None;
        }
        Some(Scope {
            kind: kind.to_string(),
            name: name.to_string(),
            actions: actions
                .split(',')
                .filter(|a| !a.is_empty())
                .map(|a| a.to_string())
                .collect(),
        })
    }

    pub fn parse_list(s: &str) -> Vec<Scope> {
        s.split_whitespace().filter_map(Scope::parse).collect()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let actions: Vec<&str> = self.actions.iter().map(|a| a.as_str()).collect();
        write!(f, "{}:{}:{}", self.kind, self.name, actions.join(","))
    }
}

// unions `add` into `into`, returns whether anything new was granted
pub(crate) fn merge_scopes(into: &mut Vec<Scope>, add: &[Scope]) -> bool {
    let mut changed = false;
    for scope in add {
        match into
            .iter_mut()
            .find(|s| s.kind == scope.kind && s.name == scope.name)
        {
            Some(existing) => {
                for action in &scope.actions {
                    changed |= existing.actions.insert(action.clone());
                }
            }
            None => {
                into.push(scope.clone());
                changed = true;
            }
        }
    }
    changed
}

enum Handler {
    // the header value is precomputed; basic has no other state
    Basic { header: String },
    Bearer(BearerState),
}

struct BearerState {
    realm: String,
    service: String,
    scopes: Vec<Scope>,
    token: String,
    refresh_token: String,
    expires: DateTime<Utc>,
}

impl BearerState {
    fn new(realm: String, service: String) -> BearerState {
        BearerState {
            realm,
            service,
            scopes: Vec::new(),
            token: String::new(),
            refresh_token: String::new(),
            expires: DateTime::<Utc>::MIN_UTC,
        }
    }

    fn token_valid(&self) -> bool {
        !self.token.is_empty() && Utc::now() < self.expires
    }
}

#[derive(Default)]
struct HostAuth {
    handler: Option<Handler>,
}

// per-host (or per host+repo under repoAuth) authentication state. the
// outer map lock is short; the per-key async mutex serializes the whole
// token exchange so concurrent requests wanting the same token block on a
// single round trip, credential-helper call included.
pub(crate) struct Auth {
    creds: CredStore,
    handlers: StdMutex<BTreeMap<String, Arc<Mutex<HostAuth>>>>,
}

impl Auth {
    pub fn new() -> Auth {
        Auth {
            creds: CredStore::new(),
            handlers: StdMutex::new(BTreeMap::new()),
        }
    }

    pub fn key(cfg: &HostConfig, repo: &str) -> String {
        if cfg.repo_auth && !repo.is_empty() {
            format!("{}/{}", cfg.name, repo)
        } else {
            cfg.name.clone()
        }
    }

    fn entry(&self, key: &str) -> Arc<Mutex<HostAuth>> {
        let mut handlers = self.handlers.lock().expect("auth lock poisoned");
        handlers.entry(key.to_string()).or_default().clone()
    }

    // applies whatever credentials are currently cached for the key; a
    // missing or expired token is still stamped and the 401 path refreshes
    pub async fn stamp(&self, cfg: &HostConfig, repo: &str, rb: RequestBuilder) -> RequestBuilder {
        let entry = self.entry(&Auth::key(cfg, repo));
        let state = entry.lock().await;
        match &state.handler {
            Some(Handler::Basic { header }) => rb.header(header::AUTHORIZATION, header.clone()),
            Some(Handler::Bearer(b)) if !b.token.is_empty() => {
                rb.header(header::AUTHORIZATION, format!("Bearer {}", b.token))
            }
            _ => rb,
        }
    }

    // reacts to a 401: parses the challenges, merges the wanted scopes and
    // re-acquires a token. Err(NoNewChallenge) tells the engine that
    // retrying cannot help.
    pub async fn handle_challenge(
        &self,
        cfg: &HostConfig,
        repo: &str,
        headers: &header::HeaderMap,
        want: &[Scope],
        client: &reqwest::Client,
    ) -> Result<()> {
        let mut challenges = Vec::new();
        for value in headers.get_all(header::WWW_AUTHENTICATE) {
            let raw = value
                .to_str()
                .map_err(|_| Error::ParseFailure("www-authenticate header".to_string()))?;
            challenges.extend(parse_challenge_header(raw)?);
        }
        if challenges.is_empty() {
            return Err(Error::EmptyChallenge);
        }
        let challenge = challenges
            .iter()
            .find(|c| c.scheme == "basic" || c.scheme == "bearer")
            .ok_or(Error::EmptyChallenge)?;

        let ident = Auth::key(cfg, repo);
        let entry = self.entry(&ident);
        let mut state = entry.lock().await;
        // helper invocation happens under the key lock so concurrent
        // requests wait on one subprocess
        let cred = self.creds.credential(cfg).await?;

        if challenge.scheme == "basic" {
            if cred.user.is_empty() {
                return Err(Error::HttpUnauthorized(ident));
            }
            let value = format!(
                "Basic {}",
                BASE64.encode(format!("{}:{}", cred.user, cred.password))
            );
            if matches!(&state.handler, Some(Handler::Basic { header }) if *header == value) {
                // same credentials already rejected once
                return Err(Error::NoNewChallenge);
            }
            state.handler = Some(Handler::Basic { header: value });
            return Ok(());
        }

        let realm = challenge
            .params
            .get("realm")
            .ok_or_else(|| Error::ParseFailure("bearer challenge without realm".to_string()))?
            .clone();
        let service = challenge
            .params
            .get("service")
            .cloned()
            .unwrap_or_default();
        let challenge_scopes = challenge
            .params
            .get("scope")
            .map(|s| Scope::parse_list(s))
            .unwrap_or_default();

        let bearer = match &mut state.handler {
            Some(Handler::Bearer(b)) if b.realm == realm && b.service == service => b,
            _ => {
                state.handler = Some(Handler::Bearer(BearerState::new(realm, service)));
                match &mut state.handler {
                    Some(Handler::Bearer(b)) => b,
                    _ => unreachable!(),
                }
            }
        };
        let mut changed = merge_scopes(&mut bearer.scopes, &challenge_scopes);
        changed |= merge_scopes(&mut bearer.scopes, want);
        if !changed && bearer.token_valid() {
            return Err(Error::NoNewChallenge);
        }
        fetch_token(bearer, &cred, client, &ident).await
    }
}

mod wire {
    use serde::Deserialize;

    #[derive(Deserialize)]
    pub(crate) struct TokenResponse {
        #[serde(default)]
        pub(crate) token: String,
        #[serde(default)]
        pub(crate) access_token: String,
        #[serde(default)]
        pub(crate) expires_in: Option<i64>,
        #[serde(default)]
        pub(crate) issued_at: Option<String>,
        #[serde(default)]
        pub(crate) refresh_token: String,
        #[serde(default)]
        pub(crate) scope: String,
    }
}

// token acquisition order: refresh-token grant when an identity token is at
// hand, password grant with user/pass, anonymous GET otherwise; a 404 from
// the POST endpoints falls back to the GET form
async fn fetch_token(
    state: &mut BearerState,
    cred: &Cred,
    client: &reqwest::Client,
    ident: &str,
) -> Result<()> {
    let scope_strs: Vec<String> = state.scopes.iter().map(|s| s.to_string()).collect();
    let scope_joined = scope_strs.join(" ");
    let refresh = if !cred.token.is_empty() {
        cred.token.clone()
    } else {
        state.refresh_token.clone()
    };

    let res = if !refresh.is_empty() {
        trace!("token refresh grant for {ident}");
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh.as_str()),
            ("service", state.service.as_str()),
            ("client_id", CLIENT_ID),
            ("scope", scope_joined.as_str()),
        ];
        let res = client.post(&state.realm).form(&form).send().await?;
        if res.status() == StatusCode::NOT_FOUND {
            token_get(state, cred, client, &scope_strs).await?
        } else {
            res
        }
    } else if !cred.user.is_empty() {
        trace!("token password grant for {ident}");
        let form = [
            ("grant_type", "password"),
            ("username", cred.user.as_str()),
            ("password", cred.password.as_str()),
            ("service", state.service.as_str()),
            ("client_id", CLIENT_ID),
            ("scope", scope_joined.as_str()),
        ];
        let res = client.post(&state.realm).form(&form).send().await?;
        if res.status() == StatusCode::NOT_FOUND {
            token_get(state, cred, client, &scope_strs).await?
        } else {
            res
        }
    } else {
        trace!("anonymous token request for {ident}");
        token_get(state, cred, client, &scope_strs).await?
    };

    match res.status() {
        StatusCode::OK => {}
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            return Err(Error::HttpUnauthorized(ident.to_string()));
        }
        status => return Err(Error::HttpStatus(status)),
    }
    let resp: wire::TokenResponse = res
        .json()
        .await
        .map_err(|_| Error::ParseFailure("token response".to_string()))?;

    let token = if !resp.token.is_empty() {
        resp.token
    } else {
        resp.access_token
    };
    if token.is_empty() {
        return Err(Error::ParseFailure("token response".to_string()));
    }

    let expires_in = resp
        .expires_in
        .unwrap_or(MIN_TOKEN_LIFETIME_SECS)
        .max(MIN_TOKEN_LIFETIME_SECS);
    let now = Utc::now();
    let issued = resp
        .issued_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
        .filter(|d| *d <= now)
        .unwrap_or(now);
    let mut expires = issued + chrono::Duration::seconds(expires_in);
    if expires <= now {
        // skewed issued_at would make the token look dead on arrival
        expires = now + chrono::Duration::seconds(expires_in);
    }

    state.token = token;
    state.expires = expires;
    if !resp.refresh_token.is_empty() {
        state.refresh_token = resp.refresh_token;
    }
    // a narrower grant than requested is recorded so a later broader need
    // triggers re-acquisition
    if !resp.scope.is_empty() {
        let granted = Scope::parse_list(&resp.scope);
        if !granted.is_empty() {
            state.scopes = granted;
        }
    }
    trace!("token for {ident} expires {}", state.expires);
    Ok(())
}

async fn token_get(
    state: &BearerState,
    cred: &Cred,
    client: &reqwest::Client,
    scopes: &[String],
) -> Result<reqwest::Response> {
    let mut rb = client.get(&state.realm).query(&[
        ("service", state.service.as_str()),
        ("client_id", CLIENT_ID),
    ]);
    for scope in scopes {
        rb = rb.query(&[("scope", scope.as_str())]);
    }
    if !cred.user.is_empty() {
        rb = rb.basic_auth(&cred.user, Some(&cred.password));
    }
    let res = rb.send().await?;
    if !res.status().is_success() && res.status() != StatusCode::UNAUTHORIZED {
        warn!(
            "token endpoint {} returned {}",
            state.realm,
            res.status()
        );
    }
    Ok(res)
}

// --- challenge parsing ---------------------------------------------------

// rfc 7235 challenge lists are awkward: commas separate both parameters and
// challenges. nom handles the pieces (tokens, quoted strings, params) and a
// small loop disambiguates: an element that parses as `token=value` extends
// the current challenge, anything else starts a new one. unquoted values
// are tolerated, unterminated quotes are not.
pub(crate) fn parse_challenge_header(input: &str) -> Result<Vec<Challenge>> {
    use nom::Parser;
    use nom::bytes::complete::{take_while, take_while1};
    use nom::character::complete::{char, space0};
    use nom::sequence::delimited;

    fn is_tchar(c: char) -> bool {
        c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
    }

    fn token(input: &str) -> nom::IResult<&str, &str> {
        take_while1(is_tchar).parse(input)
    }

    fn quoted(input: &str) -> nom::IResult<&str, &str> {
        delimited(char('"'), take_while(|c| c != '"'), char('"')).parse(input)
    }

    // unquoted values run to the next comma or space (realms carry ':' and
    // '/'); a value opening with '"' must close it, there is no fallback
    fn param(input: &str) -> nom::IResult<&str, (&str, &str)> {
        let (input, k) = token(input)?;
        let (input, _) = delimited(space0, char('='), space0).parse(input)?;
        if input.starts_with('"') {
            let (input, v) = quoted(input)?;
            Ok((input, (k, v)))
        } else {
            let (input, v) =
                take_while1(|c: char| c != ',' && c != ' ' && c != '"').parse(input)?;
            Ok((input, (k, v)))
        }
    }

    let fail = || Error::ParseFailure(format!("www-authenticate challenge {input:?}"));

    let mut out: Vec<Challenge> = Vec::new();
    let mut rest = input.trim_start();
    let mut first = true;
    while !rest.is_empty() {
        if !first {
            rest = rest.trim_start();
            rest = rest.strip_prefix(',').ok_or_else(fail)?.trim_start();
            if rest.is_empty() {
                break;
            }
        }
        first = false;

        if !out.is_empty() {
            if let Ok((r, (k, v))) = param(rest) {
                let current = out.last_mut().expect("non-empty checked above");
                current
                    .params
                    .insert(k.to_ascii_lowercase(), v.to_string());
                rest = r;
                continue;
            }
        }
        let (r, scheme) = token(rest).map_err(|_| fail())?;
        out.push(Challenge {
            scheme: scheme.to_ascii_lowercase(),
            params: BTreeMap::new(),
        });
        rest = r;
        // the first parameter follows the scheme with a space, no comma
        let trimmed = rest.trim_start();
        if trimmed.len() < rest.len() {
            if let Ok((r2, (k, v))) = param(trimmed) {
                let current = out.last_mut().expect("just pushed");
                current
                    .params
                    .insert(k.to_ascii_lowercase(), v.to_string());
                rest = r2;
            } else {
                rest = trimmed;
            }
        }
    }
    if out.is_empty() {
        return Err(Error::EmptyChallenge);
    }
    Ok(out)
}
