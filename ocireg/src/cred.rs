use std::process::Stdio;
use std::time::{Duration, Instant};

use log::{trace, warn};
use moka::{Expiry, future::Cache};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::{DEFAULT_CRED_EXPIRE_SECS, HostConfig};
use crate::error::{Error, Result};

// credentials handed to the auth engine. `token` is an identity token used
// with the refresh_token grant; docker credential helpers signal one by
// returning the username "<token>".

const TOKEN_USER: &str = "<token>";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cred {
    pub user: String,
    pub password: String,
    pub token: String,
}

impl Cred {
    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.password.is_empty() && self.token.is_empty()
    }
}

// helper results carry their own freshness bound (credExpire), so the cache
// expires entries per value rather than with one global ttl
#[derive(Clone)]
struct HelperCred {
    cred: Cred,
    expire: Duration,
}

struct ExpireHelperCred;

impl Expiry<String, HelperCred> for ExpireHelperCred {
    fn expire_after_create(
        &self,
        key: &String,
        value: &HelperCred,
        _current_time: Instant,
    ) -> Option<Duration> {
        trace!("helper cred for {key} expires in {:?}", value.expire);
        Some(value.expire)
    }
}

pub(crate) struct CredStore {
    helper_cache: Cache<String, HelperCred>,
}

impl CredStore {
    pub fn new() -> CredStore {
        CredStore {
            helper_cache: Cache::builder()
                .max_capacity(1000)
                .expire_after(ExpireHelperCred)
                .build(),
        }
    }

    // resolves the credentials for a host: static user/pass/token straight
    // from the config, or a credential-helper subprocess with its result
    // cached until credExpire elapses. callers hold the per-host auth lock
    // so concurrent requests block on one helper invocation.
    pub async fn credential(&self, cfg: &HostConfig) -> Result<Cred> {
        if let Some(token) = cfg.token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(Cred {
                token: token.to_string(),
                ..Default::default()
            });
        }
        if let Some(user) = cfg.user.as_deref().filter(|u| !u.is_empty()) {
            return Ok(Cred {
                user: user.to_string(),
                password: cfg.pass.clone().unwrap_or_default(),
                ..Default::default()
            });
        }
        let Some(helper) = cfg.cred_helper.as_deref().filter(|h| !h.is_empty()) else {
            return Ok(Cred::default());
        };

        let server = cfg
            .cred_host
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or(cfg.hostname())
            .to_string();
        let expire = Duration::from_secs(cfg.cred_expire.unwrap_or(DEFAULT_CRED_EXPIRE_SECS));
        let key = format!("{helper}/{server}");
        let helper = helper.to_string();
        let entry = self
            .helper_cache
            .entry(key)
            .or_try_insert_with(async move {
                let cred = run_helper(&helper, &server).await?;
                Ok::<_, Error>(HelperCred { cred, expire })
            })
            .await
            .map_err(|e: std::sync::Arc<Error>| Error::CredHelper(e.to_string()))?;
        Ok(entry.into_value().cred)
    }
}

mod wire {
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(crate) struct HelperResponse {
        #[serde(default)]
        pub(crate) username: String,
        #[serde(default)]
        pub(crate) secret: String,
    }
}

// invokes `docker-credential-<name> get` with a short json document naming
// the server on stdin; the subprocess is short-lived and wait-awaited
async fn run_helper(name: &str, server: &str) -> Result<Cred> {
    let program = format!("docker-credential-{name}");
    trace!("running {program} get for {server}");
    let mut child = Command::new(&program)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::CredHelper(format!("{program}: {e}")))?;
    let input = serde_json::json!({ "ServerURL": server }).to_string();
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| Error::CredHelper(format!("{program}: {e}")))?;
        // closing stdin lets the helper see eof and respond
    }
    let out = child
        .wait_with_output()
        .await
        .map_err(|e| Error::CredHelper(format!("{program}: {e}")))?;
    if !out.status.success() {
        let msg = String::from_utf8_lossy(&out.stderr);
        warn!("{program} get failed for {server}: {}", msg.trim());
        return Err(Error::CredHelper(format!(
            "{program} exited {}",
            out.status
        )));
    }
    let resp: wire::HelperResponse = serde_json::from_slice(&out.stdout)
        .map_err(|_| Error::CredHelper(format!("{program}: unparseable response")))?;
    if resp.username == TOKEN_USER {
        Ok(Cred {
            token: resp.secret,
            ..Default::default()
        })
    } else {
        Ok(Cred {
            user: resp.username,
            password: resp.secret,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_credentials() {
        let store = CredStore::new();

        let mut cfg = HostConfig::new("registry.example.test");
        cfg.user = Some("alice".into());
        cfg.pass = Some("hunter2".into());
        let cred = store.credential(&cfg).await.unwrap();
        assert_eq!(cred.user, "alice");
        assert_eq!(cred.password, "hunter2");
        assert_eq!(cred.token, "");

        let mut cfg = HostConfig::new("registry.example.test");
        cfg.token = Some("identity-token".into());
        let cred = store.credential(&cfg).await.unwrap();
        assert_eq!(cred.token, "identity-token");
        assert_eq!(cred.user, "");

        let cfg = HostConfig::new("registry.example.test");
        assert!(store.credential(&cfg).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_helper_errors() {
        let store = CredStore::new();
        let mut cfg = HostConfig::new("registry.example.test");
        cfg.cred_helper = Some("ocireg-test-does-not-exist".into());
        let err = store.credential(&cfg).await.unwrap_err();
        assert!(matches!(err, Error::CredHelper(_)));
    }

    #[test]
    fn test_helper_response_decode() {
        let resp: wire::HelperResponse =
            serde_json::from_str(r#"{"Username": "<token>", "Secret": "tok"}"#).unwrap();
        assert_eq!(resp.username, TOKEN_USER);
        assert_eq!(resp.secret, "tok");
    }
}
