use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

// a parsed `[scheme://]registry[/path]repository[:tag][@digest]` reference.
// the leading component is only a registry when it looks like a host
// (contains "." or ":", or is exactly "localhost"); otherwise the default
// registry is implied and a bare repository gets the "library/" prefix the
// way docker resolves it.

pub const DEFAULT_REGISTRY: &str = "docker.io";
const DOCKER_ALIASES: [&str; 3] = ["docker.io", "registry-1.docker.io", "index.docker.io"];
const DEFAULT_TAG: &str = "latest";
const SCHEME_REGISTRY: &str = "reg";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ref {
    scheme: String,
    registry: String,
    repository: String,
    tag: String,
    digest: String,
}

impl Ref {
    pub fn new(s: &str) -> Result<Ref> {
        let bad = || Error::InvalidReference(s.to_string());

        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => (SCHEME_REGISTRY, s),
        };
        if scheme != SCHEME_REGISTRY {
            // other schemes (layout paths and the like) are handled a layer
            // up; we keep the raw remainder so the caller can route on scheme
            return Ok(Ref {
                scheme: scheme.to_string(),
                registry: String::new(),
                repository: rest.to_string(),
                tag: String::new(),
                digest: String::new(),
            });
        }
        if rest.is_empty() {
            return Err(bad());
        }

        let (rest, digest) = match rest.split_once('@') {
            Some((rest, digest)) => {
                if !valid_digest(digest) {
                    return Err(bad());
                }
                (rest, digest.to_string())
            }
            None => (rest, String::new()),
        };

        let (registry, path) = match rest.split_once('/') {
            Some((first, p)) if looks_like_host(first) => (first.to_string(), p),
            _ => (DEFAULT_REGISTRY.to_string(), rest),
        };
        if registry.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(bad());
        }
        if !valid_registry(&registry) {
            return Err(bad());
        }
        let registry = if DOCKER_ALIASES.contains(&registry.as_str()) {
            DEFAULT_REGISTRY.to_string()
        } else {
            registry
        };

        // the repository charset has no ':' so any colon left in the path
        // starts the tag
        let (repository, tag) = match path.split_once(':') {
            Some((repo, tag)) => {
                if !valid_tag(tag) {
                    return Err(bad());
                }
                (repo.to_string(), tag.to_string())
            }
            None => (path.to_string(), String::new()),
        };
        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };
        if !valid_repository(&repository) {
            return Err(bad());
        }

        // content operations need a tag or a digest, default the tag the way
        // docker does when neither was given
        let tag = if tag.is_empty() && digest.is_empty() {
            DEFAULT_TAG.to_string()
        } else {
            tag
        };

        Ok(Ref {
            scheme: scheme.to_string(),
            registry,
            repository,
            tag,
            digest,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn is_registry(&self) -> bool {
        self.scheme == SCHEME_REGISTRY
    }

    // display form for logs and errors, always includes the registry
    pub fn common_name(&self) -> String {
        let mut out = format!("{}/{}", self.registry, self.repository);
        if !self.tag.is_empty() {
            out.push(':');
            out.push_str(&self.tag);
        }
        if !self.digest.is_empty() {
            out.push('@');
            out.push_str(&self.digest);
        }
        out
    }

    // groups requests that hit the same origin regardless of tag/digest
    pub fn to_reg(&self) -> Ref {
        Ref {
            scheme: self.scheme.clone(),
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: String::new(),
            digest: String::new(),
        }
    }

    pub fn with_tag(&self, tag: &str) -> Result<Ref> {
        if !valid_tag(tag) {
            return Err(Error::InvalidReference(format!(
                "{}:{}",
                self.common_name(),
                tag
            )));
        }
        let mut r = self.clone();
        r.tag = tag.to_string();
        r.digest = String::new();
        Ok(r)
    }

    pub fn with_digest(&self, digest: &str) -> Result<Ref> {
        if !valid_digest(digest) {
            return Err(Error::InvalidReference(format!(
                "{}@{}",
                self.common_name(),
                digest
            )));
        }
        let mut r = self.clone();
        r.tag = String::new();
        r.digest = digest.to_string();
        Ok(r)
    }
}

impl FromStr for Ref {
    type Err = Error;
    fn from_str(s: &str) -> Result<Ref> {
        Ref::new(s)
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.common_name())
    }
}

fn looks_like_host(s: &str) -> bool {
    !s.is_empty() && (s.contains('.') || s.contains(':') || s == "localhost")
}

fn valid_registry(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    let host = match s.split_once(':') {
        Some((host, port)) => {
            if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
                return false;
            }
            host
        }
        None => s,
    };
    !host.is_empty()
        && host
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'-')
}

// one or more lowercase alphanumeric components joined by '/', where a
// component may contain single '.', one or two '_', or runs of '-' as
// interior separators (the published distribution grammar)
fn valid_repository(s: &str) -> bool {
    if s.is_empty() || s.len() > 255 {
        return false;
    }
    s.split('/').all(valid_repo_component)
}

fn valid_repo_component(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.is_empty() {
        return false;
    }
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    // separators between alphanumeric runs: single '.', one or two '_', or
    // any run of '-'; mixed runs like "-_" are invalid
    let mut run_char = 0u8;
    let mut run_len = 0usize;
    for &b in bytes {
        if alnum(b) {
            run_len = 0;
            continue;
        }
        if !matches!(b, b'.' | b'_' | b'-') {
            return false;
        }
        if run_len > 0 && run_char != b {
            return false;
        }
        run_char = b;
        run_len += 1;
        let max = match b {
            b'.' => 1,
            b'_' => 2,
            _ => usize::MAX,
        };
        if run_len > max {
            return false;
        }
    }
    true
}

fn valid_tag(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.is_empty() || bytes.len() > 128 {
        return false;
    }
    let word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    word(bytes[0])
        && bytes[1..]
            .iter()
            .all(|&b| word(b) || b == b'.' || b == b'-')
}

// syntactic `alg:hex` validation; known algorithms get an exact length check
pub(crate) fn valid_digest(s: &str) -> bool {
    let Some((alg, hex)) = s.split_once(':') else {
        return false;
    };
    if alg.is_empty() || hex.is_empty() {
        return false;
    }
    if !alg
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"+._-".contains(&b))
    {
        return false;
    }
    let lower_hex = hex
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    match alg {
        "sha256" => lower_hex && hex.len() == 64,
        "sha512" => lower_hex && hex.len() == 128,
        _ => lower_hex && hex.len() >= 32,
    }
}
