use std::cmp::Ordering;

// loose semver for server-feature gating. registry version strings are not
// strict semver ("2", "2.0", "registry/2.0", "v2.8.1-beta.1"), so the strict
// semver crate rejects most of what servers actually send and we parse by
// hand instead.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<String>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Version {
            major,
            minor,
            patch,
            pre: None,
        }
    }

    // accepts an optional leading "v" and one or two missing components,
    // returns None rather than erroring since callers treat an unparseable
    // server version the same as an absent one
    pub fn parse(s: &str) -> Option<Version> {
        let s = s.trim();
        let s = s.strip_prefix('v').unwrap_or(s);
        if s.is_empty() {
            return None;
        }
        let (core, pre) = match s.split_once('-') {
            Some((c, p)) => (c, Some(p.to_string())),
            None => (s, None),
        };
        // build metadata is ignored for ordering
        let core = core.split_once('+').map(|(c, _)| c).unwrap_or(core);
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        let patch = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Version {
            major,
            minor,
            patch,
            pre,
        })
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| pre_cmp(self.pre.as_deref(), other.pre.as_deref()))
    }
}

// a pre-release sorts before the release it precedes; pre-release segments
// compare numerically when both sides are numeric, lexically otherwise
fn pre_cmp(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            let mut ai = a.split('.');
            let mut bi = b.split('.');
            loop {
                match (ai.next(), bi.next()) {
                    (None, None) => return Ordering::Equal,
                    (None, Some(_)) => return Ordering::Less,
                    (Some(_), None) => return Ordering::Greater,
                    (Some(x), Some(y)) => {
                        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                            (Ok(xn), Ok(yn)) => xn.cmp(&yn),
                            (Ok(_), Err(_)) => Ordering::Less,
                            (Err(_), Ok(_)) => Ordering::Greater,
                            (Err(_), Err(_)) => x.cmp(y),
                        };
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(Version::parse("2"), Some(Version::new(2, 0, 0)));
        assert_eq!(Version::parse("2.0"), Some(Version::new(2, 0, 0)));
        assert_eq!(Version::parse("v2.8.1"), Some(Version::new(2, 8, 1)));
        assert_eq!(
            Version::parse("2.8.1-beta.1"),
            Some(Version {
                major: 2,
                minor: 8,
                patch: 1,
                pre: Some("beta.1".to_string()),
            })
        );
        assert_eq!(Version::parse("2.8.1+linux"), Some(Version::new(2, 8, 1)));
        assert_eq!(Version::parse(""), None);
        assert_eq!(Version::parse("abc"), None);
        assert_eq!(Version::parse("1.2.3.4"), None);
    }

    #[test]
    fn test_ordering() {
        let v = |s: &str| Version::parse(s).unwrap();
        assert!(v("2.0") < v("2.0.1"));
        assert!(v("2.0.1") < v("2.1"));
        assert!(v("2.1") < v("3"));
        assert!(v("2.8.1-beta.1") < v("2.8.1"));
        assert!(v("2.8.1-beta.1") < v("2.8.1-beta.2"));
        assert!(v("2.8.1-alpha") < v("2.8.1-beta"));
        assert!(v("2.8.1-1") < v("2.8.1-alpha"));
        assert_eq!(v("v2.8.1"), v("2.8.1"));
    }
}
