use std::sync::Mutex;

use log::warn;

// registries attach `Warning: 299 - "msg"` headers to responses (rfc 7234).
// the engine strips them off every response and deposits each distinct
// message here once, in the order first seen.

#[derive(Debug, Default)]
pub struct WarningList {
    seen: Mutex<Vec<String>>,
}

impl WarningList {
    pub fn new() -> Self {
        Self::default()
    }

    // dedup on the full message; the first occurrence is also logged
    pub fn handle(&self, msg: &str) {
        let mut seen = self.seen.lock().expect("warning lock poisoned");
        if seen.iter().any(|m| m == msg) {
            return;
        }
        warn!("registry warning: {msg}");
        seen.push(msg.to_string());
    }

    pub fn all(&self) -> Vec<String> {
        self.seen.lock().expect("warning lock poisoned").clone()
    }
}

// extracts the quoted message from a `299 - "msg"` header value, returning
// None for other warn codes or malformed values
pub(crate) fn parse_warning_value(value: &str) -> Option<&str> {
    let rest = value.trim_start().strip_prefix("299")?;
    let start = rest.find('"')?;
    let rest = &rest[start + 1..];
    let end = rest.rfind('"')?;
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_warning_value() {
        assert_eq!(
            parse_warning_value(r#"299 - "deprecated tag""#),
            Some("deprecated tag")
        );
        assert_eq!(
            parse_warning_value(r#"299 registry.example.test "planned outage""#),
            Some("planned outage")
        );
        assert_eq!(parse_warning_value(r#"199 - "hop warning""#), None);
        assert_eq!(parse_warning_value("299 - unquoted"), None);
    }

    #[test]
    fn test_dedup_and_order() {
        let w = WarningList::new();
        w.handle("a");
        w.handle("b");
        w.handle("a");
        w.handle("c");
        w.handle("b");
        assert_eq!(w.all(), vec!["a", "b", "c"]);
    }
}
