use std::collections::BTreeSet;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::GuardError;

/// Hostnames the gateway is authorized to contact.
///
/// Entries are added only through explicit, user-approved connector setup.
/// The pipeline reads this set and never writes to it.
pub struct Allowlist {
    domains: RwLock<BTreeSet<String>>,
}

impl Allowlist {
    pub fn new() -> Self {
        Self {
            domains: RwLock::new(BTreeSet::new()),
        }
    }

    /// Build from configured entries, skipping any that are not hostnames.
    pub fn from_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        for domain in domains {
            match normalize(domain.as_ref()) {
                Some(d) => {
                    set.insert(d);
                }
                None => warn!(domain = domain.as_ref(), "Ignoring invalid allowlist entry"),
            }
        }
        Self {
            domains: RwLock::new(set),
        }
    }

    pub fn is_allowed(&self, domain: &str) -> bool {
        match normalize(domain) {
            Some(d) => self.domains.read().contains(&d),
            None => false,
        }
    }

    /// Authorize a hostname. Returns `false` if it was already present.
    pub fn add(&self, domain: &str) -> Result<bool, GuardError> {
        let normalized =
            normalize(domain).ok_or_else(|| GuardError::InvalidDomain(domain.to_string()))?;
        let inserted = self.domains.write().insert(normalized.clone());
        if inserted {
            info!(domain = %normalized, "Domain added to allowlist");
        }
        Ok(inserted)
    }

    pub fn remove(&self, domain: &str) -> bool {
        match normalize(domain) {
            Some(d) => {
                let removed = self.domains.write().remove(&d);
                if removed {
                    info!(domain = %d, "Domain removed from allowlist");
                }
                removed
            }
            None => false,
        }
    }

    pub fn domains(&self) -> Vec<String> {
        self.domains.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.domains.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.read().is_empty()
    }
}

impl Default for Allowlist {
    fn default() -> Self {
        Self::new()
    }
}

/// Lower-cased hostname without a trailing dot, or `None` if `raw` is not a
/// bare hostname.
fn normalize(raw: &str) -> Option<String> {
    let host = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() || host.len() > 253 {
        return None;
    }
    let valid = host
        .split('.')
        .all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        });
    valid.then_some(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_case_insensitively() {
        let list = Allowlist::from_domains(["api.example.com", "IMAP.Mail.com."]);
        assert!(list.is_allowed("API.example.com"));
        assert!(list.is_allowed("imap.mail.com"));
        assert!(!list.is_allowed("evil.com"));
        assert!(!list.is_allowed("sub.api.example.com"));
    }

    #[test]
    fn invalid_entries_are_skipped() {
        let list = Allowlist::from_domains(["https://example.com", "", "ok.org"]);
        assert_eq!(list.domains(), vec!["ok.org".to_string()]);
    }

    #[test]
    fn add_and_remove() {
        let list = Allowlist::new();
        assert!(list.is_empty());
        assert!(list.add("caldav.example.net").unwrap());
        assert!(!list.add("CALDAV.example.net").unwrap());
        assert_eq!(list.len(), 1);
        assert!(list.add("not a host").is_err());
        assert!(list.remove("caldav.example.net"));
        assert!(!list.is_allowed("caldav.example.net"));
    }
}
