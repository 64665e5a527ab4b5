//! Immutable blocklist snapshot
//!
//! Built once per successful fetch. The domain map is derived from the entry
//! list at construction and never touched again, so readers holding an
//! `Arc<BlocklistSnapshot>` always see a consistent pair.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use super::parser::ParsedBlocklist;
use crate::types::{normalize_domain, BlocklistEntry, Employer};

#[derive(Debug, Clone)]
pub struct BlocklistSnapshot {
    pub version: Option<String>,
    pub entries: Vec<Arc<BlocklistEntry>>,
    pub employers: Vec<Employer>,
    pub generated_at: DateTime<Utc>,
    domains: HashMap<String, Arc<BlocklistEntry>>,
}

impl BlocklistSnapshot {
    /// Build a snapshot and its domain map
    ///
    /// When several entries share a domain the later one wins.
    pub fn new(
        version: Option<String>,
        entries: Vec<BlocklistEntry>,
        employers: Vec<Employer>,
    ) -> Self {
        let entries: Vec<Arc<BlocklistEntry>> = entries.into_iter().map(Arc::new).collect();

        let mut domains = HashMap::with_capacity(entries.len());
        for entry in &entries {
            let key = normalize_domain(&entry.domain);
            if key.is_empty() {
                continue;
            }
            domains.insert(key, Arc::clone(entry));
        }

        Self {
            version,
            entries,
            employers,
            generated_at: Utc::now(),
            domains,
        }
    }

    /// Build a snapshot from plain entries, deriving the employer list
    pub fn from_entries(entries: Vec<BlocklistEntry>) -> Self {
        let employers = super::parser::employers_from_entries(&entries);
        Self::new(None, entries, employers)
    }

    /// Find the entry covering `domain` or one of its parents
    ///
    /// `www.sub.example.com` tries `www.sub.example.com`, `sub.example.com`,
    /// then `example.com`. A single-label remainder is never tried.
    pub fn lookup(&self, domain: &str) -> Option<Arc<BlocklistEntry>> {
        let domain = normalize_domain(domain);
        if domain.is_empty() {
            return None;
        }

        let labels: Vec<&str> = domain.split('.').collect();
        if labels.len() < 2 {
            return None;
        }

        if let Some(entry) = self.domains.get(&domain) {
            return Some(Arc::clone(entry));
        }

        for i in 1..labels.len() - 1 {
            let parent = labels[i..].join(".");
            if let Some(entry) = self.domains.get(&parent) {
                return Some(Arc::clone(entry));
            }
        }

        None
    }

    /// Number of distinct blocked domains
    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

impl From<ParsedBlocklist> for BlocklistSnapshot {
    fn from(parsed: ParsedBlocklist) -> Self {
        Self::new(parsed.version, parsed.entries, parsed.employers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(domain: &str, employer: &str) -> BlocklistEntry {
        BlocklistEntry {
            url: format!("https://{}", domain),
            domain: domain.to_string(),
            employer: employer.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_exact_and_parent_lookup() {
        let snapshot = BlocklistSnapshot::from_entries(vec![entry("example.com", "Test Corp")]);

        assert!(snapshot.lookup("example.com").is_some());
        assert!(snapshot.lookup("www.example.com").is_some());
        assert!(snapshot.lookup("sub.www.example.com").is_some());
        assert!(snapshot.lookup("WWW.Example.COM.").is_some());

        assert!(snapshot.lookup("notexample.com").is_none());
        assert!(snapshot.lookup("example.org").is_none());
        assert!(snapshot.lookup("").is_none());
    }

    #[test]
    fn test_single_label_never_matches() {
        let snapshot = BlocklistSnapshot::from_entries(vec![entry("com", "Registry")]);

        assert!(snapshot.lookup("com").is_none());
        assert!(snapshot.lookup("example.com").is_none());
        assert!(snapshot.lookup("www.example.com").is_none());
    }

    #[test]
    fn test_most_specific_match_wins() {
        let snapshot = BlocklistSnapshot::from_entries(vec![
            entry("example.com", "Parent Corp"),
            entry("shop.example.com", "Shop Corp"),
        ]);

        assert_eq!(snapshot.lookup("www.shop.example.com").unwrap().employer, "Shop Corp");
        assert_eq!(snapshot.lookup("www.example.com").unwrap().employer, "Parent Corp");
    }

    #[test]
    fn test_duplicate_domain_last_wins() {
        let snapshot = BlocklistSnapshot::from_entries(vec![
            entry("example.com", "First Corp"),
            entry("example.com", "Second Corp"),
        ]);

        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.domain_count(), 1);
        assert_eq!(snapshot.lookup("example.com").unwrap().employer, "Second Corp");
    }

    #[test]
    fn test_employers_derived() {
        let snapshot = BlocklistSnapshot::from_entries(vec![
            entry("a.example", "Corp A"),
            entry("b.example", "Corp A"),
            entry("c.example", "Corp B"),
        ]);

        assert_eq!(snapshot.employers.len(), 2);
        assert_eq!(snapshot.employers[0].name, "Corp A");
        assert_eq!(snapshot.employers[0].url_count, 2);
    }
}
