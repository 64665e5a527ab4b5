//! Blocklist document parsing
//!
//! Two document shapes have been published by the upstream:
//!
//! - **Employer map** (current): an object keyed by employer name, each value
//!   carrying `matchingUrlRegexes`, `moreInfoUrl`, `startTime` and `actionDetails`.
//!   Keys starting with `_` hold internal metadata and are skipped.
//! - **Flat list** (legacy): an array of entries with explicit fields, either at
//!   the top level or under a `blockList` key next to `version` and `employers`.
//!
//! Both are normalized into [`BlocklistEntry`] values. Entries that do not match
//! the expected shape, or whose URL yields no hostname, are dropped silently.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

use super::BlocklistError;
use crate::types::{ActionDetails, BlocklistEntry, Employer};

/// Top-level shape of a blocklist document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentShape {
    EmployerMap,
    FlatList,
}

impl DocumentShape {
    /// Detect the shape from the top-level JSON value
    pub fn detect(value: &Value) -> Option<Self> {
        match value {
            Value::Array(_) => Some(Self::FlatList),
            Value::Object(map) if map.get("blockList").is_some_and(Value::is_array) => {
                Some(Self::FlatList)
            }
            Value::Object(_) => Some(Self::EmployerMap),
            _ => None,
        }
    }
}

/// Result of parsing one document
#[derive(Debug, Clone, Default)]
pub struct ParsedBlocklist {
    pub version: Option<String>,
    pub entries: Vec<BlocklistEntry>,
    pub employers: Vec<Employer>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct EmployerMapEntry {
    more_info_url: String,
    matching_url_regexes: Vec<String>,
    start_time: String,
    action_details: ActionDetails,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FlatEntry {
    url: String,
    employer: String,
    employer_id: String,
    label: String,
    category: String,
    reason: String,
    start_date: String,
    more_info_url: String,
    location: String,
    action_details: ActionDetails,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FlatDocument {
    version: Option<String>,
    employers: Vec<Employer>,
    block_list: Vec<Value>,
}

/// Parse a raw response body
pub fn parse_document(body: &[u8]) -> Result<ParsedBlocklist, BlocklistError> {
    let value: Value = serde_json::from_slice(body)?;

    match DocumentShape::detect(&value).ok_or(BlocklistError::UnsupportedShape)? {
        DocumentShape::EmployerMap => Ok(parse_employer_map(value)),
        DocumentShape::FlatList => parse_flat_list(value),
    }
}

fn parse_employer_map(value: Value) -> ParsedBlocklist {
    let Value::Object(map) = value else {
        return ParsedBlocklist::default();
    };

    let mut parsed = ParsedBlocklist::default();

    for (employer_name, raw) in map {
        if employer_name.starts_with('_') {
            continue;
        }

        let Ok(entry) = serde_json::from_value::<EmployerMapEntry>(raw) else {
            continue;
        };

        parsed.employers.push(Employer {
            id: entry.action_details.id.clone(),
            name: employer_name.clone(),
            url_count: entry.matching_url_regexes.len(),
        });

        let start_date = if entry.action_details.start_date.is_empty() {
            entry.start_time.clone()
        } else {
            entry.action_details.start_date.clone()
        };

        for pattern in &entry.matching_url_regexes {
            let Some(domain) = extract_domain(pattern) else {
                continue;
            };

            parsed.entries.push(BlocklistEntry {
                url: pattern.clone(),
                domain,
                employer: employer_name.clone(),
                employer_id: entry.action_details.id.clone(),
                label: String::new(),
                category: String::new(),
                reason: entry.action_details.action_type.clone(),
                start_date: start_date.clone(),
                more_info_url: entry.more_info_url.clone(),
                location: entry.action_details.location.clone(),
                action_details: entry.action_details.clone(),
            });
        }
    }

    parsed
}

fn parse_flat_list(value: Value) -> Result<ParsedBlocklist, BlocklistError> {
    let document = match value {
        Value::Array(items) => FlatDocument {
            block_list: items,
            ..Default::default()
        },
        other => serde_json::from_value(other)?,
    };

    let mut entries = Vec::with_capacity(document.block_list.len());
    for raw in document.block_list {
        let Ok(item) = serde_json::from_value::<FlatEntry>(raw) else {
            continue;
        };
        let Some(domain) = extract_domain(&item.url) else {
            continue;
        };

        let location = if item.location.is_empty() {
            item.action_details.location.clone()
        } else {
            item.location
        };

        entries.push(BlocklistEntry {
            url: item.url,
            domain,
            employer: item.employer,
            employer_id: item.employer_id,
            label: item.label,
            category: item.category,
            reason: item.reason,
            start_date: item.start_date,
            more_info_url: item.more_info_url,
            location,
            action_details: item.action_details,
        });
    }

    let employers = if document.employers.is_empty() {
        employers_from_entries(&entries)
    } else {
        document.employers
    };

    Ok(ParsedBlocklist {
        version: document.version,
        entries,
        employers,
    })
}

/// Group entries by employer name
pub fn employers_from_entries(entries: &[BlocklistEntry]) -> Vec<Employer> {
    let mut by_name: BTreeMap<&str, Employer> = BTreeMap::new();

    for entry in entries {
        let employer = by_name.entry(&entry.employer).or_insert_with(|| Employer {
            id: entry.employer_id.clone(),
            name: entry.employer.clone(),
            url_count: 0,
        });
        employer.url_count += 1;
    }

    by_name.into_values().collect()
}

/// Extract the lowercased hostname from a published URL pattern
///
/// Patterns may lack a scheme, carry regex-escaped dots or a leading `*.`.
pub fn extract_domain(pattern: &str) -> Option<String> {
    let pattern = pattern.trim().replace("\\.", ".");
    if pattern.is_empty() {
        return None;
    }

    let candidate = if pattern.contains("://") {
        pattern.clone()
    } else {
        format!("https://{}", pattern)
    };

    let host = match Url::parse(&candidate) {
        Ok(url) => url.host_str().map(str::to_string)?,
        Err(_) => pattern.split('/').next()?.to_string(),
    };

    let host = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_start_matches("*.")
        .trim_end_matches('.')
        .to_lowercase();

    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPLOYER_MAP: &str = r#"{
        "_optimizedPatterns": {"ignored": true},
        "Test Corp": {
            "moreInfoUrl": "https://union.example.org/test-corp",
            "matchingUrlRegexes": ["example.com", "https://shop.example.net/path"],
            "startTime": "2024-01-01T00:00:00Z",
            "actionDetails": {
                "id": "action-1",
                "organization": "Test Union",
                "actionType": "strike",
                "status": "active",
                "startDate": "2024-01-02",
                "description": "Workers on strike",
                "demands": "Fair wages",
                "location": "Test City"
            }
        },
        "Broken Corp": "not an object"
    }"#;

    #[test]
    fn test_detect_shape() {
        let array: Value = serde_json::from_str("[]").unwrap();
        assert_eq!(DocumentShape::detect(&array), Some(DocumentShape::FlatList));

        let wrapped: Value = serde_json::from_str(r#"{"blockList": []}"#).unwrap();
        assert_eq!(DocumentShape::detect(&wrapped), Some(DocumentShape::FlatList));

        let map: Value = serde_json::from_str(r#"{"Corp": {}}"#).unwrap();
        assert_eq!(DocumentShape::detect(&map), Some(DocumentShape::EmployerMap));

        let scalar: Value = serde_json::from_str("42").unwrap();
        assert_eq!(DocumentShape::detect(&scalar), None);
    }

    #[test]
    fn test_parse_employer_map() {
        let parsed = parse_document(EMPLOYER_MAP.as_bytes()).unwrap();

        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.employers.len(), 1);
        assert_eq!(parsed.employers[0].name, "Test Corp");
        assert_eq!(parsed.employers[0].id, "action-1");
        assert_eq!(parsed.employers[0].url_count, 2);

        let first = &parsed.entries[0];
        assert_eq!(first.domain, "example.com");
        assert_eq!(first.employer, "Test Corp");
        assert_eq!(first.employer_id, "action-1");
        assert_eq!(first.reason, "strike");
        assert_eq!(first.start_date, "2024-01-02");
        assert_eq!(first.location, "Test City");
        assert_eq!(first.action_details.demands, "Fair wages");

        assert_eq!(parsed.entries[1].domain, "shop.example.net");
    }

    #[test]
    fn test_employer_map_falls_back_to_start_time() {
        let body = r#"{"Corp": {"matchingUrlRegexes": ["corp.example"], "startTime": "2024-03-01"}}"#;
        let parsed = parse_document(body.as_bytes()).unwrap();
        assert_eq!(parsed.entries[0].start_date, "2024-03-01");
    }

    #[test]
    fn test_parse_flat_list() {
        let body = r#"[
            {"url": "https://example.com", "employer": "Test Corp", "employerId": "emp-1",
             "actionDetails": {"actionType": "strike", "description": "Workers on strike",
                               "demands": ["Fair wages", "Safe staffing"], "location": "Docks"}},
            {"url": "https://test.example.com", "employer": "Test Corp", "employerId": "emp-1"},
            {"url": "", "employer": "Nobody"},
            "garbage"
        ]"#;

        let parsed = parse_document(body.as_bytes()).unwrap();
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[0].location, "Docks");
        assert_eq!(parsed.entries[0].action_details.demands, "Fair wages\nSafe staffing");
        assert_eq!(parsed.employers.len(), 1);
        assert_eq!(parsed.employers[0].url_count, 2);
    }

    #[test]
    fn test_parse_wrapped_flat_list() {
        let body = r#"{
            "version": "1.0",
            "employers": [{"id": "emp-1", "name": "Test Corp", "urlCount": 1}],
            "blockList": [{"url": "example.com", "employer": "Test Corp"}]
        }"#;

        let parsed = parse_document(body.as_bytes()).unwrap();
        assert_eq!(parsed.version.as_deref(), Some("1.0"));
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.employers[0].id, "emp-1");
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        assert!(matches!(
            parse_document(b"{not json"),
            Err(BlocklistError::Parse(_))
        ));
        assert!(matches!(
            parse_document(b"\"just a string\""),
            Err(BlocklistError::UnsupportedShape)
        ));
    }

    #[test]
    fn test_extract_domain() {
        let cases = [
            ("https://example.com", Some("example.com")),
            ("https://example.com/path?q=1", Some("example.com")),
            ("example.com", Some("example.com")),
            ("example.com/some/path", Some("example.com")),
            ("http://Sub.Example.COM:8080/x", Some("sub.example.com")),
            ("example\\.com", Some("example.com")),
            ("*.example.com", Some("example.com")),
            ("", None),
            ("   ", None),
        ];

        for (input, expected) in cases {
            assert_eq!(extract_domain(input).as_deref(), expected, "input {:?}", input);
        }
    }
}
