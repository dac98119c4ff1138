//! Subscription filters (NIP-01).
//!
//! One descriptor serves three callers: client REQ subscriptions, the
//! in-process pub/sub bus, and storage queries. A filter with an empty
//! required set (e.g. `kinds: []`) can never match anything and is dropped
//! during normalization.

use crate::event::Event;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Query descriptor over events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Event ids (exact, lowercase hex).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Author pubkeys (exact, lowercase hex).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Events created at or after this timestamp (inclusive).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Events created at or before this timestamp (inclusive).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of stored events to return.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Full-text search query (NIP-50); see [`SearchQuery`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,

    /// Tag queries; keys carry the `#` prefix (`"#e"`, `"#p"`, …).
    #[serde(flatten)]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn search(mut self, query: impl Into<String>) -> Self {
        self.search = Some(query.into());
        self
    }

    pub fn tag(mut self, name: &str, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let key = if name.starts_with('#') {
            name.to_string()
        } else {
            format!("#{name}")
        };
        self.tags
            .insert(key, values.into_iter().map(Into::into).collect());
        self
    }

    /// True when some present required set is empty, so no event can ever
    /// match. The effective limit of such a filter is zero.
    pub fn never_matches(&self) -> bool {
        self.ids.as_deref().is_some_and(<[String]>::is_empty)
            || self.authors.as_deref().is_some_and(<[String]>::is_empty)
            || self.kinds.as_deref().is_some_and(<[u16]>::is_empty)
            || self
                .tags
                .iter()
                .any(|(k, v)| k.starts_with('#') && v.is_empty())
    }

    /// Check whether an event satisfies every present constraint.
    ///
    /// `since`/`until` are inclusive on both ends.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| *id == event.id) {
                return false;
            }
        }

        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| *a == event.pubkey) {
                return false;
            }
        }

        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }

        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }

        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }

        for (key, values) in &self.tags {
            let Some(tag_name) = key.strip_prefix('#') else {
                continue;
            };
            let hit = event
                .tags
                .iter()
                .any(|t| t.len() >= 2 && t[0] == tag_name && values.iter().any(|v| *v == t[1]));
            if !hit {
                return false;
            }
        }

        if let Some(search) = &self.search {
            if !SearchQuery::parse(search).matches(event) {
                return false;
            }
        }

        true
    }

    /// Normalize a filter list before it reaches storage: drop filters that
    /// can never match, clamp limits to the per-query maximum.
    pub fn normalize(filters: Vec<Filter>, max_limit: u64) -> Vec<Filter> {
        filters
            .into_iter()
            .filter(|f| !f.never_matches())
            .map(|mut f| {
                f.limit = Some(f.limit.unwrap_or(max_limit).min(max_limit));
                f
            })
            .collect()
    }
}

/// Parsed form of a `search` string.
///
/// Whitespace-separated tokens; a `domain:<host>` token matches events that
/// carry a `["domain", <host>]` tag (recorded at ingestion for events
/// attributed to a remote instance), every other token must appear
/// case-insensitively in the content.
#[derive(Debug, Default)]
pub struct SearchQuery {
    pub text: Vec<String>,
    pub domain: Option<String>,
}

impl SearchQuery {
    pub fn parse(input: &str) -> Self {
        let mut query = SearchQuery::default();
        for token in input.split_whitespace() {
            if let Some(host) = token.strip_prefix("domain:") {
                query.domain = Some(host.to_ascii_lowercase());
            } else {
                query.text.push(token.to_ascii_lowercase());
            }
        }
        query
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(domain) = &self.domain {
            let tagged = event
                .tag_values("domain")
                .any(|d| d.eq_ignore_ascii_case(domain));
            if !tagged {
                return false;
            }
        }
        if self.text.is_empty() {
            return true;
        }
        let content = event.content.to_ascii_lowercase();
        self.text.iter().all(|t| content.contains(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_event(id: &str, pubkey: &str, kind: u16, created_at: u64) -> Event {
        Event {
            id: id.to_string(),
            pubkey: pubkey.to_string(),
            created_at,
            kind,
            tags: vec![],
            content: "test".to_string(),
            sig: "sig".to_string(),
        }
    }

    #[test]
    fn empty_filter_matches_all() {
        assert!(Filter::new().matches(&make_event("abc", "xyz", 1, 1000)));
    }

    #[test]
    fn filter_kinds() {
        let filter = Filter::new().kinds([1, 7]);
        assert!(filter.matches(&make_event("id", "pk", 1, 1000)));
        assert!(filter.matches(&make_event("id", "pk", 7, 1000)));
        assert!(!filter.matches(&make_event("id", "pk", 2, 1000)));
    }

    #[test]
    fn filter_since_until_inclusive() {
        let filter = Filter::new().since(1000).until(2000);
        assert!(!filter.matches(&make_event("id", "pk", 1, 999)));
        assert!(filter.matches(&make_event("id", "pk", 1, 1000)));
        assert!(filter.matches(&make_event("id", "pk", 1, 2000)));
        assert!(!filter.matches(&make_event("id", "pk", 1, 2001)));
    }

    #[test]
    fn filter_tags() {
        let filter = Filter::new().tag("e", ["event123"]);
        let mut with_tag = make_event("id", "pk", 1, 1000);
        with_tag.tags = vec![vec!["e".into(), "event123".into()]];
        let without_tag = make_event("id", "pk", 1, 1000);
        assert!(filter.matches(&with_tag));
        assert!(!filter.matches(&without_tag));
    }

    #[test]
    fn filter_search_tokens() {
        let mut event = make_event("id", "pk", 1, 1000);
        event.content = "Rust relays are Fast".into();
        assert!(Filter::new().search("rust fast").matches(&event));
        assert!(!Filter::new().search("python").matches(&event));

        event.tags = vec![vec!["domain".into(), "gleasonator.dev".into()]];
        assert!(
            Filter::new()
                .search("domain:gleasonator.dev rust")
                .matches(&event)
        );
        assert!(!Filter::new().search("domain:example.com").matches(&event));
    }

    #[test]
    fn never_matches_on_empty_required_sets() {
        assert!(Filter::new().kinds([]).never_matches());
        assert!(Filter::new().authors(Vec::<String>::new()).never_matches());
        assert!(Filter::new().tag("e", Vec::<String>::new()).never_matches());
        assert!(!Filter::new().kinds([1]).never_matches());
        assert!(!Filter::new().never_matches());
    }

    #[test]
    fn normalize_drops_impossible_and_clamps_limits() {
        let filters = vec![
            Filter::new().kinds([]),
            Filter::new().kinds([1]).limit(10_000),
            Filter::new().kinds([7]),
        ];
        let normalized = Filter::normalize(filters, 500);
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].limit, Some(500));
        assert_eq!(normalized[1].limit, Some(500));
    }

    #[test]
    fn filter_serialization_keeps_tag_prefix() {
        let filter = Filter::new().kinds([1, 7]).limit(10).tag("p", ["pubkey1"]);
        let json = serde_json::to_string(&filter).unwrap();
        assert!(json.contains("\"kinds\":[1,7]"));
        assert!(json.contains("\"#p\":[\"pubkey1\"]"));
    }
}
