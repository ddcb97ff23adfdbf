use crate::Event;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A subscription filter: the conjunction of its constraints, where each
/// list constraint matches any of its values.
///
/// Tag constraints are keyed by their wire form (`#d`, `#x`, ...) so the
/// struct serializes directly to the wire shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn author(mut self, pubkey_hex: impl Into<String>) -> Self {
        self.authors
            .get_or_insert_with(Vec::new)
            .push(pubkey_hex.into());
        self
    }

    pub fn kind(mut self, kind: u32) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn tag(mut self, name: &str, value: impl Into<String>) -> Self {
        self.tags
            .entry(format!("#{name}"))
            .or_default()
            .push(value.into());
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True when the filter can only ever name a single current event:
    /// one author, one replaceable or addressable kind, `limit = 1`.
    /// Queries for such filters may terminate early after the first result.
    pub fn is_unique_lookup(&self) -> bool {
        let single_author = self.authors.as_deref().map_or(false, |a| a.len() == 1);
        let kind = match self.kinds.as_deref() {
            Some([kind]) => *kind,
            _ => return false,
        };
        single_author && self.limit == Some(1) && is_replaceable(kind)
    }

    /// Whether `event` satisfies every constraint of this filter.
    pub fn matches(&self, event: &Event) -> bool {
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
            let Some(name) = key.strip_prefix('#') else {
                continue;
            };
            let hit = event
                .tags_named(name)
                .any(|tag| tag.get(1).map_or(false, |v| values.contains(v)));
            if !hit {
                return false;
            }
        }
        true
    }
}

// Replaceable (10000..20000) and addressable (30000..40000) kinds carry at
// most one current event per author, which is what makes `limit = 1`
// lookups against them unique.
fn is_replaceable(kind: u32) -> bool {
    (10000..20000).contains(&kind) || (30000..40000).contains(&kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_wire_shape() {
        let filter = Filter::new()
            .author("aa".repeat(32))
            .kind(34128)
            .tag("d", "/index.html")
            .limit(1);
        let value = serde_json::to_value(&filter).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "authors": ["aa".repeat(32)],
                "kinds": [34128],
                "limit": 1,
                "#d": ["/index.html"],
            })
        );
    }

    #[test]
    fn omits_empty_constraints() {
        let value = serde_json::to_value(Filter::new().kind(10002)).unwrap();
        assert_eq!(value, serde_json::json!({"kinds": [10002]}));
    }

    #[test]
    fn unique_lookup_detection() {
        let unique = Filter::new().author("aa").kind(34128).limit(1);
        assert!(unique.is_unique_lookup());
        let unique = Filter::new().author("aa").kind(10002).limit(1);
        assert!(unique.is_unique_lookup());

        // Not unique: two authors, no limit, or a regular kind.
        assert!(!Filter::new().author("aa").author("bb").kind(34128).limit(1).is_unique_lookup());
        assert!(!Filter::new().author("aa").kind(34128).is_unique_lookup());
        assert!(!Filter::new().author("aa").kind(1).limit(1).is_unique_lookup());
        assert!(!Filter::new().kind(34128).limit(1).is_unique_lookup());
    }

    #[test]
    fn matching() {
        let event = Event {
            id: String::new(),
            pubkey: "aa".repeat(32),
            created_at: 100,
            kind: 34128,
            tags: vec![vec!["d".to_string(), "/a".to_string()]],
            content: String::new(),
            sig: String::new(),
        };
        assert!(Filter::new().author("aa".repeat(32)).matches(&event));
        assert!(!Filter::new().author("bb".repeat(32)).matches(&event));
        assert!(Filter::new().kind(34128).tag("d", "/a").matches(&event));
        assert!(!Filter::new().tag("d", "/b").matches(&event));
        assert!(Filter::new().since(100).matches(&event));
        assert!(!Filter::new().since(101).matches(&event));
    }
}
