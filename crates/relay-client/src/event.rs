use serde::{Deserialize, Serialize};

/// A signed event received from a relay.
///
/// Events are consumed as-is: relays are trusted to serve well-formed events
/// from the requested author, so `sig` is carried but not verified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `name`, if any.
    pub fn tag_value<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.tags_named(name)
            .next()
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// All tags whose first element equals `name`, in event order.
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [String]> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .map(Vec::as_slice)
    }
}

/// Pick the newest event by `created_at`. Query results are unordered by
/// contract, so callers select the winner themselves.
pub fn newest(events: &[Event]) -> Option<&Event> {
    events.iter().max_by_key(|event| event.created_at)
}
