use serde::{Deserialize, Serialize};

/// A resolved file-path mapping: the current content hash for one
/// `(pubkey, path)` pair, stamped with the publish time that won it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathMapping {
    /// Lowercase hex pubkey of the publisher.
    pub pubkey: String,
    /// Absolute path, beginning with `/`.
    pub path: String,
    /// Lowercase 64-hex SHA-256 of the file contents.
    pub sha256: String,
    /// Publish time in seconds since the epoch; greater wins.
    pub created_at: u64,
}

/// Every value the cache can hold, tagged so that entries read back from a
/// text backend are self-describing. A value whose tag does not match its
/// namespace is corrupt and treated as absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CachedValue {
    /// `domains`: hostname -> publisher key (lowercase hex).
    Pubkey { hex: String },
    /// `relays`: read-capable relay URLs, in preference order.
    RelayList { relays: Vec<String> },
    /// `servers`: blob server URLs, position is priority.
    ServerList { servers: Vec<String> },
    /// `paths`: current mapping for one (pubkey, path).
    PathMapping(PathMapping),
    /// `blobs`: URLs known to have served a given hash.
    BlobUrls { urls: Vec<String> },
    /// `content`: raw file bytes, tagged to survive the text round-trip.
    Bytes { data: Vec<u8> },
    /// `negative`: the upstream authoritatively had no answer recently.
    Marker,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_round_trip() {
        let value = CachedValue::Bytes {
            data: vec![0, 1, 254, 255],
        };
        let text = serde_json::to_string(&value).unwrap();
        assert!(text.contains(r#""type":"bytes""#));
        assert_eq!(serde_json::from_str::<CachedValue>(&text).unwrap(), value);

        let value = CachedValue::PathMapping(PathMapping {
            pubkey: "ab".repeat(32),
            path: "/index.html".to_string(),
            sha256: "cd".repeat(32),
            created_at: 1,
        });
        let text = serde_json::to_string(&value).unwrap();
        assert_eq!(serde_json::from_str::<CachedValue>(&text).unwrap(), value);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(serde_json::from_str::<CachedValue>(r#"{"type":"mystery","data":1}"#).is_err());
    }
}
