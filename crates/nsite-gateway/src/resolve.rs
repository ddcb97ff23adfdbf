//! The read path: host -> pubkey, (pubkey, path) -> content hash, and the
//! per-publisher relay and server list documents.
//!
//! Every operation here is cache-first with a relay fallback, and none of
//! them raise: an upstream failure is an absent answer, stamped with a
//! short-lived negative mark where that saves the next caller a query.

use crate::{App, MAPPING_KIND, RELAY_LIST_KIND, SERVER_LIST_KIND};
use relay_client::{newest, Event, Filter, Pubkey};
use site_cache::{CachedValue, Namespace, PathMapping};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

/// Budget for list lookups and the first, user-relay pass of a mapping
/// query. The widened second pass gets the full configured timeout.
const SHORT_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Conventional not-found fallback published alongside a site.
const NOT_FOUND_PATH: &str = "/404.html";

enum MappingQuery {
    Found(PathMapping),
    /// An event arrived but carried no usable content hash.
    Unusable,
    Empty,
}

impl App {
    fn short_timeout(&self) -> Duration {
        self.config.relay_query_timeout.min(SHORT_QUERY_TIMEOUT)
    }

    /// Resolve a request host into a publisher key via the `domains`
    /// cache. Returns None for the apex domain and for any label that is
    /// not an npub.
    pub async fn host_pubkey(&self, host: &str) -> Option<Pubkey> {
        if let Some(CachedValue::Pubkey { hex }) =
            self.cache.get_refreshing(Namespace::Domains, host).await
        {
            let pubkey = Pubkey::from_hex(&hex).ok()?;
            self.cache.touch_related(&hex, host).await;
            return Some(pubkey);
        }
        let label = host.strip_suffix(&format!(".{}", self.config.base_domain))?;
        let pubkey = Pubkey::from_npub(label).ok()?;
        self.cache
            .put(
                Namespace::Domains,
                host,
                &CachedValue::Pubkey {
                    hex: pubkey.to_hex(),
                },
            )
            .await;
        Some(pubkey)
    }

    /// Relays to read this publisher's events from: their published relay
    /// list if one exists, otherwise the configured defaults (which are
    /// then pinned for the publisher so the next lookup is a cache hit).
    #[tracing::instrument(level = "debug", skip(self), fields(pubkey = %pubkey))]
    pub async fn relay_list(&self, pubkey: &Pubkey) -> Vec<Url> {
        let key = pubkey.to_hex();
        if let Some(CachedValue::RelayList { relays }) =
            self.cache.get_refreshing(Namespace::Relays, &key).await
        {
            return to_urls(&relays);
        }

        let filter = Filter::new()
            .author(key.clone())
            .kind(RELAY_LIST_KIND)
            .limit(1);
        let events = self
            .pool
            .query(&self.config.default_relays, filter, self.short_timeout())
            .await;
        let relays = newest(&events).map(relay_urls_from_event).unwrap_or_default();

        if relays.is_empty() {
            let defaults: Vec<String> = self
                .config
                .default_relays
                .iter()
                .map(Url::to_string)
                .collect();
            self.cache
                .put(Namespace::Relays, &key, &CachedValue::RelayList { relays: defaults })
                .await;
            return self.config.default_relays.clone();
        }
        self.cache
            .put(
                Namespace::Relays,
                &key,
                &CachedValue::RelayList {
                    relays: relays.clone(),
                },
            )
            .await;
        to_urls(&relays)
    }

    /// Blob servers for this publisher, in priority order. Queried against
    /// the publisher's own relays; defaults are pinned when no usable list
    /// is published.
    #[tracing::instrument(level = "debug", skip(self), fields(pubkey = %pubkey))]
    pub async fn server_list(&self, pubkey: &Pubkey) -> Vec<Url> {
        let key = pubkey.to_hex();
        if let Some(CachedValue::ServerList { servers }) =
            self.cache.get_refreshing(Namespace::Servers, &key).await
        {
            return to_urls(&servers);
        }

        let mut relays = self.relay_list(pubkey).await;
        if relays.is_empty() {
            relays = self.config.default_relays.clone();
        }
        let filter = Filter::new()
            .author(key.clone())
            .kind(SERVER_LIST_KIND)
            .limit(1);
        let events = self.pool.query(&relays, filter, self.short_timeout()).await;
        let servers = newest(&events)
            .map(server_urls_from_event)
            .unwrap_or_default();

        if servers.is_empty() {
            let defaults: Vec<String> = self
                .config
                .default_servers
                .iter()
                .map(Url::to_string)
                .collect();
            self.cache
                .put(
                    Namespace::Servers,
                    &key,
                    &CachedValue::ServerList { servers: defaults },
                )
                .await;
            return self.config.default_servers.clone();
        }
        self.cache
            .put(
                Namespace::Servers,
                &key,
                &CachedValue::ServerList {
                    servers: servers.clone(),
                },
            )
            .await;
        to_urls(&servers)
    }

    /// Resolve the current content hash for `(pubkey, path)`. The path
    /// must already be normalized. Falls back to the conventional
    /// `/404.html` mapping once before answering absent.
    #[tracing::instrument(level = "debug", skip(self), fields(pubkey = %pubkey))]
    pub async fn resolve_path(&self, pubkey: &Pubkey, path: &str) -> Option<PathMapping> {
        let hex = pubkey.to_hex();
        let mut path = path.to_string();

        // Bounded fallback: the requested path, then /404.html, no deeper.
        for _attempt in 0..2 {
            let key = mapping_key(&hex, &path);
            if let Some(CachedValue::PathMapping(mapping)) =
                self.cache.get_refreshing(Namespace::Paths, &key).await
            {
                return Some(mapping);
            }
            if self.cache.get_sticky(Namespace::Negative, &key).await.is_none() {
                match self.query_mapping(pubkey, &hex, &path).await {
                    MappingQuery::Found(mapping) => {
                        self.cache
                            .put(
                                Namespace::Paths,
                                &key,
                                &CachedValue::PathMapping(mapping.clone()),
                            )
                            .await;
                        return Some(mapping);
                    }
                    MappingQuery::Unusable => {
                        self.cache
                            .put(Namespace::Negative, &key, &CachedValue::Marker)
                            .await;
                        return None;
                    }
                    MappingQuery::Empty => {
                        self.cache
                            .put(Namespace::Negative, &key, &CachedValue::Marker)
                            .await;
                    }
                }
            }
            if path == NOT_FOUND_PATH {
                break;
            }
            path = NOT_FOUND_PATH.to_string();
        }
        None
    }

    async fn query_mapping(&self, pubkey: &Pubkey, hex: &str, path: &str) -> MappingQuery {
        let filter = Filter::new()
            .author(hex.to_string())
            .kind(MAPPING_KIND)
            .tag("d", path)
            .limit(1);

        let user_relays = self.relay_list(pubkey).await;
        let mut events = self
            .pool
            .query(&user_relays, filter.clone(), self.short_timeout())
            .await;
        if events.is_empty() {
            // Widen to the union of user and default relays with the full
            // query budget before concluding the mapping does not exist.
            let mut union = user_relays;
            union.extend(self.config.default_relays.iter().cloned());
            events = self
                .pool
                .query(&union, filter, self.config.relay_query_timeout)
                .await;
        }

        let Some(event) = newest(&events) else {
            return MappingQuery::Empty;
        };
        match event.tag_value("x") {
            Some(hash) if is_sha256_hex(hash) => MappingQuery::Found(PathMapping {
                pubkey: hex.to_string(),
                path: path.to_string(),
                sha256: hash.to_ascii_lowercase(),
                created_at: event.created_at,
            }),
            _ => {
                tracing::debug!(path, "mapping event carries no usable content hash");
                MappingQuery::Unusable
            }
        }
    }
}

/// Cache key for one path mapping; the path always begins with `/`, which
/// keeps the concatenation unambiguous.
pub(crate) fn mapping_key(pubkey_hex: &str, path: &str) -> String {
    format!("{pubkey_hex}{path}")
}

pub(crate) fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Map an incoming HTTP path onto the canonical file path: a trailing
/// slash means the directory index, and an extension-less final segment is
/// treated as a directory.
pub fn normalize_path(path: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    if path.ends_with('/') {
        return format!("{path}index.html");
    }
    let last = path.rsplit('/').next().unwrap_or_default();
    if last.contains('.') {
        path
    } else {
        format!("{path}/index.html")
    }
}

/// Extract read-capable relay URLs from `["r", url, marker?]` tags: an
/// entry counts when its marker is absent or `"read"`. Order is preserved
/// and duplicates dropped.
pub(crate) fn relay_urls_from_event(event: &Event) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for tag in event.tags_named("r") {
        let Some(raw) = tag.get(1) else { continue };
        match tag.get(2).map(String::as_str) {
            None | Some("read") => {}
            Some(_) => continue,
        }
        let Ok(url) = Url::parse(raw) else { continue };
        if !matches!(url.scheme(), "ws" | "wss") {
            continue;
        }
        let canonical = url.to_string();
        if seen.insert(canonical.clone()) {
            urls.push(canonical);
        }
    }
    urls
}

/// Extract blob server URLs from `["server", url]` tags, order-preserving.
pub(crate) fn server_urls_from_event(event: &Event) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for tag in event.tags_named("server") {
        let Some(raw) = tag.get(1) else { continue };
        let Ok(url) = Url::parse(raw) else { continue };
        if !matches!(url.scheme(), "http" | "https") {
            continue;
        }
        let canonical = url.to_string();
        if seen.insert(canonical.clone()) {
            urls.push(canonical);
        }
    }
    urls
}

fn to_urls(raw: &[String]) -> Vec<Url> {
    raw.iter().filter_map(|s| Url::parse(s).ok()).collect()
}
