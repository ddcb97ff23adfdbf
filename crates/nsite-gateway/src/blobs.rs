//! Blob retrieval: `(sha256, server list)` to bytes plus a trustworthy
//! content type, with per-server failover.

use crate::{mime_repair, App};
use bytes::Bytes;
use futures::TryStreamExt;
use sha2::{Digest, Sha256};
use site_cache::{CachedValue, Namespace};
use url::Url;

/// Digest verification threshold: hashing is a soft sanity check and only
/// runs when the configured body cap keeps it incidental.
const VERIFY_DIGEST_BELOW: u64 = 10 * 1024 * 1024;

pub struct Blob {
    pub sha256: String,
    pub bytes: Bytes,
    pub content_type: String,
}

impl App {
    /// Fetch the bytes for `sha256` from the first candidate server that
    /// has them. An empty server list or exhaustion of every candidate is
    /// an absent result; this never raises.
    #[tracing::instrument(level = "debug", skip_all, fields(sha256, servers = servers.len()))]
    pub async fn fetch_blob(&self, sha256: &str, servers: &[Url], path_hint: &str) -> Option<Blob> {
        if let Some(CachedValue::Bytes { data }) =
            self.cache.get_sticky(Namespace::Content, sha256).await
        {
            let content_type = mime_repair::content_type_for(path_hint, None, &data);
            return Some(Blob {
                sha256: sha256.to_string(),
                bytes: Bytes::from(data),
                content_type,
            });
        }
        if servers.is_empty() {
            return None;
        }

        for server in servers {
            metrics::counter!("blob_fetch_attempts").increment(1);
            let (bytes, declared) = match self.fetch_from_server(server, sha256).await {
                Ok(Some(hit)) => hit,
                Ok(None) => continue,
                Err(err) => {
                    tracing::debug!(%server, %err, "blob fetch failed, trying next server");
                    metrics::counter!("blob_fetch_failovers").increment(1);
                    continue;
                }
            };

            if self.config.max_file_size < VERIFY_DIGEST_BELOW {
                let digest = hex::encode(Sha256::digest(&bytes));
                if digest != sha256 {
                    tracing::warn!(%server, expected = sha256, got = %digest, "blob digest mismatch");
                }
            }

            let content_type = mime_repair::content_type_for(path_hint, declared.as_deref(), &bytes);
            self.cache
                .put(
                    Namespace::Content,
                    sha256,
                    &CachedValue::Bytes {
                        data: bytes.to_vec(),
                    },
                )
                .await;
            self.record_blob_url(sha256, server).await;
            return Some(Blob {
                sha256: sha256.to_string(),
                bytes,
                content_type,
            });
        }
        None
    }

    // 200 yields bytes; 404/413/429 and unexpected statuses yield Ok(None)
    // to advance the failover loop; transport errors and cap violations
    // surface as Err for the caller to log.
    async fn fetch_from_server(
        &self,
        server: &Url,
        sha256: &str,
    ) -> anyhow::Result<Option<(Bytes, Option<String>)>> {
        let url = format!("{}/{sha256}", server.as_str().trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .timeout(self.config.request_timeout)
            .send()
            .await?;

        match response.status() {
            reqwest::StatusCode::OK => {}
            reqwest::StatusCode::NOT_FOUND => return Ok(None),
            reqwest::StatusCode::PAYLOAD_TOO_LARGE => {
                tracing::debug!(url, "server refused the blob as too large");
                return Ok(None);
            }
            reqwest::StatusCode::TOO_MANY_REQUESTS => {
                tracing::debug!(url, "server rate-limited the fetch");
                metrics::counter!("blob_fetch_rate_limited").increment(1);
                return Ok(None);
            }
            status => {
                tracing::debug!(url, %status, "unexpected blob server status");
                return Ok(None);
            }
        }

        let cap = self.config.max_file_size;
        if let Some(length) = response.content_length() {
            if length > cap {
                anyhow::bail!("declared length {length} exceeds the {cap} byte cap");
            }
        }
        let declared = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        // Stream with a running cap: Content-Length is advisory at best.
        let mut stream = response.bytes_stream();
        let mut body = Vec::new();
        while let Some(chunk) = stream.try_next().await? {
            if body.len() as u64 + chunk.len() as u64 > cap {
                anyhow::bail!("body exceeds the {cap} byte cap");
            }
            body.extend_from_slice(&chunk);
        }
        Ok(Some((Bytes::from(body), declared)))
    }

    // Remember which server actually had the blob; future lookups can
    // prefer a known-good source.
    async fn record_blob_url(&self, sha256: &str, server: &Url) {
        let mut urls = match self.cache.get_sticky(Namespace::Blobs, sha256).await {
            Some(CachedValue::BlobUrls { urls }) => urls,
            _ => Vec::new(),
        };
        let url = server.to_string();
        if !urls.contains(&url) {
            urls.push(url);
            self.cache
                .put(Namespace::Blobs, sha256, &CachedValue::BlobUrls { urls })
                .await;
        }
    }
}
