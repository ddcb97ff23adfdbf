//! Content-type determination for served blobs.
//!
//! Blob servers frequently mislabel what they store (everything as
//! `application/octet-stream`, CSS as `application/json`, and so on),
//! which breaks browsers that refuse to apply a stylesheet or execute a
//! script served under the wrong type. For a fixed set of critical
//! extensions the declared type is replaced with the canonical one, but
//! only when the file contents corroborate the extension.

/// Decide the content type for a blob served under `path`.
///
/// `declared` is what the blob server sent, if anything; `body` is the
/// payload. Non-critical extensions always keep the declared type.
pub fn content_type_for(path: &str, declared: Option<&str>, body: &[u8]) -> String {
    let ext = extension(path);
    let canonical = ext.as_deref().and_then(canonical_type);
    let (Some(ext), Some(canonical)) = (ext, canonical) else {
        return declared
            .map(str::to_string)
            .or_else(|| sniff_signature(body).map(str::to_string))
            .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());
    };
    let Some(declared) = declared else {
        return canonical.to_string();
    };

    let essence = declared
        .parse::<mime::Mime>()
        .map(|m| m.essence_str().to_ascii_lowercase())
        .unwrap_or_else(|_| declared.trim().to_ascii_lowercase());
    let suspicious =
        is_known_bad(&essence, &ext) || !allowed_types(&ext).contains(&essence.as_str());
    if suspicious && corroborates(&ext, body) {
        tracing::debug!(path, declared, corrected = canonical, "repaired content type");
        metrics::counter!("content_type_repairs").increment(1);
        return canonical.to_string();
    }
    declared.to_string()
}

/// Lowercased extension of the final path segment.
fn extension(path: &str) -> Option<String> {
    let name = path.rsplit('/').next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        None
    } else {
        Some(ext.to_ascii_lowercase())
    }
}

fn canonical_type(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "eot" => "application/vnd.ms-fontobject",
        _ => return None,
    })
}

fn allowed_types(ext: &str) -> &'static [&'static str] {
    match ext {
        "html" | "htm" => &["text/html", "application/xhtml+xml"],
        "css" => &["text/css"],
        "js" | "mjs" => &["application/javascript", "text/javascript"],
        "json" => &["application/json"],
        "xml" => &["application/xml", "text/xml"],
        "svg" => &["image/svg+xml"],
        "png" => &["image/png"],
        "jpg" | "jpeg" => &["image/jpeg"],
        "gif" => &["image/gif"],
        "ico" => &["image/x-icon", "image/vnd.microsoft.icon"],
        "woff" => &["font/woff", "application/font-woff"],
        "woff2" => &["font/woff2"],
        "ttf" => &["font/ttf", "application/font-sfnt"],
        "eot" => &["application/vnd.ms-fontobject"],
        _ => &[],
    }
}

// Types that servers hand out wholesale and that are near-certainly wrong
// for a critical extension.
fn is_known_bad(essence: &str, ext: &str) -> bool {
    match essence {
        "application/json" => ext != "json",
        "text/plain" | "application/octet-stream" | "binary/octet-stream" => true,
        "text/html" => !matches!(ext, "html" | "htm"),
        _ => false,
    }
}

/// Does the payload plausibly match the extension? Text formats get a
/// keyword scan over the head of the file, binary formats a magic-number
/// check.
fn corroborates(ext: &str, body: &[u8]) -> bool {
    match ext {
        "html" | "htm" => {
            let text = text_window(body);
            ["<!doctype", "<html", "<head", "<body"]
                .iter()
                .any(|token| text.contains(token))
        }
        "css" => {
            let text = text_window(body);
            !text.trim_start().starts_with('<') && text.contains('{') && text.contains('}')
        }
        "js" | "mjs" => {
            let text = text_window(body);
            [
                "function", "const ", "let ", "var ", "=>", "import ", "export ", "document.",
                "window.",
            ]
            .iter()
            .any(|token| text.contains(token))
        }
        "json" => serde_json::from_slice::<serde::de::IgnoredAny>(body).is_ok(),
        "xml" => text_window(body).trim_start().starts_with('<'),
        "svg" => {
            let text = text_window(body);
            text.contains("<svg") || text.trim_start().starts_with("<?xml")
        }
        "png" => body.starts_with(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]),
        "jpg" | "jpeg" => body.starts_with(&[0xff, 0xd8, 0xff]),
        "gif" => body.starts_with(b"GIF87a") || body.starts_with(b"GIF89a"),
        "ico" => body.starts_with(&[0x00, 0x00, 0x01, 0x00]),
        "woff" => body.starts_with(b"wOFF"),
        "woff2" => body.starts_with(b"wOF2"),
        "ttf" => {
            body.starts_with(&[0x00, 0x01, 0x00, 0x00])
                || body.starts_with(b"true")
                || body.starts_with(b"OTTO")
        }
        "eot" => body.len() > 36 && &body[34..36] == b"LP",
        _ => false,
    }
}

/// Best-effort type from the payload alone, for cached bytes served under
/// a path with no recognized extension.
fn sniff_signature(body: &[u8]) -> Option<&'static str> {
    if body.starts_with(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]) {
        return Some("image/png");
    }
    if body.starts_with(&[0xff, 0xd8, 0xff]) {
        return Some("image/jpeg");
    }
    if body.starts_with(b"GIF87a") || body.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    let text = text_window(body);
    if text.contains("<!doctype") || text.contains("<html") {
        return Some("text/html");
    }
    None
}

fn text_window(body: &[u8]) -> String {
    String::from_utf8_lossy(&body[..body.len().min(512)]).to_ascii_lowercase()
}
