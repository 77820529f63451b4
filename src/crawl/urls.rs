//! URL normalization and link filtering.
//!
//! Every URL entering the frontier goes through [`normalize`] so the
//! uniqueness constraint on the `url` table deduplicates spelling variants
//! of the same resource.

use std::sync::OnceLock;

use anyhow::{anyhow, Result};
use regex::Regex;
use url::Url;

fn wikipedia_host_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z]{2}\.wikipedia\.org$").expect("host regex is valid"))
}

/// RFC 3986 normalization: lowercase scheme and host, default-port removal,
/// dot-segment removal and default path `/` (all via the `url` crate), plus
/// percent-encoding canonicalization of the path (decode unreserved bytes,
/// uppercase the remaining escapes).
pub fn normalize(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw.trim()).map_err(|e| anyhow!("invalid URL {:?}: {}", raw, e))?;
    if !url.has_host() {
        return Err(anyhow!("URL without host: {:?}", raw));
    }
    let path = url.path().to_string();
    let canonical = canonicalize_percent(&path);
    if canonical != path {
        url.set_path(&canonical);
    }
    Ok(url.to_string())
}

/// Decode percent-escapes of unreserved bytes and uppercase the hex of the
/// escapes that must stay. Escapes of reserved bytes (`%2F` etc.) are never
/// decoded — that would change the path structure.
///
/// `Url::path()` is always ASCII (non-ASCII is serialized percent-encoded),
/// so a byte walk is safe here.
fn canonicalize_percent(path: &str) -> String {
    fn hex_val(b: u8) -> Option<u8> {
        (b as char).to_digit(16).map(|d| d as u8)
    }
    const UPPER_HEX: &[u8; 16] = b"0123456789ABCDEF";

    let bytes = path.as_bytes();
    let mut out = String::with_capacity(path.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                let decoded = hi * 16 + lo;
                if decoded.is_ascii_alphanumeric() || matches!(decoded, b'-' | b'.' | b'_' | b'~')
                {
                    out.push(decoded as char);
                } else {
                    out.push('%');
                    out.push(UPPER_HEX[hi as usize] as char);
                    out.push(UPPER_HEX[lo as usize] as char);
                }
                i += 3;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// `scheme://host[:port]` of a URL — the unit of politeness.
pub fn origin(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    match parsed.port() {
        Some(port) => Some(format!("{}://{}:{}", parsed.scheme(), host, port)),
        None => Some(format!("{}://{}", parsed.scheme(), host)),
    }
}

/// Resolve an href found in a document against the document's URL and apply
/// the link filters.
///
/// Returns the normalized absolute URL, or `None` when the link is an
/// in-page anchor, uses a non-http(s) scheme, or points at a non-English
/// Wikipedia edition (those mirror en.wikipedia.org content in other
/// languages and would drown the crawl).
pub fn filter_link(base: &Url, href: &str) -> Option<String> {
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let mut resolved = base.join(href).ok()?;
    resolved.set_fragment(None);
    if resolved.scheme() != "http" && resolved.scheme() != "https" {
        return None;
    }
    let host = resolved.host_str()?.to_ascii_lowercase();
    if wikipedia_host_re().is_match(&host) && !host.starts_with("en.") {
        return None;
    }
    normalize(resolved.as_str()).ok()
}
