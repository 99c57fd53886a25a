//! URL Normalizer & Fingerprinter.
//!
//! Canonicalizes submitted URLs so that pages a user would consider "the
//! same" collapse to one cache key, and derives a stable fingerprint from
//! the normalized URL plus the requested service set.

use sha2::{Digest, Sha256};
use url::Url;

const TRACKING_PREFIXES: &[&str] = &["utm_"];
const TRACKING_EXACT: &[&str] = &["fbclid", "gclid", "mc_eid", "_ga", "ref"];

/// Normalization options. Defaults match [`crate::config`]'s documented
/// defaults (force-https on, strip-tracking-params on).
#[derive(Debug, Clone, Copy)]
pub struct NormalizeOptions {
    pub force_https: bool,
    pub strip_tracking_params: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            force_https: true,
            strip_tracking_params: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("could not parse url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

fn is_tracking_param(key: &str) -> bool {
    TRACKING_PREFIXES.iter().any(|p| key.starts_with(p)) || TRACKING_EXACT.contains(&key)
}

/// Normalize a submitted URL per spec §4.C:
/// - lowercase host
/// - strip default ports (80/443)
/// - drop the fragment
/// - remove tracking query parameters
/// - sort remaining query parameters lexicographically
/// - coerce scheme to `https` unless disabled
/// - collapse trailing slashes except on root
///
/// Idempotent: `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(raw: &str, opts: NormalizeOptions) -> Result<String, NormalizeError> {
    let mut url = Url::parse(raw)?;

    if opts.force_https && url.scheme() == "http" {
        url.set_scheme("https").ok();
    }

    if let Some(host) = url.host_str() {
        let lower = host.to_ascii_lowercase();
        url.set_host(Some(&lower))?;
    }

    let default_port = match url.scheme() {
        "https" => Some(443u16),
        "http" => Some(80u16),
        _ => None,
    };
    if url.port() == default_port {
        url.set_port(None).ok();
    }

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !opts.strip_tracking_params || !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &pairs {
            serializer.append_pair(k, v);
        }
        url.set_query(Some(&serializer.finish()));
    }

    let path = url.path();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/').to_string();
        url.set_path(&trimmed);
    }

    Ok(url.to_string())
}

/// Stable SHA-256 hex fingerprint of `normalized_url || "|" ||
/// sorted-services-joined-by-comma`. Same URL + same enabled-service set
/// produces the same fingerprint across processes.
pub fn fingerprint(normalized_url: &str, services: &[&str]) -> String {
    let mut sorted: Vec<&str> = services.to_vec();
    sorted.sort_unstable();
    let joined = sorted.join(",");

    let mut hasher = Sha256::new();
    hasher.update(normalized_url.as_bytes());
    hasher.update(b"|");
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}
