//! Content fingerprints
//!
//! A fingerprint is the string the classifier compares to decide whether an
//! object's content changed. It is derived from the strongest signal the
//! provider exposes: content hash, then ETag, then last-modified time.

use chrono::{DateTime, Utc};

use super::entry::ObjectMeta;

/// The raw signals a fingerprint can be built from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FingerprintSource<'a> {
    pub content_hash: Option<&'a str>,
    pub etag: Option<&'a str>,
    pub modified_at: Option<DateTime<Utc>>,
    pub size: Option<u64>,
}

impl<'a> From<&'a ObjectMeta> for FingerprintSource<'a> {
    fn from(meta: &'a ObjectMeta) -> Self {
        Self {
            content_hash: meta.content_hash.as_deref(),
            etag: meta.etag.as_deref(),
            modified_at: meta.modified_at,
            size: meta.size,
        }
    }
}

/// Derives content fingerprints; never fails
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintResolver;

impl FingerprintResolver {
    /// Returns the fingerprint for the given signals, or an empty string
    /// when none is available
    pub fn fingerprint(source: FingerprintSource<'_>) -> String {
        if let Some(hash) = source.content_hash.map(str::trim).filter(|h| !h.is_empty()) {
            return hash.to_ascii_lowercase();
        }

        if let Some(etag) = source.etag.and_then(normalize_etag) {
            return etag;
        }

        if let Some(mtime) = source.modified_at {
            return match source.size {
                Some(size) => format!("mtime:{}:{size}", mtime.timestamp_millis()),
                None => format!("mtime:{}", mtime.timestamp_millis()),
            };
        }

        String::new()
    }

    /// Convenience for validated entries
    pub fn for_meta(meta: &ObjectMeta) -> String {
        Self::fingerprint(FingerprintSource::from(meta))
    }
}

/// Strips the weak-validator prefix and surrounding quotes from an ETag
fn normalize_etag(etag: &str) -> Option<String> {
    let trimmed = etag.trim();
    let strong = trimmed
        .strip_prefix("W/")
        .or_else(|| trimmed.strip_prefix("w/"))
        .unwrap_or(trimmed);
    let unquoted = strong.trim_matches('"').trim();
    if unquoted.is_empty() {
        None
    } else {
        Some(unquoted.to_string())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_hash_wins_over_etag_and_mtime() {
        let fp = FingerprintResolver::fingerprint(FingerprintSource {
            content_hash: Some(" ABCDEF "),
            etag: Some("\"etag\""),
            modified_at: Some(Utc::now()),
            size: Some(1),
        });
        assert_eq!(fp, "abcdef");
    }

    #[test]
    fn test_etag_normalization() {
        let strong = FingerprintResolver::fingerprint(FingerprintSource {
            etag: Some("\"9b2cf535f27731c974343645a3985328\""),
            ..Default::default()
        });
        let weak = FingerprintResolver::fingerprint(FingerprintSource {
            etag: Some("W/\"9b2cf535f27731c974343645a3985328\""),
            ..Default::default()
        });
        assert_eq!(strong, "9b2cf535f27731c974343645a3985328");
        assert_eq!(strong, weak);
    }

    #[test]
    fn test_mtime_composite() {
        let mtime = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let with_size = FingerprintResolver::fingerprint(FingerprintSource {
            modified_at: Some(mtime),
            size: Some(2048),
            ..Default::default()
        });
        assert_eq!(with_size, "mtime:1700000000123:2048");

        let without_size = FingerprintResolver::fingerprint(FingerprintSource {
            modified_at: Some(mtime),
            ..Default::default()
        });
        assert_eq!(without_size, "mtime:1700000000123");
    }

    #[test]
    fn test_no_signal_yields_empty() {
        assert_eq!(FingerprintResolver::fingerprint(FingerprintSource::default()), "");
        let blank = FingerprintResolver::fingerprint(FingerprintSource {
            content_hash: Some("   "),
            etag: Some("\"\""),
            ..Default::default()
        });
        assert_eq!(blank, "");
    }

    #[test]
    fn test_stable_across_observations() {
        let mtime = Utc.timestamp_millis_opt(42).unwrap();
        let source = FingerprintSource {
            etag: Some("\"v1\""),
            modified_at: Some(mtime),
            size: Some(10),
            ..Default::default()
        };
        assert_eq!(
            FingerprintResolver::fingerprint(source),
            FingerprintResolver::fingerprint(source)
        );
    }
}
