//! Pure, idempotent rewriting of potentially identifying strings
//! (`spec.md` §2 "PrivacyRedactor", §4.7 "Privacy mode").
//!
//! Every function here is a total, side-effect-free string transform: given
//! the same input and mode, it always returns the same output, and applying
//! it twice is the same as applying it once (`spec.md` §8 invariant 10). The
//! `public` mode is a no-op everywhere (`spec.md` §7 "Redaction policy").

use sha2::{Digest, Sha256};

use crate::collaborators::FunctionCatalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyMode {
    Public,
    Private,
}

impl Default for PrivacyMode {
    fn default() -> Self {
        PrivacyMode::Public
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// `sha256=<64-hex>`, the canonical redacted-string form used throughout
/// private-mode reports.
pub fn hash_marker(value: &str) -> String {
    format!("sha256={}", sha256_hex(value.as_bytes()))
}

/// `true` if `value` already has the `sha256=<64-hex>` shape — re-prefixing
/// an already-redacted string is forbidden (`spec.md` §4.7).
pub fn is_already_hashed(value: &str) -> bool {
    match value.strip_prefix("sha256=") {
        Some(hex) => hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()),
        None => false,
    }
}

/// Redact a free-form error/diagnostic string. A no-op under `public`; under
/// `private`, idempotent (an already-hashed string is left untouched).
pub fn redact_error_string(mode: PrivacyMode, value: &str) -> String {
    match mode {
        PrivacyMode::Public => value.to_string(),
        PrivacyMode::Private => {
            if is_already_hashed(value) {
                value.to_string()
            } else {
                hash_marker(value)
            }
        }
    }
}

/// Derive the stable, non-path `display_name` used in private mode:
/// `workbook-<16-hex>.<ext>` where `<ext>` matches the input's true
/// extension and the hex is the first 16 hex characters of
/// `sha256(workbook bytes)`.
pub fn private_display_name(sha256_hex_full: &str, extension: &str) -> String {
    format!("workbook-{}.{}", &sha256_hex_full[..16], extension)
}

/// Hosts exempt from hashing in `run_url` redaction: exact `github.com` or
/// any subdomain of it.
fn is_allowlisted_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("github.com") || host.to_ascii_lowercase().ends_with(".github.com")
}

fn extract_host(url: &str) -> Option<&str> {
    let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host_and_rest = after_scheme.split(['/', '?', '#']).next().unwrap_or("");
    let host = host_and_rest.rsplit_once('@').map(|(_, h)| h).unwrap_or(host_and_rest);
    let host = host.split(':').next().unwrap_or(host);
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Redact a `run_url`: URLs on an allowlisted host survive unchanged;
/// everything else is hashed in full.
pub fn redact_run_url(mode: PrivacyMode, url: &str) -> String {
    if mode == PrivacyMode::Public {
        return url.to_string();
    }
    match extract_host(url) {
        Some(host) if is_allowlisted_host(host) => url.to_string(),
        _ => hash_marker(url),
    }
}

/// Well-known OOXML/Office relationship-type URI and namespace prefixes that
/// survive private-mode redaction unchanged. Anything else is hashed.
const ALLOWLISTED_URI_PREFIXES: &[&str] = &[
    "http://schemas.openxmlformats.org/",
    "http://schemas.microsoft.com/office/",
    "http://purl.org/dc/",
    "http://www.w3.org/",
];

pub fn redact_scheme_uri(mode: PrivacyMode, uri: &str) -> String {
    if mode == PrivacyMode::Public {
        return uri.to_string();
    }
    if ALLOWLISTED_URI_PREFIXES.iter().any(|p| uri.starts_with(p)) {
        uri.to_string()
    } else {
        hash_marker(uri)
    }
}

/// Function-name tokens survive private-mode redaction if they're in the
/// known function catalog, or are entirely lowercase (category-like, e.g.
/// diagnostic keys rather than formula calls). Everything else is hashed.
pub fn redact_function_name(mode: PrivacyMode, name: &str, catalog: &FunctionCatalog) -> String {
    if mode == PrivacyMode::Public {
        return name.to_string();
    }
    if catalog.contains(name) || name.chars().all(|c| !c.is_ascii_uppercase()) {
        name.to_string()
    } else {
        hash_marker(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_mode_is_a_no_op() {
        assert_eq!(redact_error_string(PrivacyMode::Public, "oops: /home/alice/book.xlsx"), "oops: /home/alice/book.xlsx");
    }

    #[test]
    fn private_mode_hashes_and_is_idempotent() {
        let once = redact_error_string(PrivacyMode::Private, "oops");
        let twice = redact_error_string(PrivacyMode::Private, &once);
        assert_eq!(once, twice);
        assert!(is_already_hashed(&once));
    }

    #[test]
    fn run_url_allowlist() {
        assert_eq!(
            redact_run_url(PrivacyMode::Private, "https://github.com/acme/repo/actions/runs/1"),
            "https://github.com/acme/repo/actions/runs/1"
        );
        let hashed = redact_run_url(PrivacyMode::Private, "https://ci.internal.example.com/run/1");
        assert!(is_already_hashed(&hashed));
    }

    #[test]
    fn function_name_redaction() {
        let catalog = FunctionCatalog::builtin();
        assert_eq!(redact_function_name(PrivacyMode::Private, "SUM", &catalog), "SUM");
        assert_eq!(redact_function_name(PrivacyMode::Private, "lookup_key", &catalog), "lookup_key");
        assert!(is_already_hashed(&redact_function_name(PrivacyMode::Private, "CORP.ADDIN.FOO", &catalog)));
    }
}
