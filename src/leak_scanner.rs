//! Post-sanitization validator (`spec.md` §2 "LeakScanner", §4.4).
//!
//! Scans every part of a package — decoded as UTF-8 where possible, raw
//! bytes otherwise — for a fixed set of built-in PII-shaped patterns plus
//! any caller-supplied plaintext literals that must be provably absent.
//! Findings never carry the raw match: only a hash of it, so a leak report
//! is itself safe to persist or print.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::opc::OpcPackage;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LeakFinding {
    pub kind: String,
    pub part_name: String,
    pub match_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LeakScanResult {
    pub ok: bool,
    pub findings: Vec<LeakFinding>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

macro_rules! cached_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("built-in leak pattern is valid"))
        }
    };
}

cached_regex!(email_re, r"(?i)[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}");
cached_regex!(url_re, r"(?i)\b(?:https?|ftp|file|smb)://[^\s""'<>]+");
cached_regex!(aws_key_re, r"\bAKIA[0-9A-Z]{16}\b");
cached_regex!(jwt_re, r"\b[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{8,}\b");
cached_regex!(unc_path_re, r"\\\\[A-Za-z0-9_.\-]+\\[A-Za-z0-9_.\-$]+(?:\\[^\s""'<>]*)?");
cached_regex!(
    private_ip_re,
    r"\b(?:10\.(?:[0-9]{1,3}\.){2}[0-9]{1,3}|192\.168\.(?:[0-9]{1,3}\.)[0-9]{1,3}|172\.(?:1[6-9]|2[0-9]|3[0-1])\.(?:[0-9]{1,3}\.)[0-9]{1,3})\b"
);

const BUILTIN_KINDS: &[(&str, fn() -> &'static Regex)] = &[
    ("email", email_re),
    ("url", url_re),
    ("aws_key", aws_key_re),
    ("jwt", jwt_re),
    ("unc_path", unc_path_re),
    ("private_ip", private_ip_re),
];

/// Scan every part of `pkg` for built-in PII-shaped patterns plus the
/// caller-supplied `expected_absent` plaintext literals. Non-well-formed XML
/// never aborts the scan — it runs over raw bytes, not a parsed tree.
pub fn scan(pkg: &OpcPackage, expected_absent: &[String]) -> LeakScanResult {
    let mut findings = Vec::new();

    for (name, bytes) in pkg.parts() {
        let Ok(text) = std::str::from_utf8(bytes) else {
            continue;
        };

        for (kind, regex_fn) in BUILTIN_KINDS {
            for m in regex_fn().find_iter(text) {
                findings.push(LeakFinding {
                    kind: (*kind).to_string(),
                    part_name: name.to_string(),
                    match_sha256: sha256_hex(m.as_str().as_bytes()),
                });
            }
        }

        for literal in expected_absent {
            if !literal.is_empty() && text.contains(literal.as_str()) {
                findings.push(LeakFinding {
                    kind: "pii-surfaces".to_string(),
                    part_name: name.to_string(),
                    match_sha256: sha256_hex(literal.as_bytes()),
                });
            }
        }
    }

    LeakScanResult {
        ok: findings.is_empty(),
        findings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write as _};

    fn zip_bytes(parts: &[(&str, &[u8])]) -> Vec<u8> {
        let cursor = Cursor::new(Vec::new());
        let mut writer = zip::ZipWriter::new(cursor);
        let options = zip::write::FileOptions::<()>::default().compression_method(zip::CompressionMethod::Stored);
        for (name, bytes) in parts {
            writer.start_file(*name, options).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn detects_email_and_aws_key() {
        let pkg = OpcPackage::open(&zip_bytes(&[(
            "docProps/core.xml",
            b"<c>alice@example.com AKIA0123456789ABCDEF</c>",
        )]))
        .unwrap();
        let result = scan(&pkg, &[]);
        assert!(!result.ok);
        let kinds: Vec<&str> = result.findings.iter().map(|f| f.kind.as_str()).collect();
        assert!(kinds.contains(&"email"));
        assert!(kinds.contains(&"aws_key"));
    }

    #[test]
    fn clean_package_reports_ok() {
        let pkg = OpcPackage::open(&zip_bytes(&[("xl/workbook.xml", b"<workbook/>")])).unwrap();
        let result = scan(&pkg, &["ACME_SECRET_TOKEN".to_string()]);
        assert!(result.ok);
        assert!(result.findings.is_empty());
    }

    #[test]
    fn expected_absent_literal_is_flagged() {
        let pkg = OpcPackage::open(&zip_bytes(&[("xl/sharedStrings.xml", b"<sst>ACME_SECRET_TOKEN</sst>")])).unwrap();
        let result = scan(&pkg, &["ACME_SECRET_TOKEN".to_string()]);
        assert!(!result.ok);
        assert_eq!(result.findings[0].kind, "pii-surfaces");
    }

    #[test]
    fn findings_never_embed_the_raw_match() {
        let pkg = OpcPackage::open(&zip_bytes(&[("docProps/core.xml", b"<c>alice@example.com</c>")])).unwrap();
        let result = scan(&pkg, &[]);
        for finding in &result.findings {
            assert_eq!(finding.match_sha256.len(), 64);
        }
    }
}
