//! External collaborators consumed through a narrow trait contract (`spec.md`
//! §6.2). The triage engine never implements encryption, recalculation, or
//! rendering itself — these are opaque capabilities supplied by the caller,
//! which keeps the pipeline testable without a calculation backend or a
//! headless Excel build. Each trait ships a default no-op/identity
//! implementation used by the CLI when the corresponding feature flag is
//! off, matching how `formula-corpus-triage` injects collaborators as
//! constructor parameters rather than reaching for a global.

use std::collections::BTreeSet;

/// `encrypt`/`decrypt` over an opaque authenticated-encryption primitive.
/// Key material is read from an environment variable whose name is
/// configurable; the engine never logs it.
pub trait AuthenticatedEncryptor: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> anyhow::Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8], key: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Null-object default: round-trips bytes unchanged. Real corpus storage
/// encryption is out of scope (`spec.md` §1) — callers that need it supply
/// their own `AuthenticatedEncryptor`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEncryptor;

impl AuthenticatedEncryptor for NoopEncryptor {
    fn encrypt(&self, plaintext: &[u8], _key: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8], _key: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

/// `write(package_bytes) -> package_bytes`. Must be a deterministic pure
/// function of its input — the triage pipeline's determinism guarantee
/// (`spec.md` §4.7) depends on it.
pub trait RoundTripWriter: Send + Sync {
    fn write(&self, package_bytes: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// A short engine tag recorded in `steps.round_trip.details.engine`.
    fn engine_name(&self) -> &str;
}

/// Identity writer used for smoke testing: the "round trip" is just a copy,
/// so a clean corpus always diffs equal to itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityRoundTripWriter;

impl RoundTripWriter for IdentityRoundTripWriter {
    fn write(&self, package_bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(package_bytes.to_vec())
    }

    fn engine_name(&self) -> &str {
        "identity"
    }
}

/// Outcome of an optional recalc/render step.
#[derive(Debug, Clone)]
pub struct CollaboratorOutcome {
    pub ok: bool,
    pub duration_ms: u64,
    pub mismatches: Option<serde_json::Value>,
}

/// `calculate(package_bytes) -> {ok, mismatches?, duration_ms}`.
pub trait Calculator: Send + Sync {
    fn calculate(&self, package_bytes: &[u8]) -> anyhow::Result<CollaboratorOutcome>;
}

/// `render(package_bytes) -> {ok, duration_ms}`.
pub trait Renderer: Send + Sync {
    fn render(&self, package_bytes: &[u8]) -> anyhow::Result<CollaboratorOutcome>;
}

/// Invokes a calculator/renderer as a side process rather than an in-crate
/// implementation (`spec.md` §1 "the calculation and headless-rendering
/// engines (invoked as optional side processes through a contract in
/// §6)"). `package_bytes` is piped to the child's stdin; the child is
/// expected to write a single `{ok, duration_ms, mismatches?}` JSON object
/// to stdout and exit zero. The wall-clock `duration_ms` this struct
/// records is the time spent waiting on the child, independent of whatever
/// timing the child itself reports.
pub struct ExternalProcess {
    program: String,
    args: Vec<String>,
}

impl ExternalProcess {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn run(&self, package_bytes: &[u8]) -> anyhow::Result<CollaboratorOutcome> {
        use std::io::Write as _;
        use std::process::{Command, Stdio};
        use std::time::Instant;

        let start = Instant::now();
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(package_bytes)?;
        let output = child.wait_with_output()?;
        let duration_ms = start.elapsed().as_millis() as u64;

        if !output.status.success() {
            anyhow::bail!(
                "external process {:?} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        let ok = parsed.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
        let reported_duration = parsed.get("duration_ms").and_then(|v| v.as_u64());
        Ok(CollaboratorOutcome {
            ok,
            duration_ms: reported_duration.unwrap_or(duration_ms),
            mismatches: parsed.get("mismatches").cloned(),
        })
    }
}

impl Calculator for ExternalProcess {
    fn calculate(&self, package_bytes: &[u8]) -> anyhow::Result<CollaboratorOutcome> {
        self.run(package_bytes)
    }
}

impl Renderer for ExternalProcess {
    fn render(&self, package_bytes: &[u8]) -> anyhow::Result<CollaboratorOutcome> {
        self.run(package_bytes)
    }
}

/// An allowlist of function names consulted by the `PrivacyRedactor` so
/// that well-known formula functions survive private-mode hashing while
/// bespoke add-in names (`CORP.ADDIN.FOO`) get hashed.
#[derive(Debug, Clone, Default)]
pub struct FunctionCatalog {
    known: BTreeSet<String>,
}

impl FunctionCatalog {
    pub fn new(known: impl IntoIterator<Item = String>) -> Self {
        Self {
            known: known.into_iter().map(|s| s.to_ascii_uppercase()).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.known.contains(&name.to_ascii_uppercase())
    }

    /// A small built-in catalog of common worksheet functions, enough for
    /// unit tests and as a sane default for callers that don't supply a
    /// corpus-specific catalog.
    pub fn builtin() -> Self {
        const NAMES: &[&str] = &[
            "SUM", "SUMIF", "SUMIFS", "AVERAGE", "AVERAGEIF", "COUNT", "COUNTA", "COUNTIF",
            "COUNTIFS", "IF", "IFS", "IFERROR", "IFNA", "VLOOKUP", "HLOOKUP", "XLOOKUP", "INDEX",
            "MATCH", "CONCATENATE", "CONCAT", "TEXTJOIN", "LEFT", "RIGHT", "MID", "LEN", "TRIM",
            "ROUND", "ROUNDUP", "ROUNDDOWN", "ABS", "MIN", "MAX", "AND", "OR", "NOT", "TODAY",
            "NOW", "DATE", "YEAR", "MONTH", "DAY", "NPV", "IRR", "PMT", "RATE", "SUMPRODUCT",
        ];
        Self::new(NAMES.iter().map(|s| s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_writer_round_trips_bytes() {
        let writer = IdentityRoundTripWriter;
        assert_eq!(writer.write(b"abc").unwrap(), b"abc");
    }

    #[test]
    fn function_catalog_is_case_insensitive() {
        let catalog = FunctionCatalog::builtin();
        assert!(catalog.contains("sum"));
        assert!(catalog.contains("VLOOKUP"));
        assert!(!catalog.contains("CORP.ADDIN.FOO"));
    }
}
