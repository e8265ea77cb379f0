use thiserror::Error;

/// Errors raised while opening or re-emitting an OPC (ZIP) package.
#[derive(Debug, Error)]
pub enum OpcError {
    #[error("not a valid ZIP archive: {0}")]
    InvalidArchive(#[from] zip::result::ZipError),
    #[error("zip-slip: entry {0:?} escapes the package root")]
    ZipSlip(String),
    #[error("i/o error reading package: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the sanitizer. These are configuration errors only —
/// malformed XML in an unknown part is never an error (see `spec.md` §4.3).
#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("hash_strings requires a non-empty hash_salt")]
    MissingHashSalt,
    #[error(transparent)]
    Opc(#[from] OpcError),
}

/// Errors raised by the semantic XML differ.
#[derive(Debug, Error)]
pub enum DiffError {
    #[error(transparent)]
    Opc(#[from] OpcError),
    #[error("invalid glob pattern {pattern:?}: {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

/// Errors raised while evaluating a `summary.json` against a timing or rate
/// gate (`spec.md` §4.8/§7/§8). These are the only corpus-level conditions
/// that exit the process with a non-zero status.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("summary.json not found: {0}")]
    SummaryNotFound(std::path::PathBuf),
    #[error("failed to parse summary.json: {0}")]
    InvalidSummary(#[from] serde_json::Error),
    #[error("no thresholds configured")]
    NoThresholds,
    #[error("{step} p90 unavailable: no successful samples")]
    NoSamples { step: &'static str },
}
