//! Per-workbook report schema (`spec.md` §6.1).
//!
//! `serde_json`'s default `Map` is BTreeMap-backed (no `preserve_order`
//! feature enabled), so object keys come out lexicographically sorted on
//! their own — the "keys sorted lexicographically when emitted" requirement
//! needs no extra sorting code here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::differ::FailOn;
use crate::feature_extractor::{CellImagesInfo, Features, StyleStats};

/// A boolean that can also be "not attempted" — used for `calculate_ok`/
/// `render_ok`, which are `null` rather than `false` when the corresponding
/// optional step never ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriState {
    True,
    False,
    Skipped,
}

impl Serialize for TriState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            TriState::True => serializer.serialize_bool(true),
            TriState::False => serializer.serialize_bool(false),
            TriState::Skipped => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for TriState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let opt = Option::<bool>::deserialize(deserializer)?;
        Ok(match opt {
            Some(true) => TriState::True,
            Some(false) => TriState::False,
            None => TriState::Skipped,
        })
    }
}

impl TriState {
    pub fn from_bool(b: bool) -> Self {
        if b {
            TriState::True
        } else {
            TriState::False
        }
    }

    pub fn is_false(&self) -> bool {
        matches!(self, TriState::False)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StepRecord {
    pub fn ok(duration_ms: u64, details: Option<serde_json::Value>) -> Self {
        Self {
            status: StepStatus::Ok,
            duration_ms: Some(duration_ms),
            error: None,
            details,
        }
    }

    pub fn failed(duration_ms: Option<u64>, error: String, details: Option<serde_json::Value>) -> Self {
        Self {
            status: StepStatus::Failed,
            duration_ms,
            error: Some(error),
            details,
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: StepStatus::Skipped,
            duration_ms: None,
            error: None,
            details: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Steps {
    pub load: StepRecord,
    pub features: StepRecord,
    pub round_trip: StepRecord,
    pub diff: StepRecord,
    pub recalc: StepRecord,
    pub render: StepRecord,
}

impl Default for Steps {
    fn default() -> Self {
        Self {
            load: StepRecord::skipped(),
            features: StepRecord::skipped(),
            round_trip: StepRecord::skipped(),
            diff: StepRecord::skipped(),
            recalc: StepRecord::skipped(),
            render: StepRecord::skipped(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportResult {
    pub open_ok: bool,
    pub calculate_ok: TriState,
    pub render_ok: TriState,
    pub round_trip_ok: bool,
    pub diff_critical_count: usize,
    pub diff_warning_count: usize,
    pub diff_info_count: usize,
    pub round_trip_fail_on: FailOn,
}

impl ReportResult {
    pub fn any_false(&self) -> bool {
        !self.open_ok || !self.round_trip_ok || self.calculate_ok.is_false() || self.render_ok.is_false()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageReport {
    pub display_name: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub timestamp: String,
    pub commit: Option<String>,
    pub run_url: Option<String>,
    pub features: Option<Features>,
    pub functions: BTreeMap<String, u64>,
    pub style_stats: Option<StyleStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style_stats_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell_images: Option<CellImagesInfo>,
    pub steps: Steps,
    pub result: ReportResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_trip_failure_kind: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tri_state_skipped_serializes_to_null() {
        assert_eq!(serde_json::to_string(&TriState::Skipped).unwrap(), "null");
        assert_eq!(serde_json::to_string(&TriState::True).unwrap(), "true");
        assert_eq!(serde_json::to_string(&TriState::False).unwrap(), "false");
    }

    #[test]
    fn result_any_false_detects_failed_round_trip() {
        let result = ReportResult {
            open_ok: true,
            calculate_ok: TriState::Skipped,
            render_ok: TriState::Skipped,
            round_trip_ok: false,
            diff_critical_count: 1,
            diff_warning_count: 0,
            diff_info_count: 0,
            round_trip_fail_on: FailOn::Critical,
        };
        assert!(result.any_false());
    }
}
