//! Corpus-wide triage configuration (`SPEC_FULL.md` §D).
//!
//! Mirrors `DiffOptions`/`SanitizeOptions` being a plain struct with
//! defaults in both the original implementation and the retrieval pack's
//! `xlsx-diff` crate: every field has a `#[serde(default)]` so a partial
//! `--config` JSON file only overrides what it names, and CLI flags layer
//! on top of that.

use serde::{Deserialize, Serialize};

use crate::differ::FailOn;
use crate::privacy::PrivacyMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    pub privacy_mode: PrivacyMode,
    pub jobs: usize,
    pub diff_limit: usize,
    pub round_trip_fail_on: FailOn,
    pub strict_calc_chain: bool,
    pub ignore_part: Vec<String>,
    pub ignore_glob: Vec<String>,
    pub ignore_path: Vec<String>,
    pub ignore_presets: Vec<String>,
    pub recalc: bool,
    pub render: bool,
    pub gate_load_p90_ms: Option<f64>,
    pub gate_round_trip_p90_ms: Option<f64>,
    pub min_open_rate: Option<f64>,
    pub min_round_trip_rate: Option<f64>,
    pub min_calc_rate: Option<f64>,
    pub min_render_rate: Option<f64>,
    pub trend_file: Option<String>,
    pub trend_cap: usize,
    pub quiet: bool,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            privacy_mode: PrivacyMode::Public,
            jobs: default_jobs(),
            diff_limit: 50,
            round_trip_fail_on: FailOn::Critical,
            strict_calc_chain: false,
            ignore_part: Vec::new(),
            ignore_glob: Vec::new(),
            ignore_path: Vec::new(),
            ignore_presets: Vec::new(),
            recalc: false,
            render: false,
            gate_load_p90_ms: None,
            gate_round_trip_p90_ms: None,
            min_open_rate: None,
            min_round_trip_rate: None,
            min_calc_rate: None,
            min_render_rate: None,
            trend_file: None,
            trend_cap: 90,
            quiet: false,
        }
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

impl TriageConfig {
    /// Merge CLI-supplied overrides onto a config loaded from `--config`;
    /// `overrides` wins field-by-field wherever it differs from the
    /// library default, matching how `main.rs` layers argv on top of the
    /// file (`SPEC_FULL.md` §D).
    pub fn merged_with(mut self, overrides: TriageConfigOverrides) -> Self {
        if let Some(v) = overrides.privacy_mode {
            self.privacy_mode = v;
        }
        if let Some(v) = overrides.jobs {
            self.jobs = v;
        }
        if let Some(v) = overrides.diff_limit {
            self.diff_limit = v;
        }
        if let Some(v) = overrides.round_trip_fail_on {
            self.round_trip_fail_on = v;
        }
        if overrides.strict_calc_chain {
            self.strict_calc_chain = true;
        }
        if !overrides.ignore_part.is_empty() {
            self.ignore_part.extend(overrides.ignore_part);
        }
        if !overrides.ignore_glob.is_empty() {
            self.ignore_glob.extend(overrides.ignore_glob);
        }
        if !overrides.ignore_path.is_empty() {
            self.ignore_path.extend(overrides.ignore_path);
        }
        if overrides.recalc {
            self.recalc = true;
        }
        if overrides.render {
            self.render = true;
        }
        if let Some(v) = overrides.gate_load_p90_ms {
            self.gate_load_p90_ms = Some(v);
        }
        if let Some(v) = overrides.gate_round_trip_p90_ms {
            self.gate_round_trip_p90_ms = Some(v);
        }
        if let Some(v) = overrides.trend_file {
            self.trend_file = Some(v);
        }
        if let Some(v) = overrides.trend_cap {
            self.trend_cap = v;
        }
        if overrides.quiet {
            self.quiet = true;
        }
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct TriageConfigOverrides {
    pub privacy_mode: Option<PrivacyMode>,
    pub jobs: Option<usize>,
    pub diff_limit: Option<usize>,
    pub round_trip_fail_on: Option<FailOn>,
    pub strict_calc_chain: bool,
    pub ignore_part: Vec<String>,
    pub ignore_glob: Vec<String>,
    pub ignore_path: Vec<String>,
    pub recalc: bool,
    pub render: bool,
    pub gate_load_p90_ms: Option<f64>,
    pub gate_round_trip_p90_ms: Option<f64>,
    pub trend_file: Option<String>,
    pub trend_cap: Option<usize>,
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_json() {
        let config = TriageConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: TriageConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.diff_limit, config.diff_limit);
        assert_eq!(back.trend_cap, 90);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: TriageConfig = serde_json::from_str(r#"{"diff_limit": 5}"#).unwrap();
        assert_eq!(config.diff_limit, 5);
        assert_eq!(config.trend_cap, 90);
        assert!(!config.strict_calc_chain);
    }

    #[test]
    fn overrides_extend_ignore_lists() {
        let config = TriageConfig::default();
        let overrides = TriageConfigOverrides {
            ignore_part: vec!["docProps/core.xml".to_string()],
            ..Default::default()
        };
        let merged = config.merged_with(overrides);
        assert_eq!(merged.ignore_part, vec!["docProps/core.xml".to_string()]);
    }
}
