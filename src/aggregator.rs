//! Corpus-wide scorecard, trend tracking and timing/rate gates (`spec.md`
//! §2 "Aggregator", §4.8).
//!
//! Everything here is a pure function of the ordered list of per-workbook
//! [`TriageReport`]s produced by one run — no filesystem or clock access
//! except in [`append_trend_entry`], which is the one place a trend file is
//! read back and rewritten.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::TriageConfig;
use crate::differ::{DiffCounts, DiffEntry, PartDiffStat, PartStats};
use crate::error::GateError;
use crate::report::{StepStatus, TriState, TriageReport};

/// Linear-interpolation (type-7) percentile over an already-sorted sample,
/// the single definition every percentile in this module goes through
/// (`spec.md` §4.8 "Percentile definition", §9 "Percentile choice").
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    assert!(!sorted.is_empty(), "percentile of an empty sample is undefined");
    if sorted.len() == 1 {
        return sorted[0];
    }
    let idx = p * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    let frac = idx - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistStats {
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub max: f64,
}

fn dist_stats(mut values: Vec<f64>) -> Option<DistStats> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let max = *values.last().unwrap();
    Some(DistStats {
        count,
        mean,
        p50: percentile(&values, 0.5),
        p90: percentile(&values, 0.9),
        max,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingStats {
    pub count: usize,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeOverhead {
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub max: f64,
    pub count_over_1_05: usize,
    pub count_over_1_10: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Counts {
    pub total: usize,
    pub open_ok: usize,
    pub round_trip_ok: usize,
    pub calculate_ok: usize,
    pub calculate_attempted: usize,
    pub render_ok: usize,
    pub render_attempted: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rates {
    pub open: f64,
    pub round_trip: f64,
    pub calculate: Option<f64>,
    pub render: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffTotals {
    pub critical: usize,
    pub warning: usize,
    pub info: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountEntry {
    pub key: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellXfsGroupStats {
    pub count: usize,
    pub avg: f64,
    pub median: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellXfsStats {
    pub passing: CellXfsGroupStats,
    pub failing: CellXfsGroupStats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StyleComplexity {
    #[serde(rename = "cellXfs")]
    pub cell_xfs: CellXfsStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailingCellXfsEntry {
    pub display_name: String,
    #[serde(rename = "cellXfs")]
    pub cell_xfs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub counts: Counts,
    pub rates: Rates,
    pub failures_by_category: BTreeMap<String, usize>,
    pub failures_by_round_trip_failure_kind: BTreeMap<String, usize>,
    pub diff_totals: DiffTotals,
    pub timings: BTreeMap<String, TimingStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_trip_size_overhead: Option<SizeOverhead>,
    pub top_diff_parts_critical: Vec<CountEntry>,
    pub top_diff_parts_total: Vec<CountEntry>,
    pub top_diff_part_groups_critical: Vec<CountEntry>,
    pub top_diff_part_groups_total: Vec<CountEntry>,
    pub top_functions_in_failures: Vec<CountEntry>,
    pub top_features_in_failures: Vec<CountEntry>,
    pub top_diff_fingerprints_in_failures: Vec<CountEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_change_ratio: Option<DistStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_change_ratio_critical: Option<DistStats>,
    pub style: StyleComplexity,
    #[serde(rename = "top_failing_by_cellXfs")]
    pub top_failing_by_cell_xfs: Vec<FailingCellXfsEntry>,
}

const TOP_N: usize = 10;
const TIMED_STEPS: &[&str] = &["load", "round_trip", "diff", "recalc", "render"];

/// The JSON shape `TriageRunner::run` stashes into `steps.diff.details`
/// (`triage_runner.rs`), re-parsed here so the aggregator can roll up
/// per-part/per-group diff counts without recomputing the diff itself.
#[derive(Debug, Deserialize)]
struct DiffStepDetails {
    counts: DiffCounts,
    parts_with_diffs: Vec<PartDiffStat>,
    top_differences: Vec<DiffEntry>,
    part_stats: PartStats,
}

fn diff_details_of(report: &TriageReport) -> Option<DiffStepDetails> {
    let value = report.steps.diff.details.as_ref()?;
    serde_json::from_value(value.clone()).ok()
}

fn top_n(mut counts: BTreeMap<String, usize>) -> Vec<CountEntry> {
    let mut entries: Vec<CountEntry> = counts
        .iter()
        .map(|(k, v)| CountEntry {
            key: k.clone(),
            count: *v,
        })
        .collect();
    counts.clear();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    entries.truncate(TOP_N);
    entries
}

fn feature_flags(features: &crate::feature_extractor::Features) -> Vec<(&'static str, bool)> {
    vec![
        ("has_charts", features.has_charts),
        ("has_drawings", features.has_drawings),
        ("has_tables", features.has_tables),
        ("has_pivot_tables", features.has_pivot_tables),
        ("has_pivot_cache", features.has_pivot_cache),
        ("has_external_links", features.has_external_links),
        ("has_query_tables", features.has_query_tables),
        ("has_printer_settings", features.has_printer_settings),
        ("has_custom_xml_root", features.has_custom_xml_root),
        ("has_custom_xml_xl", features.has_custom_xml_xl),
        ("has_vba", features.has_vba),
        ("has_connections", features.has_connections),
        ("has_shared_strings", features.has_shared_strings),
        ("has_cell_images", features.has_cell_images),
    ]
}

/// Roll up one run's ordered per-workbook reports into a corpus scorecard
/// (`spec.md` §4.8).
pub fn compute_summary(reports: &[TriageReport]) -> Summary {
    let total = reports.len();
    let open_ok = reports.iter().filter(|r| r.result.open_ok).count();
    let round_trip_ok = reports.iter().filter(|r| r.result.round_trip_ok).count();
    let calculate_attempted = reports.iter().filter(|r| r.steps.recalc.status != StepStatus::Skipped).count();
    let calculate_ok = reports.iter().filter(|r| r.result.calculate_ok == TriState::True).count();
    let render_attempted = reports.iter().filter(|r| r.steps.render.status != StepStatus::Skipped).count();
    let render_ok = reports.iter().filter(|r| r.result.render_ok == TriState::True).count();

    let rate = |ok: usize, denom: usize| if denom == 0 { 0.0 } else { ok as f64 / denom as f64 };

    let counts = Counts {
        total,
        open_ok,
        round_trip_ok,
        calculate_ok,
        calculate_attempted,
        render_ok,
        render_attempted,
    };
    let rates = Rates {
        open: rate(open_ok, total),
        round_trip: rate(round_trip_ok, total),
        calculate: (calculate_attempted > 0).then(|| rate(calculate_ok, calculate_attempted)),
        render: (render_attempted > 0).then(|| rate(render_ok, render_attempted)),
    };

    let mut failures_by_category: BTreeMap<String, usize> = BTreeMap::new();
    let mut failures_by_round_trip_failure_kind: BTreeMap<String, usize> = BTreeMap::new();
    for report in reports {
        if let Some(category) = &report.failure_category {
            *failures_by_category.entry(category.clone()).or_insert(0) += 1;
            if category == "round_trip_diff" {
                if let Some(kind) = &report.round_trip_failure_kind {
                    *failures_by_round_trip_failure_kind.entry(kind.clone()).or_insert(0) += 1;
                }
            }
        }
    }

    let diff_totals = reports.iter().fold(DiffTotals::default(), |mut acc, r| {
        acc.critical += r.result.diff_critical_count;
        acc.warning += r.result.diff_warning_count;
        acc.info += r.result.diff_info_count;
        acc
    });

    let mut timings = BTreeMap::new();
    for &step in TIMED_STEPS {
        let record = |r: &TriageReport| match step {
            "load" => &r.steps.load,
            "round_trip" => &r.steps.round_trip,
            "diff" => &r.steps.diff,
            "recalc" => &r.steps.recalc,
            "render" => &r.steps.render,
            _ => unreachable!(),
        };
        let samples: Vec<f64> = reports
            .iter()
            .map(record)
            .filter(|s| s.status == StepStatus::Ok)
            .filter_map(|s| s.duration_ms)
            .map(|ms| ms as f64)
            .collect();
        if let Some(stats) = dist_stats(samples) {
            timings.insert(
                step.to_string(),
                TimingStats {
                    count: stats.count,
                    mean_ms: stats.mean,
                    p50_ms: stats.p50,
                    p90_ms: stats.p90,
                    max_ms: stats.max,
                },
            );
        }
    }

    let overhead_ratios: Vec<f64> = reports
        .iter()
        .filter(|r| r.steps.round_trip.status == StepStatus::Ok && r.size_bytes > 0)
        .filter_map(|r| {
            let output_size = r.steps.round_trip.details.as_ref()?.get("output_size_bytes")?.as_u64()?;
            Some(output_size as f64 / r.size_bytes as f64)
        })
        .collect();
    let round_trip_size_overhead = (!overhead_ratios.is_empty()).then(|| {
        let count_over_1_05 = overhead_ratios.iter().filter(|r| **r > 1.05).count();
        let count_over_1_10 = overhead_ratios.iter().filter(|r| **r > 1.10).count();
        let stats = dist_stats(overhead_ratios).expect("checked non-empty above");
        SizeOverhead {
            count: stats.count,
            mean: stats.mean,
            p50: stats.p50,
            p90: stats.p90,
            max: stats.max,
            count_over_1_05,
            count_over_1_10,
        }
    });

    let mut diff_parts_critical: BTreeMap<String, usize> = BTreeMap::new();
    let mut diff_parts_total: BTreeMap<String, usize> = BTreeMap::new();
    let mut diff_groups_critical: BTreeMap<String, usize> = BTreeMap::new();
    let mut diff_groups_total: BTreeMap<String, usize> = BTreeMap::new();
    let mut part_change_ratios: Vec<f64> = Vec::new();
    let mut part_change_ratios_critical: Vec<f64> = Vec::new();

    for report in reports {
        let Some(details) = diff_details_of(report) else {
            continue;
        };
        for stat in &details.parts_with_diffs {
            if stat.critical > 0 {
                *diff_parts_critical.entry(stat.part.clone()).or_insert(0) += stat.critical;
                *diff_groups_critical.entry(stat.group.clone()).or_insert(0) += stat.critical;
            }
            if stat.total > 0 {
                *diff_parts_total.entry(stat.part.clone()).or_insert(0) += stat.total;
                *diff_groups_total.entry(stat.group.clone()).or_insert(0) += stat.total;
            }
        }
        if details.part_stats.parts_total > 0 {
            let denom = details.part_stats.parts_total as f64;
            part_change_ratios.push(details.part_stats.parts_changed as f64 / denom);
            part_change_ratios_critical.push(details.part_stats.parts_changed_critical as f64 / denom);
        }
    }

    let mut functions_in_failures: BTreeMap<String, usize> = BTreeMap::new();
    let mut features_in_failures: BTreeMap<String, usize> = BTreeMap::new();
    let mut fingerprints_in_failures: BTreeMap<String, usize> = BTreeMap::new();
    for report in reports.iter().filter(|r| r.result.any_false()) {
        for (name, count) in &report.functions {
            *functions_in_failures.entry(name.clone()).or_insert(0) += *count as usize;
        }
        if let Some(features) = &report.features {
            for (name, present) in feature_flags(features) {
                if present {
                    *features_in_failures.entry(name.to_string()).or_insert(0) += 1;
                }
            }
        }
        if let Some(details) = diff_details_of(report) {
            for entry in &details.top_differences {
                *fingerprints_in_failures.entry(entry.fingerprint.clone()).or_insert(0) += 1;
            }
        }
    }

    let mut passing_xfs: Vec<f64> = Vec::new();
    let mut failing_xfs: Vec<f64> = Vec::new();
    let mut top_failing_by_cell_xfs: Vec<FailingCellXfsEntry> = Vec::new();
    for report in reports {
        let Some(style) = &report.style_stats else {
            continue;
        };
        if report.result.any_false() {
            failing_xfs.push(style.cell_xfs as f64);
            top_failing_by_cell_xfs.push(FailingCellXfsEntry {
                display_name: report.display_name.clone(),
                cell_xfs: style.cell_xfs,
            });
        } else {
            passing_xfs.push(style.cell_xfs as f64);
        }
    }
    top_failing_by_cell_xfs.sort_by(|a, b| b.cell_xfs.cmp(&a.cell_xfs).then_with(|| a.display_name.cmp(&b.display_name)));
    top_failing_by_cell_xfs.truncate(TOP_N);

    let xfs_group_stats = |values: Vec<f64>| -> CellXfsGroupStats {
        match dist_stats(values) {
            Some(stats) => CellXfsGroupStats {
                count: stats.count,
                avg: stats.mean,
                median: stats.p50,
            },
            None => CellXfsGroupStats::default(),
        }
    };

    Summary {
        counts,
        rates,
        failures_by_category,
        failures_by_round_trip_failure_kind,
        diff_totals,
        timings,
        round_trip_size_overhead,
        top_diff_parts_critical: top_n(diff_parts_critical),
        top_diff_parts_total: top_n(diff_parts_total),
        top_diff_part_groups_critical: top_n(diff_groups_critical),
        top_diff_part_groups_total: top_n(diff_groups_total),
        top_functions_in_failures: top_n(functions_in_failures),
        top_features_in_failures: top_n(features_in_failures),
        top_diff_fingerprints_in_failures: top_n(fingerprints_in_failures),
        part_change_ratio: dist_stats(part_change_ratios),
        part_change_ratio_critical: dist_stats(part_change_ratios_critical),
        style: StyleComplexity {
            cell_xfs: CellXfsStats {
                passing: xfs_group_stats(passing_xfs),
                failing: xfs_group_stats(failing_xfs),
            },
        },
        top_failing_by_cell_xfs,
    }
}

/// Render the human-readable mirror of `summary.json` (`spec.md` §6.1).
pub fn summary_markdown(summary: &Summary, reports: &[TriageReport]) -> String {
    let mut out = String::new();
    out.push_str("# Triage summary\n\n");

    out.push_str("## Overall\n\n");
    out.push_str(&format!(
        "- total: {}\n- open_ok: {} ({:.1}%)\n- round_trip_ok: {} ({:.1}%)\n",
        summary.counts.total,
        summary.counts.open_ok,
        summary.rates.open * 100.0,
        summary.counts.round_trip_ok,
        summary.rates.round_trip * 100.0,
    ));
    if let Some(rate) = summary.rates.calculate {
        out.push_str(&format!("- calculate_ok: {} ({:.1}%)\n", summary.counts.calculate_ok, rate * 100.0));
    }
    if let Some(rate) = summary.rates.render {
        out.push_str(&format!("- render_ok: {} ({:.1}%)\n", summary.counts.render_ok, rate * 100.0));
    }
    out.push_str(&format!(
        "- diff totals: critical={} warning={} info={}\n\n",
        summary.diff_totals.critical, summary.diff_totals.warning, summary.diff_totals.info
    ));

    out.push_str("## Timings\n\n");
    out.push_str("| step | count | mean_ms | p50_ms | p90_ms | max_ms |\n|---|---|---|---|---|---|\n");
    for &step in TIMED_STEPS {
        if let Some(t) = summary.timings.get(step) {
            out.push_str(&format!(
                "| {} | {} | {:.1} | {:.1} | {:.1} | {:.1} |\n",
                step, t.count, t.mean_ms, t.p50_ms, t.p90_ms, t.max_ms
            ));
        }
    }
    out.push('\n');

    out.push_str("## Round-trip size overhead\n\n");
    match &summary.round_trip_size_overhead {
        Some(o) => out.push_str(&format!(
            "count={} mean={:.3} p50={:.3} p90={:.3} max={:.3} over_1.05={} over_1.10={}\n\n",
            o.count, o.mean, o.p50, o.p90, o.max, o.count_over_1_05, o.count_over_1_10
        )),
        None => out.push_str("no successful round-trips with known input size\n\n"),
    }

    let render_count_list = |title: &str, entries: &[CountEntry], out: &mut String| {
        out.push_str(&format!("### {}\n\n", title));
        if entries.is_empty() {
            out.push_str("(none)\n\n");
            return;
        }
        for entry in entries {
            out.push_str(&format!("- {}: {}\n", entry.key, entry.count));
        }
        out.push('\n');
    };

    out.push_str("## Top diff parts/groups\n\n");
    render_count_list("Parts (CRITICAL)", &summary.top_diff_parts_critical, &mut out);
    render_count_list("Parts (all)", &summary.top_diff_parts_total, &mut out);
    render_count_list("Groups (CRITICAL)", &summary.top_diff_part_groups_critical, &mut out);
    render_count_list("Groups (all)", &summary.top_diff_part_groups_total, &mut out);

    out.push_str("## Part-level change ratio\n\n");
    match &summary.part_change_ratio {
        Some(d) => out.push_str(&format!("all: mean={:.3} p50={:.3} p90={:.3} max={:.3}\n", d.mean, d.p50, d.p90, d.max)),
        None => out.push_str("all: (no parts changed)\n"),
    }
    match &summary.part_change_ratio_critical {
        Some(d) => out.push_str(&format!("critical-only: mean={:.3} p50={:.3} p90={:.3} max={:.3}\n\n", d.mean, d.p50, d.p90, d.max)),
        None => out.push_str("critical-only: (no critical parts changed)\n\n"),
    }

    out.push_str("## Per-workbook\n\n");
    out.push_str("| display_name | open_ok | round_trip_ok | calculate_ok | render_ok | critical | warning | info |\n|---|---|---|---|---|---|---|---|\n");
    for report in reports {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} | {} | {} |\n",
            report.display_name,
            report.result.open_ok,
            report.result.round_trip_ok,
            tri_state_str(report.result.calculate_ok),
            tri_state_str(report.result.render_ok),
            report.result.diff_critical_count,
            report.result.diff_warning_count,
            report.result.diff_info_count,
        ));
    }
    out.push('\n');

    out.push_str("## Failures by category\n\n");
    for (category, count) in &summary.failures_by_category {
        out.push_str(&format!("- {}: {}\n", category, count));
    }
    out.push('\n');

    out.push_str("## Round-trip failures by kind\n\n");
    for (kind, count) in &summary.failures_by_round_trip_failure_kind {
        out.push_str(&format!("- {}: {}\n", kind, count));
    }
    out.push('\n');

    out.push_str("## Top functions/features/fingerprints in failures\n\n");
    render_count_list("Functions", &summary.top_functions_in_failures, &mut out);
    render_count_list("Features", &summary.top_features_in_failures, &mut out);
    render_count_list("Diff fingerprints", &summary.top_diff_fingerprints_in_failures, &mut out);

    out.push_str("## Style complexity\n\n");
    out.push_str(&format!(
        "cellXfs passing: count={} avg={:.1} median={:.1}\n",
        summary.style.cell_xfs.passing.count, summary.style.cell_xfs.passing.avg, summary.style.cell_xfs.passing.median
    ));
    out.push_str(&format!(
        "cellXfs failing: count={} avg={:.1} median={:.1}\n\n",
        summary.style.cell_xfs.failing.count, summary.style.cell_xfs.failing.avg, summary.style.cell_xfs.failing.median
    ));
    out.push_str("top failing by cellXfs:\n");
    for entry in &summary.top_failing_by_cell_xfs {
        out.push_str(&format!("- {}: {}\n", entry.display_name, entry.cell_xfs));
    }

    out
}

fn tri_state_str(t: TriState) -> &'static str {
    match t {
        TriState::True => "true",
        TriState::False => "false",
        TriState::Skipped => "skipped",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendEntry {
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_url: Option<String>,
    pub counts: Counts,
    pub rates: Rates,
    pub diff_totals: DiffTotals,
    pub failures_by_category: BTreeMap<String, usize>,
    pub failures_by_round_trip_failure_kind: BTreeMap<String, usize>,
    pub top_diff_parts: Vec<CountEntry>,
    pub top_diff_part_groups: Vec<CountEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_p50_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_p90_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_trip_p50_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_trip_p90_ms: Option<f64>,
}

const TREND_ABBREV_N: usize = 5;

/// Build the compact entry appended to the trend file for this run
/// (`spec.md` §4.8 "Trend append").
pub fn build_trend_entry(summary: &Summary, timestamp: &str, commit: Option<String>, run_url: Option<String>) -> TrendEntry {
    let mut top_diff_parts = summary.top_diff_parts_total.clone();
    top_diff_parts.truncate(TREND_ABBREV_N);
    let mut top_diff_part_groups = summary.top_diff_part_groups_total.clone();
    top_diff_part_groups.truncate(TREND_ABBREV_N);

    TrendEntry {
        timestamp: timestamp.to_string(),
        commit,
        run_url,
        counts: summary.counts.clone(),
        rates: summary.rates.clone(),
        diff_totals: summary.diff_totals.clone(),
        failures_by_category: summary.failures_by_category.clone(),
        failures_by_round_trip_failure_kind: summary.failures_by_round_trip_failure_kind.clone(),
        top_diff_parts,
        top_diff_part_groups,
        load_p50_ms: summary.timings.get("load").map(|t| t.p50_ms),
        load_p90_ms: summary.timings.get("load").map(|t| t.p90_ms),
        round_trip_p50_ms: summary.timings.get("round_trip").map(|t| t.p50_ms),
        round_trip_p90_ms: summary.timings.get("round_trip").map(|t| t.p90_ms),
    }
}

/// Append `entry` to the JSON-list trend file at `path`, capping it to the
/// last `cap` entries and rewriting it atomically. A trend file that fails
/// to parse is treated as empty — best effort under concurrent CI caching
/// (`spec.md` §4.8).
pub fn append_trend_entry(path: &Path, entry: TrendEntry, cap: usize) -> std::io::Result<()> {
    let mut entries: Vec<TrendEntry> = fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default();
    entries.push(entry);
    if entries.len() > cap {
        let drop = entries.len() - cap;
        entries.drain(0..drop);
    }

    let body = serde_json::to_string_pretty(&entries)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, body)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Evaluate configured timing/rate gates against a computed summary
/// (`spec.md` §4.8 "Gates", §7, §8 invariant 11). `Ok` carries zero or more
/// human-readable regression lines — an empty vec means every configured
/// gate passed. A gate that cannot be evaluated at all (nothing configured,
/// or a gated step has no successful samples) is a [`GateError`], the only
/// condition that exits with status 2 rather than 0/1.
pub fn evaluate_gates(summary: &Summary, config: &TriageConfig) -> Result<Vec<String>, GateError> {
    let mut configured = false;
    let mut regressions = Vec::new();

    if let Some(threshold) = config.gate_load_p90_ms {
        configured = true;
        let timing = summary.timings.get("load").ok_or(GateError::NoSamples { step: "load" })?;
        if timing.p90_ms > threshold {
            regressions.push(format!(
                "TIMING REGRESSION: load p90 {:.1}ms exceeds gate {:.1}ms",
                timing.p90_ms, threshold
            ));
        }
    }
    if let Some(threshold) = config.gate_round_trip_p90_ms {
        configured = true;
        let timing = summary.timings.get("round_trip").ok_or(GateError::NoSamples { step: "round_trip" })?;
        if timing.p90_ms > threshold {
            regressions.push(format!(
                "TIMING REGRESSION: round_trip p90 {:.1}ms exceeds gate {:.1}ms",
                timing.p90_ms, threshold
            ));
        }
    }
    if let Some(min_rate) = config.min_open_rate {
        configured = true;
        if summary.rates.open < min_rate {
            regressions.push(format!("RATE GATE: open rate {:.3} below minimum {:.3}", summary.rates.open, min_rate));
        }
    }
    if let Some(min_rate) = config.min_round_trip_rate {
        configured = true;
        if summary.rates.round_trip < min_rate {
            regressions.push(format!(
                "RATE GATE: round_trip rate {:.3} below minimum {:.3}",
                summary.rates.round_trip, min_rate
            ));
        }
    }
    if let Some(min_rate) = config.min_calc_rate {
        configured = true;
        let rate = summary.rates.calculate.ok_or(GateError::NoSamples { step: "calculate" })?;
        if rate < min_rate {
            regressions.push(format!("RATE GATE: calculate rate {:.3} below minimum {:.3}", rate, min_rate));
        }
    }
    if let Some(min_rate) = config.min_render_rate {
        configured = true;
        let rate = summary.rates.render.ok_or(GateError::NoSamples { step: "render" })?;
        if rate < min_rate {
            regressions.push(format!("RATE GATE: render rate {:.3} below minimum {:.3}", rate, min_rate));
        }
    }

    if !configured {
        return Err(GateError::NoThresholds);
    }
    Ok(regressions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_law_matches_spec_invariant() {
        let values: Vec<f64> = (1..=10).map(|n| (n * 100) as f64).collect();
        assert_eq!(percentile(&values, 0.5), 550.0);
        assert_eq!(percentile(&values, 0.9), 910.0);
    }

    #[test]
    fn percentile_single_sample_returns_itself() {
        assert_eq!(percentile(&[42.0], 0.5), 42.0);
        assert_eq!(percentile(&[42.0], 0.9), 42.0);
    }

    #[test]
    fn top_n_breaks_ties_alphabetically() {
        let mut counts = BTreeMap::new();
        counts.insert("b".to_string(), 2);
        counts.insert("a".to_string(), 2);
        counts.insert("c".to_string(), 1);
        let entries = top_n(counts);
        assert_eq!(entries[0].key, "a");
        assert_eq!(entries[1].key, "b");
        assert_eq!(entries[2].key, "c");
    }

    #[test]
    fn empty_corpus_summary_has_zero_rates() {
        let summary = compute_summary(&[]);
        assert_eq!(summary.counts.total, 0);
        assert_eq!(summary.rates.open, 0.0);
        assert!(summary.rates.calculate.is_none());
    }

    #[test]
    fn trend_append_caps_and_keeps_newest_last() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trend.json");
        std::fs::write(&path, r#"[{"timestamp":"t0","counts":{"total":0,"open_ok":0,"round_trip_ok":0,"calculate_ok":0,"calculate_attempted":0,"render_ok":0,"render_attempted":0},"rates":{"open":0.0,"round_trip":0.0,"calculate":null,"render":null},"diff_totals":{"critical":0,"warning":0,"info":0},"failures_by_category":{},"failures_by_round_trip_failure_kind":{},"top_diff_parts":[],"top_diff_part_groups":[]},{"timestamp":"t1","counts":{"total":0,"open_ok":0,"round_trip_ok":0,"calculate_ok":0,"calculate_attempted":0,"render_ok":0,"render_attempted":0},"rates":{"open":0.0,"round_trip":0.0,"calculate":null,"render":null},"diff_totals":{"critical":0,"warning":0,"info":0},"failures_by_category":{},"failures_by_round_trip_failure_kind":{},"top_diff_parts":[],"top_diff_part_groups":[]},{"timestamp":"t2","counts":{"total":0,"open_ok":0,"round_trip_ok":0,"calculate_ok":0,"calculate_attempted":0,"render_ok":0,"render_attempted":0},"rates":{"open":0.0,"round_trip":0.0,"calculate":null,"render":null},"diff_totals":{"critical":0,"warning":0,"info":0},"failures_by_category":{},"failures_by_round_trip_failure_kind":{},"top_diff_parts":[],"top_diff_part_groups":[]}]"#).unwrap();

        let summary = compute_summary(&[]);
        let entry = build_trend_entry(&summary, "t3", None, None);
        append_trend_entry(&path, entry, 2).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let entries: Vec<TrendEntry> = serde_json::from_str(&text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].timestamp, "t2");
        assert_eq!(entries[1].timestamp, "t3");
    }

    #[test]
    fn trend_append_treats_unparseable_file_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trend.json");
        std::fs::write(&path, "not json").unwrap();
        let summary = compute_summary(&[]);
        let entry = build_trend_entry(&summary, "t0", None, None);
        append_trend_entry(&path, entry, 90).unwrap();
        let entries: Vec<TrendEntry> = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn gate_errors_when_nothing_configured() {
        let summary = compute_summary(&[]);
        let config = TriageConfig::default();
        assert!(matches!(evaluate_gates(&summary, &config), Err(GateError::NoThresholds)));
    }

    #[test]
    fn gate_errors_when_no_samples_for_gated_step() {
        let summary = compute_summary(&[]);
        let mut config = TriageConfig::default();
        config.gate_load_p90_ms = Some(100.0);
        assert!(matches!(evaluate_gates(&summary, &config), Err(GateError::NoSamples { step: "load" })));
    }
}
