//! Per-workbook pipeline orchestrator (`spec.md` §2 "TriageRunner", §4.7).
//!
//! Drives `load → features → round_trip → diff → (recalc) → (render)` for
//! one workbook. A failing step never aborts the pipeline — later steps run
//! on whatever output is available and the failure is captured into the
//! report's `failure_category`, never propagated as a Rust `Err`.

use std::time::Instant;

use serde_json::json;

use crate::collaborators::{Calculator, FunctionCatalog, Renderer, RoundTripWriter};
use crate::config::TriageConfig;
use crate::differ::{self, DiffOptions};
use crate::feature_extractor;
use crate::opc::OpcPackage;
use crate::privacy::{self, PrivacyMode};
use crate::report::{ReportResult, StepRecord, Steps, TriageReport, TriState};

pub struct WorkbookInput {
    pub display_name: String,
    pub bytes: Vec<u8>,
}

pub struct Collaborators<'a> {
    pub round_trip_writer: &'a dyn RoundTripWriter,
    pub calculator: Option<&'a dyn Calculator>,
    pub renderer: Option<&'a dyn Renderer>,
    pub function_catalog: &'a FunctionCatalog,
}

fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn extension_of(display_name: &str) -> &str {
    display_name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("xlsx")
}

fn diff_options_from_config(config: &TriageConfig) -> DiffOptions {
    let mut ignore_part = differ::DiffOptions::default_ignore_part();
    ignore_part.extend(config.ignore_part.iter().cloned());
    DiffOptions {
        ignore_part,
        ignore_glob: config.ignore_glob.clone(),
        ignore_path: config.ignore_path.clone(),
        ignore_path_in: Vec::new(),
        ignore_path_kind: Vec::new(),
        ignore_path_kind_in: Vec::new(),
        ignore_presets: config.ignore_presets.clone(),
        strict_calc_chain: config.strict_calc_chain,
        diff_limit: config.diff_limit,
        round_trip_fail_on: config.round_trip_fail_on,
    }
}

/// Run the full per-workbook pipeline. `now_iso` supplies the wall-clock
/// timestamp so callers can keep the rest of the report deterministic in
/// tests; `commit`/`run_url` come from the environment (`spec.md` §4.7).
pub fn run(
    input: &WorkbookInput,
    config: &TriageConfig,
    collaborators: &Collaborators,
    now_iso: &str,
    commit: Option<String>,
    run_url: Option<String>,
) -> TriageReport {
    let mode = config.privacy_mode;
    let sha256 = sha256_hex(&input.bytes);
    let size_bytes = input.bytes.len() as u64;

    let display_name = match mode {
        PrivacyMode::Public => input.display_name.clone(),
        PrivacyMode::Private => privacy::private_display_name(&sha256, extension_of(&input.display_name)),
    };
    let run_url = run_url.map(|u| privacy::redact_run_url(mode, &u));

    let mut steps = Steps::default();
    let mut failure_category: Option<String> = None;
    let mut round_trip_failure_kind: Option<String> = None;

    let load_start = Instant::now();
    let pkg = match OpcPackage::open(&input.bytes) {
        Ok(pkg) => {
            steps.load = StepRecord::ok(load_start.elapsed().as_millis() as u64, None);
            pkg
        }
        Err(e) => {
            let error = privacy::redact_error_string(mode, &e.to_string());
            steps.load = StepRecord::failed(Some(load_start.elapsed().as_millis() as u64), error, None);
            return TriageReport {
                display_name,
                sha256,
                size_bytes,
                timestamp: now_iso.to_string(),
                commit,
                run_url,
                features: None,
                functions: Default::default(),
                style_stats: None,
                features_error: None,
                style_stats_error: None,
                cell_images: None,
                steps,
                result: ReportResult {
                    open_ok: false,
                    calculate_ok: TriState::Skipped,
                    render_ok: TriState::Skipped,
                    round_trip_ok: false,
                    diff_critical_count: 0,
                    diff_warning_count: 0,
                    diff_info_count: 0,
                    round_trip_fail_on: config.round_trip_fail_on,
                },
                failure_category: Some("parse_error".to_string()),
                round_trip_failure_kind: None,
            };
        }
    };

    let features_start = Instant::now();
    let extraction = feature_extractor::extract_all(&pkg);
    steps.features = StepRecord::ok(features_start.elapsed().as_millis() as u64, None);
    let style_stats_error = extraction.style_stats_error.map(|e| privacy::redact_error_string(mode, &e));
    // `extract_all` itself never fails (spec.md §4.7 step 2: "errors from this
    // step are non-fatal"); only its `style_stats` sub-parse can report an
    // error, which is distinct from `features_error`.
    let features_error: Option<String> = None;

    let round_trip_start = Instant::now();
    let mut round_trip_ok = true;
    let mut round_trip_bytes: Option<Vec<u8>> = None;
    match collaborators.round_trip_writer.write(&input.bytes) {
        Ok(bytes) => {
            let details = json!({
                "output_size_bytes": bytes.len(),
                "engine": collaborators.round_trip_writer.engine_name(),
            });
            steps.round_trip = StepRecord::ok(round_trip_start.elapsed().as_millis() as u64, Some(details));
            round_trip_bytes = Some(bytes);
        }
        Err(e) => {
            round_trip_ok = false;
            let error = privacy::redact_error_string(mode, &e.to_string());
            steps.round_trip = StepRecord::failed(Some(round_trip_start.elapsed().as_millis() as u64), error, None);
            failure_category = Some("round_trip_error".to_string());
        }
    }

    let mut diff_critical_count = 0;
    let mut diff_warning_count = 0;
    let mut diff_info_count = 0;

    if let Some(round_tripped) = round_trip_bytes.as_ref() {
        let diff_start = Instant::now();
        match OpcPackage::open(round_tripped) {
            Ok(round_tripped_pkg) => {
                let options = diff_options_from_config(config);
                match differ::compare_packages(&pkg, &round_tripped_pkg, &options) {
                    Ok(report) => {
                        diff_critical_count = report.counts.critical;
                        diff_warning_count = report.counts.warning;
                        diff_info_count = report.counts.info;
                        round_trip_ok = report.round_trip_ok;

                        let details = json!({
                            "counts": report.counts,
                            "equal": report.equal,
                            "parts_with_diffs": report.parts_with_diffs,
                            "top_differences": report.top_differences,
                            "critical_parts": report.critical_parts,
                            "part_groups": report.part_groups,
                            "part_stats": report.part_stats,
                        });
                        steps.diff = StepRecord::ok(diff_start.elapsed().as_millis() as u64, Some(details));

                        if !report.equal && !round_trip_ok {
                            failure_category = Some("round_trip_diff".to_string());
                            round_trip_failure_kind = Some(infer_round_trip_failure_kind(&report, &options));
                        }
                    }
                    Err(e) => {
                        round_trip_ok = false;
                        let error = privacy::redact_error_string(mode, &e.to_string());
                        steps.diff = StepRecord::failed(Some(diff_start.elapsed().as_millis() as u64), error, None);
                        failure_category = Some("triage_error".to_string());
                    }
                }
            }
            Err(e) => {
                round_trip_ok = false;
                let error = privacy::redact_error_string(mode, &e.to_string());
                steps.diff = StepRecord::failed(Some(diff_start.elapsed().as_millis() as u64), error, None);
                failure_category = Some("round_trip_error".to_string());
            }
        }
    }

    let mut calculate_ok = TriState::Skipped;
    if config.recalc {
        if let Some(calculator) = collaborators.calculator {
            let recalc_start = Instant::now();
            match round_trip_bytes.as_ref().map(|b| calculator.calculate(b)) {
                Some(Ok(outcome)) => {
                    calculate_ok = TriState::from_bool(outcome.ok);
                    let details = json!({ "mismatches": outcome.mismatches });
                    steps.recalc = StepRecord::ok(recalc_start.elapsed().as_millis() as u64, Some(details));
                    if !outcome.ok && failure_category.is_none() {
                        failure_category = Some("calc_mismatch".to_string());
                    }
                }
                Some(Err(e)) => {
                    calculate_ok = TriState::False;
                    let error = privacy::redact_error_string(mode, &e.to_string());
                    steps.recalc = StepRecord::failed(Some(recalc_start.elapsed().as_millis() as u64), error, None);
                    if failure_category.is_none() {
                        failure_category = Some("calc_mismatch".to_string());
                    }
                }
                None => {
                    steps.recalc = StepRecord::skipped();
                }
            }
        }
    }

    let mut render_ok = TriState::Skipped;
    if config.render {
        if let Some(renderer) = collaborators.renderer {
            let render_start = Instant::now();
            match round_trip_bytes.as_ref().map(|b| renderer.render(b)) {
                Some(Ok(outcome)) => {
                    render_ok = TriState::from_bool(outcome.ok);
                    steps.render = StepRecord::ok(render_start.elapsed().as_millis() as u64, None);
                    if !outcome.ok && failure_category.is_none() {
                        failure_category = Some("render_error".to_string());
                    }
                }
                Some(Err(e)) => {
                    render_ok = TriState::False;
                    let error = privacy::redact_error_string(mode, &e.to_string());
                    steps.render = StepRecord::failed(Some(render_start.elapsed().as_millis() as u64), error, None);
                    if failure_category.is_none() {
                        failure_category = Some("render_error".to_string());
                    }
                }
                None => {
                    steps.render = StepRecord::skipped();
                }
            }
        }
    }

    let functions = extraction
        .functions
        .into_iter()
        .map(|(name, count)| (privacy::redact_function_name(mode, &name, collaborators.function_catalog), count))
        .collect();

    TriageReport {
        display_name,
        sha256,
        size_bytes,
        timestamp: now_iso.to_string(),
        commit,
        run_url,
        features: Some(extraction.features),
        functions,
        style_stats: extraction.style_stats,
        features_error,
        style_stats_error,
        cell_images: extraction.cell_images,
        steps,
        result: ReportResult {
            open_ok: true,
            calculate_ok,
            render_ok,
            round_trip_ok,
            diff_critical_count,
            diff_warning_count,
            diff_info_count,
            round_trip_fail_on: config.round_trip_fail_on,
        },
        failure_category,
        round_trip_failure_kind,
    }
}

fn infer_round_trip_failure_kind(report: &differ::DiffReport, options: &DiffOptions) -> String {
    let threshold = options.round_trip_fail_on;
    let counts_toward_threshold = |stat: &differ::PartDiffStat| -> usize {
        match threshold {
            differ::FailOn::Critical => stat.critical,
            differ::FailOn::Warning => stat.critical + stat.warning,
            differ::FailOn::Info => stat.critical + stat.warning + stat.info,
            differ::FailOn::Any => stat.total,
        }
    };

    // Spec §4.7 step 4: the group of *the part* contributing the most
    // qualifying diffs, ties broken alphabetically by part name.
    report
        .parts_with_diffs
        .iter()
        .map(|stat| (stat.part.clone(), stat.group.clone(), counts_toward_threshold(stat)))
        .filter(|(_, _, count)| *count > 0)
        .max_by(|a, b| a.2.cmp(&b.2).then(b.0.cmp(&a.0)))
        .map(|(_, group, _)| format!("round_trip_{}", group))
        .unwrap_or_else(|| "round_trip_other".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::IdentityRoundTripWriter;
    use std::collections::BTreeMap;
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
    fn identity_round_trip_is_clean() {
        let bytes = zip_bytes(&[("xl/workbook.xml", b"<workbook/>")]);
        let input = WorkbookInput {
            display_name: "book.xlsx".to_string(),
            bytes,
        };
        let config = TriageConfig::default();
        let writer = IdentityRoundTripWriter;
        let catalog = FunctionCatalog::builtin();
        let collaborators = Collaborators {
            round_trip_writer: &writer,
            calculator: None,
            renderer: None,
            function_catalog: &catalog,
        };
        let report = run(&input, &config, &collaborators, "2026-01-01T00:00:00Z", None, None);
        assert!(report.result.open_ok);
        assert!(report.result.round_trip_ok);
        assert!(report.failure_category.is_none());
    }

    #[test]
    fn corrupt_bytes_produce_parse_error() {
        let input = WorkbookInput {
            display_name: "bad.xlsx".to_string(),
            bytes: b"not a zip".to_vec(),
        };
        let config = TriageConfig::default();
        let writer = IdentityRoundTripWriter;
        let catalog = FunctionCatalog::builtin();
        let collaborators = Collaborators {
            round_trip_writer: &writer,
            calculator: None,
            renderer: None,
            function_catalog: &catalog,
        };
        let report = run(&input, &config, &collaborators, "2026-01-01T00:00:00Z", None, None);
        assert!(!report.result.open_ok);
        assert_eq!(report.failure_category.as_deref(), Some("parse_error"));
    }

    #[test]
    fn private_mode_hashes_display_name() {
        let bytes = zip_bytes(&[("xl/workbook.xml", b"<workbook/>")]);
        let input = WorkbookInput {
            display_name: "secret-book.xlsx".to_string(),
            bytes,
        };
        let mut config = TriageConfig::default();
        config.privacy_mode = PrivacyMode::Private;
        let writer = IdentityRoundTripWriter;
        let catalog = FunctionCatalog::builtin();
        let collaborators = Collaborators {
            round_trip_writer: &writer,
            calculator: None,
            renderer: None,
            function_catalog: &catalog,
        };
        let report = run(&input, &config, &collaborators, "2026-01-01T00:00:00Z", None, None);
        assert!(report.display_name.starts_with("workbook-"));
        assert!(!report.display_name.contains("secret"));
    }

    #[test]
    fn round_trip_failure_kind_keys_on_the_single_max_part_not_the_summed_group() {
        // Two `styles`-group parts each contribute 2 criticals (4 total), but
        // a single `rels` part contributes 3 — per spec.md §4.7 step 4 the
        // kind must come from that one part, not the higher group sum.
        let stat = |part: &str, group: &str, critical: usize| differ::PartDiffStat {
            part: part.to_string(),
            group: group.to_string(),
            critical,
            warning: 0,
            info: 0,
            total: critical,
        };
        let report = differ::DiffReport {
            equal: false,
            round_trip_ok: false,
            counts: differ::DiffCounts { critical: 7, warning: 0, info: 0, total: 7 },
            parts_with_diffs: vec![
                stat("xl/styles.xml", "styles", 2),
                stat("xl/styles2.xml", "styles", 2),
                stat("xl/_rels/workbook.xml.rels", "rels", 3),
            ],
            part_groups: BTreeMap::new(),
            critical_parts: Vec::new(),
            top_differences: Vec::new(),
            part_stats: differ::PartStats { parts_total: 3, parts_changed: 3, parts_changed_critical: 3 },
        };
        let options = DiffOptions::default();
        assert_eq!(infer_round_trip_failure_kind(&report, &options), "round_trip_rels");
    }
}
