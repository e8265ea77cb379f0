//! Corpus-wide scheduler: discovers workbook inputs, drives the
//! [`TriageRunner`](crate::triage_runner) across them at bounded
//! parallelism, and writes the persisted output layout (`spec.md` §5,
//! §6.3).
//!
//! The only place wall-clock/process-identity could leak into the output is
//! here — [`run_corpus`] takes `now_iso`/`commit`/`run_url` as plain
//! arguments rather than reading them itself, so the scheduler stays a pure
//! function of `(inputs, config, collaborators, now)` and jobs-invariance
//! (`spec.md` §8 invariant 7) holds regardless of how many worker threads
//! are used.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use rayon::prelude::*;
use serde::Serialize;
use serde_json::json;

use crate::aggregator::{self, Summary};
use crate::config::TriageConfig;
use crate::report::TriageReport;
use crate::triage_runner::{self, Collaborators, WorkbookInput};

const WORKBOOK_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xlsb"];

/// Read every `.xlsx`/`.xlsm`/`.xlsb` file under `root`, recursively.
///
/// `display_name` on each [`WorkbookInput`] is the path relative to `root`
/// with forward slashes — stable and not an absolute filesystem path,
/// satisfying the `WorkbookInput` invariant (`spec.md` §3) while still
/// being useful as the public-mode report identifier. The returned list is
/// the *input order*: a deterministic traversal sorted lexicographically
/// over those relative-path strings (`spec.md` §3 "Corpus").
pub fn discover_inputs(root: &Path) -> io::Result<Vec<WorkbookInput>> {
    let mut relative_paths = Vec::new();
    walk(root, root, &mut relative_paths)?;
    relative_paths.sort();

    relative_paths
        .into_iter()
        .map(|relative| {
            let bytes = fs::read(root.join(&relative))?;
            Ok(WorkbookInput {
                display_name: relative,
                bytes,
            })
        })
        .collect()
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &path, out)?;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        let is_workbook = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| WORKBOOK_EXTENSIONS.iter().any(|w| w.eq_ignore_ascii_case(ext)))
            .unwrap_or(false);
        if !is_workbook {
            continue;
        }
        let relative = path
            .strip_prefix(root)
            .expect("walked path is always inside root")
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        out.push(relative);
    }
    Ok(())
}

/// `(effective_workers, inner_pool_size)` per `spec.md` §5 "Scheduling
/// model"/"Shared resources": the outer pool is capped at
/// `min(requested_jobs, workbook_count)`, and whatever CPU budget remains
/// per outer worker becomes the inner pool size so nested parallel work
/// (e.g. a future data-parallel Differ) doesn't oversubscribe.
fn compute_worker_counts(requested_jobs: usize, workbook_count: usize) -> (usize, usize) {
    let effective = requested_jobs.max(1).min(workbook_count.max(1));
    let cpu_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let inner = (cpu_count / effective).clamp(1, cpu_count);
    (effective, inner)
}

/// The outcome of triaging one corpus: the ordered per-workbook reports,
/// the computed scorecard, and the worker-count metadata `index.json`
/// records.
pub struct CorpusRunResult {
    pub reports: Vec<TriageReport>,
    pub summary: Summary,
    pub jobs_effective: usize,
    pub rayon_num_threads: usize,
}

/// Drive `TriageRunner::run` across every input at bounded parallelism and
/// roll the results into a scorecard.
///
/// Uses a dedicated, capacity-bounded `rayon` thread pool rather than the
/// global pool so concurrent calls (e.g. from tests) don't contend over a
/// process-wide thread count. `par_iter().map(...).collect()` over an
/// indexed slice reassembles results in source order regardless of which
/// worker finishes first — the slot-vector-then-barrier scheme `spec.md`
/// §5 describes, for free from `rayon`'s `IndexedParallelIterator`.
pub fn run_corpus(
    inputs: &[WorkbookInput],
    config: &TriageConfig,
    collaborators: &Collaborators,
    now_iso: &str,
    commit: Option<String>,
    run_url: Option<String>,
) -> CorpusRunResult {
    let (jobs_effective, rayon_num_threads) = compute_worker_counts(config.jobs, inputs.len());

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs_effective)
        .build()
        .expect("a bounded thread pool with a positive thread count always builds");

    let reports: Vec<TriageReport> = pool.install(|| {
        inputs
            .par_iter()
            .map(|input| triage_runner::run(input, config, collaborators, now_iso, commit.clone(), run_url.clone()))
            .collect()
    });

    let summary = aggregator::compute_summary(&reports);

    CorpusRunResult {
        reports,
        summary,
        jobs_effective,
        rayon_num_threads,
    }
}

/// The 16-hex report filename for one workbook, de-collided against every
/// filename already assigned earlier in this run's input order.
///
/// A pure function of `(sha256, prior collisions)` — no wall-clock, no
/// path beyond what the caller folds into `used` — so two runs over an
/// identical, identically-ordered corpus produce identical filenames
/// (`spec.md` §5 "Ordering guarantees").
fn report_filename_for(sha256: &str, used: &mut BTreeMap<String, usize>) -> String {
    let base = &sha256[..16];
    let seen = used.entry(base.to_string()).or_insert(0);
    *seen += 1;
    if *seen == 1 {
        format!("{base}.json")
    } else {
        format!("{base}-{}.json", *seen)
    }
}

fn to_sorted_json_pretty<T: Serialize>(value: &T) -> io::Result<String> {
    // Route every output through `serde_json::Value` (a `BTreeMap`-backed
    // `Map` since this crate doesn't enable `preserve_order`) rather than
    // serializing the typed struct directly: struct derives emit fields in
    // declaration order, but `spec.md` §6.1 requires keys sorted
    // lexicographically, recursively, in every persisted JSON file.
    let value = serde_json::to_value(value).map_err(io::Error::other)?;
    serde_json::to_string_pretty(&value).map_err(io::Error::other)
}

/// Write `reports/<16-hex>.json` for every report, plus `index.json`,
/// `summary.json`, `summary.md`, and (if configured) append a trend entry
/// (`spec.md` §6.1, §6.3).
pub fn write_outputs(
    out_dir: &Path,
    result: &CorpusRunResult,
    config: &TriageConfig,
    now_iso: &str,
    commit: Option<&str>,
    run_url: Option<&str>,
) -> io::Result<()> {
    let reports_dir = out_dir.join("reports");
    fs::create_dir_all(&reports_dir)?;

    let mut used_filenames: BTreeMap<String, usize> = BTreeMap::new();
    let mut index_entries = Vec::with_capacity(result.reports.len());

    for report in &result.reports {
        let filename = report_filename_for(&report.sha256, &mut used_filenames);
        let body = to_sorted_json_pretty(report)?;
        fs::write(reports_dir.join(&filename), body)?;

        let id = filename.trim_end_matches(".json").to_string();
        index_entries.push(json!({
            "id": id,
            "display_name": report.display_name,
            "file": format!("reports/{filename}"),
        }));
    }

    let index = json!({
        "timestamp": now_iso,
        "commit": commit,
        "run_url": run_url,
        "jobs": config.jobs,
        "jobs_effective": result.jobs_effective,
        "rayon_num_threads": result.rayon_num_threads,
        "reports": index_entries,
    });
    fs::write(out_dir.join("index.json"), to_sorted_json_pretty(&index)?)?;
    fs::write(out_dir.join("summary.json"), to_sorted_json_pretty(&result.summary)?)?;
    fs::write(
        out_dir.join("summary.md"),
        aggregator::summary_markdown(&result.summary, &result.reports),
    )?;

    if let Some(trend_path) = &config.trend_file {
        let entry = aggregator::build_trend_entry(
            &result.summary,
            now_iso,
            commit.map(str::to_string),
            run_url.map(str::to_string),
        );
        aggregator::append_trend_entry(Path::new(trend_path), entry, config.trend_cap)?;
    }

    Ok(())
}

/// Convenience entry point combining [`run_corpus`] and [`write_outputs`]
/// for callers (the CLI) that don't need the intermediate result.
pub fn triage_and_write(
    inputs: &[WorkbookInput],
    out_dir: &Path,
    config: &TriageConfig,
    collaborators: &Collaborators,
    now_iso: &str,
    commit: Option<String>,
    run_url: Option<String>,
) -> io::Result<CorpusRunResult> {
    let result = run_corpus(inputs, config, collaborators, now_iso, commit.clone(), run_url.clone());
    write_outputs(out_dir, &result, config, now_iso, commit.as_deref(), run_url.as_deref())?;
    Ok(result)
}

/// Resolve an `--input` path that may be a single workbook file or a
/// corpus directory into the ordered list of `WorkbookInput`s.
pub fn discover_inputs_from_path(input: &Path) -> io::Result<Vec<WorkbookInput>> {
    let metadata = fs::metadata(input)?;
    if metadata.is_dir() {
        discover_inputs(input)
    } else {
        let bytes = fs::read(input)?;
        let display_name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workbook.xlsx".to_string());
        Ok(vec![WorkbookInput { display_name, bytes }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn zip_bytes(parts: &[(&str, &[u8])]) -> Vec<u8> {
        let cursor = std::io::Cursor::new(Vec::new());
        let mut writer = zip::ZipWriter::new(cursor);
        let options = zip::write::FileOptions::<()>::default().compression_method(zip::CompressionMethod::Stored);
        for (name, bytes) in parts {
            writer.start_file(*name, options).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn discover_inputs_orders_lexicographically_by_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("b.xlsx"), zip_bytes(&[("xl/workbook.xml", b"<workbook/>")])).unwrap();
        fs::write(dir.path().join("a.xlsx"), zip_bytes(&[("xl/workbook.xml", b"<workbook/>")])).unwrap();
        fs::write(dir.path().join("nested/a.xlsx"), zip_bytes(&[("xl/workbook.xml", b"<workbook/>")])).unwrap();
        fs::write(dir.path().join("ignore.txt"), b"not a workbook").unwrap();

        let inputs = discover_inputs(dir.path()).unwrap();
        let names: Vec<&str> = inputs.iter().map(|i| i.display_name.as_str()).collect();
        assert_eq!(names, vec!["a.xlsx", "b.xlsx", "nested/a.xlsx"]);
    }

    #[test]
    fn report_filename_deduplicates_identical_content_in_input_order() {
        let mut used = BTreeMap::new();
        let sha = "a".repeat(64);
        let first = report_filename_for(&sha, &mut used);
        let second = report_filename_for(&sha, &mut used);
        let third = report_filename_for(&sha, &mut used);
        assert_eq!(first, "aaaaaaaaaaaaaaaa.json");
        assert_eq!(second, "aaaaaaaaaaaaaaaa-2.json");
        assert_eq!(third, "aaaaaaaaaaaaaaaa-3.json");
    }

    #[test]
    fn worker_counts_never_exceed_workbook_count_or_divide_by_zero() {
        let (effective, inner) = compute_worker_counts(8, 2);
        assert_eq!(effective, 2);
        assert!(inner >= 1);

        let (effective_empty, inner_empty) = compute_worker_counts(8, 0);
        assert_eq!(effective_empty, 1);
        assert!(inner_empty >= 1);
    }

    #[test]
    fn jobs_invariance_produces_identical_reports_for_one_and_many_workers() {
        use crate::collaborators::{FunctionCatalog, IdentityRoundTripWriter};

        let inputs = vec![
            WorkbookInput {
                display_name: "a.xlsx".to_string(),
                bytes: zip_bytes(&[("xl/workbook.xml", b"<workbook/>")]),
            },
            WorkbookInput {
                display_name: "b.xlsx".to_string(),
                bytes: zip_bytes(&[("xl/workbook.xml", b"<workbook x=\"1\"/>")]),
            },
            WorkbookInput {
                display_name: "c.xlsx".to_string(),
                bytes: zip_bytes(&[("xl/workbook.xml", b"<workbook x=\"2\"/>")]),
            },
        ];
        let writer = IdentityRoundTripWriter;
        let catalog = FunctionCatalog::builtin();
        let collaborators = Collaborators {
            round_trip_writer: &writer,
            calculator: None,
            renderer: None,
            function_catalog: &catalog,
        };

        let mut config = TriageConfig::default();
        config.jobs = 1;
        let single = run_corpus(&inputs, &config, &collaborators, "2026-01-01T00:00:00Z", None, None);

        config.jobs = 4;
        let many = run_corpus(&inputs, &config, &collaborators, "2026-01-01T00:00:00Z", None, None);

        let single_json = serde_json::to_string(&single.reports).unwrap();
        let many_json = serde_json::to_string(&many.reports).unwrap();
        assert_eq!(single_json, many_json);
        assert_eq!(single.reports.len(), 3);
    }
}
