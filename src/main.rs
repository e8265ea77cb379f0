//! Command-line surface for the triage engine (`SPEC_FULL.md` §A).
//!
//! A thin `clap`-derive wrapper over the library crate — every subcommand
//! just gathers argv into the library's own config/option types and calls
//! straight into `xlsx_corpus_triage`. No triage logic lives here.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use xlsx_corpus_triage::collaborators::{ExternalProcess, FunctionCatalog, IdentityRoundTripWriter};
use xlsx_corpus_triage::config::{TriageConfig, TriageConfigOverrides};
use xlsx_corpus_triage::corpus;
use xlsx_corpus_triage::differ::{self, DiffOptions, FailOn};
use xlsx_corpus_triage::error::GateError;
use xlsx_corpus_triage::opc::OpcPackage;
use xlsx_corpus_triage::privacy::PrivacyMode;
use xlsx_corpus_triage::sanitizer::{self, SanitizeOptions};
use xlsx_corpus_triage::triage_runner::Collaborators;

#[derive(Parser)]
#[command(
    name = "xlsx-corpus-triage",
    version,
    about = "Privacy-preserving compatibility triage and round-trip diff engine for OOXML spreadsheet corpora"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full load -> round_trip -> diff -> (recalc) -> (render) pipeline over a corpus directory.
    Triage(TriageArgs),
    /// One-shot semantic OPC diff between two packages on disk.
    Diff(DiffArgs),
    /// Run the Sanitizer over one workbook and write the result plus a JSON summary.
    Sanitize(SanitizeArgs),
    /// Re-evaluate timing/rate gates against an existing summary.json.
    Gate(GateArgs),
}

#[derive(clap::Args)]
struct TriageArgs {
    /// Directory of workbooks to triage.
    #[arg(long)]
    corpus_dir: PathBuf,

    /// Output directory for index.json/reports/summary.*.
    #[arg(long)]
    out_dir: PathBuf,

    /// Path to a JSON file with TriageConfig overrides, layered under any CLI flags given.
    #[arg(long)]
    config: Option<PathBuf>,

    /// public (no redaction) or private (hash identifying strings).
    #[arg(long, value_parser = parse_privacy_mode)]
    privacy_mode: Option<PrivacyMode>,

    /// Worker count for corpus-wide parallelism. Defaults to available parallelism.
    #[arg(long)]
    jobs: Option<usize>,

    /// Maximum number of DiffEntry records retained in top_differences per workbook.
    #[arg(long)]
    diff_limit: Option<usize>,

    /// Severity at/above which a round trip is considered failed: critical|warning|info|any.
    #[arg(long, value_parser = parse_fail_on)]
    round_trip_fail_on: Option<FailOn>,

    /// Don't downgrade xl/calcChain.xml diffs by one severity level.
    #[arg(long)]
    strict_calc_chain: bool,

    /// Exact part name to ignore in the round-trip diff. Repeatable.
    #[arg(long = "ignore-part")]
    ignore_part: Vec<String>,

    /// Glob pattern of part names to ignore in the round-trip diff. Repeatable.
    #[arg(long = "ignore-glob")]
    ignore_glob: Vec<String>,

    /// Path token to suppress anywhere it appears in a diff path. Repeatable.
    #[arg(long = "ignore-path")]
    ignore_path: Vec<String>,

    /// Invoke the optional recalculation step via --calc-cmd.
    #[arg(long)]
    recalc: bool,

    /// Command (program plus args, no shell) implementing the Calculator contract over stdin/stdout.
    #[arg(long, requires = "recalc")]
    calc_cmd: Option<String>,

    /// Invoke the optional headless-render step via --render-cmd.
    #[arg(long)]
    render: bool,

    /// Command (program plus args, no shell) implementing the Renderer contract over stdin/stdout.
    #[arg(long, requires = "render")]
    render_cmd: Option<String>,

    /// Fail the run (exit 1) if the load step's p90 duration exceeds this many milliseconds.
    #[arg(long)]
    gate_load_p90_ms: Option<f64>,

    /// Fail the run (exit 1) if the round_trip step's p90 duration exceeds this many milliseconds.
    #[arg(long)]
    gate_round_trip_p90_ms: Option<f64>,

    /// Append a compact TrendEntry to this JSON-list file.
    #[arg(long)]
    trend_file: Option<String>,

    /// Maximum number of entries retained in the trend file.
    #[arg(long)]
    trend_cap: Option<usize>,

    /// Suppress per-workbook progress lines on stderr.
    #[arg(long)]
    quiet: bool,
}

#[derive(clap::Args)]
struct DiffArgs {
    /// The "before" package.
    original: PathBuf,
    /// The "after" package.
    modified: PathBuf,

    /// Don't downgrade xl/calcChain.xml diffs by one severity level.
    #[arg(long)]
    strict_calc_chain: bool,

    /// Exact part name to ignore. Repeatable.
    #[arg(long = "ignore-part")]
    ignore_part: Vec<String>,

    /// Glob pattern of part names to ignore. Repeatable.
    #[arg(long = "ignore-glob")]
    ignore_glob: Vec<String>,

    /// Path token to suppress anywhere it appears in a diff path. Repeatable.
    #[arg(long = "ignore-path")]
    ignore_path: Vec<String>,

    /// Maximum number of DiffEntry records retained in top_differences.
    #[arg(long, default_value_t = 50)]
    max_diffs: usize,

    /// Severity at/above which the diff is considered a failure for the exit code.
    #[arg(long, value_parser = parse_fail_on, default_value = "critical")]
    round_trip_fail_on: FailOn,

    /// text (human-readable) or json.
    #[arg(long, default_value = "text")]
    format: String,
}

#[derive(clap::Args)]
struct SanitizeArgs {
    /// Input workbook.
    #[arg(long)]
    input: PathBuf,
    /// Output path for the sanitized workbook.
    #[arg(long)]
    output: PathBuf,

    /// Hash shared/inline strings instead of redacting them verbatim. Requires --hash-salt.
    #[arg(long)]
    hash_strings: bool,
    /// Salt mixed into the string hash; required when --hash-strings is set.
    #[arg(long)]
    hash_salt: Option<String>,
    /// Don't replace literal cell values with a structural placeholder.
    #[arg(long)]
    no_redact_cell_values: bool,
    /// Keep xl/externalLinks/* and external relationship targets intact.
    #[arg(long)]
    keep_external_links: bool,
    /// Keep VBA/connections/customXml/printer-settings/media and other secret-bearing parts.
    #[arg(long)]
    keep_secrets: bool,
    /// Don't scrub docProps author/company metadata.
    #[arg(long)]
    no_scrub_metadata: bool,
    /// Rename sheets to Sheet1, Sheet2, ... in declaration order.
    #[arg(long)]
    rename_sheets: bool,
}

#[derive(clap::Args)]
struct GateArgs {
    /// Path to a previously written summary.json.
    #[arg(long)]
    summary_json: PathBuf,

    #[arg(long)]
    gate_load_p90_ms: Option<f64>,
    #[arg(long)]
    gate_round_trip_p90_ms: Option<f64>,
    #[arg(long)]
    min_open_rate: Option<f64>,
    #[arg(long)]
    min_round_trip_rate: Option<f64>,
    #[arg(long)]
    min_calc_rate: Option<f64>,
    #[arg(long)]
    min_render_rate: Option<f64>,
}

fn parse_privacy_mode(s: &str) -> Result<PrivacyMode, String> {
    match s {
        "public" => Ok(PrivacyMode::Public),
        "private" => Ok(PrivacyMode::Private),
        other => Err(format!("invalid privacy mode {other:?} (expected public|private)")),
    }
}

fn parse_fail_on(s: &str) -> Result<FailOn, String> {
    match s {
        "critical" => Ok(FailOn::Critical),
        "warning" => Ok(FailOn::Warning),
        "info" => Ok(FailOn::Info),
        "any" => Ok(FailOn::Any),
        other => Err(format!("invalid round-trip-fail-on {other:?} (expected critical|warning|info|any)")),
    }
}

/// Split a `--calc-cmd`/`--render-cmd` string on whitespace into a program
/// and its arguments. No shell is involved — this is a literal argv, the
/// way the round-trip/calc/render collaborators in `spec.md` §6.2 are
/// described (opaque side processes, not shell pipelines).
fn split_command(command: &str) -> Option<(String, Vec<String>)> {
    let mut parts = command.split_whitespace();
    let program = parts.next()?.to_string();
    Some((program, parts.map(str::to_string).collect()))
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// `commit`/`run_url` come from the environment, not argv (`spec.md` §4.7
/// "Global environment state"): GitHub Actions sets `GITHUB_SHA` and the
/// pieces needed to reconstruct a run URL.
fn commit_and_run_url_from_env() -> (Option<String>, Option<String>) {
    let commit = env_non_empty("GITHUB_SHA");
    let run_url = match (
        env_non_empty("GITHUB_SERVER_URL"),
        env_non_empty("GITHUB_REPOSITORY"),
        env_non_empty("GITHUB_RUN_ID"),
    ) {
        (Some(server), Some(repo), Some(run_id)) => Some(format!("{server}/{repo}/actions/runs/{run_id}")),
        _ => None,
    };
    (commit, run_url)
}

fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match &cli.command {
        Command::Triage(args) => run_triage(args),
        Command::Diff(args) => run_diff(args),
        Command::Sanitize(args) => run_sanitize(args),
        Command::Gate(args) => run_gate(args),
    }
    .unwrap_or_else(|e| {
        eprintln!("error: {e:#}");
        ExitCode::from(2)
    })
}

fn run_triage(args: &TriageArgs) -> anyhow::Result<ExitCode> {
    let base = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => TriageConfig::default(),
    };
    let overrides = TriageConfigOverrides {
        privacy_mode: args.privacy_mode,
        jobs: args.jobs,
        diff_limit: args.diff_limit,
        round_trip_fail_on: args.round_trip_fail_on,
        strict_calc_chain: args.strict_calc_chain,
        ignore_part: args.ignore_part.clone(),
        ignore_glob: args.ignore_glob.clone(),
        ignore_path: args.ignore_path.clone(),
        recalc: args.recalc,
        render: args.render,
        gate_load_p90_ms: args.gate_load_p90_ms,
        gate_round_trip_p90_ms: args.gate_round_trip_p90_ms,
        trend_file: args.trend_file.clone(),
        trend_cap: args.trend_cap,
        quiet: args.quiet,
    };
    let config = base.merged_with(overrides);

    let catalog = FunctionCatalog::builtin();
    let writer = IdentityRoundTripWriter;
    let calculator = args.calc_cmd.as_deref().and_then(split_command).map(|(p, a)| ExternalProcess::new(p, a));
    let renderer = args.render_cmd.as_deref().and_then(split_command).map(|(p, a)| ExternalProcess::new(p, a));
    let collaborators = Collaborators {
        round_trip_writer: &writer,
        calculator: calculator.as_ref().map(|c| c as &dyn xlsx_corpus_triage::collaborators::Calculator),
        renderer: renderer.as_ref().map(|r| r as &dyn xlsx_corpus_triage::collaborators::Renderer),
        function_catalog: &catalog,
    };

    let (commit, run_url) = commit_and_run_url_from_env();
    let timestamp = now_iso();
    let inputs = corpus::discover_inputs(&args.corpus_dir)?;
    if !args.quiet {
        eprintln!("triaging {} workbook(s) from {}", inputs.len(), args.corpus_dir.display());
    }
    let result = corpus::triage_and_write(&inputs, &args.out_dir, &config, &collaborators, &timestamp, commit, run_url)?;

    render_gate_outcome(xlsx_corpus_triage::aggregator::evaluate_gates(&result.summary, &config))
}

fn render_gate_outcome(outcome: Result<Vec<String>, GateError>) -> anyhow::Result<ExitCode> {
    match outcome {
        Ok(regressions) if regressions.is_empty() => Ok(ExitCode::SUCCESS),
        Ok(regressions) => {
            for line in regressions {
                eprintln!("{line}");
            }
            Ok(ExitCode::from(1))
        }
        Err(GateError::NoThresholds) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            eprintln!("TIMING GATE ERROR: {e}");
            Ok(ExitCode::from(2))
        }
    }
}

fn diff_options_from_args(args: &DiffArgs) -> DiffOptions {
    let mut ignore_part = DiffOptions::default_ignore_part();
    ignore_part.extend(args.ignore_part.iter().cloned());
    DiffOptions {
        ignore_part,
        ignore_glob: args.ignore_glob.clone(),
        ignore_path: args.ignore_path.clone(),
        ignore_path_in: Vec::new(),
        ignore_path_kind: Vec::new(),
        ignore_path_kind_in: Vec::new(),
        ignore_presets: Vec::new(),
        strict_calc_chain: args.strict_calc_chain,
        diff_limit: args.max_diffs,
        round_trip_fail_on: args.round_trip_fail_on,
    }
}

fn run_diff(args: &DiffArgs) -> anyhow::Result<ExitCode> {
    let a = OpcPackage::open(&std::fs::read(&args.original)?)?;
    let b = OpcPackage::open(&std::fs::read(&args.modified)?)?;
    let options = diff_options_from_args(args);
    let report = differ::compare_packages(&a, &b, &options)?;

    match args.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&serde_json::to_value(&report)?)?),
        _ => {
            println!(
                "equal={} critical={} warning={} info={}",
                report.equal, report.counts.critical, report.counts.warning, report.counts.info
            );
            for entry in &report.top_differences {
                println!("[{:?}] {} {} ({:?})", entry.severity, entry.part, entry.path, entry.kind);
            }
        }
    }

    Ok(if report.round_trip_ok { ExitCode::SUCCESS } else { ExitCode::from(1) })
}

fn sanitize_options_from_args(args: &SanitizeArgs) -> SanitizeOptions {
    SanitizeOptions {
        redact_cell_values: !args.no_redact_cell_values,
        hash_strings: args.hash_strings,
        hash_salt: args.hash_salt.clone(),
        remove_external_links: !args.keep_external_links,
        remove_secrets: !args.keep_secrets,
        scrub_metadata: !args.no_scrub_metadata,
        rename_sheets: args.rename_sheets,
    }
}

fn run_sanitize(args: &SanitizeArgs) -> anyhow::Result<ExitCode> {
    let pkg = OpcPackage::open(&std::fs::read(&args.input)?)?;
    let options = sanitize_options_from_args(args);
    let (parts, summary) = sanitizer::sanitize(&pkg, &options)?;
    std::fs::write(&args.output, xlsx_corpus_triage::opc::emit_parts(&parts, true))?;
    eprintln!("{}", serde_json::to_string_pretty(&serde_json::to_value(&summary)?)?);
    Ok(ExitCode::SUCCESS)
}

fn run_gate(args: &GateArgs) -> anyhow::Result<ExitCode> {
    let summary = load_summary(&args.summary_json)?;
    let mut config = TriageConfig::default();
    config.gate_load_p90_ms = args.gate_load_p90_ms;
    config.gate_round_trip_p90_ms = args.gate_round_trip_p90_ms;
    config.min_open_rate = args.min_open_rate;
    config.min_round_trip_rate = args.min_round_trip_rate;
    config.min_calc_rate = args.min_calc_rate;
    config.min_render_rate = args.min_render_rate;

    render_gate_outcome(xlsx_corpus_triage::aggregator::evaluate_gates(&summary, &config))
}

fn load_summary(path: &Path) -> Result<xlsx_corpus_triage::aggregator::Summary, GateError> {
    let text = std::fs::read_to_string(path).map_err(|_| GateError::SummaryNotFound(path.to_path_buf()))?;
    Ok(serde_json::from_str(&text)?)
}
