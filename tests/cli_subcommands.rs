//! CLI smoke tests for the `triage`/`diff`/`sanitize`/`gate` subcommands,
//! built from in-memory ZIP fixtures the way `xlsx-diff`'s own CLI tests do
//! (`SPEC_FULL.md` §F) — no binary `.xlsx` checked into this repo.

use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::process::Command;

use pretty_assertions::assert_eq;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

fn zip_bytes(parts: &[(&str, &[u8])]) -> Vec<u8> {
    let cursor = Cursor::new(Vec::new());
    let mut writer = ZipWriter::new(cursor);
    let options = FileOptions::<()>::default().compression_method(CompressionMethod::Stored);
    for (name, bytes) in parts {
        writer.start_file(*name, options).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn triage_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_xlsx-corpus-triage"))
}

#[test]
fn triage_over_a_corpus_directory_writes_index_and_summary() {
    let tempdir = tempfile::tempdir().unwrap();
    let corpus_dir = tempdir.path().join("corpus");
    let out_dir = tempdir.path().join("out");
    std::fs::create_dir_all(&corpus_dir).unwrap();

    std::fs::write(
        corpus_dir.join("a.xlsx"),
        zip_bytes(&[("xl/workbook.xml", b"<workbook/>")]),
    )
    .unwrap();
    std::fs::write(
        corpus_dir.join("b.xlsx"),
        zip_bytes(&[("xl/workbook.xml", br#"<workbook x="1"/>"#)]),
    )
    .unwrap();

    let output = Command::new(triage_bin())
        .arg("triage")
        .arg("--corpus-dir")
        .arg(&corpus_dir)
        .arg("--out-dir")
        .arg(&out_dir)
        .output()
        .expect("run xlsx-corpus-triage triage");

    assert!(
        output.status.success(),
        "expected exit 0\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    let index: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out_dir.join("index.json")).unwrap()).unwrap();
    let reports = index["reports"].as_array().unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0]["display_name"], "a.xlsx");
    assert_eq!(reports[1]["display_name"], "b.xlsx");

    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out_dir.join("summary.json")).unwrap()).unwrap();
    assert_eq!(summary["counts"]["total"], 2);
    assert_eq!(summary["counts"]["open_ok"], 2);

    assert!(out_dir.join("summary.md").exists());
}

#[test]
fn triage_over_an_empty_corpus_directory_succeeds_with_zero_reports() {
    let tempdir = tempfile::tempdir().unwrap();
    let corpus_dir = tempdir.path().join("corpus");
    let out_dir = tempdir.path().join("out");
    std::fs::create_dir_all(&corpus_dir).unwrap();

    let output = Command::new(triage_bin())
        .arg("triage")
        .arg("--corpus-dir")
        .arg(&corpus_dir)
        .arg("--out-dir")
        .arg(&out_dir)
        .output()
        .expect("run xlsx-corpus-triage triage");

    assert!(output.status.success());
    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out_dir.join("summary.json")).unwrap()).unwrap();
    assert_eq!(summary["counts"]["total"], 0);
    assert_eq!(summary["rates"]["open"], 0.0);
}

#[test]
fn diff_exits_zero_when_round_trip_is_clean() {
    let tempdir = tempfile::tempdir().unwrap();
    let original = tempdir.path().join("original.xlsx");
    let modified = tempdir.path().join("modified.xlsx");
    let bytes = zip_bytes(&[("xl/workbook.xml", b"<workbook/>")]);
    std::fs::write(&original, &bytes).unwrap();
    std::fs::write(&modified, &bytes).unwrap();

    let output = Command::new(triage_bin())
        .arg("diff")
        .arg(&original)
        .arg(&modified)
        .arg("--format")
        .arg("json")
        .output()
        .expect("run xlsx-corpus-triage diff");

    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_str(&String::from_utf8_lossy(&output.stdout)).unwrap();
    assert_eq!(json["equal"], true);
    assert_eq!(json["round_trip_ok"], true);
}

#[test]
fn diff_exits_one_when_a_critical_part_changes() {
    let tempdir = tempfile::tempdir().unwrap();
    let original = tempdir.path().join("original.xlsx");
    let modified = tempdir.path().join("modified.xlsx");
    std::fs::write(
        &original,
        zip_bytes(&[("xl/worksheets/sheet1.xml", br#"<sheetData a="1"/>"#)]),
    )
    .unwrap();
    std::fs::write(
        &modified,
        zip_bytes(&[("xl/worksheets/sheet1.xml", br#"<sheetData a="2"/>"#)]),
    )
    .unwrap();

    let output = Command::new(triage_bin())
        .arg("diff")
        .arg(&original)
        .arg(&modified)
        .output()
        .expect("run xlsx-corpus-triage diff");

    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn sanitize_redacts_shared_strings_and_writes_summary_to_stderr() {
    let tempdir = tempfile::tempdir().unwrap();
    let input = tempdir.path().join("input.xlsx");
    let output_path = tempdir.path().join("output.xlsx");
    std::fs::write(
        &input,
        zip_bytes(&[(
            "xl/sharedStrings.xml",
            br#"<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><si><t>alice@example.com</t></si></sst>"#,
        )]),
    )
    .unwrap();

    let output = Command::new(triage_bin())
        .arg("sanitize")
        .arg("--input")
        .arg(&input)
        .arg("--output")
        .arg(&output_path)
        .output()
        .expect("run xlsx-corpus-triage sanitize");

    assert!(output.status.success());
    let sanitized = std::fs::read(&output_path).unwrap();
    assert!(!String::from_utf8_lossy(&sanitized).contains("alice@example.com"));

    let summary: serde_json::Value = serde_json::from_str(&String::from_utf8_lossy(&output.stderr)).unwrap();
    assert!(summary["removed_parts"].is_array());
    assert!(summary["rewritten_parts"].is_array());
}

#[test]
fn gate_exits_two_when_no_thresholds_are_configured_and_samples_are_missing() {
    let tempdir = tempfile::tempdir().unwrap();
    let summary_path = tempdir.path().join("summary.json");
    std::fs::write(&summary_path, r#"{"timings": {}}"#).unwrap();

    let output = Command::new(triage_bin())
        .arg("gate")
        .arg("--summary-json")
        .arg(&summary_path)
        .arg("--gate-load-p90-ms")
        .arg("100")
        .output()
        .expect("run xlsx-corpus-triage gate");

    assert_eq!(output.status.code(), Some(2));
}
