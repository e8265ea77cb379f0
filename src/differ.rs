//! Semantic OPC/XML round-trip comparator (`spec.md` §2 "Differ", §4.5).
//!
//! Compares two [`OpcPackage`]s part-by-part: known XML content types are
//! compared as a normalized element tree (namespace-aware, order-insensitive
//! for sibling groups, `Relationship` elements keyed by `Id`); everything
//! else is compared as opaque bytes. Every surviving [`DiffEntry`] carries a
//! structural [fingerprint](DiffEntry::fingerprint) that collides across
//! workbooks with the same *kind* of difference regardless of literal
//! values (different `rId`s, different cell contents), which is what lets
//! the Aggregator roll up diff taxonomy across a whole corpus.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use roxmltree::Document;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::DiffError;
use crate::opc::OpcPackage;
use crate::part_classifier::{classify, PartGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    AttributeChanged,
    AttributeAdded,
    AttributeRemoved,
    TextChanged,
    ChildAdded,
    ChildRemoved,
    ChildReordered,
    ElementAdded,
    ElementRemoved,
    BinaryDiff,
    RelationshipTargetChanged,
    RelationshipAdded,
    RelationshipRemoved,
}

impl DiffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffKind::AttributeChanged => "attribute_changed",
            DiffKind::AttributeAdded => "attribute_added",
            DiffKind::AttributeRemoved => "attribute_removed",
            DiffKind::TextChanged => "text_changed",
            DiffKind::ChildAdded => "child_added",
            DiffKind::ChildRemoved => "child_removed",
            DiffKind::ChildReordered => "child_reordered",
            DiffKind::ElementAdded => "element_added",
            DiffKind::ElementRemoved => "element_removed",
            DiffKind::BinaryDiff => "binary_diff",
            DiffKind::RelationshipTargetChanged => "relationship_target_changed",
            DiffKind::RelationshipAdded => "relationship_added",
            DiffKind::RelationshipRemoved => "relationship_removed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub part: String,
    pub path: String,
    pub kind: DiffKind,
    pub severity: Severity,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailOn {
    Critical,
    Warning,
    Info,
    Any,
}

impl Default for FailOn {
    fn default() -> Self {
        FailOn::Critical
    }
}

impl FailOn {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailOn::Critical => "critical",
            FailOn::Warning => "warning",
            FailOn::Info => "info",
            FailOn::Any => "any",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    pub ignore_part: BTreeSet<String>,
    pub ignore_glob: Vec<String>,
    pub ignore_path: Vec<String>,
    pub ignore_path_in: Vec<(String, String)>,
    pub ignore_path_kind: Vec<String>,
    pub ignore_path_kind_in: Vec<(String, String)>,
    pub ignore_presets: Vec<String>,
    pub strict_calc_chain: bool,
    pub diff_limit: usize,
    pub round_trip_fail_on: FailOn,
}

impl DiffOptions {
    /// The two parts `spec.md` §4.5 names as ignored by default: timestamps
    /// and app metadata that nearly every writer rewrites regardless of
    /// semantic equivalence. `xl/calcChain.xml` is intentionally *not* here
    /// — it's handled by `strict_calc_chain` instead.
    pub fn default_ignore_part() -> BTreeSet<String> {
        ["docProps/core.xml", "docProps/app.xml"]
            .into_iter()
            .map(String::from)
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffCounts {
    pub critical: usize,
    pub warning: usize,
    pub info: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartDiffStat {
    pub part: String,
    pub group: String,
    pub critical: usize,
    pub warning: usize,
    pub info: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartStats {
    pub parts_total: usize,
    pub parts_changed: usize,
    pub parts_changed_critical: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffReport {
    pub equal: bool,
    pub round_trip_ok: bool,
    pub counts: DiffCounts,
    pub parts_with_diffs: Vec<PartDiffStat>,
    pub part_groups: BTreeMap<String, String>,
    pub critical_parts: Vec<String>,
    pub top_differences: Vec<DiffEntry>,
    pub part_stats: PartStats,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn semantic_severity(group: PartGroup) -> Severity {
    match group {
        PartGroup::WorksheetXml
        | PartGroup::SharedStrings
        | PartGroup::Styles
        | PartGroup::ContentTypes
        | PartGroup::Rels
        | PartGroup::Tables
        | PartGroup::Pivot
        | PartGroup::Charts
        | PartGroup::Vba
        | PartGroup::Dialogsheet
        | PartGroup::Macrosheet => Severity::Critical,
        PartGroup::Drawings
        | PartGroup::ExternalLinks
        | PartGroup::Connections
        | PartGroup::CustomXml
        | PartGroup::DocProps
        | PartGroup::Comments
        | PartGroup::CalcChain
        | PartGroup::CellImages
        | PartGroup::Vml => Severity::Warning,
        PartGroup::Media | PartGroup::PrinterSettings | PartGroup::Other => Severity::Info,
    }
}

fn binary_diff_severity(group: PartGroup) -> Severity {
    match group {
        PartGroup::Media | PartGroup::PrinterSettings => Severity::Info,
        PartGroup::Vba => Severity::Critical,
        _ => Severity::Warning,
    }
}

fn missing_part_severity(group: PartGroup) -> Severity {
    match group {
        PartGroup::DocProps | PartGroup::CalcChain => Severity::Warning,
        _ => Severity::Critical,
    }
}

/// Is this a content type the Differ knows how to parse semantically? XML
/// parts that fail to parse fall back to the binary comparison.
fn is_known_xml(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".xml") || name.to_ascii_lowercase().ends_with(".vml")
}

// --- Normalized XML tree -----------------------------------------------

#[derive(Debug, Clone)]
struct Node {
    expanded_name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
    text: String,
}

fn expanded_name(ns_uri: Option<&str>, local: &str) -> String {
    match ns_uri {
        Some(uri) if !uri.is_empty() => format!("{{{}}}{}", uri, local),
        _ => local.to_string(),
    }
}

fn build_node(n: roxmltree::Node) -> Node {
    let tag = n.tag_name();
    let mut attrs: Vec<(String, String)> = n
        .attributes()
        .map(|a| {
            let name = expanded_name(a.namespace(), a.name());
            (name, a.value().to_string())
        })
        .collect();
    attrs.sort();

    let mut children = Vec::new();
    let mut text = String::new();
    for child in n.children() {
        if child.is_element() {
            children.push(build_node(child));
        } else if let Some(t) = child.text() {
            text.push_str(t);
        }
    }

    Node {
        expanded_name: expanded_name(tag.namespace(), tag.name()),
        attrs,
        children,
        text: text.trim().to_string(),
    }
}

fn parse_xml(bytes: &[u8]) -> Option<Node> {
    let text = std::str::from_utf8(bytes).ok()?;
    let doc = Document::parse(text).ok()?;
    Some(build_node(doc.root_element()))
}

fn node_shallow_key(n: &Node) -> (String, Vec<(String, String)>) {
    (n.expanded_name.clone(), n.attrs.clone())
}

fn node_deep_eq(a: &Node, b: &Node) -> bool {
    a.expanded_name == b.expanded_name
        && a.attrs == b.attrs
        && a.text == b.text
        && a.children.len() == b.children.len()
        && a.children.iter().zip(&b.children).all(|(x, y)| node_deep_eq(x, y))
}

fn attr_local(expanded: &str) -> &str {
    expanded.rsplit('}').next().unwrap_or(expanded)
}

// --- Raw diff (before ignore rules) ------------------------------------

struct RawDiff {
    path: String,
    kind: DiffKind,
    severity: Severity,
}

struct PathStep {
    occurrence_by_name: BTreeMap<String, usize>,
}

impl PathStep {
    fn new() -> Self {
        Self {
            occurrence_by_name: BTreeMap::new(),
        }
    }

    fn next_index(&mut self, name: &str) -> usize {
        let counter = self.occurrence_by_name.entry(name.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }
}

fn compare_attrs(path: &str, a: &Node, b: &Node, severity: Severity, out: &mut Vec<RawDiff>) {
    let a_map: BTreeMap<&str, &str> = a.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let b_map: BTreeMap<&str, &str> = b.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let all_keys: BTreeSet<&str> = a_map.keys().chain(b_map.keys()).copied().collect();

    for key in all_keys {
        let attr_path = format!("{}@{}", path, key);
        match (a_map.get(key), b_map.get(key)) {
            (Some(av), Some(bv)) if av != bv => out.push(RawDiff { path: attr_path, kind: DiffKind::AttributeChanged, severity }),
            (Some(_), None) => out.push(RawDiff { path: attr_path, kind: DiffKind::AttributeRemoved, severity }),
            (None, Some(_)) => out.push(RawDiff { path: attr_path, kind: DiffKind::AttributeAdded, severity }),
            _ => {}
        }
    }
}

fn compare_element(path: &str, a: &Node, b: &Node, severity: Severity, out: &mut Vec<RawDiff>) {
    compare_attrs(path, a, b, severity, out);

    if a.text != b.text {
        out.push(RawDiff {
            path: path.to_string(),
            kind: DiffKind::TextChanged,
            severity,
        });
    }

    let mut names: Vec<String> = Vec::new();
    for child in a.children.iter().chain(b.children.iter()) {
        if !names.contains(&child.expanded_name) {
            names.push(child.expanded_name.clone());
        }
    }

    for name in names {
        let a_group: Vec<&Node> = a.children.iter().filter(|c| c.expanded_name == name).collect();
        let b_group: Vec<&Node> = b.children.iter().filter(|c| c.expanded_name == name).collect();
        compare_sibling_group(path, &name, &a_group, &b_group, severity, out);
    }
}

fn compare_sibling_group(parent_path: &str, name: &str, a_group: &[&Node], b_group: &[&Node], severity: Severity, out: &mut Vec<RawDiff>) {
    if attr_local(name) == "Relationship" {
        compare_relationships(parent_path, a_group, b_group, severity, out);
        return;
    }

    if a_group.len() == b_group.len() && a_group.iter().zip(b_group).all(|(x, y)| node_deep_eq(x, y)) {
        return;
    }

    let mut a_keys: Vec<_> = a_group.iter().map(|n| node_shallow_key(n)).collect();
    let mut b_keys: Vec<_> = b_group.iter().map(|n| node_shallow_key(n)).collect();
    a_keys.sort();
    b_keys.sort();

    if a_keys == b_keys {
        // Same shallow shapes, different order: one `child_reordered`, then
        // recurse into matched pairs (by original relative order) to still
        // surface any deeper content differences.
        out.push(RawDiff {
            path: parent_path.to_string(),
            kind: DiffKind::ChildReordered,
            severity: Severity::Warning,
        });
        let mut step = PathStep::new();
        for (a_node, b_node) in a_group.iter().zip(b_group.iter()) {
            let idx = step.next_index(name);
            let child_path = format!("{}/{}[{}]", parent_path, name, idx);
            compare_element(&child_path, a_node, b_node, severity, out);
        }
        return;
    }

    // Multisets differ: pair up matching shallow keys in relative order,
    // recurse on pairs, and emit add/remove for the surplus.
    let mut b_remaining: Vec<&Node> = b_group.to_vec();
    let mut step = PathStep::new();
    for a_node in a_group {
        let key = node_shallow_key(a_node);
        if let Some(pos) = b_remaining.iter().position(|n| node_shallow_key(n) == key) {
            let b_node = b_remaining.remove(pos);
            let idx = step.next_index(name);
            let child_path = format!("{}/{}[{}]", parent_path, name, idx);
            compare_element(&child_path, a_node, b_node, severity, out);
        } else {
            let idx = step.next_index(name);
            out.push(RawDiff {
                path: format!("{}/{}[{}]", parent_path, name, idx),
                kind: DiffKind::ChildRemoved,
                severity,
            });
        }
    }
    for _ in b_remaining {
        let idx = step.next_index(name);
        out.push(RawDiff {
            path: format!("{}/{}[{}]", parent_path, name, idx),
            kind: DiffKind::ChildAdded,
            severity,
        });
    }
}

fn compare_relationships(parent_path: &str, a_group: &[&Node], b_group: &[&Node], severity: Severity, out: &mut Vec<RawDiff>) {
    let key = |n: &Node| n.attrs.iter().find(|(k, _)| attr_local(k) == "Id").map(|(_, v)| v.clone()).unwrap_or_default();
    let a_by_id: BTreeMap<String, &Node> = a_group.iter().map(|n| (key(n), *n)).collect();
    let b_by_id: BTreeMap<String, &Node> = b_group.iter().map(|n| (key(n), *n)).collect();

    let all_ids: BTreeSet<String> = a_by_id.keys().chain(b_by_id.keys()).cloned().collect();
    for id in all_ids {
        let path = format!("{}/Relationship[@Id=\"{}\"]", parent_path, id);
        match (a_by_id.get(&id), b_by_id.get(&id)) {
            (Some(a_node), Some(b_node)) => {
                let a_target = a_node.attrs.iter().find(|(k, _)| attr_local(k) == "Target").map(|(_, v)| v.as_str());
                let b_target = b_node.attrs.iter().find(|(k, _)| attr_local(k) == "Target").map(|(_, v)| v.as_str());
                if a_target != b_target {
                    out.push(RawDiff {
                        path: format!("{}@Target", path),
                        kind: DiffKind::RelationshipTargetChanged,
                        severity,
                    });
                }
                for (attr_name, a_val) in &a_node.attrs {
                    if attr_local(attr_name) == "Target" || attr_local(attr_name) == "Id" {
                        continue;
                    }
                    let b_val = b_node.attrs.iter().find(|(k, _)| k == attr_name).map(|(_, v)| v.as_str());
                    if b_val != Some(a_val.as_str()) {
                        out.push(RawDiff {
                            path: format!("{}@{}", path, attr_name),
                            kind: DiffKind::AttributeChanged,
                            severity,
                        });
                    }
                }
            }
            (Some(_), None) => out.push(RawDiff { path, kind: DiffKind::RelationshipRemoved, severity }),
            (None, Some(_)) => out.push(RawDiff { path, kind: DiffKind::RelationshipAdded, severity }),
            (None, None) => unreachable!(),
        }
    }
}

/// Compare two already-parsed XML documents at `part`'s semantic level.
pub fn diff_xml_parts(part: &str, a_bytes: &[u8], b_bytes: &[u8]) -> Option<Vec<DiffEntry>> {
    let a_tree = parse_xml(a_bytes)?;
    let b_tree = parse_xml(b_bytes)?;
    let group = classify(part);
    let severity = semantic_severity(group);

    let mut raw = Vec::new();
    let root_path = format!("/{}", a_tree.expanded_name);
    compare_element(&root_path, &a_tree, &b_tree, severity, &mut raw);

    Some(
        raw.into_iter()
            .map(|r| DiffEntry {
                part: part.to_string(),
                fingerprint: fingerprint(part, r.kind.as_str(), &r.path, group.as_str()),
                path: r.path,
                kind: r.kind,
                severity: r.severity,
            })
            .collect(),
    )
}

fn canonicalize_path(path: &str) -> String {
    static INDEX_RE: OnceLock<Regex> = OnceLock::new();
    static PREDICATE_RE: OnceLock<Regex> = OnceLock::new();
    let index_re = INDEX_RE.get_or_init(|| Regex::new(r"\[\d+\]").unwrap());
    let predicate_re = PREDICATE_RE.get_or_init(|| Regex::new(r#"\[@([A-Za-z0-9_:.\-]+)="[^"]*"\]"#).unwrap());

    let stripped = predicate_re.replace_all(path, "[@$1=\"\"]");
    index_re.replace_all(&stripped, "[]").into_owned()
}

pub fn fingerprint(part: &str, kind: &str, path: &str, group: &str) -> String {
    let canonical_path = canonicalize_path(path);
    let material = format!("{}\0{}\0{}\0{}", part, kind, canonical_path, group);
    sha256_hex(material.as_bytes())
}

// --- Ignore rules --------------------------------------------------------

fn build_globset(patterns: &[String]) -> Result<GlobSet, DiffError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| DiffError::InvalidGlob {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| DiffError::InvalidGlob {
        pattern: patterns.join(","),
        source,
    })
}

fn preset_tokens(preset: &str) -> &'static [&'static str] {
    match preset {
        "excel-volatile-ids" => &["xr:uid", "dyDescent", "xr2:uid", "xr3:uid"],
        _ => &[],
    }
}

fn is_ignored(entry: &DiffEntry, options: &DiffOptions, part_globset: &GlobSet) -> bool {
    if options.ignore_part.contains(&entry.part) {
        return true;
    }
    if part_globset.is_match(&entry.part) {
        return true;
    }
    if options.ignore_path.iter().any(|token| entry.path.contains(token.as_str())) {
        return true;
    }
    for (glob, token) in &options.ignore_path_in {
        if Glob::new(glob).map(|g| g.compile_matcher().is_match(&entry.part)).unwrap_or(false)
            && entry.path.contains(token.as_str())
        {
            return true;
        }
    }
    for rule in &options.ignore_path_kind {
        if matches_kind_rule(rule, entry) {
            return true;
        }
    }
    for (glob, rule) in &options.ignore_path_kind_in {
        let part_matches = Glob::new(glob).map(|g| g.compile_matcher().is_match(&entry.part)).unwrap_or(false);
        if part_matches && matches_kind_rule(rule, entry) {
            return true;
        }
    }
    for preset in &options.ignore_presets {
        if preset_tokens(preset).iter().any(|token| entry.path.contains(token)) {
            return true;
        }
    }
    false
}

fn matches_kind_rule(rule: &str, entry: &DiffEntry) -> bool {
    match rule.split_once(':') {
        Some((kind, token)) => entry.kind.as_str() == kind && entry.path.contains(token),
        None => entry.kind.as_str() == rule,
    }
}

// --- Full package comparison --------------------------------------------

pub fn compare_packages(a: &OpcPackage, b: &OpcPackage, options: &DiffOptions) -> Result<DiffReport, DiffError> {
    let part_globset = build_globset(&options.ignore_glob)?;

    let a_names: BTreeSet<&str> = a.names().collect();
    let b_names: BTreeSet<&str> = b.names().collect();
    let all_names: BTreeSet<&str> = a_names.union(&b_names).copied().collect();

    let mut entries: Vec<DiffEntry> = Vec::new();
    let mut part_groups: BTreeMap<String, String> = BTreeMap::new();

    for name in all_names {
        let group = classify(name);
        part_groups.insert(name.to_string(), group.as_str().to_string());

        match (a.get(name), b.get(name)) {
            (Some(_), None) => entries.push(whole_part_entry(name, DiffKind::ElementRemoved, missing_part_severity(group), group)),
            (None, Some(_)) => entries.push(whole_part_entry(name, DiffKind::ElementAdded, missing_part_severity(group), group)),
            (Some(a_bytes), Some(b_bytes)) => {
                if a_bytes == b_bytes {
                    continue;
                }
                if is_known_xml(name) {
                    if let Some(diffs) = diff_xml_parts(name, a_bytes, b_bytes) {
                        entries.extend(diffs);
                        continue;
                    }
                }
                entries.push(whole_part_entry(name, DiffKind::BinaryDiff, binary_diff_severity(group), group));
            }
            (None, None) => unreachable!(),
        }
    }

    let mut survivors: Vec<DiffEntry> = entries.into_iter().filter(|e| !is_ignored(e, options, &part_globset)).collect();

    if !options.strict_calc_chain {
        for entry in &mut survivors {
            if classify(&entry.part) == PartGroup::CalcChain {
                entry.severity = downgrade(entry.severity);
            }
        }
    }

    Ok(build_report(survivors, part_groups, options))
}

fn whole_part_entry(part: &str, kind: DiffKind, severity: Severity, group: PartGroup) -> DiffEntry {
    let fp = fingerprint(part, kind.as_str(), "/", group.as_str());
    DiffEntry {
        part: part.to_string(),
        path: "/".to_string(),
        kind,
        severity,
        fingerprint: fp,
    }
}

fn downgrade(severity: Severity) -> Severity {
    match severity {
        Severity::Critical => Severity::Warning,
        Severity::Warning => Severity::Info,
        Severity::Info => Severity::Info,
    }
}

fn build_report(mut survivors: Vec<DiffEntry>, part_groups: BTreeMap<String, String>, options: &DiffOptions) -> DiffReport {
    let mut counts = DiffCounts::default();
    let mut per_part: BTreeMap<String, (usize, usize, usize)> = BTreeMap::new();

    for entry in &survivors {
        match entry.severity {
            Severity::Critical => counts.critical += 1,
            Severity::Warning => counts.warning += 1,
            Severity::Info => counts.info += 1,
        }
        let slot = per_part.entry(entry.part.clone()).or_insert((0, 0, 0));
        match entry.severity {
            Severity::Critical => slot.0 += 1,
            Severity::Warning => slot.1 += 1,
            Severity::Info => slot.2 += 1,
        }
    }
    counts.total = counts.critical + counts.warning + counts.info;

    let mut parts_with_diffs: Vec<PartDiffStat> = per_part
        .into_iter()
        .map(|(part, (critical, warning, info))| PartDiffStat {
            group: part_groups.get(&part).cloned().unwrap_or_else(|| "other".to_string()),
            total: critical + warning + info,
            critical,
            warning,
            info,
            part,
        })
        .collect();
    parts_with_diffs.sort_by(|a, b| b.critical.cmp(&a.critical).then(b.total.cmp(&a.total)).then(a.part.cmp(&b.part)));

    let critical_parts: Vec<String> = parts_with_diffs.iter().filter(|p| p.critical > 0).map(|p| p.part.clone()).collect();

    survivors.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.part.cmp(&b.part)).then(a.path.cmp(&b.path)));
    let top_differences: Vec<DiffEntry> = survivors.iter().take(options.diff_limit).cloned().collect();

    let parts_total = part_groups.len();
    let parts_changed = parts_with_diffs.len();
    let parts_changed_critical = parts_with_diffs.iter().filter(|p| p.critical > 0).count();

    let equal = counts.total == 0;
    let fail_count = match options.round_trip_fail_on {
        FailOn::Critical => counts.critical,
        FailOn::Warning => counts.critical + counts.warning,
        FailOn::Info => counts.critical + counts.warning + counts.info,
        FailOn::Any => counts.total,
    };
    let round_trip_ok = fail_count == 0;

    DiffReport {
        equal,
        round_trip_ok,
        counts,
        parts_with_diffs,
        part_groups,
        critical_parts,
        top_differences,
        part_stats: PartStats {
            parts_total,
            parts_changed,
            parts_changed_critical,
        },
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
    fn identical_packages_are_equal() {
        let zip = zip_bytes(&[("xl/workbook.xml", b"<workbook/>")]);
        let a = OpcPackage::open(&zip).unwrap();
        let b = OpcPackage::open(&zip).unwrap();
        let report = compare_packages(&a, &b, &DiffOptions { diff_limit: 100, ..Default::default() }).unwrap();
        assert!(report.equal);
        assert!(report.round_trip_ok);
    }

    #[test]
    fn reordered_relationships_are_warn_and_pass_default_fail_on() {
        let a_rels = br#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="t1" Target="a.xml"/><Relationship Id="rId2" Type="t2" Target="b.xml"/></Relationships>"#;
        let b_rels = br#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId2" Type="t2" Target="b.xml"/><Relationship Id="rId1" Type="t1" Target="a.xml"/></Relationships>"#;
        let a = OpcPackage::open(&zip_bytes(&[("xl/_rels/workbook.xml.rels", a_rels)])).unwrap();
        let b = OpcPackage::open(&zip_bytes(&[("xl/_rels/workbook.xml.rels", b_rels)])).unwrap();

        let options = DiffOptions { diff_limit: 100, ..Default::default() };
        let report = compare_packages(&a, &b, &options).unwrap();
        assert_eq!(report.counts.warning, 1);
        assert_eq!(report.counts.critical, 0);
        assert!(report.round_trip_ok);

        let strict_warn = DiffOptions { diff_limit: 100, round_trip_fail_on: FailOn::Warning, ..Default::default() };
        let report2 = compare_packages(&a, &b, &strict_warn).unwrap();
        assert!(!report2.round_trip_ok);
    }

    #[test]
    fn calc_chain_diffs_are_downgraded_unless_strict() {
        let a = OpcPackage::open(&zip_bytes(&[("xl/calcChain.xml", br#"<calcChain><c r="A1"/></calcChain>"#)])).unwrap();
        let b = OpcPackage::open(&zip_bytes(&[("xl/calcChain.xml", br#"<calcChain><c r="B2"/></calcChain>"#)])).unwrap();

        let lenient = compare_packages(&a, &b, &DiffOptions { diff_limit: 100, ..Default::default() }).unwrap();
        assert_eq!(lenient.counts.critical, 0);
        assert!(lenient.round_trip_ok);

        let strict = compare_packages(&a, &b, &DiffOptions { diff_limit: 100, strict_calc_chain: true, ..Default::default() }).unwrap();
        assert!(strict.counts.critical > 0 || strict.counts.warning > 0);
    }

    #[test]
    fn fingerprint_ignores_literal_attribute_values() {
        let fp1 = fingerprint("xl/_rels/workbook.xml.rels", "relationship_target_changed", "/Relationships/Relationship[@Id=\"rId1\"]@Target", "rels");
        let fp2 = fingerprint("xl/_rels/workbook.xml.rels", "relationship_target_changed", "/Relationships/Relationship[@Id=\"rId99\"]@Target", "rels");
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn missing_part_in_doc_props_is_warn() {
        let a = OpcPackage::open(&zip_bytes(&[("docProps/core.xml", b"<c/>")])).unwrap();
        let b = OpcPackage::open(&zip_bytes(&[])).unwrap();
        let options = DiffOptions {
            diff_limit: 100,
            ignore_part: BTreeSet::new(),
            ..Default::default()
        };
        let report = compare_packages(&a, &b, &options).unwrap();
        assert_eq!(report.counts.warning, 1);
        assert_eq!(report.counts.critical, 0);
    }
}
