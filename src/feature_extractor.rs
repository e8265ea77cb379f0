//! Per-workbook feature, style-complexity and function-usage extraction
//! (`spec.md` §2 "FeatureExtractor", §4.6).

use std::sync::OnceLock;

use regex::Regex;
use roxmltree::Document;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::opc::{canonicalize_part_name, OpcPackage};
use crate::part_classifier::{classify, PartGroup};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Features {
    pub has_charts: bool,
    pub has_drawings: bool,
    pub has_tables: bool,
    pub has_pivot_tables: bool,
    pub has_pivot_cache: bool,
    pub has_external_links: bool,
    pub has_query_tables: bool,
    pub has_printer_settings: bool,
    pub has_custom_xml_root: bool,
    pub has_custom_xml_xl: bool,
    pub has_vba: bool,
    pub has_connections: bool,
    pub has_shared_strings: bool,
    pub has_cell_images: bool,
    pub sheet_xml_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StyleStats {
    #[serde(rename = "numFmts")]
    pub num_fmts: usize,
    pub fonts: usize,
    pub fills: usize,
    pub borders: usize,
    #[serde(rename = "cellStyleXfs")]
    pub cell_style_xfs: usize,
    #[serde(rename = "cellXfs")]
    pub cell_xfs: usize,
    #[serde(rename = "cellStyles")]
    pub cell_styles: usize,
    pub dxfs: usize,
    #[serde(rename = "tableStyles")]
    pub table_styles: usize,
    #[serde(rename = "extLst")]
    pub ext_lst: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellImagesInfo {
    pub part_name: String,
    pub content_type: Option<String>,
    pub workbook_rel_type: Option<String>,
    pub root_local_name: String,
    pub root_namespace: Option<String>,
    pub embed_rids_count: usize,
    pub rels_types: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractionResult {
    pub features: Features,
    pub functions: BTreeMap<String, u64>,
    pub style_stats: Option<StyleStats>,
    pub style_stats_error: Option<String>,
    pub cell_images: Option<CellImagesInfo>,
}

fn part_prefix_present(pkg: &OpcPackage, prefix: &str) -> bool {
    pkg.names().any(|n| n.to_ascii_lowercase().starts_with(prefix))
}

fn is_custom_xml_root(name_lower: &str) -> bool {
    name_lower.starts_with("customxml/") && !name_lower.starts_with("xl/")
}

fn is_custom_xml_xl(name_lower: &str) -> bool {
    name_lower.starts_with("xl/") && name_lower.contains("customxml/")
}

pub fn extract_features(pkg: &OpcPackage) -> Features {
    let mut has_custom_xml_root = false;
    let mut has_custom_xml_xl = false;
    let mut has_printer_settings = false;
    let mut has_connections = false;
    let mut sheet_xml_count = 0usize;
    let mut has_query_tables = false;

    for name in pkg.names() {
        let lower = name.to_ascii_lowercase();
        if lower.starts_with("xl/worksheets/sheet") {
            sheet_xml_count += 1;
        }
        if is_custom_xml_root(&lower) {
            has_custom_xml_root = true;
        }
        if is_custom_xml_xl(&lower) {
            has_custom_xml_xl = true;
        }
        if classify(name) == PartGroup::PrinterSettings {
            has_printer_settings = true;
        }
        if lower.starts_with("xl/connections.xml") {
            has_connections = true;
        }
        if lower.starts_with("xl/querytables/") || lower.contains("querytable") {
            has_query_tables = true;
        }
    }

    Features {
        has_charts: part_prefix_present(pkg, "xl/charts/"),
        has_drawings: part_prefix_present(pkg, "xl/drawings/"),
        has_tables: part_prefix_present(pkg, "xl/tables/"),
        has_pivot_tables: part_prefix_present(pkg, "xl/pivottables/"),
        has_pivot_cache: part_prefix_present(pkg, "xl/pivotcache/"),
        has_external_links: part_prefix_present(pkg, "xl/externallinks/"),
        has_query_tables,
        has_printer_settings,
        has_custom_xml_root,
        has_custom_xml_xl,
        has_vba: pkg.names().any(|n| classify(n) == PartGroup::Vba),
        has_connections,
        has_shared_strings: pkg.get("xl/sharedStrings.xml").is_some(),
        has_cell_images: pkg.names().any(|n| classify(n) == PartGroup::CellImages),
        sheet_xml_count,
    }
}

fn count_attr_or_children(doc: &Document, tag: &str) -> usize {
    for node in doc.descendants() {
        if node.is_element() && node.tag_name().name().eq_ignore_ascii_case(tag) {
            if let Some(count_attr) = node.attribute("count") {
                if let Ok(n) = count_attr.parse::<usize>() {
                    return n;
                }
            }
            return node.children().filter(|c| c.is_element()).count();
        }
    }
    0
}

pub fn extract_style_stats(pkg: &OpcPackage) -> Result<Option<StyleStats>, String> {
    let Some(bytes) = pkg.get("xl/styles.xml") else {
        return Ok(None);
    };
    let text = std::str::from_utf8(bytes).map_err(|e| format!("xl/styles.xml is not utf-8: {}", e))?;
    let doc = Document::parse(text).map_err(|e| format!("xl/styles.xml parse error: {}", e))?;

    Ok(Some(StyleStats {
        num_fmts: count_attr_or_children(&doc, "numFmts"),
        fonts: count_attr_or_children(&doc, "fonts"),
        fills: count_attr_or_children(&doc, "fills"),
        borders: count_attr_or_children(&doc, "borders"),
        cell_style_xfs: count_attr_or_children(&doc, "cellStyleXfs"),
        cell_xfs: count_attr_or_children(&doc, "cellXfs"),
        cell_styles: count_attr_or_children(&doc, "cellStyles"),
        dxfs: count_attr_or_children(&doc, "dxfs"),
        table_styles: count_attr_or_children(&doc, "tableStyles"),
        ext_lst: count_attr_or_children(&doc, "extLst"),
    }))
}

/// Pick the canonical cellImages part among multiple candidates:
/// 1. exact `xl/cellimages.xml` (case-insensitive) wins outright.
/// 2. otherwise the candidate with the smallest numeric suffix.
/// 3. a `.rels`-targeted basename match at the package root beats one nested
///    in a subdirectory.
fn select_cell_images_part<'a>(candidates: &[&'a str]) -> Option<&'a str> {
    if candidates.is_empty() {
        return None;
    }
    if let Some(exact) = candidates.iter().find(|c| c.eq_ignore_ascii_case("xl/cellimages.xml")) {
        return Some(exact);
    }

    static SUFFIX_RE: OnceLock<Regex> = OnceLock::new();
    let re = SUFFIX_RE.get_or_init(|| Regex::new(r"(\d+)(?:\.xml)?$").unwrap());

    let mut best: Option<(&str, u64, usize)> = None;
    for candidate in candidates {
        let suffix: u64 = re
            .captures(candidate)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        let depth = candidate.matches('/').count();
        let better = match best {
            None => true,
            Some((_, best_suffix, best_depth)) => (suffix, depth) < (best_suffix, best_depth),
        };
        if better {
            best = Some((candidate, suffix, depth));
        }
    }
    best.map(|(name, _, _)| name)
}

pub fn extract_cell_images(pkg: &OpcPackage) -> Option<CellImagesInfo> {
    let candidates: Vec<&str> = pkg
        .names()
        .filter(|n| classify(n) == PartGroup::CellImages && n.to_ascii_lowercase().ends_with(".xml"))
        .collect();
    let part_name = select_cell_images_part(&candidates)?;
    let bytes = pkg.get(part_name)?;
    let text = std::str::from_utf8(bytes).ok()?;
    let doc = Document::parse(text).ok()?;
    let root = doc.root_element();

    let mut embed_rids: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    for node in doc.descendants() {
        if !node.is_element() {
            continue;
        }
        for attr in node.attributes() {
            if attr.name() == "embed" {
                embed_rids.insert(attr.value().to_string());
            }
        }
        if node.tag_name().name().eq_ignore_ascii_case("cellImage") {
            if let Some(id_attr) = node.attributes().find(|a| a.name() == "id") {
                embed_rids.insert(id_attr.value().to_string());
            }
        }
    }
    let rels_part = format!(
        "{}_rels/{}.rels",
        part_name.rsplit_once('/').map(|(dir, _)| format!("{}/", dir)).unwrap_or_default(),
        part_name.rsplit('/').next().unwrap_or(part_name)
    );
    let mut rels_types = Vec::new();
    if let Some(rels_bytes) = pkg.get(&rels_part) {
        if let Ok(rels_text) = std::str::from_utf8(rels_bytes) {
            if let Ok(rels_doc) = Document::parse(rels_text) {
                for node in rels_doc.descendants() {
                    if node.is_element() && node.tag_name().name() == "Relationship" {
                        if let Some(t) = node.attribute("Type") {
                            rels_types.push(t.to_string());
                        }
                    }
                }
            }
        }
    }
    rels_types.sort();
    rels_types.dedup();

    Some(CellImagesInfo {
        part_name: part_name.to_string(),
        content_type: resolve_content_type(pkg, part_name),
        workbook_rel_type: resolve_workbook_rel_type(pkg, part_name),
        root_local_name: root.tag_name().name().to_string(),
        root_namespace: root.tag_name().namespace().map(String::from),
        embed_rids_count: embed_rids.len(),
        rels_types,
    })
}

/// The effective content type for `part_name` from `[Content_Types].xml`:
/// an `Override` by exact `PartName` wins; otherwise a `Default` keyed on
/// the part's (case-insensitive) extension.
fn resolve_content_type(pkg: &OpcPackage, part_name: &str) -> Option<String> {
    let bytes = pkg.get("[Content_Types].xml")?;
    let text = std::str::from_utf8(bytes).ok()?;
    let doc = Document::parse(text).ok()?;

    let canonical_target = canonicalize_part_name(part_name)?;
    let mut default_for_extension = None;
    let extension = part_name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());

    for node in doc.root_element().children() {
        if !node.is_element() {
            continue;
        }
        match node.tag_name().name() {
            "Override" => {
                let matches = node
                    .attribute("PartName")
                    .and_then(canonicalize_part_name)
                    .is_some_and(|p| p == canonical_target);
                if matches {
                    return node.attribute("ContentType").map(String::from);
                }
            }
            "Default" => {
                if let (Some(ext), Some(content_type)) = (node.attribute("Extension"), node.attribute("ContentType")) {
                    if Some(ext.to_ascii_lowercase()) == extension {
                        default_for_extension = Some(content_type.to_string());
                    }
                }
            }
            _ => {}
        }
    }
    default_for_extension
}

/// The `Relationship@Type` in `xl/_rels/workbook.xml.rels` whose `Target`
/// resolves to `part_name`, if any (the relationship type Excel uses to
/// reach the cellImages part from the workbook).
fn resolve_workbook_rel_type(pkg: &OpcPackage, part_name: &str) -> Option<String> {
    let rels_bytes = pkg.get("xl/_rels/workbook.xml.rels")?;
    let rels_text = std::str::from_utf8(rels_bytes).ok()?;
    let doc = Document::parse(rels_text).ok()?;

    for node in doc.descendants() {
        if node.is_element() && node.tag_name().name() == "Relationship" {
            let (Some(target), Some(rel_type)) = (node.attribute("Target"), node.attribute("Type")) else {
                continue;
            };
            if resolve_workbook_rel_target(target).as_deref() == Some(part_name) {
                return Some(rel_type.to_string());
            }
        }
    }
    None
}

/// Resolves a `Target` found in `xl/_rels/workbook.xml.rels` against the
/// owning part's directory (`xl/`), per `spec.md` §3's base-resolution rule.
fn resolve_workbook_rel_target(target: &str) -> Option<String> {
    let target = target.split('#').next().unwrap_or(target);
    if target.is_empty() {
        return None;
    }
    let resolved = if let Some(stripped) = target.strip_prefix('/') {
        stripped.to_string()
    } else {
        format!("xl/{}", target)
    };
    canonicalize_part_name(&resolved)
}

/// Replace every `"…"` span (supporting `""` as an escaped quote) with `""`
/// so string literal content never pollutes function-name matching.
fn strip_string_literals(formula: &str) -> String {
    let mut out = String::with_capacity(formula.len());
    let mut chars = formula.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            out.push_str("\"\"");
            loop {
                match chars.next() {
                    Some('"') => {
                        if chars.peek() == Some(&'"') {
                            chars.next();
                            continue;
                        }
                        break;
                    }
                    Some(_) => continue,
                    None => break,
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn function_call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b([A-Z_][A-Z0-9_.]*)\s*\(").unwrap())
}

fn normalize_function_name(raw: &str) -> String {
    let upper = raw.to_ascii_uppercase();
    for prefix in ["_XLFN.", "_XLWS.", "_XLUDF."] {
        if let Some(stripped) = upper.strip_prefix(prefix) {
            return stripped.to_string();
        }
    }
    upper
}

pub fn extract_functions(pkg: &OpcPackage) -> BTreeMap<String, u64> {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();

    for name in pkg.names() {
        if classify(name) != PartGroup::WorksheetXml {
            continue;
        }
        let Some(bytes) = pkg.get(name) else { continue };
        let Ok(text) = std::str::from_utf8(bytes) else { continue };
        let Ok(doc) = Document::parse(text) else { continue };

        for node in doc.descendants() {
            if node.is_element() && node.tag_name().name().eq_ignore_ascii_case("f") {
                let formula: String = node.text().unwrap_or("").to_string();
                let cleaned = strip_string_literals(&formula);
                for caps in function_call_re().captures_iter(&cleaned) {
                    let name = normalize_function_name(&caps[1]);
                    *counts.entry(name).or_insert(0) += 1;
                }
            }
        }
    }

    counts
}

pub fn extract_all(pkg: &OpcPackage) -> ExtractionResult {
    let features = extract_features(pkg);
    let functions = extract_functions(pkg);
    let (style_stats, style_stats_error) = match extract_style_stats(pkg) {
        Ok(stats) => (stats, None),
        Err(e) => (None, Some(e)),
    };
    let cell_images = extract_cell_images(pkg);

    ExtractionResult {
        features,
        functions,
        style_stats,
        style_stats_error,
        cell_images,
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
    fn counts_sheet_xml_and_shared_strings() {
        let pkg = OpcPackage::open(&zip_bytes(&[
            ("xl/worksheets/sheet1.xml", b"<worksheet/>"),
            ("xl/worksheets/sheet2.xml", b"<worksheet/>"),
            ("xl/sharedStrings.xml", b"<sst/>"),
        ]))
        .unwrap();
        let features = extract_features(&pkg);
        assert_eq!(features.sheet_xml_count, 2);
        assert!(features.has_shared_strings);
        assert!(!features.has_charts);
    }

    #[test]
    fn style_stats_prefers_count_attribute() {
        let pkg = OpcPackage::open(&zip_bytes(&[(
            "xl/styles.xml",
            br#"<styleSheet><fonts count="3"><font/></fonts><fills><fill/><fill/></fills></styleSheet>"#,
        )]))
        .unwrap();
        let stats = extract_style_stats(&pkg).unwrap().unwrap();
        assert_eq!(stats.fonts, 3);
        assert_eq!(stats.fills, 2);
    }

    #[test]
    fn functions_strip_string_literals_and_normalize_prefix() {
        let pkg = OpcPackage::open(&zip_bytes(&[(
            "xl/worksheets/sheet1.xml",
            br#"<worksheet><sheetData><row><c><f>_xlfn.SUM(A1,"SUM(fake)")+vlookup(B1,C1)</f></c></row></sheetData></worksheet>"#,
        )]))
        .unwrap();
        let functions = extract_functions(&pkg);
        assert_eq!(functions.get("SUM"), Some(&1));
        assert_eq!(functions.get("VLOOKUP"), Some(&1));
    }

    #[test]
    fn cell_images_selects_canonical_over_numbered_variants() {
        let candidates = vec!["xl/cellimages2.xml", "xl/cellImages.xml", "xl/media/cellimages3.xml"];
        assert_eq!(select_cell_images_part(&candidates), Some("xl/cellImages.xml"));
    }

    #[test]
    fn cell_images_picks_smallest_suffix_when_no_canonical() {
        let candidates = vec!["xl/cellimages3.xml", "xl/cellimages1.xml"];
        assert_eq!(select_cell_images_part(&candidates), Some("xl/cellimages1.xml"));
    }

    #[test]
    fn cell_images_resolves_content_type_and_workbook_rel_type() {
        let pkg = OpcPackage::open(&zip_bytes(&[
            (
                "[Content_Types].xml",
                br#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Override PartName="/xl/cellImages.xml" ContentType="application/vnd.ms-excel.cellimages+xml"/></Types>"#,
            ),
            (
                "xl/_rels/workbook.xml.rels",
                br#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.microsoft.com/office/2021/10/relationships/cellImages" Target="cellImages.xml"/></Relationships>"#,
            ),
            ("xl/cellImages.xml", b"<cellImages/>"),
        ]))
        .unwrap();

        let info = extract_cell_images(&pkg).unwrap();
        assert_eq!(info.part_name, "xl/cellImages.xml");
        assert_eq!(info.content_type.as_deref(), Some("application/vnd.ms-excel.cellimages+xml"));
        assert_eq!(
            info.workbook_rel_type.as_deref(),
            Some("http://schemas.microsoft.com/office/2021/10/relationships/cellImages")
        );
    }
}
