//! Pure, total mapping from a canonical OPC part name to a functional group
//! tag (`spec.md` §3 "PartGroup", §4.2).
//!
//! Matching is case-insensitive (Excel tolerates casing drift, e.g.
//! `CellImages1.XML`), and rules are evaluated in the order listed in
//! `spec.md` — first match wins.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartGroup {
    Rels,
    Styles,
    WorksheetXml,
    SharedStrings,
    ContentTypes,
    DocProps,
    CalcChain,
    Drawings,
    Charts,
    Media,
    CustomXml,
    ExternalLinks,
    Connections,
    Pivot,
    Tables,
    Comments,
    Vba,
    PrinterSettings,
    CellImages,
    Dialogsheet,
    Macrosheet,
    Vml,
    Other,
}

impl PartGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartGroup::Rels => "rels",
            PartGroup::Styles => "styles",
            PartGroup::WorksheetXml => "worksheet_xml",
            PartGroup::SharedStrings => "shared_strings",
            PartGroup::ContentTypes => "content_types",
            PartGroup::DocProps => "doc_props",
            PartGroup::CalcChain => "calc_chain",
            PartGroup::Drawings => "drawings",
            PartGroup::Charts => "charts",
            PartGroup::Media => "media",
            PartGroup::CustomXml => "custom_xml",
            PartGroup::ExternalLinks => "external_links",
            PartGroup::Connections => "connections",
            PartGroup::Pivot => "pivot",
            PartGroup::Tables => "tables",
            PartGroup::Comments => "comments",
            PartGroup::Vba => "vba",
            PartGroup::PrinterSettings => "printer_settings",
            PartGroup::CellImages => "cell_images",
            PartGroup::Dialogsheet => "dialogsheet",
            PartGroup::Macrosheet => "macrosheet",
            PartGroup::Vml => "vml",
            PartGroup::Other => "other",
        }
    }
}

impl std::fmt::Display for PartGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cheap case-insensitive prefix/suffix/exact matcher over a lowercased copy of the name.
fn classify_lower(lower: &str) -> PartGroup {
    if lower.ends_with(".rels") {
        return PartGroup::Rels;
    }
    if lower == "[content_types].xml" {
        return PartGroup::ContentTypes;
    }
    if lower == "xl/styles.xml" {
        return PartGroup::Styles;
    }
    if lower == "xl/calcchain.xml" {
        return PartGroup::CalcChain;
    }
    if lower.starts_with("xl/worksheets/sheet") {
        return PartGroup::WorksheetXml;
    }
    if lower == "xl/sharedstrings.xml" {
        return PartGroup::SharedStrings;
    }
    if lower.starts_with("docprops/") {
        return PartGroup::DocProps;
    }
    if is_cell_images(lower) {
        return PartGroup::CellImages;
    }
    if lower.starts_with("xl/drawings/") {
        // VML drawings (legacy comments/controls) get their own group.
        if lower.ends_with(".vml") {
            return PartGroup::Vml;
        }
        return PartGroup::Drawings;
    }
    if lower.starts_with("xl/charts/") {
        return PartGroup::Charts;
    }
    if lower.starts_with("xl/media/") {
        return PartGroup::Media;
    }
    if lower.starts_with("customxml/") || lower.starts_with("xl/customxml/") {
        return PartGroup::CustomXml;
    }
    if lower.starts_with("xl/externallinks/") {
        return PartGroup::ExternalLinks;
    }
    if lower == "xl/connections.xml" || lower.starts_with("xl/querytables/") {
        return PartGroup::Connections;
    }
    if lower.starts_with("xl/pivot") {
        return PartGroup::Pivot;
    }
    if lower.starts_with("xl/tables/") {
        return PartGroup::Tables;
    }
    if lower.starts_with("xl/comments") && lower.ends_with(".xml") {
        return PartGroup::Comments;
    }
    if lower == "xl/vbaproject.bin" || lower == "xl/vbaprojectsignature.bin" {
        return PartGroup::Vba;
    }
    if lower.starts_with("xl/printersettings/") {
        return PartGroup::PrinterSettings;
    }
    if lower.starts_with("xl/dialogsheets/") {
        return PartGroup::Dialogsheet;
    }
    if lower.starts_with("xl/macrosheets/") {
        return PartGroup::Macrosheet;
    }
    if lower.ends_with(".vml") {
        return PartGroup::Vml;
    }
    PartGroup::Other
}

/// `xl/cellimages*.xml`, `xl/cellImages.xml`, or any `xl/**/cellimages*.xml`, case-insensitive.
pub fn is_cell_images(lower: &str) -> bool {
    if !lower.starts_with("xl/") || !lower.ends_with(".xml") {
        return false;
    }
    let basename = lower.rsplit('/').next().unwrap_or(lower);
    basename.starts_with("cellimages")
}

pub fn classify(part_name: &str) -> PartGroup {
    classify_lower(&part_name.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rels_suffix_wins_first() {
        assert_eq!(classify("xl/worksheets/_rels/sheet1.xml.rels"), PartGroup::Rels);
    }

    #[test]
    fn case_insensitive_cell_images_in_nested_dir() {
        assert_eq!(classify("XL/DRAWINGS/CellImages1.XML"), PartGroup::CellImages);
        assert_eq!(classify("xl/cellImages.xml"), PartGroup::CellImages);
    }

    #[test]
    fn worksheet_xml_prefix_case_insensitive() {
        assert_eq!(classify("XL/WORKSHEETS/SHEET1.XML"), PartGroup::WorksheetXml);
    }

    #[test]
    fn unknown_part_is_other() {
        assert_eq!(classify("xl/theme/theme1.xml"), PartGroup::Other);
    }

    #[test]
    fn calc_chain_exact_match_only() {
        assert_eq!(classify("xl/calcChain.xml"), PartGroup::CalcChain);
        assert_ne!(classify("xl/calcChainOther.xml"), PartGroup::CalcChain);
    }
}
