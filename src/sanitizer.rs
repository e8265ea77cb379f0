//! Deterministic, privacy-preserving workbook sanitization.
//!
//! Given an [`OpcPackage`], produces a new part map with cell values,
//! document metadata, and external-facing links scrubbed according to
//! [`SanitizeOptions`], plus a [`SanitizeSummary`] naming exactly which parts
//! were dropped or rewritten. The transform is a pure function of
//! `(parts, options)` — no wall-clock, no RNG, no filesystem — so the same
//! input always produces byte-identical output, which is what lets two
//! triage runs on the same corpus be diffed against each other.

use std::collections::{BTreeMap, BTreeSet};

use quick_xml::events::{BytesStart, Event};
use regex::Regex;
use roxmltree::Document;
use sha2::{Digest, Sha256};

use crate::error::SanitizeError;
use crate::opc::{canonicalize_part_name, OpcPackage};
use crate::part_classifier::{classify, PartGroup};
use crate::xml_rewrite::{local_name, rewrite_leaf_text, strip_attribute, strip_elements, stream_transform};

#[derive(Debug, Clone)]
pub struct SanitizeOptions {
    pub redact_cell_values: bool,
    pub hash_strings: bool,
    pub hash_salt: Option<String>,
    pub remove_external_links: bool,
    pub remove_secrets: bool,
    pub scrub_metadata: bool,
    pub rename_sheets: bool,
}

impl Default for SanitizeOptions {
    fn default() -> Self {
        Self {
            redact_cell_values: true,
            hash_strings: false,
            hash_salt: None,
            remove_external_links: true,
            remove_secrets: true,
            scrub_metadata: true,
            rename_sheets: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SanitizeSummary {
    pub removed_parts: Vec<String>,
    pub rewritten_parts: Vec<String>,
}

fn hash_text(value: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b"\0");
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    let hex = digest.iter().map(|b| format!("{:02x}", b)).collect::<String>();
    format!("H_{}", &hex[..16])
}

/// `None` means "leave the text exactly as it is" (no policy configured).
/// Boxed because the two enabled branches are different closure types and
/// there's no single concrete type to return as `impl Fn`.
fn string_policy(options: &SanitizeOptions) -> Option<Box<dyn Fn(&str) -> String + '_>> {
    if options.hash_strings {
        let salt = options.hash_salt.clone().unwrap_or_default();
        Some(Box::new(move |v: &str| hash_text(v, &salt)))
    } else if options.redact_cell_values {
        Some(Box::new(|_: &str| "REDACTED".to_string()))
    } else {
        None
    }
}

/// The literal secret-bearing part names/prefixes named in `spec.md` §4.3
/// `remove_secrets`. These sit outside the general [`PartGroup`] taxonomy
/// (e.g. `docProps/custom.xml` is one specific doc-props part, not the whole
/// group; `customUI/*` isn't classified at all) so they're matched directly
/// rather than by group.
fn is_secret_bearing_part(lower: &str) -> bool {
    lower == "xl/connections.xml"
        || lower.starts_with("xl/querytables/")
        || lower.starts_with("customxml/")
        || lower.starts_with("xl/customxml/")
        || lower == "xl/vbaproject.bin"
        || lower == "xl/vbaprojectsignature.bin"
        || lower.starts_with("xl/printersettings/")
        || lower.starts_with("xl/media/")
        || lower == "docprops/custom.xml"
        || (lower.starts_with("docprops/thumbnail.") && !lower.ends_with('/'))
        || lower.starts_with("customui/")
}

fn is_media_part(lower: &str) -> bool {
    lower.starts_with("xl/media/")
}

/// The sibling `.rels` part for `part_name`, e.g. `xl/connections.xml` ->
/// `xl/_rels/connections.xml.rels`, or `xl/drawings/drawing1.xml` ->
/// `xl/drawings/_rels/drawing1.xml.rels`.
fn sibling_rels_name(part_name: &str) -> String {
    match part_name.rsplit_once('/') {
        Some((dir, base)) => format!("{}/_rels/{}.rels", dir, base),
        None => format!("_rels/{}.rels", part_name),
    }
}

/// Closure over the configured secret/external-link removal sets:
/// (a) sibling `.rels` of a removed part are removed too; (b) when any
/// `xl/media/*` part is removed, the cellImages parts (which would otherwise
/// dangle via `r:embed`) are removed as well (`spec.md` §4.3 step 1, §8 S7).
fn compute_removed_parts(pkg: &OpcPackage, options: &SanitizeOptions) -> BTreeSet<String> {
    let mut removed = BTreeSet::new();

    for name in pkg.names() {
        let lower = name.to_ascii_lowercase();
        let group = classify(name);
        if options.remove_external_links && group == PartGroup::ExternalLinks {
            removed.insert(name.to_string());
        }
        if options.remove_secrets && is_secret_bearing_part(&lower) {
            removed.insert(name.to_string());
        }
    }

    let media_removed = options.remove_secrets && removed.iter().any(|p| is_media_part(&p.to_ascii_lowercase()));
    if media_removed {
        for name in pkg.names() {
            if classify(name) == PartGroup::CellImages {
                removed.insert(name.to_string());
            }
        }
    }

    loop {
        let additions: Vec<String> = removed
            .iter()
            .map(|p| sibling_rels_name(p))
            .filter(|rels| pkg.get(rels).is_some() && !removed.contains(rels))
            .collect();
        if additions.is_empty() {
            break;
        }
        removed.extend(additions);
    }

    removed
}

/// When `rename_sheets` is set, the deterministic `old name -> Sheet<n>`
/// mapping derived from `xl/workbook.xml`'s `<sheet>` declaration order
/// (`spec.md` §4.3 `rename_sheets`).
fn sheet_rename_map(pkg: &OpcPackage, options: &SanitizeOptions) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if !options.rename_sheets {
        return map;
    }
    let Some(bytes) = pkg.get("xl/workbook.xml") else {
        return map;
    };
    let Ok(text) = std::str::from_utf8(bytes) else {
        return map;
    };
    let Ok(doc) = Document::parse(text) else {
        return map;
    };

    let mut index = 0usize;
    for node in doc.descendants() {
        if node.is_element() && node.tag_name().name() == "sheet" {
            if let Some(name) = node.attribute("name") {
                index += 1;
                map.insert(name.to_string(), format!("Sheet{}", index));
            }
        }
    }
    map
}

/// Sanitize every part of `pkg` according to `options`, returning the new
/// part set and a summary of what changed.
pub fn sanitize(
    pkg: &OpcPackage,
    options: &SanitizeOptions,
) -> Result<(BTreeMap<String, Vec<u8>>, SanitizeSummary), SanitizeError> {
    if options.hash_strings && options.hash_salt.as_deref().unwrap_or("").is_empty() {
        return Err(SanitizeError::MissingHashSalt);
    }

    let removed_set = compute_removed_parts(pkg, options);
    let sheet_rename = sheet_rename_map(pkg, options);

    let mut out_parts = BTreeMap::new();
    let mut rewritten_parts: Vec<String> = Vec::new();

    for (name, bytes) in pkg.parts() {
        if removed_set.contains(name) {
            continue;
        }

        let transformed = sanitize_part(name, bytes, options, &removed_set, &sheet_rename, pkg)?;
        match transformed {
            Some(new_bytes) => {
                rewritten_parts.push(name.to_string());
                out_parts.insert(name.to_string(), new_bytes);
            }
            None => {
                out_parts.insert(name.to_string(), bytes.to_vec());
            }
        }
    }

    rewritten_parts.sort();
    let removed_parts: Vec<String> = removed_set.into_iter().collect();
    Ok((
        out_parts,
        SanitizeSummary {
            removed_parts,
            rewritten_parts,
        },
    ))
}

/// Returns `Some(new_bytes)` if `name` was rewritten, `None` if it passes
/// through untouched. Malformed XML in any part is left untouched rather
/// than erroring — the sanitizer must never be the reason a corpus workbook
/// can't be triaged.
fn sanitize_part(
    name: &str,
    bytes: &[u8],
    options: &SanitizeOptions,
    removed_parts: &BTreeSet<String>,
    sheet_rename: &BTreeMap<String, String>,
    pkg: &OpcPackage,
) -> Result<Option<Vec<u8>>, SanitizeError> {
    let group = classify(name);
    let policy = string_policy(options);

    let result: quick_xml::Result<Option<Vec<u8>>> = match group {
        PartGroup::Rels => {
            sanitize_relationships(bytes, name, removed_parts, options.remove_external_links).map(Some)
        }
        PartGroup::ContentTypes => sanitize_content_types(bytes, removed_parts).map(Some),
        PartGroup::SharedStrings => match &policy {
            Some(p) => rewrite_leaf_text(bytes, b"t", p).map(Some),
            None => Ok(None),
        },
        PartGroup::Comments => match &policy {
            Some(p) => rewrite_leaf_text(bytes, b"t", p).map(Some),
            None => Ok(None),
        },
        PartGroup::Charts | PartGroup::Drawings | PartGroup::Tables | PartGroup::Pivot => match &policy {
            Some(p) => rewrite_leaf_text(bytes, b"t", p).map(Some),
            None => Ok(None),
        },
        PartGroup::WorksheetXml | PartGroup::Dialogsheet | PartGroup::Macrosheet => {
            sanitize_worksheet(bytes, options, sheet_rename)
        }
        PartGroup::DocProps if name.ends_with("core.xml") || name.ends_with("app.xml") => {
            if options.scrub_metadata {
                sanitize_doc_props(name, bytes, sheet_rename)
            } else {
                Ok(None)
            }
        }
        PartGroup::CellImages if options.scrub_metadata => sanitize_cell_images_metadata(bytes),
        PartGroup::Vml if options.remove_secrets => sanitize_vml(name, bytes, removed_parts, pkg),
        _ => {
            if name == "xl/workbook.xml" {
                sanitize_workbook(bytes, options, sheet_rename)
            } else {
                Ok(None)
            }
        }
    };

    // Malformed XML in any part is left untouched rather than erroring out
    // the whole sanitize pass. A transform that round-trips to the same
    // bytes (e.g. a .rels file with nothing to redact) doesn't count as
    // "rewritten" either.
    let transformed = result.unwrap_or(None);
    Ok(transformed.filter(|new_bytes| new_bytes.as_slice() != bytes))
}

fn rels_base_dir(rels_part_name: &str) -> String {
    if let Some(idx) = rels_part_name.rfind("/_rels/") {
        rels_part_name[..idx + 1].to_string()
    } else {
        String::new()
    }
}

fn resolve_rel_target(rels_part_name: &str, target: &str) -> Option<String> {
    let target = target.split('#').next().unwrap_or(target);
    if target.is_empty() {
        return None;
    }
    let resolved = if let Some(stripped) = target.strip_prefix('/') {
        stripped.to_string()
    } else {
        format!("{}{}", rels_base_dir(rels_part_name), target)
    };
    canonicalize_part_name(&resolved)
}

fn get_attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name)
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}

fn get_attr_local(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| local_name(a.key.as_ref()) == local)
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}

fn set_attr(e: &BytesStart<'_>, name: &[u8], value: &str) -> BytesStart<'static> {
    let mut out = BytesStart::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
    let mut replaced = false;
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == name {
            out.push_attribute((name, value.as_bytes()));
            replaced = true;
        } else {
            out.push_attribute(attr);
        }
    }
    if !replaced {
        out.push_attribute((name, value.as_bytes()));
    }
    out
}

const REDACTED_EXTERNAL_TARGET: &str = "https://redacted.invalid/";

fn sanitize_relationships(
    xml: &[u8],
    rels_part_name: &str,
    removed_parts: &BTreeSet<String>,
    remove_external_links: bool,
) -> quick_xml::Result<Vec<u8>> {
    stream_transform(xml, |event, writer| {
        if let Event::Empty(e) = &event {
            if local_name(e.name().as_ref()) == b"Relationship" {
                let target_mode = get_attr(e, b"TargetMode");
                let target = get_attr(e, b"Target").unwrap_or_default();

                if target_mode.as_deref() == Some("External") {
                    if remove_external_links && target != REDACTED_EXTERNAL_TARGET {
                        let rewritten = set_attr(e, b"Target", REDACTED_EXTERNAL_TARGET);
                        return writer.write_event(Event::Empty(rewritten));
                    }
                    return writer.write_event(Event::Empty(e.clone()));
                }

                if let Some(resolved) = resolve_rel_target(rels_part_name, &target) {
                    if removed_parts.contains(&resolved) {
                        return Ok(());
                    }
                }
                return writer.write_event(Event::Empty(e.clone()));
            }
        }
        writer.write_event(event)
    })
}

fn sanitize_content_types(xml: &[u8], removed_parts: &BTreeSet<String>) -> quick_xml::Result<Vec<u8>> {
    stream_transform(xml, |event, writer| {
        if let Event::Empty(e) = &event {
            if local_name(e.name().as_ref()) == b"Override" {
                if let Some(part_name) = get_attr(e, b"PartName") {
                    if let Some(canonical) = canonicalize_part_name(&part_name) {
                        if removed_parts.contains(&canonical) {
                            return Ok(());
                        }
                    }
                }
            }
        }
        writer.write_event(event)
    })
}

/// Strip `<v:imagedata>`/rIds whose relationship target was removed (only
/// relevant when `xl/media/*` was removed, per `spec.md` §4.3 "Remove VML
/// `<v:imagedata>` and its rels when media is removed").
fn sanitize_vml(
    name: &str,
    xml: &[u8],
    removed_parts: &BTreeSet<String>,
    pkg: &OpcPackage,
) -> quick_xml::Result<Option<Vec<u8>>> {
    let rels_name = sibling_rels_name(name);
    let Some(rels_bytes) = pkg.get(&rels_name) else {
        return Ok(None);
    };
    let Ok(rels_text) = std::str::from_utf8(rels_bytes) else {
        return Ok(None);
    };
    let Ok(rels_doc) = Document::parse(rels_text) else {
        return Ok(None);
    };

    let mut dangling_ids: BTreeSet<String> = BTreeSet::new();
    for node in rels_doc.descendants() {
        if node.is_element() && node.tag_name().name() == "Relationship" {
            let (Some(id), Some(target)) = (node.attribute("Id"), node.attribute("Target")) else {
                continue;
            };
            if let Some(resolved) = resolve_rel_target(&rels_name, target) {
                if removed_parts.contains(&resolved) {
                    dangling_ids.insert(id.to_string());
                }
            }
        }
    }
    if dangling_ids.is_empty() {
        return Ok(None);
    }

    let mut skip_depth = 0i32;
    let out = stream_transform(xml, |event, writer| {
        if skip_depth > 0 {
            match &event {
                Event::Start(e) if local_name(e.name().as_ref()) == b"imagedata" => skip_depth += 1,
                Event::End(e) if local_name(e.name().as_ref()) == b"imagedata" => skip_depth -= 1,
                _ => {}
            }
            return Ok(());
        }
        if let Event::Empty(e) | Event::Start(e) = &event {
            if local_name(e.name().as_ref()) == b"imagedata" {
                let rid = get_attr_local(e, b"id").or_else(|| get_attr_local(e, b"relid"));
                if rid.map(|id| dangling_ids.contains(&id)).unwrap_or(false) {
                    if matches!(event, Event::Start(_)) {
                        skip_depth = 1;
                    }
                    return Ok(());
                }
            }
        }
        writer.write_event(event)
    })?;
    Ok(Some(out))
}

/// Redacts `cellImages.xml`'s `name`/`description` attributes and its
/// inner text runs (`spec.md` §4.3: "Redact `cellImages.xml` name/
/// description attributes and inner text runs").
fn sanitize_cell_images_metadata(xml: &[u8]) -> quick_xml::Result<Option<Vec<u8>>> {
    let attrs_redacted = stream_transform(xml, |event, writer| match &event {
        Event::Start(e) | Event::Empty(e) => {
            let mut out_tag = BytesStart::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            for attr in e.attributes().flatten() {
                let ln = local_name(attr.key.as_ref());
                if ln.eq_ignore_ascii_case(b"name") || ln.eq_ignore_ascii_case(b"description") {
                    out_tag.push_attribute((attr.key.as_ref(), b"REDACTED".as_slice()));
                } else {
                    out_tag.push_attribute(attr);
                }
            }
            match &event {
                Event::Start(_) => writer.write_event(Event::Start(out_tag)),
                _ => writer.write_event(Event::Empty(out_tag)),
            }
        }
        _ => writer.write_event(event),
    })?;
    let out = rewrite_leaf_text(&attrs_redacted, b"t", |text| {
        if text.trim().is_empty() {
            text.to_string()
        } else {
            "REDACTED".to_string()
        }
    })?;
    Ok(Some(out))
}

fn doc_props_field_lists(name: &str) -> (&'static [&'static [u8]], &'static [&'static [u8]]) {
    if name.ends_with("core.xml") {
        (
            &[b"creator", b"lastModifiedBy", b"title", b"subject", b"description", b"keywords"],
            &[b"created", b"modified"],
        )
    } else {
        (&[b"Company", b"Manager", b"HyperlinkBase"], &[])
    }
}

fn sanitize_doc_props(name: &str, bytes: &[u8], sheet_rename: &BTreeMap<String, String>) -> quick_xml::Result<Option<Vec<u8>>> {
    let (redacted_fields, timestamp_fields): (&[&[u8]], &[&[u8]]) = doc_props_field_lists(name);
    let is_app = name.ends_with("app.xml");

    let mut in_field: Option<Vec<u8>> = None;
    let mut in_title_of_parts = false;
    let mut title_index = 0usize;
    let mut ordered_old_names: Vec<String> = Vec::new();
    if is_app && !sheet_rename.is_empty() {
        let mut by_new: Vec<(String, &String)> = sheet_rename.iter().map(|(old, new)| (new.clone(), old)).collect();
        by_new.sort();
        ordered_old_names = by_new.into_iter().map(|(_, old)| old.clone()).collect();
    }

    let out = stream_transform(bytes, |event, writer| {
        match &event {
            Event::Start(e) => {
                let ln = local_name(e.name().as_ref()).to_vec();
                if redacted_fields.contains(&ln.as_slice()) || timestamp_fields.contains(&ln.as_slice()) {
                    in_field = Some(ln.clone());
                }
                if ln == b"TitlesOfParts" {
                    in_title_of_parts = true;
                    title_index = 0;
                }
                writer.write_event(event)
            }
            Event::End(e) => {
                let ln = local_name(e.name().as_ref()).to_vec();
                let result = writer.write_event(event);
                if in_field.as_deref() == Some(ln.as_slice()) {
                    in_field = None;
                }
                if ln == b"TitlesOfParts" {
                    in_title_of_parts = false;
                }
                result
            }
            Event::Text(t) if in_field.is_some() => {
                let field = in_field.clone().unwrap();
                let replacement = if timestamp_fields.contains(&field.as_slice()) {
                    "1970-01-01T00:00:00Z".to_string()
                } else {
                    "REDACTED".to_string()
                };
                let _ = t;
                writer.write_event(Event::Text(quick_xml::events::BytesText::new(&replacement)))
            }
            Event::Text(t) if in_title_of_parts => {
                let decoded = t.unescape().unwrap_or_default().into_owned();
                let replacement = ordered_old_names
                    .get(title_index)
                    .and_then(|old| sheet_rename.get(old))
                    .cloned()
                    .unwrap_or(decoded);
                title_index += 1;
                writer.write_event(Event::Text(quick_xml::events::BytesText::new(&replacement)))
            }
            _ => writer.write_event(event),
        }
    })?;
    Ok(Some(out))
}

/// `xl/workbook.xml`: external references removal, protection scrubbing, and
/// (if `rename_sheets`) deterministic sheet renaming plus defined-name
/// formula rewriting.
fn sanitize_workbook(xml: &[u8], options: &SanitizeOptions, sheet_rename: &BTreeMap<String, String>) -> quick_xml::Result<Option<Vec<u8>>> {
    let mut current = xml.to_vec();
    let mut changed = false;

    if options.remove_external_links {
        let next = strip_elements(&current, &[b"externalReferences"])?;
        if next != current {
            changed = true;
            current = next;
        }
    }
    if options.remove_secrets {
        let next = strip_elements(&current, &[b"fileSharing", b"workbookProtection"])?;
        if next != current {
            changed = true;
            current = next;
        }
        let next = strip_attribute(&current, b"workbookPr", b"codeName")?;
        if next != current {
            changed = true;
            current = next;
        }
    }
    if options.rename_sheets && !sheet_rename.is_empty() {
        let mut index = 0usize;
        let next = stream_transform(&current, |event, writer| {
            if let Event::Empty(e) | Event::Start(e) = &event {
                if local_name(e.name().as_ref()) == b"sheet" {
                    index += 1;
                    let rewritten = set_attr(e, b"name", &format!("Sheet{}", index));
                    return match &event {
                        Event::Empty(_) => writer.write_event(Event::Empty(rewritten)),
                        _ => writer.write_event(Event::Start(rewritten)),
                    };
                }
            }
            writer.write_event(event)
        })?;
        if next != current {
            changed = true;
            current = next;
        }

        let next = rewrite_leaf_text(&current, b"definedName", |text| rewrite_sheet_references(text, sheet_rename))?;
        if next != current {
            changed = true;
            current = next;
        }
    }

    if changed {
        Ok(Some(current))
    } else {
        Ok(None)
    }
}

/// Sanitize every `<c>` cell in a worksheet part: formulas are preserved
/// verbatim (only their cached `<v>`/inline-string results are dropped),
/// shared-string cells are left alone (the string table carries the
/// redaction), and inline strings / string formula results / literal
/// numbers, booleans and errors are rewritten per `options`. Also scrubs
/// `<sheetProtection>`/`<sheetPr codeName=…>` and, when `rename_sheets` is
/// set, rewrites sheet-qualified references inside formula text.
fn sanitize_worksheet(xml: &[u8], options: &SanitizeOptions, sheet_rename: &BTreeMap<String, String>) -> quick_xml::Result<Option<Vec<u8>>> {
    use quick_xml::{Reader, Writer};
    use std::io::Cursor;

    let policy = string_policy(options);

    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut buf = Vec::new();
    let mut changed = false;

    loop {
        buf.clear();
        let event = reader.read_event_into(&mut buf)?;
        match &event {
            Event::Eof => {
                writer.write_event(event)?;
                break;
            }
            Event::Empty(e) if local_name(e.name().as_ref()) == b"sheetProtection" => {
                changed = true;
            }
            Event::Start(e) if local_name(e.name().as_ref()) == b"sheetProtection" => {
                changed = true;
                let mut depth = 1i32;
                let mut skip_buf = Vec::new();
                loop {
                    skip_buf.clear();
                    let inner = reader.read_event_into(&mut skip_buf)?;
                    match &inner {
                        Event::Start(ie) if local_name(ie.name().as_ref()) == b"sheetProtection" => depth += 1,
                        Event::End(ie) if local_name(ie.name().as_ref()) == b"sheetProtection" => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        Event::Eof => break,
                        _ => {}
                    }
                }
            }
            Event::Empty(e) | Event::Start(e) if local_name(e.name().as_ref()) == b"sheetPr" && get_attr_local(e, b"codeName").is_some() => {
                changed = true;
                let mut out_tag = BytesStart::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                for attr in e.attributes().flatten() {
                    if local_name(attr.key.as_ref()) != b"codeName" {
                        out_tag.push_attribute(attr);
                    }
                }
                match &event {
                    Event::Empty(_) => writer.write_event(Event::Empty(out_tag))?,
                    _ => writer.write_event(Event::Start(out_tag))?,
                }
            }
            Event::Start(e) if local_name(e.name().as_ref()) == b"c" => {
                let cell_start = e.clone().into_owned();
                let t_attr = get_attr(&cell_start, b"t");
                let mut inner: Vec<Event<'static>> = Vec::new();
                let mut inner_buf = Vec::new();
                loop {
                    inner_buf.clear();
                    let inner_event = reader.read_event_into(&mut inner_buf)?;
                    if matches!(&inner_event, Event::End(end) if local_name(end.name().as_ref()) == b"c") {
                        break;
                    }
                    if matches!(inner_event, Event::Eof) {
                        break;
                    }
                    inner.push(inner_event.into_owned());
                }

                let (mut new_inner, cell_changed) = sanitize_cell_body(inner, t_attr.as_deref(), &policy, options.redact_cell_values);
                if cell_changed {
                    changed = true;
                }
                if options.rename_sheets && !sheet_rename.is_empty() {
                    let (renamed, rename_changed) = rewrite_formula_refs_in(new_inner, sheet_rename);
                    new_inner = renamed;
                    if rename_changed {
                        changed = true;
                    }
                }
                writer.write_event(Event::Start(cell_start))?;
                for ev in new_inner {
                    writer.write_event(ev)?;
                }
                writer.write_event(Event::End(quick_xml::events::BytesEnd::new("c")))?;
            }
            _ => {
                writer.write_event(event)?;
            }
        }
    }

    if changed {
        Ok(Some(writer.into_inner().into_inner()))
    } else {
        Ok(None)
    }
}

fn rewrite_formula_refs_in(events: Vec<Event<'static>>, sheet_rename: &BTreeMap<String, String>) -> (Vec<Event<'static>>, bool) {
    let mut changed = false;
    let mut in_formula = false;
    let out = events
        .into_iter()
        .map(|ev| match &ev {
            Event::Start(e) if local_name(e.name().as_ref()) == b"f" => {
                in_formula = true;
                ev
            }
            Event::End(e) if local_name(e.name().as_ref()) == b"f" => {
                in_formula = false;
                ev
            }
            Event::Text(t) if in_formula => {
                let decoded = t.unescape().unwrap_or_default().into_owned();
                let rewritten = rewrite_sheet_references(&decoded, sheet_rename);
                if rewritten != decoded {
                    changed = true;
                }
                Event::Text(quick_xml::events::BytesText::new(&rewritten).into_owned())
            }
            _ => ev,
        })
        .collect();
    (out, changed)
}

fn sheet_ref_re() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"'((?:[^']|'')*)'!|\b([A-Za-z_][A-Za-z0-9_.]*)!").unwrap())
}

/// Identifier-and-quoted-sheet aware substitution of sheet-qualified formula
/// references (`Old!A1`, `'Old Name'!A1`) using `sheet_rename`, preserving
/// escaped apostrophes (`''`) inside quoted sheet names that don't match any
/// renamed sheet (`spec.md` §4.3 `rename_sheets`).
pub fn rewrite_sheet_references(text: &str, sheet_rename: &BTreeMap<String, String>) -> String {
    if sheet_rename.is_empty() {
        return text.to_string();
    }
    sheet_ref_re()
        .replace_all(text, |caps: &regex::Captures| {
            if let Some(quoted) = caps.get(1) {
                let unescaped = quoted.as_str().replace("''", "'");
                match sheet_rename.get(&unescaped) {
                    Some(new_name) => format!("{}!", new_name),
                    None => caps.get(0).unwrap().as_str().to_string(),
                }
            } else if let Some(bare) = caps.get(2) {
                match sheet_rename.get(bare.as_str()) {
                    Some(new_name) => format!("{}!", new_name),
                    None => caps.get(0).unwrap().as_str().to_string(),
                }
            } else {
                caps.get(0).unwrap().as_str().to_string()
            }
        })
        .into_owned()
}

fn sanitize_cell_body(
    events: Vec<Event<'static>>,
    cell_type: Option<&str>,
    policy: &Option<impl Fn(&str) -> String>,
    redact_cell_values: bool,
) -> (Vec<Event<'static>>, bool) {
    let has_formula = events.iter().any(|ev| {
        matches!(ev, Event::Start(e) | Event::Empty(e) if local_name(e.name().as_ref()) == b"f")
    });

    if has_formula {
        return drop_subtrees(events, &[b"v", b"is"]);
    }

    match cell_type {
        Some("inlineStr") => rewrite_text_in(events, b"is", b"t", policy),
        Some("s") => (events, false),
        Some("str") => rewrite_text_in_self(events, b"v", policy),
        _ => rewrite_numeric_value(events, cell_type, redact_cell_values),
    }
}

/// Removes every whole element (start/empty through matching end) in a flat
/// event list whose local name is in `names`. Unlike `xml_rewrite::strip_elements`
/// this operates on an already-buffered `Vec<Event>` (a single cell's body)
/// rather than streaming a full document.
fn drop_subtrees(events: Vec<Event<'static>>, names: &[&[u8]]) -> (Vec<Event<'static>>, bool) {
    let mut out = Vec::with_capacity(events.len());
    let mut skip_depth = 0i32;
    let mut changed = false;

    for ev in events {
        if skip_depth > 0 {
            match &ev {
                Event::Start(e) if names.contains(&local_name(e.name().as_ref())) => skip_depth += 1,
                Event::End(e) if names.contains(&local_name(e.name().as_ref())) => skip_depth -= 1,
                _ => {}
            }
            continue;
        }

        match &ev {
            Event::Empty(e) if names.contains(&local_name(e.name().as_ref())) => {
                changed = true;
                continue;
            }
            Event::Start(e) if names.contains(&local_name(e.name().as_ref())) => {
                skip_depth = 1;
                changed = true;
                continue;
            }
            _ => {}
        }

        out.push(ev);
    }

    (out, changed)
}

fn rewrite_text_in(
    events: Vec<Event<'static>>,
    _container: &[u8],
    leaf: &[u8],
    policy: &Option<impl Fn(&str) -> String>,
) -> (Vec<Event<'static>>, bool) {
    let Some(policy) = policy else { return (events, false) };
    let mut changed = false;
    let mut in_leaf = false;
    let out = events
        .into_iter()
        .map(|ev| match &ev {
            Event::Start(e) if local_name(e.name().as_ref()) == leaf => {
                in_leaf = true;
                ev
            }
            Event::End(e) if local_name(e.name().as_ref()) == leaf => {
                in_leaf = false;
                ev
            }
            Event::Text(t) if in_leaf => {
                changed = true;
                let decoded = t.unescape().unwrap_or_default().into_owned();
                Event::Text(quick_xml::events::BytesText::new(&policy(&decoded)).into_owned())
            }
            _ => ev,
        })
        .collect();
    (out, changed)
}

fn rewrite_text_in_self(
    events: Vec<Event<'static>>,
    leaf: &[u8],
    policy: &Option<impl Fn(&str) -> String>,
) -> (Vec<Event<'static>>, bool) {
    rewrite_text_in(events, leaf, leaf, policy)
}

fn rewrite_numeric_value(
    events: Vec<Event<'static>>,
    cell_type: Option<&str>,
    redact_cell_values: bool,
) -> (Vec<Event<'static>>, bool) {
    if !redact_cell_values {
        return (events, false);
    }
    let replacement = if cell_type == Some("e") { "#N/A" } else { "0" };
    let mut changed = false;
    let mut in_v = false;
    let out = events
        .into_iter()
        .map(|ev| match &ev {
            Event::Start(e) if local_name(e.name().as_ref()) == b"v" => {
                in_v = true;
                ev
            }
            Event::End(e) if local_name(e.name().as_ref()) == b"v" => {
                in_v = false;
                ev
            }
            Event::Text(_) if in_v => {
                changed = true;
                Event::Text(quick_xml::events::BytesText::new(replacement).into_owned())
            }
            _ => ev,
        })
        .collect();
    (out, changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn zip_bytes(parts: &[(&str, &[u8])]) -> Vec<u8> {
        let cursor = std::io::Cursor::new(Vec::new());
        let mut writer = zip::ZipWriter::new(cursor);
        let options = zip::write::FileOptions::<()>::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, bytes) in parts {
            writer.start_file(*name, options).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn hash_strings_without_salt_is_rejected() {
        let options = SanitizeOptions {
            hash_strings: true,
            hash_salt: None,
            ..Default::default()
        };
        let pkg = OpcPackage::open(&zip_bytes(&[("xl/workbook.xml", b"<workbook/>")])).unwrap();
        assert!(matches!(sanitize(&pkg, &options), Err(SanitizeError::MissingHashSalt)));
    }

    #[test]
    fn formula_cell_keeps_formula_and_drops_cached_value() {
        let sheet = br#"<worksheet><sheetData><row r="1"><c r="A1"><f>SUM(B1:B2)</f><v>42</v></c></row></sheetData></worksheet>"#;
        let out = sanitize_worksheet(sheet, &SanitizeOptions::default(), &BTreeMap::new()).unwrap().unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("<f>SUM(B1:B2)</f>"));
        assert!(!s.contains("<v>42</v>"));
    }

    #[test]
    fn plain_numeric_cell_is_zeroed_when_redaction_enabled() {
        let sheet = br#"<worksheet><sheetData><row r="1"><c r="A1"><v>12345</v></c></row></sheetData></worksheet>"#;
        let out = sanitize_worksheet(sheet, &SanitizeOptions::default(), &BTreeMap::new()).unwrap().unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("<v>0</v>"));
    }

    #[test]
    fn shared_string_index_cell_is_left_untouched() {
        let sheet = br#"<worksheet><sheetData><row r="1"><c r="A1" t="s"><v>3</v></c></row></sheetData></worksheet>"#;
        let out = sanitize_worksheet(sheet, &SanitizeOptions::default(), &BTreeMap::new()).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn sheet_protection_is_stripped() {
        let sheet = br#"<worksheet><sheetProtection password="CC"/><sheetData/></worksheet>"#;
        let out = sanitize_worksheet(sheet, &SanitizeOptions::default(), &BTreeMap::new()).unwrap().unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(!s.contains("sheetProtection"));
    }

    #[test]
    fn external_relationship_target_is_redacted() {
        let rels = br#"<Relationships><Relationship Id="rId1" Type="externalLinkedFile" Target="http://internal.example.com/leak" TargetMode="External"/></Relationships>"#;
        let out = sanitize_relationships(rels, "xl/externalLinks/_rels/externalLink1.xml.rels", &Default::default(), true).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains(REDACTED_EXTERNAL_TARGET));
        assert!(!s.contains("internal.example.com"));
    }

    #[test]
    fn relationship_pointing_at_removed_part_is_dropped() {
        let rels = br#"<Relationships><Relationship Id="rId9" Type="connections" Target="connections.xml"/></Relationships>"#;
        let mut removed = BTreeSet::new();
        removed.insert("xl/connections.xml".to_string());
        let out = sanitize_relationships(rels, "xl/_rels/workbook.xml.rels", &removed, true).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(!s.contains("rId9"));
    }

    #[test]
    fn core_properties_are_scrubbed() {
        let core = br#"<cp:coreProperties xmlns:cp="x" xmlns:dc="y"><dc:creator>Jane Doe</dc:creator><cp:lastModifiedBy>Jane Doe</cp:lastModifiedBy></cp:coreProperties>"#;
        let out = sanitize_doc_props("docProps/core.xml", core, &BTreeMap::new()).unwrap().unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(!s.contains("Jane Doe"));
        assert!(s.matches("REDACTED").count() == 2);
    }

    #[test]
    fn secret_closure_removes_cell_images_when_media_removed() {
        let pkg = OpcPackage::open(&zip_bytes(&[
            ("xl/media/image1.png", b"\x89PNG"),
            ("xl/cellImages.xml", br#"<cellImages xmlns:r="r"><cellImage><pic><blipFill><a:blip r:embed="rId1"/></blipFill></pic></cellImage></cellImages>"#),
            ("xl/_rels/cellImages.xml.rels", br#"<Relationships><Relationship Id="rId1" Type="image" Target="media/image1.png"/></Relationships>"#),
        ]))
        .unwrap();
        let (parts, summary) = sanitize(&pkg, &SanitizeOptions::default()).unwrap();
        assert!(!parts.contains_key("xl/media/image1.png"));
        assert!(!parts.contains_key("xl/cellImages.xml"));
        assert!(!parts.contains_key("xl/_rels/cellImages.xml.rels"));
        assert!(summary.removed_parts.contains(&"xl/cellImages.xml".to_string()));
    }

    #[test]
    fn vba_and_printer_settings_are_removed_by_default() {
        let pkg = OpcPackage::open(&zip_bytes(&[
            ("xl/vbaProject.bin", b"VBA"),
            ("xl/printerSettings/printerSettings1.bin", b"PS"),
            ("xl/workbook.xml", b"<workbook/>"),
        ]))
        .unwrap();
        let (parts, _) = sanitize(&pkg, &SanitizeOptions::default()).unwrap();
        assert!(!parts.contains_key("xl/vbaProject.bin"));
        assert!(!parts.contains_key("xl/printerSettings/printerSettings1.bin"));
    }

    #[test]
    fn rename_sheets_rewrites_declaration_and_formula_references() {
        let workbook = br#"<workbook><sheets><sheet name="Budget 2024" sheetId="1" r:id="rId1"/><sheet name="Notes" sheetId="2" r:id="rId2"/></sheets></workbook>"#;
        let pkg = OpcPackage::open(&zip_bytes(&[("xl/workbook.xml", workbook)])).unwrap();
        let options = SanitizeOptions {
            rename_sheets: true,
            ..Default::default()
        };
        let map = sheet_rename_map(&pkg, &options);
        assert_eq!(map.get("Budget 2024"), Some(&"Sheet1".to_string()));
        assert_eq!(map.get("Notes"), Some(&"Sheet2".to_string()));

        let out = sanitize_workbook(workbook, &options, &map).unwrap().unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains(r#"name="Sheet1""#));
        assert!(s.contains(r#"name="Sheet2""#));
        assert!(!s.contains("Budget 2024"));

        let formula = "'Budget 2024'!A1+Notes!B2";
        let rewritten = rewrite_sheet_references(formula, &map);
        assert_eq!(rewritten, "Sheet1!A1+Sheet2!B2");
    }

    #[test]
    fn rewrite_sheet_references_preserves_escaped_apostrophes_in_unmatched_names() {
        let mut map = BTreeMap::new();
        map.insert("Q&A".to_string(), "Sheet1".to_string());
        let formula = "'Q&A'!A1+'O''Brien''s Data'!B2";
        let rewritten = rewrite_sheet_references(formula, &map);
        assert_eq!(rewritten, "Sheet1!A1+'O''Brien''s Data'!B2");
    }

    #[test]
    fn cell_images_metadata_redacts_attributes_and_inner_text_runs() {
        let xml = br#"<etc:cellImages xmlns:etc="http://schemas.microsoft.com/office/spreadsheetml/2021/cellimages"><etc:cellImage><xdr:nvPicPr xmlns:xdr="x"><xdr:cNvPr name="photo.png" description="Alice's headshot"/></xdr:nvPicPr><a:t xmlns:a="a">Alice Example</a:t></etc:cellImage></etc:cellImages>"#;
        let out = sanitize_cell_images_metadata(xml).unwrap().unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(!s.contains("photo.png"));
        assert!(!s.contains("Alice's headshot"));
        assert!(!s.contains("Alice Example"));
        assert!(s.contains(r#"name="REDACTED""#));
        assert!(s.contains(r#"description="REDACTED""#));
        assert!(s.contains("<a:t xmlns:a=\"a\">REDACTED</a:t>"));
    }
}
