//! Immutable view over a ZIP-packed Open Packaging Conventions (OPC) archive.
//!
//! Part names are normalized (case preserved, backslashes folded to forward
//! slashes, one leading slash stripped, `..` segments resolved without
//! escaping the package root) but lookups remain case-sensitive on the
//! normalized form — callers that need Excel's tolerant case-insensitive
//! matching (the classifier, the feature scanner) do that matching
//! themselves.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use crate::error::OpcError;

/// A normalized OPC part name: forward-slash separated, no leading slash,
/// no `.` or `..` segments, case preserved.
pub fn canonicalize_part_name(name: &str) -> Option<String> {
    let unified = name.replace('\\', "/");
    let trimmed = unified.strip_prefix('/').unwrap_or(&unified);

    let mut stack: Vec<&str> = Vec::new();
    for segment in trimmed.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if stack.pop().is_none() {
                    return None;
                }
            }
            other => stack.push(other),
        }
    }

    if stack.is_empty() {
        return None;
    }
    Some(stack.join("/"))
}

/// An immutable, in-memory OPC package: canonical part name -> raw bytes.
///
/// `BTreeMap` gives us the deterministic, lexicographically sorted part
/// order `emit` needs for free.
#[derive(Debug, Clone, Default)]
pub struct OpcPackage {
    parts: BTreeMap<String, Vec<u8>>,
}

impl OpcPackage {
    /// Parse a ZIP archive into an `OpcPackage`.
    ///
    /// Directory entries are skipped. When two entries canonicalize to the
    /// same part name, the *last* one encountered wins, matching the
    /// tolerant behavior real-world OOXML consumers exhibit. Zip-slip
    /// entries (post-canonical name empty or escaping the package root) are
    /// rejected.
    pub fn open(bytes: &[u8]) -> Result<Self, OpcError> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
        let mut parts = BTreeMap::new();

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let raw_name = entry.name().to_string();
            let canonical = canonicalize_part_name(&raw_name)
                .ok_or_else(|| OpcError::ZipSlip(raw_name.clone()))?;

            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;
            parts.insert(canonical, buf);
        }

        Ok(Self { parts })
    }

    pub fn parts(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.parts.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.parts.get(name).map(|v| v.as_slice())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.parts.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn into_map(self) -> BTreeMap<String, Vec<u8>> {
        self.parts
    }

    pub fn as_map(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.parts
    }

    /// Re-emit this package as a new ZIP archive.
    ///
    /// Entries are written in canonical-name sort order; when
    /// `normalize_timestamps` is set every entry's modification time is
    /// fixed to 1980-01-01T00:00:00Z so the output bytes are a pure
    /// function of the part set (no wall-clock, no filesystem metadata).
    pub fn emit(&self, normalize_timestamps: bool) -> Vec<u8> {
        emit_parts(&self.parts, normalize_timestamps)
    }
}

/// Re-emit an arbitrary canonical-name -> bytes map as a deterministic ZIP
/// archive. Exposed standalone because the Sanitizer builds a *new* part
/// map rather than mutating an `OpcPackage` in place.
pub fn emit_parts(parts: &BTreeMap<String, Vec<u8>>, normalize_timestamps: bool) -> Vec<u8> {
    let buf = Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(buf);

    let epoch = zip::DateTime::from_date_and_time(1980, 1, 1, 0, 0, 0)
        .expect("1980-01-01T00:00:00 is a valid DOS timestamp");

    for (name, bytes) in parts {
        let mut options = zip::write::FileOptions::<()>::default()
            .compression_method(zip::CompressionMethod::Deflated);
        if normalize_timestamps {
            options = options.last_modified_time(epoch);
        }
        writer
            .start_file(name, options)
            .expect("zip part names are validated canonical strings");
        writer
            .write_all(bytes)
            .expect("writing to an in-memory buffer cannot fail");
    }

    writer
        .finish()
        .expect("finishing an in-memory zip cannot fail")
        .into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zip_bytes(parts: &[(&str, &[u8])]) -> Vec<u8> {
        let cursor = Cursor::new(Vec::new());
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
    fn canonicalizes_leading_slash_and_backslashes() {
        assert_eq!(
            canonicalize_part_name("/xl/worksheets/sheet1.xml").as_deref(),
            Some("xl/worksheets/sheet1.xml")
        );
        assert_eq!(
            canonicalize_part_name(r"xl\worksheets\sheet1.xml").as_deref(),
            Some("xl/worksheets/sheet1.xml")
        );
    }

    #[test]
    fn resolves_dot_and_dot_dot_segments_without_escaping_root() {
        assert_eq!(
            canonicalize_part_name("xl/drawings/../media/image1.png").as_deref(),
            Some("xl/media/image1.png")
        );
        assert_eq!(canonicalize_part_name("../../etc/passwd"), None);
        assert_eq!(canonicalize_part_name("xl/./worksheets/./sheet1.xml").as_deref(),
            Some("xl/worksheets/sheet1.xml"));
    }

    #[test]
    fn rejects_empty_post_canonical_name() {
        assert_eq!(canonicalize_part_name("/"), None);
        assert_eq!(canonicalize_part_name(""), None);
    }

    #[test]
    fn duplicate_entries_last_one_wins() {
        let zip = zip_bytes(&[
            ("xl/calcChain.xml", b"<first/>"),
            (r"xl\calcChain.xml", b"<second/>"),
        ]);
        let pkg = OpcPackage::open(&zip).unwrap();
        assert_eq!(pkg.get("xl/calcChain.xml"), Some(b"<second/>".as_slice()));
        assert_eq!(pkg.len(), 1);
    }

    #[test]
    fn emit_is_deterministic_regardless_of_insertion_order() {
        let zip_a = zip_bytes(&[("b.xml", b"B"), ("a.xml", b"A")]);
        let zip_b = zip_bytes(&[("a.xml", b"A"), ("b.xml", b"B")]);
        let pkg_a = OpcPackage::open(&zip_a).unwrap();
        let pkg_b = OpcPackage::open(&zip_b).unwrap();
        assert_eq!(pkg_a.emit(true), pkg_b.emit(true));
    }

    #[test]
    fn directory_entries_are_skipped() {
        let cursor = Cursor::new(Vec::new());
        let mut writer = zip::ZipWriter::new(cursor);
        writer.add_directory("xl/", zip::write::FileOptions::<()>::default()).unwrap();
        let options = zip::write::FileOptions::<()>::default()
            .compression_method(zip::CompressionMethod::Stored);
        writer.start_file("xl/workbook.xml", options).unwrap();
        writer.write_all(b"<workbook/>").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let pkg = OpcPackage::open(&bytes).unwrap();
        assert_eq!(pkg.len(), 1);
        assert!(pkg.names().all(|n| !n.ends_with('/')));
    }
}
