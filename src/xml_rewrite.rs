//! Small streaming XML transform helpers shared by the Sanitizer.
//!
//! The sanitizer never needs a full DOM: every transform either rewrites a
//! leaf text node, drops/edits an attribute, or drops a subtree. A
//! `quick_xml::Reader` -> `quick_xml::Writer` pass-through that intercepts
//! specific elements is both faster and far less code than building and
//! re-serializing a tree, and keeps formatting/namespace declarations the
//! writer never has to re-derive.

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

pub fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|&b| b == b':') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}

/// Parse `xml` and hand every event to `visit`, writing whatever `visit`
/// returns (or the original event, if it returns `None` for "pass through
/// unchanged"). `visit` may also return multiple events to splice in
/// replacements (e.g. dropping an attribute means re-emitting the start tag
/// with attributes filtered).
pub fn stream_transform<F>(xml: &[u8], mut visit: F) -> quick_xml::Result<Vec<u8>>
where
    F: FnMut(Event<'_>, &mut Writer<Cursor<Vec<u8>>>) -> quick_xml::Result<()>,
{
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let event = reader.read_event_into(&mut buf)?;
        let is_eof = matches!(event, Event::Eof);
        visit(event, &mut writer)?;
        if is_eof {
            break;
        }
    }

    Ok(writer.into_inner().into_inner())
}

/// Rewrite the text content of every `<local_name>` element (no matter its
/// namespace prefix) using `policy`. Used for `sharedStrings.xml`'s `<t>`,
/// `comments*.xml`'s `<t>`, and free-text runs (`<a:t>`) in charts/drawings.
pub fn rewrite_leaf_text(xml: &[u8], target_local_name: &[u8], mut policy: impl FnMut(&str) -> String) -> quick_xml::Result<Vec<u8>> {
    let mut depth_in_target: i32 = 0;

    stream_transform(xml, |event, writer| {
        match &event {
            Event::Start(e) if local_name(e.name().as_ref()) == target_local_name => {
                depth_in_target += 1;
            }
            Event::End(e) if local_name(e.name().as_ref()) == target_local_name => {
                depth_in_target -= 1;
            }
            _ => {}
        }

        if depth_in_target > 0 {
            if let Event::Text(t) = &event {
                let decoded = t.unescape().unwrap_or_default().into_owned();
                let rewritten = policy(&decoded);
                return writer.write_event(Event::Text(BytesText::new(&rewritten)));
            }
        }
        writer.write_event(event)
    })
}

/// Remove a named attribute from every start/empty tag whose local name
/// matches `element_local_name` (namespace-agnostic on the attribute name too).
pub fn strip_attribute(xml: &[u8], element_local_name: &[u8], attr_local_name: &[u8]) -> quick_xml::Result<Vec<u8>> {
    stream_transform(xml, |event, writer| match event {
        Event::Start(e) if local_name(e.name().as_ref()) == element_local_name => {
            writer.write_event(Event::Start(filter_attr(&e, attr_local_name)))
        }
        Event::Empty(e) if local_name(e.name().as_ref()) == element_local_name => {
            writer.write_event(Event::Empty(filter_attr(&e, attr_local_name)))
        }
        other => writer.write_event(other),
    })
}

fn filter_attr<'a>(e: &BytesStart<'a>, attr_local_name: &[u8]) -> BytesStart<'a> {
    let mut out = BytesStart::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
    for attr in e.attributes().flatten() {
        if local_name(attr.key.as_ref()) != attr_local_name {
            out.push_attribute(attr);
        }
    }
    out
}

/// Drop every element (and its subtree) whose local name matches any name
/// in `element_local_names`. Matches both `<el/>` and `<el>...</el>` forms.
pub fn strip_elements(xml: &[u8], element_local_names: &[&[u8]]) -> quick_xml::Result<Vec<u8>> {
    let mut skip_depth: i32 = 0;

    stream_transform(xml, |event, writer| {
        if skip_depth > 0 {
            match &event {
                Event::Start(e) if element_local_names.contains(&local_name(e.name().as_ref())) => {
                    skip_depth += 1;
                }
                Event::End(e) if element_local_names.contains(&local_name(e.name().as_ref())) => {
                    skip_depth -= 1;
                }
                _ => {}
            }
            return Ok(());
        }

        match &event {
            Event::Empty(e) if element_local_names.contains(&local_name(e.name().as_ref())) => {
                return Ok(());
            }
            Event::Start(e) if element_local_names.contains(&local_name(e.name().as_ref())) => {
                skip_depth = 1;
                return Ok(());
            }
            _ => {}
        }

        writer.write_event(event)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_leaf_text_replaces_only_target_element() {
        let xml = br#"<sst><si><t>secret</t></si><si><t>other</t></si></sst>"#;
        let out = rewrite_leaf_text(xml, b"t", |_| "REDACTED".to_string()).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert_eq!(s.matches("REDACTED").count(), 2);
        assert!(!s.contains("secret"));
    }

    #[test]
    fn strip_attribute_removes_only_named_attribute() {
        let xml = br#"<workbookPr codeName="ThisWorkbook" date1904="false"/>"#;
        let out = strip_attribute(xml, b"workbookPr", b"codeName").unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(!s.contains("codeName"));
        assert!(s.contains("date1904"));
    }

    #[test]
    fn strip_elements_drops_subtree() {
        let xml = br#"<workbook><sheets/><externalReferences><externalReference r:id="rId1"/></externalReferences></workbook>"#;
        let out = strip_elements(xml, &[b"externalReferences"]).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(!s.contains("externalReference"));
        assert!(s.contains("<sheets/>"));
    }
}
