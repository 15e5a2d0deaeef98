//! Metadata XML fragment extraction
//!
//! Update metadata is one `<Update>` document per revision. The sync
//! protocol never ships the whole blob: each response carries only the
//! fragment the client needs at that point. Three pure transforms:
//!
//! - core: identity, properties, relationships, applicability — what goes
//!   inside every `UpdateInfo`
//! - extended: file descriptors and handler-specific data
//! - localized properties: per-language title/description, falling back to
//!   `en` when none of the requested locales is present

use crate::store::{Error, Result};
use quick_xml::events::Event;
use quick_xml::{Reader, Writer};
use std::io::Cursor;

/// Root-level children that belong to the core fragment.
const CORE_CHILDREN: &[&str] = &[
    "UpdateIdentity",
    "Properties",
    "Relationships",
    "ApplicabilityRules",
    "DriverMetaData",
];

/// Root-level children that belong to the extended fragment.
const EXTENDED_CHILDREN: &[&str] = &["ExtendedProperties", "HandlerSpecificData", "Files"];

/// Core applicability fragment of a metadata blob.
pub fn core_fragment(xml: &[u8]) -> Result<String> {
    filter_root_children(xml, |name| CORE_CHILDREN.contains(&name))
}

/// Extended fragment: file locations and handler data, wrapped for the
/// extended-update-info response.
pub fn extended_fragment(xml: &[u8]) -> Result<String> {
    let mut inner = String::new();
    for name in EXTENDED_CHILDREN {
        for subtree in collect_subtrees(xml, name)? {
            inner.push_str(&subtree);
        }
    }
    Ok(format!("<ExtendedUpdateInfo>{}</ExtendedUpdateInfo>", inner))
}

/// Localized property blocks for the requested locales, in request order.
/// Falls back to the `en` block when nothing matches; empty only when the
/// blob carries no localized properties at all.
pub fn localized_properties(xml: &[u8], locales: &[String]) -> Result<Vec<String>> {
    let blocks = collect_subtrees(xml, "LocalizedProperties")?;
    let mut tagged = Vec::with_capacity(blocks.len());
    for block in blocks {
        let lang = child_text(block.as_bytes(), "Language")?.unwrap_or_default();
        tagged.push((lang, block));
    }

    let mut out = Vec::new();
    for locale in locales {
        for (lang, block) in &tagged {
            if lang.eq_ignore_ascii_case(locale) {
                out.push(block.clone());
            }
        }
    }
    if out.is_empty() {
        for (lang, block) in &tagged {
            if lang.eq_ignore_ascii_case("en") {
                out.push(block.clone());
            }
        }
    }
    Ok(out)
}

/// Copy the root element, keeping only the direct children whose local name
/// passes the filter. Text and nested structure inside kept children is
/// copied verbatim.
fn filter_root_children(xml: &[u8], keep: impl Fn(&str) -> bool) -> Result<String> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut skip_depth = 0usize;

    loop {
        let event = reader.read_event_into(&mut buf).map_err(Error::xml)?;
        match &event {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if skip_depth > 0 {
                    skip_depth += 1;
                } else if depth == 1 && !keep(&name) {
                    skip_depth = 1;
                } else {
                    writer.write_event(event.clone()).map_err(Error::xml)?;
                }
                depth += 1;
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if skip_depth == 0 && (depth != 1 || keep(&name)) {
                    writer.write_event(event.clone()).map_err(Error::xml)?;
                }
            }
            Event::End(_) => {
                depth -= 1;
                if skip_depth > 0 {
                    skip_depth -= 1;
                } else {
                    writer.write_event(event.clone()).map_err(Error::xml)?;
                }
            }
            Event::Text(_) | Event::CData(_) => {
                if skip_depth == 0 {
                    writer.write_event(event.clone()).map_err(Error::xml)?;
                }
            }
            Event::Eof => break,
            // Declarations, comments, and processing instructions are not
            // part of any fragment.
            _ => {}
        }
        buf.clear();
    }

    Ok(String::from_utf8_lossy(writer.into_inner().get_ref()).into_owned())
}

/// Serialize every subtree rooted at an element with the given local name.
fn collect_subtrees(xml: &[u8], element: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut out = Vec::new();
    let mut current: Option<(Writer<Cursor<Vec<u8>>>, usize)> = None;

    loop {
        let event = reader.read_event_into(&mut buf).map_err(Error::xml)?;
        match &event {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match current.as_mut() {
                    Some((writer, depth)) => {
                        *depth += 1;
                        writer.write_event(event.clone()).map_err(Error::xml)?;
                    }
                    None if name == element => {
                        let mut writer = Writer::new(Cursor::new(Vec::new()));
                        writer.write_event(event.clone()).map_err(Error::xml)?;
                        current = Some((writer, 1));
                    }
                    None => {}
                }
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match current.as_mut() {
                    Some((writer, _)) => {
                        writer.write_event(event.clone()).map_err(Error::xml)?
                    }
                    None if name == element => {
                        let mut writer = Writer::new(Cursor::new(Vec::new()));
                        writer.write_event(event.clone()).map_err(Error::xml)?;
                        out.push(
                            String::from_utf8_lossy(writer.into_inner().get_ref()).into_owned(),
                        );
                    }
                    None => {}
                }
            }
            Event::End(_) => {
                if let Some((writer, depth)) = current.as_mut() {
                    writer.write_event(event.clone()).map_err(Error::xml)?;
                    *depth -= 1;
                    if *depth == 0 {
                        let (writer, _) = current.take().unwrap();
                        out.push(
                            String::from_utf8_lossy(writer.into_inner().get_ref()).into_owned(),
                        );
                    }
                }
            }
            Event::Text(_) | Event::CData(_) => {
                if let Some((writer, _)) = current.as_mut() {
                    writer.write_event(event.clone()).map_err(Error::xml)?;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

/// Text content of the first direct child with the given local name.
fn child_text(xml: &[u8], element: &str) -> Result<Option<String>> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut capture = false;

    loop {
        match reader.read_event_into(&mut buf).map_err(Error::xml)? {
            Event::Start(e) => {
                capture = e.local_name().as_ref() == element.as_bytes();
            }
            Event::Text(t) => {
                if capture {
                    return Ok(Some(t.unescape().map_err(Error::xml)?.into_owned()));
                }
            }
            Event::End(_) => capture = false,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = br#"<?xml version="1.0" encoding="utf-8"?>
<Update>
  <UpdateIdentity UpdateID="d1c7f64e-8c3f-44e5-9b22-5b7a3a1c0001" RevisionNumber="2"/>
  <Properties UpdateType="Software"><KBArticleID>5031234</KBArticleID></Properties>
  <Relationships>
    <Prerequisites><UpdateIdentity UpdateID="aaaa0000-0000-0000-0000-000000000001"/></Prerequisites>
  </Relationships>
  <ApplicabilityRules><IsInstalled>false</IsInstalled></ApplicabilityRules>
  <Files><File Digest="q83v" Size="1024" Url="http://upstream/x.cab"/></Files>
  <ExtendedProperties MaxDownloadSize="1024"/>
  <LocalizedPropertiesCollection>
    <LocalizedProperties><Language>en</Language><Title>Widget update</Title></LocalizedProperties>
    <LocalizedProperties><Language>de</Language><Title>Widget-Update</Title></LocalizedProperties>
  </LocalizedPropertiesCollection>
</Update>"#;

    #[test]
    fn test_core_fragment_keeps_applicability_drops_files() {
        let core = core_fragment(SAMPLE).unwrap();
        assert!(core.contains("UpdateIdentity"));
        assert!(core.contains("Prerequisites"));
        assert!(core.contains("ApplicabilityRules"));
        assert!(!core.contains("<Files"));
        assert!(!core.contains("ExtendedProperties"));
        assert!(!core.contains("LocalizedProperties"));
    }

    #[test]
    fn test_extended_fragment_carries_files() {
        let ext = extended_fragment(SAMPLE).unwrap();
        assert!(ext.starts_with("<ExtendedUpdateInfo>"));
        assert!(ext.contains("http://upstream/x.cab"));
        assert!(ext.contains("ExtendedProperties"));
        assert!(!ext.contains("Prerequisites"));
    }

    #[test]
    fn test_localized_properties_selects_requested_locale() {
        let blocks = localized_properties(SAMPLE, &["de".to_string()]).unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].contains("Widget-Update"));
    }

    #[test]
    fn test_localized_properties_falls_back_to_en() {
        let blocks = localized_properties(SAMPLE, &["ja".to_string()]).unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].contains("Widget update"));
    }

    #[test]
    fn test_localized_properties_empty_when_blob_has_none() {
        let blocks = localized_properties(b"<Update/>", &["en".to_string()]).unwrap();
        assert!(blocks.is_empty());
    }
}
