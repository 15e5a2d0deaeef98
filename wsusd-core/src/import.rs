//! Metadata ingestion
//!
//! Parses raw update-metadata XML blobs into packages and feeds them to a
//! backing store. This is the indexer behind the mirror pipeline: upstream
//! retrieval hands us blobs, we make them queryable. A blob the parser
//! rejects is logged, counted, and skipped; ingestion continues with the
//! rest of the batch.

use crate::identity::UpdateIdentity;
use crate::package::{
    DriverHardwareId, FileReference, Package, PackageKind, PartitionRegistry, PrereqClause,
};
use crate::store::{Error, MetadataStore, Result};
use bytes::Bytes;
use quick_xml::events::BytesStart;
use quick_xml::{events::Event, Reader};
use uuid::Uuid;

/// Outcome of a bulk import.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    pub imported: u32,
    pub skipped: u32,
}

/// Parse and store a batch of metadata blobs.
pub async fn import_blobs(
    store: &dyn MetadataStore,
    registry: &PartitionRegistry,
    blobs: impl IntoIterator<Item = Bytes>,
) -> Result<ImportStats> {
    let mut stats = ImportStats::default();
    for blob in blobs {
        match parse_package(&blob, registry) {
            Ok(pkg) => {
                store.add_package(&pkg).await?;
                stats.imported += 1;
            }
            Err(e @ Error::InvalidMetadataXml { .. }) => {
                tracing::warn!("skipping metadata blob: {}", e);
                stats.skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }
    tracing::info!(
        imported = stats.imported,
        skipped = stats.skipped,
        "metadata import finished"
    );
    Ok(stats)
}

fn invalid(identity: Option<UpdateIdentity>, reason: impl std::fmt::Display) -> Error {
    Error::InvalidMetadataXml {
        identity: identity
            .map(|id| id.to_string())
            .unwrap_or_else(|| "<unknown>".to_string()),
        reason: reason.to_string(),
    }
}

fn attr(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}

fn identity_from_attrs(e: &BytesStart<'_>) -> Option<UpdateIdentity> {
    let guid = Uuid::parse_str(&attr(e, "UpdateID")?).ok()?;
    let revision = attr(e, "RevisionNumber")
        .and_then(|r| r.parse().ok())
        .unwrap_or(1);
    Some(UpdateIdentity::new(guid, revision))
}

/// Parse one metadata blob into an in-memory package.
///
/// The blob is kept verbatim as the package's raw XML; everything else is
/// lifted out of it so the graph and the driver matcher never re-parse.
pub fn parse_package(xml: &[u8], registry: &PartitionRegistry) -> Result<Package> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut path: Vec<String> = Vec::new();
    let mut identity: Option<UpdateIdentity> = None;
    let mut update_type: Option<String> = None;
    let mut kb_article: Option<String> = None;
    let mut prerequisites: Vec<PrereqClause> = Vec::new();
    let mut at_least_one: Option<(Vec<Uuid>, bool)> = None;
    let mut bundled_with: Vec<UpdateIdentity> = Vec::new();
    let mut bundled_updates: Vec<UpdateIdentity> = Vec::new();
    let mut files: Vec<FileReference> = Vec::new();
    let mut driver_ids: Vec<DriverHardwareId> = Vec::new();
    let mut pending_hardware: Option<DriverHardwareId> = None;
    let mut titles: Vec<(String, String)> = Vec::new();
    let mut current_language: Option<String> = None;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| invalid(identity, e))?;
        match &event {
            Event::Start(e) | Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                let empty = matches!(&event, Event::Empty(_));
                let parent = path.last().map(String::as_str).unwrap_or("");

                match name.as_str() {
                    "UpdateIdentity" if parent == "Update" => {
                        identity = identity_from_attrs(e);
                    }
                    "Properties" if parent == "Update" => {
                        update_type = attr(e, "UpdateType");
                    }
                    "UpdateIdentity" if parent == "Prerequisites" => {
                        let id = identity_from_attrs(e)
                            .ok_or_else(|| invalid(identity, "bad prerequisite identity"))?;
                        prerequisites.push(PrereqClause::Simple(id.guid));
                    }
                    "AtLeastOne" if parent == "Prerequisites" => {
                        let is_category = attr(e, "IsCategory")
                            .map(|v| v == "true")
                            .unwrap_or(false);
                        at_least_one = Some((Vec::new(), is_category));
                    }
                    "UpdateIdentity" if parent == "AtLeastOne" => {
                        let id = identity_from_attrs(e)
                            .ok_or_else(|| invalid(identity, "bad prerequisite identity"))?;
                        if let Some((guids, _)) = at_least_one.as_mut() {
                            guids.push(id.guid);
                        }
                    }
                    "UpdateIdentity" if parent == "BundledBy" => {
                        let id = identity_from_attrs(e)
                            .ok_or_else(|| invalid(identity, "bad bundle identity"))?;
                        bundled_with.push(id);
                    }
                    "UpdateIdentity" if parent == "BundledUpdates" => {
                        let id = identity_from_attrs(e)
                            .ok_or_else(|| invalid(identity, "bad bundle identity"))?;
                        bundled_updates.push(id);
                    }
                    "File" if parent == "Files" => {
                        let digest = attr(e, "Digest")
                            .and_then(|d| hex::decode(d).ok())
                            .ok_or_else(|| invalid(identity, "bad file digest"))?;
                        files.push(FileReference {
                            digest,
                            size: attr(e, "Size").and_then(|s| s.parse().ok()).unwrap_or(0),
                            url: attr(e, "Url").unwrap_or_default(),
                            patching_type: attr(e, "PatchingType"),
                        });
                    }
                    "HardwareId" if parent == "DriverMetaData" => {
                        let computer_hardware_ids = attr(e, "ComputerHardwareIds")
                            .map(|v| {
                                v.split(';')
                                    .filter(|s| !s.is_empty())
                                    .map(str::to_string)
                                    .collect()
                            })
                            .unwrap_or_default();
                        pending_hardware = Some(DriverHardwareId {
                            hardware_id: String::new(),
                            computer_hardware_ids,
                        });
                    }
                    "LocalizedProperties" => {
                        current_language = None;
                    }
                    _ => {}
                }

                if !empty {
                    path.push(name);
                } else if name == "HardwareId" {
                    // An empty HardwareId element carries no id; drop it.
                    pending_hardware = None;
                }
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| invalid(identity, e))?
                    .into_owned();
                match path.last().map(String::as_str) {
                    Some("KBArticleID") => kb_article = Some(text),
                    Some("HardwareId") => {
                        if let Some(hw) = pending_hardware.as_mut() {
                            hw.hardware_id = text;
                        }
                    }
                    Some("Language") => current_language = Some(text),
                    Some("Title") => {
                        titles.push((current_language.clone().unwrap_or_default(), text));
                    }
                    _ => {}
                }
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                path.pop();
                match name.as_str() {
                    "AtLeastOne" => {
                        if let Some((guids, is_category)) = at_least_one.take() {
                            if !guids.is_empty() {
                                prerequisites.push(PrereqClause::AtLeastOne { guids, is_category });
                            }
                        }
                    }
                    "HardwareId" => {
                        if let Some(hw) = pending_hardware.take() {
                            if !hw.hardware_id.is_empty() {
                                driver_ids.push(hw);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let identity = identity.ok_or_else(|| invalid(None, "missing update identity"))?;
    let update_type =
        update_type.ok_or_else(|| invalid(Some(identity), "missing UpdateType"))?;
    let kind = kind_for_update_type(&update_type)
        .ok_or_else(|| invalid(Some(identity), format!("unknown UpdateType {:?}", update_type)))?;
    if registry.get(kind.partition()).is_none() {
        return Err(Error::UnknownPartition(kind.partition().to_string()));
    }

    let title = titles
        .iter()
        .find(|(lang, _)| lang.eq_ignore_ascii_case("en"))
        .or_else(|| titles.first())
        .map(|(_, t)| t.clone());

    Ok(Package {
        identity,
        kind,
        title,
        kb_article,
        prerequisites,
        bundled_with,
        bundled_updates,
        files,
        driver_ids,
        xml: Bytes::copy_from_slice(xml),
    })
}

fn kind_for_update_type(update_type: &str) -> Option<PackageKind> {
    match update_type {
        "Software" => Some(PackageKind::Software),
        "Driver" => Some(PackageKind::Driver),
        "Detectoid" => Some(PackageKind::Detectoid),
        "Classification" => Some(PackageKind::Classification),
        "Product" => Some(PackageKind::Product),
        _ => None,
    }
}
