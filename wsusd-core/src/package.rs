//! Package model and partition registry
//!
//! A package is one revision of an update: software, driver, or one of the
//! category-like metadata kinds. Packages are plain records with capability
//! flags; role membership (root, leaf, bundle, category) is derived by the
//! graph, never encoded in a type hierarchy.

use crate::identity::UpdateIdentity;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Payload variant of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageKind {
    Software,
    Driver,
    Detectoid,
    Classification,
    Product,
}

impl PackageKind {
    /// Partition name this kind is stored under.
    pub fn partition(self) -> &'static str {
        match self {
            PackageKind::Software => "software",
            PackageKind::Driver => "driver",
            PackageKind::Detectoid => "detectoid",
            PackageKind::Classification => "classification",
            PackageKind::Product => "product",
        }
    }

    /// True for the payload kinds a client actually installs.
    pub fn is_software_or_driver(self) -> bool {
        matches!(self, PackageKind::Software | PackageKind::Driver)
    }
}

/// One clause of a package's prerequisite expression.
///
/// A package's prerequisites are a conjunction of clauses. `AtLeastOne` with
/// `is_category = true` carries category GUIDs and participates only in
/// category scoping, never in applicability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrereqClause {
    /// The update with this GUID must be installed.
    Simple(Uuid),
    /// Any one of these GUIDs satisfies the clause.
    AtLeastOne { guids: Vec<Uuid>, is_category: bool },
}

impl PrereqClause {
    /// All GUIDs referenced by this clause.
    pub fn referenced(&self) -> impl Iterator<Item = Uuid> + '_ {
        match self {
            PrereqClause::Simple(g) => std::slice::from_ref(g).iter().copied(),
            PrereqClause::AtLeastOne { guids, .. } => guids.as_slice().iter().copied(),
        }
    }
}

/// Reference to a payload file carried by an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    /// Content digest (SHA-1 or SHA-256 depending on the upstream catalog).
    pub digest: Vec<u8>,
    pub size: u64,
    pub url: String,
    pub patching_type: Option<String>,
}

/// Hardware id declared by a driver update, with optional computer-model
/// restrictions. A driver declaring no computer hardware ids matches any
/// machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverHardwareId {
    pub hardware_id: String,
    pub computer_hardware_ids: Vec<String>,
}

/// One revision of an update as held in the backing store.
#[derive(Debug, Clone)]
pub struct Package {
    pub identity: UpdateIdentity,
    pub kind: PackageKind,
    pub title: Option<String>,
    pub kb_article: Option<String>,
    pub prerequisites: Vec<PrereqClause>,
    /// Bundles that contain this update.
    pub bundled_with: Vec<UpdateIdentity>,
    /// Updates this package carries as its payload (non-empty for bundles).
    pub bundled_updates: Vec<UpdateIdentity>,
    pub files: Vec<FileReference>,
    /// Hardware ids declared by driver updates; empty otherwise.
    pub driver_ids: Vec<DriverHardwareId>,
    /// Raw metadata XML as ingested.
    pub xml: Bytes,
}

impl Package {
    pub fn is_bundle(&self) -> bool {
        !self.bundled_updates.is_empty()
    }

    pub fn is_bundled(&self) -> bool {
        !self.bundled_with.is_empty()
    }
}

/// On-disk record for a package, everything except the raw XML and the file
/// list (which the backends store through their own channels).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageRecord {
    pub identity: UpdateIdentity,
    pub kind: PackageKind,
    pub title: Option<String>,
    pub kb_article: Option<String>,
    pub prerequisites: Vec<PrereqClause>,
    pub bundled_with: Vec<UpdateIdentity>,
    pub bundled_updates: Vec<UpdateIdentity>,
    pub driver_ids: Vec<DriverHardwareId>,
}

impl PackageRecord {
    pub fn from_package(pkg: &Package) -> Self {
        Self {
            identity: pkg.identity,
            kind: pkg.kind,
            title: pkg.title.clone(),
            kb_article: pkg.kb_article.clone(),
            prerequisites: pkg.prerequisites.clone(),
            bundled_with: pkg.bundled_with.clone(),
            bundled_updates: pkg.bundled_updates.clone(),
            driver_ids: pkg.driver_ids.clone(),
        }
    }

    pub fn into_package(self, xml: Bytes, files: Vec<FileReference>) -> Package {
        Package {
            identity: self.identity,
            kind: self.kind,
            title: self.title,
            kb_article: self.kb_article,
            prerequisites: self.prerequisites,
            bundled_with: self.bundled_with,
            bundled_updates: self.bundled_updates,
            files,
            driver_ids: self.driver_ids,
            xml,
        }
    }
}

/// Behavior of one storage partition.
#[derive(Debug, Clone, Copy)]
pub struct Partition {
    pub name: &'static str,
    pub kind: PackageKind,
    /// Whether file descriptors live in the separate filemetadata area
    /// rather than inline with the package record.
    pub has_external_file_metadata: bool,
}

/// Explicit registry mapping partition names to their behavior.
///
/// Populated at process startup; stores consult it when opening so that a
/// store written by a build with more partitions fails loudly instead of
/// misreading records.
#[derive(Debug, Clone)]
pub struct PartitionRegistry {
    by_name: HashMap<&'static str, Partition>,
}

impl PartitionRegistry {
    /// Registry with the five built-in partitions.
    pub fn builtin() -> Self {
        let mut by_name = HashMap::new();
        for p in [
            Partition { name: "software", kind: PackageKind::Software, has_external_file_metadata: false },
            Partition { name: "driver", kind: PackageKind::Driver, has_external_file_metadata: true },
            Partition { name: "detectoid", kind: PackageKind::Detectoid, has_external_file_metadata: false },
            Partition { name: "classification", kind: PackageKind::Classification, has_external_file_metadata: false },
            Partition { name: "product", kind: PackageKind::Product, has_external_file_metadata: false },
        ] {
            by_name.insert(p.name, p);
        }
        Self { by_name }
    }

    pub fn get(&self, name: &str) -> Option<&Partition> {
        self.by_name.get(name)
    }

    pub fn register(&mut self, partition: Partition) {
        self.by_name.insert(partition.name, partition);
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.by_name.keys().copied()
    }
}

impl Default for PartitionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
