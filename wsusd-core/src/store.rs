//! Metadata backing-store contract
//!
//! Persistent mapping between update identity, dense revision index, raw
//! metadata XML, and file-descriptor lists. Three interchangeable backends
//! implement this trait: compressed-delta pack sections, a sharded directory
//! tree, and embedded SQLite.

use crate::identity::{RevisionIndex, UpdateIdentity};
use crate::package::{FileReference, Package};
use async_trait::async_trait;
use bytes::Bytes;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the update-graph core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A sync request arrived before any metadata source was attached.
    #[error("no metadata source attached")]
    NoMetadataSource,

    /// A client supplied a revision index the store has never assigned.
    #[error("invalid revision index: {0}")]
    InvalidRevisionIndex(u32),

    /// A stored package references a partition this build does not register.
    #[error("unknown partition: {0}")]
    UnknownPartition(String),

    /// The metadata parser rejected a blob. The offending package is skipped;
    /// ingestion continues.
    #[error("invalid metadata xml for {identity}: {reason}")]
    InvalidMetadataXml { identity: String, reason: String },

    /// Capability the core does not provide. Callers must not retry.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// A bulk operation observed its cancellation signal.
    #[error("operation cancelled")]
    Cancelled,

    #[error("package not found: {0}")]
    PackageNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("xml error: {0}")]
    Xml(String),
}

impl Error {
    pub fn serialization(e: impl std::fmt::Display) -> Self {
        Error::Serialization(e.to_string())
    }

    pub fn xml(e: impl std::fmt::Display) -> Self {
        Error::Xml(e.to_string())
    }
}

/// Capability set shared by every metadata backend.
///
/// Methods take `&self`; backends serialize writers internally and let
/// readers proceed in parallel. `identities` is a snapshot: packages added
/// after the call do not appear in its result.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Add a package, assigning the next dense index. Re-adding an identity
    /// already present is a no-op returning the existing index.
    async fn add_package(&self, pkg: &Package) -> Result<RevisionIndex>;

    /// Raw metadata XML for an identity.
    async fn metadata(&self, id: &UpdateIdentity) -> Result<Bytes>;

    /// Deserialized file-descriptor list for an identity.
    async fn files(&self, id: &UpdateIdentity) -> Result<Vec<FileReference>>;

    /// Reconstructed in-memory package.
    async fn package(&self, id: &UpdateIdentity) -> Result<Package>;

    async fn package_by_index(&self, index: RevisionIndex) -> Result<Package>;

    async fn package_index(&self, id: &UpdateIdentity) -> Result<Option<RevisionIndex>>;

    async fn package_identity(&self, index: RevisionIndex) -> Result<Option<UpdateIdentity>>;

    async fn contains_package(&self, id: &UpdateIdentity) -> Result<bool>;

    /// Snapshot of every stored identity with its index, in index order.
    async fn identities(&self) -> Result<Vec<(UpdateIdentity, RevisionIndex)>>;

    async fn package_count(&self) -> Result<u32>;

    /// Durably persist pending mutations.
    async fn flush(&self) -> Result<()>;
}
