//! Update identity model
//!
//! Every update is globally identified by a (GUID, revision) pair. The store
//! additionally assigns each pair a dense 1-based integer index which is what
//! clients see on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Global identity of a single update revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UpdateIdentity {
    /// Logical update GUID, stable across revisions.
    pub guid: Uuid,
    /// Monotonically increasing revision number per GUID.
    pub revision: u32,
}

impl UpdateIdentity {
    pub fn new(guid: Uuid, revision: u32) -> Self {
        Self { guid, revision }
    }
}

impl fmt::Display for UpdateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.guid, self.revision)
    }
}

impl FromStr for UpdateIdentity {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (guid, rev) = s
            .rsplit_once('.')
            .ok_or_else(|| IdentityParseError(s.to_string()))?;
        let guid = Uuid::parse_str(guid).map_err(|_| IdentityParseError(s.to_string()))?;
        let revision = rev.parse().map_err(|_| IdentityParseError(s.to_string()))?;
        Ok(Self { guid, revision })
    }
}

/// Error returned when an identity string is malformed.
#[derive(Debug, thiserror::Error)]
#[error("invalid update identity: {0}")]
pub struct IdentityParseError(pub String);

/// Dense 1-based index assigned by the backing store.
///
/// The wire protocol speaks in these; the prerequisite graph speaks in GUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionIndex(pub u32);

impl RevisionIndex {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for RevisionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
