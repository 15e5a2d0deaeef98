//! wsusd Core Library
//!
//! Core functionality for wsusd including:
//! - Update identity and package model
//! - Metadata backing stores (compressed-delta, directory, SQLite)
//! - Prerequisite graph and applicability
//! - Update-graph engine with attach/detach and reindex
//! - Staged client sync and changed-deployment diffing
//! - Deployment and computer-sync store
//! - Driver hardware-id matching
//! - Metadata XML ingestion and fragment extraction

pub mod client_sync;
pub mod cookie;
pub mod delta_store;
pub mod deploy;
pub mod dir_store;
pub mod drivers;
pub mod engine;
pub mod fragments;
pub mod graph;
pub mod identity;
pub mod import;
pub mod package;
pub mod sqlite_store;
pub mod store;

mod util;

pub use client_sync::{
    sync_updates, DeploymentInfo, SyncPolicy, SyncRequest, SyncResult, UpdateInfo,
    LEGACY_DEPLOYMENT_CHANGE_DATE, MAX_UPDATES_IN_RESPONSE,
};
pub use cookie::{renew, Cookie, CookieBinding, OpaqueBinding, COOKIE_EXPIRATION_DAYS};
pub use delta_store::DeltaStore;
pub use deploy::{ComputerSyncRow, DeploySyncStore, DeploymentAction, DeploymentEntry};
pub use dir_store::DirStore;
pub use drivers::{DriverMatcher, NullObserver, UnapprovedDriverObserver};
pub use engine::{AttachedSource, CancelFlag, UpdateEngine, UpdateSummary};
pub use fragments::{core_fragment, extended_fragment, localized_properties};
pub use graph::PrerequisiteGraph;
pub use identity::{RevisionIndex, UpdateIdentity};
pub use import::{import_blobs, parse_package, ImportStats};
pub use package::{
    DriverHardwareId, FileReference, Package, PackageKind, PackageRecord, Partition,
    PartitionRegistry, PrereqClause,
};
pub use sqlite_store::SqliteStore;
pub use store::{Error, MetadataStore, Result};
