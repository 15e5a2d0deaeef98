//! Wire types for the client sync endpoints.
//!
//! Field names follow the client protocol's casing; the JSON bodies here are
//! what the transport serializes, independent of any outer envelope.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wsusd_core::{Cookie, UpdateInfo};

/// Static server configuration returned by `getConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerConfigInfo {
    pub protocol_version: String,
    pub max_updates_in_response: u32,
    pub cookie_expiration_days: i64,
}

/// `getCookie` call body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GetCookieParams {
    pub auth_cookies: Vec<String>,
    pub old_cookie: Option<Cookie>,
    pub last_change: Option<String>,
    pub current_time: Option<String>,
    pub protocol_version: Option<String>,
}

/// `syncUpdates` call body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SyncUpdatesCall {
    pub cookie: Cookie,
    pub parameters: SyncUpdateParameters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SyncUpdateParameters {
    #[serde(rename = "InstalledNonLeafUpdateIDs")]
    pub installed_non_leaf_update_ids: Vec<u32>,
    #[serde(rename = "OtherCachedUpdateIDs")]
    pub other_cached_update_ids: Vec<u32>,
    pub filter_category_ids: Vec<Uuid>,
    pub skip_software_sync: bool,
    pub hardware_ids: Vec<String>,
    #[serde(rename = "ComputerHardwareIDs")]
    pub computer_hardware_ids: Vec<String>,
}

/// `syncUpdates` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SyncInfo {
    pub new_cookie: Cookie,
    pub new_updates: Vec<UpdateInfo>,
    pub changed_updates: Vec<UpdateInfo>,
    pub truncated: bool,
    #[serde(rename = "OutOfScopeRevisionIDs")]
    pub out_of_scope_revision_ids: Vec<u32>,
    /// Literal protocol quirk: always the string "false".
    pub driver_sync_not_needed: String,
}

/// `getExtendedUpdateInfo` call body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtendedUpdateInfoCall {
    pub cookie: Cookie,
    #[serde(rename = "RevisionIDs")]
    pub revision_ids: Vec<u32>,
    #[serde(default)]
    pub info_types: Vec<String>,
    #[serde(default)]
    pub locales: Vec<String>,
    #[serde(default)]
    pub geo_id: Option<String>,
}

/// `getExtendedUpdateInfo` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtendedUpdateInfo {
    pub updates: Vec<ExtendedFragment>,
    pub file_locations: Vec<FileLocation>,
}

/// One XML fragment for one revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtendedFragment {
    #[serde(rename = "ID")]
    pub id: u32,
    pub xml: String,
}

/// Download location for one payload file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileLocation {
    /// Hex-encoded content digest.
    pub file_digest: String,
    pub url: String,
}
