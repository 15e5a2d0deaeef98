//! Staged client sync
//!
//! One "sync updates" call walks a fixed pipeline: translate the client's
//! indexes, pick the single stage that emits, assemble update descriptors,
//! diff changed deployments, and finalize the client's sync time. The four
//! stages hand the client the update graph top-down:
//!
//! 1. roots it has never seen
//! 2. applicable non-leafs
//! 3. applicable bundles
//! 4. remaining applicable software leaves
//!
//! Exactly one stage emits per request; a client converges by syncing
//! repeatedly until stage 4 runs dry.

use crate::deploy::{DeploySyncStore, DeploymentAction, DeploymentEntry};
use crate::drivers::UnapprovedDriverObserver;
use crate::engine::{AttachedSource, UpdateSummary};
use crate::fragments::core_fragment;
use crate::store::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Hard cap on descriptors per response.
pub const MAX_UPDATES_IN_RESPONSE: usize = 50;

/// `LastChangeTime` handed out when a revision has no deployment row.
pub const LEGACY_DEPLOYMENT_CHANGE_DATE: &str = "2005-05-16";

const DEPLOYMENT_ID_NON_LEAF: u32 = 15000;
const DEPLOYMENT_ID_BUNDLE: u32 = 20000;
const DEPLOYMENT_ID_BUNDLED: u32 = 20001;
const DEPLOYMENT_ID_STANDALONE: u32 = 20002;

/// Tunables for the sync pipeline.
#[derive(Debug, Clone)]
pub struct SyncPolicy {
    pub max_updates_in_response: usize,
    /// Compatibility switch: without a deployment row, bundles historically
    /// get `Install`; turning this off hands out `Evaluate` instead.
    pub legacy_bundle_action: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            max_updates_in_response: MAX_UPDATES_IN_RESPONSE,
            legacy_bundle_action: true,
        }
    }
}

/// Translated "sync updates" call.
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub computer_id: String,
    pub installed_non_leaf_ids: Vec<u32>,
    pub other_cached_ids: Vec<u32>,
    pub filter_category_ids: Vec<Uuid>,
    pub skip_software_sync: bool,
    /// Client hardware, most specific first. Used by the driver flow.
    pub hardware_ids: Vec<String>,
    pub computer_hardware_ids: Vec<String>,
}

/// One update descriptor in a sync response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateInfo {
    #[serde(rename = "ID")]
    pub id: u32,
    pub is_leaf: bool,
    pub is_shared: bool,
    pub xml: String,
    pub deployment: DeploymentInfo,
    pub verification: Option<()>,
}

/// Deployment block of an update descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeploymentInfo {
    #[serde(rename = "ID")]
    pub id: u32,
    pub action: DeploymentAction,
    pub last_change_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    pub auto_download: String,
    pub auto_select: String,
    pub supersedence_behavior: String,
    pub is_assigned: bool,
}

/// Outcome of one sync call, cookie-agnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SyncResult {
    pub new_updates: Vec<UpdateInfo>,
    pub changed_updates: Vec<UpdateInfo>,
    pub truncated: bool,
    #[serde(rename = "OutOfScopeRevisionIDs")]
    pub out_of_scope_revision_ids: Vec<u32>,
}

/// Run one sync call against the attached source.
///
/// `now` stamps the client's sync time once the response is assembled;
/// callers pass the clock in so replays are reproducible.
pub async fn sync_updates(
    source: &AttachedSource,
    deploy: &DeploySyncStore,
    policy: &SyncPolicy,
    observer: &dyn UnapprovedDriverObserver,
    request: &SyncRequest,
    now: DateTime<Utc>,
) -> Result<SyncResult> {
    // Translation: wire indexes to GUIDs. An index the store never assigned
    // fails the whole request.
    let mut installed = HashSet::new();
    for &idx in &request.installed_non_leaf_ids {
        installed.insert(source.guid_for_index(idx).await?);
    }
    let mut known = installed.clone();
    for &idx in &request.other_cached_ids {
        known.insert(source.guid_for_index(idx).await?);
    }

    let candidates = if request.skip_software_sync {
        select_driver_stage(source, deploy, observer, request, &installed, &known)?
    } else {
        select_software_stage(source, request, &installed, &known)
    };

    let cap = policy.max_updates_in_response;
    let mut emitted = candidates.guids;
    emitted.sort_by_key(|g| source.summaries[g].index);
    let truncated = emitted.len() > cap;
    emitted.truncate(cap);

    let mut new_updates = Vec::with_capacity(emitted.len());
    for guid in &emitted {
        let summary = &source.summaries[guid];
        new_updates.push(
            assemble_update_info(source, deploy, policy, summary, candidates.is_leaf, None)
                .await?,
        );
    }

    let changed_updates = diff_deployments(source, deploy, policy, request, &known).await?;
    let out_of_scope_revision_ids = out_of_scope(source, &installed, &known);

    // Finalize: the client's sync time moves only after the response exists.
    if !request.computer_id.is_empty() {
        deploy.update_computer_sync(&request.computer_id, now)?;
    }

    Ok(SyncResult {
        new_updates,
        changed_updates,
        truncated,
        out_of_scope_revision_ids,
    })
}

struct StageCandidates {
    guids: Vec<Uuid>,
    is_leaf: bool,
}

/// Pick the first software stage with any candidate. The last stage emits
/// even when empty; an empty response tells the client it has converged.
fn select_software_stage(
    source: &AttachedSource,
    request: &SyncRequest,
    installed: &HashSet<Uuid>,
    known: &HashSet<Uuid>,
) -> StageCandidates {
    let graph = &source.graph;
    let filter: HashSet<Uuid> = request.filter_category_ids.iter().copied().collect();
    let in_scope = |guid: &Uuid| -> bool {
        graph.is_applicable(guid, installed)
            && (filter.is_empty() || graph.matches_categories(guid, &filter))
    };

    let roots: Vec<Uuid> = graph
        .roots()
        .iter()
        .filter(|g| !known.contains(g))
        .copied()
        .collect();
    if !roots.is_empty() {
        return StageCandidates { guids: roots, is_leaf: false };
    }

    let non_leafs: Vec<Uuid> = graph
        .non_leafs()
        .iter()
        .filter(|g| !known.contains(g) && in_scope(g))
        .copied()
        .collect();
    if !non_leafs.is_empty() {
        return StageCandidates { guids: non_leafs, is_leaf: false };
    }

    // Bundles go out before the leaves they contain so the client can file
    // arriving leaves under them.
    let bundles: Vec<Uuid> = graph
        .software_leaf_guids()
        .iter()
        .filter(|g| {
            !known.contains(g) && source.summaries[*g].is_bundle && in_scope(g)
        })
        .copied()
        .collect();
    if !bundles.is_empty() {
        return StageCandidates { guids: bundles, is_leaf: true };
    }

    let leaves: Vec<Uuid> = graph
        .software_leaf_guids()
        .iter()
        .filter(|g| {
            !known.contains(g) && !source.summaries[*g].is_bundle && in_scope(g)
        })
        .copied()
        .collect();
    StageCandidates { guids: leaves, is_leaf: true }
}

/// Driver flow: same graph walk, but the terminal stage comes from the
/// hardware-id matcher and only approved drivers leave the building.
fn select_driver_stage(
    source: &AttachedSource,
    deploy: &DeploySyncStore,
    observer: &dyn UnapprovedDriverObserver,
    request: &SyncRequest,
    installed: &HashSet<Uuid>,
    known: &HashSet<Uuid>,
) -> Result<StageCandidates> {
    let graph = &source.graph;

    let roots: Vec<Uuid> = graph
        .roots()
        .iter()
        .filter(|g| !known.contains(g))
        .copied()
        .collect();
    if !roots.is_empty() {
        return Ok(StageCandidates { guids: roots, is_leaf: false });
    }

    let non_leafs: Vec<Uuid> = graph
        .non_leafs()
        .iter()
        .filter(|g| !known.contains(g) && graph.is_applicable(g, installed))
        .copied()
        .collect();
    if !non_leafs.is_empty() {
        return Ok(StageCandidates { guids: non_leafs, is_leaf: false });
    }

    let matched = source
        .driver_matcher
        .matches(&request.hardware_ids, &request.computer_hardware_ids);

    let mut approved = Vec::new();
    for guid in matched {
        if known.contains(&guid) || !graph.is_applicable(&guid, installed) {
            continue;
        }
        let summary = &source.summaries[&guid];
        match deploy.get_deployment(summary.index.get())? {
            Some(row) if row.action != DeploymentAction::PreDeploymentCheck => {
                approved.push(guid);
            }
            _ => observer.on_unapproved(&summary.identity),
        }
    }
    Ok(StageCandidates { guids: approved, is_leaf: true })
}

/// Updates the client already knows whose deployment changed since its last
/// sync. The deployment row's action overrides whatever bundling would
/// imply.
async fn diff_deployments(
    source: &AttachedSource,
    deploy: &DeploySyncStore,
    policy: &SyncPolicy,
    request: &SyncRequest,
    known: &HashSet<Uuid>,
) -> Result<Vec<UpdateInfo>> {
    let last_sync = if request.computer_id.is_empty() {
        None
    } else {
        deploy
            .get_computer_sync(&request.computer_id)?
            .map(|row| row.last_sync_time)
    };

    let mut changed: Vec<(&UpdateSummary, DeploymentEntry)> = Vec::new();
    for guid in known {
        let Some(summary) = source.summaries.get(guid) else {
            continue;
        };
        if let Some(row) = deploy.get_deployment(summary.index.get())? {
            let newer = match last_sync {
                Some(t) => row.last_change_time > t,
                None => true,
            };
            if newer {
                changed.push((summary, row));
            }
        }
    }
    changed.sort_by_key(|(s, _)| s.index);

    let mut out = Vec::with_capacity(changed.len());
    for (summary, row) in changed {
        let is_leaf = source.graph.leaves().contains(&summary.identity.guid);
        out.push(
            assemble_update_info(source, deploy, policy, summary, is_leaf, Some(row)).await?,
        );
    }
    Ok(out)
}

/// Updates the client claims that the current graph no longer offers it:
/// either superseded out of the current map or rendered inapplicable.
fn out_of_scope(
    source: &AttachedSource,
    installed: &HashSet<Uuid>,
    known: &HashSet<Uuid>,
) -> Vec<u32> {
    let graph = &source.graph;
    let mut out: Vec<u32> = known
        .iter()
        .filter(|guid| {
            !(graph.roots().contains(*guid) || graph.is_applicable(guid, installed))
        })
        .filter_map(|guid| source.summaries.get(guid).map(|s| s.index.get()))
        .collect();
    out.sort_unstable();
    out
}

/// Build one `UpdateInfo`, resolving the deployment block from the row when
/// one exists and from the update's bundling role otherwise.
async fn assemble_update_info(
    source: &AttachedSource,
    deploy: &DeploySyncStore,
    policy: &SyncPolicy,
    summary: &UpdateSummary,
    is_leaf: bool,
    row_override: Option<DeploymentEntry>,
) -> Result<UpdateInfo> {
    let row = match row_override {
        Some(row) => Some(row),
        None => deploy.get_deployment(summary.index.get())?,
    };

    let action = match &row {
        Some(row) => row.action,
        None if !is_leaf => DeploymentAction::Evaluate,
        None if summary.is_bundle => {
            if policy.legacy_bundle_action {
                DeploymentAction::Install
            } else {
                DeploymentAction::Evaluate
            }
        }
        None if summary.is_bundled => DeploymentAction::Bundle,
        None => DeploymentAction::Install,
    };

    let deployment_id = if !is_leaf {
        DEPLOYMENT_ID_NON_LEAF
    } else if summary.is_bundle {
        DEPLOYMENT_ID_BUNDLE
    } else if summary.is_bundled {
        DEPLOYMENT_ID_BUNDLED
    } else {
        DEPLOYMENT_ID_STANDALONE
    };

    let last_change_time = row
        .as_ref()
        .map(|r| r.last_change_time.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| LEGACY_DEPLOYMENT_CHANGE_DATE.to_string());
    let deadline = row
        .as_ref()
        .and_then(|r| r.deadline)
        .map(|d| d.to_rfc3339_opts(SecondsFormat::Secs, false));

    let xml = source.store.metadata(&summary.identity).await?;
    let xml = core_fragment(&xml)?;

    Ok(UpdateInfo {
        id: summary.index.get(),
        is_leaf,
        is_shared: false,
        xml,
        deployment: DeploymentInfo {
            id: deployment_id,
            action,
            last_change_time,
            deadline,
            auto_download: "0".to_string(),
            auto_select: "0".to_string(),
            supersedence_behavior: "0".to_string(),
            is_assigned: true,
        },
        verification: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        let policy = SyncPolicy::default();
        assert_eq!(policy.max_updates_in_response, 50);
        assert!(policy.legacy_bundle_action);
    }

    #[test]
    fn test_update_info_serializes_wire_names() {
        let info = UpdateInfo {
            id: 12,
            is_leaf: true,
            is_shared: false,
            xml: "<Update/>".into(),
            deployment: DeploymentInfo {
                id: DEPLOYMENT_ID_STANDALONE,
                action: DeploymentAction::Install,
                last_change_time: LEGACY_DEPLOYMENT_CHANGE_DATE.into(),
                deadline: None,
                auto_download: "0".into(),
                auto_select: "0".into(),
                supersedence_behavior: "0".into(),
                is_assigned: true,
            },
            verification: None,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["ID"], 12);
        assert_eq!(json["IsLeaf"], true);
        assert_eq!(json["Deployment"]["ID"], 20002);
        assert_eq!(json["Deployment"]["Action"], "Install");
        assert_eq!(json["Verification"], serde_json::Value::Null);
    }
}
