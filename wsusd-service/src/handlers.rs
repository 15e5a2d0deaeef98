//! Client endpoint handlers.
//!
//! Endpoints:
//!   POST /client/getconfig             → static server configuration
//!   POST /client/getcookie             → issue or renew a cookie
//!   POST /client/syncupdates           → staged sync
//!   POST /client/getextendedupdateinfo → XML fragments + file locations
//!
//! Requests hold the engine's read lock for their full duration; attaching
//! or reindexing a store waits for in-flight requests to drain.

use crate::wire::{
    ExtendedFragment, ExtendedUpdateInfo, ExtendedUpdateInfoCall, FileLocation, GetCookieParams,
    ServerConfigInfo, SyncInfo, SyncUpdatesCall,
};
use crate::{ClientService, ServiceError, PROTOCOL_VERSION};
use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::Response;
use serde::de::DeserializeOwned;
use serde::Serialize;
use wsusd_core::{
    core_fragment, extended_fragment, localized_properties, renew, Error, RevisionIndex,
    SyncRequest,
};

/// Route a client request. `path` is the portion after the "/client"
/// prefix (e.g. "/syncupdates").
pub async fn handle_client_request(
    path: &str,
    method: &str,
    body: &[u8],
    service: &ClientService,
) -> Response<Full<Bytes>> {
    let result = match (method, path) {
        ("POST", "/getconfig") => handle_get_config(service).await,
        ("POST", "/getcookie") => handle_get_cookie(service, body).await,
        ("POST", "/syncupdates") => handle_sync_updates(service, body).await,
        ("POST", "/getextendedupdateinfo") => handle_extended_info(service, body).await,
        // Printer catalogs are not served; callers must not retry.
        ("POST", "/getprinterdata") => {
            Err(ServiceError::Core(Error::NotImplemented("printer catalog")))
        }
        _ => {
            return json_error(
                404,
                &format!("unknown client endpoint: {} /client{}", method, path),
            )
        }
    };

    match result {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("client request failed: {}", e);
            json_error(e.status(), &e.to_string())
        }
    }
}

async fn handle_get_config(
    service: &ClientService,
) -> Result<Response<Full<Bytes>>, ServiceError> {
    let info = ServerConfigInfo {
        protocol_version: PROTOCOL_VERSION.to_string(),
        max_updates_in_response: service.policy.max_updates_in_response as u32,
        cookie_expiration_days: wsusd_core::COOKIE_EXPIRATION_DAYS,
    };
    Ok(json_ok(&info))
}

async fn handle_get_cookie(
    service: &ClientService,
    body: &[u8],
) -> Result<Response<Full<Bytes>>, ServiceError> {
    let params: GetCookieParams = parse_body(body)?;
    let cookie = renew(service.binding.as_ref(), params.old_cookie.as_ref(), Utc::now());
    Ok(json_ok(&cookie))
}

async fn handle_sync_updates(
    service: &ClientService,
    body: &[u8],
) -> Result<Response<Full<Bytes>>, ServiceError> {
    let call: SyncUpdatesCall = parse_body(body)?;
    let computer_id = service.binding.computer_id(&call.cookie);

    let request = SyncRequest {
        computer_id,
        installed_non_leaf_ids: call.parameters.installed_non_leaf_update_ids,
        other_cached_ids: call.parameters.other_cached_update_ids,
        filter_category_ids: call.parameters.filter_category_ids,
        skip_software_sync: call.parameters.skip_software_sync,
        hardware_ids: call.parameters.hardware_ids,
        computer_hardware_ids: call.parameters.computer_hardware_ids,
    };

    let guard = service.engine.source().await;
    let source = guard.as_ref().ok_or(Error::NoMetadataSource)?;
    let result = wsusd_core::sync_updates(
        source,
        &service.deploy,
        &service.policy,
        service.observer.as_ref(),
        &request,
        Utc::now(),
    )
    .await?;

    let info = SyncInfo {
        new_cookie: renew(service.binding.as_ref(), Some(&call.cookie), Utc::now()),
        new_updates: result.new_updates,
        changed_updates: result.changed_updates,
        truncated: result.truncated,
        out_of_scope_revision_ids: result.out_of_scope_revision_ids,
        driver_sync_not_needed: "false".to_string(),
    };
    Ok(json_ok(&info))
}

async fn handle_extended_info(
    service: &ClientService,
    body: &[u8],
) -> Result<Response<Full<Bytes>>, ServiceError> {
    let call: ExtendedUpdateInfoCall = parse_body(body)?;

    let guard = service.engine.source().await;
    let source = guard.as_ref().ok_or(Error::NoMetadataSource)?;

    let mut updates = Vec::new();
    let mut file_locations = Vec::new();

    for &revision_id in &call.revision_ids {
        let identity = source
            .store
            .package_identity(RevisionIndex(revision_id))
            .await?
            .ok_or(Error::InvalidRevisionIndex(revision_id))?;
        let xml = source.store.metadata(&identity).await?;

        for info_type in &call.info_types {
            let fragment = match info_type.as_str() {
                "Core" => Some(core_fragment(&xml)?),
                "Extended" => Some(extended_fragment(&xml)?),
                "LocalizedProperties" => {
                    let blocks = localized_properties(&xml, &call.locales)?;
                    if blocks.is_empty() {
                        None
                    } else {
                        Some(blocks.concat())
                    }
                }
                other => {
                    tracing::debug!("ignoring unsupported info type {:?}", other);
                    None
                }
            };
            if let Some(xml) = fragment {
                updates.push(ExtendedFragment { id: revision_id, xml });
            }
        }

        for file in source.store.files(&identity).await? {
            let digest = hex::encode(&file.digest);
            let url = match &service.content_root {
                Some(root) => format!("{}/{}", root.trim_end_matches('/'), digest),
                None => file.url.clone(),
            };
            file_locations.push(FileLocation { file_digest: digest, url });
        }
    }

    Ok(json_ok(&ExtendedUpdateInfo { updates, file_locations }))
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ServiceError> {
    serde_json::from_slice(body).map_err(|e| ServiceError::BadRequest(e.to_string()))
}

fn json_ok<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(200)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap(),
        Err(e) => json_error(500, &format!("response serialization failed: {}", e)),
    }
}

fn json_error(status: u16, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message }).to_string();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
