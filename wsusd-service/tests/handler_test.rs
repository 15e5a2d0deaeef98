//! Integration tests for the client HTTP endpoints.

use bytes::Bytes;
use http_body_util::BodyExt;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;
use wsusd_core::{
    Cookie, CookieBinding, DeploySyncStore, MetadataStore, OpaqueBinding, Package, PackageKind,
    PartitionRegistry, PrereqClause, SqliteStore, UpdateEngine, UpdateIdentity,
};
use wsusd_service::wire::{ExtendedUpdateInfo, ServerConfigInfo, SyncInfo};
use wsusd_service::{handle_client_request, ClientService};

fn package(guid: Uuid, kind: PackageKind, prereqs: Vec<PrereqClause>) -> Package {
    let update_type = match kind {
        PackageKind::Software => "Software",
        PackageKind::Detectoid => "Detectoid",
        _ => "Software",
    };
    Package {
        identity: UpdateIdentity::new(guid, 1),
        kind,
        title: Some("test".into()),
        kb_article: None,
        prerequisites: prereqs,
        bundled_with: Vec::new(),
        bundled_updates: Vec::new(),
        files: vec![wsusd_core::FileReference {
            digest: vec![0xc0, 0xff, 0xee],
            size: 64,
            url: "http://upstream/c0ffee.cab".into(),
            patching_type: None,
        }],
        driver_ids: Vec::new(),
        xml: Bytes::from(format!(
            "<Update><UpdateIdentity UpdateID=\"{}\" RevisionNumber=\"1\"/>\
             <Properties UpdateType=\"{}\"/>\
             <Files><File Digest=\"c0ffee\" Size=\"64\" Url=\"http://upstream/c0ffee.cab\"/></Files>\
             <LocalizedPropertiesCollection><LocalizedProperties>\
             <Language>en</Language><Title>Test update</Title>\
             </LocalizedProperties></LocalizedPropertiesCollection></Update>",
            guid, update_type
        )),
    }
}

/// Service over a store with one root and one software leaf.
async fn setup() -> (TempDir, ClientService, u32, u32) {
    let tmp = TempDir::new().unwrap();
    let store =
        SqliteStore::open(&tmp.path().join("store.db"), &PartitionRegistry::builtin()).unwrap();

    let root = Uuid::new_v4();
    let leaf = Uuid::new_v4();
    let root_idx = store
        .add_package(&package(root, PackageKind::Detectoid, vec![]))
        .await
        .unwrap();
    let leaf_idx = store
        .add_package(&package(
            leaf,
            PackageKind::Software,
            vec![PrereqClause::Simple(root)],
        ))
        .await
        .unwrap();

    let engine = Arc::new(UpdateEngine::new());
    engine.attach(Arc::new(store)).await.unwrap();
    let deploy = Arc::new(DeploySyncStore::open_in_memory().unwrap());
    let service = ClientService::new(engine, deploy);
    (tmp, service, root_idx.get(), leaf_idx.get())
}

async fn body_bytes(resp: hyper::Response<http_body_util::Full<Bytes>>) -> Vec<u8> {
    resp.into_body().collect().await.unwrap().to_bytes().to_vec()
}

fn cookie_for(computer_id: &str) -> Cookie {
    OpaqueBinding.issue(computer_id, chrono::Utc::now())
}

#[tokio::test]
async fn test_get_config() {
    let (_tmp, service, _, _) = setup().await;
    let resp = handle_client_request("/getconfig", "POST", b"{}", &service).await;
    assert_eq!(resp.status(), 200);

    let config: ServerConfigInfo =
        serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(config.max_updates_in_response, 50);
    assert_eq!(config.cookie_expiration_days, 5);
    assert!(!config.protocol_version.is_empty());
}

#[tokio::test]
async fn test_get_cookie_renews_computer_id() {
    let (_tmp, service, _, _) = setup().await;
    let old = cookie_for("pc-42");
    let body = serde_json::json!({ "OldCookie": old }).to_string();

    let resp = handle_client_request("/getcookie", "POST", body.as_bytes(), &service).await;
    assert_eq!(resp.status(), 200);

    let cookie: Cookie = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(OpaqueBinding.computer_id(&cookie), "pc-42");
    assert!(cookie.expiration > chrono::Utc::now());
}

#[tokio::test]
async fn test_sync_updates_first_contact() {
    let (_tmp, service, root_idx, _) = setup().await;
    let body = serde_json::json!({
        "Cookie": cookie_for("pc-1"),
        "Parameters": {}
    })
    .to_string();

    let resp = handle_client_request("/syncupdates", "POST", body.as_bytes(), &service).await;
    assert_eq!(resp.status(), 200);

    let info: SyncInfo = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(info.new_updates.len(), 1);
    assert_eq!(info.new_updates[0].id, root_idx);
    assert!(!info.truncated);
    assert_eq!(info.driver_sync_not_needed, "false");
    assert_eq!(OpaqueBinding.computer_id(&info.new_cookie), "pc-1");
}

#[tokio::test]
async fn test_sync_updates_unknown_index_is_rejected() {
    let (_tmp, service, _, _) = setup().await;
    let body = serde_json::json!({
        "Cookie": cookie_for("pc-1"),
        "Parameters": { "InstalledNonLeafUpdateIDs": [777] }
    })
    .to_string();

    let resp = handle_client_request("/syncupdates", "POST", body.as_bytes(), &service).await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_sync_updates_without_source_is_unavailable() {
    let (_tmp, service, _, _) = setup().await;
    service.engine.detach().await;

    let body = serde_json::json!({
        "Cookie": cookie_for("pc-1"),
        "Parameters": {}
    })
    .to_string();
    let resp = handle_client_request("/syncupdates", "POST", body.as_bytes(), &service).await;
    assert_eq!(resp.status(), 503);
}

#[tokio::test]
async fn test_extended_update_info_fragments_and_locations() {
    let (_tmp, service, _, leaf_idx) = setup().await;
    let body = serde_json::json!({
        "Cookie": cookie_for("pc-1"),
        "RevisionIDs": [leaf_idx],
        "InfoTypes": ["Extended", "LocalizedProperties"],
        "Locales": ["en"]
    })
    .to_string();

    let resp =
        handle_client_request("/getextendedupdateinfo", "POST", body.as_bytes(), &service).await;
    assert_eq!(resp.status(), 200);

    let info: ExtendedUpdateInfo = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(info.updates.len(), 2);
    assert!(info.updates[0].xml.contains("ExtendedUpdateInfo"));
    assert!(info.updates[1].xml.contains("Test update"));
    assert_eq!(info.file_locations.len(), 1);
    assert_eq!(info.file_locations[0].file_digest, "c0ffee");
    assert_eq!(info.file_locations[0].url, "http://upstream/c0ffee.cab");
}

#[tokio::test]
async fn test_extended_update_info_rewrites_content_root() {
    let (_tmp, service, _, leaf_idx) = setup().await;
    let service = service.with_content_root(Some("http://wsus.local/content/".into()));
    let body = serde_json::json!({
        "Cookie": cookie_for("pc-1"),
        "RevisionIDs": [leaf_idx],
        "InfoTypes": ["Extended"]
    })
    .to_string();

    let resp =
        handle_client_request("/getextendedupdateinfo", "POST", body.as_bytes(), &service).await;
    let info: ExtendedUpdateInfo = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(info.file_locations[0].url, "http://wsus.local/content/c0ffee");
}

#[tokio::test]
async fn test_printer_catalog_is_not_implemented() {
    let (_tmp, service, _, _) = setup().await;
    let resp = handle_client_request("/getprinterdata", "POST", b"{}", &service).await;
    assert_eq!(resp.status(), 501);
}

#[tokio::test]
async fn test_unknown_endpoint() {
    let (_tmp, service, _, _) = setup().await;
    let resp = handle_client_request("/nonexistent", "POST", b"{}", &service).await;
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let (_tmp, service, _, _) = setup().await;
    let resp = handle_client_request("/syncupdates", "POST", b"not json", &service).await;
    assert_eq!(resp.status(), 400);
}
