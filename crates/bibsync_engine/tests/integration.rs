//! End-to-end sync passes through the HTTP client against a mock server.

use bibsync_engine::{RetryConfig, SyncConfig, SyncContext, SyncController, ZoteroApiClient};
use bibsync_protocol::{LibraryIdentifier, ObjectKind, SyncType};
use bibsync_store::{LocalStore, MemoryFileStorage, MemoryStore, ObjectRecord, WriteRequest};
use mockito::{Matcher, Mock, ServerGuard};
use serde_json::{json, Value};
use std::sync::Arc;

const LIB: LibraryIdentifier = LibraryIdentifier::MY_LIBRARY;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn get(server: &mut ServerGuard, path: &str, format: Option<&str>, body: Value, version: u64) -> Mock {
    let query = match format {
        Some(format) => Matcher::UrlEncoded("format".into(), format.into()),
        None => Matcher::Any,
    };
    server
        .mock("GET", path)
        .match_query(query)
        .with_status(200)
        .with_header("Last-Modified-Version", &version.to_string())
        .with_body(body.to_string())
        .create_async()
        .await
}

/// Mocks every read of an otherwise empty library at `version`.
async fn empty_reads(server: &mut ServerGuard, version: u64, skip: &[&str]) -> Vec<Mock> {
    let mut mocks = Vec::new();
    mocks.push(get(server, "/users/5/settings", None, json!({}), version).await);
    mocks.push(get(server, "/users/5/deleted", None, json!({}), version).await);
    for path in ["/users/5/collections", "/users/5/searches", "/users/5/items", "/users/5/items/trash"] {
        if !skip.contains(&path) {
            mocks.push(get(server, path, Some("versions"), json!({}), version).await);
        }
    }
    mocks
}

fn controller(server: &ServerGuard, store: Arc<MemoryStore>) -> SyncController<MemoryStore> {
    init_tracing();
    let config = SyncConfig::new(5)
        .with_api_base_url(server.url())
        .with_api_key("secret")
        .with_sync_groups(false)
        .with_retry(RetryConfig::no_retry());
    let api = Arc::new(ZoteroApiClient::new(&config).unwrap());
    SyncController::new(SyncContext::new(config, api, store, Arc::new(MemoryFileStorage::new())))
}

#[tokio::test]
async fn pull_stores_remote_objects() {
    let mut server = mockito::Server::new_async().await;
    let _reads = empty_reads(&mut server, 4, &["/users/5/collections", "/users/5/items"]).await;
    let _collection_versions =
        get(&mut server, "/users/5/collections", Some("versions"), json!({"CCCC2345": 3}), 4).await;
    let _collections = get(
        &mut server,
        "/users/5/collections",
        Some("json"),
        json!([{"key": "CCCC2345", "version": 3, "data": {"key": "CCCC2345", "version": 3, "name": "Reading"}}]),
        4,
    )
    .await;
    let _item_versions = get(&mut server, "/users/5/items", Some("versions"), json!({"IIII2345": 4}), 4).await;
    let _items = get(
        &mut server,
        "/users/5/items",
        Some("json"),
        json!([{"key": "IIII2345", "version": 4, "data": {
            "key": "IIII2345",
            "version": 4,
            "itemType": "journalArticle",
            "title": "On Sync",
            "collections": ["CCCC2345"]
        }}]),
        4,
    )
    .await;

    let store = Arc::new(MemoryStore::new());
    let report = controller(&server, store.clone()).sync(SyncType::Normal).await.unwrap();

    assert!(report.success());
    let library = report.library(LIB).unwrap();
    assert_eq!(library.fetched, 2);
    assert_eq!(library.version, 4);
    assert_eq!(
        store.object(LIB, ObjectKind::Collection, "CCCC2345").unwrap().data["name"],
        "Reading"
    );
    let item = store.object(LIB, ObjectKind::Item, "IIII2345").unwrap();
    assert_eq!(item.version, 4);
    assert!(!item.changed);
    let versions = store.versions(LIB);
    assert_eq!(versions.collections, 4);
    assert_eq!(versions.items, 4);
    assert_eq!(versions.deletions, 4);
}

#[tokio::test]
async fn push_sends_local_changes_with_precondition() {
    let mut server = mockito::Server::new_async().await;
    let _reads = empty_reads(&mut server, 4, &[]).await;
    let write = server
        .mock("POST", "/users/5/collections")
        .match_header("if-unmodified-since-version", "4")
        .match_header("zotero-api-key", "secret")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#""key":"CCCC3456""#.into()),
            Matcher::Regex(r#""name":"Drafts""#.into()),
        ]))
        .with_status(200)
        .with_header("Last-Modified-Version", "5")
        .with_body(
            json!({
                "successful": {"0": {"key": "CCCC3456", "version": 5, "data": {
                    "key": "CCCC3456", "version": 5, "name": "Drafts"
                }}},
                "unchanged": {},
                "failed": {}
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let store = Arc::new(MemoryStore::new());
    let record = ObjectRecord::new(LIB, ObjectKind::Collection, "CCCC3456", json!({"name": "Drafts"})).changed_by_user();
    store.perform(WriteRequest::SaveObject(record)).unwrap();

    let report = controller(&server, store.clone()).sync(SyncType::Normal).await.unwrap();

    write.assert_async().await;
    let library = report.library(LIB).unwrap();
    assert_eq!(library.submitted, 1);
    assert_eq!(library.version, 5);
    assert!(library.object_errors.is_empty());
    let stored = store.object(LIB, ObjectKind::Collection, "CCCC3456").unwrap();
    assert_eq!(stored.version, 5);
    assert!(!stored.changed);
}

#[tokio::test]
async fn revoked_key_stops_the_sync() {
    let mut server = mockito::Server::new_async().await;
    let _forbidden = server
        .mock("GET", Matcher::Any)
        .with_status(403)
        .with_body("Invalid key")
        .create_async()
        .await;

    let error = controller(&server, Arc::new(MemoryStore::new()))
        .sync(SyncType::Normal)
        .await
        .unwrap_err();
    assert!(matches!(error, bibsync_engine::SyncError::Http { status: 403, .. }));
}
