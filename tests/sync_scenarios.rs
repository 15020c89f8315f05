#![cfg(not(target_arch = "wasm32"))]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, int, settings, start_client, start_single_client, unique_name, Collector};
use firestore_sync::firestore::core::target::{Direction, OrderBy};
use firestore_sync::firestore::core::{ListenOptions, Query, ViewSnapshot};
use firestore_sync::firestore::local::kv_store::KvDatabase;
use firestore_sync::firestore::local::WebStorageArea;
use firestore_sync::firestore::model::{
    DocumentKey, FieldMask, FieldPath, Mutation, Precondition, ResourcePath,
};
use firestore_sync::firestore::value::{FirestoreValue, ObjectValue};
use firestore_sync::firestore::{FirestoreError, FirestoreErrorCode};
use firestore_sync::util::TimerId;
use serde_json::json;

fn rooms() -> Query {
    Query::new(ResourcePath::from_string("rooms").unwrap())
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn set(path: &str, field: &str, value: i64) -> Mutation {
    let mut data = ObjectValue::empty();
    data.set(&FieldPath::from_single(field), value.into());
    Mutation::set(key(path), data)
}

fn patch(path: &str, field: &str, value: i64) -> Mutation {
    let field_path = FieldPath::from_single(field);
    let mut data = ObjectValue::empty();
    data.set(&field_path, value.into());
    Mutation::patch(
        key(path),
        data,
        FieldMask::new(vec![field_path]),
        Precondition::Exists(true),
    )
}

fn field(snapshot: &ViewSnapshot, path: &str, name: &str) -> Option<FirestoreValue> {
    snapshot
        .docs
        .get(&key(path))
        .and_then(|doc| doc.field(&FieldPath::from_single(name)).cloned())
}

fn keys(snapshot: &ViewSnapshot) -> Vec<String> {
    snapshot.docs.keys().map(|key| key.to_string()).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_write_is_visible_with_pending_writes() {
    let (client, _backend) = start_single_client("offline-write").await;
    client.disable_network().await.unwrap();

    let observer = Arc::new(Collector::default());
    client
        .listen(rooms(), ListenOptions::default(), observer.clone())
        .await
        .unwrap();
    let write = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.write(vec![set("rooms/a", "x", 1)]).await })
    };

    let snapshot = observer
        .wait_for(&client, |snapshot| snapshot.docs.len() == 1)
        .await;
    assert!(snapshot.from_cache);
    assert!(snapshot.has_pending_writes());
    assert_eq!(field(&snapshot, "rooms/a", "x"), Some(FirestoreValue::from(1i64)));

    let doc = client
        .get_document_from_local_cache(key("rooms/a"))
        .await
        .unwrap()
        .expect("document in cache");
    assert!(doc.has_local_mutations());
    assert!(!write.is_finished());

    write.abort();
    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_update_keeps_pending_patch_on_top() {
    let (client, mut backend) = start_single_client("pending-patch").await;
    let observer = Arc::new(Collector::default());
    client
        .listen(rooms(), ListenOptions::default(), observer.clone())
        .await
        .unwrap();

    let watch = backend.watch().await;
    let (target_id, _) = watch.add_target().await;
    watch.target_change("ADD", &[target_id]).await;
    watch
        .document("rooms/a", json!({ "x": int(1) }), 1, &[target_id])
        .await;
    watch.current(&[target_id], "AQ==").await;
    watch.snapshot(1).await;
    observer
        .wait_for(&client, |snapshot| !snapshot.from_cache && snapshot.docs.len() == 1)
        .await;

    let write = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.write(vec![patch("rooms/a", "y", 2)]).await })
    };
    // The handshake is never answered, so the patch stays pending.
    let write_stream = backend.write().await;
    let handshake = write_stream.request().await;
    assert!(handshake.get("writes").is_none());
    observer
        .wait_for(&client, |snapshot| {
            field(snapshot, "rooms/a", "y") == Some(FirestoreValue::from(2i64))
        })
        .await;

    watch
        .document("rooms/a", json!({ "x": int(9) }), 5, &[target_id])
        .await;
    watch.snapshot(5).await;
    let snapshot = observer
        .wait_for(&client, |snapshot| {
            field(snapshot, "rooms/a", "x") == Some(FirestoreValue::from(9i64))
        })
        .await;
    assert_eq!(field(&snapshot, "rooms/a", "y"), Some(FirestoreValue::from(2i64)));
    assert!(snapshot.has_pending_writes());

    write.abort();
    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn limit_query_refills_from_cache() {
    let (client, mut backend) = start_single_client("limit-refill").await;
    let everything = Arc::new(Collector::default());
    client
        .listen(rooms(), ListenOptions::default(), everything.clone())
        .await
        .unwrap();

    let watch = backend.watch().await;
    let (target_id, _) = watch.add_target().await;
    watch.target_change("ADD", &[target_id]).await;
    watch
        .document("rooms/d1", json!({ "score": int(10) }), 1, &[target_id])
        .await;
    watch
        .document("rooms/d2", json!({ "score": int(8) }), 1, &[target_id])
        .await;
    watch
        .document("rooms/d3", json!({ "score": int(5) }), 1, &[target_id])
        .await;
    watch.current(&[target_id], "AQ==").await;
    watch.snapshot(1).await;
    everything
        .wait_for(&client, |snapshot| snapshot.docs.len() == 3 && !snapshot.from_cache)
        .await;

    let top_two = rooms()
        .with_order_by(OrderBy::new(FieldPath::from_single("score"), Direction::Descending))
        .with_limit_to_first(2);
    let limited = Arc::new(Collector::default());
    client
        .listen(top_two, ListenOptions::default(), limited.clone())
        .await
        .unwrap();
    let initial = limited
        .wait_for(&client, |snapshot| snapshot.docs.len() == 2)
        .await;
    assert_eq!(keys(&initial), vec!["rooms/d1", "rooms/d2"]);
    assert!(initial.from_cache);

    watch
        .document("rooms/d1", json!({ "score": int(3) }), 2, &[target_id])
        .await;
    watch.snapshot(2).await;
    let refilled = limited
        .wait_for(&client, |snapshot| {
            keys(snapshot) == vec!["rooms/d2".to_string(), "rooms/d3".to_string()]
        })
        .await;
    assert_eq!(refilled.docs.len(), 2);

    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn existence_filter_mismatch_resets_target() {
    let (client, mut backend) = start_single_client("existence-filter").await;
    let observer = Arc::new(Collector::default());
    let options = ListenOptions {
        include_metadata_changes: true,
        ..ListenOptions::default()
    };
    client
        .listen(rooms(), options, observer.clone())
        .await
        .unwrap();

    let watch = backend.watch().await;
    let (target_id, _) = watch.add_target().await;
    watch.target_change("ADD", &[target_id]).await;
    for path in ["rooms/a", "rooms/b", "rooms/c"] {
        watch.document(path, json!({ "x": int(1) }), 1, &[target_id]).await;
    }
    watch.current(&[target_id], "AQ==").await;
    watch.snapshot(1).await;
    observer
        .wait_for(&client, |snapshot| snapshot.docs.len() == 3 && !snapshot.from_cache)
        .await;

    watch.existence_filter(target_id, 2).await;
    watch.snapshot(2).await;
    assert_eq!(watch.remove_target().await, target_id);
    let (relisten_id, relisten) = watch.add_target().await;
    assert_eq!(relisten_id, target_id);
    assert!(relisten.get("resumeToken").is_none());
    observer
        .wait_for(&client, |snapshot| snapshot.docs.len() == 3 && snapshot.from_cache)
        .await;

    watch.target_change("REMOVE", &[target_id]).await;
    watch.target_change("ADD", &[target_id]).await;
    for path in ["rooms/a", "rooms/b"] {
        watch.document(path, json!({ "x": int(1) }), 3, &[target_id]).await;
    }
    watch.current(&[target_id], "Ag==").await;
    watch.snapshot(3).await;

    // The leftover document is resolved through a document target.
    let (limbo_id, limbo) = watch.add_target().await;
    assert_ne!(limbo_id, target_id);
    assert_eq!(
        limbo["documents"]["documents"][0],
        json!(common::document_name("rooms/c"))
    );
    watch.target_change("ADD", &[limbo_id]).await;
    watch.current(&[limbo_id], "Aw==").await;
    watch.snapshot(4).await;

    let resolved = observer
        .wait_for(&client, |snapshot| snapshot.docs.len() == 2 && !snapshot.from_cache)
        .await;
    assert_eq!(keys(&resolved), vec!["rooms/a", "rooms/b"]);
    assert_eq!(
        client.get_document_from_local_cache(key("rooms/c")).await.unwrap(),
        None
    );

    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn primary_lease_moves_to_remaining_client() {
    let persistence_key = unique_name("lease-handoff");
    let database = KvDatabase::new(&persistence_key);
    let web_storage = WebStorageArea::new();
    let mut shared = settings(&persistence_key);
    shared.synchronize_tabs = true;

    let (first, mut first_backend) = start_client(
        shared.clone(),
        Arc::clone(&database),
        Arc::clone(&web_storage),
    )
    .await;
    let mut second_settings = shared.clone();
    second_settings.client_id = format!("{persistence_key}-second");
    let (second, mut second_backend) =
        start_client(second_settings, database, web_storage).await;
    assert!(first.is_primary_client());
    assert!(!second.is_primary_client());

    // A secondary's listen is served by the primary's watch stream.
    let observer = Arc::new(Collector::default());
    second
        .listen(rooms(), ListenOptions::default(), observer.clone())
        .await
        .unwrap();
    let first_watch = first_backend.watch().await;
    let (target_id, _) = first_watch.add_target().await;

    first.terminate().await.unwrap();
    second
        .async_queue()
        .run_all_delayed_operations_until(TimerId::ClientMetadataRefresh)
        .await;
    assert!(eventually(&second, || second.is_primary_client()).await);

    let second_watch = second_backend.watch().await;
    let (taken_over, _) = second_watch.add_target().await;
    assert_eq!(taken_over, target_id);

    second.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_write_reverts_to_deleted_document() {
    let (client, mut backend) = start_single_client("rejected-write").await;
    let observer = Arc::new(Collector::default());
    client
        .listen(rooms(), ListenOptions::default(), observer.clone())
        .await
        .unwrap();

    let watch = backend.watch().await;
    let (target_id, _) = watch.add_target().await;
    watch.target_change("ADD", &[target_id]).await;
    watch
        .document("rooms/a", json!({ "x": int(1) }), 1, &[target_id])
        .await;
    watch.current(&[target_id], "AQ==").await;
    watch.snapshot(1).await;
    observer
        .wait_for(&client, |snapshot| snapshot.docs.len() == 1 && !snapshot.from_cache)
        .await;

    watch.delete("rooms/a", 2, &[target_id]).await;
    watch.snapshot(2).await;
    observer
        .wait_for(&client, |snapshot| snapshot.docs.is_empty() && !snapshot.from_cache)
        .await;

    let write = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.write(vec![patch("rooms/a", "y", 2)]).await })
    };
    let write_stream = backend.write().await;
    let handshake = write_stream.request().await;
    assert!(handshake.get("writes").is_none());
    write_stream.send(json!({ "streamToken": "AQ==" })).await;
    let request = write_stream.request().await;
    assert_eq!(request["writes"].as_array().map(Vec::len), Some(1));
    write_stream
        .fail(FirestoreError::new(
            FirestoreErrorCode::FailedPrecondition,
            "no document to update",
        ))
        .await;

    let err = tokio::time::timeout(Duration::from_secs(5), write)
        .await
        .expect("write settles")
        .expect("write task")
        .unwrap_err();
    assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);

    let cached = client.get_documents_from_local_cache(rooms()).await.unwrap();
    assert!(cached.docs.is_empty());
    assert!(!cached.has_pending_writes());
    assert_eq!(
        client.get_document_from_local_cache(key("rooms/a")).await.unwrap(),
        None
    );
    assert!(observer.errors().is_empty());

    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn write_stream_token_survives_restart() {
    let persistence_key = unique_name("stream-token");
    let database = KvDatabase::new(&persistence_key);
    let web_storage = WebStorageArea::new();

    let (first, mut first_backend) = start_client(
        settings(&persistence_key),
        Arc::clone(&database),
        Arc::clone(&web_storage),
    )
    .await;
    let _unacknowledged = {
        let client = Arc::clone(&first);
        tokio::spawn(async move { client.write(vec![set("rooms/a", "x", 1)]).await })
    };
    let write_stream = first_backend.write().await;
    let handshake = write_stream.request().await;
    assert!(handshake.get("streamToken").is_none());
    write_stream.send(json!({ "streamToken": "AQ==" })).await;
    let request = write_stream.request().await;
    assert_eq!(request["streamToken"], json!("AQ=="));
    first.terminate().await.unwrap();

    let (second, mut second_backend) =
        start_client(settings(&persistence_key), database, web_storage).await;
    let write_stream = second_backend.write().await;
    let handshake = write_stream.request().await;
    assert_eq!(handshake["streamToken"], json!("AQ=="));
    write_stream.send(json!({ "streamToken": "Ag==" })).await;
    let resent = write_stream.request().await;
    assert_eq!(resent["writes"].as_array().map(Vec::len), Some(1));
    write_stream
        .send(json!({
            "streamToken": "Aw==",
            "commitTime": "1970-01-01T00:00:05Z",
            "writeResults": [{}]
        }))
        .await;
    let queue = second.async_queue();
    let write_idle = || queue.contains_delayed_operation(TimerId::WriteStreamIdle);
    assert!(eventually(&second, write_idle).await);

    second.terminate().await.unwrap();
}
