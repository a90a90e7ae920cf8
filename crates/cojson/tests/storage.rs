//! Storage served as a peer: what one node writes, a later node loads.

use std::sync::Arc;

use cojson::perms::{MemberKey, Role};
use cojson::store::{MemoryStore, SqliteStore, Store};
use cojson::{CreateOptions, LoadResult, Node, RawCoId};
use cojson_testkit::fixtures::{settle, TestFixture};
use serde_json::{json, Value};

async fn public_map(node: &Node) -> RawCoId {
    node.with_local(|local| {
        let group = local.create_group()?;
        local.add_member(&group, MemberKey::Everyone, Role::Writer)?;
        local.create_map(
            CreateOptions::owned_by(group),
            [("saved".to_string(), json!(true))],
        )
    })
    .await
    .unwrap()
}

async fn load_json<S: Store + 'static>(fixture: &TestFixture, store: Arc<S>, id: RawCoId) -> Value {
    let node = fixture.node();
    node.add_storage(store).await.unwrap();
    match node.load(id).await.unwrap() {
        LoadResult::Available(view) => view.to_json(),
        other => panic!("expected {id} to load, got {other:?}"),
    }
}

#[tokio::test]
async fn test_sqlite_survives_a_new_node() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("cojson.db");
    let fixture = TestFixture::new();

    let writer = fixture.node();
    writer.add_storage(Arc::new(SqliteStore::open(&path)?)).await?;
    let map = public_map(&writer).await;
    settle(&[&writer]).await;

    let reopened = Arc::new(SqliteStore::open(&path)?);
    assert_eq!(load_json(&fixture, reopened, map).await, json!({"saved": true}));
    Ok(())
}

#[tokio::test]
async fn test_edits_from_a_loading_node_are_stored() {
    let fixture = TestFixture::new();
    let store = Arc::new(MemoryStore::new());

    let first = fixture.node();
    first.add_storage(store.clone()).await.unwrap();
    let map = public_map(&first).await;
    settle(&[&first]).await;
    fixture.advance(10);

    let second = fixture.node();
    second.add_storage(store.clone()).await.unwrap();
    assert!(second.load(map).await.unwrap().is_available());
    second
        .with_local(|local| local.set(&map, "edited", json!("second")))
        .await
        .unwrap();
    settle(&[&second]).await;

    assert_eq!(
        load_json(&fixture, store, map).await,
        json!({"saved": true, "edited": "second"})
    );
}

#[tokio::test]
async fn test_missing_value_is_unavailable_from_storage() {
    let fixture = TestFixture::new();
    let node = fixture.node();
    node.add_storage(Arc::new(MemoryStore::new())).await.unwrap();

    let result = node.load(RawCoId::from_bytes([4; 20])).await.unwrap();
    assert!(matches!(result, LoadResult::Unavailable));
    assert!(node.fatal_error().await.is_none());
}
