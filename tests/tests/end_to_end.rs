//! End-to-end scenarios over the public facade.

use std::sync::{Arc, Mutex};

use chronicle_core::cache::{RowGroupCache, RowGroupCacheConfig};
use chronicle_core::router::{hash_shard, NamespaceSpec, Router, RouterConfig, ShardStrategy};
use chronicle_core::storage::{CircuitBreaker, CircuitBreakerConfig, StorageBackend, StorageError};
use chronicle_core::{
    Database, EventOp, IngestHooks, QueryOptions, SortDirection, WriteOptions,
};
use chronicle_tests::{fast_config, open_memory_db, post, user, OutageBackend};
use serde_json::json;

#[tokio::test]
async fn test_create_then_get_returns_version_one() {
    let (_backend, db) = open_memory_db().await;
    let posts = db.collection("posts");

    posts
        .create(json!({"$id": "p1", "$type": "Post", "name": "Hello"}), &WriteOptions::default())
        .await
        .unwrap();

    let doc = posts.get("p1", &QueryOptions::default()).await.unwrap();
    assert_eq!(doc["$id"], json!("posts/p1"));
    assert_eq!(doc["$type"], json!("Post"));
    assert_eq!(doc["name"], json!("Hello"));
    assert_eq!(doc["version"], json!(1));
    assert!(doc["createdAt"].is_string());
    assert!(doc.get("deletedAt").is_none());

    db.dispose().await;
}

#[tokio::test]
async fn test_update_advances_version_and_event_log() {
    let (_backend, db) = open_memory_db().await;
    let posts = db.collection("posts");

    posts
        .create(json!({"$id": "p1", "$type": "Post", "name": "Hello"}), &WriteOptions::default())
        .await
        .unwrap();
    let doc = posts
        .update("p1", json!({"$set": {"name": "Hi"}}), &WriteOptions::default())
        .await
        .unwrap();
    assert_eq!(doc["version"], json!(2));
    assert_eq!(doc["name"], json!("Hi"));

    let (events, _) = db.events_since(None, 100).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!((events[0].op, events[0].seq), (EventOp::Create, 1));
    assert_eq!((events[1].op, events[1].seq), (EventOp::Update, 2));
    assert!(events[1].before.is_some());
    assert!(events[1].after.is_some());

    db.dispose().await;
}

#[tokio::test]
async fn test_ingest_stream_batches_and_reports() {
    let (_backend, db) = open_memory_db().await;

    let records = futures::stream::iter((0..25).map(|i| Ok(json!({"$type": "Item", "n": i}))));
    let reports: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reports);
    let hooks = IngestHooks {
        on_batch_complete: Some(Arc::new(move |r| {
            sink.lock().unwrap().push((r.batch_size, r.total_processed));
        })),
        on_progress: None,
    };

    let report = db
        .ingest_stream("items", records, None, hooks, &WriteOptions::default())
        .await
        .unwrap();
    assert_eq!(report.processed, 25);
    assert_eq!(report.batches, 3);
    assert_eq!(
        *reports.lock().unwrap(),
        vec![(10, 10), (10, 20), (5, 25)]
    );

    let page = db
        .find("items", json!({}), &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(page.items.len(), 25);
    assert!(!page.has_more);

    db.dispose().await;
}

#[tokio::test]
async fn test_lru_eviction_scenario() {
    // maxEntries=2: set A, set B, read A, set C -> B evicted, A and C remain.
    let cache = RowGroupCache::new(RowGroupCacheConfig {
        max_bytes: usize::MAX,
        max_entries: 2,
        ttl: None,
        initial_version: 1,
    });
    let group = |name: &str| {
        let entity = chronicle_core::Entity::create(
            chronicle_core::EntityId::new("x", name),
            "X".into(),
            serde_json::Map::new(),
            "t",
            chrono::Utc::now(),
        );
        Arc::new(chronicle_core::rowgroup::RowGroup::from_entities(
            name.into(),
            1,
            1,
            &[entity],
        ))
    };

    cache.put("f", 0, group("a")).await;
    cache.put("f", 1, group("b")).await;
    assert!(cache.get("f", 0).await.is_some());
    cache.put("f", 2, group("c")).await;

    assert!(cache.get("f", 0).await.is_some());
    assert!(cache.get("f", 1).await.is_none());
    assert!(cache.get("f", 2).await.is_some());
}

#[tokio::test]
async fn test_router_hash_shard_scenario() {
    let router = Router::new(RouterConfig::default());
    router
        .register(NamespaceSpec::flexible("users").with_shard(ShardStrategy::Hash {
            field: "id".into(),
            shard_count: 4,
        }))
        .await;

    let filter = chronicle_core::Filter::parse(&json!({"id": "user-x"})).unwrap();
    let paths = router.resolve_data_paths("users", Some(&filter)).await;
    assert_eq!(paths.len(), 1);
    let expected = hash_shard("user-x", 4);
    assert_eq!(
        paths[0],
        format!("users/_shards/shard={expected}/data.parquet")
    );
}

#[tokio::test]
async fn test_circuit_breaker_scenario() {
    let inner = Arc::new(OutageBackend::new());
    inner.write("seed", b"v").await.unwrap();
    let breaker = CircuitBreaker::new(
        Arc::clone(&inner) as Arc<dyn StorageBackend>,
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            reset_timeout: std::time::Duration::from_millis(50),
            split_directions: true,
            bypass_probes: false,
        },
    );

    inner.set_failing(true);
    for _ in 0..3 {
        assert!(breaker.read("seed").await.is_err());
    }
    let err = breaker.read("seed").await.unwrap_err();
    assert!(matches!(err, StorageError::CircuitOpen { .. }));

    inner.set_failing(false);
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    assert!(breaker.read("seed").await.is_ok());
    assert!(breaker.read("seed").await.is_ok());
    let (read, _) = breaker.metrics().await;
    assert_eq!(read.state, chronicle_core::CircuitState::Closed);
}

#[tokio::test]
async fn test_optimizer_scenario() {
    let (_backend, db) = open_memory_db().await;

    let (plan, _) = db
        .explain(
            "users",
            json!({"status": "active", "age": {"$gte": 18, "$lt": 65}}),
            &QueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(plan.pushdown.pushed_predicates.len(), 3);

    let (plan, _) = db
        .explain("users", json!({"$or": [{"a": 1}, {"b": 2}]}), &QueryOptions::default())
        .await
        .unwrap();
    assert!(plan.pushdown.pushed_predicates.is_empty());
    assert!(plan.pushdown.remaining_filter.get("$or").is_some());

    db.dispose().await;
}

#[tokio::test]
async fn test_filters_sorting_and_pagination() {
    let (_backend, db) = open_memory_db().await;
    let users = db.collection("users");

    for (local, status, age) in [
        ("u1", "active", 30),
        ("u2", "active", 20),
        ("u3", "idle", 40),
        ("u4", "active", 50),
    ] {
        users.create(user(local, status, age), &WriteOptions::default()).await.unwrap();
    }

    let opts = QueryOptions::default().with_sort("age", SortDirection::Desc);
    let page = users
        .find(json!({"status": "active", "age": {"$gte": 25}}), &opts)
        .await
        .unwrap();
    let ages: Vec<i64> = page.items.iter().map(|d| d["age"].as_i64().unwrap()).collect();
    assert_eq!(ages, vec![50, 30]);

    // Cursor pagination walks the full set without overlap.
    let opts = QueryOptions::default().with_limit(3);
    let first = users.find(json!({}), &opts).await.unwrap();
    assert_eq!(first.items.len(), 3);
    assert!(first.has_more);

    let mut opts = QueryOptions::default().with_limit(3);
    opts.cursor = first.cursor.clone();
    let second = users.find(json!({}), &opts).await.unwrap();
    assert_eq!(second.items.len(), 1);
    assert!(!second.has_more);
    assert!(second.cursor.is_none());

    db.dispose().await;
}

#[tokio::test]
async fn test_projection_and_count_and_exists() {
    let (_backend, db) = open_memory_db().await;
    let users = db.collection("users");
    users.create(user("u1", "active", 30), &WriteOptions::default()).await.unwrap();

    let mut opts = QueryOptions::default();
    opts.project = Some(chronicle_core::Projection::Include(vec!["status".into()]));
    let page = users.find(json!({}), &opts).await.unwrap();
    assert_eq!(page.items[0]["status"], json!("active"));
    assert!(page.items[0].get("age").is_none());
    assert_eq!(page.items[0]["$id"], json!("users/u1"));

    assert_eq!(users.count(json!({"status": "active"}), &QueryOptions::default()).await.unwrap(), 1);
    assert!(users.exists("u1").await.unwrap());
    assert!(!users.exists("ghost").await.unwrap());

    db.dispose().await;
}

#[tokio::test]
async fn test_delete_tombstones_and_conflict_rules() {
    let (_backend, db) = open_memory_db().await;
    let posts = db.collection("posts");

    posts.create(json!({"$id": "p1", "name": "x"}), &WriteOptions::default()).await.unwrap();

    // Duplicate create conflicts.
    let err = posts
        .create(json!({"$id": "p1", "name": "y"}), &WriteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), chronicle_core::ErrorKind::Conflict);

    posts.delete("p1", &WriteOptions::default()).await.unwrap();
    assert!(!posts.exists("p1").await.unwrap());
    let err = posts.get("p1", &QueryOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), chronicle_core::ErrorKind::EntityNotFound);

    // Updates to tombstoned entities fail; deletes are not repeatable.
    let err = posts
        .update("p1", json!({"$set": {"name": "z"}}), &WriteOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), chronicle_core::ErrorKind::EntityNotFound);

    // Recreation revives with a higher version.
    let doc = posts.create(json!({"$id": "p1", "name": "again"}), &WriteOptions::default()).await.unwrap();
    assert_eq!(doc["version"], json!(3));

    db.dispose().await;
}

#[tokio::test]
async fn test_relationships_and_hydrate() {
    let (_backend, db) = open_memory_db().await;
    db.create("users", json!({"$id": "u1", "name": "Ada"}), &WriteOptions::default())
        .await
        .unwrap();
    db.create("posts", json!({"$id": "p1", "name": "Hello"}), &WriteOptions::default())
        .await
        .unwrap();

    db.link("posts/p1", "author", "users/u1", None, &WriteOptions::default())
        .await
        .unwrap();

    let edges = db
        .get_relationships("posts/p1", chronicle_core::EdgeDirection::Outgoing, None)
        .await
        .unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].predicate, "author");

    // Reverse index serves the incoming side.
    let incoming = db
        .get_relationships("users/u1", chronicle_core::EdgeDirection::Incoming, None)
        .await
        .unwrap();
    assert_eq!(incoming.len(), 1);

    // Hydration embeds counterpart documents.
    let mut opts = QueryOptions::default();
    opts.hydrate = vec!["author".into()];
    let doc = db.get("posts", "p1", &opts).await.unwrap();
    assert_eq!(doc["author"][0]["$id"], json!("users/u1"));

    db.unlink("posts/p1", "author", "users/u1", &WriteOptions::default())
        .await
        .unwrap();
    let edges = db
        .get_relationships("posts/p1", chronicle_core::EdgeDirection::Outgoing, None)
        .await
        .unwrap();
    assert!(edges.is_empty());

    db.dispose().await;
}

#[tokio::test]
async fn test_flush_then_query_merges_tail() {
    let (_backend, db) = open_memory_db().await;
    let posts = db.collection("posts");

    posts.create(json!({"$id": "p1", "name": "flushed"}), &WriteOptions::default()).await.unwrap();
    db.flush(Some("posts")).await.unwrap();
    assert_eq!(db.get_flush_status(Some("posts")).await[0].unflushed_count, 0);

    // Mutate after the flush; the tail overlays the columnar row.
    posts
        .update("p1", json!({"$set": {"name": "tail"}}), &WriteOptions::default())
        .await
        .unwrap();
    posts.create(json!({"$id": "p2", "name": "tail-only"}), &WriteOptions::default()).await.unwrap();

    let page = posts.find(json!({}), &QueryOptions::default()).await.unwrap();
    assert_eq!(page.items.len(), 2);
    let p1 = page.items.iter().find(|d| d["$id"] == json!("posts/p1")).unwrap();
    assert_eq!(p1["name"], json!("tail"));
    assert_eq!(p1["version"], json!(2));

    db.dispose().await;
}

#[tokio::test]
async fn test_restart_recovers_from_wal_and_row_groups() {
    let dir = tempfile::TempDir::new().unwrap();

    // First life: one flushed entity, one unflushed.
    {
        let backend: Arc<dyn StorageBackend> = Arc::new(
            chronicle_core::LocalFsBackend::open(dir.path()).await.unwrap(),
        );
        let db = Database::open(backend, fast_config()).await.unwrap();
        db.create("posts", json!({"$id": "p1", "name": "durable"}), &WriteOptions::default())
            .await
            .unwrap();
        db.flush(Some("posts")).await.unwrap();
        db.create("posts", json!({"$id": "p2", "name": "wal-only"}), &WriteOptions::default())
            .await
            .unwrap();
        // No dispose: simulate a crash with the second create only in the WAL.
        chronicle_core::db::context::release(db_identity(&db)).await;
    }

    // Second life: recovery must surface both entities and keep sequencing.
    let backend: Arc<dyn StorageBackend> = Arc::new(
        chronicle_core::LocalFsBackend::open(dir.path()).await.unwrap(),
    );
    let db = Database::open(backend, fast_config()).await.unwrap();

    let page = db.find("posts", json!({}), &QueryOptions::default()).await.unwrap();
    assert_eq!(page.items.len(), 2);

    let doc = db
        .create("posts", json!({"$id": "p3", "name": "after-restart"}), &WriteOptions::default())
        .await
        .unwrap();
    assert_eq!(doc["version"], json!(1));
    let (events, _) = db.events_since(None, 100).await.unwrap();
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    db.dispose().await;
}

fn db_identity(db: &Database) -> uuid::Uuid {
    // The facade shares state keyed by backend identity; tests simulating a
    // crash must drop that shared context the way a process exit would.
    db.identity()
}

#[tokio::test]
async fn test_materialized_view_routing() {
    let (_backend, db) = open_memory_db().await;
    let users = db.collection("users");
    users.create(user("u1", "active", 30), &WriteOptions::default()).await.unwrap();
    users.create(user("u2", "idle", 40), &WriteOptions::default()).await.unwrap();

    db.define_view(chronicle_core::MvDefinition {
        name: "active_users".into(),
        source: "users".into(),
        filter: Some(json!({"status": "active"})),
        expand: vec![],
        select: None,
        group_by: None,
        compute: None,
    })
    .await
    .unwrap();

    // The exact-match query routes to the view.
    let (plan, decision) = db
        .explain("users", json!({"status": "active"}), &QueryOptions::default())
        .await
        .unwrap();
    assert!(decision.can_use_mv);
    assert_eq!(plan.strategy, chronicle_core::QueryStrategy::MvLookup);
    assert!(decision.cost_savings > 0.0);

    let page = db
        .find("users", json!({"status": "active"}), &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0]["$id"], json!("users/u1"));

    // Mutations leave the view stale but usable; a refresh catches up.
    users.create(user("u3", "active", 22), &WriteOptions::default()).await.unwrap();
    let views = db.list_views().await;
    assert_eq!(
        views[0].staleness,
        chronicle_core::MvStaleness::Stale { usable: true }
    );
    db.refresh_view("active_users").await.unwrap();
    let page = db
        .find("users", json!({"status": "active"}), &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(page.items.len(), 2);

    db.dispose().await;
}

#[tokio::test]
async fn test_grouped_view_rows() {
    let (_backend, db) = open_memory_db().await;
    for (local, status, amount) in [("o1", "paid", 10), ("o2", "paid", 30), ("o3", "open", 5)] {
        db.create(
            "orders",
            json!({"$id": local, "status": status, "amount": amount}),
            &WriteOptions::default(),
        )
        .await
        .unwrap();
    }

    let mut compute = serde_json::Map::new();
    compute.insert("total".into(), json!({"$sum": "amount"}));
    db.define_view(chronicle_core::MvDefinition {
        name: "totals_by_status".into(),
        source: "orders".into(),
        filter: None,
        expand: vec![],
        select: None,
        group_by: Some(vec!["status".into()]),
        compute: Some(compute),
    })
    .await
    .unwrap();

    let rows = db.view_rows("totals_by_status").await.unwrap();
    assert_eq!(rows.len(), 2);
    let paid = rows.iter().find(|r| r["status"] == json!("paid")).unwrap();
    assert_eq!(paid["total"], json!(40.0));

    // Grouped views never serve row queries.
    let (_, decision) = db
        .explain("orders", json!({}), &QueryOptions::default())
        .await
        .unwrap();
    assert!(!decision.can_use_mv);

    db.dispose().await;
}

#[tokio::test]
async fn test_text_and_vector_search() {
    let (_backend, db) = open_memory_db().await;
    db.register_index(
        "docs",
        chronicle_core::IndexDefinition {
            name: "fts".into(),
            kind: chronicle_core::IndexKind::FullText,
            fields: vec!["body".into()],
            unique: false,
        },
    )
    .await
    .unwrap();
    db.register_index(
        "docs",
        chronicle_core::IndexDefinition {
            name: "embedding".into(),
            kind: chronicle_core::IndexKind::Vector { dims: 2 },
            fields: vec!["embedding".into()],
            unique: false,
        },
    )
    .await
    .unwrap();

    for (local, body, embedding) in [
        ("d1", "rust storage engine", [1.0, 0.0]),
        ("d2", "rust web framework", [0.0, 1.0]),
        ("d3", "cooking recipes", [0.7, 0.7]),
    ] {
        db.create(
            "docs",
            json!({"$id": local, "body": body, "embedding": embedding}),
            &WriteOptions::default(),
        )
        .await
        .unwrap();
    }

    let page = db
        .find("docs", json!({"$text": {"$search": "rust storage"}}), &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0]["$id"], json!("docs/d1"));

    let page = db
        .find(
            "docs",
            json!({"$vector": {"query": [1.0, 0.1], "field": "embedding", "topK": 2}}),
            &QueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0]["$id"], json!("docs/d1"));

    db.dispose().await;
}

#[tokio::test]
async fn test_point_in_time_get() {
    let (_backend, db) = open_memory_db().await;
    let posts = db.collection("posts");
    posts.create(json!({"$id": "p1", "name": "v1"}), &WriteOptions::default()).await.unwrap();
    posts.update("p1", json!({"$set": {"name": "v2"}}), &WriteOptions::default()).await.unwrap();

    let mut opts = QueryOptions::default();
    opts.at_seq = Some(1);
    let doc = posts.get("p1", &opts).await.unwrap();
    assert_eq!(doc["name"], json!("v1"));
    assert_eq!(doc["version"], json!(1));

    opts.at_seq = Some(2);
    let doc = posts.get("p1", &opts).await.unwrap();
    assert_eq!(doc["name"], json!("v2"));

    db.dispose().await;
}

#[tokio::test]
async fn test_compaction_drops_tombstones() {
    let (backend, db) = open_memory_db().await;
    let posts = db.collection("posts");
    posts.create(json!({"$id": "p1", "name": "keep"}), &WriteOptions::default()).await.unwrap();
    db.flush(Some("posts")).await.unwrap();
    posts.create(json!({"$id": "p2", "name": "drop"}), &WriteOptions::default()).await.unwrap();
    posts.delete("p2", &WriteOptions::default()).await.unwrap();
    db.flush(Some("posts")).await.unwrap();

    let rewritten = db.compact("posts").await.unwrap();
    assert_eq!(rewritten, 1);

    let bytes = backend.read("data/posts/data.parquet").await.unwrap();
    let file = chronicle_core::rowgroup::DataFile::decode(&bytes).unwrap();
    assert_eq!(file.group_count(), 1);
    assert_eq!(file.total_rows(), 1);

    let page = posts.find(json!({}), &QueryOptions::default()).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0]["$id"], json!("posts/p1"));

    db.dispose().await;
}

#[tokio::test]
async fn test_collection_parity_with_top_level() {
    let (_backend, db) = open_memory_db().await;

    db.create("blogPosts", json!({"$id": "a", "name": "top"}), &WriteOptions::default())
        .await
        .unwrap();
    // Name-normalized handles address the same namespace.
    let handle = db.collection("blog-posts");
    handle.create(json!({"$id": "b", "name": "handle"}), &WriteOptions::default()).await.unwrap();

    let top = db
        .find("blogPosts", json!({}), &QueryOptions::default())
        .await
        .unwrap();
    let through_handle = handle.find(json!({}), &QueryOptions::default()).await.unwrap();
    assert_eq!(top.items.len(), 2);
    assert_eq!(top.items, through_handle.items);

    db.dispose().await;
}

#[tokio::test]
async fn test_dispose_resets_shared_state() {
    let backend: Arc<dyn StorageBackend> = Arc::new(chronicle_core::MemoryBackend::new());
    let db = Database::open(Arc::clone(&backend), fast_config()).await.unwrap();
    db.create("posts", post("Hello"), &WriteOptions::default()).await.unwrap();
    let metrics = db.metrics().await;
    assert_eq!(metrics.write.mutations, 1);
    db.dispose().await;

    // A fresh facade over the same backend starts from durable state only,
    // with metrics reset.
    let db = Database::open(backend, fast_config()).await.unwrap();
    let metrics = db.metrics().await;
    assert_eq!(metrics.write.mutations, 0);
    let page = db.find("posts", json!({}), &QueryOptions::default()).await.unwrap();
    assert_eq!(page.items.len(), 1);
    db.dispose().await;
}
