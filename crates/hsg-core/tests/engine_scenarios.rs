//! End-to-end scenarios against a real engine: temp SQLite file, synthetic
//! embeddings, no network. These mirror the behavioral contract of the
//! engine: dedup, classification, retrieval, decay cold-store, reflection,
//! key rotation, and concurrent queries.

use hsg_core::prelude::*;
use hsg_core::storage::sqlite::{SqliteHandle, SqliteStorage};
use hsg_core::vector_store::sqlite::SqliteVectorStore;
use std::sync::Arc;

fn test_config(dir: &std::path::Path) -> Config {
    Config {
        db_url: format!("sqlite://{}", dir.join("hsg.db").display()),
        vec_dim: 256,
        reflect_min: 2,
        ..Default::default()
    }
}

async fn open_engine(dir: &std::path::Path) -> Arc<Engine> {
    Engine::open(test_config(dir)).await.expect("engine opens")
}

/// A second, direct handle onto the engine's database for row surgery
fn raw_stores(dir: &std::path::Path) -> (SqliteStorage, SqliteVectorStore) {
    let handle = SqliteHandle::open(Some(dir.join("hsg.db"))).expect("handle opens");
    (
        SqliteStorage::new(handle.clone()),
        SqliteVectorStore::new(handle),
    )
}

// ============================================================================
// DEDUPLICATION
// ============================================================================

#[tokio::test]
async fn dedup_same_content_boosts_existing_row() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    let first = engine
        .add("Paris trip in March", Some("u1"), &[], Default::default())
        .await
        .unwrap();
    assert!(!first.deduplicated());

    let second = engine
        .add("Paris trip in March", Some("u1"), &[], Default::default())
        .await
        .unwrap();
    assert!(second.deduplicated());
    assert_eq!(second.id(), first.id());

    // Exactly one row, salience boosted past the initial value
    let history = engine.history("u1", 100, 0).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].salience >= 0.55, "salience {}", history[0].salience);
}

#[tokio::test]
async fn dedup_is_user_scoped() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    let a = engine
        .add("Paris trip in March", Some("u1"), &[], Default::default())
        .await
        .unwrap();
    let b = engine
        .add("Paris trip in March", Some("u2"), &[], Default::default())
        .await
        .unwrap();
    assert!(!b.deduplicated());
    assert_ne!(a.id(), b.id());
}

#[tokio::test]
async fn batch_ingest_mixes_stored_and_deduplicated() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine
        .add("Weekly standup notes from the platform team", Some("u1"), &[], Default::default())
        .await
        .unwrap();

    let items = vec![
        IngestRequest::new("Weekly standup notes from the platform team"),
        IngestRequest::new("I deployed the payment service to staging yesterday"),
        IngestRequest::new("The mitochondria is the powerhouse of the cell"),
    ];
    let outcomes = engine.add_batch(&items, Some("u1")).await.unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].deduplicated());
    assert!(!outcomes[1].deduplicated());
    assert!(!outcomes[2].deduplicated());

    // One row for the duplicate, two new ones
    assert_eq!(engine.history("u1", 100, 0).await.unwrap().len(), 3);
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

#[tokio::test]
async fn episodic_content_classifies_episodic() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    let outcome = engine
        .add(
            "I went to Paris yesterday and loved the Eiffel Tower",
            Some("u1"),
            &[],
            Default::default(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.primary_sector(), Sector::Episodic);
}

#[tokio::test]
async fn metadata_can_force_sector() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    let meta: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(r#"{"sector": "procedural"}"#).unwrap();
    let outcome = engine
        .add("I went to Paris yesterday", Some("u1"), &[], meta)
        .await
        .unwrap();
    assert_eq!(outcome.primary_sector(), Sector::Procedural);
}

// ============================================================================
// SEARCH
// ============================================================================

#[tokio::test]
async fn search_ranks_topical_memory_high() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    let travel = engine
        .add(
            "Our trip to Paris was wonderful, we visited the Eiffel Tower and explored the city",
            Some("u1"),
            &[],
            Default::default(),
        )
        .await
        .unwrap();
    engine
        .add(
            "I feel so excited and happy about the new project launch",
            Some("u1"),
            &[],
            Default::default(),
        )
        .await
        .unwrap();
    engine
        .add(
            "How to configure the build pipeline: first install the toolchain, then run it",
            Some("u1"),
            &[],
            Default::default(),
        )
        .await
        .unwrap();

    let filters = SearchFilters {
        user_id: Some("u1".into()),
        ..Default::default()
    };
    let results = engine.search("Paris travel experience", 5, filters).await.unwrap();
    assert!(!results.is_empty());

    let travel_pos = results
        .iter()
        .position(|r| r.id == travel.id())
        .expect("travel memory retrieved");
    assert!(travel_pos < 2, "travel memory ranked at {travel_pos}");

    // The topical hit carries a trace with a non-empty path and real metrics
    let trace = results[travel_pos].trace.as_ref().expect("trace attached");
    assert!(!trace.path.is_empty());
    assert!(trace.metrics.sim_adj > 0.0);
    assert!(!trace.justification.is_empty());
}

#[tokio::test]
async fn search_never_leaks_across_users() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine
        .add("Paris travel notes for user one", Some("u1"), &[], Default::default())
        .await
        .unwrap();
    engine
        .add("Paris travel notes for user two", Some("u2"), &[], Default::default())
        .await
        .unwrap();

    let filters = SearchFilters {
        user_id: Some("u1".into()),
        ..Default::default()
    };
    let results = engine.search("paris travel", 10, filters).await.unwrap();
    assert!(!results.is_empty());
    assert!(results.iter().all(|r| r.user_id == "u1"));
}

#[tokio::test]
async fn search_result_cache_serves_repeat_queries() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine
        .add("Rust ownership rules are strict", Some("u1"), &[], Default::default())
        .await
        .unwrap();

    let filters = SearchFilters {
        user_id: Some("u1".into()),
        ..Default::default()
    };
    let first = engine
        .search("rust ownership", 5, filters.clone())
        .await
        .unwrap();
    let second = engine.search("rust ownership", 5, filters).await.unwrap();
    let ids_a: Vec<&str> = first.iter().map(|r| r.id.as_str()).collect();
    let ids_b: Vec<&str> = second.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids_a, ids_b);
}

#[tokio::test]
async fn retrieval_reinforces_salience() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    let outcome = engine
        .add("Kubernetes upgrade playbook for the cluster", Some("u1"), &[], Default::default())
        .await
        .unwrap();
    let before = engine.get(outcome.id(), None).await.unwrap().unwrap().salience;

    let filters = SearchFilters {
        user_id: Some("u1".into()),
        ..Default::default()
    };
    engine
        .search("kubernetes upgrade", 5, filters)
        .await
        .unwrap();

    let after = engine.get(outcome.id(), None).await.unwrap().unwrap().salience;
    assert!(after > before, "salience {before} -> {after}");
}

// ============================================================================
// DECAY / COLD STORE
// ============================================================================

#[tokio::test]
async fn decay_moves_stale_memory_to_cold_store() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    let outcome = engine
        .add(
            "I visited the old lighthouse on the northern coast last summer",
            Some("u1"),
            &[],
            Default::default(),
        )
        .await
        .unwrap();
    let id = outcome.id().to_string();
    let sector = outcome.primary_sector();

    // Age the memory 60 days via a direct handle on the same database
    let (raw_store, raw_vectors) = raw_stores(dir.path());
    let rec = raw_store.memory(&id, None).await.unwrap().unwrap();
    let old = rec.last_seen_at - 60 * 86_400_000;
    raw_store
        .touch_memory(&id, old, 0.15, old, None)
        .await
        .unwrap();

    let stats = engine.run_decay_once().await.unwrap().expect("cycle ran");
    assert!(stats.processed >= 1);
    assert!(stats.fingerprinted >= 1);

    // Main-sector vector is gone; a small cold vector took its place
    assert!(raw_vectors
        .vector(&id, sector.as_str(), None)
        .await
        .unwrap()
        .is_none());
    let cold = raw_vectors
        .vector(&id, &format!("{}_cold", sector.as_str()), None)
        .await
        .unwrap()
        .expect("cold vector present");
    assert!(cold.vector.len() <= 64);

    let rec = raw_store.memory(&id, None).await.unwrap().unwrap();
    assert!(rec.generated_summary.is_some());
}

#[tokio::test]
async fn decay_cooldown_defers_back_to_back_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine
        .add("anything at all", Some("u1"), &[], Default::default())
        .await
        .unwrap();

    let first = engine.run_decay_once().await.unwrap();
    assert!(first.is_some());
    let second = engine.run_decay_once().await.unwrap();
    assert!(second.is_none(), "second cycle should hit the cooldown");
}

// ============================================================================
// REFLECTION
// ============================================================================

#[tokio::test]
async fn reflection_consolidates_near_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    // Five near-duplicate emotional memories: a long shared core with one
    // distinct trailing token each. Dedup needs an exact simhash match, so a
    // single-token difference keeps them as separate rows while their
    // embeddings stay close enough to cluster.
    let core = "I feel so excited and happy about the amazing progress that artificial \
                intelligence and machine learning research has been making lately";
    let variants = ["tonight", "honestly", "genuinely", "definitely", "absolutely"];
    let mut source_ids = Vec::new();
    for v in variants {
        let outcome = engine
            .add(&format!("{core} {v}"), Some("u1"), &[], Default::default())
            .await
            .unwrap();
        assert!(!outcome.deduplicated(), "variant '{v}' deduplicated");
        source_ids.push(outcome.id().to_string());
    }

    let before: f64 = {
        let item = engine.get(&source_ids[0], None).await.unwrap().unwrap();
        item.salience
    };

    let outcome = engine.run_reflection_once(Some("u1")).await.unwrap();
    assert_eq!(outcome.created, 1, "expected exactly one reflection");

    // The synthesized memory is reflective and tagged
    let history = engine.history("u1", 100, 0).await.unwrap();
    let reflections: Vec<_> = history
        .iter()
        .filter(|m| m.primary_sector == Sector::Reflective)
        .collect();
    assert_eq!(reflections.len(), 1);
    assert!(reflections[0].tags.contains(&"reflect:auto".to_string()));

    // Sources are marked consolidated and boosted
    for id in &source_ids {
        let item = engine.get(id, None).await.unwrap().unwrap();
        assert_eq!(
            item.metadata.get("consolidated"),
            Some(&serde_json::Value::Bool(true)),
            "source {id} not consolidated"
        );
    }
    let after = engine.get(&source_ids[0], None).await.unwrap().unwrap().salience;
    assert!(after > before, "source salience {before} -> {after}");

    // A second pass finds nothing new to consolidate
    let again = engine.run_reflection_once(Some("u1")).await.unwrap();
    assert_eq!(again.created, 0);
}

// ============================================================================
// UPDATE / OWNERSHIP
// ============================================================================

#[tokio::test]
async fn update_replaces_content_and_bumps_version() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    let outcome = engine
        .add("The capital of France is Paris", Some("u1"), &[], Default::default())
        .await
        .unwrap();

    let updated = engine
        .update(
            outcome.id(),
            Some("I went to Lyon yesterday for the conference"),
            Some(&["travel".to_string()]),
            None,
            Some("u1"),
        )
        .await
        .unwrap();
    assert!(updated.version >= 2);
    assert_eq!(updated.primary_sector, Sector::Episodic);
    assert!(updated.tags.contains(&"travel".to_string()));
    assert!(updated.content.contains("Lyon"));
}

#[tokio::test]
async fn ownership_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    let outcome = engine
        .add("private note", Some("u1"), &[], Default::default())
        .await
        .unwrap();

    // Reads by another user come back empty
    assert!(engine.get(outcome.id(), Some("u2")).await.unwrap().is_none());
    assert!(engine.get(outcome.id(), Some("u1")).await.unwrap().is_some());

    // Mutations by another user are denied
    let err = engine
        .update(outcome.id(), Some("stolen"), None, None, Some("u2"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AuthDenied));

    let err = engine.delete(outcome.id(), Some("u2")).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound));
}

#[tokio::test]
async fn import_preserves_id_and_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    let outcome = engine
        .import(
            "restored memory from a backup",
            Some("u1"),
            &[],
            Default::default(),
            Some("fixed-id-0001".to_string()),
            Some(1_600_000_000_000),
        )
        .await
        .unwrap();
    assert_eq!(outcome.id(), "fixed-id-0001");

    let item = engine.get("fixed-id-0001", None).await.unwrap().unwrap();
    assert_eq!(item.created_at, 1_600_000_000_000);
}

// ============================================================================
// DELETE / HISTORY / STATS
// ============================================================================

#[tokio::test]
async fn delete_cascades_and_delete_all_clears_user() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    let a = engine
        .add("first note about gardening tools", Some("u1"), &[], Default::default())
        .await
        .unwrap();
    engine
        .add("second note about gardening soil", Some("u1"), &[], Default::default())
        .await
        .unwrap();

    engine.delete(a.id(), Some("u1")).await.unwrap();
    assert!(engine.get(a.id(), None).await.unwrap().is_none());

    let (_, raw_vectors) = raw_stores(dir.path());
    assert!(raw_vectors.vectors_by_id(a.id(), None).await.unwrap().is_empty());

    let removed = engine.delete_all("u1").await.unwrap();
    assert_eq!(removed, 1);
    assert!(engine.history("u1", 10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn stats_and_users_reflect_contents() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    engine
        .add("I went to the museum yesterday", Some("alice"), &[], Default::default())
        .await
        .unwrap();
    engine
        .add("The speed of light is a constant", Some("bob"), &[], Default::default())
        .await
        .unwrap();

    let users = engine.list_users().await.unwrap();
    assert_eq!(users, vec!["alice".to_string(), "bob".to_string()]);

    let stats = engine.stats(None).await.unwrap();
    assert_eq!(stats.total_memories, 2);
    assert_eq!(stats.user_count, 2);

    let alice_stats = engine.stats(Some("alice")).await.unwrap();
    assert_eq!(alice_stats.total_memories, 1);
}

// ============================================================================
// ENCRYPTION / KEY ROTATION
// ============================================================================

fn encrypted_config(dir: &std::path::Path, key: &str, secondary: &[&str]) -> Config {
    Config {
        encryption_enabled: true,
        encryption_key: Some(key.to_string()),
        encryption_secondary_keys: secondary.iter().map(|s| s.to_string()).collect(),
        ..test_config(dir)
    }
}

#[tokio::test]
async fn rotate_key_rewrites_under_new_primary() {
    let dir = tempfile::tempdir().unwrap();

    let old_key = "original-key-0123456789";
    let new_key = "rotated-key-9876543210";

    // Write under the old key
    {
        let engine = Engine::open(encrypted_config(dir.path(), old_key, &[]))
            .await
            .unwrap();
        engine
            .add("the launch code memo", Some("u1"), &[], Default::default())
            .await
            .unwrap();
        engine.shutdown().await;
    }

    // Rows on disk are enveloped, not plaintext
    {
        let (raw_store, _) = raw_stores(dir.path());
        let rows = raw_store.recent_memories(10, 0, Some("u1")).await.unwrap();
        assert!(rows[0].content.starts_with("enc:"));
    }

    // Rotate with the old key demoted to secondary
    {
        let engine = Engine::open(encrypted_config(dir.path(), new_key, &[old_key]))
            .await
            .unwrap();
        let outcome = engine.rotate_key(Some("u1")).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.rotated_count, 1);
        engine.shutdown().await;
    }

    // The new primary alone decrypts everything
    {
        let engine = Engine::open(encrypted_config(dir.path(), new_key, &[]))
            .await
            .unwrap();
        let history = engine.history("u1", 10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "the launch code memo");
        engine.shutdown().await;
    }
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[tokio::test]
async fn parallel_searches_all_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open_engine(dir.path()).await;

    for i in 0..10 {
        engine
            .add(
                &format!("note number {i} about distributed systems and consensus"),
                Some("u1"),
                &[],
                Default::default(),
            )
            .await
            .unwrap();
    }

    let mut set = tokio::task::JoinSet::new();
    for i in 0..8 {
        let engine = engine.clone();
        set.spawn(async move {
            let filters = SearchFilters {
                user_id: Some("u1".into()),
                ..Default::default()
            };
            engine
                .search(&format!("distributed consensus {i}"), 5, filters)
                .await
        });
    }
    while let Some(res) = set.join_next().await {
        let results = res.expect("task joins").expect("search succeeds");
        assert!(!results.is_empty());
    }
}
