//! Integration tests for the semantic store
//!
//! Runs against real LanceDB tables in a temporary directory, with the hashing
//! embedder standing in for a model.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{TimeZone, Utc};
use strata::StrataError;
use strata::config::SemanticConfig;
use strata::embedding::{EmbeddingProvider, HashingEmbedder};
use strata::storage::{
    CollectionSchema, FieldSpec, MetadataFilter, MetadataValue, ScalarKind, SemanticStore,
    ShardPolicy,
};
use tempfile::tempdir;

const DIM: usize = 32;

fn provider(dimension: usize) -> HashingEmbedder {
    HashingEmbedder::semantic(dimension).unwrap()
}

fn notes_schema() -> CollectionSchema {
    CollectionSchema::new(vec![
        FieldSpec::new("content", ScalarKind::String),
        FieldSpec::new("topic", ScalarKind::String),
        FieldSpec::new("rank", ScalarKind::Integer),
        FieldSpec::new("weight", ScalarKind::Float),
        FieldSpec::new("created", ScalarKind::Integer),
        FieldSpec::new("tags", ScalarKind::String),
    ])
    .unwrap()
}

fn meta(content: &str, topic: &str, rank: i64, tags: &[&str]) -> BTreeMap<String, MetadataValue> {
    let mut m = BTreeMap::new();
    m.insert("content".to_string(), MetadataValue::from(content));
    m.insert("topic".to_string(), MetadataValue::from(topic));
    m.insert("rank".to_string(), MetadataValue::Integer(rank));
    m.insert("weight".to_string(), MetadataValue::Float(rank as f64 / 10.0));
    m.insert(
        "created".to_string(),
        MetadataValue::Integer(Utc.with_ymd_and_hms(2024, 1 + (rank as u32 % 3), 15, 0, 0, 0)
            .unwrap()
            .timestamp_micros()),
    );
    m.insert("tags".to_string(), MetadataValue::encode_json(tags).unwrap());
    m
}

async fn open_store(dir: &Path, dimension: usize, config: &SemanticConfig) -> SemanticStore {
    let p = provider(dimension);
    SemanticStore::open(dir, p.provider_id(), p.dimension(), config)
        .await
        .unwrap()
}

/// Test fixture: store with a `notes` collection holding a few entries
async fn seeded_store(dir: &Path, policy: ShardPolicy) -> SemanticStore {
    let store = open_store(dir, DIM, &SemanticConfig::default()).await;
    store
        .ensure_collection("notes", notes_schema(), policy)
        .await
        .unwrap();
    let p = provider(DIM);
    let rows = [
        ("n1", "rust borrow checker rules", "rust", 1, vec!["lang"]),
        ("n2", "tokio runtime scheduling", "rust", 2, vec!["async", "lang"]),
        ("n3", "sourdough bread hydration", "cooking", 3, vec!["food"]),
        ("n4", "lancedb vector tables", "storage", 4, vec!["db"]),
        ("n5", "arrow record batches", "storage", 5, vec!["db", "format"]),
    ];
    for (id, content, topic, rank, tags) in rows {
        store
            .upsert("notes", id, p.embed(content).unwrap(), meta(content, topic, rank, &tags))
            .await
            .unwrap();
    }
    store
}

mod write_tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_is_idempotent_by_id() {
        let dir = tempdir().unwrap();
        let store = seeded_store(dir.path(), ShardPolicy::None).await;
        let p = provider(DIM);

        let content = "rust ownership and lifetimes";
        store
            .upsert("notes", "n1", p.embed(content).unwrap(), meta(content, "rust", 9, &[]))
            .await
            .unwrap();
        store
            .upsert("notes", "n1", p.embed(content).unwrap(), meta(content, "rust", 9, &[]))
            .await
            .unwrap();

        assert_eq!(store.count("notes").await.unwrap(), 5);
        let entry = store.get("notes", "n1").await.unwrap().unwrap();
        assert_eq!(entry.metadata["content"].as_str(), Some(content));
        assert_eq!(entry.metadata["rank"].as_i64(), Some(9));
    }

    #[tokio::test]
    async fn test_rejects_undeclared_and_mistyped_metadata() {
        let dir = tempdir().unwrap();
        let store = seeded_store(dir.path(), ShardPolicy::None).await;
        let p = provider(DIM);

        let mut unknown = meta("x", "rust", 1, &[]);
        unknown.insert("color".to_string(), MetadataValue::from("red"));
        let err = store
            .upsert("notes", "bad1", p.embed("x").unwrap(), unknown)
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Validation(_)));

        let mut mistyped = meta("x", "rust", 1, &[]);
        mistyped.insert("rank".to_string(), MetadataValue::from("one"));
        let err = store
            .upsert("notes", "bad2", p.embed("x").unwrap(), mistyped)
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Validation(_)));

        let err = store
            .upsert("notes", "bad3", vec![0.1; DIM + 1], meta("x", "rust", 1, &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Validation(_)));

        assert_eq!(store.count("notes").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_unknown_collection_is_not_found() {
        let dir = tempdir().unwrap();
        let store = seeded_store(dir.path(), ShardPolicy::None).await;
        let err = store
            .query("missing", &vec![0.0; DIM], None, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_removes_entry() {
        let dir = tempdir().unwrap();
        let store = seeded_store(dir.path(), ShardPolicy::None).await;
        assert!(store.delete("notes", "n3").await.unwrap());
        assert!(!store.delete("notes", "n3").await.unwrap());
        assert!(store.get("notes", "n3").await.unwrap().is_none());
        assert!(store.find("n3").await.unwrap().is_none());
        assert_eq!(store.count("notes").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let _store = seeded_store(dir.path(), ShardPolicy::ByField("topic".to_string())).await;
        }
        let store = open_store(dir.path(), DIM, &SemanticConfig::default()).await;
        assert_eq!(store.collection_names(), vec!["notes".to_string()]);
        assert_eq!(store.count("notes").await.unwrap(), 5);
        let found = store.find("n4").await.unwrap().unwrap();
        assert_eq!(found.collection, "notes");
    }
}

mod query_tests {
    use super::*;

    #[tokio::test]
    async fn test_exact_text_ranks_first() {
        let dir = tempdir().unwrap();
        let store = seeded_store(dir.path(), ShardPolicy::None).await;
        let p = provider(DIM);

        let hits = store
            .query("notes", &p.embed("tokio runtime scheduling").unwrap(), None, 3)
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].entry.id, "n2");
        assert!((hits[0].similarity - 1.0).abs() < 1e-4);
        assert!(hits.windows(2).all(|w| w[0].similarity >= w[1].similarity));
    }

    #[tokio::test]
    async fn test_filters_narrow_results() {
        let dir = tempdir().unwrap();
        let store = seeded_store(dir.path(), ShardPolicy::None).await;
        let query = provider(DIM).embed("anything at all").unwrap();

        let by_topic = MetadataFilter::new().eq("topic", "storage");
        let hits = store
            .query("notes", &query, Some(&by_topic), 10)
            .await
            .unwrap();
        let mut ids: Vec<_> = hits.iter().map(|h| h.entry.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["n4", "n5"]);

        let by_range = MetadataFilter::new().at_least("rank", 2i64).at_most("weight", 0.3);
        let hits = store
            .query("notes", &query, Some(&by_range), 10)
            .await
            .unwrap();
        let mut ids: Vec<_> = hits.iter().map(|h| h.entry.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["n2", "n3"]);

        let by_tag = MetadataFilter::new().has_tag("db");
        let entries = store.scan("notes", Some(&by_tag)).await.unwrap();
        assert_eq!(entries.len(), 2);

        let by_set = MetadataFilter::new().one_of("topic", ["cooking", "rust"]);
        let entries = store.scan("notes", Some(&by_set)).await.unwrap();
        assert_eq!(entries.len(), 3);
    }

    #[tokio::test]
    async fn test_tag_filter_is_exact() {
        let dir = tempdir().unwrap();
        let store = seeded_store(dir.path(), ShardPolicy::None).await;
        // A prefix of a stored tag is not a match
        let entries = store
            .scan("notes", Some(&MetadataFilter::new().has_tag("lan")))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_filter_rejected() {
        let dir = tempdir().unwrap();
        let store = seeded_store(dir.path(), ShardPolicy::None).await;
        let query = vec![0.0; DIM];

        let unknown = MetadataFilter::new().eq("color", "red");
        assert!(matches!(
            store.query("notes", &query, Some(&unknown), 3).await,
            Err(StrataError::Validation(_))
        ));

        let wrong_kind = MetadataFilter::new().eq("rank", "high");
        assert!(matches!(
            store.scan("notes", Some(&wrong_kind)).await,
            Err(StrataError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_k_returns_nothing() {
        let dir = tempdir().unwrap();
        let store = seeded_store(dir.path(), ShardPolicy::None).await;
        let hits = store.query("notes", &vec![0.0; DIM], None, 0).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_unbounded_k_returns_every_entry() {
        let dir = tempdir().unwrap();
        let store = seeded_store(dir.path(), ShardPolicy::ByField("topic".to_string())).await;
        let query = provider(DIM).embed("tokio runtime scheduling").unwrap();
        let hits = store.query("notes", &query, None, usize::MAX).await.unwrap();
        assert_eq!(hits.len(), 5);
        assert_eq!(hits[0].entry.id, "n2");
    }
}

mod shard_tests {
    use super::*;

    #[tokio::test]
    async fn test_field_sharding_fans_out_queries() {
        let dir = tempdir().unwrap();
        let store = seeded_store(dir.path(), ShardPolicy::ByField("topic".to_string())).await;

        let info = store.collection_info("notes").await.unwrap();
        assert_eq!(info.shards, 3);
        assert_eq!(info.entries, 5);

        let p = provider(DIM);
        let hits = store
            .query("notes", &p.embed("sourdough bread hydration").unwrap(), None, 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 5);
        assert_eq!(hits[0].entry.id, "n3");
    }

    #[tokio::test]
    async fn test_changing_shard_key_moves_entry() {
        let dir = tempdir().unwrap();
        let store = seeded_store(dir.path(), ShardPolicy::ByField("topic".to_string())).await;
        let p = provider(DIM);

        let content = "sourdough bread hydration";
        store
            .upsert("notes", "n3", p.embed(content).unwrap(), meta(content, "rust", 3, &[]))
            .await
            .unwrap();

        assert_eq!(store.count("notes").await.unwrap(), 5);
        let entry = store.get("notes", "n3").await.unwrap().unwrap();
        assert_eq!(entry.metadata["topic"].as_str(), Some("rust"));
    }

    #[tokio::test]
    async fn test_month_sharding() {
        let dir = tempdir().unwrap();
        let store = seeded_store(dir.path(), ShardPolicy::ByMonth("created".to_string())).await;
        let info = store.collection_info("notes").await.unwrap();
        // Ranks 1..=5 map to months 2, 3, 1, 2, 3
        assert_eq!(info.shards, 3);
        assert_eq!(info.entries, 5);
    }

    #[tokio::test]
    async fn test_reshard_keeps_every_entry() {
        let dir = tempdir().unwrap();
        let store = seeded_store(dir.path(), ShardPolicy::None).await;
        assert_eq!(store.collection_info("notes").await.unwrap().shards, 1);

        let moved = store
            .reshard("notes", ShardPolicy::ByField("topic".to_string()))
            .await
            .unwrap();
        assert_eq!(moved, 5);

        let info = store.collection_info("notes").await.unwrap();
        assert_eq!(info.shards, 3);
        assert_eq!(info.entries, 5);
        assert!(store.get("notes", "n5").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_shard_field_must_exist() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), DIM, &SemanticConfig::default()).await;
        let err = store
            .ensure_collection("notes", notes_schema(), ShardPolicy::ByField("color".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Validation(_)));
    }

    #[tokio::test]
    async fn test_large_unsharded_collection_is_flagged() {
        let dir = tempdir().unwrap();
        {
            let _seeded = seeded_store(dir.path(), ShardPolicy::None).await;
        }
        let mut config = SemanticConfig::default();
        config.shard_threshold = 3;
        let store = open_store(dir.path(), DIM, &config).await;
        let info = store.collection_info("notes").await.unwrap();
        assert!(info.needs_sharding);
    }
}

mod migration_tests {
    use super::*;

    #[tokio::test]
    async fn test_provider_change_requires_migration() {
        let dir = tempdir().unwrap();
        {
            let _seeded = seeded_store(dir.path(), ShardPolicy::None).await;
        }

        let store = open_store(dir.path(), 16, &SemanticConfig::default()).await;
        assert!(store.needs_migration("notes").await.unwrap().is_some());
        let info = store.collection_info("notes").await.unwrap();
        assert!(info.needs_migration.is_some());

        let new_provider = provider(16);
        let query = new_provider.embed("tokio runtime scheduling").unwrap();
        assert!(matches!(
            store.query("notes", &query, None, 3).await,
            Err(StrataError::MigrationRequired { .. })
        ));
        assert!(matches!(
            store
                .upsert("notes", "n9", query.clone(), meta("new", "rust", 1, &[]))
                .await,
            Err(StrataError::MigrationRequired { .. })
        ));

        let migrated = store
            .migrate_collection("notes", &new_provider, "content")
            .await
            .unwrap();
        assert_eq!(migrated, 5);
        assert!(store.needs_migration("notes").await.unwrap().is_none());

        let hits = store.query("notes", &query, None, 1).await.unwrap();
        assert_eq!(hits[0].entry.id, "n2");
        assert_eq!(hits[0].entry.embedding.len(), 16);
    }

    #[tokio::test]
    async fn test_migration_persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let _seeded = seeded_store(dir.path(), ShardPolicy::None).await;
        }
        {
            let store = open_store(dir.path(), 16, &SemanticConfig::default()).await;
            store
                .migrate_collection("notes", &provider(16), "content")
                .await
                .unwrap();
        }
        let store = open_store(dir.path(), 16, &SemanticConfig::default()).await;
        assert!(store.needs_migration("notes").await.unwrap().is_none());
        assert_eq!(store.collection_info("notes").await.unwrap().dimension, 16);
    }
}
