//! Significance decay and rescoring through the engine

use chrono::{DateTime, Duration, Utc};
use strata::engine::Engine;
use strata::memory::{Classification, ContentKind, DecayTier, WriteItem};
use strata::router::QueryRequest;
use strata::storage::MetadataFilter;
use strata::testing::open_test_engine;
use tempfile::tempdir;
use uuid::Uuid;

fn fact(content: &str, significance: f64, created_at: DateTime<Utc>) -> WriteItem {
    WriteItem::new(content)
        .with_significance(significance)
        .with_relevance(0.5)
        .with_emotional_impact(0.5)
        .with_technical_value(0.5)
        .with_user_rating(0.5)
        .with_decay_tier(DecayTier::High)
        .created_at(created_at)
}

async fn scores(engine: &Engine, id: Uuid) -> (f64, f64) {
    let entry = engine
        .semantic()
        .get("facts", &id.to_string())
        .await
        .unwrap()
        .unwrap();
    let read = |key: &str| entry.metadata[key].as_f64().unwrap();
    (read("base_score"), read("current_score"))
}

mod decay_tests {
    use super::*;

    #[tokio::test]
    async fn test_scores_halve_after_one_half_life() {
        let dir = tempdir().unwrap();
        let engine = open_test_engine(dir.path()).await.unwrap();
        let t0 = Utc::now() - Duration::minutes(1);

        let mut ids = Vec::new();
        for (content, significance) in [
            ("launch date was moved to march", 0.9),
            ("the staging cluster has four nodes", 0.5),
            ("someone mentioned the weather", 0.1),
        ] {
            let receipt = engine
                .write(
                    fact(content, significance, t0),
                    Classification::kind(ContentKind::Fact),
                )
                .await
                .unwrap();
            assert_eq!(receipt.score.tier, DecayTier::High);
            ids.push(receipt.id);
        }

        let report = engine.rescore_at(t0 + Duration::days(182)).await.unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.updated, 3);
        assert!(!report.already_running);

        let mut currents = Vec::new();
        for id in &ids {
            let (base, current) = scores(&engine, *id).await;
            assert!(
                (current - base / 2.0).abs() < 1e-3,
                "base {base} decayed to {current}"
            );
            currents.push(current);
        }
        assert!(currents[0] > currents[1] && currents[1] > currents[2]);
    }

    #[tokio::test]
    async fn test_rescore_is_idempotent() {
        let dir = tempdir().unwrap();
        let engine = open_test_engine(dir.path()).await.unwrap();
        let t0 = Utc::now() - Duration::minutes(1);
        let id = engine
            .write(
                fact("the api gateway caches for ten seconds", 0.7, t0),
                Classification::kind(ContentKind::Fact),
            )
            .await
            .unwrap()
            .id;

        let later = t0 + Duration::days(30);
        let first = engine.rescore_at(later).await.unwrap();
        assert_eq!(first.updated, 1);
        let (_, after_first) = scores(&engine, id).await;

        let second = engine.rescore_at(later).await.unwrap();
        assert_eq!(second.scanned, 1);
        assert_eq!(second.updated, 0);
        let (_, after_second) = scores(&engine, id).await;
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn test_rescore_never_raises_score_above_base() {
        let dir = tempdir().unwrap();
        let engine = open_test_engine(dir.path()).await.unwrap();
        let t0 = Utc::now() - Duration::minutes(1);
        let id = engine
            .write(
                fact("postgres is the primary datastore", 0.8, t0),
                Classification::kind(ContentKind::Fact),
            )
            .await
            .unwrap()
            .id;

        for _ in 0..5 {
            engine.recall(id).await.unwrap();
        }
        engine.rescore_at(t0 + Duration::days(1)).await.unwrap();
        let (base, current) = scores(&engine, id).await;
        assert!(current <= base);
        assert!(current > 0.0);
    }
}

mod floor_tests {
    use super::*;

    #[tokio::test]
    async fn test_faded_records_hidden_unless_requested() {
        let dir = tempdir().unwrap();
        let engine = open_test_engine(dir.path()).await.unwrap();
        let long_ago = Utc::now() - Duration::days(3650);

        let faded = engine
            .write(
                WriteItem::new("old lunch order was a sandwich")
                    .with_significance(0.2)
                    .with_decay_tier(DecayTier::Low)
                    .created_at(long_ago),
                Classification::kind(ContentKind::Fact),
            )
            .await
            .unwrap()
            .id;
        let fresh = engine
            .write(
                WriteItem::new("new lunch order is a salad"),
                Classification::kind(ContentKind::Fact),
            )
            .await
            .unwrap()
            .id;

        let request = QueryRequest::new("lunch order")
            .with_filter(MetadataFilter::new().eq("kind", "extracted_fact"));
        let ids = engine.query(request.clone()).await.unwrap().ids();
        assert_eq!(ids, vec![fresh]);

        let ids = engine.query(request.include_faded()).await.unwrap().ids();
        assert!(ids.contains(&faded) && ids.contains(&fresh));

        let report = engine.rescore().await.unwrap();
        assert_eq!(report.below_floor, 1);
    }
}
