use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tenderkg_core::extract::{CandidateRelation, CompositeRecognizer, Recognition, Recognizer};
use tenderkg_core::graph::GraphStore;
use tenderkg_core::rank::CandidatePool;
use tenderkg_core::{
    BatchRunner, Chunk, DropReason, EntityKey, EntityType, Extractor, GraphMerger, GraphSnapshot,
    MergeBatch, Normalizer, RankWeights, RelationType, RuleRecognizer, SchemaRegistry,
    SimilarityRanker, SqliteGraphStore,
};
use uuid::Uuid;

fn registry() -> Arc<SchemaRegistry> {
    Arc::new(SchemaRegistry::tender_default().unwrap())
}

fn chunk(id: &str, lines: &[&str]) -> Chunk {
    serde_json::from_value(json!({"id": id, "text": lines.join("\n")})).unwrap()
}

async fn store() -> Arc<SqliteGraphStore> {
    Arc::new(SqliteGraphStore::open_memory().await.unwrap())
}

async fn merge(extractor: &Extractor, merger: &GraphMerger, chunk: &Chunk) {
    let batch = MergeBatch::new(Uuid::now_v7(), chunk.clone(), extractor.extract(chunk));
    let report = merger.merge(&batch).await;
    assert!(report.is_success(), "{:?}", report.errors);
}

#[tokio::test]
async fn merging_the_same_chunk_twice_leaves_the_graph_unchanged() {
    let extractor = Extractor::new(registry());
    let store = store().await;
    let merger = GraphMerger::new(store.clone());
    let c = chunk(
        "T1_2021-01-10",
        &[
            "Tender: T1",
            "Agency: MOH",
            "Award Date: 10/01/2021",
            "Awarded To: ACME PTE. LTD.",
            "Amount: $120,000.50",
            "Category: IT Services",
            "Keywords: cloud, hosting",
            "Requirements: ISO 27001; bizSAFE Level 3",
        ],
    );

    merge(&extractor, &merger, &c).await;
    let once = store.snapshot().await.unwrap();
    merge(&extractor, &merger, &c).await;
    assert_eq!(store.snapshot().await.unwrap(), once);

    let tender = store
        .entity(&EntityKey::new(EntityType::Tender, "T1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tender.attributes.get_str("award_date"), Some("2021-01-10"));
    assert_eq!(tender.attributes.get("awarded_amt"), Some(&json!(120_000.5)));
}

#[tokio::test]
async fn merged_state_does_not_depend_on_import_order() {
    let extractor = Extractor::new(registry());
    let early = chunk(
        "T1_2021-01-10",
        &["Tender: T1", "Award Date: 10/01/2021", "Awarded To: Acme Pte Ltd", "Amount: $1,000"],
    );
    let late = chunk(
        "T1_2023-06-01",
        &["Tender: T1", "Award Date: 2023-06-01", "Awarded To: ACME PTE LTD", "Amount: $2,500"],
    );

    let mut states = Vec::new();
    for order in [[&early, &late], [&late, &early]] {
        let store = store().await;
        let merger = GraphMerger::new(store.clone());
        for c in order {
            merge(&extractor, &merger, c).await;
        }
        let tender = store
            .entity(&EntityKey::new(EntityType::Tender, "T1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tender.attributes.get_str("award_date"), Some("2023-06-01"));
        states.push(store.snapshot().await.unwrap());
    }
    assert_eq!(states[0], states[1]);

    let supplier = &states[0].entities[&EntityKey::new(EntityType::Supplier, "ACME PTE LTD")];
    assert_eq!(supplier.display_name, "ACME PTE LTD");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_merges_on_a_file_store_share_one_entity() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        SqliteGraphStore::open(&dir.path().join("graph.db"), Duration::from_secs(5))
            .await
            .unwrap(),
    );
    let runner = BatchRunner::new(
        Arc::new(Extractor::new(registry())),
        GraphMerger::new(store.clone()),
    )
    .with_concurrency(4);

    let chunks: Vec<Chunk> = (0..12)
        .map(|i| {
            chunk(
                &format!("c{i:02}"),
                &[&format!("Tender: T{i}"), "Agency: MOH", "Keywords: cloud"],
            )
        })
        .collect();
    let report = runner.run(chunks).await;
    assert_eq!(report.failed(), 0, "{:?}", report.failures().collect::<Vec<_>>());
    assert_eq!(report.succeeded(), 12);

    let agencies = store.entities_of_type(EntityType::Agency).await.unwrap();
    assert_eq!(agencies.len(), 1);
    let mentions = store.mentions_of(&agencies[0].key).await.unwrap();
    let expected: Vec<String> = (0..12).map(|i| format!("c{i:02}")).collect();
    assert_eq!(mentions, expected);
    assert_eq!(
        store
            .mentions_of(&EntityKey::new(EntityType::Keyword, "cloud"))
            .await
            .unwrap()
            .len(),
        12
    );
    assert!(GraphSnapshot::from_state(&store.snapshot().await.unwrap())
        .orphans()
        .is_empty());
    store.close().await;
}

#[tokio::test]
async fn alias_variants_resolve_to_one_agency_with_a_mention_per_chunk() {
    let registry = registry();
    let extractor = Extractor::new(Arc::clone(&registry));
    let store = store().await;
    let merger = GraphMerger::new(store.clone());

    // Alias variant on one card, a case/space variant on the other.
    let a = chunk("c1", &["Tender: T1", "Agency: MOH"]);
    let b = chunk("c2", &["Tender: T2", "Agency: ministry of health "]);
    merge(&extractor, &merger, &a).await;
    merge(&extractor, &merger, &b).await;

    let normalizer = Normalizer::new(&registry);
    let key = normalizer
        .normalize(EntityType::Agency, "Ministry of Health")
        .unwrap()
        .key;
    assert_eq!(normalizer.normalize(EntityType::Agency, "MOH").unwrap().key, key);

    let agencies = store.entities_of_type(EntityType::Agency).await.unwrap();
    assert_eq!(agencies.len(), 1);
    assert_eq!(agencies[0].key, key);
    assert_eq!(agencies[0].display_name, "Ministry of Health");
    assert_eq!(store.mentions_of(&key).await.unwrap(), vec!["c1", "c2"]);
}

#[tokio::test]
async fn every_entity_is_mentioned_after_a_batch() {
    let registry = registry();
    let store = store().await;
    let runner = BatchRunner::new(
        Arc::new(Extractor::new(registry)),
        GraphMerger::new(store.clone()),
    )
    .with_concurrency(3);

    let chunks = vec![
        chunk("c1", &["Tender: T1", "Agency: MOE", "Keywords: cloud, IT", "Category: IT Services"]),
        chunk("c2", &["Tender: T2", "Agency: LTA", "Keywords: transport", "Closing Date: 2024-05-01"]),
        chunk("c3", &["Tender: T3", "Awarded To: ACME", "Requirements: ISO 9001"]),
        chunk("c4", &["Tender: T1", "Agency: MOE", "Keywords: software"]),
    ];
    let report = runner.run(chunks).await;
    assert_eq!(report.succeeded(), 4);

    let state = store.snapshot().await.unwrap();
    let snapshot = GraphSnapshot::from_state(&state);
    assert!(snapshot.orphans().is_empty());
    assert!(!state.entities.is_empty());
    assert_eq!(
        snapshot.mentioning_chunks(&EntityKey::new(EntityType::Tender, "T1")),
        vec!["c1", "c4"]
    );
}

#[tokio::test]
async fn keyword_sharing_tender_outranks_requirement_only_tender() {
    let extractor = Extractor::new(registry());
    let store = store().await;
    let merger = GraphMerger::new(store.clone());

    for c in [
        chunk("a", &["Tender: A", "Keywords: IT, cloud", "Requirements: ISO27001"]),
        chunk("b", &["Tender: B", "Keywords: catering", "Requirements: ISO 27001"]),
        chunk("c", &["Tender: C", "Keywords: cloud, IT"]),
        chunk("d", &["Tender: D", "Keywords: printing"]),
    ] {
        merge(&extractor, &merger, &c).await;
    }

    let ranker = SimilarityRanker::new(store.clone());
    let ranked = ranker.rank("A", &CandidatePool::Graph).await.unwrap();
    let ids: Vec<&str> = ranked.iter().map(|r| r.tender_id.as_str()).collect();
    assert_eq!(ids, vec!["C", "B"]);
    assert!(ranked.iter().all(|r| r.tender_id != "A" && r.overlap_count > 0));

    let again = ranker.rank("A", &CandidatePool::Graph).await.unwrap();
    assert_eq!(again, ranked);

    let explicit = ranker
        .rank(
            "A",
            &CandidatePool::Explicit(vec!["A".into(), "B".into(), "D".into()]),
        )
        .await
        .unwrap();
    let ids: Vec<&str> = explicit.iter().map(|r| r.tender_id.as_str()).collect();
    assert_eq!(ids, vec!["B"]);
}

#[tokio::test]
async fn category_bonus_brings_in_category_neighbours() {
    let extractor = Extractor::new(registry());
    let store = store().await;
    let merger = GraphMerger::new(store.clone());

    for c in [
        chunk("a", &["Tender: A", "Category: Furniture", "Keywords: desks"]),
        chunk("b", &["Tender: B", "Category: furniture", "Keywords: chairs"]),
    ] {
        merge(&extractor, &merger, &c).await;
    }

    let plain = SimilarityRanker::new(store.clone());
    assert!(plain.rank("A", &CandidatePool::Graph).await.unwrap().is_empty());

    let with_category = SimilarityRanker::new(store.clone())
        .with_weights(RankWeights::default().with_category_bonus(0.5));
    let ranked = with_category.rank("A", &CandidatePool::Graph).await.unwrap();
    assert_eq!(ranked.len(), 1);
    assert!(ranked[0].same_category);
}

/// Proposes an edge the schema does not declare.
struct PublishedByGuess;

impl Recognizer for PublishedByGuess {
    fn name(&self) -> &'static str {
        "published-by-guess"
    }

    fn recognize(&self, _chunk: &Chunk) -> Recognition {
        Recognition::new().with_relation(CandidateRelation {
            relation_type: RelationType::PublishedBy,
            source: (EntityType::Tender, "T1".into()),
            target: (EntityType::Agency, "MOE".into()),
            confidence: 0.9,
        })
    }
}

#[tokio::test]
async fn undeclared_pairs_and_weak_candidates_are_dropped_not_raised() {
    let doc = json!({
        "version": "1.0.0",
        "confidence_threshold": 0.75,
        "entities": [
            {"type": "Tender", "fields": ["tender_no"], "normalization": "identifier"},
            {"type": "Agency", "fields": ["agency"], "normalization": "organization"},
            {"type": "Keyword", "fields": ["keywords", "text"], "normalization": "token"}
        ],
        "rules": [
            {"entity": "Tender", "field": "tender_no", "label": "Tender", "confidence": 1.0},
            {"entity": "Agency", "field": "agency", "label": "Agency", "confidence": 0.9},
            {"entity": "Keyword", "field": "keywords", "label": "Keywords", "split": ",", "confidence": 0.9},
            {"entity": "Keyword", "field": "text", "terms": ["cloud"], "confidence": 0.5}
        ],
        "relations": [
            {"type": "HAS_KEYWORD", "source": "Tender", "target": "Keyword"}
        ]
    });
    let registry = Arc::new(SchemaRegistry::from_json(&doc.to_string()).unwrap());
    let recognizer = CompositeRecognizer::new()
        .with_recognizer(Box::new(RuleRecognizer::new(Arc::clone(&registry))))
        .with_recognizer(Box::new(PublishedByGuess));
    let extractor = Extractor::new(registry).with_recognizer(Box::new(recognizer));
    let store = store().await;
    let merger = GraphMerger::new(store.clone());

    let c = chunk("c1", &["Tender: T1", "Agency: MOE", "Keywords: hosting", "cloud migration"]);
    let extraction = extractor.extract(&c);

    assert!(extraction
        .dropped
        .iter()
        .any(|d| matches!(d.reason, DropReason::BelowThreshold { .. })));
    assert!(extraction
        .dropped
        .iter()
        .any(|d| d.reason == DropReason::UndeclaredRelationPair));
    assert!(extraction.entity(&EntityKey::new(EntityType::Keyword, "cloud")).is_none());
    assert_eq!(extraction.relations.len(), 1);
    assert_eq!(extraction.relations[0].key.relation_type, RelationType::HasKeyword);

    merge(&extractor, &merger, &c).await;
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.entities, 3);
    assert_eq!(stats.relations, 1);
    assert_eq!(stats.mentions, 3);
}
