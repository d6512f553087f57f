//! Shared-attribute similarity between tenders.
//!
//! A candidate's score is a weighted sum of the Jaccard overlap of its
//! keyword and requirement targets with the reference tender's, plus an
//! optional bonus when both sit in the same category. Candidates that share
//! nothing on any scored dimension are left out entirely.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entity::{EntityKey, EntityType};
use crate::error::{Error, Result, StoreError};
use crate::graph::{bounded, Direction, GraphStore, DEFAULT_STORE_TIMEOUT};
use crate::relation::RelationType;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankWeights {
    pub keyword: f64,
    pub requirement: f64,
    /// Added when both tenders share an `IN_CATEGORY` target. `None` leaves
    /// category out of scoring altogether.
    pub category_bonus: Option<f64>,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            keyword: 1.0,
            requirement: 1.0,
            category_bonus: None,
        }
    }
}

impl RankWeights {
    #[must_use]
    pub const fn with_category_bonus(mut self, bonus: f64) -> Self {
        self.category_bonus = Some(bonus);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Keyword,
    Requirement,
    Category,
}

impl Dimension {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Requirement => "requirement",
            Self::Category => "category",
        }
    }

    #[must_use]
    pub const fn relation_type(self) -> RelationType {
        match self {
            Self::Keyword => RelationType::HasKeyword,
            Self::Requirement => RelationType::HasRequirement,
            Self::Category => RelationType::InCategory,
        }
    }
}

/// Where candidates come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidatePool {
    /// Tenders two hops away through a shared keyword, requirement or
    /// (when the category bonus is on) category.
    Graph,
    /// These tender keys only.
    Explicit(Vec<String>),
}

/// The scored neighbourhood of one tender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenderProfile {
    pub tender_id: String,
    pub keywords: BTreeSet<String>,
    pub requirements: BTreeSet<String>,
    pub categories: BTreeSet<String>,
    pub award_date: Option<NaiveDate>,
}

impl TenderProfile {
    #[must_use]
    pub fn new(tender_id: impl Into<String>) -> Self {
        Self {
            tender_id: tender_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarTender {
    pub tender_id: String,
    pub score: f64,
    /// Shared targets across all scored dimensions, before normalisation.
    pub overlap_count: usize,
    pub matched_dimensions: Vec<Dimension>,
    pub shared_keywords: Vec<String>,
    pub shared_requirements: Vec<String>,
    pub same_category: bool,
    pub award_date: Option<NaiveDate>,
}

fn jaccard(shared: usize, a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.len() + b.len() - shared;
    if union == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let ratio = shared as f64 / union as f64;
    ratio
}

/// Scores `candidate` against `reference`. `None` for the reference itself
/// and for candidates with no overlap on any scored dimension.
#[must_use]
pub fn score(
    reference: &TenderProfile,
    candidate: &TenderProfile,
    weights: &RankWeights,
) -> Option<SimilarTender> {
    if candidate.tender_id == reference.tender_id {
        return None;
    }

    let shared_keywords: Vec<String> = reference
        .keywords
        .intersection(&candidate.keywords)
        .cloned()
        .collect();
    let shared_requirements: Vec<String> = reference
        .requirements
        .intersection(&candidate.requirements)
        .cloned()
        .collect();
    let same_category = weights.category_bonus.is_some()
        && !reference.categories.is_disjoint(&candidate.categories);

    let overlap_count = shared_keywords.len() + shared_requirements.len() + usize::from(same_category);
    if overlap_count == 0 {
        return None;
    }

    let mut matched_dimensions = Vec::new();
    let mut total = 0.0;
    if !shared_keywords.is_empty() {
        matched_dimensions.push(Dimension::Keyword);
        total += weights.keyword
            * jaccard(shared_keywords.len(), &reference.keywords, &candidate.keywords);
    }
    if !shared_requirements.is_empty() {
        matched_dimensions.push(Dimension::Requirement);
        total += weights.requirement
            * jaccard(
                shared_requirements.len(),
                &reference.requirements,
                &candidate.requirements,
            );
    }
    if same_category {
        matched_dimensions.push(Dimension::Category);
        total += weights.category_bonus.unwrap_or(0.0);
    }

    Some(SimilarTender {
        tender_id: candidate.tender_id.clone(),
        score: total,
        overlap_count,
        matched_dimensions,
        shared_keywords,
        shared_requirements,
        same_category,
        award_date: candidate.award_date,
    })
}

/// Score desc, then overlap count desc, then most recent award date
/// (undated last), then tender id. Total, so results are reproducible.
fn compare(a: &SimilarTender, b: &SimilarTender) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.overlap_count.cmp(&a.overlap_count))
        .then_with(|| b.award_date.cmp(&a.award_date))
        .then_with(|| a.tender_id.cmp(&b.tender_id))
}

/// Scores and orders `candidates`; duplicates and the reference are dropped.
#[must_use]
pub fn rank_profiles<'a>(
    reference: &TenderProfile,
    candidates: impl IntoIterator<Item = &'a TenderProfile>,
    weights: &RankWeights,
    limit: Option<usize>,
) -> Vec<SimilarTender> {
    let mut seen = HashSet::new();
    let mut ranked: Vec<SimilarTender> = candidates
        .into_iter()
        .filter(|c| seen.insert(c.tender_id.clone()))
        .filter_map(|c| score(reference, c, weights))
        .collect();
    ranked.sort_by(compare);
    if let Some(limit) = limit {
        ranked.truncate(limit);
    }
    ranked
}

/// Store-backed ranking over the graph's `HAS_KEYWORD`, `HAS_REQUIREMENT` and
/// `IN_CATEGORY` edges.
pub struct SimilarityRanker {
    store: Arc<dyn GraphStore>,
    weights: RankWeights,
    limit: Option<usize>,
    timeout: Duration,
}

impl SimilarityRanker {
    #[must_use]
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            weights: RankWeights::default(),
            limit: None,
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Upper bound for each store call.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_weights(mut self, weights: RankWeights) -> Self {
        self.weights = weights;
        self
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn dimensions(&self) -> Vec<Dimension> {
        let mut dims = vec![Dimension::Keyword, Dimension::Requirement];
        if self.weights.category_bonus.is_some() {
            dims.push(Dimension::Category);
        }
        dims
    }

    /// Loads the neighbourhood of one tender by canonical key.
    pub async fn profile(&self, tender_id: &str) -> std::result::Result<TenderProfile, StoreError> {
        let key = EntityKey::new(EntityType::Tender, tender_id);
        let mut profile = TenderProfile::new(tender_id);

        for dim in [Dimension::Keyword, Dimension::Requirement, Dimension::Category] {
            let relations = [dim.relation_type()];
            let hits = self
                .store
                .traverse(&key, &relations, Direction::Outgoing, 1);
            let targets: BTreeSet<String> = bounded(self.timeout, hits)
                .await?
                .into_iter()
                .map(|hit| hit.key.canonical_key)
                .collect();
            match dim {
                Dimension::Keyword => profile.keywords = targets,
                Dimension::Requirement => profile.requirements = targets,
                Dimension::Category => profile.categories = targets,
            }
        }

        let entity = bounded(self.timeout, self.store.entity(&key)).await?;
        profile.award_date = entity.and_then(|e| {
            e.attributes
                .get_str("award_date")
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        });
        Ok(profile)
    }

    /// Ranks tenders similar to `reference_tender` (a canonical tender key).
    pub async fn rank(&self, reference_tender: &str, pool: &CandidatePool) -> Result<Vec<SimilarTender>> {
        let reference_key = EntityKey::new(EntityType::Tender, reference_tender);
        if bounded(self.timeout, self.store.entity(&reference_key)).await?.is_none() {
            return Err(Error::UnknownTender(reference_tender.to_string()));
        }
        let reference = self.profile(reference_tender).await?;

        let candidate_ids: BTreeSet<String> = match pool {
            CandidatePool::Graph => {
                let types: Vec<RelationType> =
                    self.dimensions().into_iter().map(Dimension::relation_type).collect();
                let hits = self.store.traverse(&reference_key, &types, Direction::Both, 2);
                bounded(self.timeout, hits)
                    .await?
                    .into_iter()
                    .filter(|hit| hit.key.entity_type == EntityType::Tender)
                    .map(|hit| hit.key.canonical_key)
                    .collect()
            }
            CandidatePool::Explicit(ids) => ids.iter().cloned().collect(),
        };

        let mut candidates = Vec::with_capacity(candidate_ids.len());
        for id in candidate_ids.iter().filter(|id| **id != reference.tender_id) {
            candidates.push(self.profile(id).await?);
        }
        debug!(
            tender = reference_tender,
            candidates = candidates.len(),
            "Scoring similar tenders"
        );

        Ok(rank_profiles(&reference, &candidates, &self.weights, self.limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::entity::Entity;
    use crate::graph::{GraphState, GraphStats, MergeBatch, MergeOutcome, StoredEntity, TraversalHit};

    fn profile(id: &str, keywords: &[&str], requirements: &[&str], date: Option<&str>) -> TenderProfile {
        TenderProfile {
            tender_id: id.into(),
            keywords: keywords.iter().map(ToString::to_string).collect(),
            requirements: requirements.iter().map(ToString::to_string).collect(),
            categories: BTreeSet::new(),
            award_date: date.map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").unwrap()),
        }
    }

    fn ids(ranked: &[SimilarTender]) -> Vec<&str> {
        ranked.iter().map(|r| r.tender_id.as_str()).collect()
    }

    #[test]
    fn test_excludes_reference_and_zero_overlap() {
        let reference = profile("A", &["cloud", "it"], &[], None);
        let candidates = [
            reference.clone(),
            profile("B", &["hosting"], &["iso9001"], None),
            profile("C", &["cloud"], &[], None),
        ];
        let ranked = rank_profiles(&reference, &candidates, &RankWeights::default(), None);
        assert_eq!(ids(&ranked), vec!["C"]);
        assert!((ranked[0].score - 0.5).abs() < f64::EPSILON);
        assert_eq!(ranked[0].matched_dimensions, vec![Dimension::Keyword]);
    }

    #[test]
    fn test_overlap_count_breaks_score_ties() {
        let reference = profile("A", &["cloud", "it"], &["iso27001"], None);
        let candidates = [
            profile("B", &[], &["iso27001"], Some("2024-06-01")),
            profile("C", &["cloud", "it"], &[], Some("2020-01-01")),
        ];
        let ranked = rank_profiles(&reference, &candidates, &RankWeights::default(), None);
        assert_eq!(ids(&ranked), vec!["C", "B"]);
        assert!((ranked[0].score - ranked[1].score).abs() < f64::EPSILON);
        assert_eq!(ranked[0].overlap_count, 2);
    }

    #[test]
    fn test_award_date_then_id_break_remaining_ties() {
        let reference = profile("A", &["cloud"], &[], None);
        let candidates = [
            profile("D", &["cloud"], &[], None),
            profile("B", &["cloud"], &[], Some("2023-01-01")),
            profile("C", &["cloud"], &[], Some("2024-01-01")),
            profile("E", &["cloud"], &[], None),
        ];
        let ranked = rank_profiles(&reference, &candidates, &RankWeights::default(), None);
        assert_eq!(ids(&ranked), vec!["C", "B", "D", "E"]);

        let limited = rank_profiles(&reference, &candidates, &RankWeights::default(), Some(2));
        assert_eq!(ids(&limited), vec!["C", "B"]);
    }

    #[test]
    fn test_category_only_counts_with_bonus() {
        let mut reference = profile("A", &[], &[], None);
        reference.categories.insert("it services".into());
        let mut candidate = profile("B", &[], &[], None);
        candidate.categories.insert("it services".into());

        assert!(score(&reference, &candidate, &RankWeights::default()).is_none());

        let weights = RankWeights::default().with_category_bonus(0.25);
        let hit = score(&reference, &candidate, &weights).unwrap();
        assert!(hit.same_category);
        assert_eq!(hit.overlap_count, 1);
        assert!((hit.score - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_weights_scale_dimensions() {
        let reference = profile("A", &["cloud"], &["iso9001"], None);
        let candidate = profile("B", &["cloud"], &["iso9001"], None);
        let weights = RankWeights {
            keyword: 2.0,
            requirement: 0.5,
            category_bonus: None,
        };
        let hit = score(&reference, &candidate, &weights).unwrap();
        assert!((hit.score - 2.5).abs() < f64::EPSILON);
        assert_eq!(
            hit.matched_dimensions,
            vec![Dimension::Keyword, Dimension::Requirement]
        );
    }

    /// Answers lookups but never finishes a traversal.
    struct StalledTraversal(crate::graph::SqliteGraphStore);

    #[async_trait::async_trait]
    impl GraphStore for StalledTraversal {
        async fn ping(&self) -> std::result::Result<(), StoreError> {
            self.0.ping().await
        }
        async fn schema_version(&self) -> std::result::Result<Option<String>, StoreError> {
            self.0.schema_version().await
        }
        async fn set_schema_version(&self, version: &str) -> std::result::Result<(), StoreError> {
            self.0.set_schema_version(version).await
        }
        async fn apply(&self, batch: &MergeBatch) -> std::result::Result<MergeOutcome, StoreError> {
            self.0.apply(batch).await
        }
        async fn chunk(&self, id: &str) -> std::result::Result<Option<Chunk>, StoreError> {
            self.0.chunk(id).await
        }
        async fn entity(&self, key: &EntityKey) -> std::result::Result<Option<StoredEntity>, StoreError> {
            self.0.entity(key).await
        }
        async fn entities_of_type(
            &self,
            t: EntityType,
        ) -> std::result::Result<Vec<StoredEntity>, StoreError> {
            self.0.entities_of_type(t).await
        }
        async fn mentions_of(&self, key: &EntityKey) -> std::result::Result<Vec<String>, StoreError> {
            self.0.mentions_of(key).await
        }
        async fn traverse(
            &self,
            _start: &EntityKey,
            _types: &[RelationType],
            _direction: Direction,
            _depth: u32,
        ) -> std::result::Result<Vec<TraversalHit>, StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
        async fn snapshot(&self) -> std::result::Result<GraphState, StoreError> {
            self.0.snapshot().await
        }
        async fn stats(&self) -> std::result::Result<GraphStats, StoreError> {
            self.0.stats().await
        }
    }

    #[tokio::test]
    async fn test_rank_gives_up_on_a_stalled_store() {
        let inner = crate::graph::SqliteGraphStore::open_memory().await.unwrap();
        let chunk: Chunk =
            serde_json::from_value(serde_json::json!({"id": "c1", "text": "Tender: A"})).unwrap();
        let tender = Entity::new(EntityKey::new(EntityType::Tender, "A"), "A".into(), 1.0);
        inner
            .apply(&MergeBatch {
                run_id: uuid::Uuid::now_v7(),
                chunk,
                entities: vec![tender],
                relations: Vec::new(),
            })
            .await
            .unwrap();

        let ranker = SimilarityRanker::new(Arc::new(StalledTraversal(inner)))
            .with_timeout(Duration::from_millis(200));
        let err = ranker.rank("A", &CandidatePool::Graph).await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::Timeout(200))), "{err}");
    }
}
