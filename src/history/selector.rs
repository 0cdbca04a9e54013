use crate::history::{HistoryEntry, HistoryStore};
use std::collections::HashSet;
use std::sync::Arc;

/// Retrieves the prior attempts most relevant to a new question. Ranking is
/// lexical token overlap (Jaccard), which is deterministic for equal inputs
/// and degrades to an empty selection on a cold start.
pub struct FewShotSelector {
    store: Arc<dyn HistoryStore>,
}

impl FewShotSelector {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Up to `k` successful question/SQL pairs, most similar first.
    pub async fn select(&self, question: &str, k: usize) -> Vec<HistoryEntry> {
        rank(self.store.positive().await, question, k)
    }

    /// Up to `k` rejected/failed attempts, used to steer generation away
    /// from known bad patterns.
    pub async fn negative_examples(&self, question: &str, k: usize) -> Vec<HistoryEntry> {
        rank(self.store.negative().await, question, k)
    }
}

fn rank(entries: Vec<HistoryEntry>, question: &str, k: usize) -> Vec<HistoryEntry> {
    if k == 0 || entries.is_empty() {
        return Vec::new();
    }

    let target = tokenize(question);
    let mut scored: Vec<(f64, HistoryEntry)> = entries
        .into_iter()
        .map(|entry| (similarity(&target, &tokenize(&entry.question)), entry))
        .collect();

    // Score, then recency, then text: a total order so equal inputs always
    // produce the same selection.
    scored.sort_by(|a, b| {
        b.0.total_cmp(&a.0)
            .then_with(|| b.1.timestamp.cmp(&a.1.timestamp))
            .then_with(|| a.1.question.cmp(&b.1.question))
            .then_with(|| a.1.sql.cmp(&b.1.sql))
    });

    scored.into_iter().take(k).map(|(_, entry)| entry).collect()
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| token.len() > 1)
        .map(|token| token.to_string())
        .collect()
}

fn similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{MemoryHistoryStore, Outcome};

    async fn store_with(entries: Vec<HistoryEntry>) -> Arc<dyn HistoryStore> {
        let store = MemoryHistoryStore::new();
        for entry in entries {
            store.append(entry).await.expect("append");
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn cold_start_yields_empty_selection() {
        let selector = FewShotSelector::new(Arc::new(MemoryHistoryStore::new()));
        assert!(selector.select("how many shipments", 3).await.is_empty());
        assert!(selector
            .negative_examples("how many shipments", 3)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn most_similar_question_ranks_first() {
        let store = store_with(vec![
            HistoryEntry::success(
                "how many shipments are pending",
                "SELECT count(*) FROM shipment WHERE status = 'pending'",
                1,
            ),
            HistoryEntry::success(
                "list all couriers",
                "SELECT name FROM courier",
                4,
            ),
        ])
        .await;
        let selector = FewShotSelector::new(store);

        let picked = selector.select("how many shipments were delayed", 1).await;
        assert_eq!(picked.len(), 1);
        assert!(picked[0].question.contains("how many shipments"));
    }

    #[tokio::test]
    async fn ranking_is_deterministic_for_equal_inputs() {
        let store = store_with(vec![
            HistoryEntry::success("count shipments by region", "SELECT 1", 1),
            HistoryEntry::success("count shipments by courier", "SELECT 2", 1),
            HistoryEntry::success("total cost of shipments", "SELECT 3", 1),
        ])
        .await;
        let selector = FewShotSelector::new(store);

        let first = selector.select("count shipments", 2).await;
        let second = selector.select("count shipments", 2).await;
        let questions = |v: &[HistoryEntry]| v.iter().map(|e| e.question.clone()).collect::<Vec<_>>();
        assert_eq!(questions(&first), questions(&second));
    }

    #[tokio::test]
    async fn negative_examples_come_from_the_failure_log() {
        let store = store_with(vec![
            HistoryEntry::success("how many shipments", "SELECT count(*) FROM shipment", 1),
            HistoryEntry::failure(
                "how many shipments last week",
                "SELECT count(*) FROM shiments",
                Outcome::ValidationRejected,
                "unknown_identifier: shiments",
            ),
        ])
        .await;
        let selector = FewShotSelector::new(store);

        let negatives = selector.negative_examples("how many shipments", 3).await;
        assert_eq!(negatives.len(), 1);
        assert_eq!(negatives[0].outcome, Outcome::ValidationRejected);
    }

    #[tokio::test]
    async fn k_caps_the_selection() {
        let store = store_with(vec![
            HistoryEntry::success("a shipments", "SELECT 1", 1),
            HistoryEntry::success("b shipments", "SELECT 2", 1),
            HistoryEntry::success("c shipments", "SELECT 3", 1),
        ])
        .await;
        let selector = FewShotSelector::new(store);
        assert_eq!(selector.select("shipments", 2).await.len(), 2);
    }
}
