//! Hybrid retrieval primitives — cosine similarity, lexical term matching,
//! and reciprocal rank fusion.
//!
//! Dense and lexical rankings are combined rank-only: the item at 0-indexed
//! rank `i` in either list contributes `1/(60 + i + 1)` to its fused score.
//! Ties break by insertion order (dense list first).

use std::collections::HashMap;

/// The RRF dampening constant.
pub const RRF_K: f64 = 60.0;

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Serialize an embedding for the store's text column.
pub fn encode_embedding(vector: &[f32]) -> String {
    serde_json::to_string(vector).unwrap_or_else(|_| "[]".into())
}

/// Deserialize an embedding from the store. `None` for malformed rows.
pub fn decode_embedding(text: &str) -> Option<Vec<f32>> {
    serde_json::from_str(text).ok()
}

/// Lowercased query terms for lexical matching.
pub fn query_terms(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Count how many query terms appear in the lower-cased content.
pub fn term_match_count(content_lower: &str, terms: &[String]) -> usize {
    terms
        .iter()
        .filter(|term| content_lower.contains(term.as_str()))
        .count()
}

/// Fuse ranked id lists by reciprocal rank. Returns `(id, score)` sorted by
/// fused score descending, ties broken by first appearance across the input
/// lists in order.
pub fn rrf_fuse<T: Clone + Eq + std::hash::Hash>(lists: &[Vec<T>], top_k: usize) -> Vec<(T, f64)> {
    let mut scores: HashMap<T, f64> = HashMap::new();
    let mut insertion: Vec<T> = Vec::new();

    for list in lists {
        for (rank, id) in list.iter().enumerate() {
            let contribution = 1.0 / (RRF_K + rank as f64 + 1.0);
            match scores.get_mut(id) {
                Some(score) => *score += contribution,
                None => {
                    scores.insert(id.clone(), contribution);
                    insertion.push(id.clone());
                }
            }
        }
    }

    let order: HashMap<&T, usize> = insertion.iter().enumerate().map(|(i, id)| (id, i)).collect();
    let mut fused: Vec<(T, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| order[&a.0].cmp(&order[&b.0]))
    });
    fused.truncate(top_k);
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_cosine_orthogonal_and_degenerate() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 0.001);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_embedding_round_trip() {
        let vector = vec![0.25f32, -1.5, 3.125];
        let encoded = encode_embedding(&vector);
        assert_eq!(decode_embedding(&encoded), Some(vector));
        assert_eq!(decode_embedding("not json"), None);
    }

    #[test]
    fn test_query_terms_and_matching() {
        let terms = query_terms("Quarterly Revenue, 2024!");
        assert_eq!(terms, vec!["quarterly", "revenue", "2024"]);
        assert_eq!(
            term_match_count("the quarterly report shows revenue up", &terms),
            2
        );
        assert_eq!(term_match_count("unrelated text", &terms), 0);
    }

    #[test]
    fn test_rrf_fusion_matches_worked_example() {
        // Dense ranking [d1, d2, d3], lexical ranking [d3, d4, d1]:
        // d1: 1/61 + 1/63, d3: 1/63 + 1/61, d2: 1/62, d4: 1/62.
        // d1 ties d3 and wins on insertion order; d2 ties d4 the same way.
        let dense = vec!["d1", "d2", "d3"];
        let lexical = vec!["d3", "d4", "d1"];
        let fused = rrf_fuse(&[dense, lexical], 4);

        let order: Vec<&str> = fused.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec!["d1", "d3", "d2", "d4"]);

        // top_k=2 keeps the head.
        let top2 = rrf_fuse(&[vec!["d1", "d2", "d3"], vec!["d3", "d4", "d1"]], 2);
        let order: Vec<&str> = top2.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec!["d1", "d3"]);
    }

    #[test]
    fn test_rrf_scores_sum_across_lists() {
        let fused = rrf_fuse(&[vec!["a"], vec!["a"]], 1);
        let expected = 2.0 / (RRF_K + 1.0);
        assert!((fused[0].1 - expected).abs() < 1e-9);
    }

    #[test]
    fn test_rrf_removal_monotonic() {
        // Removing an item from the corpus must not push any other item
        // down in the final ranking.
        let dense = vec!["a", "b", "c", "d"];
        let lexical = vec!["c", "a", "d", "b"];
        let full = rrf_fuse(&[dense.clone(), lexical.clone()], 10);
        let full_order: Vec<&str> = full.iter().map(|(id, _)| *id).collect();

        for removed in ["a", "b", "c", "d"] {
            let dense_cut: Vec<&str> = dense.iter().copied().filter(|x| *x != removed).collect();
            let lexical_cut: Vec<&str> =
                lexical.iter().copied().filter(|x| *x != removed).collect();
            let cut = rrf_fuse(&[dense_cut, lexical_cut], 10);
            let cut_order: Vec<&str> = cut.iter().map(|(id, _)| *id).collect();

            for (i, id) in cut_order.iter().enumerate() {
                let before = full_order.iter().position(|x| x == id).unwrap();
                let removed_before = full_order
                    .iter()
                    .position(|x| *x == removed)
                    .map(|p| p < before)
                    .unwrap_or(false);
                let expected = if removed_before { before - 1 } else { before };
                assert!(
                    i <= expected,
                    "{id} moved down after removing {removed}: {i} > {expected}"
                );
            }
        }
    }

    #[test]
    fn test_rrf_empty_lists() {
        let fused: Vec<(&str, f64)> = rrf_fuse(&[vec![], vec![]], 5);
        assert!(fused.is_empty());
    }
}
