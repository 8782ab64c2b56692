use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::NodeId;

/// Strategies for ranking aggregated results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankingStrategy {
    /// Normalized inverse vector distance
    Distance,
    /// Weighted combination (alias of Hybrid)
    Relevance,
    /// exp(-age_days / 100)
    Recency,
    /// clip(log1p(access_count) / 10, 0, 1)
    Popularity,
    Hybrid,
}

/// One search result as produced by a node and carried through
/// aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub doc_id: Uuid,
    pub node_id: NodeId,
    /// Vector distance; lower is better
    pub distance: f64,
    /// Effective score after ranking; higher is better
    pub relevance: f64,
    pub filename: String,
    pub file_type: String,
    pub modified_at: Option<DateTime<Utc>>,
    pub access_count: u64,
    pub matched_terms: Vec<String>,
    pub snippet: String,
}

/// The merged, ranked outcome of a distributed search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedResults {
    pub query: String,
    pub query_id: Uuid,
    pub hits: Vec<SearchHit>,
    pub total_results: usize,
    pub searched_nodes: Vec<NodeId>,
    pub responded_nodes: Vec<NodeId>,
    pub failed_nodes: usize,
    pub search_time_ms: f64,
    pub page: usize,
    pub page_size: usize,
    pub has_more: bool,
    pub facets: HashMap<String, Vec<(String, usize)>>,
}

/// Ranking weights for the hybrid strategy; must sum to 1.
#[derive(Debug, Clone, Copy)]
pub struct RankingWeights {
    pub distance: f64,
    pub recency: f64,
    pub popularity: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        RankingWeights { distance: 0.6, recency: 0.2, popularity: 0.2 }
    }
}

/// Merges per-node results: dedupe by document, rescore per strategy, sort,
/// facet and paginate.
pub struct ResultAggregator {
    default_strategy: RankingStrategy,
    weights: RankingWeights,
}

impl ResultAggregator {
    pub fn new(default_strategy: RankingStrategy, weights: RankingWeights) -> Self {
        ResultAggregator { default_strategy, weights }
    }

    /// Dedupe, rescore and rank per-node results into one ordered list.
    pub fn aggregate(
        &self,
        node_results: HashMap<NodeId, Vec<SearchHit>>,
        strategy: Option<RankingStrategy>,
        max_results: usize,
    ) -> Vec<SearchHit> {
        let strategy = strategy.unwrap_or(self.default_strategy);

        // Dedupe by doc id, keeping the lower-distance copy
        let mut best: HashMap<Uuid, SearchHit> = HashMap::new();
        for (_, hits) in node_results {
            for hit in hits {
                match best.get(&hit.doc_id) {
                    Some(existing) if existing.distance <= hit.distance => {}
                    _ => {
                        best.insert(hit.doc_id, hit);
                    }
                }
            }
        }

        let mut all: Vec<SearchHit> = best.into_values().collect();
        self.score(&mut all, strategy);

        if strategy == RankingStrategy::Distance {
            all.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
        } else {
            all.sort_by(|a, b| b.relevance.partial_cmp(&a.relevance).unwrap_or(std::cmp::Ordering::Equal));
        }
        all.truncate(max_results);
        all
    }

    fn score(&self, hits: &mut [SearchHit], strategy: RankingStrategy) {
        if hits.is_empty() {
            return;
        }

        let min_dist = hits.iter().map(|h| h.distance).fold(f64::INFINITY, f64::min);
        let max_dist = hits.iter().map(|h| h.distance).fold(f64::NEG_INFINITY, f64::max);
        let range = if (max_dist - min_dist).abs() < f64::EPSILON { 1.0 } else { max_dist - min_dist };

        for hit in hits.iter_mut() {
            let distance_score = 1.0 - (hit.distance - min_dist) / range;
            hit.relevance = match strategy {
                RankingStrategy::Distance => distance_score,
                RankingStrategy::Recency => recency_score(hit.modified_at),
                RankingStrategy::Popularity => popularity_score(hit.access_count),
                RankingStrategy::Relevance | RankingStrategy::Hybrid => {
                    self.weights.distance * distance_score
                        + self.weights.recency * recency_score(hit.modified_at)
                        + self.weights.popularity * popularity_score(hit.access_count)
                }
            };
        }
    }

    /// Page out of an already ranked hit list.
    #[allow(clippy::too_many_arguments)]
    pub fn paginate(
        &self,
        query: &str,
        ranked: &[SearchHit],
        searched_nodes: Vec<NodeId>,
        responded_nodes: Vec<NodeId>,
        failed_nodes: usize,
        search_time_ms: f64,
        page: usize,
        page_size: usize,
    ) -> AggregatedResults {
        let page = page.max(1);
        let start = (page - 1) * page_size;
        let end = (start + page_size).min(ranked.len());
        let hits = if start < ranked.len() { ranked[start..end].to_vec() } else { Vec::new() };

        AggregatedResults {
            query: query.to_string(),
            query_id: Uuid::new_v4(),
            total_results: ranked.len(),
            facets: build_facets(ranked),
            hits,
            searched_nodes,
            responded_nodes,
            failed_nodes,
            search_time_ms,
            page,
            page_size,
            has_more: end < ranked.len(),
        }
    }
}

/// exp(-age_days / 100): full score today, about 0.74 after 30 days.
fn recency_score(modified_at: Option<DateTime<Utc>>) -> f64 {
    let Some(modified_at) = modified_at else {
        return 0.5;
    };
    let age_days = Utc::now()
        .signed_duration_since(modified_at)
        .num_seconds()
        .max(0) as f64
        / 86_400.0;
    (-age_days / 100.0).exp().clamp(0.0, 1.0)
}

/// Log-scaled access count so very popular documents do not dominate.
fn popularity_score(access_count: u64) -> f64 {
    if access_count == 0 {
        return 0.0;
    }
    ((access_count as f64).ln_1p() / 10.0).clamp(0.0, 1.0)
}

fn build_facets(hits: &[SearchHit]) -> HashMap<String, Vec<(String, usize)>> {
    let mut file_types: HashMap<String, usize> = HashMap::new();
    let mut nodes: HashMap<String, usize> = HashMap::new();

    for hit in hits {
        if !hit.file_type.is_empty() {
            *file_types.entry(hit.file_type.clone()).or_insert(0) += 1;
        }
        *nodes.entry(hit.node_id.to_string()).or_insert(0) += 1;
    }

    let mut facets = HashMap::new();
    for (name, counts) in [("file_type", file_types), ("node", nodes)] {
        let mut sorted: Vec<(String, usize)> = counts.into_iter().collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        facets.insert(name.to_string(), sorted);
    }
    facets
}

/// Pick the content window with the most matched keywords, then bold-mark
/// matching terms of length >= 3 with `**`.
pub fn make_snippet(content: &str, terms: &[String], max_length: usize) -> String {
    if content.is_empty() {
        return String::new();
    }

    // ASCII lowercasing keeps byte offsets aligned with the original text
    let content_lower = content.to_ascii_lowercase();
    let terms_lower: Vec<String> = terms.iter().map(|t| t.to_ascii_lowercase()).collect();

    let preview = if content.len() <= max_length {
        content.to_string()
    } else {
        // Slide a window at stride 50, counting matched terms
        let mut best_pos = 0;
        let mut best_score = 0;
        let mut pos = 0;
        while pos + max_length <= content.len() {
            if !content.is_char_boundary(pos) {
                pos += 1;
                continue;
            }
            let window_end = ceil_boundary(&content_lower, pos + max_length);
            let chunk = &content_lower[pos..window_end];
            let score = terms_lower.iter().filter(|t| chunk.contains(t.as_str())).count();
            if score > best_score {
                best_score = score;
                best_pos = pos;
            }
            pos += 50;
        }

        let start = floor_boundary(content, best_pos.saturating_sub(20));
        let end = ceil_boundary(content, (start + max_length).min(content.len()));
        let mut preview = content[start..end].to_string();
        if start > 0 {
            preview = format!("...{}", preview);
        }
        if end < content.len() {
            preview.push_str("...");
        }
        preview
    };

    bold_terms(&preview, &terms_lower)
}

fn floor_boundary(s: &str, mut pos: usize) -> usize {
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn ceil_boundary(s: &str, mut pos: usize) -> usize {
    while pos < s.len() && !s.is_char_boundary(pos) {
        pos += 1;
    }
    pos.min(s.len())
}

/// Case-insensitive `**term**` marking for terms of length >= 3. ASCII
/// lowercasing keeps match offsets valid in the original text.
fn bold_terms(text: &str, terms_lower: &[String]) -> String {
    let mut result = text.to_string();
    for term in terms_lower {
        if term.len() < 3 {
            continue;
        }
        let mut output = String::with_capacity(result.len());
        let mut rest = result.as_str();
        loop {
            let lower = rest.to_ascii_lowercase();
            match lower.find(term.as_str()) {
                Some(found) => {
                    let end = found + term.len();
                    output.push_str(&rest[..found]);
                    output.push_str("**");
                    output.push_str(&rest[found..end]);
                    output.push_str("**");
                    rest = &rest[end..];
                }
                None => {
                    output.push_str(rest);
                    break;
                }
            }
        }
        result = output;
    }
    result
}
