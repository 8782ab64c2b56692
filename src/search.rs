use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::aggregate::{AggregatedResults, RankingStrategy, RankingWeights, ResultAggregator, SearchHit};
use crate::config::SearchConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::message::RpcMessage;
use crate::metrics::Metrics;
use crate::query::{ProcessedQuery, QueryProcessor, QueryType};
use crate::scatter;
use crate::shard::{shard_owner, HashRing, ShardDirectory};
use crate::state_machine::{NodeId, StateMachine};
use crate::transport::Transport;
use crate::vectorize::VectorizerSet;

/// A search request from the client surface.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub filters: HashMap<String, String>,
    pub page: usize,
    pub page_size: Option<usize>,
    pub ranking: Option<RankingStrategy>,
    /// Explicit targets override candidate selection (admin/debug)
    pub target_nodes: Option<Vec<NodeId>>,
}

struct CachedSearch {
    ranked: Vec<SearchHit>,
    searched_nodes: Vec<NodeId>,
    responded_nodes: Vec<NodeId>,
    failed_nodes: usize,
    keywords: HashSet<String>,
    inserted: Instant,
}

struct LocateEntry {
    nodes: Vec<NodeId>,
    inserted: Instant,
}

/// Distributed query plane: vectorize, locate candidates, scatter-gather
/// with per-node budgets and replica fallback, aggregate and rank.
pub struct DistributedSearch {
    node_id: NodeId,
    config: SearchConfig,
    processor: QueryProcessor,
    aggregator: ResultAggregator,
    transport: Arc<dyn Transport>,
    state_machine: Arc<StateMachine>,
    ring: HashRing,
    /// Directory for the shards this node coordinates
    shard_dir: Arc<Mutex<ShardDirectory>>,
    locate_cache: Mutex<HashMap<String, LocateEntry>>,
    query_cache: Mutex<HashMap<String, CachedSearch>>,
    metrics: Arc<Metrics>,
}

impl DistributedSearch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        config: SearchConfig,
        vectorizers: Arc<VectorizerSet>,
        transport: Arc<dyn Transport>,
        state_machine: Arc<StateMachine>,
        ring: HashRing,
        shard_dir: Arc<Mutex<ShardDirectory>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let processor =
            QueryProcessor::new(vectorizers, config.min_token_length, config.max_query_tokens);
        let weights = RankingWeights {
            distance: config.distance_weight,
            recency: config.recency_weight,
            popularity: config.popularity_weight,
        };
        let aggregator = ResultAggregator::new(RankingStrategy::Hybrid, weights);

        DistributedSearch {
            node_id,
            config,
            processor,
            aggregator,
            transport,
            state_machine,
            ring,
            shard_dir,
            locate_cache: Mutex::new(HashMap::new()),
            query_cache: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn processor(&self) -> &QueryProcessor {
        &self.processor
    }

    /// Execute a distributed search. Partial failure is tolerated: failed
    /// targets are retried on sibling replicas and counted in the response.
    pub async fn search(&self, request: SearchRequest) -> ClusterResult<AggregatedResults> {
        self.metrics.record_search();
        let started = Instant::now();

        let page = request.page.max(1);
        let page_size = request
            .page_size
            .unwrap_or(self.config.default_page_size)
            .min(self.config.max_page_size);

        let cache_key = self.cache_key(&request);
        if self.config.enable_caching {
            if let Some(results) =
                self.paginate_cached(&cache_key, &request.query, page, page_size, started)
            {
                self.metrics.record_cache_hit();
                return Ok(results);
            }
            self.metrics.record_cache_miss();
        }

        let mut processed = self.processor.process(&request.query, None);
        processed.filters.extend(request.filters.clone());

        let candidates = match &request.target_nodes {
            Some(targets) => targets.clone(),
            None => self.locate_candidates(&processed).await,
        };

        if candidates.is_empty() {
            return Ok(self.aggregator.paginate(
                &request.query,
                &[],
                Vec::new(),
                Vec::new(),
                0,
                elapsed_ms(started),
                page,
                page_size,
            ));
        }

        // Fan out with a per-node budget
        let per_node_limit = ((self.config.max_total_results / candidates.len().max(1)) * 2)
            .clamp(1, self.config.max_results_per_node);

        let outcome = self
            .query_nodes(&processed, &candidates, per_node_limit)
            .await;
        let mut node_results: HashMap<NodeId, Vec<SearchHit>> = outcome.ok.into_iter().collect();
        let mut failed: Vec<NodeId> = outcome.failed;

        // Replica fallback: ask a different holder of the same terms,
        // excluding nodes already queried or failed
        if !failed.is_empty() {
            self.metrics
                .node_queries_failed
                .fetch_add(failed.len() as u64, std::sync::atomic::Ordering::Relaxed);

            let queried: HashSet<NodeId> = candidates.iter().copied().collect();
            let fallback = self
                .fallback_candidates(&processed, &queried, &failed)
                .await;
            if !fallback.is_empty() {
                self.metrics
                    .fallback_queries
                    .fetch_add(fallback.len() as u64, std::sync::atomic::Ordering::Relaxed);
                let retry = self
                    .query_nodes(&processed, &fallback, per_node_limit)
                    .await;
                for (node, hits) in retry.ok {
                    node_results.insert(node, hits);
                }
                failed.extend(retry.failed.iter().copied());
            }
        }

        let responded: Vec<NodeId> = node_results.keys().copied().collect();
        let ranked = self.aggregator.aggregate(
            node_results,
            request.ranking,
            self.config.max_total_results,
        );

        if self.config.enable_caching && !ranked.is_empty() {
            self.cache_results(
                cache_key,
                &ranked,
                &candidates,
                &responded,
                failed.len(),
                &processed,
            );
        }

        Ok(self.aggregator.paginate(
            &request.query,
            &ranked,
            candidates,
            responded,
            failed.len(),
            elapsed_ms(started),
            page,
            page_size,
        ))
    }

    async fn query_nodes(
        &self,
        processed: &ProcessedQuery,
        targets: &[NodeId],
        limit: usize,
    ) -> scatter::ScatterOutcome<Vec<SearchHit>> {
        let node_timeout = Duration::from_millis(self.config.node_timeout_ms);
        let overall = Duration::from_millis(self.config.search_timeout_ms);
        let transport = Arc::clone(&self.transport);
        let from = self.node_id;

        // Probe with the cleaned query text so filter tokens never match as
        // ordinary terms; phrases still contribute their words
        let mut probe = processed.normalized.clone();
        for phrase in &processed.phrases {
            probe.push(' ');
            probe.push_str(phrase);
        }
        let query = if probe.trim().is_empty() { processed.original.clone() } else { probe };
        let filters = processed.filters.clone();

        scatter::scatter(targets.to_vec(), node_timeout, overall, move |peer| {
            let transport = Arc::clone(&transport);
            let query = query.clone();
            let filters = filters.clone();
            async move {
                match transport
                    .request(
                        from,
                        peer,
                        RpcMessage::SearchLocal { query, limit, filters },
                        node_timeout,
                    )
                    .await?
                {
                    RpcMessage::SearchLocalReply { results } => Ok(results),
                    other => Err(ClusterError::Internal(format!(
                        "unexpected reply to search_local: {}",
                        other.kind()
                    ))),
                }
            }
        })
        .await
    }

    // ------------------------------------------------------------------
    // Candidate location
    // ------------------------------------------------------------------

    /// Union of holder sets across query keywords: local cache first, then
    /// the term's shard coordinator. Falls back to every healthy node when
    /// the directory knows nothing (fresh cluster, cold directory).
    async fn locate_candidates(&self, processed: &ProcessedQuery) -> Vec<NodeId> {
        let mut candidates: HashSet<NodeId> = HashSet::new();
        for term in &processed.keywords {
            for node in self.locate_term(term).await {
                candidates.insert(node);
            }
        }

        if candidates.is_empty() {
            let mut all = self.state_machine.healthy_nodes();
            if all.is_empty() {
                all.push(self.node_id);
            }
            return all;
        }
        candidates.into_iter().collect()
    }

    pub async fn locate_term(&self, term: &str) -> Vec<NodeId> {
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        if let Some(entry) = self.locate_cache.lock().unwrap().get(term) {
            if entry.inserted.elapsed() < ttl {
                return entry.nodes.clone();
            }
        }

        let healthy = self.state_machine.healthy_nodes();
        let shard = self.ring.get_shard(term);
        let owner = shard_owner(shard, &healthy);

        let nodes = match owner {
            Some(owner) if owner == self.node_id => {
                self.shard_dir.lock().unwrap().locate(term)
            }
            Some(owner) => {
                let timeout = Duration::from_millis(self.config.node_timeout_ms);
                match self
                    .transport
                    .request(self.node_id, owner, RpcMessage::LocateTerm { term: term.to_string() }, timeout)
                    .await
                {
                    Ok(RpcMessage::LocateTermReply { nodes }) => nodes,
                    Ok(other) => {
                        log::warn!("unexpected reply locating '{}': {}", term, other.kind());
                        Vec::new()
                    }
                    Err(e) => {
                        log::debug!("locate of '{}' on {} failed: {}", term, owner, e);
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        if !nodes.is_empty() {
            self.locate_cache.lock().unwrap().insert(
                term.to_string(),
                LocateEntry { nodes: nodes.clone(), inserted: Instant::now() },
            );
        }
        nodes
    }

    /// Alternate holders for the failed nodes' terms, excluding anything
    /// already queried or known failed.
    async fn fallback_candidates(
        &self,
        processed: &ProcessedQuery,
        queried: &HashSet<NodeId>,
        failed: &[NodeId],
    ) -> Vec<NodeId> {
        let failed: HashSet<NodeId> = failed.iter().copied().collect();
        let mut fallback: HashSet<NodeId> = HashSet::new();

        for term in &processed.keywords {
            for node in self.locate_term(term).await {
                if !queried.contains(&node) && !failed.contains(&node) {
                    fallback.insert(node);
                }
            }
        }

        // Last resort: any healthy node not yet involved
        if fallback.is_empty() {
            for node in self.state_machine.healthy_nodes() {
                if !queried.contains(&node) && !failed.contains(&node) {
                    fallback.insert(node);
                }
            }
        }

        fallback.into_iter().collect()
    }

    // ------------------------------------------------------------------
    // Query cache
    // ------------------------------------------------------------------

    fn cache_key(&self, request: &SearchRequest) -> String {
        let mut filters: Vec<(&String, &String)> = request.filters.iter().collect();
        filters.sort();
        let mut hasher = blake3::Hasher::new();
        hasher.update(request.query.as_bytes());
        for (k, v) in filters {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b";");
        }
        if let Some(ranking) = request.ranking {
            hasher.update(format!("{:?}", ranking).as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    fn paginate_cached(
        &self,
        key: &str,
        query: &str,
        page: usize,
        page_size: usize,
        started: Instant,
    ) -> Option<AggregatedResults> {
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        let cache = self.query_cache.lock().unwrap();
        let entry = cache.get(key)?;
        if entry.inserted.elapsed() >= ttl {
            return None;
        }
        Some(self.aggregator.paginate(
            query,
            &entry.ranked,
            entry.searched_nodes.clone(),
            entry.responded_nodes.clone(),
            entry.failed_nodes,
            elapsed_ms(started),
            page,
            page_size,
        ))
    }

    fn cache_results(
        &self,
        key: String,
        ranked: &[SearchHit],
        searched: &[NodeId],
        responded: &[NodeId],
        failed_nodes: usize,
        processed: &ProcessedQuery,
    ) {
        let mut cache = self.query_cache.lock().unwrap();
        cache.insert(key, CachedSearch {
            ranked: ranked.to_vec(),
            searched_nodes: searched.to_vec(),
            responded_nodes: responded.to_vec(),
            failed_nodes,
            keywords: processed.keywords.iter().cloned().collect(),
            inserted: Instant::now(),
        });

        // Bounded cardinality: evict the oldest tenth when full
        if cache.len() > self.config.cache_max_entries {
            let mut by_age: Vec<(String, Instant)> =
                cache.iter().map(|(k, v)| (k.clone(), v.inserted)).collect();
            by_age.sort_by_key(|(_, inserted)| *inserted);
            let evict = (self.config.cache_max_entries / 10).max(1);
            for (key, _) in by_age.into_iter().take(evict) {
                cache.remove(&key);
            }
        }
    }

    /// Drop cached queries whose keyword set intersects a written
    /// document's terms.
    pub fn invalidate_cache_for_terms(&self, terms: &HashSet<String>) {
        let mut cache = self.query_cache.lock().unwrap();
        cache.retain(|_, entry| entry.keywords.is_disjoint(terms));
    }

    pub fn invalidate_locate_cache(&self, terms: &HashSet<String>) {
        let mut cache = self.locate_cache.lock().unwrap();
        for term in terms {
            cache.remove(term);
        }
    }

    pub fn cached_query_count(&self) -> usize {
        self.query_cache.lock().unwrap().len()
    }

    /// Query type exposure for callers that branch on it (e.g. filename
    /// searches served from metadata only).
    pub fn classify(&self, query: &str) -> QueryType {
        crate::query::detect_query_type(query)
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryNetwork;

    fn search_fixture() -> DistributedSearch {
        let network: Arc<dyn Transport> = Arc::new(InMemoryNetwork::new());
        let config = crate::config::ClusterConfig::testing();
        DistributedSearch::new(
            1,
            config.search,
            Arc::new(VectorizerSet::standard()),
            network,
            Arc::new(StateMachine::new()),
            HashRing::new(config.overlay.num_shards, config.overlay.virtual_nodes),
            Arc::new(Mutex::new(ShardDirectory::new())),
            Arc::new(Metrics::new()),
        )
    }

    #[test]
    fn test_cache_key_stable_and_filter_sensitive() {
        let search = search_fixture();
        let mut request = SearchRequest { query: "rust".into(), ..Default::default() };
        let a = search.cache_key(&request);
        let b = search.cache_key(&request);
        assert_eq!(a, b);

        request.filters.insert("type".into(), "pdf".into());
        assert_ne!(a, search.cache_key(&request));
    }

    #[test]
    fn test_cache_invalidation_by_terms() {
        let search = search_fixture();
        let processed = search.processor.process("rust consensus", None);
        search.cache_results(
            "key1".into(),
            &[],
            &[1],
            &[1],
            0,
            &processed,
        );
        assert_eq!(search.cached_query_count(), 1);

        // Unrelated terms leave the entry alone
        let unrelated: HashSet<String> = ["python".to_string()].into_iter().collect();
        search.invalidate_cache_for_terms(&unrelated);
        assert_eq!(search.cached_query_count(), 1);

        let overlapping: HashSet<String> = ["consensus".to_string()].into_iter().collect();
        search.invalidate_cache_for_terms(&overlapping);
        assert_eq!(search.cached_query_count(), 0);
    }

    #[test]
    fn test_cache_eviction_bounded() {
        let search = search_fixture();
        let processed = search.processor.process("query", None);
        let cap = search.config.cache_max_entries;
        for i in 0..(cap + 5) {
            search.cache_results(format!("key{}", i), &[], &[], &[], 0, &processed);
        }
        assert!(search.cached_query_count() <= cap + 5);
        assert!(search.cached_query_count() < cap + 5);
    }

    #[tokio::test]
    async fn test_search_with_no_candidates_returns_empty() {
        let search = search_fixture();
        // Only this node exists and it is not in the state machine; the
        // fan-out to self will fail fast, leaving an empty result.
        let result = search
            .search(SearchRequest { query: "anything".into(), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(result.total_results, 0);
        assert!(!result.has_more);
    }

    #[tokio::test]
    async fn test_locate_term_local_directory() {
        let search = search_fixture();
        // No healthy nodes known: shard owner is None, locate yields nothing
        assert!(search.locate_term("rust").await.is_empty());
    }
}
