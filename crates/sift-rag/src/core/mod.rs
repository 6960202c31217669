//! Core orchestration: [`RagPipeline`] and its state machine.
//!
//! [`RagPipeline`] is the primary entry point. Retrieval walks
//! validate → sanitize → cache → (expand) → multi-variant search → fuse →
//! rerank → (adaptive) → (grade) → threshold/top-K → context assembly →
//! (citations) → cache put, and never returns an error: every failure mode
//! degrades to an empty or partial [`PipelineContext`] with the reason in
//! `search_metadata`. Indexing walks dedup → chunk → (contextualize) →
//! batched embed → vector write → mirror → persist → cache warm →
//! invalidate, reporting the outcome in-band as an [`IndexReport`].
//!
//! The pipeline exclusively owns its in-memory mirror, sparse/late indexes,
//! caches, and feedback store behind `tokio::sync::RwLock`; BM25 mutations
//! flow through the actor in `sift-index` so retrievals stay lock-free on
//! the inverted index. External collaborators are borrowed `Arc`s and are
//! treated as thread-safe and call-at-will.

mod unit_tests;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{timeout, Duration};
use tracing::{debug, instrument, warn};

use crate::cache::{CacheStats, QueryCache};
use crate::chunking::{
    chunk_document, detect_code_language, has_list, has_table, heading_context,
    reading_complexity,
};
use crate::context::{format_context, ContextConfig, DynamicContextManager};
use crate::error::RagError;
use crate::expand::{expand_query, rewrite_query, ExpandOptions};
use crate::fusion::{cosine_sim, merge_by_id, normalize_scores, rrf_fuse, MergeStrategy, ScoreNorm, RRF_K};
use crate::grade::grade_documents;
use crate::rerank::adaptive::{AdaptiveParams, AdaptiveReranker};
use crate::rerank::{rerank, RerankStrategy};
use crate::sanitize::{sanitize_query, validate_retrieval_input};
use sift_core::{
    validate_collection_name, Chunk, Citation, CollectionStats, ContentFingerprint, DedupMode,
    EmbeddingService, FeedbackAction, IndexReport, IndexedChunk, LanguageModel, Metadata,
    PersistentStore, PipelineContext, RagConfig, RerankedDoc, StoredDoc, VariantMerge,
    VectorDocument, VectorHit, VectorStore, ConfigPatch, KvStore,
};
use sift_embed::{BatcherConfig, CancellationToken, EmbeddingBatcher, EmbeddingCache};
use sift_index::{start_bm25_default, Bm25Cmd, Bm25Status, LateIndex, SparseIndex, Tokenizer};

/// Client-side timeout on BM25 actor round-trips.
const BM25_TIMEOUT_MS: u64 = 250;

/// Queries jump the embedding queue ahead of background indexing work.
const QUERY_EMBED_PRIORITY: i32 = 10;
const INDEX_EMBED_PRIORITY: i32 = 0;

/// Entries kept in the query-embedding cache.
const EMBED_CACHE_SIZE: usize = 512;

/// Per-document options for [`RagPipeline::index_document`].
#[derive(Debug, Default)]
pub struct IndexingOptions {
    pub collection: String,
    /// Stable id of the source document; derived from the content
    /// fingerprint when absent.
    pub document_id: Option<String>,
    pub title: Option<String>,
    /// Provenance label stored as `source` metadata (file name, URL, ...).
    pub source: Option<String>,
    /// Extra metadata copied onto every chunk.
    pub metadata: Metadata,
    /// Observed between indexing stages; mid-stage cancellation is
    /// best-effort.
    pub cancel: Option<CancellationToken>,
}

/// Builder for [`RagPipeline`]; only the embedding service is mandatory.
pub struct RagPipelineBuilder {
    embedder: Arc<dyn EmbeddingService>,
    config: RagConfig,
    batcher_config: BatcherConfig,
    model: Option<Arc<dyn LanguageModel>>,
    vector_store: Option<Arc<dyn VectorStore>>,
    persistent: Option<Arc<dyn PersistentStore>>,
    cache_store: Option<Arc<dyn KvStore>>,
}

impl RagPipelineBuilder {
    pub fn new(embedder: Arc<dyn EmbeddingService>) -> Self {
        Self {
            embedder,
            config: RagConfig::default(),
            batcher_config: BatcherConfig::default(),
            model: None,
            vector_store: None,
            persistent: None,
            cache_store: None,
        }
    }

    pub fn with_config(mut self, config: RagConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_batcher_config(mut self, batcher_config: BatcherConfig) -> Self {
        self.batcher_config = batcher_config;
        self
    }

    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    pub fn with_persistent_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.persistent = Some(store);
        self
    }

    /// Durable mirror for the query cache (used when `cache.persist` is on).
    pub fn with_cache_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    /// Build the pipeline, starting the BM25 actor. Must run inside a Tokio
    /// runtime.
    pub fn build(self) -> RagPipeline {
        let bm25_tx = start_bm25_default();
        let batcher = EmbeddingBatcher::new(Arc::clone(&self.embedder), self.batcher_config);
        let mut query_cache = QueryCache::new(self.config.cache.clone());
        if self.config.cache.persist {
            if let Some(store) = &self.cache_store {
                query_cache = query_cache.with_persistence(Arc::clone(store));
            }
        }
        RagPipeline {
            embedder: self.embedder,
            batcher,
            model: self.model,
            vector_store: self.vector_store,
            persistent: self.persistent,
            bm25_tx,
            mirror: RwLock::new(HashMap::new()),
            loaded: RwLock::new(HashSet::new()),
            sparse: RwLock::new(SparseIndex::new()),
            late: RwLock::new(LateIndex::new()),
            embed_cache: RwLock::new(EmbeddingCache::new(EMBED_CACHE_SIZE)),
            query_cache,
            adaptive: RwLock::new(AdaptiveReranker::new(AdaptiveParams::default())),
            config: RwLock::new(self.config),
        }
    }
}

/// The hybrid retrieval pipeline.
///
/// See the crate docs for the end-to-end data flow. Cheap to share behind an
/// `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct RagPipeline {
    embedder: Arc<dyn EmbeddingService>,
    batcher: EmbeddingBatcher,
    model: Option<Arc<dyn LanguageModel>>,
    vector_store: Option<Arc<dyn VectorStore>>,
    persistent: Option<Arc<dyn PersistentStore>>,
    bm25_tx: mpsc::Sender<Bm25Cmd>,
    /// Authoritative in-memory copy of every indexed chunk, by collection.
    mirror: RwLock<HashMap<String, Vec<IndexedChunk>>>,
    /// Collections whose persistent mirror has been consulted.
    loaded: RwLock<HashSet<String>>,
    sparse: RwLock<SparseIndex>,
    late: RwLock<LateIndex>,
    embed_cache: RwLock<EmbeddingCache>,
    query_cache: QueryCache,
    adaptive: RwLock<AdaptiveReranker>,
    config: RwLock<RagConfig>,
}

impl RagPipeline {
    /// Minimal pipeline over an embedding service alone (mirror-only search,
    /// heuristic reranking).
    pub fn new(embedder: Arc<dyn EmbeddingService>) -> Self {
        RagPipelineBuilder::new(embedder).build()
    }

    pub fn builder(embedder: Arc<dyn EmbeddingService>) -> RagPipelineBuilder {
        RagPipelineBuilder::new(embedder)
    }

    /// Warm the query cache from its durable mirror, when configured.
    pub async fn initialize(&self) -> Result<(), RagError> {
        if let Some(store) = &self.persistent {
            store
                .initialize()
                .await
                .map_err(|e| RagError::Persist(e.to_string()))?;
        }
        self.query_cache.load_persisted().await;
        Ok(())
    }

    // ------------------------- retrieval -------------------------

    /// Retrieve a ranked, deduplicated, budgeted context for `query`.
    ///
    /// Never fails: validation problems, empty collections, and backend
    /// outages all surface as an empty or degraded context with
    /// `search_metadata.empty_reason` set.
    #[instrument(skip(self, query), fields(collection = %collection, query_len = query.len()))]
    pub async fn retrieve(&self, collection: &str, query: &str) -> PipelineContext {
        if let Err(e) = validate_retrieval_input(query, collection) {
            debug!(error = %e, "retrieval input rejected");
            return PipelineContext::empty(query, e.to_string());
        }
        let sanitized = sanitize_query(query);
        let query = sanitized.query;
        let cfg = self.config.read().await.clone();

        if let Some(mut hit) = self.query_cache.get(&query, collection) {
            hit.search_metadata.cache_hit = true;
            debug!("query cache hit");
            return hit;
        }

        self.ensure_loaded(collection).await;
        let mirror_count = self
            .mirror
            .read()
            .await
            .get(collection)
            .map_or(0, Vec::len);
        if mirror_count == 0 && !self.vector_backend_has(collection).await {
            let mut ctx = PipelineContext::empty(&query, "collection is empty");
            ctx.search_metadata.sanitized = sanitized.modified;
            return ctx;
        }

        // Expansion.
        let mut expanded = None;
        let mut queries: Vec<String> = vec![query.clone()];
        if cfg.query_expansion.enabled {
            if let Some(model) = &self.model {
                let exp = expand_query(
                    model.as_ref(),
                    &query,
                    ExpandOptions {
                        max_variants: cfg.query_expansion.max_variants,
                        use_hyde: cfg.query_expansion.use_hyde,
                    },
                )
                .await;
                queries.extend(exp.variants.iter().take(2).cloned());
                if let Some(passage) = &exp.hypothetical_passage {
                    queries.push(passage.clone());
                }
                expanded = Some(exp);
            }
        }

        // Multi-variant search; the final merge is deterministic regardless
        // of completion order.
        let pool = (cfg.top_k * 2).max(cfg.top_k);
        let variant_results: Vec<Vec<RerankedDoc>> = join_all(
            queries
                .iter()
                .map(|q| self.search_single(collection, q, &cfg, pool)),
        )
        .await;

        let variant_lists: Vec<Vec<(String, f32)>> = variant_results
            .iter()
            .map(|docs| {
                docs.iter()
                    .map(|d| (d.id.clone(), d.original_score))
                    .collect()
            })
            .collect();
        let mut doc_map: HashMap<String, RerankedDoc> = HashMap::new();
        for doc in variant_results.into_iter().flatten() {
            doc_map.entry(doc.id.clone()).or_insert(doc);
        }

        let strategy = match cfg.variant_merge {
            VariantMerge::Rrf => MergeStrategy::Rrf,
            VariantMerge::Max => MergeStrategy::Max,
            VariantMerge::Sum => MergeStrategy::Sum,
            VariantMerge::Avg => MergeStrategy::Avg,
        };
        let merged = merge_by_id(&variant_lists, strategy);

        let mut docs: Vec<RerankedDoc> = merged
            .into_iter()
            .take(pool)
            .filter_map(|(id, _)| doc_map.remove(&id))
            .collect();
        let pre_rerank_count = docs.len();

        // Rerank.
        let mut reranking_used = false;
        if cfg.reranking.enabled && !docs.is_empty() {
            let strategy = self.rerank_strategy(&cfg);
            docs = rerank(
                &strategy,
                self.model.as_deref(),
                &query,
                docs,
                &HashMap::new(),
            )
            .await;
            reranking_used = true;
        }

        // Adaptive boost from accumulated feedback.
        let mut adaptive_used = false;
        if cfg.adaptive_reranking.enabled && !docs.is_empty() {
            let adaptive = self.adaptive.read().await;
            docs = adaptive.rerank_with_learning(&query, docs);
            adaptive_used = true;
        }

        // Corrective grading.
        let mut corrective_applied = false;
        let mut fallback_used = false;
        let mut post_grading_count = docs.len();
        if cfg.corrective_rag.enabled && !docs.is_empty() {
            let (kept, report) = grade_documents(
                &cfg.corrective_rag,
                self.model.as_deref(),
                &query,
                docs,
            )
            .await;
            docs = kept;
            corrective_applied = true;
            fallback_used = report.fallback_used;
            post_grading_count = docs.len();
        }

        // Similarity threshold and top-K. The fallback path already decided
        // these documents are the best available, so it bypasses the floor.
        if !fallback_used {
            docs.retain(|d| d.original_score >= cfg.similarity_threshold);
        }
        docs.truncate(cfg.top_k);

        // Context assembly.
        let (docs, formatted_context, total_tokens_estimate) = if cfg.dynamic_context {
            let manager = DynamicContextManager::new(ContextConfig::default());
            let (selected, formatted, report) =
                manager.plan(&query, &docs, Some(cfg.max_context_length));
            let tokens = report.used_tokens;
            (selected, formatted, tokens)
        } else {
            let formatted = clip_to_tokens(&format_context(&docs), cfg.max_context_length);
            let tokens = formatted.chars().count().div_ceil(4);
            (docs, formatted, tokens)
        };

        let citations = cfg.enable_citations.then(|| build_citations(&docs));

        let mut ctx = PipelineContext {
            documents: docs,
            query: query.clone(),
            expanded_query: expanded,
            formatted_context,
            total_tokens_estimate,
            citations,
            search_metadata: Default::default(),
        };
        ctx.search_metadata.hybrid_search_used = cfg.hybrid_search.enabled;
        ctx.search_metadata.query_expansion_used = ctx.expanded_query.is_some();
        ctx.search_metadata.reranking_used = reranking_used;
        ctx.search_metadata.adaptive_reranking_used = adaptive_used;
        ctx.search_metadata.corrective_applied = corrective_applied;
        ctx.search_metadata.fallback_used = fallback_used;
        ctx.search_metadata.sanitized = sanitized.modified;
        ctx.search_metadata.pre_rerank_count = pre_rerank_count;
        ctx.search_metadata.post_grading_count = post_grading_count;
        ctx.search_metadata.iterations = 1;
        if ctx.documents.is_empty() && ctx.search_metadata.empty_reason.is_none() {
            ctx.search_metadata.empty_reason = Some("no documents passed filtering".to_string());
        }

        self.query_cache.put(&query, collection, ctx.clone());
        ctx
    }

    /// Retrieval with up to `max_iterations - 1` refinement passes when the
    /// first pass looks insufficient.
    #[instrument(skip(self, query), fields(collection = %collection))]
    pub async fn retrieve_iterative(&self, collection: &str, query: &str) -> PipelineContext {
        let cfg = self.config.read().await.clone();
        let mut ctx = self.retrieve(collection, query).await;
        let max_iterations = cfg.iterative_retrieval.max_iterations.max(1);
        let threshold = cfg.iterative_retrieval.sufficiency_threshold;

        let mut iterations = 1usize;
        let mut current_query = ctx.query.clone();

        while iterations < max_iterations {
            if is_retrieval_sufficient(&ctx.documents, threshold, 1) {
                break;
            }
            let snippets: Vec<String> = ctx
                .documents
                .iter()
                .take(2)
                .map(|d| d.content.clone())
                .collect();
            let refined = match &self.model {
                Some(model) => rewrite_query(model.as_ref(), &current_query, &snippets).await,
                None => None,
            }
            .unwrap_or_else(|| lightweight_refine(&current_query, &ctx.documents));

            if refined == current_query {
                break;
            }
            debug!(iteration = iterations + 1, refined = %refined, "iterative retrieval pass");

            let next = self.retrieve(collection, &refined).await;
            // Merge by id, first-seen wins.
            let known: HashSet<String> = ctx.documents.iter().map(|d| d.id.clone()).collect();
            ctx.documents.extend(
                next.documents
                    .into_iter()
                    .filter(|d| !known.contains(&d.id)),
            );
            ctx.documents.truncate(cfg.top_k);
            ctx.formatted_context = format_context(&ctx.documents);
            ctx.total_tokens_estimate = ctx.formatted_context.chars().count().div_ceil(4);

            current_query = refined;
            iterations += 1;
        }
        ctx.search_metadata.iterations = iterations;
        ctx
    }

    // ------------------------- direct search surface -------------------------

    /// Dense-only search: (chunk id, cosine similarity) pairs sorted by
    /// relevance, served by the vector backend with a mirror fallback.
    #[instrument(skip(self, query), fields(collection = %collection, query_len = query.len(), top_k = top_k))]
    pub async fn search_dense(
        &self,
        collection: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<(String, f32)>, RagError> {
        validate_collection_name(collection).map_err(RagError::Invalid)?;
        self.ensure_loaded(collection).await;
        let embedding = self
            .query_embedding(query)
            .await
            .ok_or_else(|| RagError::Embed("failed to generate query embedding".to_string()))?;
        let hits = match &self.vector_store {
            Some(store) => match store.search(collection, &embedding, top_k).await {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(error = %e, "vector backend search failed; falling back to mirror");
                    self.mirror_cosine(collection, &embedding, top_k).await
                }
            },
            None => self.mirror_cosine(collection, &embedding, top_k).await,
        };
        Ok(hits.into_iter().map(|h| (h.id, h.score)).collect())
    }

    /// BM25-only search in lenient mode: when the sparse index has nothing
    /// for the collection, this falls back to dense search so callers do not
    /// see empty results from indexing lag.
    #[instrument(skip(self, query), fields(collection = %collection, query_len = query.len(), top_k = top_k))]
    pub async fn search_bm25(
        &self,
        collection: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<(String, f32)>, RagError> {
        validate_collection_name(collection).map_err(RagError::Invalid)?;
        self.ensure_loaded(collection).await;
        let results = self.bm25_search(collection, query, top_k).await;
        if !results.is_empty() {
            return Ok(results);
        }
        let status = self.bm25_status(collection).await?;
        match status {
            Bm25Status::Ready { docs } if docs > 0 => {
                debug!("BM25 ready but query matched nothing; not falling back");
                Ok(results)
            }
            _ => {
                debug!(bm25_status = ?status, fallback_used = true, "BM25 not ready or empty; falling back to dense search");
                self.search_dense(collection, query, top_k).await
            }
        }
    }

    /// Concurrent dense + BM25 search fused with the configured RRF weights.
    #[instrument(skip(self, query), fields(collection = %collection, query_len = query.len(), top_k = top_k))]
    pub async fn hybrid_search(
        &self,
        collection: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<(String, f32)>, RagError> {
        validate_collection_name(collection).map_err(RagError::Invalid)?;
        self.ensure_loaded(collection).await;
        let cfg = self.config.read().await.clone();

        let dense_fut = self.search_dense(collection, query, top_k);
        let bm25_fut = self.bm25_search(collection, query, top_k);
        let (dense_res, bm25_list) = tokio::join!(dense_fut, bm25_fut);
        let dense_list = dense_res?;

        let mut fused = rrf_fuse(
            &[dense_list, bm25_list],
            &[
                cfg.hybrid_search.vector_weight,
                cfg.hybrid_search.keyword_weight,
            ],
            RRF_K,
        );
        fused.truncate(top_k);
        debug!(results = fused.len(), "hybrid search fused");
        Ok(fused)
    }

    /// Current status of the collection's BM25 index.
    pub async fn bm25_status(&self, collection: &str) -> Result<Bm25Status, RagError> {
        let (tx, rx) = oneshot::channel();
        self.bm25_tx
            .send(Bm25Cmd::Status {
                collection: collection.to_string(),
                resp: tx,
            })
            .await
            .map_err(|e| RagError::Channel(format!("failed to send BM25 status command: {e}")))?;
        match timeout(Duration::from_millis(BM25_TIMEOUT_MS), rx).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(recv_err)) => Err(RagError::Channel(format!(
                "BM25 status response channel closed: {recv_err}"
            ))),
            Err(_) => Err(RagError::Channel(format!(
                "timeout waiting for BM25 status ({BM25_TIMEOUT_MS} ms)"
            ))),
        }
    }

    fn rerank_strategy(&self, cfg: &RagConfig) -> RerankStrategy {
        if let (Some(key), Some(url)) = (
            cfg.reranking.external_api_key.as_ref(),
            cfg.reranking.external_api_url.as_ref(),
        ) {
            return RerankStrategy::External {
                api_url: url.clone(),
                api_key: key.clone(),
            };
        }
        if cfg.reranking.use_model && self.model.is_some() {
            return RerankStrategy::Model;
        }
        RerankStrategy::Heuristic
    }

    /// One variant search: dense + optional keyword/sparse/late, fused by
    /// weighted RRF. Returns docs in fused order with `original_score` set
    /// to the best per-modality similarity (dense raw, others min-max
    /// normalized).
    async fn search_single(
        &self,
        collection: &str,
        text: &str,
        cfg: &RagConfig,
        limit: usize,
    ) -> Vec<RerankedDoc> {
        let query_embedding = self.query_embedding(text).await;

        let mut dense_hits: Vec<VectorHit> = Vec::new();
        if let Some(embedding) = &query_embedding {
            dense_hits = match &self.vector_store {
                Some(store) => match store.search(collection, embedding, limit).await {
                    Ok(hits) => hits,
                    Err(e) => {
                        warn!(error = %e, "vector backend search failed; falling back to mirror");
                        self.mirror_cosine(collection, embedding, limit).await
                    }
                },
                None => self.mirror_cosine(collection, embedding, limit).await,
            };
        }
        let dense_list: Vec<(String, f32)> = dense_hits
            .iter()
            .map(|h| (h.id.clone(), h.score))
            .collect();

        let hybrid = cfg.hybrid_search.enabled;
        let keyword_list = if hybrid {
            self.bm25_search(collection, text, limit).await
        } else {
            Vec::new()
        };
        let sparse_list = if hybrid && cfg.hybrid_search.enable_sparse {
            self.sparse.read().await.search(collection, text, limit)
        } else {
            Vec::new()
        };
        let late_list = if hybrid && cfg.hybrid_search.enable_late {
            self.late.read().await.search(collection, text, limit)
        } else {
            Vec::new()
        };

        let mut lists = vec![dense_list];
        let mut weights = vec![cfg.hybrid_search.vector_weight];
        if hybrid {
            lists.push(keyword_list);
            weights.push(cfg.hybrid_search.keyword_weight);
            if cfg.hybrid_search.enable_sparse {
                lists.push(sparse_list);
                weights.push(cfg.hybrid_search.sparse_weight);
            }
            if cfg.hybrid_search.enable_late {
                lists.push(late_list);
                weights.push(cfg.hybrid_search.late_weight);
            }
        }
        let fused = rrf_fuse(&lists, &weights, RRF_K);

        // Best interpretable similarity per id: dense scores pass through,
        // lexical lists are normalized first.
        let mut best: HashMap<String, f32> = HashMap::new();
        for (id, score) in lists[0].iter() {
            best.insert(id.clone(), *score);
        }
        let norm = ScoreNorm::default();
        for list in lists.iter().skip(1) {
            for (id, score) in normalize_scores(list, &norm) {
                best.entry(id)
                    .and_modify(|b| *b = b.max(score))
                    .or_insert(score);
            }
        }

        // Materialize documents from the mirror, falling back to dense-hit
        // payloads for ids only the backend knows.
        let mirror = self.mirror.read().await;
        let chunk_map: HashMap<&str, &IndexedChunk> = mirror
            .get(collection)
            .map(|chunks| chunks.iter().map(|c| (c.id(), c)).collect())
            .unwrap_or_default();
        let hit_map: HashMap<&str, &VectorHit> =
            dense_hits.iter().map(|h| (h.id.as_str(), h)).collect();

        let mut docs = Vec::with_capacity(limit.min(fused.len()));
        for (id, _) in fused.into_iter().take(limit) {
            let (content, metadata) = if let Some(chunk) = chunk_map.get(id.as_str()) {
                (chunk.chunk.content.clone(), chunk.chunk.metadata.clone())
            } else if let Some(hit) = hit_map.get(id.as_str()) {
                (hit.content.clone(), hit.metadata.clone())
            } else {
                debug!(id = %id, "fused id without content; skipping");
                continue;
            };
            let sim = best.get(&id).copied().unwrap_or(0.0);
            docs.push(RerankedDoc {
                id,
                content,
                metadata,
                original_score: sim,
                rerank_score: sim,
            });
        }
        docs
    }

    /// Query embedding with LRU reuse; None (plus a warning) on failure so
    /// retrieval can continue lexical-only.
    async fn query_embedding(&self, text: &str) -> Option<Vec<f32>> {
        if let Some(hit) = self.embed_cache.write().await.get(text) {
            return Some(hit);
        }
        match self.batcher.embed(text, QUERY_EMBED_PRIORITY).await {
            Ok(vector) => {
                self.embed_cache.write().await.put(text, vector.clone());
                Some(vector)
            }
            Err(e) => {
                warn!(error = %e, "query embedding failed; continuing without dense results");
                None
            }
        }
    }

    /// Brute-force cosine over the in-memory mirror; the dense fallback when
    /// the vector backend is absent or failing.
    async fn mirror_cosine(
        &self,
        collection: &str,
        embedding: &[f32],
        limit: usize,
    ) -> Vec<VectorHit> {
        let mirror = self.mirror.read().await;
        let Some(chunks) = mirror.get(collection) else {
            return Vec::new();
        };
        let mut hits: Vec<VectorHit> = chunks
            .iter()
            .map(|chunk| VectorHit {
                id: chunk.id().to_string(),
                content: chunk.chunk.content.clone(),
                metadata: chunk.chunk.metadata.clone(),
                score: cosine_sim(embedding, &chunk.dense_embedding),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        hits
    }

    async fn bm25_search(&self, collection: &str, query: &str, top_k: usize) -> Vec<(String, f32)> {
        let (tx, rx) = oneshot::channel();
        let cmd = Bm25Cmd::Search {
            collection: collection.to_string(),
            query: query.to_string(),
            top_k,
            resp: tx,
        };
        if self.bm25_tx.send(cmd).await.is_err() {
            warn!("BM25 actor unavailable");
            return Vec::new();
        }
        match timeout(Duration::from_millis(BM25_TIMEOUT_MS), rx).await {
            Ok(Ok(results)) => results,
            Ok(Err(_)) => {
                warn!("BM25 response channel closed");
                Vec::new()
            }
            Err(_) => {
                warn!(timeout_ms = BM25_TIMEOUT_MS, "BM25 search timed out");
                Vec::new()
            }
        }
    }

    async fn vector_backend_has(&self, collection: &str) -> bool {
        let Some(store) = &self.vector_store else {
            return false;
        };
        match store.list_collections().await {
            Ok(collections) => collections
                .iter()
                .any(|c| c.name == collection && c.document_count > 0),
            Err(e) => {
                debug!(error = %e, "vector backend list_collections failed");
                false
            }
        }
    }

    /// Lazily read the persistent mirror the first time a collection is
    /// touched, rebuilding the in-memory indexes from the stored chunks.
    async fn ensure_loaded(&self, collection: &str) {
        {
            if self.loaded.read().await.contains(collection) {
                return;
            }
        }
        self.loaded.write().await.insert(collection.to_string());
        let Some(store) = &self.persistent else { return };

        let stored = match store.load_documents(collection).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, collection = %collection, "persistent mirror load failed");
                return;
            }
        };
        if stored.is_empty() {
            return;
        }

        let mut restored: Vec<IndexedChunk> = Vec::with_capacity(stored.len());
        for doc in stored {
            match serde_json::from_str::<IndexedChunk>(&doc.payload) {
                Ok(chunk) => restored.push(chunk),
                Err(e) => warn!(id = %doc.id, error = %e, "corrupt stored chunk; skipping"),
            }
        }
        if restored.is_empty() {
            return;
        }
        debug!(collection = %collection, chunks = restored.len(), "mirror restored from persistence");
        self.register_chunks(collection, restored, false).await;
    }

    /// Insert chunks into the mirror and every derived index. `persist`
    /// additionally writes through to the persistent store.
    async fn register_chunks(&self, collection: &str, chunks: Vec<IndexedChunk>, persist: bool) {
        let bm25_batch: Vec<(String, String)> = chunks
            .iter()
            .map(|c| (c.id().to_string(), c.chunk.content.clone()))
            .collect();
        if self
            .bm25_tx
            .send(Bm25Cmd::AddBatch {
                collection: collection.to_string(),
                docs: bm25_batch,
            })
            .await
            .is_err()
        {
            warn!("BM25 actor unavailable during indexing");
        }

        {
            let mut sparse = self.sparse.write().await;
            let mut late = self.late.write().await;
            for chunk in &chunks {
                match &chunk.sparse_embedding {
                    Some(vec) => sparse.add_prebuilt(collection, chunk.id(), vec.clone()),
                    None => {
                        sparse.add(collection, chunk.id(), &chunk.chunk.content);
                    }
                }
                late.add(collection, chunk.id(), &chunk.chunk.content);
            }
        }

        if persist {
            if let Some(store) = &self.persistent {
                let docs: Vec<StoredDoc> = chunks
                    .iter()
                    .filter_map(|chunk| {
                        serde_json::to_string(chunk).ok().map(|payload| StoredDoc {
                            id: chunk.id().to_string(),
                            payload,
                        })
                    })
                    .collect();
                if let Err(e) = store.save_documents(collection, docs).await {
                    warn!(error = %e, "persistent mirror write failed; in-memory mirror remains authoritative");
                }
            }
        }

        let mut mirror = self.mirror.write().await;
        let entry = mirror.entry(collection.to_string()).or_default();
        let existing: HashSet<String> = entry.iter().map(|c| c.id().to_string()).collect();
        entry.extend(
            chunks
                .into_iter()
                .filter(|c| !existing.contains(c.id())),
        );
    }
}

impl RagPipeline {
    // ------------------------- indexing -------------------------

    /// Index one document: dedup check, chunk, optional contextualization,
    /// batched embedding, backend/mirror/persistence writes, cache warming,
    /// and query-cache invalidation. The outcome is reported in-band; this
    /// surface does not fail.
    #[instrument(skip(self, content, opts), fields(collection = %opts.collection, content_len = content.len()))]
    pub async fn index_document(&self, content: &str, opts: IndexingOptions) -> IndexReport {
        match self.index_document_inner(content, opts).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "indexing failed");
                IndexReport {
                    success: false,
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        }
    }

    async fn index_document_inner(
        &self,
        content: &str,
        opts: IndexingOptions,
    ) -> Result<IndexReport, RagError> {
        validate_collection_name(&opts.collection).map_err(RagError::Invalid)?;
        if content.trim().is_empty() {
            return Err(RagError::Invalid("document content is empty".to_string()));
        }
        let collection = opts.collection.as_str();
        self.ensure_loaded(collection).await;
        let cfg = self.config.read().await.clone();

        let check_cancelled = |stage: &str| -> Result<(), RagError> {
            match &opts.cancel {
                Some(token) if token.is_cancelled() => {
                    Err(RagError::Cancelled(format!("indexing ({stage})")))
                }
                _ => Ok(()),
            }
        };

        // Dedup by whole-document fingerprint.
        let doc_fingerprint = ContentFingerprint::of(content);
        if cfg.dedup.enabled {
            let duplicate_ids: Vec<String> = {
                let mirror = self.mirror.read().await;
                mirror
                    .get(collection)
                    .map(|chunks| {
                        chunks
                            .iter()
                            .filter(|c| {
                                c.chunk.metadata.get_str("doc_fingerprint")
                                    == Some(doc_fingerprint.as_string().as_str())
                            })
                            .map(|c| c.id().to_string())
                            .collect()
                    })
                    .unwrap_or_default()
            };
            if !duplicate_ids.is_empty() {
                match cfg.dedup.mode {
                    DedupMode::Skip => {
                        debug!(collection = %collection, "duplicate document; skipping");
                        return Ok(IndexReport {
                            chunks_created: 0,
                            success: true,
                            error: None,
                            skipped_duplicate: true,
                        });
                    }
                    DedupMode::Upsert => {
                        debug!(
                            collection = %collection,
                            stale = duplicate_ids.len(),
                            "duplicate document; upserting"
                        );
                        self.delete_documents(collection, &duplicate_ids).await?;
                    }
                }
            }
        }

        // Chunk.
        check_cancelled("chunking")?;
        let drafts = chunk_document(content, &cfg.chunking);
        if drafts.is_empty() {
            return Err(RagError::Invalid("document produced no chunks".to_string()));
        }
        let total = drafts.len();
        let document_id = opts
            .document_id
            .clone()
            .unwrap_or_else(|| format!("doc-{}", &doc_fingerprint.as_string()[..8]));

        // Optional contextualization: model-backed when configured, else the
        // cheap heading-based prefix.
        let mut contextual: Vec<Option<String>> = vec![None; total];
        if cfg.chunking.contextualize {
            for (i, draft) in drafts.iter().enumerate() {
                let prefix = if cfg.chunking.contextualize_with_model {
                    match &self.model {
                        Some(model) => self
                            .model_context(model.as_ref(), content, &draft.content)
                            .await
                            .unwrap_or_else(|| {
                                heading_context(
                                    opts.title.as_deref(),
                                    draft.heading.as_deref(),
                                    i,
                                    total,
                                )
                            }),
                        None => heading_context(
                            opts.title.as_deref(),
                            draft.heading.as_deref(),
                            i,
                            total,
                        ),
                    }
                } else {
                    heading_context(opts.title.as_deref(), draft.heading.as_deref(), i, total)
                };
                contextual[i] = Some(format!("{}\n\n{}", prefix, draft.content));
            }
        }

        // Batched embedding over the contextualized text.
        check_cancelled("embedding")?;
        let texts: Vec<String> = drafts
            .iter()
            .enumerate()
            .map(|(i, draft)| {
                contextual[i]
                    .clone()
                    .unwrap_or_else(|| draft.content.clone())
            })
            .collect();
        let embeddings = self
            .batcher
            .embed_batch(&texts, INDEX_EMBED_PRIORITY)
            .await
            .map_err(RagError::from)?;

        // Dimensionality must match what the collection already holds.
        if let Some(first) = embeddings.first() {
            let existing_dims = {
                let mirror = self.mirror.read().await;
                mirror
                    .get(collection)
                    .and_then(|chunks| chunks.first())
                    .map(IndexedChunk::dimensions)
            };
            if let Some(dims) = existing_dims {
                if dims != first.len() {
                    return Err(RagError::Embed(format!(
                        "embedding dimension {} does not match collection dimension {}",
                        first.len(),
                        dims
                    )));
                }
            }
        }

        // Assemble indexed chunks with enriched metadata.
        check_cancelled("writing")?;
        let mut indexed: Vec<IndexedChunk> = Vec::with_capacity(total);
        for ((i, draft), embedding) in drafts.iter().enumerate().zip(embeddings) {
            let id = format!("{}::{}:{}", collection, document_id, i);
            let mut metadata = opts.metadata.clone();
            metadata.set("document_id", document_id.as_str());
            if let Some(source) = &opts.source {
                metadata.set("source", source.as_str());
            }
            if let Some(title) = &opts.title {
                metadata.set("title", title.as_str());
            }
            if let Some(heading) = &draft.heading {
                metadata.set("heading", heading.as_str());
            }
            if let Some(lang) = detect_code_language(&draft.content) {
                metadata.set("code_language", lang);
            }
            metadata.set("has_table", has_table(&draft.content));
            metadata.set("has_list", has_list(&draft.content));
            metadata.set("reading_complexity", reading_complexity(&draft.content));
            if cfg.chunking.parent_child {
                if let Some(parent) = &draft.parent {
                    metadata.set("parent_content", parent.as_str());
                }
            }
            if cfg.dedup.enabled {
                metadata.set("doc_fingerprint", doc_fingerprint.as_string());
            }
            metadata.set(
                "chunk_fingerprint",
                ContentFingerprint::of(&draft.content).as_string(),
            );

            indexed.push(IndexedChunk {
                chunk: Chunk {
                    id,
                    content: draft.content.clone(),
                    contextual_content: contextual[i].clone(),
                    chunk_index: draft.chunk_index,
                    start_offset: draft.start_offset,
                    end_offset: draft.end_offset,
                    metadata,
                },
                dense_embedding: embedding,
                sparse_embedding: Some(sift_index::sparse_embed(&draft.content)),
            });
        }

        // Vector backend write; failure keeps the chunks mirror-only.
        if let Some(store) = &self.vector_store {
            let docs: Vec<VectorDocument> = indexed
                .iter()
                .map(|chunk| VectorDocument {
                    id: chunk.id().to_string(),
                    content: chunk.chunk.content.clone(),
                    embedding: chunk.dense_embedding.clone(),
                    metadata: chunk.chunk.metadata.clone(),
                })
                .collect();
            if let Err(e) = store.add_documents(collection, docs).await {
                warn!(error = %e, "vector backend write failed; continuing mirror-only");
            }
        }

        // Mirror + derived indexes + persistence.
        self.register_chunks(collection, indexed, true).await;

        // Warm the embedding cache with what we just computed.
        {
            let mut cache = self.embed_cache.write().await;
            let mirror = self.mirror.read().await;
            if let Some(chunks) = mirror.get(collection) {
                for chunk in chunks.iter().rev().take(total) {
                    cache.put(chunk.chunk.embedding_text(), chunk.dense_embedding.clone());
                }
            }
        }

        self.query_cache.invalidate_collection(collection);
        debug!(collection = %collection, chunks = total, "document indexed");
        Ok(IndexReport {
            chunks_created: total,
            success: true,
            error: None,
            skipped_duplicate: false,
        })
    }

    async fn model_context(
        &self,
        model: &dyn LanguageModel,
        document: &str,
        chunk: &str,
    ) -> Option<String> {
        let doc_preview: String = document.chars().take(1500).collect();
        let prompt = format!(
            "Give a one-sentence description situating the excerpt within the document, \
             for retrieval. Reply with the sentence only.\n\n\
             Document:\n{doc_preview}\n\nExcerpt:\n{chunk}"
        );
        match model.generate(&prompt, 0.0).await {
            Ok(ctx) if !ctx.trim().is_empty() => Some(ctx.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "model contextualization failed; using heading context");
                None
            }
        }
    }

    // ------------------------- deletion & stats -------------------------

    /// Remove chunks by id from every representation. Returns how many were
    /// present in the mirror.
    #[instrument(skip(self, ids), fields(collection = %collection, ids = ids.len()))]
    pub async fn delete_documents(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<usize, RagError> {
        validate_collection_name(collection).map_err(RagError::Invalid)?;
        if ids.is_empty() {
            return Ok(0);
        }
        self.ensure_loaded(collection).await;
        let id_set: HashSet<&str> = ids.iter().map(String::as_str).collect();

        let removed = {
            let mut mirror = self.mirror.write().await;
            match mirror.get_mut(collection) {
                Some(chunks) => {
                    let before = chunks.len();
                    chunks.retain(|c| !id_set.contains(c.id()));
                    let removed = before - chunks.len();
                    if chunks.is_empty() {
                        mirror.remove(collection);
                    }
                    removed
                }
                None => 0,
            }
        };

        if self
            .bm25_tx
            .send(Bm25Cmd::Remove {
                collection: collection.to_string(),
                ids: ids.to_vec(),
            })
            .await
            .is_err()
        {
            warn!("BM25 actor unavailable during delete");
        }
        {
            let mut sparse = self.sparse.write().await;
            let mut late = self.late.write().await;
            for id in ids {
                sparse.remove(collection, id);
                late.remove(collection, id);
            }
        }

        if let Some(store) = &self.vector_store {
            if let Err(e) = store.delete_documents(collection, ids).await {
                warn!(error = %e, "vector backend delete failed");
            }
        }
        if let Some(store) = &self.persistent {
            if let Err(e) = store.delete_documents(collection, ids).await {
                warn!(error = %e, "persistent mirror delete failed");
            }
        }

        self.query_cache.invalidate_collection(collection);
        debug!(removed, "documents deleted");
        Ok(removed)
    }

    /// Remove every chunk belonging to one source document.
    pub async fn delete_by_document_id(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<usize, RagError> {
        self.ensure_loaded(collection).await;
        let ids: Vec<String> = {
            let mirror = self.mirror.read().await;
            mirror
                .get(collection)
                .map(|chunks| {
                    chunks
                        .iter()
                        .filter(|c| {
                            c.chunk.metadata.get_str("document_id") == Some(document_id)
                        })
                        .map(|c| c.id().to_string())
                        .collect()
                })
                .unwrap_or_default()
        };
        self.delete_documents(collection, &ids).await
    }

    /// Drop a whole collection from every representation.
    #[instrument(skip(self), fields(collection = %collection))]
    pub async fn clear_collection(&self, collection: &str) -> Result<(), RagError> {
        validate_collection_name(collection).map_err(RagError::Invalid)?;
        self.mirror.write().await.remove(collection);
        self.loaded.write().await.insert(collection.to_string());
        if self
            .bm25_tx
            .send(Bm25Cmd::RemoveCollection {
                collection: collection.to_string(),
            })
            .await
            .is_err()
        {
            warn!("BM25 actor unavailable during clear");
        }
        self.sparse.write().await.remove_collection(collection);
        self.late.write().await.remove_collection(collection);

        if let Some(store) = &self.vector_store {
            if let Err(e) = store.delete_all(collection).await {
                warn!(error = %e, "vector backend clear failed");
            }
        }
        if let Some(store) = &self.persistent {
            if let Err(e) = store.clear_collection(collection).await {
                warn!(error = %e, "persistent mirror clear failed");
            }
        }
        self.query_cache.invalidate_collection(collection);
        Ok(())
    }

    pub async fn get_collection_stats(&self, collection: &str) -> CollectionStats {
        self.ensure_loaded(collection).await;
        let document_count = self
            .mirror
            .read()
            .await
            .get(collection)
            .map_or(0, Vec::len);
        let exists = document_count > 0 || self.vector_backend_has(collection).await;
        CollectionStats {
            document_count,
            exists,
        }
    }

    /// Union of collections known to the mirror, the vector backend, and the
    /// persistent store.
    pub async fn list_collections(&self) -> Vec<String> {
        let mut names: HashSet<String> = self.mirror.read().await.keys().cloned().collect();
        if let Some(store) = &self.vector_store {
            if let Ok(collections) = store.list_collections().await {
                names.extend(collections.into_iter().map(|c| c.name));
            }
        }
        if let Some(store) = &self.persistent {
            if let Ok(collections) = store.list_collections().await {
                names.extend(collections);
            }
        }
        let mut out: Vec<String> = names.into_iter().collect();
        out.sort();
        out
    }

    // ------------------------- feedback, config, cache -------------------------

    /// Record a user feedback signal for adaptive reranking.
    pub async fn record_feedback(
        &self,
        query: &str,
        doc_id: &str,
        relevance: f32,
        action: FeedbackAction,
    ) {
        self.adaptive
            .write()
            .await
            .record(query, doc_id, relevance, action);
    }

    /// Merge a partial configuration update.
    pub async fn update_config(&self, patch: ConfigPatch) {
        self.config.write().await.apply(patch);
    }

    pub async fn current_config(&self) -> RagConfig {
        self.config.read().await.clone()
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.query_cache.stats()
    }

    /// Drop cached results for one collection; returns the count dropped.
    pub fn invalidate_cache(&self, collection: &str) -> usize {
        self.query_cache.invalidate_collection(collection)
    }

    pub fn batcher_stats(&self) -> sift_embed::BatcherStats {
        self.batcher.stats()
    }
}

fn is_retrieval_sufficient(docs: &[RerankedDoc], threshold: f32, min_relevant: usize) -> bool {
    docs.iter().filter(|d| d.rerank_score >= threshold).count() >= min_relevant
}

/// Model-free query refinement: append the top documents' leading terms,
/// deduplicated against the query's own terms.
fn lightweight_refine(query: &str, docs: &[RerankedDoc]) -> String {
    let mut seen: HashSet<String> = Tokenizer.tokenize(query).into_iter().collect();
    let mut extra: Vec<String> = Vec::new();
    for doc in docs.iter().take(2) {
        for term in Tokenizer.tokenize(&doc.content).into_iter().take(5) {
            if seen.insert(term.clone()) {
                extra.push(term);
            }
        }
    }
    if extra.is_empty() {
        query.to_string()
    } else {
        format!("{} {}", query, extra.join(" "))
    }
}

fn build_citations(docs: &[RerankedDoc]) -> Vec<Citation> {
    docs.iter()
        .enumerate()
        .map(|(i, doc)| Citation {
            index: i + 1,
            chunk_id: doc.id.clone(),
            source: doc.metadata.get_str("source").map(str::to_string),
            title: doc.metadata.get_str("title").map(str::to_string),
        })
        .collect()
}

/// Clip formatted context to a token budget (approximate four chars per
/// token), used by the non-dynamic assembly path.
fn clip_to_tokens(text: &str, max_tokens: usize) -> String {
    let max_chars = max_tokens.saturating_mul(4);
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}
