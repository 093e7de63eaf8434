//! Hybrid retrieval combining lexical and vector search

use crate::cache::{CacheHitTier, MultiTierCache};
use crate::config::Config;
use crate::embedding::{Embedder, VectorFilter, VectorHit, VectorQuery, VectorSearch};
use crate::error::{QuarryError, Result};
use crate::index::{Bm25Index, Bm25Params, Chunk, LexicalHit, Tokenizer};
use crate::retrieval::{fuse, FusionConfig, RetrievalMode, RetrievedChunk};
use crate::retry::RetryPolicy;
use crate::session::SessionRegistry;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-call retrieval options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrieveOptions {
    /// How long to wait for the vector side before answering from lexical
    /// results alone. Defaults to the configured vector timeout.
    pub deadline: Option<Duration>,
}

impl RetrieveOptions {
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }
}

/// Where a result list came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalSource {
    Fresh,
    Cache(CacheHitTier),
}

/// Outcome of a retrieval
#[derive(Debug, Clone, PartialEq)]
pub struct Retrieval {
    pub chunks: Vec<RetrievedChunk>,
    pub source: RetrievalSource,
    /// The vector side was missing, failed or missed its deadline and the
    /// results are lexical only. Degraded results are never cached.
    pub degraded: bool,
}

/// Single entry point over the lexical index, the vector store, the result
/// cache and the session registry
pub struct HybridRetriever {
    index: Arc<Bm25Index>,
    vector: Option<Arc<dyn VectorSearch>>,
    embedder: Option<Arc<dyn Embedder>>,
    cache: Arc<MultiTierCache>,
    sessions: Arc<SessionRegistry>,
    fusion: FusionConfig,
    default_mode: RetrievalMode,
    overfetch: usize,
    vector_timeout: Duration,
    retry: RetryPolicy,
    cache_ttl: Duration,
    sweep_interval: Duration,
    checkpoint_path: Option<PathBuf>,
}

impl HybridRetriever {
    /// Create a retriever over existing components
    pub fn new(
        config: &Config,
        index: Arc<Bm25Index>,
        cache: Arc<MultiTierCache>,
        sessions: Arc<SessionRegistry>,
    ) -> Result<Self> {
        let fusion = FusionConfig::new(config.fusion.k_constant, config.fusion.weight_lexical)?;

        Ok(Self {
            index,
            vector: None,
            embedder: None,
            cache,
            sessions,
            fusion,
            default_mode: config.retrieval.mode,
            overfetch: config.retrieval.overfetch,
            vector_timeout: config.vector_timeout(),
            retry: RetryPolicy::new(
                config.retrieval.retry_attempts,
                Duration::from_millis(config.retrieval.retry_backoff_ms),
            ),
            cache_ttl: config.cache_ttl(),
            sweep_interval: config.sweep_interval(),
            checkpoint_path: None,
        })
    }

    /// Wire every component from configuration.
    ///
    /// The BM25 checkpoint is loaded from the data directory; a missing one
    /// starts an empty index, while a corrupt or unsupported one is an error
    /// (rebuild with [`Bm25Index::load_or_rebuild`] when source chunks are at hand).
    pub fn open(
        config: &Config,
        vector: Option<Arc<dyn VectorSearch>>,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<Self> {
        let path = config.checkpoint_path();
        let params = Bm25Params {
            k1: config.bm25.k1,
            b: config.bm25.b,
        };
        let tokenizer = Tokenizer::new(config.bm25.remove_stopwords, config.bm25.min_token_len);

        let index = match Bm25Index::load(&path) {
            Ok(index) => {
                if index.params() != params || *index.tokenizer() != tokenizer {
                    warn!(
                        "Checkpoint {} was built with different BM25 settings; using the checkpoint's",
                        path.display()
                    );
                }
                index
            }
            Err(QuarryError::CheckpointNotFound { .. }) => {
                info!("No BM25 checkpoint at {}, starting empty", path.display());
                Bm25Index::new(params, tokenizer)
            }
            Err(e) => return Err(e),
        };

        let cache = MultiTierCache::from_config(config);
        let sessions = SessionRegistry::new(config.session_idle_timeout());

        let mut retriever = Self::new(config, Arc::new(index), Arc::new(cache), Arc::new(sessions))?
            .with_checkpoint_path(path);
        retriever.vector = vector;
        retriever.embedder = embedder;
        Ok(retriever)
    }

    pub fn with_vector(mut self, vector: Arc<dyn VectorSearch>) -> Self {
        self.vector = Some(vector);
        self
    }

    /// Embed queries locally and send the vector store embeddings instead of text
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_checkpoint_path(mut self, path: PathBuf) -> Self {
        self.checkpoint_path = Some(path);
        self
    }

    pub fn index(&self) -> &Arc<Bm25Index> {
        &self.index
    }

    pub fn cache(&self) -> &Arc<MultiTierCache> {
        &self.cache
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn fusion_config(&self) -> &FusionConfig {
        &self.fusion
    }

    /// Mode from configuration
    pub fn default_mode(&self) -> RetrievalMode {
        self.default_mode
    }

    /// Top-k chunks for `query` within `session_id`.
    ///
    /// Sessions are issued by [`create_session`](Self::create_session); an
    /// id the registry never issued fails with `SessionNotFound` rather than
    /// opening a session implicitly.
    pub async fn retrieve(
        &self,
        query: &str,
        session_id: &str,
        k: usize,
        mode: RetrievalMode,
    ) -> Result<Vec<RetrievedChunk>> {
        self.retrieve_with(query, session_id, k, mode, RetrieveOptions::default())
            .await
            .map(|retrieval| retrieval.chunks)
    }

    pub async fn retrieve_with(
        &self,
        query: &str,
        session_id: &str,
        k: usize,
        mode: RetrievalMode,
        options: RetrieveOptions,
    ) -> Result<Retrieval> {
        if k == 0 {
            return Err(QuarryError::InvalidQuery("k must be greater than 0".to_string()));
        }
        if query.trim().is_empty() {
            return Err(QuarryError::InvalidQuery(
                "Query text cannot be empty".to_string(),
            ));
        }

        // Taken before the session check so an end_session or index
        // mutation from here on keeps these results out of the cache
        let ticket = self.cache.ticket(session_id);
        self.check_session(session_id).await?;

        if let Some((entry, tier)) = self.cache.get(session_id, query, mode, k).await {
            return Ok(Retrieval {
                chunks: entry.results,
                source: RetrievalSource::Cache(tier),
                degraded: false,
            });
        }

        let started = Instant::now();
        let fetch = k.max(self.overfetch);
        let deadline = options.deadline.unwrap_or(self.vector_timeout);

        let (mut chunks, degraded) = match mode {
            RetrievalMode::Bm25 => (pass_through_lexical(self.index.search(query, fetch)), false),
            RetrievalMode::Vector => match self.vector_search(query, fetch, deadline).await {
                VectorOutcome::Hits(hits) => (pass_through_vector(hits), false),
                VectorOutcome::NotConfigured | VectorOutcome::Unavailable => {
                    (pass_through_lexical(self.index.search(query, fetch)), true)
                }
            },
            RetrievalMode::Hybrid => {
                // Both sides run concurrently, joined before fusion
                let (lexical, vector) = tokio::join!(
                    async { self.index.search(query, fetch) },
                    self.vector_search(query, fetch, deadline)
                );
                let (vector, degraded) = match vector {
                    VectorOutcome::Hits(hits) => (hits, false),
                    VectorOutcome::NotConfigured => (Vec::new(), false),
                    VectorOutcome::Unavailable => (Vec::new(), true),
                };
                (self.fuse(lexical, vector), degraded)
            }
        };

        chunks.truncate(k);
        for (i, chunk) in chunks.iter_mut().enumerate() {
            chunk.rank = i + 1;
        }

        debug!(
            mode = %mode,
            k,
            results = chunks.len(),
            degraded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "retrieval complete"
        );

        if !degraded {
            self.cache.put_if_current(
                ticket,
                session_id,
                query,
                mode,
                k,
                chunks.clone(),
                self.cache_ttl,
            );
        }

        Ok(Retrieval {
            chunks,
            source: RetrievalSource::Fresh,
            degraded,
        })
    }

    /// Refresh the session, tearing it down if it went idle
    async fn check_session(&self, session_id: &str) -> Result<()> {
        match self.sessions.touch(session_id) {
            Err(QuarryError::SessionExpired { id }) => {
                if let Err(e) = self.end_session(&id).await {
                    warn!("Failed to clear cache of expired session: {}", e);
                }
                Err(QuarryError::SessionExpired { id })
            }
            other => other,
        }
    }

    fn fuse(&self, lexical: Vec<LexicalHit>, vector: Vec<VectorHit>) -> Vec<RetrievedChunk> {
        let lexical: Vec<(String, f32)> =
            lexical.into_iter().map(|h| (h.chunk_id, h.score)).collect();
        let vector: Vec<(String, f32)> = vector.into_iter().map(|h| (h.chunk_id, h.score)).collect();

        fuse(&lexical, &vector, &self.fusion)
            .into_iter()
            .map(|c| RetrievedChunk {
                chunk_id: c.chunk_id,
                lexical_score: c.lexical_score,
                vector_score: c.vector_score,
                fused_score: c.fused_score,
                rank: 0,
            })
            .collect()
    }

    async fn vector_search(&self, query: &str, fetch: usize, deadline: Duration) -> VectorOutcome {
        let Some(vector) = self.vector.as_deref() else {
            return VectorOutcome::NotConfigured;
        };

        let attempt = async {
            let vector_query = self.vector_query(query).await?;
            let filter = VectorFilter::any();
            let (vector_query, filter) = (&vector_query, &filter);
            self.retry
                .run("vector query", move || {
                    vector.query(vector_query.clone(), fetch, filter)
                })
                .await
                .map_err(|e| QuarryError::IndexUnavailable(e.to_string()))
        };

        match tokio::time::timeout(deadline, attempt).await {
            Ok(Ok(hits)) => VectorOutcome::Hits(hits),
            Ok(Err(e)) => {
                warn!("Vector search failed, degrading to lexical results: {}", e);
                VectorOutcome::Unavailable
            }
            Err(_) => {
                warn!(
                    "Vector search missed its {:?} deadline, degrading to lexical results",
                    deadline
                );
                VectorOutcome::Unavailable
            }
        }
    }

    async fn vector_query(&self, query: &str) -> Result<VectorQuery> {
        let Some(embedder) = &self.embedder else {
            return Ok(VectorQuery::Text(query.to_string()));
        };

        let embedder = Arc::clone(embedder);
        let text = query.to_string();
        let embedding = tokio::task::spawn_blocking(move || embedder.embed(&text))
            .await
            .map_err(|e| QuarryError::IndexUnavailable(format!("embedding task failed: {}", e)))?
            .map_err(|e| QuarryError::IndexUnavailable(e.to_string()))?;

        Ok(VectorQuery::Embedding(embedding))
    }

    /// Add chunks to the lexical index. Cached results are dropped.
    pub async fn index_chunks(&self, chunks: &[Chunk]) -> usize {
        let count = self.index.add_batch(chunks);
        self.cache.clear().await;
        info!("Indexed {} chunks ({} total)", count, self.index.len());
        count
    }

    /// Retire one chunk. Cached results are dropped if it was indexed.
    pub async fn retire_chunk(&self, chunk_id: &str) -> bool {
        let removed = self.index.remove(chunk_id);
        if removed {
            self.cache.clear().await;
        }
        removed
    }

    /// Retire every chunk of a document
    pub async fn retire_document(&self, document_id: &str) -> usize {
        let removed = self.index.remove_document(document_id);
        if removed > 0 {
            self.cache.clear().await;
            info!("Retired {} chunks of document {}", removed, document_id);
        }
        removed
    }

    /// Save the lexical index to its checkpoint path
    pub async fn checkpoint(&self) -> Result<()> {
        let path = self.checkpoint_path.clone().ok_or_else(|| {
            QuarryError::Config("No checkpoint path configured for this retriever".to_string())
        })?;

        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || index.save(&path))
            .await
            .map_err(|e| QuarryError::Config(format!("Checkpoint task failed: {}", e)))?
    }

    /// Issue a new session
    pub fn create_session(&self) -> String {
        self.sessions.create()
    }

    /// End a session and delete everything cached under it
    pub async fn end_session(&self, session_id: &str) -> Result<()> {
        self.sessions.end(session_id);
        self.cache.invalidate_session(session_id).await
    }

    /// Remove idle sessions and their cached data. Returns the expired ids.
    pub async fn sweep_sessions(&self) -> Vec<String> {
        let expired = self.sessions.sweep_expired();
        for id in &expired {
            if let Err(e) = self.cache.invalidate_session(id).await {
                warn!("Failed to clear cache of expired session: {}", e);
            }
        }
        if !expired.is_empty() {
            info!("Expired {} idle sessions", expired.len());
        }
        expired
    }

    /// Run [`spawn_maintenance`](Self::spawn_maintenance) at the configured
    /// sweep interval
    pub fn start_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        debug!(interval_secs = self.sweep_interval.as_secs(), "starting maintenance");
        self.spawn_maintenance(self.sweep_interval)
    }

    /// Periodically sweep idle sessions and purge expired cache entries.
    ///
    /// The task holds only a weak reference and stops once the retriever is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let retriever: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(retriever) = retriever.upgrade() else {
                    debug!("retriever dropped, stopping maintenance");
                    break;
                };
                retriever.sweep_sessions().await;
                let purged = retriever.cache.purge_expired().await;
                if purged > 0 {
                    debug!(purged, "purged expired cache entries");
                }
            }
        })
    }
}

enum VectorOutcome {
    Hits(Vec<VectorHit>),
    /// No vector store attached
    NotConfigured,
    /// Store errored or timed out
    Unavailable,
}

fn pass_through_lexical(hits: Vec<LexicalHit>) -> Vec<RetrievedChunk> {
    hits.into_iter()
        .map(|h| RetrievedChunk {
            chunk_id: h.chunk_id,
            lexical_score: Some(h.score),
            vector_score: None,
            fused_score: h.score,
            rank: 0,
        })
        .collect()
}

fn pass_through_vector(hits: Vec<VectorHit>) -> Vec<RetrievedChunk> {
    hits.into_iter()
        .map(|h| RetrievedChunk {
            chunk_id: h.chunk_id,
            lexical_score: None,
            vector_score: Some(h.score),
            fused_score: h.score,
            rank: 0,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingError, VectorIndexError};
    use async_trait::async_trait;
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a fixed ranking and records what it was asked
    struct FixedVector {
        hits: Vec<(&'static str, f32)>,
        last_query: std::sync::Mutex<Option<VectorQuery>>,
        last_k: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FixedVector {
        fn new(hits: Vec<(&'static str, f32)>) -> Self {
            Self {
                hits,
                last_query: std::sync::Mutex::new(None),
                last_k: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl VectorSearch for FixedVector {
        async fn query(
            &self,
            query: VectorQuery,
            k: usize,
            _filter: &VectorFilter,
        ) -> std::result::Result<Vec<VectorHit>, VectorIndexError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_k.store(k, Ordering::SeqCst);
            *self.last_query.lock().unwrap() = Some(query);
            Ok(self
                .hits
                .iter()
                .take(k)
                .map(|(id, score)| VectorHit {
                    chunk_id: id.to_string(),
                    score: *score,
                })
                .collect())
        }
    }

    struct ConstEmbedder;

    impl Embedder for ConstEmbedder {
        fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            Ok(vec![0.5, 0.5])
        }
        fn dimension(&self) -> usize {
            2
        }
        fn model_name(&self) -> &str {
            "const"
        }
    }

    fn retriever() -> HybridRetriever {
        let config = Config::default();
        let index = Arc::new(Bm25Index::default());
        let tokenizer = Tokenizer::default();
        index.add_batch(&[
            Chunk::new("A", "d", "cats and dogs", &tokenizer),
            Chunk::new("B", "d", "dogs only", &tokenizer),
            Chunk::new("C", "d", "cats only", &tokenizer),
        ]);
        let cache = Arc::new(MultiTierCache::memory_only(
            NonZeroUsize::new(16).unwrap(),
            config.cache_ttl(),
        ));
        let sessions = Arc::new(SessionRegistry::new(config.session_idle_timeout()));
        HybridRetriever::new(&config, index, cache, sessions).unwrap()
    }

    fn ids(chunks: &[RetrievedChunk]) -> Vec<&str> {
        chunks.iter().map(|c| c.chunk_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_rejects_invalid_queries() {
        let retriever = retriever();
        let session = retriever.create_session();

        for (query, k) in [("cats", 0), ("   ", 3), ("", 3)] {
            let result = retriever
                .retrieve(query, &session, k, RetrievalMode::Bm25)
                .await;
            assert!(matches!(result, Err(QuarryError::InvalidQuery(_))));
        }
    }

    #[tokio::test]
    async fn test_unknown_session_rejected() {
        let retriever = retriever();
        let result = retriever
            .retrieve("cats", "not-a-session", 2, RetrievalMode::Bm25)
            .await;
        assert!(matches!(result, Err(QuarryError::SessionNotFound { .. })));
    }

    #[tokio::test]
    async fn test_hybrid_fuses_both_rankings() {
        let vector = Arc::new(FixedVector::new(vec![("B", 0.9), ("C", 0.8)]));
        let retriever = retriever().with_vector(vector);
        let session = retriever.create_session();

        let result = retriever
            .retrieve_with("cats", &session, 3, RetrievalMode::Hybrid, RetrieveOptions::default())
            .await
            .unwrap();

        // C: lexical rank 1 + vector rank 2; B: vector rank 1; A: lexical rank 2
        assert_eq!(ids(&result.chunks), vec!["C", "B", "A"]);
        assert!(!result.degraded);
        let c = &result.chunks[0];
        assert!(c.lexical_score.is_some() && c.vector_score == Some(0.8));
        assert_eq!(
            result.chunks.iter().map(|c| c.rank).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn test_vector_mode_passes_scores_through() {
        let vector = Arc::new(FixedVector::new(vec![("B", 0.9), ("A", 0.4)]));
        let retriever = retriever().with_vector(vector);
        let session = retriever.create_session();

        let chunks = retriever
            .retrieve("dogs", &session, 5, RetrievalMode::Vector)
            .await
            .unwrap();
        assert_eq!(ids(&chunks), vec!["B", "A"]);
        assert_eq!(chunks[0].fused_score, 0.9);
        assert_eq!(chunks[0].lexical_score, None);
    }

    #[tokio::test]
    async fn test_vector_mode_without_store_is_degraded() {
        let retriever = retriever();
        let session = retriever.create_session();

        let result = retriever
            .retrieve_with("cats", &session, 5, RetrievalMode::Vector, RetrieveOptions::default())
            .await
            .unwrap();
        assert!(result.degraded);
        assert_eq!(ids(&result.chunks), vec!["C", "A"]);
        assert!(result.chunks.iter().all(|c| c.vector_score.is_none()));

        // Lexical stand-ins are not cached under the vector key
        let again = retriever
            .retrieve_with("cats", &session, 5, RetrievalMode::Vector, RetrieveOptions::default())
            .await
            .unwrap();
        assert_eq!(again.source, RetrievalSource::Fresh);
        assert!(retriever
            .cache()
            .get(&session, "cats", RetrievalMode::Vector, 5)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_embedder_sends_embeddings() {
        let vector = Arc::new(FixedVector::new(vec![("A", 0.9)]));
        let retriever = retriever()
            .with_vector(vector.clone())
            .with_embedder(Arc::new(ConstEmbedder));
        let session = retriever.create_session();

        retriever
            .retrieve("cats", &session, 1, RetrievalMode::Vector)
            .await
            .unwrap();
        assert_eq!(
            *vector.last_query.lock().unwrap(),
            Some(VectorQuery::Embedding(vec![0.5, 0.5]))
        );
    }

    #[tokio::test]
    async fn test_overfetch_applies_to_sub_searches() {
        let vector = Arc::new(FixedVector::new(vec![("B", 0.9)]));
        let retriever = retriever().with_vector(vector.clone());
        let session = retriever.create_session();

        retriever
            .retrieve("dogs", &session, 1, RetrievalMode::Vector)
            .await
            .unwrap();
        assert_eq!(vector.calls.load(Ordering::SeqCst), 1);
        assert_eq!(vector.last_k.load(Ordering::SeqCst), 50);
        // Without an embedder the store receives the original text
        assert_eq!(
            *vector.last_query.lock().unwrap(),
            Some(VectorQuery::Text("dogs".to_string()))
        );
    }

    #[tokio::test]
    async fn test_second_call_hits_cache() {
        let vector = Arc::new(FixedVector::new(vec![("C", 0.9)]));
        let retriever = retriever().with_vector(vector.clone());
        let session = retriever.create_session();

        let first = retriever
            .retrieve_with("cats", &session, 2, RetrievalMode::Hybrid, RetrieveOptions::default())
            .await
            .unwrap();
        let second = retriever
            .retrieve_with("  CATS", &session, 2, RetrievalMode::Hybrid, RetrieveOptions::default())
            .await
            .unwrap();

        assert_eq!(first.source, RetrievalSource::Fresh);
        assert_eq!(second.source, RetrievalSource::Cache(CacheHitTier::L1));
        assert_eq!(first.chunks, second.chunks);
        assert_eq!(vector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_index_mutation_drops_cached_results() {
        let retriever = retriever();
        let session = retriever.create_session();
        let before = retriever
            .retrieve("cats", &session, 5, RetrievalMode::Bm25)
            .await
            .unwrap();
        assert_eq!(ids(&before), vec!["C", "A"]);

        assert!(retriever.retire_chunk("C").await);
        let after = retriever
            .retrieve("cats", &session, 5, RetrievalMode::Bm25)
            .await
            .unwrap();
        assert_eq!(ids(&after), vec!["A"]);
    }

    #[tokio::test]
    async fn test_checkpoint_requires_path() {
        let retriever = retriever();
        assert!(matches!(
            retriever.checkpoint().await,
            Err(QuarryError::Config(_))
        ));
    }
}
