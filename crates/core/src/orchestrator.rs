use crate::traits::{CompletionGenerator, EmbeddingGenerator, KnowledgeStore};
use crate::{
    CompletionError, ConfigError, ContentChunk, EmbeddingError, MatchSet, PipelineConfig,
    PipelineError, Question, Reply, StageKind, StoreError,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Where a request is in the cascade. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelinePhase {
    Start,
    LexicalTried,
    VectorTried,
    CompletionTried,
    Done,
}

impl From<StageKind> for PipelinePhase {
    fn from(stage: StageKind) -> Self {
        match stage {
            StageKind::Lexical => PipelinePhase::LexicalTried,
            StageKind::Vector => PipelinePhase::VectorTried,
        }
    }
}

/// Per-request state threaded through the stages.
pub struct RetrievalState {
    phase: PipelinePhase,
    context: Vec<ContentChunk>,
    cancel: watch::Receiver<bool>,
}

impl RetrievalState {
    pub fn new(cancel: watch::Receiver<bool>) -> Self {
        Self {
            phase: PipelinePhase::Start,
            context: Vec::new(),
            cancel,
        }
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    /// Chunks gathered so far that may feed the completion prompt.
    pub fn context(&self) -> &[ContentChunk] {
        &self.context
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn advance(&mut self, next: PipelinePhase) {
        debug_assert!(next > self.phase, "phase {next:?} after {:?}", self.phase);
        debug!(from = ?self.phase, to = ?next, "pipeline phase");
        self.phase = next;
    }

    fn ensure_live(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

enum Bounded<T> {
    Finished(T),
    TimedOut,
    Cancelled,
}

/// Answers website questions by cascading through text search, vector
/// search and a completion model, cheapest first.
pub struct AnswerPipeline<S, E, C>
where
    S: KnowledgeStore,
    E: EmbeddingGenerator,
    C: CompletionGenerator,
{
    store: S,
    embedder: E,
    completer: C,
    config: Arc<PipelineConfig>,
}

impl<S, E, C> AnswerPipeline<S, E, C>
where
    S: KnowledgeStore + Send + Sync,
    E: EmbeddingGenerator + Send + Sync,
    C: CompletionGenerator + Send + Sync,
{
    /// Rejects configs that fail [`PipelineConfig::validate`], so a stage
    /// list can never run vector search ahead of text search.
    pub fn new(
        store: S,
        embedder: E,
        completer: C,
        config: Arc<PipelineConfig>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            embedder,
            completer,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn answer(&self, question: &str) -> Result<Reply, PipelineError> {
        let (_keep_open, cancel) = watch::channel(false);
        self.answer_with_cancel(question, cancel).await
    }

    /// Like [`AnswerPipeline::answer`], but stops as soon as `cancel` flips to
    /// `true`, dropping whichever upstream call is in flight.
    pub async fn answer_with_cancel(
        &self,
        question: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<Reply, PipelineError> {
        let question = Question::parse(question)?;
        let started = Instant::now();
        let mut state = RetrievalState::new(cancel);

        for &stage in &self.config.stages {
            state.ensure_live()?;
            let matches = self.attempt(stage, &question, &mut state).await;
            state.ensure_live()?;
            state.advance(stage.into());

            if let Some(chunk) = matches.and_then(|matches| self.accept(stage, matches, &mut state)) {
                state.advance(PipelinePhase::Done);
                info!(
                    %stage,
                    chunk_id = %chunk.id,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "answered from knowledge store"
                );
                return Ok(Reply::from_chunk(chunk, stage));
            }
        }

        state.ensure_live()?;
        let reply = self.complete(&question, &mut state).await;
        if reply.is_ok() {
            info!(
                context_chunks = state.context().len(),
                latency_ms = started.elapsed().as_millis() as u64,
                "answered from completion model"
            );
        }
        reply
    }

    /// Runs one retrieval stage. Every failure is absorbed into `None`.
    pub async fn attempt(
        &self,
        stage: StageKind,
        question: &Question,
        state: &mut RetrievalState,
    ) -> Option<MatchSet> {
        match stage {
            StageKind::Lexical => self.lexical_stage(question, state).await,
            StageKind::Vector => self.vector_stage(question, state).await,
        }
    }

    async fn lexical_stage(&self, question: &Question, state: &mut RetrievalState) -> Option<MatchSet> {
        let limit = self.config.lexical_timeout;
        let call = self
            .store
            .lexical_search(question.as_str(), self.config.max_matches);

        match bounded(limit, &mut state.cancel, call).await {
            Bounded::Finished(Ok(matches)) => {
                debug!(matches = matches.len(), "lexical search returned");
                Some(matches)
            }
            Bounded::Finished(Err(error)) => {
                log_store_failure(StageKind::Lexical, &error);
                None
            }
            Bounded::TimedOut => {
                log_store_failure(StageKind::Lexical, &StoreError::Timeout(limit));
                None
            }
            Bounded::Cancelled => None,
        }
    }

    async fn vector_stage(&self, question: &Question, state: &mut RetrievalState) -> Option<MatchSet> {
        let limit = self.config.embedding_timeout;
        let embedding = match bounded(limit, &mut state.cancel, self.embedder.embed(question.as_str())).await {
            Bounded::Finished(Ok(embedding)) => embedding,
            Bounded::Finished(Err(error)) => {
                log_embedding_failure(&error);
                return None;
            }
            Bounded::TimedOut => {
                log_embedding_failure(&EmbeddingError::Timeout(limit));
                return None;
            }
            Bounded::Cancelled => return None,
        };

        let limit = self.config.vector_timeout;
        let call = self.store.vector_search(
            &embedding,
            self.config.similarity_threshold,
            self.config.max_matches,
        );

        match bounded(limit, &mut state.cancel, call).await {
            Bounded::Finished(Ok(matches)) => {
                debug!(
                    matches = matches.len(),
                    top_similarity = ?matches.top_similarity(),
                    "vector search returned"
                );
                Some(matches)
            }
            Bounded::Finished(Err(error)) => {
                log_store_failure(StageKind::Vector, &error);
                None
            }
            Bounded::TimedOut => {
                log_store_failure(StageKind::Vector, &StoreError::Timeout(limit));
                None
            }
            Bounded::Cancelled => None,
        }
    }

    /// Picks the first chunk trustworthy enough to return verbatim. Everything
    /// else that still counts as a match is kept as completion context.
    ///
    /// A top match that is too short does not end the stage: the next eligible
    /// chunk in store order gets its turn.
    fn accept(
        &self,
        stage: StageKind,
        matches: MatchSet,
        state: &mut RetrievalState,
    ) -> Option<ContentChunk> {
        let threshold = self.config.similarity_threshold;
        let mut eligible: Vec<ContentChunk> = matches
            .into_iter()
            .filter(|chunk| !chunk.is_blank())
            .filter(|chunk| match stage {
                StageKind::Lexical => true,
                StageKind::Vector => chunk
                    .similarity
                    .is_some_and(|similarity| similarity >= threshold),
            })
            .collect();

        let min_trust = self.config.min_trust_chars;
        if let Some(position) = eligible
            .iter()
            .position(|chunk| chunk.body_chars() > min_trust)
        {
            return Some(eligible.swap_remove(position));
        }

        if !eligible.is_empty() {
            debug!(%stage, kept = eligible.len(), "matches too short to trust, kept as context");
        }
        state.context.extend(eligible);
        None
    }

    async fn complete(
        &self,
        question: &Question,
        state: &mut RetrievalState,
    ) -> Result<Reply, PipelineError> {
        let context = build_context(&state.context, self.config.max_context_chars);
        let system_prompt = build_system_prompt(&self.config.site_name, &context);
        let limit = self.config.completion_timeout;
        let call = self.completer.complete(&system_prompt, question.as_str());

        let outcome = bounded(limit, &mut state.cancel, call).await;
        state.advance(PipelinePhase::CompletionTried);

        let text = match outcome {
            Bounded::Finished(Ok(text)) => text,
            Bounded::Finished(Err(error)) => {
                error!(error = %error, "completion failed, no fallback left");
                return Err(PipelineError::UpstreamUnavailable(error));
            }
            Bounded::TimedOut => {
                error!(timeout_ms = limit.as_millis() as u64, "completion timed out, no fallback left");
                return Err(PipelineError::UpstreamUnavailable(CompletionError::Timeout(limit)));
            }
            Bounded::Cancelled => return Err(PipelineError::Cancelled),
        };

        state.advance(PipelinePhase::Done);
        if text.trim().is_empty() {
            warn!("completion returned blank text");
            return Ok(Reply::generated(self.config.empty_completion_reply.clone()));
        }
        Ok(Reply::generated(text))
    }
}

/// Joins chunk bodies with blank lines and cuts the result to `max_chars`
/// characters.
pub fn build_context(chunks: &[ContentChunk], max_chars: usize) -> String {
    let joined = chunks
        .iter()
        .map(|chunk| chunk.body.trim())
        .filter(|body| !body.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    match joined.char_indices().nth(max_chars) {
        Some((cut, _)) => joined[..cut].to_string(),
        None => joined,
    }
}

pub fn build_system_prompt(site_name: &str, context: &str) -> String {
    if context.trim().is_empty() {
        format!(
            "You are a helpful assistant for {site_name}. No website content matched this \
             question. Give a short, generic, helpful response and suggest contacting the \
             team for specifics."
        )
    } else {
        format!(
            "You are a helpful assistant for {site_name}. Answer using the following website \
             content. If it does not cover the question, politely say you don't know.\n\n\
             Context:\n{context}"
        )
    }
}

async fn bounded<F>(limit: Duration, cancel: &mut watch::Receiver<bool>, call: F) -> Bounded<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancelled(cancel) => Bounded::Cancelled,
        result = tokio::time::timeout(limit, call) => match result {
            Ok(output) => Bounded::Finished(output),
            Err(_) => Bounded::TimedOut,
        },
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let closed = cancel.wait_for(|flag| *flag).await.is_err();
    if closed {
        // Sender gone without cancelling: never resolves.
        std::future::pending::<()>().await;
    }
}

fn log_store_failure(stage: StageKind, error: &StoreError) {
    warn!(%stage, timeout = error.is_timeout(), error = %error, "store query failed, continuing");
}

fn log_embedding_failure(error: &EmbeddingError) {
    match error {
        EmbeddingError::TooLarge { .. } => {
            info!(error = %error, "question too large to embed, skipping vector stage")
        }
        _ => warn!(error = %error, "embedding failed, skipping vector stage"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ReplySource, DEFAULT_MIN_TRUST_CHARS};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const HANG: Duration = Duration::from_secs(30);

    #[derive(Clone)]
    enum Canned {
        Matches(Vec<ContentChunk>),
        Fail,
        Hang,
    }

    #[derive(Clone, Default)]
    struct Calls {
        lexical: Arc<AtomicUsize>,
        vector: Arc<AtomicUsize>,
        embed: Arc<AtomicUsize>,
        complete: Arc<AtomicUsize>,
        system_prompts: Arc<Mutex<Vec<String>>>,
    }

    impl Calls {
        fn counts(&self) -> (usize, usize, usize, usize) {
            (
                self.lexical.load(Ordering::SeqCst),
                self.embed.load(Ordering::SeqCst),
                self.vector.load(Ordering::SeqCst),
                self.complete.load(Ordering::SeqCst),
            )
        }

        fn last_prompt(&self) -> String {
            self.system_prompts
                .lock()
                .expect("lock")
                .last()
                .cloned()
                .unwrap_or_default()
        }
    }

    struct FakeStore {
        lexical: Canned,
        vector: Canned,
        calls: Calls,
    }

    #[async_trait]
    impl KnowledgeStore for FakeStore {
        async fn lexical_search(&self, _text: &str, _limit: usize) -> Result<MatchSet, StoreError> {
            self.calls.lexical.fetch_add(1, Ordering::SeqCst);
            respond(&self.lexical).await
        }

        async fn vector_search(
            &self,
            vector: &[f32],
            _threshold: f64,
            _limit: usize,
        ) -> Result<MatchSet, StoreError> {
            assert!(!vector.is_empty());
            self.calls.vector.fetch_add(1, Ordering::SeqCst);
            respond(&self.vector).await
        }
    }

    async fn respond(canned: &Canned) -> Result<MatchSet, StoreError> {
        match canned {
            Canned::Matches(chunks) => Ok(MatchSet::new(chunks.clone())),
            Canned::Fail => Err(StoreError::Unavailable("connection refused".to_string())),
            Canned::Hang => {
                tokio::time::sleep(HANG).await;
                Ok(MatchSet::empty())
            }
        }
    }

    enum EmbedBehavior {
        Vector,
        TooLarge,
        Fail,
        Hang,
    }

    struct FakeEmbedder {
        behavior: EmbedBehavior,
        calls: Calls,
    }

    #[async_trait]
    impl EmbeddingGenerator for FakeEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.embed.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                EmbedBehavior::Vector => Ok(vec![0.1; 8]),
                EmbedBehavior::TooLarge => Err(EmbeddingError::TooLarge {
                    estimated_tokens: 9_000,
                    limit: 8_191,
                }),
                EmbedBehavior::Fail => Err(EmbeddingError::Unavailable("503".to_string())),
                EmbedBehavior::Hang => {
                    tokio::time::sleep(HANG).await;
                    Ok(vec![0.1; 8])
                }
            }
        }
    }

    enum CompleteBehavior {
        Text(&'static str),
        Fail,
        Hang,
    }

    struct FakeCompleter {
        behavior: CompleteBehavior,
        calls: Calls,
    }

    #[async_trait]
    impl CompletionGenerator for FakeCompleter {
        async fn complete(
            &self,
            system_prompt: &str,
            _user_message: &str,
        ) -> Result<String, CompletionError> {
            self.calls.complete.fetch_add(1, Ordering::SeqCst);
            self.calls
                .system_prompts
                .lock()
                .expect("lock")
                .push(system_prompt.to_string());
            match self.behavior {
                CompleteBehavior::Text(text) => Ok(text.to_string()),
                CompleteBehavior::Fail => Err(CompletionError::Unavailable("500".to_string())),
                CompleteBehavior::Hang => {
                    tokio::time::sleep(HANG).await;
                    Ok(String::new())
                }
            }
        }
    }

    struct Harness {
        lexical: Canned,
        vector: Canned,
        embed: EmbedBehavior,
        complete: CompleteBehavior,
        config: PipelineConfig,
    }

    impl Default for Harness {
        fn default() -> Self {
            Self {
                lexical: Canned::Matches(Vec::new()),
                vector: Canned::Matches(Vec::new()),
                embed: EmbedBehavior::Vector,
                complete: CompleteBehavior::Text("generated answer"),
                config: PipelineConfig {
                    lexical_timeout: Duration::from_millis(50),
                    embedding_timeout: Duration::from_millis(50),
                    vector_timeout: Duration::from_millis(50),
                    completion_timeout: Duration::from_millis(50),
                    ..PipelineConfig::default()
                },
            }
        }
    }

    impl Harness {
        fn try_build(
            self,
        ) -> Result<(AnswerPipeline<FakeStore, FakeEmbedder, FakeCompleter>, Calls), ConfigError>
        {
            let calls = Calls::default();
            let pipeline = AnswerPipeline::new(
                FakeStore {
                    lexical: self.lexical,
                    vector: self.vector,
                    calls: calls.clone(),
                },
                FakeEmbedder {
                    behavior: self.embed,
                    calls: calls.clone(),
                },
                FakeCompleter {
                    behavior: self.complete,
                    calls: calls.clone(),
                },
                Arc::new(self.config),
            )?;
            Ok((pipeline, calls))
        }

        fn build(self) -> (AnswerPipeline<FakeStore, FakeEmbedder, FakeCompleter>, Calls) {
            self.try_build().expect("valid pipeline config")
        }
    }

    const SERVICES: &str = "We provide digital marketing, SEO, and analytics.";
    const LONG_BODY: &str = "Our team builds websites, runs ad campaigns and reports monthly.";

    fn chunk(id: &str, body: &str) -> ContentChunk {
        ContentChunk::new(id, "Title", body)
    }

    #[tokio::test]
    async fn blank_question_is_rejected_before_any_call() {
        let (pipeline, calls) = Harness::default().build();

        for question in ["", "   ", "\t\n"] {
            let error = pipeline.answer(question).await.unwrap_err();
            assert!(matches!(error, PipelineError::InvalidInput));
        }
        assert_eq!(calls.counts(), (0, 0, 0, 0));
    }

    #[tokio::test]
    async fn substantial_lexical_match_is_returned_verbatim() {
        let (pipeline, calls) = Harness {
            lexical: Canned::Matches(vec![ContentChunk::new("svc", "Services", SERVICES)]),
            ..Harness::default()
        }
        .build();

        let reply = pipeline
            .answer("What services do you offer?")
            .await
            .expect("reply");

        assert_eq!(reply.text, SERVICES);
        assert_eq!(reply.source, ReplySource::Lexical);
        assert_eq!(reply.chunk_id.as_deref(), Some("svc"));
        assert_eq!(calls.counts(), (1, 0, 0, 0));
    }

    #[tokio::test]
    async fn vector_match_at_exact_threshold_is_returned() {
        let (pipeline, calls) = Harness {
            lexical: Canned::Matches(vec![chunk("short", "SEO.")]),
            vector: Canned::Matches(vec![chunk("v1", LONG_BODY).with_similarity(0.75)]),
            ..Harness::default()
        }
        .build();

        let reply = pipeline.answer("what do you build").await.expect("reply");

        assert_eq!(reply.text, LONG_BODY);
        assert_eq!(reply.source, ReplySource::Vector);
        assert_eq!(calls.counts(), (1, 1, 1, 0));
    }

    #[tokio::test]
    async fn low_similarity_falls_back_to_contextless_completion() {
        let (pipeline, calls) = Harness {
            vector: Canned::Matches(vec![chunk("v1", LONG_BODY).with_similarity(0.40)]),
            complete: CompleteBehavior::Text("Happy to help with that."),
            ..Harness::default()
        }
        .build();

        let reply = pipeline.answer("xyz123").await.expect("reply");

        assert_eq!(reply.text, "Happy to help with that.");
        assert_eq!(reply.source, ReplySource::Completion);
        assert_eq!(calls.counts(), (1, 1, 1, 1));
        let prompt = calls.last_prompt();
        assert!(prompt.contains("No website content matched"));
        assert!(!prompt.contains(LONG_BODY));
    }

    #[tokio::test]
    async fn completion_runs_even_with_zero_matches() {
        let (pipeline, calls) = Harness::default().build();

        let reply = pipeline.answer("anything").await.expect("reply");

        assert_eq!(reply.text, "generated answer");
        assert_eq!(calls.counts(), (1, 1, 1, 1));
        assert!(!calls.last_prompt().contains("Context:"));
    }

    #[tokio::test]
    async fn lexical_timeout_behaves_like_no_matches() {
        let (pipeline, calls) = Harness {
            lexical: Canned::Hang,
            vector: Canned::Matches(vec![chunk("v1", LONG_BODY).with_similarity(0.9)]),
            ..Harness::default()
        }
        .build();

        let reply = pipeline.answer("hours").await.expect("reply");

        assert_eq!(reply.text, LONG_BODY);
        assert_eq!(calls.counts(), (1, 1, 1, 0));
    }

    #[tokio::test]
    async fn store_failures_and_embedding_timeout_still_reach_completion() {
        let (pipeline, calls) = Harness {
            lexical: Canned::Fail,
            embed: EmbedBehavior::Hang,
            ..Harness::default()
        }
        .build();

        let reply = pipeline.answer("hours").await.expect("reply");

        assert_eq!(reply.source, ReplySource::Completion);
        assert_eq!(calls.counts(), (1, 1, 0, 1));
    }

    #[tokio::test]
    async fn vector_search_timeout_reaches_completion() {
        let (pipeline, calls) = Harness {
            vector: Canned::Hang,
            ..Harness::default()
        }
        .build();

        let reply = pipeline.answer("hours").await.expect("reply");

        assert_eq!(reply.source, ReplySource::Completion);
        assert_eq!(calls.counts(), (1, 1, 1, 1));
    }

    #[tokio::test]
    async fn oversized_or_failed_embedding_skips_vector_search() {
        for embed in [EmbedBehavior::TooLarge, EmbedBehavior::Fail] {
            let (pipeline, calls) = Harness {
                embed,
                ..Harness::default()
            }
            .build();

            let reply = pipeline.answer("long question").await.expect("reply");

            assert_eq!(reply.source, ReplySource::Completion);
            assert_eq!(calls.counts(), (1, 1, 0, 1));
        }
    }

    #[tokio::test]
    async fn completion_timeout_is_upstream_unavailable() {
        let (pipeline, _calls) = Harness {
            complete: CompleteBehavior::Hang,
            ..Harness::default()
        }
        .build();

        let error = pipeline.answer("hello").await.unwrap_err();

        assert!(matches!(
            error,
            PipelineError::UpstreamUnavailable(CompletionError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn completion_failure_is_upstream_unavailable() {
        let (pipeline, _calls) = Harness {
            complete: CompleteBehavior::Fail,
            ..Harness::default()
        }
        .build();

        let error = pipeline.answer("hello").await.unwrap_err();

        assert!(matches!(
            error,
            PipelineError::UpstreamUnavailable(CompletionError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn blank_bodies_are_skipped_and_store_order_is_kept() {
        let (pipeline, _calls) = Harness {
            lexical: Canned::Matches(vec![
                chunk("blank", "   \n  "),
                chunk("first", LONG_BODY),
                chunk("second", SERVICES),
            ]),
            ..Harness::default()
        }
        .build();

        let reply = pipeline.answer("services").await.expect("reply");

        assert_eq!(reply.chunk_id.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn short_matches_become_completion_context() {
        let (pipeline, calls) = Harness {
            lexical: Canned::Matches(vec![chunk("l1", "Open 9 to 5.")]),
            vector: Canned::Matches(vec![
                chunk("v1", "Closed Sundays.").with_similarity(0.8),
                chunk("v2", "Unrelated words.").with_similarity(0.5),
            ]),
            ..Harness::default()
        }
        .build();

        pipeline.answer("when are you open").await.expect("reply");

        let prompt = calls.last_prompt();
        assert!(prompt.contains("Context:\nOpen 9 to 5.\n\nClosed Sundays."));
        assert!(!prompt.contains("Unrelated words."));
    }

    #[tokio::test]
    async fn blank_completion_uses_fallback_reply() {
        let (pipeline, _calls) = Harness {
            complete: CompleteBehavior::Text("   "),
            ..Harness::default()
        }
        .build();

        let reply = pipeline.answer("hello").await.expect("reply");

        assert_eq!(reply.text, "Sorry, I couldn't generate a reply.");
    }

    #[tokio::test]
    async fn lexical_only_pipeline_never_embeds() {
        let mut harness = Harness::default();
        harness.config.stages = vec![StageKind::Lexical];
        let (pipeline, calls) = harness.build();

        pipeline.answer("hello").await.expect("reply");

        assert_eq!(calls.counts(), (1, 0, 0, 1));
    }

    #[test]
    fn reversed_or_duplicated_stages_are_rejected_at_construction() {
        for stages in [
            vec![StageKind::Vector, StageKind::Lexical],
            vec![StageKind::Lexical, StageKind::Lexical],
            vec![StageKind::Vector, StageKind::Vector],
        ] {
            let mut harness = Harness::default();
            harness.config.stages = stages.clone();

            let result = harness.try_build();

            assert!(
                matches!(result, Err(ConfigError::InvalidValue { field: "stages", .. })),
                "{stages:?} should be rejected"
            );
        }
    }

    #[test]
    fn invalid_threshold_is_rejected_at_construction() {
        let mut harness = Harness::default();
        harness.config.similarity_threshold = 1.5;

        assert!(harness.try_build().is_err());
    }

    #[tokio::test]
    async fn vector_only_pipeline_skips_text_search() {
        let mut harness = Harness {
            vector: Canned::Matches(vec![chunk("v1", LONG_BODY).with_similarity(0.9)]),
            ..Harness::default()
        };
        harness.config.stages = vec![StageKind::Vector];
        let (pipeline, calls) = harness.build();

        let reply = pipeline.answer("what do you build").await.expect("reply");

        assert_eq!(reply.source, ReplySource::Vector);
        assert_eq!(calls.counts(), (0, 1, 1, 0));
    }

    #[tokio::test]
    async fn body_at_trust_length_falls_through_to_completion() {
        let body = "a".repeat(DEFAULT_MIN_TRUST_CHARS);
        let (pipeline, calls) = Harness {
            lexical: Canned::Matches(vec![chunk("edge", &body)]),
            ..Harness::default()
        }
        .build();

        let reply = pipeline.answer("edge").await.expect("reply");

        assert_eq!(reply.source, ReplySource::Completion);
        assert_eq!(calls.counts(), (1, 1, 1, 1));
        assert!(calls.last_prompt().contains(&body));
    }

    #[tokio::test]
    async fn body_one_char_past_trust_length_is_returned_verbatim() {
        let body = "a".repeat(DEFAULT_MIN_TRUST_CHARS + 1);
        let (pipeline, calls) = Harness {
            lexical: Canned::Matches(vec![chunk("edge", &body)]),
            ..Harness::default()
        }
        .build();

        let reply = pipeline.answer("edge").await.expect("reply");

        assert_eq!(reply.text, body);
        assert_eq!(reply.source, ReplySource::Lexical);
        assert_eq!(calls.counts(), (1, 0, 0, 0));
    }

    #[tokio::test]
    async fn trust_length_counts_characters_not_bytes() {
        // Twice as many bytes as characters.
        let at_limit = "é".repeat(DEFAULT_MIN_TRUST_CHARS);
        let past_limit = "é".repeat(DEFAULT_MIN_TRUST_CHARS + 1);

        let (pipeline, _calls) = Harness {
            lexical: Canned::Matches(vec![chunk("accents", &at_limit)]),
            ..Harness::default()
        }
        .build();
        let reply = pipeline.answer("café").await.expect("reply");
        assert_eq!(reply.source, ReplySource::Completion);

        let (pipeline, _calls) = Harness {
            lexical: Canned::Matches(vec![chunk("accents", &past_limit)]),
            ..Harness::default()
        }
        .build();
        let reply = pipeline.answer("café").await.expect("reply");
        assert_eq!(reply.source, ReplySource::Lexical);
        assert_eq!(reply.text, past_limit);
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_calls() {
        let (pipeline, calls) = Harness::default().build();
        let (_tx, rx) = watch::channel(true);

        let error = pipeline.answer_with_cancel("hello", rx).await.unwrap_err();

        assert!(matches!(error, PipelineError::Cancelled));
        assert_eq!(calls.counts(), (0, 0, 0, 0));
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_call_and_later_stages() {
        let mut harness = Harness {
            lexical: Canned::Hang,
            ..Harness::default()
        };
        harness.config.lexical_timeout = Duration::from_secs(10);
        let (pipeline, calls) = harness.build();
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });
        let started = Instant::now();
        let error = pipeline.answer_with_cancel("hello", rx).await.unwrap_err();

        assert!(matches!(error, PipelineError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(calls.counts(), (1, 0, 0, 0));
    }

    #[test]
    fn context_is_truncated_on_char_boundary() {
        let chunks = vec![chunk("a", "héllo"), chunk("b", "world")];

        assert_eq!(build_context(&chunks, 3), "hél");
        assert_eq!(build_context(&chunks, 100), "héllo\n\nworld");
        assert_eq!(build_context(&[], 100), "");
    }

    #[test]
    fn system_prompt_mentions_site_and_context() {
        let with_context = build_system_prompt("example.com", "We do SEO.");
        assert!(with_context.starts_with("You are a helpful assistant for example.com."));
        assert!(with_context.ends_with("Context:\nWe do SEO."));

        let without = build_system_prompt("example.com", "  ");
        assert!(!without.contains("Context:"));
    }

    #[test]
    fn phases_only_move_forward() {
        let (_tx, rx) = watch::channel(false);
        let mut state = RetrievalState::new(rx);

        for phase in [
            PipelinePhase::LexicalTried,
            PipelinePhase::VectorTried,
            PipelinePhase::CompletionTried,
            PipelinePhase::Done,
        ] {
            state.advance(phase);
            assert_eq!(state.phase(), phase);
        }
        assert!(!state.is_cancelled());
    }
}
