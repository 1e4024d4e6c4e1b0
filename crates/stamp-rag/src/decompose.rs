//! Sub-question decomposition: fan a complex query out, answer the pieces,
//! and synthesise.
//!
//! The decomposer always retrieves through the retriever the router chose;
//! it never picks knowledge bases on its own. Every failure path (timeout,
//! unparseable reply, too many empty sub-results) falls back to a standard
//! retrieve on that same retriever, so the caller cannot tell a degraded
//! request from a simple one except through the metrics counters.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use stamp_core::{approx_tokens, config::DecomposeSettings, node::sort_by_score_desc, ScoredNode};
use stamp_llm::{ChatMessage, LlmClient};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::prompts;
use crate::retriever::Retriever;
use crate::tokenize::CjkTokenizer;
use crate::RagError;

/// Counters for the decomposition paths. Process-wide, never persisted.
#[derive(Debug, Default)]
pub struct DecomposeMetrics {
    pub total_queries: AtomicU64,
    pub decomposed_queries: AtomicU64,
    pub fallback_count: AtomicU64,
    pub empty_results_count: AtomicU64,
    pub timeout_count: AtomicU64,
    pub error_count: AtomicU64,
}

impl DecomposeMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total_queries.load(Ordering::Relaxed)
    }

    pub fn fallbacks(&self) -> u64 {
        self.fallback_count.load(Ordering::Relaxed)
    }

    pub fn decomposed(&self) -> u64 {
        self.decomposed_queries.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubAnswer {
    pub question: String,
    pub answer: String,
    pub node_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DecompositionMetadata {
    pub decomposed: bool,
    pub sub_questions: Vec<String>,
    pub sub_answers: Vec<SubAnswer>,
    pub synthesized_answer: Option<String>,
}

#[derive(Debug)]
pub struct DecompositionOutcome {
    pub nodes: Vec<ScoredNode>,
    pub metadata: DecompositionMetadata,
}

#[derive(Debug)]
pub struct Decomposer {
    llm: Arc<LlmClient>,
    settings: DecomposeSettings,
    enabled: bool,
    /// Consult the LLM judge when the cheap gate says no.
    use_llm_judge: bool,
    metrics: Arc<DecomposeMetrics>,
}

impl Decomposer {
    pub fn new(llm: Arc<LlmClient>, settings: DecomposeSettings, enabled: bool) -> Self {
        Self {
            llm,
            settings,
            enabled,
            use_llm_judge: false,
            metrics: Arc::new(DecomposeMetrics::default()),
        }
    }

    pub fn with_llm_judge(mut self, on: bool) -> Self {
        self.use_llm_judge = on;
        self
    }

    pub fn metrics(&self) -> Arc<DecomposeMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Cheap gate: long enough and mentioning enough distinct entities.
    fn passes_gate(&self, query: &str) -> bool {
        if query.chars().count() < self.settings.complexity_threshold {
            return false;
        }
        entity_count(query) >= self.settings.min_entities
    }

    async fn llm_judge_says_yes(&self, query: &str) -> bool {
        let messages = vec![
            ChatMessage::system(prompts::MULTI_FACET_JUDGE_SYSTEM),
            ChatMessage::user(query),
        ];
        match timeout(self.settings.decomp_timeout, self.llm.complete(None, messages)).await {
            Ok(Ok(reply)) => {
                let reply = reply.trim().to_ascii_lowercase();
                reply.starts_with("yes") || reply.starts_with("是")
            }
            _ => false,
        }
    }

    /// Standard retrieve on the chosen retriever, capped at `rerank_top_n`.
    async fn standard(
        &self,
        query: &str,
        rerank_top_n: usize,
        retriever: &Arc<dyn Retriever>,
    ) -> Result<Vec<ScoredNode>, RagError> {
        let mut nodes = retriever.retrieve(query).await?;
        sort_by_score_desc(&mut nodes);
        nodes.truncate(rerank_top_n);
        Ok(nodes)
    }

    async fn fallback(
        &self,
        query: &str,
        rerank_top_n: usize,
        retriever: &Arc<dyn Retriever>,
        reason: &str,
    ) -> Result<DecompositionOutcome, RagError> {
        warn!(reason, "decomposition fell back to standard retrieve");
        DecomposeMetrics::bump(&self.metrics.fallback_count);
        Ok(DecompositionOutcome {
            nodes: self.standard(query, rerank_top_n, retriever).await?,
            metadata: DecompositionMetadata::default(),
        })
    }

    /// Entry point: decide, decompose, fan out, answer, merge, synthesise.
    #[instrument(skip_all, fields(query_len = query.chars().count(), rerank_top_n))]
    pub async fn retrieve_with_decomposition(
        &self,
        query: &str,
        rerank_top_n: usize,
        history: &[(String, String)],
        retriever: &Arc<dyn Retriever>,
    ) -> Result<DecompositionOutcome, RagError> {
        DecomposeMetrics::bump(&self.metrics.total_queries);

        if !self.enabled {
            return Ok(DecompositionOutcome {
                nodes: self.standard(query, rerank_top_n, retriever).await?,
                metadata: DecompositionMetadata::default(),
            });
        }
        let mut should = self.passes_gate(query);
        if !should && self.use_llm_judge {
            should = self.llm_judge_says_yes(query).await;
        }
        if !should {
            return Ok(DecompositionOutcome {
                nodes: self.standard(query, rerank_top_n, retriever).await?,
                metadata: DecompositionMetadata::default(),
            });
        }

        let history_summary = self.compress_history(history).await;

        let sub_questions = match self.decompose(query, history_summary.as_deref()).await {
            Ok(subs) if !subs.is_empty() => subs,
            Ok(_) => {
                return self
                    .fallback(query, rerank_top_n, retriever, "empty decomposition")
                    .await
            }
            Err(DecomposeFailure::Timeout) => {
                DecomposeMetrics::bump(&self.metrics.timeout_count);
                return self
                    .fallback(query, rerank_top_n, retriever, "decomposition timeout")
                    .await;
            }
            Err(DecomposeFailure::Other(err)) => {
                DecomposeMetrics::bump(&self.metrics.error_count);
                return self
                    .fallback(query, rerank_top_n, retriever, &err)
                    .await;
            }
        };
        debug!(count = sub_questions.len(), "query decomposed");

        // A single sub-question is a standard retrieve in disguise; keep the
        // decomposed label so callers can see the path taken.
        if sub_questions.len() == 1 {
            DecomposeMetrics::bump(&self.metrics.decomposed_queries);
            return Ok(DecompositionOutcome {
                nodes: self.standard(query, rerank_top_n, retriever).await?,
                metadata: DecompositionMetadata {
                    decomposed: true,
                    sub_questions,
                    ..Default::default()
                },
            });
        }

        // Parallel retrieval through the routed retriever, bounded workers.
        let sub_results: Vec<Vec<ScoredNode>> = futures::stream::iter(
            sub_questions
                .iter()
                .map(|sq| async move {
                    match retriever.retrieve(sq).await {
                        Ok(mut nodes) => {
                            sort_by_score_desc(&mut nodes);
                            nodes.truncate(rerank_top_n);
                            nodes
                        }
                        Err(err) => {
                            warn!(error = %err, "sub-question retrieval failed");
                            Vec::new()
                        }
                    }
                }),
        )
        .buffered(self.settings.max_workers.max(1))
        .collect()
        .await;

        let empty = sub_results.iter().filter(|r| r.is_empty()).count();
        if empty >= self.settings.max_empty_results {
            DecomposeMetrics::bump(&self.metrics.empty_results_count);
            return self
                .fallback(query, rerank_top_n, retriever, "too many empty sub-results")
                .await;
        }

        let sub_answers: Vec<SubAnswer> = futures::stream::iter(
            sub_questions
                .iter()
                .zip(sub_results.iter())
                .map(|(sq, nodes)| self.answer_sub_question(sq, nodes)),
        )
        .buffered(self.settings.max_workers.max(1))
        .collect()
        .await;

        let nodes = merge_sub_results(sub_results, self.settings.min_score, rerank_top_n);
        let synthesized_answer = self.synthesise(query, &sub_answers).await;

        DecomposeMetrics::bump(&self.metrics.decomposed_queries);
        Ok(DecompositionOutcome {
            nodes,
            metadata: DecompositionMetadata {
                decomposed: true,
                sub_questions,
                sub_answers,
                synthesized_answer,
            },
        })
    }

    /// Compress recent turns into a short summary for the decomposition
    /// prompt. Any failure just drops the history.
    async fn compress_history(&self, history: &[(String, String)]) -> Option<String> {
        if history.is_empty() {
            return None;
        }
        let start = history.len().saturating_sub(self.settings.history_turns);
        let mut flat = String::new();
        for (user, assistant) in &history[start..] {
            flat.push_str("user: ");
            flat.push_str(user);
            flat.push_str("\nassistant: ");
            flat.push_str(assistant);
            flat.push('\n');
        }
        if approx_tokens(&flat) > self.settings.history_max_tokens {
            let max_chars = self.settings.history_max_tokens * 2;
            flat = flat.chars().take(max_chars).collect();
        }

        let messages = vec![
            ChatMessage::system(prompts::HISTORY_SUMMARY_SYSTEM),
            ChatMessage::user(flat),
        ];
        match timeout(self.settings.decomp_timeout, self.llm.complete(None, messages)).await {
            Ok(Ok(summary)) => {
                let summary: String = summary.trim().chars().take(200).collect();
                (!summary.is_empty()).then_some(summary)
            }
            _ => {
                debug!("history compression failed; decomposing without history");
                None
            }
        }
    }

    async fn decompose(
        &self,
        query: &str,
        history_summary: Option<&str>,
    ) -> Result<Vec<String>, DecomposeFailure> {
        let user = match history_summary {
            Some(summary) => format!("对话背景：{summary}\n\n问题：{query}"),
            None => format!("问题：{query}"),
        };
        let messages = vec![
            ChatMessage::system(prompts::DECOMPOSE_SYSTEM),
            ChatMessage::user(user),
        ];
        let reply = timeout(self.settings.decomp_timeout, self.llm.complete(None, messages))
            .await
            .map_err(|_| DecomposeFailure::Timeout)?
            .map_err(|err| DecomposeFailure::Other(err.to_string()))?;

        let mut subs = parse_sub_questions(&reply);
        subs.truncate(self.settings.max_depth);
        Ok(subs)
    }

    /// Answer one sub-question from its top nodes; on any failure fall back
    /// to the leading text of the best node.
    async fn answer_sub_question(&self, question: &str, nodes: &[ScoredNode]) -> SubAnswer {
        if nodes.is_empty() {
            return SubAnswer {
                question: question.to_string(),
                answer: String::new(),
                node_count: 0,
            };
        }
        let mut refs = String::new();
        for (i, node) in nodes.iter().take(3).enumerate() {
            refs.push_str(&format!("[ref {}] {}\n", i + 1, node.node.text));
        }
        let messages = vec![
            ChatMessage::system(prompts::SUB_ANSWER_SYSTEM),
            ChatMessage::user(format!("{refs}\n问题：{question}")),
        ];
        let answer = match timeout(
            self.settings.subanswer_timeout,
            self.llm.complete(None, messages),
        )
        .await
        {
            Ok(Ok(text)) => text.trim().chars().take(200).collect(),
            Ok(Err(err)) => {
                warn!(error = %err, "mini-answer generation failed; using top node text");
                DecomposeMetrics::bump(&self.metrics.error_count);
                nodes[0].node.text.chars().take(200).collect()
            }
            Err(_) => {
                DecomposeMetrics::bump(&self.metrics.timeout_count);
                nodes[0].node.text.chars().take(200).collect()
            }
        };
        SubAnswer {
            question: question.to_string(),
            answer,
            node_count: nodes.len(),
        }
    }

    /// Consolidate the mini-answers into one passage. Not user-visible; the
    /// message assembler injects it into the final prompt.
    async fn synthesise(&self, query: &str, sub_answers: &[SubAnswer]) -> Option<String> {
        let answered: Vec<&SubAnswer> =
            sub_answers.iter().filter(|sa| !sa.answer.is_empty()).collect();
        if answered.is_empty() {
            return None;
        }
        let mut body = format!("原问题：{query}\n");
        for sa in &answered {
            body.push_str(&format!("子问题：{}\n回答：{}\n", sa.question, sa.answer));
        }
        let messages = vec![
            ChatMessage::system(prompts::SYNTHESIS_SYSTEM),
            ChatMessage::user(body),
        ];
        match timeout(self.settings.synthesis_timeout, self.llm.complete(None, messages)).await {
            Ok(Ok(text)) => {
                let text = text.trim().to_string();
                (!text.is_empty()).then_some(text)
            }
            _ => {
                warn!("synthesis failed; continuing without synthesized answer");
                None
            }
        }
    }
}

enum DecomposeFailure {
    Timeout,
    Other(String),
}

/// Distinct keyword-sized tokens; a stand-in for entity counting.
fn entity_count(query: &str) -> usize {
    CjkTokenizer::query_keywords(query)
        .iter()
        .filter(|t| t.chars().count() >= 2)
        .count()
}

/// Parse the decomposition reply: tolerate code fences and prose around the
/// JSON array.
pub fn parse_sub_questions(reply: &str) -> Vec<String> {
    let cleaned = reply.replace("```json", "").replace("```", "");
    let Some(start) = cleaned.find('[') else {
        return Vec::new();
    };
    let Some(end) = cleaned.rfind(']') else {
        return Vec::new();
    };
    if end <= start {
        return Vec::new();
    }
    serde_json::from_str::<Vec<String>>(&cleaned[start..=end])
        .map(|subs| {
            subs.into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Union across sub-results, best score per id, floor and cap applied.
fn merge_sub_results(
    sub_results: Vec<Vec<ScoredNode>>,
    min_score: f32,
    rerank_top_n: usize,
) -> Vec<ScoredNode> {
    let mut all: Vec<ScoredNode> = sub_results.into_iter().flatten().collect();
    sort_by_score_desc(&mut all);
    let mut seen = std::collections::HashSet::new();
    all.retain(|node| node.score >= min_score && seen.insert(node.node.id.clone()));
    all.truncate(rerank_top_n);
    all
}
