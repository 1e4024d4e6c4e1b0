//! Per-node LLM relevance filter.
//!
//! Each candidate is judged independently with bounded concurrency and a
//! per-call timeout; dropping a timed-out future abandons the call, so a
//! hung provider never holds a worker slot past the deadline. When more
//! than half of the calls time out or error, the whole filter is reported
//! as critical and the caller continues with unfiltered candidates.
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use stamp_core::{BlockVerdict, ScoredNode};
use stamp_llm::{ChatMessage, LlmClient};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::prompts;
use crate::RagError;

#[derive(Debug)]
pub struct InsertBlockFilter {
    llm: Arc<LlmClient>,
    max_workers: usize,
    per_call_timeout: Duration,
}

enum Judgement {
    Verdict(BlockVerdict),
    Timeout,
    Error,
}

impl InsertBlockFilter {
    pub fn new(llm: Arc<LlmClient>, max_workers: usize, per_call_timeout: Duration) -> Self {
        Self {
            llm,
            max_workers: max_workers.max(1),
            per_call_timeout,
        }
    }

    /// Judge every candidate and keep those the model says can answer the
    /// query. Output preserves the input order.
    #[instrument(skip_all, fields(candidates = nodes.len()))]
    pub async fn filter(
        &self,
        model_id: Option<&str>,
        query: &str,
        nodes: Vec<ScoredNode>,
    ) -> Result<Vec<ScoredNode>, RagError> {
        if nodes.is_empty() {
            return Ok(nodes);
        }
        let total = nodes.len();

        // `buffered` caps in-flight judgements at max_workers and yields in
        // input order; futures are created lazily, so nothing queues beyond
        // the candidates themselves.
        let judged: Vec<(ScoredNode, Judgement)> =
            futures::stream::iter(nodes.into_iter().map(|node| async move {
                let judgement = self.judge(model_id, query, &node).await;
                (node, judgement)
            }))
            .buffered(self.max_workers)
            .collect()
            .await;

        let timeouts = judged
            .iter()
            .filter(|(_, j)| matches!(j, Judgement::Timeout))
            .count();
        let errors = judged
            .iter()
            .filter(|(_, j)| matches!(j, Judgement::Error))
            .count();
        if timeouts * 2 > total || errors * 2 > total {
            return Err(RagError::InsertBlockCritical {
                timeouts,
                errors,
                total,
            });
        }

        let kept: Vec<ScoredNode> = judged
            .into_iter()
            .filter_map(|(mut node, judgement)| match judgement {
                Judgement::Verdict(verdict) if verdict.can_answer => {
                    node.verdict = Some(verdict);
                    Some(node)
                }
                _ => None,
            })
            .collect();
        debug!(kept = kept.len(), timeouts, errors, "insert-block filter done");
        Ok(kept)
    }

    async fn judge(&self, model_id: Option<&str>, query: &str, node: &ScoredNode) -> Judgement {
        let messages = vec![
            ChatMessage::system(prompts::INSERT_BLOCK_SYSTEM),
            ChatMessage::user(format!(
                "问题：{query}\n\n资料：\n{}",
                node.node.text
            )),
        ];
        match timeout(self.per_call_timeout, self.llm.complete(model_id, messages)).await {
            Ok(Ok(reply)) => match parse_verdict(&reply) {
                Some(verdict) => Judgement::Verdict(verdict),
                // Unparseable replies mean "cannot answer", not failure.
                None => Judgement::Verdict(BlockVerdict {
                    can_answer: false,
                    key_passage: String::new(),
                    reasoning: String::new(),
                }),
            },
            Ok(Err(err)) => {
                warn!(node = %node.id(), error = %err, "insert-block call failed");
                Judgement::Error
            }
            Err(_) => {
                warn!(node = %node.id(), "insert-block call timed out");
                Judgement::Timeout
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    #[serde(default)]
    is_relevant: bool,
    #[serde(default)]
    can_answer: bool,
    #[serde(default)]
    key_passage: String,
    #[serde(default)]
    reasoning: String,
}

/// Strip fences and whitespace, then parse the strict JSON verdict.
pub fn parse_verdict(reply: &str) -> Option<BlockVerdict> {
    let cleaned = reply.replace("```json", "").replace("```", "");
    let cleaned = cleaned.trim();
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end <= start {
        return None;
    }
    let raw: RawVerdict = serde_json::from_str(&cleaned[start..=end]).ok()?;
    Some(BlockVerdict {
        can_answer: raw.is_relevant && raw.can_answer,
        key_passage: raw.key_passage,
        reasoning: raw.reasoning,
    })
}
