//! The per-request coordinator: route, retrieve, rerank, filter, assemble,
//! stream, persist.
//!
//! One task drives the whole request and owns every ephemeral buffer; fan-out
//! stages (decomposer, InsertBlock) bound their own concurrency internally.
//! Frames flow through an mpsc channel to the HTTP layer; when the client
//! disconnects the channel closes, sends start failing, and the coordinator
//! unwinds without touching the wire again.
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use stamp_conv::{build_messages, ConversationStore, MessageAssembly};
use stamp_core::{ScoredNode, Settings};
use stamp_llm::LlmClient;
use stamp_rag::{
    prompts, Decomposer, DecompositionMetadata, HybridRetriever, InsertBlockFilter, IntentRouter,
    MultiKbRetriever, RerankStage, Retriever,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::auth::AuthService;
use crate::context::{build_knowledge_context, source_payload};
use crate::error::ServerError;
use crate::sse::{Frame, ThinkDemux};

/// Hidden-KB nodes appended to the context per request.
const HIDDEN_CONTEXT_NODES: usize = 3;
/// Rules keep their rerank score at or above this tier unconditionally.
const RULES_HIGH_TIER: f32 = 0.7;
/// Lower tier admitted only while high-tier rules are scarce.
const RULES_LOW_TIER: f32 = 0.5;
const RULES_LOW_TIER_FILL: usize = 3;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequestBody {
    pub question: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub thinking: bool,
    #[serde(default)]
    pub enable_thinking: Option<bool>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub rerank_top_n: Option<usize>,
    #[serde(default)]
    pub use_insert_block: bool,
    #[serde(default)]
    pub insert_block_llm_id: Option<String>,
}

impl ChatRequestBody {
    pub fn thinking_enabled(&self) -> bool {
        self.enable_thinking.unwrap_or(self.thinking)
    }
}

/// Everything a request handler needs, constructor-injected once at startup.
pub struct AppState {
    pub settings: Settings,
    pub llm: Arc<LlmClient>,
    pub router: Arc<IntentRouter>,
    pub multi: Arc<MultiKbRetriever>,
    pub decomposer: Arc<Decomposer>,
    pub rerank: Arc<RerankStage>,
    pub insert_block: Arc<InsertBlockFilter>,
    pub conversations: Arc<ConversationStore>,
    pub rules: Option<Arc<HybridRetriever>>,
    pub hidden: Option<Arc<HybridRetriever>>,
    pub auth: Arc<dyn AuthService>,
}

struct Emitter {
    tx: mpsc::Sender<Frame>,
}

impl Emitter {
    async fn send(&self, frame: Frame) -> Result<(), ServerError> {
        self.tx.send(frame).await.map_err(|_| ServerError::Cancelled)
    }
}

/// Drive one chat request to completion, emitting frames on `tx`.
///
/// `SESSION:` is always the first frame and exactly one `DONE:` is always
/// the last, on success and on error alike; the only exception is a client
/// disconnect, after which nothing more can be delivered anyway.
#[instrument(skip_all, fields(session = %session_id, multi_turn))]
pub async fn run_chat(
    state: Arc<AppState>,
    request: ChatRequestBody,
    session_id: String,
    multi_turn: bool,
    tx: mpsc::Sender<Frame>,
) {
    let emitter = Emitter { tx };
    let deadline = state.settings.server.request_deadline;
    match timeout(
        deadline,
        Box::pin(run_inner(&state, &request, &session_id, multi_turn, &emitter)),
    )
    .await
    {
        Ok(Ok(())) => {
            let _ = emitter.send(Frame::Done).await;
        }
        Ok(Err(ServerError::Cancelled)) => {
            info!("client disconnected mid-request");
        }
        Ok(Err(err)) => {
            warn!(error = %err, "request failed; surfacing to client");
            let _ = emitter.send(Frame::Error(err.to_string())).await;
            let _ = emitter.send(Frame::Done).await;
        }
        Err(_) => {
            // Deadline hit: dropping run_inner cancels every pending stage.
            warn!(deadline_secs = deadline.as_secs(), "request deadline exceeded");
            let _ = emitter.send(Frame::Error("请求处理超时".into())).await;
            let _ = emitter.send(Frame::Done).await;
        }
    }
}

async fn run_inner(
    state: &AppState,
    request: &ChatRequestBody,
    session_id: &str,
    multi_turn: bool,
    emitter: &Emitter,
) -> Result<(), ServerError> {
    let question = request.question.trim();
    let rerank_top_n = request
        .rerank_top_n
        .unwrap_or(state.settings.retrieval.rerank_top_n);

    emitter.send(Frame::Session(session_id.to_string())).await?;
    emitter
        .send(Frame::Content("正在分析问题并检索相关法规…\n".into()))
        .await?;

    // Routing first; the decomposer receives the routed retriever and can
    // never widen the KB selection on its own.
    let strategy = state.router.classify(question).await;
    debug!(strategy = %strategy, "routing complete");
    let retriever: Arc<dyn Retriever> = state.multi.retriever_for(strategy);

    let history = if multi_turn {
        match state
            .conversations
            .history_pairs(session_id, state.settings.decompose.history_turns)
            .await
        {
            Ok(pairs) => pairs,
            Err(err) => {
                warn!(error = %err, "history read failed; continuing without history");
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    let (candidates, metadata) = match state
        .decomposer
        .retrieve_with_decomposition(question, rerank_top_n, &history, &retriever)
        .await
    {
        Ok(outcome) => (outcome.nodes, outcome.metadata),
        Err(err) => {
            warn!(error = %err, "retrieval failed; answering without context");
            emitter
                .send(Frame::Content("检索服务暂时不可用，将在无资料情况下回答。\n".into()))
                .await?;
            (Vec::new(), DecompositionMetadata::default())
        }
    };

    let reranked = if candidates.is_empty() {
        emitter
            .send(Frame::Content("未检索到相关法规资料。\n".into()))
            .await?;
        Vec::new()
    } else {
        match state
            .rerank
            .rerank(
                question,
                candidates,
                rerank_top_n,
                state.settings.retrieval.rerank_score_threshold,
            )
            .await
        {
            Ok(nodes) => nodes,
            Err(err) => {
                warn!(error = %err, "rerank failed; answering without context");
                emitter
                    .send(Frame::Content("资料排序服务暂时不可用，将在无资料情况下回答。\n".into()))
                    .await?;
                Vec::new()
            }
        }
    };

    let accepted = if request.use_insert_block && !reranked.is_empty() {
        self::insert_block_filtered(state, request, question, reranked, emitter).await?
    } else {
        reranked
    };

    let rules = rules_context(state, question).await;
    let hidden = hidden_context(state, question).await;

    let mut context_nodes = accepted.clone();
    context_nodes.extend(hidden);
    let knowledge_context = build_knowledge_context(&context_nodes, &rules);

    let (recent, relevant) = if multi_turn {
        let recent = state
            .conversations
            .recent(session_id, state.settings.conversation.max_recent_turns)
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "recent read failed; degrading to no history");
                Vec::new()
            });
        let relevant = state
            .conversations
            .relevant(
                session_id,
                question,
                state.settings.conversation.max_relevant_turns,
            )
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "relevant read failed; degrading to no history");
                Vec::new()
            });
        (recent, relevant)
    } else {
        (Vec::new(), Vec::new())
    };

    let system_prompt = if knowledge_context.is_empty() {
        prompts::ANSWER_WITHOUT_CONTEXT_SYSTEM
    } else {
        prompts::ANSWER_WITH_CONTEXT_SYSTEM
    };
    let messages = build_messages(&MessageAssembly {
        system_prompt,
        relevant: &relevant,
        recent: &recent,
        relevant_header: prompts::RELEVANT_HISTORY_HEADER,
        recent_header: prompts::RECENT_HISTORY_HEADER,
        knowledge_header: prompts::KNOWLEDGE_CONTEXT_HEADER,
        knowledge_context: (!knowledge_context.is_empty()).then_some(knowledge_context.as_str()),
        synthesized_header: prompts::SYNTHESIZED_ANSWER_HEADER,
        synthesized_answer: metadata.synthesized_answer.as_deref(),
        user_message: question,
    });

    // Stream the answer, splitting thinking from content as we go.
    let mut stream = state
        .llm
        .stream(request.model_id.as_deref(), messages, request.thinking_enabled())
        .await?;
    let mut demux = ThinkDemux::new(request.thinking_enabled());
    let mut answer = String::new();
    while let Some(delta) = stream.next().await {
        let delta = delta?;
        if let Some(reasoning) = &delta.reasoning {
            for frame in demux.push_reasoning(reasoning) {
                emitter.send(frame).await?;
            }
        }
        if let Some(content) = &delta.content {
            for frame in demux.push_content(content) {
                if let Frame::Content(text) = &frame {
                    answer.push_str(text);
                }
                emitter.send(frame).await?;
            }
        }
    }
    for frame in demux.finish() {
        if let Frame::Content(text) = &frame {
            answer.push_str(text);
        }
        emitter.send(frame).await?;
    }

    // Sources follow the final answer bytes; hidden context stays hidden.
    for node in &accepted {
        emitter.send(Frame::Source(source_payload(node))).await?;
    }

    let context_docs: Vec<String> = accepted
        .iter()
        .filter_map(|n| n.node.file_name().map(str::to_string))
        .collect();
    if let Err(err) = state
        .conversations
        .add_turn(session_id, question, &answer, context_docs, None)
        .await
    {
        warn!(error = %err, "conversation write failed; response already delivered");
    }

    Ok(())
}

/// Run the InsertBlock filter under its outer deadline. Critical failures
/// and deadline overruns both warn and keep the unfiltered candidates.
async fn insert_block_filtered(
    state: &AppState,
    request: &ChatRequestBody,
    question: &str,
    reranked: Vec<ScoredNode>,
    emitter: &Emitter,
) -> Result<Vec<ScoredNode>, ServerError> {
    let per_call = state.settings.insert_block.per_call_timeout;
    let outer_deadline = per_call.saturating_mul(2).max(Duration::from_secs(1));
    let model_id = request.insert_block_llm_id.as_deref();

    match timeout(
        outer_deadline,
        state.insert_block.filter(model_id, question, reranked.clone()),
    )
    .await
    {
        Ok(Ok(filtered)) => Ok(filtered),
        Ok(Err(err)) => {
            warn!(error = %err, "insert-block filter critical; using unfiltered candidates");
            emitter
                .send(Frame::Content("资料精筛失败，已使用全部检索结果。\n".into()))
                .await?;
            Ok(reranked)
        }
        Err(_) => {
            warn!("insert-block filter missed its deadline; using unfiltered candidates");
            emitter
                .send(Frame::Content("资料精筛超时，已使用全部检索结果。\n".into()))
                .await?;
            Ok(reranked)
        }
    }
}

/// Meta-rules injected above the regular context, tiered by rerank score:
/// everything at the high tier, low tier only while high-tier hits are few.
async fn rules_context(state: &AppState, question: &str) -> Vec<ScoredNode> {
    let Some(rules_retriever) = &state.rules else {
        return Vec::new();
    };
    let candidates = match rules_retriever.retrieve(question).await {
        Ok(nodes) => nodes,
        Err(err) => {
            warn!(error = %err, "rules retrieval failed; skipping rules");
            return Vec::new();
        }
    };
    let scored = match state
        .rerank
        .rerank(question, candidates, usize::MAX, RULES_LOW_TIER)
        .await
    {
        Ok(nodes) => nodes,
        Err(err) => {
            warn!(error = %err, "rules rerank failed; skipping rules");
            return Vec::new();
        }
    };

    let (high, low): (Vec<ScoredNode>, Vec<ScoredNode>) = scored
        .into_iter()
        .partition(|n| n.rerank_score.unwrap_or(0.0) >= RULES_HIGH_TIER);
    let mut rules = high;
    if rules.len() < RULES_LOW_TIER_FILL {
        let missing = RULES_LOW_TIER_FILL - rules.len();
        rules.extend(low.into_iter().take(missing));
    }
    rules
}

/// Silent context from the hidden KB: used in the prompt, never cited.
async fn hidden_context(state: &AppState, question: &str) -> Vec<ScoredNode> {
    let Some(hidden_retriever) = &state.hidden else {
        return Vec::new();
    };
    match hidden_retriever.retrieve(question).await {
        Ok(mut nodes) => {
            nodes.truncate(HIDDEN_CONTEXT_NODES);
            nodes
        }
        Err(err) => {
            warn!(error = %err, "hidden retrieval failed; skipping");
            Vec::new()
        }
    }
}
