//! End-to-end pipeline tests over staged services: in-memory point store,
//! deterministic embedder and reranker, mocked LLM endpoints.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use stamp_conv::{mint_session_id, ConversationStore};
use stamp_core::{Kb, Node, Settings};
use stamp_llm::{LlmClient, ProviderEndpoint, ProviderRegistry};
use stamp_rag::{
    node_to_payload, Decomposer, FusionConfig, HybridConfig, HybridRetriever, InsertBlockFilter,
    IntentRouter, KnowledgeBase, MultiKbRetriever, RerankStage, StrategyCounts,
};
use stamp_server::{run_chat, AppState, AuthVerdict, ChatRequestBody, Frame, StaticAuth};
use stamp_store::{BoxFuture, Embedder, MemoryStore, Point, PointStore, RerankModel, StoreError};
use tokio::sync::mpsc;

/// Maps known phrases to fixed directions; everything else is orthogonal.
#[derive(Debug)]
struct StubEmbedder;

impl Embedder for StubEmbedder {
    fn embed<'a>(&'a self, texts: Vec<String>) -> BoxFuture<'a, Result<Vec<Vec<f32>>, StoreError>> {
        Box::pin(async move {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("护照") {
                        vec![1.0, 0.0, 0.0]
                    } else if t.contains("泰国") || t.contains("免签") {
                        vec![0.0, 1.0, 0.0]
                    } else if t.contains("机组") {
                        vec![0.0, 0.0, 1.0]
                    } else {
                        vec![0.5, 0.5, 0.5]
                    }
                })
                .collect())
        })
    }
}

/// Order-preserving scores so every candidate clears the threshold.
#[derive(Debug)]
struct StubReranker;

impl RerankModel for StubReranker {
    fn score<'a>(
        &'a self,
        _query: &'a str,
        passages: Vec<String>,
    ) -> BoxFuture<'a, Result<Vec<f32>, StoreError>> {
        Box::pin(async move {
            Ok((0..passages.len())
                .map(|i| 0.95 - i as f32 * 0.01)
                .collect())
        })
    }
}

async fn seed_kb(store: &MemoryStore, kb: Kb, nodes: &[(&str, &str, &str, [f32; 3])]) {
    let points: Vec<Point> = nodes
        .iter()
        .map(|(id, text, file, vector)| {
            let node = Node::new(*id, *text).with_metadata("file_name", *file);
            Point {
                id: id.to_string(),
                vector: vector.to_vec(),
                payload: node_to_payload(&node),
            }
        })
        .collect();
    store.upsert(kb.collection(), points).await.unwrap();
}

struct Stage {
    state: Arc<AppState>,
    #[allow(dead_code)]
    llm_server: MockServer,
}

/// Build a full AppState over the staged backends. `classify_as` scripts the
/// intent classifier's reply; `stream_body` is the raw SSE the LLM returns.
async fn stage(classify_as: &str, stream_body: &str, overrides: &[(&str, &str)]) -> Stage {
    let llm_server = MockServer::start();
    let classify_reply = format!("分类: {classify_as}");
    llm_server.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .body_contains("意图分类器")
            .body_contains("\"stream\":false");
        then.status(200).json_body(serde_json::json!({
            "choices": [{"message": {"content": classify_reply}}]
        }));
    });
    let stream_body = stream_body.to_string();
    llm_server.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .body_contains("\"stream\":true");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(stream_body);
    });

    let map: HashMap<String, String> = overrides
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let settings = Settings::from_lookup(|key| map.get(key).cloned()).unwrap();

    let store = MemoryStore::new();
    seed_kb(
        &store,
        Kb::General,
        &[
            ("gen_passport", "护照办理需要本人到出入境管理局申请。", "passport.md", [1.0, 0.0, 0.0]),
            ("gen_border", "出入境边检通用规定。", "border.md", [0.6, 0.5, 0.2]),
        ],
    )
    .await;
    seed_kb(
        &store,
        Kb::VisaFree,
        &[
            ("vf_thailand", "泰国对中国公民实行免签政策，停留不超过30天。", "visa_free_thailand.md", [0.0, 1.0, 0.0]),
            ("vf_general", "免签政策总览。", "visa_free_overview.md", [0.1, 0.9, 0.1]),
        ],
    )
    .await;
    seed_kb(
        &store,
        Kb::Airline,
        &[(
            "air_crew",
            "机组人员凭任务书和机组证件出入境。",
            "airline_crew.md",
            [0.0, 0.0, 1.0],
        )],
    )
    .await;
    let store: Arc<dyn PointStore> = Arc::new(store);
    let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder);

    let registry = ProviderRegistry::new("qwen3").with_endpoint(
        "qwen3",
        ProviderEndpoint {
            completion_url: llm_server.url("/v1/chat/completions"),
            model: "qwen3-32b".into(),
            api_key_env: None,
        },
    );
    let llm = Arc::new(LlmClient::new(registry, Duration::from_secs(5), 1024, 0));

    let hybrid_cfg = HybridConfig {
        fusion: FusionConfig::default(),
        top_k_vector: 30,
        top_k_bm25: 30,
        top_k_merged: 30,
    };
    let mut retrievers = HashMap::new();
    for kb in [Kb::General, Kb::VisaFree, Kb::Airline] {
        let base = Arc::new(KnowledgeBase::hydrate(&store, kb).await.unwrap());
        retrievers.insert(
            kb,
            Arc::new(HybridRetriever::new(
                base,
                Arc::clone(&store),
                Arc::clone(&embedder),
                hybrid_cfg,
            )),
        );
    }
    let multi = Arc::new(MultiKbRetriever::new(retrievers, StrategyCounts::default()));

    let state = Arc::new(AppState {
        router: Arc::new(IntentRouter::new(
            Arc::clone(&llm),
            settings.features.intent_classifier,
            Duration::from_secs(5),
        )),
        decomposer: Arc::new(Decomposer::new(
            Arc::clone(&llm),
            settings.decompose,
            settings.features.subquestion_decomposition,
        )),
        rerank: Arc::new(RerankStage::new(
            Arc::new(StubReranker),
            settings.retrieval.rerank_input_top_n,
        )),
        insert_block: Arc::new(InsertBlockFilter::new(
            Arc::clone(&llm),
            settings.insert_block.max_workers,
            settings.insert_block.per_call_timeout,
        )),
        conversations: Arc::new(ConversationStore::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            settings.conversation,
        )),
        multi,
        llm,
        rules: None,
        hidden: None,
        auth: Arc::new(StaticAuth {
            verdict: AuthVerdict {
                valid: true,
                username: "tester".into(),
                userid: 1,
            },
        }),
        settings,
    });
    Stage { state, llm_server }
}

fn request(question: &str, thinking: bool) -> ChatRequestBody {
    ChatRequestBody {
        question: question.into(),
        session_id: None,
        thinking,
        enable_thinking: None,
        model_id: None,
        rerank_top_n: None,
        use_insert_block: false,
        insert_block_llm_id: None,
    }
}

async fn drive(
    state: Arc<AppState>,
    req: ChatRequestBody,
    session_id: String,
    multi_turn: bool,
) -> Vec<Frame> {
    let (tx, mut rx) = mpsc::channel(32);
    let collector = tokio::spawn(async move {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    });
    run_chat(state, req, session_id, multi_turn, tx).await;
    collector.await.unwrap()
}

const PLAIN_STREAM: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"content\":\"需要本人\"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"到出入境管理局申请。\"}}]}\n\n",
    "data: [DONE]\n\n",
);

fn content_concat(frames: &[Frame]) -> String {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Content(c) => Some(c.as_str()),
            _ => None,
        })
        .collect()
}

fn source_payloads(frames: &[Frame]) -> Vec<&serde_json::Value> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Source(v) => Some(v),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn general_request_emits_well_formed_stream() {
    let staged = stage("general", PLAIN_STREAM, &[]).await;
    let session = mint_session_id(1);
    let frames = drive(
        Arc::clone(&staged.state),
        request("如何办理护照？", false),
        session.clone(),
        false,
    )
    .await;

    // SESSION first, DONE last, exactly one of each.
    assert!(matches!(&frames[0], Frame::Session(s) if *s == session));
    assert!(matches!(frames.last().unwrap(), Frame::Done));
    assert_eq!(
        frames.iter().filter(|f| matches!(f, Frame::Session(_))).count(),
        1
    );
    assert_eq!(frames.iter().filter(|f| matches!(f, Frame::Done)).count(), 1);

    // Thinking was not requested: no THINK frames at all.
    assert!(frames.iter().all(|f| !matches!(f, Frame::Think(_))));

    // Sources arrive after the last content frame, with non-empty provenance.
    let sources = source_payloads(&frames);
    assert!(!sources.is_empty());
    for source in &sources {
        let provenance = source["retrievalSources"].as_array().unwrap();
        assert!(!provenance.is_empty());
    }
    let last_content = frames
        .iter()
        .rposition(|f| matches!(f, Frame::Content(_)))
        .unwrap();
    let first_source = frames
        .iter()
        .position(|f| matches!(f, Frame::Source(_)))
        .unwrap();
    assert!(first_source > last_content);

    // Exactly one turn was written, starting the chain.
    let turns = staged.state.conversations.recent(&session, 10).await.unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].parent_turn_id, None);
    assert!(turns[0].assistant_response.contains("出入境管理局"));
}

#[tokio::test]
async fn visa_free_strategy_merges_with_general_safety_net() {
    let staged = stage("visa_free", PLAIN_STREAM, &[]).await;
    let frames = drive(
        Arc::clone(&staged.state),
        request("去泰国旅游需要签证吗？", false),
        mint_session_id(1),
        false,
    )
    .await;

    let sources = source_payloads(&frames);
    assert!(!sources.is_empty());
    assert!(sources.len() <= 15);

    let files: Vec<&str> = sources
        .iter()
        .map(|s| s["fileName"].as_str().unwrap())
        .collect();
    assert!(
        files.iter().any(|f| f.starts_with("visa_free")),
        "visa_free KB missing from {files:?}"
    );
    assert!(
        files.iter().any(|f| *f == "passport.md" || *f == "border.md"),
        "general safety net missing from {files:?}"
    );

    let ids: Vec<&str> = sources.iter().map(|s| s["id"].as_str().unwrap()).collect();
    let unique: HashSet<&&str> = ids.iter().collect();
    assert_eq!(ids.len(), unique.len(), "duplicate node ids: {ids:?}");
}

#[tokio::test]
async fn airline_visa_free_strategy_covers_all_three_kbs() {
    let staged = stage("airline_visa_free", PLAIN_STREAM, &[]).await;
    let frames = drive(
        Arc::clone(&staged.state),
        request("执行飞往泰国航班的机组人员需要签证吗？", false),
        mint_session_id(1),
        false,
    )
    .await;

    let sources = source_payloads(&frames);
    assert!(sources.len() <= 20);
    let files: Vec<&str> = sources
        .iter()
        .map(|s| s["fileName"].as_str().unwrap())
        .collect();
    assert!(files.iter().any(|f| f.starts_with("airline")), "{files:?}");
    assert!(files.iter().any(|f| f.starts_with("visa_free")), "{files:?}");
    assert!(
        files.iter().any(|f| *f == "passport.md" || *f == "border.md"),
        "{files:?}"
    );
}

#[tokio::test]
async fn thinking_stream_demuxes_reasoning_into_think_frames() {
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"先查免签政策\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"可以免签入境。\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    let staged = stage("general", body, &[]).await;
    let frames = drive(
        Arc::clone(&staged.state),
        request("去泰国旅游需要签证吗？", true),
        mint_session_id(1),
        false,
    )
    .await;

    let think: String = frames
        .iter()
        .filter_map(|f| match f {
            Frame::Think(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(think, "先查免签政策");
    assert!(content_concat(&frames).contains("可以免签入境"));
}

#[tokio::test]
async fn code_fences_are_stripped_from_content() {
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"规定原文：```第一条```具体如下。\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    let staged = stage("general", body, &[]).await;
    let frames = drive(
        Arc::clone(&staged.state),
        request("如何办理护照？", false),
        mint_session_id(1),
        false,
    )
    .await;

    let content = content_concat(&frames);
    assert!(!content.contains("```"), "content: {content}");
    assert!(content.contains("第一条"));
}

#[tokio::test]
async fn llm_stream_error_surfaces_error_then_done() {
    let llm_server = MockServer::start();
    llm_server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(500).body("provider down");
    });

    // Reuse the stage builder for everything except the LLM mocks, then
    // point a fresh stage at the failing server by disabling the classifier
    // (so the only LLM call is the streaming one).
    let staged = stage("general", PLAIN_STREAM, &[("ENABLE_INTENT_CLASSIFIER", "0")]).await;
    // Swap in a client that targets the failing endpoint.
    let registry = ProviderRegistry::new("qwen3").with_endpoint(
        "qwen3",
        ProviderEndpoint {
            completion_url: llm_server.url("/v1/chat/completions"),
            model: "qwen3-32b".into(),
            api_key_env: None,
        },
    );
    let mut state = Arc::try_unwrap(staged.state).unwrap_or_else(|arc| panic!(
        "stage state still shared: {} refs", Arc::strong_count(&arc)
    ));
    state.llm = Arc::new(LlmClient::new(registry, Duration::from_secs(5), 1024, 0));
    let state = Arc::new(state);

    let frames = drive(
        Arc::clone(&state),
        request("如何办理护照？", false),
        mint_session_id(1),
        false,
    )
    .await;

    assert!(matches!(&frames[0], Frame::Session(_)));
    let error_pos = frames.iter().position(|f| matches!(f, Frame::Error(_)));
    assert!(error_pos.is_some(), "expected an ERROR frame: {frames:?}");
    assert!(matches!(frames.last().unwrap(), Frame::Done));
    assert_eq!(frames.iter().filter(|f| matches!(f, Frame::Done)).count(), 1);
}

#[tokio::test]
async fn empty_corpus_still_completes_with_warning() {
    let llm_server = MockServer::start();
    llm_server.mock(|when, then| {
        when.method(POST)
            .path("/v1/chat/completions")
            .body_contains("\"stream\":true");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(PLAIN_STREAM);
    });

    let map: HashMap<String, String> =
        [("ENABLE_INTENT_CLASSIFIER".to_string(), "0".to_string())].into();
    let settings = Settings::from_lookup(|key| map.get(key).cloned()).unwrap();

    let store: Arc<dyn PointStore> = Arc::new(MemoryStore::new());
    let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder);
    let registry = ProviderRegistry::new("qwen3").with_endpoint(
        "qwen3",
        ProviderEndpoint {
            completion_url: llm_server.url("/v1/chat/completions"),
            model: "qwen3-32b".into(),
            api_key_env: None,
        },
    );
    let llm = Arc::new(LlmClient::new(registry, Duration::from_secs(5), 1024, 0));

    let mut retrievers = HashMap::new();
    let base = Arc::new(KnowledgeBase::hydrate(&store, Kb::General).await.unwrap());
    retrievers.insert(
        Kb::General,
        Arc::new(HybridRetriever::new(
            base,
            Arc::clone(&store),
            Arc::clone(&embedder),
            HybridConfig::default(),
        )),
    );
    let state = Arc::new(AppState {
        router: Arc::new(IntentRouter::new(Arc::clone(&llm), false, Duration::from_secs(5))),
        decomposer: Arc::new(Decomposer::new(Arc::clone(&llm), settings.decompose, false)),
        rerank: Arc::new(RerankStage::new(Arc::new(StubReranker), 30)),
        insert_block: Arc::new(InsertBlockFilter::new(
            Arc::clone(&llm),
            5,
            Duration::from_secs(5),
        )),
        conversations: Arc::new(ConversationStore::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            settings.conversation,
        )),
        multi: Arc::new(MultiKbRetriever::new(retrievers, StrategyCounts::default())),
        llm,
        rules: None,
        hidden: None,
        auth: Arc::new(StaticAuth {
            verdict: AuthVerdict {
                valid: true,
                username: "tester".into(),
                userid: 1,
            },
        }),
        settings,
    });

    let frames = drive(state, request("任意问题", false), mint_session_id(1), false).await;
    assert!(matches!(frames.last().unwrap(), Frame::Done));
    assert!(content_concat(&frames).contains("未检索到相关法规资料"));
    assert!(source_payloads(&frames).is_empty());
}

#[tokio::test]
async fn multi_turn_requests_chain_parents() {
    let staged = stage("general", PLAIN_STREAM, &[]).await;
    let session = mint_session_id(1);

    let first_frames = drive(
        Arc::clone(&staged.state),
        request("如何办理护照？", false),
        session.clone(),
        true,
    )
    .await;
    assert!(matches!(first_frames.last().unwrap(), Frame::Done));

    let second_frames = drive(
        Arc::clone(&staged.state),
        request("需要准备什么材料？", false),
        session.clone(),
        true,
    )
    .await;
    assert!(matches!(second_frames.last().unwrap(), Frame::Done));

    let turns = staged.state.conversations.recent(&session, 10).await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].parent_turn_id, None);
    assert_eq!(turns[1].parent_turn_id, Some(turns[0].turn_id));
    assert_eq!(turns[0].user_query, "如何办理护照？");
    assert_eq!(turns[1].user_query, "需要准备什么材料？");
}
