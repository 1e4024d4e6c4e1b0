//! Production wiring: connect clients, hydrate KBs, assemble [`AppState`].
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use stamp_core::{Kb, Settings};
use stamp_llm::{LlmClient, ProviderEndpoint, ProviderRegistry};
use stamp_rag::{
    Decomposer, FusionConfig, HybridConfig, HybridRetriever, InsertBlockFilter, IntentRouter,
    KnowledgeBase, MultiKbRetriever, RerankStage, StrategyCounts,
};
use stamp_store::{
    Embedder, HttpEmbedder, HttpReranker, KbManifest, PointStore, QdrantStore, RerankModel,
};
use stamp_conv::ConversationStore;
use tracing::{info, warn};

use crate::auth::HttpAuthClient;
use crate::pipeline::AppState;

pub async fn build_state(settings: Settings) -> anyhow::Result<AppState> {
    let store: Arc<dyn PointStore> = Arc::new(
        QdrantStore::connect(&settings.services.qdrant_url)
            .context("connecting to the vector store")?,
    );
    let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::new(
        &settings.services.embedding_url,
        &settings.services.embedding_model,
        settings.services.embedding_api_key.clone(),
    ));
    let rerank_model: Arc<dyn RerankModel> = Arc::new(HttpReranker::new(
        &settings.services.rerank_url,
        &settings.services.rerank_model,
    ));

    let registry = ProviderRegistry::new(&settings.llm.default_model).with_endpoint(
        &settings.llm.default_model,
        ProviderEndpoint {
            completion_url: settings.services.llm_url.clone(),
            model: settings.services.llm_model.clone(),
            api_key_env: settings.services.llm_api_key_env.clone(),
        },
    );
    let llm = Arc::new(LlmClient::new(
        registry,
        settings.llm.request_timeout,
        settings.llm.max_tokens,
        settings.llm.max_retries,
    ));

    check_kb_staleness(Path::new(&settings.services.kb_dir));

    let hybrid_cfg = HybridConfig {
        fusion: FusionConfig {
            k: settings.fusion.k,
            vector_weight: settings.fusion.vector_weight,
            bm25_weight: settings.fusion.bm25_weight,
        },
        top_k_vector: settings.retrieval.top_k,
        top_k_bm25: settings.retrieval.top_k_bm25,
        top_k_merged: settings.retrieval.top_k_merged,
    };

    let mut kbs = vec![Kb::General];
    if settings.features.visa_free_kb {
        kbs.push(Kb::VisaFree);
    }
    if settings.features.airline_kb {
        kbs.push(Kb::Airline);
    }
    let mut retrievers = HashMap::new();
    for kb in kbs {
        let base = Arc::new(
            KnowledgeBase::hydrate(&store, kb)
                .await
                .with_context(|| format!("hydrating {kb}"))?,
        );
        info!(kb = %kb, nodes = base.len(), "knowledge base ready");
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
    let counts = StrategyCounts {
        general: settings.retrieval.rerank_top_n,
        visa_free: settings.retrieval.visa_free_return_count,
        airline: settings.retrieval.airline_return_count,
        airline_visa_free: settings.retrieval.airline_visa_free_return_count,
    };
    let multi = Arc::new(MultiKbRetriever::new(retrievers, counts));

    let rules = if settings.features.rules_kb {
        let base = Arc::new(
            KnowledgeBase::hydrate(&store, Kb::Rules)
                .await
                .context("hydrating rules")?,
        );
        Some(Arc::new(HybridRetriever::new(
            base,
            Arc::clone(&store),
            Arc::clone(&embedder),
            hybrid_cfg,
        )))
    } else {
        None
    };
    let hidden = if settings.features.hidden_kb {
        let base = Arc::new(
            KnowledgeBase::hydrate(&store, Kb::Hidden)
                .await
                .context("hydrating hidden")?,
        );
        Some(Arc::new(HybridRetriever::new(
            base,
            Arc::clone(&store),
            Arc::clone(&embedder),
            hybrid_cfg,
        )))
    } else {
        None
    };

    let router = Arc::new(IntentRouter::new(
        Arc::clone(&llm),
        settings.features.intent_classifier,
        settings.llm.intent_timeout,
    ));
    let decomposer = Arc::new(Decomposer::new(
        Arc::clone(&llm),
        settings.decompose,
        settings.features.subquestion_decomposition,
    ));
    let rerank = Arc::new(RerankStage::new(
        rerank_model,
        settings.retrieval.rerank_input_top_n,
    ));
    let insert_block = Arc::new(InsertBlockFilter::new(
        Arc::clone(&llm),
        settings.insert_block.max_workers,
        settings.insert_block.per_call_timeout,
    ));
    let conversations = Arc::new(ConversationStore::new(
        Arc::clone(&store),
        Arc::clone(&embedder),
        settings.conversation,
    ));
    let auth = Arc::new(HttpAuthClient::new(&settings.services.auth_url));

    Ok(AppState {
        settings,
        llm,
        router,
        multi,
        decomposer,
        rerank,
        insert_block,
        conversations,
        rules,
        hidden,
        auth,
    })
}

/// Compare the KB source files against the recorded digests; a stale
/// collection keeps serving, loudly, until ingestion runs again.
fn check_kb_staleness(kb_dir: &Path) {
    let files = match read_kb_files(kb_dir) {
        Ok(files) => files,
        Err(err) => {
            warn!(dir = %kb_dir.display(), error = %err, "cannot read KB source dir; skipping staleness check");
            return;
        }
    };
    match KbManifest::load(kb_dir) {
        Ok(Some(manifest)) => {
            if manifest.is_stale(&files) {
                warn!(
                    dir = %kb_dir.display(),
                    "KB sources changed since last ingest; collections are stale until reingested"
                );
            }
        }
        Ok(None) => {
            warn!(dir = %kb_dir.display(), "no KB manifest found; run ingestion to record digests");
        }
        Err(err) => warn!(error = %err, "unreadable KB manifest"),
    }
}

fn read_kb_files(dir: &Path) -> std::io::Result<Vec<(String, Vec<u8>)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name == stamp_store::manifest::MANIFEST_FILE {
            continue;
        }
        files.push((name, std::fs::read(entry.path())?));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}
