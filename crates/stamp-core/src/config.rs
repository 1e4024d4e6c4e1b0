//! Environment-driven configuration.
//!
//! Every recognised option is read here, once, at process start. Malformed
//! values are a startup error; the server refuses to run on a half-parsed
//! configuration.
use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required option {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub services: ServiceSettings,
    pub features: FeatureFlags,
    pub fusion: FusionSettings,
    pub retrieval: RetrievalSettings,
    pub decompose: DecomposeSettings,
    pub insert_block: InsertBlockSettings,
    pub conversation: ConversationSettings,
    pub llm: LlmSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Hard ceiling on one chat request, all stages included.
    pub request_deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub qdrant_url: String,
    pub embedding_url: String,
    pub embedding_model: String,
    pub embedding_api_key: Option<String>,
    pub rerank_url: String,
    pub rerank_model: String,
    pub llm_url: String,
    pub llm_model: String,
    pub llm_api_key_env: Option<String>,
    pub auth_url: String,
    pub kb_dir: String,
}

#[derive(Debug, Clone, Copy)]
pub struct FeatureFlags {
    pub intent_classifier: bool,
    pub subquestion_decomposition: bool,
    pub visa_free_kb: bool,
    pub airline_kb: bool,
    pub rules_kb: bool,
    pub hidden_kb: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FusionSettings {
    pub k: f32,
    pub vector_weight: f32,
    pub bm25_weight: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub top_k_bm25: usize,
    pub top_k_merged: usize,
    pub rerank_input_top_n: usize,
    pub rerank_top_n: usize,
    pub rerank_score_threshold: f32,
    pub visa_free_return_count: usize,
    pub airline_return_count: usize,
    pub airline_visa_free_return_count: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct DecomposeSettings {
    pub complexity_threshold: usize,
    pub min_entities: usize,
    pub max_depth: usize,
    pub max_workers: usize,
    pub decomp_timeout: Duration,
    pub subanswer_timeout: Duration,
    pub synthesis_timeout: Duration,
    pub min_score: f32,
    pub max_empty_results: usize,
    pub history_turns: usize,
    pub history_max_tokens: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct InsertBlockSettings {
    pub max_workers: usize,
    pub per_call_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct ConversationSettings {
    pub expire_days: i64,
    pub max_recent_turns: usize,
    pub max_relevant_turns: usize,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub request_timeout: Duration,
    pub max_tokens: u32,
    pub max_retries: usize,
    pub default_model: String,
    pub intent_timeout: Duration,
}

impl Settings {
    /// Read the full configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read configuration from an arbitrary lookup; used by tests to avoid
    /// touching process-global state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = &lookup;
        Ok(Self {
            server: ServerSettings {
                host: str_or(get, "HOST", "0.0.0.0"),
                port: parse_or(get, "PORT", 8080)?,
                request_deadline: secs_or(get, "REQUEST_DEADLINE", 300)?,
            },
            services: ServiceSettings {
                qdrant_url: str_or(get, "QDRANT_URL", "http://localhost:6334"),
                embedding_url: str_or(get, "EMBEDDING_URL", "http://localhost:9997/v1/embeddings"),
                embedding_model: str_or(get, "EMBEDDING_MODEL", "bge-m3"),
                embedding_api_key: get("EMBEDDING_API_KEY"),
                rerank_url: str_or(get, "RERANKER_URL", "http://localhost:9997/v1/rerank"),
                rerank_model: str_or(get, "RERANKER_MODEL", "bge-reranker-v2-m3"),
                llm_url: str_or(get, "LLM_URL", "http://localhost:9997/v1/chat/completions"),
                llm_model: str_or(get, "LLM_MODEL", "qwen3-32b"),
                llm_api_key_env: get("LLM_API_KEY_ENV"),
                auth_url: str_or(get, "AUTH_URL", "http://localhost:8001/api/validate_token"),
                kb_dir: str_or(get, "KB_DIR", "./knowledge"),
            },
            features: FeatureFlags {
                intent_classifier: flag_or(get, "ENABLE_INTENT_CLASSIFIER", true)?,
                subquestion_decomposition: flag_or(
                    get,
                    "ENABLE_SUBQUESTION_DECOMPOSITION",
                    false,
                )?,
                visa_free_kb: flag_or(get, "ENABLE_VISA_FREE_FEATURE", false)?,
                airline_kb: flag_or(get, "ENABLE_AIRLINE_FEATURE", false)?,
                rules_kb: flag_or(get, "ENABLE_RULES_FEATURE", false)?,
                hidden_kb: flag_or(get, "ENABLE_HIDDEN_KB_FEATURE", false)?,
            },
            fusion: FusionSettings {
                k: parse_or(get, "RRF_K", 10.0)?,
                vector_weight: parse_or(get, "RRF_VECTOR_WEIGHT", 0.7)?,
                bm25_weight: parse_or(get, "RRF_BM25_WEIGHT", 0.3)?,
            },
            retrieval: RetrievalSettings {
                top_k: parse_or(get, "RETRIEVAL_TOP_K", 30)?,
                top_k_bm25: parse_or(get, "RETRIEVAL_TOP_K_BM25", 30)?,
                top_k_merged: parse_or(get, "RETRIEVAL_TOP_K_MERGED", 30)?,
                rerank_input_top_n: parse_or(get, "RERANKER_INPUT_TOP_N", 30)?,
                rerank_top_n: parse_or(get, "RERANK_TOP_N", 15)?,
                rerank_score_threshold: parse_or(get, "RERANK_SCORE_THRESHOLD", 0.3)?,
                visa_free_return_count: parse_or(get, "VISA_FREE_STRATEGY_RETURN_COUNT", 15)?,
                airline_return_count: parse_or(get, "AIRLINE_STRATEGY_RETURN_COUNT", 15)?,
                airline_visa_free_return_count: parse_or(
                    get,
                    "AIRLINE_VISA_FREE_STRATEGY_RETURN_COUNT",
                    20,
                )?,
            },
            decompose: DecomposeSettings {
                complexity_threshold: parse_or(get, "SUBQUESTION_COMPLEXITY_THRESHOLD", 60)?,
                min_entities: parse_or(get, "SUBQUESTION_MIN_ENTITIES", 2)?,
                max_depth: parse_or(get, "SUBQUESTION_MAX_DEPTH", 3)?,
                max_workers: parse_or(get, "SUBQUESTION_MAX_WORKERS", 3)?,
                decomp_timeout: secs_or(get, "SUBQUESTION_DECOMP_TIMEOUT", 10)?,
                subanswer_timeout: secs_or(get, "SUBQUESTION_SUBANSWER_TIMEOUT", 15)?,
                synthesis_timeout: secs_or(get, "SUBQUESTION_SYNTHESIS_TIMEOUT", 30)?,
                min_score: parse_or(get, "SUBQUESTION_MIN_SCORE", 0.3)?,
                max_empty_results: parse_or(get, "SUBQUESTION_MAX_EMPTY_RESULTS", 2)?,
                history_turns: parse_or(get, "SUBQUESTION_HISTORY_TURNS", 5)?,
                history_max_tokens: parse_or(get, "SUBQUESTION_HISTORY_MAX_TOKENS", 500)?,
            },
            insert_block: InsertBlockSettings {
                max_workers: parse_or(get, "INSERTBLOCK_MAX_WORKERS", 5)?,
                per_call_timeout: secs_or(get, "INSERTBLOCK_TIMEOUT", 15)?,
            },
            conversation: ConversationSettings {
                expire_days: parse_or(get, "CONVERSATION_EXPIRE_DAYS", 30)?,
                max_recent_turns: parse_or(get, "MAX_RECENT_TURNS", 5)?,
                max_relevant_turns: parse_or(get, "MAX_RELEVANT_TURNS", 3)?,
            },
            llm: LlmSettings {
                request_timeout: secs_or(get, "LLM_REQUEST_TIMEOUT", 60)?,
                max_tokens: parse_or(get, "LLM_MAX_TOKENS", 4096)?,
                max_retries: parse_or(get, "LLM_MAX_RETRIES", 2)?,
                default_model: str_or(get, "LLM_DEFAULT_MODEL", "qwen3"),
                intent_timeout: secs_or(get, "INTENT_CLASSIFIER_TIMEOUT", 5)?,
            },
        })
    }
}

fn str_or(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: &str) -> String {
    get(key).unwrap_or_else(|| default.to_string())
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn secs_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    parse_or(get, key, default).map(Duration::from_secs)
}

fn flag_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { key, value: raw }),
        },
    }
}
