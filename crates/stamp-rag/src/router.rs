//! Intent routing: one LLM call, cached, with a silent general fallback.
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use stamp_core::Strategy;
use stamp_llm::{ChatMessage, LlmClient};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::prompts;

const CACHE_CAPACITY: usize = 1000;

/// Classifies a query into a retrieval [`Strategy`].
///
/// Failures never propagate: a timeout, an LLM error, or an unparseable
/// reply all resolve to [`Strategy::General`], and a disabled router always
/// answers [`Strategy::General`]. Results are LRU-cached on the raw query.
pub struct IntentRouter {
    llm: Arc<LlmClient>,
    enabled: bool,
    call_timeout: Duration,
    cache: Mutex<LruCache<String, Strategy>>,
}

impl std::fmt::Debug for IntentRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentRouter")
            .field("enabled", &self.enabled)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl IntentRouter {
    pub fn new(llm: Arc<LlmClient>, enabled: bool, call_timeout: Duration) -> Self {
        Self {
            llm,
            enabled,
            call_timeout,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero cache capacity"),
            )),
        }
    }

    #[instrument(skip(self, query), fields(query_len = query.chars().count()))]
    pub async fn classify(&self, query: &str) -> Strategy {
        if !self.enabled {
            return Strategy::General;
        }
        if let Some(cached) = self
            .cache
            .lock()
            .expect("intent cache lock")
            .get(query)
            .copied()
        {
            debug!(strategy = %cached, "intent cache hit");
            return cached;
        }

        let messages = vec![
            ChatMessage::system(prompts::INTENT_SYSTEM),
            ChatMessage::user(query),
        ];
        let strategy = match timeout(self.call_timeout, self.llm.complete(None, messages)).await {
            Ok(Ok(reply)) => parse_intent_reply(&reply),
            Ok(Err(err)) => {
                warn!(error = %err, "intent classification failed; using general");
                Strategy::General
            }
            Err(_) => {
                warn!(timeout_ms = self.call_timeout.as_millis() as u64, "intent classification timed out; using general");
                Strategy::General
            }
        };

        self.cache
            .lock()
            .expect("intent cache lock")
            .put(query.to_string(), strategy);
        debug!(strategy = %strategy, "intent classified");
        strategy
    }
}

/// Parse the classifier reply: the `分类:` label first, then bare keyword
/// presence (most specific first), then the general default.
pub fn parse_intent_reply(reply: &str) -> Strategy {
    let trimmed = reply.trim();
    for label in ["分类:", "分类：", "category:"] {
        if let Some(rest) = trimmed
            .lines()
            .find_map(|line| line.trim().strip_prefix(label))
        {
            if let Some(strategy) = keyword_strategy(rest) {
                return strategy;
            }
        }
    }
    keyword_strategy(trimmed).unwrap_or(Strategy::General)
}

fn keyword_strategy(text: &str) -> Option<Strategy> {
    let text = text.trim().to_ascii_lowercase();
    if text.contains("airline_visa_free") {
        Some(Strategy::AirlineVisaFree)
    } else if text.contains("airline") {
        Some(Strategy::Airline)
    } else if text.contains("visa_free") {
        Some(Strategy::VisaFree)
    } else if text.contains("general") {
        Some(Strategy::General)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_line_wins() {
        assert_eq!(
            parse_intent_reply("分析如下。\n分类: visa_free"),
            Strategy::VisaFree
        );
        assert_eq!(
            parse_intent_reply("分类：airline_visa_free"),
            Strategy::AirlineVisaFree
        );
    }

    #[test]
    fn keyword_fallback_prefers_most_specific() {
        // No label; both "airline" and "visa_free" appear inside the
        // combined keyword, which must win.
        assert_eq!(
            parse_intent_reply("这是 airline_visa_free 场景"),
            Strategy::AirlineVisaFree
        );
        assert_eq!(parse_intent_reply("属于 airline 类"), Strategy::Airline);
        assert_eq!(parse_intent_reply("visa_free"), Strategy::VisaFree);
    }

    #[test]
    fn unparseable_reply_defaults_to_general() {
        assert_eq!(parse_intent_reply("无法判断"), Strategy::General);
        assert_eq!(parse_intent_reply(""), Strategy::General);
    }

    #[test]
    fn label_with_junk_token_falls_through_to_general() {
        assert_eq!(parse_intent_reply("分类: 其他"), Strategy::General);
    }

    mod with_llm {
        use super::*;
        use httpmock::prelude::*;
        use stamp_llm::{ProviderEndpoint, ProviderRegistry};

        fn router_for(server: &MockServer, enabled: bool) -> IntentRouter {
            let registry = ProviderRegistry::new("qwen3").with_endpoint(
                "qwen3",
                ProviderEndpoint {
                    completion_url: server.url("/v1/chat/completions"),
                    model: "qwen3-32b".into(),
                    api_key_env: None,
                },
            );
            let llm = Arc::new(LlmClient::new(
                registry,
                Duration::from_secs(5),
                256,
                0,
            ));
            IntentRouter::new(llm, enabled, Duration::from_secs(5))
        }

        #[tokio::test]
        async fn identical_queries_hit_the_cache() {
            let server = MockServer::start();
            let mock = server.mock(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).json_body(serde_json::json!({
                    "choices": [{"message": {"content": "分类: visa_free"}}]
                }));
            });

            let router = router_for(&server, true);
            let first = router.classify("去泰国旅游需要签证吗？").await;
            let second = router.classify("去泰国旅游需要签证吗？").await;
            assert_eq!(first, Strategy::VisaFree);
            assert_eq!(second, Strategy::VisaFree);
            mock.assert_hits(1);
        }

        #[tokio::test]
        async fn disabled_router_never_calls_the_llm() {
            let server = MockServer::start();
            let mock = server.mock(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200).json_body(serde_json::json!({
                    "choices": [{"message": {"content": "分类: airline"}}]
                }));
            });

            let router = router_for(&server, false);
            assert_eq!(router.classify("机组人员问题").await, Strategy::General);
            mock.assert_hits(0);
        }

        #[tokio::test]
        async fn llm_failure_degrades_to_general() {
            let server = MockServer::start();
            server.mock(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(500).body("boom");
            });

            let router = router_for(&server, true);
            assert_eq!(router.classify("任何问题").await, Strategy::General);
        }
    }
}
