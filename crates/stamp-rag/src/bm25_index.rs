//! In-memory BM25 index for one knowledge base.
//!
//! Wraps `bm25::Embedder` + `Scorer` with the CJK tokenizer. The average
//! document length is computed from the corpus itself; nodes whose text
//! yields no tokens are skipped and counted, never silently indexed.
use bm25::{EmbedderBuilder, Scorer, Tokenizer};
use tracing::warn;

use crate::tokenize::CjkTokenizer;

pub struct KbBm25Index {
    embedder: bm25::Embedder<u32, CjkTokenizer>,
    scorer: Scorer<String, u32>,
    doc_count: usize,
    skipped: usize,
}

impl std::fmt::Debug for KbBm25Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KbBm25Index")
            .field("doc_count", &self.doc_count)
            .field("skipped", &self.skipped)
            .finish()
    }
}

impl KbBm25Index {
    /// Build from a corpus of (node id, text). Computes avgdl from the
    /// tokenized corpus, then indexes every tokenizable document.
    pub fn from_corpus(kb_name: &str, corpus: Vec<(String, String)>) -> Self {
        let tokenizer = CjkTokenizer;
        let mut total_tokens = 0usize;
        let mut docs: Vec<(String, String, usize)> = Vec::with_capacity(corpus.len());
        let mut skipped = 0usize;

        for (id, text) in corpus {
            let token_count = tokenizer.tokenize(&text).len();
            if token_count == 0 {
                skipped += 1;
                continue;
            }
            total_tokens += token_count;
            docs.push((id, text, token_count));
        }
        if skipped > 0 {
            warn!(kb = kb_name, skipped, "skipped untokenizable nodes at BM25 build");
        }

        let avgdl = if docs.is_empty() {
            1.0
        } else {
            total_tokens as f32 / docs.len() as f32
        };
        let embedder = EmbedderBuilder::<u32, CjkTokenizer>::with_avgdl(avgdl).build();
        let mut scorer = Scorer::<String, u32>::new();
        for (id, text, _) in &docs {
            let embedding = embedder.embed(text);
            scorer.upsert(id, embedding);
        }

        Self {
            embedder,
            scorer,
            doc_count: docs.len(),
            skipped,
        }
    }

    pub fn doc_count(&self) -> usize {
        self.doc_count
    }

    /// Nodes dropped at build time because their text produced no tokens.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Top-k (node id, BM25 score) pairs, best first.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(String, f32)> {
        let query_embedding = self.embedder.embed(query);
        let mut matches = self.scorer.matches(&query_embedding);
        matches.truncate(top_k);
        matches.into_iter().map(|doc| (doc.id, doc.score)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(corpus: &[(&str, &str)]) -> KbBm25Index {
        KbBm25Index::from_corpus(
            "test",
            corpus
                .iter()
                .map(|(id, text)| (id.to_string(), text.to_string()))
                .collect(),
        )
    }

    #[test]
    fn matching_document_scores_first() {
        let idx = index(&[
            ("a", "护照办理流程和所需材料"),
            ("b", "泰国免签政策说明"),
        ]);
        let results = idx.search("免签", 10);
        assert!(!results.is_empty());
        assert_eq!(results[0].0, "b");
    }

    #[test]
    fn latin_terms_are_searchable() {
        let idx = index(&[
            ("a", "JS0 扣减次数说明文档"),
            ("b", "普通签证材料清单"),
        ]);
        let results = idx.search("JS0 扣减次数", 10);
        assert_eq!(results[0].0, "a");
    }

    #[test]
    fn untokenizable_nodes_are_skipped_and_counted() {
        let idx = index(&[("a", "正常文本"), ("b", "...")]);
        assert_eq!(idx.doc_count(), 1);
        assert_eq!(idx.skipped(), 1);
    }

    #[test]
    fn empty_corpus_searches_empty() {
        let idx = index(&[]);
        assert!(idx.search("任何", 5).is_empty());
    }

    #[test]
    fn top_k_truncates() {
        let idx = index(&[
            ("a", "签证 材料"),
            ("b", "签证 流程"),
            ("c", "签证 费用"),
        ]);
        assert!(idx.search("签证", 2).len() <= 2);
    }
}
