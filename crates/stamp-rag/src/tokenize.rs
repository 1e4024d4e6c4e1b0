//! Language-aware tokenizer for BM25 over a mixed Chinese/Latin corpus.
//!
//! Han runs are segmented into unigrams plus overlapping bigrams; everything
//! else is split on non-alphanumeric boundaries and lowercased. Bigrams give
//! BM25 enough phrase signal for CJK text without a dictionary segmenter,
//! and the unigrams keep single-character terms (国, 签) searchable.
use bm25::Tokenizer;

#[derive(Debug, Default, Clone)]
pub struct CjkTokenizer;

fn is_cjk(ch: char) -> bool {
    matches!(ch,
        '\u{4E00}'..='\u{9FFF}'          // CJK Unified Ideographs
        | '\u{3400}'..='\u{4DBF}'        // Extension A
        | '\u{F900}'..='\u{FAFF}'        // Compatibility Ideographs
    )
}

impl CjkTokenizer {
    /// Tokenize into BM25 terms: CJK unigrams + bigrams, lowercased
    /// alphanumeric words elsewhere.
    pub fn terms(text: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut word = String::new();
        let mut cjk_run: Vec<char> = Vec::new();

        let flush_word = |word: &mut String, out: &mut Vec<String>| {
            if !word.is_empty() {
                out.push(word.to_lowercase());
                word.clear();
            }
        };
        let flush_cjk = |run: &mut Vec<char>, out: &mut Vec<String>| {
            for &ch in run.iter() {
                out.push(ch.to_string());
            }
            for pair in run.windows(2) {
                out.push(pair.iter().collect());
            }
            run.clear();
        };

        for ch in text.chars() {
            if is_cjk(ch) {
                flush_word(&mut word, &mut out);
                cjk_run.push(ch);
            } else if ch.is_alphanumeric() {
                flush_cjk(&mut cjk_run, &mut out);
                word.push(ch);
            } else {
                flush_word(&mut word, &mut out);
                flush_cjk(&mut cjk_run, &mut out);
            }
        }
        flush_word(&mut word, &mut out);
        flush_cjk(&mut cjk_run, &mut out);
        out
    }

    /// Query tokens used for keyword matching against node text: the same
    /// term stream, deduplicated, preserving first-seen order.
    pub fn query_keywords(query: &str) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        Self::terms(query)
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect()
    }

    /// Subset of `query_keywords` (length >= 2) that occur in `text`.
    pub fn matched_keywords(query: &str, text: &str) -> Vec<String> {
        let haystack = text.to_lowercase();
        Self::query_keywords(query)
            .into_iter()
            .filter(|kw| kw.chars().count() >= 2 && haystack.contains(kw.as_str()))
            .collect()
    }
}

impl Tokenizer for CjkTokenizer {
    fn tokenize(&self, input_text: &str) -> Vec<String> {
        Self::terms(input_text)
    }
}
