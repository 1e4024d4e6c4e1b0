//! SSE frames and the thinking/content demultiplexer.
//!
//! Every reply is a sequence of tagged frames: `SESSION` first, `DONE` last
//! (exactly once each, on success and on error), `SOURCE` only after the
//! answer text has finished. A token is classified once: it is either
//! thinking output or answer content, never both.
use serde_json::Value;

/// One wire event, encoded as `data: TAG:payload\n\n`.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Session(String),
    Content(String),
    Think(String),
    Source(Value),
    Error(String),
    Done,
}

impl Frame {
    pub fn tag(&self) -> &'static str {
        match self {
            Frame::Session(_) => "SESSION",
            Frame::Content(_) => "CONTENT",
            Frame::Think(_) => "THINK",
            Frame::Source(_) => "SOURCE",
            Frame::Error(_) => "ERROR",
            Frame::Done => "DONE",
        }
    }

    pub fn encode(&self) -> String {
        let payload = match self {
            Frame::Session(s) | Frame::Content(s) | Frame::Think(s) | Frame::Error(s) => s.clone(),
            Frame::Source(v) => v.to_string(),
            Frame::Done => String::new(),
        };
        format!("data: {}:{}\n\n", self.tag(), payload)
    }
}

/// Markers that open a thinking section in a raw text stream.
const THINK_START: [&str; 4] = ["<think>", "【咨询解析】", "## 思考过程", "关键实体"];
/// Markers that close it again.
const THINK_END: [&str; 3] = ["</think>", "【综合解答】", "## 最终答案"];

/// Flush buffered text once it exceeds this many chars.
const FLUSH_CHARS: usize = 40;
/// Tail kept unflushed so a marker split across chunks is still seen.
const HOLDBACK_CHARS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemuxState {
    Content,
    InThink,
}

/// Splits an LLM token stream into THINK and CONTENT frames.
///
/// Providers with a native `reasoning_content` channel short-circuit the
/// marker scan: reasoning chunks map to THINK directly and content chunks to
/// CONTENT. Without it, a two-state FSM scans a rolling buffer for the
/// start/end markers. Fenced code markers are stripped from CONTENT either
/// way, and THINK frames are suppressed entirely when thinking mode is off.
#[derive(Debug)]
pub struct ThinkDemux {
    state: DemuxState,
    buffer: String,
    thinking_enabled: bool,
    /// Set once a `reasoning_content` delta arrives.
    native_reasoning: bool,
}

impl ThinkDemux {
    pub fn new(thinking_enabled: bool) -> Self {
        Self {
            state: DemuxState::Content,
            buffer: String::new(),
            thinking_enabled,
            native_reasoning: false,
        }
    }

    /// A chunk from the provider's dedicated reasoning channel.
    pub fn push_reasoning(&mut self, chunk: &str) -> Vec<Frame> {
        self.native_reasoning = true;
        if self.thinking_enabled && !chunk.is_empty() {
            vec![Frame::Think(chunk.to_string())]
        } else {
            Vec::new()
        }
    }

    /// A content chunk; scanned for thought markers unless the provider
    /// already separates reasoning natively.
    pub fn push_content(&mut self, chunk: &str) -> Vec<Frame> {
        self.buffer.push_str(chunk);
        let mut frames = self.drain_markers();
        frames.extend(self.flush_if_large());
        frames
    }

    /// Flush whatever remains at stream end.
    pub fn finish(&mut self) -> Vec<Frame> {
        let mut frames = self.drain_markers();
        let rest = std::mem::take(&mut self.buffer);
        frames.extend(self.emit(&rest));
        frames
    }

    fn drain_markers(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        if self.native_reasoning {
            // Native channel: content is content; no marker scanning.
            return frames;
        }
        loop {
            let markers: &[&str] = match self.state {
                DemuxState::Content => &THINK_START,
                DemuxState::InThink => &THINK_END,
            };
            let earliest = markers
                .iter()
                .filter_map(|m| self.buffer.find(m).map(|pos| (pos, m.len())))
                .min_by_key(|(pos, _)| *pos);
            let Some((pos, marker_len)) = earliest else {
                return frames;
            };
            let before = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + marker_len);
            frames.extend(self.emit(&before));
            self.state = match self.state {
                DemuxState::Content => DemuxState::InThink,
                DemuxState::InThink => DemuxState::Content,
            };
        }
    }

    fn flush_if_large(&mut self) -> Vec<Frame> {
        if self.buffer.chars().count() <= FLUSH_CHARS {
            return Vec::new();
        }
        let keep_from = self
            .buffer
            .char_indices()
            .rev()
            .nth(HOLDBACK_CHARS - 1)
            .map(|(i, _)| i)
            .unwrap_or(0);
        // Never split a backtick run across the cut; fences must be stripped
        // whole.
        let mut cut = keep_from;
        while cut > 0 && self.buffer.as_bytes()[cut - 1] == b'`' {
            cut -= 1;
        }
        if cut == 0 {
            return Vec::new();
        }
        let head = self.buffer[..cut].to_string();
        self.buffer.drain(..cut);
        self.emit(&head)
    }

    fn emit(&self, text: &str) -> Vec<Frame> {
        if text.is_empty() {
            return Vec::new();
        }
        match self.state {
            DemuxState::Content => {
                let cleaned = strip_code_fences(text);
                if cleaned.is_empty() {
                    Vec::new()
                } else {
                    vec![Frame::Content(cleaned)]
                }
            }
            DemuxState::InThink => {
                if self.thinking_enabled {
                    vec![Frame::Think(text.to_string())]
                } else {
                    Vec::new()
                }
            }
        }
    }
}

/// Remove fenced code-block markers so the UI never renders spurious code.
pub fn strip_code_fences(text: &str) -> String {
    text.replace("```", "")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_text(frames: &[Frame]) -> (String, String) {
        let mut content = String::new();
        let mut think = String::new();
        for frame in frames {
            match frame {
                Frame::Content(c) => content.push_str(c),
                Frame::Think(t) => think.push_str(t),
                _ => {}
            }
        }
        (content, think)
    }

    fn run(demux: &mut ThinkDemux, chunks: &[&str]) -> Vec<Frame> {
        let mut frames = Vec::new();
        for chunk in chunks {
            frames.extend(demux.push_content(chunk));
        }
        frames.extend(demux.finish());
        frames
    }

    #[test]
    fn frame_encoding_is_tag_prefixed() {
        assert_eq!(Frame::Session("7_s".into()).encode(), "data: SESSION:7_s\n\n");
        assert_eq!(Frame::Done.encode(), "data: DONE:\n\n");
        let src = Frame::Source(serde_json::json!({"id": "a"}));
        assert_eq!(src.encode(), "data: SOURCE:{\"id\":\"a\"}\n\n");
    }

    #[test]
    fn marker_pairs_split_think_from_content() {
        let mut demux = ThinkDemux::new(true);
        let frames = run(&mut demux, &["前言<think>推理中", "还在想</think>答案部分"]);
        let (content, think) = collect_text(&frames);
        assert_eq!(content, "前言答案部分");
        assert_eq!(think, "推理中还在想");
    }

    #[test]
    fn marker_split_across_chunks_is_still_found() {
        let mut demux = ThinkDemux::new(true);
        let frames = run(&mut demux, &["答案<thi", "nk>思考</th", "ink>结尾"]);
        let (content, think) = collect_text(&frames);
        assert_eq!(content, "答案结尾");
        assert_eq!(think, "思考");
    }

    #[test]
    fn chinese_markers_work_too() {
        let mut demux = ThinkDemux::new(true);
        let frames = run(&mut demux, &["【咨询解析】分析实体【综合解答】可以免签"]);
        let (content, think) = collect_text(&frames);
        assert_eq!(think, "分析实体");
        assert_eq!(content, "可以免签");
    }

    #[test]
    fn thinking_disabled_suppresses_think_frames() {
        let mut demux = ThinkDemux::new(false);
        let frames = run(&mut demux, &["前<think>内心戏</think>后"]);
        assert!(frames.iter().all(|f| !matches!(f, Frame::Think(_))));
        let (content, _) = collect_text(&frames);
        assert_eq!(content, "前后");
    }

    #[test]
    fn code_fences_never_reach_content() {
        let mut demux = ThinkDemux::new(false);
        let long_head = "规定原文如下，请注意格式：".repeat(3);
        let chunks = [long_head.as_str(), "``", "`代码块`", "``结束"];
        let frames = run(&mut demux, &chunks);
        let (content, _) = collect_text(&frames);
        assert!(!content.contains("```"), "content: {content}");
        assert!(content.contains("代码块"));
        assert!(content.ends_with("结束"));
    }

    #[test]
    fn long_content_flushes_incrementally() {
        let mut demux = ThinkDemux::new(false);
        let chunk = "很长的回答".repeat(20);
        let frames = demux.push_content(&chunk);
        assert!(!frames.is_empty(), "expected an incremental flush");
        let mut rest = demux.finish();
        let mut all = frames;
        all.append(&mut rest);
        let (content, _) = collect_text(&all);
        assert_eq!(content, chunk);
    }

    #[test]
    fn native_reasoning_bypasses_marker_scan() {
        let mut demux = ThinkDemux::new(true);
        let mut frames = demux.push_reasoning("推理");
        frames.extend(demux.push_content("<think>这不是标记模式"));
        frames.extend(demux.finish());
        let (content, think) = collect_text(&frames);
        assert_eq!(think, "推理");
        // Marker text passes through as literal content in native mode.
        assert!(content.contains("<think>"));
    }

    #[test]
    fn reasoning_suppressed_when_thinking_off() {
        let mut demux = ThinkDemux::new(false);
        assert!(demux.push_reasoning("推理").is_empty());
    }
}
