//! Conversation auto-summary with two thresholds.
//!
//! When the estimated size of the prompt history passes `T2`, everything older than the most
//! recent `T1` tokens is condensed by the model into one `[AutoSummary]` assistant turn. If the
//! model fails, the old part is simply dropped. Only the prompt is rewritten; the stored
//! transcript keeps every message.

use regex::{Captures, Regex, RegexBuilder};
use std::sync::{Arc, OnceLock};

use crate::llm::{ChatMessage, LlmBackend};

pub const SUMMARY_MARKER: &str = "[AutoSummary]";
/// Minimum gap kept between the two thresholds.
const THRESHOLD_GAP: usize = 200;
const MIN_BUDGET: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummarySettings {
    /// T1: recent tokens kept verbatim.
    pub retain_tokens: usize,
    /// T2: history size that triggers a summary.
    pub trigger_tokens: usize,
    /// Requested summary length, in tokens.
    pub target_tokens: usize,
    pub prompt: String,
}

impl Default for SummarySettings {
    fn default() -> Self {
        Self {
            retain_tokens: 3000,
            trigger_tokens: 4000,
            target_tokens: 300,
            prompt: "Summarize the conversation so far as structured notes: key points, \
                     current state, and open items."
                .to_string(),
        }
    }
}

impl SummarySettings {
    /// `(T1, T2)` with `T2 > T1` enforced.
    pub fn thresholds(&self) -> (usize, usize) {
        let t1 = self.retain_tokens;
        let t2 = if self.trigger_tokens <= t1 {
            t1 + THRESHOLD_GAP
        } else {
            self.trigger_tokens
        };
        (t1, t2)
    }
}

/// Rough token count: four ASCII characters or one other character per token.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let ascii = text.chars().filter(char::is_ascii).count();
    let other = text.chars().count() - ascii;
    (ascii / 4 + other).max(1)
}

struct Cleaners {
    fenced_json: Regex,
    long_fence: Regex,
    json_object: Regex,
    json_array: Regex,
    tool_trace: Regex,
    any_fence: Regex,
}

fn cleaners() -> Option<&'static Cleaners> {
    static RE: OnceLock<Option<Cleaners>> = OnceLock::new();
    RE.get_or_init(|| {
        Some(Cleaners {
            fenced_json: Regex::new(r"(?is)```(?:json)?\s*[\r\n]+.*?```").ok()?,
            long_fence: Regex::new(r"(?s)```[\s\S]{40,}?```").ok()?,
            json_object: Regex::new(r"(?ms)^\s*\{[\s\S]{30,}?\}\s*$").ok()?,
            json_array: Regex::new(r"(?ms)^\s*\[[\s\S]{30,}?\]\s*$").ok()?,
            tool_trace: RegexBuilder::new(
                r#"^\s*(?:"?tool_calls"?\s*:|"?tool_call_id"?\s*:|"?function"?\s*:|"?type"?\s*:\s*"?function"?|"id"\s*:\s*"?call_)"#,
            )
            .case_insensitive(true)
            .build()
            .ok()?,
            any_fence: Regex::new(r"(?s)```.*?```").ok()?,
        })
    })
    .as_ref()
}

/// Drop code-fenced JSON, bare JSON blobs and tool-call trace lines from chat text.
fn clean_text(text: &str) -> String {
    let Some(re) = cleaners() else {
        return text.to_string();
    };
    let drop_blob = |caps: &Captures| {
        let block = &caps[0];
        let looks_like_json = block.matches(':').count() >= 2 || block.matches('"').count() >= 4;
        if block.len() >= 80 && looks_like_json {
            String::new()
        } else {
            block.to_string()
        }
    };
    let text = re.fenced_json.replace_all(text, "");
    let text = re.long_fence.replace_all(&text, "");
    let text = re.json_object.replace_all(&text, drop_blob);
    let text = re.json_array.replace_all(&text, drop_blob);
    text.lines()
        .filter(|line| !re.tool_trace.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Text that counts toward the size of `msg`. Tool results never count; system prompts count
/// toward the total but are never part of the retained tail.
fn countable(msg: &ChatMessage, for_tail: bool) -> Option<String> {
    match msg.role.as_str() {
        "tool" => None,
        _ if msg.content.is_empty() => None,
        "system" if for_tail => None,
        "system" => Some(msg.content.clone()),
        _ => {
            let cleaned = clean_text(&msg.content);
            (!cleaned.trim().is_empty()).then_some(cleaned)
        }
    }
}

fn history_tokens(history: &[ChatMessage]) -> usize {
    history
        .iter()
        .filter_map(|m| countable(m, false))
        .map(|c| estimate_tokens(&c))
        .sum()
}

/// Index where the retained tail starts, and its size. The tail holds the newest messages
/// fitting in `retain` tokens. It always starts on a counted chat message, so every tool
/// result it keeps still follows the call that produced it.
fn tail_start(history: &[ChatMessage], retain: usize) -> (usize, usize) {
    let mut start = history.len();
    let mut tokens = 0;
    for (i, msg) in history.iter().enumerate().rev() {
        let Some(content) = countable(msg, true) else {
            continue;
        };
        let size = estimate_tokens(&content);
        if tokens + size > retain {
            break;
        }
        tokens += size;
        start = i;
    }
    (start, tokens)
}

fn summary_source(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|m| m.role != "tool")
        .filter_map(|m| {
            let text = match m.role.as_str() {
                "user" | "assistant" => clean_text(&m.content),
                _ => m.content.clone(),
            };
            (!text.trim().is_empty()).then(|| format!("{}: {}", m.role, text.trim()))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Compresses long histories with the agent's own backend.
pub struct Summarizer {
    backend: Arc<dyn LlmBackend>,
    model: String,
    settings: SummarySettings,
}

impl Summarizer {
    pub fn new(backend: Arc<dyn LlmBackend>, model: impl Into<String>, settings: SummarySettings) -> Self {
        Self {
            backend,
            model: model.into(),
            settings,
        }
    }

    pub fn should_summarize(&self, history: &[ChatMessage]) -> bool {
        let (t1, t2) = self.settings.thresholds();
        let total = history_tokens(history);
        log::debug!("summary: history ~{} tokens (T1={}, T2={})", total, t1, t2);
        total > t2
    }

    /// History to send to the model: unchanged below T2, otherwise summary plus recent tail.
    pub async fn compress(&self, history: Vec<ChatMessage>) -> Vec<ChatMessage> {
        if !self.should_summarize(&history) {
            return history;
        }
        let (t1, t2) = self.settings.thresholds();
        let (start, tail_tokens) = tail_start(&history, t1);
        if start == 0 {
            return history;
        }
        let budget = t2.saturating_sub(tail_tokens).max(MIN_BUDGET);
        let summary = self.summarize(&history[..start], budget).await;
        let tail = history[start..].to_vec();
        match summary {
            Some(text) => {
                log::info!("summary: compressed {} messages into one", start);
                let mut out = Vec::with_capacity(tail.len() + 1);
                out.push(ChatMessage::assistant(format!("{}\n{}", SUMMARY_MARKER, text)));
                out.extend(tail);
                out
            }
            None => {
                log::warn!("summary: generation failed, keeping only the recent {} messages", tail.len());
                tail
            }
        }
    }

    async fn summarize(&self, messages: &[ChatMessage], budget: usize) -> Option<String> {
        let source = summary_source(messages);
        if source.is_empty() {
            return None;
        }
        let request = vec![
            ChatMessage::system(
                "You summarize conversations. Keep facts, people and entities, constraints, \
                 and unfinished tasks.",
            ),
            ChatMessage::user(format!(
                "{}\n\nTarget length: at most about {} tokens (aim for {}).\n\n\
                 Summarize this conversation:\n\n{}",
                self.settings.prompt, budget, self.settings.target_tokens, source
            )),
        ];
        match self.backend.chat(&self.model, request, None).await {
            Ok(response) => {
                let text = match cleaners() {
                    Some(re) => re.any_fence.replace_all(response.content(), "").trim().to_string(),
                    None => response.content().trim().to_string(),
                };
                (!text.is_empty()).then_some(text)
            }
            Err(e) => {
                log::error!("summary: provider {} failed: {}", self.backend.name(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatResponse, LlmError, ToolCall, ToolDefinition};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Canned {
        reply: Result<String, String>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmBackend for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        async fn chat(
            &self,
            _model: &str,
            messages: Vec<ChatMessage>,
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<ChatResponse, LlmError> {
            if let Some(last) = messages.last() {
                self.prompts.lock().unwrap().push(last.content.clone());
            }
            self.reply.clone().map(ChatResponse::text).map_err(LlmError::Api)
        }
    }

    fn summarizer(reply: Result<&str, &str>, retain: usize, trigger: usize) -> (Summarizer, Arc<Canned>) {
        let backend = Arc::new(Canned {
            reply: reply.map(str::to_string).map_err(str::to_string),
            prompts: Mutex::new(Vec::new()),
        });
        let settings = SummarySettings {
            retain_tokens: retain,
            trigger_tokens: trigger,
            ..SummarySettings::default()
        };
        (Summarizer::new(backend.clone(), "m", settings), backend)
    }

    /// `n` user/assistant pairs of about 25 tokens each message.
    fn chatter(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .flat_map(|i| {
                [
                    ChatMessage::user(format!("question {:03} {}", i, "q".repeat(86))),
                    ChatMessage::assistant(format!("answer {:03} {}", i, "a".repeat(88))),
                ]
            })
            .collect()
    }

    #[test]
    fn token_estimate_counts_ascii_by_four() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(40)), 10);
        assert_eq!(estimate_tokens("你好世界"), 4);
        assert_eq!(estimate_tokens("Hello 你好 world 世界"), 3 + 4);
    }

    #[test]
    fn trigger_is_kept_above_retain() {
        let mut s = SummarySettings::default();
        assert_eq!(s.thresholds(), (3000, 4000));
        s.trigger_tokens = 2000;
        assert_eq!(s.thresholds(), (3000, 3200));
        s.trigger_tokens = 3000;
        assert_eq!(s.thresholds(), (3000, 3200));
    }

    #[test]
    fn json_and_tool_traces_are_not_counted() {
        let text = "Before block\n```json\n{\"key\": \"value\", \"nested\": {\"data\": \"large\"}}\n```\nAfter block";
        let cleaned = clean_text(text);
        assert!(cleaned.contains("Before block") && cleaned.contains("After block"));
        assert!(!cleaned.contains("```"));

        let trace = "calling now\n\"tool_calls\": [\n\"id\": \"call_abc\"\ndone";
        assert_eq!(clean_text(trace), "calling now\ndone");

        let tool = ChatMessage::tool_result("c1", "read_file", "x".repeat(10_000));
        assert_eq!(history_tokens(&[tool]), 0);
    }

    #[tokio::test]
    async fn short_history_is_untouched() {
        let (s, backend) = summarizer(Ok("unused"), 100, 200);
        let history = chatter(2);
        assert_eq!(s.compress(history.clone()).await, history);
        assert!(backend.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn long_history_becomes_summary_plus_tail() {
        let (s, backend) = summarizer(Ok("User asked many questions."), 100, 200);
        let history = chatter(10);
        let out = s.compress(history.clone()).await;

        assert_eq!(out[0].role, "assistant");
        assert_eq!(out[0].content, "[AutoSummary]\nUser asked many questions.");
        let tail = &out[1..];
        assert!(!tail.is_empty() && tail.len() < history.len());
        assert_eq!(tail, &history[history.len() - tail.len()..]);
        assert!(history_tokens(tail) <= 100);

        let prompts = backend.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("user: question 000"));
        assert!(!prompts[0].contains(&tail[0].content));
    }

    #[tokio::test]
    async fn failed_summary_falls_back_to_tail() {
        let (s, _) = summarizer(Err("down"), 100, 200);
        let history = chatter(10);
        let out = s.compress(history.clone()).await;
        assert!(!out.is_empty());
        assert!(out.iter().all(|m| !m.content.starts_with(SUMMARY_MARKER)));
        assert_eq!(out.as_slice(), &history[history.len() - out.len()..]);
    }

    #[tokio::test]
    async fn tail_never_starts_with_orphaned_tool_result() {
        let (s, _) = summarizer(Ok("earlier work"), 60, 120);
        let mut history = chatter(6);
        history.push(ChatMessage::user("list files please"));
        history.push(ChatMessage::assistant_with_tools(
            "",
            vec![ToolCall::new("c1", "list_dir", serde_json::json!({}))],
        ));
        history.push(ChatMessage::tool_result("c1", "list_dir", "a.txt"));
        history.push(ChatMessage::assistant("Found a.txt"));
        let out = s.compress(history).await;
        assert!(out[0].content.starts_with(SUMMARY_MARKER));
        assert_ne!(out[1].role, "tool");
        for (i, m) in out.iter().enumerate() {
            if m.role == "tool" {
                assert!(out[..i].iter().any(|p| p.tool_calls.is_some()));
            }
        }
    }
}
