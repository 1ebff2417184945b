//! One agent turn: `Dispatch -> ModelCall -> (ToolExecution -> ModelCall)* -> Complete | Aborted`.
//!
//! The turn owns its session for its whole duration (the loop serializes per session), so
//! transcript writes here never interleave with another turn on the same key.

use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::context::{user_content, ContextBuilder};
use crate::bus::InboundMessage;
use crate::llm::{ChatMessage, LlmBackend, ToolCall, ToolDefinition};
use crate::session::SessionStore;
use crate::tools::{ToolContext, ToolExecutor, ToolResult};

pub const DEFAULT_MAX_ITERATIONS: u32 = 20;
pub const EMPTY_REPLY: &str = "I've completed processing but have no response to give.";

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub model: String,
    /// Tool rounds allowed per inbound message. Zero is raised to one.
    pub max_iterations: u32,
    /// Run the calls of one round concurrently. Results are recorded in call order either way.
    pub parallel_tool_calls: bool,
    pub history_limit: usize,
    pub tool_timeout: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: "llama3.2:latest".to_string(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            parallel_tool_calls: false,
            history_limit: 50,
            tool_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Dispatch,
    ModelCall,
    ToolExecution,
    Complete,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    IterationLimit,
    Provider(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Complete,
    Aborted(AbortReason),
}

/// What a finished turn hands back to the loop.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub outcome: TurnOutcome,
    /// Text for the single outbound message (final answer or abort notice).
    pub reply: String,
    pub iterations: u32,
    pub tool_calls: usize,
}

impl TurnReport {
    pub fn is_complete(&self) -> bool {
        self.outcome == TurnOutcome::Complete
    }

    fn aborted(reason: AbortReason, reply: String, iterations: u32, tool_calls: usize) -> Self {
        Self {
            outcome: TurnOutcome::Aborted(reason),
            reply,
            iterations,
            tool_calls,
        }
    }
}

/// Shared collaborators for running turns. One instance serves every session and subagent.
pub struct AgentRuntime {
    backend: Arc<dyn LlmBackend>,
    executor: Arc<ToolExecutor>,
    sessions: Arc<SessionStore>,
    context: ContextBuilder,
    settings: AgentSettings,
    shutdown: CancellationToken,
}

impl AgentRuntime {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        executor: Arc<ToolExecutor>,
        sessions: Arc<SessionStore>,
        context: ContextBuilder,
        mut settings: AgentSettings,
    ) -> Self {
        settings.max_iterations = settings.max_iterations.max(1);
        Self {
            backend,
            executor,
            sessions,
            context,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Tool context for a turn triggered by `msg`.
    pub fn tool_context(&self, msg: &InboundMessage) -> ToolContext {
        let mut ctx = ToolContext::new(
            &msg.channel,
            &msg.chat_id,
            self.context.workspace(),
            self.settings.tool_timeout,
        );
        ctx.trigger = msg.trigger;
        ctx.delivery = msg.delivery.clone();
        ctx
    }

    /// Drive one inbound message to a terminal state. Never fails: aborts become the report.
    pub async fn run_turn(&self, msg: &InboundMessage, ctx: &ToolContext) -> TurnReport {
        let key = ctx.session_key.as_str();
        let max = self.settings.max_iterations;
        trace(key, TurnState::Dispatch);

        self.sessions.get_or_create(key).await;
        let history = self.sessions.history(key, self.settings.history_limit).await;
        let user = ChatMessage::user(user_content(&msg.content, &msg.media));
        self.record(key, vec![user.clone()]).await;
        self.set_iteration(key, 0).await;

        let mut messages = self
            .context
            .build_messages(history, user, &msg.channel, &msg.chat_id)
            .await;
        let definitions = self.executor.registry().definitions().await;
        let tools: Option<Vec<ToolDefinition>> = (!definitions.is_empty()).then_some(definitions);

        let mut iteration = 0u32;
        let mut total_calls = 0usize;
        loop {
            if self.shutdown.is_cancelled() {
                return self.cancelled(key, iteration, total_calls);
            }

            trace(key, TurnState::ModelCall);
            let response = tokio::select! {
                res = self.backend.chat(&self.settings.model, messages.clone(), tools.clone()) => res,
                _ = self.shutdown.cancelled() => return self.cancelled(key, iteration, total_calls),
            };
            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    log::error!("agent {}: provider {} failed: {}", key, self.backend.name(), e);
                    trace(key, TurnState::Aborted);
                    return TurnReport::aborted(
                        AbortReason::Provider(e.to_string()),
                        format!("Sorry, I encountered an error: {}", e),
                        iteration,
                        total_calls,
                    );
                }
            };

            let calls = response.tool_calls().to_vec();
            if calls.is_empty() {
                let content = response.content().trim();
                let reply = if content.is_empty() {
                    EMPTY_REPLY.to_string()
                } else {
                    content.to_string()
                };
                self.record(key, vec![ChatMessage::assistant(reply.clone())]).await;
                trace(key, TurnState::Complete);
                return TurnReport {
                    outcome: TurnOutcome::Complete,
                    reply,
                    iterations: iteration,
                    tool_calls: total_calls,
                };
            }

            trace(key, TurnState::ToolExecution);
            let assistant = ChatMessage::assistant_with_tools(response.content(), calls.clone());
            let results = self.execute_round(&calls, ctx).await;
            total_calls += calls.len();

            let mut round = Vec::with_capacity(results.len() + 1);
            round.push(assistant);
            round.extend(results.iter().map(ToolResult::to_message));
            messages.extend(round.iter().cloned());
            self.record(key, round).await;

            iteration += 1;
            self.set_iteration(key, iteration).await;
            if iteration >= max {
                let notice = format!(
                    "I stopped after {} rounds of tool calls without reaching a final answer. \
                     Ask me to continue if you want me to keep going.",
                    max
                );
                log::warn!("agent {}: iteration limit {} reached", key, max);
                self.record(key, vec![ChatMessage::assistant(notice.clone())]).await;
                trace(key, TurnState::Aborted);
                return TurnReport::aborted(AbortReason::IterationLimit, notice, iteration, total_calls);
            }
        }
    }

    /// Every call yields exactly one result, in call order.
    async fn execute_round(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<ToolResult> {
        if self.settings.parallel_tool_calls {
            join_all(calls.iter().map(|c| self.executor.execute_call(c, ctx))).await
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                results.push(self.executor.execute_call(call, ctx).await);
            }
            results
        }
    }

    fn cancelled(&self, key: &str, iteration: u32, calls: usize) -> TurnReport {
        log::info!("agent {}: turn cancelled by shutdown", key);
        trace(key, TurnState::Aborted);
        TurnReport::aborted(
            AbortReason::Cancelled,
            "Sorry, I was interrupted because the assistant is shutting down.".to_string(),
            iteration,
            calls,
        )
    }

    async fn record(&self, key: &str, messages: Vec<ChatMessage>) {
        if let Err(e) = self.sessions.append(key, messages).await {
            log::error!("agent {}: appending to session failed: {}", key, e);
        }
    }

    async fn set_iteration(&self, key: &str, iteration: u32) {
        if let Err(e) = self.sessions.set_iteration(key, iteration).await {
            log::error!("agent {}: updating iteration failed: {}", key, e);
        }
    }
}

fn trace(key: &str, state: TurnState) {
    log::debug!("agent {}: {:?}", key, state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatResponse, LlmError};
    use crate::tools::{Capability, ExecutionPolicy, Tool, ToolError, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<Result<ChatResponse, LlmError>>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<ChatResponse, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmBackend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat(
            &self,
            _model: &str,
            messages: Vec<ChatMessage>,
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<ChatResponse, LlmError> {
            self.seen.lock().unwrap().push(messages);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ChatResponse::text("done")))
        }
    }

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]})
        }
        fn capability(&self) -> Capability {
            Capability::Messaging
        }
        async fn execute(&self, args: Map<String, Value>, _ctx: &ToolContext) -> Result<String, ToolError> {
            Ok(args["text"].as_str().unwrap_or_default().to_string())
        }
    }

    async fn runtime(backend: Arc<Scripted>, max: u32) -> AgentRuntime {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(Echo)).await.unwrap();
        let executor = Arc::new(ToolExecutor::new(registry, ExecutionPolicy::default()));
        AgentRuntime::new(
            backend,
            executor,
            Arc::new(SessionStore::new()),
            ContextBuilder::new(std::env::temp_dir()),
            AgentSettings {
                max_iterations: max,
                ..AgentSettings::default()
            },
        )
    }

    fn echo_call(id: &str) -> ToolCall {
        ToolCall::new(id, "echo", json!({"text": id}))
    }

    #[tokio::test]
    async fn final_answer_completes_without_iterations() {
        let backend = Scripted::new(vec![Ok(ChatResponse::text("hello"))]);
        let rt = runtime(backend, 5).await;
        let msg = InboundMessage::user("cli", "direct", "me", "hi");
        let report = rt.run_turn(&msg, &rt.tool_context(&msg)).await;
        assert_eq!(report.outcome, TurnOutcome::Complete);
        assert_eq!(report.reply, "hello");
        assert_eq!(report.iterations, 0);
        let session = rt.sessions().get("cli:direct").await.unwrap();
        assert_eq!(session.messages.len(), 2);
    }

    #[tokio::test]
    async fn every_call_has_a_result_before_next_model_call() {
        let backend = Scripted::new(vec![
            Ok(ChatResponse::tool_calls_only(vec![echo_call("a"), ToolCall::new("b", "missing", json!({}))])),
            Ok(ChatResponse::text("ok")),
        ]);
        let rt = runtime(backend.clone(), 5).await;
        let msg = InboundMessage::user("cli", "direct", "me", "go");
        let report = rt.run_turn(&msg, &rt.tool_context(&msg)).await;
        assert!(report.is_complete());
        assert_eq!(report.tool_calls, 2);

        let seen = backend.seen.lock().unwrap();
        let second = &seen[1];
        let tool_ids: Vec<&str> = second
            .iter()
            .filter(|m| m.role == "tool")
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(tool_ids, ["a", "b"]);
        assert!(second.last().unwrap().content.starts_with("Error: unknown tool"));
    }

    #[tokio::test]
    async fn iteration_limit_aborts_with_notice() {
        let looping: Vec<_> = (0..10)
            .map(|i| Ok(ChatResponse::tool_calls_only(vec![echo_call(&format!("c{}", i))])))
            .collect();
        let rt = runtime(Scripted::new(looping), 3).await;
        let msg = InboundMessage::user("cli", "direct", "me", "loop");
        let report = rt.run_turn(&msg, &rt.tool_context(&msg)).await;
        assert_eq!(report.outcome, TurnOutcome::Aborted(AbortReason::IterationLimit));
        assert_eq!(report.iterations, 3);
        let session = rt.sessions().get("cli:direct").await.unwrap();
        assert_eq!(session.iteration, 3);
        let last = session.messages.last().unwrap();
        assert_eq!(last.role, "assistant");
        assert!(last.content.contains("stopped after 3 rounds"));
    }

    #[tokio::test]
    async fn zero_iteration_limit_allows_exactly_one_round() {
        let looping: Vec<_> = (0..5)
            .map(|i| Ok(ChatResponse::tool_calls_only(vec![echo_call(&format!("c{}", i))])))
            .collect();
        let backend = Scripted::new(looping);
        let rt = runtime(backend.clone(), 0).await;
        assert_eq!(rt.settings().max_iterations, 1);
        let msg = InboundMessage::user("cli", "direct", "me", "loop");
        let report = rt.run_turn(&msg, &rt.tool_context(&msg)).await;
        assert_eq!(report.outcome, TurnOutcome::Aborted(AbortReason::IterationLimit));
        assert_eq!(report.iterations, 1);
        assert_eq!(report.tool_calls, 1);
        assert_eq!(backend.seen.lock().unwrap().len(), 1);
        assert!(report.reply.contains("stopped after 1 rounds"));
    }

    #[tokio::test]
    async fn provider_error_apologizes_and_keeps_transcript() {
        let rt = runtime(Scripted::new(vec![Err(LlmError::Api("boom".to_string()))]), 5).await;
        let msg = InboundMessage::user("cli", "direct", "me", "hi");
        let report = rt.run_turn(&msg, &rt.tool_context(&msg)).await;
        assert!(matches!(report.outcome, TurnOutcome::Aborted(AbortReason::Provider(_))));
        assert!(report.reply.starts_with("Sorry, I encountered an error"));
        let session = rt.sessions().get("cli:direct").await.unwrap();
        assert_eq!(session.messages.len(), 1);
        assert!(session.messages[0].is_user());
    }

    #[tokio::test]
    async fn empty_final_answer_gets_placeholder() {
        let rt = runtime(Scripted::new(vec![Ok(ChatResponse::text("   "))]), 5).await;
        let msg = InboundMessage::user("cli", "direct", "me", "hi");
        let report = rt.run_turn(&msg, &rt.tool_context(&msg)).await;
        assert_eq!(report.reply, EMPTY_REPLY);
    }

    #[tokio::test]
    async fn cancelled_runtime_aborts_before_model_call() {
        let backend = Scripted::new(vec![]);
        let token = CancellationToken::new();
        let rt = runtime(backend.clone(), 5).await.with_shutdown(token.clone());
        token.cancel();
        let msg = InboundMessage::user("cli", "direct", "me", "hi");
        let report = rt.run_turn(&msg, &rt.tool_context(&msg)).await;
        assert_eq!(report.outcome, TurnOutcome::Aborted(AbortReason::Cancelled));
        assert!(backend.seen.lock().unwrap().is_empty());
    }
}
