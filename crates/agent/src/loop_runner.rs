//! The agent's autonomous thinking loop.
//!
//! Loop shape:
//!   while RUNNING:
//!     1. RELOAD   — fetch the session row (pause/abort are observed here)
//!     2. RETRIEVE — top-K relevant tools for the current intent
//!     3. THINK    — stream the LLM response, pushing tokens to the topic
//!     4. DECIDE   — tool calls? → ACT and loop; final answer? → DONE
//!     5. ACT      — execute tool(s), append assistant + results in one go
//!     6. PERSIST  — save iteration count to the session row
//!     7. CHECK    — guard against infinite loops (max iterations)
//!
//! Memory integration:
//!   - the model calls `recall_memory` when it wants past facts
//!   - the model calls `store_memory` for stable long-term facts (with
//!     per-session dedup so it cannot spam the store)
//!   - noteworthy tool results become EPISODIC memories automatically
//!   - the final answer becomes a SEMANTIC memory with high importance

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use agentforge_config::AgentConfig;
use agentforge_core::caller::ChatCaller;
use agentforge_core::error::Error;
use agentforge_core::event::{AgentEvent, EventPublisher};
use agentforge_core::keys::ProviderConfig;
use agentforge_core::memory::{MemoryRecord, MemoryType};
use agentforge_core::message::{ChatMessage, ChatRequest, Role, ToolCall};
use agentforge_core::session::{Session, SessionStatus};
use agentforge_core::tool::ToolDefinition;
use agentforge_memory::MemoryService;
use agentforge_providers::{KeyResolver, LlmClient};
use agentforge_store::{ContextStore, SessionStore};
use agentforge_tools::{ToolExecutor, ToolIndex, ToolRegistry, BUILTIN_RECALL_MEMORY, BUILTIN_STORE_MEMORY};

/// The three user-visible steps every session walks through.
const EXECUTION_PLAN: [&str; 3] = ["recall", "think-and-act", "answer"];

const BASE_SYSTEM_PROMPT: &str = "\
You are an autonomous AI agent with access to tools. Think step by step and decide for yourself when to use which tool.

Tools (use only when you judge it helps):
- recall_memory: search long-term memory by query (e.g. user name, preferences, past facts). Use when the user's question might be answered from something you stored before.
- store_memory: save a fact for future sessions. Use at most once per distinct, important fact; then reply in natural language.

Memory writing rules (VERY IMPORTANT):
- When calling store_memory, ALWAYS rewrite the fact into a clear, third-person sentence with an explicit subject.
  For example: \"用户的名字是 Zed\", \"智能体的名字是 Forge\", \"用户是 Java 后端开发人员\".
- NEVER store ambiguous first-person sentences like \"我的名字是 Forge\", \"I am a Java developer\", \"我是 Java 开发\".
  Before storing, rewrite them so that it is clear whether the fact is about the USER or about the ASSISTANT.
- If a fact is about the user, use \"用户…\" / \"the user…\". If it is about you (the assistant), use \"智能体…\" / \"the assistant…\".

When you can answer directly, reply in natural language without calling tools. Be concise. Think out loud as you reason.";

/// Loop tuning knobs.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_iterations: i32,
    pub top_k_tools: usize,
    /// Prefix length for same-topic store_memory deduplication.
    pub store_memory_prefix_len: usize,
    /// Poll interval while a session sits in PAUSED.
    pub resume_poll: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            top_k_tools: 12,
            store_memory_prefix_len: 15,
            resume_poll: Duration::from_millis(2000),
        }
    }
}

impl From<&AgentConfig> for LoopSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            top_k_tools: config.top_k_tools,
            store_memory_prefix_len: config.store_memory_prefix_len,
            resume_poll: Duration::from_millis(config.resume_poll_ms),
        }
    }
}

/// Builds a chat caller for a user's own LLM config. Swappable for tests.
pub type CallerFactory = Arc<dyn Fn(ProviderConfig) -> Arc<dyn ChatCaller> + Send + Sync>;

pub fn default_caller_factory() -> CallerFactory {
    Arc::new(|config| Arc::new(LlmClient::new(config)))
}

pub struct AgentLoop {
    sessions: Arc<SessionStore>,
    context: Arc<ContextStore>,
    publisher: Arc<EventPublisher>,
    /// System primary/fallback routing stack.
    router: Arc<dyn ChatCaller>,
    key_resolver: Arc<KeyResolver>,
    memory: Arc<MemoryService>,
    tool_index: Arc<ToolIndex>,
    registry: Arc<ToolRegistry>,
    executor: Arc<ToolExecutor>,
    settings: LoopSettings,
    caller_factory: CallerFactory,
    /// Per-session normalized store_memory contents, to stop the model
    /// from writing the same fact in a loop. Process-local soft state:
    /// losing it on restart costs at worst a redundant store.
    stored_memories: Mutex<HashMap<String, HashSet<String>>>,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<SessionStore>,
        context: Arc<ContextStore>,
        publisher: Arc<EventPublisher>,
        router: Arc<dyn ChatCaller>,
        key_resolver: Arc<KeyResolver>,
        memory: Arc<MemoryService>,
        tool_index: Arc<ToolIndex>,
        registry: Arc<ToolRegistry>,
        executor: Arc<ToolExecutor>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            sessions,
            context,
            publisher,
            router,
            key_resolver,
            memory,
            tool_index,
            registry,
            executor,
            settings,
            caller_factory: default_caller_factory(),
            stored_memories: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_caller_factory(mut self, factory: CallerFactory) -> Self {
        self.caller_factory = factory;
        self
    }

    /// Entry point: run one session to completion. Never panics the task;
    /// any error marks the session FAILED with an ERROR event.
    pub async fn run(&self, session: Session) {
        let session_id = session.session_id.clone();
        info!(%session_id, task = %session.task_description, "loop started");

        if let Err(e) = self.execute(session).await {
            error!(%session_id, error = %e, "loop failed");
            let iteration = self
                .sessions
                .find_by_session_id(&session_id)
                .await
                .ok()
                .flatten()
                .map(|s| s.iteration_count)
                .unwrap_or(0);
            self.publisher
                .publish(AgentEvent::error(&session_id, &e.to_string(), iteration));
            if let Ok(Some(current)) = self.sessions.find_by_session_id(&session_id).await {
                if !current.is_terminal() {
                    if let Err(fail_err) = self.fail_session(&current, &e.to_string()).await {
                        error!(%session_id, error = %fail_err, "failed to mark session FAILED");
                    }
                }
            }
        }

        // The dedup set is per-run soft state.
        self.stored_memories.lock().remove(&session_id);
    }

    async fn execute(&self, session: Session) -> Result<(), Error> {
        let session_id = session.session_id.clone();

        let session = self
            .sessions
            .update_by_id(session.id, |s| s.status = SessionStatus::Running)
            .await?;
        self.publisher
            .publish(AgentEvent::status_change(&session_id, "RUNNING"));

        let caller = self.build_caller(&session).await?;
        let user_id = session.user_id;

        // ── Publish the plan ────────────────────────────────────────────
        self.publisher
            .publish(AgentEvent::plan_ready(&session_id, &EXECUTION_PLAN));
        let plan_json = serde_json::to_string(&EXECUTION_PLAN)?;
        let session = self
            .sessions
            .update_by_id(session.id, move |s| s.current_plan = Some(plan_json.clone()))
            .await?;

        // ── Step 1: recall ──────────────────────────────────────────────
        self.publisher
            .publish(AgentEvent::step_start(&session_id, 1, EXECUTION_PLAN[0]));
        let existing = self.context.load(&session);
        if existing.is_empty() {
            self.context
                .initialize(
                    &session,
                    vec![
                        ChatMessage::system(BASE_SYSTEM_PROMPT),
                        ChatMessage::user(&session.task_description),
                    ],
                )
                .await?;
        } else {
            debug!(%session_id, messages = existing.len(), "resuming with existing context");
        }
        self.publisher.publish(AgentEvent::step_complete(
            &session_id,
            1,
            EXECUTION_PLAN[0],
            "已回忆并注入上下文",
        ));

        // ── Step 2: think and act ───────────────────────────────────────
        self.publisher
            .publish(AgentEvent::step_start(&session_id, 2, EXECUTION_PLAN[1]));
        let final_answer = self.run_think_and_act(&session, &caller, user_id).await?;
        let last_iteration = self
            .sessions
            .find_by_session_id(&session_id)
            .await?
            .map(|s| s.iteration_count)
            .unwrap_or(0);
        self.publisher.publish(AgentEvent::step_complete(
            &session_id,
            2,
            EXECUTION_PLAN[1],
            if final_answer.is_some() { "完成推理" } else { "达到最大迭代次数" },
        ));

        // ── Step 3: answer ──────────────────────────────────────────────
        self.publisher
            .publish(AgentEvent::step_start(&session_id, 3, EXECUTION_PLAN[2]));
        let session = self
            .sessions
            .find_by_session_id(&session_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("session vanished: {session_id}")))?;

        match final_answer {
            Some(answer) => {
                let answer_for_row = answer.clone();
                self.sessions
                    .update_by_id(session.id, move |s| {
                        s.result = Some(answer_for_row.clone());
                        s.status = SessionStatus::Completed;
                    })
                    .await?;
                self.publisher.publish(AgentEvent::step_complete(
                    &session_id,
                    3,
                    EXECUTION_PLAN[2],
                    &answer,
                ));
                self.publisher
                    .publish(AgentEvent::final_answer(&session_id, &answer, last_iteration));
                self.publisher
                    .publish(AgentEvent::status_change(&session_id, "COMPLETED"));
                self.store_completion_memory(&session_id, &session.task_description, &answer, user_id)
                    .await;
                info!(%session_id, "completed");
            }
            None => {
                self.publisher.publish(AgentEvent::step_complete(
                    &session_id,
                    3,
                    EXECUTION_PLAN[2],
                    "未得到最终回答",
                ));
                self.publisher.publish(AgentEvent::error(
                    &session_id,
                    "Max iterations reached",
                    last_iteration,
                ));
                let reason = format!(
                    "Max iterations ({}) reached without final answer.",
                    self.settings.max_iterations
                );
                self.fail_session(&session, &reason).await?;
            }
        }
        Ok(())
    }

    /// Inner loop: think (stream) → tool calls or final answer.
    /// Returns the final answer text, or None when the iteration budget
    /// runs out or the session leaves RUNNING.
    async fn run_think_and_act(
        &self,
        session: &Session,
        caller: &Arc<dyn ChatCaller>,
        user_id: Option<i64>,
    ) -> Result<Option<String>, Error> {
        let session_id = session.session_id.clone();
        loop {
            // Reload every iteration: pause/abort handlers write this row.
            let session = self
                .sessions
                .find_by_session_id(&session_id)
                .await?
                .ok_or_else(|| Error::Internal(format!("session vanished: {session_id}")))?;

            if session.status == SessionStatus::Paused {
                info!(%session_id, "paused, waiting for resume");
                self.wait_for_resume(&session_id).await;
                continue;
            }
            if session.status != SessionStatus::Running {
                return Ok(None);
            }

            let iteration = session.iteration_count + 1;
            self.publisher
                .publish(AgentEvent::iteration_start(&session_id, iteration));

            let context = self.context.load(&session);
            let query_for_tools = last_user_message(&context, &session.task_description);
            let tools = self
                .load_relevant_tools(&query_for_tools, self.settings.top_k_tools, user_id)
                .await;
            let request = ChatRequest::with_tools(
                "",
                context,
                if tools.is_empty() { None } else { Some(tools) },
            );

            let publisher = self.publisher.clone();
            let sid = session_id.clone();
            let on_token = move |token: &str| {
                publisher.publish(AgentEvent::thinking(&sid, token, iteration));
            };
            let response = caller.stream_chat(request, &on_token).await?;

            let assistant = response
                .first_message()
                .cloned()
                .ok_or_else(|| Error::Internal("provider returned no choices".into()))?;

            if assistant.has_tool_calls() {
                let calls = assistant.tool_calls.clone().unwrap_or_default();

                // Collect assistant + every tool result, then append them in
                // ONE store call. A second append would reload the blob the
                // first one wrote from a stale reference, drop the assistant
                // message, and leave the model re-issuing the same calls
                // forever.
                let mut to_append = vec![assistant];
                for call in &calls {
                    self.publisher
                        .publish(AgentEvent::tool_call(&session_id, call, iteration));
                    let output = self.execute_tool(call, &session_id, user_id).await;
                    self.publisher.publish(AgentEvent::tool_result(
                        &session_id,
                        &call.function.name,
                        &output,
                        iteration,
                    ));
                    to_append.push(ChatMessage::tool_result(&call.id, &output));
                    self.maybe_remember_tool_result(&session_id, &call.function.name, &output, user_id)
                        .await;
                }
                self.context.append(&session, to_append).await?;
            } else {
                let answer = assistant.content.unwrap_or_default();
                self.sessions
                    .update_by_id(session.id, move |s| s.iteration_count = iteration)
                    .await?;
                return Ok(Some(answer));
            }

            self.sessions
                .update_by_id(session.id, move |s| s.iteration_count = iteration)
                .await?;

            if iteration >= self.settings.max_iterations {
                warn!(%session_id, max = self.settings.max_iterations, "max iterations reached");
                return Ok(None);
            }
        }
    }

    // ── Caller selection ────────────────────────────────────────────────────

    /// The user's own LLM key gets a direct client (no system routing);
    /// otherwise the system primary/fallback router.
    async fn build_caller(&self, session: &Session) -> Result<Arc<dyn ChatCaller>, Error> {
        match self.key_resolver.resolve_default_llm(session.user_id).await? {
            Some(config) => {
                info!(
                    session_id = %session.session_id,
                    provider = %config.name,
                    model = %config.model,
                    "using user LLM key"
                );
                Ok((self.caller_factory)(config))
            }
            None => {
                info!(session_id = %session.session_id, "no user key found — using system router");
                Ok(self.router.clone())
            }
        }
    }

    // ── Tool retrieval ──────────────────────────────────────────────────────

    /// Tools by semantic relevance to the current query; when the index is
    /// unavailable or returns nothing, all built-in + active tools.
    async fn load_relevant_tools(
        &self,
        query: &str,
        top_k: usize,
        user_id: Option<i64>,
    ) -> Vec<ToolDefinition> {
        let ids = self.tool_index.search_relevant_tools(query, top_k, user_id).await;
        if ids.is_empty() {
            return self.registry.all_definitions().await;
        }
        self.registry.definitions_for_ids(&ids).await
    }

    // ── Tool execution ──────────────────────────────────────────────────────

    async fn execute_tool(&self, call: &ToolCall, session_id: &str, user_id: Option<i64>) -> String {
        let tool_name = &call.function.name;
        let arguments = &call.function.arguments;
        info!(session_id, tool = %tool_name, args = %arguments, "executing tool");

        if tool_name == BUILTIN_RECALL_MEMORY {
            return self.execute_recall_memory(session_id, arguments, user_id).await;
        }
        if tool_name == BUILTIN_STORE_MEMORY {
            return self.execute_store_memory(session_id, arguments).await;
        }
        self.executor.execute(tool_name, arguments, session_id).await
    }

    /// Built-in recall_memory: semantic lookup over long-term memory.
    /// Flow: the model does intent analysis → calls recall_memory with a
    /// query → uses the returned block to answer.
    async fn execute_recall_memory(
        &self,
        session_id: &str,
        arguments: &str,
        user_id: Option<i64>,
    ) -> String {
        let args: serde_json::Value = match serde_json::from_str(arguments) {
            Ok(v) => v,
            Err(e) => return format!("[ToolError] recall_memory failed: {e}"),
        };
        let query = args["query"].as_str().unwrap_or("").trim().to_string();
        if query.is_empty() {
            return "[ToolError] recall_memory requires a non-empty 'query' \
                    (e.g. user's name, user preferences, past topic)."
                .into();
        }
        let top_k = args["top_k"].as_i64().unwrap_or(10).clamp(1, 20) as usize;

        let mut records = self.memory.recall(&query, top_k, user_id).await;
        // If the primary recall path misses (threshold or index quirks),
        // fall back to the same search the browse UI uses so compressed
        // and historical memories still surface.
        if records.is_empty() {
            records = self
                .memory
                .search_memories(&query, top_k, user_id)
                .await
                .into_iter()
                .map(|item| MemoryRecord {
                    content: item.content,
                    memory_type: item.memory_type,
                    session_id: item.session_id,
                    importance: item.importance,
                    score: item.score.unwrap_or(0.0),
                })
                .collect();
        }

        if records.is_empty() {
            return "No relevant memories found for this query. You can answer from \
                    general knowledge or say you don't recall."
                .into();
        }
        debug!(session_id, count = records.len(), "recall_memory hit");
        self.memory
            .format_for_prompt(&records)
            .unwrap_or_else(|| "No relevant memories found.".into())
    }

    /// Built-in store_memory: the model explicitly decides to remember
    /// something. Dedup: normalized exact match plus same-topic prefix, so
    /// repeated store_memory loops die immediately.
    async fn execute_store_memory(&self, session_id: &str, arguments: &str) -> String {
        let args: serde_json::Value = match serde_json::from_str(arguments) {
            Ok(v) => v,
            Err(e) => return format!("[ToolError] store_memory failed: {e}"),
        };
        let content = args["content"].as_str().unwrap_or("").to_string();
        if content.trim().is_empty() {
            return "[ToolError] store_memory called with empty content — skipping.".into();
        }
        let memory_type = MemoryType::parse_or_semantic(args["memory_type"].as_str().unwrap_or("SEMANTIC"));
        let importance = args["importance"].as_f64().unwrap_or(0.8) as f32;

        let normalized = normalize_for_dedupe(&content);
        {
            let mut sessions = self.stored_memories.lock();
            let seen = sessions.entry(session_id.to_string()).or_default();
            if seen.contains(&normalized) {
                return "Memory already stored previously; skipping duplicate.".into();
            }
            let prefix = prefix_of(&normalized, self.settings.store_memory_prefix_len);
            if seen
                .iter()
                .any(|existing| prefix_of(existing, self.settings.store_memory_prefix_len) == prefix)
            {
                debug!(session_id, prefix = %prefix, "store_memory skipped (same-topic prefix)");
                return "Already stored similar content.".into();
            }
            seen.insert(normalized);
        }

        let user_id = self
            .sessions
            .find_by_session_id(session_id)
            .await
            .ok()
            .flatten()
            .and_then(|s| s.user_id);
        self.memory
            .remember(session_id, &content, memory_type, importance, user_id)
            .await;
        "Memory stored successfully.".into()
    }

    // ── Automatic memory capture ────────────────────────────────────────────

    /// Store a tool result as an EPISODIC memory when it looks non-trivial.
    /// store_memory already wrote the real fact; recording its result again
    /// would duplicate the same profile entry on every call.
    async fn maybe_remember_tool_result(
        &self,
        session_id: &str,
        tool_name: &str,
        result: &str,
        user_id: Option<i64>,
    ) {
        if result.starts_with("[STUB]") || result.starts_with("[ToolError]") {
            return;
        }
        if tool_name == BUILTIN_STORE_MEMORY {
            return;
        }
        if result.chars().count() < 50 {
            return;
        }

        let snippet: String = result.chars().take(300).collect();
        let content = format!("Tool '{tool_name}' returned: {snippet}");
        self.memory
            .remember(session_id, &content, MemoryType::Episodic, 0.6, user_id)
            .await;
    }

    /// Store the completed task+answer as a SEMANTIC memory — the primary
    /// mechanism by which the agent learns across sessions.
    async fn store_completion_memory(
        &self,
        session_id: &str,
        task: &str,
        answer: &str,
        user_id: Option<i64>,
    ) {
        let task_snippet: String = task.chars().take(200).collect();
        let answer_snippet: String = answer.chars().take(500).collect();
        let content = format!("Task: {task_snippet}\nAnswer: {answer_snippet}");
        self.memory
            .remember(session_id, &content, MemoryType::Semantic, 0.85, user_id)
            .await;
        debug!(session_id, "stored completion memory");
    }

    // ── Helpers ─────────────────────────────────────────────────────────────

    async fn fail_session(&self, session: &Session, reason: &str) -> Result<Session, Error> {
        let reason = reason.to_string();
        let failed = self
            .sessions
            .update_by_id(session.id, move |s| {
                s.status = SessionStatus::Failed;
                s.error_message = Some(reason.clone());
            })
            .await?;
        self.publisher
            .publish(AgentEvent::status_change(&session.session_id, "FAILED"));
        Ok(failed)
    }

    async fn wait_for_resume(&self, session_id: &str) {
        loop {
            tokio::time::sleep(self.settings.resume_poll).await;
            match self.sessions.find_by_session_id(session_id).await {
                Ok(Some(fresh)) if fresh.status == SessionStatus::Paused => continue,
                _ => return,
            }
        }
    }
}

/// The last non-blank user message, or the task description when the
/// context has none. Used as the query for tool retrieval.
fn last_user_message(context: &[ChatMessage], task_description: &str) -> String {
    context
        .iter()
        .rev()
        .find(|m| m.role == Role::User && m.content.as_deref().is_some_and(|c| !c.trim().is_empty()))
        .and_then(|m| m.content.clone())
        .unwrap_or_else(|| task_description.to_string())
}

fn normalize_for_dedupe(content: &str) -> String {
    content
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn prefix_of(s: &str, max_len: usize) -> String {
    s.chars().take(max_len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_normalization() {
        assert_eq!(normalize_for_dedupe("  Hello   World  "), "hello world");
        assert_eq!(
            normalize_for_dedupe("用户是 Java 开发者"),
            normalize_for_dedupe("  用户是 Java 开发者  ")
        );
        assert_eq!(normalize_for_dedupe("A\tB\nC"), "a b c");
    }

    #[test]
    fn prefix_is_char_safe() {
        assert_eq!(prefix_of("abcdef", 3), "abc");
        assert_eq!(prefix_of("ab", 3), "ab");
        assert_eq!(prefix_of("用户的名字是什么", 3), "用户的");
    }

    #[test]
    fn last_user_message_selection() {
        let context = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("first"),
            ChatMessage::assistant_text("reply"),
            ChatMessage::user("second"),
            ChatMessage::tool_result("c1", "out"),
        ];
        assert_eq!(last_user_message(&context, "task"), "second");
        assert_eq!(last_user_message(&[], "task"), "task");

        // blank user messages are skipped
        let blank = vec![ChatMessage::user("   ")];
        assert_eq!(last_user_message(&blank, "task"), "task");
    }

    #[test]
    fn settings_follow_config() {
        let config = AgentConfig::default();
        let settings = LoopSettings::from(&config);
        assert_eq!(settings.max_iterations, 30);
        assert_eq!(settings.top_k_tools, 12);
        assert_eq!(settings.store_memory_prefix_len, 15);
        assert_eq!(settings.resume_poll, Duration::from_millis(2000));
    }
}
