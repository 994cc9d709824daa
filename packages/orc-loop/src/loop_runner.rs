//! Drives a single job from first prompt to terminal result (§4.2): the
//! runner owns every side effect (store round-trips, provider calls, tool
//! dispatch, health probes) while [`crate::state_machine::LoopStateMachine`]
//! makes the pure state-transition decisions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use orc_engine::{Machine, OrchestratorError};
use orc_providers::{ContentBlock, ExecuteRequest, Message, ProviderHandler, Role};
use orc_store::{
    ApiDefinitionStore, Job, JobMessage, JobStatus, JobStore, LogStore, LogType, MessageRole,
    MessageStore, Session, SessionStore,
};
use orc_tools::{ToolContext, ToolRegistry};
use uuid::Uuid;

use crate::prompt::{build_initial_prompt, build_system_prompt};
use crate::state_machine::{FinalizeReason, LoopCommand, LoopEvent, LoopStateMachine};
use crate::truncation::{apply_cache_breakpoints, prune_screenshots, TokenCounter};

/// The sandbox health gate (§4.2 "Target health gate"). Abstracted behind a
/// trait so tests never make a real HTTP call, the same shape as
/// `orc-session`'s `ContainerManager`.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, container_ip: &str) -> bool;
}

pub struct ReqwestHealthProbe {
    client: reqwest::Client,
}

impl ReqwestHealthProbe {
    pub fn new() -> Self {
        Self { client: reqwest::Client::builder().timeout(Duration::from_secs(5)).build().unwrap_or_default() }
    }
}

impl Default for ReqwestHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for ReqwestHealthProbe {
    async fn probe(&self, container_ip: &str) -> bool {
        match self.client.get(format!("http://{container_ip}:8088/health")).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub only_n_most_recent_images: usize,
    pub min_removal_threshold: usize,
    pub default_token_limit: i64,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt_suffix: Option<String>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            only_n_most_recent_images: 3,
            min_removal_threshold: 10,
            default_token_limit: 200_000,
            max_tokens: 4096,
            temperature: 0.0,
            system_prompt_suffix: None,
        }
    }
}

pub struct LoopRunner {
    jobs: Arc<dyn JobStore>,
    messages: Arc<dyn MessageStore>,
    logs: Arc<dyn LogStore>,
    sessions: Arc<dyn SessionStore>,
    api_definitions: Arc<dyn ApiDefinitionStore>,
    handler: Arc<dyn ProviderHandler>,
    tools: Arc<ToolRegistry>,
    health: Arc<dyn HealthProbe>,
    config: LoopConfig,
    model: String,
}

impl LoopRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn JobStore>,
        messages: Arc<dyn MessageStore>,
        logs: Arc<dyn LogStore>,
        sessions: Arc<dyn SessionStore>,
        api_definitions: Arc<dyn ApiDefinitionStore>,
        handler: Arc<dyn ProviderHandler>,
        tools: Arc<ToolRegistry>,
        health: Arc<dyn HealthProbe>,
        config: LoopConfig,
        model: String,
    ) -> Self {
        Self { jobs, messages, logs, sessions, api_definitions, handler, tools, health, config, model }
    }

    /// Runs `job_id` until it reaches a terminal or `paused` status,
    /// persisting every message, log line, and status transition along the
    /// way. Never returns `Err` for a job-level failure (§7 "Propagation
    /// policy") — only for store/infrastructure errors the scheduler must see.
    pub async fn run_job(&self, job_id: Uuid) -> Result<(), OrchestratorError> {
        let job = self.jobs.get(job_id).await?.ok_or_else(|| OrchestratorError::Validation(format!("job {job_id} not found")))?;

        let version = self.resolve_version(&job).await?;
        let session = match job.session_id {
            Some(id) => self.sessions.get(id).await?,
            None => None,
        };

        let mut stored = self.messages.list_for_job(job_id).await?;
        if stored.is_empty() {
            let prompt_text = build_initial_prompt(&job.api_name, &version, &job.parameters, Utc::now());
            let msg = self.messages.append(job_id, MessageRole::User, serde_json::json!([ContentBlock::text(prompt_text)])).await?;
            stored.push(msg);
            self.logs.append(job_id, LogType::System, "initial prompt constructed".to_string()).await?;
        }

        let system_prompt = build_system_prompt(Utc::now(), self.config.system_prompt_suffix.as_deref());
        let response_schema = orc_tools::schema::infer_schema(&version.response_example);
        let tool_defs = self.tool_definitions();

        let mut machine = LoopStateMachine::new();
        let mut extraction_recorded = false;
        let mut last_result: Option<serde_json::Value> = None;
        let mut token_counter = TokenCounter::new();
        let token_limit = self.config.default_token_limit;

        let pending_tool_use = trailing_pending_tool_use(&stored);
        let mut cmd = machine.decide(&LoopEvent::HistoryLoaded { pending_tool_use: pending_tool_use.is_some() });
        let mut pending_tool_uses: Vec<ContentBlock> = pending_tool_use.unwrap_or_default();

        loop {
            match cmd {
                Some(LoopCommand::CallProvider) => {
                    if self.jobs.is_cancel_requested(job_id).await? {
                        self.finalize_cancel(&job).await?;
                        return Ok(());
                    }

                    let mut history = decode_history(&self.messages.list_for_job(job_id).await?);
                    prune_screenshots(&mut history, self.config.only_n_most_recent_images, self.config.min_removal_threshold);
                    apply_cache_breakpoints(&mut history);

                    let request = ExecuteRequest {
                        history: &history,
                        system: &system_prompt,
                        tools: &tool_defs,
                        model: &self.model,
                        max_tokens: self.config.max_tokens,
                        temperature: self.config.temperature,
                    };

                    let response = match self.handler.execute(request).await {
                        Ok(response) => response,
                        Err(e) => {
                            tracing::warn!(job_id = %job_id, error = %e, "provider call failed");
                            self.terminate(&job, JobStatus::Error, Some(format!("transient provider failure: {e}")), None).await?;
                            return Ok(());
                        }
                    };

                    let total = token_counter.accumulate(&response.usage);
                    self.logs.append(job_id, LogType::HttpExchange, format!("provider exchange, running total {total} tokens")).await?;
                    if token_counter.exceeds(token_limit) {
                        self.terminate(&job, JobStatus::Error, Some("exceeded token limit".to_string()), None).await?;
                        return Ok(());
                    }

                    let tool_use_count = response.content.iter().filter(|b| b.is_tool_use()).count();
                    pending_tool_uses = response.content.iter().filter(|b| b.is_tool_use()).cloned().collect();

                    self.messages.append(job_id, MessageRole::Assistant, serde_json::to_value(&response.content).unwrap_or_default()).await?;

                    cmd = machine.decide(&LoopEvent::ProviderResponded { stop_reason: response.stop_reason, tool_use_count });
                }
                Some(LoopCommand::PersistAssistant) => {
                    // The assistant message was already appended as part of
                    // `CallProvider`'s side effects; this state exists so the
                    // decision function stays pure and symmetric with §4.2.
                    cmd = machine.decide(&LoopEvent::AssistantPersisted { extraction_recorded });
                }
                Some(LoopCommand::ExecuteTools) => {
                    let Some(session) = session.clone() else {
                        self.terminate(&job, JobStatus::Error, Some("no session bound to job".to_string()), None).await?;
                        return Ok(());
                    };

                    let mut any_blocking = false;
                    for block in pending_tool_uses.drain(..) {
                        let ContentBlock::ToolUse { id, name, input, .. } = block else { continue };

                        if let Some(ip) = &session.container_ip {
                            if !self.health.probe(ip).await {
                                self.terminate(&job, JobStatus::Paused, Some("Target Health Check Failed".to_string()), None).await?;
                                self.logs.append(job_id, LogType::Error, "Target Health Check Failed".to_string()).await?;
                                return Ok(());
                            }
                        } else {
                            self.terminate(&job, JobStatus::Paused, Some("Target Health Check Failed".to_string()), None).await?;
                            return Ok(());
                        }

                        let ctx = ToolContext { container_ip: session.container_ip.clone(), response_schema: Some(response_schema.clone()) };
                        let result = self.tools.dispatch_with(&name, input.clone(), &ctx).await;
                        self.logs.append(job_id, LogType::ToolUse, format!("{name} -> {result:?}")).await?;

                        let result_content = if let Some(text) = &result.output {
                            vec![ContentBlock::text(text.clone())]
                        } else {
                            Vec::new()
                        };
                        let tool_result = ContentBlock::tool_result(id.clone(), result_content, result.error.clone());
                        self.messages.append(job_id, MessageRole::User, serde_json::json!([tool_result])).await?;

                        if name == "ui_not_as_expected" {
                            let reasoning = result.output.clone().unwrap_or_default();
                            self.terminate(&job, JobStatus::Paused, Some("UI Mismatch Detected".to_string()), Some(serde_json::json!({"reasoning": reasoning}))).await?;
                            any_blocking = true;
                            break;
                        }

                        if name == "extraction" && result.error.is_none() {
                            extraction_recorded = true;
                            let data = input.get("data").cloned().unwrap_or_else(|| input.clone());
                            last_result = Some(data.get("result").cloned().unwrap_or(data));
                        }

                        if self.jobs.is_cancel_requested(job_id).await? {
                            self.finalize_cancel(&job).await?;
                            return Ok(());
                        }
                    }

                    cmd = machine.decide(&LoopEvent::ToolsExecuted { any_blocking });
                }
                Some(LoopCommand::CheckCancel) => {
                    let cancel_requested = self.jobs.is_cancel_requested(job_id).await?;
                    cmd = machine.decide(&LoopEvent::CancelChecked { cancel_requested });
                }
                Some(LoopCommand::Finalize(FinalizeReason::Success)) => {
                    self.terminate(&job, JobStatus::Success, None, last_result.clone()).await?;
                    return Ok(());
                }
                Some(LoopCommand::Finalize(FinalizeReason::NoExtraction)) => {
                    self.terminate(&job, JobStatus::Error, Some("Model ended its turn without providing any extractions".to_string()), None).await?;
                    return Ok(());
                }
                Some(LoopCommand::Finalize(FinalizeReason::Blocking)) => {
                    return Ok(());
                }
                Some(LoopCommand::Finalize(FinalizeReason::Canceled)) => {
                    self.finalize_cancel(&job).await?;
                    return Ok(());
                }
                None => return Ok(()),
            }
        }
    }

    async fn resolve_version(&self, job: &Job) -> Result<orc_store::ApiDefinitionVersion, OrchestratorError> {
        if let Some(id) = job.api_definition_version_id {
            return self.api_definitions.get_version(id).await?.ok_or_else(|| OrchestratorError::Validation(format!("api definition version {id} not found")));
        }
        let def = self
            .api_definitions
            .get_by_name(&job.api_name)
            .await?
            .ok_or_else(|| OrchestratorError::Validation(format!("unknown API {}", job.api_name)))?;
        self.api_definitions
            .get_active_version(def.id)
            .await?
            .ok_or_else(|| OrchestratorError::Validation(format!("API {} has no active version", job.api_name)))
    }

    fn tool_definitions(&self) -> Vec<orc_providers::ToolDefinition> {
        self.tools
            .definitions()
            .into_iter()
            .map(|(name, description, input_schema)| orc_providers::ToolDefinition { name, description, input_schema })
            .collect()
    }

    async fn terminate(&self, job: &Job, status: JobStatus, error: Option<String>, result: Option<serde_json::Value>) -> Result<(), OrchestratorError> {
        tracing::info!(job_id = %job.id, status = ?status, error = error.as_deref(), "sampling loop finished");
        self.jobs.terminate(job.id, status, error, result).await?;
        Ok(())
    }

    /// §5 "Cancellation": pre-run jobs are `canceled`, in-flight jobs become
    /// `error` with the literal interruption message.
    async fn finalize_cancel(&self, job: &Job) -> Result<(), OrchestratorError> {
        match job.status {
            JobStatus::Queued | JobStatus::Pending => self.terminate(job, JobStatus::Canceled, None, None).await,
            _ => self.terminate(job, JobStatus::Error, Some("Job was interrupted by user".to_string()), None).await,
        }
    }
}

/// Converts persisted messages (each a role plus a JSON content array) into
/// the canonical `Message` list the provider handler expects.
fn decode_history(stored: &[JobMessage]) -> Vec<Message> {
    stored
        .iter()
        .map(|m| {
            let role = match m.role {
                MessageRole::User => Role::User,
                MessageRole::Assistant => Role::Assistant,
            };
            let content: Vec<ContentBlock> = serde_json::from_value(m.message_content.clone()).unwrap_or_default();
            Message { role, content }
        })
        .collect()
}

/// §4.2 "Resumption invariant": if the last persisted message is an
/// assistant turn whose final block is `tool_use`, those calls were never
/// executed before the crash. Returns them so the runner can resume
/// directly into `ExecuteTools`.
fn trailing_pending_tool_use(stored: &[JobMessage]) -> Option<Vec<ContentBlock>> {
    let last = stored.last()?;
    if last.role != MessageRole::Assistant {
        return None;
    }
    let content: Vec<ContentBlock> = serde_json::from_value(last.message_content.clone()).ok()?;
    if content.last()?.is_tool_use() {
        Some(content.into_iter().filter(|b| b.is_tool_use()).collect())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use orc_providers::{ExecuteResponse, HandlerError, Provider, StopReason, Usage};
    use orc_store::memory::MemoryStore;
    use orc_store::{ApiDefinition, ApiDefinitionVersion, JobStatus, SessionState};
    use orc_tools::{ExtractionTool, UiNotAsExpectedTool};

    use super::*;

    struct FakeProviderHandler {
        responses: StdMutex<VecDeque<ExecuteResponse>>,
    }

    impl FakeProviderHandler {
        fn new(responses: Vec<ExecuteResponse>) -> Self {
            Self { responses: StdMutex::new(responses.into_iter().collect()) }
        }
    }

    #[async_trait]
    impl ProviderHandler for FakeProviderHandler {
        fn provider(&self) -> Provider {
            Provider::Anthropic
        }

        async fn execute(&self, _request: ExecuteRequest<'_>) -> Result<ExecuteResponse, HandlerError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| HandlerError::Decode("fixture exhausted its scripted responses".to_string()))
        }
    }

    fn response(content: Vec<ContentBlock>, stop_reason: StopReason) -> ExecuteResponse {
        ExecuteResponse { content, stop_reason, usage: Usage::default() }
    }

    struct FakeHealthProbe {
        healthy: bool,
    }

    #[async_trait]
    impl HealthProbe for FakeHealthProbe {
        async fn probe(&self, _container_ip: &str) -> bool {
            self.healthy
        }
    }

    /// Builds a target-less fixture: a `ready` session with a container IP,
    /// an active "sum" API version, and a job already bound to the session.
    async fn fixture() -> (Arc<MemoryStore>, Job) {
        let store = Arc::new(MemoryStore::new());
        let target_id = Uuid::new_v4();

        let mut session = store.create_initializing(target_id).await.unwrap();
        session.state = SessionState::Ready;
        session.container_id = Some("c1".to_string());
        session.container_ip = Some("10.0.0.5".to_string());
        store.update(&session).await.unwrap();

        let def = ApiDefinition { id: Uuid::new_v4(), name: "sum".to_string(), description: "adds two numbers".to_string(), is_archived: false };
        let version = ApiDefinitionVersion {
            id: Uuid::new_v4(),
            api_definition_id: def.id,
            version_number: 1,
            parameters: vec![],
            prompt: "Add {{a}} and {{b}}.".to_string(),
            prompt_cleanup: String::new(),
            response_example: serde_json::json!({"sum": 0}),
            is_active: true,
        };
        store.insert_api_definition(def, version);

        let job = store.enqueue(target_id, "sum".to_string(), serde_json::json!({"a": 2, "b": 3})).await.unwrap();
        store.bind_session(job.id, session.id).await.unwrap();
        let job = orc_store::JobStore::get(store.as_ref(), job.id).await.unwrap().unwrap();
        (store, job)
    }

    fn tool_registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(ExtractionTool));
        registry.register(Box::new(UiNotAsExpectedTool));
        Arc::new(registry)
    }

    fn runner(store: &Arc<MemoryStore>, handler: FakeProviderHandler, healthy: bool) -> LoopRunner {
        LoopRunner::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(handler),
            tool_registry(),
            Arc::new(FakeHealthProbe { healthy }),
            LoopConfig::default(),
            "test-model".to_string(),
        )
    }

    #[tokio::test]
    async fn happy_path_extraction_succeeds_with_the_result_field() {
        let (store, job) = fixture().await;
        let handler = FakeProviderHandler::new(vec![
            response(
                vec![ContentBlock::tool_use("tu1", "extraction", serde_json::json!({"data": {"result": {"sum": 5}}}))],
                StopReason::ToolUse,
            ),
            response(vec![], StopReason::EndTurn),
        ]);

        runner(&store, handler, true).run_job(job.id).await.unwrap();

        let job = orc_store::JobStore::get(store.as_ref(), job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.result, Some(serde_json::json!({"sum": 5})));

        let messages = orc_store::MessageStore::list_for_job(store.as_ref(), job.id).await.unwrap();
        let assistant_count = messages.iter().filter(|m| m.role == MessageRole::Assistant).count();
        let tool_result_count = messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .filter(|m| serde_json::from_value::<Vec<ContentBlock>>(m.message_content.clone()).unwrap_or_default().iter().any(|b| matches!(b, ContentBlock::ToolResult { .. })))
            .count();
        assert_eq!(assistant_count, 2);
        assert_eq!(tool_result_count, 1);
    }

    #[tokio::test]
    async fn ui_mismatch_pauses_the_job_without_finishing() {
        let (store, job) = fixture().await;
        let handler = FakeProviderHandler::new(vec![response(
            vec![ContentBlock::tool_use("tu1", "ui_not_as_expected", serde_json::json!({"reasoning": "Login form not visible"}))],
            StopReason::ToolUse,
        )]);

        runner(&store, handler, true).run_job(job.id).await.unwrap();

        let job = orc_store::JobStore::get(store.as_ref(), job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Paused);
        assert_eq!(job.error.as_deref(), Some("UI Mismatch Detected"));
    }

    #[tokio::test]
    async fn failing_health_probe_pauses_before_dispatching_any_tool() {
        let (store, job) = fixture().await;
        let handler = FakeProviderHandler::new(vec![response(
            vec![ContentBlock::tool_use("tu1", "extraction", serde_json::json!({"data": {"result": {"sum": 5}}}))],
            StopReason::ToolUse,
        )]);

        runner(&store, handler, false).run_job(job.id).await.unwrap();

        let job = orc_store::JobStore::get(store.as_ref(), job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Paused);
        assert_eq!(job.error.as_deref(), Some("Target Health Check Failed"));
    }

    #[tokio::test]
    async fn a_trailing_unexecuted_tool_use_resumes_straight_into_execute_tools() {
        let (store, job) = fixture().await;
        orc_store::MessageStore::append(store.as_ref(), job.id, MessageRole::User, serde_json::json!([ContentBlock::text("Add 2 and 3.")])).await.unwrap();
        orc_store::MessageStore::append(
            store.as_ref(),
            job.id,
            MessageRole::Assistant,
            serde_json::json!([ContentBlock::tool_use("tu1", "extraction", serde_json::json!({"data": {"result": {"sum": 5}}}))]),
        )
        .await
        .unwrap();

        // Only one scripted response: if the runner incorrectly re-called the
        // provider before executing the pending tool use, this would be its
        // second call and the fixture would return an error instead.
        let handler = FakeProviderHandler::new(vec![response(vec![], StopReason::EndTurn)]);

        runner(&store, handler, true).run_job(job.id).await.unwrap();

        let job = orc_store::JobStore::get(store.as_ref(), job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.result, Some(serde_json::json!({"sum": 5})));

        let messages = orc_store::MessageStore::list_for_job(store.as_ref(), job.id).await.unwrap();
        // No fresh initial prompt was appended on top of the two seeded messages.
        assert!(messages.iter().filter(|m| m.role == MessageRole::User && m.sequence == 1).count() == 1);
    }

    #[tokio::test]
    async fn exceeding_the_token_budget_errors_the_job_without_persisting_the_response() {
        let (store, job) = fixture().await;
        let handler = FakeProviderHandler::new(vec![ExecuteResponse {
            content: vec![ContentBlock::text("thinking...")],
            stop_reason: StopReason::MaxTokens,
            usage: Usage { input_tokens: 500_000, output_tokens: 0, cache_creation_input_tokens: 0, cache_read_input_tokens: 0 },
        }]);

        let mut config = LoopConfig::default();
        config.default_token_limit = 1_000;
        let runner = LoopRunner::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(handler),
            tool_registry(),
            Arc::new(FakeHealthProbe { healthy: true }),
            config,
            "test-model".to_string(),
        );

        runner.run_job(job.id).await.unwrap();

        let job = orc_store::JobStore::get(store.as_ref(), job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("exceeded token limit"));

        let messages = orc_store::MessageStore::list_for_job(store.as_ref(), job.id).await.unwrap();
        assert!(messages.iter().all(|m| m.role != MessageRole::Assistant));
    }

    #[tokio::test]
    async fn unbound_job_pauses_instead_of_dispatching_tools() {
        let store = Arc::new(MemoryStore::new());
        let target_id = Uuid::new_v4();
        let def = ApiDefinition { id: Uuid::new_v4(), name: "sum".to_string(), description: String::new(), is_archived: false };
        let version = ApiDefinitionVersion {
            id: Uuid::new_v4(),
            api_definition_id: def.id,
            version_number: 1,
            parameters: vec![],
            prompt: "Add {{a}} and {{b}}.".to_string(),
            prompt_cleanup: String::new(),
            response_example: serde_json::json!({"sum": 0}),
            is_active: true,
        };
        store.insert_api_definition(def, version);
        let job = store.enqueue(target_id, "sum".to_string(), serde_json::json!({"a": 1, "b": 1})).await.unwrap();

        let handler = FakeProviderHandler::new(vec![response(
            vec![ContentBlock::tool_use("tu1", "extraction", serde_json::json!({"data": {"result": {"sum": 2}}}))],
            StopReason::ToolUse,
        )]);

        runner(&store, handler, true).run_job(job.id).await.unwrap();

        let job = orc_store::JobStore::get(store.as_ref(), job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("no session bound to job"));
    }
}
