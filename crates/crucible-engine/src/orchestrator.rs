//! The experiment orchestrator: the step/role/tool-call state machine.
//!
//! One orchestrator owns one experiment's single-threaded control flow
//! and one event bus. The run loop re-fetches the persisted experiment at
//! the top of every iteration; an externally written PAUSE/STOP is
//! observed there and stops the loop cooperatively after the in-flight
//! step finishes. All loop errors force FAILED with the message recorded
//! as the result; nothing at this level retries (retries belong to the
//! provider layer and to hook fail policy).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{error, info, instrument, warn};

use crucible_core::environment::Environment;
use crucible_core::events::{ExperimentEvent, LogSource};
use crucible_core::experiment::{Experiment, ExperimentStatus};
use crucible_core::ids::ExperimentId;
use crucible_core::messages::{ChatMessage, ToolInvocation};
use crucible_core::plan::{Plan, Role};
use crucible_core::stream::ChatEvent;
use crucible_core::tool::{ToolDefinition, ToolRecord};
use crucible_llm::ProviderRouter;
use crucible_sandbox::ContainerPool;
use crucible_store::experiments::ExperimentRepo;
use crucible_store::plans::PlanRepo;
use crucible_store::providers::ProviderRepo;
use crucible_store::tools::ToolRepo;
use crucible_store::Database;

use crate::bus::EventBus;
use crate::errors::EngineError;
use crate::harness;
use crate::hooks;

/// Upper bound on chat turns within one role's processing of one step.
const MAX_TOOL_ITERATIONS: u32 = 5;

/// Everything an orchestrator needs from the outside, injected at
/// construction. Process-wide lifetime is managed by the binary's entry
/// point, not by module statics.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub db: Database,
    pub pool: Arc<ContainerPool>,
    pub router: Arc<ProviderRouter>,
}

#[derive(Clone)]
struct Loaded {
    plan: Arc<Plan>,
    experiment: Arc<Mutex<Experiment>>,
}

enum LoopOutcome {
    Continue,
    Finished,
}

pub struct ExperimentOrchestrator {
    experiment_id: ExperimentId,
    deps: OrchestratorDeps,
    bus: Arc<EventBus>,
    loaded: Mutex<Option<Loaded>>,
    running: AtomicBool,
}

impl ExperimentOrchestrator {
    pub fn new(experiment_id: ExperimentId, deps: OrchestratorDeps) -> Self {
        Self {
            experiment_id,
            deps,
            bus: Arc::new(EventBus::new()),
            loaded: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn experiment_id(&self) -> &ExperimentId {
        &self.experiment_id
    }

    /// The bus live consumers subscribe to (one per experiment, no
    /// cross-experiment leakage).
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Whether the run loop is currently active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn experiments(&self) -> ExperimentRepo {
        ExperimentRepo::new(self.deps.db.clone())
    }

    fn plans(&self) -> PlanRepo {
        PlanRepo::new(self.deps.db.clone())
    }

    fn tools(&self) -> ToolRepo {
        ToolRepo::new(self.deps.db.clone())
    }

    fn providers(&self) -> ProviderRepo {
        ProviderRepo::new(self.deps.db.clone())
    }

    /// Load the experiment and plan, seed the environment from the plan
    /// on a fresh run, and register one bus subscriber per plan script.
    /// Idempotent.
    async fn initialize(&self) -> Result<Loaded, EngineError> {
        if let Some(loaded) = self.loaded.lock().clone() {
            return Ok(loaded);
        }

        let mut experiment = self
            .experiments()
            .find(&self.experiment_id)?
            .ok_or_else(|| EngineError::ExperimentNotFound(self.experiment_id.to_string()))?;
        let plan = self
            .plans()
            .find(&experiment.plan_id)?
            .ok_or_else(|| EngineError::PlanNotFound(experiment.plan_id.to_string()))?;

        if experiment.current_environment.is_empty() && !plan.initial_environment.is_empty() {
            experiment.current_environment = plan.initial_environment.deep_copy();
            self.experiments().update_progress(&experiment)?;
        }

        let loaded = Loaded {
            plan: Arc::new(plan),
            experiment: Arc::new(Mutex::new(experiment)),
        };

        let runner = hooks::make_runner(
            Arc::clone(&self.deps.pool),
            self.experiments(),
            Arc::clone(&loaded.experiment),
            &self.bus,
        );
        let registered = hooks::register_hooks(&self.bus, &loaded.plan.scripts, &runner);
        if registered > 0 {
            info!(
                experiment_id = %self.experiment_id,
                hooks = registered,
                "lifecycle hooks registered"
            );
        }

        *self.loaded.lock() = Some(loaded.clone());
        Ok(loaded)
    }

    /// Start (or resume) execution: set RUNNING, record the start time
    /// only if unset, emit EXPERIMENT_START, and drive the loop to its
    /// end. At most one loop per orchestrator runs at a time.
    #[instrument(skip(self), fields(experiment_id = %self.experiment_id))]
    pub async fn start(&self) -> Result<(), EngineError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Internal(format!(
                "orchestrator already running for {}",
                self.experiment_id
            )));
        }
        let result = self.start_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn start_inner(&self) -> Result<(), EngineError> {
        let loaded = self.initialize().await?;

        let snapshot = {
            let mut experiment = loaded.experiment.lock();
            experiment.status = ExperimentStatus::Running;
            // Resume must not reset elapsed duration.
            if experiment.start_time.is_none() {
                experiment.start_time = Some(Utc::now());
            }
            experiment.clone()
        };
        self.experiments().update(&snapshot)?;

        let start_event = ExperimentEvent::ExperimentStart {
            experiment_id: self.experiment_id.clone(),
            plan_name: loaded.plan.name.clone(),
        };
        if let Err(e) = self.bus.emit(&start_event).await {
            self.fail_with(&loaded, e).await;
            return Ok(());
        }

        info!(plan = %loaded.plan.name, "experiment started");
        self.run_loop(&loaded).await;
        Ok(())
    }

    async fn run_loop(&self, loaded: &Loaded) {
        loop {
            match self.run_iteration(loaded).await {
                Ok(LoopOutcome::Continue) => {}
                Ok(LoopOutcome::Finished) => return,
                Err(e) => {
                    self.fail_with(loaded, e).await;
                    return;
                }
            }
        }
    }

    async fn run_iteration(&self, loaded: &Loaded) -> Result<LoopOutcome, EngineError> {
        // The persisted record is the single source of truth for status;
        // externally issued control commands are observed here.
        let fresh = self
            .experiments()
            .find(&self.experiment_id)?
            .ok_or(EngineError::ExperimentDeleted)?;

        if fresh.status != ExperimentStatus::Running {
            let step = {
                let mut experiment = loaded.experiment.lock();
                experiment.status = fresh.status;
                experiment.current_step
            };
            let _ = self
                .bus
                .emit(&ExperimentEvent::Log {
                    experiment_id: self.experiment_id.clone(),
                    step,
                    source: LogSource::System,
                    message: format!(
                        "Execution stopped: external status change to {}",
                        fresh.status
                    ),
                    data: None,
                })
                .await;
            info!(status = %fresh.status, "loop stopped by external status change");
            return Ok(LoopOutcome::Finished);
        }

        if loaded.experiment.lock().current_step >= loaded.plan.max_steps {
            return Ok(LoopOutcome::Finished);
        }

        self.process_step(loaded).await?;

        if let Some(description) = self.evaluate_goals(loaded).await? {
            self.complete(loaded, description).await?;
            return Ok(LoopOutcome::Finished);
        }

        let snapshot = {
            let mut experiment = loaded.experiment.lock();
            experiment.current_step += 1;
            experiment.clone()
        };

        if snapshot.current_step >= loaded.plan.max_steps {
            self.finish_failed(
                loaded,
                "Max Steps Exceeded".into(),
                "Max Steps Exceeded".into(),
                None,
            )
            .await?;
            return Ok(LoopOutcome::Finished);
        }

        self.experiments().update_progress(&snapshot)?;
        Ok(LoopOutcome::Continue)
    }

    /// One step: STEP_START, every role strictly in plan order, STEP_END
    /// with an environment snapshot. Role order is an ordering guarantee,
    /// not an optimization target.
    async fn process_step(&self, loaded: &Loaded) -> Result<(), EngineError> {
        let step = loaded.experiment.lock().current_step;

        self.bus
            .emit(&ExperimentEvent::StepStart {
                experiment_id: self.experiment_id.clone(),
                step,
            })
            .await?;

        for role in &loaded.plan.roles {
            self.process_role(loaded, role, step).await?;
        }

        let environment_snapshot = loaded.experiment.lock().current_environment.deep_copy();
        self.bus
            .emit(&ExperimentEvent::StepEnd {
                experiment_id: self.experiment_id.clone(),
                step,
                environment_snapshot,
            })
            .await?;
        Ok(())
    }

    #[instrument(skip(self, loaded, role), fields(role = %role.name))]
    async fn process_role(
        &self,
        loaded: &Loaded,
        role: &Role,
        step: u32,
    ) -> Result<(), EngineError> {
        self.bus
            .emit(&ExperimentEvent::RoleStart {
                experiment_id: self.experiment_id.clone(),
                role: role.name.clone(),
            })
            .await?;

        // The role's view of the environment. A non-empty whitelist
        // exposes only the listed keys; empty means full visibility.
        let mut view = loaded
            .experiment
            .lock()
            .current_environment
            .filtered(&role.variable_whitelist);

        let tool_records = self.tools().find_many(&role.tools)?;
        let tool_defs: Vec<ToolDefinition> =
            tool_records.iter().map(ToolRecord::definition).collect();

        let provider = self
            .providers()
            .find(&role.model_config.provider)?
            .ok_or_else(|| {
                EngineError::Internal(format!(
                    "provider not found: {}",
                    role.model_config.provider
                ))
            })?;

        let env_json = serde_json::to_string(&view.variables).unwrap_or_else(|_| "{}".into());
        let mut messages = vec![
            ChatMessage::system(role.system_prompt.clone()),
            ChatMessage::user(format!("Step {step}. Current Environment: {env_json}")),
        ];

        self.bus
            .emit(&ExperimentEvent::ModelPrompt {
                experiment_id: self.experiment_id.clone(),
                role: role.name.clone(),
                messages: messages.clone(),
            })
            .await?;

        let mut iterations = 0u32;
        loop {
            iterations += 1;

            let stream = match self
                .deps
                .router
                .chat(
                    &provider,
                    &role.model_config.model_name,
                    &messages,
                    &tool_defs,
                    &role.model_config.config,
                )
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    // Inference failures abort this role's turn, not the step.
                    self.log_role_error(loaded, role, &e.to_string()).await;
                    return Ok(());
                }
            };

            let mut stream = stream;
            let mut text = String::new();
            let mut calls: Vec<ToolInvocation> = Vec::new();
            let mut stream_error: Option<String> = None;

            while let Some(event) = stream.next().await {
                match event {
                    Ok(ChatEvent::Text { content }) => {
                        self.bus
                            .emit(&ExperimentEvent::ModelResponseChunk {
                                experiment_id: self.experiment_id.clone(),
                                role: role.name.clone(),
                                chunk: content.clone(),
                            })
                            .await?;
                        text.push_str(&content);
                    }
                    Ok(ChatEvent::ToolCall { tool_name, args }) => {
                        calls.push(ToolInvocation { tool_name, args });
                    }
                    Err(e) => {
                        stream_error = Some(e.to_string());
                        break;
                    }
                }
            }
            if let Some(message) = stream_error {
                self.log_role_error(loaded, role, &message).await;
                return Ok(());
            }

            if calls.is_empty() {
                self.bus
                    .emit(&ExperimentEvent::ModelResponseComplete {
                        experiment_id: self.experiment_id.clone(),
                        role: role.name.clone(),
                        text,
                    })
                    .await?;
                return Ok(());
            }

            messages.push(ChatMessage::assistant_with_tools(text, calls.clone()));

            let mut any_keeps_turn_open = false;
            for call in &calls {
                let ends_turn = self
                    .execute_tool_call(loaded, call, &mut view, &mut messages)
                    .await?;
                if !ends_turn {
                    any_keeps_turn_open = true;
                }
            }

            if iterations >= MAX_TOOL_ITERATIONS || !any_keeps_turn_open {
                return Ok(());
            }
        }
    }

    /// One tool call: hook events, sandboxed execution against the
    /// filtered view, environment merge-back, and the `tool` message for
    /// the model. Returns whether this call ends the turn (unknown tools
    /// and absent flags end it).
    async fn execute_tool_call(
        &self,
        loaded: &Loaded,
        call: &ToolInvocation,
        view: &mut Environment,
        messages: &mut Vec<ChatMessage>,
    ) -> Result<bool, EngineError> {
        self.bus
            .emit(&ExperimentEvent::BeforeToolCall {
                experiment_id: self.experiment_id.clone(),
                tool: call.tool_name.clone(),
                args: call.args.clone(),
            })
            .await?;
        self.bus
            .emit(&ExperimentEvent::ToolCall {
                experiment_id: self.experiment_id.clone(),
                tool: call.tool_name.clone(),
                args: call.args.clone(),
            })
            .await?;

        let Some(record) = self.tools().find_by_name(&call.tool_name)? else {
            let message = format!("Tool not found: {}", call.tool_name);
            warn!(tool = %call.tool_name, "model called an unknown tool");
            self.emit_tool_result(call, Value::Null, Some(message.clone()))
                .await?;
            messages.push(ChatMessage::tool_result(
                &call.tool_name,
                format!("[error] {message}"),
            ));
            return Ok(true);
        };

        let env_vars = harness::tool_env_vars(&record.code, &view.variables, &call.args);
        let mut ctx = self.deps.pool.acquire().await?;
        let exec_result = ctx.execute(harness::TOOL_HARNESS, &env_vars, &[]).await;
        // The context is never reused; destroy regardless of outcome.
        if let Err(e) = ctx.destroy().await {
            warn!(context = %ctx.id(), error = %e, "failed to destroy tool context");
        }

        // Sandbox failures are captured as structured error results and
        // handed back to the model; they do not fail the step.
        let outcome: Result<harness::SandboxReport, String> = match exec_result {
            Ok(exec) => match harness::parse_report(&exec) {
                Ok(report) if report.success => Ok(report),
                Ok(report) => Err(report
                    .error
                    .unwrap_or_else(|| "tool script failed".into())),
                Err(msg) => Err(msg),
            },
            Err(e) => Err(e.to_string()),
        };

        let outcome = match outcome {
            Ok(report) => match &report.environment {
                Some(updates) => match self.merge_tool_environment(loaded, view, updates) {
                    Ok(()) => Ok(report),
                    Err(e) => Err(e.to_string()),
                },
                None => Ok(report),
            },
            Err(msg) => Err(msg),
        };

        match outcome {
            Ok(report) => {
                let result_value = report.result.clone().unwrap_or(Value::Null);
                self.emit_tool_result(call, result_value.clone(), None).await?;
                let content = match &result_value {
                    Value::Null => "ok".to_string(),
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                messages.push(ChatMessage::tool_result(&call.tool_name, content));
            }
            Err(message) => {
                self.emit_tool_result(call, Value::Null, Some(message.clone()))
                    .await?;
                messages.push(ChatMessage::tool_result(
                    &call.tool_name,
                    format!("[error] {message}"),
                ));
            }
        }

        Ok(record.ends_turn())
    }

    async fn emit_tool_result(
        &self,
        call: &ToolInvocation,
        result: Value,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        self.bus
            .emit(&ExperimentEvent::ToolResult {
                experiment_id: self.experiment_id.clone(),
                tool: call.tool_name.clone(),
                result: result.clone(),
                error,
            })
            .await?;
        self.bus
            .emit(&ExperimentEvent::AfterToolCall {
                experiment_id: self.experiment_id.clone(),
                tool: call.tool_name.clone(),
                result,
            })
            .await?;
        Ok(())
    }

    /// Typed merge of a sandbox's environment output into BOTH the
    /// persisted environment and the role's local view. Validation runs
    /// on a detached copy first so a violating update changes nothing.
    fn merge_tool_environment(
        &self,
        loaded: &Loaded,
        view: &mut Environment,
        updates: &Map<String, Value>,
    ) -> Result<(), EngineError> {
        let snapshot = {
            let mut experiment = loaded.experiment.lock();
            let mut merged = experiment.current_environment.deep_copy();
            merged.merge(updates)?;
            experiment.current_environment = merged;
            experiment.clone()
        };
        view.merge(updates)?;
        self.experiments().update_progress(&snapshot)?;
        Ok(())
    }

    /// Evaluate goals in plan order against the current environment.
    /// Goal evaluation is must-succeed infrastructure: a non-zero exit or
    /// unparseable output aborts the experiment.
    async fn evaluate_goals(&self, loaded: &Loaded) -> Result<Option<String>, EngineError> {
        if loaded.plan.goals.is_empty() {
            return Ok(None);
        }

        let variables = loaded.experiment.lock().current_environment.variables.clone();
        for goal in &loaded.plan.goals {
            let env_vars = harness::goal_env_vars(&goal.condition, &variables);
            let mut ctx = self.deps.pool.acquire().await?;
            let exec_result = ctx.execute(harness::GOAL_HARNESS, &env_vars, &[]).await;
            if let Err(e) = ctx.destroy().await {
                warn!(context = %ctx.id(), error = %e, "failed to destroy goal context");
            }

            let exec = exec_result?;
            if harness::parse_goal_result(&exec)? {
                return Ok(Some(goal.description.clone()));
            }
        }
        Ok(None)
    }

    async fn complete(&self, loaded: &Loaded, description: String) -> Result<(), EngineError> {
        let snapshot = {
            let mut experiment = loaded.experiment.lock();
            experiment.status = ExperimentStatus::Completed;
            experiment.result = Some(description.clone());
            experiment.end_time = Some(Utc::now());
            experiment.clone()
        };
        self.experiments().update(&snapshot)?;

        let _ = self
            .bus
            .emit(&ExperimentEvent::ExperimentEnd {
                experiment_id: self.experiment_id.clone(),
                result: description.clone(),
                duration_ms: snapshot.duration_ms().unwrap_or(0),
                error: None,
            })
            .await;
        info!(result = %description, "experiment completed");
        Ok(())
    }

    async fn finish_failed(
        &self,
        loaded: &Loaded,
        stored_result: String,
        end_result: String,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        let snapshot = {
            let mut experiment = loaded.experiment.lock();
            experiment.status = ExperimentStatus::Failed;
            experiment.result = Some(stored_result);
            experiment.end_time = Some(Utc::now());
            experiment.clone()
        };
        self.experiments().update(&snapshot)?;

        let _ = self
            .bus
            .emit(&ExperimentEvent::ExperimentEnd {
                experiment_id: self.experiment_id.clone(),
                result: end_result,
                duration_ms: snapshot.duration_ms().unwrap_or(0),
                error,
            })
            .await;
        Ok(())
    }

    async fn fail_with(&self, loaded: &Loaded, error: EngineError) {
        let message = error.to_string();
        error!(experiment_id = %self.experiment_id, error = %message, "error in execution loop");

        let step = loaded.experiment.lock().current_step;
        let _ = self
            .bus
            .emit(&ExperimentEvent::Log {
                experiment_id: self.experiment_id.clone(),
                step,
                source: LogSource::System,
                message: "Error in execution loop".into(),
                data: Some(json!({"error": message})),
            })
            .await;

        if let Err(e) = self
            .finish_failed(
                loaded,
                format!("Error: {message}"),
                "Failed".into(),
                Some(message),
            )
            .await
        {
            error!(error = %e, "failed to persist failure state");
        }
    }

    async fn log_role_error(&self, loaded: &Loaded, role: &Role, message: &str) {
        warn!(role = %role.name, error = %message, "inference failed, ending role turn");
        let step = loaded.experiment.lock().current_step;
        let _ = self
            .bus
            .emit(&ExperimentEvent::Log {
                experiment_id: self.experiment_id.clone(),
                step,
                source: LogSource::Role,
                message: format!("Inference failed for role {}: {message}", role.name),
                data: None,
            })
            .await;
    }
}
