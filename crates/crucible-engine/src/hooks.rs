//! Lifecycle hook dispatch.
//!
//! Each plan script becomes one bus subscriber keyed by its hook kind.
//! Sync scripts are awaited inline at the emit point; their
//! AbortExperiment failures propagate through the bus into the loop.
//! Async scripts are detached tasks whose failures are logged and never
//! joined. Both paths run inside a pooled execution context that is
//! destroyed on every exit path.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{error, instrument, warn};

use crucible_core::events::{EventKind, ExperimentEvent, LogSource};
use crucible_core::experiment::Experiment;
use crucible_core::ids::ExperimentId;
use crucible_core::plan::{ExecutionMode, FailPolicy, Script};
use crucible_sandbox::ContainerPool;
use crucible_store::experiments::ExperimentRepo;

use crate::bus::{EventBus, EventHandler};
use crate::errors::EngineError;
use crate::harness;

/// Executes hook scripts against the experiment's shared state.
pub struct HookRunner {
    experiment_id: ExperimentId,
    pool: Arc<ContainerPool>,
    experiments: ExperimentRepo,
    state: Arc<Mutex<Experiment>>,
    /// Weak: the bus owns the hook subscribers that own this runner.
    bus: Weak<EventBus>,
}

impl HookRunner {
    pub fn new(
        experiment_id: ExperimentId,
        pool: Arc<ContainerPool>,
        experiments: ExperimentRepo,
        state: Arc<Mutex<Experiment>>,
        bus: Weak<EventBus>,
    ) -> Self {
        Self {
            experiment_id,
            pool,
            experiments,
            state,
            bus,
        }
    }

    /// Dispatch one script for one event firing.
    pub async fn handle(
        runner: &Arc<Self>,
        script: &Script,
        event: &ExperimentEvent,
    ) -> Result<(), EngineError> {
        match script.execution_mode {
            ExecutionMode::Sync => runner.execute_hook(script, event).await,
            ExecutionMode::Async => {
                let runner = Arc::clone(runner);
                let script = script.clone();
                let event = event.clone();
                drop(tokio::spawn(async move {
                    // Detached: errors are this task's own problem.
                    if let Err(e) = runner.execute_hook(&script, &event).await {
                        error!(
                            experiment_id = %runner.experiment_id,
                            hook = %script.hook,
                            error = %e,
                            "async hook failed"
                        );
                    }
                }));
                Ok(())
            }
        }
    }

    /// Run the script body in a fresh context, merge any returned
    /// environment, and apply the fail policy. The context is destroyed
    /// on success, failure, and every policy outcome.
    #[instrument(skip(self, script, event), fields(experiment_id = %self.experiment_id, hook = %script.hook))]
    pub async fn execute_hook(
        &self,
        script: &Script,
        event: &ExperimentEvent,
    ) -> Result<(), EngineError> {
        let context = self.build_context(event);
        let env_vars = harness::hook_env_vars(&script.code, &context);

        let mut ctx = self.pool.acquire().await?;
        let exec_result = ctx
            .execute(harness::HOOK_HARNESS, &env_vars, &[])
            .await;
        if let Err(e) = ctx.destroy().await {
            warn!(context = %ctx.id(), error = %e, "failed to destroy hook context");
        }

        let outcome: Result<(), String> = match exec_result {
            Ok(exec) => match harness::parse_report(&exec) {
                Ok(report) if report.success => match &report.environment {
                    Some(updates) => {
                        self.merge_environment(updates).map_err(|e| e.to_string())
                    }
                    None => Ok(()),
                },
                Ok(report) => Err(report.error.unwrap_or_else(|| "hook script failed".into())),
                Err(msg) => Err(msg),
            },
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(message) => {
                self.log_failure(script, &message).await;
                match script.fail_policy {
                    FailPolicy::AbortExperiment => Err(EngineError::Hook(format!(
                        "{} hook failed: {message}",
                        script.hook
                    ))),
                    FailPolicy::ContinueWithError => Ok(()),
                }
            }
        }
    }

    fn build_context(&self, event: &ExperimentEvent) -> serde_json::Value {
        let (summary, environment) = {
            let experiment = self.state.lock();
            (
                json!({
                    "id": experiment.id,
                    "status": experiment.status,
                    "currentStep": experiment.current_step,
                }),
                serde_json::to_value(&experiment.current_environment)
                    .unwrap_or_else(|_| json!({})),
            )
        };
        json!({
            "experiment": summary,
            "environment": environment,
            "event": event,
        })
    }

    /// Typed merge into the shared environment, persisted immediately so
    /// later hooks and the next step observe it.
    fn merge_environment(
        &self,
        updates: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), EngineError> {
        let snapshot = {
            let mut experiment = self.state.lock();
            let mut merged = experiment.current_environment.deep_copy();
            merged.merge(updates)?;
            experiment.current_environment = merged;
            experiment.clone()
        };
        self.experiments.update_progress(&snapshot)?;
        Ok(())
    }

    async fn log_failure(&self, script: &Script, message: &str) {
        let step = self.state.lock().current_step;
        let log = ExperimentEvent::Log {
            experiment_id: self.experiment_id.clone(),
            step,
            source: LogSource::Hook,
            message: format!("{} hook failed: {message}", script.hook),
            data: Some(json!({"error": message})),
        };
        if let Some(bus) = self.bus.upgrade() {
            // A failing LOG-bound hook must not re-enter itself through
            // its own failure log.
            if script.hook == EventKind::Log {
                bus.emit_tap_only(&log);
            } else if let Err(e) = bus.emit(&log).await {
                warn!(error = %e, "failed to emit hook failure log");
            }
        }
    }
}

/// Bus subscriber binding one script to its hook kind.
pub struct HookSubscriber {
    script: Script,
    runner: Arc<HookRunner>,
}

impl HookSubscriber {
    pub fn new(script: Script, runner: Arc<HookRunner>) -> Self {
        Self { script, runner }
    }
}

#[async_trait]
impl EventHandler for HookSubscriber {
    async fn handle(&self, event: &ExperimentEvent) -> Result<(), EngineError> {
        HookRunner::handle(&self.runner, &self.script, event).await
    }
}

/// Register every plan script on the bus. Returns the number registered.
pub fn register_hooks(
    bus: &Arc<EventBus>,
    scripts: &[Script],
    runner: &Arc<HookRunner>,
) -> usize {
    for script in scripts {
        let _ = bus.subscribe(
            Some(script.hook),
            Arc::new(HookSubscriber::new(script.clone(), Arc::clone(runner))),
        );
    }
    scripts.len()
}

/// Build the shared pieces of a hook runner wired to an experiment.
pub fn make_runner(
    pool: Arc<ContainerPool>,
    experiments: ExperimentRepo,
    state: Arc<Mutex<Experiment>>,
    bus: &Arc<EventBus>,
) -> Arc<HookRunner> {
    let experiment_id = state.lock().id.clone();
    Arc::new(HookRunner::new(
        experiment_id,
        pool,
        experiments,
        state,
        Arc::downgrade(bus),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::environment::{Environment, TypeSpec};
    use crucible_core::ids::PlanId;
    use crucible_core::plan::Plan;
    use crucible_sandbox::testutil::FakeRuntime;
    use crucible_sandbox::PoolConfig;
    use crucible_store::plans::PlanRepo;
    use crucible_store::Database;
    use serde_json::json;

    struct Fixture {
        runtime: Arc<FakeRuntime>,
        runner: Arc<HookRunner>,
        state: Arc<Mutex<Experiment>>,
        experiments: ExperimentRepo,
        bus: Arc<EventBus>,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let plan = Plan {
            id: PlanId::new(),
            name: "hook-plan".into(),
            initial_environment: Environment::new(),
            roles: vec![],
            goals: vec![],
            scripts: vec![],
            max_steps: 10,
        };
        PlanRepo::new(db.clone()).insert(&plan).unwrap();

        let mut experiment = Experiment::new(plan.id);
        experiment
            .current_environment
            .variable_types
            .insert("counter".into(), TypeSpec::Int);
        experiment.current_environment.set("counter", json!(0)).unwrap();
        experiment.current_environment.set("flag", json!(false)).unwrap();

        let experiments = ExperimentRepo::new(db.clone());
        experiments.insert(&experiment).unwrap();

        let runtime = Arc::new(FakeRuntime::new());
        let pool = Arc::new(ContainerPool::new(
            runtime.clone(),
            PoolConfig { target_size: 0, ..Default::default() },
        ));
        let state = Arc::new(Mutex::new(experiment));
        let bus = Arc::new(EventBus::new());
        let runner = make_runner(pool, ExperimentRepo::new(db), state.clone(), &bus);

        Fixture { runtime, runner, state, experiments, bus }
    }

    fn script(mode: ExecutionMode, policy: FailPolicy) -> Script {
        Script {
            hook: EventKind::StepStart,
            code: "env['counter'] = env['counter'] + 1".into(),
            fail_policy: policy,
            execution_mode: mode,
        }
    }

    fn step_event(id: &ExperimentId) -> ExperimentEvent {
        ExperimentEvent::StepStart { experiment_id: id.clone(), step: 1 }
    }

    #[tokio::test]
    async fn sync_hook_merges_and_persists_environment() {
        let fx = fixture();
        fx.runtime
            .push_stdout(r#"{"success": true, "environment": {"counter": 1, "flag": false}}"#);

        let id = fx.state.lock().id.clone();
        fx.runner
            .execute_hook(&script(ExecutionMode::Sync, FailPolicy::AbortExperiment), &step_event(&id))
            .await
            .unwrap();

        assert_eq!(fx.state.lock().current_environment.get("counter"), Some(&json!(1)));
        // Persisted, not just in memory.
        let persisted = fx.experiments.find(&id).unwrap().unwrap();
        assert_eq!(persisted.current_environment.get("counter"), Some(&json!(1)));
        // Context destroyed.
        assert_eq!(fx.runtime.removed().len(), 1);
    }

    #[tokio::test]
    async fn hook_context_carries_experiment_and_environment() {
        let fx = fixture();
        fx.runtime.push_stdout(r#"{"success": true, "environment": {}}"#);

        let id = fx.state.lock().id.clone();
        fx.runner
            .execute_hook(&script(ExecutionMode::Sync, FailPolicy::AbortExperiment), &step_event(&id))
            .await
            .unwrap();

        let calls = fx.runtime.exec_calls();
        let context_var = calls[0]
            .env
            .iter()
            .find(|(k, _)| k == "HOOK_CONTEXT")
            .map(|(_, v)| v.clone())
            .unwrap();
        let context: serde_json::Value = serde_json::from_str(&context_var).unwrap();
        assert_eq!(context["experiment"]["id"], json!(id.as_str()));
        assert_eq!(context["environment"]["variables"]["counter"], json!(0));
        assert_eq!(context["event"]["type"], "STEP_START");

        let code_var = calls[0].env.iter().find(|(k, _)| k == "HOOK_CODE").unwrap();
        assert!(code_var.1.contains("env['counter']"));
    }

    #[tokio::test]
    async fn abort_policy_raises_after_script_failure() {
        let fx = fixture();
        fx.runtime.push_stdout(r#"{"success": false, "error": "test error"}"#);

        let id = fx.state.lock().id.clone();
        let err = fx
            .runner
            .execute_hook(&script(ExecutionMode::Sync, FailPolicy::AbortExperiment), &step_event(&id))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Hook(msg) if msg.contains("test error")));
        assert_eq!(fx.runtime.removed().len(), 1);
    }

    #[tokio::test]
    async fn continue_policy_swallows_and_logs() {
        let fx = fixture();
        fx.runtime.push_stdout(r#"{"success": false, "error": "test error"}"#);
        let mut watcher = fx.bus.watch();

        let id = fx.state.lock().id.clone();
        fx.runner
            .execute_hook(&script(ExecutionMode::Sync, FailPolicy::ContinueWithError), &step_event(&id))
            .await
            .unwrap();

        let log = watcher.recv().await.unwrap();
        match log {
            ExperimentEvent::Log { source, message, .. } => {
                assert_eq!(source, LogSource::Hook);
                assert!(message.contains("failed"));
            }
            other => panic!("expected LOG, got {other:?}"),
        }
        assert_eq!(fx.runtime.removed().len(), 1);
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failure() {
        let fx = fixture();
        fx.runtime.push_failure("SyntaxError: invalid syntax", 1);

        let id = fx.state.lock().id.clone();
        let err = fx
            .runner
            .execute_hook(&script(ExecutionMode::Sync, FailPolicy::AbortExperiment), &step_event(&id))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Hook(msg) if msg.contains("SyntaxError")));
        assert_eq!(fx.runtime.removed().len(), 1);
    }

    #[tokio::test]
    async fn type_violating_merge_is_a_hook_error() {
        let fx = fixture();
        // counter is declared int; the hook returns a string for it.
        fx.runtime
            .push_stdout(r#"{"success": true, "environment": {"counter": "not a number"}}"#);

        let id = fx.state.lock().id.clone();
        let result = fx
            .runner
            .execute_hook(&script(ExecutionMode::Sync, FailPolicy::AbortExperiment), &step_event(&id))
            .await;
        assert!(result.is_err());
        // Environment unchanged.
        assert_eq!(fx.state.lock().current_environment.get("counter"), Some(&json!(0)));
    }

    #[tokio::test]
    async fn async_hook_is_fire_and_forget() {
        let fx = fixture();
        fx.runtime
            .push_stdout(r#"{"success": true, "environment": {"counter": 5, "flag": false}}"#);

        let id = fx.state.lock().id.clone();
        // Even an AbortExperiment async hook returns Ok immediately.
        HookRunner::handle(
            &fx.runner,
            &script(ExecutionMode::Async, FailPolicy::AbortExperiment),
            &step_event(&id),
        )
        .await
        .unwrap();

        // Wait for the detached task to land its merge.
        for _ in 0..100 {
            if fx.state.lock().current_environment.get("counter") == Some(&json!(5)) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(fx.state.lock().current_environment.get("counter"), Some(&json!(5)));
        assert_eq!(fx.runtime.removed().len(), 1);
    }

    #[tokio::test]
    async fn registered_hooks_fire_through_the_bus() {
        let fx = fixture();
        fx.runtime
            .push_stdout(r#"{"success": true, "environment": {"counter": 2, "flag": false}}"#);

        let scripts = vec![script(ExecutionMode::Sync, FailPolicy::AbortExperiment)];
        assert_eq!(register_hooks(&fx.bus, &scripts, &fx.runner), 1);
        assert_eq!(fx.bus.subscriber_count(), 1);

        let id = fx.state.lock().id.clone();
        fx.bus.emit(&step_event(&id)).await.unwrap();
        assert_eq!(fx.state.lock().current_environment.get("counter"), Some(&json!(2)));

        // Events of other kinds do not trigger the hook.
        fx.bus
            .emit(&ExperimentEvent::RoleStart { experiment_id: id, role: "r".into() })
            .await
            .unwrap();
        assert_eq!(fx.runtime.exec_calls().len(), 1);
    }

    #[tokio::test]
    async fn context_destroyed_even_when_exec_errors() {
        let fx = fixture();
        fx.runtime.push_exec(Err(crucible_sandbox::SandboxError::Runtime(
            "daemon vanished".into(),
        )));

        let id = fx.state.lock().id.clone();
        let err = fx
            .runner
            .execute_hook(&script(ExecutionMode::Sync, FailPolicy::AbortExperiment), &step_event(&id))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Hook(_)));
        assert_eq!(fx.runtime.removed().len(), 1);
    }
}
