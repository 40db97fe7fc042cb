//! Plan records: the immutable template an experiment runs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::environment::Environment;
use crate::events::EventKind;
use crate::ids::{PlanId, ProviderId, ToolId};

/// Reusable template defining roles, goals, hooks, and initial state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: PlanId,
    /// Globally unique.
    pub name: String,
    #[serde(default)]
    pub initial_environment: Environment,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub goals: Vec<Goal>,
    #[serde(default)]
    pub scripts: Vec<Script>,
    pub max_steps: u32,
}

/// One agent definition within a plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub name: String,
    pub model_config: ModelConfig,
    #[serde(default)]
    pub system_prompt: String,
    /// Ordered tool references, resolved to full records at run time.
    #[serde(default)]
    pub tools: Vec<ToolId>,
    /// Non-empty: only the listed variables are visible to this role.
    /// Empty or absent: FULL visibility (established behavior, see
    /// `Environment::filtered`).
    #[serde(default)]
    pub variable_whitelist: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub provider: ProviderId,
    pub model_name: String,
    /// Free-form backend configuration merged into the request.
    #[serde(default)]
    pub config: Value,
}

/// Boolean termination condition evaluated against the environment each step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub description: String,
    /// Expression evaluated with the environment variables as its scope.
    pub condition: String,
}

/// What happens when a hook script fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailPolicy {
    #[default]
    AbortExperiment,
    ContinueWithError,
}

/// Whether a hook blocks the loop at its firing point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    #[default]
    Sync,
    Async,
}

/// User code bound to a lifecycle event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Script {
    pub hook: EventKind,
    pub code: String,
    #[serde(default)]
    pub fail_policy: FailPolicy,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn script_defaults() {
        let script: Script = serde_json::from_value(json!({
            "hook": "STEP_START",
            "code": "pass"
        }))
        .unwrap();
        assert_eq!(script.fail_policy, FailPolicy::AbortExperiment);
        assert_eq!(script.execution_mode, ExecutionMode::Sync);
    }

    #[test]
    fn fail_policy_serde_strings() {
        assert_eq!(
            serde_json::to_string(&FailPolicy::ContinueWithError).unwrap(),
            r#""CONTINUE_WITH_ERROR""#
        );
        assert_eq!(
            serde_json::to_string(&ExecutionMode::Async).unwrap(),
            r#""ASYNC""#
        );
    }

    #[test]
    fn plan_roundtrip() {
        let plan = Plan {
            id: PlanId::new(),
            name: "market-sim".into(),
            initial_environment: Environment::new(),
            roles: vec![Role {
                name: "Trader".into(),
                model_config: ModelConfig {
                    provider: ProviderId::new(),
                    model_name: "gpt-4o".into(),
                    config: json!({"temperature": 0.2}),
                },
                system_prompt: "You trade.".into(),
                tools: vec![ToolId::new()],
                variable_whitelist: vec!["PRICE".into()],
            }],
            goals: vec![Goal {
                description: "Price converged".into(),
                condition: "PRICE > 100".into(),
            }],
            scripts: vec![],
            max_steps: 10,
        };
        let json = serde_json::to_string(&plan).unwrap();
        let parsed: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, plan);
    }

    #[test]
    fn role_defaults_to_empty_whitelist() {
        let role: Role = serde_json::from_value(json!({
            "name": "Observer",
            "modelConfig": {"provider": "prov_x", "modelName": "llama3"}
        }))
        .unwrap();
        assert!(role.variable_whitelist.is_empty());
        assert!(role.tools.is_empty());
        assert!(role.system_prompt.is_empty());
    }
}
