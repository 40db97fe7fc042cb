//! Python harnesses delivered to execution contexts.
//!
//! Each harness is streamed over stdin (`python3 -`); the payload
//! (user code, environment, arguments) travels in process environment
//! variables. Tools and hooks report through a single JSON object on
//! stdout: `{"success": bool, "environment": {..}, "result": .., "error": ..}`.
//! Goal evaluation prints `{"result": bool}` and deliberately does NOT
//! catch exceptions: an undefined variable or broken condition must exit
//! non-zero and fail the experiment rather than read as false.

use serde::Deserialize;
use serde_json::{Map, Value};

use crucible_sandbox::ExecResult;

use crate::errors::EngineError;

/// Runs tool code with `env` (the role-filtered variables) and `args`
/// (the model's call arguments) in scope. Mutations to `env` are
/// reported back for merging.
pub const TOOL_HARNESS: &str = r#"
import json, os, sys

def _main():
    env = json.loads(os.environ.get("TOOL_ENV", "{}"))
    args = json.loads(os.environ.get("TOOL_ARGS", "{}"))
    code = os.environ.get("TOOL_CODE", "")
    scope = {"env": env, "args": args, "result": None}
    try:
        exec(code, scope)
        print(json.dumps({
            "success": True,
            "environment": scope["env"],
            "result": scope.get("result"),
        }))
    except Exception as e:
        print(json.dumps({"success": False, "error": str(e)}))
        sys.exit(0)

_main()
"#;

/// Runs hook code with the full hook context (`context`) and the
/// environment variables (`env`) in scope.
pub const HOOK_HARNESS: &str = r#"
import json, os, sys

def _main():
    context = json.loads(os.environ.get("HOOK_CONTEXT", "{}"))
    code = os.environ.get("HOOK_CODE", "")
    env = context.get("environment", {}).get("variables", {})
    scope = {"context": context, "env": env}
    try:
        exec(code, scope)
        print(json.dumps({"success": True, "environment": scope["env"]}))
    except Exception as e:
        print(json.dumps({"success": False, "error": str(e)}))
        sys.exit(0)

_main()
"#;

/// Evaluates the goal condition with the environment variables as its
/// scope. No exception handling: failures must surface as a non-zero
/// exit, not as false.
pub const GOAL_HARNESS: &str = r#"
import json, os

env = json.loads(os.environ["GOAL_ENV"])
condition = os.environ["GOAL_CONDITION"]
result = eval(condition, {}, env)
print(json.dumps({"result": bool(result)}))
"#;

/// Environment variables for a tool run.
pub fn tool_env_vars(code: &str, variables: &Map<String, Value>, args: &Value) -> Vec<(String, String)> {
    vec![
        ("TOOL_CODE".into(), code.to_owned()),
        (
            "TOOL_ENV".into(),
            serde_json::to_string(variables).unwrap_or_else(|_| "{}".into()),
        ),
        (
            "TOOL_ARGS".into(),
            serde_json::to_string(args).unwrap_or_else(|_| "{}".into()),
        ),
    ]
}

/// Environment variables for a hook run.
pub fn hook_env_vars(code: &str, context: &Value) -> Vec<(String, String)> {
    vec![
        ("HOOK_CODE".into(), code.to_owned()),
        (
            "HOOK_CONTEXT".into(),
            serde_json::to_string(context).unwrap_or_else(|_| "{}".into()),
        ),
    ]
}

/// Environment variables for a goal evaluation.
pub fn goal_env_vars(condition: &str, variables: &Map<String, Value>) -> Vec<(String, String)> {
    vec![
        ("GOAL_CONDITION".into(), condition.to_owned()),
        (
            "GOAL_ENV".into(),
            serde_json::to_string(variables).unwrap_or_else(|_| "{}".into()),
        ),
    ]
}

/// The stdout protocol shared by tool and hook runs.
#[derive(Clone, Debug, Deserialize)]
pub struct SandboxReport {
    pub success: bool,
    #[serde(default)]
    pub environment: Option<Map<String, Value>>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Interpret a tool/hook execution: non-zero exit or an unparseable
/// report is an execution error; a parsed report may still carry
/// `success: false` with the script's own error.
pub fn parse_report(exec: &ExecResult) -> Result<SandboxReport, String> {
    if exec.exit_code != 0 {
        return Err(if exec.stderr.is_empty() {
            format!("execution exited with code {}", exec.exit_code)
        } else {
            exec.stderr.clone()
        });
    }
    serde_json::from_str(&exec.stdout)
        .map_err(|e| format!("unparseable sandbox output: {e}: {}", exec.stdout))
}

/// Interpret a goal evaluation. Any failure here is fatal for the
/// experiment, so errors are typed.
pub fn parse_goal_result(exec: &ExecResult) -> Result<bool, EngineError> {
    if exec.exit_code != 0 {
        return Err(EngineError::GoalEvaluation(if exec.stderr.is_empty() {
            format!("evaluator exited with code {}", exec.exit_code)
        } else {
            exec.stderr.clone()
        }));
    }

    #[derive(Deserialize)]
    struct GoalOutput {
        result: bool,
    }

    let output: GoalOutput = serde_json::from_str(&exec.stdout).map_err(|e| {
        EngineError::GoalEvaluation(format!("unparseable evaluator output: {e}: {}", exec.stdout))
    })?;
    Ok(output.result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn exec(stdout: &str, stderr: &str, exit_code: i64) -> ExecResult {
        ExecResult {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            duration: Duration::from_millis(1),
        }
    }

    #[test]
    fn parse_report_success_with_environment() {
        let report = parse_report(&exec(
            r#"{"success": true, "environment": {"counter": 1}, "result": "Tool Done"}"#,
            "",
            0,
        ))
        .unwrap();
        assert!(report.success);
        assert_eq!(report.environment.unwrap()["counter"], json!(1));
        assert_eq!(report.result, Some(json!("Tool Done")));
    }

    #[test]
    fn parse_report_script_failure() {
        let report = parse_report(&exec(r#"{"success": false, "error": "test error"}"#, "", 0)).unwrap();
        assert!(!report.success);
        assert_eq!(report.error.as_deref(), Some("test error"));
    }

    #[test]
    fn parse_report_non_zero_exit_uses_stderr() {
        let err = parse_report(&exec("", "SyntaxError: invalid syntax", 1)).unwrap_err();
        assert!(err.contains("SyntaxError"));
    }

    #[test]
    fn parse_report_garbage_stdout_is_error() {
        assert!(parse_report(&exec("not json", "", 0)).is_err());
    }

    #[test]
    fn parse_goal_true_and_false() {
        assert!(parse_goal_result(&exec(r#"{"result": true}"#, "", 0)).unwrap());
        assert!(!parse_goal_result(&exec(r#"{"result": false}"#, "", 0)).unwrap());
    }

    #[test]
    fn parse_goal_non_zero_exit_is_fatal() {
        let err = parse_goal_result(&exec("", "NameError: name 'missing' is not defined", 1))
            .unwrap_err();
        assert!(matches!(err, EngineError::GoalEvaluation(msg) if msg.contains("NameError")));
    }

    #[test]
    fn parse_goal_unparseable_output_is_fatal() {
        let err = parse_goal_result(&exec("True", "", 0)).unwrap_err();
        assert!(matches!(err, EngineError::GoalEvaluation(_)));
    }

    #[test]
    fn tool_env_vars_serialize_payloads() {
        let mut variables = Map::new();
        let _ = variables.insert("PRICE".into(), json!(10));
        let vars = tool_env_vars("env['PRICE'] += 1", &variables, &json!({"delta": 1}));

        assert_eq!(vars[0].0, "TOOL_CODE");
        assert_eq!(vars[1], ("TOOL_ENV".into(), r#"{"PRICE":10}"#.into()));
        assert_eq!(vars[2], ("TOOL_ARGS".into(), r#"{"delta":1}"#.into()));
    }

    #[test]
    fn goal_harness_has_no_exception_guard() {
        // The evaluator must crash on undefined names, not return false.
        assert!(!GOAL_HARNESS.contains("except"));
        assert!(TOOL_HARNESS.contains("except"));
        assert!(HOOK_HARNESS.contains("except"));
    }
}
