//! Custom aggregation code - runs user code in a child interpreter
//!
//! The child receives `{code, items, kwargs}` as JSON on stdin. A small
//! runner script defines the user's `aggregate` entry point, calls it and
//! prints [`RESULT_SENTINEL`] followed by the JSON return value. Anything
//! the user code prints before that is ignored. On failure the runner
//! writes the stack trace to stderr and ends it with an
//! [`ERROR_TYPE_MARKER`] line naming the exception class.
//!
//! The child is killed when the timeout elapses (`kill_on_drop`).

use serde::Deserialize;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::AggregateError;

pub const RESULT_SENTINEL: &str = "__PROMPTLAB_AGGREGATE_RESULT__";
pub const ERROR_TYPE_MARKER: &str = "__PROMPTLAB_ERROR_TYPE__:";

const PYTHON_RUNNER: &str = r#"
import json
import sys
import traceback

def main():
    payload = json.load(sys.stdin)
    namespace = {"__name__": "__aggregate__"}
    try:
        exec(compile(payload["code"], "<aggregate>", "exec"), namespace)
        func = namespace.get("aggregate")
        if not callable(func):
            raise NameError("custom code must define aggregate(items, **kwargs)")
        result = func(payload["items"], **(payload.get("kwargs") or {}))
    except BaseException as exc:
        traceback.print_exc()
        sys.stderr.write("\n__PROMPTLAB_ERROR_TYPE__:" + type(exc).__name__ + "\n")
        sys.stderr.flush()
        sys.exit(1)
    sys.stdout.write("\n__PROMPTLAB_AGGREGATE_RESULT__\n" + json.dumps(result, default=str) + "\n")
    sys.stdout.flush()

main()
"#;

const NODE_RUNNER: &str = r#"
const chunks = [];
process.stdin.on("data", (chunk) => chunks.push(chunk));
process.stdin.on("end", async () => {
  try {
    const payload = JSON.parse(Buffer.concat(chunks).toString("utf8"));
    const factory = new Function(
      payload.code + "\n;return typeof aggregate === 'function' ? aggregate : undefined;"
    );
    const fn = factory();
    if (typeof fn !== "function") {
      throw new ReferenceError("custom code must define aggregate(items, kwargs)");
    }
    const result = await fn(payload.items, payload.kwargs || {});
    process.stdout.write(
      "\n__PROMPTLAB_AGGREGATE_RESULT__\n" + JSON.stringify(result === undefined ? null : result) + "\n"
    );
  } catch (err) {
    process.stderr.write(String((err && err.stack) || err) + "\n");
    process.stderr.write("\n__PROMPTLAB_ERROR_TYPE__:" + ((err && err.name) || "Error") + "\n");
    process.exitCode = 1;
  }
});
"#;

/// Language of the user code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    #[serde(alias = "py")]
    Python,
    #[serde(alias = "js", alias = "node")]
    Javascript,
}

/// Interpreter commands and default timeout for custom code
#[derive(Debug, Clone)]
pub struct CustomRunner {
    pub python_command: String,
    pub node_command: String,
    pub default_timeout: Duration,
}

impl CustomRunner {
    /// Execute `code` against `items`; never panics, every failure is an
    /// [`AggregateError::Custom`]
    pub async fn run(
        &self,
        language: Language,
        code: &str,
        items: &[Value],
        kwargs: &serde_json::Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Option<Value>, AggregateError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let (program, flag, runner) = match language {
            Language::Python => (&self.python_command, "-c", PYTHON_RUNNER),
            Language::Javascript => (&self.node_command, "-e", NODE_RUNNER),
        };

        let payload = serde_json::to_vec(&serde_json::json!({
            "code": code,
            "items": items,
            "kwargs": kwargs,
        }))
        .map_err(|e| AggregateError::custom("SerializationError", e.to_string()))?;

        log::debug!(
            "Running {:?} aggregation with {} items (timeout {:?})",
            language,
            items.len(),
            timeout
        );

        let mut child = Command::new(program)
            .arg(flag)
            .arg(runner)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AggregateError::custom("SpawnError", format!("failed to start {}: {}", program, e)))?;

        let stdin = child.stdin.take();
        let interaction = async move {
            if let Some(mut stdin) = stdin {
                // The child may exit before reading everything; its exit
                // status and stderr tell the real story.
                if let Err(e) = stdin.write_all(&payload).await {
                    log::debug!("Writing aggregation payload failed: {}", e);
                }
                drop(stdin);
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(timeout, interaction).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(AggregateError::custom("IoError", e.to_string())),
            Err(_) => {
                log::warn!("Custom aggregation timed out after {:?}", timeout);
                return Err(AggregateError::custom(
                    "TimeoutError",
                    format!("custom aggregation timed out after {}s", timeout.as_secs_f64()),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let (error_type, trace) = split_error(&stderr);
            let message = if trace.is_empty() {
                format!("custom aggregation exited with {}", output.status)
            } else {
                trace
            };
            return Err(AggregateError::custom(error_type, message));
        }

        parse_output(&stdout)
    }
}

/// Value after the sentinel; without one, the trimmed stdout as a string
fn parse_output(stdout: &str) -> Result<Option<Value>, AggregateError> {
    match stdout.rfind(RESULT_SENTINEL) {
        Some(pos) => {
            let raw = stdout[pos + RESULT_SENTINEL.len()..].trim();
            serde_json::from_str(raw)
                .map(Some)
                .map_err(|e| AggregateError::custom("JsonError", format!("invalid aggregation result: {}", e)))
        }
        None => {
            let trimmed = stdout.trim();
            Ok((!trimmed.is_empty()).then(|| Value::String(trimmed.to_string())))
        }
    }
}

/// Pull the exception class name out of stderr and strip the marker line
fn split_error(stderr: &str) -> (String, String) {
    let mut error_type = None;
    let mut trace = Vec::new();

    for line in stderr.lines() {
        match line.strip_prefix(ERROR_TYPE_MARKER) {
            Some(name) => error_type = Some(name.trim().to_string()),
            None => trace.push(line),
        }
    }

    (
        error_type.unwrap_or_else(|| "RuntimeError".to_string()),
        trace.join("\n").trim().to_string(),
    )
}
