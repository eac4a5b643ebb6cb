//! Task plans - shell commands wired into a dependency graph
//!
//! ```yaml
//! name: nightly-eval
//! tasks:
//!   fetch:
//!     command: ./fetch.sh
//!   score:
//!     command: ./score.sh
//!     depends_on: [fetch]
//!     timeout_secs: 60
//!   report:
//!     command: ./report.sh
//!     depends_on: [score]
//!     required: false
//!     metadata: { owner: evals }
//! ```
//!
//! Each command runs through `sh -c`. Its stdout becomes the task output:
//! parsed as JSON when possible, otherwise the trimmed text. A non-zero
//! exit is a task failure typed `CommandError`.
//!
//! On unix each command leads its own process group, so a timeout kills
//! everything the shell started, not just `sh`.

use crate::core::{Metadata, Task, TaskContext, TaskError};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

pub const TASK_ID_ENV: &str = "PROMPTLAB_TASK_ID";
pub const DEPENDENCIES_ENV: &str = "PROMPTLAB_DEPENDENCIES";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub name: Option<String>,
    /// Keyed by task id; tasks run (and report) in id order
    #[serde(default)]
    pub tasks: BTreeMap<String, PlanTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub command: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub metadata: Metadata,
    pub timeout_secs: Option<f64>,
}

fn default_required() -> bool {
    true
}

impl Plan {
    /// Load a plan from YAML, or JSON when the extension says so
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan {}", path.display()))?;

        let plan: Plan = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON plan {}", path.display()))?,
            _ => serde_yaml::from_str(&content)
                .with_context(|| format!("Invalid YAML plan {}", path.display()))?,
        };

        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<()> {
        for (id, task) in &self.tasks {
            if task.command.trim().is_empty() {
                anyhow::bail!("Task {} has an empty command", id);
            }
            if let Some(secs) = task.timeout_secs {
                if !(secs > 0.0 && Duration::try_from_secs_f64(secs).is_ok()) {
                    anyhow::bail!("Task {} has invalid timeout_secs {}", id, secs);
                }
            }
        }
        Ok(())
    }

    /// Work units for the executor; unknown dependencies and cycles are
    /// left for the graph to report
    pub fn into_tasks(self) -> Vec<Task<Value>> {
        self.tasks
            .into_iter()
            .map(|(id, entry)| {
                let command = entry.command;
                // Out-of-range values are rejected by `validate`; unvalidated ones mean no limit
                let timeout = entry
                    .timeout_secs
                    .filter(|secs| *secs > 0.0)
                    .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
                let mut task = Task::new(id, move |ctx: &TaskContext<Value>| run_command(&command, timeout, ctx))
                    .with_dependencies(entry.depends_on)
                    .required(entry.required);
                for (key, value) in entry.metadata {
                    task = task.with_metadata(key, value);
                }
                task
            })
            .collect()
    }
}

fn run_command(command: &str, timeout: Option<Duration>, ctx: &TaskContext<Value>) -> Result<Value> {
    let dependencies = serde_json::to_string(ctx.dependency_outputs())?;
    log::debug!("Task {}: sh -c {:?}", ctx.task_id(), command);

    let mut command_line = Command::new("sh");
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut command_line, 0);

    let mut child = command_line
        .arg("-c")
        .arg(command)
        .env(TASK_ID_ENV, ctx.task_id())
        .env(DEPENDENCIES_ENV, dependencies)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to spawn command for task {}", ctx.task_id()))?;

    // Drain both pipes off-thread so a chatty child never blocks on a full pipe
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = timeout.map(|t| Instant::now() + t);
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                terminate(&mut child);
                return Err(e.into());
            }
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            log::warn!("Task {} timed out; killing its process group", ctx.task_id());
            terminate(&mut child);
            let secs = timeout.map(|t| t.as_secs_f64()).unwrap_or_default();
            return Err(TaskError::timeout(format!("command timed out after {}s", secs)).into());
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    let stdout = collect(stdout);
    let stderr = collect(stderr);

    if !status.success() {
        let detail = stderr.trim();
        let message = if detail.is_empty() {
            format!("command exited with {}", status)
        } else {
            format!("command exited with {}: {}", status, detail)
        };
        return Err(TaskError::new("CommandError", message).into());
    }

    Ok(parse_stdout(&stdout))
}

/// Kill the command's process group (or just the child off unix) and reap it
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
            log::debug!("killpg({}) failed: {}", child.id(), e);
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<std::thread::JoinHandle<String>> {
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn collect(handle: Option<std::thread::JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn parse_stdout(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ConcurrentExecutor;
    use serde_json::json;
    use std::io::Write;

    fn plan(yaml: &str) -> Plan {
        let plan: Plan = serde_yaml::from_str(yaml).unwrap();
        plan.validate().unwrap();
        plan
    }

    #[test]
    fn test_parse_plan_defaults() {
        let plan = plan(
            r#"
name: demo
tasks:
  b:
    command: echo b
    depends_on: [a]
    required: false
    metadata:
      owner: evals
  a:
    command: echo a
"#,
        );
        assert_eq!(plan.name.as_deref(), Some("demo"));
        assert!(plan.tasks["a"].required);
        assert!(!plan.tasks["b"].required);
        assert_eq!(plan.tasks["b"].metadata["owner"], json!("evals"));

        let tasks = plan.into_tasks();
        let ids: Vec<&str> = tasks.iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(tasks[1].dependencies(), ["a".to_string()]);
    }

    #[test]
    fn test_from_file_json_and_invalid() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"tasks": {{"x": {{"command": "true"}}}}}}"#).unwrap();
        let loaded = Plan::from_file(file.path()).unwrap();
        assert_eq!(loaded.tasks.len(), 1);

        let mut bad = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(bad, "tasks:\n  x:\n    command: '  '").unwrap();
        assert!(Plan::from_file(bad.path()).is_err());
    }

    #[test]
    fn test_timeout_out_of_range() {
        for bad in ["1.0e300", "-2", "0"] {
            let yaml = format!("tasks:\n  x:\n    command: 'true'\n    timeout_secs: {}\n", bad);
            let parsed: Plan = serde_yaml::from_str(&yaml).unwrap();
            assert!(parsed.validate().is_err(), "timeout {} accepted", bad);
            assert_eq!(parsed.into_tasks().len(), 1);
        }
    }

    #[test]
    fn test_parse_stdout() {
        assert_eq!(parse_stdout("{\"score\": 3}\n"), json!({"score": 3}));
        assert_eq!(parse_stdout("  hello\n"), json!("hello"));
    }

    #[tokio::test]
    async fn test_commands_run_with_dependency_outputs() {
        let plan = plan(
            r#"
tasks:
  a:
    command: echo '{"score":7}'
  b:
    command: echo "$PROMPTLAB_TASK_ID:$PROMPTLAB_DEPENDENCIES"
    depends_on: [a]
"#,
        );
        let results = ConcurrentExecutor::new(2)
            .execute_with_dependencies(plan.into_tasks(), None, None)
            .await
            .unwrap();

        assert_eq!(results[0].result, Some(json!({"score": 7})));
        assert_eq!(results[1].result, Some(json!("b:{\"a\":{\"score\":7}}")));
    }

    #[tokio::test]
    async fn test_failing_and_slow_commands() {
        let plan = plan(
            r#"
tasks:
  fails:
    command: echo nope >&2; exit 3
  slow:
    command: sleep 5
    timeout_secs: 0.2
"#,
        );
        let results = ConcurrentExecutor::new(2)
            .execute_concurrent(plan.into_tasks(), None)
            .await;

        assert_eq!(results[0].error_type.as_deref(), Some("CommandError"));
        assert!(results[0].error.as_deref().unwrap().contains("nope"));
        assert_eq!(results[1].error_type.as_deref(), Some("TimeoutError"));
    }

    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("still-alive");
        let yaml = format!(
            "tasks:\n  spawner:\n    command: \"(sleep 1; touch '{}') & sleep 30\"\n    timeout_secs: 0.3\n",
            marker.display()
        );
        let plan = plan(&yaml);

        let results = ConcurrentExecutor::new(1)
            .execute_concurrent(plan.into_tasks(), None)
            .await;
        assert_eq!(results[0].error_type.as_deref(), Some("TimeoutError"));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
