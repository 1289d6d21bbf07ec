use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use uuid::Uuid;

use crate::scheduler::Process;

/// Runs the function named by a leased process.
///
/// `Ok` carries the output values the process is closed with; `Err` carries
/// the message it is failed with.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn handle(&self, process: &Process) -> Result<Vec<Value>, String>;
}

/// Executes `func_name` followed by the process args as a shell command.
///
/// String args are passed verbatim, other values as JSON. Parent outputs are
/// exposed as a JSON array in `COLONY_INPUT`. Non-empty stdout becomes the
/// single output value.
#[derive(Debug, Clone, Default)]
pub struct ShellHandler;

impl ShellHandler {
    pub fn new() -> Self {
        Self
    }

    pub fn command_line(process: &Process) -> String {
        let mut parts = vec![process.spec.func_name.clone()];
        parts.extend(process.spec.args.iter().map(|arg| match arg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }));
        parts.join(" ")
    }

    fn process_output(
        process_id: Uuid,
        result: std::io::Result<std::process::Output>,
    ) -> Result<Vec<Value>, String> {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();

                tracing::info!(
                    process_id = %process_id,
                    success = output.status.success(),
                    exit_code = ?exit_code,
                    "Command finished"
                );

                if !output.status.success() {
                    return Err(if stderr.is_empty() {
                        format!("Exit code: {:?}", exit_code)
                    } else {
                        stderr
                    });
                }
                if stdout.is_empty() {
                    Ok(Vec::new())
                } else {
                    Ok(vec![Value::String(stdout)])
                }
            }
            Err(e) => {
                tracing::error!(process_id = %process_id, error = %e, "Command could not be started");
                Err(e.to_string())
            }
        }
    }
}

#[async_trait]
impl FunctionHandler for ShellHandler {
    async fn handle(&self, process: &Process) -> Result<Vec<Value>, String> {
        let command = Self::command_line(process);
        tracing::info!(process_id = %process.id, command = %command, "Executing process");

        let input = Value::Array(process.input.clone()).to_string();
        let result = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .envs(&process.spec.env)
            .env("COLONY_INPUT", input)
            .env("COLONY_PROCESS_ID", process.id.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        Self::process_output(process.id, result)
    }
}
