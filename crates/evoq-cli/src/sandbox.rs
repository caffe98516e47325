//! CommandSandbox - runs candidate source with a local interpreter.
//!
//! The source is written to a temp file and run as
//! `<program> <args...> <file> <entry_point>`. The program must print its
//! metrics as a JSON object on the last non-empty line of stdout.
//!
//! This is process isolation only. Point `program` at a container wrapper
//! when candidates are untrusted.

use std::io::Write;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use evoq_core::domain::Payload;
use evoq_core::ports::{ExecutionSandbox, SandboxError, SandboxRequest};
use tokio::process::Command;

const STDERR_TAIL: usize = 2000;

pub struct CommandSandbox {
    program: String,
    args: Vec<String>,
    default_timeout: Duration,
}

impl CommandSandbox {
    pub fn new(program: impl Into<String>, args: Vec<String>, default_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            default_timeout,
        }
    }
}

#[async_trait]
impl ExecutionSandbox for CommandSandbox {
    async fn run(&self, request: &SandboxRequest) -> Result<Payload, SandboxError> {
        let mut file = tempfile::Builder::new()
            .prefix("evoq-candidate-")
            .tempfile()
            .map_err(|e| SandboxError::Unavailable(format!("temp file: {e}")))?;
        file.write_all(request.source.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| SandboxError::Unavailable(format!("temp file: {e}")))?;

        let timeout = request
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(file.path())
            .arg(&request.entry_point)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Unavailable(format!("{}: {e}", self.program)))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|e| SandboxError::Unavailable(e.to_string()))?,
            Err(_) => return Err(SandboxError::Timeout(timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let start = stderr.len().saturating_sub(STDERR_TAIL);
            let tail = stderr.get(start..).unwrap_or(&stderr).trim();
            return Err(SandboxError::Program(format!("{}: {tail}", output.status)));
        }

        parse_metrics(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_metrics(stdout: &str) -> Result<Payload, SandboxError> {
    let last = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| SandboxError::Program("no output".into()))?;
    serde_json::from_str::<Payload>(last.trim())
        .map_err(|e| SandboxError::Program(format!("last line is not a JSON object: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metrics_come_from_last_line() {
        let metrics = parse_metrics("warming up\n{\"fitness\": 0.75}\n\n").unwrap();
        assert_eq!(metrics["fitness"], json!(0.75));
    }

    #[test]
    fn non_object_output_is_a_program_error() {
        assert!(matches!(parse_metrics("42\n"), Err(SandboxError::Program(_))));
        assert!(matches!(parse_metrics(""), Err(SandboxError::Program(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_shell_program() {
        // sh <file> <entry>: the file echoes its first argument as JSON.
        let sandbox = CommandSandbox::new("sh", Vec::new(), Duration::from_secs(5));
        let request = SandboxRequest {
            source: "echo \"{\\\"entry\\\": \\\"$1\\\"}\"\n".into(),
            entry_point: "main".into(),
            timeout_secs: None,
        };
        let metrics = sandbox.run(&request).await.unwrap();
        assert_eq!(metrics["entry"], json!("main"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_program_is_terminal_and_slow_one_times_out() {
        let sandbox = CommandSandbox::new("sh", Vec::new(), Duration::from_secs(5));
        let failing = SandboxRequest {
            source: "echo boom >&2\nexit 3\n".into(),
            entry_point: "main".into(),
            timeout_secs: None,
        };
        let err = sandbox.run(&failing).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("boom"));

        let slow = SandboxRequest {
            source: "sleep 5\n".into(),
            entry_point: "main".into(),
            timeout_secs: Some(0),
        };
        let err = sandbox.run(&slow).await.unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
    }

    #[tokio::test]
    async fn missing_interpreter_is_retryable() {
        let sandbox = CommandSandbox::new("/nonexistent/python", Vec::new(), Duration::from_secs(1));
        let request = SandboxRequest {
            source: String::new(),
            entry_point: "main".into(),
            timeout_secs: None,
        };
        let err = sandbox.run(&request).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
