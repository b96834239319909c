//! Transports available to the command line.
//!
//! `ProcessTransport` pipes each rendered prompt into an external command
//! and reads the model's answer from its stdout, so any scriptable model
//! endpoint can serve as the classifier. Without a configured command the
//! `NullTransport` fails every call permanently and the heuristic fallback
//! carries the run.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use theme_classifier::{ModelTransport, TransportError};

pub struct ProcessTransport {
    command: String,
}

impl ProcessTransport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl ModelTransport for ProcessTransport {
    async fn complete(&self, prompt: &str) -> Result<String, TransportError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| TransportError::Io(format!("spawn failed: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| TransportError::Io(format!("write to model failed: {e}")))?;
            // Closing stdin signals end of prompt.
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        if !output.status.success() {
            return Err(TransportError::Status(
                output.status.code().unwrap_or(1) as u16
            ));
        }
        String::from_utf8(output.stdout)
            .map_err(|e| TransportError::Io(format!("non-utf8 model output: {e}")))
    }
}

/// Fails every call; the analysis then runs entirely on the fallback.
pub struct NullTransport;

#[async_trait]
impl ModelTransport for NullTransport {
    async fn complete(&self, _prompt: &str) -> Result<String, TransportError> {
        Err(TransportError::Auth(
            "no model command configured".to_string(),
        ))
    }
}
