//! The `Policy` capability: approve or reject an event independently of
//! protocol mechanics.
//!
//! The production implementation runs the policy as a separate process
//! speaking JSON lines over stdio (the strfry plugin convention): one
//! request object in, one verdict object out, with an explicit per-call
//! deadline. When no policy executable is configured, or it cannot be
//! spawned, the relay degrades to allow-all rather than failing startup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use starling_common::Event;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

/// Outcome of one policy evaluation. Produced once per event per call; the
/// pipeline's dedupe window is the only cache.
#[derive(Debug, Clone)]
pub struct PolicyVerdict {
    pub event_id: String,
    pub allowed: bool,
    /// Human-readable reason, safe to show to clients.
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy call timed out")]
    Timeout,

    #[error("policy process error: {0}")]
    Process(String),

    #[error("policy protocol error: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait Policy: Send + Sync {
    async fn call(&self, event: &Event) -> Result<PolicyVerdict, PolicyError>;
}

/// The verdict every event gets when no policy is configured.
#[derive(Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl Policy for AllowAll {
    async fn call(&self, event: &Event) -> Result<PolicyVerdict, PolicyError> {
        Ok(PolicyVerdict {
            event_id: event.id.clone(),
            allowed: true,
            reason: String::new(),
        })
    }
}

#[derive(Serialize)]
struct PolicyRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    event: &'a Event,
}

#[derive(Deserialize)]
struct PolicyResponse {
    id: String,
    action: String,
    #[serde(default)]
    msg: String,
}

struct PolicyPipes {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Out-of-process policy plugin over JSON lines.
pub struct ExternalPolicy {
    pipes: Mutex<PolicyPipes>,
    timeout: Duration,
    // Held so the child is reaped on drop.
    _child: Child,
}

impl ExternalPolicy {
    /// Spawn the policy executable. Callers fall back to [`AllowAll`] when
    /// this fails.
    pub fn spawn(command: &str, timeout: Duration) -> Result<Self, PolicyError> {
        let mut child = Command::new(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PolicyError::Process(format!("failed to spawn {command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PolicyError::Process("policy stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| PolicyError::Process("policy stdout unavailable".into()))?;

        Ok(Self {
            pipes: Mutex::new(PolicyPipes { stdin, stdout }),
            timeout,
            _child: child,
        })
    }

    async fn round_trip(&self, event: &Event) -> Result<PolicyResponse, PolicyError> {
        let mut line = serde_json::to_string(&PolicyRequest {
            kind: "new",
            event,
        })
        .map_err(|e| PolicyError::Protocol(e.to_string()))?;
        line.push('\n');

        // Calls are serialized; the plugin protocol is one line in, one out.
        let mut pipes = self.pipes.lock().await;
        pipes
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| PolicyError::Process(e.to_string()))?;
        pipes
            .stdin
            .flush()
            .await
            .map_err(|e| PolicyError::Process(e.to_string()))?;

        let mut response = String::new();
        let read = pipes
            .stdout
            .read_line(&mut response)
            .await
            .map_err(|e| PolicyError::Process(e.to_string()))?;
        if read == 0 {
            return Err(PolicyError::Process("policy process closed stdout".into()));
        }

        serde_json::from_str(&response).map_err(|e| PolicyError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl Policy for ExternalPolicy {
    async fn call(&self, event: &Event) -> Result<PolicyVerdict, PolicyError> {
        let response = tokio::time::timeout(self.timeout, self.round_trip(event))
            .await
            .map_err(|_| PolicyError::Timeout)??;

        if response.id != event.id {
            return Err(PolicyError::Protocol(format!(
                "verdict id {} does not match event {}",
                response.id, event.id
            )));
        }

        Ok(PolicyVerdict {
            event_id: response.id,
            allowed: response.action == "accept",
            reason: response.msg,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> Event {
        Event {
            id: "aa".repeat(32),
            pubkey: "bb".repeat(32),
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[tokio::test]
    async fn allow_all_allows() {
        let verdict = AllowAll.call(&event()).await.unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.event_id, event().id);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_not_panicked() {
        let err = ExternalPolicy::spawn("/nonexistent/policy-bin", Duration::from_secs(1));
        assert!(matches!(err, Err(PolicyError::Process(_))));
    }
}
