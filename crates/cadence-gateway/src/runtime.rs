//! Action runtime adapters.
//!
//! The scheduler only knows the [`ActionRuntime`] trait. The gateway wires
//! it to an HTTP endpoint (or a [`NullRuntime`] when none is configured) and
//! wraps that in a [`CommandStage`] which runs `payload.command` first.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::config::RuntimeConfig;
use cadence_core::truncate::truncate_middle;
use cadence_scheduler::executor::{ActionRequest, ActionResponse, ActionRuntime};
use tracing::{debug, info, warn};

/// Longest command output attached to a message.
const MAX_COMMAND_OUTPUT_CHARS: usize = 8_000;

/// Build the runtime chain from config.
pub fn build_runtime(config: &RuntimeConfig) -> anyhow::Result<Arc<dyn ActionRuntime>> {
    let inner: Arc<dyn ActionRuntime> = match config.endpoint.as_deref() {
        Some(endpoint) if !endpoint.trim().is_empty() => {
            info!(endpoint = %endpoint, "action runtime: HTTP");
            Arc::new(HttpRuntime::new(
                endpoint,
                config.token.clone(),
                config.request_timeout(),
            )?)
        }
        _ => {
            warn!("no action runtime endpoint configured; job runs will fail");
            Arc::new(NullRuntime)
        }
    };
    Ok(Arc::new(CommandStage::new(inner, config.allow_commands)))
}

/// Forwards each request as JSON to an HTTP endpoint that answers `{ok, error?}`.
pub struct HttpRuntime {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpRuntime {
    pub fn new(
        endpoint: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token: token.filter(|t| !t.is_empty()),
        })
    }
}

#[async_trait]
impl ActionRuntime for HttpRuntime {
    async fn execute(&self, request: &ActionRequest) -> ActionResponse {
        debug!(job_id = %request.job_id, "forwarding job to action runtime");

        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(e) => return ActionResponse::failed(format!("action runtime unreachable: {e}")),
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(job_id = %request.job_id, status = status.as_u16(), body = %text, "action runtime error");
            return ActionResponse::failed(format!(
                "action runtime returned HTTP {}: {}",
                status.as_u16(),
                text.trim()
            ));
        }

        match resp.json::<ActionResponse>().await {
            Ok(response) => response,
            Err(e) => ActionResponse::failed(format!("invalid action runtime response: {e}")),
        }
    }
}

/// Placeholder when no runtime endpoint is configured.
pub struct NullRuntime;

#[async_trait]
impl ActionRuntime for NullRuntime {
    async fn execute(&self, _request: &ActionRequest) -> ActionResponse {
        ActionResponse::failed("no action runtime configured")
    }
}

/// Runs `payload.command` with `sh -c` and attaches its output to the
/// message before handing the request to `inner`.
///
/// A command that cannot start or exits non-zero fails the run without
/// calling `inner`. The child is killed if the run times out.
pub struct CommandStage {
    inner: Arc<dyn ActionRuntime>,
    allow_commands: bool,
}

impl CommandStage {
    pub fn new(inner: Arc<dyn ActionRuntime>, allow_commands: bool) -> Self {
        Self {
            inner,
            allow_commands,
        }
    }
}

#[async_trait]
impl ActionRuntime for CommandStage {
    async fn execute(&self, request: &ActionRequest) -> ActionResponse {
        let Some(command) = request.payload.command.as_deref() else {
            return self.inner.execute(request).await;
        };
        if !self.allow_commands {
            return ActionResponse::failed("shell commands are disabled (runtime.allow_commands)");
        }

        match run_command(command).await {
            Ok(output) => {
                let mut forwarded = request.clone();
                forwarded.payload.message = attach_output(&request.payload.message, &output);
                self.inner.execute(&forwarded).await
            }
            Err(reason) => {
                warn!(job_id = %request.job_id, %reason, "job command failed");
                ActionResponse::failed(reason)
            }
        }
    }
}

/// Run `command` through the shell; stdout, or stderr when stdout is empty.
async fn run_command(command: &str) -> Result<String, String> {
    debug!("exec: {command}");
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("command could not start: {e}"))?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if !output.status.success() {
        let code = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        let detail = if stderr.is_empty() { stdout } else { stderr };
        return Err(format!("command exited with status {code}: {detail}")
            .trim_end_matches(": ")
            .to_string());
    }

    let text = if stdout.is_empty() { stderr } else { stdout };
    Ok(truncate_middle(&text, MAX_COMMAND_OUTPUT_CHARS))
}

fn attach_output(message: &str, output: &str) -> String {
    if output.is_empty() {
        message.to_string()
    } else {
        format!("{message}\n```\n{output}\n```")
    }
}
