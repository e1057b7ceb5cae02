use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use mergen_types::{HookContext, HookEntry};
use tracing::{debug, warn};

const EVENT_DEADLINE: Duration = Duration::from_secs(20);

/// Executes lifecycle hooks off the request path. HTTP hooks POST the hook
/// context as JSON; exec hooks run a rendered argv. Only `strict` failures
/// are reported back, and only to the detached task's log.
#[derive(Clone)]
pub struct HookRunner {
    client: reqwest::Client,
}

impl HookRunner {
    pub fn new() -> HookRunner {
        HookRunner {
            client: reqwest::Client::new(),
        }
    }

    /// Fire-and-forget execution with the per-event deadline. The caller
    /// never blocks on hook delivery.
    pub fn run_async(&self, event: &str, hooks: Vec<HookEntry>, payload: HookContext) {
        if hooks.is_empty() {
            debug!(event = %event, vm_id = %payload.id, "no hooks to execute");
            return;
        }
        debug!(
            event = %event,
            vm_id = %payload.id,
            hook_count = hooks.len(),
            "scheduling async hook execution"
        );

        let runner = self.clone();
        let event = event.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(EVENT_DEADLINE, runner.run(&event, &hooks, &payload)).await
            {
                Ok(Ok(())) => {
                    debug!(event = %event, vm_id = %payload.id, "hook execution finished")
                }
                Ok(Err(err)) => {
                    warn!(event = %event, vm_id = %payload.id, error = %err, "hook execution finished with errors")
                }
                Err(_) => {
                    warn!(event = %event, vm_id = %payload.id, "hook execution deadline exceeded")
                }
            }
        });
    }

    /// Runs every hook in order; strict failures are collected into the
    /// returned error, non-strict failures are only logged. A failing hook
    /// never blocks the remaining ones.
    pub async fn run(
        &self,
        event: &str,
        hooks: &[HookEntry],
        payload: &HookContext,
    ) -> Result<()> {
        let scope = serde_json::to_value(payload).context("serialize hook context")?;
        let mut strict_failures = Vec::new();

        for (index, hook) in hooks.iter().enumerate() {
            debug!(
                event = %event,
                vm_id = %payload.id,
                index,
                strict = hook.is_strict(),
                "executing hook"
            );
            if let Err(err) = self.execute(hook, payload, &scope).await {
                warn!(event = %event, vm_id = %payload.id, index, error = %err, "hook failed");
                if hook.is_strict() {
                    strict_failures.push(format!("hook {index}: {err:#}"));
                }
            }
        }

        if strict_failures.is_empty() {
            Ok(())
        } else {
            bail!(
                "{} strict hook failure(s): {}",
                strict_failures.len(),
                strict_failures.join("; ")
            )
        }
    }

    async fn execute(
        &self,
        hook: &HookEntry,
        payload: &HookContext,
        scope: &serde_json::Value,
    ) -> Result<()> {
        let work = async {
            match hook {
                HookEntry::Http { url, headers, .. } => {
                    self.exec_http(url, headers, payload).await
                }
                HookEntry::Exec { cmd, .. } => self.exec_command(cmd, scope).await,
            }
        };

        let timeout_ms = hook.timeout_ms();
        if timeout_ms > 0 {
            tokio::time::timeout(Duration::from_millis(timeout_ms), work)
                .await
                .map_err(|_| anyhow::anyhow!("hook timed out after {timeout_ms}ms"))?
        } else {
            work.await
        }
    }

    async fn exec_http(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        payload: &HookContext,
    ) -> Result<()> {
        if url.is_empty() {
            bail!("http hook url is empty");
        }

        let mut request = self.client.post(url).json(payload);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = request.send().await.context("http hook request failed")?;
        if !response.status().is_success() {
            bail!("unexpected response status: {}", response.status());
        }
        Ok(())
    }

    async fn exec_command(&self, cmd: &[String], scope: &serde_json::Value) -> Result<()> {
        if cmd.is_empty() {
            bail!("exec hook command is empty");
        }

        let mut argv = Vec::with_capacity(cmd.len());
        for part in cmd {
            argv.push(render_template(part, scope)?);
        }

        let output = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .await
            .with_context(|| format!("spawn {:?}", argv[0]))?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(stderr.trim());
            }
            bail!("exec hook failed with {}: {combined}", output.status);
        }
        Ok(())
    }
}

impl Default for HookRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal `{{.field}}` template renderer over the serialized hook context.
/// Dotted paths descend into objects; an unknown key fails the hook.
pub fn render_template(input: &str, scope: &serde_json::Value) -> Result<String> {
    let mut out = String::new();
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .with_context(|| format!("unclosed template action in {input:?}"))?;
        let expr = after[..end].trim();
        let path = expr
            .strip_prefix('.')
            .with_context(|| format!("unsupported template action {expr:?}"))?;

        if path.is_empty() {
            out.push_str(&scope.to_string());
        } else {
            out.push_str(&render_value(lookup(scope, path)?));
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

fn lookup<'scope>(scope: &'scope serde_json::Value, path: &str) -> Result<&'scope serde_json::Value> {
    let mut current = scope;
    for segment in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map
                .get(segment)
                .with_context(|| format!("map has no entry for key {segment:?}"))?,
            _ => bail!("cannot descend into non-object value at {segment:?}"),
        };
    }
    Ok(current)
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
