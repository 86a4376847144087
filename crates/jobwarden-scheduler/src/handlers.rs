//! Built-in job handlers available to the `jobwarden` binary.
//!
//! - `log`  : writes the payload to the log
//! - `sleep`: waits `{"secs": n}` seconds
//! - `shell`: runs `{"command": "...", "timeout_secs": n}` through `sh -c`
//! - `fail` : always fails, echoing the payload

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use jobwarden_core::error::Result;

use crate::registry::HandlerRegistry;

const DEFAULT_SHELL_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Deserialize)]
struct SleepArgs {
    secs: f64,
}

#[derive(Debug, Deserialize)]
struct ShellArgs {
    command: String,
    #[serde(default = "default_shell_timeout")]
    timeout_secs: u64,
}

fn default_shell_timeout() -> u64 {
    DEFAULT_SHELL_TIMEOUT_SECS
}

/// Register every built-in handler.
pub fn register_builtins(registry: &mut HandlerRegistry) -> Result<()> {
    registry.register("log", |payload| async move {
        tracing::info!("📝 {}", payload);
        Ok(())
    })?;

    registry.register("sleep", |payload| async move {
        let args: SleepArgs =
            serde_json::from_value(payload).context("sleep expects {\"secs\": <number>}")?;
        anyhow::ensure!(
            args.secs.is_finite() && args.secs >= 0.0,
            "sleep duration must be a non-negative number, got {}",
            args.secs
        );
        tokio::time::sleep(Duration::from_secs_f64(args.secs)).await;
        Ok(())
    })?;

    registry.register("shell", |payload| async move {
        let args: ShellArgs = serde_json::from_value(payload)
            .context("shell expects {\"command\": \"...\", \"timeout_secs\": <n>}")?;
        run_shell(&args).await
    })?;

    registry.register("fail", |payload| async move {
        anyhow::bail!("job failed on request: {payload}")
    })?;

    Ok(())
}

async fn run_shell(args: &ShellArgs) -> anyhow::Result<()> {
    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&args.command)
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(Duration::from_secs(args.timeout_secs), child)
        .await
        .map_err(|_| anyhow::anyhow!("command timed out after {}s", args.timeout_secs))?
        .with_context(|| format!("failed to spawn `{}`", args.command))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        tracing::debug!("🐚 {}", stdout.trim_end());
    }
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "`{}` exited with {}: {}",
            args.command,
            output.status,
            stderr.trim()
        );
    }
    Ok(())
}
