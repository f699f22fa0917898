//! Launches a step or cleanup's subprocess: builds the right argv/stdin
//! shape for its executor, overlays environment, honors `chdir`, enforces a
//! timeout, and tees captured stdio to the host process.

mod condition;

pub use condition::condition_allows;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use ttpforge_types::{Result, StepOutput, TtpForgeError};

/// Default per-step timeout: 100 minutes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(100 * 60);

/// How the target program is invoked.
#[derive(Clone, Copy)]
pub enum LaunchBody<'a> {
    /// The executor is spawned with no arguments; `script` is written to
    /// its stdin and the handle closed.
    Inline(&'a str),
    /// `path` is either spawned directly (`binary: true`) or passed as the
    /// first argument to the executor.
    File { path: &'a Path, binary: bool },
}

/// Everything needed to launch one subprocess, already expanded.
pub struct Launch<'a> {
    /// Step or cleanup name, used only for error messages.
    pub label: &'a str,
    pub executor: &'a str,
    pub body: LaunchBody<'a>,
    /// Already-expanded argument list (meaningful for `File` bodies).
    pub args: &'a [String],
    /// Fully composed and expanded environment: process ⊕ plan ⊕ step/cleanup.
    pub env: HashMap<String, String>,
    /// Working directory for the subprocess, passed straight to
    /// [`Command::current_dir`] — the host process's own cwd is never
    /// touched, so there is nothing to restore.
    pub working_dir: &'a Path,
    pub chdir_to: Option<&'a Path>,
    pub timeout: Duration,
}

/// Captured stdio from a completed (exit 0) subprocess.
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Outcome of running a step through the executor.
pub enum ExecOutcome {
    /// The step's condition did not hold; no subprocess was spawned.
    Skipped,
    Completed(StepOutput),
}

/// Run a step: check its condition, then launch and capture output.
pub async fn execute_step(
    condition: Option<&str>,
    launch: Launch<'_>,
    cancel: &CancellationToken,
) -> Result<ExecOutcome> {
    if !condition_allows(condition) {
        return Ok(ExecOutcome::Skipped);
    }
    let raw = run(launch, cancel).await?;
    Ok(ExecOutcome::Completed(parse_step_output(raw.stdout)))
}

/// Run a cleanup action. Cleanups have no condition; the caller decides
/// whether to run one at all.
pub async fn execute_cleanup(launch: Launch<'_>, cancel: &CancellationToken) -> Result<RawOutput> {
    tracing::debug!(label = launch.label, "running cleanup");
    run(launch, cancel).await
}

/// Parse trimmed stdout as a YAML/JSON mapping if possible, otherwise wrap
/// it as the single-key `{output: <raw>}` mapping.
fn parse_step_output(raw_stdout: String) -> StepOutput {
    let trimmed = raw_stdout.trim().to_string();
    match serde_yaml::from_str::<serde_json::Value>(&trimmed) {
        Ok(value @ serde_json::Value::Object(_)) => StepOutput::from_mapping(true, trimmed, value),
        _ => StepOutput::from_raw(true, trimmed),
    }
}

async fn run(launch: Launch<'_>, cancel: &CancellationToken) -> Result<RawOutput> {
    tracing::debug!(label = launch.label, executor = launch.executor, "launching subprocess");
    let mut cmd = build_command(&launch)?;
    cmd.current_dir(launch.chdir_to.unwrap_or(launch.working_dir));
    cmd.stdin(if matches!(launch.body, LaunchBody::Inline(_)) {
        std::process::Stdio::piped()
    } else {
        std::process::Stdio::null()
    });
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| TtpForgeError::exec(format!("failed to spawn '{}': {e}", launch.label)))?;

    if let LaunchBody::Inline(script) = launch.body {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .await
                .map_err(|e| TtpForgeError::exec(format!("failed to write stdin for '{}': {e}", launch.label)))?;
        }
    }

    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");

    // Drain both pipes concurrently with `wait()`, not after it — a child
    // that writes more than the OS pipe buffer before exiting would
    // otherwise deadlock against a parent blocked in `wait()`.
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| TtpForgeError::exec(format!("failed to wait for '{}': {e}", launch.label)))?;

            let stdout_buf = stdout_task.await.unwrap_or_default();
            let stderr_buf = stderr_task.await.unwrap_or_default();

            let stdout = String::from_utf8_lossy(&stdout_buf).into_owned();
            let stderr = String::from_utf8_lossy(&stderr_buf).into_owned();

            tee(&stdout, &stderr);

            let code = status.code().unwrap_or(-1);
            if code != 0 {
                tracing::warn!(label = launch.label, code, "subprocess exited non-zero");
                return Err(TtpForgeError::exec_nonzero(code, tail(&stdout), tail(&stderr)));
            }
            tracing::debug!(label = launch.label, "subprocess completed");
            Ok(RawOutput { stdout, stderr })
        }
        _ = tokio::time::sleep(launch.timeout) => {
            tracing::warn!(label = launch.label, timeout = ?launch.timeout, "subprocess timed out");
            terminate(&mut child).await;
            Err(TtpForgeError::exec(format!(
                "'{}' timed out after {:?}", launch.label, launch.timeout
            )))
        }
        _ = cancel.cancelled() => {
            tracing::warn!(label = launch.label, "subprocess cancelled");
            terminate(&mut child).await;
            Err(TtpForgeError::exec(format!("'{}' was cancelled", launch.label)))
        }
    }
}

fn build_command(launch: &Launch<'_>) -> Result<Command> {
    let mut cmd = match &launch.body {
        LaunchBody::Inline(_) => Command::new(launch.executor),
        LaunchBody::File { path, binary } => {
            if *binary {
                let mut c = Command::new(path);
                c.args(launch.args);
                c
            } else {
                let mut c = Command::new(launch.executor);
                c.arg(path);
                c.args(launch.args);
                c
            }
        }
    };

    // `launch.env` is already the fully composed environment (process ⊕
    // plan ⊕ step/cleanup, via `compose_env`); start from a clean slate so
    // nothing leaks in that wasn't explicitly layered.
    cmd.env_clear();
    cmd.envs(&launch.env);
    Ok(cmd)
}

fn tail(s: &str) -> String {
    const MAX: usize = 4096;
    if s.len() <= MAX {
        s.to_string()
    } else {
        s[s.len() - MAX..].to_string()
    }
}

fn tee(stdout: &str, stderr: &str) {
    if !stdout.is_empty() {
        print!("{stdout}");
    }
    if !stderr.is_empty() {
        eprint!("{stderr}");
    }
}

#[cfg(unix)]
async fn terminate(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
        tokio::select! {
            _ = child.wait() => {}
            _ = tokio::time::sleep(Duration::from_secs(2)) => {
                let _ = child.kill().await;
            }
        }
    } else {
        let _ = child.kill().await;
    }
}

#[cfg(not(unix))]
async fn terminate(child: &mut tokio::process::Child) {
    let _ = child.kill().await;
}

/// Compose a subprocess environment: inherited process env, overlaid with
/// the plan's `env`, overlaid with the step/cleanup's own `env`.
pub fn compose_env(
    plan_env: &HashMap<String, String>,
    local_env: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(plan_env.clone());
    env.extend(local_env.clone());
    env
}
