//! Phase B of a run: execute steps in order, record outputs, and unwind the
//! cleanup stack once forward progress stops — whether by completion or by
//! a step failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use ttpforge_exec::{compose_env, condition_allows, execute_cleanup, execute_step, ExecOutcome, Launch, LaunchBody};
use ttpforge_expand::{expand, expand_env_value, ExpansionContext};
use ttpforge_loader::{Cleanup, CleanupBody, HostOs, Plan, Step, StepBody};
use ttpforge_types::{Filesystem, Result, StepOutput, TtpForgeError};

use crate::cleanup::{CleanupEntry, CleanupStack};
use crate::events::{EventEmitter, RunEvent};
use crate::validate::{validate_plan, ResolvedStep, BINARY_SENTINEL};

/// Controls for one top-level run.
pub struct RunConfig {
    pub no_cleanup: bool,
    pub inventory: Vec<PathBuf>,
    pub timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { no_cleanup: false, inventory: Vec::new(), timeout: ttpforge_exec::DEFAULT_TIMEOUT }
    }
}

/// The outcome of a fully successful plan run.
pub struct RunReport {
    pub step_outputs: IndexMap<String, StepOutput>,
}

/// Validate, then execute, `plan`. On a step failure, the cleanup stack is
/// still unwound (unless [`RunConfig::no_cleanup`]) before the original
/// error is returned.
pub async fn run(
    plan: &Plan,
    bound_args: &HashMap<String, serde_json::Value>,
    config: &RunConfig,
    fs: &dyn Filesystem,
    cancel: &CancellationToken,
    events: &EventEmitter,
) -> Result<RunReport> {
    let resolved = validate_plan(plan, &config.inventory, fs, true)?;

    let plan_label = plan.name.clone().unwrap_or_else(|| "<unnamed>".to_string());
    events.emit(RunEvent::PlanStarted { plan_name: plan_label.clone(), step_count: plan.steps.len() });

    let mut steps_map: IndexMap<String, StepOutput> = IndexMap::new();
    let mut cleanup_stack = CleanupStack::default();

    let run_result = execute_top_steps(
        &plan.steps,
        &resolved,
        plan,
        bound_args,
        &mut steps_map,
        &mut cleanup_stack,
        config,
        cancel,
        events,
    )
    .await;

    if !config.no_cleanup {
        let errors = unwind(&mut cleanup_stack, bound_args, &steps_map, &config.inventory, fs, config.timeout, cancel, events).await;
        for (step_name, err) in &errors {
            tracing::error!(step = %step_name, error = %err, "cleanup failed during unwind");
        }
    }

    match run_result {
        Ok(()) => {
            events.emit(RunEvent::PlanCompleted {
                plan_name: plan_label,
                completed_steps: steps_map.keys().cloned().collect(),
            });
            Ok(RunReport { step_outputs: steps_map })
        }
        Err(e) => {
            events.emit(RunEvent::PlanFailed { plan_name: plan_label, error: e.to_string() });
            Err(e)
        }
    }
}

/// Execute a plan's top-level steps, dispatching `SubPlan` steps to
/// [`execute_sub_steps`] over their pre-loaded, pre-validated nested plan.
async fn execute_top_steps(
    steps: &[Step],
    resolved: &[ResolvedStep],
    plan: &Plan,
    bound_args: &HashMap<String, serde_json::Value>,
    steps_map: &mut IndexMap<String, StepOutput>,
    cleanup_stack: &mut CleanupStack,
    config: &RunConfig,
    cancel: &CancellationToken,
    events: &EventEmitter,
) -> Result<()> {
    for (step, resolved_step) in steps.iter().zip(resolved.iter()) {
        let public_name = step.name.clone();
        events.emit(RunEvent::StepStarted { step: public_name.clone() });

        let outcome: Result<ExecOutcome> = if matches!(step.body, StepBody::SubPlan(_)) {
            if !condition_allows(step.condition.as_deref()) {
                Ok(ExecOutcome::Skipped)
            } else {
                let sub_plan = resolved_step.sub_plan.as_ref().expect("sub-plan resolved at validate time");
                let sub_resolved = resolved_step
                    .sub_plan_resolved
                    .as_ref()
                    .expect("sub-plan resolved at validate time");
                // A sub-plan is its own document with its own argument
                // contract — bind its defaults independently rather than
                // inheriting the parent's bound CLI arguments.
                let sub_bound_args = ttpforge_loader::bind(&sub_plan.args, &[]);
                match sub_bound_args {
                    Ok(sub_bound_args) => execute_sub_steps(
                        &sub_plan.steps,
                        sub_resolved,
                        sub_plan,
                        &public_name,
                        &sub_bound_args,
                        steps_map,
                        cleanup_stack,
                        config,
                        cancel,
                        events,
                    )
                    .await
                    .map(|last| ExecOutcome::Completed(last.unwrap_or_else(|| StepOutput::from_raw(true, String::new())))),
                    Err(e) => Err(e),
                }
            }
        } else {
            execute_one_step(step, resolved_step, plan, bound_args, steps_map, config.timeout, cancel).await
        };

        handle_outcome(step, &public_name, outcome, plan, steps_map, cleanup_stack, events)?;
    }
    Ok(())
}

/// Execute a sub-plan's own steps inline in the parent's variable-resolution
/// scope (the shared `steps_map` and `cleanup_stack`), namespacing each
/// inner step's recorded output under `<prefix>.<inner-name>`. Validation
/// already guarantees none of `steps` is itself a `SubPlan`.
async fn execute_sub_steps(
    steps: &[Step],
    resolved: &[ResolvedStep],
    owning_plan: &Plan,
    prefix: &str,
    bound_args: &HashMap<String, serde_json::Value>,
    steps_map: &mut IndexMap<String, StepOutput>,
    cleanup_stack: &mut CleanupStack,
    config: &RunConfig,
    cancel: &CancellationToken,
    events: &EventEmitter,
) -> Result<Option<StepOutput>> {
    let mut last_output = None;

    for (step, resolved_step) in steps.iter().zip(resolved.iter()) {
        debug_assert!(
            !matches!(step.body, StepBody::SubPlan(_)),
            "a sub-plan's own steps cannot themselves be sub-plans"
        );
        let public_name = format!("{prefix}.{}", step.name);
        events.emit(RunEvent::StepStarted { step: public_name.clone() });

        let outcome = execute_one_step(step, resolved_step, owning_plan, bound_args, steps_map, config.timeout, cancel).await;
        if let Some(output) = handle_outcome(step, &public_name, outcome, owning_plan, steps_map, cleanup_stack, events)? {
            last_output = Some(output);
        }
    }

    Ok(last_output)
}

/// React to one step's outcome: emit the matching event, push a cleanup if
/// the step succeeded and declares one, and record its output. Returns the
/// recorded output (`None` for a skip), or propagates the step's error.
fn handle_outcome(
    step: &Step,
    public_name: &str,
    outcome: Result<ExecOutcome>,
    owning_plan: &Plan,
    steps_map: &mut IndexMap<String, StepOutput>,
    cleanup_stack: &mut CleanupStack,
    events: &EventEmitter,
) -> Result<Option<StepOutput>> {
    match outcome {
        Ok(ExecOutcome::Skipped) => {
            events.emit(RunEvent::StepSkipped { step: public_name.to_string() });
            Ok(None)
        }
        Ok(ExecOutcome::Completed(output)) => {
            events.emit(RunEvent::StepSucceeded { step: public_name.to_string() });
            if let Some(cleanup) = &step.cleanup {
                cleanup_stack.push(CleanupEntry {
                    step_name: public_name.to_string(),
                    cleanup: cleanup.clone(),
                    env_snapshot: compose_env(&owning_plan.env, &step.env),
                    work_dir: owning_plan.working_dir.clone(),
                });
            }
            steps_map.insert(public_name.to_string(), output.clone());
            Ok(Some(output))
        }
        Err(e) => {
            events.emit(RunEvent::StepFailed { step: public_name.to_string(), error: e.to_string() });
            Err(e)
        }
    }
}

/// Expand, launch, and capture the output of one `Inline`/`File` step.
async fn execute_one_step(
    step: &Step,
    resolved: &ResolvedStep,
    owning_plan: &Plan,
    bound_args: &HashMap<String, serde_json::Value>,
    steps_map: &IndexMap<String, StepOutput>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ExecOutcome> {
    let host_os = HostOs::current();
    let executor = step.resolved_executor(host_os);

    let steps_view = snapshot_steps(steps_map);
    let ctx = ExpansionContext { steps: &steps_view, args: bound_args, workdir: &owning_plan.working_dir };

    let expanded_env = expand_env_map(&owning_plan.env, &step.env, &ctx)?;
    let expanded_args = expand_args(&step.args, &ctx)?;

    let body_owned;
    let chdir_to;
    match &step.body {
        StepBody::Inline(script) => {
            body_owned = expand(script, &ctx)?;
            chdir_to = None;
        }
        StepBody::File(_) => {
            body_owned = String::new();
            let path = resolved.resolved_path.as_deref().expect("file step resolved at validate time");
            chdir_to = if step.chdir { path.parent() } else { None };
        }
        StepBody::SubPlan(_) => unreachable!("sub-plan steps are dispatched by execute_top_steps"),
    }

    let body = match &step.body {
        StepBody::Inline(_) => LaunchBody::Inline(&body_owned),
        StepBody::File(_) => LaunchBody::File {
            path: resolved.resolved_path.as_deref().expect("file step resolved at validate time"),
            binary: executor.as_deref() == Some(BINARY_SENTINEL),
        },
        StepBody::SubPlan(_) => unreachable!(),
    };

    let launch = Launch {
        label: &step.name,
        executor: executor.as_deref().unwrap_or(""),
        body,
        args: &expanded_args,
        env: expanded_env,
        working_dir: &owning_plan.working_dir,
        chdir_to,
        timeout,
    };

    let outcome = execute_step(step.condition.as_deref(), launch, cancel).await?;

    match outcome {
        ExecOutcome::Skipped => Ok(ExecOutcome::Skipped),
        ExecOutcome::Completed(mut output) => {
            if !step.outputs.is_empty() {
                output.outputs = ttpforge_filter::apply_named_outputs(&output.raw_stdout, &step.outputs)?;
            }
            Ok(ExecOutcome::Completed(output))
        }
    }
}

/// Pop every pending cleanup in LIFO order and run it, tolerating and
/// logging individual failures rather than aborting the unwind.
async fn unwind(
    cleanup_stack: &mut CleanupStack,
    bound_args: &HashMap<String, serde_json::Value>,
    steps_map: &IndexMap<String, StepOutput>,
    inventory: &[PathBuf],
    fs: &dyn Filesystem,
    timeout: Duration,
    cancel: &CancellationToken,
    events: &EventEmitter,
) -> Vec<(String, TtpForgeError)> {
    let mut errors = Vec::new();
    for entry in cleanup_stack.drain_lifo() {
        events.emit(RunEvent::CleanupStarted { step: entry.step_name.clone() });
        match run_cleanup_entry(&entry, bound_args, steps_map, inventory, fs, timeout, cancel).await {
            Ok(()) => events.emit(RunEvent::CleanupSucceeded { step: entry.step_name.clone() }),
            Err(e) => {
                events.emit(RunEvent::CleanupFailed { step: entry.step_name.clone(), error: e.to_string() });
                errors.push((entry.step_name, e));
            }
        }
    }
    errors
}

async fn run_cleanup_entry(
    entry: &CleanupEntry,
    bound_args: &HashMap<String, serde_json::Value>,
    steps_map: &IndexMap<String, StepOutput>,
    inventory: &[PathBuf],
    fs: &dyn Filesystem,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let host_os = HostOs::current();
    let executor = entry.cleanup.resolved_executor(host_os);

    let steps_view = snapshot_steps(steps_map);
    let ctx = ExpansionContext { steps: &steps_view, args: bound_args, workdir: &entry.work_dir };

    let expanded_args = expand_args(&entry.cleanup.args, &ctx)?;

    let mut expanded_local_env = HashMap::with_capacity(entry.cleanup.env.len());
    for (k, v) in &entry.cleanup.env {
        expanded_local_env.insert(k.clone(), expand_env_value(v, &ctx)?);
    }
    // Overlay onto the snapshot taken when this cleanup was pushed, not the
    // live plan env — later steps' env mutations must not retroactively
    // alter an already-pushed cleanup (§5 ordering guarantee (c)).
    let mut env = entry.env_snapshot.clone();
    env.extend(expanded_local_env);

    let mut resolved_file_path = None;
    let body_owned = match &entry.cleanup.body {
        CleanupBody::Inline(script) => expand(script, &ctx)?,
        CleanupBody::File(reference) => {
            resolved_file_path = Some(ttpforge_resolve::resolve(reference, &entry.work_dir, inventory, fs)?);
            String::new()
        }
    };

    let body = match &entry.cleanup.body {
        CleanupBody::Inline(_) => LaunchBody::Inline(&body_owned),
        CleanupBody::File(_) => LaunchBody::File {
            path: resolved_file_path.as_deref().expect("resolved above"),
            binary: executor.as_deref() == Some(BINARY_SENTINEL),
        },
    };

    let launch = Launch {
        label: &entry.cleanup.name,
        executor: executor.as_deref().unwrap_or(""),
        body,
        args: &expanded_args,
        env,
        working_dir: &entry.work_dir,
        chdir_to: None,
        timeout,
    };

    let _ = execute_cleanup(launch, cancel).await?;
    Ok(())
}

fn snapshot_steps(steps_map: &IndexMap<String, StepOutput>) -> HashMap<String, StepOutput> {
    steps_map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn expand_env_map(
    plan_env: &HashMap<String, String>,
    local_env: &HashMap<String, String>,
    ctx: &ExpansionContext<'_>,
) -> Result<HashMap<String, String>> {
    let mut expanded_plan = HashMap::with_capacity(plan_env.len());
    for (k, v) in plan_env {
        expanded_plan.insert(k.clone(), expand_env_value(v, ctx)?);
    }
    let mut expanded_local = HashMap::with_capacity(local_env.len());
    for (k, v) in local_env {
        expanded_local.insert(k.clone(), expand_env_value(v, ctx)?);
    }
    Ok(compose_env(&expanded_plan, &expanded_local))
}

fn expand_args(args: &[String], ctx: &ExpansionContext<'_>) -> Result<Vec<String>> {
    args.iter().map(|a| expand(a, ctx)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ttpforge_types::LocalFilesystem;

    fn leaf_step(name: &str, inline: &str, cleanup: Option<Cleanup>) -> Step {
        Step {
            name: name.to_string(),
            body: StepBody::Inline(inline.to_string()),
            executor: None,
            args: vec![],
            env: HashMap::new(),
            condition: None,
            chdir: false,
            outputs: HashMap::new(),
            cleanup,
        }
    }

    #[tokio::test]
    async fn failing_step_unwinds_cleanups_in_lifo_order_then_returns_original_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("order.log");

        let mk_step = |name: &str, cleanup_line: &str| {
            leaf_step(
                name,
                "true",
                Some(Cleanup {
                    name: format!("cleanup-{name}"),
                    body: CleanupBody::Inline(format!("echo {cleanup_line} >> {}", log.display())),
                    executor: None,
                    args: vec![],
                    env: HashMap::new(),
                }),
            )
        };

        let plan = Plan {
            name: Some("fails".into()),
            description: None,
            env: HashMap::new(),
            args: vec![],
            steps: vec![mk_step("a", "cleanup-a"), mk_step("b", "cleanup-b"), leaf_step("c", "exit 7", None)],
            working_dir: dir.path().to_path_buf(),
        };

        let config = RunConfig { no_cleanup: false, inventory: vec![], timeout: Duration::from_secs(10) };
        let err = run(
            &plan,
            &HashMap::new(),
            &config,
            &LocalFilesystem,
            &CancellationToken::new(),
            &EventEmitter::default(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), "ExecError");
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "cleanup-b\ncleanup-a\n");
    }

    #[tokio::test]
    async fn skipped_step_does_not_push_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker.txt");

        let mut step = leaf_step(
            "a",
            "echo hi",
            Some(Cleanup {
                name: "cleanup-a".into(),
                body: CleanupBody::Inline(format!("touch {}", marker.display())),
                executor: None,
                args: vec![],
                env: HashMap::new(),
            }),
        );
        step.condition = Some("freebsd".into());

        let plan = Plan {
            name: None,
            description: None,
            env: HashMap::new(),
            args: vec![],
            steps: vec![step],
            working_dir: dir.path().to_path_buf(),
        };

        let config = RunConfig { no_cleanup: false, inventory: vec![], timeout: Duration::from_secs(10) };
        let report = run(
            &plan,
            &HashMap::new(),
            &config,
            &LocalFilesystem,
            &CancellationToken::new(),
            &EventEmitter::default(),
        )
        .await
        .unwrap();

        assert!(report.step_outputs.is_empty());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn invalid_step_aborts_before_any_subprocess_runs() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker.txt");

        let good = leaf_step("a", &format!("touch {}", marker.display()), None);
        let mut bad = leaf_step("b", "echo hi", None);
        bad.executor = Some("definitely-not-a-real-binary-xyz".into());

        let plan = Plan {
            name: None,
            description: None,
            env: HashMap::new(),
            args: vec![],
            steps: vec![good, bad],
            working_dir: dir.path().to_path_buf(),
        };

        let config = RunConfig { no_cleanup: false, inventory: vec![], timeout: Duration::from_secs(10) };
        let err = run(
            &plan,
            &HashMap::new(),
            &config,
            &LocalFilesystem,
            &CancellationToken::new(),
            &EventEmitter::default(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), "ValidateError");
        assert!(!marker.exists());
    }
}
