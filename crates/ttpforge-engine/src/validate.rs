//! Phase A of a run: validate every step (and the cleanups attached to
//! them) before any subprocess is spawned.

use std::path::PathBuf;

use ttpforge_loader::{Cleanup, CleanupBody, HostOs, Plan, Step, StepBody};
use ttpforge_types::{Filesystem, Result, TtpForgeError};

/// The sentinel `resolved_executor()` value meaning "exec the file directly,
/// no interpreter" — skips the PATH lookup since there is no interpreter to
/// find.
pub const BINARY_SENTINEL: &str = "binary";

/// What validating one step resolved, so execution doesn't repeat the work:
/// the file/sub-plan's absolute path, and, for a sub-plan, its pre-loaded
/// (and already fully validated) nested [`Plan`] plus its own steps'
/// resolutions.
pub struct ResolvedStep {
    pub resolved_path: Option<PathBuf>,
    pub sub_plan: Option<Plan>,
    pub sub_plan_resolved: Option<Vec<ResolvedStep>>,
}

/// Validate every step in `plan`. `allow_subplan` is `false` when validating
/// a nested plan's own steps, enforcing the one-level sub-TTP nesting limit
/// (§4.8). Returns resolutions parallel to `plan.steps`.
pub fn validate_plan(
    plan: &Plan,
    inventory: &[PathBuf],
    fs: &dyn Filesystem,
    allow_subplan: bool,
) -> Result<Vec<ResolvedStep>> {
    tracing::debug!(
        plan = plan.name.as_deref().unwrap_or("<unnamed>"),
        step_count = plan.steps.len(),
        "validating plan"
    );
    let host_os = HostOs::current();
    plan.steps
        .iter()
        .map(|step| validate_step(step, plan, inventory, fs, host_os, allow_subplan))
        .collect()
}

fn validate_step(
    step: &Step,
    plan: &Plan,
    inventory: &[PathBuf],
    fs: &dyn Filesystem,
    host_os: HostOs,
    allow_subplan: bool,
) -> Result<ResolvedStep> {
    let mut out = ResolvedStep { resolved_path: None, sub_plan: None, sub_plan_resolved: None };

    match &step.body {
        StepBody::Inline(_) => {
            check_executor_on_path(step.resolved_executor(host_os).as_deref(), &step.name)?;
        }
        StepBody::File(reference) => {
            out.resolved_path = Some(ttpforge_resolve::resolve(reference, &plan.working_dir, inventory, fs)?);
            check_executor_on_path(step.resolved_executor(host_os).as_deref(), &step.name)?;
        }
        StepBody::SubPlan(reference) => {
            if !allow_subplan {
                return Err(TtpForgeError::validate(format!(
                    "step '{}': a sub-TTP's own steps cannot themselves be sub-TTPs (nesting limit is one level)",
                    step.name
                )));
            }
            let path = ttpforge_resolve::resolve(reference, &plan.working_dir, inventory, fs)?;
            let sub_plan = ttpforge_loader::load(&path, fs)?;
            let sub_resolved = validate_plan(&sub_plan, inventory, fs, false)?;
            out.resolved_path = Some(path);
            out.sub_plan = Some(sub_plan);
            out.sub_plan_resolved = Some(sub_resolved);
        }
    }

    if let Some(cleanup) = &step.cleanup {
        validate_cleanup(cleanup, plan, inventory, fs, host_os)?;
    }

    Ok(out)
}

fn validate_cleanup(
    cleanup: &Cleanup,
    plan: &Plan,
    inventory: &[PathBuf],
    fs: &dyn Filesystem,
    host_os: HostOs,
) -> Result<()> {
    check_executor_on_path(cleanup.resolved_executor(host_os).as_deref(), &cleanup.name)?;
    if let CleanupBody::File(reference) = &cleanup.body {
        ttpforge_resolve::resolve(reference, &plan.working_dir, inventory, fs)?;
    }
    Ok(())
}

fn check_executor_on_path(executor: Option<&str>, label: &str) -> Result<()> {
    let Some(executor) = executor else { return Ok(()) };
    if executor == BINARY_SENTINEL {
        return Ok(());
    }
    which::which(executor)
        .map(|_| ())
        .map_err(|_| TtpForgeError::validate(format!("'{label}': executor '{executor}' not found on PATH")))
}
