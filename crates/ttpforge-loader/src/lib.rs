//! Parses a TTP YAML document into a validated [`Plan`] and binds
//! user-supplied arguments against its declared specs.
//!
//! This crate owns the two earliest flow stages — *Load* and
//! *ArgumentBind* — plus the argument-spec self-validation that must
//! happen before either: unique names, `format` restricted to strings,
//! and defaults/choices that parse under their declared type.

mod bind;
mod decode;
mod model;

pub use bind::{bind, validate_specs};
pub use model::{
    ArgType, ArgumentSpec, Cleanup, CleanupBody, HostOs, Plan, Step, StepBody,
};

use std::collections::HashSet;
use std::path::Path;

use regex::Regex;
use ttpforge_types::{Filesystem, Result, TtpForgeError};

const STEP_NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";
const ARG_NAME_RECOMMENDED_PATTERN: &str = r"^[a-z][a-z0-9_]*$";

/// Load a TTP document at `path` through `fs`.
///
/// Sets the plan's working directory to `path`'s containing directory,
/// decodes every step via trial-decode, and validates step-name
/// uniqueness/format and argument-spec self-consistency. Does not touch
/// the filesystem beyond reading `path` itself — file/sub-plan references
/// inside steps are resolved later, during the orchestrator's validate
/// phase.
pub fn load(path: &Path, fs: &dyn Filesystem) -> Result<Plan> {
    let text = fs.read_to_string(path)?;
    let value: serde_json::Value = serde_yaml::from_str(&text)?;

    let working_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| Path::new(".").to_path_buf());

    let plan = decode::decode_plan(&value, working_dir)?;

    validate_step_names(&plan.steps)?;
    bind::validate_specs(&plan.args)?;
    warn_on_nonconforming_arg_names(&plan.args);

    Ok(plan)
}

fn validate_step_names(steps: &[Step]) -> Result<()> {
    let re = Regex::new(STEP_NAME_PATTERN).expect("static pattern is valid");
    let mut seen = HashSet::new();
    for step in steps {
        if !re.is_match(&step.name) {
            return Err(TtpForgeError::load(format!(
                "step name '{}' must match {STEP_NAME_PATTERN}",
                step.name
            )));
        }
        if !seen.insert(step.name.as_str()) {
            return Err(TtpForgeError::load(format!("duplicate step name '{}'", step.name)));
        }
    }
    Ok(())
}

fn warn_on_nonconforming_arg_names(args: &[ArgumentSpec]) {
    let re = Regex::new(ARG_NAME_RECOMMENDED_PATTERN).expect("static pattern is valid");
    for spec in args {
        if !re.is_match(&spec.name) {
            tracing::warn!(
                argument = %spec.name,
                "argument name does not follow the recommended lowercase_with_underscores convention"
            );
        }
    }
}
