//! The typed plan model produced by [`crate::load`].

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use ttpforge_types::OutputFilter;

/// A single loaded TTP document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub name: Option<String>,
    pub description: Option<String>,
    pub env: HashMap<String, String>,
    pub args: Vec<ArgumentSpec>,
    pub steps: Vec<Step>,
    /// Directory containing the source document; the base for relative
    /// path resolution.
    pub working_dir: PathBuf,
}

/// One unit of execution in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub body: StepBody,
    pub executor: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub condition: Option<String>,
    pub chdir: bool,
    pub outputs: HashMap<String, Vec<OutputFilter>>,
    pub cleanup: Option<Cleanup>,
}

/// The discriminated shape of a step: exactly one of inline script, file
/// reference, or nested sub-plan reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepBody {
    Inline(String),
    File(String),
    SubPlan(String),
}

/// A rollback action attached to a step, restricted to inline/file shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cleanup {
    pub name: String,
    pub body: CleanupBody,
    pub executor: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupBody {
    Inline(String),
    File(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgType {
    String,
    Int,
    Bool,
    Path,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentSpec {
    pub name: String,
    pub ty: ArgType,
    pub default: Option<String>,
    pub choices: Option<Vec<String>>,
    pub format: Option<String>,
    pub description: Option<String>,
}

/// The host operating system, as seen by executor inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HostOs {
    Windows,
    Other,
}

impl HostOs {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            HostOs::Windows
        } else {
            HostOs::Other
        }
    }
}

impl Step {
    /// The executor tag to launch this step with: the explicit `executor`
    /// field if set, otherwise inferred from the step's shape and (for
    /// `File` steps) its extension. `SubPlan` steps have no executor.
    pub fn resolved_executor(&self, host_os: HostOs) -> Option<String> {
        if let Some(explicit) = &self.executor {
            return Some(explicit.clone());
        }
        match &self.body {
            StepBody::Inline(_) => Some("bash".to_string()),
            StepBody::File(reference) => Some(infer_executor_from_extension(reference, host_os)),
            StepBody::SubPlan(_) => None,
        }
    }
}

impl Cleanup {
    pub fn resolved_executor(&self, host_os: HostOs) -> Option<String> {
        if let Some(explicit) = &self.executor {
            return Some(explicit.clone());
        }
        match &self.body {
            CleanupBody::Inline(_) => Some("bash".to_string()),
            CleanupBody::File(reference) => Some(infer_executor_from_extension(reference, host_os)),
        }
    }
}

fn infer_executor_from_extension(reference: &str, os: HostOs) -> String {
    let ext = std::path::Path::new(reference)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    match ext {
        "sh" => "sh".to_string(),
        "py" => "python3".to_string(),
        "rb" => "ruby".to_string(),
        "ps1" | "pwsh" => "powershell".to_string(),
        "bat" => "cmd.exe".to_string(),
        "" => "binary".to_string(),
        _ => match os {
            HostOs::Windows => "cmd.exe".to_string(),
            HostOs::Other => "sh".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_step_defaults_to_bash() {
        let step = Step {
            name: "a".into(),
            body: StepBody::Inline("echo hi".into()),
            executor: None,
            args: vec![],
            env: HashMap::new(),
            condition: None,
            chdir: false,
            outputs: HashMap::new(),
            cleanup: None,
        };
        assert_eq!(step.resolved_executor(HostOs::Other).as_deref(), Some("bash"));
    }

    #[test]
    fn explicit_executor_wins_over_inference() {
        let step = Step {
            name: "a".into(),
            body: StepBody::File("run.sh".into()),
            executor: Some("zsh".into()),
            args: vec![],
            env: HashMap::new(),
            condition: None,
            chdir: false,
            outputs: HashMap::new(),
            cleanup: None,
        };
        assert_eq!(step.resolved_executor(HostOs::Other).as_deref(), Some("zsh"));
    }

    #[test]
    fn file_extension_inference_table() {
        assert_eq!(infer_executor_from_extension("x.sh", HostOs::Other), "sh");
        assert_eq!(infer_executor_from_extension("x.py", HostOs::Other), "python3");
        assert_eq!(infer_executor_from_extension("x.rb", HostOs::Other), "ruby");
        assert_eq!(infer_executor_from_extension("x.ps1", HostOs::Other), "powershell");
        assert_eq!(infer_executor_from_extension("x.pwsh", HostOs::Other), "powershell");
        assert_eq!(infer_executor_from_extension("x.bat", HostOs::Other), "cmd.exe");
        assert_eq!(infer_executor_from_extension("x", HostOs::Other), "binary");
    }

    #[test]
    fn unrecognized_extension_falls_back_to_os_default() {
        assert_eq!(infer_executor_from_extension("x.exe", HostOs::Windows), "cmd.exe");
        assert_eq!(infer_executor_from_extension("x.exe", HostOs::Other), "sh");
    }

    #[test]
    fn subplan_step_has_no_executor() {
        let step = Step {
            name: "a".into(),
            body: StepBody::SubPlan("nested.yaml".into()),
            executor: None,
            args: vec![],
            env: HashMap::new(),
            condition: None,
            chdir: false,
            outputs: HashMap::new(),
            cleanup: None,
        };
        assert_eq!(step.resolved_executor(HostOs::Other), None);
    }
}
