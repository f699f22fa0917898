//! Trial-decodes a parsed YAML document into the typed [`Plan`] model.
//!
//! The document has no explicit kind tag for steps or cleanups; the shape
//! is implied by which of `inline` / `file` / `ttp` is present. This module
//! never reads the filesystem — path references are decoded as plain
//! strings and resolved later.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::{Map, Value};
use ttpforge_types::{OutputFilter, Result, TtpForgeError};

use crate::model::{ArgType, ArgumentSpec, Cleanup, CleanupBody, Plan, Step, StepBody};

pub fn decode_plan(value: &Value, working_dir: PathBuf) -> Result<Plan> {
    let obj = value
        .as_object()
        .ok_or_else(|| TtpForgeError::load("ttp document must be a mapping"))?;

    let name = get_str(obj, "name");
    let description = get_str(obj, "description");
    let env = decode_string_map(obj.get("env"), "env")?;

    let args = match obj.get("args") {
        None => Vec::new(),
        Some(v) => {
            let arr = v
                .as_array()
                .ok_or_else(|| TtpForgeError::load("'args' must be a list"))?;
            arr.iter().map(decode_argument_spec).collect::<Result<Vec<_>>>()?
        }
    };

    let steps_value = obj
        .get("steps")
        .ok_or_else(|| TtpForgeError::load("plan is missing required field 'steps'"))?;
    let steps_arr = steps_value
        .as_array()
        .ok_or_else(|| TtpForgeError::load("'steps' must be a list"))?;
    let steps = steps_arr
        .iter()
        .enumerate()
        .map(|(idx, v)| decode_step(v, idx))
        .collect::<Result<Vec<_>>>()?;

    Ok(Plan { name, description, env, args, steps, working_dir })
}

fn get_str(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn decode_string_map(value: Option<&Value>, field: &str) -> Result<HashMap<String, String>> {
    let Some(value) = value else { return Ok(HashMap::new()) };
    let obj = value
        .as_object()
        .ok_or_else(|| TtpForgeError::load(format!("'{field}' must be a mapping")))?;
    obj.iter()
        .map(|(k, v)| {
            let s = v
                .as_str()
                .ok_or_else(|| TtpForgeError::load(format!("'{field}.{k}' must be a string")))?;
            Ok((k.clone(), s.to_string()))
        })
        .collect()
}

fn decode_string_list(value: Option<&Value>, field: &str) -> Result<Vec<String>> {
    let Some(value) = value else { return Ok(Vec::new()) };
    let arr = value
        .as_array()
        .ok_or_else(|| TtpForgeError::load(format!("'{field}' must be a list")))?;
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(String::from)
                .ok_or_else(|| TtpForgeError::load(format!("'{field}' entries must be strings")))
        })
        .collect()
}

fn scalar_to_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(TtpForgeError::load(format!("expected a scalar value, found {other}"))),
    }
}

fn decode_argument_spec(value: &Value) -> Result<ArgumentSpec> {
    let obj = value
        .as_object()
        .ok_or_else(|| TtpForgeError::load("argument spec must be a mapping"))?;

    let name = get_str(obj, "name")
        .ok_or_else(|| TtpForgeError::load("argument spec is missing required field 'name'"))?;

    let ty = match obj.get("type").and_then(|v| v.as_str()) {
        None | Some("string") => ArgType::String,
        Some("int") => ArgType::Int,
        Some("bool") => ArgType::Bool,
        Some("path") => ArgType::Path,
        Some(other) => {
            return Err(TtpForgeError::load(format!("argument '{name}': unknown type '{other}'")))
        }
    };

    let default = obj.get("default").map(scalar_to_string).transpose()?;

    let choices = match obj.get("choices") {
        None => None,
        Some(v) => {
            let arr = v
                .as_array()
                .ok_or_else(|| TtpForgeError::load(format!("argument '{name}': 'choices' must be a list")))?;
            Some(arr.iter().map(scalar_to_string).collect::<Result<Vec<_>>>()?)
        }
    };

    let format = get_str(obj, "format");
    let description = get_str(obj, "description");

    Ok(ArgumentSpec { name, ty, default, choices, format, description })
}

fn decode_step(value: &Value, index: usize) -> Result<Step> {
    let obj = value
        .as_object()
        .ok_or_else(|| TtpForgeError::load("step must be a mapping"))?;

    let name = get_str(obj, "name").unwrap_or_else(|| format!("step-{}", index + 1));
    let (discriminant, text) = decode_body(obj, &["inline", "file", "ttp"], &name)?;
    let body = match discriminant {
        "inline" => StepBody::Inline(text),
        "file" => StepBody::File(text),
        _ => StepBody::SubPlan(text),
    };

    let executor = get_str(obj, "executor");
    let args = decode_string_list(obj.get("args"), "args")?;
    let env = decode_string_map(obj.get("env"), "env")?;
    let condition = get_str(obj, "if");
    let chdir = obj.get("chdir").and_then(|v| v.as_bool()).unwrap_or(false);
    let outputs = decode_outputs(obj.get("outputs"))?;
    let cleanup = obj.get("cleanup").map(|v| decode_cleanup(v, &name)).transpose()?;

    Ok(Step { name, body, executor, args, env, condition, chdir, outputs, cleanup })
}

fn decode_cleanup(value: &Value, parent_name: &str) -> Result<Cleanup> {
    let obj = value
        .as_object()
        .ok_or_else(|| TtpForgeError::load(format!("cleanup for step '{parent_name}' must be a mapping")))?;

    let name = get_str(obj, "name").unwrap_or_else(|| format!("cleanup-{parent_name}"));
    let (discriminant, text) = decode_body(obj, &["inline", "file"], &name)?;
    let body = if discriminant == "inline" {
        CleanupBody::Inline(text)
    } else {
        CleanupBody::File(text)
    };

    let executor = get_str(obj, "executor");
    let args = decode_string_list(obj.get("args"), "args")?;
    let env = decode_string_map(obj.get("env"), "env")?;

    Ok(Cleanup { name, body, executor, args, env })
}

/// Shared trial-decode for step/cleanup discriminator fields.
///
/// Ambiguity (zero or more than one key present) is checked on key
/// *presence*, independent of the value. Once exactly one key is chosen,
/// its value must be a non-empty string.
fn decode_body<'a>(
    obj: &Map<String, Value>,
    variants: &[&'a str],
    label: &str,
) -> Result<(&'a str, String)> {
    let present: Vec<&str> = variants.iter().copied().filter(|k| obj.contains_key(*k)).collect();

    match present.as_slice() {
        [] => Err(TtpForgeError::load(format!(
            "'{label}' matches no known variant: tried {}",
            variants.iter().map(|v| format!("'{v}'")).collect::<Vec<_>>().join(", ")
        ))),
        [only] => {
            let text = obj[*only]
                .as_str()
                .ok_or_else(|| TtpForgeError::load(format!("'{label}' field '{only}' must be a string")))?;
            if text.is_empty() {
                return Err(TtpForgeError::load(format!(
                    "'{label}' field '{only}' must not be empty"
                )));
            }
            Ok((*only, text.to_string()))
        }
        other => Err(TtpForgeError::load(format!(
            "'{label}' matches multiple variants: {}",
            other.join(", ")
        ))),
    }
}

fn decode_outputs(value: Option<&Value>) -> Result<HashMap<String, Vec<OutputFilter>>> {
    let Some(value) = value else { return Ok(HashMap::new()) };
    let obj = value
        .as_object()
        .ok_or_else(|| TtpForgeError::load("'outputs' must be a mapping"))?;

    obj.iter()
        .map(|(name, filters_value)| {
            let arr = filters_value
                .as_array()
                .ok_or_else(|| TtpForgeError::load(format!("output '{name}' must be a list of filters")))?;
            if arr.is_empty() {
                return Err(TtpForgeError::load(format!(
                    "output '{name}' must declare at least one filter"
                )));
            }
            let filters = arr
                .iter()
                .map(|f| {
                    serde_json::from_value::<OutputFilter>(f.clone())
                        .map_err(|e| TtpForgeError::load(format!("output '{name}': {e}")))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok((name.clone(), filters))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn decodes_minimal_plan() {
        let value = parse("steps:\n  - name: a\n    inline: echo hi\n");
        let plan = decode_plan(&value, PathBuf::from(".")).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].name, "a");
        assert_eq!(plan.steps[0].body, StepBody::Inline("echo hi".into()));
    }

    #[test]
    fn missing_steps_field_is_load_error() {
        let value = parse("name: x\n");
        let err = decode_plan(&value, PathBuf::from(".")).unwrap_err();
        assert_eq!(err.kind(), "LoadError");
    }

    #[test]
    fn step_without_name_gets_positional_default() {
        let value = parse("steps:\n  - inline: echo hi\n  - inline: echo bye\n");
        let plan = decode_plan(&value, PathBuf::from(".")).unwrap();
        assert_eq!(plan.steps[0].name, "step-1");
        assert_eq!(plan.steps[1].name, "step-2");
    }

    #[test]
    fn step_with_no_discriminator_is_load_error() {
        let value = parse("steps:\n  - name: a\n");
        let err = decode_plan(&value, PathBuf::from(".")).unwrap_err();
        assert_eq!(err.kind(), "LoadError");
        assert!(err.to_string().contains("no known variant"));
    }

    #[test]
    fn step_with_two_discriminators_is_load_error() {
        let value = parse("steps:\n  - name: a\n    inline: echo hi\n    file: run.sh\n");
        let err = decode_plan(&value, PathBuf::from(".")).unwrap_err();
        assert_eq!(err.kind(), "LoadError");
        assert!(err.to_string().contains("multiple variants"));
    }

    #[test]
    fn step_with_empty_inline_is_load_error() {
        let value = parse("steps:\n  - name: a\n    inline: \"\"\n");
        let err = decode_plan(&value, PathBuf::from(".")).unwrap_err();
        assert_eq!(err.kind(), "LoadError");
    }

    #[test]
    fn step_with_whitespace_only_inline_is_valid() {
        let value = parse("steps:\n  - name: a\n    inline: \"   \"\n");
        let plan = decode_plan(&value, PathBuf::from(".")).unwrap();
        assert_eq!(plan.steps[0].body, StepBody::Inline("   ".into()));
    }

    #[test]
    fn decodes_ttp_subplan_step() {
        let value = parse("steps:\n  - name: nested\n    ttp: child.yaml\n");
        let plan = decode_plan(&value, PathBuf::from(".")).unwrap();
        assert_eq!(plan.steps[0].body, StepBody::SubPlan("child.yaml".into()));
    }

    #[test]
    fn decodes_cleanup_with_default_name() {
        let value = parse(
            "steps:\n  - name: a\n    inline: echo hi\n    cleanup:\n      inline: echo bye\n",
        );
        let plan = decode_plan(&value, PathBuf::from(".")).unwrap();
        let cleanup = plan.steps[0].cleanup.as_ref().unwrap();
        assert_eq!(cleanup.name, "cleanup-a");
        assert_eq!(cleanup.body, CleanupBody::Inline("echo bye".into()));
    }

    #[test]
    fn cleanup_with_ttp_discriminator_is_rejected() {
        let value = parse(
            "steps:\n  - name: a\n    inline: echo hi\n    cleanup:\n      ttp: child.yaml\n",
        );
        let err = decode_plan(&value, PathBuf::from(".")).unwrap_err();
        assert_eq!(err.kind(), "LoadError");
    }

    #[test]
    fn decodes_outputs_with_json_path_filter() {
        let value = parse(
            "steps:\n  - name: a\n    inline: echo hi\n    outputs:\n      first:\n        - json_path: foo.bar\n",
        );
        let plan = decode_plan(&value, PathBuf::from(".")).unwrap();
        let filters = &plan.steps[0].outputs["first"];
        assert_eq!(filters.len(), 1);
    }

    #[test]
    fn empty_output_filter_list_is_load_error() {
        let value = parse("steps:\n  - name: a\n    inline: echo hi\n    outputs:\n      first: []\n");
        let err = decode_plan(&value, PathBuf::from(".")).unwrap_err();
        assert_eq!(err.kind(), "LoadError");
    }

    #[test]
    fn decodes_argument_spec_defaults() {
        let value = parse(
            "steps:\n  - name: a\n    inline: echo hi\nargs:\n  - name: alpha\n    type: int\n    choices: [1, 2]\n",
        );
        let plan = decode_plan(&value, PathBuf::from(".")).unwrap();
        assert_eq!(plan.args.len(), 1);
        assert_eq!(plan.args[0].name, "alpha");
        assert_eq!(plan.args[0].ty, ArgType::Int);
        assert_eq!(plan.args[0].choices, Some(vec!["1".into(), "2".into()]));
    }
}
