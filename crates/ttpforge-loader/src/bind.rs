//! Argument-spec self-validation and the `Bind` coercion algorithm.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde_json::Value;
use ttpforge_types::{Result, TtpForgeError};

use crate::model::{ArgType, ArgumentSpec};

/// Validate a plan's declared argument specs against themselves: unique
/// names, `format` only on strings, every declared choice parses under the
/// declared type, and the default (if any) validates against type, choices,
/// and format. This runs before any binding is attempted.
pub fn validate_specs(specs: &[ArgumentSpec]) -> Result<()> {
    let mut seen = HashSet::new();
    for spec in specs {
        if !seen.insert(spec.name.as_str()) {
            return Err(TtpForgeError::validate(format!("duplicate argument name '{}'", spec.name)));
        }

        if spec.format.is_some() && !matches!(spec.ty, ArgType::String) {
            return Err(TtpForgeError::validate(format!(
                "argument '{}': 'format' only applies to string arguments",
                spec.name
            )));
        }

        if let Some(choices) = &spec.choices {
            for choice in choices {
                coerce_scalar(spec, choice).map_err(|e| {
                    TtpForgeError::validate(format!("argument '{}': invalid choice '{choice}': {e}", spec.name))
                })?;
            }
        }

        if let Some(default) = &spec.default {
            coerce(spec, default).map_err(|e| {
                TtpForgeError::validate(format!("argument '{}': invalid default: {e}", spec.name))
            })?;
        }
    }
    Ok(())
}

/// Bind a `"NAME=VALUE"` argument list against the declared specs.
///
/// Every spec name is present in the result, typed per its declaration:
/// supplied values are coerced and validated; unsupplied ones fall back to
/// their default, or fail if required.
pub fn bind(specs: &[ArgumentSpec], raw_args: &[String]) -> Result<HashMap<String, Value>> {
    tracing::debug!(spec_count = specs.len(), provided_count = raw_args.len(), "binding arguments");
    let known: HashSet<&str> = specs.iter().map(|s| s.name.as_str()).collect();

    let mut provided: HashMap<&str, String> = HashMap::new();
    for raw in raw_args {
        let (name, value) = raw
            .split_once('=')
            .ok_or_else(|| TtpForgeError::bind(format!("argument '{raw}' is missing '='")))?;
        if !known.contains(name) {
            return Err(TtpForgeError::bind(format!("unknown argument '{name}'")));
        }
        provided.insert(name, value.to_string());
    }

    let mut bound = HashMap::with_capacity(specs.len());
    for spec in specs {
        let raw_value = match provided.get(spec.name.as_str()) {
            Some(v) => v.clone(),
            None => spec
                .default
                .clone()
                .ok_or_else(|| TtpForgeError::bind(format!("required argument '{}' missing", spec.name)))?,
        };
        bound.insert(spec.name.clone(), coerce(spec, &raw_value)?);
    }
    Ok(bound)
}

fn coerce(spec: &ArgumentSpec, raw: &str) -> Result<Value> {
    let value = coerce_scalar(spec, raw)?;

    if let Some(choices) = &spec.choices {
        let mut allowed = false;
        for choice in choices {
            if coerce_scalar(spec, choice)? == value {
                allowed = true;
                break;
            }
        }
        if !allowed {
            return Err(TtpForgeError::bind(format!(
                "argument '{}': '{raw}' is not one of the declared choices",
                spec.name
            )));
        }
    }

    if let Some(format) = &spec.format {
        let re = Regex::new(format)
            .map_err(|e| TtpForgeError::bind(format!("argument '{}': invalid format regex: {e}", spec.name)))?;
        if !re.is_match(raw) {
            return Err(TtpForgeError::bind(format!(
                "argument '{}': '{raw}' does not match format",
                spec.name
            )));
        }
    }

    Ok(value)
}

/// Type-only coercion, with no choices/format validation. Used both for the
/// primary value and to compare declared choices on equal footing.
fn coerce_scalar(spec: &ArgumentSpec, raw: &str) -> Result<Value> {
    Ok(match spec.ty {
        ArgType::String => Value::String(raw.to_string()),
        ArgType::Int => {
            let parsed: i64 = raw
                .parse()
                .map_err(|_| TtpForgeError::bind(format!("argument '{}': '{raw}' is not a valid int", spec.name)))?;
            Value::Number(parsed.into())
        }
        ArgType::Bool => {
            let parsed = match raw.to_ascii_lowercase().as_str() {
                "true" => true,
                "false" => false,
                _ => {
                    return Err(TtpForgeError::bind(format!(
                        "argument '{}': '{raw}' is not a valid bool",
                        spec.name
                    )))
                }
            };
            Value::Bool(parsed)
        }
        ArgType::Path => {
            let expanded = ttpforge_types::expand_home(raw);
            let absolute = if expanded.is_absolute() {
                expanded
            } else {
                std::env::current_dir().map_err(TtpForgeError::from)?.join(expanded)
            };
            Value::String(absolute.to_string_lossy().into_owned())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, ty: ArgType) -> ArgumentSpec {
        ArgumentSpec { name: name.into(), ty, default: None, choices: None, format: None, description: None }
    }

    #[test]
    fn binds_required_string_argument() {
        let specs = vec![spec("alpha", ArgType::String)];
        let bound = bind(&specs, &["alpha=hello".to_string()]).unwrap();
        assert_eq!(bound["alpha"], Value::String("hello".into()));
    }

    #[test]
    fn missing_required_argument_is_bind_error() {
        let specs = vec![spec("alpha", ArgType::String)];
        let err = bind(&specs, &[]).unwrap_err();
        assert_eq!(err.kind(), "BindError");
    }

    #[test]
    fn default_used_when_not_provided() {
        let mut s = spec("alpha", ArgType::Int);
        s.default = Some("7".into());
        let bound = bind(&[s], &[]).unwrap();
        assert_eq!(bound["alpha"], serde_json::json!(7));
    }

    #[test]
    fn unknown_argument_name_is_bind_error() {
        let specs = vec![spec("alpha", ArgType::String)];
        let err = bind(&specs, &["beta=x".to_string()]).unwrap_err();
        assert_eq!(err.kind(), "BindError");
    }

    #[test]
    fn value_without_equals_is_bind_error() {
        let specs = vec![spec("alpha", ArgType::String)];
        let err = bind(&specs, &["alpha".to_string()]).unwrap_err();
        assert_eq!(err.kind(), "BindError");
    }

    #[test]
    fn value_may_contain_further_equals_signs() {
        let specs = vec![spec("alpha", ArgType::String)];
        let bound = bind(&specs, &["alpha=a=b=c".to_string()]).unwrap();
        assert_eq!(bound["alpha"], Value::String("a=b=c".into()));
    }

    #[test]
    fn int_choices_scenario_accepts_member() {
        let mut s = spec("alpha", ArgType::Int);
        s.choices = Some(vec!["1".into(), "2".into()]);
        let bound = bind(&[s], &["alpha=1".to_string()]).unwrap();
        assert_eq!(bound["alpha"], serde_json::json!(1));
    }

    #[test]
    fn int_choices_scenario_rejects_non_member() {
        let mut s = spec("alpha", ArgType::Int);
        s.choices = Some(vec!["1".into(), "2".into()]);
        let err = bind(&[s], &["alpha=3".to_string()]).unwrap_err();
        assert_eq!(err.kind(), "BindError");
    }

    #[test]
    fn bool_is_case_insensitive() {
        let bound = bind(&[spec("flag", ArgType::Bool)], &["flag=TRUE".to_string()]).unwrap();
        assert_eq!(bound["flag"], Value::Bool(true));
    }

    #[test]
    fn invalid_int_is_bind_error() {
        let err = bind(&[spec("alpha", ArgType::Int)], &["alpha=not-a-number".to_string()]).unwrap_err();
        assert_eq!(err.kind(), "BindError");
    }

    #[test]
    fn format_mismatch_is_bind_error() {
        let mut s = spec("alpha", ArgType::String);
        s.format = Some(r"^[a-z]+$".into());
        let err = bind(&[s], &["alpha=NOT-LOWER".to_string()]).unwrap_err();
        assert_eq!(err.kind(), "BindError");
    }

    #[test]
    fn path_argument_expands_tilde_and_resolves_absolute() {
        if let Some(home) = dirs_home_for_test() {
            let bound = bind(&[spec("p", ArgType::Path)], &["p=~/x".to_string()]).unwrap();
            assert_eq!(bound["p"], Value::String(home.join("x").to_string_lossy().into_owned()));
        }
    }

    fn dirs_home_for_test() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }

    #[test]
    fn validate_specs_rejects_duplicate_names() {
        let specs = vec![spec("alpha", ArgType::String), spec("alpha", ArgType::Int)];
        let err = validate_specs(&specs).unwrap_err();
        assert_eq!(err.kind(), "ValidateError");
    }

    #[test]
    fn validate_specs_rejects_format_on_non_string() {
        let mut s = spec("alpha", ArgType::Int);
        s.format = Some(r"^\d+$".into());
        let err = validate_specs(&[s]).unwrap_err();
        assert_eq!(err.kind(), "ValidateError");
    }

    #[test]
    fn validate_specs_rejects_default_failing_choices() {
        // Scenario 4: default fails spec validation before any bind.
        let mut s = spec("alpha", ArgType::Int);
        s.choices = Some(vec!["1".into(), "2".into()]);
        s.default = Some("baz".into());
        let err = validate_specs(&[s]).unwrap_err();
        assert_eq!(err.kind(), "ValidateError");
    }

    #[test]
    fn validate_specs_accepts_well_formed_spec() {
        let mut s = spec("alpha", ArgType::Int);
        s.choices = Some(vec!["1".into(), "2".into()]);
        s.default = Some("1".into());
        assert!(validate_specs(&[s]).is_ok());
    }
}
