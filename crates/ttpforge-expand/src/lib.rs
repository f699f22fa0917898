//! Dotted-path variable expansion.
//!
//! Expands `{{ steps.<name>... }}` and `{{ args.<name> }}` references inside
//! inline script bodies, file-step argument lists, and environment values,
//! plus the `${WORKDIR}` placeholder in environment values. This is
//! deliberately not a general expression language — only dotted-path lookups
//! and the `json(...)` wrapper are supported (see SPEC_FULL.md §4.4).

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use serde_json::Value;

use ttpforge_types::{Result, StepOutput, TtpForgeError};

/// Read-only view of everything an expansion pass can reference.
pub struct ExpansionContext<'a> {
    pub steps: &'a HashMap<String, StepOutput>,
    pub args: &'a HashMap<String, Value>,
    pub workdir: &'a Path,
}

/// Expand all `{{ ... }}` references in `template`.
///
/// A reference whose dotted path does not resolve is left exactly as
/// written (including the surrounding `{{ }}`) — see invariant 3 in
/// SPEC_FULL.md §8. A malformed `{{ ... }}` (empty body) is an
/// [`TtpForgeError::Expand`].
pub fn expand(template: &str, ctx: &ExpansionContext<'_>) -> Result<String> {
    let re = Regex::new(r"(?s)\{\{\s*(.*?)\s*\}\}").expect("static regex is valid");

    let mut err: Option<TtpForgeError> = None;
    let result = re.replace_all(template, |caps: &regex::Captures<'_>| {
        let whole = caps.get(0).unwrap().as_str();
        let expr = caps.get(1).unwrap().as_str();
        if expr.is_empty() {
            err = Some(TtpForgeError::expand("empty template expression '{{}}'"));
            return whole.to_string();
        }
        match resolve_expression(expr, ctx) {
            Some(text) => text,
            None => whole.to_string(),
        }
    });

    if let Some(e) = err {
        return Err(e);
    }

    Ok(result.into_owned())
}

/// Expand `${WORKDIR}` and `{{ ... }}` references in an environment value.
pub fn expand_env_value(template: &str, ctx: &ExpansionContext<'_>) -> Result<String> {
    let expanded = expand(template, ctx)?;
    Ok(expanded.replace("${WORKDIR}", &ctx.workdir.to_string_lossy()))
}

/// Resolve a single template expression (the text between `{{` and `}}`).
///
/// Returns `None` if the expression's dotted path does not resolve, signalling
/// to the caller that the original text should be kept unchanged.
fn resolve_expression(expr: &str, ctx: &ExpansionContext<'_>) -> Option<String> {
    if let Some(rest) = expr.strip_prefix("json ").or_else(|| expr.strip_prefix("json(").map(|s| s.trim_end_matches(')'))
    {
        let value = resolve_path(rest.trim(), ctx)?;
        return Some(json_wrap(&value));
    }

    let value = resolve_path(expr, ctx)?;
    Some(encode(&value))
}

/// Resolve a dotted path like `steps.recon.output.hosts.0` or `args.target`.
fn resolve_path(path: &str, ctx: &ExpansionContext<'_>) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    match segments.first().copied()? {
        "steps" => resolve_steps_path(&segments[1..], ctx),
        "args" => {
            let name = segments.get(1)?;
            ctx.args.get(*name).cloned()
        }
        _ => None,
    }
}

fn resolve_steps_path(rest: &[&str], ctx: &ExpansionContext<'_>) -> Option<Value> {
    let step_name = rest.first()?;
    let step = ctx.steps.get(*step_name)?;
    let after_name = &rest[1..];

    if after_name.is_empty() {
        return Some(step.output.clone());
    }

    match after_name[0] {
        "output" => {
            let primary = primary_output(&step.output);
            traverse(primary, &after_name[1..])
        }
        "outputs" => {
            let output_name = after_name.get(1)?;
            let value = step.outputs.get(*output_name)?.clone();
            traverse(&value, &after_name[2..])
        }
        _ => None,
    }
}

/// `steps.<name>.output` special-cases the literal `output` segment: when
/// the step's output map genuinely has an `output` key (the synthetic
/// wrapper for non-mapping stdout), descend into it; otherwise the whole map
/// *is* the primary output, so return it unchanged.
fn primary_output(output_map: &Value) -> &Value {
    match output_map {
        Value::Object(map) => map.get("output").unwrap_or(output_map),
        other => other,
    }
}

/// Look up a plain dotted path (e.g. `foo.bar.0.baz`) inside an arbitrary
/// JSON value. Shared with the output filter pipeline (§4.6), which
/// deliberately reuses this traversal rather than a second lookup language.
pub fn lookup_path(value: &Value, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    traverse(value, &segments)
}

/// Walk further `.k1.k2...` segments over a starting value. A numeric
/// segment indexes into an array; any other segment selects a map key.
fn traverse(start: &Value, segments: &[&str]) -> Option<Value> {
    let mut current = start;
    for seg in segments {
        current = match (current, seg.parse::<usize>()) {
            (Value::Array(items), Ok(index)) => items.get(index)?,
            (Value::Object(map), _) => map.get(*seg)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Canonical text form for substitution: scalars render plainly, maps and
/// arrays serialize as compact JSON.
fn encode(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Wrap a value as single-quoted JSON, safe to splice into a shell command.
fn json_wrap(value: &Value) -> String {
    format!("'{}'", serde_json::to_string(value).unwrap_or_default())
}
