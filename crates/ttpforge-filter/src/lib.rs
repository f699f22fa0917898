//! Applies a step's declared [`OutputFilter`] chains to its captured stdout
//! to produce the named values other steps reference as
//! `steps.<name>.outputs.<output_name>`.

use std::collections::HashMap;

use serde_json::Value;
use ttpforge_types::{OutputFilter, Result, TtpForgeError};

/// Run `stdout` through one filter chain, threading filter N's output into
/// filter N+1's input, and return the final value.
///
/// An empty chain is rejected by the loader before this is ever called, so
/// this returns an error rather than silently producing nothing.
pub fn apply_chain(stdout: &str, chain: &[OutputFilter]) -> Result<Value> {
    let mut current = stdout.to_string();
    let mut last: Option<Value> = None;

    for filter in chain {
        let extracted = match filter {
            OutputFilter::JsonPath(f) => apply_json_path(&current, &f.json_path)?,
        };
        current = match &extracted {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other)?,
        };
        last = Some(extracted);
    }

    last.ok_or_else(|| TtpForgeError::filter("output filter chain is empty"))
}

fn apply_json_path(input: &str, path: &str) -> Result<Value> {
    let parsed: Value = serde_json::from_str(input)
        .map_err(|e| TtpForgeError::filter(format!("filter input is not valid JSON: {e}")))?;

    ttpforge_expand::lookup_path(&parsed, path)
        .ok_or_else(|| TtpForgeError::filter(format!("json path '{path}' not found in stdout")))
}

/// Run every declared named-output chain against a step's raw stdout.
///
/// Each entry in `named_filters` is independent: all chains read from the
/// same raw stdout, not from each other's results.
pub fn apply_named_outputs(
    stdout: &str,
    named_filters: &HashMap<String, Vec<OutputFilter>>,
) -> Result<HashMap<String, Value>> {
    let mut results = HashMap::with_capacity(named_filters.len());
    for (name, chain) in named_filters {
        let value = apply_chain(stdout, chain)
            .map_err(|e| TtpForgeError::filter(format!("output '{name}': {e}")))?;
        results.insert(name.clone(), value);
    }
    Ok(results)
}
