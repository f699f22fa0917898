//! Shared types, error taxonomy, and filesystem abstraction for the TTPForge
//! execution core.
//!
//! This crate provides the foundation used by every other `ttpforge-*` crate:
//! - [`TtpForgeError`] — unified error taxonomy with a stable kind tag
//! - [`Filesystem`] — the opaque stat/read/mkdir view the core is handed
//! - [`LocalFilesystem`] — the concrete local-disk implementation used by the CLI and tests

use std::path::{Path, PathBuf};

/// Unified error type for all TTPForge subsystems.
///
/// Each runtime variant carries the kind tag named in its taxonomy entry so
/// callers (the CLI, tests) can branch or log on `kind()` without parsing
/// the display string.
#[derive(Debug, thiserror::Error)]
pub enum TtpForgeError {
    #[error("load error: {message}")]
    Load { message: String },

    #[error("validate error: {message}")]
    Validate { message: String },

    #[error("bind error: {message}")]
    Bind { message: String },

    #[error("expand error: {message}")]
    Expand { message: String },

    #[error("exec error: {message}")]
    Exec {
        message: String,
        exit_code: Option<i32>,
        stdout_tail: Option<String>,
        stderr_tail: Option<String>,
    },

    #[error("filter error: {message}")]
    Filter { message: String },

    #[error("cleanup error for step '{step}': {message}")]
    Cleanup { step: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TtpForgeError {
    pub fn load(message: impl Into<String>) -> Self {
        Self::Load { message: message.into() }
    }

    pub fn validate(message: impl Into<String>) -> Self {
        Self::Validate { message: message.into() }
    }

    pub fn bind(message: impl Into<String>) -> Self {
        Self::Bind { message: message.into() }
    }

    pub fn expand(message: impl Into<String>) -> Self {
        Self::Expand { message: message.into() }
    }

    pub fn exec(message: impl Into<String>) -> Self {
        Self::Exec {
            message: message.into(),
            exit_code: None,
            stdout_tail: None,
            stderr_tail: None,
        }
    }

    pub fn exec_nonzero(
        exit_code: i32,
        stdout_tail: impl Into<String>,
        stderr_tail: impl Into<String>,
    ) -> Self {
        Self::Exec {
            message: format!("command exited with status {exit_code}"),
            exit_code: Some(exit_code),
            stdout_tail: Some(stdout_tail.into()),
            stderr_tail: Some(stderr_tail.into()),
        }
    }

    pub fn filter(message: impl Into<String>) -> Self {
        Self::Filter { message: message.into() }
    }

    pub fn cleanup(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Cleanup { step: step.into(), message: message.into() }
    }

    /// Stable kind tag surfaced to the logger/CLI (`LoadError`, `ValidateError`, ...).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Load { .. } => "LoadError",
            Self::Validate { .. } => "ValidateError",
            Self::Bind { .. } => "BindError",
            Self::Expand { .. } => "ExpandError",
            Self::Exec { .. } => "ExecError",
            Self::Filter { .. } => "FilterError",
            Self::Cleanup { .. } => "CleanupError",
            Self::Io(_) => "IoError",
            Self::Yaml(_) => "YamlError",
            Self::Json(_) => "JsonError",
        }
    }
}

/// A convenience alias for `Result<T, TtpForgeError>`.
pub type Result<T> = std::result::Result<T, TtpForgeError>;

// ---------------------------------------------------------------------------
// Filesystem — the opaque view the core is handed
// ---------------------------------------------------------------------------

/// The subset of filesystem metadata the resolver and loader need.
#[derive(Debug, Clone, Copy)]
pub struct Metadata {
    pub len: u64,
    pub is_dir: bool,
}

/// The opaque filesystem view the execution core is handed.
///
/// Mirrors the stat/open/mkdir surface the loader and resolver actually use.
/// Callers back this with the real disk ([`LocalFilesystem`]), an in-memory
/// fixture, or a sandboxed view — the core never calls `std::fs` directly.
pub trait Filesystem: Send + Sync {
    /// Stat `path`. Returns `None` if it does not exist or is inaccessible.
    fn stat(&self, path: &Path) -> Option<Metadata>;

    /// Read the full contents of `path` as UTF-8.
    fn read_to_string(&self, path: &Path) -> std::io::Result<String>;

    /// Create `path` and all missing parent directories.
    fn mkdir_all(&self, path: &Path) -> std::io::Result<()>;
}

/// [`Filesystem`] backed directly by the local disk via `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFilesystem;

impl Filesystem for LocalFilesystem {
    fn stat(&self, path: &Path) -> Option<Metadata> {
        let meta = std::fs::metadata(path).ok()?;
        Some(Metadata { len: meta.len(), is_dir: meta.is_dir() })
    }

    fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn mkdir_all(&self, path: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(path)
    }
}

// ---------------------------------------------------------------------------
// OutputFilter — a declared stdout transformation (§4.6)
// ---------------------------------------------------------------------------

/// A single JSON-path extraction filter.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct JsonPathFilter {
    pub json_path: String,
}

/// A declared transformation applied to captured stdout to produce a named
/// output value. Only one variant exists today, but the decoder is written
/// to reject a filter node that matches zero or more than one known
/// variant, so adding a second is additive.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum OutputFilter {
    JsonPath(JsonPathFilter),
}

impl<'de> serde::Deserialize<'de> for OutputFilter {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;

        let value = serde_json::Value::deserialize(deserializer)?;
        let obj = value
            .as_object()
            .ok_or_else(|| D::Error::custom("output filter must be a mapping"))?;

        let mut matched: Vec<&str> = Vec::new();
        if obj.contains_key("json_path") {
            matched.push("json_path");
        }

        match matched.as_slice() {
            [] => Err(D::Error::custom(
                "output filter matches no known variant (expected one of: json_path)",
            )),
            ["json_path"] => {
                let json_path = obj
                    .get("json_path")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| D::Error::custom("json_path must be a string"))?
                    .to_string();
                Ok(OutputFilter::JsonPath(JsonPathFilter { json_path }))
            }
            other => Err(D::Error::custom(format!(
                "output filter matches multiple variants: {}",
                other.join(", ")
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// StepOutput — the recorded result of a completed step
// ---------------------------------------------------------------------------

/// What a completed step leaves behind for later steps, cleanups, and
/// filters to read.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct StepOutput {
    /// `true` iff the subprocess exited with status 0.
    pub success: bool,
    /// Trimmed raw stdout, before any parsing.
    pub raw_stdout: String,
    /// Either the stdout parsed as a YAML/JSON mapping, or the synthetic
    /// `{"output": <raw_stdout>}` wrapper when it did not parse as a
    /// mapping. This is what `steps.<name>` resolves to during expansion.
    pub output: serde_json::Value,
    /// Named results of the step's `outputs` filter pipeline.
    pub outputs: std::collections::HashMap<String, serde_json::Value>,
}

impl StepOutput {
    /// Build the output map for a step whose stdout did not parse as a
    /// mapping: `{"output": <raw>}`.
    pub fn from_raw(success: bool, raw_stdout: String) -> Self {
        let output = serde_json::json!({ "output": raw_stdout });
        Self { success, raw_stdout, output, outputs: Default::default() }
    }

    /// Build the output map for a step whose stdout parsed as a mapping.
    pub fn from_mapping(success: bool, raw_stdout: String, mapping: serde_json::Value) -> Self {
        Self { success, raw_stdout, output: mapping, outputs: Default::default() }
    }
}

/// Expand a leading `~/` (or bare `~`) to the user's home directory.
///
/// Leaves the path untouched if it does not start with `~`, or if the home
/// directory cannot be determined.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_tags() {
        assert_eq!(TtpForgeError::load("x").kind(), "LoadError");
        assert_eq!(TtpForgeError::validate("x").kind(), "ValidateError");
        assert_eq!(TtpForgeError::bind("x").kind(), "BindError");
        assert_eq!(TtpForgeError::expand("x").kind(), "ExpandError");
        assert_eq!(TtpForgeError::exec("x").kind(), "ExecError");
        assert_eq!(TtpForgeError::filter("x").kind(), "FilterError");
        assert_eq!(TtpForgeError::cleanup("step-a", "x").kind(), "CleanupError");
    }

    #[test]
    fn exec_nonzero_carries_tails() {
        let err = TtpForgeError::exec_nonzero(3, "out", "err");
        match err {
            TtpForgeError::Exec { exit_code, stdout_tail, stderr_tail, .. } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stdout_tail.as_deref(), Some("out"));
                assert_eq!(stderr_tail.as_deref(), Some("err"));
            }
            other => panic!("expected Exec, got {other:?}"),
        }
    }

    #[test]
    fn local_filesystem_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFilesystem;

        let nested = dir.path().join("a/b");
        fs.mkdir_all(&nested).unwrap();
        assert!(fs.stat(&nested).unwrap().is_dir);

        let file = nested.join("f.txt");
        std::fs::write(&file, "hello").unwrap();
        let meta = fs.stat(&file).unwrap();
        assert!(!meta.is_dir);
        assert_eq!(meta.len, 5);
        assert_eq!(fs.read_to_string(&file).unwrap(), "hello");
    }

    #[test]
    fn stat_missing_path_is_none() {
        let fs = LocalFilesystem;
        assert!(fs.stat(Path::new("/definitely/does/not/exist/xyz")).is_none());
    }

    #[test]
    fn expand_home_substitutes_tilde_prefix() {
        if let Some(home) = dirs::home_dir() {
            let expanded = expand_home("~/foo/bar");
            assert_eq!(expanded, home.join("foo/bar"));
        }
    }

    #[test]
    fn step_output_from_raw_wraps_single_key() {
        let out = StepOutput::from_raw(true, "hello".into());
        assert_eq!(out.output, serde_json::json!({"output": "hello"}));
    }

    #[test]
    fn step_output_from_mapping_stores_root() {
        let mapping = serde_json::json!({"a": 1, "b": "two"});
        let out = StepOutput::from_mapping(true, "{}".into(), mapping.clone());
        assert_eq!(out.output, mapping);
    }

    #[test]
    fn expand_home_leaves_non_tilde_paths_alone() {
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(expand_home("relative/path"), PathBuf::from("relative/path"));
    }
}
