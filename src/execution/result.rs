//! Execution result types and output projection.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::command::Violation;

/// Exit code reported for commands that never reached a backend.
pub const NOT_EXECUTED_EXIT_CODE: i32 = -1;

/// How raw output is projected into structured rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultFormat {
    /// One string row per non-empty line.
    #[default]
    Lines,
    /// No projection; only `raw_text` is meaningful.
    Raw,
    /// Stdout parsed as JSON. Arrays become rows, anything else one row.
    Json,
    /// Whitespace-separated columns with a header line.
    Table,
}

/// Outcome of one command execution.
///
/// Results are immutable: the `with_*` methods consume the value and
/// return a new one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    raw_text: String,
    success: bool,
    exit_code: i32,
    projection: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    metadata: Map<String, Value>,
    duration_ms: u64,
}

impl CommandResult {
    /// Result for a command rejected by validation. No backend was called.
    pub fn invalid(program: &str, violations: &[Violation]) -> Self {
        let message = violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        let mut metadata = Map::new();
        metadata.insert("program".into(), Value::String(program.to_string()));
        metadata.insert(
            "validation_errors".into(),
            serde_json::to_value(violations).unwrap_or(Value::Null),
        );

        Self {
            raw_text: String::new(),
            success: false,
            exit_code: NOT_EXECUTED_EXIT_CODE,
            projection: Vec::new(),
            error_message: Some(message),
            metadata,
            duration_ms: 0,
        }
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn success(&self) -> bool {
        self.success
    }

    /// Check if the command failed.
    pub fn failed(&self) -> bool {
        !self.success
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Structured rows derived from the raw text.
    pub fn projection(&self) -> &[Value] {
        &self.projection
    }

    /// Verbatim stderr (or a short reason) for failed results.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Get output as string, trimmed.
    pub fn output_trimmed(&self) -> &str {
        self.raw_text.trim()
    }

    /// Get output lines.
    pub fn output_lines(&self) -> impl Iterator<Item = &str> {
        self.raw_text.lines()
    }

    /// Copy with an added (or replaced) metadata key.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Copy with a different projection. `raw_text` is untouched.
    pub fn with_projection(mut self, projection: Vec<Value>) -> Self {
        self.projection = projection;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

/// Build a result from raw output using the default line projection.
///
/// `raw_error` is an error reported alongside the output: the captured
/// stderr of a non-zero exit, or a transport message. The result is
/// successful only when `exit_code == 0` and `raw_error` is absent or
/// blank.
pub fn parse_output(
    program: &str,
    raw_text: impl Into<String>,
    exit_code: i32,
    raw_error: Option<&str>,
) -> CommandResult {
    parse_output_as(ResultFormat::Lines, program, raw_text, exit_code, raw_error)
}

/// Build a result, projecting the output with the given format.
pub fn parse_output_as(
    format: ResultFormat,
    program: &str,
    raw_text: impl Into<String>,
    exit_code: i32,
    raw_error: Option<&str>,
) -> CommandResult {
    let raw_text = raw_text.into();
    let raw_error = raw_error.filter(|e| !e.trim().is_empty());
    let success = exit_code == 0 && raw_error.is_none();

    let error_message = if success {
        None
    } else {
        Some(
            raw_error
                .map(str::to_string)
                .unwrap_or_else(|| format!("{program} exited with code {exit_code}")),
        )
    };

    let mut metadata = Map::new();
    metadata.insert("program".into(), Value::String(program.to_string()));
    if format != ResultFormat::Lines {
        metadata.insert(
            "format".into(),
            serde_json::to_value(format).unwrap_or(Value::Null),
        );
    }

    CommandResult {
        projection: project(format, &raw_text),
        raw_text,
        success,
        exit_code,
        error_message,
        metadata,
        duration_ms: 0,
    }
}

fn project(format: ResultFormat, raw_text: &str) -> Vec<Value> {
    match format {
        ResultFormat::Lines => project_lines(raw_text),
        ResultFormat::Raw => Vec::new(),
        ResultFormat::Json => match serde_json::from_str::<Value>(raw_text.trim()) {
            Ok(Value::Array(rows)) => rows,
            Ok(Value::Null) => Vec::new(),
            Ok(other) => vec![other],
            Err(_) => project_lines(raw_text),
        },
        ResultFormat::Table => project_table(raw_text),
    }
}

fn project_lines(raw_text: &str) -> Vec<Value> {
    raw_text
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .map(|line| Value::String(line.to_string()))
        .collect()
}

/// Header line names the columns; the last column swallows the rest of
/// each row so values with spaces (e.g. a `ps` command column) survive.
fn project_table(raw_text: &str) -> Vec<Value> {
    let mut lines = raw_text.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let columns: Vec<&str> = header.split_whitespace().collect();

    lines
        .map(|line| {
            let mut row = Map::new();
            let mut rest = line.trim();
            for (i, column) in columns.iter().enumerate() {
                let value = if i + 1 == columns.len() {
                    std::mem::take(&mut rest)
                } else {
                    match rest.split_once(char::is_whitespace) {
                        Some((head, tail)) => {
                            rest = tail.trim_start();
                            head
                        }
                        None => std::mem::take(&mut rest),
                    }
                };
                row.insert((*column).to_string(), Value::String(value.to_string()));
            }
            Value::Object(row)
        })
        .collect()
}

/// Streaming output chunk from execution.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    /// Raw bytes.
    pub raw: Vec<u8>,
    /// Decoded text (best effort).
    pub text: String,
    /// Stream source.
    pub source: OutputSource,
}

/// Source of output data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

impl OutputChunk {
    /// Create a new output chunk.
    pub fn new(raw: Vec<u8>, source: OutputSource) -> Self {
        let text = String::from_utf8_lossy(&raw).into_owned();
        Self { raw, text, source }
    }

    pub fn stdout(raw: Vec<u8>) -> Self {
        Self::new(raw, OutputSource::Stdout)
    }

    pub fn stderr(raw: Vec<u8>) -> Self {
        Self::new(raw, OutputSource::Stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_tracks_exit_code() {
        for code in [0, 1, 2, 127, 255] {
            let result = parse_output("sh", "out\n", code, None);
            assert_eq!(result.success(), code == 0);
            assert_eq!(result.exit_code(), code);
        }
    }

    #[test]
    fn test_failure_carries_stderr_verbatim() {
        let result = parse_output("ls", "", 2, Some("ls: cannot access 'x': No such file\n"));
        assert!(result.failed());
        assert_eq!(
            result.error_message(),
            Some("ls: cannot access 'x': No such file\n")
        );
    }

    #[test]
    fn test_failure_without_stderr() {
        let result = parse_output("false", "", 1, None);
        assert_eq!(result.error_message(), Some("false exited with code 1"));
    }

    #[test]
    fn test_raw_error_marks_failure() {
        let result = parse_output("ls", "", 0, Some("connection reset"));
        assert!(!result.success());
        assert_eq!(result.error_message(), Some("connection reset"));

        let blank = parse_output("ls", "", 0, Some("  \n"));
        assert!(blank.success());
    }

    #[test]
    fn test_default_projection_is_non_empty_lines() {
        let result = parse_output("ls", "a\n\nb\n   \nc", 0, None);
        assert_eq!(result.projection(), &[json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn test_empty_output_projects_to_empty_sequence() {
        let result = parse_output("true", "", 0, None);
        assert!(result.success());
        assert!(result.projection().is_empty());
    }

    #[test]
    fn test_json_projection() {
        let rows = parse_output_as(ResultFormat::Json, "jq", r#"[{"a":1},{"a":2}]"#, 0, None);
        assert_eq!(rows.projection().len(), 2);

        let single = parse_output_as(ResultFormat::Json, "jq", r#"{"a":1}"#, 0, None);
        assert_eq!(single.projection(), &[json!({"a": 1})]);

        let fallback = parse_output_as(ResultFormat::Json, "jq", "not json\nat all", 0, None);
        assert_eq!(fallback.projection(), &[json!("not json"), json!("at all")]);
    }

    #[test]
    fn test_table_projection() {
        let text = "PID  USER  COMMAND\n1    root  /sbin/init splash\n42   me    bash\n";
        let result = parse_output_as(ResultFormat::Table, "ps", text, 0, None);
        assert_eq!(
            result.projection(),
            &[
                json!({"PID": "1", "USER": "root", "COMMAND": "/sbin/init splash"}),
                json!({"PID": "42", "USER": "me", "COMMAND": "bash"}),
            ]
        );
    }

    #[test]
    fn test_raw_format_has_no_projection() {
        let result = parse_output_as(ResultFormat::Raw, "cat", "x\ny\n", 0, None);
        assert!(result.projection().is_empty());
        assert_eq!(result.raw_text(), "x\ny\n");
    }

    #[test]
    fn test_invalid_result() {
        let result = CommandResult::invalid("rsync", &[Violation::missing_param("destination")]);
        assert!(!result.success());
        assert_eq!(result.exit_code(), NOT_EXECUTED_EXIT_CODE);
        assert!(result.error_message().unwrap().contains("destination"));
        assert_eq!(
            result.metadata_value("validation_errors").unwrap()[0]["field"],
            "destination"
        );
    }

    #[test]
    fn test_with_projection_keeps_raw_text() {
        let result = parse_output("ls", "a\nb\n", 0, None).with_projection(vec![json!("b")]);
        assert_eq!(result.raw_text(), "a\nb\n");
        assert_eq!(result.projection(), &[json!("b")]);
    }

    #[test]
    fn test_output_helpers() {
        let result = parse_output("echo", "  line1\nline2  \n", 0, None);
        assert_eq!(result.output_trimmed(), "line1\nline2");
        assert_eq!(result.output_lines().count(), 2);
    }

    #[test]
    fn test_output_chunk() {
        let chunk = OutputChunk::stdout(b"test output".to_vec());
        assert_eq!(chunk.source, OutputSource::Stdout);
        assert_eq!(chunk.text, "test output");
        assert_eq!(OutputChunk::stderr(vec![]).source, OutputSource::Stderr);
    }
}
