pub use crate::protocol::decode::DecodeError;

/// Every way a Codex run can fail.
///
/// A run records exactly one of these as its terminal error. Use
/// [`CodexError::is_cancelled`] to tell a caller-requested cancellation apart
/// from a genuine failure.
#[derive(Debug, thiserror::Error)]
pub enum CodexError {
    #[error("parse event: {source}")]
    Decode {
        #[source]
        source: DecodeError,
        line: String,
    },
    #[error("{message}")]
    TurnFailed { message: String },
    #[error("thread error: {message}")]
    Stream { message: String },
    #[error("starting codex exec: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("writing prompt to codex stdin: {0}")]
    Stdin(#[source] std::io::Error),
    #[error("reading codex output: {0}")]
    Read(#[source] std::io::Error),
    #[error("codex output line exceeded {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("codex exec failed with {}: {stderr}", exit_label(.code))]
    Process { code: Option<i32>, stderr: String },
    #[error("codex run cancelled")]
    Cancelled,
    #[error("structured output not returned")]
    NoStructuredOutput,
    #[error("decode structured output: {0}")]
    StructuredDecode(#[source] serde_json::Error),
    #[error("{}", schema_violation_label(.message))]
    SchemaViolation { message: String },
    #[error("output schema: {0}")]
    Schema(String),
    #[error("invalid input: {0}")]
    Input(String),
    #[error("image: {0}")]
    Image(String),
    #[error("run aborted by panic: {0}")]
    Panicked(String),
    #[error("unable to locate codex binary: {0}")]
    Binary(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodexError {
    /// True when the run ended because cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CodexError::Cancelled)
    }

    /// True for a schema violation reported while producing structured output.
    pub fn is_schema_violation(&self) -> bool {
        matches!(self, CodexError::SchemaViolation { .. })
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "no exit code (terminated by signal)".into(),
    }
}

fn schema_violation_label(message: &str) -> &str {
    if message.is_empty() {
        "structured output schema violation"
    } else {
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_error_reports_code_and_stderr() {
        let err = CodexError::Process {
            code: Some(2),
            stderr: "bad flag".into(),
        };
        assert_eq!(err.to_string(), "codex exec failed with code 2: bad flag");

        let err = CodexError::Process {
            code: None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("terminated by signal"));
    }

    #[test]
    fn empty_schema_violation_has_default_message() {
        let err = CodexError::SchemaViolation {
            message: String::new(),
        };
        assert_eq!(err.to_string(), "structured output schema violation");
        assert!(err.is_schema_violation());
    }

    #[test]
    fn cancellation_is_distinguishable() {
        assert!(CodexError::Cancelled.is_cancelled());
        assert!(!CodexError::TurnFailed {
            message: "cancelled by model".into()
        }
        .is_cancelled());
    }
}
