use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::callbacks::StreamCallbacks;
use crate::exec::DEFAULT_MAX_LINE_BYTES;

/// Filesystem access granted to the agent (`--sandbox`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    ReadOnly,
    WorkspaceWrite,
    DangerFullAccess,
}

impl SandboxMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxMode::ReadOnly => "read-only",
            SandboxMode::WorkspaceWrite => "workspace-write",
            SandboxMode::DangerFullAccess => "danger-full-access",
        }
    }
}

/// Client-wide settings, shared by every thread a [`Codex`](crate::Codex) creates.
#[derive(Debug, Clone)]
pub struct CodexOptions {
    /// Use this binary instead of looking up `codex` on `PATH`.
    pub codex_path_override: Option<PathBuf>,
    pub base_url: Option<String>,
    /// When unset the CLI falls back to its own configured credentials.
    pub api_key: Option<String>,
    /// Forwarded as `-c key=value`; a `profile` entry becomes `--profile`.
    pub config_overrides: BTreeMap<String, Value>,
    /// Longest accepted output line. Longer lines fail the run.
    pub max_line_bytes: usize,
}

impl Default for CodexOptions {
    fn default() -> Self {
        Self {
            codex_path_override: None,
            base_url: None,
            api_key: None,
            config_overrides: BTreeMap::new(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl CodexOptions {
    pub fn with_codex_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.codex_path_override = Some(path.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_config_override(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config_overrides.insert(key.into(), value.into());
        self
    }

    pub fn with_max_line_bytes(mut self, limit: usize) -> Self {
        self.max_line_bytes = limit;
        self
    }
}

/// Per-thread CLI settings.
#[derive(Debug, Clone, Default)]
pub struct ThreadOptions {
    pub model: Option<String>,
    pub sandbox_mode: Option<SandboxMode>,
    /// Passed as `--cd`.
    pub working_directory: Option<PathBuf>,
    pub skip_git_repo_check: bool,
}

impl ThreadOptions {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_sandbox(mut self, mode: SandboxMode) -> Self {
        self.sandbox_mode = Some(mode);
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn skip_git_repo_check(mut self) -> Self {
        self.skip_git_repo_check = true;
        self
    }
}

/// Settings for a single turn.
#[derive(Default)]
pub struct TurnOptions {
    /// JSON schema the agent's final message must satisfy. Must be an object.
    pub output_schema: Option<Value>,
    pub callbacks: Option<StreamCallbacks>,
    /// Cancelling this token cancels the run. The run derives a child token,
    /// so cancelling the run never cancels the parent.
    pub cancel: Option<CancellationToken>,
}

impl TurnOptions {
    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_callbacks(mut self, callbacks: StreamCallbacks) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl std::fmt::Debug for TurnOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnOptions")
            .field("output_schema", &self.output_schema)
            .field("callbacks", &self.callbacks.is_some())
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}
