pub mod callbacks;
pub mod error;
pub mod exec;
pub mod input;
pub mod options;
pub mod protocol;
pub mod stream;
pub mod structured;
pub mod thread;

mod schema;
#[cfg(test)]
mod test_support;

use std::sync::Arc;

use tracing::info;

pub use callbacks::{ItemStage, StreamCallbacks};
pub use error::{CodexError, DecodeError};
pub use exec::{CodexExec, ExecArgs, ExecRunner, LineHandler, DEFAULT_MAX_LINE_BYTES};
pub use input::{Input, InputSegment};
pub use options::{CodexOptions, SandboxMode, ThreadOptions, TurnOptions};
pub use protocol::{decode_event, EventKind, ItemKind, ThreadEvent, ThreadItem, Usage};
pub use stream::RunStream;
pub use structured::{StructuredEvent, StructuredOptions, StructuredSnapshot};
pub use thread::{Thread, Turn};
pub use tokio_util::sync::CancellationToken;

/// Entry point. Holds the resolved CLI runner and client-wide options.
pub struct Codex {
    exec: Arc<dyn ExecRunner>,
    options: CodexOptions,
}

impl Codex {
    /// Locate the `codex` binary and build a client.
    pub fn new(options: CodexOptions) -> Result<Self, CodexError> {
        let exec = CodexExec::new(options.codex_path_override.clone())?
            .with_max_line_bytes(options.max_line_bytes);
        info!(program = %exec.program().display(), "codex client ready");
        Ok(Self {
            exec: Arc::new(exec),
            options,
        })
    }

    /// Build a client around a custom runner.
    pub fn with_runner(runner: impl ExecRunner + 'static, options: CodexOptions) -> Self {
        Self {
            exec: Arc::new(runner),
            options,
        }
    }

    /// A new thread. Its id is assigned by the agent on the first turn.
    pub fn start_thread(&self, options: ThreadOptions) -> Thread {
        Thread::new(self.exec.clone(), self.options.clone(), options, None)
    }

    /// Continue an existing thread; every turn passes `resume <id>`.
    pub fn resume_thread(&self, id: impl Into<String>, options: ThreadOptions) -> Thread {
        Thread::new(self.exec.clone(), self.options.clone(), options, Some(id.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{success_events, FakeRunner};

    #[tokio::test]
    async fn resumed_thread_passes_its_id_from_the_first_turn() {
        let runner = FakeRunner::new(vec![success_events()]);
        let calls = runner.calls();
        let codex = Codex::with_runner(runner, CodexOptions::default());

        let thread = codex.resume_thread("thread_42", ThreadOptions::default());
        assert_eq!(thread.id().as_deref(), Some("thread_42"));
        thread.run("continue", TurnOptions::default()).await.unwrap();

        assert_eq!(calls.lock().unwrap()[0].args.thread_id.as_deref(), Some("thread_42"));
    }

    #[tokio::test]
    async fn started_thread_has_no_id_until_the_agent_reports_one() {
        let codex = Codex::with_runner(FakeRunner::new(vec![success_events()]), CodexOptions::default());
        let thread = codex.start_thread(ThreadOptions::default());
        assert!(thread.id().is_none());
        thread.run("hi", TurnOptions::default()).await.unwrap();
        assert_eq!(thread.id().as_deref(), Some("thread_1"));
    }

    #[test]
    fn missing_binary_override_fails() {
        let options = CodexOptions::default().with_codex_path("/no/such/codex");
        assert!(matches!(Codex::new(options), Err(CodexError::Binary(_))));
    }
}
