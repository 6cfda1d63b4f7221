use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CodexError;
use crate::exec::{ExecArgs, ExecRunner};
use crate::input::{normalize_input, Input, NormalizedInput};
use crate::options::{CodexOptions, ThreadOptions, TurnOptions};
use crate::protocol::{ThreadEvent, ThreadItem, Usage};
use crate::schema::OutputSchemaFile;
use crate::stream::{spawn_run, EventPassthrough, RunSetup, RunStream};

/// Thread id shared between a [`Thread`] and the producers of its runs.
#[derive(Debug, Clone, Default)]
pub(crate) struct ThreadIdCell(Arc<RwLock<Option<String>>>);

impl ThreadIdCell {
    pub(crate) fn new(id: Option<String>) -> Self {
        Self(Arc::new(RwLock::new(id)))
    }

    pub(crate) fn get(&self) -> Option<String> {
        self.0.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub(crate) fn set(&self, id: String) {
        *self.0.write().unwrap_or_else(|p| p.into_inner()) = Some(id);
    }
}

/// Result of a completed turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Turn {
    /// Every item reported by `item.completed`, in order.
    pub items: Vec<ThreadItem>,
    /// Text of the last completed agent message.
    pub final_response: String,
    pub usage: Option<Usage>,
}

/// A conversation with the agent.
///
/// Turns on one thread must run one at a time; each later turn resumes the
/// thread id reported by the first.
pub struct Thread {
    exec: Arc<dyn ExecRunner>,
    options: CodexOptions,
    thread_options: ThreadOptions,
    id: ThreadIdCell,
}

impl Thread {
    pub(crate) fn new(
        exec: Arc<dyn ExecRunner>,
        options: CodexOptions,
        thread_options: ThreadOptions,
        id: Option<String>,
    ) -> Self {
        Self {
            exec,
            options,
            thread_options,
            id: ThreadIdCell::new(id),
        }
    }

    /// Known once the first `thread.started` event has arrived.
    pub fn id(&self) -> Option<String> {
        self.id.get()
    }

    /// Start a turn and stream its events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run_streamed(
        &self,
        input: impl Into<Input>,
        turn: TurnOptions,
    ) -> Result<RunStream, CodexError> {
        let setup = self.prepare(input.into(), turn)?;
        Ok(spawn_run(setup, EventPassthrough))
    }

    /// Run a turn to completion.
    ///
    /// Returns early with the failure on `turn.failed` or a stream `error`.
    pub async fn run(&self, input: impl Into<Input>, turn: TurnOptions) -> Result<Turn, CodexError> {
        let mut stream = self.run_streamed(input, turn)?;
        let mut result = Turn::default();
        let mut failure = None;

        while let Some(event) = stream.recv().await {
            match event {
                ThreadEvent::ItemCompleted(completed) => {
                    if let ThreadItem::AgentMessage(message) = &completed.item {
                        result.final_response = message.text.clone();
                    }
                    result.items.push(completed.item);
                }
                ThreadEvent::TurnCompleted(completed) => result.usage = Some(completed.usage),
                ThreadEvent::TurnFailed(failed) => {
                    failure = Some(CodexError::TurnFailed {
                        message: failed.error.message,
                    });
                    break;
                }
                ThreadEvent::Error(e) => {
                    failure = Some(CodexError::Stream { message: e.message });
                    break;
                }
                _ => {}
            }
        }

        if let Some(failure) = failure {
            stream.close().await?;
            return Err(failure);
        }
        stream.wait().await?;
        Ok(result)
    }

    /// Build everything a run's producer needs. Temp files created here are
    /// released if a later step fails.
    pub(crate) fn prepare(&self, input: Input, turn: TurnOptions) -> Result<RunSetup, CodexError> {
        let TurnOptions {
            output_schema,
            callbacks,
            cancel,
        } = turn;
        let NormalizedInput {
            prompt,
            images,
            mut resources,
        } = normalize_input(input)?;

        let output_schema_path = match output_schema {
            Some(schema) => {
                let file = OutputSchemaFile::create(&schema)?;
                let path = file.path().to_path_buf();
                resources.defer(move || file.close());
                Some(path)
            }
            None => None,
        };

        let thread_id = self.id.get();
        debug!(thread_id = ?thread_id, images = images.len(), "preparing turn");

        let args = ExecArgs {
            input: prompt,
            base_url: self.options.base_url.clone(),
            api_key: self.options.api_key.clone(),
            thread_id,
            model: self.thread_options.model.clone(),
            sandbox_mode: self.thread_options.sandbox_mode,
            working_directory: self.thread_options.working_directory.clone(),
            skip_git_repo_check: self.thread_options.skip_git_repo_check,
            output_schema_path,
            images,
            config_overrides: self.options.config_overrides.clone(),
        };

        Ok(RunSetup {
            exec: self.exec.clone(),
            args,
            cancel: cancel
                .map(|parent| parent.child_token())
                .unwrap_or_else(CancellationToken::new),
            callbacks,
            thread_id: self.id.clone(),
            resources,
        })
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id.get())
            .field("thread_options", &self.thread_options)
            .finish_non_exhaustive()
    }
}
