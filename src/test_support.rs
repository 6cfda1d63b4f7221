//! Scripted runner and event fixtures shared by unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::CodexError;
use crate::exec::{ExecArgs, ExecRunner, LineHandler};

/// What the runner saw when a run started.
#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub args: ExecArgs,
    /// Contents of the output schema file, read while the run was live.
    pub schema: Option<Value>,
    pub images_present: bool,
}

/// Replays one batch of lines per run, in call order.
pub(crate) struct FakeRunner {
    batches: Mutex<VecDeque<Vec<String>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    hold_open: bool,
}

impl FakeRunner {
    pub(crate) fn new(batches: Vec<Vec<String>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
            hold_open: false,
        }
    }

    /// After the batch, block like a live process until cancelled.
    pub(crate) fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub(crate) fn calls(&self) -> Arc<Mutex<Vec<RecordedCall>>> {
        self.calls.clone()
    }
}

#[async_trait]
impl ExecRunner for FakeRunner {
    async fn run(
        &self,
        args: ExecArgs,
        cancel: CancellationToken,
        handler: &mut dyn LineHandler,
    ) -> Result<(), CodexError> {
        let schema = args
            .output_schema_path
            .as_ref()
            .and_then(|path| std::fs::read(path).ok())
            .and_then(|data| serde_json::from_slice(&data).ok());
        let images_present = args.images.iter().all(|path| path.exists());
        self.calls.lock().unwrap().push(RecordedCall {
            args,
            schema,
            images_present,
        });

        let lines = self.batches.lock().unwrap().pop_front().unwrap_or_default();
        for line in lines {
            if cancel.is_cancelled() {
                return Err(CodexError::Cancelled);
            }
            handler.handle_line(line).await?;
        }

        if self.hold_open {
            cancel.cancelled().await;
            return Err(CodexError::Cancelled);
        }
        Ok(())
    }
}

pub(crate) fn line(value: Value) -> String {
    value.to_string()
}

pub(crate) fn agent_message(kind: &str, id: &str, text: &str) -> String {
    line(json!({
        "type": kind,
        "item": {"id": id, "type": "agent_message", "text": text}
    }))
}

/// thread.started, turn.started, one "Hello" message, turn.completed.
pub(crate) fn success_events() -> Vec<String> {
    vec![
        line(json!({"type": "thread.started", "thread_id": "thread_1"})),
        line(json!({"type": "turn.started"})),
        agent_message("item.completed", "item_1", "Hello"),
        line(json!({
            "type": "turn.completed",
            "usage": {"input_tokens": 1, "cached_input_tokens": 0, "output_tokens": 1}
        })),
    ]
}

pub(crate) fn thread_error_events() -> Vec<String> {
    vec![
        line(json!({"type": "thread.started", "thread_id": "thread_1"})),
        line(json!({"type": "error", "message": "boom"})),
    ]
}
