use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::callbacks::StreamCallbacks;
use crate::error::CodexError;
use crate::exec::{ExecArgs, ExecRunner, LineHandler};
use crate::input::ScopedResources;
use crate::protocol::{decode_event, ThreadEvent};
use crate::thread::ThreadIdCell;

/// Frames buffered between the process reader and the consumer.
pub const EVENT_BUFFER: usize = 16;

/// Write-once error cell shared by the producer task and the run handle.
#[derive(Debug, Default)]
pub(crate) struct TerminalSlot(Mutex<Option<CodexError>>);

impl TerminalSlot {
    /// Store `err` unless an error is already recorded. Returns whether it was stored.
    pub(crate) fn record(&self, err: CodexError) -> bool {
        let mut slot = self.0.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            debug!(discarded = %err, "terminal error already recorded");
            return false;
        }
        *slot = Some(err);
        true
    }

    pub(crate) fn take(&self) -> Option<CodexError> {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

/// Turns decoded events into the frames a run delivers.
///
/// `observe` runs on the producer path after callbacks and before delivery.
/// An `Err` from either method is recorded as the run's terminal error; it
/// does not stop the stream.
pub(crate) trait EventPipeline: Send + 'static {
    type Frame: Send + 'static;

    fn observe(&mut self, event: ThreadEvent, frames: &mut Vec<Self::Frame>) -> Result<(), CodexError>;

    /// Called once the process has exited.
    fn finish(&mut self) -> Result<(), CodexError> {
        Ok(())
    }
}

/// Delivers raw events; `turn.failed` becomes the terminal error.
pub(crate) struct EventPassthrough;

impl EventPipeline for EventPassthrough {
    type Frame = ThreadEvent;

    fn observe(&mut self, event: ThreadEvent, frames: &mut Vec<ThreadEvent>) -> Result<(), CodexError> {
        let failure = match &event {
            ThreadEvent::TurnFailed(failed) => Some(failed.error.message.clone()),
            _ => None,
        };
        frames.push(event);
        match failure {
            Some(message) => Err(CodexError::TurnFailed { message }),
            None => Ok(()),
        }
    }
}

// --- Run handle ---

/// Handle to one in-flight run.
///
/// Yields frames in the order the process produced them. Draining the
/// frames does not guarantee the terminal error has been recorded; call
/// [`RunStream::wait`] for the outcome. Dropping the handle cancels the run.
#[derive(Debug)]
pub struct RunStream<T = ThreadEvent> {
    frames: mpsc::Receiver<T>,
    cancel: CancellationToken,
    done: CancellationToken,
    terminal: Arc<TerminalSlot>,
}

impl<T> RunStream<T> {
    /// Next frame, or `None` once the run has finished producing.
    pub async fn recv(&mut self) -> Option<T> {
        self.frames.recv().await
    }

    /// Token that cancels this run when triggered.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Block until the run terminates and return its terminal error.
    ///
    /// Frames not yet received are discarded, so this never stalls on an
    /// undrained buffer.
    pub async fn wait(mut self) -> Result<(), CodexError> {
        self.frames.close();
        self.done.cancelled().await;
        match self.terminal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Cancel the run, then [`wait`](RunStream::wait) for it.
    ///
    /// An error recorded before cancellation is returned in preference to
    /// [`CodexError::Cancelled`].
    pub async fn close(self) -> Result<(), CodexError> {
        self.cancel.cancel();
        self.wait().await
    }
}

impl<T> Drop for RunStream<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<T> futures_util::Stream for RunStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.frames.poll_recv(cx)
    }
}

// --- Producer ---

/// Everything the producer task owns for the duration of a run.
pub(crate) struct RunSetup {
    pub exec: Arc<dyn ExecRunner>,
    pub args: ExecArgs,
    pub cancel: CancellationToken,
    pub callbacks: Option<StreamCallbacks>,
    pub thread_id: ThreadIdCell,
    pub resources: ScopedResources,
}

/// Start the producer task for one run. Must be called inside a tokio runtime.
pub(crate) fn spawn_run<P: EventPipeline>(setup: RunSetup, pipeline: P) -> RunStream<P::Frame> {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let done = CancellationToken::new();
    let terminal = Arc::new(TerminalSlot::default());

    let stream = RunStream {
        frames: rx,
        cancel: setup.cancel.clone(),
        done: done.clone(),
        terminal: terminal.clone(),
    };

    tokio::spawn(async move {
        let mut completion = Completion {
            done: done.clone(),
            terminal: terminal.clone(),
            finished: false,
        };
        let RunSetup {
            exec,
            args,
            cancel,
            callbacks,
            thread_id,
            resources,
        } = setup;

        let mut handler = ForwardingHandler {
            tx,
            cancel: cancel.clone(),
            callbacks,
            thread_id,
            id_assigned: false,
            detached: false,
            pipeline,
            terminal: terminal.clone(),
        };

        info!(
            resume = args.thread_id.is_some(),
            images = args.images.len(),
            temp_resources = resources.len(),
            "run started"
        );
        let result = exec.run(args, cancel, &mut handler).await;
        match result {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {
                info!("run cancelled");
                terminal.record(err);
            }
            Err(err) => {
                warn!(error = %err, "run failed");
                terminal.record(err);
            }
        }
        if let Err(err) = handler.pipeline.finish() {
            terminal.record(err);
        }

        drop(resources);
        // Completion is signalled before the sender drops, so a consumer
        // that sees the end of the stream can rely on wait() not blocking.
        completion.finished = true;
        done.cancel();
        drop(handler);
    });

    stream
}

/// Signals `done` however the producer task ends. A task dropped before
/// `finished` is set panicked or was aborted; that is recorded unless an
/// error is already in the slot.
struct Completion {
    done: CancellationToken,
    terminal: Arc<TerminalSlot>,
    finished: bool,
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.finished {
            warn!("run task ended abnormally");
            self.terminal
                .record(CodexError::Panicked("run task ended abnormally".into()));
        }
        self.done.cancel();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".into()
    }
}

struct ForwardingHandler<P: EventPipeline> {
    tx: mpsc::Sender<P::Frame>,
    cancel: CancellationToken,
    callbacks: Option<StreamCallbacks>,
    thread_id: ThreadIdCell,
    id_assigned: bool,
    detached: bool,
    pipeline: P,
    terminal: Arc<TerminalSlot>,
}

impl<P: EventPipeline> ForwardingHandler<P> {
    async fn forward(&mut self, frame: P::Frame) -> Result<(), CodexError> {
        if self.detached {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CodexError::Cancelled),
            sent = self.tx.send(frame) => {
                if sent.is_err() {
                    debug!("consumer detached, discarding remaining frames");
                    self.detached = true;
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<P: EventPipeline> LineHandler for ForwardingHandler<P> {
    async fn handle_line(&mut self, line: String) -> Result<(), CodexError> {
        let event = match decode_event(&line) {
            Ok(event) => event,
            Err(source) => {
                warn!(error = %source, "undecodable event line");
                return Err(CodexError::Decode { source, line });
            }
        };
        trace!(kind = %event.kind(), "event");

        if let ThreadEvent::ThreadStarted(started) = &event {
            if !self.id_assigned {
                self.id_assigned = true;
                self.thread_id.set(started.thread_id.clone());
                debug!(thread_id = %started.thread_id, "thread id assigned");
            }
        }

        if let Some(callbacks) = self.callbacks.as_mut() {
            // A panicking callback aborts the run like any other failure.
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callbacks.dispatch(&event))) {
                let message = format!("callback panicked: {}", panic_message(payload.as_ref()));
                warn!(%message, "aborting run");
                self.callbacks = None;
                self.terminal.record(CodexError::Panicked(message.clone()));
                return Err(CodexError::Panicked(message));
            }
        }

        let fatal = match &event {
            ThreadEvent::Error(e) => Some(e.message.clone()),
            _ => None,
        };
        if let Some(message) = &fatal {
            self.terminal.record(CodexError::Stream {
                message: message.clone(),
            });
        }

        let mut frames = Vec::with_capacity(2);
        if let Err(err) = self.pipeline.observe(event, &mut frames) {
            self.terminal.record(err);
        }
        for frame in frames {
            self.forward(frame).await?;
        }

        match fatal {
            Some(message) => Err(CodexError::Stream { message }),
            None => Ok(()),
        }
    }
}
