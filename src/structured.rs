use std::marker::PhantomData;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::CodexError;
use crate::input::Input;
use crate::options::TurnOptions;
use crate::protocol::{ThreadEvent, ThreadItem};
use crate::stream::{spawn_run, EventPipeline, RunStream};
use crate::thread::Thread;

/// Settings for a turn whose final message is decoded into a typed value.
///
/// Schema precedence: `schema`, then `turn.output_schema`, then a schema
/// inferred from the target type unless inference is disabled.
#[derive(Debug, Default)]
pub struct StructuredOptions {
    pub turn: TurnOptions,
    pub schema: Option<Value>,
    pub disable_schema_inference: bool,
}

impl StructuredOptions {
    pub fn with_turn(mut self, turn: TurnOptions) -> Self {
        self.turn = turn;
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn without_schema_inference(mut self) -> Self {
        self.disable_schema_inference = true;
        self
    }
}

/// A typed decode of an agent message at one point in the turn.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredSnapshot<T> {
    pub value: T,
    pub raw: String,
    /// `true` for a completed message, `false` for an in-progress update.
    pub is_final: bool,
}

/// Frames of a structured run: every raw event, with snapshots placed just
/// before the message event they were decoded from.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredEvent<T> {
    Event(ThreadEvent),
    Snapshot(StructuredSnapshot<T>),
}

impl<T> RunStream<StructuredEvent<T>> {
    /// Next snapshot, skipping raw events.
    pub async fn next_snapshot(&mut self) -> Option<StructuredSnapshot<T>> {
        while let Some(frame) = self.recv().await {
            if let StructuredEvent::Snapshot(snapshot) = frame {
                return Some(snapshot);
            }
        }
        None
    }
}

impl Thread {
    /// Run a turn and stream its events along with typed snapshots.
    pub fn run_streamed_json<T>(
        &self,
        input: impl Into<Input>,
        options: StructuredOptions,
    ) -> Result<RunStream<StructuredEvent<T>>, CodexError>
    where
        T: DeserializeOwned + JsonSchema + Send + 'static,
    {
        let turn = structured_turn::<T>(options)?;
        let setup = self.prepare(input.into(), turn)?;
        Ok(spawn_run(setup, StructuredPipeline::<T>::new()))
    }

    /// Run a turn to completion and decode its final message.
    pub async fn run_json<T>(&self, input: impl Into<Input>, options: StructuredOptions) -> Result<T, CodexError>
    where
        T: DeserializeOwned + JsonSchema + Send + 'static,
    {
        let mut stream = self.run_streamed_json::<T>(input, options)?;
        let mut last = None;
        while let Some(snapshot) = stream.next_snapshot().await {
            if snapshot.is_final {
                last = Some(snapshot.value);
            }
        }
        stream.wait().await?;
        last.ok_or(CodexError::NoStructuredOutput)
    }
}

fn structured_turn<T: JsonSchema>(options: StructuredOptions) -> Result<TurnOptions, CodexError> {
    let StructuredOptions {
        mut turn,
        schema,
        disable_schema_inference,
    } = options;

    let schema = match (schema, turn.output_schema.take()) {
        (Some(explicit), _) => explicit,
        (None, Some(from_turn)) => from_turn,
        (None, None) if !disable_schema_inference => {
            let inferred = schemars::schema_for!(T);
            debug!(type_name = std::any::type_name::<T>(), "inferred output schema");
            let mut schema = serde_json::to_value(inferred)
                .map_err(|e| CodexError::Schema(format!("serialize inferred schema: {e}")))?;
            close_objects(&mut schema);
            schema
        }
        (None, None) => {
            return Err(CodexError::Schema(
                "structured run needs a schema: set StructuredOptions::schema or TurnOptions::output_schema".into(),
            ))
        }
    };
    turn.output_schema = Some(schema);
    Ok(turn)
}

/// Strict structured output rejects open objects: every object schema that
/// does not say otherwise gets `additionalProperties: false`.
fn close_objects(schema: &mut Value) {
    match schema {
        Value::Object(map) => {
            if map.get("type").and_then(Value::as_str) == Some("object") && !map.contains_key("additionalProperties") {
                map.insert("additionalProperties".into(), Value::Bool(false));
            }
            map.values_mut().for_each(close_objects);
        }
        Value::Array(items) => items.iter_mut().for_each(close_objects),
        _ => {}
    }
}

/// A turn failure counts as a schema violation when the message is empty or
/// mentions schema, structured output or validation.
fn classify_turn_failure(message: String) -> CodexError {
    let lower = message.to_lowercase();
    let schema_related = message.is_empty()
        || ["schema", "structured output", "validation"]
            .iter()
            .any(|needle| lower.contains(needle));
    if schema_related {
        CodexError::SchemaViolation { message }
    } else {
        CodexError::TurnFailed { message }
    }
}

struct StructuredPipeline<T> {
    delivered_final: bool,
    turn_completed: bool,
    _target: PhantomData<fn() -> T>,
}

impl<T> StructuredPipeline<T> {
    fn new() -> Self {
        Self {
            delivered_final: false,
            turn_completed: false,
            _target: PhantomData,
        }
    }
}

impl<T: DeserializeOwned + Send + 'static> EventPipeline for StructuredPipeline<T> {
    type Frame = StructuredEvent<T>;

    fn observe(&mut self, event: ThreadEvent, frames: &mut Vec<StructuredEvent<T>>) -> Result<(), CodexError> {
        let mut outcome = Ok(());
        match &event {
            ThreadEvent::ItemUpdated(updated) => {
                if let ThreadItem::AgentMessage(message) = &updated.item {
                    // Partial JSON is expected mid-stream.
                    match serde_json::from_str::<T>(&message.text) {
                        Ok(value) => frames.push(snapshot(value, &message.text, false)),
                        Err(err) => trace!(error = %err, "partial structured output not decodable yet"),
                    }
                }
            }
            ThreadEvent::ItemCompleted(completed) => {
                if let ThreadItem::AgentMessage(message) = &completed.item {
                    match serde_json::from_str::<T>(&message.text) {
                        Ok(value) => {
                            self.delivered_final = true;
                            frames.push(snapshot(value, &message.text, true));
                        }
                        Err(err) => outcome = Err(CodexError::StructuredDecode(err)),
                    }
                }
            }
            ThreadEvent::TurnCompleted(_) => self.turn_completed = true,
            ThreadEvent::TurnFailed(failed) => {
                outcome = Err(classify_turn_failure(failed.error.message.clone()));
            }
            _ => {}
        }
        frames.push(StructuredEvent::Event(event));
        outcome
    }

    fn finish(&mut self) -> Result<(), CodexError> {
        if self.turn_completed && !self.delivered_final {
            return Err(CodexError::NoStructuredOutput);
        }
        Ok(())
    }
}

fn snapshot<T>(value: T, raw: &str, is_final: bool) -> StructuredEvent<T> {
    StructuredEvent::Snapshot(StructuredSnapshot {
        value,
        raw: raw.to_string(),
        is_final,
    })
}
