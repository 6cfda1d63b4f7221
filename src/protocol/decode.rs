use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use super::events::*;
use super::items::*;

/// Which decode stage failed, and for what discriminant.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("decode event envelope: {source}")]
    Envelope {
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown event type {kind:?}")]
    UnknownEvent { kind: String },
    #[error("decode {kind} event: {source}")]
    Event {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("decode item envelope: {source}")]
    ItemEnvelope {
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown item type {kind:?}")]
    UnknownItem { kind: String },
    #[error("decode {kind} item: {source}")]
    Item {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct ItemEnvelope {
    item: Value,
}

/// Decode one protocol line.
///
/// The first pass reads only `type`; the second decodes the full line into
/// the structure that discriminant names. Item payloads go through the same
/// two passes on their own `type`.
pub fn decode_event(line: &str) -> Result<ThreadEvent, DecodeError> {
    let envelope: Envelope =
        serde_json::from_str(line).map_err(|source| DecodeError::Envelope { source })?;
    let kind = EventKind::from_wire(&envelope.kind).ok_or(DecodeError::UnknownEvent {
        kind: envelope.kind,
    })?;

    let event = match kind {
        EventKind::ThreadStarted => ThreadEvent::ThreadStarted(event_body(kind, line)?),
        EventKind::TurnStarted => ThreadEvent::TurnStarted(event_body(kind, line)?),
        EventKind::TurnCompleted => ThreadEvent::TurnCompleted(event_body(kind, line)?),
        EventKind::TurnFailed => ThreadEvent::TurnFailed(event_body(kind, line)?),
        EventKind::ItemStarted => ThreadEvent::ItemStarted(item_event(kind, line)?),
        EventKind::ItemUpdated => ThreadEvent::ItemUpdated(item_event(kind, line)?),
        EventKind::ItemCompleted => ThreadEvent::ItemCompleted(item_event(kind, line)?),
        EventKind::Error => ThreadEvent::Error(event_body(kind, line)?),
    };
    Ok(event)
}

/// Decode an item payload on its own `type` discriminant.
pub fn decode_item(raw: &Value) -> Result<ThreadItem, DecodeError> {
    let envelope =
        Envelope::deserialize(raw).map_err(|source| DecodeError::ItemEnvelope { source })?;
    let kind = ItemKind::from_wire(&envelope.kind).ok_or(DecodeError::UnknownItem {
        kind: envelope.kind,
    })?;

    let item = match kind {
        ItemKind::AgentMessage => ThreadItem::AgentMessage(item_body(kind, raw)?),
        ItemKind::Reasoning => ThreadItem::Reasoning(item_body(kind, raw)?),
        ItemKind::CommandExecution => ThreadItem::CommandExecution(item_body(kind, raw)?),
        ItemKind::FileChange => ThreadItem::FileChange(item_body(kind, raw)?),
        ItemKind::McpToolCall => ThreadItem::McpToolCall(item_body(kind, raw)?),
        ItemKind::WebSearch => ThreadItem::WebSearch(item_body(kind, raw)?),
        ItemKind::TodoList => ThreadItem::TodoList(item_body(kind, raw)?),
        ItemKind::Error => ThreadItem::Error(item_body(kind, raw)?),
    };
    Ok(item)
}

fn event_body<T: DeserializeOwned>(kind: EventKind, line: &str) -> Result<T, DecodeError> {
    serde_json::from_str(line).map_err(|source| DecodeError::Event {
        kind: kind.as_str(),
        source,
    })
}

fn item_event(kind: EventKind, line: &str) -> Result<ItemEvent, DecodeError> {
    let envelope: ItemEnvelope = event_body(kind, line)?;
    Ok(ItemEvent {
        item: decode_item(&envelope.item)?,
    })
}

fn item_body<T: DeserializeOwned>(kind: ItemKind, raw: &Value) -> Result<T, DecodeError> {
    T::deserialize(raw).map_err(|source| DecodeError::Item {
        kind: kind.as_str(),
        source,
    })
}
