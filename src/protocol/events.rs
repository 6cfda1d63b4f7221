use serde::{Deserialize, Serialize};

use super::items::ThreadItem;

/// Token counts reported when a turn completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: i64,
    pub cached_input_tokens: i64,
    pub output_tokens: i64,
}

/// Error payload carried by `turn.failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadError {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadStartedEvent {
    pub thread_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnStartedEvent {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnCompletedEvent {
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnFailedEvent {
    pub error: ThreadError,
}

/// Payload shared by `item.started`, `item.updated` and `item.completed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemEvent {
    pub item: ThreadItem,
}

/// Unrecoverable failure of the event stream itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamErrorEvent {
    pub message: String,
}

/// One decoded line of `codex exec --experimental-json` output.
///
/// Serializes back to the wire shape, tagged on `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ThreadEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted(ThreadStartedEvent),
    #[serde(rename = "turn.started")]
    TurnStarted(TurnStartedEvent),
    #[serde(rename = "turn.completed")]
    TurnCompleted(TurnCompletedEvent),
    #[serde(rename = "turn.failed")]
    TurnFailed(TurnFailedEvent),
    #[serde(rename = "item.started")]
    ItemStarted(ItemEvent),
    #[serde(rename = "item.updated")]
    ItemUpdated(ItemEvent),
    #[serde(rename = "item.completed")]
    ItemCompleted(ItemEvent),
    #[serde(rename = "error")]
    Error(StreamErrorEvent),
}

impl ThreadEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ThreadEvent::ThreadStarted(_) => EventKind::ThreadStarted,
            ThreadEvent::TurnStarted(_) => EventKind::TurnStarted,
            ThreadEvent::TurnCompleted(_) => EventKind::TurnCompleted,
            ThreadEvent::TurnFailed(_) => EventKind::TurnFailed,
            ThreadEvent::ItemStarted(_) => EventKind::ItemStarted,
            ThreadEvent::ItemUpdated(_) => EventKind::ItemUpdated,
            ThreadEvent::ItemCompleted(_) => EventKind::ItemCompleted,
            ThreadEvent::Error(_) => EventKind::Error,
        }
    }

    /// The item carried by an item-lifecycle event.
    pub fn item(&self) -> Option<&ThreadItem> {
        match self {
            ThreadEvent::ItemStarted(e) | ThreadEvent::ItemUpdated(e) | ThreadEvent::ItemCompleted(e) => {
                Some(&e.item)
            }
            _ => None,
        }
    }
}

/// Discriminant of a [`ThreadEvent`], as it appears in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ThreadStarted,
    TurnStarted,
    TurnCompleted,
    TurnFailed,
    ItemStarted,
    ItemUpdated,
    ItemCompleted,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::ThreadStarted,
        EventKind::TurnStarted,
        EventKind::TurnCompleted,
        EventKind::TurnFailed,
        EventKind::ItemStarted,
        EventKind::ItemUpdated,
        EventKind::ItemCompleted,
        EventKind::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ThreadStarted => "thread.started",
            EventKind::TurnStarted => "turn.started",
            EventKind::TurnCompleted => "turn.completed",
            EventKind::TurnFailed => "turn.failed",
            EventKind::ItemStarted => "item.started",
            EventKind::ItemUpdated => "item.updated",
            EventKind::ItemCompleted => "item.completed",
            EventKind::Error => "error",
        }
    }

    pub fn from_wire(kind: &str) -> Option<EventKind> {
        EventKind::ALL.into_iter().find(|k| k.as_str() == kind)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
