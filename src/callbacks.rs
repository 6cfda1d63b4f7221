use crate::protocol::*;

/// Lifecycle stage of the item an item callback fires for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemStage {
    Started,
    Updated,
    Completed,
}

type EventHook<E> = Option<Box<dyn FnMut(&E) + Send>>;
type ItemHook<I> = Option<Box<dyn FnMut(ItemStage, &I) + Send>>;
type FileChangeHook = Option<Box<dyn FnMut(ItemStage, &FileChangeItem, &FileUpdateChange) + Send>>;

/// Optional hooks run synchronously on the delivery path, before an event
/// reaches the stream consumer.
///
/// For each event `on_event` fires first, then the hook for the event's
/// kind, then (for item events) the hook for the item's kind. Hooks that
/// block stall delivery and, through the pipe, the agent process.
#[derive(Default)]
pub struct StreamCallbacks {
    on_event: EventHook<ThreadEvent>,

    on_thread_started: EventHook<ThreadStartedEvent>,
    on_turn_started: EventHook<TurnStartedEvent>,
    on_turn_completed: EventHook<TurnCompletedEvent>,
    on_turn_failed: EventHook<TurnFailedEvent>,
    on_thread_error: EventHook<StreamErrorEvent>,

    on_message: ItemHook<AgentMessageItem>,
    on_reasoning: ItemHook<ReasoningItem>,
    on_command: ItemHook<CommandExecutionItem>,
    on_patch: ItemHook<FileChangeItem>,
    on_file_change: FileChangeHook,
    on_web_search: ItemHook<WebSearchItem>,
    on_tool_call: ItemHook<McpToolCallItem>,
    on_todo_list: ItemHook<TodoListItem>,
    on_error_item: ItemHook<ErrorItem>,
}

impl StreamCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires for every event, before any kind-specific hook.
    pub fn on_event(mut self, f: impl FnMut(&ThreadEvent) + Send + 'static) -> Self {
        self.on_event = Some(Box::new(f));
        self
    }

    pub fn on_thread_started(mut self, f: impl FnMut(&ThreadStartedEvent) + Send + 'static) -> Self {
        self.on_thread_started = Some(Box::new(f));
        self
    }

    pub fn on_turn_started(mut self, f: impl FnMut(&TurnStartedEvent) + Send + 'static) -> Self {
        self.on_turn_started = Some(Box::new(f));
        self
    }

    pub fn on_turn_completed(mut self, f: impl FnMut(&TurnCompletedEvent) + Send + 'static) -> Self {
        self.on_turn_completed = Some(Box::new(f));
        self
    }

    pub fn on_turn_failed(mut self, f: impl FnMut(&TurnFailedEvent) + Send + 'static) -> Self {
        self.on_turn_failed = Some(Box::new(f));
        self
    }

    pub fn on_thread_error(mut self, f: impl FnMut(&StreamErrorEvent) + Send + 'static) -> Self {
        self.on_thread_error = Some(Box::new(f));
        self
    }

    pub fn on_message(mut self, f: impl FnMut(ItemStage, &AgentMessageItem) + Send + 'static) -> Self {
        self.on_message = Some(Box::new(f));
        self
    }

    pub fn on_reasoning(mut self, f: impl FnMut(ItemStage, &ReasoningItem) + Send + 'static) -> Self {
        self.on_reasoning = Some(Box::new(f));
        self
    }

    pub fn on_command(
        mut self,
        f: impl FnMut(ItemStage, &CommandExecutionItem) + Send + 'static,
    ) -> Self {
        self.on_command = Some(Box::new(f));
        self
    }

    /// Fires once per file-change item.
    pub fn on_patch(mut self, f: impl FnMut(ItemStage, &FileChangeItem) + Send + 'static) -> Self {
        self.on_patch = Some(Box::new(f));
        self
    }

    /// Fires once per listed change of a file-change item, in list order,
    /// after `on_patch`.
    pub fn on_file_change(
        mut self,
        f: impl FnMut(ItemStage, &FileChangeItem, &FileUpdateChange) + Send + 'static,
    ) -> Self {
        self.on_file_change = Some(Box::new(f));
        self
    }

    pub fn on_web_search(mut self, f: impl FnMut(ItemStage, &WebSearchItem) + Send + 'static) -> Self {
        self.on_web_search = Some(Box::new(f));
        self
    }

    pub fn on_tool_call(mut self, f: impl FnMut(ItemStage, &McpToolCallItem) + Send + 'static) -> Self {
        self.on_tool_call = Some(Box::new(f));
        self
    }

    pub fn on_todo_list(mut self, f: impl FnMut(ItemStage, &TodoListItem) + Send + 'static) -> Self {
        self.on_todo_list = Some(Box::new(f));
        self
    }

    pub fn on_error_item(mut self, f: impl FnMut(ItemStage, &ErrorItem) + Send + 'static) -> Self {
        self.on_error_item = Some(Box::new(f));
        self
    }

    pub(crate) fn dispatch(&mut self, event: &ThreadEvent) {
        if let Some(f) = self.on_event.as_mut() {
            f(event);
        }

        match event {
            ThreadEvent::ThreadStarted(e) => fire(&mut self.on_thread_started, e),
            ThreadEvent::TurnStarted(e) => fire(&mut self.on_turn_started, e),
            ThreadEvent::TurnCompleted(e) => fire(&mut self.on_turn_completed, e),
            ThreadEvent::TurnFailed(e) => fire(&mut self.on_turn_failed, e),
            ThreadEvent::Error(e) => fire(&mut self.on_thread_error, e),
            ThreadEvent::ItemStarted(e) => self.dispatch_item(ItemStage::Started, &e.item),
            ThreadEvent::ItemUpdated(e) => self.dispatch_item(ItemStage::Updated, &e.item),
            ThreadEvent::ItemCompleted(e) => self.dispatch_item(ItemStage::Completed, &e.item),
        }
    }

    fn dispatch_item(&mut self, stage: ItemStage, item: &ThreadItem) {
        match item {
            ThreadItem::AgentMessage(i) => fire_item(&mut self.on_message, stage, i),
            ThreadItem::Reasoning(i) => fire_item(&mut self.on_reasoning, stage, i),
            ThreadItem::CommandExecution(i) => fire_item(&mut self.on_command, stage, i),
            ThreadItem::FileChange(patch) => {
                fire_item(&mut self.on_patch, stage, patch);
                if let Some(f) = self.on_file_change.as_mut() {
                    for change in &patch.changes {
                        f(stage, patch, change);
                    }
                }
            }
            ThreadItem::McpToolCall(i) => fire_item(&mut self.on_tool_call, stage, i),
            ThreadItem::WebSearch(i) => fire_item(&mut self.on_web_search, stage, i),
            ThreadItem::TodoList(i) => fire_item(&mut self.on_todo_list, stage, i),
            ThreadItem::Error(i) => fire_item(&mut self.on_error_item, stage, i),
        }
    }
}

fn fire<E>(hook: &mut EventHook<E>, payload: &E) {
    if let Some(f) = hook.as_mut() {
        f(payload);
    }
}

fn fire_item<I>(hook: &mut ItemHook<I>, stage: ItemStage, item: &I) {
    if let Some(f) = hook.as_mut() {
        f(stage, item);
    }
}

impl std::fmt::Debug for StreamCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCallbacks").finish_non_exhaustive()
    }
}
