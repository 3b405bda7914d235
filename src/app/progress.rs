use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Well-known channels shared between progress emitters and subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressChannel {
    PlatformChannel,
    RefreshDevices,
    RefreshClients,
    ConfigureDevice,
    Adb,
    PushScript,
    AdbSupervisor,
    Ping,
    FlashOperation,
    FlashRunner,
    FlashDriver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Running,
    Info,
    Warn,
    Complete,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub channel: ProgressChannel,
    pub operation: String,
    pub message: String,
    pub status: ProgressStatus,
    pub progress: Option<u8>,
    pub detail: Option<String>,
    pub id: String,
}

struct ChildSlot {
    weight: u32,
    percent: u8,
}

struct Operation {
    id: String,
    title: String,
    percent: u8,
    terminal: bool,
}

impl Operation {
    fn new(title: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            percent: 0,
            terminal: false,
        }
    }
}

#[derive(Default)]
struct Inner {
    operations: HashMap<ProgressChannel, Operation>,
    parent_of: HashMap<ProgressChannel, ProgressChannel>,
    children_of: HashMap<ProgressChannel, HashMap<ProgressChannel, ChildSlot>>,
}

/// Process-wide progress tracker. Operations report on a channel; composite
/// operations register weighted child channels whose progress rolls up into
/// the parent percentage. Every call is fire-and-forget: the bus logs and
/// ignores malformed input instead of surfacing errors to the caller.
pub struct ProgressBus {
    inner: Mutex<Inner>,
    sender: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Inner::default()),
            sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Begin a flat operation, resetting any prior terminal state for the
    /// channel.
    pub fn start(&self, channel: ProgressChannel, title: &str, message: &str) {
        let event = {
            let mut inner = self.lock();
            let operation = Operation::new(title);
            let event = self.event_for(&operation, channel, message, ProgressStatus::Running, Some(0), None);
            inner.operations.insert(channel, operation);
            if let Some(parent) = inner.parent_of.get(&channel).copied() {
                if let Some(slot) = inner
                    .children_of
                    .get_mut(&parent)
                    .and_then(|slots| slots.get_mut(&channel))
                {
                    slot.percent = 0;
                }
            }
            event
        };
        self.emit(event);
    }

    /// Begin a composite operation whose listed child channels roll up into
    /// this channel's percentage, weighted.
    pub fn start_operation(
        &self,
        channel: ProgressChannel,
        title: &str,
        message: &str,
        children: &[(ProgressChannel, u32)],
    ) {
        let event = {
            let mut inner = self.lock();
            self.unregister_children(&mut inner, channel);
            let mut slots = HashMap::new();
            for (child, weight) in children {
                if *child == channel {
                    warn!(channel = ?channel, "progress operation cannot be its own child");
                    continue;
                }
                inner.parent_of.insert(*child, channel);
                slots.insert(
                    *child,
                    ChildSlot {
                        weight: *weight,
                        percent: 0,
                    },
                );
            }
            inner.children_of.insert(channel, slots);

            let operation = Operation::new(title);
            let event = self.event_for(&operation, channel, message, ProgressStatus::Running, Some(0), None);
            inner.operations.insert(channel, operation);
            event
        };
        self.emit(event);
    }

    pub fn update(&self, channel: ProgressChannel, message: &str, percent: Option<u8>) {
        let events = {
            let mut inner = self.lock();
            let Some(event) = self.apply_update(&mut inner, channel, message, percent, ProgressStatus::Info)
            else {
                return;
            };
            let mut events = vec![event];
            if let Some(parent_event) = self.roll_up(&mut inner, channel, message) {
                events.push(parent_event);
            }
            events
        };
        for event in events {
            self.emit(event);
        }
    }

    pub fn complete(&self, channel: ProgressChannel, message: &str) {
        let events = {
            let mut inner = self.lock();
            let Some(mut event) =
                self.apply_update(&mut inner, channel, message, Some(100), ProgressStatus::Complete)
            else {
                return;
            };
            event.progress = Some(100);
            if let Some(operation) = inner.operations.get_mut(&channel) {
                operation.terminal = true;
                operation.percent = 100;
            }
            let mut events = vec![event];
            if let Some(parent_event) = self.roll_up(&mut inner, channel, message) {
                events.push(parent_event);
            }
            self.unregister_children(&mut inner, channel);
            events
        };
        for event in events {
            self.emit(event);
        }
    }

    pub fn error(&self, channel: ProgressChannel, message: &str, detail: &str) {
        let events = {
            let mut inner = self.lock();
            let Some(mut event) =
                self.apply_update(&mut inner, channel, message, None, ProgressStatus::Error)
            else {
                return;
            };
            event.detail = Some(detail.to_string());
            if let Some(operation) = inner.operations.get_mut(&channel) {
                operation.terminal = true;
            }
            let mut events = vec![event];
            // A failing child surfaces on the parent channel without
            // terminating the parent operation.
            if let Some(parent) = inner.parent_of.get(&channel).copied() {
                if let Some(operation) = inner.operations.get(&parent) {
                    if !operation.terminal {
                        let mut parent_event = self.event_for(
                            operation,
                            parent,
                            message,
                            ProgressStatus::Error,
                            Some(operation.percent),
                            Some(detail.to_string()),
                        );
                        parent_event.detail = Some(detail.to_string());
                        events.push(parent_event);
                    }
                }
            }
            self.unregister_children(&mut inner, channel);
            events
        };
        for event in events {
            self.emit(event);
        }
    }

    pub fn warn(&self, channel: ProgressChannel, message: &str, detail: Option<&str>) {
        let event = {
            let mut inner = self.lock();
            let Some(mut event) =
                self.apply_update(&mut inner, channel, message, None, ProgressStatus::Warn)
            else {
                return;
            };
            event.detail = detail.map(|value| value.to_string());
            event
        };
        self.emit(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Update the channel's operation state and build the event to emit.
    /// Returns `None` when the operation is terminal (no further updates are
    /// accepted until a new `start`).
    fn apply_update(
        &self,
        inner: &mut Inner,
        channel: ProgressChannel,
        message: &str,
        percent: Option<u8>,
        status: ProgressStatus,
    ) -> Option<ProgressEvent> {
        if !inner.operations.contains_key(&channel) {
            inner.operations.insert(channel, Operation::new(""));
        }
        let operation = inner.operations.get_mut(&channel)?;
        if operation.terminal {
            debug!(channel = ?channel, message, "progress update after terminal state ignored");
            return None;
        }
        if let Some(percent) = percent {
            // Progress is monotonic within one operation lifetime.
            operation.percent = operation.percent.max(percent.min(100));
        }
        let reported = percent.map(|_| operation.percent);
        Some(self.event_for(operation, channel, message, status, reported, None))
    }

    /// Recompute the parent aggregate after a child's contribution changed.
    fn roll_up(
        &self,
        inner: &mut Inner,
        channel: ProgressChannel,
        message: &str,
    ) -> Option<ProgressEvent> {
        let parent = inner.parent_of.get(&channel).copied()?;
        let child_percent = inner.operations.get(&channel).map(|op| op.percent)?;

        let slots = inner.children_of.get_mut(&parent)?;
        let slot = slots.get_mut(&channel)?;
        slot.percent = child_percent;

        let total_weight: u32 = slots.values().map(|slot| slot.weight).sum();
        if total_weight == 0 {
            warn!(parent = ?parent, "progress roll-up skipped: zero total weight");
            return None;
        }
        let weighted: u32 = slots
            .values()
            .map(|slot| u32::from(slot.percent) * slot.weight)
            .sum();
        let aggregate = ((weighted as f64 / total_weight as f64).round() as u8).min(100);

        let operation = inner.operations.get_mut(&parent)?;
        if operation.terminal {
            return None;
        }
        operation.percent = operation.percent.max(aggregate);
        let event = self.event_for(
            operation,
            parent,
            message,
            ProgressStatus::Info,
            Some(operation.percent),
            None,
        );
        Some(event)
    }

    fn unregister_children(&self, inner: &mut Inner, parent: ProgressChannel) {
        if let Some(slots) = inner.children_of.remove(&parent) {
            for child in slots.keys() {
                inner.parent_of.remove(child);
            }
        }
    }

    fn event_for(
        &self,
        operation: &Operation,
        channel: ProgressChannel,
        message: &str,
        status: ProgressStatus,
        progress: Option<u8>,
        detail: Option<String>,
    ) -> ProgressEvent {
        ProgressEvent {
            channel,
            operation: operation.title.clone(),
            message: message.to_string(),
            status,
            progress,
            detail,
            id: operation.id.clone(),
        }
    }

    fn emit(&self, event: ProgressEvent) {
        debug!(
            channel = ?event.channel,
            status = ?event.status,
            progress = ?event.progress,
            "{}",
            event.message
        );
        // Fire-and-forget: no subscribers is not an error.
        let _ = self.sender.send(event);
    }
}
