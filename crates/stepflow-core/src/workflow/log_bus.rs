//! Execution log bus: live, per-execution fan-out of [`LogEvent`]s.
//!
//! Each live execution owns one `tokio::sync::broadcast` channel, opened when
//! the execution starts and dropped when it reaches a terminal state. Dropping
//! the sender ends every subscription once its buffered events are drained,
//! so the registry never holds channels for finished executions. There is no
//! replay: a new subscriber only sees events published after it subscribed.
//!
//! Every published event is mirrored to `tracing` at its level.

use dashmap::DashMap;
use futures_util::Stream;
use stepflow_types::event::{LogEvent, LogLevel};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Server-side subscription filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    /// Only events for this task or tasks nested under it.
    pub task_id: Option<String>,
    pub min_level: LogLevel,
}

impl LogFilter {
    pub fn matches(&self, event: &LogEvent) -> bool {
        if event.level < self.min_level {
            return false;
        }
        match (&self.task_id, &event.task_id) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(wanted), Some(actual)) => {
                actual == wanted
                    || actual
                        .strip_prefix(wanted.as_str())
                        .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('['))
            }
        }
    }
}

pub struct LogBus {
    channels: DashMap<Uuid, broadcast::Sender<LogEvent>>,
    capacity: usize,
}

impl LogBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Register the channel of a starting execution.
    pub fn open(&self, execution_id: Uuid) {
        self.channels
            .entry(execution_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    /// Drop the channel of a finished execution, ending its subscriptions.
    pub fn close(&self, execution_id: &Uuid) {
        self.channels.remove(execution_id);
    }

    pub fn is_open(&self, execution_id: &Uuid) -> bool {
        self.channels.contains_key(execution_id)
    }

    /// Publish an event. Events for executions without a channel are only traced.
    pub fn publish(&self, event: LogEvent) {
        trace_event(&event);
        if let Some(sender) = self.channels.get(&event.execution_id) {
            // No subscribers is fine.
            let _ = sender.send(event);
        }
    }

    /// Subscribe to future events of an execution. Subscribing to an
    /// execution without a live channel yields an already-ended subscription.
    pub fn subscribe(&self, execution_id: Uuid, filter: LogFilter) -> LogSubscription {
        let receiver = self.channels.get(&execution_id).map(|s| s.subscribe());
        LogSubscription {
            execution_id,
            receiver,
            filter,
        }
    }

    pub fn subscriber_count(&self, execution_id: &Uuid) -> usize {
        self.channels
            .get(execution_id)
            .map_or(0, |s| s.receiver_count())
    }
}

impl std::fmt::Debug for LogBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBus")
            .field("open_channels", &self.channels.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn trace_event(event: &LogEvent) {
    let task_id = event.task_id.as_deref().unwrap_or("-");
    let status = event.status.as_deref().unwrap_or("-");
    match event.level {
        LogLevel::Debug => tracing::debug!(
            execution_id = %event.execution_id,
            task_id,
            status,
            "{}",
            event.message
        ),
        LogLevel::Info => tracing::info!(
            execution_id = %event.execution_id,
            task_id,
            status,
            "{}",
            event.message
        ),
        LogLevel::Warn => tracing::warn!(
            execution_id = %event.execution_id,
            task_id,
            status,
            "{}",
            event.message
        ),
        LogLevel::Error => tracing::error!(
            execution_id = %event.execution_id,
            task_id,
            status,
            "{}",
            event.message
        ),
    }
}

/// A live tail of one execution's events.
#[derive(Debug)]
pub struct LogSubscription {
    execution_id: Uuid,
    receiver: Option<broadcast::Receiver<LogEvent>>,
    filter: LogFilter,
}

impl LogSubscription {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Next matching event, or `None` once the execution's channel is closed.
    /// Events dropped because this subscriber lagged are skipped with a warning.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        execution_id = %self.execution_id,
                        skipped,
                        "log subscriber lagged, events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    pub fn into_stream(mut self) -> impl Stream<Item = LogEvent> + Send + 'static {
        async_stream::stream! {
            while let Some(event) = self.recv().await {
                yield event;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn event(id: Uuid, level: LogLevel, task: Option<&str>, message: &str) -> LogEvent {
        let event = LogEvent::new(id, level, message);
        match task {
            Some(t) => event.with_task(t),
            None => event,
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_of_its_execution_only() {
        let bus = LogBus::new(16);
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        bus.open(a);
        bus.open(b);
        let mut sub = bus.subscribe(a, LogFilter::default());

        bus.publish(event(b, LogLevel::Info, None, "other"));
        bus.publish(event(a, LogLevel::Info, None, "mine"));

        assert_eq!(sub.recv().await.unwrap().message, "mine");
    }

    #[tokio::test]
    async fn test_min_level_and_task_filters() {
        let bus = LogBus::new(16);
        let id = Uuid::now_v7();
        bus.open(id);
        let mut sub = bus.subscribe(
            id,
            LogFilter {
                task_id: Some("fanout".to_string()),
                min_level: LogLevel::Warn,
            },
        );

        bus.publish(event(id, LogLevel::Error, Some("other"), "wrong task"));
        bus.publish(event(id, LogLevel::Info, Some("fanout"), "too quiet"));
        bus.publish(event(id, LogLevel::Error, Some("fanoutx"), "prefix only"));
        bus.publish(event(id, LogLevel::Warn, Some("fanout/check"), "nested"));
        bus.publish(event(id, LogLevel::Error, Some("fanout"), "direct"));
        bus.close(&id);

        let messages: Vec<String> = sub
            .into_stream()
            .map(|e| e.message)
            .collect()
            .await;
        assert_eq!(messages, vec!["nested", "direct"]);
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let bus = LogBus::new(16);
        let id = Uuid::now_v7();
        bus.open(id);
        bus.publish(event(id, LogLevel::Info, None, "early"));
        let mut sub = bus.subscribe(id, LogFilter::default());
        bus.publish(event(id, LogLevel::Info, None, "late"));
        assert_eq!(sub.recv().await.unwrap().message, "late");
    }

    #[tokio::test]
    async fn test_close_ends_subscription_and_unknown_is_empty() {
        let bus = LogBus::new(16);
        let id = Uuid::now_v7();
        bus.open(id);
        let mut sub = bus.subscribe(id, LogFilter::default());
        assert_eq!(bus.subscriber_count(&id), 1);
        bus.close(&id);
        assert!(sub.recv().await.is_none());
        assert!(!bus.is_open(&id));

        let mut unknown = bus.subscribe(Uuid::now_v7(), LogFilter::default());
        assert!(unknown.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_lagged_subscriber_keeps_receiving() {
        let bus = LogBus::new(2);
        let id = Uuid::now_v7();
        bus.open(id);
        let mut sub = bus.subscribe(id, LogFilter::default());
        for i in 0..5 {
            bus.publish(event(id, LogLevel::Info, None, &format!("e{i}")));
        }
        assert_eq!(sub.recv().await.unwrap().message, "e3");
        assert_eq!(sub.recv().await.unwrap().message, "e4");
    }
}
