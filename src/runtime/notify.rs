//! Post-commit notification collaborators
//!
//! Renderers and live viewers are told about history changes only after the
//! transaction commits and the workflow lock is released. Delivery is
//! best-effort and every message is idempotent: a redundant render request
//! or delta is a harmless no-op for whoever receives it.

use serde_json::Value;
use tokio::sync::broadcast;

/// Sink for render requests and viewer broadcasts
pub trait Notifier: Send + Sync {
    /// Ask the renderer to bring the workflow's outputs up to `command_id`
    fn schedule_render(&self, workflow_id: i64, command_id: i64);

    /// Push a JSON payload to anyone watching the workflow
    fn notify_listeners(&self, workflow_id: i64, payload: Value);
}

/// Notifier that only logs; the default when nothing is listening
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn schedule_render(&self, workflow_id: i64, command_id: i64) {
        tracing::debug!("Render requested for workflow {} at command {}", workflow_id, command_id);
    }

    fn notify_listeners(&self, workflow_id: i64, payload: Value) {
        tracing::debug!("Workflow {} listeners <- {}", workflow_id, payload);
    }
}

/// Message fanned out by `ChannelNotifier`
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Render { workflow_id: i64, command_id: i64 },
    Listeners { workflow_id: i64, payload: Value },
}

impl Notification {
    pub fn workflow_id(&self) -> i64 {
        match self {
            Notification::Render { workflow_id, .. } | Notification::Listeners { workflow_id, .. } => *workflow_id,
        }
    }
}

/// Broadcasts notifications to any number of in-process subscribers
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: broadcast::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    fn publish(&self, notification: Notification) {
        // No receivers is fine: nobody is watching right now
        if self.sender.send(notification).is_err() {
            tracing::trace!("Dropped notification; no subscribers");
        }
    }
}

impl Notifier for ChannelNotifier {
    fn schedule_render(&self, workflow_id: i64, command_id: i64) {
        self.publish(Notification::Render { workflow_id, command_id });
    }

    fn notify_listeners(&self, workflow_id: i64, payload: Value) {
        self.publish(Notification::Listeners { workflow_id, payload });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn channel_fans_out_to_every_subscriber() {
        let notifier = ChannelNotifier::new(8);
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();

        notifier.schedule_render(3, 17);
        notifier.notify_listeners(3, json!({"type": "apply_delta"}));

        for receiver in [&mut first, &mut second] {
            assert_eq!(
                receiver.recv().await.unwrap(),
                Notification::Render { workflow_id: 3, command_id: 17 }
            );
            let next = receiver.recv().await.unwrap();
            assert_eq!(next.workflow_id(), 3);
        }
    }

    #[test]
    fn sending_without_subscribers_is_harmless() {
        let notifier = ChannelNotifier::new(1);
        notifier.schedule_render(1, 1);
        notifier.schedule_render(1, 1);
    }
}
