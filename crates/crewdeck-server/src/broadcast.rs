use chrono::Utc;
use crewdeck_types::StreamEventKind;
use serde_json::{Value, json};
use tokio::sync::broadcast;

/// One typed message on the dashboard stream.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub kind: String,
    pub payload: Value,
}

/// Single-process fan-out of dashboard events.
///
/// `broadcast` never blocks and never fails: with no subscribers the message
/// is simply dropped. Each subscriber owns a bounded buffer; a subscriber
/// that falls behind loses the oldest messages and receives a
/// `{"type":"dropped","count":N}` marker instead: liveness over
/// completeness.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    sender: broadcast::Sender<StreamMessage>,
}

impl Broadcaster {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Self { sender }
    }

    pub fn broadcast(&self, kind: StreamEventKind, mut payload: Value) {
        if let Some(object) = payload.as_object_mut()
            && !object.contains_key("timestamp")
        {
            object.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
        }
        let message = StreamMessage {
            kind: kind.as_str().to_string(),
            payload,
        };
        // Err here only means nobody is listening right now.
        let _ = self.sender.send(message);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A subscriber's end of the stream.
pub struct Subscription {
    receiver: broadcast::Receiver<StreamMessage>,
}

impl Subscription {
    /// Next message, or a drop marker when the buffer overflowed, or `None`
    /// when the broadcaster is gone.
    pub async fn next(&mut self) -> Option<StreamMessage> {
        match self.receiver.recv().await {
            Ok(message) => Some(message),
            Err(broadcast::error::RecvError::Lagged(count)) => Some(StreamMessage {
                kind: "dropped".to_string(),
                payload: json!({"type": "dropped", "count": count}),
            }),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-blocking drain used by tests and the SSE loop's fast path.
    pub fn try_next(&mut self) -> Option<StreamMessage> {
        match self.receiver.try_recv() {
            Ok(message) => Some(message),
            Err(broadcast::error::TryRecvError::Lagged(count)) => Some(StreamMessage {
                kind: "dropped".to_string(),
                payload: json!({"type": "dropped", "count": count}),
            }),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_arrive_in_broadcast_order() {
        let broadcaster = Broadcaster::new(16);
        let mut sub = broadcaster.subscribe();

        broadcaster.broadcast(StreamEventKind::CardRefresh, json!({"agent_id": 1}));
        broadcaster.broadcast(StreamEventKind::StateTransition, json!({"agent_id": 1}));

        let first = sub.next().await.unwrap();
        let second = sub.next().await.unwrap();
        assert_eq!(first.kind, "card_refresh");
        assert_eq!(second.kind, "state_transition");
        assert!(first.payload["timestamp"].is_string());
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_a_noop() {
        let broadcaster = Broadcaster::new(4);
        // Must not panic or block.
        broadcaster.broadcast(StreamEventKind::CardRefresh, json!({"agent_id": 1}));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_gets_a_drop_marker() {
        let broadcaster = Broadcaster::new(4);
        let mut sub = broadcaster.subscribe();

        for i in 0..10 {
            broadcaster.broadcast(StreamEventKind::CardRefresh, json!({"agent_id": i}));
        }

        let first = sub.next().await.unwrap();
        assert_eq!(first.kind, "dropped");
        assert_eq!(first.payload["count"].as_u64().unwrap(), 6);

        // The receiver resumes at the oldest retained message, in order.
        let next = sub.next().await.unwrap();
        assert_eq!(next.payload["agent_id"], 6);
    }

    #[tokio::test]
    async fn subscribers_are_independent() {
        let broadcaster = Broadcaster::new(16);
        let mut a = broadcaster.subscribe();
        broadcaster.broadcast(StreamEventKind::SessionCreated, json!({"agent_id": 9}));

        // B subscribed after the send; only A sees it.
        let mut b = broadcaster.subscribe();
        assert_eq!(a.next().await.unwrap().kind, "session_created");
        assert!(b.try_next().is_none());
    }
}
