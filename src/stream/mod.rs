//! Outbound Stream (C11): named-topic broadcast with a sequence counter
//! shared across every channel (spec §4.8).

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{BridgeError, BridgeResult};

pub const CHANNELS: &[&str] = &[
    "eval_created",
    "journal_posted",
    "order_filled",
    "execution",
    "position_update",
    "session_event",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessage {
    pub channel: String,
    pub sequence_id: i64,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// A single broadcast sender shared by every channel; `sequence_id` is
/// allocated once per message regardless of which channel it was
/// published on, so subscribers can detect gaps across their whole feed.
pub struct OutboundStream {
    sender: broadcast::Sender<StreamMessage>,
    sequence: AtomicI64,
    valid_channels: HashSet<&'static str>,
}

impl OutboundStream {
    pub fn new(buffer: usize) -> Self {
        let (sender, _rx) = broadcast::channel(buffer);
        Self {
            sender,
            sequence: AtomicI64::new(0),
            valid_channels: CHANNELS.iter().copied().collect(),
        }
    }

    pub fn publish(&self, channel: &str, payload: serde_json::Value) -> BridgeResult<i64> {
        if !self.valid_channels.contains(channel) {
            return Err(BridgeError::validation("channel", format!("unknown channel {channel}")));
        }
        let sequence_id = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let message = StreamMessage {
            channel: channel.to_string(),
            sequence_id,
            payload,
            timestamp: Utc::now(),
        };
        // Best-effort: a subscriber whose buffer is full simply misses this message.
        let _ = self.sender.send(message);
        Ok(sequence_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamMessage> {
        self.sender.subscribe()
    }

    pub fn is_valid_channel(&self, channel: &str) -> bool {
        self.valid_channels.contains(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_channel_is_rejected() {
        let stream = OutboundStream::new(16);
        let result = stream.publish("not_a_channel", serde_json::json!({}));
        assert!(matches!(result, Err(BridgeError::Validation { .. })));
    }

    #[tokio::test]
    async fn sequence_ids_increase_across_different_channels() {
        let stream = OutboundStream::new(16);
        let mut rx = stream.subscribe();
        stream.publish("order_filled", serde_json::json!({"a": 1})).unwrap();
        stream.publish("execution", serde_json::json!({"b": 2})).unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.sequence_id > first.sequence_id);
    }
}
