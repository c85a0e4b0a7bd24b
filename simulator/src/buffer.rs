use chrono::{DateTime, Utc};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Measurement,
    Heartbeat,
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub kind: MessageKind,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Unbounded FIFO of messages waiting for the broker to come back.
/// Lives only in memory; a crash loses its content.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    messages: VecDeque<OutboundMessage>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: OutboundMessage) {
        self.messages.push_back(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Takes every buffered message, oldest first.
    pub fn take(&mut self) -> VecDeque<OutboundMessage> {
        std::mem::take(&mut self.messages)
    }

    /// Puts unsent messages back in front of anything buffered meanwhile.
    pub fn restore(&mut self, mut unsent: VecDeque<OutboundMessage>) {
        unsent.append(&mut self.messages);
        self.messages = unsent;
    }
}
