//! Per-user flood control: a token bucket with a deferred message queue.
//!
//! A user starts with a full bucket. Handling a message costs one token,
//! charged after the handler runs. Once the bucket is empty, further inbound
//! messages are deferred in arrival order; each tick refills one token and
//! drains what the bucket allows.

use std::collections::VecDeque;

use minnow_proto::Message;

/// Messages a user may have handled before deferral begins.
pub const MESSAGE_TOKEN_LIMIT: u32 = 10;

/// Deferred messages at which a user is disconnected for flooding.
pub const EXCESS_FLOOD_THRESHOLD: usize = 50;

#[derive(Debug)]
pub struct MessageThrottle {
    tokens: u32,
    queue: VecDeque<Message>,
}

impl Default for MessageThrottle {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageThrottle {
    pub fn new() -> Self {
        Self {
            tokens: MESSAGE_TOKEN_LIMIT,
            queue: VecDeque::new(),
        }
    }

    /// Whether a message may be handled right now.
    pub fn has_token(&self) -> bool {
        self.tokens > 0
    }

    /// Charge for a handled message.
    pub fn consume(&mut self) {
        self.tokens = self.tokens.saturating_sub(1);
    }

    /// Defer a message; returns the new queue length so the caller can apply
    /// the excess-flood cut-off.
    pub fn defer(&mut self, message: Message) -> usize {
        self.queue.push_back(message);
        self.queue.len()
    }

    /// Once-per-tick refill, up to the cap.
    pub fn refill(&mut self) {
        if self.tokens < MESSAGE_TOKEN_LIMIT {
            self.tokens += 1;
        }
    }

    /// Take the next deferred message if the bucket allows handling it.
    pub fn pop_ready(&mut self) -> Option<Message> {
        if self.tokens > 0 {
            self.queue.pop_front()
        } else {
            None
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: usize) -> Message {
        Message::new("PRIVMSG", vec!["#x".to_string(), n.to_string()])
    }

    #[test]
    fn burst_defers_after_limit() {
        let mut throttle = MessageThrottle::new();

        // 15 instantaneous messages: 10 handled, 5 deferred.
        let mut handled = 0;
        for n in 0..15 {
            if throttle.has_token() {
                handled += 1;
                throttle.consume();
            } else {
                throttle.defer(msg(n));
            }
        }
        assert_eq!(handled, 10);
        assert_eq!(throttle.queue_len(), 5);

        // One tick: one token, exactly one deferred message drains.
        throttle.refill();
        let mut drained = 0;
        while let Some(_m) = throttle.pop_ready() {
            throttle.consume();
            drained += 1;
        }
        assert_eq!(drained, 1);
        assert_eq!(throttle.queue_len(), 4);

        // Five more ticks clear the queue.
        for _ in 0..5 {
            throttle.refill();
            while let Some(_m) = throttle.pop_ready() {
                throttle.consume();
            }
        }
        assert_eq!(throttle.queue_len(), 0);
    }

    #[test]
    fn deferred_messages_keep_order() {
        let mut throttle = MessageThrottle::new();
        for _ in 0..10 {
            throttle.consume();
        }
        for n in 0..3 {
            throttle.defer(msg(n));
        }
        throttle.refill();
        assert_eq!(throttle.pop_ready(), Some(msg(0)));
        throttle.consume();
        assert_eq!(throttle.pop_ready(), None);
    }

    #[test]
    fn refill_caps_at_limit() {
        let mut throttle = MessageThrottle::new();
        for _ in 0..20 {
            throttle.refill();
        }
        let mut available = 0;
        while throttle.has_token() {
            throttle.consume();
            available += 1;
        }
        assert_eq!(available, MESSAGE_TOKEN_LIMIT);
    }
}
