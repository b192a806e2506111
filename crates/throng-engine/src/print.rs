//! Bounded diagnostic print buffer.
//!
//! Invocations append messages here; the host drains the buffer through
//! `tracing` once the run is over.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{info, warn};

/// Fixed-capacity message buffer shared by all workers of a run.
#[derive(Debug)]
pub struct HostPrint {
    messages: Mutex<Vec<String>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl HostPrint {
    pub fn new(capacity: u32) -> Self {
        Self {
            messages: Mutex::new(Vec::with_capacity(capacity as usize)),
            capacity: capacity as usize,
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a message. Returns `false` (and counts the loss) when full.
    pub fn push(&self, message: impl Into<String>) -> bool {
        let mut messages = self
            .messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if messages.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        messages.push(message.into());
        true
    }

    /// Number of messages waiting.
    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every queued message and the number lost since the last drain.
    pub fn drain(&self) -> (Vec<String>, u64) {
        let messages = std::mem::take(
            &mut *self
                .messages
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        (messages, self.dropped.swap(0, Ordering::Relaxed))
    }

    /// Drain into the log. Returns how many messages were emitted.
    pub fn flush(&self) -> usize {
        let (messages, dropped) = self.drain();
        for message in &messages {
            info!(target: "throng::print", "{message}");
        }
        if dropped > 0 {
            warn!(dropped, capacity = self.capacity, "print buffer overflowed");
        }
        messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_is_counted_and_reset_on_drain() {
        let print = HostPrint::new(2);
        assert!(print.push("a"));
        assert!(print.push(String::from("b")));
        assert!(!print.push("c"));

        let (messages, dropped) = print.drain();
        assert_eq!(messages, vec!["a", "b"]);
        assert_eq!(dropped, 1);
        assert!(print.is_empty());
        assert_eq!(print.drain().1, 0);
    }

    #[test]
    fn flush_empties_the_buffer() {
        let print = HostPrint::new(4);
        print.push("hello");
        assert_eq!(print.flush(), 1);
        assert_eq!(print.flush(), 0);
    }
}
