//! Outbound frame queue
//!
//! Holds NDJSON lines addressed to a session whose transport is not attached.
//! Append-only until a transport attaches, then drained in append order.

use std::collections::VecDeque;

/// Frames waiting for a transport, oldest first
#[derive(Debug, Default)]
pub struct OutboundQueue {
    frames: VecDeque<String>,
    limit: Option<usize>,
}

/// Returned by [`OutboundQueue::push`] when the limit is reached
#[derive(Debug, PartialEq, Eq)]
pub struct QueueFull;

impl OutboundQueue {
    /// Create a queue; `None` means unbounded
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            frames: VecDeque::new(),
            limit,
        }
    }

    /// Append one NDJSON line
    pub fn push(&mut self, line: String) -> Result<(), QueueFull> {
        if let Some(limit) = self.limit {
            if self.frames.len() >= limit {
                return Err(QueueFull);
            }
        }
        self.frames.push_back(line);
        Ok(())
    }

    /// Take every queued line, leaving the queue empty
    pub fn drain(&mut self) -> Vec<String> {
        self.frames.drain(..).collect()
    }

    /// Put back lines that could not be delivered, ahead of anything newer
    pub fn requeue_front(&mut self, lines: Vec<String>) {
        for line in lines.into_iter().rev() {
            self.frames.push_front(line);
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
