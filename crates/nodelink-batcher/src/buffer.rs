//! Accumulates queued events until a batch limit is hit.

use crate::mux_demux::Message;

/// Bounded batch under construction.
#[derive(Debug)]
pub struct Buffer {
    max_elements: usize,
    max_size: usize,
    messages: Vec<Message>,
    size: usize,
}

impl Buffer {
    /// Buffer flushing at `max_elements` messages or `max_size` body bytes.
    pub fn new(max_elements: usize, max_size: usize) -> Self {
        Self {
            max_elements,
            max_size,
            messages: Vec::new(),
            size: 0,
        }
    }

    /// Appends a message; its size is the length of its JSON body.
    pub fn add_message(&mut self, message: Message) {
        self.size += serde_json::to_string(&message.msg)
            .map(|s| s.len())
            .unwrap_or(0);
        self.messages.push(message);
    }

    /// Messages held.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True when no message is held.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Serialized bytes held.
    pub fn size(&self) -> usize {
        self.size
    }

    /// True once the element limit is reached.
    pub fn check_count_limit(&self) -> bool {
        self.messages.len() >= self.max_elements
    }

    /// True once the byte limit is reached.
    pub fn check_size_limit(&self) -> bool {
        self.size >= self.max_size
    }

    /// Either limit reached.
    pub fn is_full(&self) -> bool {
        self.check_count_limit() || self.check_size_limit()
    }

    /// Hands out the batch and leaves the buffer empty.
    pub fn take(&mut self) -> Vec<Message> {
        self.size = 0;
        std::mem::take(&mut self.messages)
    }
}
