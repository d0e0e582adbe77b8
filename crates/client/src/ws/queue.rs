//! Outbound queue for frames sent while a channel is not open.

use std::collections::VecDeque;

use chatwire_shared::OutboundFrame;

/// FIFO buffer of frames waiting for an open socket.
///
/// Entries leave the queue only once the transport accepted them, and are
/// never deduplicated.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    frames: VecDeque<OutboundFrame>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: OutboundFrame) {
        self.frames.push_back(frame);
    }

    pub fn front(&self) -> Option<&OutboundFrame> {
        self.frames.front()
    }

    /// Remove the head after it was sent.
    pub fn pop_sent(&mut self) -> Option<OutboundFrame> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
