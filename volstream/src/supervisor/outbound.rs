use std::collections::VecDeque;
use tokio::time::Instant;

/// Outbound frame gate used to honour upstream rate limiting.
///
/// While paused, submitted frames are queued in order and handed back by
/// [`OutboundQueue::resume`].
#[derive(Debug, Default)]
pub struct OutboundQueue {
    paused_until: Option<Instant>,
    queue: VecDeque<String>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause outbound traffic until `until`. An active pause is only ever extended.
    pub fn pause(&mut self, until: Instant) {
        self.paused_until = Some(match self.paused_until {
            Some(current) => current.max(until),
            None => until,
        });
    }

    pub fn paused_until(&self) -> Option<Instant> {
        self.paused_until
    }

    pub fn is_paused(&self) -> bool {
        self.paused_until.is_some()
    }

    /// Returns the frame if it may be sent now, otherwise queues it.
    pub fn submit(&mut self, frame: String) -> Option<String> {
        if self.is_paused() {
            self.queue.push_back(frame);
            None
        } else {
            Some(frame)
        }
    }

    /// End the pause, yielding the queued frames in submission order.
    pub fn resume(&mut self) -> Vec<String> {
        self.paused_until = None;
        self.queue.drain(..).collect()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Drop the pause & queued frames, used when the connection is lost.
    pub fn clear(&mut self) {
        self.paused_until = None;
        self.queue.clear();
    }
}
