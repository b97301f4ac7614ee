//! Latest-frame slot shared between the processing loop and stream clients.
//!
//! The loop replaces the slot once per cycle; readers clone an `Arc` to the
//! current frame and never see a partially written one. There is no history:
//! a slow reader simply skips to whatever is newest when it next looks.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// One encoded, annotated frame.
#[derive(Debug)]
pub struct PublishedFrame {
    /// Monotonic publish counter, starting at 1.
    pub sequence: u64,
    pub published_at: DateTime<Local>,
    pub jpeg: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct FramePublisher {
    latest: Mutex<Option<Arc<PublishedFrame>>>,
    next_sequence: AtomicU64,
}

impl FramePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the latest frame. Returns the assigned sequence number.
    pub fn publish(&self, jpeg: Vec<u8>) -> Result<u64> {
        let mut slot = self
            .latest
            .lock()
            .map_err(|_| anyhow!("frame publisher lock poisoned"))?;
        // Numbered under the lock so the slot only ever moves forward.
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        *slot = Some(Arc::new(PublishedFrame {
            sequence,
            published_at: Local::now(),
            jpeg,
        }));
        Ok(sequence)
    }

    /// Most recent frame, or `None` before the first publish.
    pub fn latest(&self) -> Result<Option<Arc<PublishedFrame>>> {
        let slot = self
            .latest
            .lock()
            .map_err(|_| anyhow!("frame publisher lock poisoned"))?;
        Ok(slot.clone())
    }

    /// Sequence of the most recent publish (0 when nothing is published yet).
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::Relaxed)
    }
}
