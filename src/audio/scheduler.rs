//! Gap-free scheduling of inbound speech buffers.
//!
//! Each buffer starts at `max(next_playback_time, output clock)`, so buffers
//! play back-to-back in arrival order, never overlap, and never start in the
//! past. Scheduled buffers are tracked in an arena keyed by [`BufferHandle`]
//! until the output reports them finished.

use crate::audio::codec::DecodedBuffer;
use crate::audio::playback::{AudioOutput, PlaybackCompletion};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Opaque identifier of a scheduled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferHandle(u64);

impl BufferHandle {
    pub fn raw(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buf-{}", self.0)
    }
}

/// Placement of one buffer on the output timeline: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledBuffer {
    pub handle: BufferHandle,
    pub start: Duration,
    pub end: Duration,
}

pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    completions: mpsc::UnboundedSender<BufferHandle>,
    next_playback_time: Duration,
    next_handle: u64,
    active: BTreeMap<BufferHandle, ScheduledBuffer>,
}

impl PlaybackScheduler {
    /// Create a scheduler writing to `output`.
    ///
    /// Finished buffers are reported on `completions`.
    pub fn new(
        output: Arc<dyn AudioOutput>,
        completions: mpsc::UnboundedSender<BufferHandle>,
    ) -> Self {
        Self {
            output,
            completions,
            next_playback_time: Duration::ZERO,
            next_handle: 0,
            active: BTreeMap::new(),
        }
    }

    /// Schedule `buffer` after everything already queued.
    pub fn enqueue(&mut self, buffer: DecodedBuffer) -> ScheduledBuffer {
        let now = self.output.clock();
        let start = self.next_playback_time.max(now);
        let end = start + buffer.duration();

        self.next_handle += 1;
        let handle = BufferHandle(self.next_handle);
        let slot = ScheduledBuffer { handle, start, end };

        self.next_playback_time = end;
        self.active.insert(handle, slot);
        self.output.play_at(
            start,
            buffer,
            PlaybackCompletion::new(handle, self.completions.clone()),
        );
        slot
    }

    /// Remove a finished buffer from the active set.
    ///
    /// Returns `None` for unknown or already-completed handles.
    pub fn complete(&mut self, handle: BufferHandle) -> Option<ScheduledBuffer> {
        self.active.remove(&handle)
    }

    /// Whether no scheduled buffer is still playing.
    pub fn is_drained(&self) -> bool {
        self.active.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// End of the last scheduled buffer.
    pub fn next_playback_time(&self) -> Duration {
        self.next_playback_time
    }

    /// Snapshot of buffers still playing, in scheduling order.
    pub fn active(&self) -> Vec<ScheduledBuffer> {
        self.active.values().copied().collect()
    }
}
