//! Gapless playback scheduling on an audio context clock

use std::collections::BTreeMap;
use tracing::debug;

use crate::audio::{AudioContext, AudioError, SegmentId};
use crate::codec::{pcm_decode, AudioBuffer, CodecError};

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("Undecodable audio chunk: {0}")]
    Decode(#[from] CodecError),

    #[error("Empty audio chunk")]
    Empty,

    #[error(transparent)]
    Device(#[from] AudioError),
}

/// A scheduled, not yet finished segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackHandle {
    pub id: SegmentId,
    /// Start time on the context clock, in seconds.
    pub start: f64,
    pub duration: f64,
}

/// Queues decoded speech back to back so consecutive chunks play without
/// gaps or overlap, and drops everything at once on interruption.
pub struct PlaybackScheduler {
    ctx: Box<dyn AudioContext>,
    next_start: f64,
    next_id: SegmentId,
    pending: BTreeMap<SegmentId, PlaybackHandle>,
}

impl PlaybackScheduler {
    pub fn new(ctx: Box<dyn AudioContext>) -> Self {
        Self {
            ctx,
            next_start: 0.0,
            next_id: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Decode a base64 mono chunk at the context rate and schedule it.
    pub fn enqueue(&mut self, data: &str) -> Result<PlaybackHandle, PlaybackError> {
        let buffer = pcm_decode(data, self.ctx.sample_rate(), 1)?;
        self.schedule(buffer)
    }

    /// Zero-frame buffers and buffers the context refuses leave the cursor
    /// and pending set untouched.
    pub fn schedule(&mut self, buffer: AudioBuffer) -> Result<PlaybackHandle, PlaybackError> {
        if buffer.frames() == 0 {
            return Err(PlaybackError::Empty);
        }
        let start = self.next_start.max(self.ctx.current_time());
        let duration = buffer.duration();
        let id = self.next_id;

        self.ctx.start_segment(id, buffer, start)?;
        self.next_id += 1;
        self.next_start = start + duration;

        let handle = PlaybackHandle { id, start, duration };
        self.pending.insert(id, handle);
        debug!("Scheduled segment {} at {:.3}s for {:.3}s", id, start, duration);
        Ok(handle)
    }

    /// Forget a segment that finished naturally. Unknown ids are ignored.
    pub fn on_ended(&mut self, id: SegmentId) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Stop every pending segment and rewind the cursor.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.pending.len();
        for id in std::mem::take(&mut self.pending).into_keys() {
            self.ctx.stop_segment(id);
        }
        self.next_start = 0.0;
        if stopped > 0 {
            debug!("Interrupted {} pending segments", stopped);
        }
        stopped
    }

    /// Interrupt and release the context.
    pub fn close(&mut self) {
        self.interrupt();
        self.ctx.close();
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    pub fn pending(&self) -> impl Iterator<Item = &PlaybackHandle> {
        self.pending.values()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl std::fmt::Debug for PlaybackScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackScheduler")
            .field("next_start", &self.next_start)
            .field("pending", &self.pending.len())
            .finish()
    }
}
