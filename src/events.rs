//! Event vocabulary of the session dispatch loop
//!
//! Every producer (capture thread, socket tasks, playback worker, the
//! acquisition task) posts into one queue; the lifecycle manager consumes it
//! on a single task. Events carry the epoch of the session that produced
//! them so late arrivals from a torn-down session can be recognised.

use tokio::sync::mpsc::UnboundedSender;

use crate::audio::{PlaybackSignal, SegmentId};
use crate::protocol::Inbound;
use crate::session::{LifecycleState, Resources, StartError};
use crate::tool_call::BookingDraft;
use crate::transport::TransportError;

/// Monotonic session generation counter.
pub type Epoch = u64;

/// Signals raised by the remote channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// The session handshake completed.
    Open,
    Message(Inbound),
    Closed(Option<String>),
    Error(String),
}

#[derive(Debug)]
pub enum SessionEvent {
    /// All start-up resources were acquired.
    Acquired { epoch: Epoch, resources: Box<Resources> },
    StartFailed { epoch: Epoch, error: StartError },
    Remote { epoch: Epoch, event: RemoteEvent },
    PlaybackEnded { epoch: Epoch, segment: SegmentId },
    /// The playback device stopped accepting audio.
    PlaybackFailed { epoch: Epoch, error: String },
    /// An outbound capture chunk could not be handed to the transport.
    CaptureFailed { epoch: Epoch, error: TransportError },
}

impl SessionEvent {
    pub fn epoch(&self) -> Epoch {
        match self {
            SessionEvent::Acquired { epoch, .. }
            | SessionEvent::StartFailed { epoch, .. }
            | SessionEvent::Remote { epoch, .. }
            | SessionEvent::PlaybackEnded { epoch, .. }
            | SessionEvent::PlaybackFailed { epoch, .. }
            | SessionEvent::CaptureFailed { epoch, .. } => *epoch,
        }
    }
}

/// User intents produced by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiIntent {
    /// The single start/stop control.
    Toggle,
    Confirm,
    Edit,
    Cancel,
}

/// Updates consumed by the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum UiUpdate {
    State(LifecycleState),
    ShowDraft(BookingDraft),
    ClearDraft,
    StartFailed(String),
    Notice(String),
}

/// Session-event sender bound to one epoch.
#[derive(Debug, Clone)]
pub struct EpochSender {
    epoch: Epoch,
    tx: UnboundedSender<SessionEvent>,
}

impl EpochSender {
    pub fn new(epoch: Epoch, tx: UnboundedSender<SessionEvent>) -> Self {
        Self { epoch, tx }
    }

    pub fn remote(&self, event: RemoteEvent) {
        let _ = self.tx.send(SessionEvent::Remote { epoch: self.epoch, event });
    }

    pub fn playback(&self, signal: PlaybackSignal) {
        let event = match signal {
            PlaybackSignal::Ended(segment) => SessionEvent::PlaybackEnded { epoch: self.epoch, segment },
            PlaybackSignal::Failed(error) => SessionEvent::PlaybackFailed { epoch: self.epoch, error },
        };
        let _ = self.tx.send(event);
    }

    pub fn capture_failed(&self, error: TransportError) {
        let _ = self.tx.send(SessionEvent::CaptureFailed { epoch: self.epoch, error });
    }

    pub fn acquired(&self, resources: Resources) {
        let _ = self.tx.send(SessionEvent::Acquired {
            epoch: self.epoch,
            resources: Box::new(resources),
        });
    }

    pub fn start_failed(&self, error: StartError) {
        let _ = self.tx.send(SessionEvent::StartFailed { epoch: self.epoch, error });
    }
}
