//! Session lifecycle manager
//!
//! Owns the zero-or-one live voice session. All state transitions happen on
//! the task running [`SessionManager::run`], which consumes two queues: user
//! intents from the presentation layer and [`SessionEvent`]s posted by the
//! acquisition task, the remote channel, the microphone thread and the
//! playback worker.
//!
//! ```text
//! Idle --toggle--> Connecting --acquired + open--> Active --stop/close/error--> Closing --> Idle
//!                      |                                                                   ^
//!                      +------------- start failure / toggle / close / error --------------+
//! ```
//!
//! Each session gets a fresh epoch. Events tagged with any other epoch are
//! stale and dropped; stale acquisitions are released on arrival.

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::audio::{AudioBackend, AudioContext, AudioError, Microphone, PlaybackSink};
use crate::capture::CapturePipeline;
use crate::config::SessionConfig;
use crate::events::{Epoch, EpochSender, RemoteEvent, SessionEvent, UiIntent, UiUpdate};
use crate::playback::{PlaybackError, PlaybackScheduler};
use crate::protocol::{ClientMessage, Inbound, SetupMessage};
use crate::tool_call::{self, PendingToolCall};
use crate::transport::{Connector, Outbound, RemoteChannel, RemoteEventSink, TransportError};

/// Shown after the user confirms a draft.
pub const SUBMITTED_NOTICE: &str = "Request Submitted! We will contact you shortly.";

/// Shown after the user asks to edit a draft.
pub const EDIT_NOTICE: &str = "Please tell the assistant what you would like to change.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Connecting,
    Active,
    Closing,
}

impl LifecycleState {
    /// Caption of the single start/stop control.
    pub fn control_label(&self) -> &'static str {
        match self {
            LifecycleState::Idle | LifecycleState::Closing => "AI Voice Support",
            LifecycleState::Connecting => "Connecting...",
            LifecycleState::Active => "Stop Voice Chat",
        }
    }
}

/// Failure to acquire one of the session's resources.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("Microphone unavailable: {0}")]
    Microphone(#[source] AudioError),

    #[error("Capture audio context unavailable: {0}")]
    CaptureContext(#[source] AudioError),

    #[error("Playback audio context unavailable: {0}")]
    PlaybackContext(#[source] AudioError),

    #[error("Remote channel failed to open: {0}")]
    Channel(#[source] TransportError),

    #[error("Acquisition task failed: {0}")]
    Task(String),
}

/// A failure that ends an active session.
#[derive(Debug, thiserror::Error)]
enum SessionFault {
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Playback failure: {0}")]
    Playback(#[from] AudioError),
}

/// Everything a session holds, as handed over by the acquisition task.
pub struct Resources {
    pub microphone: Box<dyn Microphone>,
    pub capture_context: Box<dyn AudioContext>,
    pub playback_context: Box<dyn AudioContext>,
    pub channel: Box<dyn RemoteChannel>,
}

impl Resources {
    pub fn release(mut self) {
        self.microphone.stop();
        self.channel.close();
        self.capture_context.close();
        self.playback_context.close();
    }
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resources")
            .field("capture_rate", &self.capture_context.sample_rate())
            .field("playback_rate", &self.playback_context.sample_rate())
            .finish_non_exhaustive()
    }
}

struct Connecting {
    epoch: Epoch,
    task: JoinHandle<()>,
    resources: Option<Resources>,
    opened: bool,
}

struct LiveSession {
    epoch: Epoch,
    microphone: Box<dyn Microphone>,
    capture_context: Box<dyn AudioContext>,
    channel: Box<dyn RemoteChannel>,
    outbound: Outbound,
    capture: CapturePipeline,
    scheduler: PlaybackScheduler,
    pending: Option<PendingToolCall>,
}

impl LiveSession {
    fn release(&mut self) {
        self.scheduler.close();
        self.capture.stop();
        self.microphone.stop();
        self.channel.close();
        self.capture_context.close();
    }
}

enum Phase {
    Idle,
    Connecting(Connecting),
    Active(Box<LiveSession>),
}

pub struct SessionManager {
    config: Arc<SessionConfig>,
    audio: Arc<dyn AudioBackend>,
    connector: Arc<dyn Connector>,
    ui: UnboundedSender<UiUpdate>,
    events_tx: UnboundedSender<SessionEvent>,
    events_rx: UnboundedReceiver<SessionEvent>,
    phase: Phase,
    epoch: Epoch,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        audio: Arc<dyn AudioBackend>,
        connector: Arc<dyn Connector>,
        ui: UnboundedSender<UiUpdate>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config: Arc::new(config),
            audio,
            connector,
            ui,
            events_tx,
            events_rx,
            phase: Phase::Idle,
            epoch: 0,
        }
    }

    pub fn state(&self) -> LifecycleState {
        match self.phase {
            Phase::Idle => LifecycleState::Idle,
            Phase::Connecting(_) => LifecycleState::Connecting,
            Phase::Active(_) => LifecycleState::Active,
        }
    }

    pub fn pending_tool_call(&self) -> Option<&PendingToolCall> {
        match &self.phase {
            Phase::Active(live) => live.pending.as_ref(),
            _ => None,
        }
    }

    pub fn playback(&self) -> Option<&PlaybackScheduler> {
        match &self.phase {
            Phase::Active(live) => Some(&live.scheduler),
            _ => None,
        }
    }

    /// Dispatch loop. Returns once the intent stream closes, after tearing
    /// down any live session.
    pub async fn run(mut self, mut intents: UnboundedReceiver<UiIntent>) {
        info!("Session manager started");
        loop {
            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(intent) => self.handle_intent(intent),
                    None => {
                        info!("Intent stream closed");
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
        }
        self.teardown();
    }

    /// Wait for the next queued session event.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }

    pub fn handle_intent(&mut self, intent: UiIntent) {
        debug!("Intent: {:?}", intent);
        match intent {
            UiIntent::Toggle => match self.phase {
                Phase::Idle => self.start(),
                _ => self.teardown(),
            },
            UiIntent::Confirm => {
                if self.take_draft().is_some() {
                    self.publish(UiUpdate::Notice(SUBMITTED_NOTICE.to_string()));
                    self.teardown();
                }
            }
            UiIntent::Edit => {
                if self.take_draft().is_some() {
                    self.publish(UiUpdate::Notice(EDIT_NOTICE.to_string()));
                }
            }
            UiIntent::Cancel => {
                if self.take_draft().is_some() {
                    self.teardown();
                }
            }
        }
    }

    pub fn handle_event(&mut self, event: SessionEvent) {
        if self.live_epoch() != Some(event.epoch()) {
            discard_stale(event);
            return;
        }

        match event {
            SessionEvent::Acquired { resources, .. } => self.on_acquired(*resources),
            SessionEvent::StartFailed { error, .. } => self.fail_start(error.to_string()),
            SessionEvent::Remote { event, .. } => self.on_remote(event),
            SessionEvent::PlaybackEnded { segment, .. } => {
                if let Phase::Active(live) = &mut self.phase {
                    live.scheduler.on_ended(segment);
                }
            }
            SessionEvent::PlaybackFailed { error, .. } => {
                error!("Playback device failed: {}", error);
                self.end_session(format!("Playback device failed: {}", error));
            }
            SessionEvent::CaptureFailed { error, .. } => {
                error!("Streaming failed: {}", error);
                self.teardown();
            }
        }
    }

    /// Release everything the current session holds and return to idle.
    /// A no-op when already idle.
    pub fn teardown(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {
                trace!("Teardown while idle");
                return;
            }
            Phase::Connecting(connecting) => {
                info!("Abandoning session {} while connecting", connecting.epoch);
                connecting.task.abort();
                if let Some(resources) = connecting.resources {
                    resources.release();
                }
            }
            Phase::Active(mut live) => {
                info!("Tearing down session {}", live.epoch);
                self.publish(UiUpdate::State(LifecycleState::Closing));
                if live.pending.take().is_some() {
                    self.publish(UiUpdate::ClearDraft);
                }
                live.release();
            }
        }
        self.publish(UiUpdate::State(LifecycleState::Idle));
        info!("Session idle");
    }

    fn start(&mut self) {
        self.epoch += 1;
        let epoch = self.epoch;
        info!("Starting session {}", epoch);

        let events = EpochSender::new(epoch, self.events_tx.clone());
        let audio = self.audio.clone();
        let connector = self.connector.clone();
        let config = self.config.clone();
        let task = tokio::spawn(async move {
            match acquire(audio, connector, config, &events).await {
                Ok(resources) => events.acquired(resources),
                Err(e) => events.start_failed(e),
            }
        });

        self.phase = Phase::Connecting(Connecting {
            epoch,
            task,
            resources: None,
            opened: false,
        });
        self.publish(UiUpdate::State(LifecycleState::Connecting));
    }

    fn live_epoch(&self) -> Option<Epoch> {
        match &self.phase {
            Phase::Idle => None,
            Phase::Connecting(connecting) => Some(connecting.epoch),
            Phase::Active(live) => Some(live.epoch),
        }
    }

    fn on_acquired(&mut self, resources: Resources) {
        match &mut self.phase {
            Phase::Connecting(connecting) => {
                info!("Session {} resources acquired", connecting.epoch);
                connecting.resources = Some(resources);
            }
            _ => {
                warn!("Unexpected acquisition result, releasing");
                resources.release();
                return;
            }
        }
        self.try_activate();
    }

    fn on_remote(&mut self, event: RemoteEvent) {
        match event {
            RemoteEvent::Open => {
                if let Phase::Connecting(connecting) = &mut self.phase {
                    info!("Remote channel open for session {}", connecting.epoch);
                    connecting.opened = true;
                    self.try_activate();
                } else {
                    debug!("Ignoring repeated open");
                }
            }
            RemoteEvent::Message(inbound) => {
                if let Err(e) = self.on_inbound(inbound) {
                    error!("{}", e);
                    self.teardown();
                }
            }
            RemoteEvent::Closed(reason) => {
                info!(
                    "Remote channel closed: {}",
                    reason.as_deref().unwrap_or("no reason given")
                );
                self.end_session("Remote channel closed".to_string());
            }
            RemoteEvent::Error(e) => {
                error!("Remote channel error: {}", e);
                self.end_session(e);
            }
        }
    }

    /// A resource went away. Before activation this counts as a failed start.
    fn end_session(&mut self, reason: String) {
        if matches!(self.phase, Phase::Connecting(_)) {
            self.publish(UiUpdate::StartFailed(reason));
        }
        self.teardown();
    }

    fn on_inbound(&mut self, inbound: Inbound) -> Result<(), SessionFault> {
        let Phase::Active(live) = &mut self.phase else {
            debug!("Ignoring {:?} outside an active session", inbound);
            return Ok(());
        };

        match inbound {
            Inbound::AudioDelta { data } => match live.scheduler.enqueue(&data) {
                Ok(_) => {}
                Err(PlaybackError::Device(e)) => return Err(e.into()),
                Err(PlaybackError::Empty) => debug!("Skipping empty audio chunk"),
                Err(e) => warn!("Skipping audio chunk: {}", e),
            },
            Inbound::Interrupted => {
                let stopped = live.scheduler.interrupt();
                info!("Playback interrupted, {} segments dropped", stopped);
            }
            Inbound::ToolCall(calls) => {
                let outcome = tool_call::bridge(&calls);
                let draft = outcome.pending.map(|pending| {
                    let draft = pending.draft.clone();
                    live.pending = Some(pending);
                    draft
                });
                let acknowledged = outcome.response.map(|response| {
                    let count = response.function_responses.len();
                    live.outbound.send(ClientMessage::ToolResponse(response)).map(|()| count)
                });
                if let Some(draft) = draft {
                    self.publish(UiUpdate::ShowDraft(draft));
                }
                if let Some(count) = acknowledged.transpose()? {
                    debug!("Acknowledged {} function calls", count);
                }
            }
            Inbound::TurnComplete => debug!("Model turn complete"),
            Inbound::GoAway => warn!("Server is about to end the session"),
            Inbound::SetupComplete | Inbound::Unrecognized => trace!("Ignoring {:?}", inbound),
        }
        Ok(())
    }

    fn try_activate(&mut self) {
        let ready = matches!(&self.phase, Phase::Connecting(c) if c.opened && c.resources.is_some());
        if !ready {
            return;
        }
        let Phase::Connecting(Connecting {
            epoch,
            resources: Some(resources),
            ..
        }) = std::mem::replace(&mut self.phase, Phase::Idle)
        else {
            return;
        };
        let Resources {
            mut microphone,
            capture_context,
            playback_context,
            channel,
        } = resources;

        let outbound = channel.outbound();
        let failures = EpochSender::new(epoch, self.events_tx.clone());
        let capture = match CapturePipeline::start(
            microphone.as_mut(),
            self.config.capture_window,
            self.config.capture_sample_rate,
            outbound.clone(),
            Box::new(move |e| failures.capture_failed(e)),
        ) {
            Ok(capture) => capture,
            Err(e) => {
                Resources {
                    microphone,
                    capture_context,
                    playback_context,
                    channel,
                }
                .release();
                self.fail_start(StartError::Microphone(e).to_string());
                self.publish(UiUpdate::State(LifecycleState::Idle));
                return;
            }
        };

        self.phase = Phase::Active(Box::new(LiveSession {
            epoch,
            microphone,
            capture_context,
            channel,
            outbound,
            capture,
            scheduler: PlaybackScheduler::new(playback_context),
            pending: None,
        }));
        info!("Session {} active", epoch);
        self.publish(UiUpdate::State(LifecycleState::Active));
    }

    fn take_draft(&mut self) -> Option<PendingToolCall> {
        let taken = match &mut self.phase {
            Phase::Active(live) => live.pending.take(),
            _ => None,
        };
        match &taken {
            Some(pending) => {
                debug!("Resolving draft for call {}", pending.id);
                self.publish(UiUpdate::ClearDraft);
            }
            None => debug!("No draft pending"),
        }
        taken
    }

    fn fail_start(&mut self, reason: String) {
        error!("Failed to start session: {}", reason);
        self.publish(UiUpdate::StartFailed(reason));
        self.teardown();
    }

    fn publish(&self, update: UiUpdate) {
        let _ = self.ui.send(update);
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn discard_stale(event: SessionEvent) {
    match event {
        SessionEvent::Acquired { epoch, resources } => {
            info!("Releasing resources of abandoned session {}", epoch);
            (*resources).release();
        }
        other => trace!("Dropping stale event of session {}", other.epoch()),
    }
}

type Devices = (Box<dyn Microphone>, Box<dyn AudioContext>, Box<dyn AudioContext>);

/// Open the microphone and both contexts, in that order. Each open may block
/// on the sound server. On failure everything opened so far is released.
fn open_devices(audio: &dyn AudioBackend, config: &SessionConfig, signals: PlaybackSink) -> Result<Devices, StartError> {
    let mut microphone = audio
        .open_microphone(config.capture_sample_rate)
        .map_err(StartError::Microphone)?;
    debug!("Microphone acquired");

    let silent: PlaybackSink = Arc::new(|_| {});
    let mut capture_context = match audio.open_context(config.capture_sample_rate, silent) {
        Ok(ctx) => ctx,
        Err(e) => {
            microphone.stop();
            return Err(StartError::CaptureContext(e));
        }
    };

    let playback_context = match audio.open_context(config.playback_sample_rate, signals) {
        Ok(ctx) => ctx,
        Err(e) => {
            microphone.stop();
            capture_context.close();
            return Err(StartError::PlaybackContext(e));
        }
    };
    debug!("Audio contexts acquired");
    Ok((microphone, capture_context, playback_context))
}

/// Acquire the audio devices, then the remote channel.
/// On failure everything acquired so far is released before returning.
async fn acquire(
    audio: Arc<dyn AudioBackend>,
    connector: Arc<dyn Connector>,
    config: Arc<SessionConfig>,
    events: &EpochSender,
) -> Result<Resources, StartError> {
    let device_config = config.clone();
    let playback_events = events.clone();
    let signals: PlaybackSink = Arc::new(move |signal| playback_events.playback(signal));
    let (mut microphone, mut capture_context, mut playback_context) =
        tokio::task::spawn_blocking(move || open_devices(audio.as_ref(), &device_config, signals))
            .await
            .map_err(|e| StartError::Task(e.to_string()))??;

    let remote_events = events.clone();
    let sink: RemoteEventSink = Arc::new(move |event| remote_events.remote(event));
    let channel = match connector.connect(SetupMessage::from_config(&config), sink).await {
        Ok(channel) => channel,
        Err(e) => {
            microphone.stop();
            capture_context.close();
            playback_context.close();
            return Err(StartError::Channel(e));
        }
    };

    Ok(Resources {
        microphone,
        capture_context,
        playback_context,
        channel,
    })
}
