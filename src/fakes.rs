//! In-memory audio backend and connector for tests
//!
//! Every acquisition and release is recorded in a shared [`Probe`] so
//! lifecycle tests can assert exactly what was opened and closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::audio::{AudioBackend, AudioContext, AudioError, Microphone, PlaybackSignal, PlaybackSink, SegmentId, WindowSink};
use crate::codec::AudioBuffer;
use crate::events::RemoteEvent;
use crate::protocol::{ClientMessage, SetupMessage};
use crate::transport::{Connector, Outbound, RemoteChannel, RemoteEventSink, TransportError};
use futures_util::future::BoxFuture;

/// Ordered log of resource operations.
#[derive(Debug, Clone, Default)]
pub struct Probe(Arc<Mutex<Vec<String>>>);

impl Probe {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Manually advanced device clock, in seconds.
#[derive(Debug, Clone, Default)]
pub struct FakeClock(Arc<Mutex<f64>>);

impl FakeClock {
    pub fn set(&self, seconds: f64) {
        *self.0.lock().unwrap() = seconds;
    }

    pub fn now(&self) -> f64 {
        *self.0.lock().unwrap()
    }
}

pub type SinkSlot = Arc<Mutex<Option<WindowSink>>>;

pub struct FakeMicrophone {
    probe: Probe,
    sink: SinkSlot,
}

impl FakeMicrophone {
    /// A microphone not owned by any backend.
    pub fn detached() -> Self {
        Self {
            probe: Probe::default(),
            sink: SinkSlot::default(),
        }
    }

    /// Deliver one captured window.
    pub fn push(&self, samples: &[f32]) {
        push_window(&self.sink, samples);
    }
}

fn push_window(slot: &SinkSlot, samples: &[f32]) {
    if let Some(sink) = slot.lock().unwrap().as_mut() {
        sink(samples);
    }
}

impl Microphone for FakeMicrophone {
    fn start(&mut self, _window: usize, sink: WindowSink) -> Result<(), AudioError> {
        let mut slot = self.sink.lock().unwrap();
        if slot.is_some() {
            return Err(AudioError::AlreadyStarted);
        }
        *slot = Some(sink);
        self.probe.record("mic.start");
        Ok(())
    }

    fn stop(&mut self) {
        self.sink.lock().unwrap().take();
        self.probe.record("mic.stop");
    }
}

pub struct FakeContext {
    rate: u32,
    clock: FakeClock,
    probe: Probe,
    closed: bool,
    refuse: Arc<AtomicBool>,
}

impl FakeContext {
    pub fn new(rate: u32, clock: FakeClock, probe: Probe) -> Self {
        Self {
            rate,
            clock,
            probe,
            closed: false,
            refuse: Arc::default(),
        }
    }

    /// Reject new segments while `refuse` is set, like a device that went away.
    pub fn refusing_when(mut self, refuse: Arc<AtomicBool>) -> Self {
        self.refuse = refuse;
        self
    }
}

impl AudioContext for FakeContext {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn current_time(&self) -> f64 {
        self.clock.now()
    }

    fn start_segment(&mut self, id: SegmentId, _buffer: AudioBuffer, _at: f64) -> Result<(), AudioError> {
        if self.closed {
            return Err(AudioError::Closed);
        }
        if self.refuse.load(Ordering::SeqCst) {
            self.probe.record(format!("ctx{}.refused:{}", self.rate, id));
            return Err(AudioError::DeviceUnavailable("output unplugged".to_string()));
        }
        self.probe.record(format!("ctx{}.start:{}", self.rate, id));
        Ok(())
    }

    fn stop_segment(&mut self, id: SegmentId) {
        self.probe.record(format!("ctx{}.stop:{}", self.rate, id));
    }

    fn close(&mut self) {
        self.closed = true;
        self.probe.record(format!("ctx{}.close", self.rate));
    }
}

#[derive(Default)]
pub struct FakeBackend {
    pub probe: Probe,
    pub clock: FakeClock,
    pub fail_microphone: bool,
    pub fail_context_rate: Option<u32>,
    pub mic_sink: SinkSlot,
    pub refuse_segments: Arc<AtomicBool>,
    pub signals: Mutex<Vec<PlaybackSink>>,
}

impl FakeBackend {
    /// Deliver a window to the most recently opened microphone.
    pub fn push_window(&self, samples: &[f32]) {
        push_window(&self.mic_sink, samples);
    }

    /// Report natural completion of a segment on the last opened context.
    pub fn finish_segment(&self, id: SegmentId) {
        self.signal(PlaybackSignal::Ended(id));
    }

    /// Report that the last opened context's device died.
    pub fn fail_playback(&self, reason: &str) {
        self.signal(PlaybackSignal::Failed(reason.to_string()));
    }

    fn signal(&self, signal: PlaybackSignal) {
        let sink = self.signals.lock().unwrap().last().cloned();
        if let Some(sink) = sink {
            sink(signal);
        }
    }
}

impl AudioBackend for FakeBackend {
    fn open_microphone(&self, _sample_rate: u32) -> Result<Box<dyn Microphone>, AudioError> {
        if self.fail_microphone {
            self.probe.record("mic.denied");
            return Err(AudioError::DeviceUnavailable("permission denied".to_string()));
        }
        self.probe.record("mic.open");
        Ok(Box::new(FakeMicrophone {
            probe: self.probe.clone(),
            sink: self.mic_sink.clone(),
        }))
    }

    fn open_context(&self, sample_rate: u32, signals: PlaybackSink) -> Result<Box<dyn AudioContext>, AudioError> {
        if self.fail_context_rate == Some(sample_rate) {
            self.probe.record(format!("ctx{}.denied", sample_rate));
            return Err(AudioError::DeviceUnavailable(format!("no {} Hz output", sample_rate)));
        }
        self.probe.record(format!("ctx{}.open", sample_rate));
        self.signals.lock().unwrap().push(signals);
        Ok(Box::new(
            FakeContext::new(sample_rate, self.clock.clone(), self.probe.clone())
                .refusing_when(self.refuse_segments.clone()),
        ))
    }
}

#[derive(Default)]
pub struct FakeConnector {
    pub probe: Probe,
    pub fail: bool,
    /// Report `Open` from inside `connect`, ahead of the acquisition result.
    pub open_on_connect: bool,
    pub events: Mutex<Option<RemoteEventSink>>,
    pub outbound_rx: Mutex<Option<UnboundedReceiver<ClientMessage>>>,
    pub setups: Mutex<Vec<SetupMessage>>,
}

impl FakeConnector {
    /// Raise an event on the last opened channel.
    pub fn emit(&self, event: RemoteEvent) {
        let sink = self.events.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }

    /// Drain everything the session has sent so far.
    pub fn sent(&self) -> Vec<ClientMessage> {
        let mut sent = Vec::new();
        if let Some(rx) = self.outbound_rx.lock().unwrap().as_mut() {
            while let Ok(msg) = rx.try_recv() {
                sent.push(msg);
            }
        }
        sent
    }

    /// Simulate the socket writer going away.
    pub fn break_outbound(&self) {
        self.outbound_rx.lock().unwrap().take();
    }

    pub fn setups(&self) -> Vec<SetupMessage> {
        self.setups.lock().unwrap().clone()
    }
}

impl Connector for FakeConnector {
    fn connect(
        &self,
        setup: SetupMessage,
        events: RemoteEventSink,
    ) -> BoxFuture<'static, Result<Box<dyn RemoteChannel>, TransportError>> {
        let result = if self.fail {
            self.probe.record("channel.refused");
            Err(TransportError::ConnectionClosed)
        } else {
            self.probe.record("channel.open");
            self.setups.lock().unwrap().push(setup);
            let (tx, rx) = mpsc::unbounded_channel();
            *self.outbound_rx.lock().unwrap() = Some(rx);
            *self.events.lock().unwrap() = Some(events.clone());
            if self.open_on_connect {
                events(RemoteEvent::Open);
            }
            Ok(Box::new(FakeChannel {
                probe: self.probe.clone(),
                tx,
            }) as Box<dyn RemoteChannel>)
        };
        Box::pin(futures_util::future::ready(result))
    }
}

struct FakeChannel {
    probe: Probe,
    tx: UnboundedSender<ClientMessage>,
}

impl RemoteChannel for FakeChannel {
    fn outbound(&self) -> Outbound {
        Outbound::new(self.tx.clone())
    }

    fn close(&mut self) {
        self.probe.record("channel.close");
    }
}
