//! Audio device seams and the PulseAudio backend
//!
//! The session talks to audio hardware only through [`AudioBackend`],
//! [`Microphone`] and [`AudioContext`]. The PulseAudio implementation keeps
//! every blocking `pa_simple` call on a dedicated OS thread so neither the
//! capture cadence nor the session loop ever waits on the device.

use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::def::{BufferAttr, Retval};
use libpulse_binding::error::PAErr;
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::proplist::{properties, Proplist};
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::codec::AudioBuffer;

/// Identifier of a scheduled playback segment, unique within a context.
pub type SegmentId = u64;

/// Progress reported by a playback context.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackSignal {
    /// A segment finished playing on its own.
    Ended(SegmentId),
    /// The device stopped accepting audio. Nothing further will play.
    Failed(String),
}

pub type PlaybackSink = Arc<dyn Fn(PlaybackSignal) + Send + Sync>;

/// Receives each captured window of mono samples in `[-1, 1]`.
pub type WindowSink = Box<dyn FnMut(&[f32]) + Send>;

/// Custom error for audio operations
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("No audio devices found")]
    NoDevicesFound,

    #[error("PulseAudio error: {0}")]
    Pulse(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Audio context is closed")]
    Closed,

    #[error("Microphone already started")]
    AlreadyStarted,
}

/// A live microphone stream.
pub trait Microphone: Send {
    /// Begin delivering windows of `window` samples to `sink`.
    fn start(&mut self, window: usize, sink: WindowSink) -> Result<(), AudioError>;

    /// Stop every track of the stream. Repeated calls are no-ops.
    fn stop(&mut self);
}

/// A device context with its own clock, able to play scheduled segments.
pub trait AudioContext: Send {
    fn sample_rate(&self) -> u32;

    /// Device time in seconds since the context was opened.
    fn current_time(&self) -> f64;

    /// Play `buffer` starting at device time `at`.
    fn start_segment(&mut self, id: SegmentId, buffer: AudioBuffer, at: f64) -> Result<(), AudioError>;

    /// Stop a segment whether or not it has started. Unknown ids are ignored.
    fn stop_segment(&mut self, id: SegmentId);

    /// Release the device. Repeated calls are no-ops.
    fn close(&mut self);
}

/// Factory for audio resources.
pub trait AudioBackend: Send + Sync {
    fn open_microphone(&self, sample_rate: u32) -> Result<Box<dyn Microphone>, AudioError>;

    /// Open a context whose progress is reported through `signals`.
    fn open_context(&self, sample_rate: u32, signals: PlaybackSink) -> Result<Box<dyn AudioContext>, AudioError>;
}

/// Represents an audio source known to PulseAudio
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Device name (PulseAudio source name)
    pub name: String,
    /// Human-readable description
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// Is this device a monitor (system playback) or a microphone
    pub is_monitor: bool,
}

/// Audio device type for easy filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Microphone,
    Monitor,
    Any,
}

fn mono_spec(rate: u32) -> Spec {
    Spec {
        format: Format::S16le,
        channels: 1,
        rate,
    }
}

/// PulseAudio implementation of [`AudioBackend`].
#[derive(Debug, Clone)]
pub struct PulseBackend {
    app_name: String,
    source: Option<String>,
}

impl PulseBackend {
    pub fn new(app_name: &str, source: Option<String>) -> Self {
        Self {
            app_name: app_name.to_string(),
            source,
        }
    }

    /// Pick the source to record from: the configured one, else the first
    /// non-monitor source, else the server default.
    fn resolve_source(&self) -> Option<String> {
        if let Some(source) = &self.source {
            return Some(source.clone());
        }
        match list_devices(DeviceType::Microphone) {
            Ok(devices) => devices.into_iter().next().map(|d| {
                info!("Using microphone: {} ({})", d.description, d.name);
                d.name
            }),
            Err(e) => {
                warn!("Could not enumerate sources, using default: {}", e);
                None
            }
        }
    }
}

impl AudioBackend for PulseBackend {
    fn open_microphone(&self, sample_rate: u32) -> Result<Box<dyn Microphone>, AudioError> {
        let source = self.resolve_source();
        let mic = PulseMicrophone::open(&self.app_name, source.clone(), sample_rate).or_else(|e| {
            if source.is_none() {
                return Err(e);
            }
            warn!("Failed to open {:?}: {}, falling back to default source", source, e);
            PulseMicrophone::open(&self.app_name, None, sample_rate)
        })?;
        Ok(Box::new(mic))
    }

    fn open_context(&self, sample_rate: u32, signals: PlaybackSink) -> Result<Box<dyn AudioContext>, AudioError> {
        Ok(Box::new(PulseContext::open(&self.app_name, sample_rate, signals)?))
    }
}

/// Microphone backed by a PulseAudio record stream owned by a capture thread.
pub struct PulseMicrophone {
    device_name: Option<String>,
    start_tx: Option<std_mpsc::Sender<(usize, WindowSink)>>,
    shutdown: Arc<AtomicBool>,
    _handle: JoinHandle<()>,
}

impl PulseMicrophone {
    /// Connect the record stream and wait until the device accepted it.
    pub fn open(app_name: &str, device_name: Option<String>, sample_rate: u32) -> Result<Self, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), AudioError>>();
        let (start_tx, start_rx) = std_mpsc::channel::<(usize, WindowSink)>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let app_name = app_name.to_string();
        let device = device_name.clone();
        let shutdown_clone = shutdown.clone();
        let handle = std::thread::spawn(move || {
            let spec = mono_spec(sample_rate);
            let simple = match Simple::new(
                None,
                &app_name,
                Direction::Record,
                device.as_deref(),
                "microphone",
                &spec,
                None,
                None,
            ) {
                Ok(simple) => simple,
                Err(e) => {
                    let _ = ready_tx.send(Err(AudioError::DeviceUnavailable(pulse_message(e))));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            // Released without ever starting.
            let Ok((window, sink)) = start_rx.recv() else {
                return;
            };
            run_capture(simple, window, sink, shutdown_clone);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("Microphone stream connected ({:?})", device_name);
                Ok(Self {
                    device_name,
                    start_tx: Some(start_tx),
                    shutdown,
                    _handle: handle,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AudioError::Pulse("capture thread exited during setup".to_string())),
        }
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }
}

fn run_capture(simple: Simple, window: usize, mut sink: WindowSink, shutdown: Arc<AtomicBool>) {
    let mut bytes = vec![0u8; window * 2];
    let mut samples = vec![0f32; window];
    while !shutdown.load(Ordering::Relaxed) {
        if let Err(e) = simple.read(&mut bytes) {
            error!("Microphone read failed: {}", e);
            break;
        }
        // Stop may have landed while the read was blocked.
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        for (sample, pair) in samples.iter_mut().zip(bytes.chunks_exact(2)) {
            *sample = i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0;
        }
        sink(&samples);
    }
    debug!("Capture thread exiting");
}

impl Microphone for PulseMicrophone {
    fn start(&mut self, window: usize, sink: WindowSink) -> Result<(), AudioError> {
        let start_tx = self.start_tx.take().ok_or(AudioError::AlreadyStarted)?;
        start_tx
            .send((window, sink))
            .map_err(|_| AudioError::DeviceUnavailable("capture thread is gone".to_string()))
    }

    fn stop(&mut self) {
        if !self.shutdown.swap(true, Ordering::Relaxed) {
            info!("Microphone stopped");
        }
        self.start_tx = None;
    }
}

impl Drop for PulseMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

/// How far ahead of its start time a segment is handed to the device.
const WRITE_LEAD: Duration = Duration::from_millis(150);

/// Poll interval of the playback worker.
const WORKER_TICK: Duration = Duration::from_millis(10);

/// Audio the server keeps queued ahead of the read pointer.
const TARGET_LATENCY_MS: u32 = 200;

/// Audio that must be buffered before the server starts (or resumes) playing.
const PREBUF_MS: u32 = 10;

/// Largest single write, so a stop lands mid-segment.
const WRITE_CHUNK_MS: u32 = 20;

/// Bytes of mono S16 audio lasting `ms` milliseconds.
fn pcm_bytes(sample_rate: u32, ms: u32) -> u32 {
    sample_rate * 2 * ms / 1000
}

/// Buffer attributes for a low latency mono S16 playback stream.
///
/// The server defaults hold roughly two seconds before playback begins,
/// which would leave short replies stuck in the buffer and put the device
/// well behind the context clock.
pub fn playback_buffer_attr(sample_rate: u32) -> BufferAttr {
    BufferAttr {
        maxlength: u32::MAX,
        tlength: pcm_bytes(sample_rate, TARGET_LATENCY_MS),
        prebuf: pcm_bytes(sample_rate, PREBUF_MS),
        minreq: u32::MAX,
        fragsize: u32::MAX,
    }
}

/// Segments stopped by the context and not yet handled by the worker.
#[derive(Clone, Default)]
struct Cancellations(Arc<Mutex<HashSet<SegmentId>>>);

impl Cancellations {
    fn cancel(&self, id: SegmentId) {
        if let Ok(mut set) = self.0.lock() {
            set.insert(id);
        }
    }

    fn contains(&self, id: SegmentId) -> bool {
        self.0.lock().map(|set| set.contains(&id)).unwrap_or(false)
    }

    /// Each id is stopped at most once, so it can go once handled.
    fn forget(&self, id: SegmentId) {
        if let Ok(mut set) = self.0.lock() {
            set.remove(&id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.lock().map(|set| set.len()).unwrap_or(0)
    }
}

enum PlaybackCommand {
    Play { id: SegmentId, pcm: Vec<u8>, at: f64, duration: f64 },
    Stop(SegmentId),
}

/// Device context backed by a PulseAudio playback stream.
///
/// The stream is connected when the context opens, so a missing output
/// device fails the open rather than the first scheduled segment.
pub struct PulseContext {
    sample_rate: u32,
    epoch: Instant,
    commands: Option<std_mpsc::Sender<PlaybackCommand>>,
    cancelled: Cancellations,
    shutdown: Arc<AtomicBool>,
    _handle: JoinHandle<()>,
}

impl PulseContext {
    /// Connect the playback stream and wait until the device accepted it.
    pub fn open(app_name: &str, sample_rate: u32, signals: PlaybackSink) -> Result<Self, AudioError> {
        let (tx, rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), AudioError>>();
        let epoch = Instant::now();
        let cancelled = Cancellations::default();
        let shutdown = Arc::new(AtomicBool::new(false));

        let app_name = app_name.to_string();
        let worker_cancelled = cancelled.clone();
        let worker_shutdown = shutdown.clone();
        let handle = std::thread::spawn(move || {
            let spec = mono_spec(sample_rate);
            let attr = playback_buffer_attr(sample_rate);
            let simple = match Simple::new(
                None,
                &app_name,
                Direction::Playback,
                None,
                "assistant",
                &spec,
                None,
                Some(&attr),
            ) {
                Ok(simple) => simple,
                Err(e) => {
                    let _ = ready_tx.send(Err(AudioError::DeviceUnavailable(pulse_message(e))));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            PlaybackWorker {
                simple,
                commands: rx,
                sample_rate,
                epoch,
                signals,
                cancelled: worker_cancelled,
                shutdown: worker_shutdown,
            }
            .run();
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("Playback stream connected at {} Hz", sample_rate);
                Ok(Self {
                    sample_rate,
                    epoch,
                    commands: Some(tx),
                    cancelled,
                    shutdown,
                    _handle: handle,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AudioError::Pulse("playback thread exited during setup".to_string())),
        }
    }
}

/// Owns the playback stream on its own thread.
struct PlaybackWorker {
    simple: Simple,
    commands: std_mpsc::Receiver<PlaybackCommand>,
    sample_rate: u32,
    epoch: Instant,
    signals: PlaybackSink,
    cancelled: Cancellations,
    shutdown: Arc<AtomicBool>,
}

impl PlaybackWorker {
    fn run(self) {
        // Written to the device, not yet heard: (id, end time).
        let mut in_flight: VecDeque<(SegmentId, f64)> = VecDeque::new();

        let failure = loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break None;
            }
            self.report_ended(&mut in_flight);

            match self.commands.recv_timeout(WORKER_TICK) {
                Ok(PlaybackCommand::Play { id, pcm, at, duration }) => {
                    let due = self.epoch + Duration::from_secs_f64(at.max(0.0));
                    while Instant::now() + WRITE_LEAD < due && !self.is_cancelled(id) {
                        std::thread::sleep(WORKER_TICK);
                    }
                    if self.is_cancelled(id) {
                        self.cancelled.forget(id);
                        continue;
                    }
                    in_flight.push_back((id, at + duration));
                    if let Err(e) = self.write(id, pcm, &mut in_flight) {
                        break Some(e);
                    }
                }
                Ok(PlaybackCommand::Stop(id)) => {
                    in_flight.retain(|(queued, _)| *queued != id);
                    self.cancelled.forget(id);
                    // Drops everything buffered on the device, not just `id`.
                    if let Err(e) = self.simple.flush() {
                        warn!("Playback flush failed: {}", e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break None,
            }
        };

        if let Some(reason) = failure {
            error!("Playback stream failed: {}", reason);
            (self.signals)(PlaybackSignal::Failed(reason));
        }
        debug!("Playback thread exiting");
    }

    /// Write one segment in small pieces, checking for a stop between them.
    fn write(&self, id: SegmentId, mut pcm: Vec<u8>, in_flight: &mut VecDeque<(SegmentId, f64)>) -> Result<(), String> {
        // A segment shorter than the prebuffer would never start on its own.
        let prebuf = pcm_bytes(self.sample_rate, PREBUF_MS) as usize;
        if pcm.len() < prebuf {
            pcm.resize(prebuf, 0);
        }
        let piece = pcm_bytes(self.sample_rate, WRITE_CHUNK_MS).max(2) as usize;
        for chunk in pcm.chunks(piece) {
            if self.is_cancelled(id) {
                break;
            }
            self.simple.write(chunk).map_err(|e| format!("write failed: {}", e))?;
            self.report_ended(in_flight);
        }
        Ok(())
    }

    fn report_ended(&self, in_flight: &mut VecDeque<(SegmentId, f64)>) {
        let now = self.epoch.elapsed().as_secs_f64();
        while in_flight.front().is_some_and(|(_, end)| *end <= now) {
            if let Some((id, _)) = in_flight.pop_front() {
                (self.signals)(PlaybackSignal::Ended(id));
            }
        }
    }

    fn is_cancelled(&self, id: SegmentId) -> bool {
        self.shutdown.load(Ordering::Relaxed) || self.cancelled.contains(id)
    }
}

impl AudioContext for PulseContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn start_segment(&mut self, id: SegmentId, buffer: AudioBuffer, at: f64) -> Result<(), AudioError> {
        let commands = self.commands.as_ref().ok_or(AudioError::Closed)?;
        let duration = buffer.duration();
        let pcm = buffer.to_pcm16_bytes();
        commands
            .send(PlaybackCommand::Play { id, pcm, at, duration })
            .map_err(|_| AudioError::DeviceUnavailable("playback thread is gone".to_string()))
    }

    fn stop_segment(&mut self, id: SegmentId) {
        let Some(commands) = &self.commands else {
            return;
        };
        self.cancelled.cancel(id);
        let _ = commands.send(PlaybackCommand::Stop(id));
    }

    fn close(&mut self) {
        if self.commands.is_none() {
            return;
        }
        self.shutdown.store(true, Ordering::Relaxed);
        // Dropping the sender ends the worker, which releases the stream.
        self.commands = None;
        info!("Audio context ({} Hz) closed", self.sample_rate);
    }
}

impl Drop for PulseContext {
    fn drop(&mut self) {
        self.close();
    }
}

/// Human readable text of a PulseAudio error code.
fn pulse_message(e: PAErr) -> String {
    format!("{}", e)
}

/// List available PulseAudio sources
pub fn list_devices(device_type: DeviceType) -> Result<Vec<AudioDevice>, AudioError> {
    let devices = Arc::new(Mutex::new(Vec::new()));
    let devices_clone = devices.clone();

    let mut proplist =
        Proplist::new().ok_or_else(|| AudioError::Pulse("Failed to create proplist".to_string()))?;
    proplist
        .set_str(properties::APPLICATION_NAME, "voicedesk-device-lister")
        .map_err(|_| AudioError::Pulse("Failed to set proplist".to_string()))?;

    let mut mainloop = Mainloop::new().ok_or_else(|| AudioError::Pulse("Failed to create mainloop".to_string()))?;

    let mut context = Context::new_with_proplist(&mainloop, "voicedesk-context", &proplist)
        .ok_or_else(|| AudioError::Pulse("Failed to create context".to_string()))?;

    context
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(|e| AudioError::Pulse(pulse_message(e)))?;

    // Wait for context to be ready
    loop {
        match mainloop.iterate(false) {
            IterateResult::Quit(_) | IterateResult::Err(_) => {
                return Err(AudioError::Pulse("Mainloop iterate failed".to_string()));
            }
            IterateResult::Success(_) => {}
        }
        match context.get_state() {
            ContextState::Ready => break,
            ContextState::Failed | ContextState::Terminated => {
                return Err(AudioError::DeviceUnavailable("PulseAudio connection failed".to_string()));
            }
            _ => {}
        }
    }

    let done = Arc::new(AtomicBool::new(false));
    let done_clone = done.clone();

    let introspector = context.introspect();
    let _op = introspector.get_source_info_list(move |result| match result {
        ListResult::Item(info) => {
            let name = info.name.as_ref().map(|s| s.to_string());
            let is_monitor = info.monitor_of_sink.is_some()
                || name.as_deref().map(|n| n.contains("monitor")).unwrap_or(false);

            let include = match device_type {
                DeviceType::Microphone => !is_monitor,
                DeviceType::Monitor => is_monitor,
                DeviceType::Any => true,
            };

            if let (true, Some(name)) = (include, name) {
                if let Ok(mut devices) = devices_clone.lock() {
                    devices.push(AudioDevice {
                        name,
                        description: info.description.as_ref().map(|s| s.to_string()).unwrap_or_default(),
                        sample_rate: info.sample_spec.rate,
                        channels: info.sample_spec.channels,
                        is_monitor,
                    });
                }
            }
        }
        ListResult::End => done_clone.store(true, Ordering::SeqCst),
        ListResult::Error => {
            error!("Error listing audio devices");
            done_clone.store(true, Ordering::SeqCst);
        }
    });

    while !done.load(Ordering::SeqCst) {
        match mainloop.iterate(false) {
            IterateResult::Quit(_) | IterateResult::Err(_) => {
                return Err(AudioError::Pulse("Mainloop iterate failed".to_string()));
            }
            IterateResult::Success(_) => {}
        }
    }

    context.disconnect();
    mainloop.quit(Retval(0));

    let found = devices
        .lock()
        .map(|d| d.clone())
        .map_err(|_| AudioError::Pulse("Failed to access devices list".to_string()))?;
    if found.is_empty() && device_type == DeviceType::Any {
        return Err(AudioError::NoDevicesFound);
    }
    Ok(found)
}
