//! Capture pipeline: microphone windows to outbound audio chunks
//!
//! Runs on the microphone's own thread. Each window is encoded and queued
//! on the remote channel without waiting for the network write.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::audio::{AudioError, Microphone, WindowSink};
use crate::codec::pcm_encode;
use crate::protocol::ClientMessage;
use crate::transport::{Outbound, TransportError};

/// Called once when the transport refuses a chunk.
pub type FailureSink = Box<dyn Fn(TransportError) + Send>;

/// Handle to a running capture pipeline.
#[derive(Debug)]
pub struct CapturePipeline {
    running: Arc<AtomicBool>,
    dispatched: Arc<AtomicU64>,
}

impl CapturePipeline {
    /// Wire `microphone` to `outbound`, one chunk per `window` samples.
    pub fn start(
        microphone: &mut dyn Microphone,
        window: usize,
        sample_rate: u32,
        outbound: Outbound,
        on_failure: FailureSink,
    ) -> Result<Self, AudioError> {
        let running = Arc::new(AtomicBool::new(true));
        let dispatched = Arc::new(AtomicU64::new(0));
        let sink = window_sink(sample_rate, outbound, running.clone(), dispatched.clone(), on_failure);
        microphone.start(window, sink)?;
        debug!("Capture pipeline started ({} samples per window)", window);
        Ok(Self { running, dispatched })
    }

    /// Stop forwarding windows. Repeated calls are no-ops.
    pub fn stop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!(
                "Capture pipeline stopped after {} chunks",
                self.dispatched.load(Ordering::Relaxed)
            );
        }
    }

    /// Number of chunks handed to the transport so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }
}

fn window_sink(
    sample_rate: u32,
    outbound: Outbound,
    running: Arc<AtomicBool>,
    dispatched: Arc<AtomicU64>,
    on_failure: FailureSink,
) -> WindowSink {
    Box::new(move |samples: &[f32]| {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        let data = match pcm_encode(samples) {
            Ok(data) => data,
            Err(e) => {
                warn!("Dropping capture window: {}", e);
                return;
            }
        };
        match outbound.send(ClientMessage::audio(data, sample_rate)) {
            Ok(()) => {
                dispatched.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Report once; later windows are dropped silently.
                if running.swap(false, Ordering::SeqCst) {
                    error!("Failed to dispatch capture chunk: {}", e);
                    on_failure(e);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeMicrophone;
    use crate::protocol::Blob;
    use crate::protocol::RealtimeInput;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[test]
    fn test_windows_dispatched_in_capture_order() {
        let mut mic = FakeMicrophone::detached();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pipeline = CapturePipeline::start(&mut mic, 4, 16_000, Outbound::new(tx), Box::new(|_| {})).unwrap();

        mic.push(&[0.0, 0.25, 0.5, -0.5]);
        mic.push(&[0.0; 4]);
        assert_eq!(pipeline.dispatched(), 2);

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        match (first, second) {
            (
                ClientMessage::RealtimeInput(RealtimeInput { audio: Blob { data: a, mime_type } }),
                ClientMessage::RealtimeInput(RealtimeInput { audio: Blob { data: b, .. } }),
            ) => {
                assert_eq!(mime_type, "audio/pcm;rate=16000");
                assert_eq!(a, pcm_encode(&[0.0, 0.25, 0.5, -0.5]).unwrap());
                assert_eq!(b, pcm_encode(&[0.0; 4]).unwrap());
            }
            other => panic!("Unexpected messages: {:?}", other),
        }
    }

    #[test]
    fn test_transport_failure_reported_once() {
        let mut mic = FakeMicrophone::detached();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let failures = Arc::new(Mutex::new(0));
        let failures_clone = failures.clone();
        let pipeline = CapturePipeline::start(
            &mut mic,
            2,
            16_000,
            Outbound::new(tx),
            Box::new(move |_| *failures_clone.lock().unwrap() += 1),
        )
        .unwrap();

        mic.push(&[0.1, 0.2]);
        mic.push(&[0.1, 0.2]);
        assert_eq!(*failures.lock().unwrap(), 1);
        assert_eq!(pipeline.dispatched(), 0);
    }

    #[test]
    fn test_stopped_pipeline_drops_windows() {
        let mut mic = FakeMicrophone::detached();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pipeline = CapturePipeline::start(&mut mic, 2, 16_000, Outbound::new(tx), Box::new(|_| {})).unwrap();
        pipeline.stop();
        pipeline.stop();
        mic.push(&[0.1, 0.2]);
        assert!(rx.try_recv().is_err());
    }
}
