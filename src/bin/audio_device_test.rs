use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use voicedesk::audio::{
    list_devices, AudioBackend, AudioContext, DeviceType, Microphone, PlaybackSignal, PulseBackend, PulseMicrophone,
};
use voicedesk::codec::AudioBuffer;
use voicedesk::config::{CAPTURE_SAMPLE_RATE, CAPTURE_WINDOW, PLAYBACK_SAMPLE_RATE};

const APP_NAME: &str = "voicedesk-test";

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("Available audio sources:");
    match list_devices(DeviceType::Any) {
        Ok(devices) => {
            if devices.is_empty() {
                println!("No audio devices found!");
            } else {
                for (i, device) in devices.iter().enumerate() {
                    println!(
                        "{}: {} ({})",
                        i + 1,
                        device.description,
                        if device.is_monitor { "Monitor" } else { "Microphone" }
                    );
                    println!("   Name: {}", device.name);
                    println!("   Rate: {} Hz, Channels: {}", device.sample_rate, device.channels);
                    println!();
                }
            }
        }
        Err(e) => {
            println!("Error listing devices: {}", e);
        }
    }

    // Same selection the session uses: configured, first microphone, default
    println!("\nTesting microphone selection with fallback...");
    let backend = PulseBackend::new(APP_NAME, std::env::var("VOICEDESK_PULSE_SOURCE").ok());
    match backend.open_microphone(CAPTURE_SAMPLE_RATE) {
        Ok(mut mic) => {
            let windows = Arc::new(AtomicUsize::new(0));
            let counter = windows.clone();
            mic.start(CAPTURE_WINDOW, Box::new(move |_: &[f32]| {
                counter.fetch_add(1, Ordering::Relaxed);
            }))?;
            std::thread::sleep(Duration::from_secs(1));
            mic.stop();
            println!("  Captured {} windows in 1s", windows.load(Ordering::Relaxed));
        }
        Err(e) => {
            println!("Failed to open any microphone: {}", e);
        }
    }

    println!("\nTesting direct microphone connections...");
    if let Ok(devices) = list_devices(DeviceType::Microphone) {
        for device in devices {
            println!("Trying to connect to: {}", device.description);
            match PulseMicrophone::open(APP_NAME, Some(device.name.clone()), CAPTURE_SAMPLE_RATE) {
                Ok(mic) => {
                    println!("  Success ({:?})", mic.device_name());
                    std::thread::sleep(Duration::from_millis(500));
                }
                Err(e) => {
                    println!("  Failed: {}", e);
                }
            }
        }
    }

    println!("\nTesting playback with a 440 Hz tone...");
    let mut ctx = backend.open_context(PLAYBACK_SAMPLE_RATE, Arc::new(|signal: PlaybackSignal| println!("  {:?}", signal)))?;
    let tone: Vec<f32> = (0..PLAYBACK_SAMPLE_RATE / 2)
        .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / PLAYBACK_SAMPLE_RATE as f32).sin() * 0.2)
        .collect();
    let start = ctx.current_time();
    ctx.start_segment(0, AudioBuffer::mono(tone.clone(), PLAYBACK_SAMPLE_RATE), start)?;
    ctx.start_segment(1, AudioBuffer::mono(tone, PLAYBACK_SAMPLE_RATE), start + 0.5)?;
    std::thread::sleep(Duration::from_millis(1500));
    ctx.close();

    println!("\nAudio device test complete!");
    Ok(())
}
