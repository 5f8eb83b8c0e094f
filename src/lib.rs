//! Voicedesk - spoken lead qualification over the Gemini Live API
//!
//! Streams microphone audio to a live model session, plays back the
//! synthesized replies without gaps, and turns the assistant's
//! `reviewBookingDetails` function call into a draft the user confirms,
//! edits or cancels.

#![forbid(unsafe_code)]

/// PCM16 codec and audio buffers
pub mod codec;
/// Device seams and the PulseAudio backend
pub mod audio;
/// Microphone to outbound chunk pipeline
pub mod capture;
/// Gapless playback scheduling
pub mod playback;
/// Function-call handling for the booking draft
pub mod tool_call;
/// Live API wire types
pub mod protocol;
/// WebSocket remote channel
pub mod transport;
/// Dispatch loop vocabulary
pub mod events;
/// Session lifecycle manager
pub mod session;
/// Static configuration
pub mod config;

#[cfg(test)]
mod fakes;
