//! PCM Loopback Library
//!
//! Real-time capture-to-playback loopback with clock drift compensation.

pub mod audio;
pub mod config;
pub mod device;
pub mod engine;
pub mod resample;
