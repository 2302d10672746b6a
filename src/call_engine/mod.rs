//! Call Engine Module - Anrufsteuerung und Audio
//!
//! Dieses Modul verwaltet:
//! - Audio Capture (Mikrofon) und Playback (Lautsprecher)
//! - die Audio-Duplex-Engine über dem verbundenen Transport
//! - die Verbindungs-Zustandsmaschine
//! - Anruf-Sessions, Status-Events und die Anrufliste

mod audio;
mod connection;
mod duplex;
mod session;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(feature = "audio-device")]
pub use audio::CpalAudioDevices;
#[cfg(not(feature = "audio-device"))]
pub use audio::NoAudioDevices;
pub use audio::{
    AudioDevices, AudioError, AudioFormat, CaptureSource, PlaybackSink, CHANNELS, FRAME_BYTES,
    SAMPLE_RATE,
};
pub use connection::{CallError, ConnectionState, ConnectionStateMachine, PendingConnect};
pub use duplex::{AudioDuplexEngine, LinkExit};
pub use session::{CallEvent, CallRole, CallSession, CallSessionController, Clock, SystemClock};
