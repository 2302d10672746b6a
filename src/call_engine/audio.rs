//! Audio Handler - Mikrofon Capture und Playback
//!
//! Auf der Leitung liegen rohe PCM-Frames (16-bit signed little-endian, mono,
//! 8 kHz). Beide Seiten müssen dasselbe `AudioFormat` verwenden; es gibt
//! weder Codec noch Aushandlung.
//!
//! Verwendet cpal für Cross-Platform Audio I/O (Feature `audio-device`).
//! Gerätekonfiguration, Kanal-Downmix und Resampling bleiben hier gekapselt.

use std::time::Duration;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate auf der Leitung
pub const SAMPLE_RATE: u32 = 8000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame-Größe in Bytes (512 Samples = 64ms @ 8kHz)
pub const FRAME_BYTES: usize = 1024;

const BYTES_PER_SAMPLE: usize = 2;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Capture device unavailable: {0}")]
    CaptureDeviceUnavailable(String),

    #[error("Playback device unavailable: {0}")]
    PlaybackDeviceUnavailable(String),

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Audio stream failed: {0}")]
    StreamFailed(String),
}

// ============================================================================
// AUDIO FORMAT
// ============================================================================

/// Von Capture und Playback gemeinsam verwendetes Frame-Format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_bytes: usize,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            frame_bytes: FRAME_BYTES,
        }
    }
}

impl AudioFormat {
    /// Samples pro Frame und Kanal
    pub fn samples_per_frame(&self) -> usize {
        self.frame_bytes / BYTES_PER_SAMPLE / usize::from(self.channels.max(1))
    }

    /// Abspieldauer eines Frames
    pub fn frame_duration(&self) -> Duration {
        Duration::from_micros(
            self.samples_per_frame() as u64 * 1_000_000 / u64::from(self.sample_rate.max(1)),
        )
    }
}

// ============================================================================
// DEVICE TRAITS
// ============================================================================

/// Mikrofon-Quelle
pub trait CaptureSource: Send {
    /// Füllt `frame` mit genau einem Frame
    ///
    /// Blockiert höchstens ein paar Frame-Dauern; `Ok(0)` heißt "noch keine
    /// Daten", der Aufrufer prüft dann sein Stop-Signal und versucht es erneut.
    fn capture(&mut self, frame: &mut [u8]) -> Result<usize, AudioError>;
}

/// Lautsprecher-Senke
pub trait PlaybackSink: Send {
    fn play(&mut self, frame: &[u8]) -> Result<(), AudioError>;
}

/// Öffnet Capture- und Playback-Handles; Drop eines Handles gibt das Gerät frei
pub trait AudioDevices: Send + Sync {
    fn open_capture(&self, format: &AudioFormat) -> Result<Box<dyn CaptureSource>, AudioError>;

    fn open_playback(&self, format: &AudioFormat) -> Result<Box<dyn PlaybackSink>, AudioError>;
}

// ============================================================================
// PCM HELPERS
// ============================================================================

/// f32 (-1.0..1.0) nach i16
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

/// i16 nach f32 (-1.0..1.0)
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / f32::from(i16::MAX)
}

/// Sample-and-Hold Ratenwandler, Zustand bleibt über Callbacks erhalten
///
/// `ticks()` liefert pro Takt der Quellrate, wie viele Takte der Zielrate
/// fällig sind. Ganzzahliger Akkumulator, damit über lange Anrufe kein
/// Sample verloren geht.
#[derive(Debug, Clone)]
pub(crate) struct RateStep {
    from_rate: u64,
    to_rate: u64,
    acc: u64,
}

impl RateStep {
    pub(crate) fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate: u64::from(from_rate.max(1)),
            to_rate: u64::from(to_rate),
            acc: 0,
        }
    }

    pub(crate) fn ticks(&mut self) -> usize {
        self.acc += self.to_rate;
        let mut whole = 0;
        while self.acc >= self.from_rate {
            self.acc -= self.from_rate;
            whole += 1;
        }
        whole
    }
}

// ============================================================================
// CPAL DEVICES
// ============================================================================

#[cfg(feature = "audio-device")]
pub use device::CpalAudioDevices;

#[cfg(feature = "audio-device")]
mod device {
    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
    use parking_lot::Mutex;
    use ringbuf::{traits::*, HeapRb};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    /// Ring-Buffer-Größe in Frames
    const RING_BUFFER_FRAMES: usize = 8;

    const CAPTURE_POLL: Duration = Duration::from_millis(5);

    /// Standard-Ein- und Ausgabegerät des Hosts
    #[derive(Debug, Default, Clone, Copy)]
    pub struct CpalAudioDevices;

    impl AudioDevices for CpalAudioDevices {
        fn open_capture(&self, format: &AudioFormat) -> Result<Box<dyn CaptureSource>, AudioError> {
            CpalCapture::open(format)
                .map(|c| Box::new(c) as Box<dyn CaptureSource>)
                .map_err(|e| match e {
                    AudioError::CaptureDeviceUnavailable(_) => e,
                    other => AudioError::CaptureDeviceUnavailable(other.to_string()),
                })
        }

        fn open_playback(&self, format: &AudioFormat) -> Result<Box<dyn PlaybackSink>, AudioError> {
            CpalPlayback::open(format)
                .map(|p| Box::new(p) as Box<dyn PlaybackSink>)
                .map_err(|e| match e {
                    AudioError::PlaybackDeviceUnavailable(_) => e,
                    other => AudioError::PlaybackDeviceUnavailable(other.to_string()),
                })
        }
    }

    // ------------------------------------------------------------------------
    // Capture
    // ------------------------------------------------------------------------

    struct CpalCapture {
        _stream: Stream,
        buffer: Arc<Mutex<HeapRb<i16>>>,
        failed: Arc<AtomicBool>,
        wait: Duration,
    }

    // cpal::Stream ist nicht auf allen Plattformen Send. Der Stream wird hier
    // nur besessen und beim Drop beendet, nie aus zwei Threads benutzt.
    unsafe impl Send for CpalCapture {}

    impl CpalCapture {
        fn open(format: &AudioFormat) -> Result<Self, AudioError> {
            let host = cpal::default_host();
            let device = host.default_input_device().ok_or_else(|| {
                AudioError::CaptureDeviceUnavailable("No audio input device found".to_string())
            })?;

            let configs = device
                .supported_input_configs()
                .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
            let config = select_best_config(configs.collect(), format.sample_rate)?;

            tracing::info!(
                "Starting audio capture: {} Hz, {} channels -> {} Hz mono",
                config.sample_rate.0,
                config.channels,
                format.sample_rate
            );

            let capacity = format.samples_per_frame() * RING_BUFFER_FRAMES;
            let buffer = Arc::new(Mutex::new(HeapRb::<i16>::new(capacity)));
            let failed = Arc::new(AtomicBool::new(false));

            let channels = usize::from(config.channels.max(1));
            let mut step = RateStep::new(config.sample_rate.0, format.sample_rate);
            let capture_buffer = Arc::clone(&buffer);
            let error_flag = Arc::clone(&failed);

            let stream = device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let mut buffer = capture_buffer.lock();
                        for frame in data.chunks(channels) {
                            // Downmix auf Mono
                            let mono = frame.iter().sum::<f32>() / frame.len() as f32;
                            for _ in 0..step.ticks() {
                                let _ = buffer.try_push(f32_to_i16(mono));
                            }
                        }
                    },
                    move |err| {
                        tracing::error!("Audio capture error: {}", err);
                        error_flag.store(true, Ordering::Release);
                    },
                    None,
                )
                .map_err(|e| AudioError::CaptureDeviceUnavailable(e.to_string()))?;

            stream
                .play()
                .map_err(|e| AudioError::CaptureDeviceUnavailable(e.to_string()))?;

            Ok(Self {
                _stream: stream,
                buffer,
                failed,
                wait: format.frame_duration() * 2,
            })
        }
    }

    impl CaptureSource for CpalCapture {
        fn capture(&mut self, frame: &mut [u8]) -> Result<usize, AudioError> {
            let samples = frame.len() / BYTES_PER_SAMPLE;
            let deadline = Instant::now() + self.wait;
            loop {
                if self.failed.load(Ordering::Acquire) {
                    return Err(AudioError::StreamFailed("capture stream error".to_string()));
                }
                {
                    let mut buffer = self.buffer.lock();
                    if buffer.occupied_len() >= samples {
                        for chunk in frame.chunks_exact_mut(BYTES_PER_SAMPLE) {
                            let sample = buffer.try_pop().unwrap_or(0);
                            chunk.copy_from_slice(&sample.to_le_bytes());
                        }
                        return Ok(samples * BYTES_PER_SAMPLE);
                    }
                }
                if Instant::now() >= deadline {
                    return Ok(0);
                }
                std::thread::sleep(CAPTURE_POLL);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Playback
    // ------------------------------------------------------------------------

    struct CpalPlayback {
        _stream: Stream,
        buffer: Arc<Mutex<HeapRb<i16>>>,
        failed: Arc<AtomicBool>,
        dropped: u64,
    }

    // Siehe CpalCapture
    unsafe impl Send for CpalPlayback {}

    impl CpalPlayback {
        fn open(format: &AudioFormat) -> Result<Self, AudioError> {
            let host = cpal::default_host();
            let device = host.default_output_device().ok_or_else(|| {
                AudioError::PlaybackDeviceUnavailable("No audio output device found".to_string())
            })?;

            let configs = device
                .supported_output_configs()
                .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
            let config = select_best_config(configs.collect(), format.sample_rate)?;

            tracing::info!(
                "Starting audio playback: {} Hz mono -> {} Hz, {} channels",
                format.sample_rate,
                config.sample_rate.0,
                config.channels
            );

            let capacity = format.samples_per_frame() * RING_BUFFER_FRAMES;
            let buffer = Arc::new(Mutex::new(HeapRb::<i16>::new(capacity)));
            let failed = Arc::new(AtomicBool::new(false));

            let channels = usize::from(config.channels.max(1));
            let mut step = RateStep::new(config.sample_rate.0, format.sample_rate);
            let mut current = 0.0f32;
            let playback_buffer = Arc::clone(&buffer);
            let error_flag = Arc::clone(&failed);

            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut buffer = playback_buffer.lock();
                        for frame in data.chunks_mut(channels) {
                            for _ in 0..step.ticks() {
                                current = buffer.try_pop().map(i16_to_f32).unwrap_or(0.0);
                            }
                            // Auf alle Kanäle verteilen
                            for sample in frame.iter_mut() {
                                *sample = current;
                            }
                        }
                    },
                    move |err| {
                        tracing::error!("Audio playback error: {}", err);
                        error_flag.store(true, Ordering::Release);
                    },
                    None,
                )
                .map_err(|e| AudioError::PlaybackDeviceUnavailable(e.to_string()))?;

            stream
                .play()
                .map_err(|e| AudioError::PlaybackDeviceUnavailable(e.to_string()))?;

            Ok(Self {
                _stream: stream,
                buffer,
                failed,
                dropped: 0,
            })
        }
    }

    impl PlaybackSink for CpalPlayback {
        fn play(&mut self, frame: &[u8]) -> Result<(), AudioError> {
            if self.failed.load(Ordering::Acquire) {
                return Err(AudioError::StreamFailed("playback stream error".to_string()));
            }
            let mut buffer = self.buffer.lock();
            for chunk in frame.chunks_exact(BYTES_PER_SAMPLE) {
                if buffer.try_push(i16::from_le_bytes([chunk[0], chunk[1]])).is_err() {
                    self.dropped += 1;
                }
            }
            Ok(())
        }
    }

    impl Drop for CpalPlayback {
        fn drop(&mut self) {
            if self.dropped > 0 {
                tracing::debug!("Playback dropped {} samples on overflow", self.dropped);
            }
        }
    }

    /// Wählt die beste Konfiguration aus einer Liste
    ///
    /// Priorität: F32 mit exakter Zielrate, sonst F32 mit der nächstbesten Rate.
    fn select_best_config(
        configs: Vec<SupportedStreamConfigRange>,
        target_rate: u32,
    ) -> Result<StreamConfig, AudioError> {
        let target = cpal::SampleRate(target_rate);

        let f32_configs: Vec<&SupportedStreamConfigRange> = configs
            .iter()
            .filter(|c| c.sample_format() == SampleFormat::F32)
            .collect();

        if let Some(config) = f32_configs
            .iter()
            .find(|c| c.min_sample_rate() <= target && c.max_sample_rate() >= target)
        {
            return Ok((*config).clone().with_sample_rate(target).config());
        }

        // Geräte unter der Zielrate gibt es praktisch nicht; niedrigste Rate nehmen
        if let Some(config) = f32_configs.iter().min_by_key(|c| c.min_sample_rate().0) {
            let rate = config.min_sample_rate();
            return Ok((*config).clone().with_sample_rate(rate).config());
        }

        Err(AudioError::UnsupportedConfig(
            "No F32 audio configuration found".to_string(),
        ))
    }
}

#[cfg(not(feature = "audio-device"))]
pub use headless::NoAudioDevices;

#[cfg(not(feature = "audio-device"))]
mod headless {
    use super::*;

    /// Platzhalter für Builds ohne Audio-Backend
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NoAudioDevices;

    impl AudioDevices for NoAudioDevices {
        fn open_capture(&self, _: &AudioFormat) -> Result<Box<dyn CaptureSource>, AudioError> {
            Err(AudioError::CaptureDeviceUnavailable(
                "built without audio-device support".to_string(),
            ))
        }

        fn open_playback(&self, _: &AudioFormat) -> Result<Box<dyn PlaybackSink>, AudioError> {
            Err(AudioError::PlaybackDeviceUnavailable(
                "built without audio-device support".to_string(),
            ))
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
