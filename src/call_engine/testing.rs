//! Test-Doubles für Audio-Geräte und Uhr

use super::audio::{AudioDevices, AudioError, AudioFormat, CaptureSource, PlaybackSink};
use super::session::Clock;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct FakeState {
    capture: Mutex<VecDeque<Vec<u8>>>,
    played: Mutex<Vec<Vec<u8>>>,
    open_handles: AtomicUsize,
    fail_capture: AtomicBool,
    fail_playback: AtomicBool,
}

/// Skriptbare Audio-Geräte: liefert vorgegebene Frames, merkt sich Abgespieltes
#[derive(Clone, Default)]
pub(crate) struct FakeAudioDevices {
    state: Arc<FakeState>,
}

impl FakeAudioDevices {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_capture(&self, frame: Vec<u8>) {
        self.state.capture.lock().push_back(frame);
    }

    pub(crate) fn played(&self) -> Vec<Vec<u8>> {
        self.state.played.lock().clone()
    }

    pub(crate) fn open_handles(&self) -> usize {
        self.state.open_handles.load(Ordering::Acquire)
    }

    pub(crate) fn fail_capture(&self) {
        self.state.fail_capture.store(true, Ordering::Release);
    }

    pub(crate) fn fail_playback(&self) {
        self.state.fail_playback.store(true, Ordering::Release);
    }
}

struct Handle {
    state: Arc<FakeState>,
}

impl Handle {
    fn open(state: &Arc<FakeState>) -> Self {
        state.open_handles.fetch_add(1, Ordering::AcqRel);
        Self {
            state: Arc::clone(state),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.state.open_handles.fetch_sub(1, Ordering::AcqRel);
    }
}

impl CaptureSource for Handle {
    fn capture(&mut self, frame: &mut [u8]) -> Result<usize, AudioError> {
        match self.state.capture.lock().pop_front() {
            Some(scripted) => {
                let n = scripted.len().min(frame.len());
                frame[..n].copy_from_slice(&scripted[..n]);
                Ok(n)
            }
            None => {
                std::thread::sleep(Duration::from_millis(2));
                Ok(0)
            }
        }
    }
}

impl PlaybackSink for Handle {
    fn play(&mut self, frame: &[u8]) -> Result<(), AudioError> {
        self.state.played.lock().push(frame.to_vec());
        Ok(())
    }
}

impl AudioDevices for FakeAudioDevices {
    fn open_capture(&self, _: &AudioFormat) -> Result<Box<dyn CaptureSource>, AudioError> {
        if self.state.fail_capture.load(Ordering::Acquire) {
            return Err(AudioError::CaptureDeviceUnavailable("no microphone".to_string()));
        }
        Ok(Box::new(Handle::open(&self.state)))
    }

    fn open_playback(&self, _: &AudioFormat) -> Result<Box<dyn PlaybackSink>, AudioError> {
        if self.state.fail_playback.load(Ordering::Acquire) {
            return Err(AudioError::PlaybackDeviceUnavailable("no speaker".to_string()));
        }
        Ok(Box::new(Handle::open(&self.state)))
    }
}

/// Von Hand weitergestellte Uhr
///
/// `advance()` bewegt Wand- und monotone Zeit gemeinsam, `step_wall_clock()`
/// nur die Wanduhr (NTP-Korrektur, Zeitumstellung).
#[derive(Clone)]
pub(crate) struct ManualClock {
    wall: Arc<Mutex<DateTime<Utc>>>,
    base: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            wall: Arc::new(Mutex::new(Utc::now())),
            base: Instant::now(),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub(crate) fn advance(&self, seconds: u64) {
        *self.wall.lock() += ChronoDuration::seconds(seconds as i64);
        *self.elapsed.lock() += Duration::from_secs(seconds);
    }

    pub(crate) fn step_wall_clock(&self, seconds: i64) {
        *self.wall.lock() += ChronoDuration::seconds(seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.wall.lock()
    }

    fn instant(&self) -> Instant {
        self.base + *self.elapsed.lock()
    }
}
