//! Audio Duplex Engine
//!
//! Pumpt während eines Anrufs Audio in beide Richtungen:
//! - Uplink: Mikrofon-Frame lesen, komplett auf den Transport schreiben
//! - Downlink: genau einen Frame vom Transport sammeln, abspielen
//!
//! Beide Richtungen laufen in eigenen Threads. `stop()` setzt ein Stop-Flag;
//! alle blockierenden Aufrufe (Transport-Read mit Timeout, Capture mit
//! begrenzter Wartezeit) sind kurz genug, dass beide Threads zeitnah enden.
//! Endet eine Richtung ohne `stop()`, wird der Grund über `exit_tx` gemeldet.

use super::audio::{AudioDevices, AudioError, AudioFormat, CaptureSource, PlaybackSink};
use crate::transport::{StreamTransport, TransportError};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Warum eine Richtung von selbst beendet wurde
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkExit {
    /// Gegenstelle hat die Verbindung geschlossen
    PeerClosed,
    TransportFailed(String),
    CaptureFailed(String),
    PlaybackFailed(String),
}

impl std::fmt::Display for LinkExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkExit::PeerClosed => write!(f, "peer closed the connection"),
            LinkExit::TransportFailed(e) => write!(f, "transport failed: {}", e),
            LinkExit::CaptureFailed(e) => write!(f, "capture failed: {}", e),
            LinkExit::PlaybackFailed(e) => write!(f, "playback failed: {}", e),
        }
    }
}

pub struct AudioDuplexEngine {
    stop: Arc<AtomicBool>,
    uplink: Option<JoinHandle<()>>,
    downlink: Option<JoinHandle<()>>,
}

impl AudioDuplexEngine {
    /// Öffnet Capture und Playback und startet beide Richtungen
    ///
    /// Schlägt das Öffnen eines Geräts fehl, läuft kein Thread und alle
    /// bereits geöffneten Geräte sind wieder freigegeben.
    pub fn start(
        transport: Arc<dyn StreamTransport>,
        devices: &dyn AudioDevices,
        format: AudioFormat,
        exit_tx: Sender<LinkExit>,
    ) -> Result<Self, AudioError> {
        let capture = devices.open_capture(&format)?;
        let playback = devices.open_playback(&format)?;

        let stop = Arc::new(AtomicBool::new(false));

        let uplink = {
            let transport = Arc::clone(&transport);
            let stop = Arc::clone(&stop);
            let exit_tx = exit_tx.clone();
            thread::Builder::new()
                .name("bluecall-uplink".to_string())
                .spawn(move || {
                    if let Err(exit) = run_uplink(capture, transport.as_ref(), &format, &stop) {
                        report(&stop, &exit_tx, exit);
                    }
                })
                .map_err(|e| AudioError::StreamFailed(e.to_string()))?
        };

        let downlink = {
            let stop_flag = Arc::clone(&stop);
            let spawned = thread::Builder::new()
                .name("bluecall-downlink".to_string())
                .spawn(move || {
                    if let Err(exit) = run_downlink(playback, transport.as_ref(), &format, &stop_flag) {
                        report(&stop_flag, &exit_tx, exit);
                    }
                });
            match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    stop.store(true, Ordering::Release);
                    let _ = uplink.join();
                    return Err(AudioError::StreamFailed(e.to_string()));
                }
            }
        };

        tracing::info!(
            "Audio duplex started ({} Hz, {} byte frames)",
            format.sample_rate,
            format.frame_bytes
        );

        Ok(Self {
            stop,
            uplink: Some(uplink),
            downlink: Some(downlink),
        })
    }

    /// Läuft mindestens eine Richtung noch?
    pub fn is_running(&self) -> bool {
        [&self.uplink, &self.downlink]
            .iter()
            .any(|h| h.as_ref().is_some_and(|h| !h.is_finished()))
    }

    /// Stoppt beide Richtungen und wartet auf deren Ende (idempotent)
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);

        for handle in [self.uplink.take(), self.downlink.take()].into_iter().flatten() {
            if handle.join().is_err() {
                tracing::error!("Audio worker thread panicked");
            }
        }
    }
}

impl Drop for AudioDuplexEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Meldet das Ende einer Richtung, außer es wurde bewusst gestoppt
fn report(stop: &AtomicBool, exit_tx: &Sender<LinkExit>, exit: LinkExit) {
    if stop.load(Ordering::Acquire) {
        return;
    }
    tracing::warn!("Audio link ended: {}", exit);
    let _ = exit_tx.send(exit);
}

fn run_uplink(
    mut capture: Box<dyn CaptureSource>,
    transport: &dyn StreamTransport,
    format: &AudioFormat,
    stop: &AtomicBool,
) -> Result<(), LinkExit> {
    let mut frame = vec![0u8; format.frame_bytes];

    while !stop.load(Ordering::Acquire) {
        let n = capture
            .capture(&mut frame)
            .map_err(|e| LinkExit::CaptureFailed(e.to_string()))?;
        if n == 0 {
            continue;
        }

        let mut remaining = &frame[..n];
        while !remaining.is_empty() {
            if stop.load(Ordering::Acquire) {
                return Ok(());
            }
            match transport.write(remaining) {
                Ok(0) => return Err(LinkExit::PeerClosed),
                Ok(written) => remaining = &remaining[written..],
                Err(TransportError::TimedOut) => continue,
                Err(TransportError::Closed) => return Err(LinkExit::PeerClosed),
                Err(e) => return Err(LinkExit::TransportFailed(e.to_string())),
            }
        }
    }

    Ok(())
}

fn run_downlink(
    mut playback: Box<dyn PlaybackSink>,
    transport: &dyn StreamTransport,
    format: &AudioFormat,
    stop: &AtomicBool,
) -> Result<(), LinkExit> {
    let mut frame = vec![0u8; format.frame_bytes];
    let mut filled = 0;

    while !stop.load(Ordering::Acquire) {
        match transport.read(&mut frame[filled..]) {
            Ok(0) => return Err(LinkExit::PeerClosed),
            Ok(n) => filled += n,
            Err(TransportError::TimedOut) => continue,
            Err(TransportError::Closed) => return Err(LinkExit::PeerClosed),
            Err(e) => return Err(LinkExit::TransportFailed(e.to_string())),
        }

        // Nur vollständige Frames abspielen
        if filled == frame.len() {
            playback
                .play(&frame)
                .map_err(|e| LinkExit::PlaybackFailed(e.to_string()))?;
            filled = 0;
        }
    }

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
