//! Connection State Machine
//!
//! Einziger Besitzer von Adapter, Listener, Transport und Audio-Engine.
//! Zustände: Idle → Listening | Connecting → Connected → Closing → Idle.
//!
//! Wer blockierende Schritte ausführt (Accept, ausgehender Connect), macht das
//! außerhalb der Maschine und meldet das Ergebnis zurück; die Maschine selbst
//! blockiert nur beim Stoppen der Audio-Engine.

use super::audio::{AudioDevices, AudioError, AudioFormat};
use super::duplex::{AudioDuplexEngine, LinkExit};
use crate::transport::{
    Discovery, PeerIdentity, Radio, ServiceListener, StreamTransport, TransportError,
    SERVICE_NAME, SERVICE_UUID,
};
use crossbeam_channel::Sender;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active call")]
    NotConnected,

    #[error("Not listening for calls")]
    NotListening,

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Capture device unavailable: {0}")]
    CaptureDeviceUnavailable(String),

    #[error("Playback device unavailable: {0}")]
    PlaybackDeviceUnavailable(String),

    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Bluetooth is disabled")]
    AdapterDisabled,

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Audio error: {0}")]
    Audio(AudioError),
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::AdapterDisabled => CallError::AdapterDisabled,
            TransportError::Discovery(reason) => CallError::DiscoveryFailed(reason),
            other => CallError::Transport(other),
        }
    }
}

impl From<AudioError> for CallError {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::CaptureDeviceUnavailable(reason) => CallError::CaptureDeviceUnavailable(reason),
            AudioError::PlaybackDeviceUnavailable(reason) => {
                CallError::PlaybackDeviceUnavailable(reason)
            }
            other => CallError::Audio(other),
        }
    }
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Keine Verbindung, kein Listener
    Idle,
    /// Wartet auf genau eine eingehende Verbindung
    Listening,
    /// Ausgehende Verbindung wird aufgebaut
    Connecting,
    /// Anruf aktiv, Audio läuft
    Connected,
    /// Audio wird gestoppt, Transport geschlossen
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Listening => "listening",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

// ============================================================================
// PENDING CONNECT
// ============================================================================

/// Ausgehender Verbindungsaufbau, der ohne Maschinen-Lock läuft
pub struct PendingConnect {
    radio: Arc<dyn Radio>,
    peer: PeerIdentity,
}

impl PendingConnect {
    /// Öffnet den Stream zum Anruf-Dienst des Peers (blockierend)
    pub fn establish(&self) -> Result<Box<dyn StreamTransport>, TransportError> {
        self.radio.connect(&self.peer, SERVICE_UUID)
    }
}

// ============================================================================
// STATE MACHINE
// ============================================================================

pub struct ConnectionStateMachine {
    radio: Arc<dyn Radio>,
    audio: Arc<dyn AudioDevices>,
    format: AudioFormat,
    state: ConnectionState,
    listener: Option<Arc<dyn ServiceListener>>,
    transport: Option<Arc<dyn StreamTransport>>,
    engine: Option<AudioDuplexEngine>,
}

impl ConnectionStateMachine {
    pub fn new(radio: Arc<dyn Radio>, audio: Arc<dyn AudioDevices>, format: AudioFormat) -> Self {
        Self {
            radio,
            audio,
            format,
            state: ConnectionState::Idle,
            listener: None,
            transport: None,
            engine: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_name(&self) -> String {
        self.radio.local_name()
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::info!("Connection state: {} -> {}", self.state, state);
            self.state = state;
        }
    }

    fn require_idle(&self) -> Result<(), CallError> {
        if self.state != ConnectionState::Idle {
            return Err(CallError::AlreadyInCall);
        }
        Ok(())
    }

    fn require_enabled(&self) -> Result<(), CallError> {
        if !self.radio.is_enabled() {
            return Err(CallError::AdapterDisabled);
        }
        Ok(())
    }

    fn stop_discovery(&self) {
        if self.radio.is_discovering() {
            tracing::debug!("Cancelling discovery before connecting");
            self.radio.cancel_discovery();
        }
    }

    // ------------------------------------------------------------------------
    // Device directory
    // ------------------------------------------------------------------------

    /// Startet eine Geräte-Suche (nur im Idle-Zustand)
    pub fn scan(&self, timeout: Duration) -> Result<Discovery, CallError> {
        self.require_idle()?;
        Ok(Discovery::start(Arc::clone(&self.radio), timeout)?)
    }

    pub fn paired_devices(&self) -> Result<Vec<PeerIdentity>, CallError> {
        Ok(self.radio.paired_devices()?)
    }

    // ------------------------------------------------------------------------
    // Listening
    // ------------------------------------------------------------------------

    /// Idle → Listening; der Aufrufer wartet auf dem Listener auf `accept()`
    pub fn start_listening(&mut self) -> Result<Arc<dyn ServiceListener>, CallError> {
        self.require_idle()?;
        self.require_enabled()?;
        self.stop_discovery();

        let listener: Arc<dyn ServiceListener> =
            Arc::from(self.radio.listen(SERVICE_UUID, SERVICE_NAME)?);
        self.listener = Some(Arc::clone(&listener));
        self.set_state(ConnectionState::Listening);

        Ok(listener)
    }

    /// Listening → Idle; löst ein wartendes `accept()`
    pub fn cancel_listening(&mut self) -> Result<(), CallError> {
        if self.state != ConnectionState::Listening {
            return Err(CallError::NotListening);
        }
        self.close_listener();
        self.set_state(ConnectionState::Idle);
        Ok(())
    }

    /// Accept ist fehlgeschlagen: Listening → Idle
    pub fn listener_failed(&mut self) {
        if self.state == ConnectionState::Listening {
            self.close_listener();
            self.set_state(ConnectionState::Idle);
        }
    }

    /// Listening → Connected mit der angenommenen Verbindung
    ///
    /// Der Listener wird sofort geschlossen; pro `start_listening()` wird
    /// genau eine Verbindung angenommen.
    pub fn accepted(
        &mut self,
        transport: Box<dyn StreamTransport>,
        exit_tx: Sender<LinkExit>,
    ) -> Result<(), CallError> {
        if self.state != ConnectionState::Listening {
            transport.close();
            return Err(CallError::NotListening);
        }
        self.close_listener();
        self.enter_connected(transport, exit_tx)
    }

    fn close_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.close();
        }
    }

    // ------------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------------

    /// Idle → Connecting; der eigentliche Verbindungsaufbau läuft über
    /// `PendingConnect::establish()` außerhalb der Maschine
    pub fn begin_connecting(&mut self, peer: &PeerIdentity) -> Result<PendingConnect, CallError> {
        self.require_idle()?;
        self.require_enabled()?;
        self.stop_discovery();

        tracing::info!("Connecting to {}", peer);
        self.set_state(ConnectionState::Connecting);

        Ok(PendingConnect {
            radio: Arc::clone(&self.radio),
            peer: peer.clone(),
        })
    }

    /// Connecting → Connected oder, bei Fehler, Connecting → Idle
    pub fn finish_connecting(
        &mut self,
        result: Result<Box<dyn StreamTransport>, TransportError>,
        exit_tx: Sender<LinkExit>,
    ) -> Result<(), CallError> {
        if self.state != ConnectionState::Connecting {
            if let Ok(transport) = result {
                transport.close();
            }
            return Err(CallError::NotConnected);
        }

        match result {
            Ok(transport) => self.enter_connected(transport, exit_tx),
            Err(e) => {
                tracing::warn!("Connect failed: {}", e);
                self.set_state(ConnectionState::Idle);
                Err(match e {
                    TransportError::AdapterDisabled => CallError::AdapterDisabled,
                    other => CallError::PeerUnreachable(other.to_string()),
                })
            }
        }
    }

    /// Startet genau eine Audio-Engine über dem frischen Transport
    fn enter_connected(
        &mut self,
        transport: Box<dyn StreamTransport>,
        exit_tx: Sender<LinkExit>,
    ) -> Result<(), CallError> {
        let transport: Arc<dyn StreamTransport> = Arc::from(transport);

        match AudioDuplexEngine::start(
            Arc::clone(&transport),
            self.audio.as_ref(),
            self.format,
            exit_tx,
        ) {
            Ok(engine) => {
                self.engine = Some(engine);
                self.transport = Some(transport);
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to start audio: {}", e);
                transport.close();
                self.set_state(ConnectionState::Idle);
                Err(e.into())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Hang up
    // ------------------------------------------------------------------------

    /// Connected → Closing → Idle: erst Audio stoppen, dann Transport schließen
    pub fn hang_up(&mut self) -> Result<(), CallError> {
        if self.state != ConnectionState::Connected {
            return Err(CallError::NotConnected);
        }
        self.set_state(ConnectionState::Closing);

        if let Some(mut engine) = self.engine.take() {
            engine.stop();
        }
        if let Some(transport) = self.transport.take() {
            transport.close();
        }

        self.set_state(ConnectionState::Idle);
        Ok(())
    }
}

impl Drop for ConnectionStateMachine {
    fn drop(&mut self) {
        if self.state == ConnectionState::Connected {
            let _ = self.hang_up();
        }
        self.close_listener();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::testing::FakeAudioDevices;
    use crate::transport::{MemoryAir, MemoryRadio};
    use crossbeam_channel::unbounded;

    fn machine(air: &MemoryAir, name: &str, address: &str) -> (ConnectionStateMachine, Arc<MemoryRadio>, FakeAudioDevices) {
        let radio = Arc::new(air.radio(PeerIdentity::new(name, address)));
        let devices = FakeAudioDevices::new();
        let machine = ConnectionStateMachine::new(
            radio.clone(),
            Arc::new(devices.clone()),
            AudioFormat::default(),
        );
        (machine, radio, devices)
    }

    #[test]
    fn test_listen_and_cancel() {
        let air = MemoryAir::new();
        let (mut m, _, _) = machine(&air, "me", "00:00:00:00:00:01");

        m.start_listening().unwrap();
        assert_eq!(m.state(), ConnectionState::Listening);
        assert!(matches!(m.start_listening(), Err(CallError::AlreadyInCall)));

        m.cancel_listening().unwrap();
        assert_eq!(m.state(), ConnectionState::Idle);
        assert!(matches!(m.cancel_listening(), Err(CallError::NotListening)));
    }

    #[test]
    fn test_cancel_unblocks_accept_wait() {
        let air = MemoryAir::new();
        let (mut m, _, _) = machine(&air, "me", "00:00:00:00:00:01");

        let listener = m.start_listening().unwrap();
        let waiter = std::thread::spawn(move || listener.accept().is_err());
        std::thread::sleep(Duration::from_millis(20));

        m.cancel_listening().unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_listening_cancels_discovery() {
        let air = MemoryAir::new();
        let (mut m, radio, _) = machine(&air, "me", "00:00:00:00:00:01");
        air.radio(PeerIdentity::new("HeadsetX", "AA:BB:CC:DD:EE:FF"));

        let _scan = m.scan(Duration::from_secs(5)).unwrap();
        assert!(radio.is_discovering());

        m.start_listening().unwrap();
        assert!(!radio.is_discovering());
        assert!(matches!(m.scan(Duration::from_secs(1)), Err(CallError::AlreadyInCall)));
    }

    #[test]
    fn test_connect_to_listener_and_hang_up() {
        let air = MemoryAir::new();
        let (mut caller, _, caller_audio) = machine(&air, "caller", "00:00:00:00:00:01");
        let (mut callee, _, callee_audio) = machine(&air, "callee", "00:00:00:00:00:02");

        let listener = callee.start_listening().unwrap();

        let pending = caller
            .begin_connecting(&PeerIdentity::new("callee", "00:00:00:00:00:02"))
            .unwrap();
        assert_eq!(caller.state(), ConnectionState::Connecting);
        let (tx, _rx) = unbounded();
        caller.finish_connecting(pending.establish(), tx).unwrap();
        assert_eq!(caller.state(), ConnectionState::Connected);

        let (transport, peer) = listener.accept().unwrap();
        assert_eq!(peer.name, "caller");
        let (tx, _rx) = unbounded();
        callee.accepted(transport, tx).unwrap();
        assert_eq!(callee.state(), ConnectionState::Connected);
        assert_eq!(callee_audio.open_handles(), 2);

        caller.hang_up().unwrap();
        callee.hang_up().unwrap();
        assert_eq!(caller.state(), ConnectionState::Idle);
        assert_eq!(callee.state(), ConnectionState::Idle);
        assert_eq!(caller_audio.open_handles(), 0);
        assert_eq!(callee_audio.open_handles(), 0);
        assert!(matches!(caller.hang_up(), Err(CallError::NotConnected)));
    }

    #[test]
    fn test_connect_without_service_returns_to_idle() {
        let air = MemoryAir::new();
        let (mut m, _, _) = machine(&air, "me", "00:00:00:00:00:01");

        let pending = m
            .begin_connecting(&PeerIdentity::new("HeadsetX", "AA:BB:CC:DD:EE:FF"))
            .unwrap();
        let (tx, _rx) = unbounded();
        let result = m.finish_connecting(pending.establish(), tx);

        assert!(matches!(result, Err(CallError::PeerUnreachable(_))));
        assert_eq!(m.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_audio_failure_closes_fresh_transport() {
        let air = MemoryAir::new();
        let (mut m, _, devices) = machine(&air, "me", "00:00:00:00:00:01");
        let callee = air.radio(PeerIdentity::new("callee", "00:00:00:00:00:02"));
        let listener = callee.listen(SERVICE_UUID, SERVICE_NAME).unwrap();
        devices.fail_capture();

        let pending = m.begin_connecting(callee.identity()).unwrap();
        let (tx, _rx) = unbounded();
        let result = m.finish_connecting(pending.establish(), tx);

        assert!(matches!(result, Err(CallError::CaptureDeviceUnavailable(_))));
        assert_eq!(m.state(), ConnectionState::Idle);

        let (inbound, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(inbound.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_disabled_adapter() {
        let air = MemoryAir::new();
        let (mut m, radio, _) = machine(&air, "me", "00:00:00:00:00:01");
        radio.set_enabled(false);

        assert!(matches!(m.start_listening(), Err(CallError::AdapterDisabled)));
        assert!(matches!(
            m.begin_connecting(&PeerIdentity::new("x", "AA:BB:CC:DD:EE:FF")),
            Err(CallError::AdapterDisabled)
        ));
        assert_eq!(m.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_transport_error_mapping() {
        assert!(matches!(
            CallError::from(TransportError::AdapterDisabled),
            CallError::AdapterDisabled
        ));
        assert!(matches!(
            CallError::from(TransportError::Discovery("busy".into())),
            CallError::DiscoveryFailed(_)
        ));
        assert!(matches!(
            CallError::from(AudioError::PlaybackDeviceUnavailable("none".into())),
            CallError::PlaybackDeviceUnavailable(_)
        ));
    }
}
