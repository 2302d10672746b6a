//! Call Session Controller
//!
//! Öffentliche Schnittstelle für Anrufe:
//! - als Listener auf einen eingehenden Anruf warten
//! - als Initiator einen Peer anrufen
//! - auflegen, Dauer berechnen, Anrufliste schreiben
//! - Status-Events über einen Broadcast-Kanal melden
//!
//! Alle Zustandsübergänge laufen unter einem Mutex. Blockierende Schritte
//! (Accept, Connect) laufen ohne Lock; Accept und die Überwachung eines
//! laufenden Anrufs haben eigene Threads.

use super::audio::{AudioDevices, AudioFormat};
use super::connection::{CallError, ConnectionState, ConnectionStateMachine};
use super::duplex::LinkExit;
use crate::database::CallHistoryStore;
use crate::transport::{Discovery, PeerIdentity, Radio, StreamTransport, TransportError};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// CALL SESSION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallRole {
    Listener,
    Initiator,
}

/// Ein verbundener Anruf
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub id: Uuid,
    pub peer: PeerIdentity,
    pub role: CallRole,
    pub started_at: DateTime<Utc>,
    /// Monotoner Start; die Dauer hängt nicht an der Wanduhr
    #[serde(skip)]
    started: Instant,
}

/// Events die vom Controller ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    Listening,
    Connecting(PeerIdentity),
    Connected(PeerIdentity),
    Failed(String),
    /// Anruf beendet, Dauer in Sekunden
    Ended(u64),
}

impl std::fmt::Display for CallEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallEvent::Listening => write!(f, "Listening for incoming calls..."),
            CallEvent::Connecting(peer) => write!(f, "Connecting to {}...", peer),
            CallEvent::Connected(peer) => write!(f, "Connected to {}", peer),
            CallEvent::Failed(reason) => write!(f, "Call failed: {}", reason),
            CallEvent::Ended(seconds) => write!(f, "Call ended (Duration: {} sec)", seconds),
        }
    }
}

/// Zeitquelle: Wanduhr für Zeitstempel, monotone Uhr für Dauern
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn instant(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

// ============================================================================
// CONTROLLER
// ============================================================================

struct Machine {
    connection: ConnectionStateMachine,
    session: Option<CallSession>,
    /// Zählt `start_as_listener()`-Aufrufe; veraltete Accept-Threads erkennen sich daran
    listen_generation: u64,
}

struct Inner {
    machine: Mutex<Machine>,
    history: Arc<dyn CallHistoryStore>,
    clock: Arc<dyn Clock>,
    event_tx: broadcast::Sender<CallEvent>,
    max_call_duration: Option<Duration>,
}

#[derive(Clone)]
pub struct CallSessionController {
    inner: Arc<Inner>,
}

impl CallSessionController {
    pub fn new(
        radio: Arc<dyn Radio>,
        audio: Arc<dyn AudioDevices>,
        history: Arc<dyn CallHistoryStore>,
        max_call_duration: Option<Duration>,
    ) -> Self {
        Self::with_clock(
            ConnectionStateMachine::new(radio, audio, AudioFormat::default()),
            history,
            Arc::new(SystemClock),
            max_call_duration,
        )
    }

    pub fn with_clock(
        connection: ConnectionStateMachine,
        history: Arc<dyn CallHistoryStore>,
        clock: Arc<dyn Clock>,
        max_call_duration: Option<Duration>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            inner: Arc::new(Inner {
                machine: Mutex::new(Machine {
                    connection,
                    session: None,
                    listen_generation: 0,
                }),
                history,
                clock,
                event_tx,
                max_call_duration,
            }),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.machine.lock().connection.state()
    }

    /// Der laufende Anruf, falls verbunden
    pub fn session(&self) -> Option<CallSession> {
        self.inner.machine.lock().session.clone()
    }

    pub fn history(&self) -> &Arc<dyn CallHistoryStore> {
        &self.inner.history
    }

    pub fn local_name(&self) -> String {
        self.inner.machine.lock().connection.local_name()
    }

    /// Geräte-Suche (nur im Idle-Zustand)
    pub fn scan(&self, timeout: Duration) -> Result<Discovery, CallError> {
        self.inner.machine.lock().connection.scan(timeout)
    }

    pub fn paired_devices(&self) -> Result<Vec<PeerIdentity>, CallError> {
        self.inner.machine.lock().connection.paired_devices()
    }

    /// Wartet auf genau einen eingehenden Anruf
    ///
    /// Kehrt sofort zurück; `Connected(peer)` kommt als Event. Nach dem Anruf
    /// muss erneut `start_as_listener()` aufgerufen werden.
    pub fn start_as_listener(&self) -> Result<(), CallError> {
        let (listener, generation) = {
            let mut machine = self.inner.machine.lock();
            let listener = match machine.connection.start_listening() {
                Ok(listener) => listener,
                Err(CallError::AlreadyInCall) => return Err(CallError::AlreadyInCall),
                Err(e) => {
                    self.inner.emit(CallEvent::Failed(e.to_string()));
                    return Err(e);
                }
            };
            machine.listen_generation += 1;
            self.inner.emit(CallEvent::Listening);
            (listener, machine.listen_generation)
        };

        let inner = Arc::clone(&self.inner);
        let accept_listener = Arc::clone(&listener);
        let spawned = thread::Builder::new()
            .name("bluecall-accept".to_string())
            .spawn(move || match accept_listener.accept() {
                Ok((transport, peer)) => inner.on_accepted(generation, transport, peer),
                Err(e) => inner.on_accept_failed(generation, e),
            });

        if let Err(e) = spawned {
            tracing::error!("Failed to start accept thread: {}", e);
            self.inner.machine.lock().connection.listener_failed();
            self.inner.emit(CallEvent::Failed(e.to_string()));
            return Err(TransportError::Io(e).into());
        }

        Ok(())
    }

    /// Bricht das Warten auf einen Anruf ab
    pub fn cancel_listening(&self) -> Result<(), CallError> {
        self.inner.machine.lock().connection.cancel_listening()?;
        tracing::info!("Stopped listening for calls");
        Ok(())
    }

    /// Ruft `peer` an; blockiert bis verbunden oder fehlgeschlagen
    pub fn start_as_initiator(&self, peer: PeerIdentity) -> Result<(), CallError> {
        let pending = {
            let mut machine = self.inner.machine.lock();
            match machine.connection.begin_connecting(&peer) {
                Ok(pending) => {
                    self.inner.emit(CallEvent::Connecting(peer.clone()));
                    pending
                }
                Err(CallError::AlreadyInCall) => return Err(CallError::AlreadyInCall),
                Err(e) => {
                    self.inner.emit(CallEvent::Failed(e.to_string()));
                    return Err(e);
                }
            }
        };

        // Verbindungsaufbau ohne Lock
        let result = pending.establish();

        let mut machine = self.inner.machine.lock();
        let (exit_tx, exit_rx) = crossbeam_channel::unbounded();
        match machine.connection.finish_connecting(result, exit_tx) {
            Ok(()) => {
                self.inner
                    .begin_session(&mut machine, peer, CallRole::Initiator, exit_rx);
                Ok(())
            }
            Err(e) => {
                self.inner.emit(CallEvent::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Legt auf und gibt die Anrufdauer in Sekunden zurück
    pub fn end_call(&self) -> Result<u64, CallError> {
        let mut machine = self.inner.machine.lock();
        self.inner.finish_call(&mut machine, None)
    }
}

impl Inner {
    fn emit(&self, event: CallEvent) {
        tracing::debug!("Call event: {:?}", event);
        // Kein Empfänger ist kein Fehler
        let _ = self.event_tx.send(event);
    }

    fn on_accepted(self: &Arc<Self>, generation: u64, transport: Box<dyn StreamTransport>, peer: PeerIdentity) {
        let mut machine = self.machine.lock();
        if machine.listen_generation != generation
            || machine.connection.state() != ConnectionState::Listening
        {
            tracing::debug!("Dropping connection from {}: no longer listening", peer);
            transport.close();
            return;
        }

        tracing::info!("Incoming call from {}", peer);
        let (exit_tx, exit_rx) = crossbeam_channel::unbounded();
        match machine.connection.accepted(transport, exit_tx) {
            Ok(()) => self.begin_session(&mut machine, peer, CallRole::Listener, exit_rx),
            Err(e) => self.emit(CallEvent::Failed(e.to_string())),
        }
    }

    fn on_accept_failed(&self, generation: u64, err: TransportError) {
        let mut machine = self.machine.lock();
        if machine.listen_generation != generation
            || machine.connection.state() != ConnectionState::Listening
        {
            // Abgebrochen über cancel_listening()
            tracing::debug!("Accept ended: {}", err);
            return;
        }

        tracing::error!("Accepting a call failed: {}", err);
        machine.connection.listener_failed();
        self.emit(CallEvent::Failed(err.to_string()));
    }

    fn begin_session(
        self: &Arc<Self>,
        machine: &mut Machine,
        peer: PeerIdentity,
        role: CallRole,
        exit_rx: Receiver<LinkExit>,
    ) {
        let session = CallSession {
            id: Uuid::new_v4(),
            peer: peer.clone(),
            role,
            started_at: self.clock.now(),
            started: self.clock.instant(),
        };
        tracing::info!("Call {} with {} connected", session.id, peer);

        self.spawn_watcher(session.id, exit_rx);
        machine.session = Some(session);
        self.emit(CallEvent::Connected(peer));
    }

    /// Beendet den Anruf bei Peer-Trennung, Fehler oder Ablauf der Maximaldauer
    fn spawn_watcher(self: &Arc<Self>, session_id: Uuid, exit_rx: Receiver<LinkExit>) {
        let inner = Arc::clone(self);
        let max_call_duration = self.max_call_duration;

        let spawned = thread::Builder::new()
            .name("bluecall-watch".to_string())
            .spawn(move || {
                let reason = match max_call_duration {
                    Some(max) => match exit_rx.recv_timeout(max) {
                        Ok(exit) => exit.to_string(),
                        Err(RecvTimeoutError::Timeout) => "maximum call duration reached".to_string(),
                        Err(RecvTimeoutError::Disconnected) => return,
                    },
                    None => match exit_rx.recv() {
                        Ok(exit) => exit.to_string(),
                        Err(_) => return,
                    },
                };

                let mut machine = inner.machine.lock();
                if machine.session.as_ref().map(|s| s.id) != Some(session_id) {
                    return;
                }
                tracing::info!("Ending call {}: {}", session_id, reason);
                if let Err(e) = inner.finish_call(&mut machine, Some(session_id)) {
                    tracing::error!("Failed to end call {}: {}", session_id, e);
                }
            });

        if let Err(e) = spawned {
            tracing::error!("Failed to start call watcher: {}", e);
        }
    }

    /// Connected → Idle, Anrufliste schreiben, `Ended` melden
    fn finish_call(&self, machine: &mut Machine, expected: Option<Uuid>) -> Result<u64, CallError> {
        if machine.connection.state() != ConnectionState::Connected {
            return Err(CallError::NotConnected);
        }
        let session = match machine.session.as_ref() {
            Some(session) if expected.map_or(true, |id| id == session.id) => session.clone(),
            _ => return Err(CallError::NotConnected),
        };

        let duration = self
            .clock
            .instant()
            .saturating_duration_since(session.started)
            .as_secs();

        machine.connection.hang_up()?;
        machine.session = None;

        if let Err(e) = self.history.record(&session.peer.name, duration) {
            tracing::error!("Failed to save call history: {}", e);
        }

        tracing::info!("Call with {} ended after {} sec", session.peer, duration);
        self.emit(CallEvent::Ended(duration));
        Ok(duration)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::testing::{FakeAudioDevices, ManualClock};
    use crate::database::{CallHistoryDatabase, CallHistoryRecord, DatabaseError, RecordId};
    use crate::transport::{MemoryAir, MemoryRadio, SERVICE_NAME, SERVICE_UUID};
    use std::time::Instant;
    use tokio::sync::broadcast::error::TryRecvError;

    struct Fixture {
        controller: CallSessionController,
        radio: Arc<MemoryRadio>,
        audio: FakeAudioDevices,
        clock: ManualClock,
        history: Arc<CallHistoryDatabase>,
    }

    fn fixture(air: &MemoryAir, name: &str, address: &str, max: Option<Duration>) -> Fixture {
        let radio = Arc::new(air.radio(PeerIdentity::new(name, address)));
        let audio = FakeAudioDevices::new();
        let clock = ManualClock::new();
        let history = Arc::new(CallHistoryDatabase::open_in_memory().unwrap());
        let connection = ConnectionStateMachine::new(
            radio.clone(),
            Arc::new(audio.clone()),
            AudioFormat::default(),
        );
        let controller =
            CallSessionController::with_clock(connection, history.clone(), Arc::new(clock.clone()), max);

        Fixture {
            controller,
            radio,
            audio,
            clock,
            history,
        }
    }

    fn next_event(rx: &mut broadcast::Receiver<CallEvent>) -> Option<CallEvent> {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
                Err(_) => return None,
            }
        }
        None
    }

    fn headset() -> PeerIdentity {
        PeerIdentity::new("HeadsetX", "AA:BB:CC:DD:EE:FF")
    }

    #[test]
    fn test_initiator_call_records_history() {
        let air = MemoryAir::new();
        let f = fixture(&air, "me", "00:00:00:00:00:01", None);
        let headset_radio = air.radio(headset());
        let _listener = headset_radio.listen(SERVICE_UUID, SERVICE_NAME).unwrap();
        let mut events = f.controller.subscribe();

        f.controller.start_as_initiator(headset()).unwrap();
        assert_eq!(f.controller.state(), ConnectionState::Connected);
        let session = f.controller.session().unwrap();
        assert_eq!(session.role, CallRole::Initiator);
        assert_eq!(session.peer, headset());

        f.clock.advance(5);
        assert_eq!(f.controller.end_call().unwrap(), 5);
        assert_eq!(f.controller.state(), ConnectionState::Idle);
        assert!(f.controller.session().is_none());

        let records = f.history.list_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].peer_name, "HeadsetX");
        assert_eq!(records[0].duration_seconds, 5);

        assert_eq!(next_event(&mut events), Some(CallEvent::Connecting(headset())));
        assert_eq!(next_event(&mut events), Some(CallEvent::Connected(headset())));
        assert_eq!(next_event(&mut events), Some(CallEvent::Ended(5)));
        assert_eq!(f.audio.open_handles(), 0);
    }

    #[test]
    fn test_listener_without_peer_stays_listening() {
        let air = MemoryAir::new();
        let f = fixture(&air, "me", "00:00:00:00:00:01", None);
        let mut events = f.controller.subscribe();

        f.controller.start_as_listener().unwrap();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(f.controller.state(), ConnectionState::Listening);
        assert_eq!(next_event(&mut events), Some(CallEvent::Listening));
        assert!(f.history.list_all().unwrap().is_empty());

        f.controller.cancel_listening().unwrap();
        assert_eq!(f.controller.state(), ConnectionState::Idle);
        assert!(matches!(f.controller.cancel_listening(), Err(CallError::NotListening)));

        // Kein Failed-Event nach bewusstem Abbruch
        thread::sleep(Duration::from_millis(50));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_initiator_to_missing_service_fails() {
        let air = MemoryAir::new();
        let f = fixture(&air, "me", "00:00:00:00:00:01", None);
        let mut events = f.controller.subscribe();

        let result = f.controller.start_as_initiator(headset());

        assert!(matches!(result, Err(CallError::PeerUnreachable(_))));
        assert_eq!(f.controller.state(), ConnectionState::Idle);
        assert!(f.history.list_all().unwrap().is_empty());
        assert_eq!(next_event(&mut events), Some(CallEvent::Connecting(headset())));
        assert!(matches!(next_event(&mut events), Some(CallEvent::Failed(_))));
    }

    #[test]
    fn test_new_call_refused_while_busy() {
        let air = MemoryAir::new();
        let f = fixture(&air, "me", "00:00:00:00:00:01", None);

        f.controller.start_as_listener().unwrap();
        assert!(matches!(f.controller.start_as_listener(), Err(CallError::AlreadyInCall)));
        assert!(matches!(
            f.controller.start_as_initiator(headset()),
            Err(CallError::AlreadyInCall)
        ));
        assert!(matches!(
            f.controller.scan(Duration::from_secs(1)),
            Err(CallError::AlreadyInCall)
        ));
        assert_eq!(f.controller.state(), ConnectionState::Listening);
        f.controller.cancel_listening().unwrap();
    }

    #[test]
    fn test_new_call_refused_while_connected() {
        let air = MemoryAir::new();
        let f = fixture(&air, "me", "00:00:00:00:00:01", None);
        let _listener = air.radio(headset()).listen(SERVICE_UUID, SERVICE_NAME).unwrap();
        f.controller.start_as_initiator(headset()).unwrap();
        let session_id = f.controller.session().unwrap().id;

        assert!(matches!(f.controller.start_as_listener(), Err(CallError::AlreadyInCall)));
        assert!(matches!(
            f.controller.start_as_initiator(headset()),
            Err(CallError::AlreadyInCall)
        ));
        assert_eq!(f.controller.state(), ConnectionState::Connected);
        assert_eq!(f.controller.session().unwrap().id, session_id);
        assert_eq!(f.audio.open_handles(), 2);

        f.controller.end_call().unwrap();
        assert_eq!(f.history.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_new_call_refused_while_connecting() {
        let air = MemoryAir::new();
        let f = fixture(&air, "me", "00:00:00:00:00:01", None);
        let _listener = air.radio(headset()).listen(SERVICE_UUID, SERVICE_NAME).unwrap();
        f.radio.set_connect_delay(Duration::from_millis(300));

        let dialing = {
            let controller = f.controller.clone();
            thread::spawn(move || controller.start_as_initiator(headset()))
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        while f.controller.state() != ConnectionState::Connecting && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(f.controller.state(), ConnectionState::Connecting);

        assert!(matches!(f.controller.start_as_listener(), Err(CallError::AlreadyInCall)));
        assert!(matches!(
            f.controller.start_as_initiator(headset()),
            Err(CallError::AlreadyInCall)
        ));
        assert_eq!(f.controller.state(), ConnectionState::Connecting);

        dialing.join().unwrap().unwrap();
        assert_eq!(f.controller.state(), ConnectionState::Connected);
        f.controller.end_call().unwrap();
    }

    #[test]
    fn test_duration_ignores_wall_clock_steps() {
        let air = MemoryAir::new();
        let f = fixture(&air, "me", "00:00:00:00:00:01", None);
        let _listener = air.radio(headset()).listen(SERVICE_UUID, SERVICE_NAME).unwrap();

        f.controller.start_as_initiator(headset()).unwrap();
        f.clock.advance(4);
        f.clock.step_wall_clock(-3600);

        assert_eq!(f.controller.end_call().unwrap(), 4);
        assert_eq!(f.history.list_all().unwrap()[0].duration_seconds, 4);
    }

    #[test]
    fn test_paired_devices_come_from_radio() {
        let air = MemoryAir::new();
        let f = fixture(&air, "me", "00:00:00:00:00:01", None);
        assert!(f.controller.paired_devices().unwrap().is_empty());

        f.radio.pair_with(headset());
        assert_eq!(f.controller.paired_devices().unwrap(), vec![headset()]);

        f.radio.set_enabled(false);
        assert!(matches!(f.controller.paired_devices(), Err(CallError::AdapterDisabled)));
    }

    #[test]
    fn test_end_call_requires_connection() {
        let air = MemoryAir::new();
        let f = fixture(&air, "me", "00:00:00:00:00:01", None);
        assert!(matches!(f.controller.end_call(), Err(CallError::NotConnected)));
    }

    #[test]
    fn test_two_controllers_call_each_other() {
        let air = MemoryAir::new();
        let callee = fixture(&air, "callee", "00:00:00:00:00:02", None);
        let caller = fixture(&air, "caller", "00:00:00:00:00:01", None);
        let mut callee_events = callee.controller.subscribe();

        callee.controller.start_as_listener().unwrap();
        assert_eq!(next_event(&mut callee_events), Some(CallEvent::Listening));

        caller
            .controller
            .start_as_initiator(callee.radio.identity().clone())
            .unwrap();

        let connected = next_event(&mut callee_events);
        assert_eq!(connected, Some(CallEvent::Connected(caller.radio.identity().clone())));
        assert_eq!(callee.controller.state(), ConnectionState::Connected);
        assert_eq!(callee.controller.session().unwrap().role, CallRole::Listener);

        // Auflegen auf einer Seite beendet den Anruf auf der anderen
        callee.clock.advance(3);
        caller.controller.end_call().unwrap();
        assert_eq!(next_event(&mut callee_events), Some(CallEvent::Ended(3)));
        assert_eq!(callee.controller.state(), ConnectionState::Idle);
        assert_eq!(callee.history.list_all().unwrap()[0].peer_name, "caller");

        // Listener ist einmalig; neu starten für den nächsten Anruf
        assert!(matches!(
            caller.controller.start_as_initiator(callee.radio.identity().clone()),
            Err(CallError::PeerUnreachable(_))
        ));
    }

    #[test]
    fn test_peer_disconnect_ends_call_once() {
        let air = MemoryAir::new();
        let f = fixture(&air, "me", "00:00:00:00:00:01", None);
        let headset_radio = air.radio(headset());
        let listener = headset_radio.listen(SERVICE_UUID, SERVICE_NAME).unwrap();
        let mut events = f.controller.subscribe();

        f.controller.start_as_initiator(headset()).unwrap();
        let (remote, _) = listener.accept().unwrap();
        f.clock.advance(2);
        remote.close();

        assert_eq!(next_event(&mut events), Some(CallEvent::Connecting(headset())));
        assert_eq!(next_event(&mut events), Some(CallEvent::Connected(headset())));
        assert_eq!(next_event(&mut events), Some(CallEvent::Ended(2)));
        assert_eq!(f.controller.state(), ConnectionState::Idle);
        assert_eq!(f.history.list_all().unwrap().len(), 1);

        thread::sleep(Duration::from_millis(100));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(f.controller.end_call(), Err(CallError::NotConnected)));
    }

    #[test]
    fn test_maximum_call_duration_hangs_up() {
        let air = MemoryAir::new();
        let f = fixture(&air, "me", "00:00:00:00:00:01", Some(Duration::from_millis(100)));
        let headset_radio = air.radio(headset());
        let _listener = headset_radio.listen(SERVICE_UUID, SERVICE_NAME).unwrap();
        let mut events = f.controller.subscribe();

        f.controller.start_as_initiator(headset()).unwrap();

        assert_eq!(next_event(&mut events), Some(CallEvent::Connecting(headset())));
        assert_eq!(next_event(&mut events), Some(CallEvent::Connected(headset())));
        assert_eq!(next_event(&mut events), Some(CallEvent::Ended(0)));
        assert_eq!(f.controller.state(), ConnectionState::Idle);
        assert_eq!(f.history.list_all().unwrap().len(), 1);
    }

    struct BrokenStore;

    impl CallHistoryStore for BrokenStore {
        fn record(&self, _: &str, duration: u64) -> Result<RecordId, DatabaseError> {
            Err(DatabaseError::InvalidDuration(duration))
        }

        fn list_all(&self) -> Result<Vec<CallHistoryRecord>, DatabaseError> {
            Ok(Vec::new())
        }

        fn clear_all(&self) -> Result<usize, DatabaseError> {
            Ok(0)
        }
    }

    #[test]
    fn test_history_failure_does_not_fail_hang_up() {
        let air = MemoryAir::new();
        let radio = Arc::new(air.radio(PeerIdentity::new("me", "00:00:00:00:00:01")));
        let headset_radio = air.radio(headset());
        let _listener = headset_radio.listen(SERVICE_UUID, SERVICE_NAME).unwrap();
        let controller = CallSessionController::new(
            radio,
            Arc::new(FakeAudioDevices::new()),
            Arc::new(BrokenStore),
            None,
        );

        controller.start_as_initiator(headset()).unwrap();
        assert!(controller.end_call().is_ok());
        assert_eq!(controller.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_audio_failure_aborts_connect() {
        let air = MemoryAir::new();
        let f = fixture(&air, "me", "00:00:00:00:00:01", None);
        let headset_radio = air.radio(headset());
        let _listener = headset_radio.listen(SERVICE_UUID, SERVICE_NAME).unwrap();
        f.audio.fail_playback();
        let mut events = f.controller.subscribe();

        let result = f.controller.start_as_initiator(headset());

        assert!(matches!(result, Err(CallError::PlaybackDeviceUnavailable(_))));
        assert_eq!(f.controller.state(), ConnectionState::Idle);
        assert_eq!(f.audio.open_handles(), 0);
        assert_eq!(next_event(&mut events), Some(CallEvent::Connecting(headset())));
        assert!(matches!(next_event(&mut events), Some(CallEvent::Failed(_))));
    }

    #[test]
    fn test_repeated_calls_release_audio() {
        let air = MemoryAir::new();
        let f = fixture(&air, "me", "00:00:00:00:00:01", None);
        let headset_radio = air.radio(headset());

        for _ in 0..3 {
            let _listener = headset_radio.listen(SERVICE_UUID, SERVICE_NAME).unwrap();
            f.controller.start_as_initiator(headset()).unwrap();
            assert_eq!(f.audio.open_handles(), 2);
            f.controller.end_call().unwrap();
            assert_eq!(f.audio.open_handles(), 0);
        }
        assert_eq!(f.history.list_all().unwrap().len(), 3);
    }

    #[test]
    fn test_disabled_adapter_reports_failure() {
        let air = MemoryAir::new();
        let f = fixture(&air, "me", "00:00:00:00:00:01", None);
        f.radio.set_enabled(false);
        let mut events = f.controller.subscribe();

        assert!(matches!(f.controller.start_as_listener(), Err(CallError::AdapterDisabled)));
        assert!(matches!(next_event(&mut events), Some(CallEvent::Failed(_))));
        assert_eq!(f.controller.state(), ConnectionState::Idle);
    }
}
