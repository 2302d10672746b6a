//! In-Memory Transport
//!
//! Verbindet Peers innerhalb eines Prozesses über eine gemeinsame "Luft"
//! (`MemoryAir`). Wird für Tests und Demos ohne Funkhardware verwendet.

use super::{PeerIdentity, Radio, ServiceListener, StreamTransport, TransportError};
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

// ============================================================================
// PIPE
// ============================================================================

#[derive(Default)]
struct PipeState {
    bytes: VecDeque<u8>,
    closed: bool,
}

/// Einseitiger Byte-Kanal
#[derive(Default)]
struct Pipe {
    state: Mutex<PipeState>,
    ready: Condvar,
}

impl Pipe {
    fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }
}

// ============================================================================
// MEMORY TRANSPORT
// ============================================================================

/// Ein Ende einer In-Memory-Verbindung
pub struct MemoryTransport {
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
    closed: AtomicBool,
    read_timeout: Duration,
}

impl MemoryTransport {
    fn new(incoming: Arc<Pipe>, outgoing: Arc<Pipe>) -> Self {
        Self {
            incoming,
            outgoing,
            closed: AtomicBool::new(false),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Zwei verbundene Enden
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(Pipe::default());
        let b = Arc::new(Pipe::default());
        (
            Self::new(Arc::clone(&a), Arc::clone(&b)),
            Self::new(b, a),
        )
    }

    /// Perfekte Schleife: alles Geschriebene wird vom selben Ende gelesen
    pub fn loopback() -> Self {
        let pipe = Arc::new(Pipe::default());
        Self::new(Arc::clone(&pipe), pipe)
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

impl StreamTransport for MemoryTransport {
    fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let deadline = Instant::now() + self.read_timeout;
        let mut state = self.incoming.state.lock();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            if !state.bytes.is_empty() {
                let n = buf.len().min(state.bytes.len());
                for (slot, byte) in buf.iter_mut().zip(state.bytes.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            if self
                .incoming
                .ready
                .wait_until(&mut state, deadline)
                .timed_out()
                && state.bytes.is_empty()
                && !state.closed
                && !self.closed.load(Ordering::Acquire)
            {
                return Err(TransportError::TimedOut);
            }
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut state = self.outgoing.state.lock();
        if state.closed {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer closed the connection",
            )));
        }
        state.bytes.extend(buf.iter().copied());
        self.outgoing.ready.notify_all();
        Ok(buf.len())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.incoming.close();
            self.outgoing.close();
        }
    }
}

// ============================================================================
// MEMORY AIR
// ============================================================================

#[derive(Default)]
struct SlotState {
    pending: VecDeque<(MemoryTransport, PeerIdentity)>,
    closed: bool,
}

/// Registrierter Dienst eines lauschenden Peers
struct ServiceSlot {
    service: Uuid,
    state: Mutex<SlotState>,
    ready: Condvar,
}

#[derive(Default)]
struct AirState {
    stations: HashMap<String, PeerIdentity>,
    services: HashMap<String, Arc<ServiceSlot>>,
}

/// Gemeinsames Medium für alle `MemoryRadio`s eines Prozesses
#[derive(Clone, Default)]
pub struct MemoryAir {
    inner: Arc<Mutex<AirState>>,
}

impl MemoryAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Erstellt einen Adapter, der in dieser Luft sichtbar ist
    pub fn radio(&self, identity: PeerIdentity) -> MemoryRadio {
        self.inner
            .lock()
            .stations
            .insert(identity.address.clone(), identity.clone());

        MemoryRadio {
            identity,
            air: self.clone(),
            enabled: AtomicBool::new(true),
            discovering: Arc::new(AtomicBool::new(false)),
            paired: Mutex::new(Vec::new()),
            read_timeout: DEFAULT_READ_TIMEOUT,
            connect_delay: Mutex::new(Duration::ZERO),
        }
    }
}

// ============================================================================
// MEMORY RADIO
// ============================================================================

pub struct MemoryRadio {
    identity: PeerIdentity,
    air: MemoryAir,
    enabled: AtomicBool,
    discovering: Arc<AtomicBool>,
    paired: Mutex<Vec<PeerIdentity>>,
    read_timeout: Duration,
    /// Simuliert einen langsamen Verbindungsaufbau
    connect_delay: Mutex<Duration>,
}

impl MemoryRadio {
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn pair_with(&self, peer: PeerIdentity) {
        let mut paired = self.paired.lock();
        if !paired.contains(&peer) {
            paired.push(peer);
        }
    }

    /// Jeder `connect()` blockiert zuerst für `delay`
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    fn ensure_enabled(&self) -> Result<(), TransportError> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(TransportError::AdapterDisabled)
        }
    }
}

impl Radio for MemoryRadio {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn local_name(&self) -> String {
        self.identity.name.clone()
    }

    fn paired_devices(&self) -> Result<Vec<PeerIdentity>, TransportError> {
        self.ensure_enabled()?;
        Ok(self.paired.lock().clone())
    }

    fn start_discovery(&self, found: Sender<PeerIdentity>) -> Result<(), TransportError> {
        self.ensure_enabled()?;

        let peers: Vec<PeerIdentity> = self
            .air
            .inner
            .lock()
            .stations
            .values()
            .filter(|p| p.address != self.identity.address)
            .cloned()
            .collect();

        let discovering = Arc::clone(&self.discovering);
        discovering.store(true, Ordering::Release);

        thread::Builder::new()
            .name("bluecall-inquiry".to_string())
            .spawn(move || {
                for peer in peers {
                    if !discovering.load(Ordering::Acquire) || found.send(peer).is_err() {
                        return;
                    }
                }
                // Inquiry-Fenster offen halten bis abgebrochen wird
                while discovering.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| TransportError::Discovery(e.to_string()))?;

        Ok(())
    }

    fn cancel_discovery(&self) {
        self.discovering.store(false, Ordering::Release);
    }

    fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::Acquire)
    }

    fn connect(
        &self,
        peer: &PeerIdentity,
        service: Uuid,
    ) -> Result<Box<dyn StreamTransport>, TransportError> {
        self.ensure_enabled()?;

        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let slot = self
            .air
            .inner
            .lock()
            .services
            .get(&peer.address)
            .cloned()
            .ok_or_else(|| {
                TransportError::Unreachable(format!("no service listening on {}", peer.address))
            })?;

        if slot.service != service {
            return Err(TransportError::Unreachable(format!(
                "service {} not found on {}",
                service, peer.address
            )));
        }

        let (local, remote) = MemoryTransport::pair();
        let local = local.with_read_timeout(self.read_timeout);
        let remote = remote.with_read_timeout(self.read_timeout);

        let mut state = slot.state.lock();
        if state.closed {
            return Err(TransportError::Unreachable(format!(
                "{} stopped listening",
                peer.address
            )));
        }
        state.pending.push_back((remote, self.identity.clone()));
        slot.ready.notify_all();

        Ok(Box::new(local))
    }

    fn listen(&self, service: Uuid, name: &str) -> Result<Box<dyn ServiceListener>, TransportError> {
        self.ensure_enabled()?;

        let slot = Arc::new(ServiceSlot {
            service,
            state: Mutex::new(SlotState::default()),
            ready: Condvar::new(),
        });
        self.air
            .inner
            .lock()
            .services
            .insert(self.identity.address.clone(), Arc::clone(&slot));

        tracing::debug!("{} listening for '{}' ({})", self.identity, name, service);

        Ok(Box::new(MemoryListener {
            slot,
            air: self.air.clone(),
            address: self.identity.address.clone(),
        }))
    }
}

// ============================================================================
// MEMORY LISTENER
// ============================================================================

struct MemoryListener {
    slot: Arc<ServiceSlot>,
    air: MemoryAir,
    address: String,
}

impl ServiceListener for MemoryListener {
    fn accept(&self) -> Result<(Box<dyn StreamTransport>, PeerIdentity), TransportError> {
        let mut state = self.slot.state.lock();
        loop {
            if let Some((transport, peer)) = state.pending.pop_front() {
                return Ok((Box::new(transport), peer));
            }
            if state.closed {
                return Err(TransportError::Closed);
            }
            self.slot.ready.wait(&mut state);
        }
    }

    fn close(&self) {
        {
            let mut state = self.slot.state.lock();
            state.closed = true;
            for (transport, _) in state.pending.drain(..) {
                transport.close();
            }
        }
        self.slot.ready.notify_all();

        let mut air = self.air.inner.lock();
        if air
            .services
            .get(&self.address)
            .is_some_and(|s| Arc::ptr_eq(s, &self.slot))
        {
            air.services.remove(&self.address);
        }
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// TESTS
// ============================================================================
