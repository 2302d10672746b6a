//! Transport Module - Punkt-zu-Punkt Byte-Stream zwischen zwei Geräten
//!
//! Dieses Modul abstrahiert:
//! - den verbundenen Byte-Stream (RFCOMM-Socket, TCP oder In-Memory)
//! - den Listener für eingehende Verbindungen
//! - den Funkadapter (Discovery, gekoppelte Geräte, Verbindungsaufbau)
//!

#[cfg(feature = "bluez")]
mod bluez;
mod discovery;
mod memory;
mod tcp;

#[cfg(feature = "bluez")]
pub use bluez::BluezRadio;
pub use discovery::Discovery;
pub use memory::{MemoryAir, MemoryRadio, MemoryTransport};
pub use tcp::{TcpRadio, TcpRadioConfig, TcpTransport};

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Service-UUID des Anruf-Dienstes (Serial Port Profile)
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1101_0000_1000_8000_0080_5F9B_34FB);

/// Name des Service-Records
pub const SERVICE_NAME: &str = "BluetoothCall";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport closed")]
    Closed,

    #[error("Transport read timed out")]
    TimedOut,

    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Radio adapter is disabled")]
    AdapterDisabled,

    #[error("Discovery failed: {0}")]
    Discovery(String),
}

// ============================================================================
// PEER IDENTITY
// ============================================================================

/// Gegenstelle eines Anrufs (Name + stabile Hardware-Adresse)
///
/// Gleichheit und Hash beziehen sich nur auf die Adresse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub name: String,
    pub address: String,
}

impl PeerIdentity {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for PeerIdentity {}

impl Hash for PeerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Verbundener, bidirektionaler Byte-Stream
///
/// Wird von genau einem Leser (Downlink) und einem Schreiber (Uplink)
/// gleichzeitig benutzt. `close()` darf von einem dritten Thread kommen und
/// muss blockierende Aufrufe zeitnah lösen.
pub trait StreamTransport: Send + Sync {
    /// Liest mindestens ein Byte; `Ok(0)` heißt: Gegenstelle hat geschlossen
    fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Schreibt Bytes in den Sendepuffer
    fn write(&self, buf: &[u8]) -> Result<usize, TransportError>;

    /// Schließt den Stream (idempotent)
    fn close(&self);
}

/// Wartet auf genau eine eingehende Verbindung pro Aufruf
pub trait ServiceListener: Send + Sync {
    /// Blockiert bis sich ein Peer verbindet oder `close()` aufgerufen wurde
    fn accept(&self) -> Result<(Box<dyn StreamTransport>, PeerIdentity), TransportError>;

    fn close(&self);
}

/// Lokaler Funkadapter
///
/// Discovery und aktive Verbindungen schließen sich gegenseitig aus; das
/// erzwingt die `ConnectionStateMachine`, der Adapter selbst merkt sich nur
/// ob gerade gesucht wird.
pub trait Radio: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Name, mit dem sich dieses Gerät bei Peers meldet
    fn local_name(&self) -> String;

    fn paired_devices(&self) -> Result<Vec<PeerIdentity>, TransportError>;

    /// Startet eine Geräte-Suche; gefundene Geräte gehen an `found`
    fn start_discovery(&self, found: Sender<PeerIdentity>) -> Result<(), TransportError>;

    fn cancel_discovery(&self);

    fn is_discovering(&self) -> bool;

    /// Baut eine ausgehende Verbindung zum Dienst `service` auf `peer` auf
    fn connect(
        &self,
        peer: &PeerIdentity,
        service: Uuid,
    ) -> Result<Box<dyn StreamTransport>, TransportError>;

    /// Registriert den Dienst und gibt einen Listener zurück
    fn listen(&self, service: Uuid, name: &str) -> Result<Box<dyn ServiceListener>, TransportError>;
}

// ============================================================================
// HELPERS
// ============================================================================

/// Schreibt den kompletten Puffer, wiederholt bei Timeouts bis `deadline`
pub(crate) fn write_all_until(
    transport: &dyn StreamTransport,
    mut buf: &[u8],
    deadline: Instant,
) -> Result<(), TransportError> {
    while !buf.is_empty() {
        match transport.write(buf) {
            Ok(0) => return Err(TransportError::Closed),
            Ok(n) => buf = &buf[n..],
            Err(TransportError::TimedOut) if Instant::now() < deadline => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Füllt den Puffer vollständig, wiederholt bei Timeouts bis `deadline`
pub(crate) fn read_exact_until(
    transport: &dyn StreamTransport,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<(), TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        match transport.read(&mut buf[filled..]) {
            Ok(0) => return Err(TransportError::Closed),
            Ok(n) => filled += n,
            Err(TransportError::TimedOut) if Instant::now() < deadline => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_service_uuid_matches_serial_port_profile() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "00001101-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_peer_identity_equality_by_address() {
        let a = PeerIdentity::new("HeadsetX", "AA:BB:CC:DD:EE:FF");
        let b = PeerIdentity::new("Renamed", "AA:BB:CC:DD:EE:FF");
        let c = PeerIdentity::new("HeadsetX", "11:22:33:44:55:66");

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }
}
