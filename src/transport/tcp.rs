//! TCP Transport
//!
//! Desktop-Ersatz für den RFCOMM-Socket. Die Adresse eines Peers ist
//! `host:port`. Ein kurzer Handshake ersetzt die Service-Record-Suche:
//!
//! ```text
//! Initiator -> Listener:  [16 Byte Service-UUID][u8 Namenslänge][Name]
//! Listener  -> Initiator: [0x01][u8 Namenslänge][Name]
//! ```
//!
//! Passt die UUID nicht, schließt der Listener die Verbindung.

use super::{
    read_exact_until, write_all_until, PeerIdentity, Radio, ServiceListener, StreamTransport,
    TransportError,
};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const HANDSHAKE_ACCEPT: u8 = 0x01;
const MAX_NAME_LEN: usize = u8::MAX as usize;

// ============================================================================
// TCP TRANSPORT
// ============================================================================

/// Verbundener TCP-Stream mit begrenztem Read-Timeout
pub struct TcpTransport {
    stream: TcpStream,
    closed: AtomicBool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, read_timeout: Duration) -> Result<Self, TransportError> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(read_timeout))?;
        stream.set_write_timeout(Some(read_timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            closed: AtomicBool::new(false),
        })
    }

    fn map_error(&self, err: std::io::Error) -> TransportError {
        if self.closed.load(Ordering::Acquire) {
            return TransportError::Closed;
        }
        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => {
                TransportError::TimedOut
            }
            _ => TransportError::Io(err),
        }
    }
}

impl StreamTransport for TcpTransport {
    fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        match (&self.stream).read(buf) {
            // Nach eigenem shutdown() liefert der Socket ebenfalls 0
            Ok(0) if self.closed.load(Ordering::Acquire) => Err(TransportError::Closed),
            Ok(n) => Ok(n),
            Err(e) => Err(self.map_error(e)),
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        (&self.stream).write(buf).map_err(|e| self.map_error(e))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.stream.shutdown(Shutdown::Both) {
                tracing::debug!("TCP shutdown failed: {}", e);
            }
        }
    }
}

// ============================================================================
// HANDSHAKE
// ============================================================================

fn encode_name(name: &str) -> Vec<u8> {
    let mut end = name.len().min(MAX_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = Vec::with_capacity(end + 1);
    out.push(end as u8);
    out.extend_from_slice(&name.as_bytes()[..end]);
    out
}

fn read_name(transport: &dyn StreamTransport, deadline: Instant) -> Result<String, TransportError> {
    let mut len = [0u8; 1];
    read_exact_until(transport, &mut len, deadline)?;
    let mut name = vec![0u8; len[0] as usize];
    read_exact_until(transport, &mut name, deadline)?;
    Ok(String::from_utf8_lossy(&name).into_owned())
}

/// Initiator-Seite; gibt den Namen des Listeners zurück
fn handshake_initiator(
    transport: &dyn StreamTransport,
    service: Uuid,
    local_name: &str,
    deadline: Instant,
) -> Result<String, TransportError> {
    let mut hello = service.as_bytes().to_vec();
    hello.extend(encode_name(local_name));
    write_all_until(transport, &hello, deadline)?;

    let mut ack = [0u8; 1];
    read_exact_until(transport, &mut ack, deadline)?;
    if ack[0] != HANDSHAKE_ACCEPT {
        return Err(TransportError::Unreachable(format!(
            "service {} refused",
            service
        )));
    }
    read_name(transport, deadline)
}

/// Listener-Seite; gibt den Namen des Initiators zurück
fn handshake_listener(
    transport: &dyn StreamTransport,
    service: Uuid,
    local_name: &str,
    deadline: Instant,
) -> Result<String, TransportError> {
    let mut requested = [0u8; 16];
    read_exact_until(transport, &mut requested, deadline)?;
    let requested = Uuid::from_bytes(requested);
    if requested != service {
        return Err(TransportError::Unreachable(format!(
            "peer asked for unknown service {}",
            requested
        )));
    }
    let peer_name = read_name(transport, deadline)?;

    let mut reply = vec![HANDSHAKE_ACCEPT];
    reply.extend(encode_name(local_name));
    write_all_until(transport, &reply, deadline)?;
    Ok(peer_name)
}

// ============================================================================
// TCP RADIO
// ============================================================================

#[derive(Debug, Clone)]
pub struct TcpRadioConfig {
    pub local_name: String,
    pub listen_addr: SocketAddr,
    /// Bekannte Peers; gelten als "gekoppelt" und werden bei der Suche gemeldet
    pub known_peers: Vec<PeerIdentity>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Intervall, in dem der Listener auf `close()` prüft
    pub accept_poll: Duration,
}

pub struct TcpRadio {
    config: TcpRadioConfig,
    discovering: Arc<AtomicBool>,
}

impl TcpRadio {
    pub fn new(config: TcpRadioConfig) -> Self {
        Self {
            config,
            discovering: Arc::new(AtomicBool::new(false)),
        }
    }

    fn resolve(address: &str) -> Result<SocketAddr, TransportError> {
        address
            .to_socket_addrs()
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", address, e)))?
            .next()
            .ok_or_else(|| TransportError::Unreachable(format!("{}: no address", address)))
    }
}

impl Radio for TcpRadio {
    fn is_enabled(&self) -> bool {
        true
    }

    fn local_name(&self) -> String {
        self.config.local_name.clone()
    }

    fn paired_devices(&self) -> Result<Vec<PeerIdentity>, TransportError> {
        Ok(self.config.known_peers.clone())
    }

    fn start_discovery(&self, found: Sender<PeerIdentity>) -> Result<(), TransportError> {
        let peers = self.config.known_peers.clone();
        let discovering = Arc::clone(&self.discovering);
        discovering.store(true, Ordering::Release);

        thread::Builder::new()
            .name("bluecall-inquiry".to_string())
            .spawn(move || {
                for peer in peers {
                    if !discovering.load(Ordering::Acquire) || found.send(peer).is_err() {
                        break;
                    }
                }
                discovering.store(false, Ordering::Release);
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
        let addr = Self::resolve(&peer.address)?;
        let deadline = Instant::now() + self.config.connect_timeout;

        tracing::info!("Connecting to {} via TCP ({})", peer, addr);

        let stream = TcpStream::connect_timeout(&addr, self.config.connect_timeout)
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", addr, e)))?;
        let transport = TcpTransport::new(stream, self.config.read_timeout)?;

        match handshake_initiator(&transport, service, &self.config.local_name, deadline) {
            Ok(remote_name) => {
                tracing::debug!("Service handshake with '{}' complete", remote_name);
                Ok(Box::new(transport))
            }
            Err(e) => {
                transport.close();
                Err(match e {
                    TransportError::Unreachable(reason) => TransportError::Unreachable(reason),
                    other => TransportError::Unreachable(format!(
                        "service {} not available on {}: {}",
                        service, addr, other
                    )),
                })
            }
        }
    }

    fn listen(&self, service: Uuid, name: &str) -> Result<Box<dyn ServiceListener>, TransportError> {
        let listener = TcpListener::bind(self.config.listen_addr)?;
        listener.set_nonblocking(true)?;

        tracing::info!(
            "Service '{}' ({}) listening on {}",
            name,
            service,
            listener.local_addr()?
        );

        Ok(Box::new(TcpServiceListener {
            listener: Mutex::new(Some(listener)),
            service,
            local_name: self.config.local_name.clone(),
            read_timeout: self.config.read_timeout,
            handshake_timeout: self.config.connect_timeout,
            accept_poll: self.config.accept_poll,
        }))
    }
}

// ============================================================================
// TCP SERVICE LISTENER
// ============================================================================

struct TcpServiceListener {
    /// `None` nach `close()`; der Port ist dann sofort wieder frei
    listener: Mutex<Option<TcpListener>>,
    service: Uuid,
    local_name: String,
    read_timeout: Duration,
    handshake_timeout: Duration,
    accept_poll: Duration,
}

impl ServiceListener for TcpServiceListener {
    fn accept(&self) -> Result<(Box<dyn StreamTransport>, PeerIdentity), TransportError> {
        loop {
            // Lock nur für den nicht-blockierenden accept() halten
            let accepted = match self.listener.lock().as_ref() {
                Some(listener) => listener.accept(),
                None => return Err(TransportError::Closed),
            };

            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(self.accept_poll);
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Io(e)),
            };

            let transport = TcpTransport::new(stream, self.read_timeout)?;
            let deadline = Instant::now() + self.handshake_timeout;
            match handshake_listener(&transport, self.service, &self.local_name, deadline) {
                Ok(peer_name) => {
                    return Ok((
                        Box::new(transport),
                        PeerIdentity::new(peer_name, addr.to_string()),
                    ));
                }
                Err(e) => {
                    tracing::warn!("Dropping inbound connection from {}: {}", addr, e);
                    transport.close();
                }
            }
        }
    }

    fn close(&self) {
        if self.listener.lock().take().is_some() {
            tracing::debug!("TCP listener closed");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
