//! BlueZ RFCOMM Transport (Linux)
//!
//! Verwendet `bluer` für:
//! - Geräte-Suche über Adapter-Events
//! - RFCOMM-Profile, die über die Service-UUID gefunden werden (beide Rollen)
//! - den verbundenen RFCOMM-Stream
//!
//! `bluer` ist async; die blockierende `StreamTransport`-Schnittstelle wird
//! über eine eigene Tokio-Runtime bedient. Ein Schließen beendet laufende
//! Reads/Writes über einen `watch`-Kanal.

use super::{PeerIdentity, Radio, ServiceListener, StreamTransport, TransportError};
use bluer::rfcomm::{ConnectRequest, Profile, ProfileHandle, Role, Stream};
use bluer::{Adapter, AdapterEvent, Address, Session};
use crossbeam_channel::Sender;
use futures::{pin_mut, StreamExt};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use uuid::Uuid;

fn bluez_error(err: bluer::Error) -> TransportError {
    TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        err.to_string(),
    ))
}

fn unreachable(peer: &PeerIdentity, err: impl std::fmt::Display) -> TransportError {
    TransportError::Unreachable(format!("{}: {}", peer, err))
}

/// Name eines Geräts nachschlagen, Adresse als Fallback
async fn device_identity(adapter: &Adapter, address: Address) -> PeerIdentity {
    let name = match adapter.device(address) {
        Ok(device) => device.name().await.ok().flatten(),
        Err(_) => None,
    };
    PeerIdentity::new(
        name.unwrap_or_else(|| address.to_string()),
        address.to_string(),
    )
}

// ============================================================================
// BLUEZ TRANSPORT
// ============================================================================

struct BluezTransport {
    handle: Handle,
    reader: AsyncMutex<ReadHalf<Stream>>,
    writer: AsyncMutex<WriteHalf<Stream>>,
    closed: watch::Sender<bool>,
    read_timeout: Duration,
    /// Client-Profil des Initiators; bleibt registriert solange der Stream lebt
    _profile: Option<ProfileHandle>,
}

impl BluezTransport {
    fn new(
        handle: Handle,
        stream: Stream,
        read_timeout: Duration,
        profile: Option<ProfileHandle>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        Self {
            handle,
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            closed,
            read_timeout,
            _profile: profile,
        }
    }
}

impl StreamTransport for BluezTransport {
    fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.handle.block_on(async {
            let mut closed = self.closed.subscribe();
            if *closed.borrow() {
                return Err(TransportError::Closed);
            }
            let mut reader = tokio::select! {
                reader = self.reader.lock() => reader,
                _ = closed.changed() => return Err(TransportError::Closed),
            };
            tokio::select! {
                res = tokio::time::timeout(self.read_timeout, reader.read(buf)) => match res {
                    Err(_) => Err(TransportError::TimedOut),
                    Ok(Ok(n)) => Ok(n),
                    Ok(Err(e)) => Err(TransportError::Io(e)),
                },
                _ = closed.changed() => Err(TransportError::Closed),
            }
        })
    }

    fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        self.handle.block_on(async {
            let mut closed = self.closed.subscribe();
            if *closed.borrow() {
                return Err(TransportError::Closed);
            }
            let mut writer = tokio::select! {
                writer = self.writer.lock() => writer,
                _ = closed.changed() => return Err(TransportError::Closed),
            };
            tokio::select! {
                res = tokio::time::timeout(self.read_timeout, writer.write(buf)) => match res {
                    Err(_) => Err(TransportError::TimedOut),
                    Ok(Ok(n)) => Ok(n),
                    Ok(Err(e)) => Err(TransportError::Io(e)),
                },
                _ = closed.changed() => Err(TransportError::Closed),
            }
        })
    }

    fn close(&self) {
        if !self.closed.send_replace(true) {
            tracing::debug!("RFCOMM stream closed");
        }
    }
}

// ============================================================================
// BLUEZ LISTENER
// ============================================================================

/// Wartet auf eingehende RFCOMM-Verbindungen
///
/// Das Server-Profil gehört einer eigenen Task, die Verbindungsanfragen
/// weiterreicht. `close()` beendet die Task; mit dem `ProfileHandle` wird
/// der Service-Record sofort abgemeldet. Angenommene Streams bleiben davon
/// unberührt, ihr Socket gehört bereits dieser Anwendung.
struct BluezListener {
    handle: Handle,
    adapter: Adapter,
    requests: AsyncMutex<mpsc::Receiver<ConnectRequest>>,
    closed: watch::Sender<bool>,
    read_timeout: Duration,
}

/// Hält das Profil registriert, bis der Listener geschlossen wird
async fn serve_profile<P, R>(
    mut profile: P,
    requests: mpsc::Sender<R>,
    mut closed: watch::Receiver<bool>,
) where
    P: futures::Stream<Item = R> + Unpin,
{
    loop {
        tokio::select! {
            request = profile.next() => match request {
                Some(request) => {
                    if requests.send(request).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = closed.changed() => break,
        }
    }
    drop(profile);
    tracing::debug!("RFCOMM service record unregistered");
}

impl ServiceListener for BluezListener {
    fn accept(&self) -> Result<(Box<dyn StreamTransport>, PeerIdentity), TransportError> {
        self.handle.block_on(async {
            let mut closed = self.closed.subscribe();
            if *closed.borrow() {
                return Err(TransportError::Closed);
            }
            let mut requests = self.requests.lock().await;
            let request = tokio::select! {
                request = requests.recv() => request.ok_or(TransportError::Closed)?,
                _ = closed.changed() => return Err(TransportError::Closed),
            };
            drop(requests);

            let address = request.device();
            let stream = request.accept().map_err(bluez_error)?;
            let peer = device_identity(&self.adapter, address).await;

            let transport = BluezTransport::new(self.handle.clone(), stream, self.read_timeout, None);
            Ok((Box::new(transport) as Box<dyn StreamTransport>, peer))
        })
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}

// ============================================================================
// BLUEZ RADIO
// ============================================================================

/// Standard-Bluetooth-Adapter über BlueZ/D-Bus
pub struct BluezRadio {
    runtime: Runtime,
    session: Session,
    adapter: Adapter,
    /// Abbruch-Signal der laufenden Suche
    discovery: Mutex<Option<watch::Sender<bool>>>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl BluezRadio {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("bluecall-bluez")
            .enable_all()
            .build()?;

        let (session, adapter) = runtime
            .block_on(async {
                let session = Session::new().await?;
                let adapter = session.default_adapter().await?;
                Ok::<_, bluer::Error>((session, adapter))
            })
            .map_err(bluez_error)?;

        tracing::info!("Using Bluetooth adapter {}", adapter.name());

        Ok(Self {
            runtime,
            session,
            adapter,
            discovery: Mutex::new(None),
            connect_timeout,
            read_timeout,
        })
    }
}

impl Radio for BluezRadio {
    fn is_enabled(&self) -> bool {
        self.runtime
            .block_on(self.adapter.is_powered())
            .unwrap_or(false)
    }

    fn local_name(&self) -> String {
        self.runtime
            .block_on(self.adapter.alias())
            .unwrap_or_else(|_| self.adapter.name().to_string())
    }

    fn paired_devices(&self) -> Result<Vec<PeerIdentity>, TransportError> {
        self.runtime.block_on(async {
            let mut paired = Vec::new();
            for address in self.adapter.device_addresses().await.map_err(bluez_error)? {
                let device = self.adapter.device(address).map_err(bluez_error)?;
                if device.is_paired().await.unwrap_or(false) {
                    paired.push(device_identity(&self.adapter, address).await);
                }
            }
            Ok(paired)
        })
    }

    fn start_discovery(&self, found: Sender<PeerIdentity>) -> Result<(), TransportError> {
        self.cancel_discovery();

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        *self.discovery.lock() = Some(cancel_tx);

        let handle = self.runtime.handle().clone();
        let adapter = self.adapter.clone();

        // Eigener Thread: block_on verlangt kein Send für den Event-Stream
        std::thread::Builder::new()
            .name("bluecall-inquiry".to_string())
            .spawn(move || {
                handle.block_on(async move {
                    let events = match adapter.discover_devices().await {
                        Ok(events) => events,
                        Err(e) => {
                            tracing::error!("Failed to start Bluetooth scan: {}", e);
                            return;
                        }
                    };
                    pin_mut!(events);

                    loop {
                        tokio::select! {
                            event = events.next() => match event {
                                Some(AdapterEvent::DeviceAdded(address)) => {
                                    let peer = device_identity(&adapter, address).await;
                                    if found.send(peer).is_err() {
                                        break;
                                    }
                                }
                                Some(_) => {}
                                None => break,
                            },
                            _ = cancel_rx.changed() => break,
                        }
                    }
                });
            })
            .map_err(|e| TransportError::Discovery(e.to_string()))?;

        Ok(())
    }

    fn cancel_discovery(&self) {
        if let Some(cancel) = self.discovery.lock().take() {
            let _ = cancel.send(true);
            tracing::debug!("Bluetooth discovery cancelled");
        }
    }

    fn is_discovering(&self) -> bool {
        self.discovery
            .lock()
            .as_ref()
            .is_some_and(|cancel| !cancel.is_closed())
    }

    fn connect(
        &self,
        peer: &PeerIdentity,
        service: Uuid,
    ) -> Result<Box<dyn StreamTransport>, TransportError> {
        let address: Address = peer
            .address
            .parse()
            .map_err(|_| TransportError::Unreachable(format!("invalid address {}", peer.address)))?;

        let establish = async {
            let profile = Profile {
                uuid: service,
                role: Some(Role::Client),
                require_authentication: Some(false),
                require_authorization: Some(false),
                auto_connect: Some(false),
                ..Default::default()
            };
            let mut profile = self
                .session
                .register_profile(profile)
                .await
                .map_err(bluez_error)?;
            let device = self
                .adapter
                .device(address)
                .map_err(|e| unreachable(peer, e))?;

            let connect = device.connect_profile(&service);
            pin_mut!(connect);
            let request = tokio::select! {
                res = &mut connect => {
                    res.map_err(|e| unreachable(peer, e))?;
                    None
                }
                request = profile.next() => request,
            };
            let request = match request {
                Some(request) => request,
                None => profile
                    .next()
                    .await
                    .ok_or_else(|| unreachable(peer, "no connect request received"))?,
            };

            let stream = request.accept().map_err(|e| unreachable(peer, e))?;
            Ok::<_, TransportError>((stream, profile))
        };

        let (stream, profile) = self
            .runtime
            .block_on(async { tokio::time::timeout(self.connect_timeout, establish).await })
            .map_err(|_| unreachable(peer, "connect timed out"))??;

        tracing::info!("RFCOMM connection to {} established", peer);

        Ok(Box::new(BluezTransport::new(
            self.runtime.handle().clone(),
            stream,
            self.read_timeout,
            Some(profile),
        )))
    }

    fn listen(&self, service: Uuid, name: &str) -> Result<Box<dyn ServiceListener>, TransportError> {
        let profile = Profile {
            uuid: service,
            name: Some(name.to_string()),
            role: Some(Role::Server),
            require_authentication: Some(false),
            require_authorization: Some(false),
            ..Default::default()
        };
        let profile = self
            .runtime
            .block_on(self.session.register_profile(profile))
            .map_err(bluez_error)?;

        tracing::info!("RFCOMM service '{}' ({}) registered", name, service);

        let (closed, closed_rx) = watch::channel(false);
        let (request_tx, request_rx) = mpsc::channel(1);
        self.runtime.spawn(serve_profile(profile, request_tx, closed_rx));

        Ok(Box::new(BluezListener {
            handle: self.runtime.handle().clone(),
            adapter: self.adapter.clone(),
            requests: AsyncMutex::new(request_rx),
            closed,
            read_timeout: self.read_timeout,
        }))
    }
}

// ============================================================================
// TESTS
// ============================================================================
