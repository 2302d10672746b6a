//! bluecall - Punkt-zu-Punkt Sprachanrufe
//!
//! Zwei Geräte telefonieren über einen einzigen verbundenen Byte-Stream
//! (Bluetooth RFCOMM oder TCP), ohne Server und ohne Codec:
//! - Transport: Stream, Listener, Funkadapter, Geräte-Suche
//! - Call Engine: Zustandsmaschine, Audio-Duplex, Session-Controller
//! - Database: SQLite-Anrufliste
//! - Config: Umgebungsvariablen

pub mod call_engine;
pub mod config;
pub mod database;
pub mod transport;

use call_engine::{AudioDevices, CallSessionController};
use config::{Backend, CallConfig, ConfigError};
use database::{CallHistoryDatabase, CallHistoryStore, DatabaseError};
use std::sync::Arc;
use thiserror::Error;
use transport::{PeerIdentity, Radio, TcpRadio, TransportError};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Radio error: {0}")]
    Radio(#[from] TransportError),

    #[error("Backend '{0}' is not available in this build")]
    BackendUnavailable(Backend),
}

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging (einmalig; weitere Aufrufe sind wirkungslos)
///
/// Filter kommt aus `RUST_LOG`, Standard ist `bluecall=info`. Ausgabe geht
/// nach stderr, damit stdout für Status-Meldungen frei bleibt.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bluecall=info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Verdrahtet Adapter, Audio-Geräte, Anrufliste und Controller
pub struct AppState {
    config: CallConfig,
    controller: CallSessionController,
}

impl AppState {
    /// Initialisiert den Application State
    pub fn init(config: CallConfig) -> Result<Self, AppError> {
        tracing::info!("Initializing bluecall ({} backend)...", config.backend);

        let radio = open_radio(&config)?;
        if !radio.is_enabled() {
            tracing::warn!("Radio adapter is disabled");
        }

        let history: Arc<dyn CallHistoryStore> = Arc::new(match &config.db_path {
            Some(path) => CallHistoryDatabase::open(path)?,
            None => CallHistoryDatabase::open_default()?,
        });
        tracing::info!("Database opened");

        let controller =
            CallSessionController::new(radio, open_audio(), history, config.max_call_duration);

        Ok(Self { config, controller })
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn controller(&self) -> &CallSessionController {
        &self.controller
    }

    /// Baut die Gegenstelle für einen Anruf
    ///
    /// Ohne expliziten Namen wird der Name eines gekoppelten Geräts mit
    /// derselben Adresse übernommen, sonst gilt die Adresse als Name.
    pub fn resolve_peer(&self, address: &str, name: Option<String>) -> PeerIdentity {
        if let Some(name) = name {
            return PeerIdentity::new(name, address);
        }

        match self.controller.paired_devices() {
            Ok(paired) => paired
                .into_iter()
                .find(|p| p.address.eq_ignore_ascii_case(address))
                .unwrap_or_else(|| PeerIdentity::new(address, address)),
            Err(e) => {
                tracing::debug!("Could not read paired devices: {}", e);
                PeerIdentity::new(address, address)
            }
        }
    }
}

fn open_radio(config: &CallConfig) -> Result<Arc<dyn Radio>, AppError> {
    match config.backend {
        Backend::Tcp => Ok(Arc::new(TcpRadio::new(config.tcp_radio_config()))),
        #[cfg(feature = "bluez")]
        Backend::Bluez => Ok(Arc::new(transport::BluezRadio::new(
            config.connect_timeout,
            config.read_timeout,
        )?)),
        #[cfg(not(feature = "bluez"))]
        Backend::Bluez => Err(AppError::BackendUnavailable(Backend::Bluez)),
    }
}

#[cfg(feature = "audio-device")]
fn open_audio() -> Arc<dyn AudioDevices> {
    Arc::new(call_engine::CpalAudioDevices)
}

#[cfg(not(feature = "audio-device"))]
fn open_audio() -> Arc<dyn AudioDevices> {
    tracing::warn!("Built without audio-device support; calls cannot open audio");
    Arc::new(call_engine::NoAudioDevices)
}

// ============================================================================
// TESTS
// ============================================================================
