//! Geräte-Suche als endliche, neu startbare Sequenz
//!
//! `Discovery` startet die Suche am Adapter und liefert gefundene Geräte als
//! `Iterator`. Nach Ablauf des Zeitfensters, bei `cancel()` oder beim Drop wird
//! die Suche am Adapter abgebrochen. Für eine neue Suche einfach erneut starten.

use super::{PeerIdentity, Radio, TransportError};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Discovery {
    radio: Arc<dyn Radio>,
    found: Receiver<PeerIdentity>,
    deadline: Instant,
    seen: HashSet<String>,
    finished: bool,
}

impl Discovery {
    pub(crate) fn start(radio: Arc<dyn Radio>, timeout: Duration) -> Result<Self, TransportError> {
        if !radio.is_enabled() {
            return Err(TransportError::AdapterDisabled);
        }
        if radio.is_discovering() {
            radio.cancel_discovery();
        }

        let (tx, found) = crossbeam_channel::unbounded();
        radio.start_discovery(tx)?;
        tracing::info!("Scanning for devices ({}s)", timeout.as_secs());

        Ok(Self {
            radio,
            found,
            deadline: Instant::now() + timeout,
            seen: HashSet::new(),
            finished: false,
        })
    }

    /// Bricht die Suche vorzeitig ab
    pub fn cancel(&mut self) {
        if !self.finished {
            self.finished = true;
            self.radio.cancel_discovery();
            tracing::info!("Scan complete ({} device(s))", self.seen.len());
        }
    }
}

impl Iterator for Discovery {
    type Item = PeerIdentity;

    fn next(&mut self) -> Option<PeerIdentity> {
        while !self.finished {
            match self.found.recv_deadline(self.deadline) {
                Ok(peer) => {
                    if self.seen.insert(peer.address.clone()) {
                        tracing::debug!("Found device {}", peer);
                        return Some(peer);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    self.cancel();
                }
            }
        }
        None
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.cancel();
    }
}
