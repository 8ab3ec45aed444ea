//! Per-transport connection state cell and broadcast streams

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{DeviceClass, DeviceDescriptor, RawChunk, TransportError, TransportState};

/// Holds the current [`TransportState`] and fans out transitions and inbound bytes
pub struct LinkState {
    label: &'static str,
    state: RwLock<TransportState>,
    state_tx: broadcast::Sender<TransportState>,
    raw_tx: broadcast::Sender<RawChunk>,
}

impl LinkState {
    pub fn new(label: &'static str) -> Self {
        let (state_tx, _) = broadcast::channel(32);
        let (raw_tx, _) = broadcast::channel(256);
        Self {
            label,
            state: RwLock::new(TransportState::Disconnected),
            state_tx,
            raw_tx,
        }
    }

    pub fn get(&self) -> TransportState {
        *self.state.read()
    }

    /// Move to `next`, broadcasting only real transitions
    pub fn set(&self, next: TransportState) {
        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, next)
        };
        if previous != next {
            info!(transport = self.label, from = %previous, to = %next, "Transport state changed");
            let _ = self.state_tx.send(next);
        }
    }

    /// Record a failed attempt: `error` is always followed by `disconnected`
    pub fn fail(&self) {
        self.set(TransportState::Error);
        self.set(TransportState::Disconnected);
    }

    pub fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.get() == TransportState::Connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<TransportState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_raw(&self) -> broadcast::Receiver<RawChunk> {
        self.raw_tx.subscribe()
    }

    /// Publish an inbound chunk for observers; nobody listening is fine
    pub fn publish_inbound(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let _ = self.raw_tx.send(RawChunk {
            timestamp: Instant::now(),
            data: data.to_vec(),
        });
    }
}

/// Open a TCP stream with a bounded connect time
pub async fn connect_tcp(endpoint: &str, timeout: Duration) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| TransportError::Timeout(format!("connecting to {}", endpoint)))?
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", endpoint, e)))?;
    stream
        .set_nodelay(true)
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    Ok(stream)
}

/// Probe candidate endpoints and describe the ones that accept a connection
pub async fn probe_endpoints(
    endpoints: &[String],
    timeout: Duration,
    class: DeviceClass,
    name: &str,
) -> Vec<DeviceDescriptor> {
    let mut found = Vec::new();
    for endpoint in endpoints {
        match connect_tcp(endpoint, timeout).await {
            Ok(stream) => {
                drop(stream);
                debug!(%endpoint, "Endpoint reachable");
                found.push(DeviceDescriptor {
                    id: endpoint.clone(),
                    name: name.to_string(),
                    class,
                    signal_quality: None,
                    description: format!("{} at {}", name, endpoint),
                });
            }
            Err(e) => debug!(%endpoint, error = %e, "Endpoint not reachable"),
        }
    }
    found
}
