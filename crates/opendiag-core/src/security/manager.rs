//! Per-module security unlock and session bookkeeping

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AlgorithmRegistry, KeyAlgorithm, SecurityError, SecurityStage};
use crate::config::SecurityConfig;
use crate::module::{DiagnosticSession, VehicleModule};
use crate::transport::TransportState;
use crate::uds::UdsClient;

/// Where the key comes from; the first one set wins
#[derive(Debug, Clone, Default)]
pub struct KeyOptions {
    pub manual_key: Option<Vec<u8>>,
    pub algorithm: Option<Arc<dyn KeyAlgorithm>>,
    /// Registry id; the configured default when `None`
    pub algorithm_id: Option<String>,
}

impl KeyOptions {
    pub fn manual(key: impl Into<Vec<u8>>) -> Self {
        Self {
            manual_key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn algorithm(algorithm: Arc<dyn KeyAlgorithm>) -> Self {
        Self {
            algorithm: Some(algorithm),
            ..Self::default()
        }
    }

    pub fn registered(id: impl Into<String>) -> Self {
        Self {
            algorithm_id: Some(id.into()),
            ..Self::default()
        }
    }
}

/// Successful handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityAccessOutcome {
    pub address: u32,
    pub level: u8,
    pub seed: Vec<u8>,
    /// Empty when no key had to be sent
    pub key: Vec<u8>,
    pub message: String,
}

/// Seed-key handshake, unlock table and session transitions
///
/// The unlock table only ever records levels the ECU actually granted, and a
/// module's entry is dropped whenever its session changes.
pub struct SecurityAccessManager {
    client: UdsClient,
    registry: AlgorithmRegistry,
    default_algorithm: String,
    unlocked: RwLock<HashMap<u32, u8>>,
    sessions: RwLock<HashMap<u32, DiagnosticSession>>,
}

impl SecurityAccessManager {
    pub fn new(client: UdsClient, registry: AlgorithmRegistry, config: &SecurityConfig) -> Self {
        Self {
            client,
            registry,
            default_algorithm: config.algorithm.clone(),
            unlocked: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &UdsClient {
        &self.client
    }

    pub fn registry(&self) -> &AlgorithmRegistry {
        &self.registry
    }

    /// Whether `address` holds `level` or higher
    pub fn is_unlocked(&self, address: u32, level: u8) -> bool {
        self.unlocked
            .read()
            .get(&address)
            .is_some_and(|granted| *granted >= level)
    }

    pub fn unlocked_level(&self, address: u32) -> Option<u8> {
        self.unlocked.read().get(&address).copied()
    }

    pub fn session(&self, address: u32) -> DiagnosticSession {
        self.sessions
            .read()
            .get(&address)
            .copied()
            .unwrap_or_default()
    }

    /// Copy tracked session and unlock state into `module`
    pub fn sync(&self, module: &mut VehicleModule) {
        module.session = self.session(module.address);
        module.security_level = self.unlocked_level(module.address);
    }

    /// Seed-key handshake at `level` (odd requestSeed sub-function)
    ///
    /// An all-zero seed means the ECU is already unlocked; no key is sent.
    pub async fn request_security_access(
        &self,
        module: &mut VehicleModule,
        level: u8,
        options: KeyOptions,
    ) -> Result<SecurityAccessOutcome, SecurityError> {
        let address = module.address;
        debug!(address = format!("0x{:03X}", address), level, "Requesting seed");

        let seed = self
            .client
            .security_access_request_seed(address, level)
            .await
            .map_err(|e| SecurityError::from_uds(e, SecurityStage::RequestSeed, address, &[], &[]))?;

        if seed.is_empty() {
            warn!(address = format!("0x{:03X}", address), level, "Seed response carried no seed");
            return Err(SecurityError::InvalidSeed(format!(
                "module 0x{:03X} returned an empty seed for level 0x{:02X}",
                address, level
            )));
        }

        if seed.iter().all(|b| *b == 0) {
            self.grant(address, level);
            self.sync(module);
            info!(
                address = format!("0x{:03X}", address),
                level, "Zero seed, module already unlocked"
            );
            return Ok(SecurityAccessOutcome {
                address,
                level,
                seed,
                key: Vec::new(),
                message: format!("Level 0x{:02X} already unlocked (zero seed)", level),
            });
        }

        let key = self.compute_key(&seed, level, options)?;
        self.client
            .security_access_send_key(address, level, &key)
            .await
            .map_err(|e| SecurityError::from_uds(e, SecurityStage::SendKey, address, &seed, &key))?;

        self.grant(address, level);
        self.sync(module);
        info!(
            address = format!("0x{:03X}", address),
            level, "Security access granted"
        );
        Ok(SecurityAccessOutcome {
            address,
            level,
            seed,
            key,
            message: format!("Level 0x{:02X} unlocked", level),
        })
    }

    fn compute_key(
        &self,
        seed: &[u8],
        level: u8,
        options: KeyOptions,
    ) -> Result<Vec<u8>, SecurityError> {
        if let Some(key) = options.manual_key {
            return Ok(key);
        }
        let algorithm = match options.algorithm {
            Some(algorithm) => algorithm,
            None => {
                let id = options.algorithm_id.unwrap_or_else(|| self.default_algorithm.clone());
                self.registry
                    .get(&id)
                    .ok_or_else(|| SecurityError::NoAlgorithm(format!("'{}' is not registered", id)))?
            }
        };
        debug!(algorithm = algorithm.name(), "Computing key");
        algorithm.compute_key(seed, level)
    }

    fn grant(&self, address: u32, level: u8) {
        let mut table = self.unlocked.write();
        let entry = table.entry(address).or_insert(level);
        *entry = (*entry).max(level);
    }

    /// DiagnosticSessionControl to `target`
    ///
    /// A non-default session the module is already in is left alone so its
    /// unlock survives. Any transition that is sent clears the module's unlock.
    pub async fn switch_session(
        &self,
        module: &mut VehicleModule,
        target: DiagnosticSession,
    ) -> Result<(), SecurityError> {
        let address = module.address;
        if target != DiagnosticSession::Default && self.session(address) == target {
            debug!(
                address = format!("0x{:03X}", address),
                session = %target,
                "Already in requested session"
            );
            self.sync(module);
            return Ok(());
        }

        let result = self
            .client
            .diagnostic_session_control(address, target.session_type())
            .await;
        // The ECU drops security on every session change, and after a failed
        // one we can no longer tell which session it is in.
        self.unlocked.write().remove(&address);
        match result {
            Ok(_) => {
                self.sessions.write().insert(address, target);
                self.sync(module);
                info!(
                    address = format!("0x{:03X}", address),
                    session = %target,
                    "Session changed (security re-locked)"
                );
                Ok(())
            }
            Err(e) => {
                self.sync(module);
                Err(SecurityError::from_uds(
                    e,
                    SecurityStage::SessionControl,
                    address,
                    &[],
                    &[],
                ))
            }
        }
    }

    pub async fn switch_to_extended_session(
        &self,
        module: &mut VehicleModule,
    ) -> Result<(), SecurityError> {
        self.switch_session(module, DiagnosticSession::Extended).await
    }

    pub async fn switch_to_default_session(
        &self,
        module: &mut VehicleModule,
    ) -> Result<(), SecurityError> {
        self.switch_session(module, DiagnosticSession::Default).await
    }

    /// Suppressed-response TesterPresent, fire and forget
    pub async fn send_tester_present(&self, address: u32) -> Result<(), SecurityError> {
        self.client
            .tester_present(address, true)
            .await
            .map_err(SecurityError::Uds)
    }

    /// Forget all session and unlock state
    pub fn on_disconnect(&self) {
        let cleared = {
            let mut table = self.unlocked.write();
            let n = table.len();
            table.clear();
            n
        };
        self.sessions.write().clear();
        if cleared > 0 {
            info!(modules = cleared, "Link lost, security state cleared");
        }
    }

    /// Clear all state whenever the transport drops its link
    pub fn spawn_disconnect_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let mut states = self.client.transport().subscribe_state();
        tokio::spawn(async move {
            loop {
                match states.recv().await {
                    Ok(TransportState::Disconnected) => match manager.upgrade() {
                        Some(manager) => manager.on_disconnect(),
                        None => break,
                    },
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed transport state updates");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
