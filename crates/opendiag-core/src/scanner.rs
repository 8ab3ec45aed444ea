//! ECU discovery over a catalog of diagnostic addresses
//!
//! ```text
//! Idle ──scan()──▶ Scanning ──▶ Probing(addr) ──▶ … ──▶ Idle
//!                                   │
//!                                   └─ link lost ──▶ Error
//! ```
//!
//! Every address gets one probe; silence or a timeout skips it. Responders
//! become [`VehicleModule`]s and get their DTCs read one module at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ProbeKind, ScannerConfig, SessionConfig};
use crate::module::{builtin_catalog, CatalogEntry, VehicleModule};
use crate::transport::{Transport, TransportError};
use crate::uds::{dtc_group, service_id, standard_did, RequestPolicy, UdsClient, UdsError};

/// Share of the progress bar spent probing; the rest covers DTC reads
const PROBE_SHARE: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "address", rename_all = "lowercase")]
pub enum ScanState {
    Idle,
    Scanning,
    Probing(u32),
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanProgress {
    /// 0.0 ..= 1.0
    pub fraction: f32,
    pub status: String,
    pub address: Option<u32>,
    pub found: usize,
}

impl Default for ScanProgress {
    fn default() -> Self {
        Self {
            fraction: 0.0,
            status: "Idle".to_string(),
            address: None,
            found: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub modules: Vec<VehicleModule>,
    pub probed: usize,
    pub cancelled: bool,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("A scan is already running")]
    AlreadyRunning,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Cancels a running scan between probes
#[derive(Debug, Clone)]
pub struct ScanCancel(Arc<AtomicBool>);

impl ScanCancel {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct ModuleScanner {
    probe_client: UdsClient,
    client: UdsClient,
    catalog: Vec<CatalogEntry>,
    probe: ProbeKind,
    dtc_status_mask: u8,
    cancel: Arc<AtomicBool>,
    state: Mutex<ScanState>,
    progress: watch::Sender<ScanProgress>,
}

impl ModuleScanner {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &ScannerConfig,
        session: &SessionConfig,
    ) -> Result<Self, ConfigError> {
        let catalog = if config.modules.is_empty() {
            builtin_catalog()
        } else {
            config
                .modules
                .iter()
                .map(CatalogEntry::from_config)
                .collect::<Result<_, _>>()?
        };
        let policy = RequestPolicy::from_config(session);
        let probe_timeout = Duration::from_millis(config.probe_timeout_ms);
        let probe_policy = RequestPolicy {
            timeout: probe_timeout,
            pending_timeout: probe_timeout.max(policy.pending_timeout),
            busy_retry_limit: 0,
            ..policy
        };
        let (progress, _) = watch::channel(ScanProgress::default());

        Ok(Self {
            probe_client: UdsClient::new(transport.clone(), probe_policy),
            client: UdsClient::new(transport, policy),
            catalog,
            probe: config.probe,
            dtc_status_mask: config.dtc_status_mask,
            cancel: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(ScanState::Idle),
            progress,
        })
    }

    pub fn catalog(&self) -> &[CatalogEntry] {
        &self.catalog
    }

    pub fn state(&self) -> ScanState {
        *self.state.lock()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<ScanProgress> {
        self.progress.subscribe()
    }

    pub fn cancel_handle(&self) -> ScanCancel {
        ScanCancel(self.cancel.clone())
    }

    fn set_state(&self, state: ScanState) {
        *self.state.lock() = state;
    }

    fn report(&self, fraction: f32, status: String, address: Option<u32>, found: usize) {
        self.progress.send_replace(ScanProgress {
            fraction,
            status,
            address,
            found,
        });
    }

    fn probe_request(&self) -> Vec<u8> {
        match self.probe {
            ProbeKind::TesterPresent => vec![service_id::TESTER_PRESENT, 0x00],
            ProbeKind::ReadDid => {
                let [hi, lo] = standard_did::ACTIVE_DIAGNOSTIC_SESSION.to_be_bytes();
                vec![service_id::READ_DATA_BY_ID, hi, lo]
            }
        }
    }

    /// Probe every catalog address, then read DTCs from each responder
    pub async fn scan(&self) -> Result<ScanReport, ScanError> {
        {
            let mut state = self.state.lock();
            if matches!(*state, ScanState::Scanning | ScanState::Probing(_)) {
                return Err(ScanError::AlreadyRunning);
            }
            *state = ScanState::Scanning;
        }
        self.cancel.store(false, Ordering::SeqCst);

        match self.run().await {
            Ok(report) => {
                self.set_state(ScanState::Idle);
                Ok(report)
            }
            Err(e) => {
                self.set_state(ScanState::Error);
                self.report(0.0, format!("Scan failed: {}", e), None, 0);
                Err(e)
            }
        }
    }

    async fn run(&self) -> Result<ScanReport, ScanError> {
        if !self.client.transport().is_connected() {
            return Err(ScanError::Transport(TransportError::NotConnected));
        }

        let total = self.catalog.len().max(1) as f32;
        let request = self.probe_request();
        let mut modules = Vec::new();
        let mut probed = 0;
        let mut cancelled = false;

        info!(addresses = self.catalog.len(), "Module scan started");
        for entry in &self.catalog {
            if self.cancel.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }
            self.set_state(ScanState::Probing(entry.address));

            let occupied = self.probe_address(entry.address, &request).await?;
            probed += 1;
            if occupied {
                debug!(address = format!("0x{:03X}", entry.address), name = %entry.name, "Module responded");
                modules.push(VehicleModule::new(entry.clone()));
            }
            self.set_state(ScanState::Scanning);
            self.report(
                probed as f32 / total * PROBE_SHARE,
                format!(
                    "{} 0x{:03X} {}",
                    if occupied { "Found" } else { "No answer from" },
                    entry.address,
                    entry.name
                ),
                Some(entry.address),
                modules.len(),
            );
        }

        if cancelled {
            info!(probed, found = modules.len(), "Module scan cancelled");
            self.report(
                probed as f32 / total * PROBE_SHARE,
                "Scan cancelled".to_string(),
                None,
                modules.len(),
            );
            return Ok(ScanReport {
                modules,
                probed,
                cancelled,
            });
        }

        let found = modules.len();
        for (i, module) in modules.iter_mut().enumerate() {
            self.report(
                PROBE_SHARE + (1.0 - PROBE_SHARE) * i as f32 / found as f32,
                format!("Reading DTCs from {}", module),
                Some(module.address),
                found,
            );
            if let Err(e) = self.read_module_dtcs(module).await {
                if let UdsError::Transport(err) = &e {
                    if err.is_connection() {
                        return Err(ScanError::Transport(err.clone()));
                    }
                }
                warn!(address = format!("0x{:03X}", module.address), error = %e, "DTC read failed");
            }
        }

        info!(probed, found, "Module scan complete");
        self.report(1.0, format!("Scan complete: {} modules", found), None, found);
        Ok(ScanReport {
            modules,
            probed,
            cancelled,
        })
    }

    /// Whether anything answered at `address`; connection loss aborts
    async fn probe_address(&self, address: u32, request: &[u8]) -> Result<bool, ScanError> {
        match self.probe_client.request(address, request).await {
            Ok(_) => Ok(true),
            Err(UdsError::NoResponse) | Err(UdsError::Timeout(_)) => Ok(false),
            Err(UdsError::Transport(e)) if e.is_connection() => Err(ScanError::Transport(e)),
            Err(UdsError::Transport(e)) => {
                debug!(address = format!("0x{:03X}", address), error = %e, "Probe failed");
                Ok(false)
            }
            // Something answered, just not with what we asked for
            Err(e) => {
                debug!(address = format!("0x{:03X}", address), error = %e, "Unexpected probe answer");
                Ok(true)
            }
        }
    }

    /// ReadDTCInformation by status mask against this module only
    pub async fn read_module_dtcs(&self, module: &mut VehicleModule) -> Result<(), UdsError> {
        let dtcs = self.client.read_dtcs(module.address, self.dtc_status_mask).await?;
        debug!(address = format!("0x{:03X}", module.address), count = dtcs.len(), "DTCs read");
        module.set_dtcs(dtcs);
        Ok(())
    }

    /// ClearDiagnosticInformation for all groups on one module
    pub async fn clear_dtcs(&self, module: &mut VehicleModule) -> Result<(), UdsError> {
        self.client.clear_dtcs(module.address, dtc_group::ALL).await?;
        info!(address = format!("0x{:03X}", module.address), "DTCs cleared");
        module.set_dtcs(Vec::new());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MockConfig, ModuleConfig};
    use crate::module::ModuleCategory;
    use crate::transport::mock::MockTransport;
    use pretty_assertions::assert_eq;

    async fn demo(latency_ms: u64) -> Arc<MockTransport> {
        let mock = Arc::new(MockTransport::with_demo_vehicle(&MockConfig { latency_ms }));
        let device = mock.scan(Duration::ZERO).await.unwrap().remove(0);
        mock.connect(&device).await.unwrap();
        mock
    }

    fn scanner(mock: &Arc<MockTransport>) -> ModuleScanner {
        ModuleScanner::new(mock.clone(), &ScannerConfig::default(), &SessionConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_scan_finds_responders_and_reads_dtcs() {
        let mock = demo(0).await;
        let scanner = scanner(&mock);
        let progress = scanner.subscribe_progress();

        let report = scanner.scan().await.unwrap();

        let addresses: Vec<u32> = report.modules.iter().map(|m| m.address).collect();
        assert_eq!(addresses, vec![0x7E0, 0x7E1, 0x760, 0x726]);
        assert_eq!(report.probed, scanner.catalog().len());
        assert!(!report.cancelled);

        let ecm = &report.modules[0];
        assert_eq!(ecm.category, ModuleCategory::Powertrain);
        assert_eq!(ecm.dtc_count, 2);
        assert_eq!(ecm.dtcs[0].code, "P0123");

        // DTC requests go to responders only
        let dtc_targets: Vec<u32> = mock
            .sent()
            .iter()
            .filter(|r| r.data.first() == Some(&0x19))
            .map(|r| r.address)
            .collect();
        assert_eq!(dtc_targets, addresses);

        let last = progress.borrow().clone();
        assert_eq!(last.fraction, 1.0);
        assert_eq!(last.found, 4);
        assert_eq!(scanner.state(), ScanState::Idle);
    }

    #[tokio::test]
    async fn test_custom_catalog_and_read_did_probe() {
        let mock = demo(0).await;
        let config = ScannerConfig {
            probe: ProbeKind::ReadDid,
            modules: vec![
                ModuleConfig {
                    address: "0x760".to_string(),
                    name: "ABS".to_string(),
                    category: ModuleCategory::Chassis,
                },
                ModuleConfig {
                    address: "0x7E5".to_string(),
                    name: "Nothing".to_string(),
                    category: ModuleCategory::Unknown,
                },
            ],
            ..ScannerConfig::default()
        };
        let scanner = ModuleScanner::new(mock.clone(), &config, &SessionConfig::default()).unwrap();

        let report = scanner.scan().await.unwrap();
        assert_eq!(report.modules.len(), 1);
        assert_eq!(report.modules[0].name, "ABS");
        assert_eq!(mock.sent()[0].data, vec![0x22, 0xF1, 0x86]);
    }

    #[tokio::test]
    async fn test_negative_probe_answer_counts_as_present() {
        let mock = demo(0).await;
        mock.add_module(0x737);
        mock.add_response(Some(0x737), vec![0x3E, 0x00], vec![0x7F, 0x3E, 0x7F]);
        let report = scanner(&mock).scan().await.unwrap();
        assert!(report.modules.iter().any(|m| m.address == 0x737));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_between_probes() {
        let mock = demo(50).await;
        let scanner = Arc::new(scanner(&mock));
        let cancel = scanner.cancel_handle();

        let task = tokio::spawn({
            let scanner = scanner.clone();
            async move { scanner.scan().await }
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();

        let report = task.await.unwrap().unwrap();
        assert!(report.cancelled);
        assert!(report.probed < scanner.catalog().len());
        assert!(mock.sent_with_service(0x7E0, 0x19).is_empty());
    }

    #[tokio::test]
    async fn test_link_loss_aborts_scan() {
        let mock = demo(0).await;
        mock.simulate_link_loss();
        let scanner = scanner(&mock);
        let err = scanner.scan().await.unwrap_err();
        assert!(matches!(err, ScanError::Transport(TransportError::NotConnected)));
        assert_eq!(scanner.state(), ScanState::Error);
    }

    #[tokio::test]
    async fn test_clear_dtcs() {
        let mock = demo(0).await;
        let scanner = scanner(&mock);
        let mut module = VehicleModule::at(0x7E0);
        scanner.read_module_dtcs(&mut module).await.unwrap();
        assert_eq!(module.dtc_count, 2);

        scanner.clear_dtcs(&mut module).await.unwrap();
        assert_eq!(module.dtc_count, 0);
        assert_eq!(
            mock.sent_with_service(0x7E0, 0x14),
            vec![vec![0x14, 0xFF, 0xFF, 0xFF]]
        );
    }
}
