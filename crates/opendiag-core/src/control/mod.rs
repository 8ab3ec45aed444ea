//! Bidirectional control: actuator tests, I/O control and routines
//!
//! Every operation that can move hardware first makes sure the module holds
//! the security level the actuator or routine declares, requesting it through
//! the [`SecurityAccessManager`] when missing. While a control session is
//! open a keepalive task sends suppressed TesterPresent so the ECU does not
//! fall back to the default session.

mod actuator;

pub use actuator::{Actuator, ControlCatalog, Routine};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{KeepaliveConfig, SecurityConfig, SessionConfig};
use crate::module::VehicleModule;
use crate::security::{KeyOptions, SecurityAccessManager, SecurityError};
use crate::transport::TransportState;
use crate::uds::{io_control_option, service_id, NegativeResponseCode, UdsClient, UdsError};

#[derive(Debug, Error, Clone)]
pub enum ControlError {
    #[error("No response from module 0x{address:03X} to service 0x{service_id:02X}")]
    NoResponse { address: u32, service_id: u8 },

    #[error("Service 0x{service_id:02X} rejected: {nrc} (0x{nrc:02X})")]
    Rejected {
        service_id: u8,
        nrc: NegativeResponseCode,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Security access required: {0}")]
    Security(#[from] SecurityError),

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    #[error("UDS error: {0}")]
    Uds(UdsError),
}

impl ControlError {
    fn from_uds(err: UdsError, address: u32, service_id: u8) -> Self {
        match err {
            UdsError::NoResponse => Self::NoResponse {
                address,
                service_id,
            },
            UdsError::NegativeResponse { service_id, nrc } => Self::Rejected { service_id, nrc },
            UdsError::Timeout(msg) => Self::Timeout(msg),
            UdsError::InvalidResponse(msg) => Self::InvalidResponse(msg),
            other => Self::Uds(other),
        }
    }

    pub fn nrc(&self) -> Option<NegativeResponseCode> {
        match self {
            Self::Rejected { nrc, .. } => Some(*nrc),
            Self::Security(err) => err.nrc(),
            _ => None,
        }
    }
}

/// Result of an I/O control or routine request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlResponse {
    pub address: u32,
    /// DID or routine id echoed by the ECU
    pub identifier: u16,
    /// Control parameter or routine control type
    pub control: u8,
    /// controlStatusRecord / routineStatusRecord
    pub status: Vec<u8>,
}

/// Gate and execute operations that move physical hardware
pub struct BidirectionalControlService {
    security: Arc<SecurityAccessManager>,
    client: UdsClient,
    keepalive: KeepaliveConfig,
    write_level: u8,
    keepalive_tasks: Mutex<HashMap<u32, JoinHandle<()>>>,
}

impl BidirectionalControlService {
    pub fn new(
        security: Arc<SecurityAccessManager>,
        session: &SessionConfig,
        security_config: &SecurityConfig,
    ) -> Self {
        let client = security.client().clone();
        Self {
            security,
            client,
            keepalive: session.keepalive.clone(),
            write_level: security_config.write_level,
            keepalive_tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn security(&self) -> &Arc<SecurityAccessManager> {
        &self.security
    }

    /// Enter the extended session and start the keepalive
    pub async fn start_session(&self, module: &mut VehicleModule) -> Result<(), ControlError> {
        self.security.switch_to_extended_session(module).await?;
        self.start_keepalive(module.address);
        Ok(())
    }

    /// Stop the keepalive and return to the default session
    pub async fn end_session(&self, module: &mut VehicleModule) -> Result<(), ControlError> {
        self.stop_keepalive(module.address);
        self.security.switch_to_default_session(module).await?;
        Ok(())
    }

    pub fn is_keepalive_running(&self, address: u32) -> bool {
        self.keepalive_tasks
            .lock()
            .get(&address)
            .is_some_and(|task| !task.is_finished())
    }

    /// InputOutputControlByIdentifier for `actuator`
    pub async fn execute_io_control(
        &self,
        module: &mut VehicleModule,
        actuator: &Actuator,
        control_parameter: u8,
        control_state: &[u8],
    ) -> Result<ControlResponse, ControlError> {
        self.ensure_security(module, actuator.security_level).await?;
        let address = module.address;
        info!(
            address = format!("0x{:03X}", address),
            actuator = %actuator.id,
            control_parameter,
            "Executing I/O control"
        );

        let data = self
            .client
            .io_control(address, actuator.did, control_parameter, control_state)
            .await
            .map_err(|e| ControlError::from_uds(e, address, service_id::IO_CONTROL_BY_ID))?;

        let identifier = echoed_identifier(&data, 0, actuator.did)?;
        // The control parameter echo is optional in practice
        let status = match data.get(2) {
            Some(echo) if *echo == control_parameter => data[3..].to_vec(),
            _ => data[2..].to_vec(),
        };
        Ok(ControlResponse {
            address,
            identifier,
            control: control_parameter,
            status,
        })
    }

    /// Hand the output back to the ECU (control parameter 0x00)
    pub async fn return_control_to_ecu(
        &self,
        module: &mut VehicleModule,
        actuator: &Actuator,
    ) -> Result<ControlResponse, ControlError> {
        self.execute_io_control(module, actuator, io_control_option::RETURN_CONTROL_TO_ECU, &[])
            .await
    }

    /// RoutineControl for `routine`
    pub async fn execute_routine(
        &self,
        module: &mut VehicleModule,
        routine: &Routine,
        control_type: u8,
        option_record: &[u8],
    ) -> Result<ControlResponse, ControlError> {
        self.ensure_security(module, routine.security_level).await?;
        let address = module.address;
        info!(
            address = format!("0x{:03X}", address),
            routine = %routine.id,
            control_type,
            "Executing routine"
        );

        let data = self
            .client
            .routine_control(address, control_type, routine.rid, option_record)
            .await
            .map_err(|e| ControlError::from_uds(e, address, service_id::ROUTINE_CONTROL))?;

        if data.first() != Some(&control_type) {
            return Err(ControlError::InvalidResponse(format!(
                "routine control type echo mismatch: [{}]",
                hex::encode_upper(&data)
            )));
        }
        let identifier = echoed_identifier(&data, 1, routine.rid)?;
        Ok(ControlResponse {
            address,
            identifier,
            control: control_type,
            status: data[3..].to_vec(),
        })
    }

    pub async fn read_data_by_identifier(
        &self,
        module: &VehicleModule,
        did: u16,
    ) -> Result<Vec<u8>, ControlError> {
        self.client
            .read_did(module.address, did)
            .await
            .map_err(|e| ControlError::from_uds(e, module.address, service_id::READ_DATA_BY_ID))
    }

    /// WriteDataByIdentifier, after unlocking the configured write level
    pub async fn write_data_by_identifier(
        &self,
        module: &mut VehicleModule,
        did: u16,
        value: &[u8],
    ) -> Result<(), ControlError> {
        self.ensure_security(module, Some(self.write_level)).await?;
        let address = module.address;
        self.client
            .write_data_by_id(address, did, value)
            .await
            .map_err(|e| ControlError::from_uds(e, address, service_id::WRITE_DATA_BY_ID))?;
        info!(
            address = format!("0x{:03X}", address),
            did = format!("0x{:04X}", did),
            len = value.len(),
            "DID written"
        );
        Ok(())
    }

    async fn ensure_security(
        &self,
        module: &mut VehicleModule,
        level: Option<u8>,
    ) -> Result<(), ControlError> {
        let Some(level) = level else {
            return Ok(());
        };
        if self.security.is_unlocked(module.address, level) {
            return Ok(());
        }
        debug!(
            address = format!("0x{:03X}", module.address),
            level, "Unlocking before control request"
        );
        self.security
            .request_security_access(module, level, KeyOptions::default())
            .await?;
        Ok(())
    }

    fn start_keepalive(&self, address: u32) {
        if !self.keepalive.enabled {
            return;
        }
        self.stop_keepalive(address);

        let client = self.client.clone();
        let mut states = client.transport().subscribe_state();
        let interval = Duration::from_millis(self.keepalive.interval_ms);
        let suppress_response = self.keepalive.suppress_response;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = client.tester_present(address, suppress_response).await {
                            warn!(address = format!("0x{:03X}", address), error = %e, "Tester present failed");
                        }
                    }
                    state = states.recv() => match state {
                        Ok(TransportState::Connected) | Err(RecvError::Lagged(_)) => {}
                        Ok(other) => {
                            debug!(address = format!("0x{:03X}", address), state = %other, "Keepalive stopped with link");
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        self.keepalive_tasks.lock().insert(address, handle);
        debug!(
            address = format!("0x{:03X}", address),
            interval_ms = self.keepalive.interval_ms,
            "Keepalive started"
        );
    }

    fn stop_keepalive(&self, address: u32) {
        if let Some(task) = self.keepalive_tasks.lock().remove(&address) {
            task.abort();
            debug!(address = format!("0x{:03X}", address), "Keepalive stopped");
        }
    }
}

impl Drop for BidirectionalControlService {
    fn drop(&mut self) {
        for (_, task) in self.keepalive_tasks.get_mut().drain() {
            task.abort();
        }
    }
}

/// Big-endian identifier echo at `offset`, checked against `expected`
fn echoed_identifier(data: &[u8], offset: usize, expected: u16) -> Result<u16, ControlError> {
    match data.get(offset..offset + 2) {
        Some(&[hi, lo]) if u16::from_be_bytes([hi, lo]) == expected => Ok(expected),
        _ => Err(ControlError::InvalidResponse(format!(
            "expected identifier 0x{:04X} in [{}]",
            expected,
            hex::encode_upper(data)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::security::AlgorithmRegistry;
    use crate::transport::mock::MockTransport;
    use crate::transport::Transport;
    use crate::uds::RequestPolicy;
    use pretty_assertions::assert_eq;

    const ECU: u32 = 0x760;

    async fn setup() -> (Arc<MockTransport>, BidirectionalControlService) {
        let mock = Arc::new(MockTransport::new(&MockConfig::default()));
        mock.add_module(ECU);
        let device = mock.scan(Duration::ZERO).await.unwrap().remove(0);
        mock.connect(&device).await.unwrap();
        let client = UdsClient::new(mock.clone(), RequestPolicy::default());
        let security = Arc::new(SecurityAccessManager::new(
            client,
            AlgorithmRegistry::with_defaults(),
            &SecurityConfig::default(),
        ));
        let service = BidirectionalControlService::new(
            security,
            &SessionConfig::default(),
            &SecurityConfig::default(),
        );
        (mock, service)
    }

    fn keepalives(mock: &MockTransport) -> usize {
        mock.sent()
            .iter()
            .filter(|r| r.oneway && r.data == [0x3E, 0x80])
            .count()
    }

    fn fan() -> Actuator {
        Actuator {
            id: "fan".to_string(),
            name: "Radiator fan".to_string(),
            did: 0x4A10,
            description: None,
            security_level: Some(0x01),
        }
    }

    #[tokio::test]
    async fn test_io_control_unlocks_first() {
        let (mock, service) = setup().await;
        mock.add_response(Some(ECU), vec![0x27, 0x01], vec![0x67, 0x01, 0x12, 0x34]);
        mock.add_response(
            Some(ECU),
            vec![0x2F, 0x4A, 0x10],
            vec![0x6F, 0x4A, 0x10, 0x03, 0x01],
        );
        let mut module = VehicleModule::at(ECU);

        let response = service
            .execute_io_control(&mut module, &fan(), io_control_option::SHORT_TERM_ADJUSTMENT, &[0x01])
            .await
            .unwrap();

        assert_eq!(response.identifier, 0x4A10);
        assert_eq!(response.status, vec![0x01]);
        let services: Vec<u8> = mock.sent().iter().map(|r| r.data[0]).collect();
        assert_eq!(services, vec![0x27, 0x27, 0x2F]);
        assert_eq!(module.security_level, Some(0x01));
    }

    #[tokio::test]
    async fn test_io_control_skips_unlock_when_held() {
        let (mock, service) = setup().await;
        mock.add_response(Some(ECU), vec![0x27, 0x01], vec![0x67, 0x01, 0x00, 0x00]);
        let mut module = VehicleModule::at(ECU);
        service
            .security()
            .request_security_access(&mut module, 0x01, KeyOptions::default())
            .await
            .unwrap();
        mock.clear_sent();

        service.return_control_to_ecu(&mut module, &fan()).await.unwrap();
        assert_eq!(mock.sent().len(), 1);
        assert_eq!(mock.sent()[0].data, vec![0x2F, 0x4A, 0x10, 0x00]);
    }

    #[tokio::test]
    async fn test_negative_response_is_structured() {
        let (mock, service) = setup().await;
        mock.add_response(Some(ECU), vec![0x2F], vec![0x7F, 0x2F, 0x22]);
        let mut module = VehicleModule::at(ECU);
        let actuator = Actuator::for_did(0x4A11);

        let err = service
            .execute_io_control(&mut module, &actuator, 0x03, &[0x01])
            .await
            .unwrap_err();
        assert_eq!(err.nrc(), Some(NegativeResponseCode::ConditionsNotCorrect));
    }

    #[tokio::test]
    async fn test_failed_unlock_blocks_request() {
        let (mock, service) = setup().await;
        mock.add_response(Some(ECU), vec![0x27, 0x01], vec![0x67, 0x01, 0x12, 0x34]);
        mock.add_response(Some(ECU), vec![0x27, 0x02], vec![0x7F, 0x27, 0x35]);
        let mut module = VehicleModule::at(ECU);

        let err = service
            .execute_io_control(&mut module, &fan(), 0x03, &[0x01])
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Security(_)));
        assert!(mock.sent_with_service(ECU, 0x2F).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_routine_waits_through_pending() {
        let (mock, service) = setup().await;
        mock.add_sequence(
            Some(ECU),
            vec![0x31, 0x01, 0xFF, 0x00],
            vec![
                vec![0x7F, 0x31, 0x78],
                vec![0x7F, 0x31, 0x78],
                vec![0x71, 0x01, 0xFF, 0x00, 0x02],
            ],
        );
        let mut module = VehicleModule::at(ECU);

        let response = service
            .execute_routine(&mut module, &Routine::for_rid(0xFF00), 0x01, &[])
            .await
            .unwrap();
        assert_eq!(response.identifier, 0xFF00);
        assert_eq!(response.status, vec![0x02]);
    }

    #[tokio::test]
    async fn test_write_requires_unlock() {
        let (mock, service) = setup().await;
        mock.add_response(Some(ECU), vec![0x27, 0x01], vec![0x67, 0x01, 0x12, 0x34]);
        let mut module = VehicleModule::at(ECU);

        service
            .write_data_by_identifier(&mut module, 0xF190, b"WVW")
            .await
            .unwrap();
        let sids: Vec<u8> = mock.sent().iter().map(|r| r.data[0]).collect();
        assert_eq!(sids, vec![0x27, 0x27, 0x2E]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_runs_until_session_end() {
        let (mock, service) = setup().await;
        let mut module = VehicleModule::at(ECU);

        service.start_session(&mut module).await.unwrap();
        assert!(service.is_keepalive_running(ECU));
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(keepalives(&mock), 2);

        service.end_session(&mut module).await.unwrap();
        assert!(!service.is_keepalive_running(ECU));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(keepalives(&mock), 2);
        assert_eq!(mock.sent_with_service(ECU, 0x10).last().unwrap(), &vec![0x10, 0x01]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_stops_when_link_drops() {
        let (mock, service) = setup().await;
        let mut module = VehicleModule::at(ECU);

        service.start_session(&mut module).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(keepalives(&mock), 1);

        mock.simulate_link_loss();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!service.is_keepalive_running(ECU));
        assert_eq!(keepalives(&mock), 1);
    }
}
