//! opendiag-core - vehicle diagnostics over ELM327 and Autel VCI adapters
//!
//! Discovers ECUs, reads and clears trouble codes, unlocks protected
//! services with seed-key security access and drives actuators and
//! routines over UDS (ISO 14229).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │   ModuleScanner        BidirectionalControlService            │
//! │   (probe, DTCs)        (IO control, routines, keepalive)      │
//! │         │                        │                            │
//! │         │              SecurityAccessManager                  │
//! │         │              (sessions, seed/key, unlock table)     │
//! │         └──────────┬─────────────┘                            │
//! │                UdsClient                                      │
//! │       (pending/busy retry, service helpers)                   │
//! │                    │                                          │
//! │            dyn Transport                                      │
//! │   ┌────────────────┼──────────────────┐                      │
//! │ Elm327Transport  AutelTransport   MockTransport               │
//! │ (AT text, TCP)   (CRC32 frames,   (scripted)                  │
//! │                   PassThru, TCP)                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod control;
pub mod error;
pub mod module;
pub mod scanner;
pub mod security;
pub mod transport;
pub mod uds;

pub use config::{ConfigError, OpenDiagConfig};
pub use control::{
    Actuator, BidirectionalControlService, ControlCatalog, ControlError, ControlResponse, Routine,
};
pub use error::{DiagError, ErrorKind};
pub use module::{builtin_catalog, CatalogEntry, DiagnosticSession, ModuleCategory, VehicleModule};
pub use scanner::{ModuleScanner, ScanCancel, ScanError, ScanProgress, ScanReport, ScanState};
pub use security::{
    AlgorithmRegistry, KeyAlgorithm, KeyOptions, SecurityAccessManager, SecurityAccessOutcome,
    SecurityError,
};
pub use transport::{create_transport, DeviceDescriptor, Transport, TransportError, TransportState};
pub use uds::{Dtc, NegativeResponseCode, UdsClient, UdsError, UdsResponse};
