//! Diagnostic engine configuration
//!
//! Loaded from TOML. Every field has a default so an empty file (or no file)
//! yields a working mock setup.
//!
//! ```toml
//! [transport]
//! type = "elm327"
//! endpoints = ["192.168.0.10:35000"]
//!
//! [session.keepalive]
//! interval_ms = 2000
//!
//! [[actuators]]
//! id = "fan"
//! name = "Radiator fan"
//! did = "0x4A10"
//! security_level = 1
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::module::ModuleCategory;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenDiagConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub actuators: Vec<ActuatorConfig>,
    #[serde(default)]
    pub routines: Vec<RoutineConfig>,
}

impl OpenDiagConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }
}

/// Parse a hex identifier such as `"0xF190"`, `"7E0"` or `"0x18DA10F1"`
pub fn parse_hex_u32(field: &'static str, value: &str) -> Result<u32, ConfigError> {
    let cleaned = value
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u32::from_str_radix(cleaned, 16).map_err(|_| ConfigError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

/// Like [`parse_hex_u32`] but bounded to 16 bits (DIDs, routine ids)
pub fn parse_hex_u16(field: &'static str, value: &str) -> Result<u16, ConfigError> {
    let wide = parse_hex_u32(field, value)?;
    u16::try_from(wide).map_err(|_| ConfigError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Transport selection, fixed for the lifetime of a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// ELM327-compatible adapter reached over a byte stream
    Elm327(Elm327Config),
    /// Autel VCI speaking its proprietary packet protocol
    Autel(AutelConfig),
    /// Scripted transport for tests and demos
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

/// ELM327 adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Elm327Config {
    /// Candidate endpoints probed by a device scan (`host:port`)
    #[serde(default = "default_elm_endpoints")]
    pub endpoints: Vec<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Timeout for a single AT command during initialisation
    #[serde(default = "default_init_timeout")]
    pub init_timeout_ms: u64,
    /// Commands sent after the link comes up; failures are tolerated
    #[serde(default = "default_init_commands")]
    pub init_commands: Vec<String>,
}

impl Default for Elm327Config {
    fn default() -> Self {
        Self {
            endpoints: default_elm_endpoints(),
            connect_timeout_ms: default_connect_timeout(),
            init_timeout_ms: default_init_timeout(),
            init_commands: default_init_commands(),
        }
    }
}

fn default_elm_endpoints() -> Vec<String> {
    vec!["192.168.0.10:35000".to_string()]
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_init_timeout() -> u64 {
    1500
}

fn default_init_commands() -> Vec<String> {
    ["ATZ", "ATE0", "ATL0", "ATS0", "ATH0", "ATSP0"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Autel VCI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutelConfig {
    /// Candidate endpoints of the RFCOMM bridge (`host:port`)
    #[serde(default = "default_autel_endpoints")]
    pub endpoints: Vec<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Timeout for a single frame exchange
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_ms: u64,
    /// Verify the CRC-32 trailer of received frames
    #[serde(default = "default_true")]
    pub verify_crc: bool,
    /// How far the parser searches for a frame marker before discarding
    #[serde(default = "default_resync_window")]
    pub resync_window: usize,
    /// ISO 15765 bit rates tried in order when opening a channel
    #[serde(default = "default_bit_rates")]
    pub bit_rates: Vec<u32>,
}

impl Default for AutelConfig {
    fn default() -> Self {
        Self {
            endpoints: default_autel_endpoints(),
            connect_timeout_ms: default_connect_timeout(),
            frame_timeout_ms: default_frame_timeout(),
            verify_crc: default_true(),
            resync_window: default_resync_window(),
            bit_rates: default_bit_rates(),
        }
    }
}

fn default_autel_endpoints() -> Vec<String> {
    vec!["127.0.0.1:6790".to_string()]
}

fn default_frame_timeout() -> u64 {
    3000
}

fn default_resync_window() -> usize {
    4096
}

fn default_bit_rates() -> Vec<u32> {
    vec![500_000, 250_000]
}

/// Mock transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
}

// =============================================================================
// Session Configuration
// =============================================================================

/// Request timing and keepalive behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Timeout for one request/response exchange
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Overall deadline while an ECU keeps answering "response pending"
    #[serde(default = "default_pending_timeout")]
    pub pending_timeout_ms: u64,
    /// Delay before listening again after "response pending"
    #[serde(default = "default_pending_poll")]
    pub pending_poll_ms: u64,
    /// Resends allowed after "busy, repeat request"
    #[serde(default = "default_busy_retries")]
    pub busy_retry_limit: u32,
    #[serde(default = "default_busy_delay")]
    pub busy_retry_delay_ms: u64,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            pending_timeout_ms: default_pending_timeout(),
            pending_poll_ms: default_pending_poll(),
            busy_retry_limit: default_busy_retries(),
            busy_retry_delay_ms: default_busy_delay(),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

fn default_request_timeout() -> u64 {
    2000
}

fn default_pending_timeout() -> u64 {
    10000
}

fn default_pending_poll() -> u64 {
    100
}

fn default_busy_retries() -> u32 {
    3
}

fn default_busy_delay() -> u64 {
    200
}

fn default_true() -> bool {
    true
}

/// Tester-present keepalive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_keepalive_interval")]
    pub interval_ms: u64,
    /// Use the suppress-positive-response variant (0x3E 0x80)
    #[serde(default = "default_true")]
    pub suppress_response: bool,
}

fn default_keepalive_interval() -> u64 {
    2000
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_keepalive_interval(),
            suppress_response: true,
        }
    }
}

// =============================================================================
// Scanner Configuration
// =============================================================================

/// Request used to detect whether an address is occupied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    #[default]
    TesterPresent,
    /// ReadDataByIdentifier of the active diagnostic session DID (0xF186)
    ReadDid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    #[serde(default)]
    pub probe: ProbeKind,
    /// Status mask for the ReadDTCInformation request after discovery
    #[serde(default = "default_dtc_mask")]
    pub dtc_status_mask: u8,
    /// Module catalog; empty means the built-in catalog
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout(),
            probe: ProbeKind::default(),
            dtc_status_mask: default_dtc_mask(),
            modules: Vec::new(),
        }
    }
}

fn default_probe_timeout() -> u64 {
    300
}

fn default_dtc_mask() -> u8 {
    0xFF
}

/// One catalog entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// CAN identifier in hex (e.g. "0x7E0", "0x18DA10F1")
    pub address: String,
    pub name: String,
    #[serde(default)]
    pub category: ModuleCategory,
}

// =============================================================================
// Security Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Registered algorithm used when the caller supplies none
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Level that must be unlocked before WriteDataByIdentifier
    #[serde(default = "default_write_level")]
    pub write_level: u8,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            write_level: default_write_level(),
        }
    }
}

fn default_algorithm() -> String {
    "generic".to_string()
}

fn default_write_level() -> u8 {
    0x01
}

// =============================================================================
// Actuator / Routine Configuration
// =============================================================================

/// Actuator (I/O control) definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorConfig {
    pub id: String,
    pub name: String,
    /// Data identifier in hex (e.g. "0x4A10")
    pub did: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Security level that must be unlocked first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_level: Option<u8>,
}

/// Routine definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutineConfig {
    pub id: String,
    pub name: String,
    /// Routine identifier in hex (e.g. "0xFF00")
    pub rid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_level: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = OpenDiagConfig::from_toml_str("").unwrap();
        assert!(matches!(config.transport, TransportConfig::Mock(_)));
        assert_eq!(config.session.keepalive.interval_ms, 2000);
        assert!(config.session.keepalive.suppress_response);
        assert_eq!(config.scanner.dtc_status_mask, 0xFF);
        assert_eq!(config.security.algorithm, "generic");
    }

    #[test]
    fn test_full_config() {
        let config = OpenDiagConfig::from_toml_str(
            r#"
            [transport]
            type = "autel"
            endpoints = ["10.0.0.2:6790"]
            verify_crc = false

            [scanner]
            probe = "read_did"

            [[scanner.modules]]
            address = "0x7E0"
            name = "Engine"
            category = "powertrain"

            [[actuators]]
            id = "fan"
            name = "Radiator fan"
            did = "0x4A10"
            security_level = 1

            [[routines]]
            id = "dpf"
            name = "DPF regeneration"
            rid = "0x0203"
            "#,
        )
        .unwrap();

        match config.transport {
            TransportConfig::Autel(ref autel) => {
                assert_eq!(autel.endpoints, vec!["10.0.0.2:6790".to_string()]);
                assert!(!autel.verify_crc);
                assert_eq!(autel.bit_rates, vec![500_000, 250_000]);
            }
            ref other => panic!("Expected Autel transport, got {:?}", other),
        }
        assert_eq!(config.scanner.probe, ProbeKind::ReadDid);
        assert_eq!(config.scanner.modules[0].category, ModuleCategory::Powertrain);
        assert_eq!(config.actuators[0].security_level, Some(1));
        assert_eq!(config.routines[0].security_level, None);
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex_u32("address", "0x7E0").unwrap(), 0x7E0);
        assert_eq!(parse_hex_u32("address", "18DA10F1").unwrap(), 0x18DA10F1);
        assert_eq!(parse_hex_u16("did", "0xF190").unwrap(), 0xF190);
        assert!(parse_hex_u16("did", "0x1F190").is_err());
        assert!(parse_hex_u32("address", "zz").is_err());
    }
}
