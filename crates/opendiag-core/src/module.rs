//! Vehicle modules (ECUs) and the address catalog used for discovery

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{parse_hex_u32, ConfigError, ModuleConfig};
use crate::uds::{session_type, Dtc};

/// Functional area of an ECU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleCategory {
    Powertrain,
    Chassis,
    Body,
    Network,
    Safety,
    Climate,
    Infotainment,
    Comfort,
    Lighting,
    #[default]
    Unknown,
}

impl fmt::Display for ModuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Powertrain => "powertrain",
            Self::Chassis => "chassis",
            Self::Body => "body",
            Self::Network => "network",
            Self::Safety => "safety",
            Self::Climate => "climate",
            Self::Infotainment => "infotainment",
            Self::Comfort => "comfort",
            Self::Lighting => "lighting",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Diagnostic session a module is currently in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSession {
    #[default]
    Default,
    Programming,
    Extended,
}

impl DiagnosticSession {
    /// DiagnosticSessionControl sub-function for this session
    pub fn session_type(self) -> u8 {
        match self {
            Self::Default => session_type::DEFAULT,
            Self::Programming => session_type::PROGRAMMING,
            Self::Extended => session_type::EXTENDED,
        }
    }

    pub fn from_session_type(value: u8) -> Option<Self> {
        match value {
            session_type::DEFAULT => Some(Self::Default),
            session_type::PROGRAMMING => Some(Self::Programming),
            session_type::EXTENDED => Some(Self::Extended),
            _ => None,
        }
    }
}

impl fmt::Display for DiagnosticSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Programming => f.write_str("programming"),
            Self::Extended => f.write_str("extended"),
        }
    }
}

/// Known diagnostic address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub address: u32,
    pub name: String,
    pub category: ModuleCategory,
}

impl CatalogEntry {
    pub fn new(address: u32, name: impl Into<String>, category: ModuleCategory) -> Self {
        Self {
            address,
            name: name.into(),
            category,
        }
    }

    pub fn from_config(config: &ModuleConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            address: parse_hex_u32("scanner.modules.address", &config.address)?,
            name: config.name.clone(),
            category: config.category,
        })
    }
}

/// Common 11-bit CAN request addresses
const BUILTIN: &[(u32, &str, ModuleCategory)] = &[
    (0x7E0, "Engine Control Module", ModuleCategory::Powertrain),
    (0x7E1, "Transmission Control Module", ModuleCategory::Powertrain),
    (0x7E2, "Hybrid Powertrain Control Module", ModuleCategory::Powertrain),
    (0x7E3, "Battery Energy Control Module", ModuleCategory::Powertrain),
    (0x760, "Anti-lock Brake System", ModuleCategory::Chassis),
    (0x730, "Electronic Power Steering", ModuleCategory::Chassis),
    (0x7B0, "Suspension Control Module", ModuleCategory::Chassis),
    (0x726, "Body Control Module", ModuleCategory::Body),
    (0x740, "Door Control Module", ModuleCategory::Body),
    (0x7C0, "Gateway Module", ModuleCategory::Network),
    (0x737, "Airbag Control Module", ModuleCategory::Safety),
    (0x7A0, "Parking Assist Module", ModuleCategory::Safety),
    (0x744, "HVAC Control Module", ModuleCategory::Climate),
    (0x7D0, "Radio / Head Unit", ModuleCategory::Infotainment),
    (0x720, "Instrument Cluster", ModuleCategory::Infotainment),
    (0x750, "Seat Memory Module", ModuleCategory::Comfort),
    (0x746, "Headlamp Control Module", ModuleCategory::Lighting),
];

/// The built-in address catalog, in probe order
pub fn builtin_catalog() -> Vec<CatalogEntry> {
    BUILTIN
        .iter()
        .map(|(address, name, category)| CatalogEntry::new(*address, *name, *category))
        .collect()
}

/// Catalog entry for `address`, or an unnamed one
pub fn describe_address(address: u32) -> CatalogEntry {
    BUILTIN
        .iter()
        .find(|(a, _, _)| *a == address)
        .map(|(a, name, category)| CatalogEntry::new(*a, *name, *category))
        .unwrap_or_else(|| {
            CatalogEntry::new(address, format!("Module 0x{:03X}", address), ModuleCategory::Unknown)
        })
}

/// A responding ECU
///
/// Created by the scanner; session and unlock fields are kept current by
/// [`crate::security::SecurityAccessManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VehicleModule {
    pub address: u32,
    pub name: String,
    pub category: ModuleCategory,
    pub session: DiagnosticSession,
    /// Highest security level granted, if any
    pub security_level: Option<u8>,
    pub dtc_count: usize,
    pub dtcs: Vec<Dtc>,
}

impl VehicleModule {
    pub fn new(entry: CatalogEntry) -> Self {
        Self {
            address: entry.address,
            name: entry.name,
            category: entry.category,
            session: DiagnosticSession::Default,
            security_level: None,
            dtc_count: 0,
            dtcs: Vec::new(),
        }
    }

    /// Module at a bare address, named from the built-in catalog when known
    pub fn at(address: u32) -> Self {
        Self::new(describe_address(address))
    }

    pub fn is_unlocked(&self) -> bool {
        self.security_level.is_some()
    }

    pub fn set_dtcs(&mut self, dtcs: Vec<Dtc>) {
        self.dtc_count = dtcs.len();
        self.dtcs = dtcs;
    }
}

impl fmt::Display for VehicleModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:03X})", self.name, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_addresses_unique() {
        let catalog = builtin_catalog();
        let mut addresses: Vec<u32> = catalog.iter().map(|e| e.address).collect();
        addresses.sort_unstable();
        addresses.dedup();
        assert_eq!(addresses.len(), catalog.len());
        assert_eq!(catalog[0].address, 0x7E0);
    }

    #[test]
    fn test_describe_unknown_address() {
        let entry = describe_address(0x7F1);
        assert_eq!(entry.category, ModuleCategory::Unknown);
        assert_eq!(entry.name, "Module 0x7F1");
        assert_eq!(describe_address(0x760).category, ModuleCategory::Chassis);
    }

    #[test]
    fn test_entry_from_config() {
        let config = ModuleConfig {
            address: "0x18DA10F1".to_string(),
            name: "Hybrid ECU".to_string(),
            category: ModuleCategory::Powertrain,
        };
        let entry = CatalogEntry::from_config(&config).unwrap();
        assert_eq!(entry.address, 0x18DA10F1);
    }

    #[test]
    fn test_session_type_round_trip() {
        for session in [
            DiagnosticSession::Default,
            DiagnosticSession::Programming,
            DiagnosticSession::Extended,
        ] {
            assert_eq!(DiagnosticSession::from_session_type(session.session_type()), Some(session));
        }
        assert_eq!(DiagnosticSession::from_session_type(0x60), None);
    }

    #[test]
    fn test_new_module_is_locked() {
        let mut module = VehicleModule::at(0x7E0);
        assert!(!module.is_unlocked());
        assert_eq!(module.session, DiagnosticSession::Default);
        module.set_dtcs(vec![Dtc::new(0x01, 0x01, 0x00, 0x09)]);
        assert_eq!(module.dtc_count, 1);
    }
}
