//! Actuator and routine catalogs

use serde::Serialize;

use crate::config::{parse_hex_u16, ActuatorConfig, ConfigError, OpenDiagConfig, RoutineConfig};

/// An output driven through InputOutputControlByIdentifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Actuator {
    pub id: String,
    pub name: String,
    pub did: u16,
    pub description: Option<String>,
    /// Level that must be unlocked before driving the output
    pub security_level: Option<u8>,
}

impl Actuator {
    /// Ad-hoc actuator for a bare DID
    pub fn for_did(did: u16) -> Self {
        Self {
            id: format!("0x{:04X}", did),
            name: format!("DID 0x{:04X}", did),
            did,
            description: None,
            security_level: None,
        }
    }

    pub fn from_config(config: &ActuatorConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            id: config.id.clone(),
            name: config.name.clone(),
            did: parse_hex_u16("actuators.did", &config.did)?,
            description: config.description.clone(),
            security_level: config.security_level,
        })
    }
}

/// An ECU-side procedure run through RoutineControl
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Routine {
    pub id: String,
    pub name: String,
    pub rid: u16,
    pub description: Option<String>,
    pub security_level: Option<u8>,
}

impl Routine {
    pub fn for_rid(rid: u16) -> Self {
        Self {
            id: format!("0x{:04X}", rid),
            name: format!("Routine 0x{:04X}", rid),
            rid,
            description: None,
            security_level: None,
        }
    }

    pub fn from_config(config: &RoutineConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            id: config.id.clone(),
            name: config.name.clone(),
            rid: parse_hex_u16("routines.rid", &config.rid)?,
            description: config.description.clone(),
            security_level: config.security_level,
        })
    }
}

/// Configured actuators and routines
#[derive(Debug, Clone, Default)]
pub struct ControlCatalog {
    pub actuators: Vec<Actuator>,
    pub routines: Vec<Routine>,
}

impl ControlCatalog {
    pub fn from_config(config: &OpenDiagConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            actuators: config
                .actuators
                .iter()
                .map(Actuator::from_config)
                .collect::<Result<_, _>>()?,
            routines: config
                .routines
                .iter()
                .map(Routine::from_config)
                .collect::<Result<_, _>>()?,
        })
    }

    /// Look up by configured id, falling back to a hex DID
    pub fn actuator(&self, key: &str) -> Option<Actuator> {
        self.actuators
            .iter()
            .find(|a| a.id == key)
            .cloned()
            .or_else(|| parse_hex_u16("actuator", key).ok().map(Actuator::for_did))
    }

    /// Look up by configured id, falling back to a hex routine id
    pub fn routine(&self, key: &str) -> Option<Routine> {
        self.routines
            .iter()
            .find(|r| r.id == key)
            .cloned()
            .or_else(|| parse_hex_u16("routine", key).ok().map(Routine::for_rid))
    }
}
