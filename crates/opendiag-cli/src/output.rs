//! Output formatting for opendiag (table, json)

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

use opendiag_core::{ControlResponse, DeviceDescriptor, Dtc, VehicleModule};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format (default)
    #[default]
    Table,
    Json,
}

/// Context for output rendering
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    /// Tables and messages are for humans; JSON output stays machine-clean
    fn chatty(&self) -> bool {
        !self.quiet && self.format == OutputFormat::Table
    }

    pub fn success(&self, msg: &str) {
        if self.chatty() {
            println!("{}", msg.green());
        }
    }

    pub fn info(&self, msg: &str) {
        if self.chatty() {
            println!("{}", msg);
        }
    }

    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    pub fn print<T: Tabled + Serialize>(&self, data: &[T]) {
        match self.format {
            OutputFormat::Table if data.is_empty() => self.info("No data"),
            OutputFormat::Table => println!("{}", Table::new(data)),
            OutputFormat::Json => println!(
                "{}",
                serde_json::to_string_pretty(data).unwrap_or_else(|_| "[]".to_string())
            ),
        }
    }

    /// Structured value as JSON, or key/value lines for tables
    pub fn print_kv<T: Serialize>(&self, value: &T, pairs: &[(&str, String)]) {
        match self.format {
            OutputFormat::Table => {
                for (key, value) in pairs {
                    println!("{}: {}", key.bold(), value);
                }
            }
            OutputFormat::Json => println!(
                "{}",
                serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
            ),
        }
    }
}

/// `0A 1B 2C`, or `-` when empty
pub fn hex_bytes(data: &[u8]) -> String {
    if data.is_empty() {
        return "-".to_string();
    }
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Printable ASCII rendering of a DID value
pub fn ascii(data: &[u8]) -> String {
    data.iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect()
}

// =============================================================================
// Display rows
// =============================================================================

#[derive(Debug, Tabled, Serialize)]
pub struct DeviceRow {
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Class")]
    pub class: String,
    #[tabled(rename = "Signal")]
    pub signal: String,
    #[tabled(rename = "Description")]
    pub description: String,
}

impl From<&DeviceDescriptor> for DeviceRow {
    fn from(device: &DeviceDescriptor) -> Self {
        Self {
            id: device.id.clone(),
            name: device.name.clone(),
            class: format!("{:?}", device.class),
            signal: device
                .signal_quality
                .map(|dbm| format!("{} dBm", dbm))
                .unwrap_or_else(|| "-".to_string()),
            description: device.description.clone(),
        }
    }
}

#[derive(Debug, Tabled, Serialize)]
pub struct ModuleRow {
    #[tabled(rename = "Address")]
    pub address: String,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Category")]
    pub category: String,
    #[tabled(rename = "DTCs")]
    pub dtcs: usize,
}

impl From<&VehicleModule> for ModuleRow {
    fn from(module: &VehicleModule) -> Self {
        Self {
            address: format!("0x{:03X}", module.address),
            name: module.name.clone(),
            category: module.category.to_string(),
            dtcs: module.dtc_count,
        }
    }
}

#[derive(Debug, Tabled, Serialize)]
pub struct DtcRow {
    #[tabled(rename = "Code")]
    pub code: String,
    #[tabled(rename = "Category")]
    pub category: String,
    #[tabled(rename = "Active")]
    pub active: String,
    #[tabled(rename = "State")]
    pub state: String,
    #[tabled(rename = "Status")]
    pub status: String,
}

impl From<&Dtc> for DtcRow {
    fn from(dtc: &Dtc) -> Self {
        let state = if dtc.status.confirmed {
            "confirmed"
        } else if dtc.status.pending {
            "pending"
        } else {
            "stored"
        };
        Self {
            code: dtc.to_string(),
            category: dtc.category.to_string(),
            active: if dtc.status.is_active() { "Yes" } else { "No" }.to_string(),
            state: state.to_string(),
            status: format!("0x{:02X}", dtc.status.raw),
        }
    }
}

#[derive(Debug, Tabled, Serialize)]
pub struct ControlRow {
    #[tabled(rename = "Address")]
    pub address: String,
    #[tabled(rename = "Identifier")]
    pub identifier: String,
    #[tabled(rename = "Control")]
    pub control: String,
    #[tabled(rename = "Status")]
    pub status: String,
}

impl From<&ControlResponse> for ControlRow {
    fn from(response: &ControlResponse) -> Self {
        Self {
            address: format!("0x{:03X}", response.address),
            identifier: format!("0x{:04X}", response.identifier),
            control: format!("0x{:02X}", response.control),
            status: hex_bytes(&response.status),
        }
    }
}
