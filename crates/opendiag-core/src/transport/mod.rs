//! Transport layer
//!
//! Every physical link implements [`Transport`]:
//! - [`elm327::Elm327Transport`] for ELM327-compatible adapters (AT commands)
//! - [`autel::AutelTransport`] for the Autel VCI proprietary framing
//! - [`mock::MockTransport`] for tests and offline use
//!
//! # Example
//!
//! ```ignore
//! use opendiag_core::config::TransportConfig;
//! use opendiag_core::transport::{create_transport, Transport};
//!
//! let transport = create_transport(&TransportConfig::Mock(Default::default()))?;
//! let device = transport.scan(Duration::from_secs(2)).await?.remove(0);
//! transport.connect(&device).await?;
//! let response = transport.send_uds(0x7E0, &[0x22, 0xF1, 0x90], Duration::from_secs(2)).await?;
//! ```

mod adapter;
pub mod autel;
pub mod elm327;
pub mod error;
pub mod link;
pub mod mock;

pub use adapter::{
    DeviceClass, DeviceDescriptor, RawChunk, Transport, TransportKind, TransportState,
};
pub use error::TransportError;

use std::sync::Arc;

use crate::config::TransportConfig;

/// Build the transport selected by configuration
///
/// The choice is fixed for the lifetime of the returned object.
pub fn create_transport(config: &TransportConfig) -> Result<Arc<dyn Transport>, TransportError> {
    match config {
        TransportConfig::Elm327(cfg) => {
            if cfg.endpoints.is_empty() {
                return Err(TransportError::InvalidConfig(
                    "elm327 transport needs at least one endpoint".to_string(),
                ));
            }
            Ok(Arc::new(elm327::Elm327Transport::new(cfg.clone())))
        }
        TransportConfig::Autel(cfg) => {
            if cfg.bit_rates.is_empty() {
                return Err(TransportError::InvalidConfig(
                    "autel transport needs at least one bit rate".to_string(),
                ));
            }
            Ok(Arc::new(autel::AutelTransport::new(cfg.clone())))
        }
        TransportConfig::Mock(cfg) => Ok(Arc::new(mock::MockTransport::with_demo_vehicle(cfg))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutelConfig, Elm327Config, MockConfig};

    #[test]
    fn test_factory_selects_kind() {
        let elm = create_transport(&TransportConfig::Elm327(Elm327Config::default())).unwrap();
        assert_eq!(elm.kind(), TransportKind::Elm327);
        assert_eq!(elm.state(), TransportState::Disconnected);

        let autel = create_transport(&TransportConfig::Autel(AutelConfig::default())).unwrap();
        assert_eq!(autel.kind(), TransportKind::Autel);

        let mock = create_transport(&TransportConfig::Mock(MockConfig::default())).unwrap();
        assert_eq!(mock.kind(), TransportKind::Mock);
    }

    #[test]
    fn test_factory_rejects_empty_bit_rates() {
        let config = AutelConfig {
            bit_rates: Vec::new(),
            ..AutelConfig::default()
        };
        assert!(matches!(
            create_transport(&TransportConfig::Autel(config)),
            Err(TransportError::InvalidConfig(_))
        ));
    }
}
