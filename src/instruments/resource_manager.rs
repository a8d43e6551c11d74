//! VISA-style resource discovery and opening.

use super::scpi::ScpiTransport;
use super::simulated::{SimulatedDevice, SimulatedTransport};
use super::transport::TcpTransport;
use super::InstrumentType;
use crate::config::ConnectionSettings;
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Default simulated power supply resource
pub const SIMULATED_POWER_SUPPLY: &str = "TCPIP::192.168.1.100::INSTR";

/// Default simulated signal generator resource
pub const SIMULATED_SIGNAL_GENERATOR: &str = "TCPIP::192.168.1.101::INSTR";

/// Lists and opens instrument resources
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Resource strings that can currently be opened
    async fn list_resources(&self) -> Result<Vec<String>>;

    /// Open a session to `address`
    async fn open_resource(
        &self,
        address: &str,
        settings: &ConnectionSettings,
    ) -> Result<Arc<dyn ScpiTransport>>;
}

/// Real resources reached over TCP sockets.
///
/// Socket resources cannot be enumerated, so the listing is the configured
/// resource list.
#[derive(Debug, Clone, Default)]
pub struct VisaResourceManager {
    known_resources: Vec<String>,
}

impl VisaResourceManager {
    /// Manager listing `known_resources`.
    pub fn new(known_resources: Vec<String>) -> Self {
        Self { known_resources }
    }
}

#[async_trait]
impl ResourceManager for VisaResourceManager {
    async fn list_resources(&self) -> Result<Vec<String>> {
        let mut resources = self.known_resources.clone();
        resources.sort();
        resources.dedup();
        debug!(count = resources.len(), "Listed configured resources");
        Ok(resources)
    }

    async fn open_resource(
        &self,
        address: &str,
        settings: &ConnectionSettings,
    ) -> Result<Arc<dyn ScpiTransport>> {
        let transport = TcpTransport::connect(address, settings).await?;
        Ok(Arc::new(transport))
    }
}

/// In-process devices keyed by resource string.
pub struct SimulatedResourceManager {
    devices: RwLock<BTreeMap<String, Arc<SimulatedDevice>>>,
}

impl Default for SimulatedResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedResourceManager {
    /// One simulated power supply and one simulated signal generator.
    pub fn new() -> Self {
        let manager = Self::empty();
        manager.add_device(
            SIMULATED_POWER_SUPPLY,
            Arc::new(SimulatedDevice::new(InstrumentType::PowerSupply)),
        );
        manager.add_device(
            SIMULATED_SIGNAL_GENERATOR,
            Arc::new(SimulatedDevice::new(InstrumentType::SignalGenerator)),
        );
        manager
    }

    /// Manager with no devices.
    pub fn empty() -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
        }
    }

    /// Serve `device` at `address`, replacing any previous one.
    pub fn add_device(&self, address: impl Into<String>, device: Arc<SimulatedDevice>) {
        self.devices.write().insert(address.into(), device);
    }

    /// Device behind `address`, for inspection in tests.
    pub fn device(&self, address: &str) -> Option<Arc<SimulatedDevice>> {
        self.devices.read().get(address).cloned()
    }
}

#[async_trait]
impl ResourceManager for SimulatedResourceManager {
    async fn list_resources(&self) -> Result<Vec<String>> {
        Ok(self.devices.read().keys().cloned().collect())
    }

    async fn open_resource(
        &self,
        address: &str,
        _settings: &ConnectionSettings,
    ) -> Result<Arc<dyn ScpiTransport>> {
        let Some(device) = self.device(address) else {
            bail!("Resource not found: {}", address);
        };
        info!(address, kind = %device.kind(), "Opened simulated resource");
        Ok(Arc::new(SimulatedTransport::new(device)))
    }
}
