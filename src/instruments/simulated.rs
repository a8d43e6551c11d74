//! In-process simulated SCPI instruments
//!
//! Used in simulation mode and by tests. The device provides:
//! - A command log for test verification
//! - Setpoint storage answering the matching queries (`VOLT?`, `FREQ?`, ...)
//! - Controllable one-shot failure injection
//! - Simulated link loss

use super::InstrumentType;
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::scpi::ScpiTransport;

/// Simulated instrument state shared by every transport opened on it.
///
/// # Example
///
/// ```
/// use visa_vulture::instruments::{InstrumentType, SimulatedDevice, SimulatedTransport, ScpiTransport};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let device = Arc::new(SimulatedDevice::new(InstrumentType::PowerSupply));
/// let transport = SimulatedTransport::new(Arc::clone(&device));
/// transport.write("VOLT 5.000").await.unwrap();
/// assert_eq!(transport.query("VOLT?").await.unwrap(), "5.000");
/// assert_eq!(device.commands(), vec!["VOLT 5.000", "VOLT?"]);
/// # })
/// ```
pub struct SimulatedDevice {
    kind: InstrumentType,
    identity: String,
    link_up: AtomicBool,
    should_fail_next: AtomicBool,
    values: Mutex<HashMap<String, String>>,
    command_log: Mutex<Vec<String>>,
}

impl SimulatedDevice {
    /// Device answering as a simulated `kind`.
    pub fn new(kind: InstrumentType) -> Self {
        let identity = match kind {
            InstrumentType::PowerSupply => "VISA Vulture,SIM-PSU,SIM0001,1.0",
            InstrumentType::SignalGenerator => "VISA Vulture,SIM-SG,SIM0002,1.0",
        };
        Self {
            kind,
            identity: identity.to_string(),
            link_up: AtomicBool::new(true),
            should_fail_next: AtomicBool::new(false),
            values: Mutex::new(HashMap::new()),
            command_log: Mutex::new(Vec::new()),
        }
    }

    /// Override the `*IDN?` answer
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Instrument family being simulated.
    pub fn kind(&self) -> InstrumentType {
        self.kind
    }

    /// Fail the next command
    pub fn trigger_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Simulate a dropped link (cable pulled, instrument powered off)
    pub fn drop_connection(&self) {
        self.link_up.store(false, Ordering::SeqCst);
    }

    /// Bring the link back after `drop_connection`
    pub fn restore_connection(&self) {
        self.link_up.store(true, Ordering::SeqCst);
    }

    /// False after `drop_connection`.
    pub fn is_link_up(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    /// Every command received, in order
    pub fn commands(&self) -> Vec<String> {
        self.command_log.lock().clone()
    }

    /// Forget the command log.
    pub fn clear_commands(&self) {
        self.command_log.lock().clear();
    }

    /// Last value written under a SCPI header (`"VOLT"`, `"AM:STAT"`, ...)
    pub fn value(&self, header: &str) -> Option<String> {
        self.values.lock().get(&header.to_uppercase()).cloned()
    }

    fn execute(&self, command: &str) -> Result<Option<String>> {
        self.command_log.lock().push(command.to_string());

        if !self.is_link_up() {
            bail!("Simulated device is not reachable");
        }
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            bail!("Simulated failure executing '{}'", command);
        }

        let command = command.trim();
        if let Some(header) = command.strip_suffix('?') {
            return Ok(Some(self.answer(&header.to_uppercase())));
        }

        let (header, argument) = match command.split_once(char::is_whitespace) {
            Some((header, argument)) => (header.to_uppercase(), argument.trim().to_string()),
            None => (command.to_uppercase(), String::new()),
        };
        let stored = match argument.to_uppercase().as_str() {
            "ON" => "1".to_string(),
            "OFF" => "0".to_string(),
            _ => argument,
        };
        debug!(header = %header, value = %stored, "Simulated setpoint");
        self.values.lock().insert(header, stored);
        Ok(None)
    }

    fn answer(&self, header: &str) -> String {
        let values = self.values.lock();
        let output_on = values.get("OUTP").is_some_and(|v| v == "1");
        match header {
            "*IDN" => self.identity.clone(),
            "MEAS:VOLT" | "MEAS:CURR" => {
                let setpoint = &header["MEAS:".len()..];
                match values.get(setpoint) {
                    Some(value) if output_on => value.clone(),
                    _ => "0.000".to_string(),
                }
            }
            other => values.get(other).cloned().unwrap_or_else(|| "0".to_string()),
        }
    }
}

/// Transport bound to a [`SimulatedDevice`].
pub struct SimulatedTransport {
    device: Arc<SimulatedDevice>,
    open: AtomicBool,
}

impl SimulatedTransport {
    /// Open transport to `device`.
    pub fn new(device: Arc<SimulatedDevice>) -> Self {
        Self {
            device,
            open: AtomicBool::new(true),
        }
    }

    /// Device behind this transport.
    pub fn device(&self) -> &Arc<SimulatedDevice> {
        &self.device
    }

    fn check_open(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            bail!("Simulated transport is closed");
        }
        Ok(())
    }
}

#[async_trait]
impl ScpiTransport for SimulatedTransport {
    async fn write(&self, command: &str) -> Result<()> {
        self.check_open()?;
        self.device.execute(command)?;
        Ok(())
    }

    async fn query(&self, command: &str) -> Result<String> {
        self.check_open()?;
        match self.device.execute(command)? {
            Some(response) => Ok(response),
            None => bail!("Command '{}' produced no response", command),
        }
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.device.is_link_up()
    }
}
