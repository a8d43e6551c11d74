//! SCPI transport abstraction and the shared instrument base.
//!
//! [`ScpiTransport`] is the byte-level seam (TCP socket or in-process
//! simulation). [`ScpiInstrument`] layers connection bookkeeping, the
//! not-connected guard and typed queries on top, and is embedded by every
//! concrete driver.

use super::Identification;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Line-oriented SCPI session
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Send a command without expecting a response
    async fn write(&self, command: &str) -> Result<()>;

    /// Send a query and return the trimmed response
    async fn query(&self, command: &str) -> Result<String>;

    /// Release the session. Further I/O fails.
    async fn close(&self) -> Result<()>;

    /// Whether the session can still carry traffic
    fn is_open(&self) -> bool;
}

/// Connection state and command plumbing shared by the SCPI drivers.
pub struct ScpiInstrument {
    name: String,
    address: String,
    transport: Arc<dyn ScpiTransport>,
    connected: AtomicBool,
    identification: RwLock<Option<Identification>>,
}

impl ScpiInstrument {
    /// Disconnected session over `transport`.
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        transport: Arc<dyn ScpiTransport>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            transport,
            connected: AtomicBool::new(false),
            identification: RwLock::new(None),
        }
    }

    /// Display name used in messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resource string.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connected and the transport is still open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.transport.is_open()
    }

    /// `*IDN?` fields captured on connect.
    pub fn identification(&self) -> Option<Identification> {
        self.identification.read().clone()
    }

    /// Identify the instrument and mark the session live.
    pub async fn connect(&self) -> Result<()> {
        if !self.transport.is_open() {
            bail!("{} transport at {} is closed", self.name, self.address);
        }
        let response = self
            .transport
            .query("*IDN?")
            .await
            .with_context(|| format!("Failed to identify {} at {}", self.name, self.address))?;
        let idn = Identification::parse(&response);
        info!(
            name = %self.name,
            address = %self.address,
            model = %idn.model,
            "Instrument connected"
        );
        *self.identification.write() = Some(idn);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Close the transport. Safe to call when already disconnected.
    pub async fn disconnect(&self) -> Result<()> {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        *self.identification.write() = None;
        if self.transport.is_open() {
            self.transport
                .close()
                .await
                .with_context(|| format!("Failed to close {}", self.address))?;
        }
        if was_connected {
            info!(name = %self.name, address = %self.address, "Instrument disconnected");
        }
        Ok(())
    }

    /// Fail with "<name> is not connected" unless the session is live.
    pub fn ensure_connected(&self) -> Result<()> {
        if !self.is_connected() {
            bail!("{} is not connected", self.name);
        }
        Ok(())
    }

    /// Send a command with no response.
    pub async fn write(&self, command: &str) -> Result<()> {
        self.ensure_connected()?;
        debug!(name = %self.name, command, "SCPI write");
        self.transport
            .write(command)
            .await
            .with_context(|| format!("Failed to write '{}' to {}", command, self.name))
    }

    /// Send a query and return its response.
    pub async fn query(&self, command: &str) -> Result<String> {
        self.ensure_connected()?;
        let response = self
            .transport
            .query(command)
            .await
            .with_context(|| format!("Failed to query '{}' from {}", command, self.name))?;
        debug!(name = %self.name, command, response = %response, "SCPI query");
        Ok(response)
    }

    /// Query a floating-point value.
    pub async fn query_f64(&self, command: &str) -> Result<f64> {
        let response = self.query(command).await?;
        response.trim().parse::<f64>().with_context(|| {
            format!("Failed to parse '{}' as f64 from query: {}", response, command)
        })
    }

    /// Query a boolean value (ON/OFF or 1/0).
    pub async fn query_bool(&self, command: &str) -> Result<bool> {
        let response = self.query(command).await?;
        match response.trim().to_uppercase().as_str() {
            "ON" | "1" | "TRUE" => Ok(true),
            "OFF" | "0" | "FALSE" => Ok(false),
            _ => {
                warn!(command, response = %response, "Unexpected boolean response");
                bail!(
                    "Failed to parse '{}' as boolean from query: {}",
                    response,
                    command
                )
            }
        }
    }
}

/// SCPI `ON`/`OFF` token.
pub(crate) fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "ON"
    } else {
        "OFF"
    }
}
