//! SCPI over raw TCP sockets
//!
//! Handles VISA socket resources of the form `TCPIP[board]::<host>::<port>::SOCKET`.
//! Commands are terminated with the configured write termination and responses
//! are read up to the read termination, both under the configured timeout.

use super::scpi::ScpiTransport;
use crate::config::ConnectionSettings;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

/// Host and port of a VISA socket resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketResource {
    /// Host name or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl SocketResource {
    /// Parse `TCPIP0::192.168.1.10::5025::SOCKET` (board number optional, case-insensitive).
    pub fn parse(address: &str) -> Result<Self> {
        let parts: Vec<&str> = address.trim().split("::").collect();
        let [interface, host, port, class] = parts.as_slice() else {
            bail!("Unsupported resource '{}': expected TCPIP::<host>::<port>::SOCKET", address);
        };

        let interface = interface.to_uppercase();
        let board = interface.strip_prefix("TCPIP").unwrap_or("x");
        if !board.chars().all(|c| c.is_ascii_digit()) {
            bail!("Unsupported interface '{}' in resource '{}'", interface, address);
        }
        if !class.eq_ignore_ascii_case("SOCKET") {
            bail!(
                "Unsupported resource class '{}' in '{}': only SOCKET resources are supported",
                class,
                address
            );
        }
        if host.is_empty() {
            bail!("Missing host in resource '{}'", address);
        }
        let port = port
            .parse::<u16>()
            .with_context(|| format!("Invalid port '{}' in resource '{}'", port, address))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Async SCPI session over a TCP socket
pub struct TcpTransport {
    address: String,
    stream: Mutex<BufReader<TcpStream>>,
    open: AtomicBool,
    timeout: Duration,
    read_termination: u8,
    write_termination: String,
}

impl TcpTransport {
    /// Connect to a socket resource.
    pub async fn connect(address: &str, settings: &ConnectionSettings) -> Result<Self> {
        let resource = SocketResource::parse(address)?;
        let target = format!("{}:{}", resource.host, resource.port);

        let stream = timeout(settings.timeout(), TcpStream::connect(&target))
            .await
            .with_context(|| format!("Connection timeout to {}", target))?
            .with_context(|| format!("Failed to connect to {}", target))?;

        stream.set_nodelay(true)?;

        info!(address, "Opened TCP socket resource");

        Ok(Self {
            address: address.to_string(),
            stream: Mutex::new(BufReader::new(stream)),
            open: AtomicBool::new(true),
            timeout: settings.timeout(),
            read_termination: settings.read_termination.bytes().last().unwrap_or(b'\n'),
            write_termination: settings.write_termination.clone(),
        })
    }

    async fn send(&self, stream: &mut BufReader<TcpStream>, command: &str) -> Result<()> {
        let line = format!("{}{}", command, self.write_termination);
        let io = async {
            stream.get_mut().write_all(line.as_bytes()).await?;
            stream.get_mut().flush().await?;
            Ok::<(), std::io::Error>(())
        };
        timeout(self.timeout, io)
            .await
            .with_context(|| format!("Timeout writing '{}' to {}", command, self.address))?
            .with_context(|| format!("Failed to write '{}' to {}", command, self.address))
    }
}

#[async_trait]
impl ScpiTransport for TcpTransport {
    async fn write(&self, command: &str) -> Result<()> {
        if !self.is_open() {
            bail!("Socket {} is closed", self.address);
        }
        let mut stream = self.stream.lock().await;
        debug!(address = %self.address, command, "TCP write");
        self.send(&mut stream, command).await
    }

    async fn query(&self, command: &str) -> Result<String> {
        if !self.is_open() {
            bail!("Socket {} is closed", self.address);
        }
        let mut stream = self.stream.lock().await;
        self.send(&mut stream, command).await?;

        let mut response = Vec::new();
        let result = timeout(
            self.timeout,
            stream.read_until(self.read_termination, &mut response),
        )
        .await;

        match result {
            Ok(Ok(0)) => {
                self.open.store(false, Ordering::SeqCst);
                bail!("Connection closed by device {}", self.address)
            }
            Ok(Ok(_)) => {
                let text = String::from_utf8_lossy(&response).trim().to_string();
                debug!(address = %self.address, command, response = %text, "TCP response");
                Ok(text)
            }
            Ok(Err(e)) => Err(e).context("Failed to read response"),
            Err(_) => bail!("Timeout waiting for response to: {}", command),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            let mut stream = self.stream.lock().await;
            stream
                .get_mut()
                .shutdown()
                .await
                .with_context(|| format!("Failed to close socket {}", self.address))?;
            info!(address = %self.address, "Closed TCP socket resource");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
