use regex::Regex;
use serde::Serialize;
use std::io::Read;
use std::time::Duration;
use thiserror::Error;

const READ_TIMEOUT: Duration = Duration::from_millis(50);
const MAX_CHUNK: usize = 4096;

#[derive(Error, Debug)]
pub enum ScaleError {
    #[error("Failed to open serial port {port}: {source}")]
    OpenPortFailed {
        port: String,
        source: serialport::Error,
    },
    #[error("Serial read failed: {0}")]
    ReadFailed(#[from] std::io::Error),
}

/// Last value reported by the scale, in grams.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct WeightReading {
    pub grams: f64,
}

pub trait WeightSource: Send {
    fn connect(&mut self, port: &str, baud: u32) -> Result<(), ScaleError>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;

    /// Non-blocking. Returns the last-known reading when nothing new
    /// arrived or the port misbehaved.
    fn read(&mut self) -> WeightReading;
}

pub struct SerialScale {
    port: Option<Box<dyn serialport::SerialPort>>,
    pending: String,
    current: WeightReading,
    token: Regex,
}

impl SerialScale {
    pub fn new() -> Self {
        Self {
            port: None,
            pending: String::new(),
            current: WeightReading::default(),
            token: Regex::new(r"[-+]?\d*\.\d+|\d+").expect("weight token pattern"),
        }
    }

    fn poll_port(&mut self) -> Result<(), ScaleError> {
        let Some(port) = self.port.as_mut() else {
            return Ok(());
        };

        let available = port
            .bytes_to_read()
            .map_err(|e| ScaleError::ReadFailed(e.into()))? as usize;
        if available == 0 {
            return Ok(());
        }

        let mut buf = vec![0u8; available.min(MAX_CHUNK)];
        let n = port.read(&mut buf).map_err(ScaleError::ReadFailed)?;
        self.ingest_chunk(&buf[..n]);
        Ok(())
    }

    fn ingest_chunk(&mut self, bytes: &[u8]) {
        self.pending.push_str(&String::from_utf8_lossy(bytes));
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            self.ingest_line(line.trim());
        }
    }

    /// Takes the first decimal token on the line, if any. Lines without one
    /// leave the current reading untouched.
    fn ingest_line(&mut self, line: &str) -> bool {
        let Some(token) = self.token.find(line) else {
            return false;
        };
        match token.as_str().parse::<f64>() {
            Ok(grams) => {
                self.current = WeightReading { grams };
                true
            }
            Err(_) => false,
        }
    }
}

impl WeightSource for SerialScale {
    fn connect(&mut self, port: &str, baud: u32) -> Result<(), ScaleError> {
        self.disconnect();
        let handle = serialport::new(port, baud)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|source| ScaleError::OpenPortFailed {
                port: port.to_string(),
                source,
            })?;
        tracing::info!(port, baud, "scale connected");
        self.port = Some(handle);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.port.take().is_some() {
            tracing::info!("scale disconnected");
        }
        self.pending.clear();
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn read(&mut self) -> WeightReading {
        if let Err(e) = self.poll_port() {
            tracing::debug!("scale poll failed, keeping last reading: {}", e);
        }
        self.current
    }
}

/// Names of serial ports present on the host, for the dashboard picker.
pub fn list_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            tracing::warn!("serial port enumeration failed: {}", e);
            Vec::new()
        }
    }
}
