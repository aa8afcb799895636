//! Serial transport for the rack controller link.
//!
//! This adapter wraps the `serialport` crate. The rack controller enumerates
//! as a USB CDC device, so the configured baud rate is accepted but does not
//! govern actual throughput on the virtual link; callers must not rely on
//! it for timing.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use log::debug;
use serialport::SerialPort;

use crate::adapters::Transport;
use crate::error::{RackError, RackResult};

/// A [`Transport`] over a physical (or USB-virtual) serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    port_name: String,
    timeout: Duration,
}

impl SerialTransport {
    /// Open a serial port for exclusive use by one link session.
    ///
    /// Fails cleanly with [`RackError::Transport`] when the port does not
    /// exist or is already held by another process; the protocol layer
    /// relies on the operating system for mutual exclusion.
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> RackResult<Self> {
        // The port-level timeout is kept short; the overall receive timeout
        // is enforced in `read` so short reads can accumulate.
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(20))
            .open()
            .map_err(|e| {
                RackError::Transport(format!(
                    "failed to open serial port '{}' at {} baud: {}",
                    port_name, baud_rate, e
                ))
            })?;

        debug!("serial port '{}' opened at {} baud", port_name, baud_rate);

        Ok(Self {
            port,
            port_name: port_name.to_string(),
            timeout,
        })
    }

    /// The port this transport was opened on.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> RackResult<()> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> RackResult<usize> {
        let start = Instant::now();
        let mut filled = 0;

        while filled < buf.len() {
            if start.elapsed() >= self.timeout {
                break;
            }

            match self.port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    // Port-level timeout is shorter than the overall one.
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(filled)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
