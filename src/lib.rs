//! Control library for a modular instrumentation rack.
//!
//! A controller unit on a shared serial link multiplexes SPI traffic to
//! individually addressed plug-in modules and distributes a backplane
//! trigger. This crate implements the link protocol, the controller session
//! (locking, serialization, chassis telemetry, trigger arming) and drivers
//! for the DAC, ADC and arbitrary-waveform modules.
//!
//! ```no_run
//! use std::sync::Arc;
//! use modrack::adapters::SerialTransport;
//! use modrack::modules::DacModule;
//! use modrack::LinkSession;
//!
//! # fn main() -> modrack::RackResult<()> {
//! let transport = SerialTransport::open("/dev/ttyUSB0", 1_000_000, std::time::Duration::from_secs(1))?;
//! let link = Arc::new(LinkSession::new(Box::new(transport)));
//! link.unlock()?;
//!
//! let mut dac = DacModule::new(link.clone(), 2, true)?;
//! link.trigger_arm();
//! dac.set_voltage(0, 2.1)?; // updates the output and fires the backplane trigger
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod config;
pub mod error;
pub mod modules;
pub mod protocol;
pub mod session;

pub use error::{RackError, RackResult};
pub use session::LinkSession;
