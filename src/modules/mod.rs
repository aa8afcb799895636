//! Module proxies and per-kind drivers for the rack's plug-in modules.
//!
//! Every installed module gets one [`ModuleProxy`] carrying its address and
//! a shared handle on the [`LinkSession`](crate::session::LinkSession). The
//! concrete drivers ([`dac::DacModule`], [`adc::AdcModule`],
//! [`awg::AwgModule`]) hold a proxy by composition and translate their typed
//! operations into frames; all validation happens here or in the driver,
//! before anything touches the link.

pub mod adc;
pub mod awg;
pub mod dac;

pub use adc::AdcModule;
pub use awg::AwgModule;
pub use dac::DacModule;

use std::sync::Arc;

use crate::error::RackResult;
use crate::protocol::frame::{CommandFrame, ModuleAddress};
use crate::session::LinkSession;

/// SPI mode and clock-divisor settings for the chips used on the modules.
///
/// Speeds divide the controller's 84 MHz SPI clock; 84 gives the 1 MHz the
/// slow housekeeping chips need, 6 gives 14 MHz for the converters.
pub(crate) mod chip {
    /// 18-bit DAC converters (two channels each).
    pub const DAC_MODE: u8 = 0;
    /// DAC write speed divisor.
    pub const DAC_SPEED: u8 = 6;
    /// DAC readback needs a slower clock than writes.
    pub const DAC_READ_SPEED: u8 = 8;

    /// Waveform-generator chips.
    pub const AWG_MODE: u8 = 0;
    /// Waveform chip speed divisor.
    pub const AWG_SPEED: u8 = 6;

    /// Clock distribution/division chip on the waveform module.
    pub const CLOCK_DIST_MODE: u8 = 0;
    /// Clock distribution chip speed divisor.
    pub const CLOCK_DIST_SPEED: u8 = 6;

    /// Module status pins, readable without involving the microcontroller.
    pub const STATUS_PINS_MODE: u8 = 0;
    /// Status pins speed divisor (1 MHz).
    pub const STATUS_PINS_SPEED: u8 = 84;

    /// Chip number the status pins appear on.
    pub const STATUS_PINS_CHIP: u8 = 6;
}

/// Clock source selection shared by the microcontroller-backed modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    /// The module's local on-board clock.
    Internal,
    /// The shared 10 MHz backplane clock.
    External,
}

impl ClockSource {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            ClockSource::Internal => 0,
            ClockSource::External => 1,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(ClockSource::Internal),
            1 => Some(ClockSource::External),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClockSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClockSource::Internal => write!(f, "internal"),
            ClockSource::External => write!(f, "external"),
        }
    }
}

/// Address + link seam shared by all module drivers.
///
/// The proxy does not own the session; the session outlives every proxy and
/// serializes all of their traffic.
#[derive(Clone)]
pub struct ModuleProxy {
    link: Arc<LinkSession>,
    address: ModuleAddress,
    kind: &'static str,
}

impl ModuleProxy {
    /// Bind a proxy to the module at `address` (1–15, as set on the
    /// hardware).
    pub fn new(link: Arc<LinkSession>, address: u8, kind: &'static str) -> RackResult<Self> {
        Ok(Self {
            link,
            address: ModuleAddress::new(address)?,
            kind,
        })
    }

    /// The module's validated address.
    pub fn address(&self) -> ModuleAddress {
        self.address
    }

    /// Module kind tag, used in log context.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// The shared link session.
    pub fn link(&self) -> &LinkSession {
        &self.link
    }

    /// SPI write to one chip on this module.
    pub fn write_chip(&self, chip: u8, mode: u8, speed: u8, data: &[u8]) -> RackResult<()> {
        let frame = CommandFrame::module_write(self.address, chip, mode, speed, data)?;
        self.link.send(frame)?;
        Ok(())
    }

    /// SPI read from one chip on this module; `data` is shifted out and the
    /// same number of bytes comes back.
    pub fn read_chip(&self, chip: u8, mode: u8, speed: u8, data: &[u8]) -> RackResult<Vec<u8>> {
        let frame = CommandFrame::module_read(self.address, chip, mode, speed, data)?;
        Ok(self.link.send(frame)?.payload)
    }

    /// Pass-through write to the module's onboard microcontroller.
    pub fn mcu_write(&self, command: u8, args: &[u8]) -> RackResult<()> {
        let frame = CommandFrame::pass_through_write(self.address, command, args)?;
        self.link.send(frame)?;
        Ok(())
    }

    /// Pass-through read from the module's onboard microcontroller.
    pub fn mcu_read(&self, command: u8, args: &[u8], read_len: u8) -> RackResult<Vec<u8>> {
        let frame = CommandFrame::pass_through_read(self.address, command, args, read_len)?;
        Ok(self.link.send(frame)?.payload)
    }
}
