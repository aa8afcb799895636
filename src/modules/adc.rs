//! Acquisition (ADC) module driver.
//!
//! A two-channel 24-bit ADC module with an onboard microcontroller. Unlike
//! the direct-output modules, the microcontroller handles all converter
//! traffic locally, which allows exactly timed acquisitions: it arms on a
//! configured trigger source, waits out a programmable hold-off after each
//! trigger, stores samples in module RAM and raises a status pin while a
//! run is in progress.
//!
//! The host never blocks on an acquisition. The cycle is:
//!
//! 1. configure trigger source/count/hold-off, per-channel sample count and
//!    filter,
//! 2. start the run ([`software_trigger`](AdcModule::software_trigger) or a
//!    backplane trigger from the controller),
//! 3. poll [`is_running`](AdcModule::is_running) at the host's own cadence,
//! 4. drain the samples with [`get_data`](AdcModule::get_data) once the
//!    module is idle again.
//!
//! The effective sample period is *not* a formula: the converter's
//! conversion-rate table is non-linear in the filter setting, so the two
//! 21-entry tables below are reproduced verbatim and looked up by
//! (filter type, filter rate).

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info};

use crate::error::{RackError, RackResult};
use crate::modules::{chip, ClockSource, ModuleProxy};
use crate::session::LinkSession;

/// ADC channels on the module.
pub const CHANNELS: usize = 2;

/// Hold-off timer resolution.
const HOLDOFF_TICK_SECONDS: f64 = 100e-9;

/// Largest RAM drain per frame, bounded by the frame payload budget.
const READ_CHUNK_BYTES: u32 = 120;

/// Start of channel 1's sample window in module RAM (bytes); channel 0
/// starts at 0.
const CHANNEL1_RAM_BASE: u32 = 62500;

/// Microcontroller command set. The numbering is firmware ABI.
mod cmd {
    pub const CLOCK_SOURCE: u8 = 0;
    pub const TRIGGER_INPUT: u8 = 1;
    pub const TRIGGER_HOLDOFF: u8 = 2;
    pub const TRIGGER_AMOUNT: u8 = 3;
    pub const FW_VERSION: u8 = 4;
    pub const SOFTWARE_TRIGGER: u8 = 6;
    pub const FILTER_RATE: u8 = 7;
    pub const FILTER_TYPE: u8 = 8;
    pub const ADC_ENABLE: u8 = 9;
    pub const SAMPLE_AMOUNT: u8 = 10;
    pub const CALIBRATE: u8 = 11;
    pub const STATUS: u8 = 14;
    pub const CANCEL: u8 = 15;
    pub const GET_DATA: u8 = 16;
    pub const READ_LOC: u8 = 17;
    pub const DATA_LOC: u8 = 18;
}

/// What starts an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Only [`AdcModule::software_trigger`] starts the module.
    Software,
    /// Rising edges of the controller's backplane trigger line.
    Controller,
}

impl TriggerSource {
    fn to_wire(self) -> u8 {
        match self {
            TriggerSource::Software => 0,
            TriggerSource::Controller => 1,
        }
    }

    fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(TriggerSource::Software),
            1 => Some(TriggerSource::Controller),
            _ => None,
        }
    }
}

/// Digital filter of the converter.
///
/// Together with the filter rate this sets cutoff frequency, sample rate,
/// resolution and 50 Hz rejection; see the sample-time tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    /// Third-order sinc response.
    Sinc3,
    /// Fifth-order sinc response.
    Sinc5,
}

impl FilterType {
    fn to_wire(self) -> u8 {
        match self {
            FilterType::Sinc3 => 3,
            FilterType::Sinc5 => 0,
        }
    }

    fn from_wire(value: u8) -> Option<Self> {
        match value {
            3 => Some(FilterType::Sinc3),
            0 => Some(FilterType::Sinc5),
            _ => None,
        }
    }
}

/// Where the module's internal state machine currently is.
///
/// `Booted` only appears before the first run. Use
/// [`AdcModule::is_running`], not this, to decide when data can be read;
/// the status pin is authoritative and cheaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    /// Acquisition in progress.
    Running,
    /// Idle, data (if any) readable.
    Idle,
    /// Armed, waiting for a trigger.
    Waiting,
    /// Fresh from power-up.
    Booted,
    /// Samples being copied out of converter buffers.
    Readout,
    /// A run was cancelled by the host.
    Cancelled,
    /// Run complete.
    Done,
}

impl ModuleStatus {
    fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(ModuleStatus::Running),
            1 => Some(ModuleStatus::Idle),
            2 => Some(ModuleStatus::Waiting),
            3 => Some(ModuleStatus::Booted),
            4 => Some(ModuleStatus::Readout),
            5 => Some(ModuleStatus::Cancelled),
            6 => Some(ModuleStatus::Done),
            _ => None,
        }
    }
}

/// Effective sample period in seconds, indexed by filter rate 0–20.
const SINC3_SAMPLE_TIME: [f64; 21] = [
    12e-6, 24e-6, 48e-6, 60e-6, 96e-6, 120e-6, 192e-6, 300e-6, 600e-6, 1.2e-3, 3e-3, 6e-3,
    7.5e-3, 15e-3, 30e-3, 50.02e-3, 60e-3, 150e-3, 180e-3, 300e-3, 600e-3,
];

/// Effective sample period in seconds, indexed by filter rate 0–20.
const SINC5_SAMPLE_TIME: [f64; 21] = [
    20e-6, 24e-6, 32e-6, 36e-6, 48e-6, 56e-6, 80e-6, 100e-6, 200e-6, 400e-6, 1e-3, 2e-3,
    2.516e-3, 5e-3, 10e-3, 16.67e-3, 20.016e-3, 50e-3, 60.02e-3, 100e-3, 200e-3,
];

/// Driver for the two-channel acquisition module.
pub struct AdcModule {
    proxy: ModuleProxy,
    // Advisory mirror of the last written filter configuration.
    filters: [Option<(FilterType, u8)>; CHANNELS],
}

impl AdcModule {
    /// Connect to the acquisition module at `address`.
    pub fn new(link: Arc<LinkSession>, address: u8) -> RackResult<Self> {
        Ok(Self {
            proxy: ModuleProxy::new(link, address, "ADC")?,
            filters: [None; CHANNELS],
        })
    }

    // --- clocking -------------------------------------------------------

    /// Select the microcontroller clock source.
    ///
    /// The module expects a 10 MHz backplane reference for `External`, which
    /// lets several modules run off one clock. A module that cannot see the
    /// external clock keeps running internally; the mismatch is reported but
    /// never fatal.
    pub fn set_clock_source(&self, source: ClockSource) -> RackResult<ClockSource> {
        self.proxy
            .mcu_write(cmd::CLOCK_SOURCE, &[source.to_wire()])?;
        let effective = self.clock_source()?;
        if effective != source {
            error!(
                "ADC module {}: clock source not set to {}, continuing on {}",
                self.proxy.address(),
                source,
                effective
            );
        }
        Ok(effective)
    }

    /// The clock source the microcontroller is actually using.
    pub fn clock_source(&self) -> RackResult<ClockSource> {
        let data = self.proxy.mcu_read(cmd::CLOCK_SOURCE, &[], 1)?;
        ClockSource::from_wire(data[0]).ok_or_else(|| {
            RackError::MalformedFrame(format!("unknown clock source code {}", data[0]))
        })
    }

    // --- trigger configuration ------------------------------------------

    /// Select what starts an acquisition.
    pub fn set_trigger_source(&self, source: TriggerSource) -> RackResult<()> {
        self.proxy
            .mcu_write(cmd::TRIGGER_INPUT, &[source.to_wire()])
    }

    /// The configured trigger source.
    pub fn trigger_source(&self) -> RackResult<TriggerSource> {
        let data = self.proxy.mcu_read(cmd::TRIGGER_INPUT, &[], 1)?;
        TriggerSource::from_wire(data[0]).ok_or_else(|| {
            RackError::MalformedFrame(format!("unknown trigger source code {}", data[0]))
        })
    }

    /// Number of trigger events making up one run.
    pub fn set_trigger_count(&self, count: u32) -> RackResult<()> {
        self.proxy
            .mcu_write(cmd::TRIGGER_AMOUNT, &count.to_be_bytes())
    }

    /// The configured trigger count.
    pub fn trigger_count(&self) -> RackResult<u32> {
        let data = self.proxy.mcu_read(cmd::TRIGGER_AMOUNT, &[], 4)?;
        Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Dead time between a trigger and the first sample, 100 ns resolution.
    pub fn set_holdoff_time(&self, seconds: f64) -> RackResult<()> {
        let ticks = seconds / HOLDOFF_TICK_SECONDS;
        if !(0.0..=f64::from(u32::MAX)).contains(&ticks) {
            return Err(RackError::out_of_range(
                "trigger hold-off",
                seconds,
                "0 to ~429 s in 100 ns steps",
            ));
        }
        self.proxy
            .mcu_write(cmd::TRIGGER_HOLDOFF, &(ticks as u32).to_be_bytes())
    }

    /// The configured hold-off time in seconds.
    pub fn holdoff_time(&self) -> RackResult<f64> {
        let data = self.proxy.mcu_read(cmd::TRIGGER_HOLDOFF, &[], 4)?;
        let ticks = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        Ok(f64::from(ticks) * HOLDOFF_TICK_SECONDS)
    }

    // --- per-channel configuration --------------------------------------

    /// Enable or disable a channel for the next run.
    pub fn set_enabled(&self, channel: u8, enable: bool) -> RackResult<()> {
        validate_channel(channel)?;
        self.proxy
            .mcu_write(cmd::ADC_ENABLE, &[channel, enable as u8])
    }

    /// Whether a channel is enabled.
    pub fn enabled(&self, channel: u8) -> RackResult<bool> {
        validate_channel(channel)?;
        let data = self.proxy.mcu_read(cmd::ADC_ENABLE, &[channel], 1)?;
        Ok(data[0] != 0)
    }

    /// Samples taken per trigger on one channel.
    pub fn set_sample_count(&self, channel: u8, count: u32) -> RackResult<()> {
        validate_channel(channel)?;
        let mut args = [0u8; 5];
        args[0] = channel;
        args[1..].copy_from_slice(&count.to_be_bytes());
        self.proxy.mcu_write(cmd::SAMPLE_AMOUNT, &args)
    }

    /// The configured per-trigger sample count of one channel.
    pub fn sample_count(&self, channel: u8) -> RackResult<u32> {
        validate_channel(channel)?;
        let data = self.proxy.mcu_read(cmd::SAMPLE_AMOUNT, &[channel], 4)?;
        Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Set the filter rate (0–20) of one channel; see the filter table.
    pub fn set_filter_rate(&mut self, channel: u8, rate: u8) -> RackResult<()> {
        validate_channel(channel)?;
        if rate as usize >= SINC3_SAMPLE_TIME.len() {
            return Err(RackError::out_of_range("filter rate", rate, "0-20"));
        }
        self.proxy.mcu_write(cmd::FILTER_RATE, &[channel, rate])?;
        if let Some((filter, _)) = self.filters[channel as usize] {
            self.filters[channel as usize] = Some((filter, rate));
        }
        Ok(())
    }

    /// The configured filter rate of one channel.
    pub fn filter_rate(&self, channel: u8) -> RackResult<u8> {
        validate_channel(channel)?;
        let data = self.proxy.mcu_read(cmd::FILTER_RATE, &[channel], 1)?;
        Ok(data[0])
    }

    /// Set the filter type of one channel.
    pub fn set_filter_type(&mut self, channel: u8, filter: FilterType) -> RackResult<()> {
        validate_channel(channel)?;
        self.proxy
            .mcu_write(cmd::FILTER_TYPE, &[channel, filter.to_wire()])?;
        let rate = self.filters[channel as usize].map_or(0, |(_, r)| r);
        self.filters[channel as usize] = Some((filter, rate));
        Ok(())
    }

    /// The configured filter type of one channel.
    pub fn filter_type(&self, channel: u8) -> RackResult<FilterType> {
        validate_channel(channel)?;
        let data = self.proxy.mcu_read(cmd::FILTER_TYPE, &[channel], 1)?;
        FilterType::from_wire(data[0]).ok_or_else(|| {
            RackError::MalformedFrame(format!("unknown filter type code {}", data[0]))
        })
    }

    /// Effective sample period of one channel, from the conversion-rate
    /// table for its current (filter type, filter rate) pair.
    pub fn sample_time(&self, channel: u8) -> RackResult<f64> {
        let rate = self.filter_rate(channel)?;
        let filter = self.filter_type(channel)?;
        if rate as usize >= SINC3_SAMPLE_TIME.len() {
            return Err(RackError::MalformedFrame(format!(
                "module reports filter rate {} outside the conversion table",
                rate
            )));
        }
        Ok(match filter {
            FilterType::Sinc3 => SINC3_SAMPLE_TIME[rate as usize],
            FilterType::Sinc5 => SINC5_SAMPLE_TIME[rate as usize],
        })
    }

    /// Last written filter configuration (advisory; may be stale).
    pub fn cached_filter(&self, channel: u8) -> Option<(FilterType, u8)> {
        self.filters.get(channel as usize).copied().flatten()
    }

    // --- run control ----------------------------------------------------

    /// Start a run right away, regardless of the trigger source.
    pub fn software_trigger(&self) -> RackResult<()> {
        self.proxy.mcu_write(cmd::SOFTWARE_TRIGGER, &[0])
    }

    /// Whether an acquisition is in progress.
    ///
    /// Reads the module's status pin directly; this stays responsive even
    /// while the microcontroller is busy sampling.
    pub fn is_running(&self) -> RackResult<bool> {
        let data = self.proxy.read_chip(
            chip::STATUS_PINS_CHIP,
            chip::STATUS_PINS_MODE,
            chip::STATUS_PINS_SPEED,
            &[0],
        )?;
        Ok(data[0] & 0x01 != 0)
    }

    /// Poll [`is_running`](Self::is_running) until the module goes idle.
    ///
    /// `poll` sets the cadence (the driver adds no delays of its own);
    /// `timeout` bounds the wait, failing with [`RackError::NotReady`] so
    /// the caller can keep polling at its own pace.
    pub fn wait_until_idle(&self, poll: Duration, timeout: Duration) -> RackResult<()> {
        let start = Instant::now();
        loop {
            if !self.is_running()? {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(RackError::NotReady);
            }
            std::thread::sleep(poll);
        }
    }

    /// The microcontroller's own state, mostly useful for diagnostics.
    pub fn status(&self) -> RackResult<ModuleStatus> {
        let data = self.proxy.mcu_read(cmd::STATUS, &[], 1)?;
        ModuleStatus::from_wire(data[0])
            .ok_or_else(|| RackError::MalformedFrame(format!("unknown status code {}", data[0])))
    }

    /// Abort the current run.
    ///
    /// Useful when the trigger or sample configuration turns out wrong and
    /// long; the module status reflects the cancellation afterwards.
    pub fn cancel(&self) -> RackResult<()> {
        info!("ADC module {}: cancelling measurement", self.proxy.address());
        self.proxy.mcu_write(cmd::CANCEL, &[0])
    }

    /// Start the gain/offset calibration routine.
    ///
    /// The module raises its running flag for the duration (a few seconds);
    /// wait for idle the same way as for an acquisition.
    pub fn calibrate(&self) -> RackResult<()> {
        info!("ADC module {}: starting calibration", self.proxy.address());
        self.proxy.mcu_write(cmd::CALIBRATE, &[0])
    }

    /// Firmware version of the module's microcontroller.
    pub fn firmware_version(&self) -> RackResult<u8> {
        let data = self.proxy.mcu_read(cmd::FW_VERSION, &[], 1)?;
        Ok(data[0])
    }

    // --- data readback --------------------------------------------------

    /// Read back the samples of the last run, one `Vec` per enabled channel
    /// (`None` for disabled channels), scaled to volts.
    ///
    /// Fails with [`RackError::NotReady`] while a run is still in progress;
    /// keep polling rather than abandoning the acquisition.
    pub fn get_data(&self) -> RackResult<(Option<Vec<f64>>, Option<Vec<f64>>)> {
        if self.is_running()? {
            return Err(RackError::NotReady);
        }

        let channel0 = if self.enabled(0)? {
            Some(self.drain_channel(0)?)
        } else {
            None
        };
        let channel1 = if self.enabled(1)? {
            Some(self.drain_channel(1)?)
        } else {
            None
        };
        Ok((channel0, channel1))
    }

    /// Byte address just past the last sample a channel wrote to module RAM.
    fn data_location(&self, channel: u8) -> RackResult<u32> {
        let data = self.proxy.mcu_read(cmd::DATA_LOC, &[channel], 4)?;
        Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Drain one channel's RAM window in frame-sized chunks.
    fn drain_channel(&self, channel: u8) -> RackResult<Vec<f64>> {
        let base = if channel == 0 { 0 } else { CHANNEL1_RAM_BASE };
        let end = self.data_location(channel)?;
        if end < base {
            return Err(RackError::MalformedFrame(format!(
                "channel {} data location {} below its RAM window at {}",
                channel, end, base
            )));
        }

        let mut samples = Vec::with_capacity(((end - base) / 3) as usize);
        let mut location = base;
        while location < end {
            let amount = (end - location).min(READ_CHUNK_BYTES) as u8;
            let mut args = [0u8; 4];
            args[..3].copy_from_slice(&location.to_be_bytes()[1..]);
            args[3] = amount;
            self.proxy.mcu_write(cmd::READ_LOC, &args)?;

            let raw = self.proxy.mcu_read(cmd::GET_DATA, &[], amount)?;
            for word in raw.chunks_exact(3) {
                let code = u32::from(word[0]) << 16 | u32::from(word[1]) << 8 | u32::from(word[2]);
                samples.push(volts_from_code(code));
            }
            location += u32::from(amount);
        }
        Ok(samples)
    }
}

/// Convert a raw 24-bit converter word to volts (±8.192 V full scale).
fn volts_from_code(code: u32) -> f64 {
    f64::from(code) * 8.192 / f64::from(1u32 << 23) - 8.192
}

fn validate_channel(channel: u8) -> RackResult<()> {
    if channel as usize >= CHANNELS {
        return Err(RackError::out_of_range("ADC channel", channel, "0-1"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_tables_hold_21_entries_each() {
        assert_eq!(SINC3_SAMPLE_TIME.len(), 21);
        assert_eq!(SINC5_SAMPLE_TIME.len(), 21);
        // Spot-check the non-linear steps that a formula would get wrong.
        assert_eq!(SINC3_SAMPLE_TIME[15], 50.02e-3);
        assert_eq!(SINC5_SAMPLE_TIME[12], 2.516e-3);
        assert_eq!(SINC5_SAMPLE_TIME[16], 20.016e-3);
    }

    #[test]
    fn code_scaling_spans_plus_minus_full_scale() {
        assert_eq!(volts_from_code(0), -8.192);
        assert_eq!(volts_from_code(1 << 23), 0.0);
        let top = volts_from_code((1 << 24) - 1);
        assert!((top - 8.192).abs() < 1e-5);
    }

    #[test]
    fn filter_wire_codes_round_trip() {
        assert_eq!(FilterType::from_wire(FilterType::Sinc3.to_wire()), Some(FilterType::Sinc3));
        assert_eq!(FilterType::from_wire(FilterType::Sinc5.to_wire()), Some(FilterType::Sinc5));
        assert_eq!(FilterType::from_wire(1), None);
    }

}
