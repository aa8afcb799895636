//! Arbitrary-waveform (AWG) module driver.
//!
//! Eight output channels across two waveform-generator chips (four channels
//! each), clocked through a clock-distribution chip with one divided output
//! per channel. Each waveform chip carries 4096 words of pattern RAM shared
//! by its four channels: a channel plays whatever window of that RAM its
//! start/stop registers point at, so uploading a table once and pointing
//! several channels at the same window is the normal way to reuse a
//! waveform, not a special case.
//!
//! Configuration registers on the waveform chips are buffered: changes only
//! take effect after the register-update handshake, which this driver
//! performs as part of every operation that needs it.
//!
//! ## Cross-chip trigger alignment
//!
//! Each chip has a fixed pipeline of [`FIXED_PIPELINE_CYCLES`] of its own
//! (divided) clock between trigger-in and first sample-out. With both chips
//! on the same division that cancels out; with different divisions the chips
//! would start audibly skewed. [`AwgModule::compensate_trigger_delay`]
//! converts the *other* chip's pipeline into each chip's own clock domain
//! and programs the trigger-delay registers accordingly; call it after
//! changing clock divisions and before arming.

use std::sync::Arc;

use log::{debug, warn};

use crate::error::{RackError, RackResult};
use crate::modules::{chip, ClockSource, ModuleProxy};
use crate::session::LinkSession;

/// Output channels on the module.
pub const CHANNELS: usize = 8;

/// Channels per waveform chip.
const CHANNELS_PER_CHIP: u8 = 4;

/// Pattern RAM words per waveform chip.
pub const RAM_WORDS: u16 = 4096;

/// Pipeline length from trigger-in to first sample-out, in chip clock
/// cycles.
pub const FIXED_PIPELINE_CYCLES: u32 = 14;

/// Pattern RAM base address in the chip's register space.
const RAM_BASE: u16 = 0x6000;

/// Sample words streamed per frame (2 address bytes + 2 bytes per word must
/// fit the frame payload budget).
const WORDS_PER_CHUNK: usize = 60;

/// Chip number of the clock-distribution chip.
const CLOCK_CHIP: u8 = 2;

/// Waveform-chip register map (compatibility contract).
mod reg {
    /// Register-update handshake: commits buffered configuration registers.
    pub const RAM_UPDATE: u16 = 0x001D;
    /// Pattern status: bit 0 run, bit 2 RAM access.
    pub const PAT_STATUS: u16 = 0x001E;
    /// Trigger-to-pattern delay, in chip clock cycles.
    pub const PATTERN_DLY: u16 = 0x0020;
    /// Pattern repeat period, in chip clock cycles.
    pub const PAT_PERIOD: u16 = 0x0029;

    /// Digital gain register of channel-in-chip `dac`.
    pub fn dgain(dac: u8) -> u16 {
        0x0032 + u16::from(dac)
    }

    /// Playback window start address register of channel-in-chip `dac`.
    pub fn start_addr(dac: u8) -> u16 {
        0x0050 + 2 * u16::from(dac)
    }

    /// Playback window stop address register of channel-in-chip `dac`.
    pub fn stop_addr(dac: u8) -> u16 {
        0x0051 + 2 * u16::from(dac)
    }
}

/// Pattern-status bits.
const PAT_RUN: u16 = 0x0001;
const PAT_MEM_ACCESS: u16 = 0x0004;

/// Clock-distribution chip: first byte of a 3-byte transaction selects the
/// divider output; 0x0F selects the input mux instead.
const CLOCK_SOURCE_SELECT: u8 = 0x0F;

/// Status-pin bit that reports a live external clock on the backplane.
const EXTERNAL_CLOCK_PRESENT: u8 = 0x02;

/// Driver for the eight-channel arbitrary-waveform module.
pub struct AwgModule {
    proxy: ModuleProxy,
    // Advisory mirrors of the last written clock configuration; divisions
    // feed the trigger-delay compensation.
    divisions: [u16; CHANNELS],
    clock_source: ClockSource,
}

impl AwgModule {
    /// Connect to the waveform module at `address`.
    ///
    /// The chips power up with every divider at 1 and the internal clock
    /// selected; the caches start from that state.
    pub fn new(link: Arc<LinkSession>, address: u8) -> RackResult<Self> {
        Ok(Self {
            proxy: ModuleProxy::new(link, address, "AWG")?,
            divisions: [1; CHANNELS],
            clock_source: ClockSource::Internal,
        })
    }

    // --- waveform upload and playback windows ---------------------------

    /// Write a sample table into pattern RAM at `ram_offset`.
    ///
    /// Samples are 12-bit signed (−2048..=2047). Pattern RAM access is
    /// halted for the duration of the upload. With `set_pattern_length` the
    /// channel's playback window is also bound to exactly this table;
    /// without it only the RAM content changes, which is how several
    /// channels come to share one window.
    pub fn upload_waveform(
        &mut self,
        channel: u8,
        samples: &[i16],
        ram_offset: u16,
        set_pattern_length: bool,
    ) -> RackResult<()> {
        let (chip_no, _) = locate(channel)?;
        if samples.is_empty() {
            return Err(RackError::out_of_range("waveform length", 0, "1-4096 samples"));
        }
        let len = samples.len() as u32;
        if u32::from(ram_offset) + len > u32::from(RAM_WORDS) {
            return Err(RackError::out_of_range(
                "waveform RAM window",
                format!("{}+{}", ram_offset, len),
                "must fit in 4096 words",
            ));
        }
        if let Some(bad) = samples.iter().find(|s| !(-2048..=2047).contains(*s)) {
            return Err(RackError::out_of_range("waveform sample", bad, "12-bit signed"));
        }

        // Halt pattern RAM access while streaming.
        self.write_register(chip_no, reg::PAT_STATUS, PAT_MEM_ACCESS)?;

        let mut address = RAM_BASE + ram_offset;
        for block in samples.chunks(WORDS_PER_CHUNK) {
            let mut data = Vec::with_capacity(2 + 2 * block.len());
            data.extend_from_slice(&address.to_be_bytes());
            for sample in block {
                data.extend_from_slice(&pack_sample(*sample).to_be_bytes());
            }
            self.proxy
                .write_chip(chip_no, chip::AWG_MODE, chip::AWG_SPEED, &data)?;
            address += block.len() as u16;
        }

        self.write_register(chip_no, reg::PAT_STATUS, 0)?;

        if set_pattern_length {
            self.set_ram_address(channel, ram_offset, samples.len() as u16)?;
        } else {
            self.write_register(chip_no, reg::RAM_UPDATE, 1)?;
        }
        Ok(())
    }

    /// Bind a channel's playback window, independent of any upload.
    pub fn set_ram_address(&mut self, channel: u8, offset: u16, length: u16) -> RackResult<()> {
        let (chip_no, dac) = locate(channel)?;
        if length == 0 {
            return Err(RackError::out_of_range("playback length", 0, "1-4096 words"));
        }
        if u32::from(offset) + u32::from(length) > u32::from(RAM_WORDS) {
            return Err(RackError::out_of_range(
                "playback window",
                format!("{}+{}", offset, length),
                "must fit in 4096 words",
            ));
        }
        self.write_register(chip_no, reg::start_addr(dac), offset)?;
        self.write_register(chip_no, reg::stop_addr(dac), offset + length - 1)?;
        self.write_register(chip_no, reg::RAM_UPDATE, 1)
    }

    /// Set a channel's playback length, keeping its current start address.
    pub fn set_pattern_length(&mut self, channel: u8, length: u16) -> RackResult<()> {
        let (chip_no, dac) = locate(channel)?;
        if length == 0 {
            return Err(RackError::out_of_range("playback length", 0, "1-4096 words"));
        }
        let start = self.read_register(chip_no, reg::start_addr(dac))?;
        if u32::from(start) + u32::from(length) > u32::from(RAM_WORDS) {
            return Err(RackError::out_of_range(
                "playback window",
                format!("{}+{}", start, length),
                "must fit in 4096 words",
            ));
        }
        self.write_register(chip_no, reg::stop_addr(dac), start + length - 1)?;
        self.write_register(chip_no, reg::RAM_UPDATE, 1)
    }

    /// Read back a channel's playback window as `(offset, length)`.
    pub fn ram_window(&self, channel: u8) -> RackResult<(u16, u16)> {
        let (chip_no, dac) = locate(channel)?;
        let start = self.read_register(chip_no, reg::start_addr(dac))?;
        let stop = self.read_register(chip_no, reg::stop_addr(dac))?;
        if stop < start {
            return Err(RackError::MalformedFrame(format!(
                "channel {} reports playback window {}..{}",
                channel, start, stop
            )));
        }
        Ok((start, stop - start + 1))
    }

    // --- timing ---------------------------------------------------------

    /// Set a channel's clock division: 1, or any even value up to 510.
    pub fn set_clock_division(&mut self, channel: u8, division: u16) -> RackResult<()> {
        locate(channel)?;
        if !(division == 1 || (division % 2 == 0 && (2..=510).contains(&division))) {
            return Err(RackError::out_of_range(
                "clock division",
                division,
                "1 or even 2-510",
            ));
        }
        let div = division.to_be_bytes();
        self.proxy.write_chip(
            CLOCK_CHIP,
            chip::CLOCK_DIST_MODE,
            chip::CLOCK_DIST_SPEED,
            &[channel, div[0], div[1]],
        )?;
        self.divisions[channel as usize] = division;
        Ok(())
    }

    /// Last written clock division of a channel (advisory).
    pub fn clock_division(&self, channel: u8) -> Option<u16> {
        self.divisions.get(channel as usize).copied()
    }

    /// Select the module clock source.
    ///
    /// Selecting [`ClockSource::External`] while the backplane carries no
    /// clock is recoverable: the module keeps running on its internal clock,
    /// the condition is logged, and the effective source is returned.
    pub fn set_clock_source(&mut self, source: ClockSource) -> RackResult<ClockSource> {
        if source == ClockSource::External && !self.external_clock_present()? {
            warn!(
                "AWG module {}: no external clock on the backplane, staying on the internal clock",
                self.proxy.address()
            );
            self.write_clock_source(ClockSource::Internal)?;
            self.clock_source = ClockSource::Internal;
            return Ok(ClockSource::Internal);
        }
        self.write_clock_source(source)?;
        self.clock_source = source;
        Ok(source)
    }

    /// Last written clock source (advisory).
    pub fn clock_source(&self) -> ClockSource {
        self.clock_source
    }

    /// Whether the backplane reference clock is present at the module.
    pub fn external_clock_present(&self) -> RackResult<bool> {
        let data = self.proxy.read_chip(
            chip::STATUS_PINS_CHIP,
            chip::STATUS_PINS_MODE,
            chip::STATUS_PINS_SPEED,
            &[0],
        )?;
        Ok(data[0] & EXTERNAL_CLOCK_PRESENT != 0)
    }

    /// Pattern repeat period of one chip, in that chip's clock cycles.
    pub fn set_pattern_period(&mut self, chip_no: u8, cycles: u16) -> RackResult<()> {
        validate_chip(chip_no)?;
        self.write_register(chip_no, reg::PAT_PERIOD, cycles)?;
        self.write_register(chip_no, reg::RAM_UPDATE, 1)
    }

    /// Program both chips' trigger-delay registers so their first samples
    /// leave in apparent synchrony.
    ///
    /// Each chip's delay is the *other* chip's fixed pipeline converted into
    /// the target chip's clock domain. The conversion uses the divisions of
    /// the outputs clocking the two pattern engines (channels 0 and 4).
    pub fn compensate_trigger_delay(&mut self) -> RackResult<()> {
        let div0 = self.divisions[0];
        let div1 = self.divisions[CHANNELS_PER_CHIP as usize];

        let delay0 = converted_delay(div0, div1);
        let delay1 = converted_delay(div1, div0);
        debug!(
            "AWG module {}: trigger delay compensation {} / {} cycles (divisions {} / {})",
            self.proxy.address(),
            delay0,
            delay1,
            div0,
            div1
        );

        self.write_register(0, reg::PATTERN_DLY, delay0)?;
        self.write_register(1, reg::PATTERN_DLY, delay1)?;
        self.write_register(0, reg::RAM_UPDATE, 1)?;
        self.write_register(1, reg::RAM_UPDATE, 1)
    }

    // --- output ---------------------------------------------------------

    /// Scale a channel's output digitally by `factor` (−2.0 ≤ f < 2.0, in
    /// 1/1024 steps).
    ///
    /// The chip accepts any register code without complaint, so range
    /// enforcement lives here.
    pub fn set_digital_gain(&mut self, channel: u8, factor: f64) -> RackResult<()> {
        let (chip_no, dac) = locate(channel)?;
        if !(-2.0..2.0).contains(&factor) {
            return Err(RackError::out_of_range(
                "digital gain",
                factor,
                "-2.0 to <2.0",
            ));
        }
        let code = (factor * 1024.0).round() as i16;
        self.write_register(chip_no, reg::dgain(dac), (code as u16) & 0x0FFF)?;
        self.write_register(chip_no, reg::RAM_UPDATE, 1)
    }

    /// Start or stop pattern playback on both chips.
    pub fn run(&mut self, enable: bool) -> RackResult<()> {
        let value = if enable { PAT_RUN } else { 0 };
        self.write_register(0, reg::PAT_STATUS, value)?;
        self.write_register(1, reg::PAT_STATUS, value)
    }

    // --- register access ------------------------------------------------

    fn write_register(&self, chip_no: u8, register: u16, value: u16) -> RackResult<()> {
        let r = register.to_be_bytes();
        let v = value.to_be_bytes();
        self.proxy.write_chip(
            chip_no,
            chip::AWG_MODE,
            chip::AWG_SPEED,
            &[r[0], r[1], v[0], v[1]],
        )
    }

    fn read_register(&self, chip_no: u8, register: u16) -> RackResult<u16> {
        let r = register.to_be_bytes();
        let data = self.proxy.read_chip(
            chip_no,
            chip::AWG_MODE,
            chip::AWG_SPEED,
            &[r[0] | 0x80, r[1], 0, 0],
        )?;
        Ok(u16::from_be_bytes([data[2], data[3]]))
    }

    fn write_clock_source(&self, source: ClockSource) -> RackResult<()> {
        self.proxy.write_chip(
            CLOCK_CHIP,
            chip::CLOCK_DIST_MODE,
            chip::CLOCK_DIST_SPEED,
            &[CLOCK_SOURCE_SELECT, 0, source.to_wire()],
        )
    }
}

/// The other chip's pipeline length expressed in this chip's clock cycles.
fn converted_delay(own_division: u16, other_division: u16) -> u16 {
    let cycles =
        FIXED_PIPELINE_CYCLES * u32::from(other_division) / u32::from(own_division.max(1));
    let remainder =
        (FIXED_PIPELINE_CYCLES * u32::from(other_division)) % u32::from(own_division.max(1));
    // Round to nearest; the register only holds whole cycles.
    let rounded = if remainder * 2 >= u32::from(own_division.max(1)) {
        cycles + 1
    } else {
        cycles
    };
    rounded.min(u32::from(u16::MAX)) as u16
}

/// Pack a 12-bit signed sample into the chip's MSB-aligned RAM word.
fn pack_sample(sample: i16) -> u16 {
    ((sample as u16) & 0x0FFF) << 4
}

/// Waveform chip and channel-in-chip for an output channel.
fn locate(channel: u8) -> RackResult<(u8, u8)> {
    if channel as usize >= CHANNELS {
        return Err(RackError::out_of_range("AWG channel", channel, "0-7"));
    }
    Ok((channel / CHANNELS_PER_CHIP, channel % CHANNELS_PER_CHIP))
}

fn validate_chip(chip_no: u8) -> RackResult<()> {
    if chip_no > 1 {
        return Err(RackError::out_of_range("waveform chip", chip_no, "0-1"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_pack_msb_aligned_twos_complement() {
        assert_eq!(pack_sample(0), 0x0000);
        assert_eq!(pack_sample(1), 0x0010);
        assert_eq!(pack_sample(2047), 0x7FF0);
        assert_eq!(pack_sample(-1), 0xFFF0);
        assert_eq!(pack_sample(-2048), 0x8000);
    }

    #[test]
    fn equal_divisions_cancel_out() {
        assert_eq!(converted_delay(1, 1), FIXED_PIPELINE_CYCLES as u16);
        assert_eq!(converted_delay(8, 8), FIXED_PIPELINE_CYCLES as u16);
    }

    #[test]
    fn delay_converts_into_the_slower_clock_domain() {
        // Other chip at division 4, this chip at 2: its 14 cycles last
        // twice as long as ours, so we wait 28 of our cycles.
        assert_eq!(converted_delay(2, 4), 28);
        // The fast chip's pipeline shrinks in slow-clock cycles.
        assert_eq!(converted_delay(4, 2), 7);
    }

    #[test]
    fn delay_conversion_rounds_to_nearest_cycle() {
        // 14 * 4 / 6 = 9.33 -> 9; 14 * 6 / 4 = 21.
        assert_eq!(converted_delay(6, 4), 9);
        assert_eq!(converted_delay(4, 6), 21);
    }

    #[test]
    fn channel_to_chip_mapping() {
        assert_eq!(locate(0).unwrap(), (0, 0));
        assert_eq!(locate(3).unwrap(), (0, 3));
        assert_eq!(locate(4).unwrap(), (1, 0));
        assert_eq!(locate(7).unwrap(), (1, 3));
        assert!(locate(8).is_err());
    }
}
