//! Direct-output DAC module driver.
//!
//! Sixteen 18-bit DAC channels, two per converter chip. The analog span of
//! every channel is selectable in software and the converter registers can
//! be read back, so the module's state survives a host restart: on
//! construction the driver reads every channel and can ramp non-zero
//! outputs to zero in small steps before handing control to the host,
//! since devices under test tend to sit on the outputs.
//!
//! ## Converter command nibbles
//!
//! The converter takes 4-byte transactions `[cmd<<4 | dac, b2, b3, b4]`:
//!
//! - `0b0011` write value, `0b0111` write value + update output
//! - `0b0010` write span, `0b0110` write span + update output
//! - `0b0100` update output from the staged registers
//! - `0b1101` read value, `0b1100` read span
//!
//! 18-bit values are packed MSB-first across `b2..b4` (top 6 bits of `b4`
//! unused).

use std::sync::Arc;

use log::{info, warn};

use crate::error::{RackError, RackResult};
use crate::modules::{chip, ModuleProxy};
use crate::session::LinkSession;

/// Channels on the module.
pub const CHANNELS: usize = 16;

/// Full scale of the 18-bit converters.
const FULL_SCALE: f64 = (1 << 18) as f64;
/// Largest writable code.
const MAX_CODE: u32 = (1 << 18) - 1;

/// Ramp step used when zeroing outputs at start-up.
const RAMP_STEP_VOLTS: f64 = 10e-3;

// Converter command nibbles.
const CMD_WRITE_SPAN: u8 = 0b0010;
const CMD_WRITE_CODE: u8 = 0b0011;
const CMD_UPDATE: u8 = 0b0100;
const CMD_WRITE_SPAN_UPDATE: u8 = 0b0110;
const CMD_WRITE_CODE_UPDATE: u8 = 0b0111;
const CMD_READ_SPAN: u8 = 0b1100;
const CMD_READ_CODE: u8 = 0b1101;

/// Software-selectable analog span of one DAC channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Span {
    /// 0 V to +4 V.
    Uni4V,
    /// 0 V to +8 V.
    Uni8V,
    /// −4 V to +4 V.
    Bi4V,
    /// −8 V to +8 V.
    Bi8V,
    /// −2 V to +2 V.
    Bi2V,
}

impl Span {
    fn to_wire(self) -> u8 {
        match self {
            Span::Uni4V => 0,
            Span::Uni8V => 1,
            Span::Bi4V => 2,
            Span::Bi8V => 3,
            Span::Bi2V => 4,
        }
    }

    fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Span::Uni4V),
            1 => Some(Span::Uni8V),
            2 => Some(Span::Bi4V),
            3 => Some(Span::Bi8V),
            4 => Some(Span::Bi2V),
            _ => None,
        }
    }

    /// Lowest output voltage in this span.
    pub fn min_volts(self) -> f64 {
        match self {
            Span::Uni4V | Span::Uni8V => 0.0,
            Span::Bi4V => -4.0,
            Span::Bi8V => -8.0,
            Span::Bi2V => -2.0,
        }
    }

    /// Highest output voltage in this span.
    pub fn max_volts(self) -> f64 {
        match self {
            Span::Uni4V | Span::Bi4V => 4.0,
            Span::Uni8V | Span::Bi8V => 8.0,
            Span::Bi2V => 2.0,
        }
    }

    /// Smallest voltage step the converter resolves in this span.
    ///
    /// Steps smaller than this do not change the output; stepping in
    /// multiples of it keeps sweeps exact.
    pub fn step_size(self) -> f64 {
        (self.max_volts() - self.min_volts()) / FULL_SCALE
    }
}

/// Driver for the 16-channel direct-output DAC module.
pub struct DacModule {
    proxy: ModuleProxy,
    spans: [Option<Span>; CHANNELS],
    voltages: [Option<f64>; CHANNELS],
}

impl DacModule {
    /// Connect to the DAC module at `address`.
    ///
    /// Reads back every channel's converter registers. With
    /// `reset_voltages`, channels left away from zero are ramped down in
    /// 10 mV steps, paced only by the link round-trip, and every channel
    /// ends at 0 V in the ±4 V span.
    pub fn new(link: Arc<LinkSession>, address: u8, reset_voltages: bool) -> RackResult<Self> {
        let proxy = ModuleProxy::new(link, address, "DAC")?;
        let mut module = Self {
            proxy,
            spans: [None; CHANNELS],
            voltages: [None; CHANNELS],
        };

        for channel in 0..CHANNELS as u8 {
            module.read_settings(channel)?;
        }

        if reset_voltages {
            for channel in 0..CHANNELS as u8 {
                module.zero_channel(channel)?;
            }
        }

        Ok(module)
    }

    fn zero_channel(&mut self, channel: u8) -> RackResult<()> {
        if let Some(voltage) = self.voltages[channel as usize] {
            if voltage.abs() > 1e-3 {
                info!(
                    "DAC module {}: ramping channel {} from {:.3} V to zero",
                    self.proxy.address(),
                    channel,
                    voltage
                );
                let mut v = voltage;
                while v.abs() > RAMP_STEP_VOLTS {
                    v -= RAMP_STEP_VOLTS * v.signum();
                    self.set_voltage(channel, v)?;
                }
            }
        }
        self.set_span(channel, Span::Bi4V)?;
        self.set_voltage(channel, 0.0)
    }

    /// Set and immediately update the output voltage of one channel.
    ///
    /// The request is quantized to the channel's span; values beyond the
    /// rails clamp to the rail with a warning. The value actually written is
    /// recorded in the advisory cache.
    pub fn set_voltage(&mut self, channel: u8, volts: f64) -> RackResult<()> {
        let span = self.span_of(channel)?;
        let step = span.step_size();
        let (min, max) = (span.min_volts(), span.max_volts());

        let (code, written) = if volts >= max {
            if volts > max {
                warn!(
                    "DAC module {}: {} V too high for span, channel {} set to max {} V",
                    self.proxy.address(),
                    volts,
                    channel,
                    max
                );
            }
            (MAX_CODE, max)
        } else if volts <= min {
            if volts < min {
                warn!(
                    "DAC module {}: {} V too low for span, channel {} set to min {} V",
                    self.proxy.address(),
                    volts,
                    channel,
                    min
                );
            }
            (0, min)
        } else {
            let code = ((volts - min) / step).round() as u32;
            (code, min + f64::from(code) * step)
        };

        self.voltages[channel as usize] = Some(written);
        self.write_code(channel, CMD_WRITE_CODE_UPDATE, code)
    }

    /// Write a raw 18-bit code and update the output.
    pub fn set_code(&mut self, channel: u8, code: u32) -> RackResult<()> {
        validate_channel(channel)?;
        if code > MAX_CODE {
            return Err(RackError::out_of_range("DAC code", code, "18-bit (0-262143)"));
        }
        if let Some(span) = self.spans[channel as usize] {
            self.voltages[channel as usize] =
                Some(span.min_volts() + f64::from(code) * span.step_size());
        }
        self.write_code(channel, CMD_WRITE_CODE_UPDATE, code)
    }

    /// Stage a raw code without updating the output; pair with
    /// [`update`](Self::update).
    pub fn stage_code(&mut self, channel: u8, code: u32) -> RackResult<()> {
        validate_channel(channel)?;
        if code > MAX_CODE {
            return Err(RackError::out_of_range("DAC code", code, "18-bit (0-262143)"));
        }
        self.write_code(channel, CMD_WRITE_CODE, code)
    }

    /// Change the span of one channel and update the output immediately.
    pub fn set_span(&mut self, channel: u8, span: Span) -> RackResult<()> {
        validate_channel(channel)?;
        self.spans[channel as usize] = Some(span);
        self.write_span(channel, CMD_WRITE_SPAN_UPDATE, span)
    }

    /// Stage a span change without updating the output; pair with
    /// [`update`](Self::update).
    pub fn stage_span(&mut self, channel: u8, span: Span) -> RackResult<()> {
        validate_channel(channel)?;
        self.spans[channel as usize] = Some(span);
        self.write_span(channel, CMD_WRITE_SPAN, span)
    }

    /// Update one channel's output from its staged value and span registers.
    pub fn update(&mut self, channel: u8) -> RackResult<()> {
        validate_channel(channel)?;
        let (chip_no, dac_bits) = locate(channel);
        self.proxy.write_chip(
            chip_no,
            chip::DAC_MODE,
            chip::DAC_SPEED,
            &[(CMD_UPDATE << 4) | dac_bits, 0, 0, 0],
        )
    }

    /// Read one channel's value and span registers back from the converter.
    ///
    /// Refreshes the advisory caches and returns the decoded output voltage
    /// and span.
    pub fn read_settings(&mut self, channel: u8) -> RackResult<(f64, Span)> {
        validate_channel(channel)?;
        let (chip_no, dac_bits) = locate(channel);

        let code_raw = self.proxy.read_chip(
            chip_no,
            chip::DAC_MODE,
            chip::DAC_READ_SPEED,
            &[(CMD_READ_CODE << 4) | dac_bits, 0, 0, 0],
        )?;
        let code =
            u32::from(code_raw[1]) << 10 | u32::from(code_raw[2]) << 2 | u32::from(code_raw[3]) >> 6;

        let span_raw = self.proxy.read_chip(
            chip_no,
            chip::DAC_MODE,
            chip::DAC_READ_SPEED,
            &[(CMD_READ_SPAN << 4) | dac_bits, 0, 0, 0],
        )?;
        let span = Span::from_wire(span_raw[2]).ok_or_else(|| {
            RackError::MalformedFrame(format!(
                "channel {} reports unknown span code {}",
                channel, span_raw[2]
            ))
        })?;

        let voltage = span.min_volts() + f64::from(code) * span.step_size();
        self.spans[channel as usize] = Some(span);
        self.voltages[channel as usize] = Some(voltage);
        Ok((voltage, span))
    }

    /// Smallest voltage step for the channel's current span.
    pub fn step_size(&self, channel: u8) -> RackResult<f64> {
        Ok(self.span_of(channel)?.step_size())
    }

    /// Last written/read output voltage (advisory; refresh with
    /// [`read_settings`](Self::read_settings)).
    pub fn voltage(&self, channel: u8) -> Option<f64> {
        self.voltages.get(channel as usize).copied().flatten()
    }

    /// Last written/read span (advisory).
    pub fn span(&self, channel: u8) -> Option<Span> {
        self.spans.get(channel as usize).copied().flatten()
    }

    fn span_of(&self, channel: u8) -> RackResult<Span> {
        validate_channel(channel)?;
        self.spans[channel as usize].ok_or_else(|| {
            RackError::MalformedFrame(format!("span for channel {} has not been read", channel))
        })
    }

    fn write_code(&mut self, channel: u8, command: u8, code: u32) -> RackResult<()> {
        let (chip_no, dac_bits) = locate(channel);
        let data = [
            (command << 4) | dac_bits,
            (code >> 10) as u8,
            (code >> 2) as u8,
            ((code & 0b11) << 6) as u8,
        ];
        self.proxy
            .write_chip(chip_no, chip::DAC_MODE, chip::DAC_SPEED, &data)
    }

    fn write_span(&mut self, channel: u8, command: u8, span: Span) -> RackResult<()> {
        let (chip_no, dac_bits) = locate(channel);
        let data = [(command << 4) | dac_bits, 0, span.to_wire(), 0];
        self.proxy
            .write_chip(chip_no, chip::DAC_MODE, chip::DAC_SPEED, &data)
    }
}

/// Converter chip and in-chip address bits for a channel.
fn locate(channel: u8) -> (u8, u8) {
    (channel / 2, (channel % 2) << 1)
}

fn validate_channel(channel: u8) -> RackResult<()> {
    if channel as usize >= CHANNELS {
        return Err(RackError::out_of_range("DAC channel", channel, "0-15"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_steps_match_the_converter_resolution() {
        assert_eq!(Span::Uni4V.step_size(), 4.0 / FULL_SCALE);
        assert_eq!(Span::Bi4V.step_size(), 8.0 / FULL_SCALE);
        assert_eq!(Span::Uni8V.step_size(), 8.0 / FULL_SCALE);
        assert_eq!(Span::Bi8V.step_size(), 16.0 / FULL_SCALE);
        assert_eq!(Span::Bi2V.step_size(), 4.0 / FULL_SCALE);
    }

    #[test]
    fn span_wire_codes_round_trip() {
        for span in [Span::Uni4V, Span::Uni8V, Span::Bi4V, Span::Bi8V, Span::Bi2V] {
            assert_eq!(Span::from_wire(span.to_wire()), Some(span));
        }
        assert_eq!(Span::from_wire(5), None);
    }

    #[test]
    fn channels_map_two_per_chip() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(1), (0, 2));
        assert_eq!(locate(14), (7, 0));
        assert_eq!(locate(15), (7, 2));
    }
}
