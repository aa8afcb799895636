//! Frame codec for the addressed command/response protocol.
//!
//! ## Wire format
//!
//! Every exchange on the link is one command frame followed by exactly one
//! response frame (or a receive timeout):
//!
//! ```text
//! command:  [opcode][select][len][payload ...]
//! response: [status][payload ...]
//! ```
//!
//! - `opcode` is a single ASCII command byte; its most significant bit is
//!   the trigger-arm modifier: when set, the controller emits a backplane
//!   trigger pulse synchronously with the frame's execution on the addressed
//!   module.
//! - `select` routes the frame: high nibble = chip within the module, low
//!   nibble = module address. Address 0 is reserved for the controller's own
//!   chips; chassis-level opcodes carry `select = 0`.
//! - `status` is `0x06` (ack) or `0x15` (nak). Response payload length is
//!   fixed by the opcode schema, so no terminator or checksum is carried;
//!   the exact binary layout is a compatibility contract to be
//!   reverse-verified against a reference controller.
//!
//! Module payloads open with the SPI mode and clock-divisor bytes for the
//! selected chip. Pass-through payloads carry a sub-frame that the module's
//! onboard microcontroller forwards to one of its peripheral registers.
//!
//! Encoding is pure and side-effect free; it never touches the transport.

use crate::error::{RackError, RackResult};

/// Module address reserved for the controller's own chips.
pub const RESERVED_ADDRESS: u8 = 0;

/// Largest payload the controller accepts in one frame.
///
/// The controller buffers a whole frame before executing it; anything larger
/// than its 128-byte buffer (3 header bytes + payload + margin) would be
/// truncated on the wire, so oversized frames are rejected before send.
pub const MAX_FRAME_PAYLOAD: usize = 124;

/// Trigger-arm modifier bit on the opcode byte.
const TRIGGER_FLAG: u8 = 0x80;

/// Write-direction bit on a microcontroller sub-frame command byte.
const MCU_WRITE_FLAG: u8 = 0x80;

/// Response status byte: frame accepted and executed.
const STATUS_ACK: u8 = 0x06;
/// Response status byte: frame rejected by the controller.
const STATUS_NAK: u8 = 0x15;

/// Command opcodes understood by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Lift the power-up write protection.
    Unlock = b'u',
    /// Re-engage the write protection.
    Lock = b'l',
    /// Read the controller firmware version.
    FirmwareVersion = b'v',
    /// Read the controller temperature sensor.
    Temperature = b't',
    /// Read both battery rail ADC channels.
    Battery = b'b',
    /// Write SPI data to a module chip.
    ModuleWrite = b'w',
    /// Clock SPI data through a module chip and return what it shifted out.
    ModuleRead = b'r',
    /// Forward a write sub-frame to a module's onboard microcontroller.
    PassThroughWrite = b'p',
    /// Forward a read sub-frame to a module's onboard microcontroller.
    PassThroughRead = b'q',
}

/// A validated module address (1–15; 0 is the controller).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleAddress(u8);

impl ModuleAddress {
    /// Validate a module address set on the hardware.
    pub fn new(address: u8) -> RackResult<Self> {
        if address == RESERVED_ADDRESS || address > 15 {
            return Err(RackError::out_of_range(
                "module address",
                address,
                "1-15; 0 is reserved for the controller",
            ));
        }
        Ok(Self(address))
    }

    /// The raw address value.
    pub fn get(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for ModuleAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One addressed command, ready to encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    opcode: Opcode,
    select: u8,
    payload: Vec<u8>,
    trigger: bool,
}

impl CommandFrame {
    /// A chassis-level command handled by the controller itself.
    pub fn chassis(opcode: Opcode) -> Self {
        debug_assert!(matches!(
            opcode,
            Opcode::Unlock
                | Opcode::Lock
                | Opcode::FirmwareVersion
                | Opcode::Temperature
                | Opcode::Battery
        ));
        Self {
            opcode,
            select: 0,
            payload: Vec::new(),
            trigger: false,
        }
    }

    /// An SPI write to `chip` on the addressed module.
    ///
    /// `mode` and `speed` are the chip's SPI mode (0–3) and clock-divisor
    /// setting; `data` is shifted out verbatim.
    pub fn module_write(
        address: ModuleAddress,
        chip: u8,
        mode: u8,
        speed: u8,
        data: &[u8],
    ) -> RackResult<Self> {
        validate_chip(chip)?;
        let mut payload = Vec::with_capacity(2 + data.len());
        payload.push(mode);
        payload.push(speed);
        payload.extend_from_slice(data);
        Self::checked(Opcode::ModuleWrite, select_byte(address.get(), chip), payload)
    }

    /// An SPI read from `chip` on the addressed module.
    ///
    /// SPI is full duplex: `data` is shifted out (a read command plus dummy
    /// bytes, as the chip requires) and the same number of bytes shifted in
    /// by the chip comes back in the response.
    pub fn module_read(
        address: ModuleAddress,
        chip: u8,
        mode: u8,
        speed: u8,
        data: &[u8],
    ) -> RackResult<Self> {
        validate_chip(chip)?;
        if data.is_empty() {
            return Err(RackError::out_of_range("module read length", 0, "1-122 bytes"));
        }
        let mut payload = Vec::with_capacity(2 + data.len());
        payload.push(mode);
        payload.push(speed);
        payload.extend_from_slice(data);
        Self::checked(Opcode::ModuleRead, select_byte(address.get(), chip), payload)
    }

    /// A write sub-frame forwarded to the module's microcontroller.
    pub fn pass_through_write(address: ModuleAddress, command: u8, args: &[u8]) -> RackResult<Self> {
        if command & MCU_WRITE_FLAG != 0 {
            return Err(RackError::out_of_range(
                "microcontroller command",
                command,
                "0-127; bit 7 marks the write direction on the wire",
            ));
        }
        let mut payload = Vec::with_capacity(2 + args.len());
        payload.push(MCU_WRITE_FLAG | command);
        payload.push(args.len() as u8);
        payload.extend_from_slice(args);
        Self::checked(
            Opcode::PassThroughWrite,
            select_byte(address.get(), 0),
            payload,
        )
    }

    /// A read sub-frame forwarded to the module's microcontroller.
    ///
    /// `args` selects what to read (e.g. a channel number); the
    /// microcontroller answers with exactly `read_len` bytes.
    pub fn pass_through_read(
        address: ModuleAddress,
        command: u8,
        args: &[u8],
        read_len: u8,
    ) -> RackResult<Self> {
        if command & MCU_WRITE_FLAG != 0 {
            return Err(RackError::out_of_range(
                "microcontroller command",
                command,
                "0-127; bit 7 marks the write direction on the wire",
            ));
        }
        if read_len == 0 {
            return Err(RackError::out_of_range("pass-through read length", read_len, "1-255"));
        }
        let mut payload = Vec::with_capacity(2 + args.len());
        payload.push(command);
        payload.push(read_len);
        payload.extend_from_slice(args);
        Self::checked(
            Opcode::PassThroughRead,
            select_byte(address.get(), 0),
            payload,
        )
    }

    fn checked(opcode: Opcode, select: u8, payload: Vec<u8>) -> RackResult<Self> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(RackError::out_of_range(
                "frame payload length",
                payload.len(),
                "at most 124 bytes per frame",
            ));
        }
        Ok(Self {
            opcode,
            select,
            payload,
            trigger: false,
        })
    }

    /// Mark this frame to execute with a synchronous backplane trigger.
    pub fn with_trigger(mut self, trigger: bool) -> Self {
        self.trigger = trigger;
        self
    }

    /// The opcode this frame carries.
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(3 + self.payload.len());
        let mut opcode = self.opcode as u8;
        if self.trigger {
            opcode |= TRIGGER_FLAG;
        }
        bytes.push(opcode);
        bytes.push(self.select);
        bytes.push(self.payload.len() as u8);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Exact response length (status byte included) for this frame.
    pub fn response_len(&self) -> usize {
        1 + match self.opcode {
            Opcode::Unlock | Opcode::Lock | Opcode::ModuleWrite | Opcode::PassThroughWrite => 0,
            Opcode::FirmwareVersion => 2,
            Opcode::Temperature => 2,
            Opcode::Battery => 4,
            // Full-duplex SPI: one byte back per byte shifted out.
            Opcode::ModuleRead => self.payload.len() - 2,
            // Length declared in the sub-frame.
            Opcode::PassThroughRead => self.payload[1] as usize,
        }
    }
}

/// A decoded response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response payload with the status byte stripped.
    pub payload: Vec<u8>,
}

/// Decode `raw` as the response to `frame`.
///
/// The caller guarantees `raw` is complete (short reads are a link timeout,
/// handled by the session); here only the schema is checked.
pub fn decode_response(frame: &CommandFrame, raw: &[u8]) -> RackResult<Response> {
    if raw.len() != frame.response_len() {
        return Err(RackError::MalformedFrame(format!(
            "expected {} response bytes for opcode {:?}, got {}",
            frame.response_len(),
            frame.opcode,
            raw.len()
        )));
    }
    match raw[0] {
        STATUS_ACK => Ok(Response {
            payload: raw[1..].to_vec(),
        }),
        STATUS_NAK => Err(RackError::MalformedFrame(format!(
            "controller rejected opcode {:?}",
            frame.opcode
        ))),
        other => Err(RackError::MalformedFrame(format!(
            "unknown status byte 0x{:02x}",
            other
        ))),
    }
}

fn select_byte(module: u8, chip: u8) -> u8 {
    (chip << 4) | module
}

fn validate_chip(chip: u8) -> RackResult<()> {
    if chip > 15 {
        return Err(RackError::out_of_range("chip number", chip, "0-15"));
    }
    Ok(())
}

/// Controller firmware version as reported by the version query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    /// Major version number.
    pub major: u8,
    /// Minor version number.
    pub minor: u8,
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

/// Both battery rail voltages, in volts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryVoltages {
    /// Positive supply rail.
    pub plus: f64,
    /// Negative supply rail (reported negative).
    pub minus: f64,
}

/// Decode the firmware-version response payload.
pub fn decode_firmware_version(payload: &[u8]) -> RackResult<FirmwareVersion> {
    match payload {
        [major, minor] => Ok(FirmwareVersion {
            major: *major,
            minor: *minor,
        }),
        _ => Err(RackError::MalformedFrame(
            "firmware version payload is not two bytes".into(),
        )),
    }
}

/// Decode the temperature response payload into degrees Celsius.
///
/// The sensor reports a 14-bit two's-complement word at 1/32 °C per count.
pub fn decode_temperature(payload: &[u8]) -> RackResult<f64> {
    let [hi, lo] = payload else {
        return Err(RackError::MalformedFrame(
            "temperature payload is not two bytes".into(),
        ));
    };
    let word = u16::from(*hi) << 8 | u16::from(*lo);
    let word = word & 0x3FFF;
    if word & 0x2000 == 0x2000 {
        Ok((f64::from(word) - 16384.0) / 32.0)
    } else {
        Ok(f64::from(word) / 32.0)
    }
}

/// Decode the battery response payload into rail voltages.
///
/// Two 12-bit ADC words (positive rail first) behind resistive dividers;
/// the divider constants match the controller board.
pub fn decode_battery(payload: &[u8]) -> RackResult<BatteryVoltages> {
    let [p_hi, p_lo, m_hi, m_lo] = payload else {
        return Err(RackError::MalformedFrame(
            "battery payload is not four bytes".into(),
        ));
    };
    let plus_raw = (u16::from(*p_hi) & 0xF) << 8 | u16::from(*p_lo);
    let minus_raw = (u16::from(*m_hi) & 0xF) << 8 | u16::from(*m_lo);
    Ok(BatteryVoltages {
        plus: 2.171 * 3.3 * f64::from(plus_raw) / 4096.0,
        minus: -2.148 * 3.3 * f64::from(minus_raw) / 4096.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> ModuleAddress {
        ModuleAddress::new(n).unwrap()
    }

    #[test]
    fn module_address_bounds() {
        assert!(ModuleAddress::new(0).is_err());
        assert!(ModuleAddress::new(16).is_err());
        assert_eq!(ModuleAddress::new(15).unwrap().get(), 15);
    }

    #[test]
    fn module_write_layout() {
        let frame = CommandFrame::module_write(addr(2), 3, 0, 6, &[0x70, 0x12]).unwrap();
        assert_eq!(frame.encode(), vec![b'w', 0x32, 4, 0, 6, 0x70, 0x12]);
        assert_eq!(frame.response_len(), 1);
    }

    #[test]
    fn module_read_mirrors_shifted_bytes() {
        let frame = CommandFrame::module_read(addr(1), 0, 0, 8, &[0xD0, 0, 0, 0]).unwrap();
        assert_eq!(frame.encode(), vec![b'r', 0x01, 6, 0, 8, 0xD0, 0, 0, 0]);
        assert_eq!(frame.response_len(), 5);
    }

    #[test]
    fn pass_through_read_declares_its_response_length() {
        let frame = CommandFrame::pass_through_read(addr(3), 10, &[1], 4).unwrap();
        assert_eq!(frame.encode(), vec![b'q', 0x03, 3, 10, 4, 1]);
        assert_eq!(frame.response_len(), 5);
    }

    #[test]
    fn pass_through_write_wraps_mcu_subframe() {
        let frame = CommandFrame::pass_through_write(addr(4), 7, &[0, 12]).unwrap();
        // Sub-frame: command with write bit, length, args.
        assert_eq!(frame.encode(), vec![b'p', 0x04, 4, 0x87, 2, 0, 12]);
    }

    #[test]
    fn trigger_flag_sets_opcode_msb() {
        let frame = CommandFrame::module_write(addr(2), 0, 0, 6, &[0x00])
            .unwrap()
            .with_trigger(true);
        assert_eq!(frame.encode()[0], b'w' | 0x80);
    }

    #[test]
    fn oversized_payload_rejected_before_send() {
        let data = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        let err = CommandFrame::module_write(addr(1), 0, 0, 6, &data).unwrap_err();
        assert!(matches!(err, RackError::OutOfRange { .. }));
    }

    #[test]
    fn ack_round_trip() {
        let frame = CommandFrame::module_read(addr(1), 0, 0, 8, &[0, 0]).unwrap();
        let response = decode_response(&frame, &[0x06, 0xAB, 0xCD]).unwrap();
        assert_eq!(response.payload, vec![0xAB, 0xCD]);
    }

    #[test]
    fn nak_is_a_malformed_frame() {
        let frame = CommandFrame::chassis(Opcode::Unlock);
        let err = decode_response(&frame, &[0x15]).unwrap_err();
        assert!(matches!(err, RackError::MalformedFrame(_)));
    }

    #[test]
    fn unknown_status_is_rejected() {
        let frame = CommandFrame::chassis(Opcode::Unlock);
        assert!(decode_response(&frame, &[0x00]).is_err());
    }

    #[test]
    fn temperature_decoding_handles_sign() {
        // 25.0 C = 800 counts.
        assert_eq!(decode_temperature(&[0x03, 0x20]).unwrap(), 25.0);
        // -10.0 C = 16384 - 320 counts.
        let t = decode_temperature(&[0x3E, 0xC0]).unwrap();
        assert!((t - -10.0).abs() < 1e-9);
    }

    #[test]
    fn battery_decoding_applies_dividers() {
        let v = decode_battery(&[0x0F, 0xFF, 0x00, 0x00]).unwrap();
        assert!((v.plus - 2.171 * 3.3 * 4095.0 / 4096.0).abs() < 1e-9);
        assert_eq!(v.minus, 0.0);
    }
}
