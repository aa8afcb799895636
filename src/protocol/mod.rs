//! Wire protocol for the rack controller link.
//!
//! The codec in [`frame`] is pure: it builds and validates byte frames but
//! never touches a transport. Everything stateful (locking, serialization,
//! the trigger token) lives in [`crate::session`].

pub mod frame;

pub use frame::{
    BatteryVoltages, CommandFrame, FirmwareVersion, ModuleAddress, Opcode, Response,
    MAX_FRAME_PAYLOAD, RESERVED_ADDRESS,
};
