//! Link session: the single owner of the controller serial link.
//!
//! One [`LinkSession`] exists per physical link. Every module proxy holds a
//! shared reference to it, and every exchange (module traffic, chassis
//! telemetry, the unlock handshake) funnels through [`LinkSession::send`],
//! which serializes requests because the link is half-duplex
//! request/response with no interleaving support.
//!
//! ## Lock state
//!
//! After controller power-up all traffic is refused as a safety precaution:
//! output modules keep their last state, which can be read back before the
//! host takes over. [`LinkSession::unlock`] lifts the protection once per
//! power cycle; until then every exchange fails fast with
//! [`RackError::LinkLocked`] without touching the transport.
//!
//! ## Trigger arming
//!
//! [`LinkSession::trigger_arm`] sets a session-owned token. The next frame
//! sent, by whichever proxy, carries the trigger modifier and the
//! controller emits a backplane pulse synchronously with that frame's
//! execution. This is how a DAC update and an ADC trigger become atomic from
//! the hardware's perspective even though they are two separate host calls.
//! The token is consumed exactly once; re-arming before consumption
//! overwrites rather than queues.

use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::adapters::Transport;
use crate::error::{RackError, RackResult};
use crate::protocol::frame::{
    self, BatteryVoltages, CommandFrame, FirmwareVersion, Opcode, Response,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Locked,
    Unlocked,
}

struct Inner {
    /// `None` once the session has been closed.
    transport: Option<Box<dyn Transport>>,
    lock_state: LockState,
    trigger_armed: bool,
    firmware: Option<FirmwareVersion>,
    ref_frequency: Option<f64>,
}

/// Exclusive owner of the serial link to the rack controller.
pub struct LinkSession {
    inner: Mutex<Inner>,
}

impl LinkSession {
    /// Take ownership of a freshly opened transport.
    ///
    /// The session starts in the locked state the controller powers up in;
    /// call [`unlock`](Self::unlock) before any module traffic.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                transport: Some(transport),
                lock_state: LockState::Locked,
                trigger_armed: false,
                firmware: None,
                ref_frequency: None,
            }),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lift the controller's power-up write protection.
    ///
    /// No-op (no frame) when the session is already unlocked.
    pub fn unlock(&self) -> RackResult<()> {
        let mut inner = self.lock_inner();
        if inner.lock_state == LockState::Unlocked {
            return Ok(());
        }
        exchange(&mut inner, CommandFrame::chassis(Opcode::Unlock))?;
        inner.lock_state = LockState::Unlocked;
        debug!("link unlocked");
        Ok(())
    }

    /// Re-engage the controller's write protection.
    ///
    /// No-op when the session is already locked.
    pub fn lock(&self) -> RackResult<()> {
        let mut inner = self.lock_inner();
        if inner.lock_state == LockState::Locked {
            return Ok(());
        }
        exchange(&mut inner, CommandFrame::chassis(Opcode::Lock))?;
        inner.lock_state = LockState::Locked;
        debug!("link locked");
        Ok(())
    }

    /// True once [`unlock`](Self::unlock) has succeeded.
    pub fn is_unlocked(&self) -> bool {
        self.lock_inner().lock_state == LockState::Unlocked
    }

    /// Perform one serialized command/response exchange.
    ///
    /// Fails with [`RackError::LinkLocked`] before any transport write while
    /// the session is locked, with [`RackError::LinkTimeout`] when no
    /// complete response arrives in time (the session stays usable), and
    /// with [`RackError::LinkClosed`] after [`close`](Self::close).
    pub fn send(&self, frame: CommandFrame) -> RackResult<Response> {
        let mut inner = self.lock_inner();
        if inner.transport.is_none() {
            return Err(RackError::LinkClosed);
        }
        if inner.lock_state == LockState::Locked {
            return Err(RackError::LinkLocked);
        }
        exchange(&mut inner, frame)
    }

    /// Arm the backplane trigger for the next frame, whatever its target.
    ///
    /// Transmits nothing by itself. Arming twice before a frame is sent
    /// leaves a single pending trigger.
    pub fn trigger_arm(&self) {
        self.lock_inner().trigger_armed = true;
    }

    /// Whether a trigger arm is pending consumption.
    pub fn trigger_pending(&self) -> bool {
        self.lock_inner().trigger_armed
    }

    /// Controller firmware version, cached after the first successful read.
    pub fn get_firmware_version(&self) -> RackResult<FirmwareVersion> {
        if let Some(version) = self.lock_inner().firmware {
            return Ok(version);
        }
        let response = self.send(CommandFrame::chassis(Opcode::FirmwareVersion))?;
        let version = frame::decode_firmware_version(&response.payload)?;
        self.lock_inner().firmware = Some(version);
        Ok(version)
    }

    /// Controller temperature in degrees Celsius.
    pub fn get_temperature(&self) -> RackResult<f64> {
        let response = self.send(CommandFrame::chassis(Opcode::Temperature))?;
        frame::decode_temperature(&response.payload)
    }

    /// Battery rail voltages feeding the analog supplies.
    pub fn get_battery(&self) -> RackResult<BatteryVoltages> {
        let response = self.send(CommandFrame::chassis(Opcode::Battery))?;
        frame::decode_battery(&response.payload)
    }

    /// Record the reference frequency present on the backplane (Hz).
    ///
    /// The reference is shared between all modules; drivers that derive
    /// timing from it read it back with [`ref_frequency`](Self::ref_frequency).
    pub fn set_ref_frequency(&self, frequency: f64) {
        self.lock_inner().ref_frequency = Some(frequency);
    }

    /// The recorded backplane reference frequency, if any.
    pub fn ref_frequency(&self) -> Option<f64> {
        self.lock_inner().ref_frequency
    }

    /// Release the transport. All later calls fail with
    /// [`RackError::LinkClosed`]; closing twice is a no-op.
    pub fn close(&self) {
        let mut inner = self.lock_inner();
        inner.transport = None;
        debug!("link session closed");
    }
}

/// One raw exchange, below the lock gate (used by the unlock sequence too).
///
/// Consumes a pending trigger arm at transmission time: the trigger modifier
/// rides on whichever frame goes out next, even if its response then times
/// out.
fn exchange(inner: &mut Inner, frame: CommandFrame) -> RackResult<Response> {
    let armed = std::mem::take(&mut inner.trigger_armed);
    let frame = frame.with_trigger(armed);

    let transport = inner.transport.as_mut().ok_or(RackError::LinkClosed)?;
    transport.write(&frame.encode())?;

    let expected = frame.response_len();
    let mut raw = vec![0u8; expected];
    let received = transport.read(&mut raw)?;
    if received < expected {
        return Err(RackError::LinkTimeout {
            waited: transport.timeout(),
        });
    }

    frame::decode_response(&frame, &raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::MockTransport;
    use crate::protocol::frame::ModuleAddress;

    const ACK: u8 = 0x06;

    fn unlocked_session() -> (LinkSession, crate::adapters::mock::MockScript) {
        let (transport, script) = MockTransport::new();
        let session = LinkSession::new(Box::new(transport));
        script.push_response([ACK]);
        session.unlock().unwrap();
        script.clear_written();
        (session, script)
    }

    fn write_frame() -> CommandFrame {
        CommandFrame::module_write(ModuleAddress::new(1).unwrap(), 0, 0, 6, &[0x00]).unwrap()
    }

    #[test]
    fn send_while_locked_never_touches_the_transport() {
        let (transport, script) = MockTransport::new();
        let session = LinkSession::new(Box::new(transport));

        let err = session.send(write_frame()).unwrap_err();
        assert!(matches!(err, RackError::LinkLocked));
        assert_eq!(script.write_count(), 0);
    }

    #[test]
    fn unlock_is_idempotent_on_the_wire() {
        let (session, script) = unlocked_session();
        session.unlock().unwrap();
        assert_eq!(script.write_count(), 0);
    }

    #[test]
    fn timeout_leaves_the_session_usable() {
        let (session, script) = unlocked_session();

        // No response scripted: the read comes back short.
        let err = session.send(write_frame()).unwrap_err();
        assert!(matches!(err, RackError::LinkTimeout { .. }));

        script.push_response([ACK]);
        session.send(write_frame()).unwrap();
    }

    #[test]
    fn trigger_token_is_consumed_exactly_once() {
        let (session, script) = unlocked_session();
        session.trigger_arm();
        assert!(session.trigger_pending());

        script.push_response([ACK]);
        script.push_response([ACK]);
        session.send(write_frame()).unwrap();
        session.send(write_frame()).unwrap();

        let written = script.written();
        assert_eq!(written[0][0], b'w' | 0x80);
        assert_eq!(written[1][0], b'w');
        assert!(!session.trigger_pending());
    }

    #[test]
    fn rearming_overwrites_instead_of_queueing() {
        let (session, script) = unlocked_session();
        session.trigger_arm();
        session.trigger_arm();

        script.push_response([ACK]);
        script.push_response([ACK]);
        session.send(write_frame()).unwrap();
        session.send(write_frame()).unwrap();

        let written = script.written();
        assert_eq!(written[0][0], b'w' | 0x80);
        assert_eq!(written[1][0], b'w');
    }

    #[test]
    fn firmware_version_is_cached() {
        let (session, script) = unlocked_session();
        script.push_response([ACK, 1, 6]);

        let v1 = session.get_firmware_version().unwrap();
        let v2 = session.get_firmware_version().unwrap();
        assert_eq!(v1, v2);
        assert_eq!(v1.to_string(), "v1.6");
        assert_eq!(script.write_count(), 1);
    }

    #[test]
    fn close_is_terminal() {
        let (session, _script) = unlocked_session();
        session.close();
        let err = session.send(write_frame()).unwrap_err();
        assert!(matches!(err, RackError::LinkClosed));
        // Closing twice stays a no-op.
        session.close();
    }
}
