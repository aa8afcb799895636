//! Link-level integration tests: lock handshake, serialization guarantees,
//! trigger token and chassis telemetry, all driven through a scripted mock
//! transport standing in for the controller.

use std::sync::Arc;

use modrack::adapters::mock::{MockScript, MockTransport};
use modrack::modules::AdcModule;
use modrack::{LinkSession, RackError};

const ACK: u8 = 0x06;
const NAK: u8 = 0x15;

fn session() -> (Arc<LinkSession>, MockScript) {
    let (transport, script) = MockTransport::new();
    (Arc::new(LinkSession::new(Box::new(transport))), script)
}

fn unlocked_session() -> (Arc<LinkSession>, MockScript) {
    let (link, script) = session();
    script.push_response([ACK]);
    link.unlock().unwrap();
    script.clear_written();
    (link, script)
}

#[test]
fn unlock_sends_the_unlock_sequence_once() {
    let (link, script) = session();
    script.push_response([ACK]);

    link.unlock().unwrap();
    link.unlock().unwrap(); // second call is a no-op

    assert_eq!(script.written(), vec![vec![b'u', 0, 0]]);
}

#[test]
fn module_traffic_before_unlock_fails_without_touching_the_transport() {
    let (link, script) = session();
    let adc = AdcModule::new(link, 3).unwrap();

    let err = adc.set_trigger_count(1).unwrap_err();
    assert!(matches!(err, RackError::LinkLocked));
    assert_eq!(script.write_count(), 0);
}

#[test]
fn chassis_queries_are_gated_by_the_lock_too() {
    let (link, script) = session();
    let err = link.get_temperature().unwrap_err();
    assert!(matches!(err, RackError::LinkLocked));
    assert_eq!(script.write_count(), 0);
}

#[test]
fn chassis_telemetry_decodes_typed_values() {
    let (link, script) = unlocked_session();

    script.push_response([ACK, 1, 6]);
    script.push_response([ACK, 0x03, 0x20]);
    script.push_response([ACK, 0x0A, 0xAA, 0x08, 0x00]);

    assert_eq!(link.get_firmware_version().unwrap().to_string(), "v1.6");
    assert_eq!(link.get_temperature().unwrap(), 25.0);

    let battery = link.get_battery().unwrap();
    assert!((battery.plus - 2.171 * 3.3 * 2730.0 / 4096.0).abs() < 1e-9);
    assert!((battery.minus - -2.148 * 3.3 * 2048.0 / 4096.0).abs() < 1e-9);
    assert!(battery.minus < 0.0);

    // Chassis frames all target the controller's reserved address.
    for frame in script.written() {
        assert_eq!(frame[1], 0);
    }
}

#[test]
fn trigger_arm_rides_on_the_next_frame_from_any_module() {
    let (link, script) = unlocked_session();
    let adc = AdcModule::new(link.clone(), 3).unwrap();

    link.trigger_arm();
    script.push_response([ACK]);
    script.push_response([ACK]);

    adc.software_trigger().unwrap(); // consumes the token
    adc.software_trigger().unwrap(); // plain frame again

    let written = script.written();
    assert_eq!(written[0][0], b'p' | 0x80);
    assert_eq!(written[1][0], b'p');
    assert!(!link.trigger_pending());
}

#[test]
fn timeout_is_recoverable_and_preserves_ordering() {
    let (link, script) = unlocked_session();
    let adc = AdcModule::new(link, 3).unwrap();

    // Nothing scripted: the exchange times out.
    let err = adc.set_trigger_count(5).unwrap_err();
    assert!(matches!(err, RackError::LinkTimeout { .. }));

    // The session stays usable and the retry goes out as a fresh frame.
    script.push_response([ACK]);
    adc.set_trigger_count(5).unwrap();
    assert_eq!(script.write_count(), 2);
    assert_eq!(script.written()[0], script.written()[1]);
}

#[test]
fn nak_surfaces_as_malformed_frame() {
    let (link, script) = unlocked_session();
    let adc = AdcModule::new(link, 3).unwrap();

    script.push_response([NAK]);
    let err = adc.software_trigger().unwrap_err();
    assert!(matches!(err, RackError::MalformedFrame(_)));
}

#[test]
fn closed_session_refuses_all_traffic() {
    let (link, _script) = unlocked_session();
    let adc = AdcModule::new(link.clone(), 3).unwrap();

    link.close();
    assert!(matches!(
        adc.software_trigger().unwrap_err(),
        RackError::LinkClosed
    ));
    assert!(matches!(
        link.get_temperature().unwrap_err(),
        RackError::LinkClosed
    ));
}

#[test]
fn proxy_validation_rejects_bad_addresses_before_any_frame() {
    let (link, script) = unlocked_session();
    assert!(AdcModule::new(link.clone(), 0).is_err());
    assert!(AdcModule::new(link, 16).is_err());
    assert_eq!(script.write_count(), 0);
}
