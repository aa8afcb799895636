//! Driver-level scenarios against a scripted controller: the DAC voltage
//! step contract, the acquisition run/poll/fetch cycle and the waveform
//! upload semantics.

use std::sync::Arc;

use modrack::adapters::mock::{MockScript, MockTransport};
use modrack::modules::adc::TriggerSource;
use modrack::modules::awg;
use modrack::modules::{AdcModule, AwgModule, ClockSource, DacModule};
use modrack::{LinkSession, RackError};

const ACK: u8 = 0x06;

fn unlocked_session() -> (Arc<LinkSession>, MockScript) {
    let (transport, script) = MockTransport::new();
    let link = Arc::new(LinkSession::new(Box::new(transport)));
    script.push_response([ACK]);
    link.unlock().unwrap();
    script.clear_written();
    (link, script)
}

/// Script the 16-channel register readback a DAC constructor performs:
/// every channel reports mid-scale (0 V) in the ±4 V span.
fn script_dac_readback(script: &MockScript) {
    for _ in 0..16 {
        script.push_response([ACK, 0, 0x80, 0, 0]); // code 0x20000
        script.push_response([ACK, 0, 0, 2, 0]); // span: ±4 V
    }
}

fn dac_code_of(frame: &[u8]) -> u32 {
    // [opcode][select][len][mode][speed][d0][d1][d2][d3]
    assert_eq!(frame[0], b'w');
    u32::from(frame[6]) << 10 | u32::from(frame[7]) << 2 | u32::from(frame[8]) >> 6
}

#[test]
fn dac_constructor_reads_back_without_resetting() {
    let (link, script) = unlocked_session();
    script_dac_readback(&script);

    let dac = DacModule::new(link, 2, false).unwrap();
    assert_eq!(script.write_count(), 32);
    assert_eq!(dac.voltage(0), Some(0.0));
    assert_eq!(dac.span(0), Some(modrack::modules::dac::Span::Bi4V));
}

#[test]
fn one_step_size_moves_the_register_by_exactly_one_code() {
    let (link, script) = unlocked_session();
    script_dac_readback(&script);
    let mut dac = DacModule::new(link, 2, false).unwrap();
    script.clear_written();

    let step = dac.step_size(0).unwrap();
    assert!(step > 0.0);

    script.push_response([ACK]);
    dac.set_voltage(0, 2.1).unwrap();
    script.push_response([ACK]);
    dac.set_voltage(0, 2.1 + step).unwrap();

    let written = script.written();
    let first = dac_code_of(&written[0]);
    let second = dac_code_of(&written[1]);
    assert_eq!(second, first + 1);
}

#[test]
fn out_of_span_requests_clamp_to_the_rails() {
    let (link, script) = unlocked_session();
    script_dac_readback(&script);
    let mut dac = DacModule::new(link, 2, false).unwrap();
    script.clear_written();

    script.push_response([ACK]);
    dac.set_voltage(0, 99.0).unwrap();
    assert_eq!(dac_code_of(&script.written()[0]), (1 << 18) - 1);
    assert_eq!(dac.voltage(0), Some(4.0));

    script.push_response([ACK]);
    dac.set_voltage(0, -99.0).unwrap();
    assert_eq!(dac_code_of(&script.written()[1]), 0);
    assert_eq!(dac.voltage(0), Some(-4.0));
}

#[test]
fn dac_validation_fails_before_any_frame() {
    let (link, script) = unlocked_session();
    script_dac_readback(&script);
    let mut dac = DacModule::new(link, 2, false).unwrap();
    script.clear_written();

    assert!(matches!(
        dac.set_voltage(16, 0.0).unwrap_err(),
        RackError::OutOfRange { .. }
    ));
    assert!(matches!(
        dac.set_code(0, 1 << 18).unwrap_err(),
        RackError::OutOfRange { .. }
    ));
    assert_eq!(script.write_count(), 0);
}

#[test]
fn acquisition_cycle_returns_the_configured_sample_count() {
    let (link, script) = unlocked_session();
    let adc = AdcModule::new(link, 3).unwrap();

    // Configure: software trigger, one trigger, no hold-off, 10000 samples.
    for _ in 0..5 {
        script.push_response([ACK]);
    }
    adc.set_trigger_source(TriggerSource::Software).unwrap();
    adc.set_trigger_count(1).unwrap();
    adc.set_holdoff_time(0.0).unwrap();
    adc.set_sample_count(0, 10_000).unwrap();
    adc.set_enabled(0, true).unwrap();

    script.push_response([ACK]);
    adc.software_trigger().unwrap();

    // Module reports running, then idle.
    script.push_response([ACK, 0x01]);
    assert!(adc.is_running().unwrap());

    // Fetching while running is NotReady, not an error to abandon on.
    script.push_response([ACK, 0x01]);
    assert!(matches!(adc.get_data().unwrap_err(), RackError::NotReady));

    script.push_response([ACK, 0x00]);
    assert!(!adc.is_running().unwrap());

    // Fetch: idle check, channel 0 enabled, 30000 bytes of data drained in
    // 120-byte chunks, channel 1 disabled.
    script.push_response([ACK, 0x00]);
    script.push_response([ACK, 1]);
    script.push_response([ACK, 0x00, 0x00, 0x75, 0x30]); // 30000 bytes
    for _ in 0..250 {
        script.push_response([ACK]); // read-window command
        let mut chunk = vec![ACK];
        for _ in 0..40 {
            chunk.extend_from_slice(&[0x80, 0x00, 0x00]); // mid-scale = 0 V
        }
        script.push_response(chunk);
    }
    script.push_response([ACK, 0]); // channel 1 disabled

    let (channel0, channel1) = adc.get_data().unwrap();
    let samples = channel0.unwrap();
    assert_eq!(samples.len(), 10_000);
    assert!(samples.iter().all(|v| *v == 0.0));
    assert!(channel1.is_none());
}

#[test]
fn adc_validation_fails_before_any_frame() {
    let (link, script) = unlocked_session();
    let mut adc = AdcModule::new(link, 3).unwrap();

    assert!(adc.set_filter_rate(0, 21).is_err());
    assert!(adc.set_filter_rate(2, 0).is_err());
    assert!(adc.set_sample_count(2, 100).is_err());
    assert!(adc.set_holdoff_time(-1.0).is_err());
    assert_eq!(script.write_count(), 0);
}

#[test]
fn waveform_upload_is_idempotent_on_the_wire() {
    let (link, script) = unlocked_session();
    let mut awg = AwgModule::new(link, 5).unwrap();

    let samples: Vec<i16> = (0..100i16).map(|i| i * 20 - 1000).collect();

    // RAM-access halt, two sample chunks, halt release, window + commit.
    for _ in 0..7 {
        script.push_response([ACK]);
    }
    awg.upload_waveform(0, &samples, 0, true).unwrap();
    let first_upload = script.written();
    script.clear_written();

    for _ in 0..7 {
        script.push_response([ACK]);
    }
    awg.upload_waveform(0, &samples, 0, true).unwrap();
    assert_eq!(script.written(), first_upload);

    // Read-back window matches a single upload of 100 samples at offset 0.
    script.push_response([ACK, 0, 0, 0x00, 0x00]);
    script.push_response([ACK, 0, 0, 0x00, 0x63]);
    assert_eq!(awg.ram_window(0).unwrap(), (0, 100));
}

#[test]
fn shared_ram_windows_are_supported() {
    let (link, script) = unlocked_session();
    let mut awg = AwgModule::new(link, 5).unwrap();

    // Upload once without binding, then point two channels at the window.
    for _ in 0..4 {
        script.push_response([ACK]); // halt, chunk, release, commit
    }
    let table: Vec<i16> = vec![0; 32];
    awg.upload_waveform(0, &table, 256, false).unwrap();

    for _ in 0..6 {
        script.push_response([ACK]);
    }
    awg.set_ram_address(0, 256, 32).unwrap();
    awg.set_ram_address(1, 256, 32).unwrap();
}

#[test]
fn missing_external_clock_falls_back_to_internal() {
    let (link, script) = unlocked_session();
    let mut awg = AwgModule::new(link, 5).unwrap();

    script.push_response([ACK, 0x00]); // status pins: no external clock
    script.push_response([ACK]); // internal source re-selected

    let effective = awg.set_clock_source(ClockSource::External).unwrap();
    assert_eq!(effective, ClockSource::Internal);
    assert_eq!(awg.clock_source(), ClockSource::Internal);
}

#[test]
fn trigger_delay_compensation_converts_between_clock_domains() {
    let (link, script) = unlocked_session();
    let mut awg = AwgModule::new(link, 5).unwrap();

    script.push_response([ACK]);
    awg.set_clock_division(0, 2).unwrap();
    script.push_response([ACK]);
    awg.set_clock_division(4, 4).unwrap();
    script.clear_written();

    for _ in 0..4 {
        script.push_response([ACK]);
    }
    awg.compensate_trigger_delay().unwrap();

    let written = script.written();
    // Chip 0 waits out chip 1's pipeline (14 cycles at twice its period).
    assert_eq!(&written[0][5..9], &[0x00, 0x20, 0x00, 28]);
    // Chip 1 sees chip 0's pipeline shrunk into its slower clock.
    assert_eq!(&written[1][5..9], &[0x00, 0x20, 0x00, 7]);
}

#[test]
fn awg_validation_fails_before_any_frame() {
    let (link, script) = unlocked_session();
    let mut awg = AwgModule::new(link, 5).unwrap();

    assert!(awg.set_clock_division(0, 3).is_err());
    assert!(awg.set_clock_division(0, 512).is_err());
    assert!(awg.set_digital_gain(0, 2.5).is_err());
    assert!(awg.upload_waveform(0, &[0; 8], awg::RAM_WORDS - 4, true).is_err());
    assert!(awg.upload_waveform(0, &[4096], 0, true).is_err());
    assert!(awg.set_ram_address(8, 0, 16).is_err());
    assert_eq!(script.write_count(), 0);
}
