//! Identity queries and configuration writes.

use std::sync::atomic::Ordering;
use std::time::Duration;

use aptlink::apt::waiter::block_on;
use aptlink::link::identity::{AllowedDevice, AllowedDevices};
use aptlink::{ConnectionState, DeviceClass, Error, LinkConfig};

use crate::harness::{connected, fast_config, link_with, provider, wait_until};

#[test]
fn query_detected_and_empty_slots() {
    let (link, _sim) = connected();
    let dev = block_on(link.query_device(0)).unwrap();
    assert!(dev.detected);
    assert_eq!(dev.part_number.as_str(), "HDR50");
    assert_eq!(dev.device_id, 0x0042);

    let empty = block_on(link.query_device(5)).unwrap();
    assert_eq!(empty.slot, 5);
    assert!(!empty.detected);
}

#[test]
fn slot_out_of_range_rejected_locally() {
    let (link, sim) = connected();
    assert!(wait_until(Duration::from_secs(1), || link.efs().header_known()));
    let seen = sim.with_model(|m| m.frames_seen());
    assert!(matches!(
        block_on(link.query_device(8)),
        Err(Error::InvalidArgument(_))
    ));
    assert!(link.identify(Some(9)).is_err());
    assert_eq!(sim.with_model(|m| m.frames_seen()), seen);
}

#[test]
fn allowed_devices_round_trip() {
    let (link, _sim) = connected();
    let list = AllowedDevices {
        slot: 2,
        devices: vec![
            AllowedDevice {
                slot_type: 0x10,
                device_id: 0x40,
            },
            AllowedDevice {
                slot_type: 0x10,
                device_id: 0x41,
            },
        ],
    };
    link.set_allowed_devices(&list).unwrap();
    assert_eq!(block_on(link.query_allowed_devices(2)).unwrap(), list);
    assert!(block_on(link.query_allowed_devices(3)).unwrap().devices.is_empty());
}

#[test]
fn serial_number_programming() {
    let (link, sim) = connected();
    assert!(block_on(link.program_serial_number("S70-000999")).unwrap());
    assert_eq!(
        sim.with_model(|m| m.hw_info().serial_number.clone()).as_str(),
        "S70-000999"
    );

    let hw = block_on(link.request_hw_info()).unwrap();
    assert_eq!(hw.serial_number.as_str(), "S70-000999");
    assert_eq!(link.hw_info().unwrap().serial_number.as_str(), "S70-000999");
}

#[test]
fn longest_serial_keeps_its_terminator() {
    let (link, sim) = connected();
    assert!(block_on(link.program_serial_number("0123456789ABCDEFG")).unwrap());
    assert_eq!(
        sim.with_model(|m| m.hw_info().serial_number.clone()).as_str(),
        "0123456789ABCDEFG"
    );
}

#[test]
fn erased_serial_still_connects() {
    let sim = provider(DeviceClass::Application);
    sim.control().erase_serial.store(true, Ordering::Relaxed);
    let link = link_with(&sim, fast_config());

    assert_eq!(link.connect().unwrap(), ConnectionState::Application);
    let hw = link.hw_info().expect("hardware info after handshake");
    assert_eq!(hw.serial_number.as_str(), "");
    assert_eq!(hw.model.as_str(), "MCM301");
    assert_eq!(link.stats().get("handshake").messages, 1);

    assert!(block_on(link.program_serial_number("S70-000777")).unwrap());
    let hw = block_on(link.request_hw_info()).unwrap();
    assert_eq!(hw.serial_number.as_str(), "S70-000777");
}

#[test]
fn serial_number_validated_before_sending() {
    let (link, _sim) = connected();
    for bad in ["", "0123456789ABCDEFGH", "0123456789ABCDEFGHI", "snø"] {
        assert!(matches!(
            block_on(link.program_serial_number(bad)),
            Err(Error::InvalidArgument(_))
        ));
    }
}

#[test]
fn identify_whole_system() {
    let (link, _sim) = connected();
    link.identify(None).unwrap();
    link.identify(Some(3)).unwrap();
}

#[test]
fn queries_need_a_session() {
    let sim = provider(DeviceClass::Application);
    let link = link_with(
        &sim,
        LinkConfig {
            auto_reconnect: false,
            ..fast_config()
        },
    );
    assert_eq!(block_on(link.query_device(0)), Err(Error::NotConnected));
}
