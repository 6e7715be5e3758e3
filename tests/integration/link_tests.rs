//! Session lifecycle: handshake, teardown, reconnect, profile locking.

use std::sync::{Arc, Barrier};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use aptlink::apt::codec::Frame;
use aptlink::apt::protocol::{Command, address};
use aptlink::apt::waiter::block_on;
use aptlink::efs::{Attributes, EFS_PROFILE, FileId};
use aptlink::error::TransportError;
use aptlink::{ConnectionState, DeviceClass, Error, Link, LinkConfig, LinkEvent, Priority};

use crate::harness::{connected, fast_config, link_with, provider, wait_until};

fn probe() -> Frame {
    Frame::short(Command::ModIdentify.id(), 0xFF, 0, address::MOTHERBOARD, address::HOST)
}

#[test]
fn connect_reads_identity_and_efs_header() {
    let (link, _sim) = connected();
    assert_eq!(link.state(), ConnectionState::Application);

    let hw = link.hw_info().expect("hardware info after handshake");
    assert_eq!(hw.serial_number.as_str(), "SIM-000001");
    assert_eq!(hw.slot_count, 8);
    assert_eq!(link.efs().payload_limit(), hw.payload_limit);

    assert!(wait_until(Duration::from_secs(1), || link.efs().header_known()));
    assert_eq!(link.efs().capacity().total_pages, 256);
    assert!(link.stats().get("handshake").messages >= 1);
    assert!(
        link.events()
            .drain_to_vec()
            .contains(&LinkEvent::ConnectionChanged(ConnectionState::Application))
    );
}

#[test]
fn handshake_survives_lost_replies() {
    let sim = provider(DeviceClass::Application);
    sim.control().drop_hw_info.store(2, Ordering::Relaxed);
    let link = link_with(&sim, fast_config());

    assert_eq!(link.connect().unwrap(), ConnectionState::Application);
    assert!(link.hw_info().is_some());
    assert_eq!(link.stats().get("handshake").messages, 3);
}

#[test]
fn handshake_exhaustion_leaves_link_disconnected() {
    let sim = provider(DeviceClass::Application);
    sim.control().drop_hw_info.store(100, Ordering::Relaxed);
    let link = link_with(
        &sim,
        LinkConfig {
            handshake_retries: 2,
            ..fast_config()
        },
    );

    assert_eq!(link.connect(), Err(Error::Timeout("hardware info handshake")));
    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert!(link.hw_info().is_none());
    assert_eq!(link.send_frame("test", &probe()), Err(Error::NotConnected));
}

#[test]
fn bootloader_skips_handshake() {
    let sim = provider(DeviceClass::Bootloader);
    let link = link_with(&sim, fast_config());

    assert_eq!(link.connect().unwrap(), ConnectionState::Bootloader);
    assert!(link.hw_info().is_none());
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(sim.with_model(|m| m.frames_seen()), 0);
    assert!(!link.efs().header_known());
}

#[test]
fn ftdi_bridge_uses_slower_pacing() {
    let sim = provider(DeviceClass::FtdiBridge);
    let link = link_with(&sim, fast_config());
    link.connect().unwrap();
    assert_eq!(link.scheduler().cooldown(), Duration::from_millis(2));
}

#[test]
fn refused_open_is_a_transport_error() {
    let sim = provider(DeviceClass::Application);
    sim.control().refuse_open.store(true, Ordering::Relaxed);
    let link = link_with(&sim, fast_config());
    assert_eq!(link.connect(), Err(Error::Transport(TransportError::OpenFailed)));
    assert_eq!(link.state(), ConnectionState::Disconnected);
}

#[test]
fn fault_tears_down_before_anything_else() {
    let (link, sim) = connected();
    let id = FileId::new(1, 2);
    block_on(link.efs().upload(id, Attributes::ALL, b"keep me")).unwrap();
    assert_eq!(link.efs().files().len(), 1);
    link.events().drain_to_vec();

    sim.unplug();
    let mut last = Ok(());
    assert!(wait_until(Duration::from_secs(2), || {
        last = link.send_frame("test", &probe());
        last.is_err()
    }));

    assert_eq!(last, Err(Error::NotConnected));
    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert!(link.efs().files().is_empty());
    assert!(!link.efs().header_known());
    assert!(link.hw_info().is_none());
    assert_eq!(link.scheduler().pending(), 0);
    let events = link.events().drain_to_vec();
    assert!(events.contains(&LinkEvent::ConnectionChanged(ConnectionState::Disconnected)));
    assert!(events.contains(&LinkEvent::EfsFilesChanged));
    assert_eq!(sim.open_count(), 1);
}

#[test]
fn auto_reconnect_after_fault() {
    let sim = provider(DeviceClass::Application);
    let link = link_with(
        &sim,
        LinkConfig {
            auto_reconnect: true,
            ..fast_config()
        },
    );
    link.connect().unwrap();

    sim.unplug();
    assert!(wait_until(Duration::from_secs(2), || {
        let _ = link.send_frame("test", &probe());
        sim.open_count() == 2
    }));
    assert_eq!(link.state(), ConnectionState::Application);
    assert!(link.hw_info().is_some());
}

#[test]
fn senders_racing_a_fault_reconnect_once() {
    let sim = provider(DeviceClass::Application);
    let link = Arc::new(link_with(
        &sim,
        LinkConfig {
            auto_reconnect: true,
            ..fast_config()
        },
    ));
    link.connect().unwrap();

    sim.unplug();
    assert!(wait_until(Duration::from_secs(2), || link.pending_fault().is_some()));

    let barrier = Arc::new(Barrier::new(2));
    let senders: Vec<_> = (0..2)
        .map(|_| {
            let (l, b) = (link.clone(), barrier.clone());
            std::thread::spawn(move || {
                b.wait();
                l.send_frame("test", &probe())
            })
        })
        .collect();
    for sender in senders {
        assert_eq!(sender.join().unwrap(), Ok(()));
    }

    assert_eq!(sim.open_count(), 2);
    assert_eq!(link.state(), ConnectionState::Application);
    assert!(link.pending_fault().is_none());
    assert!(block_on(link.query_device(0)).unwrap().detected);
}

#[test]
fn disconnect_then_reconnect() {
    let (link, sim) = connected();
    link.disconnect();
    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert_eq!(link.send_frame("test", &probe()), Err(Error::NotConnected));

    assert_eq!(link.connect().unwrap(), ConnectionState::Application);
    assert_eq!(sim.open_count(), 2);
    assert!(wait_until(Duration::from_secs(1), || link.efs().header_known()));
}

#[test]
fn other_profiles_wait_for_the_holder() {
    let (link, _sim) = connected();
    let link = Arc::new(link);
    let guard = link.profile_lock().acquire("bulk");
    link.send_frame("bulk", &probe()).unwrap();

    let sent = Arc::new(AtomicBool::new(false));
    let (l, s) = (link.clone(), sent.clone());
    let other = std::thread::spawn(move || {
        l.send_frame("poll", &probe()).unwrap();
        s.store(true, Ordering::Release);
    });

    std::thread::sleep(Duration::from_millis(50));
    assert!(!sent.load(Ordering::Acquire));
    drop(guard);
    other.join().unwrap();
    assert!(sent.load(Ordering::Acquire));
    assert_eq!(link.stats().get("poll").messages, 1);
}

#[test]
fn schedule_does_not_wait_for_profile_lock() {
    let (link, _sim) = connected();
    let _guard = link.profile_lock().acquire(EFS_PROFILE);
    link.schedule("poll", probe().encode().unwrap(), Priority::LOW)
        .unwrap();
    assert_eq!(link.stats().get("poll").messages, 1);
}

#[test]
fn caller_routes_run_alongside_built_in_ones() {
    let sim = provider(DeviceClass::Application);
    let hits = Arc::new(AtomicU32::new(0));
    let h = hits.clone();
    let link = Link::builder(sim.clone())
        .config(fast_config())
        .on_id(Command::GetDevice.id(), move |inb| {
            assert_eq!(inb.payload()[0], 0);
            h.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .build()
        .unwrap();
    link.connect().unwrap();

    let dev = block_on(link.query_device(0)).unwrap();
    assert!(dev.detected);
    assert_eq!(hits.load(Ordering::Relaxed), 1);
    assert!(wait_until(Duration::from_secs(1), || {
        link.dispatch_counters().routed >= 2
    }));
}
