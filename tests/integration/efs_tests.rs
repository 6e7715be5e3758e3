//! EFS client over a live session.

use std::sync::atomic::Ordering;
use std::time::Duration;

use aptlink::apt::waiter::block_on;
use aptlink::efs::{Attributes, FileId};
use aptlink::error::{Error, ProtocolViolation};

use crate::harness::{connected, wait_until};

#[test]
fn upload_then_read_back_in_pieces() {
    let (link, sim) = connected();
    let id = FileId::new(4, 1);
    let data: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();

    let file = block_on(link.efs().upload(id, Attributes::ALL, &data)).unwrap();
    assert_eq!(file.page_length(), 16);
    assert_eq!(block_on(file.read(0, 1000)).unwrap(), data);
    assert_eq!(block_on(file.read(500, 20)).unwrap(), &data[500..520]);

    let stored = sim.with_model(|m| m.file_data(id).map(|d| d[..1000].to_vec()));
    assert_eq!(stored, Some(data));
}

#[test]
fn local_counters_track_the_device() {
    let (link, sim) = connected();
    let efs = link.efs();
    block_on(async {
        efs.create(FileId::new(0, 1), Attributes::ALL, 100).await.unwrap().unwrap();
        efs.create(FileId::new(0, 2), Attributes::ALL, 1).await.unwrap().unwrap();
        assert!(efs.delete(FileId::new(0, 1)).await.unwrap());
    });
    let local = efs.capacity();
    let device = sim.with_model(|m| m.capacity());
    assert_eq!(local.files_remaining, device.files_remaining);
    assert_eq!(local.pages_remaining, device.pages_remaining);

    let refreshed = block_on(efs.refresh_header()).unwrap();
    assert_eq!(refreshed, device);
}

#[test]
fn delete_of_missing_file_is_false() {
    let (link, _sim) = connected();
    assert!(wait_until(Duration::from_secs(1), || link.efs().header_known()));
    let before = link.efs().capacity();
    assert!(!block_on(link.efs().delete(FileId::new(7, 31))).unwrap());
    assert_eq!(link.efs().capacity(), before);
}

#[test]
fn scan_finds_preloaded_files() {
    let (link, sim) = connected();
    sim.with_model(|m| {
        m.preload(FileId::new(1, 1), Attributes::APT_READ, b"alpha");
        m.preload(FileId::new(6, 9), Attributes::ALL, &[0u8; 300]);
    });

    let found = block_on(link.efs().lookup_all()).unwrap();
    let ids: Vec<FileId> = found.iter().map(|f| f.identifier()).collect();
    assert_eq!(ids, vec![FileId::new(1, 1), FileId::new(6, 9)]);
    assert_eq!(found[1].page_length(), 5);
    assert_eq!(link.efs().files().len(), 2);
    assert_eq!(
        block_on(found[0].read(0, 5)).unwrap(),
        b"alpha".to_vec()
    );
}

#[test]
fn files_survive_reconnect_on_the_device_only() {
    let (link, _sim) = connected();
    let id = FileId::new(2, 2);
    block_on(link.efs().upload(id, Attributes::ALL, b"persist")).unwrap();

    link.disconnect();
    assert!(link.efs().file(id).is_none());

    link.connect().unwrap();
    let file = block_on(link.efs().lookup(id)).unwrap().expect("still on device");
    assert_eq!(block_on(file.read(0, 7)).unwrap(), b"persist".to_vec());
}

#[test]
fn corrupted_read_address_fails_the_read() {
    let (link, sim) = connected();
    let id = FileId::new(3, 3);
    let file = block_on(link.efs().upload(id, Attributes::ALL, &[1, 2, 3, 4])).unwrap();

    sim.control().corrupt_read_address.store(true, Ordering::Relaxed);
    assert_eq!(
        block_on(file.read(2, 2)),
        Err(Error::Protocol(ProtocolViolation::AddressMismatch {
            expected: 2,
            actual: 3
        }))
    );
}

#[test]
fn silent_device_times_out_reads() {
    let (link, sim) = connected();
    let id = FileId::new(3, 4);
    let file = block_on(link.efs().upload(id, Attributes::ALL, &[9; 8])).unwrap();

    sim.control().silence_efs.store(true, Ordering::Relaxed);
    assert_eq!(block_on(file.read(0, 8)), Err(Error::Timeout("EFS file data")));
    assert!(block_on(link.efs().lookup(id)).unwrap().is_none());
    // A timed-out lookup does not forget the file.
    assert!(link.efs().file(id).is_some());
}
