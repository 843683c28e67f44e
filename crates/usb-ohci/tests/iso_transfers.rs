//! Isochronous streams: one TD per packet, per-packet status words, and the
//! splice of the iso chain into every interrupt-tree branch.

mod util;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use usb_hcd::{
    callback, DeviceId, Direction, IsoPacket, Pipe, TransferType, Urb, UrbStatus, UsbSpeed,
};
use util::{harness, run_frames, EpScript};

fn iso_pipe(device: DeviceId, direction: Direction) -> Pipe {
    Pipe {
        device,
        endpoint: 3,
        direction,
        transfer: TransferType::Isochronous,
        speed: UsbSpeed::Full,
        max_packet: 16,
    }
}

fn packets(count: usize, size: usize) -> Vec<IsoPacket> {
    (0..count)
        .map(|i| IsoPacket {
            offset: i * size,
            length: size,
            actual_length: 0,
            status: None,
        })
        .collect()
}

#[test]
fn iso_out_streams_one_packet_per_frame() {
    let (hcd, sim) = harness();
    let dev = hcd.alloc_device(UsbSpeed::Full).unwrap();
    sim.script(dev.address(), 3, EpScript::AcceptOut);

    let buffer: Vec<u8> = (0..48u8).collect();
    let done = Arc::new(Mutex::new(None));
    let done2 = done.clone();
    let urb = Urb::isochronous(
        iso_pipe(dev, Direction::Out),
        buffer.clone(),
        packets(3, 16),
        callback(move |urb| {
            *done2.lock().unwrap() = Some((urb.status, urb.actual_length, urb.iso_packets.clone()));
        }),
    );
    hcd.submit(urb).unwrap();

    // Start frame is "as soon as possible": current + 2, one packet per
    // subsequent frame.
    run_frames(&hcd, &sim, 8);

    let (status, actual, pkts) = done.lock().unwrap().take().expect("giveback");
    assert_eq!(status, UrbStatus::Ok);
    assert_eq!(actual, 48);
    for p in &pkts {
        assert_eq!(p.actual_length, 16);
        assert_eq!(p.status, None);
    }
    assert_eq!(sim.sink(dev.address(), 3), buffer);
}

#[test]
fn iso_in_records_per_packet_lengths() {
    let (hcd, sim) = harness();
    let dev = hcd.alloc_device(UsbSpeed::Full).unwrap();
    sim.script(
        dev.address(),
        3,
        EpScript::InData(VecDeque::from([b"abcd".to_vec(), b"efgh".to_vec()])),
    );

    let done = Arc::new(Mutex::new(None));
    let done2 = done.clone();
    let urb = Urb::isochronous(
        iso_pipe(dev, Direction::In),
        vec![0; 32],
        packets(2, 16),
        callback(move |urb| {
            *done2.lock().unwrap() = Some((urb.status, urb.buffer.clone(), urb.iso_packets.clone()));
        }),
    );
    hcd.submit(urb).unwrap();
    run_frames(&hcd, &sim, 8);

    let (status, buffer, pkts) = done.lock().unwrap().take().expect("giveback");
    assert_eq!(status, UrbStatus::Ok);
    assert_eq!(pkts[0].actual_length, 4);
    assert_eq!(pkts[1].actual_length, 4);
    assert_eq!(&buffer[..4], b"abcd");
    assert_eq!(&buffer[16..20], b"efgh");
}

#[test]
fn iso_chain_is_reachable_from_every_interrupt_slot() {
    let (hcd, sim) = harness();
    let dev = hcd.alloc_device(UsbSpeed::Full).unwrap();
    sim.script(dev.address(), 3, EpScript::AcceptOut);

    let urb = Urb::isochronous(
        iso_pipe(dev, Direction::Out),
        vec![0; 16],
        packets(1, 16),
        callback(|_| {}),
    );
    hcd.submit(urb).unwrap();

    // With no interrupt EDs, every slot points straight at the iso head.
    let head = sim.scan_periodic_slot(0);
    assert_eq!(head.len(), 1);
    for slot in 0..32 {
        assert_eq!(sim.scan_periodic_slot(slot), head);
    }
}
