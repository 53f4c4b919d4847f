#![no_main]

use arbitrary::Arbitrary;
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use peerwire_transport::{
    array::PacketArray,
    request::{self, Outbound},
};

const CAPACITY: usize = 64;

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    start: u8,
    count: u8,
    sent_at: Vec<Option<u16>>,
    packet: Vec<u8>,
    rtt: u16,
    now: u16,
}

fn fuzz(input: FuzzInput) {
    let mut send = PacketArray::new(CAPACITY);
    let start = (input.start as usize % CAPACITY) as u32;
    send.set_end(start).unwrap();
    send.clear_until(start).unwrap();
    let count = (input.count as usize).min(CAPACITY);
    for i in 0..count {
        let mut outbound = Outbound::new(Bytes::from_static(&[16]));
        outbound.sent_at = input.sent_at.get(i).copied().flatten().map(u64::from);
        send.push(outbound).unwrap();
    }
    let before = send.len();

    let _ = request::handle(&mut send, &input.packet, input.rtt as u64, input.now as u64);

    // A request frees entries but never moves the window
    assert_eq!(send.len(), before);
    assert_eq!(send.start(), start);
}

fuzz_target!(|input: FuzzInput| {
    fuzz(input);
});
