//! Request packets: the receiver's list of holes in its receive window.
//!
//! A request packet is `[1]` followed by one byte per missing sequence number giving its distance
//! from the previous one (the first distance is counted from `start - 1`). Longer runs are split
//! with `0` bytes, each advancing 255 positions without marking a hole.
//!
//! On the sending side every entry before the last listed hole that is not itself listed must
//! have been received, so it is freed.

use crate::{array::PacketArray, packet::MAX_DATA_SIZE, packet::PACKET_ID_REQUEST, Error};
use bytes::Bytes;

/// A lossless packet waiting in the send array.
#[derive(Clone, Debug)]
pub struct Outbound {
    /// Packet id followed by application bytes.
    pub data: Bytes,

    /// When the packet was last sent, or `None` if it must be (re)sent.
    pub sent_at: Option<u64>,
}

impl Outbound {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            sent_at: None,
        }
    }
}

/// The effect of a request packet on the send array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Acknowledged {
    /// Number of holes the peer reported.
    pub requested: u32,

    /// Most recent send time among the entries freed by the request.
    pub latest_sent: Option<u64>,
}

/// Describe the holes in `recv`.
pub fn generate(recv: &PacketArray<Bytes>) -> Vec<u8> {
    let mut packet = vec![PACKET_ID_REQUEST];
    let mut n: u32 = 1;
    for number in recv.numbers() {
        if packet.len() >= MAX_DATA_SIZE {
            break;
        }
        if recv.get(number).is_none() {
            packet.push(n as u8);
            n = 0;
        } else if n == 255 {
            packet.push(0);
            n = 0;
        }
        n += 1;
    }
    packet
}

/// Apply a request packet to the send array.
///
/// Requested entries sent more than `rtt` ago are marked for resend. Entries the request implies
/// were received are freed.
pub fn handle(
    send: &mut PacketArray<Outbound>,
    packet: &[u8],
    rtt: u64,
    now: u64,
) -> Result<Acknowledged, Error> {
    let Some((&PACKET_ID_REQUEST, mut holes)) = packet.split_first() else {
        return Err(Error::MalformedRequest);
    };

    let mut ack = Acknowledged::default();
    let mut n: u32 = 1;
    let numbers: Vec<u32> = send.numbers().collect();
    for number in numbers {
        let Some((&distance, rest)) = holes.split_first() else {
            break;
        };
        if n == distance as u32 {
            if let Some(entry) = send.get_mut(number) {
                if let Some(sent_at) = entry.sent_at {
                    if sent_at.saturating_add(rtt) < now {
                        entry.sent_at = None;
                    }
                }
            }
            holes = rest;
            n = 0;
            ack.requested += 1;
        } else if let Some(entry) = send.remove(number) {
            if let Some(sent_at) = entry.sent_at {
                ack.latest_sent = Some(ack.latest_sent.map_or(sent_at, |l| l.max(sent_at)));
            }
        }

        if n == 255 {
            n = 1;
            match holes.split_first() {
                Some((0, rest)) => holes = rest,
                _ => return Err(Error::MalformedRequest),
            }
        } else {
            n += 1;
        }
    }
    Ok(ack)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receive_array(
        capacity: usize,
        present: impl IntoIterator<Item = u32>,
    ) -> PacketArray<Bytes> {
        let mut array = PacketArray::new(capacity);
        for n in present {
            array.insert(n, Bytes::from_static(&[16])).unwrap();
        }
        array
    }

    fn send_array(capacity: usize, count: u32, sent_at: u64) -> PacketArray<Outbound> {
        let mut array = PacketArray::new(capacity);
        for _ in 0..count {
            let number = array
                .push(Outbound::new(Bytes::from_static(&[16])))
                .unwrap();
            array.get_mut(number).unwrap().sent_at = Some(sent_at);
        }
        array
    }

    #[test]
    fn test_generate_no_holes() {
        assert_eq!(generate(&receive_array(16, [])), vec![PACKET_ID_REQUEST]);
        assert_eq!(generate(&receive_array(16, 0..4)), vec![PACKET_ID_REQUEST]);
    }

    #[test]
    fn test_generate_holes() {
        let recv = receive_array(16, [0, 2, 4]);
        assert_eq!(generate(&recv), vec![PACKET_ID_REQUEST, 2, 2]);

        let recv = receive_array(16, [3]);
        assert_eq!(generate(&recv), vec![PACKET_ID_REQUEST, 1, 1, 1]);
    }

    #[test]
    fn test_handle_holes() {
        let recv = receive_array(16, [0, 2, 4]);
        let mut send = send_array(16, 5, 10);

        let ack = handle(&mut send, &generate(&recv), 5, 100).unwrap();
        assert_eq!(ack.requested, 2);
        assert_eq!(ack.latest_sent, Some(10));

        // Received entries are freed, holes marked for resend
        assert!(send.get(0).is_none());
        assert!(send.get(2).is_none());
        assert_eq!(send.get(1).unwrap().sent_at, None);
        assert_eq!(send.get(3).unwrap().sent_at, None);

        // Nothing is known about entries after the last hole
        assert_eq!(send.get(4).unwrap().sent_at, Some(10));
    }

    #[test]
    fn test_handle_recently_sent() {
        let recv = receive_array(16, [0, 2]);
        let mut send = send_array(16, 3, 98);

        // Sent less than one rtt ago so not resent yet
        let ack = handle(&mut send, &generate(&recv), 5, 100).unwrap();
        assert_eq!(ack.requested, 1);
        assert_eq!(send.get(1).unwrap().sent_at, Some(98));
    }

    #[test]
    fn test_long_run() {
        let recv = receive_array(512, (0..300).chain([301]));
        let packet = generate(&recv);
        assert_eq!(packet, vec![PACKET_ID_REQUEST, 0, 46]);

        let mut send = send_array(512, 302, 1);
        let ack = handle(&mut send, &packet, 1, 100).unwrap();
        assert_eq!(ack.requested, 1);
        for n in 0..300 {
            assert!(send.get(n).is_none());
        }
        assert_eq!(send.get(300).unwrap().sent_at, None);
        assert_eq!(send.get(301).unwrap().sent_at, Some(1));
    }

    #[test]
    fn test_malformed() {
        let mut send = send_array(512, 300, 1);
        assert!(matches!(
            handle(&mut send, &[], 1, 100),
            Err(Error::MalformedRequest)
        ));
        assert!(matches!(
            handle(&mut send, &[16, 1], 1, 100),
            Err(Error::MalformedRequest)
        ));

        // A zero byte skips 255 positions without a hole
        let ack = handle(&mut send, &[PACKET_ID_REQUEST, 0, 7], 1, 100).unwrap();
        assert_eq!(ack.requested, 1);
        assert_eq!(send.get(261).unwrap().sent_at, None);
        assert!(send.get(260).is_none());
    }

    #[test]
    fn test_empty_request_frees_nothing() {
        let mut send = send_array(16, 3, 1);
        let ack = handle(&mut send, &[PACKET_ID_REQUEST], 1, 100).unwrap();
        assert_eq!(ack, Acknowledged::default());
        assert_eq!(send.numbers().filter(|n| send.get(*n).is_some()).count(), 3);
    }
}
