//! Packet type bytes, reserved packet ids and the framing of encrypted data packets.

use crate::{
    crypto::{Nonce, SharedKey, MAC_SIZE},
    Error,
};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{Error as CodecError, FixedSize, Read, ReadExt, Write};
use rand::{CryptoRng, Rng};

/// Largest datagram this layer produces or accepts.
pub const MAX_PACKET_SIZE: usize = 1400;

/// Bytes of a data packet not available to the payload: type, nonce bits, header and tag.
pub const DATA_OVERHEAD: usize = 1 + u16::SIZE + DATA_HEADER_SIZE + MAC_SIZE;

/// Size of the `buffer_start || number` header inside a data packet.
pub const DATA_HEADER_SIZE: usize = 2 * u32::SIZE;

/// Largest payload (packet id plus application bytes plus padding) a data packet can carry.
pub const MAX_DATA_SIZE: usize = MAX_PACKET_SIZE - DATA_OVERHEAD;

/// Most zero bytes prepended to a payload to hide its length.
pub const MAX_PADDING: usize = 8;

/// How far the expected nonce advances once a received nonce runs more than twice this far ahead
/// of it. Packets up to a third of the 16-bit space behind the new base still open.
pub const NONCE_ADVANCE_THRESHOLD: u16 = u16::MAX / 3;

/// Zero bytes preceding the packet id.
pub const PACKET_ID_PADDING: u8 = 0;

/// Run-length encoded list of missing packets.
pub const PACKET_ID_REQUEST: u8 = 1;

/// The peer is tearing the connection down.
pub const PACKET_ID_KILL: u8 = 2;

/// First id carried reliably.
pub const PACKET_ID_LOSSLESS_START: u8 = 16;

/// Last id carried reliably.
pub const PACKET_ID_LOSSLESS_END: u8 = 191;

/// First id carried unreliably.
pub const PACKET_ID_LOSSY_START: u8 = 192;

/// Last id carried unreliably.
pub const PACKET_ID_LOSSY_END: u8 = 254;

/// The first byte of every datagram handled by this layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    CookieRequest = 24,
    CookieResponse = 25,
    Handshake = 26,
    Data = 27,
}

impl PacketType {
    /// Parse a type byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            24 => Some(Self::CookieRequest),
            25 => Some(Self::CookieResponse),
            26 => Some(Self::Handshake),
            27 => Some(Self::Data),
            _ => None,
        }
    }

    /// Consume a type byte, failing unless it is `expected`.
    pub(crate) fn expect(
        buf: &mut impl Buf,
        expected: Self,
        context: &'static str,
    ) -> Result<(), CodecError> {
        let value = u8::read(buf)?;
        if value != expected as u8 {
            return Err(CodecError::Invalid(context, "unexpected packet type"));
        }
        Ok(())
    }
}

impl Write for PacketType {
    fn write(&self, buf: &mut impl BufMut) {
        (*self as u8).write(buf);
    }
}

/// What a packet id means to the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Request,
    Kill,
    Lossless,
    Lossy,
    /// Ids held back for future control messages.
    Reserved,
}

impl Kind {
    /// Classify the first byte of a payload (after padding has been stripped).
    pub fn of(id: u8) -> Result<Self, Error> {
        match id {
            PACKET_ID_REQUEST => Ok(Self::Request),
            PACKET_ID_KILL => Ok(Self::Kill),
            PACKET_ID_LOSSLESS_START..=PACKET_ID_LOSSLESS_END => Ok(Self::Lossless),
            PACKET_ID_LOSSY_START..=PACKET_ID_LOSSY_END => Ok(Self::Lossy),
            3..=15 => Ok(Self::Reserved),
            _ => Err(Error::InvalidPacketId(id)),
        }
    }
}

/// Check that `data` may be queued as a lossless packet.
pub fn check_lossless(data: &[u8]) -> Result<(), Error> {
    check(data, PACKET_ID_LOSSLESS_START..=PACKET_ID_LOSSLESS_END)
}

/// Check that `data` may be sent as a lossy packet.
pub fn check_lossy(data: &[u8]) -> Result<(), Error> {
    check(data, PACKET_ID_LOSSY_START..=PACKET_ID_LOSSY_END)
}

fn check(data: &[u8], ids: std::ops::RangeInclusive<u8>) -> Result<(), Error> {
    let Some(&id) = data.first() else {
        return Err(Error::EmptyPayload);
    };
    if !ids.contains(&id) {
        return Err(Error::InvalidPacketId(id));
    }
    if data.len() > MAX_DATA_SIZE {
        return Err(Error::PayloadTooLarge(data.len()));
    }
    Ok(())
}

/// An encrypted data packet as it appears on the wire.
///
/// `[27][low 16 bits of nonce][enc(buffer_start 4 || number 4 || padding || payload)]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPacket {
    pub nonce_low: u16,
    pub ciphertext: Bytes,
}

impl Write for DataPacket {
    fn write(&self, buf: &mut impl BufMut) {
        PacketType::Data.write(buf);
        self.nonce_low.write(buf);
        buf.put_slice(&self.ciphertext);
    }
}

impl commonware_codec::EncodeSize for DataPacket {
    fn encode_size(&self) -> usize {
        1 + u16::SIZE + self.ciphertext.len()
    }
}

impl Read for DataPacket {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        PacketType::expect(buf, PacketType::Data, "packet::DataPacket")?;
        let nonce_low = u16::read(buf)?;

        // The payload must hold at least the packet id
        let len = buf.remaining();
        if len <= DATA_HEADER_SIZE + MAC_SIZE || len > MAX_PACKET_SIZE - 1 - u16::SIZE {
            return Err(CodecError::InvalidLength(len));
        }
        let ciphertext = buf.copy_to_bytes(len);
        Ok(Self {
            nonce_low,
            ciphertext,
        })
    }
}

/// The decrypted contents of a [DataPacket].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPlain {
    /// First sequence number the sender still holds in its send array.
    pub buffer_start: u32,

    /// Sequence number of this packet.
    pub number: u32,

    /// Packet id followed by application bytes, with padding removed.
    pub payload: Bytes,
}

/// Pick a random padding length that keeps `len` bytes of payload within a single packet.
pub fn padding<R: Rng>(rng: &mut R, len: usize) -> usize {
    let room = MAX_DATA_SIZE.saturating_sub(len);
    rng.gen_range(0..=room.min(MAX_PADDING))
}

/// Encrypt a payload into a data packet under `key` and `nonce`.
pub fn seal<R: Rng + CryptoRng>(
    rng: &mut R,
    key: &SharedKey,
    nonce: &Nonce,
    buffer_start: u32,
    number: u32,
    payload: &[u8],
) -> Result<DataPacket, Error> {
    if payload.len() > MAX_DATA_SIZE {
        return Err(Error::PayloadTooLarge(payload.len()));
    }
    let pad = padding(rng, payload.len());
    let mut plain = Vec::with_capacity(DATA_HEADER_SIZE + pad + payload.len());
    plain.put_u32(buffer_start);
    plain.put_u32(number);
    plain.put_bytes(PACKET_ID_PADDING, pad);
    plain.put_slice(payload);

    let ciphertext = key.encrypt(nonce, &plain)?;
    Ok(DataPacket {
        nonce_low: nonce.low_bits(),
        ciphertext: ciphertext.into(),
    })
}

/// Decrypt a data packet using the receive key.
///
/// `expected` is the receiver's current base nonce. Returns the full nonce the packet was sealed
/// with alongside its contents.
pub fn open(
    key: &SharedKey,
    expected: &Nonce,
    packet: &DataPacket,
) -> Result<(Nonce, DataPlain), Error> {
    let delta = packet.nonce_low.wrapping_sub(expected.low_bits());
    let mut nonce = *expected;
    nonce.increment_by(delta as u32);

    let plain = key.decrypt(&nonce, &packet.ciphertext)?;
    let mut buf = plain.as_slice();
    let buffer_start = u32::read(&mut buf)?;
    let number = u32::read(&mut buf)?;
    let start = buf
        .iter()
        .position(|b| *b != PACKET_ID_PADDING)
        .ok_or(Error::EmptyPayload)?;
    Ok((
        nonce,
        DataPlain {
            buffer_start,
            number,
            payload: Bytes::copy_from_slice(&buf[start..]),
        },
    ))
}

/// Advance the receiver's base nonce after successfully opening a packet sealed with `used`.
pub fn advance_nonce(expected: &mut Nonce, used: &Nonce) {
    let delta = used.low_bits().wrapping_sub(expected.low_bits());
    if delta > 2 * NONCE_ADVANCE_THRESHOLD {
        expected.increment_by(NONCE_ADVANCE_THRESHOLD as u32);
    }
}
