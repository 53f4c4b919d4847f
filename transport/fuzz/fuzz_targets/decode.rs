#![no_main]

use arbitrary::Arbitrary;
use commonware_codec::{DecodeExt, Encode};
use libfuzzer_sys::fuzz_target;
use peerwire_transport::{
    cookie::{CookieRequest, CookieResponse},
    handshake::{legacy, noise},
    packet::DataPacket,
};

#[derive(Arbitrary, Debug)]
enum FuzzInput {
    CookieRequest(Vec<u8>),
    CookieResponse(Vec<u8>),
    Noise(Vec<u8>),
    Legacy(Vec<u8>),
    Data(Vec<u8>),
}

/// Anything that decodes must encode back to the same bytes.
fn check<T: DecodeExt<()> + Encode>(data: &[u8]) {
    if let Ok(value) = T::decode(data) {
        assert_eq!(value.encode().as_ref(), data);
    }
}

fn fuzz(input: FuzzInput) {
    match input {
        FuzzInput::CookieRequest(data) => check::<CookieRequest>(&data),
        FuzzInput::CookieResponse(data) => check::<CookieResponse>(&data),
        FuzzInput::Noise(data) => check::<noise::Message>(&data),
        FuzzInput::Legacy(data) => check::<legacy::Message>(&data),
        FuzzInput::Data(data) => check::<DataPacket>(&data),
    }
}

fuzz_target!(|input: FuzzInput| {
    fuzz(input);
});
