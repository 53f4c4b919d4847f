#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use peerwire_transport::{
    crypto::KeyPair,
    mocks::{self, Network},
    Config, Endpoint, HandshakeKind, RelayId,
};
use prometheus_client::registry::Registry;
use rand::{rngs::StdRng, SeedableRng};
use std::net::SocketAddr;

#[derive(Arbitrary, Debug)]
enum Datagram {
    Udp { port: u16, packet: Vec<u8> },
    Relay { relay: u32, packet: Vec<u8> },
}

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    legacy: bool,
    connect: bool,
    datagrams: Vec<(u16, Datagram)>,
}

fn fuzz(input: FuzzInput) {
    let handshake = if input.legacy {
        HandshakeKind::Legacy
    } else {
        HandshakeKind::NoiseIK
    };
    let network = Network::new();
    let addr: SocketAddr = "127.0.0.1:3000".parse().unwrap();
    let substrate = mocks::Substrate::new(network.clone(), addr, KeyPair::from_seed(1));
    let endpoint = Endpoint::new(
        &mut StdRng::seed_from_u64(0),
        Config::local(handshake),
        KeyPair::from_seed(0),
        substrate,
        mocks::Handler::default(),
        &mut Registry::default(),
    );

    let mut now = 0u64;
    if input.connect {
        let peer = KeyPair::from_seed(2);
        let id = endpoint
            .connect(now, *peer.public(), *KeyPair::from_seed(3).public())
            .unwrap();
        endpoint
            .set_direct_addr(now, id, "127.0.0.1:3001".parse().unwrap())
            .unwrap();
        endpoint.set_relay(now, id, RelayId(1)).unwrap();
    }

    for (elapsed, datagram) in input.datagrams {
        now += elapsed as u64;
        match datagram {
            Datagram::Udp { port, packet } => {
                endpoint.handle_udp(now, SocketAddr::from(([127, 0, 0, 1], port)), &packet)
            }
            Datagram::Relay { relay, packet } => {
                endpoint.handle_relay(now, RelayId(relay), &packet)
            }
        }
        endpoint.tick(now);
        network.clear();
    }
}

fuzz_target!(|input: FuzzInput| {
    fuzz(input);
});
