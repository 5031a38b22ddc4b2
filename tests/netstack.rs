use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::thread;

use tcpcore::NetStack;

/// End-to-end handshake + data exchange over a real tun device. Needs
/// CAP_NET_ADMIN (or root) to create the interface, so this is `#[ignore]`d
/// by default; run with `cargo test -- --ignored` on a box where that's
/// available.
#[test]
#[ignore]
fn connect_accept_roundtrip() {
    let mut server = NetStack::new(
        "tcptest0",
        Ipv4Addr::from_str("10.50.0.1").unwrap(),
        Ipv4Addr::from_str("255.255.255.0").unwrap(),
    )
    .unwrap();
    let listener = server.bind(7878).unwrap();

    let server_thread = thread::spawn(move || {
        let mut stream = listener.accept().unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        stream.write_all(&buf[..n]).unwrap();
    });

    let mut client = NetStack::new(
        "tcptest1",
        Ipv4Addr::from_str("10.50.0.2").unwrap(),
        Ipv4Addr::from_str("255.255.255.0").unwrap(),
    )
    .unwrap();
    let mut stream = client.connect(Ipv4Addr::from_str("10.50.0.1").unwrap(), 7878).unwrap();

    stream.write_all(b"ping").unwrap();
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");

    drop(stream);
    server_thread.join().unwrap();
}
