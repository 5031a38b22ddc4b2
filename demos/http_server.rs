use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::str::FromStr;

use tcpcore::NetStack;

/// Minimal HTTP/1.0 responder, standing in for the "HTTP server" collaborator
/// named in spec.md §1 as an out-of-scope caller of this stack. It never
/// looks at the request beyond finding the blank line terminating the
/// headers, and always answers with the same small body.
fn handle(mut stream: impl Read + Write) {
    let mut buf = [0u8; 4096];
    let mut request = Vec::new();

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(err) => {
                eprintln!(">>> read error: {err}");
                return;
            }
        };
        request.extend_from_slice(&buf[..n]);
        if request.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let body = b"hello from tcpcore\n";
    let response = format!(
        "HTTP/1.0 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    if let Err(err) = stream.write_all(response.as_bytes()) {
        eprintln!(">>> write error: {err}");
        return;
    }
    let _ = stream.write_all(body);
}

fn main() {
    let mut netstack = NetStack::new(
        "tun0",
        Ipv4Addr::from_str("10.10.10.10").unwrap(),
        Ipv4Addr::from_str("255.255.255.0").unwrap(),
    )
    .unwrap();

    let listener = netstack.bind(8080).unwrap();
    println!(">>> serving http on 10.10.10.10:8080");

    loop {
        match listener.accept() {
            Ok(stream) => handle(stream),
            Err(err) => {
                eprintln!(">>> accept error: {err}");
                break;
            }
        }
    }
}
