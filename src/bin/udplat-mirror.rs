//! Reflector: sends every datagram it receives back toward the sender.
//!
//! Replies go to the sender's address at the mirror's own port, not the
//! datagram's ephemeral source port: the measurer transmits from a
//! throwaway socket and listens for replies on the port it was told to
//! measure against.

use std::net::{SocketAddr, UdpSocket};
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let [port] = args.as_slice() else {
        eprintln!("usage: udplat-mirror <port>");
        return ExitCode::from(1);
    };
    let port: u16 = match port.parse() {
        Ok(port) if port != 0 => port,
        _ => {
            eprintln!("udplat-mirror: invalid port '{port}'");
            return ExitCode::from(1);
        }
    };

    let socket = match UdpSocket::bind(("0.0.0.0", port)) {
        Ok(socket) => socket,
        Err(err) => {
            eprintln!("udplat-mirror: failed to bind port {port}: {err}");
            return ExitCode::from(1);
        }
    };

    let mut buf = [0u8; 2048];
    loop {
        match socket.recv_from(&mut buf) {
            Ok((len, source)) => {
                let target = reply_target(source, port);
                if let Err(err) = socket.send_to(&buf[..len], target) {
                    eprintln!("udplat-mirror: failed to reply to {target}: {err}");
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                eprintln!("udplat-mirror: receive failed: {err}");
                return ExitCode::from(1);
            }
        }
    }
}

fn reply_target(source: SocketAddr, port: u16) -> SocketAddr {
    SocketAddr::new(source.ip(), port)
}
