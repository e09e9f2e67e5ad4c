//! End-to-end hole punch over loopback
//!
//! Two engines race each other on fixed ports, the way two peers do after
//! receiving START_HOLE_PUNCH.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use punch_core::{attempt_hole_punch, read_peer_frame, write_peer_frame, PeerFrame};

const PEER_A: &str = "127.0.0.1:5001";
const PEER_B: &str = "127.0.0.1:5002";

fn spawn_engine(local: &str, peer: &str) -> thread::JoinHandle<Option<TcpStream>> {
    let local: SocketAddr = local.parse().unwrap();
    let peer: SocketAddr = peer.parse().unwrap();
    thread::spawn(move || attempt_hole_punch(local, peer, Duration::from_secs(10)))
}

#[test]
fn test_simultaneous_punch_on_loopback() {
    let _ = env_logger::builder().is_test(true).try_init();

    let a = spawn_engine(PEER_A, PEER_B);
    let b = spawn_engine(PEER_B, PEER_A);

    let mut a = a.join().unwrap().expect("peer A should get a socket");
    let mut b = b.join().unwrap().expect("peer B should get a socket");

    // Both ends describe the same connection
    assert_eq!(a.peer_addr().unwrap(), b.local_addr().unwrap());
    assert_eq!(b.peer_addr().unwrap(), a.local_addr().unwrap());

    a.write_all(b"Hello from p1").unwrap();
    let mut buf = [0u8; 13];
    b.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"Hello from p1");

    write_peer_frame(&mut b, &PeerFrame::Text("Hello from p2".into())).unwrap();
    assert_eq!(
        read_peer_frame(&mut a).unwrap(),
        Some(PeerFrame::Text("Hello from p2".into()))
    );
}
