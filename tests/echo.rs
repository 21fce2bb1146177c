use std::io::{Read, Write};
use std::sync::mpsc;
use std::time::Duration;

use filament::{net, Reactor};

const WAIT: Duration = Duration::from_secs(5);

fn echo_round_trip(workers: usize) {
    let reactor = Reactor::new(workers, false, "echo").unwrap();
    let (addr_tx, addr_rx) = mpsc::channel();
    reactor.schedule_call(move || {
        let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
        addr_tx.send(listener.local_addr().unwrap()).unwrap();
        let (mut stream, _peer) = listener.accept().unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        stream.write_all(&buf[..n]).unwrap();
    });
    let addr = addr_rx.recv_timeout(WAIT).unwrap();

    let (tx, rx) = mpsc::channel();
    reactor.schedule_call(move || {
        let mut stream = net::TcpStream::connect(addr).unwrap();
        stream.write_all(b"hello").unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        tx.send(buf[..n].to_vec()).unwrap();
    });
    let echoed = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(echoed, b"hello");
    reactor.stop();
}

#[test]
fn echo_with_one_worker() {
    echo_round_trip(1);
}

#[test]
fn echo_with_four_workers() {
    echo_round_trip(4);
}

#[test]
fn peer_close_reads_as_eof() {
    let reactor = Reactor::new(2, false, "eof").unwrap();
    let (addr_tx, addr_rx) = mpsc::channel();
    let (tx, rx) = mpsc::channel();
    reactor.schedule_call(move || {
        let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
        addr_tx.send(listener.local_addr().unwrap()).unwrap();
        let (mut stream, _peer) = listener.accept().unwrap();
        let mut buf = [0u8; 16];
        // first read: payload; second read: EOF after the client hangs up
        let n = stream.read(&mut buf).unwrap();
        tx.send(n).unwrap();
        let n = stream.read(&mut buf).unwrap();
        tx.send(n).unwrap();
    });
    let addr = addr_rx.recv_timeout(WAIT).unwrap();
    reactor.schedule_call(move || {
        let mut stream = net::TcpStream::connect(addr).unwrap();
        stream.write_all(b"bye").unwrap();
        // dropping the stream closes it
    });
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 3);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 0);
    reactor.stop();
}
