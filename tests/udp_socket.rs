use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;

use spindle::buf::Buf;
use spindle::net::{SocketConfig, UdpHandler, UdpSocket};
use spindle::{Reactor, SocketError};

struct EchoPeer {
    socket: Rc<UdpSocket>,
}

impl UdpHandler for EchoPeer {
    fn on_packet(&self, buf: Buf, peer: SocketAddr) {
        self.socket.send(buf, peer);
    }

    fn on_error(&self, _error: SocketError) {}
}

struct Prober {
    socket: Rc<UdpSocket>,
    echo: Rc<UdpSocket>,
    received: Rc<RefCell<Vec<(Vec<u8>, SocketAddr)>>>,
    expected: usize,
}

impl UdpHandler for Prober {
    fn on_packet(&self, buf: Buf, peer: SocketAddr) {
        self.received
            .borrow_mut()
            .push((buf.as_slice().to_vec(), peer));
        if self.received.borrow().len() == self.expected {
            self.socket.close();
            self.echo.close();
        }
    }

    fn on_error(&self, _error: SocketError) {
        self.socket.close();
        self.echo.close();
    }
}

#[test]
fn test_udp_echo_round_trip() {
    let reactor = Reactor::new();
    let bind_addr: SocketAddr = "127.0.0.1:0".parse().expect("Failed to parse address");

    let echo = UdpSocket::bind(&reactor, bind_addr, SocketConfig::default())
        .expect("Failed to bind echo socket");
    echo.set_handler(Rc::new(EchoPeer {
        socket: echo.clone(),
    }));
    echo.read();
    let echo_addr = echo.local_addr().expect("Failed to read echo address");

    let prober = UdpSocket::bind(&reactor, bind_addr, SocketConfig::default())
        .expect("Failed to bind prober socket");
    let received = Rc::new(RefCell::new(Vec::new()));
    prober.set_handler(Rc::new(Prober {
        socket: prober.clone(),
        echo: echo.clone(),
        received: received.clone(),
        expected: 3,
    }));
    prober.read();

    for message in [&b"alpha"[..], b"beta", b"gamma"] {
        prober.send(Buf::from_slice(message), echo_addr);
    }
    reactor.run();

    let received = received.borrow();
    assert_eq!(received.len(), 3);
    // Loopback delivers in order; each datagram comes back intact and
    // attributed to the echo peer.
    assert_eq!(received[0].0, b"alpha");
    assert_eq!(received[1].0, b"beta");
    assert_eq!(received[2].0, b"gamma");
    for (_, peer) in received.iter() {
        assert_eq!(*peer, echo_addr);
    }
}

#[test]
fn test_udp_close_is_idempotent() {
    let reactor = Reactor::new();
    let socket = UdpSocket::bind(
        &reactor,
        "127.0.0.1:0".parse().expect("Failed to parse address"),
        SocketConfig::default(),
    )
    .expect("Failed to bind socket");

    assert!(socket.is_open());
    socket.close();
    assert!(!socket.is_open());
    socket.close();
    reactor.run();
}

#[test]
fn test_udp_bind_conflict_reports_error() {
    let reactor = Reactor::new();
    let first = UdpSocket::bind(
        &reactor,
        "127.0.0.1:0".parse().expect("Failed to parse address"),
        SocketConfig::default(),
    )
    .expect("Failed to bind first socket");
    let addr = first.local_addr().expect("Failed to read local address");

    let second = UdpSocket::bind(&reactor, addr, SocketConfig::default());
    assert!(second.is_err(), "Binding the same port twice must fail");

    first.close();
    reactor.run();
}

#[test]
fn test_udp_send_without_read_interest() {
    let reactor = Reactor::new();
    let sink = UdpSocket::bind(
        &reactor,
        "127.0.0.1:0".parse().expect("Failed to parse address"),
        SocketConfig::default(),
    )
    .expect("Failed to bind sink");
    let sink_addr = sink.local_addr().expect("Failed to read sink address");

    let sender = UdpSocket::bind(
        &reactor,
        "127.0.0.1:0".parse().expect("Failed to parse address"),
        SocketConfig::default(),
    )
    .expect("Failed to bind sender");

    // A datagram sent with no one reading is simply buffered by the OS;
    // the sender must not block or error.
    sender.send(Buf::from_slice(b"fire and forget"), sink_addr);
    let done = Rc::new(Cell::new(false));
    let sink_handle = sink.clone();
    let sender_handle = sender.clone();
    let flag = done.clone();
    reactor.delay(std::time::Duration::from_millis(20), move || {
        flag.set(true);
        sink_handle.close();
        sender_handle.close();
    });
    reactor.run();

    assert!(done.get());
    assert!(!sender.is_open());
}
