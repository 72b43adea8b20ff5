use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use spindle::buf::Buf;
use spindle::net::{AsyncSocket, Server, ServerConfig, SocketConfig, SocketHandler, TcpSocket};
use spindle::{Reactor, SocketError};

struct EchoHandler {
    socket: Rc<dyn AsyncSocket>,
}

impl SocketHandler for EchoHandler {
    fn on_read(&self, buf: Buf) {
        self.socket.write(buf);
    }

    fn on_read_end_of_stream(&self) {
        self.socket.write_end_of_stream();
    }

    fn on_error(&self, _error: SocketError) {}
}

struct ClientHandler {
    socket: Rc<dyn AsyncSocket>,
    server: Rc<Server>,
    received: Rc<RefCell<Vec<u8>>>,
    terminal_notifications: Rc<Cell<u32>>,
}

impl SocketHandler for ClientHandler {
    fn on_read(&self, buf: Buf) {
        self.received.borrow_mut().extend_from_slice(buf.as_slice());
    }

    fn on_read_end_of_stream(&self) {
        self.terminal_notifications
            .set(self.terminal_notifications.get() + 1);
        self.socket.close();
        self.server.close(|| {});
    }

    fn on_error(&self, _error: SocketError) {
        self.terminal_notifications
            .set(self.terminal_notifications.get() + 1);
        self.server.close(|| {});
    }
}

fn echo_server(reactor: &Rc<Reactor>) -> Rc<Server> {
    let config = ServerConfig::new()
        .with_listen_addr("127.0.0.1:0".parse().expect("Failed to parse address"));
    let server = Server::new(reactor, config, |socket, _peer| {
        socket.set_handler(Rc::new(EchoHandler {
            socket: socket.clone(),
        }));
        socket.read();
    });
    server.listen().expect("Failed to listen");
    server
}

#[test]
fn test_tcp_echo_round_trip() {
    let reactor = Reactor::new();
    let server = echo_server(&reactor);
    let addr = server.local_addrs()[0];

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let received = Rc::new(RefCell::new(Vec::new()));
    let terminal_notifications = Rc::new(Cell::new(0u32));

    {
        let received = received.clone();
        let terminal_notifications = terminal_notifications.clone();
        let server = server.clone();
        let payload = payload.clone();
        TcpSocket::connect(
            &reactor,
            addr,
            None,
            SocketConfig::default(),
            move |result| {
                let socket = result.expect("Failed to connect");
                socket.set_handler(Rc::new(ClientHandler {
                    socket: socket.clone(),
                    server,
                    received,
                    terminal_notifications,
                }));
                socket.read();
                // Many small writes per tick exercise flush coalescing.
                for chunk in payload.chunks(1000) {
                    socket.write(Buf::from_slice(chunk));
                }
                socket.write_end_of_stream();
            },
        );
    }
    reactor.run();

    assert_eq!(*received.borrow(), payload, "Echoed bytes must match, in order");
    assert_eq!(
        terminal_notifications.get(),
        1,
        "Exactly one terminal notification per socket"
    );
    assert!(server.stats().accepts() == 1);
    assert!(reactor.stats().read_keys() > 0);
    assert!(reactor.stats().accept_keys() > 0);
}

#[test]
fn test_close_is_idempotent() {
    let reactor = Reactor::new();
    let server = echo_server(&reactor);
    let addr = server.local_addrs()[0];

    {
        let server = server.clone();
        TcpSocket::connect(
            &reactor,
            addr,
            None,
            SocketConfig::default(),
            move |result| {
                let socket = result.expect("Failed to connect");
                assert!(socket.is_open());
                socket.close();
                assert!(!socket.is_open());
                socket.close();
                assert!(!socket.is_open());
                server.close(|| {});
            },
        );
    }
    reactor.run();
}

struct TimeoutProbe {
    // Held so the connection outlives the connect callback.
    socket: Rc<dyn AsyncSocket>,
    observed: Rc<Cell<u32>>,
    timed_out: Rc<Cell<bool>>,
    server: Rc<Server>,
    accepted: Rc<RefCell<Vec<Rc<dyn AsyncSocket>>>>,
}

impl SocketHandler for TimeoutProbe {
    fn on_read(&self, _buf: Buf) {
        panic!("No data was ever sent");
    }

    fn on_read_end_of_stream(&self) {
        self.observed.set(self.observed.get() + 1);
    }

    fn on_error(&self, error: SocketError) {
        self.observed.set(self.observed.get() + 1);
        self.timed_out.set(error.is_timeout());
        self.socket.close();
        for socket in self.accepted.borrow_mut().drain(..) {
            socket.close();
        }
        self.server.close(|| {});
    }
}

#[test]
fn test_read_timeout_closes_with_error() {
    let reactor = Reactor::new();

    // A server that accepts and stays silent.
    let accepted: Rc<RefCell<Vec<Rc<dyn AsyncSocket>>>> = Rc::new(RefCell::new(Vec::new()));
    let config = ServerConfig::new()
        .with_listen_addr("127.0.0.1:0".parse().expect("Failed to parse address"));
    let held = accepted.clone();
    let server = Server::new(&reactor, config, move |socket, _peer| {
        held.borrow_mut().push(socket);
    });
    server.listen().expect("Failed to listen");
    let addr = server.local_addrs()[0];

    let observed = Rc::new(Cell::new(0u32));
    let timed_out = Rc::new(Cell::new(false));

    {
        let observed = observed.clone();
        let timed_out = timed_out.clone();
        let socket_config = SocketConfig::default().with_read_timeout(Duration::from_millis(50));
        TcpSocket::connect(&reactor, addr, None, socket_config, move |result| {
            let socket = result.expect("Failed to connect");
            socket.set_handler(Rc::new(TimeoutProbe {
                socket: socket.clone(),
                observed,
                timed_out,
                server,
                accepted,
            }));
            socket.read();
        });
    }
    reactor.run();

    assert_eq!(observed.get(), 1, "Exactly one terminal notification");
    assert!(timed_out.get(), "An idle read deadline must surface as a timeout");
}

struct WriteStallProbe {
    socket: Rc<dyn AsyncSocket>,
    observed: Rc<Cell<u32>>,
    timed_out: Rc<Cell<bool>>,
}

impl SocketHandler for WriteStallProbe {
    fn on_read(&self, _buf: Buf) {
        panic!("The peer never sends anything");
    }

    fn on_read_end_of_stream(&self) {
        self.observed.set(self.observed.get() + 1);
    }

    fn on_error(&self, error: SocketError) {
        self.observed.set(self.observed.get() + 1);
        self.timed_out.set(error.is_timeout());
        self.socket.close();
    }
}

#[test]
fn test_write_timeout_closes_with_error() {
    let reactor = Reactor::new();

    // A peer that accepts and never reads, so the kernel buffers fill up
    // and the write queue stalls.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
    let addr = listener.local_addr().expect("Failed to read listener address");
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let peer = std::thread::spawn(move || {
        let (stream, _peer) = listener.accept().expect("Failed to accept");
        release_rx.recv().expect("Failed to wait for release");
        drop(stream);
    });

    let observed = Rc::new(Cell::new(0u32));
    let timed_out = Rc::new(Cell::new(false));

    {
        let observed = observed.clone();
        let timed_out = timed_out.clone();
        let socket_config =
            SocketConfig::default().with_write_timeout(Duration::from_millis(100));
        TcpSocket::connect(&reactor, addr, None, socket_config, move |result| {
            let socket = result.expect("Failed to connect");
            socket.set_handler(Rc::new(WriteStallProbe {
                socket: socket.clone(),
                observed,
                timed_out,
            }));
            // Far more than the loopback socket buffers will absorb.
            for _ in 0..128 {
                socket.write(Buf::from_slice(&[0u8; 65536]));
            }
        });
    }
    reactor.run();
    release_tx.send(()).expect("Failed to release the peer");
    peer.join().expect("Thread panicked");

    assert_eq!(observed.get(), 1, "Exactly one terminal notification");
    assert!(
        timed_out.get(),
        "A stalled write deadline must surface as a timeout"
    );
}

fn close_once_filtered(reactor: Rc<Reactor>, server: Rc<Server>) {
    if server.stats().filtered() >= 1 {
        server.close(|| {});
        return;
    }
    let next = reactor.clone();
    reactor.delay(Duration::from_millis(5), move || {
        close_once_filtered(next, server);
    });
}

#[test]
fn test_accept_filter_drops_connections() {
    let reactor = Reactor::new();
    let server = echo_server(&reactor);
    server.set_accept_filter(|_peer| true);
    let addr = server.local_addrs()[0];

    let peer = std::thread::spawn(move || {
        use std::io::Read;
        let mut stream = std::net::TcpStream::connect(addr).expect("Failed to connect");
        let mut byte = [0u8; 1];
        let read = stream.read(&mut byte).unwrap_or(0);
        assert_eq!(read, 0, "A filtered connection is closed without data");
    });

    close_once_filtered(reactor.clone(), server.clone());
    reactor.run();
    peer.join().expect("Thread panicked");

    assert_eq!(server.stats().filtered(), 1);
    assert_eq!(server.stats().accepts(), 0);
}

#[test]
fn test_connect_to_closed_port_fails() {
    // Grab a port that nothing listens on.
    let addr: SocketAddr = {
        let probe =
            std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind probe listener");
        probe.local_addr().expect("Failed to read probe address")
    };

    let reactor = Reactor::new();
    let outcome = Rc::new(Cell::new(None));

    let sink = outcome.clone();
    TcpSocket::connect(
        &reactor,
        addr,
        Some(Duration::from_secs(5)),
        SocketConfig::default(),
        move |result| {
            sink.set(Some(result.is_err()));
        },
    );
    reactor.run();

    assert_eq!(
        outcome.get(),
        Some(true),
        "Connecting to a closed port must resolve with an error"
    );
}
