use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use spindle::buf::Buf;
use spindle::net::{AsyncSocket, Server, ServerConfig, SocketConfig, SocketHandler};
use spindle::net::{TcpSocket, TlsSocket};
use spindle::{Reactor, SocketError};

/// Run with `RUST_LOG=rustls=debug` to see the handshake transcript of a
/// failing test.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The test certificate is self-signed, so chain validation is skipped;
/// the handshake itself still has to succeed.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn tls_configs() -> (Arc<rustls::ServerConfig>, Arc<rustls::ClientConfig>) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("Failed to generate certificate");
    let certs = vec![certified.cert.der().clone()];
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key.into())
        .expect("Failed to build server config");

    let client_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();

    (Arc::new(server_config), Arc::new(client_config))
}

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
    failed: Rc<Cell<bool>>,
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
        self.failed.set(true);
        self.server.close(|| {});
    }
}

#[test]
fn test_tls_echo_round_trip() {
    init_logging();
    let (server_tls, client_tls) = tls_configs();

    let reactor = Reactor::new();
    let config = ServerConfig::new().with_tls_listen_addr(
        "127.0.0.1:0".parse().expect("Failed to parse address"),
        server_tls,
    );
    let server = Server::new(&reactor, config, |socket, _peer| {
        socket.set_handler(Rc::new(EchoHandler {
            socket: socket.clone(),
        }));
        socket.read();
    });
    server.listen().expect("Failed to listen");
    let addr = server.local_addrs()[0];

    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 239) as u8).collect();
    let received = Rc::new(RefCell::new(Vec::new()));
    let terminal_notifications = Rc::new(Cell::new(0u32));
    let failed = Rc::new(Cell::new(false));

    {
        let reactor_handle = reactor.clone();
        let received = received.clone();
        let terminal_notifications = terminal_notifications.clone();
        let failed = failed.clone();
        let server = server.clone();
        let payload = payload.clone();
        TcpSocket::connect(
            &reactor,
            addr,
            None,
            SocketConfig::default(),
            move |result| {
                let tcp = result.expect("Failed to connect");
                let server_name =
                    ServerName::try_from("localhost").expect("Failed to parse server name");
                let tls = TlsSocket::client(&reactor_handle, tcp, client_tls, server_name)
                    .expect("Failed to start tls session");
                tls.set_handler(Rc::new(ClientHandler {
                    socket: tls.clone(),
                    server,
                    received,
                    terminal_notifications,
                    failed,
                }));
                tls.read();
                for chunk in payload.chunks(4000) {
                    tls.write(Buf::from_slice(chunk));
                }
                tls.write_end_of_stream();
            },
        );
    }
    reactor.run();

    assert!(!failed.get(), "The session must close cleanly, not with an error");
    assert_eq!(
        *received.borrow(),
        payload,
        "Plaintext must survive the encrypt-echo-decrypt trip byte for byte"
    );
    assert_eq!(terminal_notifications.get(), 1);
}

struct EofObserver {
    socket: Rc<dyn AsyncSocket>,
    clean: Rc<Cell<bool>>,
    errored: Rc<Cell<bool>>,
}

impl SocketHandler for EofObserver {
    fn on_read(&self, buf: Buf) {
        // Echo back, so the peer knows the handshake is done.
        self.socket.write(buf);
    }

    fn on_read_end_of_stream(&self) {
        self.clean.set(true);
        self.socket.close();
    }

    fn on_error(&self, _error: SocketError) {
        self.errored.set(true);
    }
}

struct CloseOnReply {
    socket: Rc<dyn AsyncSocket>,
}

impl SocketHandler for CloseOnReply {
    fn on_read(&self, _buf: Buf) {
        self.socket.close();
    }

    fn on_read_end_of_stream(&self) {}

    fn on_error(&self, _error: SocketError) {}
}

fn close_when_settled(
    reactor: Rc<Reactor>,
    server: Rc<Server>,
    clean: Rc<Cell<bool>>,
    errored: Rc<Cell<bool>>,
) {
    if clean.get() || errored.get() {
        server.close(|| {});
        return;
    }
    let next = reactor.clone();
    reactor.delay(std::time::Duration::from_millis(5), move || {
        close_when_settled(next, server, clean, errored);
    });
}

#[test]
fn test_close_delivers_session_close_to_peer() {
    init_logging();
    let (server_tls, client_tls) = tls_configs();

    let clean = Rc::new(Cell::new(false));
    let errored = Rc::new(Cell::new(false));

    let reactor = Reactor::new();
    let config = ServerConfig::new().with_tls_listen_addr(
        "127.0.0.1:0".parse().expect("Failed to parse address"),
        server_tls,
    );
    let observer_clean = clean.clone();
    let observer_errored = errored.clone();
    let server = Server::new(&reactor, config, move |socket, _peer| {
        socket.set_handler(Rc::new(EofObserver {
            socket: socket.clone(),
            clean: observer_clean.clone(),
            errored: observer_errored.clone(),
        }));
        socket.read();
    });
    server.listen().expect("Failed to listen");
    let addr = server.local_addrs()[0];

    {
        let reactor_handle = reactor.clone();
        let client_tls = client_tls.clone();
        TcpSocket::connect(
            &reactor,
            addr,
            None,
            SocketConfig::default(),
            move |result| {
                let tcp = result.expect("Failed to connect");
                let server_name =
                    ServerName::try_from("localhost").expect("Failed to parse server name");
                let tls = TlsSocket::client(&reactor_handle, tcp, client_tls, server_name)
                    .expect("Failed to start tls session");
                tls.set_handler(Rc::new(CloseOnReply {
                    socket: tls.clone(),
                }));
                tls.read();
                tls.write(Buf::from_slice(b"ping"));
            },
        );
    }
    close_when_settled(reactor.clone(), server.clone(), clean.clone(), errored.clone());
    reactor.run();

    assert!(
        clean.get(),
        "An explicit close must reach the peer as a clean end of stream"
    );
    assert!(
        !errored.get(),
        "The peer must not see a truncation error on an announced close"
    );
}

#[test]
fn test_tls_listen_addr_requires_config() {
    let reactor = Reactor::new();
    let config = ServerConfig {
        tls_listen_addrs: vec!["127.0.0.1:0".parse().expect("Failed to parse address")],
        ..ServerConfig::default()
    };
    let server = Server::new(&reactor, config, |_socket, _peer| {});
    assert!(
        server.listen().is_err(),
        "A tls listen address without a tls config must be rejected"
    );
    reactor.run();
}
