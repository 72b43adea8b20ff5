//! Transparent TLS over any [`AsyncSocket`].
//!
//! [`TlsSocket`] sits between an application handler and an inner
//! transport socket: it implements [`AsyncSocket`] upstream and installs
//! itself as the inner socket's [`SocketHandler`]. Ciphertext and
//! plaintext accumulate in queues on either side of a rustls
//! [`Connection`](rustls::Connection), and a posted sync task pumps the
//! engine until no pass makes progress. The filter is invisible to both
//! sides: upstream sees ordered plaintext, the transport sees ordered
//! TLS records.

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use rustls::pki_types::ServerName;

use crate::buf::{Buf, BufQueue};
use crate::error::SocketError;
use crate::net::socket::{AsyncSocket, SocketHandler};
use crate::reactor::Reactor;

/// Capacity hint for one outgoing TLS record, payload plus overhead.
const PACKET_BUFFER_SIZE: usize = 18 * 1024;

/// A TLS filter socket.
///
/// Engine and protocol errors close the inner socket and surface
/// upstream through a posted task, so an error detected while servicing
/// an inner callback never re-enters the handler synchronously.
pub struct TlsSocket {
    reactor: Rc<Reactor>,
    weak: Weak<TlsSocket>,
    inner: Rc<dyn AsyncSocket>,
    engine: RefCell<rustls::Connection>,
    /// Ciphertext received from the transport, not yet fed to the engine.
    net_in: RefCell<BufQueue>,
    /// Plaintext queued by upstream writes, not yet wrapped.
    app_out: RefCell<BufQueue>,
    /// Decrypted plaintext awaiting an armed upstream read.
    plain_ready: RefCell<BufQueue>,
    handler: RefCell<Option<Rc<dyn SocketHandler>>>,
    read_interest: Cell<bool>,
    sync_posted: Cell<bool>,
    /// An outbound close sequence has been requested.
    closing: Cell<bool>,
    close_notify_sent: Cell<bool>,
    close_propagated: Cell<bool>,
    /// The peer's close_notify has been processed.
    peer_closed: Cell<bool>,
    handshaking: Cell<bool>,
    open: Cell<bool>,
    engine_active: Cell<bool>,
    notified: Cell<bool>,
    flush_pending: Cell<bool>,
}

impl TlsSocket {
    /// Wraps `inner` in a client-side TLS session for `server_name`.
    pub fn client(
        reactor: &Rc<Reactor>,
        inner: Rc<dyn AsyncSocket>,
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Rc<TlsSocket>, SocketError> {
        let session = rustls::ClientConnection::new(config, server_name)?;
        Ok(Self::with_engine(reactor, inner, session.into()))
    }

    /// Wraps `inner` in a server-side TLS session.
    pub fn server(
        reactor: &Rc<Reactor>,
        inner: Rc<dyn AsyncSocket>,
        config: Arc<rustls::ServerConfig>,
    ) -> Result<Rc<TlsSocket>, SocketError> {
        let session = rustls::ServerConnection::new(config)?;
        Ok(Self::with_engine(reactor, inner, session.into()))
    }

    fn with_engine(
        reactor: &Rc<Reactor>,
        inner: Rc<dyn AsyncSocket>,
        engine: rustls::Connection,
    ) -> Rc<TlsSocket> {
        let socket = Rc::new_cyclic(|weak| TlsSocket {
            reactor: Rc::clone(reactor),
            weak: weak.clone(),
            inner,
            engine: RefCell::new(engine),
            net_in: RefCell::new(BufQueue::new()),
            app_out: RefCell::new(BufQueue::new()),
            plain_ready: RefCell::new(BufQueue::new()),
            handler: RefCell::new(None),
            read_interest: Cell::new(false),
            sync_posted: Cell::new(false),
            closing: Cell::new(false),
            close_notify_sent: Cell::new(false),
            close_propagated: Cell::new(false),
            peer_closed: Cell::new(false),
            handshaking: Cell::new(true),
            open: Cell::new(true),
            engine_active: Cell::new(true),
            notified: Cell::new(false),
            flush_pending: Cell::new(false),
        });
        socket.inner.set_handler(socket.clone());
        // The handshake needs transport reads from the start, and the
        // client hello wants out immediately.
        socket.inner.read();
        socket.post_sync();
        socket
    }

    fn handler(&self) -> Option<Rc<dyn SocketHandler>> {
        self.handler.borrow().clone()
    }

    fn post_sync(&self) {
        if !self.sync_posted.replace(true) {
            let weak = self.weak.clone();
            self.reactor.post(move || {
                if let Some(socket) = weak.upgrade() {
                    socket.sync();
                }
            });
        }
    }

    fn sync(&self) {
        self.sync_posted.set(false);
        if !self.engine_active.get() {
            return;
        }
        match self.pump() {
            Ok(()) => self.after_pump(),
            Err(error) => self.fail(error),
        }
    }

    /// Runs unwrap and wrap passes until neither makes progress.
    ///
    /// Holds the engine borrow for the whole loop and therefore calls no
    /// upstream code; produced plaintext lands in `plain_ready` and is
    /// delivered afterwards.
    fn pump(&self) -> Result<(), SocketError> {
        let mut engine = self.engine.borrow_mut();

        loop {
            let mut progress = false;

            // Unwrap pass: ciphertext into the engine, plaintext out.
            // read_tls must never see an empty source; it would take
            // that as transport EOF.
            loop {
                if self.net_in.borrow().is_empty() {
                    break;
                }
                let consumed = engine
                    .read_tls(&mut *self.net_in.borrow_mut())
                    .map_err(SocketError::Io)?;
                if consumed == 0 {
                    break;
                }
                progress = true;

                let state = engine.process_new_packets().map_err(SocketError::Tls)?;
                let pending = state.plaintext_bytes_to_read();
                if pending > 0 {
                    let mut buf = Buf::allocate(pending);
                    let n = match engine.reader().read(&mut buf.write_slice()[..pending]) {
                        Ok(n) => n,
                        Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => 0,
                        Err(error) => return Err(SocketError::Io(error)),
                    };
                    buf.commit(n);
                    self.plain_ready.borrow_mut().add(buf);
                }
                if state.peer_has_closed() {
                    self.peer_closed.set(true);
                }
            }

            // Wrap pass: application plaintext into the engine.
            if !engine.is_handshaking() {
                let mut app_out = self.app_out.borrow_mut();
                // Explicit call: the `Read` import would otherwise make
                // method resolution pick `Read::take`.
                while let Some(chunk) = BufQueue::take(&mut app_out) {
                    match engine.writer().write(chunk.as_slice()) {
                        Ok(n) if n == chunk.remaining() => progress = true,
                        Ok(n) => {
                            let mut rest = chunk;
                            rest.advance(n);
                            app_out.push_front(rest);
                            progress |= n > 0;
                            break;
                        }
                        Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                            app_out.push_front(chunk);
                            break;
                        }
                        Err(error) => return Err(SocketError::Io(error)),
                    }
                }
            }

            // The outbound close sequence starts only once every queued
            // write has gone through the engine.
            if self.closing.get()
                && self.app_out.borrow().is_empty()
                && !self.close_notify_sent.replace(true)
            {
                engine.send_close_notify();
                progress = true;
            }

            // Emit pending records to the transport.
            while engine.wants_write() {
                let mut record = Buf::allocate(PACKET_BUFFER_SIZE);
                let n = engine.write_tls(&mut record).map_err(SocketError::Io)?;
                if n == 0 {
                    break;
                }
                progress = true;
                self.inner.write(record);
            }

            if !progress {
                break;
            }
        }

        if self.handshaking.get() && !engine.is_handshaking() {
            self.handshaking.set(false);
            tracing::debug!("tls handshake complete");
        }

        Ok(())
    }

    /// Post-pump work that may call upstream: plaintext delivery,
    /// end-of-stream, flush notification and close propagation.
    fn after_pump(&self) {
        self.deliver_plain();

        if self.peer_closed.get()
            && self.open.get()
            && self.read_interest.get()
            && self.plain_ready.borrow().is_empty()
            && !self.notified.replace(true)
        {
            if let Some(handler) = self.handler() {
                handler.on_read_end_of_stream();
            }
        }

        if self.close_notify_sent.get() && !self.close_propagated.replace(true) {
            // The records carrying close_notify sit in the inner socket's
            // write queue; a half close lets them reach the wire, and the
            // transport finishes closing once the peer answers. Closing
            // the inner socket here would recycle the queue and drop the
            // alert on the floor.
            self.inner.write_end_of_stream();
            if !self.open.get() {
                self.engine_active.set(false);
            }
        }
    }

    fn deliver_plain(&self) {
        while self.open.get() && self.read_interest.get() {
            let Some(handler) = self.handler() else { return };
            let buf = BufQueue::take(&mut self.plain_ready.borrow_mut());
            let Some(buf) = buf else { break };
            handler.on_read(buf);
        }
    }

    /// Tears the session down after an engine or transport error and
    /// reports upstream asynchronously.
    fn fail(&self, error: SocketError) {
        self.engine_active.set(false);
        self.inner.close();
        self.net_in.borrow_mut().recycle();
        self.app_out.borrow_mut().recycle();
        self.plain_ready.borrow_mut().recycle();
        let was_open = self.open.replace(false);
        let handler = self.handler.borrow_mut().take();
        if was_open && !self.notified.replace(true) {
            if let Some(handler) = handler {
                tracing::debug!(%error, "tls session failed");
                self.reactor.post(move || handler.on_error(error));
            }
        }
    }
}

impl AsyncSocket for TlsSocket {
    fn set_handler(&self, handler: Rc<dyn SocketHandler>) {
        *self.handler.borrow_mut() = Some(handler);
    }

    fn read(&self) {
        debug_assert!(self.open.get(), "read on a closed socket");
        if !self.open.get() {
            return;
        }
        self.read_interest.set(true);
        if self.inner.is_open() {
            self.inner.read();
        }
        self.post_sync();
    }

    fn write(&self, buf: Buf) {
        debug_assert!(self.open.get(), "write on a closed socket");
        debug_assert!(!self.closing.get(), "write after end of stream");
        if !self.open.get() || self.closing.get() {
            return;
        }
        self.app_out.borrow_mut().add(buf);
        self.flush_pending.set(true);
        self.post_sync();
    }

    fn write_end_of_stream(&self) {
        if !self.open.get() || self.closing.replace(true) {
            return;
        }
        self.post_sync();
    }

    fn close(&self) {
        if !self.open.replace(false) {
            return;
        }
        self.closing.set(true);
        // Pending reads and unwritten plaintext are discarded; the
        // engine still owes the peer a close_notify.
        self.plain_ready.borrow_mut().recycle();
        self.app_out.borrow_mut().recycle();
        self.handler.borrow_mut().take();
        self.post_sync();
    }

    fn is_open(&self) -> bool {
        self.open.get()
    }
}

/// Events from the inner transport socket.
impl SocketHandler for TlsSocket {
    fn on_read(&self, buf: Buf) {
        self.net_in.borrow_mut().add(buf);
        self.sync();
    }

    fn on_read_end_of_stream(&self) {
        if self.peer_closed.get() {
            // Clean shutdown; the close_notify already said everything.
            return;
        }
        self.fail(SocketError::CloseWithoutNotify);
    }

    fn on_write_flushed(&self) {
        if !self.open.get() {
            return;
        }
        let wants_write = self.engine.borrow().wants_write();
        if self.flush_pending.get() && self.app_out.borrow().is_empty() && !wants_write {
            self.flush_pending.set(false);
            if let Some(handler) = self.handler() {
                handler.on_write_flushed();
            }
        }
    }

    fn on_error(&self, error: SocketError) {
        self.fail(error);
    }
}
