//! Non-blocking UDP.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use crate::buf::Buf;
use crate::error::SocketError;
use crate::net::socket::SocketConfig;
use crate::reactor::poller::{unix, Interest};
use crate::reactor::{Reactor, StreamHandler};

/// Callbacks of a [`UdpSocket`]. One call per datagram.
pub trait UdpHandler {
    fn on_packet(&self, buf: Buf, peer: SocketAddr);

    /// The socket failed and has been closed.
    fn on_error(&self, error: SocketError);
}

/// A non-blocking UDP socket bound to a local address.
///
/// Unlike the stream socket, a single readiness event drains every
/// available datagram; datagrams are discrete, so multi-drain cannot
/// split or merge anything.
pub struct UdpSocket {
    reactor: Rc<Reactor>,
    fd: Cell<RawFd>,
    token: Cell<usize>,
    armed: Cell<Interest>,
    handler: RefCell<Option<Rc<dyn UdpHandler>>>,
    send_queue: RefCell<VecDeque<(Buf, SocketAddr)>>,
    read_interest: Cell<bool>,
    write_interest: Cell<bool>,
    receive_buffer_size: usize,
}

impl UdpSocket {
    pub fn bind(
        reactor: &Rc<Reactor>,
        addr: SocketAddr,
        config: SocketConfig,
    ) -> io::Result<Rc<UdpSocket>> {
        let fd = unix::sys_dgram_socket(&addr)?;
        if let Err(error) = unix::sys_bind(fd, &addr) {
            unix::sys_close(fd);
            return Err(error);
        }

        let socket = Rc::new(UdpSocket {
            reactor: Rc::clone(reactor),
            fd: Cell::new(fd),
            token: Cell::new(usize::MAX),
            armed: Cell::new(Interest::NONE),
            handler: RefCell::new(None),
            send_queue: RefCell::new(VecDeque::new()),
            read_interest: Cell::new(false),
            write_interest: Cell::new(false),
            receive_buffer_size: config.read_buffer_size,
        });
        let weak: Weak<UdpSocket> = Rc::downgrade(&socket);
        let token = socket.reactor.register_stream(weak);
        socket.token.set(token);
        Ok(socket)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        unix::sys_sockname(self.fd.get())
    }

    pub fn set_handler(&self, handler: Rc<dyn UdpHandler>) {
        *self.handler.borrow_mut() = Some(handler);
    }

    /// Arms read interest; incoming datagrams flow into the handler.
    pub fn read(&self) {
        debug_assert!(self.is_open(), "read on a closed socket");
        if !self.is_open() {
            return;
        }
        self.read_interest.set(true);
        self.update_interests();
    }

    /// Sends one datagram, attempting immediate delivery. When the OS
    /// pushes back, the same packet is re-queued at the front and write
    /// readiness retries it.
    pub fn send(&self, buf: Buf, peer: SocketAddr) {
        debug_assert!(self.is_open(), "send on a closed socket");
        if !self.is_open() {
            return;
        }
        self.send_queue.borrow_mut().push_back((buf, peer));
        self.flush_sends();
    }

    pub fn close(&self) {
        let fd = self.fd.replace(-1);
        if fd < 0 {
            return;
        }
        self.reactor
            .close_channel(self.token.get(), fd, !self.armed.get().is_none());
        self.armed.set(Interest::NONE);
        self.send_queue.borrow_mut().clear();
        self.handler.borrow_mut().take();
    }

    pub fn is_open(&self) -> bool {
        self.fd.get() >= 0
    }

    fn handler(&self) -> Option<Rc<dyn UdpHandler>> {
        self.handler.borrow().clone()
    }

    fn update_interests(&self) {
        if !self.is_open() {
            return;
        }
        let desired = Interest {
            read: self.read_interest.get(),
            write: self.write_interest.get(),
        };
        let current = self.armed.get();
        if desired == current {
            return;
        }
        let fd = self.fd.get();
        let token = self.token.get();
        match (current.is_none(), desired.is_none()) {
            (true, false) => self.reactor.poller_register(fd, token, desired),
            (false, false) => self.reactor.poller_reregister(fd, token, desired),
            (false, true) => self.reactor.poller_deregister(fd),
            (true, true) => {}
        }
        self.armed.set(desired);
    }

    fn flush_sends(&self) {
        loop {
            let Some((buf, peer)) = self.send_queue.borrow_mut().pop_front() else {
                break;
            };
            match unix::sys_sendto(self.fd.get(), buf.as_slice(), &peer) {
                Ok(sent) => {
                    debug_assert_eq!(sent, buf.remaining(), "datagram sent partially");
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    self.send_queue.borrow_mut().push_front((buf, peer));
                    self.write_interest.set(true);
                    self.update_interests();
                    return;
                }
                Err(error) => {
                    self.close_with_error(SocketError::Io(error));
                    return;
                }
            }
        }
        self.write_interest.set(false);
        self.update_interests();
    }

    fn close_with_error(&self, error: SocketError) {
        let handler = self.handler();
        self.close();
        tracing::debug!(%error, "udp socket closed with error");
        if let Some(handler) = handler {
            handler.on_error(error);
        }
    }
}

impl StreamHandler for UdpSocket {
    fn on_read_ready(&self) {
        while self.is_open() && self.read_interest.get() {
            let mut buf = Buf::allocate(self.receive_buffer_size);
            let received = {
                let spare = buf.write_slice();
                unix::sys_recvfrom(self.fd.get(), spare)
            };
            match received {
                Ok((n, peer)) => {
                    buf.commit(n);
                    if let Some(handler) = self.handler() {
                        handler.on_packet(buf, peer);
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => {
                    self.close_with_error(SocketError::Io(error));
                    break;
                }
            }
        }
    }

    fn on_write_ready(&self) {
        if self.is_open() && self.write_interest.get() {
            self.flush_sends();
        }
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.close();
    }
}
