use std::cell::{Cell, RefCell};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::buf::{Buf, BufQueue};
use crate::error::SocketError;
use crate::net::socket::{AsyncSocket, SocketConfig, SocketHandler};
use crate::reactor::poller::{unix, Interest};
use crate::reactor::{Reactor, ScheduledTask, StreamHandler};

/// A non-blocking TCP connection driven by the reactor.
///
/// The socket registers itself in the reactor's registry at creation and
/// arms poller interests lazily: read interest follows [`read`] calls and
/// end-of-stream, write interest is armed only after a write syscall
/// returns `WouldBlock`. Writes are deferred to a posted flush task so
/// that several same-tick writes coalesce into one syscall.
///
/// [`read`]: AsyncSocket::read
pub struct TcpSocket {
    reactor: Rc<Reactor>,
    weak: Weak<TcpSocket>,
    fd: Cell<RawFd>,
    token: Cell<usize>,
    /// Interests currently armed in the poller.
    armed: Cell<Interest>,
    handler: RefCell<Option<Rc<dyn SocketHandler>>>,
    write_queue: RefCell<BufQueue>,
    read_interest: Cell<bool>,
    write_interest: Cell<bool>,
    read_eof: Cell<bool>,
    write_eof: Cell<bool>,
    flush_posted: Cell<bool>,
    /// Set once the single terminal notification has been delivered.
    notified: Cell<bool>,
    config: SocketConfig,
    read_timer: RefCell<Option<ScheduledTask>>,
    write_timer: RefCell<Option<ScheduledTask>>,
}

impl TcpSocket {
    /// Wraps a connected non-blocking descriptor.
    pub fn wrap(reactor: Rc<Reactor>, fd: RawFd, config: SocketConfig) -> Rc<TcpSocket> {
        debug_assert!(fd >= 0);
        let socket = Rc::new_cyclic(|weak| TcpSocket {
            reactor,
            weak: weak.clone(),
            fd: Cell::new(fd),
            token: Cell::new(usize::MAX),
            armed: Cell::new(Interest::NONE),
            handler: RefCell::new(None),
            write_queue: RefCell::new(BufQueue::new()),
            read_interest: Cell::new(false),
            write_interest: Cell::new(false),
            read_eof: Cell::new(false),
            write_eof: Cell::new(false),
            flush_posted: Cell::new(false),
            notified: Cell::new(false),
            config,
            read_timer: RefCell::new(None),
            write_timer: RefCell::new(None),
        });
        let weak: Weak<TcpSocket> = Rc::downgrade(&socket);
        let token = socket.reactor.register_stream(weak);
        socket.token.set(token);
        socket
    }

    /// Opens a connection to `addr` and hands the wrapped socket to
    /// `on_connect`, exactly once. An elapsed `timeout` resolves the
    /// attempt with [`SocketError::Timeout`].
    pub fn connect(
        reactor: &Rc<Reactor>,
        addr: SocketAddr,
        timeout: Option<Duration>,
        config: SocketConfig,
        on_connect: impl FnOnce(Result<Rc<TcpSocket>, SocketError>) + 'static,
    ) {
        let wrap_on = Rc::clone(reactor);
        reactor.connect_fd(
            addr,
            timeout,
            Box::new(move |result| match result {
                Ok(fd) => on_connect(Ok(TcpSocket::wrap(wrap_on, fd, config))),
                Err(error) if error.kind() == io::ErrorKind::TimedOut => {
                    on_connect(Err(SocketError::Timeout))
                }
                Err(error) => on_connect(Err(SocketError::Io(error))),
            }),
        );
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        unix::sys_sockname(self.fd.get())
    }

    fn handler(&self) -> Option<Rc<dyn SocketHandler>> {
        self.handler.borrow().clone()
    }

    fn update_interests(&self) {
        if !self.is_open() {
            return;
        }
        let desired = Interest {
            read: self.read_interest.get() && !self.read_eof.get(),
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

    fn restart_read_timer(&self) {
        let Some(delay) = self.config.read_timeout else {
            return;
        };
        if let Some(timer) = self.read_timer.borrow_mut().take() {
            timer.cancel();
        }
        let weak = self.weak.clone();
        let timer = self.reactor.delay_background(delay, move || {
            if let Some(socket) = weak.upgrade() {
                socket.on_timeout();
            }
        });
        *self.read_timer.borrow_mut() = Some(timer);
    }

    fn ensure_write_timer(&self) {
        let Some(delay) = self.config.write_timeout else {
            return;
        };
        if self.write_timer.borrow().is_some() {
            return;
        }
        let weak = self.weak.clone();
        let timer = self.reactor.delay_background(delay, move || {
            if let Some(socket) = weak.upgrade() {
                socket.on_timeout();
            }
        });
        *self.write_timer.borrow_mut() = Some(timer);
    }

    fn cancel_read_timer(&self) {
        if let Some(timer) = self.read_timer.borrow_mut().take() {
            timer.cancel();
        }
    }

    fn cancel_write_timer(&self) {
        if let Some(timer) = self.write_timer.borrow_mut().take() {
            timer.cancel();
        }
    }

    fn on_timeout(&self) {
        if self.is_open() {
            self.close_with_error(SocketError::Timeout);
        }
    }

    /// Writes queued buffers until the queue drains or the OS pushes
    /// back. Adjacent buffers below the merge threshold are concatenated
    /// so the common small-writes pattern costs one syscall.
    fn flush(&self) {
        self.flush_posted.set(false);
        if !self.is_open() {
            return;
        }

        loop {
            let mut head = {
                let mut queue = self.write_queue.borrow_mut();
                let Some(mut head) = queue.take() else { break };
                while let Some(next_len) = queue.peek_len() {
                    let mut cost = next_len;
                    if head.write_remaining() < next_len {
                        cost += head.remaining();
                    }
                    if cost >= self.config.merge_size {
                        break;
                    }
                    let Some(next) = queue.take() else { break };
                    head.put(next.as_slice());
                }
                head
            };

            match unix::sys_write(self.fd.get(), head.as_slice()) {
                Ok(n) => {
                    head.advance(n);
                    if !head.is_empty() {
                        self.write_queue.borrow_mut().push_front(head);
                        self.write_interest.set(true);
                        break;
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    self.write_queue.borrow_mut().push_front(head);
                    self.write_interest.set(true);
                    break;
                }
                Err(error) => {
                    self.close_with_error(SocketError::Io(error));
                    return;
                }
            }
        }

        let drained = self.write_queue.borrow().is_empty();
        if drained {
            self.write_interest.set(false);
            self.cancel_write_timer();
        }
        self.update_interests();
        if drained {
            if self.write_eof.get() {
                self.finish_writes();
            } else if let Some(handler) = self.handler() {
                handler.on_write_flushed();
            }
        }
    }

    fn finish_writes(&self) {
        if self.read_eof.get() {
            self.close();
        } else if let Err(error) = unix::sys_shutdown(self.fd.get(), Shutdown::Write) {
            self.close_with_error(SocketError::Io(error));
        }
    }

    fn close_with_error(&self, error: SocketError) {
        let handler = self.handler();
        self.close();
        if !self.notified.replace(true) {
            tracing::debug!(%error, "socket closed with error");
            if let Some(handler) = handler {
                handler.on_error(error);
            }
        }
    }
}

impl AsyncSocket for TcpSocket {
    fn set_handler(&self, handler: Rc<dyn SocketHandler>) {
        *self.handler.borrow_mut() = Some(handler);
    }

    fn read(&self) {
        debug_assert!(self.is_open(), "read on a closed socket");
        if !self.is_open() || self.read_eof.get() {
            return;
        }
        self.read_interest.set(true);
        self.restart_read_timer();
        self.update_interests();
    }

    fn write(&self, buf: Buf) {
        debug_assert!(self.is_open(), "write on a closed socket");
        debug_assert!(!self.write_eof.get(), "write after end of stream");
        if !self.is_open() || self.write_eof.get() {
            return;
        }
        self.write_queue.borrow_mut().add(buf);
        self.ensure_write_timer();
        if !self.flush_posted.replace(true) {
            let weak = self.weak.clone();
            self.reactor.post(move || {
                if let Some(socket) = weak.upgrade() {
                    socket.flush();
                }
            });
        }
    }

    fn write_end_of_stream(&self) {
        if !self.is_open() || self.write_eof.replace(true) {
            return;
        }
        if !self.flush_posted.replace(true) {
            let weak = self.weak.clone();
            self.reactor.post(move || {
                if let Some(socket) = weak.upgrade() {
                    socket.flush();
                }
            });
        }
    }

    fn close(&self) {
        let fd = self.fd.replace(-1);
        if fd < 0 {
            return;
        }
        self.cancel_read_timer();
        self.cancel_write_timer();
        self.reactor
            .close_channel(self.token.get(), fd, !self.armed.get().is_none());
        self.armed.set(Interest::NONE);
        self.write_queue.borrow_mut().recycle();
        // Breaks the handler <-> socket cycle.
        self.handler.borrow_mut().take();
    }

    fn is_open(&self) -> bool {
        self.fd.get() >= 0
    }
}

impl StreamHandler for TcpSocket {
    fn on_read_ready(&self) {
        if !self.is_open() || !self.read_interest.get() || self.read_eof.get() {
            return;
        }

        let mut buf = Buf::allocate(self.config.read_buffer_size);
        let result = unix::sys_read(self.fd.get(), buf.write_slice());
        match result {
            Ok(0) => {
                self.read_eof.set(true);
                self.read_interest.set(false);
                self.cancel_read_timer();
                self.update_interests();
                let handler = self.handler();
                if !self.notified.replace(true) {
                    if let Some(handler) = handler {
                        handler.on_read_end_of_stream();
                    }
                }
                if self.write_eof.get() && self.write_queue.borrow().is_empty() {
                    self.close();
                }
            }
            Ok(n) => {
                buf.commit(n);
                self.restart_read_timer();
                if let Some(handler) = self.handler() {
                    handler.on_read(buf);
                }
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
            Err(error) => {
                self.close_with_error(SocketError::Io(error));
            }
        }
    }

    fn on_write_ready(&self) {
        if self.is_open() && self.write_interest.get() {
            self.flush();
        }
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.close();
    }
}
