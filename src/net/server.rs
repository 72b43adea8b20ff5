//! TCP servers: listening, accept filtering and multi-reactor dispatch.
//!
//! [`Server`] accepts on its own reactor and serves connections there.
//! [`PrimaryServer`] accepts on one reactor and deals accepted
//! descriptors round-robin to a set of worker reactors, so the accept
//! path never competes with connection work.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::net::socket::{AsyncSocket, SocketConfig};
use crate::net::tcp::TcpSocket;
use crate::net::tls::TlsSocket;
use crate::reactor::poller::unix;
use crate::reactor::{Reactor, Remote};

/// Serves one accepted connection on the accepting reactor.
pub type ServeFn = Rc<dyn Fn(Rc<dyn AsyncSocket>, SocketAddr)>;

/// Rejects connections by peer address; `true` drops the connection.
pub type AcceptFilterFn = Rc<dyn Fn(&SocketAddr) -> bool>;

/// Serves one accepted connection on whichever worker reactor it was
/// dealt to. Must be thread-safe: the same function runs on every
/// worker.
pub type WorkerServeFn = Arc<dyn Fn(&Rc<Reactor>, Rc<dyn AsyncSocket>, SocketAddr) + Send + Sync>;

/// Listening configuration shared by [`Server`] and [`PrimaryServer`].
///
/// Plain and TLS listen addresses coexist; connections accepted on a TLS
/// address are wrapped in a server-side [`TlsSocket`] before serving.
#[derive(Clone)]
pub struct ServerConfig {
    pub listen_addrs: Vec<SocketAddr>,
    pub tls_listen_addrs: Vec<SocketAddr>,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub socket: SocketConfig,
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addrs: Vec::new(),
            tls_listen_addrs: Vec::new(),
            tls: None,
            socket: SocketConfig::default(),
            backlog: 128,
        }
    }
}

impl ServerConfig {
    pub fn new() -> ServerConfig {
        ServerConfig::default()
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addrs.push(addr);
        self
    }

    pub fn with_tls_listen_addr(
        mut self,
        addr: SocketAddr,
        config: Arc<rustls::ServerConfig>,
    ) -> Self {
        self.tls_listen_addrs.push(addr);
        self.tls = Some(config);
        self
    }

    pub fn with_socket(mut self, socket: SocketConfig) -> Self {
        self.socket = socket;
        self
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }
}

struct Listener {
    fd: RawFd,
    token: usize,
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<RawFd> {
    let fd = unix::sys_stream_socket(&addr)?;
    let bound = unix::sys_set_reuseaddr(fd)
        .and_then(|()| unix::sys_bind(fd, &addr))
        .and_then(|()| unix::sys_listen(fd, backlog));
    if let Err(error) = bound {
        unix::sys_close(fd);
        return Err(error);
    }
    Ok(fd)
}

fn wrap_accepted(
    reactor: &Rc<Reactor>,
    fd: RawFd,
    config: SocketConfig,
    tls: Option<Arc<rustls::ServerConfig>>,
) -> Option<Rc<dyn AsyncSocket>> {
    let tcp = TcpSocket::wrap(Rc::clone(reactor), fd, config);
    match tls {
        None => Some(tcp),
        Some(tls_config) => match TlsSocket::server(reactor, tcp.clone(), tls_config) {
            Ok(tls_socket) => Some(tls_socket),
            Err(error) => {
                tracing::warn!(%error, "tls session setup failed");
                tcp.close();
                None
            }
        },
    }
}

/// Counters kept by both server flavours.
#[derive(Default)]
pub struct AcceptStats {
    accepts: Cell<u64>,
    filtered: Cell<u64>,
    throttled: Cell<u64>,
}

impl AcceptStats {
    pub fn accepts(&self) -> u64 {
        self.accepts.get()
    }

    /// Connections dropped by the accept filter.
    pub fn filtered(&self) -> u64 {
        self.filtered.get()
    }

    /// Connections shed by the throttling controller.
    pub fn throttled(&self) -> u64 {
        self.throttled.get()
    }
}

/// A single-reactor TCP server.
pub struct Server {
    reactor: Rc<Reactor>,
    weak: Weak<Server>,
    config: ServerConfig,
    serve: ServeFn,
    accept_filter: RefCell<Option<AcceptFilterFn>>,
    listeners: RefCell<Vec<Listener>>,
    stats: AcceptStats,
}

impl Server {
    pub fn new(
        reactor: &Rc<Reactor>,
        config: ServerConfig,
        serve: impl Fn(Rc<dyn AsyncSocket>, SocketAddr) + 'static,
    ) -> Rc<Server> {
        Rc::new_cyclic(|weak| Server {
            reactor: Rc::clone(reactor),
            weak: weak.clone(),
            config,
            serve: Rc::new(serve),
            accept_filter: RefCell::new(None),
            listeners: RefCell::new(Vec::new()),
            stats: AcceptStats::default(),
        })
    }

    pub fn set_accept_filter(&self, filter: impl Fn(&SocketAddr) -> bool + 'static) {
        *self.accept_filter.borrow_mut() = Some(Rc::new(filter));
    }

    /// Opens every configured listener. On any failure the listeners
    /// opened so far are closed again.
    pub fn listen(&self) -> io::Result<()> {
        let plain: Vec<_> = self.config.listen_addrs.clone();
        let tls: Vec<_> = self.config.tls_listen_addrs.clone();
        if !tls.is_empty() && self.config.tls.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tls listen address without tls config",
            ));
        }

        let open = |addr: SocketAddr, is_tls: bool| -> io::Result<()> {
            let fd = bind_listener(addr, self.config.backlog)?;
            let weak = self.weak.clone();
            let token = self.reactor.register_accept(
                fd,
                Rc::new(move |client, peer| match weak.upgrade() {
                    Some(server) => server.do_accept(client, peer, is_tls),
                    None => unix::sys_close(client),
                }),
            );
            self.listeners.borrow_mut().push(Listener { fd, token });
            tracing::info!(%addr, tls = is_tls, "listening");
            Ok(())
        };

        for addr in plain {
            if let Err(error) = open(addr, false) {
                self.close(|| {});
                return Err(error);
            }
        }
        for addr in tls {
            if let Err(error) = open(addr, true) {
                self.close(|| {});
                return Err(error);
            }
        }
        Ok(())
    }

    /// Bound addresses of the open listeners, in listen order. Useful
    /// after binding to port zero.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .borrow()
            .iter()
            .filter_map(|listener| unix::sys_sockname(listener.fd).ok())
            .collect()
    }

    /// Closes every listener; `on_done` fires exactly once, after the
    /// current tick. Already-accepted connections are unaffected.
    pub fn close(&self, on_done: impl FnOnce() + 'static) {
        for listener in self.listeners.borrow_mut().drain(..) {
            self.reactor.close_channel(listener.token, listener.fd, true);
        }
        self.reactor.post(on_done);
    }

    pub fn stats(&self) -> &AcceptStats {
        &self.stats
    }

    fn do_accept(&self, fd: RawFd, peer: SocketAddr, tls: bool) {
        if let Some(throttling) = self.reactor.throttling() {
            if throttling.is_request_throttled() {
                self.stats.throttled.set(self.stats.throttled.get() + 1);
                unix::sys_close(fd);
                return;
            }
        }
        if let Some(filter) = self.accept_filter.borrow().clone() {
            if filter(&peer) {
                self.stats.filtered.set(self.stats.filtered.get() + 1);
                unix::sys_close(fd);
                return;
            }
        }
        self.stats.accepts.set(self.stats.accepts.get() + 1);

        let tls_config = if tls { self.config.tls.clone() } else { None };
        if let Some(socket) = wrap_accepted(&self.reactor, fd, self.config.socket, tls_config) {
            (self.serve)(socket, peer);
        }
    }
}

/// The accepting half of a primary/worker reactor group.
///
/// The primary reactor owns the listeners and deals accepted descriptors
/// to the workers round-robin, in worker order. A worker handle that
/// points back at the primary's own reactor is served with a direct
/// call; a cross-thread worker gets a posted task guarded by the
/// operation-in-flight protocol, and builds the socket on its own
/// reactor.
pub struct PrimaryServer {
    reactor: Rc<Reactor>,
    weak: Weak<PrimaryServer>,
    config: ServerConfig,
    workers: Vec<Remote>,
    serve: WorkerServeFn,
    next_worker: Cell<usize>,
    accept_filter: RefCell<Option<AcceptFilterFn>>,
    listeners: RefCell<Vec<Listener>>,
    stats: AcceptStats,
}

impl PrimaryServer {
    pub fn new(
        reactor: &Rc<Reactor>,
        config: ServerConfig,
        workers: Vec<Remote>,
        serve: WorkerServeFn,
    ) -> Rc<PrimaryServer> {
        assert!(!workers.is_empty(), "at least one worker required");
        Rc::new_cyclic(|weak| PrimaryServer {
            reactor: Rc::clone(reactor),
            weak: weak.clone(),
            config,
            workers,
            serve,
            next_worker: Cell::new(0),
            accept_filter: RefCell::new(None),
            listeners: RefCell::new(Vec::new()),
            stats: AcceptStats::default(),
        })
    }

    pub fn set_accept_filter(&self, filter: impl Fn(&SocketAddr) -> bool + 'static) {
        *self.accept_filter.borrow_mut() = Some(Rc::new(filter));
    }

    pub fn listen(&self) -> io::Result<()> {
        if !self.config.tls_listen_addrs.is_empty() && self.config.tls.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tls listen address without tls config",
            ));
        }

        let addrs: Vec<(SocketAddr, bool)> = self
            .config
            .listen_addrs
            .iter()
            .map(|addr| (*addr, false))
            .chain(self.config.tls_listen_addrs.iter().map(|addr| (*addr, true)))
            .collect();

        for (addr, is_tls) in addrs {
            let fd = match bind_listener(addr, self.config.backlog) {
                Ok(fd) => fd,
                Err(error) => {
                    self.close(|| {});
                    return Err(error);
                }
            };
            let weak = self.weak.clone();
            let token = self.reactor.register_accept(
                fd,
                Rc::new(move |client, peer| match weak.upgrade() {
                    Some(server) => server.do_accept(client, peer, is_tls),
                    None => unix::sys_close(client),
                }),
            );
            self.listeners.borrow_mut().push(Listener { fd, token });
            tracing::info!(%addr, tls = is_tls, "primary listening");
        }
        Ok(())
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .borrow()
            .iter()
            .filter_map(|listener| unix::sys_sockname(listener.fd).ok())
            .collect()
    }

    pub fn close(&self, on_done: impl FnOnce() + 'static) {
        for listener in self.listeners.borrow_mut().drain(..) {
            self.reactor.close_channel(listener.token, listener.fd, true);
        }
        self.reactor.post(on_done);
    }

    pub fn stats(&self) -> &AcceptStats {
        &self.stats
    }

    fn do_accept(&self, fd: RawFd, peer: SocketAddr, tls: bool) {
        if let Some(throttling) = self.reactor.throttling() {
            if throttling.is_request_throttled() {
                self.stats.throttled.set(self.stats.throttled.get() + 1);
                unix::sys_close(fd);
                return;
            }
        }
        if let Some(filter) = self.accept_filter.borrow().clone() {
            if filter(&peer) {
                self.stats.filtered.set(self.stats.filtered.get() + 1);
                unix::sys_close(fd);
                return;
            }
        }
        self.stats.accepts.set(self.stats.accepts.get() + 1);

        let index = self.next_worker.get();
        self.next_worker.set((index + 1) % self.workers.len());
        let worker = &self.workers[index];

        let tls_config = if tls { self.config.tls.clone() } else { None };

        if worker.belongs_to(&self.reactor) {
            if let Some(socket) = wrap_accepted(&self.reactor, fd, self.config.socket, tls_config)
            {
                (self.serve)(&self.reactor, socket, peer);
            }
            return;
        }

        let guard = worker.start_operation();
        let serve = Arc::clone(&self.serve);
        let socket_config = self.config.socket;
        worker.post(move || {
            let Some(reactor) = Reactor::current() else {
                unix::sys_close(fd);
                return;
            };
            if let Some(socket) = wrap_accepted(&reactor, fd, socket_config, tls_config) {
                serve(&reactor, socket, peer);
            }
            guard.complete();
        });
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        for listener in self.listeners.borrow_mut().drain(..) {
            self.reactor.close_channel(listener.token, listener.fd, true);
        }
    }
}

impl Drop for PrimaryServer {
    fn drop(&mut self) {
        for listener in self.listeners.borrow_mut().drain(..) {
            self.reactor.close_channel(listener.token, listener.fd, true);
        }
    }
}
