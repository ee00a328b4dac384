//! Connection reactor: one readiness queue multiplexing the listener, the
//! termination pipe and every client socket across a pool of workers.
//!
//! Workers share the queue leader/follower-style: the poll handle lives
//! behind a mutex, the leader blocks in `poll` while the followers wait on
//! the lock, and each event batch belongs to exactly one worker. Events are
//! edge-triggered; per-connection exclusivity is a `try_lock` on the client
//! cell (the loser skips, the winner drains to would-block and re-registers,
//! which re-delivers an edge if readiness remains). Interest changes double
//! as re-arms.
//!
//! Lock order: a worker may take the client-table spinlock while holding a
//! client cell; the sweep takes the spinlock, releases it, and only then
//! locks cells. Neither path holds the spinlock across a syscall.

use std::{
    io::{self, Write},
    net::SocketAddr,
    os::{fd::FromRawFd, unix::net::UnixStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use hearth_buffer::Fill;
use hearth_utils::{logical_cpus, safe_panic, thread_boot};
use mio::{
    event::Event,
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Registry, Token,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    client::{Client, SendOutcome, Step},
    context::AppContext,
    table::Lru,
};

const LISTENER: Token = Token(usize::MAX - 1);
const SHUTDOWN: Token = Token(usize::MAX - 2);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub backlog: u32,
    /// Worker count; 0 means one per logical CPU, pinned.
    pub threads: usize,
    /// Idle time before the sweep closes a connection.
    pub idle_timeout: Duration,
    /// Interval between timeout sweeps; also the poll timeout, so sweeps
    /// happen even when the server is idle.
    pub cleanup_period: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 80,
            backlog: 50,
            threads: 0,
            idle_timeout: Duration::from_secs(5),
            cleanup_period: Duration::from_secs(5),
        }
    }
}

/// A live connection slot: the readiness token plus the mutable IO state.
/// The mutex is uncontended except when the sweep races an event handler.
struct ClientCell {
    token: Token,
    io: Mutex<Client>,
}

struct Inner {
    listener: TcpListener,
    poll: Mutex<Poll>,
    registry: Registry,
    /// Read end of the termination pipe, registered as [`SHUTDOWN`].
    _term_rx: mio::net::UnixStream,
    /// Write end; signal handlers and [`ServerHandle::shutdown`] write one
    /// byte here, and every worker that observes it writes another so the
    /// next leader wakes too.
    term_tx: UnixStream,
    running: AtomicBool,
    clients: spin::Mutex<Lru<Arc<ClientCell>>>,
    next_sweep: spin::Mutex<Instant>,
    ctx: Arc<AppContext>,
    cfg: ServerConfig,
    local_addr: SocketAddr,
}

pub struct Server {
    inner: Arc<Inner>,
}

/// Cheap handle for observing and stopping a running server.
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<Inner>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Requests a graceful shutdown: all workers wake, drain, and join.
    pub fn shutdown(&self) {
        self.inner.begin_shutdown();
    }
}

impl Server {
    /// Binds the listen socket, sets up the readiness queue, the
    /// termination pipe and the client table. Any failure here aborts
    /// startup.
    pub fn bind(cfg: ServerConfig, ctx: Arc<AppContext>) -> io::Result<Self> {
        // a peer closing mid-write must surface as an error, not kill us
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let std_listener = bind_listener(cfg.port, cfg.backlog)?;
        let mut listener = TcpListener::from_std(std_listener);
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        registry.register(&mut listener, LISTENER, Interest::READABLE)?;

        let (term_tx, term_rx) = UnixStream::pair()?;
        term_tx.set_nonblocking(true)?;
        term_rx.set_nonblocking(true)?;
        let mut term_rx = mio::net::UnixStream::from_std(term_rx);
        registry.register(&mut term_rx, SHUTDOWN, Interest::READABLE)?;

        Ok(Self {
            inner: Arc::new(Inner {
                listener,
                poll: Mutex::new(poll),
                registry,
                _term_rx: term_rx,
                term_tx,
                running: AtomicBool::new(true),
                clients: spin::Mutex::new(Lru::new()),
                next_sweep: spin::Mutex::new(Instant::now() + cfg.cleanup_period),
                ctx,
                cfg,
                local_addr,
            }),
        })
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle { inner: Arc::clone(&self.inner) }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Routes SIGINT and SIGUSR2 into the termination pipe.
    pub fn trap_signals(&self) -> io::Result<()> {
        for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGUSR2] {
            signal_hook::low_level::pipe::register(sig, self.inner.term_tx.try_clone()?)?;
        }
        Ok(())
    }

    /// Runs the worker pool until shutdown. The calling thread is worker 0;
    /// the rest are spawned. With the default thread count, workers are
    /// pinned one per CPU.
    pub fn run(self) -> io::Result<()> {
        let inner = self.inner;
        let workers = if inner.cfg.threads == 0 { logical_cpus() } else { inner.cfg.threads };
        let pin = inner.cfg.threads == 0;
        info!(addr = %inner.local_addr, workers, "server running");

        std::thread::scope(|scope| {
            for id in 1..workers {
                let inner = Arc::clone(&inner);
                std::thread::Builder::new()
                    .name(format!("hearth-worker-{id}"))
                    .spawn_scoped(scope, move || {
                        thread_boot(pin.then_some(id));
                        inner.worker_loop(id);
                    })
                    .expect("couldn't spawn worker thread");
            }
            thread_boot(pin.then_some(0));
            inner.worker_loop(0);
        });

        inner.teardown();
        Ok(())
    }
}

impl Inner {
    fn begin_shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let _ = (&self.term_tx).write(b"x");
    }

    fn worker_loop(&self, id: usize) {
        debug!(worker = id, "worker up");
        let mut events = Events::with_capacity(64);

        loop {
            {
                let mut poll = self.poll.lock().expect("poll mutex poisoned");
                if !self.running.load(Ordering::Acquire) {
                    return;
                }
                match poll.poll(&mut events, Some(self.cfg.cleanup_period)) {
                    Ok(()) => {}
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!(worker = id, "poll failed: {e}");
                        continue;
                    }
                }
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_ready(id),
                    SHUTDOWN => {
                        self.running.store(false, Ordering::Release);
                        // the byte stays in flight: write a fresh one so the
                        // next leader wakes and exits as well
                        let _ = (&self.term_tx).write(b"x");
                        debug!(worker = id, "worker down");
                        return;
                    }
                    token => self.client_ready(id, token, event),
                }
            }

            self.maybe_sweep(id);
            if !self.running.load(Ordering::Acquire) {
                return;
            }
        }
    }

    /// Accept path: drain the listener, set up each connection, register it
    /// for reads and stamp its expiry under the table lock.
    fn accept_ready(&self, worker: usize) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.install_client(stream, peer) {
                        warn!(%peer, "couldn't register connection: {e}");
                    } else {
                        trace!(worker, %peer, "accepted");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(worker, "accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn install_client(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let (slot, cell) = {
            let mut table = self.clients.lock();
            // stamped under the lock so expiry order equals list order
            let expires = Instant::now() + self.cfg.idle_timeout;
            table.insert_with(expires, |slot| {
                Arc::new(ClientCell {
                    token: Token(slot),
                    io: Mutex::new(Client::new(stream, peer)),
                })
            })
        };

        let mut io = cell.io.lock().expect("fresh client cell");
        if let Err(e) = self.registry.register(io.stream_mut(), Token(slot), Interest::READABLE) {
            drop(io);
            self.clients.lock().remove(slot);
            return Err(e);
        }
        Ok(())
    }

    /// Read/write path for one client event.
    fn client_ready(&self, worker: usize, token: Token, event: &Event) {
        let cell = { self.clients.lock().get(token.0) };
        let Some(cell) = cell else {
            // an event raced a disconnect and the slot is gone (or reused);
            // the current owner will drain and re-arm
            return;
        };
        if cell.token != token {
            safe_panic!("client table slot/token mismatch");
            return;
        }
        // one worker per connection at a time
        let Ok(mut io) = cell.io.try_lock() else { return };

        let mut disconnect = false;
        let mut refresh = false;

        if event.is_readable() {
            match io.receive() {
                Ok(fill) => {
                    trace!(worker, peer = %io.peer(), read = fill.count(), "read");
                    let eof = matches!(fill, Fill::Eof(_)) || event.is_read_closed();
                    match io.advance(&self.ctx) {
                        Step::Respond => {
                            refresh = true;
                            if self.rearm(&mut io, token, Interest::WRITABLE).is_err() {
                                disconnect = true;
                            }
                        }
                        Step::ReadMore if eof => {
                            // the peer is gone and the request will never
                            // complete
                            disconnect = true;
                        }
                        Step::ReadMore => {
                            refresh = true;
                            if self.rearm(&mut io, token, Interest::READABLE).is_err() {
                                disconnect = true;
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!(peer = %io.peer(), "read error: {e}");
                    disconnect = true;
                }
            }
        }

        if !disconnect && event.is_writable() {
            match io.send() {
                Ok(SendOutcome::Incomplete) => {
                    refresh = true;
                    if self.rearm(&mut io, token, Interest::WRITABLE).is_err() {
                        disconnect = true;
                    }
                }
                Ok(SendOutcome::KeepAlive) => {
                    refresh = true;
                    if self.rearm(&mut io, token, Interest::READABLE).is_err() {
                        disconnect = true;
                    }
                }
                Ok(SendOutcome::Close) => disconnect = true,
                Err(e) => {
                    debug!(peer = %io.peer(), "write error: {e}");
                    disconnect = true;
                }
            }
        }

        if disconnect {
            self.disconnect(&mut io, token, worker);
        } else if refresh {
            let mut table = self.clients.lock();
            // stamped under the lock so expiry order equals list order;
            // refreshing a slot the sweep already claimed is a no-op
            table.touch(token.0, Instant::now() + self.cfg.idle_timeout);
        }
    }

    fn rearm(&self, io: &mut Client, token: Token, interest: Interest) -> io::Result<()> {
        self.registry
            .reregister(io.stream_mut(), token, interest)
            .inspect_err(|e| debug!("rearm failed: {e}"))
    }

    fn disconnect(&self, io: &mut Client, token: Token, worker: usize) {
        self.clients.lock().remove(token.0);
        let _ = self.registry.deregister(io.stream_mut());
        debug!(worker, peer = %io.peer(), received = io.received(), "disconnected");
        trace!(log = %io.log_text(), "connection log");
    }

    /// Runs the expiry sweep at most once per cleanup period, whichever
    /// worker gets there first.
    fn maybe_sweep(&self, worker: usize) {
        let now = Instant::now();
        {
            let mut next = self.next_sweep.lock();
            if now < *next {
                return;
            }
            *next = now + self.cfg.cleanup_period;
        }
        self.sweep(now, worker);
    }

    /// Walks expired connections off the LRU tail. Entries leave the table
    /// under the spinlock; sockets are closed only after it is released.
    fn sweep(&self, now: Instant, worker: usize) {
        let mut victims = Vec::new();
        {
            let mut table = self.clients.lock();
            if table.is_empty() {
                return;
            }
            trace!(worker, live = table.len(), "timeout sweep");
            while let Some(cell) = table.pop_expired(now) {
                victims.push(cell);
            }
        }
        for cell in victims {
            let mut io = cell.io.lock().expect("client cell poisoned");
            let _ = self.registry.deregister(io.stream_mut());
            info!(worker, peer = %io.peer(), "idle connection expired");
        }
    }

    /// Final drain after all workers returned: close every remaining
    /// connection exactly once.
    fn teardown(&self) {
        let victims = { self.clients.lock().drain_all() };
        info!(connections = victims.len(), "shutting down");
        for cell in victims {
            let mut io = cell.io.lock().expect("client cell poisoned");
            let _ = self.registry.deregister(io.stream_mut());
            debug!(peer = %io.peer(), received = io.received(), "closed at shutdown");
            trace!(log = %io.log_text(), "connection log");
        }
    }
}

/// Builds the listen socket by hand so the configured backlog is honored:
/// socket, SO_REUSEADDR, bind, listen, non-blocking.
fn bind_listener(port: u16, backlog: u32) -> io::Result<std::net::TcpListener> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let guard = OwnedSocket(fd);

        let one: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        ) != 0
        {
            return Err(io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
        addr.sin_port = port.to_be();
        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) != 0
        {
            return Err(io::Error::last_os_error());
        }

        if libc::listen(fd, backlog as libc::c_int) != 0 {
            return Err(io::Error::last_os_error());
        }

        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }

        std::mem::forget(guard);
        Ok(std::net::TcpListener::from_raw_fd(fd))
    }
}

/// Closes the raw socket if listener setup bails early.
struct OwnedSocket(libc::c_int);

impl Drop for OwnedSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}
