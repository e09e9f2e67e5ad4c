//! TCP simultaneous-open hole punching
//!
//! Both peers run the same race at the same time:
//!
//! ```text
//!   listener (local:port, reusable) ──── readable ──► accept ──► done
//!   outbound (local:port, reusable) ──── writable ──► SO_ERROR == 0 ──► done
//!                                                     SO_ERROR != 0 ──► retry
//! ```
//!
//! The listener stays open for the whole attempt window; outbound sockets are
//! recreated after each failed connect. Whichever path completes first wins
//! and the other is dropped. Binding both sockets to one local endpoint is a
//! best-effort attempt to reuse the NAT mapping created by the outbound SYN.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};

// ============================================================================
// Constants
// ============================================================================

/// Total timeout for one hole punch attempt
pub const HOLE_PUNCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest single readiness wait; an outbound connect pending this long is retried
pub const ITERATION_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a refused or failed connect before opening a new socket
pub const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Default distance between the control-channel port and the punch port
pub const DEFAULT_PORT_OFFSET: u16 = 1;

/// Pending connection backlog for the punch listener
const LISTEN_BACKLOG: i32 = 128;

const LISTENER: Token = Token(0);
const OUTBOUND: Token = Token(1);

// ============================================================================
// Endpoint Convention
// ============================================================================

/// Derive the punch endpoint from a control-channel address
///
/// Both peers apply the same fixed offset, so each can predict the other's
/// punch port from the address the rendezvous server announced. Returns
/// `None` if the offset would leave the port range.
pub fn punch_endpoint(addr: SocketAddr, offset: u16) -> Option<SocketAddr> {
    let port = addr.port().checked_add(offset)?;
    Some(SocketAddr::new(addr.ip(), port))
}

// ============================================================================
// Engine
// ============================================================================

/// Listening resources acquired before the coordinated start
pub struct PreparedPunch {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
}

/// Outcome of inspecting a writable outbound socket
enum ConnectOutcome {
    Connected,
    Pending,
    Failed(io::Error),
}

/// Open the reusable, non-blocking punch listener on `local`
pub fn prepare(local: SocketAddr) -> io::Result<PreparedPunch> {
    let socket = reusable_socket(local)?;
    socket.listen(LISTEN_BACKLOG)?;
    let mut listener = TcpListener::from_std(socket.into());
    let local_addr = listener.local_addr()?;

    let poll = Poll::new()?;
    poll.registry()
        .register(&mut listener, LISTENER, Interest::READABLE)?;

    log::debug!("Hole punch listener ready on {}", local_addr);

    Ok(PreparedPunch {
        poll,
        listener,
        local_addr,
    })
}

/// Run a complete attempt: prepare on `local`, then race against `peer`
///
/// Returns `None` if setup fails or `timeout` elapses without a connection.
pub fn attempt_hole_punch(local: SocketAddr, peer: SocketAddr, timeout: Duration) -> Option<TcpStream> {
    match prepare(local) {
        Ok(prepared) => prepared.run(peer, timeout),
        Err(e) => {
            log::warn!("Cannot prepare hole punch on {}: {}", local, e);
            None
        }
    }
}

impl PreparedPunch {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Race accept against connect until one succeeds or `timeout` elapses
    pub fn run(mut self, peer: SocketAddr, timeout: Duration) -> Option<TcpStream> {
        log::info!(
            "Hole punching {} -> {} (timeout {:?})",
            self.local_addr,
            peer,
            timeout
        );

        let deadline = Instant::now() + timeout;
        let mut events = Events::with_capacity(16);
        let mut outbound: Option<(mio::net::TcpStream, Instant)> = None;
        let mut attempts: u32 = 0;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            if outbound.is_none() {
                attempts += 1;
                match self.start_connect(peer) {
                    Ok(stream) => outbound = Some((stream, now)),
                    Err(e) => log::trace!("Connect attempt {} to {} not started: {}", attempts, peer, e),
                }
            }

            // Without an outbound socket only the listener is watched, briefly
            let wait = if outbound.is_some() { ITERATION_TIMEOUT } else { RETRY_BACKOFF };
            let wait = wait.min(deadline.saturating_duration_since(now));

            if let Err(e) = self.poll.poll(&mut events, Some(wait)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::warn!("Readiness wait failed during hole punch: {}", e);
                break;
            }

            let mut listener_ready = false;
            let mut outbound_ready = false;
            for event in events.iter() {
                match event.token() {
                    LISTENER => listener_ready = true,
                    OUTBOUND => outbound_ready = true,
                    _ => {}
                }
            }

            // Accept wins a tie; the outbound attempt is dropped with it
            if listener_ready {
                if let Some(stream) = self.accept() {
                    if let Some((mut stream, _)) = outbound.take() {
                        let _ = self.poll.registry().deregister(&mut stream);
                    }
                    return finish(stream, "accept", attempts);
                }
            }

            if outbound_ready {
                if let Some((mut stream, started)) = outbound.take() {
                    match connect_outcome(&stream) {
                        ConnectOutcome::Connected => {
                            let _ = self.poll.registry().deregister(&mut stream);
                            return finish(stream, "connect", attempts);
                        }
                        ConnectOutcome::Pending => outbound = Some((stream, started)),
                        ConnectOutcome::Failed(e) => {
                            log::trace!("Connect attempt {} to {} failed: {}", attempts, peer, e);
                            let _ = self.poll.registry().deregister(&mut stream);
                            drop(stream);
                            thread::sleep(RETRY_BACKOFF.min(deadline.saturating_duration_since(Instant::now())));
                        }
                    }
                }
            }

            // A connect that has been pending for a whole iteration is restarted
            let stale = matches!(&outbound, Some((_, started)) if started.elapsed() >= ITERATION_TIMEOUT);
            if stale {
                if let Some((mut stream, _)) = outbound.take() {
                    let _ = self.poll.registry().deregister(&mut stream);
                }
            }
        }

        log::warn!(
            "Hole punch {} -> {} timed out after {} connect attempts",
            self.local_addr,
            peer,
            attempts
        );
        None
    }

    /// Fresh outbound socket bound to the listener's endpoint
    fn start_connect(&self, peer: SocketAddr) -> io::Result<mio::net::TcpStream> {
        let mut stream = start_connect_from(self.local_addr, peer)?;
        self.poll
            .registry()
            .register(&mut stream, OUTBOUND, Interest::WRITABLE)?;
        Ok(stream)
    }

    fn accept(&self) -> Option<mio::net::TcpStream> {
        loop {
            match self.listener.accept() {
                Ok((stream, from)) => {
                    log::debug!("Accepted punched connection from {}", from);
                    return Some(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("Accept on {} failed: {}", self.local_addr, e);
                    return None;
                }
            }
        }
    }
}

/// Blocking connect to `remote` from a fixed local endpoint
///
/// Used for control connections that must leave from a known port so the
/// derived punch port is predictable.
pub fn connect_from(local: SocketAddr, remote: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let mut stream = start_connect_from(local, remote)?;

    let mut poll = Poll::new()?;
    poll.registry()
        .register(&mut stream, OUTBOUND, Interest::WRITABLE)?;

    let deadline = Instant::now() + timeout;
    let mut events = Events::with_capacity(4);

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect {} -> {} timed out", local, remote),
            ));
        }

        match poll.poll(&mut events, Some(remaining)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        if events.is_empty() {
            continue;
        }

        match connect_outcome(&stream) {
            ConnectOutcome::Connected => {
                poll.registry().deregister(&mut stream)?;
                return into_blocking(stream);
            }
            ConnectOutcome::Pending => {}
            ConnectOutcome::Failed(e) => return Err(e),
        }
    }
}

/// Non-blocking socket bound to `addr` with address and port reuse enabled
fn reusable_socket(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// Issue a non-blocking connect from `local`; completion is seen as writability
fn start_connect_from(local: SocketAddr, remote: SocketAddr) -> io::Result<mio::net::TcpStream> {
    let socket = reusable_socket(local)?;
    match socket.connect(&remote.into()) {
        Ok(()) => {}
        Err(e) if connect_in_progress(&e) => {}
        Err(e) => return Err(e),
    }
    Ok(mio::net::TcpStream::from_std(socket.into()))
}

#[cfg(unix)]
fn connect_in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(not(unix))]
fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

fn connect_outcome(stream: &mio::net::TcpStream) -> ConnectOutcome {
    match stream.take_error() {
        Ok(Some(e)) | Err(e) => return ConnectOutcome::Failed(e),
        Ok(None) => {}
    }

    match stream.peer_addr() {
        Ok(_) => ConnectOutcome::Connected,
        Err(e) if e.kind() == io::ErrorKind::NotConnected => ConnectOutcome::Pending,
        Err(e) => ConnectOutcome::Failed(e),
    }
}

fn finish(stream: mio::net::TcpStream, path: &str, attempts: u32) -> Option<TcpStream> {
    match into_blocking(stream) {
        Ok(stream) => {
            log::info!(
                "Hole punch succeeded via {} ({} <-> {:?}, {} connect attempts)",
                path,
                stream.local_addr().map(|a| a.to_string()).unwrap_or_default(),
                stream.peer_addr().ok(),
                attempts
            );
            Some(stream)
        }
        Err(e) => {
            log::warn!("Punched socket unusable: {}", e);
            None
        }
    }
}

/// Hand a mio stream back to blocking std I/O
pub fn into_blocking(stream: mio::net::TcpStream) -> io::Result<TcpStream> {
    let stream = into_std(stream);
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(unix)]
fn into_std(stream: mio::net::TcpStream) -> TcpStream {
    use std::os::unix::io::{FromRawFd, IntoRawFd};
    // SAFETY: into_raw_fd transfers sole ownership of a valid socket fd
    unsafe { TcpStream::from_raw_fd(stream.into_raw_fd()) }
}

#[cfg(windows)]
fn into_std(stream: mio::net::TcpStream) -> TcpStream {
    use std::os::windows::io::{FromRawSocket, IntoRawSocket};
    // SAFETY: into_raw_socket transfers sole ownership of a valid socket
    unsafe { TcpStream::from_raw_socket(stream.into_raw_socket()) }
}

// ============================================================================
// Tests
// ============================================================================
