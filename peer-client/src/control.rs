//! Peer control loop
//!
//! A [`Peer`] owns the control connection to the rendezvous server. After
//! registration a background dispatch thread handles everything the server
//! sends: roster updates, the prepare/ready handshake and the start trigger
//! that runs the hole punch engine. The interactive side talks to the server
//! through the methods on [`Peer`] and learns about outcomes from the
//! [`PeerEvent`] channel.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use punch_core::message::NameError;
use punch_core::{
    attempt_hole_punch, connect_from, listen_with_ack, listen_with_ack_timeout, prepare,
    punch_endpoint, send_with_policy, validate_name, PreparedPunch, RosterEntry,
    SignalingConnection, SignalingMessage,
};

use crate::config::PeerConfig;
use crate::identity::Identity;
use crate::link::{LinkEvent, PeerLink};
use crate::roster::Roster;

// ============================================================================
// Events and Errors
// ============================================================================

/// Outcomes reported by the dispatch thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A full roster has arrived
    RosterComplete(Vec<RosterEntry>),
    PeerNotFound,
    PeerBusy(String),
    /// The server is pairing us with the peer at this address
    HolePunchPreparing(SocketAddr),
    HolePunchSucceeded(SocketAddr),
    HolePunchFailed(SocketAddr),
    HolePunchAborted(String),
    /// Traffic on the active peer link
    Link(LinkEvent),
    /// The control loop has exited
    Disconnected,
}

#[derive(Debug)]
pub enum PeerError {
    Io(io::Error),
    InvalidName(NameError),
    /// The server never acknowledged our registration
    RegistrationFailed,
    /// The server refused the name
    Rejected(String),
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::Io(e) => write!(f, "control connection error: {}", e),
            PeerError::InvalidName(e) => write!(f, "invalid peer name: {}", e),
            PeerError::RegistrationFailed => write!(f, "registration was not acknowledged"),
            PeerError::Rejected(reason) => write!(f, "registration rejected: {}", reason),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<io::Error> for PeerError {
    fn from(e: io::Error) -> Self {
        PeerError::Io(e)
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// State touched by both the dispatch thread and the interactive side
struct Shared {
    config: PeerConfig,
    conn: SignalingConnection,
    roster: Mutex<Roster>,
    prepared: Mutex<Option<PreparedPunch>>,
    link: Mutex<Option<PeerLink>>,
    running: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Peer
// ============================================================================

pub struct Peer {
    name: String,
    shared: Arc<Shared>,
    dispatch: Option<JoinHandle<()>>,
}

impl Peer {
    /// Connect, register and start the dispatch thread
    pub fn connect(
        config: &PeerConfig,
        identity: &Identity,
    ) -> Result<(Peer, Receiver<PeerEvent>), PeerError> {
        let name = config.name.clone().unwrap_or_else(|| identity.name.clone());
        validate_name(&name).map_err(PeerError::InvalidName)?;

        let stream = open_control_stream(config, identity.get_default_port())?;
        let conn = SignalingConnection::with_ack_timeout(stream, config.ack.timeout)?;
        log::info!(
            "Connected to rendezvous server {} from {}",
            conn.peer_addr(),
            conn.local_addr()
        );

        if !send_with_policy(&conn, &SignalingMessage::Register(name.clone()), &config.ack) {
            return Err(PeerError::RegistrationFailed);
        }

        let (events, event_rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            config: config.clone(),
            conn,
            roster: Mutex::new(Roster::new()),
            prepared: Mutex::new(None),
            link: Mutex::new(None),
            running: AtomicBool::new(true),
        });

        // The first answer decides whether the name was accepted
        let first = match listen_with_ack_timeout(&shared.conn, config.registration_timeout)? {
            Some(frame) => SignalingMessage::from_bytes(&frame),
            None => {
                return Err(PeerError::Io(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "server closed the connection during registration",
                )))
            }
        };
        if let SignalingMessage::Rejected(reason) = first {
            return Err(PeerError::Rejected(reason));
        }
        log::info!("Registered as '{}'", name);
        handle_message(&shared, &events, first);

        let dispatch = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("control-{}", name))
                .spawn(move || dispatch_loop(shared, events))?
        };

        Ok((
            Peer {
                name,
                shared,
                dispatch: Some(dispatch),
            },
            event_rx,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local end of the control connection; the punch port is derived from it
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.conn.local_addr()
    }

    /// Snapshot of the roster, ordered by name
    pub fn peers(&self) -> Vec<RosterEntry> {
        lock(&self.shared.roster).entries()
    }

    /// Ask the server for a fresh roster; the local one is cleared first
    pub fn refresh_peer_list(&self) -> bool {
        lock(&self.shared.roster).clear();
        self.send(&SignalingMessage::Refresh)
    }

    /// Ask the server to pair us with `name`
    pub fn connect_to_peer(&self, name: &str) -> bool {
        if lock(&self.shared.roster).get(name).is_none() {
            log::debug!("'{}' is not in the local roster, asking the server anyway", name);
        }
        log::info!("Requesting hole punch with '{}'", name);
        self.send(&SignalingMessage::RequestPeer(name.to_string()))
    }

    /// Hand the active peer link to the caller
    pub fn take_link(&self) -> Option<PeerLink> {
        lock(&self.shared.link).take()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Deregister and stop the dispatch thread
    ///
    /// An in-flight hole punch is not interrupted; this returns once it ends.
    pub fn disconnect(&mut self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            if !self.send(&SignalingMessage::Disconnect) {
                log::debug!("Server did not acknowledge disconnect");
            }
            self.shared.conn.close();
            log::info!("Disconnected from rendezvous server");
        }

        if let Some(handle) = self.dispatch.take() {
            let _ = handle.join();
        }
    }

    fn send(&self, msg: &SignalingMessage) -> bool {
        send_with_policy(&self.shared.conn, msg, &self.shared.config.ack)
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.name)
            .field("conn", &self.shared.conn)
            .field("running", &self.is_running())
            .finish()
    }
}

fn open_control_stream(config: &PeerConfig, default_port: u16) -> io::Result<TcpStream> {
    if default_port == 0 {
        return TcpStream::connect_timeout(&config.server_addr, config.connect_timeout);
    }

    let unspecified: std::net::IpAddr = match config.server_addr {
        SocketAddr::V4(_) => std::net::Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => std::net::Ipv6Addr::UNSPECIFIED.into(),
    };
    connect_from(
        SocketAddr::new(unspecified, default_port),
        config.server_addr,
        config.connect_timeout,
    )
}

// ============================================================================
// Dispatch
// ============================================================================

/// Marks the peer stopped and reports `Disconnected` when the loop ends,
/// including by unwinding
struct LoopExit {
    shared: Arc<Shared>,
    events: Sender<PeerEvent>,
}

impl Drop for LoopExit {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        lock(&self.shared.prepared).take();
        if thread::panicking() {
            log::error!("Control loop for {} panicked", self.shared.conn.peer_addr());
        } else {
            log::debug!("Control loop for {} exited", self.shared.conn.peer_addr());
        }
        let _ = self.events.send(PeerEvent::Disconnected);
    }
}

fn dispatch_loop(shared: Arc<Shared>, events: Sender<PeerEvent>) {
    let exit = LoopExit { shared, events };
    let (shared, events) = (&exit.shared, &exit.events);

    while let Some(frame) = listen_with_ack(&shared.conn) {
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        handle_message(shared, events, SignalingMessage::from_bytes(&frame));
    }
}

fn handle_message(shared: &Shared, events: &Sender<PeerEvent>, msg: SignalingMessage) {
    log::debug!("Control message: {}", msg);

    match msg {
        SignalingMessage::PeerListUpdate(entry) => {
            lock(&shared.roster).upsert(entry);
        }

        SignalingMessage::EndOfList => {
            let entries = lock(&shared.roster).entries();
            let _ = events.send(PeerEvent::RosterComplete(entries));
        }

        SignalingMessage::PeerNotFound => {
            let _ = events.send(PeerEvent::PeerNotFound);
        }

        SignalingMessage::PeerBusy(name) => {
            let _ = events.send(PeerEvent::PeerBusy(name));
        }

        SignalingMessage::HolePunchAborted(name) => {
            log::info!("Hole punch with '{}' aborted by server", name);
            lock(&shared.prepared).take();
            let _ = events.send(PeerEvent::HolePunchAborted(name));
        }

        SignalingMessage::PrepareHolePunch(peer) => handle_prepare(shared, events, peer),

        SignalingMessage::StartHolePunch(peer) => handle_start(shared, events, peer),

        SignalingMessage::Rejected(reason) => {
            log::warn!("Unexpected rejection from server: {}", reason);
        }

        SignalingMessage::Unknown(text) => {
            log::debug!("Ignoring unrecognized message {:?}", text);
        }

        other => {
            log::debug!("Ignoring {} from server", other);
        }
    }
}

/// Our punch endpoint: the control connection's local address plus the offset
fn local_punch_endpoint(shared: &Shared) -> Option<SocketAddr> {
    punch_endpoint(shared.conn.local_addr(), shared.config.port_offset)
}

fn handle_prepare(shared: &Shared, events: &Sender<PeerEvent>, peer: SocketAddr) {
    log::info!("Preparing hole punch with {}", peer);
    let _ = events.send(PeerEvent::HolePunchPreparing(peer));

    // A failed prepare is retried from scratch when the start arrives
    let prepared = match local_punch_endpoint(shared) {
        Some(local) => match prepare(local) {
            Ok(prepared) => Some(prepared),
            Err(e) => {
                log::warn!("Cannot listen on {} for hole punch: {}", local, e);
                None
            }
        },
        None => {
            log::warn!("No punch port above {}", shared.conn.local_addr());
            None
        }
    };
    *lock(&shared.prepared) = prepared;

    if !send_with_policy(&shared.conn, &SignalingMessage::ReadyHolePunch, &shared.config.ack) {
        log::warn!("Server did not acknowledge READY_HOLE_PUNCH");
    }
}

fn handle_start(shared: &Shared, events: &Sender<PeerEvent>, peer: SocketAddr) {
    let timeout = shared.config.punch_timeout;
    let prepared = lock(&shared.prepared).take();

    let stream = match punch_endpoint(peer, shared.config.port_offset) {
        Some(target) => run_engine(shared, prepared, target, timeout),
        None => {
            log::warn!("No punch port above {}", peer);
            None
        }
    };

    let link = stream.and_then(|stream| match PeerLink::new(stream) {
        Ok(link) => Some(link),
        Err(e) => {
            log::warn!("Punched socket unusable: {}", e);
            None
        }
    });

    let Some(link) = link else {
        let _ = events.send(PeerEvent::HolePunchFailed(peer));
        return;
    };

    let receiver = link.spawn_receiver(
        shared.config.download_dir.clone(),
        events.clone(),
        PeerEvent::Link,
    );
    if let Err(e) = receiver {
        log::warn!("Cannot start peer link receiver: {}", e);
        let _ = events.send(PeerEvent::HolePunchFailed(peer));
        return;
    }

    let link_addr = link.peer_addr();
    if let Some(previous) = lock(&shared.link).replace(link) {
        log::info!("Replacing peer link to {}", previous.peer_addr());
    }
    log::info!("Peer link established with {}", link_addr);
    let _ = events.send(PeerEvent::HolePunchSucceeded(link_addr));
}

fn run_engine(
    shared: &Shared,
    prepared: Option<PreparedPunch>,
    target: SocketAddr,
    timeout: Duration,
) -> Option<TcpStream> {
    match prepared {
        Some(prepared) => prepared.run(target, timeout),
        None => {
            let local = local_punch_endpoint(shared)?;
            attempt_hole_punch(local, target, timeout)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn shared_with(config: PeerConfig) -> (Shared, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let shared = Shared {
            config,
            conn: SignalingConnection::new(client).unwrap(),
            roster: Mutex::new(Roster::new()),
            prepared: Mutex::new(None),
            link: Mutex::new(None),
            running: AtomicBool::new(true),
        };
        (shared, server_side)
    }

    #[test]
    fn test_roster_messages_build_roster() {
        let (shared, _server) = shared_with(PeerConfig::default());
        let (tx, rx) = mpsc::channel();

        let bob = RosterEntry::new("bob", "10.0.0.2:4000".parse().unwrap());
        handle_message(&shared, &tx, SignalingMessage::PeerListUpdate(bob.clone()));
        handle_message(&shared, &tx, SignalingMessage::EndOfList);

        assert_eq!(rx.try_recv().unwrap(), PeerEvent::RosterComplete(vec![bob]));
    }

    #[test]
    fn test_sentinels_become_events() {
        let (shared, _server) = shared_with(PeerConfig::default());
        let (tx, rx) = mpsc::channel();

        handle_message(&shared, &tx, SignalingMessage::PeerNotFound);
        handle_message(&shared, &tx, SignalingMessage::PeerBusy("carol".into()));
        handle_message(&shared, &tx, SignalingMessage::Unknown("???".into()));
        handle_message(&shared, &tx, SignalingMessage::HolePunchAborted("bob".into()));

        let got: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            got,
            vec![
                PeerEvent::PeerNotFound,
                PeerEvent::PeerBusy("carol".into()),
                PeerEvent::HolePunchAborted("bob".into()),
            ]
        );
    }

    #[test]
    fn test_start_with_unreachable_peer_fails() {
        let config = PeerConfig {
            punch_timeout: Duration::from_millis(300),
            ..PeerConfig::default()
        };
        let (shared, _server) = shared_with(config);
        let (tx, rx) = mpsc::channel();

        // Nothing listens on the derived punch port of a freshly released port
        let dead = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        handle_message(&shared, &tx, SignalingMessage::StartHolePunch(dead));

        assert_eq!(rx.try_recv().unwrap(), PeerEvent::HolePunchFailed(dead));
        assert!(lock(&shared.link).is_none());
    }

    #[test]
    fn test_invalid_name_refused_before_connecting() {
        let config = PeerConfig {
            name: Some("a,b".into()),
            ..PeerConfig::default()
        };
        let identity = Identity::generate("ignored", 0).unwrap();
        assert!(matches!(
            Peer::connect(&config, &identity),
            Err(PeerError::InvalidName(NameError::ReservedCharacter))
        ));
    }

    #[test]
    fn test_panicking_loop_still_reports_disconnect() {
        let (shared, _server) = shared_with(PeerConfig::default());
        let shared = Arc::new(shared);
        let (tx, rx) = mpsc::channel();

        let worker = {
            let exit = LoopExit {
                shared: Arc::clone(&shared),
                events: tx,
            };
            thread::spawn(move || {
                let _exit = exit;
                panic!("handler blew up");
            })
        };
        assert!(worker.join().is_err());

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            PeerEvent::Disconnected
        );
        assert!(!shared.running.load(Ordering::Acquire));
    }

    #[test]
    fn test_ack_is_not_a_usable_name() {
        // A bare ACK frame is swallowed as a receipt and never registers
        let identity = Identity::generate("ACK", 0).unwrap();
        assert!(matches!(
            Peer::connect(&PeerConfig::default(), &identity),
            Err(PeerError::InvalidName(NameError::ReservedWord))
        ));
    }
}
