//! Control-channel message vocabulary
//!
//! Every control frame carries one of the textual commands below. The text
//! form is what goes on the wire; [`SignalingMessage`] is what the handlers
//! match on.
//!
//! ```text
//! Peer                   Rendezvous                  Peer
//!   │──── <name> ──────────►│                          │
//!   │◄─── [PLU]:... / [FIN] │                          │
//!   │── REQUEST_PEER:B ────►│                          │
//!   │                       │── PREPARE_HOLE_PUNCH ───►│
//!   │◄─ PREPARE_HOLE_PUNCH ─│                          │
//!   │── READY_HOLE_PUNCH ──►│◄── READY_HOLE_PUNCH ─────│
//!   │◄─ START_HOLE_PUNCH ───│─── START_HOLE_PUNCH ────►│
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Delivery receipt
pub const ACK: &str = "ACK";

/// Longest name accepted at registration
pub const MAX_NAME_LEN: usize = 64;

const PLU_PREFIX: &str = "[PLU]:";
const FIN: &str = "[FIN]";
const REJECTED_PREFIX: &str = "REJECTED:";
const REFRESH: &str = "REFRESH";
const REQUEST_PEER_PREFIX: &str = "REQUEST_PEER:";
const PEER_NOT_FOUND: &str = "PEER_NOT_FOUND";
const PEER_BUSY_PREFIX: &str = "PEER_BUSY:";
const PREPARE_PREFIX: &str = "PREPARE_HOLE_PUNCH:";
const READY: &str = "READY_HOLE_PUNCH";
const START_PREFIX: &str = "START_HOLE_PUNCH:";
const ABORTED_PREFIX: &str = "HOLE_PUNCH_ABORTED:";
const DISCONNECT: &str = "DISCONNECT";

/// Bare vocabulary words; a name equal to one would be read as that command
const RESERVED_WORDS: [&str; 6] = [ACK, FIN, REFRESH, PEER_NOT_FOUND, READY, DISCONNECT];

// ============================================================================
// Roster Entry
// ============================================================================

/// One registered peer as seen by other peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
}

impl RosterEntry {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

// ============================================================================
// Signaling Messages
// ============================================================================

/// Parsed control-channel command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// First frame on a connection: the bare name being claimed.
    /// Never produced by parsing; the server reads that frame raw.
    Register(String),
    /// Delivery receipt for the reliable send
    Ack,
    /// Registration refused
    Rejected(String),
    /// One roster entry
    PeerListUpdate(RosterEntry),
    /// End of a roster push
    EndOfList,
    /// Ask the server to resend the roster
    Refresh,
    /// Ask the server to coordinate a hole punch with the named peer
    RequestPeer(String),
    /// Requested name is not registered
    PeerNotFound,
    /// One side of the requested pair is already busy with another session
    PeerBusy(String),
    /// Prepare local listening resources; carries the other peer's address
    PrepareHolePunch(SocketAddr),
    /// Local preparation complete
    ReadyHolePunch,
    /// Begin the connect/accept race against the carried address
    StartHolePunch(SocketAddr),
    /// Pending session with the named peer was abandoned
    HolePunchAborted(String),
    /// Graceful deregistration
    Disconnect,
    /// Anything outside the vocabulary
    Unknown(String),
}

impl SignalingMessage {
    /// Parse a raw frame payload
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => text.parse().unwrap_or_else(|_| Self::Unknown(text.to_string())),
            Err(_) => Self::Unknown(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for SignalingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingMessage::Register(name) => f.write_str(name),
            SignalingMessage::Ack => f.write_str(ACK),
            SignalingMessage::Rejected(reason) => write!(f, "{}{}", REJECTED_PREFIX, reason),
            SignalingMessage::PeerListUpdate(entry) => write!(
                f,
                "{}{},{},{}",
                PLU_PREFIX, entry.name, entry.ip, entry.port
            ),
            SignalingMessage::EndOfList => f.write_str(FIN),
            SignalingMessage::Refresh => f.write_str(REFRESH),
            SignalingMessage::RequestPeer(name) => write!(f, "{}{}", REQUEST_PEER_PREFIX, name),
            SignalingMessage::PeerNotFound => f.write_str(PEER_NOT_FOUND),
            SignalingMessage::PeerBusy(name) => write!(f, "{}{}", PEER_BUSY_PREFIX, name),
            SignalingMessage::PrepareHolePunch(addr) => {
                write!(f, "{}{},{}", PREPARE_PREFIX, addr.ip(), addr.port())
            }
            SignalingMessage::ReadyHolePunch => f.write_str(READY),
            SignalingMessage::StartHolePunch(addr) => {
                write!(f, "{}{},{}", START_PREFIX, addr.ip(), addr.port())
            }
            SignalingMessage::HolePunchAborted(name) => write!(f, "{}{}", ABORTED_PREFIX, name),
            SignalingMessage::Disconnect => f.write_str(DISCONNECT),
            SignalingMessage::Unknown(text) => f.write_str(text),
        }
    }
}

/// Error for text that is not part of the vocabulary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMessageError(pub String);

impl fmt::Display for ParseMessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized control message: {:?}", self.0)
    }
}

impl std::error::Error for ParseMessageError {}

impl FromStr for SignalingMessage {
    type Err = ParseMessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseMessageError(s.to_string());

        let msg = match s {
            ACK => SignalingMessage::Ack,
            FIN => SignalingMessage::EndOfList,
            REFRESH => SignalingMessage::Refresh,
            PEER_NOT_FOUND => SignalingMessage::PeerNotFound,
            READY => SignalingMessage::ReadyHolePunch,
            DISCONNECT => SignalingMessage::Disconnect,
            _ => {
                if let Some(rest) = s.strip_prefix(PLU_PREFIX) {
                    SignalingMessage::PeerListUpdate(parse_roster_entry(rest).ok_or_else(invalid)?)
                } else if let Some(rest) = s.strip_prefix(REQUEST_PEER_PREFIX) {
                    SignalingMessage::RequestPeer(rest.to_string())
                } else if let Some(rest) = s.strip_prefix(PREPARE_PREFIX) {
                    SignalingMessage::PrepareHolePunch(parse_addr(rest).ok_or_else(invalid)?)
                } else if let Some(rest) = s.strip_prefix(START_PREFIX) {
                    SignalingMessage::StartHolePunch(parse_addr(rest).ok_or_else(invalid)?)
                } else if let Some(rest) = s.strip_prefix(REJECTED_PREFIX) {
                    SignalingMessage::Rejected(rest.to_string())
                } else if let Some(rest) = s.strip_prefix(PEER_BUSY_PREFIX) {
                    SignalingMessage::PeerBusy(rest.to_string())
                } else if let Some(rest) = s.strip_prefix(ABORTED_PREFIX) {
                    SignalingMessage::HolePunchAborted(rest.to_string())
                } else {
                    return Err(invalid());
                }
            }
        };

        Ok(msg)
    }
}

/// `<ip>,<port>`
fn parse_addr(s: &str) -> Option<SocketAddr> {
    let (ip, port) = s.rsplit_once(',')?;
    Some(SocketAddr::new(ip.trim().parse().ok()?, port.trim().parse().ok()?))
}

/// `<name>,<ip>,<port>`, split from the right so only the name is free-form
fn parse_roster_entry(s: &str) -> Option<RosterEntry> {
    let mut parts = s.rsplitn(3, ',');
    let port = parts.next()?.trim().parse().ok()?;
    let ip = parts.next()?.trim().parse().ok()?;
    let name = parts.next()?;
    if name.is_empty() {
        return None;
    }
    Some(RosterEntry {
        name: name.to_string(),
        ip,
        port,
    })
}

// ============================================================================
// Name Validation
// ============================================================================

/// Why a registration name was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameError {
    Empty,
    TooLong,
    ReservedCharacter,
    /// The name is a control word such as `ACK`
    ReservedWord,
}

impl fmt::Display for NameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameError::Empty => write!(f, "name is empty"),
            NameError::TooLong => write!(f, "name longer than {} bytes", MAX_NAME_LEN),
            NameError::ReservedCharacter => write!(f, "name contains a reserved character"),
            NameError::ReservedWord => write!(f, "name is a reserved control word"),
        }
    }
}

impl std::error::Error for NameError {}

/// Check that a name survives a round trip through `[PLU]` and `REQUEST_PEER:`
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong);
    }
    if name.chars().any(|c| c == ',' || c == ':' || c.is_control()) {
        return Err(NameError::ReservedCharacter);
    }
    if RESERVED_WORDS.contains(&name) {
        return Err(NameError::ReservedWord);
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
