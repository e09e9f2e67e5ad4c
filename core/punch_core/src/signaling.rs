//! Reliable signaling over the long-lived control connection
//!
//! # Message Framing
//!
//! Frames are length-prefixed with a 4-byte big-endian length header:
//! ```text
//! ┌─────────────┬─────────────────────────────────┐
//! │ Length (4B) │ Payload (UTF-8 command text)    │
//! └─────────────┴─────────────────────────────────┘
//! ```
//!
//! # Acknowledgements
//!
//! Every frame other than `ACK` is answered with an `ACK` frame as soon as it
//! is read. The ACK is a delivery receipt only: it says nothing about whether
//! the command made sense to the receiver.
//!
//! A [`SignalingConnection`] runs one reader thread per socket. That thread is
//! the only reader, so a sender waiting for its receipt never races the
//! dispatch loop that is blocked on the next command.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::{SignalingMessage, ACK};

// ============================================================================
// Constants
// ============================================================================

/// Maximum control message size
pub const MAX_MESSAGE_SIZE: u32 = 1024;

/// Length of the frame header (4 bytes for length)
pub const HEADER_LEN: usize = 4;

/// Default time to wait for a single acknowledgement
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Default number of send attempts
pub const DEFAULT_RETRIES: u32 = 3;

/// Default pause between send attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

// ============================================================================
// Frame Encoding/Decoding
// ============================================================================

/// Errors that can occur during frame encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Payload exceeds the frame limit
    MessageTooLarge { size: usize, max: u32 },
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::MessageTooLarge { size, max } => {
                write!(f, "message too large: {} bytes (max {})", size, max)
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// Prefix `payload` with its length
pub fn encode_frame(payload: &[u8], max: u32) -> Result<Vec<u8>, EncodeError> {
    if payload.len() > max as usize {
        return Err(EncodeError::MessageTooLarge {
            size: payload.len(),
            max,
        });
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Write one frame
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8], max: u32) -> io::Result<()> {
    let encoded =
        encode_frame(payload, max).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&encoded)?;
    writer.flush()
}

/// Read one frame
///
/// Returns `Ok(None)` when the stream closes cleanly before a new header.
/// A close in the middle of a frame is an `UnexpectedEof` error.
pub fn read_frame<R: Read>(reader: &mut R, max: u32) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let length = u32::from_be_bytes(header);
    if length > max {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", length, max),
        ));
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Knobs for [`send_with_ack`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AckPolicy {
    /// Total send attempts
    pub retries: u32,
    /// Pause after a failed attempt
    #[serde(with = "millis")]
    pub delay: Duration,
    /// Wait for the receipt of a single attempt
    #[serde(with = "millis")]
    pub timeout: Duration,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            delay: DEFAULT_RETRY_DELAY,
            timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

/// Durations as integer milliseconds in config files
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ============================================================================
// Signaling Connection
// ============================================================================

/// One control connection with its receipt-routing reader thread
pub struct SignalingConnection {
    /// Write half, shared with the reader thread for ACK replies
    writer: Arc<Mutex<TcpStream>>,
    /// Received commands, ACK already sent
    inbox: Mutex<Receiver<Vec<u8>>>,
    /// One unit per ACK frame received
    acks: Mutex<Receiver<()>>,
    /// Held across send + wait so receipts go to the right sender
    send_lock: Mutex<()>,
    ack_timeout: Duration,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl SignalingConnection {
    /// Take ownership of a connected stream and start its reader thread
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        Self::with_ack_timeout(stream, DEFAULT_ACK_TIMEOUT)
    }

    pub fn with_ack_timeout(stream: TcpStream, ack_timeout: Duration) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let reader = stream.try_clone()?;
        let writer = Arc::new(Mutex::new(stream));

        let (inbox_tx, inbox_rx) = mpsc::channel();
        let (ack_tx, ack_rx) = mpsc::channel();

        let reply = Arc::clone(&writer);
        thread::Builder::new()
            .name(format!("signal-rx-{}", peer_addr))
            .spawn(move || reader_loop(reader, reply, inbox_tx, ack_tx, peer_addr))?;

        Ok(Self {
            writer,
            inbox: Mutex::new(inbox_rx),
            acks: Mutex::new(ack_rx),
            send_lock: Mutex::new(()),
            ack_timeout,
            peer_addr,
            local_addr,
        })
    }

    /// Connect to `addr` and wrap the resulting stream
    pub fn connect(addr: SocketAddr, connect_timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, connect_timeout)?;
        Self::new(stream)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Write a raw frame without waiting for a receipt
    pub fn send_raw(&self, payload: &[u8]) -> io::Result<()> {
        let mut writer = lock(&self.writer);
        write_frame(&mut *writer, payload, MAX_MESSAGE_SIZE)
    }

    /// Shut the socket down in both directions; the reader thread then exits
    pub fn close(&self) {
        let writer = lock(&self.writer);
        if let Err(e) = writer.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                log::debug!("Shutdown of {} failed: {}", self.peer_addr, e);
            }
        }
    }
}

impl Drop for SignalingConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SignalingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingConnection")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

fn reader_loop(
    mut reader: TcpStream,
    writer: Arc<Mutex<TcpStream>>,
    inbox: Sender<Vec<u8>>,
    acks: Sender<()>,
    peer_addr: SocketAddr,
) {
    loop {
        let frame = match read_frame(&mut reader, MAX_MESSAGE_SIZE) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::debug!("Control connection {} closed by remote", peer_addr);
                break;
            }
            Err(e) => {
                log::debug!("Control connection {} read error: {}", peer_addr, e);
                break;
            }
        };

        if frame == ACK.as_bytes() {
            // Nobody waiting is fine: the next sender drains stale receipts
            let _ = acks.send(());
            continue;
        }

        let ack_result = {
            let mut w = lock(&writer);
            write_frame(&mut *w, ACK.as_bytes(), MAX_MESSAGE_SIZE)
        };
        if let Err(e) = ack_result {
            log::debug!("Failed to acknowledge frame from {}: {}", peer_addr, e);
        }

        if inbox.send(frame).is_err() {
            break;
        }
    }
}

/// Lock a mutex, recovering the data if a holder panicked
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Reliable Send / Receive
// ============================================================================

/// Send `msg` and wait for its receipt, retrying up to `retries` attempts
///
/// Returns `false` once every attempt has failed. Transport errors count as
/// failed attempts and never escape.
pub fn send_with_ack(
    conn: &SignalingConnection,
    msg: &SignalingMessage,
    retries: u32,
    delay: Duration,
) -> bool {
    let payload = msg.to_bytes();
    let _sending = lock(&conn.send_lock);
    let acks = lock(&conn.acks);

    for attempt in 1..=retries {
        // Receipts that arrived after an earlier attempt gave up
        while acks.try_recv().is_ok() {}

        match conn.send_raw(&payload) {
            Ok(()) => match acks.recv_timeout(conn.ack_timeout) {
                Ok(()) => {
                    log::trace!("{} -> {} acknowledged", msg, conn.peer_addr);
                    return true;
                }
                Err(RecvTimeoutError::Timeout) => {
                    log::debug!(
                        "No ACK for {} from {} (attempt {}/{})",
                        msg,
                        conn.peer_addr,
                        attempt,
                        retries
                    );
                }
                Err(RecvTimeoutError::Disconnected) => {
                    log::debug!(
                        "Connection {} closed while waiting for ACK (attempt {}/{})",
                        conn.peer_addr,
                        attempt,
                        retries
                    );
                }
            },
            Err(e) => {
                log::debug!(
                    "Send of {} to {} failed (attempt {}/{}): {}",
                    msg,
                    conn.peer_addr,
                    attempt,
                    retries,
                    e
                );
            }
        }

        if attempt < retries {
            thread::sleep(delay);
        }
    }

    log::warn!(
        "Giving up on {} to {} after {} attempts",
        msg,
        conn.peer_addr,
        retries
    );
    false
}

/// [`send_with_ack`] with the knobs taken from a policy
pub fn send_with_policy(conn: &SignalingConnection, msg: &SignalingMessage, policy: &AckPolicy) -> bool {
    send_with_ack(conn, msg, policy.retries, policy.delay)
}

/// Block for the next command; its ACK has already been sent
///
/// Returns `None` once the remote has closed the connection.
pub fn listen_with_ack(conn: &SignalingConnection) -> Option<Vec<u8>> {
    lock(&conn.inbox).recv().ok()
}

/// Like [`listen_with_ack`] but gives up after `timeout`
///
/// Returns `Err(TimedOut)` on expiry and `Ok(None)` if the remote closed.
pub fn listen_with_ack_timeout(
    conn: &SignalingConnection,
    timeout: Duration,
) -> io::Result<Option<Vec<u8>>> {
    match lock(&conn.inbox).recv_timeout(timeout) {
        Ok(frame) => Ok(Some(frame)),
        Err(RecvTimeoutError::Disconnected) => Ok(None),
        Err(RecvTimeoutError::Timeout) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no message from {} within {:?}", conn.peer_addr, timeout),
        )),
    }
}

// ============================================================================
// Tests
// ============================================================================
