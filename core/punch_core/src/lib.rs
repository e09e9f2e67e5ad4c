//! Hole-punch core
//!
//! Shared by the rendezvous server and the peer client:
//! - the textual control vocabulary and its parser
//! - length-prefixed framing and the send/listen-with-ACK primitive
//! - the TCP simultaneous-open engine
//! - the frame codec used once a direct peer connection exists

pub mod hole_punch;
pub mod message;
pub mod signaling;
pub mod transfer;

// Re-export commonly used types
pub use hole_punch::{
    attempt_hole_punch,
    connect_from,
    prepare,
    punch_endpoint,
    PreparedPunch,
    DEFAULT_PORT_OFFSET,
    HOLE_PUNCH_TIMEOUT,
};

pub use message::{validate_name, RosterEntry, SignalingMessage};

pub use signaling::{
    listen_with_ack,
    listen_with_ack_timeout,
    send_with_ack,
    send_with_policy,
    AckPolicy,
    SignalingConnection,
};

pub use transfer::{read_peer_frame, write_peer_frame, FileChunks, PeerFrame};
