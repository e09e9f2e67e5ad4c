//! Peer client
//!
//! Registers with a rendezvous server, keeps the control loop running in the
//! background and turns a coordinated start into a direct peer link.

pub mod config;
pub mod control;
pub mod identity;
pub mod link;
pub mod roster;

pub use config::{ConfigError, PeerConfig};
pub use control::{Peer, PeerError, PeerEvent};
pub use identity::{Identity, IdentityError};
pub use link::{LinkEvent, PeerLink};
pub use roster::Roster;
