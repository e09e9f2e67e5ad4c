//! Rendezvous server
//!
//! Peers register a name over a long-lived control connection, receive the
//! roster of other peers, and ask the server to coordinate a TCP hole punch
//! with one of them. Data never flows through the server after that.

pub mod config;
pub mod handler;
pub mod registry;
pub mod server;
pub mod session;

pub use config::{ConfigError, ServerConfig};
pub use registry::{ClientRegistration, RegisterError, Registration, Registry};
pub use server::Server;
pub use session::{Coordinator, SessionKey, SessionManager};
