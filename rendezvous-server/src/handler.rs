//! Per-connection handler
//!
//! Each accepted connection runs [`handle_client`] on its own thread:
//! registration, the initial roster push, then the command loop until the
//! peer disconnects.

use std::net::TcpStream;
use std::sync::Arc;

use punch_core::signaling::listen_with_ack_timeout;
use punch_core::{listen_with_ack, send_with_policy, SignalingConnection, SignalingMessage};

use crate::config::ServerConfig;
use crate::registry::{Registration, Registry};
use crate::session::Coordinator;

/// Shared state handed to every handler
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub registry: Arc<Registry>,
    pub coordinator: Arc<Coordinator>,
    pub config: Arc<ServerConfig>,
}

pub fn handle_client(stream: TcpStream, ctx: HandlerContext) {
    let connection = match SignalingConnection::with_ack_timeout(stream, ctx.config.ack.timeout) {
        Ok(conn) => Arc::new(conn),
        Err(e) => {
            log::warn!("Cannot set up control connection: {}", e);
            return;
        }
    };
    let addr = connection.peer_addr();

    let registration = match register(&connection, &ctx) {
        Some(registration) => registration,
        None => {
            connection.close();
            return;
        }
    };

    if !push_roster(&registration, &ctx) {
        log::warn!("Initial roster push to '{}' failed", registration.name());
    }

    command_loop(&registration, &ctx);

    ctx.coordinator.participant_left(registration.name());
    log::info!("Handler for '{}' ({}) finished", registration.name(), addr);
    // Dropping the registration releases the name and closes the socket
}

/// Read the claimed name and try to take it
fn register(connection: &Arc<SignalingConnection>, ctx: &HandlerContext) -> Option<Registration> {
    let addr = connection.peer_addr();
    let frame = match listen_with_ack_timeout(connection, ctx.config.registration_timeout) {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            log::debug!("{} closed before registering", addr);
            return None;
        }
        Err(e) => {
            log::info!("{} did not register: {}", addr, e);
            return None;
        }
    };

    let name = String::from_utf8_lossy(&frame).into_owned();
    match ctx.registry.register(&name, Arc::clone(connection)) {
        Ok(registration) => Some(registration),
        Err(e) => {
            log::info!("Rejected registration of {:?} from {}: {}", name, addr, e);
            send_with_policy(
                connection,
                &SignalingMessage::Rejected(e.to_string()),
                &ctx.config.ack,
            );
            None
        }
    }
}

/// One `[PLU]` per other peer, then `[FIN]`
fn push_roster(registration: &Registration, ctx: &HandlerContext) -> bool {
    let conn = registration.connection();
    for entry in ctx.registry.roster_except(registration.name()) {
        if !send_with_policy(conn, &SignalingMessage::PeerListUpdate(entry), &ctx.config.ack) {
            return false;
        }
    }
    send_with_policy(conn, &SignalingMessage::EndOfList, &ctx.config.ack)
}

fn command_loop(registration: &Registration, ctx: &HandlerContext) {
    let name = registration.name();

    while let Some(frame) = listen_with_ack(registration.connection()) {
        let msg = SignalingMessage::from_bytes(&frame);
        log::debug!("<- {}: {}", name, msg);

        match msg {
            SignalingMessage::RequestPeer(target) => {
                ctx.coordinator.request_peer(registration.client(), &target);
            }
            SignalingMessage::Refresh => {
                if !push_roster(registration, ctx) {
                    log::warn!("Roster refresh for '{}' failed", name);
                }
            }
            SignalingMessage::ReadyHolePunch => ctx.coordinator.mark_ready(name),
            SignalingMessage::Disconnect => {
                log::info!("'{}' disconnected", name);
                return;
            }
            other => log::warn!("Ignoring unexpected message from '{}': {}", name, other),
        }
    }

    log::info!("'{}' closed the control connection", name);
}
